//! 属性：命名、带类型、可观察的值单元
//!
//! 核心组成：
//! - `PropertyValue`: 带标签的值联合（标量、字符串、几何值、链接、集合）
//! - `PropertyKind`: 值的类型标签，用于类型一致性检查与自描述序列化
//! - `EffectMask`: 效果掩码，决定变更是否触发重算/通知/视图刷新
//! - `PropertyStatus`: 状态位（触碰、只读、隐藏、瞬态、动态等）

use crate::object::ObjectId;
use nalgebra::{Matrix4, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 位姿（位置 + 旋转轴 + 旋转角）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub position: Point3<f64>,
    pub axis: Vector3<f64>,
    /// 绕轴旋转角（弧度）
    pub angle: f64,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            position: Point3::origin(),
            axis: Vector3::z(),
            angle: 0.0,
        }
    }
}

/// RGBA颜色（分量范围 0.0..=1.0）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Default for Color {
    fn default() -> Self {
        Self {
            r: 0.8,
            g: 0.8,
            b: 0.8,
            a: 1.0,
        }
    }
}

/// 带单位的量值
///
/// 核心只存储，单位换算是外部协作者的职责。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: String,
}

/// 属性值（带标签的联合）
///
/// 链接类变体（`Link`/`LinkList`/`LinkMap`）以文档内id引用其他对象，
/// 序列化时保持自描述（serde外部标签），持久化的链接目标是字符串id
/// 而非内存地址。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    None,
    // 标量
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// 枚举：候选项 + 当前索引
    Enumeration { items: Vec<String>, index: usize },
    Quantity(Quantity),
    Color(Color),
    Uuid(Uuid),
    // 几何值类型（只存储，不解释）
    Vector(Vector3<f64>),
    Position(Point3<f64>),
    Placement(Placement),
    Matrix(Matrix4<f64>),
    // 链接
    Link(Option<ObjectId>),
    LinkList(Vec<ObjectId>),
    LinkMap(BTreeMap<String, ObjectId>),
    // 集合
    BoolList(Vec<bool>),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    StrList(Vec<String>),
    VectorList(Vec<Vector3<f64>>),
    Binary(Vec<u8>),
}

/// 属性类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    None,
    Bool,
    Int,
    Float,
    Str,
    Enumeration,
    Quantity,
    Color,
    Uuid,
    Vector,
    Position,
    Placement,
    Matrix,
    Link,
    LinkList,
    LinkMap,
    BoolList,
    IntList,
    FloatList,
    StrList,
    VectorList,
    Binary,
}

impl PropertyKind {
    /// 类型名称（持久化的自描述标签）
    pub fn name(&self) -> &'static str {
        match self {
            PropertyKind::None => "None",
            PropertyKind::Bool => "Bool",
            PropertyKind::Int => "Int",
            PropertyKind::Float => "Float",
            PropertyKind::Str => "Str",
            PropertyKind::Enumeration => "Enumeration",
            PropertyKind::Quantity => "Quantity",
            PropertyKind::Color => "Color",
            PropertyKind::Uuid => "Uuid",
            PropertyKind::Vector => "Vector",
            PropertyKind::Position => "Position",
            PropertyKind::Placement => "Placement",
            PropertyKind::Matrix => "Matrix",
            PropertyKind::Link => "Link",
            PropertyKind::LinkList => "LinkList",
            PropertyKind::LinkMap => "LinkMap",
            PropertyKind::BoolList => "BoolList",
            PropertyKind::IntList => "IntList",
            PropertyKind::FloatList => "FloatList",
            PropertyKind::StrList => "StrList",
            PropertyKind::VectorList => "VectorList",
            PropertyKind::Binary => "Binary",
        }
    }

    /// 是否为链接类属性
    pub fn is_link(&self) -> bool {
        matches!(
            self,
            PropertyKind::Link | PropertyKind::LinkList | PropertyKind::LinkMap
        )
    }
}

impl PropertyValue {
    /// 当前值的类型标签
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::None => PropertyKind::None,
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Int(_) => PropertyKind::Int,
            PropertyValue::Float(_) => PropertyKind::Float,
            PropertyValue::Str(_) => PropertyKind::Str,
            PropertyValue::Enumeration { .. } => PropertyKind::Enumeration,
            PropertyValue::Quantity(_) => PropertyKind::Quantity,
            PropertyValue::Color(_) => PropertyKind::Color,
            PropertyValue::Uuid(_) => PropertyKind::Uuid,
            PropertyValue::Vector(_) => PropertyKind::Vector,
            PropertyValue::Position(_) => PropertyKind::Position,
            PropertyValue::Placement(_) => PropertyKind::Placement,
            PropertyValue::Matrix(_) => PropertyKind::Matrix,
            PropertyValue::Link(_) => PropertyKind::Link,
            PropertyValue::LinkList(_) => PropertyKind::LinkList,
            PropertyValue::LinkMap(_) => PropertyKind::LinkMap,
            PropertyValue::BoolList(_) => PropertyKind::BoolList,
            PropertyValue::IntList(_) => PropertyKind::IntList,
            PropertyValue::FloatList(_) => PropertyKind::FloatList,
            PropertyValue::StrList(_) => PropertyKind::StrList,
            PropertyValue::VectorList(_) => PropertyKind::VectorList,
            PropertyValue::Binary(_) => PropertyKind::Binary,
        }
    }

    /// 链接类值引用的全部目标（非链接类返回空）
    ///
    /// 重复引用按出现次数返回，链接图的边与之一一对应。
    pub fn link_targets(&self) -> Vec<ObjectId> {
        match self {
            PropertyValue::Link(Some(id)) => vec![id.clone()],
            PropertyValue::Link(None) => Vec::new(),
            PropertyValue::LinkList(ids) => ids.clone(),
            PropertyValue::LinkMap(map) => map.values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// 从链接类值中剔除指向某对象的引用，返回剔除后的新值
    pub fn without_link_target(&self, target: &ObjectId) -> PropertyValue {
        match self {
            PropertyValue::Link(Some(id)) if id == target => PropertyValue::Link(None),
            PropertyValue::LinkList(ids) => {
                PropertyValue::LinkList(ids.iter().filter(|id| *id != target).cloned().collect())
            }
            PropertyValue::LinkMap(map) => PropertyValue::LinkMap(
                map.iter()
                    .filter(|(_, id)| *id != target)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// 估算值占用的字节数（撤销栈字节预算用，粗粒度即可）
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<PropertyValue>();
        base + match self {
            PropertyValue::Str(s) => s.len(),
            PropertyValue::Enumeration { items, .. } => {
                items.iter().map(|s| s.len() + 24).sum()
            }
            PropertyValue::Quantity(q) => q.unit.len(),
            PropertyValue::Link(Some(id)) => id.as_str().len(),
            PropertyValue::LinkList(ids) => ids.iter().map(|id| id.as_str().len() + 24).sum(),
            PropertyValue::LinkMap(map) => map
                .iter()
                .map(|(k, v)| k.len() + v.as_str().len() + 48)
                .sum(),
            PropertyValue::BoolList(v) => v.len(),
            PropertyValue::IntList(v) => v.len() * 8,
            PropertyValue::FloatList(v) => v.len() * 8,
            PropertyValue::StrList(v) => v.iter().map(|s| s.len() + 24).sum(),
            PropertyValue::VectorList(v) => v.len() * 24,
            PropertyValue::Binary(v) => v.len(),
            _ => 0,
        }
    }
}

/// 效果掩码（位域）
///
/// 决定属性变更的传播范围：触发重算、观察者通知、视图刷新。
/// `LINK` 标记链接类属性，其变更同时驱动链接图维护。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectMask {
    bits: u16,
}

impl EffectMask {
    pub const RECOMPUTE: u16 = 1 << 0;
    pub const NOTIFY: u16 = 1 << 1;
    pub const VIEW: u16 = 1 << 2;
    pub const LINK: u16 = 1 << 3;
    /// 反向引用：仍登记链接关系，但不构成重算依赖
    pub const BACKLINK: u16 = 1 << 4;

    pub const NONE: EffectMask = EffectMask { bits: 0 };
    /// 普通数据属性的默认效果
    pub const DEFAULT: EffectMask = EffectMask {
        bits: Self::RECOMPUTE | Self::NOTIFY | Self::VIEW,
    };
    /// 链接类属性的默认效果
    pub const LINK_DEFAULT: EffectMask = EffectMask {
        bits: Self::RECOMPUTE | Self::NOTIFY | Self::VIEW | Self::LINK,
    };
    /// 仅外观属性（不触发重算）
    pub const VIEW_ONLY: EffectMask = EffectMask {
        bits: Self::NOTIFY | Self::VIEW,
    };

    pub fn new(bits: u16) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> u16 {
        self.bits
    }

    pub fn contains(&self, bits: u16) -> bool {
        self.bits & bits != 0
    }

    pub fn set(&mut self, bits: u16, enabled: bool) {
        if enabled {
            self.bits |= bits;
        } else {
            self.bits &= !bits;
        }
    }
}

impl Default for EffectMask {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// 属性状态位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PropertyStatus {
    bits: u16,
}

impl PropertyStatus {
    pub const TOUCHED: u16 = 1 << 0;
    pub const READ_ONLY: u16 = 1 << 1;
    pub const HIDDEN: u16 = 1 << 2;
    /// 瞬态属性不参与持久化
    pub const TRANSIENT: u16 = 1 << 3;
    /// 运行期动态添加的属性，允许移除
    pub const DYNAMIC: u16 = 1 << 4;
    /// 同类型属性在容器内只允许一个实例
    pub const SINGLE_INSTANCE: u16 = 1 << 5;

    pub fn new(bits: u16) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> u16 {
        self.bits
    }

    pub fn contains(&self, bits: u16) -> bool {
        self.bits & bits != 0
    }

    pub fn set(&mut self, bits: u16, enabled: bool) {
        if enabled {
            self.bits |= bits;
        } else {
            self.bits &= !bits;
        }
    }
}

/// 属性：值 + 效果掩码 + 状态位 + 默认值标记
///
/// 属性由其容器独占拥有，不单独存活。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    value: PropertyValue,
    effects: EffectMask,
    status: PropertyStatus,
    /// 自创建以来是否从未被显式写入
    is_default: bool,
}

impl Property {
    pub fn new(value: PropertyValue, effects: EffectMask) -> Self {
        Self {
            value,
            effects,
            status: PropertyStatus::default(),
            is_default: true,
        }
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn kind(&self) -> PropertyKind {
        self.value.kind()
    }

    pub fn effects(&self) -> EffectMask {
        self.effects
    }

    pub fn status(&self) -> PropertyStatus {
        self.status
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn is_touched(&self) -> bool {
        self.status.contains(PropertyStatus::TOUCHED)
    }

    pub fn is_read_only(&self) -> bool {
        self.status.contains(PropertyStatus::READ_ONLY)
    }

    pub fn is_transient(&self) -> bool {
        self.status.contains(PropertyStatus::TRANSIENT)
    }

    pub fn is_dynamic(&self) -> bool {
        self.status.contains(PropertyStatus::DYNAMIC)
    }

    pub fn set_status(&mut self, bits: u16, enabled: bool) {
        self.status.set(bits, enabled);
    }

    pub fn purge_touched(&mut self) {
        self.status.set(PropertyStatus::TOUCHED, false);
    }

    /// 裸写入，绕过两阶段协议，仅容器内部使用
    pub(crate) fn write(&mut self, value: PropertyValue) {
        self.value = value;
        self.is_default = false;
        self.status.set(PropertyStatus::TOUCHED, true);
    }

    /// 恢复场景的写入：不置触碰位，保留默认值标记语义
    pub(crate) fn write_restored(&mut self, value: PropertyValue) {
        self.value = value;
        self.is_default = false;
    }

    pub fn approx_size(&self) -> usize {
        self.value.approx_size() + 8
    }
}
