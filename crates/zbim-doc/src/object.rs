//! 文档对象
//!
//! 文档对象 = 属性容器 + 文档内唯一id + 可选全局唯一id + 对象状态位。
//! id 在插入文档时分配，对象存活期间不复用。

use crate::container::{ContainerStatus, PropertyContainer};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 文档内唯一的对象id（字符串，如 "Wall001"）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 对象种类
///
/// 封闭的常见种类 + 可扩展的具名种类，避免运行期类型层级遍历。
/// 扩展种类的行为通过文档的行为注册表解析。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// 通用特征对象
    Feature,
    /// 带几何表示句柄的特征
    GeoFeature,
    /// 分组对象
    Group,
    /// 标注对象
    Annotation,
    /// 扩展种类（按名称在行为注册表中解析）
    Extension(String),
}

impl ObjectKind {
    pub fn name(&self) -> &str {
        match self {
            ObjectKind::Feature => "Feature",
            ObjectKind::GeoFeature => "GeoFeature",
            ObjectKind::Group => "Group",
            ObjectKind::Annotation => "Annotation",
            ObjectKind::Extension(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "Feature" => ObjectKind::Feature,
            "GeoFeature" => ObjectKind::GeoFeature,
            "Group" => ObjectKind::Group,
            "Annotation" => ObjectKind::Annotation,
            other => ObjectKind::Extension(other.to_string()),
        }
    }
}

/// 对象状态位
///
/// 与容器状态枚举重叠但不相同：容器状态描述属性集的有效性，
/// 对象状态位描述其在文档生命周期与重算过程中的位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectStatus {
    bits: u16,
}

impl ObjectStatus {
    /// 待重算
    pub const TOUCHED: u16 = 1 << 0;
    /// 尚未经历首次成功重算
    pub const NEW: u16 = 1 << 1;
    /// 重算进行中
    pub const RECOMPUTING: u16 = 1 << 2;
    /// 已标记移除，等待引用清零
    pub const PENDING_REMOVAL: u16 = 1 << 3;
    /// 正在从外部数据导入
    pub const IMPORTING: u16 = 1 << 4;
    /// 最近一次重算失败
    pub const ERROR: u16 = 1 << 5;
    /// 已从文档移除
    pub const DELETED: u16 = 1 << 6;
    /// 本轮有用户可见（视图相关）的属性变更
    pub const VIEW_TOUCHED: u16 = 1 << 7;

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

/// 文档对象
#[derive(Debug, Clone)]
pub struct DocumentObject {
    id: ObjectId,
    /// 面向外部的全局唯一id（可选）
    global_id: Option<Uuid>,
    kind: ObjectKind,
    status: ObjectStatus,
    /// 最近一次重算失败的消息列表
    errors: Vec<String>,
    props: PropertyContainer,
}

impl DocumentObject {
    /// 创建新对象：状态 New + 待重算
    pub fn new(id: ObjectId, kind: ObjectKind) -> Self {
        let mut status = ObjectStatus::default();
        status.set(ObjectStatus::NEW | ObjectStatus::TOUCHED, true);
        Self {
            id,
            global_id: Some(Uuid::new_v4()),
            kind,
            status,
            errors: Vec::new(),
            props: PropertyContainer::new(),
        }
    }

    /// 从持久化数据重建（不触碰、不标记New）
    pub(crate) fn restored(id: ObjectId, kind: ObjectKind, global_id: Option<Uuid>) -> Self {
        let mut obj = Self {
            id,
            global_id,
            kind,
            status: ObjectStatus::default(),
            errors: Vec::new(),
            props: PropertyContainer::new(),
        };
        obj.props.set_status(ContainerStatus::Valid);
        obj
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn global_id(&self) -> Option<Uuid> {
        self.global_id
    }

    pub fn set_global_id(&mut self, id: Option<Uuid>) {
        self.global_id = id;
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    pub fn props(&self) -> &PropertyContainer {
        &self.props
    }

    pub fn props_mut(&mut self) -> &mut PropertyContainer {
        &mut self.props
    }

    pub(crate) fn replace_props(&mut self, props: PropertyContainer) {
        self.props = props;
    }

    // === 状态 ===

    pub fn status(&self) -> ObjectStatus {
        self.status
    }

    pub fn set_status(&mut self, bits: u16, enabled: bool) {
        self.status.set(bits, enabled);
    }

    /// 是否待重算
    pub fn is_touched(&self) -> bool {
        self.status.contains(ObjectStatus::TOUCHED)
    }

    /// 标记为待重算
    pub fn touch(&mut self) {
        self.status.set(ObjectStatus::TOUCHED, true);
    }

    /// 清除重算触碰（属性触碰一并清除）
    pub fn purge_touched(&mut self) {
        self.status.set(ObjectStatus::TOUCHED, false);
        self.props.purge_touched();
    }

    pub fn is_new(&self) -> bool {
        self.status.contains(ObjectStatus::NEW)
    }

    pub fn is_pending_removal(&self) -> bool {
        self.status.contains(ObjectStatus::PENDING_REMOVAL)
    }

    pub fn has_error(&self) -> bool {
        self.status.contains(ObjectStatus::ERROR)
    }

    // === 重算错误 ===

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub(crate) fn push_error(&mut self, message: String) {
        self.status.set(ObjectStatus::ERROR, true);
        self.errors.push(message);
    }

    pub(crate) fn clear_errors(&mut self) {
        self.status.set(ObjectStatus::ERROR, false);
        self.errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_object_is_touched_and_new() {
        let obj = DocumentObject::new(ObjectId::new("Box001"), ObjectKind::Feature);
        assert!(obj.is_new());
        assert!(obj.is_touched());
        assert!(obj.global_id().is_some());
        assert_eq!(obj.kind().name(), "Feature");
    }

    #[test]
    fn test_kind_roundtrip() {
        assert_eq!(ObjectKind::from_name("Group"), ObjectKind::Group);
        assert_eq!(
            ObjectKind::from_name("MyPlugin::Gear"),
            ObjectKind::Extension("MyPlugin::Gear".to_string())
        );
        assert_eq!(ObjectKind::from_name("MyPlugin::Gear").name(), "MyPlugin::Gear");
    }

    #[test]
    fn test_error_bookkeeping() {
        let mut obj = DocumentObject::new(ObjectId::new("Box001"), ObjectKind::Feature);
        obj.push_error("boom".to_string());
        assert!(obj.has_error());
        assert_eq!(obj.errors(), &["boom".to_string()]);

        obj.clear_errors();
        assert!(!obj.has_error());
        assert!(obj.errors().is_empty());
    }

    #[test]
    fn test_restored_object_is_quiet() {
        let obj = DocumentObject::restored(ObjectId::new("Box001"), ObjectKind::Feature, None);
        assert!(!obj.is_new());
        assert!(!obj.is_touched());
        assert_eq!(obj.props().status(), ContainerStatus::Valid);
    }
}
