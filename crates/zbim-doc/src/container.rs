//! 属性容器
//!
//! 挂在单一属主上的有序属性集合：
//! - 插入顺序即序列化与遍历顺序
//! - 两阶段变更协议：前置校验（可否决）→ 写入 → 变更报告
//! - 嵌套的通知禁用计数（批量构建、从存储恢复时使用）
//! - "最近有效"快照，供回滚恢复

use crate::error::DocError;
use crate::property::{EffectMask, Property, PropertyStatus, PropertyValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 容器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    New,
    Updated,
    Valid,
    MarkedForDelete,
    Deleted,
    Error,
}

/// 一次成功写入的变更报告
///
/// 调用方（文档）据此决定触碰标记、链接图增量与通知。
#[derive(Debug, Clone)]
pub struct PropertyChanged {
    pub name: String,
    pub old: PropertyValue,
    pub effects: EffectMask,
}

/// 属性容器
#[derive(Debug, Clone)]
pub struct PropertyContainer {
    /// 插入顺序的 (名称, 属性) 序列
    entries: Vec<(String, Property)>,
    /// 名称 → entries 下标
    index: HashMap<String, usize>,
    status: ContainerStatus,
    /// 通知禁用嵌套深度，0 表示启用
    notify_disabled: u32,
    /// 跨属性一致性标记，重新启用通知时恢复
    integrity: bool,
    /// 最近一次有效状态的值快照
    last_valid: Option<Vec<(String, PropertyValue)>>,
}

impl Default for PropertyContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyContainer {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            status: ContainerStatus::New,
            notify_disabled: 0,
            integrity: true,
            last_valid: None,
        }
    }

    // === 属性管理 ===

    /// 添加属性
    ///
    /// 名称在容器内唯一；`SINGLE_INSTANCE` 状态的属性同类型只允许一个。
    pub fn add_property(
        &mut self,
        name: &str,
        value: PropertyValue,
        effects: EffectMask,
    ) -> Result<(), DocError> {
        self.add_property_with_status(name, value, effects, PropertyStatus::default())
    }

    pub fn add_property_with_status(
        &mut self,
        name: &str,
        value: PropertyValue,
        effects: EffectMask,
        status: PropertyStatus,
    ) -> Result<(), DocError> {
        self.about_to_add(name, &value, status)?;

        let mut prop = Property::new(value, effects);
        if status.bits() != 0 {
            prop.set_status(status.bits(), true);
        }
        self.index.insert(name.to_string(), self.entries.len());
        self.entries.push((name.to_string(), prop));
        Ok(())
    }

    /// 移除属性（仅限动态属性）
    pub fn remove_property(&mut self, name: &str) -> Result<Property, DocError> {
        self.about_to_remove(name)?;
        let pos = *self.index.get(name).expect("checked by about_to_remove");
        let (_, prop) = self.entries.remove(pos);
        self.rebuild_index();
        Ok(prop)
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Property> {
        let pos = *self.index.get(name)?;
        Some(&mut self.entries[pos].1)
    }

    pub fn value(&self, name: &str) -> Option<&PropertyValue> {
        self.get(name).map(|p| p.value())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按插入顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.entries.iter().map(|(name, prop)| (name.as_str(), prop))
    }

    /// 按插入顺序的属性名
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    // === 两阶段变更协议 ===

    /// 前置校验：可否添加该属性
    ///
    /// 返回错误即否决，任何状态都不会改变。文档在记录事务快照前
    /// 用同一校验预检，被否决的变更不进入事务。
    pub(crate) fn about_to_add(
        &self,
        name: &str,
        value: &PropertyValue,
        status: PropertyStatus,
    ) -> Result<(), DocError> {
        if name.is_empty() {
            return Err(DocError::Construction(
                "property name must not be empty".to_string(),
            ));
        }
        if self.index.contains_key(name) {
            return Err(DocError::DuplicateProperty(name.to_string()));
        }
        if status.contains(PropertyStatus::SINGLE_INSTANCE) {
            let kind = value.kind();
            if self.entries.iter().any(|(_, p)| {
                p.kind() == kind && p.status().contains(PropertyStatus::SINGLE_INSTANCE)
            }) {
                return Err(DocError::Construction(format!(
                    "container already holds a single-instance property of kind {}",
                    kind.name()
                )));
            }
        }
        Ok(())
    }

    /// 前置校验：可否移除该属性（仅限动态属性）
    pub(crate) fn about_to_remove(&self, name: &str) -> Result<(), DocError> {
        let prop = self
            .get(name)
            .ok_or_else(|| DocError::NotFound(name.to_string()))?;
        if !prop.is_dynamic() {
            return Err(DocError::Value(format!(
                "property '{}' is not dynamic and cannot be removed",
                name
            )));
        }
        Ok(())
    }

    /// 前置校验：变更是否可接受
    ///
    /// 返回错误即否决，任何状态都不会改变。
    pub(crate) fn about_to_set(
        &self,
        name: &str,
        new_value: &PropertyValue,
    ) -> Result<(), DocError> {
        let prop = self
            .get(name)
            .ok_or_else(|| DocError::NotFound(name.to_string()))?;
        if prop.is_read_only() {
            return Err(DocError::ReadOnly(name.to_string()));
        }
        if prop.kind() != new_value.kind() {
            return Err(DocError::KindMismatch {
                name: name.to_string(),
                expected: prop.kind().name(),
                got: new_value.kind().name(),
            });
        }
        Ok(())
    }

    /// 写入属性值
    ///
    /// 校验通过后写入原始值并报告变更；容器状态 Valid → Updated。
    pub fn set_value(
        &mut self,
        name: &str,
        value: PropertyValue,
    ) -> Result<PropertyChanged, DocError> {
        self.about_to_set(name, &value)?;

        let prop = self.get_mut(name).expect("checked by about_to_set");
        let old = prop.value().clone();
        let effects = prop.effects();
        prop.write(value);

        if self.status == ContainerStatus::Valid {
            self.status = ContainerStatus::Updated;
        }

        Ok(PropertyChanged {
            name: name.to_string(),
            old,
            effects,
        })
    }

    // === 状态 ===

    pub fn status(&self) -> ContainerStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ContainerStatus) {
        self.status = status;
    }

    /// 是否有属性带触碰标记
    pub fn has_touched(&self) -> bool {
        self.entries.iter().any(|(_, p)| p.is_touched())
    }

    /// 清除所有属性的触碰标记
    pub fn purge_touched(&mut self) {
        for (_, prop) in &mut self.entries {
            prop.purge_touched();
        }
    }

    // === 通知开关 ===

    /// 临时禁用通知（可嵌套）
    pub fn disable_notify(&mut self) {
        self.notify_disabled += 1;
    }

    /// 重新启用通知
    ///
    /// 嵌套计数归零时执行一次跨属性一致性恢复并返回 `true`。
    pub fn enable_notify(&mut self) -> bool {
        if self.notify_disabled > 0 {
            self.notify_disabled -= 1;
        }
        if self.notify_disabled == 0 {
            self.integrity = true;
            true
        } else {
            false
        }
    }

    pub fn is_notify_enabled(&self) -> bool {
        self.notify_disabled == 0
    }

    pub fn integrity(&self) -> bool {
        self.integrity
    }

    pub(crate) fn set_integrity(&mut self, ok: bool) {
        self.integrity = ok;
    }

    // === 快照与回滚 ===

    /// 记录"最近有效"值快照
    pub fn save_last_valid(&mut self) {
        self.last_valid = Some(
            self.entries
                .iter()
                .map(|(name, prop)| (name.clone(), prop.value().clone()))
                .collect(),
        );
    }

    /// 回滚到最近有效快照
    ///
    /// 无快照时返回 `false`。快照后新增的属性保持现值。
    pub fn rollback_last_valid(&mut self) -> bool {
        let Some(snapshot) = self.last_valid.clone() else {
            return false;
        };
        for (name, value) in snapshot {
            if let Some(prop) = self.get_mut(&name) {
                prop.write(value);
            }
        }
        self.status = ContainerStatus::Valid;
        self.integrity = true;
        true
    }

    // === 批量操作 ===

    /// 从另一容器复制同名同类型属性的值
    pub fn copy_values_from(&mut self, other: &PropertyContainer) {
        let updates: Vec<(String, PropertyValue)> = other
            .iter()
            .filter(|(name, prop)| {
                self.get(name).map(|mine| mine.kind() == prop.kind()) == Some(true)
            })
            .map(|(name, prop)| (name.to_string(), prop.value().clone()))
            .collect();
        for (name, value) in updates {
            if let Some(prop) = self.get_mut(&name) {
                prop.write(value);
            }
        }
    }

    /// 比较两个容器，返回值不同（或缺失）的属性名
    pub fn diff(&self, other: &PropertyContainer) -> Vec<String> {
        let mut names = Vec::new();
        for (name, prop) in self.iter() {
            match other.get(name) {
                Some(theirs) if theirs.value() == prop.value() => {}
                _ => names.push(name.to_string()),
            }
        }
        for (name, _) in other.iter() {
            if !self.contains(name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// 估算容器占用的字节数
    pub fn approx_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(name, prop)| name.len() + prop.approx_size() + 32)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PropertyContainer {
        let mut c = PropertyContainer::new();
        c.add_property("Length", PropertyValue::Float(10.0), EffectMask::DEFAULT)
            .unwrap();
        c.add_property("Label", PropertyValue::Str("box".into()), EffectMask::VIEW_ONLY)
            .unwrap();
        c
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut c = sample();
        c.add_property("Width", PropertyValue::Float(5.0), EffectMask::DEFAULT)
            .unwrap();
        let names: Vec<_> = c.names().collect();
        assert_eq!(names, vec!["Length", "Label", "Width"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut c = sample();
        let err = c
            .add_property("Length", PropertyValue::Float(1.0), EffectMask::DEFAULT)
            .unwrap_err();
        assert!(matches!(err, DocError::DuplicateProperty(_)));
    }

    #[test]
    fn test_set_value_two_phase() {
        let mut c = sample();
        c.set_status(ContainerStatus::Valid);

        let changed = c
            .set_value("Length", PropertyValue::Float(20.0))
            .unwrap();
        assert_eq!(changed.old, PropertyValue::Float(10.0));
        assert!(changed.effects.contains(EffectMask::RECOMPUTE));
        assert_eq!(c.status(), ContainerStatus::Updated);
        assert!(c.get("Length").unwrap().is_touched());
    }

    #[test]
    fn test_kind_mismatch_vetoed_before_write() {
        let mut c = sample();
        c.set_status(ContainerStatus::Valid);

        let err = c
            .set_value("Length", PropertyValue::Str("ten".into()))
            .unwrap_err();
        assert!(matches!(err, DocError::KindMismatch { .. }));
        // 否决的变更不留下任何痕迹
        assert_eq!(c.value("Length"), Some(&PropertyValue::Float(10.0)));
        assert_eq!(c.status(), ContainerStatus::Valid);
    }

    #[test]
    fn test_read_only_vetoed() {
        let mut c = sample();
        c.get_mut("Length")
            .unwrap()
            .set_status(PropertyStatus::READ_ONLY, true);

        let err = c.set_value("Length", PropertyValue::Float(1.0)).unwrap_err();
        assert!(matches!(err, DocError::ReadOnly(_)));
    }

    #[test]
    fn test_remove_only_dynamic() {
        let mut c = sample();
        assert!(c.remove_property("Length").is_err());

        c.add_property_with_status(
            "Custom",
            PropertyValue::Int(1),
            EffectMask::DEFAULT,
            PropertyStatus::new(PropertyStatus::DYNAMIC),
        )
        .unwrap();
        assert!(c.remove_property("Custom").is_ok());
        assert!(!c.contains("Custom"));
        // 移除后索引仍然一致
        assert_eq!(c.value("Label"), Some(&PropertyValue::Str("box".into())));
    }

    #[test]
    fn test_notify_counter_nesting() {
        let mut c = sample();
        assert!(c.is_notify_enabled());

        c.disable_notify();
        c.disable_notify();
        assert!(!c.is_notify_enabled());

        assert!(!c.enable_notify());
        assert!(c.enable_notify());
        assert!(c.is_notify_enabled());
        assert!(c.integrity());
    }

    #[test]
    fn test_rollback_last_valid() {
        let mut c = sample();
        c.set_status(ContainerStatus::Valid);
        c.save_last_valid();

        c.set_value("Length", PropertyValue::Float(99.0)).unwrap();
        assert_eq!(c.status(), ContainerStatus::Updated);

        assert!(c.rollback_last_valid());
        assert_eq!(c.value("Length"), Some(&PropertyValue::Float(10.0)));
        assert_eq!(c.status(), ContainerStatus::Valid);
    }

    #[test]
    fn test_diff_and_copy() {
        let mut a = sample();
        let mut b = sample();
        b.set_value("Length", PropertyValue::Float(42.0)).unwrap();
        b.add_property("Extra", PropertyValue::Bool(true), EffectMask::DEFAULT)
            .unwrap();

        let diff = a.diff(&b);
        assert!(diff.contains(&"Length".to_string()));
        assert!(diff.contains(&"Extra".to_string()));
        assert!(!diff.contains(&"Label".to_string()));

        a.copy_values_from(&b);
        assert_eq!(a.value("Length"), Some(&PropertyValue::Float(42.0)));
        // 对方独有的属性不会被复制进来
        assert!(!a.contains("Extra"));
    }
}
