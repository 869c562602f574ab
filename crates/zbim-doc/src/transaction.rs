//! 事务记录
//!
//! 事务是一批可整体撤销/重做的变更：
//! - 对象的"前"快照在事务内首次变更该对象时惰性捕获
//! - "后"快照在提交时补齐，供重做正向重放
//! - 事务id由会话分配，可跨多个打开的文档共享同一id
//! - 提交后事务归撤销栈所有，超出数量/字节预算时最旧的先被逐出

use crate::container::PropertyContainer;
use crate::object::{DocumentObject, ObjectId};
use std::collections::HashSet;

/// 事务内记录的单项变更
#[derive(Debug, Clone)]
pub(crate) enum Change {
    /// 属性变更：前快照捕获于首次触碰，后快照补齐于提交
    Mutated {
        id: ObjectId,
        before: PropertyContainer,
        after: Option<PropertyContainer>,
    },
    /// 对象创建：撤销时摘除对象并暂存，供重做复位
    Created {
        id: ObjectId,
        removed: Option<Box<DocumentObject>>,
    },
    /// 对象删除：暂存完整对象，撤销时复位
    Deleted {
        id: ObjectId,
        object: Box<DocumentObject>,
    },
}

impl Change {
    fn approx_size(&self) -> usize {
        match self {
            Change::Mutated { before, after, .. } => {
                before.approx_size() + after.as_ref().map(|c| c.approx_size()).unwrap_or(0)
            }
            Change::Created { removed, .. } => removed
                .as_ref()
                .map(|o| o.props().approx_size())
                .unwrap_or(64),
            Change::Deleted { object, .. } => object.props().approx_size(),
        }
    }
}

/// 事务
#[derive(Debug, Clone)]
pub struct Transaction {
    id: u64,
    name: String,
    pub(crate) changes: Vec<Change>,
    /// 已捕获过快照的对象（每对象每事务只捕获一次"前"状态）
    snapshotted: HashSet<ObjectId>,
}

impl Transaction {
    pub(crate) fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            changes: Vec::new(),
            snapshotted: HashSet::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 未记录任何变更的事务在提交时直接丢弃
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub(crate) fn has_snapshot(&self, id: &ObjectId) -> bool {
        self.snapshotted.contains(id)
    }

    pub(crate) fn record_mutation(&mut self, id: ObjectId, before: PropertyContainer) {
        if self.snapshotted.insert(id.clone()) {
            self.changes.push(Change::Mutated {
                id,
                before,
                after: None,
            });
        }
    }

    pub(crate) fn record_created(&mut self, id: ObjectId) {
        // 创建即覆盖整个对象，后续属性变更无需单独快照
        self.snapshotted.insert(id.clone());
        self.changes.push(Change::Created { id, removed: None });
    }

    pub(crate) fn record_deleted(&mut self, id: ObjectId, object: DocumentObject) {
        self.snapshotted.insert(id.clone());
        self.changes.push(Change::Deleted {
            id,
            object: Box::new(object),
        });
    }

    /// 估算快照占用的字节数（撤销栈预算用）
    pub fn approx_size(&self) -> usize {
        self.name.len() + self.changes.iter().map(|c| c.approx_size()).sum::<usize>() + 64
    }
}

/// 撤销栈预算
#[derive(Debug, Clone, Copy)]
pub struct UndoLimits {
    /// 最多保留的事务数
    pub max_transactions: usize,
    /// 快照字节总量上限（估算值）
    pub max_bytes: usize,
}

impl Default for UndoLimits {
    fn default() -> Self {
        Self {
            max_transactions: 20,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// 文档的事务状态机
///
/// `Replaying` 期间禁止开启新事务，重放产生的变更不再被记录。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionMode {
    Idle,
    Recording,
    Replaying,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_snapshot_once_per_object() {
        let mut tx = Transaction::new(1, "edit");
        let id = ObjectId::new("Box001");

        assert!(!tx.has_snapshot(&id));
        tx.record_mutation(id.clone(), PropertyContainer::new());
        tx.record_mutation(id.clone(), PropertyContainer::new());

        assert!(tx.has_snapshot(&id));
        assert_eq!(tx.change_count(), 1);
    }

    #[test]
    fn test_created_suppresses_mutation_snapshots() {
        let mut tx = Transaction::new(1, "create");
        let id = ObjectId::new("Box001");

        tx.record_created(id.clone());
        assert!(tx.has_snapshot(&id));
        assert_eq!(tx.change_count(), 1);
    }

    #[test]
    fn test_empty_transaction() {
        let tx = Transaction::new(7, "noop");
        assert!(tx.is_empty());
        assert_eq!(tx.id(), 7);
        assert_eq!(tx.name(), "noop");
    }
}
