//! 事务会话
//!
//! 显式的跨文档事务上下文，取代全局可变的"应用级活动事务id"：
//! - 分配全应用唯一的事务id
//! - 持有当前活动事务组（id + 名称），所有在该组内开启事务的文档
//!   共享同一id，撤销/重做可按id在各文档上独立定位
//! - 切换到不同名称的组会自动关闭上一个组

use crate::document::Document;

/// 事务会话（每个应用实例一个，显式传递给需要它的组件）
#[derive(Debug, Default)]
pub struct TransactionSession {
    next_id: u64,
    active: Option<ActiveGroup>,
}

#[derive(Debug)]
struct ActiveGroup {
    id: u64,
    name: String,
}

impl TransactionSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开启新的事务组，自动关闭上一个组，返回组id
    pub fn begin(&mut self, name: &str) -> u64 {
        let id = self.allocate();
        self.active = Some(ActiveGroup {
            id,
            name: name.to_string(),
        });
        id
    }

    /// 当前活动组id
    pub fn active_id(&self) -> Option<u64> {
        self.active.as_ref().map(|g| g.id)
    }

    /// 当前活动组名称
    pub fn active_name(&self) -> Option<&str> {
        self.active.as_ref().map(|g| g.name.as_str())
    }

    /// 关闭当前组（已开启的文档事务各自照常提交）
    pub fn close(&mut self) {
        self.active = None;
    }

    /// 分配一个不复用的事务id
    pub fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// 提交活动组：对每个参与文档提交其挂在组id下的事务，然后关闭组
    ///
    /// 返回实际提交了事务的文档数。
    pub fn commit_group(&mut self, documents: &mut [&mut Document]) -> usize {
        let Some(id) = self.active_id() else {
            return 0;
        };
        let mut committed = 0;
        for doc in documents.iter_mut() {
            if doc.active_transaction_id() == Some(id) && doc.commit_transaction().is_some() {
                committed += 1;
            }
        }
        self.close();
        committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let mut session = TransactionSession::new();
        let a = session.begin("first");
        let b = session.begin("second");
        assert!(b > a);
        assert_eq!(session.active_id(), Some(b));
        assert_eq!(session.active_name(), Some("second"));
    }

    #[test]
    fn test_close_clears_active_group() {
        let mut session = TransactionSession::new();
        session.begin("edit");
        session.close();
        assert_eq!(session.active_id(), None);
    }
}
