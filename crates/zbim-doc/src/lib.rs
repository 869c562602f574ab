//! ZBIM 文档核心
//!
//! 事务性的文档对象图：带类型属性的对象、对称的双向链接图、
//! 多文档撤销/重做事务，以及依赖有序、逐对象错误隔离的重算调度。
//!
//! # 架构设计
//!
//! 文档是聚合根，对象不直接互相修改：
//! - `PropertyContainer`: 两阶段变更协议（校验 → 写入 → 报告）
//! - `LinkGraph`: 正反向边成对维护，引用计数由反向索引派生
//! - `Transaction` / `TransactionSession`: 惰性快照 + 跨文档事务组
//! - `Subject`: 可重入安全的优先级通知总线
//!
//! # 示例
//!
//! ```rust
//! use zbim_doc::prelude::*;
//!
//! let mut session = TransactionSession::new();
//! let mut doc = Document::new("plan");
//!
//! let wall = doc.add_object(ObjectKind::GeoFeature, "Wall");
//! doc.add_property(&wall, "Height", PropertyValue::Float(2.8), EffectMask::DEFAULT)
//!     .unwrap();
//!
//! doc.open_transaction(&mut session, "raise wall");
//! doc.set_property(&wall, "Height", PropertyValue::Float(3.0)).unwrap();
//! doc.commit_transaction();
//!
//! doc.recompute();
//! assert!(doc.undo(None));
//! ```

pub mod container;
pub mod document;
pub mod error;
pub mod links;
pub mod notify;
pub mod object;
pub mod persist;
pub mod property;
pub mod session;
pub mod transaction;

pub mod prelude {
    //! 常用类型的便捷导入
    pub use crate::container::{ContainerStatus, PropertyChanged, PropertyContainer};
    pub use crate::document::{
        BehaviorRegistry, Document, DocumentMessage, ObjectBehavior, RecomputeInputs,
        RecomputeResult,
    };
    pub use crate::error::DocError;
    pub use crate::links::{LinkDefect, LinkEdge, LinkGraph, TopoResult};
    pub use crate::notify::{NotifyError, Observer, Subject};
    pub use crate::object::{DocumentObject, ObjectId, ObjectKind, ObjectStatus};
    pub use crate::persist::{save_content, restore_content, DocumentContent, RestoreReport};
    pub use crate::property::{
        Color, EffectMask, Placement, Property, PropertyKind, PropertyStatus, PropertyValue,
        Quantity,
    };
    pub use crate::session::TransactionSession;
    pub use crate::transaction::{Transaction, UndoLimits};
}
