//! 文档核心错误定义

use crate::object::ObjectId;
use thiserror::Error;

/// 文档核心错误
///
/// 只覆盖"构造失败"一类的调用方错误。图缺陷（悬空链接、循环依赖）
/// 以诊断列表返回，重算失败进入错误映射，撤销/重做的空栈情形返回布尔值，
/// 均不走此类型。
#[derive(Error, Debug)]
pub enum DocError {
    #[error("construction error: {0}")]
    Construction(String),

    #[error("not yet implemented: {0}")]
    NotImplemented(String),

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("value error: {0}")]
    Value(String),

    #[error("property '{0}' is read-only")]
    ReadOnly(String),

    #[error("property '{name}' kind mismatch: expected {expected}, got {got}")]
    KindMismatch {
        name: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("duplicate property name: {0}")]
    DuplicateProperty(String),

    #[error("object '{0}' is still referenced by {1} incoming link(s)")]
    StillReferenced(ObjectId, usize),

    #[error("link target '{0}' is not a live object")]
    DeadLinkTarget(ObjectId),

    #[error("duplicate object id: {0}")]
    DuplicateObjectId(ObjectId),
}
