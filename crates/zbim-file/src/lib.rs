//! ZBIM 文件格式处理
//!
//! 支持：
//! - `.zbim` 原生格式（MessagePack + Zstd）
//! - 文件元数据（创建/修改时间、写入方标识）
//! - 容损加载：缺损进入恢复报告而非中止

pub mod error;
pub mod native;

pub use error::FileError;
pub use native::{load, load_with_metadata, save, save_with_metadata, FileMetadata};
