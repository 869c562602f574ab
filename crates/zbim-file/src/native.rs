//! ZBIM原生文件格式（.zbim）
//!
//! 基于 MessagePack + Zstd 的紧凑二进制格式：
//! - 体积小：MessagePack 比 JSON 小 30-50%，Zstd 再压缩 60-80%
//! - 自描述：属性带类型名标签，旧版本读取器可跳过未知类型
//! - 容损：链接解析失败不中止加载，缺损进入恢复报告

use crate::error::FileError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use zbim_doc::document::Document;
use zbim_doc::persist::{restore_content, save_content, DocumentContent, RestoreReport};

/// 文件魔数 "ZBIM"
const MAGIC: &[u8; 4] = b"ZBIM";

/// 当前文件格式版本
const FORMAT_VERSION: u32 = 1;

/// Zstd 压缩级别（1-22，3 是默认值，平衡速度和压缩比）
const COMPRESSION_LEVEL: i32 = 3;

/// 文件头（16 字节）
#[derive(Debug)]
struct FileHeader {
    /// 魔数 "ZBIM"
    magic: [u8; 4],
    /// 格式版本
    version: u32,
    /// 标志位（预留）
    flags: u32,
    /// 压缩后数据长度
    compressed_size: u32,
}

impl FileHeader {
    fn new(compressed_size: u32) -> Self {
        Self {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            flags: 0,
            compressed_size,
        }
    }

    fn write(&self, writer: &mut impl Write) -> Result<(), std::io::Error> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        Ok(())
    }

    fn read(reader: &mut impl Read) -> Result<Self, FileError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if &magic != MAGIC {
            return Err(FileError::InvalidFormat(
                "Invalid magic number, not a ZBIM file".to_string(),
            ));
        }

        let mut buf = [0u8; 4];

        reader.read_exact(&mut buf)?;
        let version = u32::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let flags = u32::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let compressed_size = u32::from_le_bytes(buf);

        Ok(Self {
            magic,
            version,
            flags,
            compressed_size,
        })
    }
}

/// 文件元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// 首次保存时间
    pub created: DateTime<Utc>,
    /// 最近保存时间
    pub modified: DateTime<Utc>,
    /// 作者
    pub author: String,
    /// 写入方标识
    pub application: String,
}

impl Default for FileMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created: now,
            modified: now,
            author: String::new(),
            application: format!("zbim {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// 可序列化的文件内容
#[derive(Debug, Serialize, Deserialize)]
struct FileContent {
    /// 文件元数据
    metadata: FileMetadata,
    /// 文档内容模型
    document: DocumentContent,
}

/// 保存文档到文件
pub fn save(document: &Document, path: &Path) -> Result<(), FileError> {
    save_with_metadata(document, path, FileMetadata::default())
}

/// 保存文档，保留已有元数据（更新修改时间）
pub fn save_with_metadata(
    document: &Document,
    path: &Path,
    mut metadata: FileMetadata,
) -> Result<(), FileError> {
    metadata.modified = Utc::now();
    let content = FileContent {
        metadata,
        document: save_content(document),
    };

    // 序列化为 MessagePack
    let msgpack_data = rmp_serde::to_vec(&content)?;

    // 使用 Zstd 压缩
    let compressed_data = zstd::encode_all(msgpack_data.as_slice(), COMPRESSION_LEVEL)?;

    // 写入文件
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let header = FileHeader::new(compressed_data.len() as u32);
    header.write(&mut writer)?;
    writer.write_all(&compressed_data)?;
    writer.flush()?;

    tracing::info!(
        "Saved {} objects to {} ({} bytes compressed)",
        content.document.objects.len(),
        path.display(),
        compressed_data.len()
    );

    Ok(())
}

/// 从文件加载文档
///
/// 返回重建的文档与恢复报告（被剔除的无法解析链接、跳过的属性）。
pub fn load(path: &Path) -> Result<(Document, RestoreReport), FileError> {
    let (document, report, _) = load_with_metadata(path)?;
    Ok((document, report))
}

/// 从文件加载文档与元数据
pub fn load_with_metadata(
    path: &Path,
) -> Result<(Document, RestoreReport, FileMetadata), FileError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let header = FileHeader::read(&mut reader)?;

    // 版本检查
    if header.version > FORMAT_VERSION {
        return Err(FileError::UnsupportedVersion(format!(
            "File version {} is newer than supported version {}",
            header.version, FORMAT_VERSION
        )));
    }

    // 读取压缩数据
    let mut compressed_data = vec![0u8; header.compressed_size as usize];
    reader.read_exact(&mut compressed_data)?;

    // 解压缩
    let msgpack_data = zstd::decode_all(compressed_data.as_slice())?;

    // 反序列化
    let content: FileContent = rmp_serde::from_slice(&msgpack_data)?;

    // 重建文档
    let (document, report) = restore_content(content.document)?;

    if !report.is_clean() {
        tracing::warn!(
            unresolved_links = report.unresolved_links.len(),
            skipped_properties = report.skipped_properties,
            "document restored with defects from {}",
            path.display()
        );
    }
    tracing::info!(
        "Loaded {} objects from {}",
        document.object_count(),
        path.display()
    );

    Ok((document, report, content.metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbim_doc::object::{ObjectId, ObjectKind};
    use zbim_doc::property::{EffectMask, PropertyValue};

    fn sample_doc() -> Document {
        let mut doc = Document::new("plan");
        let wall = doc.add_object(ObjectKind::GeoFeature, "Wall");
        let window = doc.add_object(ObjectKind::GeoFeature, "Window");
        doc.add_property(&wall, "Height", PropertyValue::Float(2.8), EffectMask::DEFAULT)
            .unwrap();
        doc.add_property(
            &window,
            "Host",
            PropertyValue::Link(Some(wall)),
            EffectMask::LINK_DEFAULT,
        )
        .unwrap();
        doc
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file_path = dir.path().join("plan.zbim");

        let doc = sample_doc();
        save(&doc, &file_path).expect("Failed to save");

        // 验证文件头
        let file = File::open(&file_path).expect("Failed to open");
        let mut reader = BufReader::new(file);
        let header = FileHeader::read(&mut reader).expect("Failed to read header");
        assert_eq!(&header.magic, MAGIC);
        assert_eq!(header.version, FORMAT_VERSION);

        let (loaded, report) = load(&file_path).expect("Failed to load");
        assert!(report.is_clean());
        assert_eq!(loaded.name(), "plan");
        assert_eq!(loaded.object_count(), 2);

        let wall = ObjectId::new("Wall001");
        assert_eq!(
            loaded.value(&wall, "Height"),
            Some(&PropertyValue::Float(2.8))
        );
        assert_eq!(loaded.reference_count(&wall), 1);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file_path = dir.path().join("meta.zbim");

        let doc = sample_doc();
        let created = Utc::now() - chrono::Duration::days(7);
        let metadata = FileMetadata {
            created,
            modified: created,
            author: "tester".to_string(),
            application: "zbim test".to_string(),
        };
        save_with_metadata(&doc, &file_path, metadata).expect("Failed to save");

        let (_, _, loaded_meta) = load_with_metadata(&file_path).expect("Failed to load");
        assert_eq!(loaded_meta.created, created);
        assert_eq!(loaded_meta.application, "zbim test");
        // 保存更新了修改时间
        assert!(loaded_meta.modified > created);
    }

    #[test]
    fn test_invalid_magic() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file_path = dir.path().join("bogus.zbim");

        let mut file = File::create(&file_path).expect("Failed to create");
        file.write_all(b"XXXX").expect("Failed to write");
        file.write_all(&[0u8; 12]).expect("Failed to write padding");

        let result = load(&file_path);
        assert!(matches!(result, Err(FileError::InvalidFormat(_))));
    }

    #[test]
    fn test_newer_file_version_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file_path = dir.path().join("future.zbim");

        let mut file = File::create(&file_path).expect("Failed to create");
        file.write_all(MAGIC).expect("Failed to write");
        file.write_all(&(FORMAT_VERSION + 1).to_le_bytes())
            .expect("Failed to write");
        file.write_all(&[0u8; 8]).expect("Failed to write");

        let result = load(&file_path);
        assert!(matches!(result, Err(FileError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_truncated_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file_path = dir.path().join("short.zbim");

        let mut file = File::create(&file_path).expect("Failed to create");
        file.write_all(b"ZB").expect("Failed to write");

        assert!(matches!(load(&file_path), Err(FileError::Io(_))));
    }
}
