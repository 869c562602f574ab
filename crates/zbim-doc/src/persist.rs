//! 文档持久化模型
//!
//! 文档与可序列化内容之间的双向转换：
//! - 属性带类型名标签，自描述，未知类型可跳过而非中止
//! - 链接目标持久化为字符串id，恢复分两遍：先建全部对象，再解析链接
//! - 无法解析的链接目标被剔除并报告，恢复照常完成
//! - 瞬态属性不参与持久化
//!
//! 字节编码（压缩、文件头）是上层文件格式 crate 的职责，这里只定义
//! 内容模型。

use crate::document::Document;
use crate::error::DocError;
use crate::object::{DocumentObject, ObjectId, ObjectKind};
use crate::property::{EffectMask, PropertyStatus, PropertyValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 当前内容模型版本
pub const CONTENT_VERSION: u32 = 1;

/// 持久化的属性
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedProperty {
    pub name: String,
    /// 类型名标签，恢复时与值的实际类型核对
    pub kind: String,
    pub value: PropertyValue,
    pub effects: u16,
    pub status: u16,
}

/// 持久化的对象
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedObject {
    pub id: ObjectId,
    pub global_id: Option<Uuid>,
    pub kind: String,
    /// 插入顺序的属性序列
    pub properties: Vec<SavedProperty>,
}

/// 文档的可序列化内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentContent {
    pub format_version: u32,
    pub name: String,
    /// 对象按文档插入顺序排列
    pub objects: Vec<SavedObject>,
}

/// 恢复报告
///
/// 恢复过程容忍局部缺损：问题被收集报告，不中止整体恢复。
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// 被剔除的无法解析的链接 (来源对象, 属性, 目标id)
    pub unresolved_links: Vec<(ObjectId, String, ObjectId)>,
    /// 因类型标签不符而跳过的属性数
    pub skipped_properties: usize,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved_links.is_empty() && self.skipped_properties == 0
    }
}

/// 提取文档的可序列化内容
///
/// 对象按插入顺序输出，瞬态属性跳过。
pub fn save_content(doc: &Document) -> DocumentContent {
    let objects = doc
        .objects()
        .map(|obj| SavedObject {
            id: obj.id().clone(),
            global_id: obj.global_id(),
            kind: obj.kind().name().to_string(),
            properties: obj
                .props()
                .iter()
                .filter(|(_, p)| !p.is_transient())
                .map(|(name, p)| SavedProperty {
                    name: name.to_string(),
                    kind: p.kind().name().to_string(),
                    value: p.value().clone(),
                    effects: p.effects().bits(),
                    status: p.status().bits(),
                })
                .collect(),
        })
        .collect();

    DocumentContent {
        format_version: CONTENT_VERSION,
        name: doc.name().to_string(),
        objects,
    }
}

/// 从内容重建文档
///
/// 两遍恢复：第一遍建出全部对象与属性（链接值原样写入），第二遍解析
/// 链接并登记图的边；指向不存在对象的链接被剔除并进入报告。恢复出的
/// 对象是安静的：不触碰、不标记New、撤销栈为空。
pub fn restore_content(content: DocumentContent) -> Result<(Document, RestoreReport), DocError> {
    if content.format_version > CONTENT_VERSION {
        return Err(DocError::Value(format!(
            "content version {} is newer than supported version {}",
            content.format_version, CONTENT_VERSION
        )));
    }

    let mut doc = Document::new(&content.name);
    let mut report = RestoreReport::default();

    // 第一遍：重建对象与属性
    for saved in &content.objects {
        if doc.objects.contains_key(&saved.id) {
            return Err(DocError::DuplicateObjectId(saved.id.clone()));
        }
        let mut obj = DocumentObject::restored(
            saved.id.clone(),
            ObjectKind::from_name(&saved.kind),
            saved.global_id,
        );

        for prop in &saved.properties {
            if prop.value.kind().name() != prop.kind {
                tracing::warn!(
                    object = %saved.id,
                    property = %prop.name,
                    expected = %prop.kind,
                    got = prop.value.kind().name(),
                    "property kind tag mismatch, skipping"
                );
                report.skipped_properties += 1;
                continue;
            }
            // 触碰位不随恢复传播
            let status = prop.status & !PropertyStatus::TOUCHED;
            obj.props_mut().add_property_with_status(
                &prop.name,
                prop.value.clone(),
                EffectMask::new(prop.effects),
                PropertyStatus::new(status),
            )?;
        }
        obj.props_mut().save_last_valid();

        if let Some(gid) = obj.global_id() {
            doc.by_global_id.insert(gid, saved.id.clone());
        }
        doc.by_kind
            .entry(obj.kind().name().to_string())
            .or_default()
            .push(saved.id.clone());
        doc.order.push(saved.id.clone());
        doc.objects.insert(saved.id.clone(), obj);

        bump_id_seq(&mut doc, saved.id.as_str());
    }

    // 第二遍：解析链接
    for saved in &content.objects {
        let link_props: Vec<(String, PropertyValue)> = saved
            .properties
            .iter()
            .filter(|p| p.value.kind().is_link())
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();

        for (name, mut value) in link_props {
            let mut dirty = false;
            for target in value.link_targets() {
                if doc.objects.contains_key(&target) {
                    doc.links.add_edge(&saved.id, &name, &target);
                } else {
                    tracing::warn!(
                        object = %saved.id,
                        property = %name,
                        target = %target,
                        "unresolved link target dropped during restore"
                    );
                    report
                        .unresolved_links
                        .push((saved.id.clone(), name.clone(), target.clone()));
                    value = value.without_link_target(&target);
                    dirty = true;
                }
            }
            if dirty {
                if let Some(obj) = doc.objects.get_mut(&saved.id) {
                    if let Some(prop) = obj.props_mut().get_mut(&name) {
                        prop.write_restored(value);
                    }
                }
            }
        }
    }

    debug_assert!(doc.links.is_symmetric());
    Ok((doc, report))
}

/// 从对象id的尾部数字推进序号分配器，保证后续分配不撞已有id
fn bump_id_seq(doc: &mut Document, id: &str) {
    let digits_at = id
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);
    let Some(pos) = digits_at else { return };
    let (base, digits) = id.split_at(pos);
    if base.is_empty() {
        return;
    }
    let Ok(num) = digits.parse::<u64>() else { return };
    let seq = doc.id_seq.entry(base.to_string()).or_insert(0);
    *seq = (*seq).max(num);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> Document {
        let mut doc = Document::new("plan");
        let wall = doc.add_object(ObjectKind::GeoFeature, "Wall");
        let window = doc.add_object(ObjectKind::GeoFeature, "Window");
        doc.add_property(&wall, "Height", PropertyValue::Float(2.8), EffectMask::DEFAULT)
            .unwrap();
        doc.add_property(
            &window,
            "Host",
            PropertyValue::Link(Some(wall.clone())),
            EffectMask::LINK_DEFAULT,
        )
        .unwrap();
        doc
    }

    #[test]
    fn test_roundtrip_preserves_objects_and_links() {
        let doc = sample_doc();
        let content = save_content(&doc);
        assert_eq!(content.format_version, CONTENT_VERSION);
        assert_eq!(content.objects.len(), 2);
        // 插入顺序保留
        assert_eq!(content.objects[0].id.as_str(), "Wall001");
        assert_eq!(content.objects[1].id.as_str(), "Window001");

        let (restored, report) = restore_content(content).unwrap();
        assert!(report.is_clean());
        assert_eq!(restored.name(), "plan");
        assert_eq!(restored.object_count(), 2);

        let wall = ObjectId::new("Wall001");
        let window = ObjectId::new("Window001");
        assert_eq!(
            restored.value(&wall, "Height"),
            Some(&PropertyValue::Float(2.8))
        );
        assert_eq!(
            restored.value(&window, "Host"),
            Some(&PropertyValue::Link(Some(wall.clone())))
        );
        // 链接图从属性值重建
        assert_eq!(restored.reference_count(&wall), 1);
        assert!(restored.links.is_symmetric());
        // 全局id保留
        let gid = doc.get_object(&wall).unwrap().global_id().unwrap();
        assert_eq!(restored.find_by_global_id(&gid).unwrap().id(), &wall);
    }

    #[test]
    fn test_restored_objects_are_quiet() {
        let (restored, _) = restore_content(save_content(&sample_doc())).unwrap();
        for obj in restored.objects() {
            assert!(!obj.is_touched());
            assert!(!obj.is_new());
        }
        assert_eq!(restored.undo_count(), 0);
    }

    #[test]
    fn test_transient_properties_skipped() {
        let doc = sample_doc();
        let content = save_content(&doc);
        // GeoFeature 的 Shape 是瞬态的，不持久化
        let wall = &content.objects[0];
        assert!(wall.properties.iter().all(|p| p.name != "Shape"));
        assert!(wall.properties.iter().any(|p| p.name == "Placement"));
    }

    #[test]
    fn test_unresolved_link_dropped_and_reported() {
        let mut content = save_content(&sample_doc());
        // 模拟缺损文件：Wall001 不在对象列表里
        content.objects.remove(0);

        let (restored, report) = restore_content(content).unwrap();
        assert_eq!(report.unresolved_links.len(), 1);
        let (source, property, target) = &report.unresolved_links[0];
        assert_eq!(source.as_str(), "Window001");
        assert_eq!(property, "Host");
        assert_eq!(target.as_str(), "Wall001");

        // 链接值被剔除为无目标，不留悬空边
        let window = ObjectId::new("Window001");
        assert_eq!(
            restored.value(&window, "Host"),
            Some(&PropertyValue::Link(None))
        );
        assert!(restored.check_object_links(None).is_empty());
    }

    #[test]
    fn test_duplicate_object_id_rejected() {
        let mut content = save_content(&sample_doc());
        let dup = content.objects[0].clone();
        content.objects.push(dup);

        assert!(matches!(
            restore_content(content),
            Err(DocError::DuplicateObjectId(_))
        ));
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut content = save_content(&sample_doc());
        content.format_version = CONTENT_VERSION + 1;
        assert!(restore_content(content).is_err());
    }

    #[test]
    fn test_id_allocation_continues_after_restore() {
        let (mut restored, _) = restore_content(save_content(&sample_doc())).unwrap();
        let next = restored.add_object(ObjectKind::GeoFeature, "Wall");
        assert_eq!(next.as_str(), "Wall002");
    }

    #[test]
    fn test_kind_tag_mismatch_skips_property() {
        let mut content = save_content(&sample_doc());
        content.objects[0].properties[0].kind = "Matrix".to_string();

        let (restored, report) = restore_content(content).unwrap();
        assert_eq!(report.skipped_properties, 1);
        let wall = ObjectId::new("Wall001");
        assert!(restored.get_object(&wall).is_some());
    }

    #[test]
    fn test_property_status_roundtrip_without_touched() {
        let mut doc = Document::new("d");
        let a = doc.add_object(ObjectKind::Feature, "A");
        doc.add_property(&a, "Tag", PropertyValue::Str("x".into()), EffectMask::DEFAULT)
            .unwrap();
        // 写入一次使属性带触碰位
        doc.set_property(&a, "Tag", PropertyValue::Str("y".into())).unwrap();
        assert!(doc.get_object(&a).unwrap().props().get("Tag").unwrap().is_touched());

        let (restored, _) = restore_content(save_content(&doc)).unwrap();
        let prop = restored.get_object(&a).unwrap().props().get("Tag").unwrap();
        assert!(!prop.is_touched());
        // 动态标记保留
        assert!(prop.is_dynamic());
    }
}
