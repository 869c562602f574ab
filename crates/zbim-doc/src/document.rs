//! 文档
//!
//! 聚合根：拥有全部文档对象（按id、按种类、按全局id索引）、链接图、
//! 撤销/重做栈与重算调度器。文档自身是一个通知主题，向外公告
//! 文档级变更（对象增删、属性变更、重算结果与错误映射）。
//!
//! 核心图、属性、事务与通知机制都是单线程协作式的：所有变更与通知
//! 发生在同一逻辑控制流上，重入由显式队列/标志处理，不使用锁。

use crate::container::{ContainerStatus, PropertyChanged, PropertyContainer};
use crate::error::DocError;
use crate::links::{LinkDefect, LinkGraph};
use crate::notify::Subject;
use crate::object::{DocumentObject, ObjectId, ObjectKind, ObjectStatus};
use crate::property::{EffectMask, Placement, PropertyStatus, PropertyValue};
use crate::session::TransactionSession;
use crate::transaction::{Change, Transaction, TransactionMode, UndoLimits};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use uuid::Uuid;

/// 文档级通知消息
#[derive(Debug, Clone)]
pub enum DocumentMessage {
    ObjectAdded {
        id: ObjectId,
    },
    ObjectRemoved {
        id: ObjectId,
    },
    PropertyChanged {
        id: ObjectId,
        property: String,
    },
    /// 一轮重算的汇总：三个互斥集合 + 错误映射
    Recomputed {
        new_objects: Vec<ObjectId>,
        updated: Vec<ObjectId>,
        removed: Vec<ObjectId>,
        errors: BTreeMap<ObjectId, Vec<String>>,
    },
    TransactionCommitted {
        id: u64,
        name: String,
    },
    Undone {
        id: u64,
    },
    Redone {
        id: u64,
    },
}

/// 重算时对象可见的依赖输入：链接目标的属性值快照
#[derive(Debug, Default)]
pub struct RecomputeInputs {
    values: HashMap<ObjectId, Vec<(String, PropertyValue)>>,
}

impl RecomputeInputs {
    /// 某个依赖对象的某个属性值
    pub fn value(&self, id: &ObjectId, name: &str) -> Option<&PropertyValue> {
        self.values
            .get(id)?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.values.keys()
    }
}

/// 对象重算行为
///
/// 每个对象种类对应一个行为实现；失败以消息返回，由调度器隔离收集，
/// 绝不让单个对象的失败中止整轮重算。
pub trait ObjectBehavior {
    fn execute(&self, object: &mut DocumentObject, inputs: &RecomputeInputs)
        -> Result<(), String>;
}

/// 默认空行为：总是成功
pub struct NoopBehavior;

impl ObjectBehavior for NoopBehavior {
    fn execute(&self, _object: &mut DocumentObject, _inputs: &RecomputeInputs) -> Result<(), String> {
        Ok(())
    }
}

/// 行为注册表（可插拔工厂表，按种类名称解析）
pub struct BehaviorRegistry {
    table: HashMap<String, Rc<dyn ObjectBehavior>>,
    default: Rc<dyn ObjectBehavior>,
}

impl Default for BehaviorRegistry {
    fn default() -> Self {
        Self {
            table: HashMap::new(),
            default: Rc::new(NoopBehavior),
        }
    }
}

impl BehaviorRegistry {
    pub fn register(&mut self, kind_name: &str, behavior: Rc<dyn ObjectBehavior>) {
        self.table.insert(kind_name.to_string(), behavior);
    }

    pub fn resolve(&self, kind: &ObjectKind) -> Rc<dyn ObjectBehavior> {
        self.table
            .get(kind.name())
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// 一轮重算的结果
#[derive(Debug)]
pub struct RecomputeResult {
    /// 实际重算过的对象，依赖优先顺序
    pub recomputed: Vec<ObjectId>,
    /// 对象 → 失败消息列表
    pub errors: BTreeMap<ObjectId, Vec<String>>,
    /// 检测到的依赖循环
    pub cycles: Vec<Vec<ObjectId>>,
    /// 是否发布了重算通知（无用户可见变更时短路）
    pub notified: bool,
}

/// 文档
pub struct Document {
    name: String,
    pub(crate) objects: HashMap<ObjectId, DocumentObject>,
    /// 对象插入顺序（稳定遍历与序列化顺序）
    pub(crate) order: Vec<ObjectId>,
    pub(crate) by_kind: HashMap<String, Vec<ObjectId>>,
    pub(crate) by_global_id: HashMap<Uuid, ObjectId>,
    pub(crate) links: LinkGraph,
    /// 基础名 → 已用序号；对象存活期间id不复用
    pub(crate) id_seq: HashMap<String, u64>,
    undo_stack: Vec<Transaction>,
    redo_stack: Vec<Transaction>,
    limits: UndoLimits,
    mode: TransactionMode,
    active: Option<Transaction>,
    bus: Subject<DocumentMessage>,
    behaviors: BehaviorRegistry,
    /// 上次重算以来移除的对象（重算消息的 removed 集合）
    removed_since_recompute: Vec<ObjectId>,
}

impl Document {
    pub fn new(name: &str) -> Self {
        Self::with_limits(name, UndoLimits::default())
    }

    pub fn with_limits(name: &str, limits: UndoLimits) -> Self {
        Self {
            name: name.to_string(),
            objects: HashMap::new(),
            order: Vec::new(),
            by_kind: HashMap::new(),
            by_global_id: HashMap::new(),
            links: LinkGraph::new(),
            id_seq: HashMap::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            limits,
            mode: TransactionMode::Idle,
            active: None,
            bus: Subject::new(),
            behaviors: BehaviorRegistry::default(),
            removed_since_recompute: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 文档级通知主题（表现层在此附加观察者）
    pub fn bus(&self) -> &Subject<DocumentMessage> {
        &self.bus
    }

    pub fn behaviors_mut(&mut self) -> &mut BehaviorRegistry {
        &mut self.behaviors
    }

    // === 对象管理 ===

    /// 创建对象并插入文档，分配文档内唯一id
    ///
    /// 所有对象带 `Label` 属性；`GeoFeature` 额外带 `Placement` 与
    /// 不持久化的不透明表示句柄 `Shape`。
    pub fn add_object(&mut self, kind: ObjectKind, base_name: &str) -> ObjectId {
        let id = self.allocate_id(if base_name.is_empty() {
            kind.name()
        } else {
            base_name
        });

        let mut obj = DocumentObject::new(id.clone(), kind.clone());
        obj.props_mut()
            .add_property(
                "Label",
                PropertyValue::Str(id.as_str().to_string()),
                EffectMask::VIEW_ONLY,
            )
            .expect("fresh container cannot hold duplicates");
        if kind == ObjectKind::GeoFeature {
            obj.props_mut()
                .add_property(
                    "Placement",
                    PropertyValue::Placement(Placement::default()),
                    EffectMask::DEFAULT,
                )
                .expect("fresh container cannot hold duplicates");
            // 表示句柄由外部几何服务填充，核心只存储
            obj.props_mut()
                .add_property_with_status(
                    "Shape",
                    PropertyValue::Binary(Vec::new()),
                    EffectMask::VIEW_ONLY,
                    PropertyStatus::new(PropertyStatus::TRANSIENT | PropertyStatus::HIDDEN),
                )
                .expect("fresh container cannot hold duplicates");
        }

        if self.mode == TransactionMode::Recording {
            if let Some(tx) = self.active.as_mut() {
                tx.record_created(id.clone());
            }
        }

        if let Some(gid) = obj.global_id() {
            self.by_global_id.insert(gid, id.clone());
        }
        self.by_kind
            .entry(kind.name().to_string())
            .or_default()
            .push(id.clone());
        self.order.push(id.clone());
        self.objects.insert(id.clone(), obj);

        let _ = self.bus.notify(DocumentMessage::ObjectAdded { id: id.clone() });
        id
    }

    fn allocate_id(&mut self, base: &str) -> ObjectId {
        let seq = self.id_seq.entry(base.to_string()).or_insert(0);
        loop {
            *seq += 1;
            let id = ObjectId::new(format!("{}{:03}", base, *seq));
            if !self.objects.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn get_object(&self, id: &ObjectId) -> Option<&DocumentObject> {
        self.objects.get(id)
    }

    /// 按全局唯一id查找
    pub fn find_by_global_id(&self, gid: &Uuid) -> Option<&DocumentObject> {
        self.by_global_id.get(gid).and_then(|id| self.objects.get(id))
    }

    /// 某一种类的全部对象（插入顺序）
    pub fn objects_of_kind(&self, kind_name: &str) -> Vec<&DocumentObject> {
        self.by_kind
            .get(kind_name)
            .map(|ids| ids.iter().filter_map(|id| self.objects.get(id)).collect())
            .unwrap_or_default()
    }

    /// 全部对象，插入顺序
    pub fn objects(&self) -> impl Iterator<Item = &DocumentObject> {
        self.order.iter().filter_map(|id| self.objects.get(id))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// 对象的引用计数（终止于它的存活正向边数）
    pub fn reference_count(&self, id: &ObjectId) -> usize {
        self.links.reference_count(id)
    }

    /// 移除对象
    ///
    /// 仍被链接引用时拒绝（`StillReferenced`），调用方可选择先解除链接
    /// 或改用 [`Document::remove_object_final`] 强制拆链。
    pub fn remove_object(&mut self, id: &ObjectId) -> Result<(), DocError> {
        if !self.objects.contains_key(id) {
            return Err(DocError::NotFound(id.to_string()));
        }
        let refs = self.links.reference_count(id);
        if refs > 0 {
            return Err(DocError::StillReferenced(id.clone(), refs));
        }
        self.remove_unreferenced(id);
        Ok(())
    }

    /// 最终移除：先拆除双向全部链接（两侧都得到通知），再释放对象
    ///
    /// 指向该对象的链接属性被剔除对应目标并照常走变更协议（来源对象
    /// 被触碰、变更被事务记录），不会留下悬空边。
    pub fn remove_object_final(&mut self, id: &ObjectId) -> Result<(), DocError> {
        if !self.objects.contains_key(id) {
            return Err(DocError::NotFound(id.to_string()));
        }
        self.objects
            .get_mut(id)
            .expect("checked above")
            .set_status(ObjectStatus::PENDING_REMOVAL, true);

        // 逐条剥离指向该对象的链接属性值；单条被否决不中止整遍，
        // 剥不掉时放弃移除而不是留下剥了一半的对象
        let incoming: Vec<(ObjectId, String)> = self
            .links
            .backward_of(id)
            .iter()
            .map(|e| (e.other.clone(), e.property.clone()))
            .collect();
        let mut first_failure: Option<DocError> = None;
        for (source, property) in incoming {
            let stripped = match self
                .objects
                .get(&source)
                .and_then(|o| o.props().value(&property))
            {
                Some(value) => value.without_link_target(id),
                None => continue,
            };
            if let Err(err) = self.set_property(&source, &property, stripped) {
                tracing::error!(
                    source = %source,
                    property = %property,
                    target = %id,
                    error = %err,
                    "incoming link could not be stripped during final removal"
                );
                first_failure.get_or_insert(err);
            }
        }
        if let Some(err) = first_failure {
            self.objects
                .get_mut(id)
                .expect("checked above")
                .set_status(ObjectStatus::PENDING_REMOVAL, false);
            return Err(err);
        }
        debug_assert_eq!(self.links.reference_count(id), 0);

        self.remove_unreferenced(id);
        Ok(())
    }

    /// 引用已清零的对象的物理移除
    fn remove_unreferenced(&mut self, id: &ObjectId) {
        if self.mode == TransactionMode::Recording {
            let snapshot = self.objects.get(id).cloned();
            if let (Some(tx), Some(mut obj)) = (self.active.as_mut(), snapshot) {
                obj.set_status(ObjectStatus::PENDING_REMOVAL, false);
                tx.record_deleted(id.clone(), obj);
            }
        }
        if let Some(obj) = self.take_object_internal(id) {
            debug_assert!(obj.status().contains(ObjectStatus::DELETED));
        }
        let _ = self
            .bus
            .notify(DocumentMessage::ObjectRemoved { id: id.clone() });
    }

    /// 从所有索引摘除对象并拆除其全部边；对象标记 Deleted 后交还
    fn take_object_internal(&mut self, id: &ObjectId) -> Option<DocumentObject> {
        let mut obj = self.objects.remove(id)?;
        self.links.break_object(id);
        self.order.retain(|o| o != id);
        if let Some(ids) = self.by_kind.get_mut(obj.kind().name()) {
            ids.retain(|o| o != id);
        }
        if let Some(gid) = obj.global_id() {
            self.by_global_id.remove(&gid);
        }
        obj.set_status(ObjectStatus::PENDING_REMOVAL, false);
        obj.set_status(ObjectStatus::DELETED, true);
        obj.props_mut().set_status(ContainerStatus::Deleted);
        self.removed_since_recompute.push(id.clone());
        Some(obj)
    }

    /// 把对象放回文档（撤销删除 / 重做创建的回放路径）
    fn reinsert_object(&mut self, mut obj: DocumentObject) {
        let id = obj.id().clone();
        obj.set_status(ObjectStatus::DELETED | ObjectStatus::PENDING_REMOVAL, false);
        obj.touch();

        // 对象的链接属性重新登记正反向边
        let links: Vec<(String, Vec<ObjectId>)> = obj
            .props()
            .iter()
            .filter(|(_, p)| p.kind().is_link())
            .map(|(n, p)| (n.to_string(), p.value().link_targets()))
            .collect();

        if let Some(gid) = obj.global_id() {
            self.by_global_id.insert(gid, id.clone());
        }
        self.by_kind
            .entry(obj.kind().name().to_string())
            .or_default()
            .push(id.clone());
        self.order.push(id.clone());
        self.objects.insert(id.clone(), obj);
        self.removed_since_recompute.retain(|o| o != &id);

        for (property, targets) in links {
            for target in targets {
                self.links.add_edge(&id, &property, &target);
            }
        }
    }

    // === 属性操作 ===

    pub fn value(&self, id: &ObjectId, name: &str) -> Option<&PropertyValue> {
        self.objects.get(id).and_then(|o| o.props().value(name))
    }

    /// 运行期给对象添加动态属性（记入活动事务）
    pub fn add_property(
        &mut self,
        id: &ObjectId,
        name: &str,
        value: PropertyValue,
        effects: EffectMask,
    ) -> Result<(), DocError> {
        let status = PropertyStatus::new(PropertyStatus::DYNAMIC);
        let Some(obj) = self.objects.get(id) else {
            return Err(DocError::NotFound(id.to_string()));
        };
        self.check_link_targets(&value)?;
        // 否决在事务快照之前：被拒绝的变更不进入事务
        obj.props().about_to_add(name, &value, status)?;
        self.record_mutation(id);

        let obj = self.objects.get_mut(id).expect("checked above");
        let mut effects = effects;
        if value.kind().is_link() {
            effects.set(EffectMask::LINK, true);
        }
        let targets = value.link_targets();
        obj.props_mut()
            .add_property_with_status(name, value, effects, status)?;
        obj.touch();

        for target in targets {
            self.links.add_edge(id, name, &target);
        }
        Ok(())
    }

    /// 写入属性值（两阶段协议的文档侧编排）
    ///
    /// 顺序：链接目标活性预检 → 容器前置校验 → 惰性事务快照 →
    /// 容器写入 → 链接图增量 → 触碰标记 → 通知。否决的变更不留任何
    /// 痕迹，事务里也不留快照。
    pub fn set_property(
        &mut self,
        id: &ObjectId,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), DocError> {
        let Some(obj) = self.objects.get(id) else {
            return Err(DocError::NotFound(id.to_string()));
        };
        self.check_link_targets(&value)?;
        obj.props().about_to_set(name, &value)?;
        self.record_mutation(id);

        let new_targets = value.link_targets();
        let (changed, notify): (PropertyChanged, bool) = {
            let obj = self.objects.get_mut(id).expect("checked above");
            let changed = obj.props_mut().set_value(name, value)?;
            if changed.effects.contains(EffectMask::RECOMPUTE) {
                obj.touch();
            }
            if changed.effects.contains(EffectMask::VIEW) {
                obj.set_status(ObjectStatus::VIEW_TOUCHED, true);
            }
            let notify = changed.effects.contains(EffectMask::NOTIFY)
                && obj.props().is_notify_enabled();
            (changed, notify)
        };

        // 链接图增量：与属性写入对调用方原子（同一公开操作内完成）
        if changed.effects.contains(EffectMask::LINK) {
            for target in changed.old.link_targets() {
                self.links.remove_edge(id, name, &target);
            }
            for target in &new_targets {
                self.links.add_edge(id, name, target);
            }
        }

        if notify {
            let _ = self.bus.notify(DocumentMessage::PropertyChanged {
                id: id.clone(),
                property: name.to_string(),
            });
        }
        Ok(())
    }

    /// 移除动态属性（记入活动事务，链接边一并拆除）
    pub fn remove_property(&mut self, id: &ObjectId, name: &str) -> Result<(), DocError> {
        let Some(obj) = self.objects.get(id) else {
            return Err(DocError::NotFound(id.to_string()));
        };
        obj.props().about_to_remove(name)?;
        self.record_mutation(id);

        let obj = self.objects.get_mut(id).expect("checked above");
        let prop = obj.props_mut().remove_property(name)?;
        obj.touch();
        for target in prop.value().link_targets() {
            self.links.remove_edge(id, name, &target);
        }
        Ok(())
    }

    /// 往链接属性追加一个目标
    ///
    /// `target` 为 `None` 是无操作。单值链接被替换，列表链接追加。
    /// 键控链接用 [`Document::add_link_keyed`]。
    pub fn add_link(
        &mut self,
        id: &ObjectId,
        property: &str,
        target: Option<&ObjectId>,
    ) -> Result<(), DocError> {
        let Some(target) = target else { return Ok(()) };
        let value = match self.value(id, property) {
            Some(PropertyValue::Link(_)) => PropertyValue::Link(Some(target.clone())),
            Some(PropertyValue::LinkList(ids)) => {
                let mut ids = ids.clone();
                ids.push(target.clone());
                PropertyValue::LinkList(ids)
            }
            Some(other) => {
                return Err(DocError::KindMismatch {
                    name: property.to_string(),
                    expected: "Link",
                    got: other.kind().name(),
                })
            }
            None => return Err(DocError::NotFound(property.to_string())),
        };
        self.set_property(id, property, value)
    }

    /// 往键控链接属性插入一个目标
    pub fn add_link_keyed(
        &mut self,
        id: &ObjectId,
        property: &str,
        key: &str,
        target: &ObjectId,
    ) -> Result<(), DocError> {
        let value = match self.value(id, property) {
            Some(PropertyValue::LinkMap(map)) => {
                let mut map = map.clone();
                map.insert(key.to_string(), target.clone());
                PropertyValue::LinkMap(map)
            }
            Some(other) => {
                return Err(DocError::KindMismatch {
                    name: property.to_string(),
                    expected: "LinkMap",
                    got: other.kind().name(),
                })
            }
            None => return Err(DocError::NotFound(property.to_string())),
        };
        self.set_property(id, property, value)
    }

    /// 从链接属性移除恰好一个匹配目标
    ///
    /// 目标不在值里时返回 `Ok(false)`，属性与链接图不受影响。
    pub fn remove_link(
        &mut self,
        id: &ObjectId,
        property: &str,
        target: &ObjectId,
    ) -> Result<bool, DocError> {
        let value = match self.value(id, property) {
            Some(PropertyValue::Link(Some(t))) if t == target => PropertyValue::Link(None),
            Some(PropertyValue::Link(_)) => return Ok(false),
            Some(PropertyValue::LinkList(ids)) => {
                let Some(pos) = ids.iter().position(|t| t == target) else {
                    return Ok(false);
                };
                let mut ids = ids.clone();
                ids.remove(pos);
                PropertyValue::LinkList(ids)
            }
            Some(PropertyValue::LinkMap(map)) => {
                let Some(key) = map
                    .iter()
                    .find(|(_, t)| *t == target)
                    .map(|(k, _)| k.clone())
                else {
                    return Ok(false);
                };
                let mut map = map.clone();
                map.remove(&key);
                PropertyValue::LinkMap(map)
            }
            Some(other) => {
                return Err(DocError::KindMismatch {
                    name: property.to_string(),
                    expected: "Link",
                    got: other.kind().name(),
                })
            }
            None => return Err(DocError::NotFound(property.to_string())),
        };
        self.set_property(id, property, value)?;
        Ok(true)
    }

    /// 链接目标活性预检：空目标是无操作，死目标是错误
    fn check_link_targets(&self, value: &PropertyValue) -> Result<(), DocError> {
        for target in value.link_targets() {
            match self.objects.get(&target) {
                Some(obj) if !obj.is_pending_removal() => {}
                _ => return Err(DocError::DeadLinkTarget(target)),
            }
        }
        Ok(())
    }

    /// 惰性捕获事务内对象的"前"快照
    fn record_mutation(&mut self, id: &ObjectId) {
        if self.mode != TransactionMode::Recording {
            return;
        }
        let Some(tx) = self.active.as_mut() else { return };
        if tx.has_snapshot(id) {
            return;
        }
        if let Some(obj) = self.objects.get(id) {
            tx.record_mutation(id.clone(), obj.props().clone());
        }
    }

    // === 事务 ===

    /// 开启事务
    ///
    /// 已有同名（或未指定名称的）事务时是无操作，返回现有id；给出不同
    /// 名称则先提交现有事务。事务id来自会话：会话有活动组且名称匹配时
    /// 共享组id（跨文档关联），否则开启新组。
    ///
    /// # Panics
    /// 撤销/重做重放期间调用属于核心逻辑错误，直接断言失败。
    pub fn open_transaction(&mut self, session: &mut TransactionSession, name: &str) -> u64 {
        assert!(
            self.mode != TransactionMode::Replaying,
            "cannot open a transaction while a replay is in progress"
        );
        if let Some(tx) = &self.active {
            if name.is_empty() || name == tx.name() {
                return tx.id();
            }
            self.commit_transaction();
        }

        let id = match (session.active_id(), session.active_name()) {
            (Some(id), Some(active)) if active == name => id,
            _ => session.begin(name),
        };
        self.active = Some(Transaction::new(id, name));
        self.mode = TransactionMode::Recording;
        id
    }

    /// 当前活动事务id
    pub fn active_transaction_id(&self) -> Option<u64> {
        self.active.as_ref().map(|t| t.id())
    }

    /// 提交活动事务
    ///
    /// 空事务直接丢弃并返回 `None`。提交使重做栈失效，并按预算逐出
    /// 最旧的撤销条目。
    pub fn commit_transaction(&mut self) -> Option<u64> {
        assert!(
            self.mode != TransactionMode::Replaying,
            "cannot commit a transaction while a replay is in progress"
        );
        let mut tx = self.active.take()?;
        self.mode = TransactionMode::Idle;
        if tx.is_empty() {
            return None;
        }

        // 补齐"后"快照供重做
        for change in tx.changes.iter_mut() {
            if let Change::Mutated { id, after, .. } = change {
                if after.is_none() {
                    *after = self.objects.get(id).map(|o| o.props().clone());
                }
            }
        }

        let id = tx.id();
        let name = tx.name().to_string();
        self.undo_stack.push(tx);
        self.redo_stack.clear();
        self.enforce_undo_limits();

        let _ = self
            .bus
            .notify(DocumentMessage::TransactionCommitted { id, name });
        Some(id)
    }

    /// 放弃活动事务：逆序重放已记录的快照，恢复事务前状态
    pub fn abort_transaction(&mut self) -> bool {
        let Some(mut tx) = self.active.take() else {
            return false;
        };
        self.mode = TransactionMode::Replaying;
        for change in tx.changes.iter_mut().rev() {
            self.undo_change(change);
        }
        self.mode = TransactionMode::Idle;
        true
    }

    fn enforce_undo_limits(&mut self) {
        while self.undo_stack.len() > self.limits.max_transactions {
            self.undo_stack.remove(0);
        }
        while self.undo_stack.len() > 1
            && self
                .undo_stack
                .iter()
                .map(|t| t.approx_size())
                .sum::<usize>()
                > self.limits.max_bytes
        {
            self.undo_stack.remove(0);
        }
    }

    /// 撤销
    ///
    /// `id` 为 `None` 时取栈顶，否则取最近的匹配事务。空栈或无匹配
    /// 返回 `false`。活动事务先被放弃。
    pub fn undo(&mut self, id: Option<u64>) -> bool {
        assert!(
            self.mode != TransactionMode::Replaying,
            "undo requested while a replay is already in progress"
        );
        if self.active.is_some() {
            self.abort_transaction();
        }
        let idx = match id {
            Some(id) => match self.undo_stack.iter().rposition(|t| t.id() == id) {
                Some(i) => i,
                None => return false,
            },
            None => match self.undo_stack.len().checked_sub(1) {
                Some(i) => i,
                None => return false,
            },
        };
        let mut tx = self.undo_stack.remove(idx);

        self.mode = TransactionMode::Replaying;
        for change in tx.changes.iter_mut().rev() {
            self.undo_change(change);
        }
        self.mode = TransactionMode::Idle;

        let tx_id = tx.id();
        self.redo_stack.push(tx);
        let _ = self.bus.notify(DocumentMessage::Undone { id: tx_id });
        true
    }

    /// 重做（语义与 [`Document::undo`] 对称，正向重放）
    pub fn redo(&mut self, id: Option<u64>) -> bool {
        assert!(
            self.mode != TransactionMode::Replaying,
            "redo requested while a replay is already in progress"
        );
        if self.active.is_some() {
            self.abort_transaction();
        }
        let idx = match id {
            Some(id) => match self.redo_stack.iter().rposition(|t| t.id() == id) {
                Some(i) => i,
                None => return false,
            },
            None => match self.redo_stack.len().checked_sub(1) {
                Some(i) => i,
                None => return false,
            },
        };
        let mut tx = self.redo_stack.remove(idx);

        self.mode = TransactionMode::Replaying;
        for change in tx.changes.iter_mut() {
            self.redo_change(change);
        }
        self.mode = TransactionMode::Idle;

        let tx_id = tx.id();
        self.undo_stack.push(tx);
        let _ = self.bus.notify(DocumentMessage::Redone { id: tx_id });
        true
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    fn undo_change(&mut self, change: &mut Change) {
        match change {
            Change::Mutated { id, before, .. } => {
                self.apply_snapshot(id.clone(), before.clone());
            }
            Change::Created { id, removed } => {
                if let Some(obj) = self.take_object_internal(&id.clone()) {
                    *removed = Some(Box::new(obj));
                }
            }
            Change::Deleted { object, .. } => {
                self.reinsert_object((**object).clone());
            }
        }
    }

    fn redo_change(&mut self, change: &mut Change) {
        match change {
            Change::Mutated { id, after, .. } => {
                if let Some(after) = after {
                    self.apply_snapshot(id.clone(), after.clone());
                }
            }
            Change::Created { removed, .. } => {
                if let Some(obj) = removed.take() {
                    self.reinsert_object(*obj);
                }
            }
            Change::Deleted { id, object } => {
                if let Some(obj) = self.take_object_internal(&id.clone()) {
                    **object = obj;
                }
            }
        }
    }

    /// 整容器回放：先撤销现有链接边，替换容器，再登记快照里的边
    fn apply_snapshot(&mut self, id: ObjectId, snapshot: PropertyContainer) {
        let current: Vec<(String, Vec<ObjectId>)> = match self.objects.get(&id) {
            Some(obj) => obj
                .props()
                .iter()
                .filter(|(_, p)| p.kind().is_link())
                .map(|(n, p)| (n.to_string(), p.value().link_targets()))
                .collect(),
            None => return,
        };
        for (property, targets) in current {
            for target in targets {
                self.links.remove_edge(&id, &property, &target);
            }
        }

        let restored: Vec<(String, Vec<ObjectId>)> = snapshot
            .iter()
            .filter(|(_, p)| p.kind().is_link())
            .map(|(n, p)| (n.to_string(), p.value().link_targets()))
            .collect();

        if let Some(obj) = self.objects.get_mut(&id) {
            obj.replace_props(snapshot);
            obj.touch();
        }
        for (property, targets) in restored {
            for target in targets {
                self.links.add_edge(&id, &property, &target);
            }
        }
    }

    // === 重算调度 ===

    /// 重算所有触碰对象及其（传递）依赖者
    ///
    /// 依赖优先的拓扑顺序，循环成员照常重算并以缺陷形式报告。每个对象
    /// 的失败被隔离进错误映射，不中止整轮。结束后汇总新建/更新/删除
    /// 三个集合与错误映射，经通知总线一次性发布；没有用户可见变更时
    /// 短路发布。
    pub fn recompute(&mut self) -> RecomputeResult {
        // 1. 触碰集合 + 传递依赖者
        let mut pending: HashMap<ObjectId, bool> = self
            .objects
            .values()
            .filter(|o| o.is_touched() && !o.is_pending_removal())
            .map(|o| (o.id().clone(), true))
            .collect();
        let mut worklist: Vec<ObjectId> = pending.keys().cloned().collect();
        while let Some(id) = worklist.pop() {
            for edge in self.links.backward_of(&id) {
                if pending.contains_key(&edge.other) {
                    continue;
                }
                // 反向引用属性只登记关系，不构成依赖，不沿其传播重算
                let follows = self
                    .objects
                    .get(&edge.other)
                    .and_then(|o| o.props().get(&edge.property))
                    .map(|p| !p.effects().contains(EffectMask::BACKLINK))
                    .unwrap_or(false);
                if follows {
                    pending.insert(edge.other.clone(), true);
                    worklist.push(edge.other.clone());
                }
            }
        }

        // 2. 依赖优先的稳定顺序
        let nodes: Vec<ObjectId> = self
            .order
            .iter()
            .filter(|id| pending.contains_key(*id))
            .cloned()
            .collect();
        let topo = self.links.topological_order(&nodes);

        let new_objects: Vec<ObjectId> = self
            .order
            .iter()
            .filter(|id| {
                pending.contains_key(*id)
                    && self.objects.get(*id).map(|o| o.is_new()).unwrap_or(false)
            })
            .cloned()
            .collect();

        // 3. 逐对象隔离重算
        let mut errors: BTreeMap<ObjectId, Vec<String>> = BTreeMap::new();
        let mut recomputed: Vec<ObjectId> = Vec::new();

        for id in &topo.order {
            let behavior = {
                let obj = match self.objects.get(id) {
                    Some(o) => o,
                    None => continue,
                };
                self.behaviors.resolve(obj.kind())
            };
            let inputs = self.gather_inputs(id);

            let obj = self.objects.get_mut(id).expect("object checked above");
            obj.set_status(ObjectStatus::RECOMPUTING, true);
            let outcome = behavior.execute(obj, &inputs);
            obj.set_status(ObjectStatus::RECOMPUTING, false);

            match outcome {
                Ok(()) => {
                    obj.clear_errors();
                    obj.purge_touched();
                    obj.set_status(ObjectStatus::NEW, false);
                    obj.props_mut().set_status(ContainerStatus::Valid);
                    obj.props_mut().set_integrity(true);
                    obj.props_mut().save_last_valid();
                    recomputed.push(id.clone());
                }
                Err(message) => {
                    obj.purge_touched();
                    obj.push_error(message.clone());
                    obj.props_mut().set_status(ContainerStatus::Error);
                    // 失败的对象其属性间一致性不再可信，回滚或下次成功重算恢复
                    obj.props_mut().set_integrity(false);
                    errors.entry(id.clone()).or_default().push(message);
                }
            }
        }

        // 4. 汇总与发布
        // 视图触碰不要求重算，但要求通知；本轮一并清除
        let mut visible = false;
        for obj in self.objects.values_mut() {
            if obj.status().contains(ObjectStatus::VIEW_TOUCHED) {
                visible = true;
                obj.set_status(ObjectStatus::VIEW_TOUCHED, false);
            }
        }
        let removed = std::mem::take(&mut self.removed_since_recompute);
        let updated: Vec<ObjectId> = recomputed
            .iter()
            .filter(|id| !new_objects.contains(id))
            .cloned()
            .collect();

        let must_notify =
            !new_objects.is_empty() || !removed.is_empty() || visible || !errors.is_empty();
        if must_notify {
            let _ = self.bus.notify(DocumentMessage::Recomputed {
                new_objects,
                updated,
                removed,
                errors: errors.clone(),
            });
        }

        RecomputeResult {
            recomputed,
            errors,
            cycles: topo.cycles,
            notified: must_notify,
        }
    }

    /// 收集对象链接目标的属性值快照作为重算输入
    fn gather_inputs(&self, id: &ObjectId) -> RecomputeInputs {
        let mut inputs = RecomputeInputs::default();
        for edge in self.links.forward_of(id) {
            if inputs.values.contains_key(&edge.other) {
                continue;
            }
            if let Some(dep) = self.objects.get(&edge.other) {
                inputs.values.insert(
                    edge.other.clone(),
                    dep.props()
                        .iter()
                        .map(|(n, p)| (n.to_string(), p.value().clone()))
                        .collect(),
                );
            }
        }
        inputs
    }

    // === 链接诊断 ===

    /// 报告端点不再存活的边；`scope` 限定只看涉及这些对象的边
    ///
    /// 纯诊断：编辑过程中瞬时缺陷是预期情形，不抛错、不中止。
    pub fn check_object_links(&self, scope: Option<&[ObjectId]>) -> Vec<LinkDefect> {
        let live = |id: &ObjectId| {
            self.objects
                .get(id)
                .map(|o| !o.is_pending_removal())
                .unwrap_or(false)
        };
        let mut defects = self.links.check(&live);
        if let Some(scope) = scope {
            defects.retain(|d| match d {
                LinkDefect::DanglingForward { source, target, .. } => {
                    scope.contains(source) || scope.contains(target)
                }
                LinkDefect::DanglingBackward { target, source, .. } => {
                    scope.contains(source) || scope.contains(target)
                }
                LinkDefect::Cycle(members) => members.iter().any(|m| scope.contains(m)),
            });
        }
        defects
    }
}
