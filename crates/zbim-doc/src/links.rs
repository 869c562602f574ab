//! 链接图
//!
//! 对象间的对称正向/反向边索引。边不是独立实体，而是
//! `(源对象, 链接属性, 目标对象)` 的派生关系：
//! - 每次公开变更后正反向索引都保持匹配（非最终一致，而是即时一致）
//! - 增删边总是成对进行，单边残留在结构上不可能
//! - 反向边是观察性的，引用计数由反向索引派生
//! - 缺陷（悬空边、循环依赖）以诊断列表返回，从不抛出

use crate::object::ObjectId;
use std::collections::{BTreeSet, HashMap};

/// 一条边的另一端：经由哪个属性，指向/来自哪个对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEdge {
    pub property: String,
    pub other: ObjectId,
}

/// 链接图缺陷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkDefect {
    /// 正向边的目标不再是存活对象
    DanglingForward {
        source: ObjectId,
        property: String,
        target: ObjectId,
    },
    /// 反向边的来源不再是存活对象
    DanglingBackward {
        target: ObjectId,
        property: String,
        source: ObjectId,
    },
    /// 依赖循环（参与对象按文档插入顺序）
    Cycle(Vec<ObjectId>),
}

/// 拓扑排序结果
#[derive(Debug, Clone)]
pub struct TopoResult {
    /// 依赖优先的稳定顺序（循环成员附加在末尾，按插入顺序）
    pub order: Vec<ObjectId>,
    /// 检测到的循环
    pub cycles: Vec<Vec<ObjectId>>,
}

/// 拆除一个对象全部链接的结果
#[derive(Debug, Default, Clone)]
pub struct BrokenLinks {
    /// 被拆除的出边（该对象的链接属性指向他处）
    pub outgoing: Vec<LinkEdge>,
    /// 被拆除的入边（他处的链接属性指向该对象）
    pub incoming: Vec<LinkEdge>,
}

/// 链接图
#[derive(Debug, Default, Clone)]
pub struct LinkGraph {
    forward: HashMap<ObjectId, Vec<LinkEdge>>,
    backward: HashMap<ObjectId, Vec<LinkEdge>>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // === 边的维护 ===

    /// 插入一条边，正反向同时登记
    pub fn add_edge(&mut self, source: &ObjectId, property: &str, target: &ObjectId) {
        self.forward.entry(source.clone()).or_default().push(LinkEdge {
            property: property.to_string(),
            other: target.clone(),
        });
        self.backward.entry(target.clone()).or_default().push(LinkEdge {
            property: property.to_string(),
            other: source.clone(),
        });
    }

    /// 移除恰好一条匹配的边
    ///
    /// 不存在时返回 `false` 且图不受影响。
    pub fn remove_edge(&mut self, source: &ObjectId, property: &str, target: &ObjectId) -> bool {
        let Some(fwd) = self.forward.get_mut(source) else {
            return false;
        };
        let Some(pos) = fwd
            .iter()
            .position(|e| e.property == property && &e.other == target)
        else {
            return false;
        };
        fwd.remove(pos);
        if fwd.is_empty() {
            self.forward.remove(source);
        }

        let bwd = self
            .backward
            .get_mut(target)
            .expect("backward index must mirror forward index");
        let pos = bwd
            .iter()
            .position(|e| e.property == property && &e.other == source)
            .expect("backward index must mirror forward index");
        bwd.remove(pos);
        if bwd.is_empty() {
            self.backward.remove(target);
        }
        true
    }

    /// 单遍拆除一个对象的全部出边和入边
    ///
    /// 每条边的两个方向在同一次操作内成对移除。
    pub fn break_object(&mut self, id: &ObjectId) -> BrokenLinks {
        let mut broken = BrokenLinks::default();

        for edge in self.forward.remove(id).unwrap_or_default() {
            if let Some(bwd) = self.backward.get_mut(&edge.other) {
                if let Some(pos) = bwd
                    .iter()
                    .position(|e| e.property == edge.property && &e.other == id)
                {
                    bwd.remove(pos);
                }
                if bwd.is_empty() {
                    self.backward.remove(&edge.other);
                }
            }
            broken.outgoing.push(edge);
        }

        for edge in self.backward.remove(id).unwrap_or_default() {
            if let Some(fwd) = self.forward.get_mut(&edge.other) {
                if let Some(pos) = fwd
                    .iter()
                    .position(|e| e.property == edge.property && &e.other == id)
                {
                    fwd.remove(pos);
                }
                if fwd.is_empty() {
                    self.forward.remove(&edge.other);
                }
            }
            broken.incoming.push(edge);
        }

        broken
    }

    // === 查询 ===

    /// 对象的出边（它依赖谁）
    pub fn forward_of(&self, id: &ObjectId) -> &[LinkEdge] {
        self.forward.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// 对象的入边（谁依赖它）
    pub fn backward_of(&self, id: &ObjectId) -> &[LinkEdge] {
        self.backward.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// 引用计数：终止于该对象的存活正向边数量
    pub fn reference_count(&self, id: &ObjectId) -> usize {
        self.backward.get(id).map(|v| v.len()).unwrap_or(0)
    }

    /// 全图边数（按正向索引计）
    pub fn edge_count(&self) -> usize {
        self.forward.values().map(|v| v.len()).sum()
    }

    /// 正反向索引是否严格对称（不变量自检）
    pub fn is_symmetric(&self) -> bool {
        // 两个索引展开成同一方向的 (源, 属性, 目标) 三元组后逐一比对
        fn triples<'a>(
            map: &'a HashMap<ObjectId, Vec<LinkEdge>>,
            reversed: bool,
        ) -> Vec<(&'a ObjectId, &'a str, &'a ObjectId)> {
            let mut pairs = Vec::new();
            for (key, edges) in map {
                for e in edges {
                    if reversed {
                        pairs.push((&e.other, e.property.as_str(), key));
                    } else {
                        pairs.push((key, e.property.as_str(), &e.other));
                    }
                }
            }
            pairs.sort();
            pairs
        }
        triples(&self.forward, false) == triples(&self.backward, true)
    }

    // === 缺陷检测 ===

    /// 报告所有端点不再存活的边
    ///
    /// 纯诊断，不修改图，不抛错。
    pub fn check(&self, live: &dyn Fn(&ObjectId) -> bool) -> Vec<LinkDefect> {
        let mut defects = Vec::new();
        for (source, edges) in &self.forward {
            for edge in edges {
                if !live(&edge.other) {
                    defects.push(LinkDefect::DanglingForward {
                        source: source.clone(),
                        property: edge.property.clone(),
                        target: edge.other.clone(),
                    });
                }
            }
        }
        for (target, edges) in &self.backward {
            for edge in edges {
                if !live(&edge.other) {
                    defects.push(LinkDefect::DanglingBackward {
                        target: target.clone(),
                        property: edge.property.clone(),
                        source: edge.other.clone(),
                    });
                }
            }
        }
        defects
    }

    // === 拓扑排序 ===

    /// 依赖优先的拓扑排序
    ///
    /// `nodes` 给定参与对象及其稳定顺序（文档插入顺序）；指向集合外的边
    /// 视为已满足。循环不会导致不终止：循环成员按插入顺序附加在排序
    /// 末尾，并以缺陷形式报告。
    pub fn topological_order(&self, nodes: &[ObjectId]) -> TopoResult {
        let pos: HashMap<&ObjectId, usize> =
            nodes.iter().enumerate().map(|(i, id)| (id, i)).collect();

        // 集合内的出边数即未满足的依赖数
        let mut remaining: Vec<usize> = nodes
            .iter()
            .map(|id| {
                self.forward_of(id)
                    .iter()
                    .filter(|e| pos.contains_key(&e.other))
                    .count()
            })
            .collect();

        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, &r)| r == 0)
            .map(|(i, _)| i)
            .collect();

        let mut emitted = vec![false; nodes.len()];
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(&i) = ready.iter().next() {
            ready.remove(&i);
            emitted[i] = true;
            order.push(nodes[i].clone());
            for edge in self.backward_of(&nodes[i]) {
                if let Some(&j) = pos.get(&edge.other) {
                    if !emitted[j] {
                        remaining[j] -= 1;
                        if remaining[j] == 0 {
                            ready.insert(j);
                        }
                    }
                }
            }
        }

        // 剩余节点位于循环内或依赖循环，按插入顺序继续重算
        let leftovers: Vec<usize> = (0..nodes.len()).filter(|&i| !emitted[i]).collect();
        let cycles = self.leftover_cycles(nodes, &leftovers, &pos);
        for i in leftovers {
            order.push(nodes[i].clone());
        }

        TopoResult { order, cycles }
    }

    /// 在未排序的剩余子图上提取强连通分量作为循环报告
    fn leftover_cycles(
        &self,
        nodes: &[ObjectId],
        leftovers: &[usize],
        pos: &HashMap<&ObjectId, usize>,
    ) -> Vec<Vec<ObjectId>> {
        if leftovers.is_empty() {
            return Vec::new();
        }
        // 剩余子图的局部编号与邻接表
        let local: HashMap<usize, usize> = leftovers
            .iter()
            .enumerate()
            .map(|(li, &gi)| (gi, li))
            .collect();
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); leftovers.len()];
        let mut self_loop = vec![false; leftovers.len()];
        for (li, &gi) in leftovers.iter().enumerate() {
            for edge in self.forward_of(&nodes[gi]) {
                if let Some(&gj) = pos.get(&edge.other) {
                    if let Some(&lj) = local.get(&gj) {
                        adj[li].push(lj);
                        if lj == li {
                            self_loop[li] = true;
                        }
                    }
                }
            }
        }

        let mut cycles = Vec::new();
        for scc in tarjan_scc(&adj) {
            if scc.len() > 1 || self_loop[scc[0]] {
                // 按插入顺序报告循环成员
                let mut members: Vec<usize> = scc.iter().map(|&li| leftovers[li]).collect();
                members.sort_unstable();
                cycles.push(members.into_iter().map(|gi| nodes[gi].clone()).collect());
            }
        }
        cycles
    }
}

/// 迭代式 Tarjan 强连通分量
fn tarjan_scc(adj: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let n = adj.len();
    const UNVISITED: usize = usize::MAX;
    let mut index = vec![UNVISITED; n];
    let mut low = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut sccs: Vec<Vec<usize>> = Vec::new();

    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        index[root] = next_index;
        low[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(frame) = frames.last_mut() {
            let v = frame.0;
            if frame.1 < adj[v].len() {
                let w = adj[v][frame.1];
                frame.1 += 1;
                if index[w] == UNVISITED {
                    index[w] = next_index;
                    low[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    frames.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index[w]);
                }
            } else {
                frames.pop();
                if let Some(parent) = frames.last() {
                    let p = parent.0;
                    low[p] = low[p].min(low[v]);
                }
                if low[v] == index[v] {
                    let mut component = Vec::new();
                    loop {
                        let w = stack.pop().expect("tarjan stack underflow");
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    sccs.push(component);
                }
            }
        }
    }
    sccs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s)
    }

    #[test]
    fn test_add_remove_edge_symmetric() {
        let mut g = LinkGraph::new();
        let (a, b) = (id("A"), id("B"));

        g.add_edge(&a, "Base", &b);
        assert!(g.is_symmetric());
        assert_eq!(g.reference_count(&b), 1);
        assert_eq!(g.forward_of(&a).len(), 1);
        assert_eq!(g.backward_of(&b).len(), 1);

        assert!(g.remove_edge(&a, "Base", &b));
        assert!(g.is_symmetric());
        assert_eq!(g.reference_count(&b), 0);
        assert!(g.backward_of(&b).is_empty());
    }

    #[test]
    fn test_remove_missing_edge_is_noop() {
        let mut g = LinkGraph::new();
        let (a, b) = (id("A"), id("B"));
        g.add_edge(&a, "Base", &b);

        assert!(!g.remove_edge(&a, "Tool", &b));
        assert!(!g.remove_edge(&b, "Base", &a));
        assert_eq!(g.edge_count(), 1);
        assert!(g.is_symmetric());
    }

    #[test]
    fn test_duplicate_edges_counted_per_occurrence() {
        let mut g = LinkGraph::new();
        let (a, b) = (id("A"), id("B"));
        g.add_edge(&a, "Items", &b);
        g.add_edge(&a, "Items", &b);
        assert_eq!(g.reference_count(&b), 2);

        assert!(g.remove_edge(&a, "Items", &b));
        assert_eq!(g.reference_count(&b), 1);
        assert!(g.is_symmetric());
    }

    #[test]
    fn test_break_object_clears_both_directions() {
        let mut g = LinkGraph::new();
        let (a, b, c) = (id("A"), id("B"), id("C"));
        g.add_edge(&a, "Base", &b);
        g.add_edge(&c, "Tool", &a);

        let broken = g.break_object(&a);
        assert_eq!(broken.outgoing.len(), 1);
        assert_eq!(broken.incoming.len(), 1);
        assert_eq!(broken.incoming[0].other, c);

        assert_eq!(g.edge_count(), 0);
        assert_eq!(g.reference_count(&b), 0);
        assert!(g.is_symmetric());
    }

    #[test]
    fn test_check_reports_dangling() {
        let mut g = LinkGraph::new();
        let (a, b) = (id("A"), id("B"));
        g.add_edge(&a, "Base", &b);

        let live = |o: &ObjectId| o == &a;
        let defects = g.check(&live);
        assert_eq!(defects.len(), 1);
        assert!(matches!(
            &defects[0],
            LinkDefect::DanglingForward { target, .. } if target == &b
        ));
    }

    #[test]
    fn test_topological_order_dependencies_first() {
        let mut g = LinkGraph::new();
        let (a, b, c) = (id("A"), id("B"), id("C"));
        // B 依赖 A，C 依赖 B
        g.add_edge(&b, "Base", &a);
        g.add_edge(&c, "Base", &b);

        let topo = g.topological_order(&[c.clone(), b.clone(), a.clone()]);
        assert_eq!(topo.order, vec![a, b, c]);
        assert!(topo.cycles.is_empty());
    }

    #[test]
    fn test_topological_order_stable_for_independent_nodes() {
        let g = LinkGraph::new();
        let nodes = vec![id("X"), id("A"), id("M")];
        let topo = g.topological_order(&nodes);
        // 无依赖时保持给定（插入）顺序
        assert_eq!(topo.order, nodes);
    }

    #[test]
    fn test_cycle_detected_and_still_ordered() {
        let mut g = LinkGraph::new();
        let (a, b, c, d) = (id("A"), id("B"), id("C"), id("D"));
        g.add_edge(&a, "Base", &b);
        g.add_edge(&b, "Base", &a);
        // D 依赖循环成员 A，但自身不在循环内
        g.add_edge(&d, "Base", &a);

        let nodes = vec![a.clone(), b.clone(), c.clone(), d.clone()];
        let topo = g.topological_order(&nodes);

        // 全部节点都出现在排序里（循环不会卡死）
        assert_eq!(topo.order.len(), 4);
        assert_eq!(topo.order[0], c);
        // 循环只包含 A、B，不包含下游的 D
        assert_eq!(topo.cycles.len(), 1);
        assert_eq!(topo.cycles[0], vec![a, b]);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut g = LinkGraph::new();
        let a = id("A");
        g.add_edge(&a, "Base", &a);

        let topo = g.topological_order(&[a.clone()]);
        assert_eq!(topo.order, vec![a.clone()]);
        assert_eq!(topo.cycles, vec![vec![a]]);
    }
}
