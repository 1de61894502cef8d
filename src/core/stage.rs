use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::operator::{OperatorBase, OperatorGraph, OperatorId};
use crate::core::partition::Partition;
use crate::error::{EngineError, Result};

/// stage 标识；ShuffleMap stage 的 id 同时也是它产出的 shuffle id
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub u32);

impl StageId {
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageKind {
    ShuffleMap,
    Result,
}

/// 无内部 shuffle 边界的一段算子子图，以分区为单位并行执行
#[derive(Clone)]
pub struct Stage {
    id: StageId,
    kind: StageKind,
    final_operator: Arc<dyn OperatorBase>,
    partitions: Vec<Partition>,
}

impl Stage {
    pub fn new(id: StageId, kind: StageKind, final_operator: Arc<dyn OperatorBase>) -> Self {
        let partitions = Partition::range(final_operator.num_partitions());
        Self {
            id,
            kind,
            final_operator,
            partitions,
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn final_operator(&self) -> &Arc<dyn OperatorBase> {
        &self.final_operator
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("final_operator", &self.final_operator.name())
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

/// 切分结果：stage -> 依赖的 stage id，按发现顺序排列（result stage 在最前）
#[derive(Debug, Clone)]
pub struct StagePlan {
    entries: Vec<(Stage, Vec<StageId>)>,
}

impl StagePlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Stage, &[StageId])> {
        self.entries.iter().map(|(s, d)| (s, d.as_slice()))
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.entries.iter().find(|(s, _)| s.id == id).map(|(s, _)| s)
    }

    pub fn dependencies(&self, id: StageId) -> &[StageId] {
        self.entries
            .iter()
            .find(|(s, _)| s.id == id)
            .map(|(_, d)| d.as_slice())
            .unwrap_or(&[])
    }

    pub fn result_stage(&self) -> Option<&Stage> {
        self.entries
            .iter()
            .map(|(s, _)| s)
            .find(|s| s.kind == StageKind::Result)
    }

    /// 依赖 stage 的终端（ShuffleMap）算子 -> 该 stage id
    pub fn shuffle_sources(&self, id: StageId) -> Vec<(OperatorId, StageId)> {
        self.dependencies(id)
            .iter()
            .filter_map(|dep| self.stage(*dep).map(|s| (s.final_operator.id(), *dep)))
            .collect()
    }
}

/// 在 shuffle 边界处把算子图切成 stage
///
/// 用显式栈遍历（不递归）。栈元素带上所属 stage：遇到 ShuffleMap 依赖时
/// 分配下一个 id、记为所属 stage 的依赖，该算子及其上游归属新 stage。
/// 经多条路径可达的算子会被重复访问，每条路径各得一个 stage。
pub struct StageBuilder {
    result_id: StageId,
}

impl StageBuilder {
    pub fn new(result_id: StageId) -> Self {
        Self { result_id }
    }

    pub fn build(&self, graph: &OperatorGraph) -> Result<StagePlan> {
        if graph.is_empty() {
            return Err(EngineError::Planning("empty operator graph".into()));
        }
        let root = graph.node(graph.root()).op.clone();
        if root.kind().is_stage_boundary() {
            return Err(EngineError::Planning(format!(
                "{} {} cannot be the result of a job",
                root.name(),
                root.id()
            )));
        }

        let mut entries: Vec<(Stage, Vec<StageId>)> =
            vec![(Stage::new(self.result_id, StageKind::Result, root), Vec::new())];
        // (算子节点, 所属 stage 在 entries 中的下标)
        let mut stack: Vec<(usize, usize)> = vec![(graph.root(), 0)];
        let mut next_id = self.result_id.get();

        while let Some((i, owner)) = stack.pop() {
            for &d in &graph.node(i).deps {
                let dep = graph.node(d);
                if !dep.op.kind().is_stage_boundary() {
                    stack.push((d, owner));
                    continue;
                }
                next_id = next_id
                    .checked_add(1)
                    .ok_or_else(|| EngineError::Planning("stage id overflow".into()))?;
                let id = StageId(next_id);
                entries[owner].1.push(id);
                entries.push((Stage::new(id, StageKind::ShuffleMap, dep.op.clone()), Vec::new()));
                stack.push((d, entries.len() - 1));
            }
        }

        tracing::debug!("stage builder: {} stages", entries.len());
        Ok(StagePlan { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeEncoder;
    use crate::core::operator::{
        MapOperator, Operator, ParallelizeOperator, ShuffleMapOperator, ShuffledReadOperator,
        UnionOperator,
    };
    use crate::shuffle::writer::HashPartitioner;
    use std::collections::HashSet;

    type Op = (Arc<dyn Operator<(u32, u32)>>, Arc<dyn OperatorBase>);

    fn source(n: usize) -> Op {
        let op = Arc::new(ParallelizeOperator::new(vec![(1u32, 1u32)], n));
        (op.clone(), op)
    }

    fn shuffle(parent: Op, reducers: usize) -> Op {
        let enc = Arc::new(BincodeEncoder::<(u32, u32)>::new());
        let map_side = Arc::new(ShuffleMapOperator::new(
            parent.0,
            parent.1,
            Arc::new(HashPartitioner::<u32>::new(reducers)),
            enc.clone(),
            None,
        ));
        let read = Arc::new(ShuffledReadOperator::new(map_side, reducers, enc));
        (read.clone(), read)
    }

    fn map(parent: Op) -> Op {
        let op = Arc::new(MapOperator::new(parent.0, parent.1, Arc::new(|x: (u32, u32)| x)));
        (op.clone(), op)
    }

    fn union(a: Op, b: Op) -> Op {
        let op = Arc::new(UnionOperator::new(vec![a, b]));
        (op.clone(), op)
    }

    fn plan(op: &Op) -> StagePlan {
        let graph = OperatorGraph::from_terminal(op.1.clone());
        StageBuilder::new(StageId(0)).build(&graph).unwrap()
    }

    fn assert_well_formed(plan: &StagePlan) {
        let ids: HashSet<StageId> = plan.iter().map(|(s, _)| s.id()).collect();
        assert_eq!(ids.len(), plan.len());
        for (_, deps) in plan.iter() {
            for d in deps {
                assert!(ids.contains(d), "dangling dependency {d}");
            }
        }
        let results: Vec<_> = plan.iter().filter(|(s, _)| s.kind() == StageKind::Result).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id(), StageId(0));
    }

    #[test]
    fn no_shuffle_yields_single_result_stage() {
        let p = plan(&map(map(source(3))));
        assert_eq!(p.len(), 1);
        let result = p.result_stage().unwrap();
        assert_eq!(result.id(), StageId(0));
        assert_eq!(result.partitions().len(), 3);
        assert!(p.dependencies(StageId(0)).is_empty());
    }

    #[test]
    fn chain_of_k_shuffles_yields_k_plus_one_stages() {
        for k in 1..5 {
            let mut op = source(2);
            for _ in 0..k {
                op = map(shuffle(op, 3));
            }
            let p = plan(&op);
            assert_eq!(p.len(), k + 1);
            assert_well_formed(&p);
            assert_eq!(p.dependencies(StageId(0)), &[StageId(1)]);
            for id in 1..k as u32 {
                assert_eq!(p.dependencies(StageId(id)), &[StageId(id + 1)]);
            }
            assert!(p.dependencies(StageId(k as u32)).is_empty());
            assert_eq!(p.stage(StageId(k as u32)).unwrap().kind(), StageKind::ShuffleMap);
        }
    }

    #[test]
    fn branches_get_distinct_stages() {
        // result = union(shuffle(a), map(shuffle(shuffle(b))))
        let left = shuffle(source(2), 2);
        let right = map(shuffle(shuffle(source(4), 3), 2));
        let p = plan(&union(left, right));
        assert_eq!(p.len(), 4);
        assert_well_formed(&p);

        let root_deps = p.dependencies(StageId(0));
        assert_eq!(root_deps.len(), 2);
        let nested: Vec<_> = root_deps
            .iter()
            .filter(|d| !p.dependencies(**d).is_empty())
            .collect();
        assert_eq!(nested.len(), 1);
        let inner = p.dependencies(*nested[0]);
        assert_eq!(inner.len(), 1);
        assert_eq!(p.stage(inner[0]).unwrap().partitions().len(), 4);
    }

    #[test]
    fn shuffle_sources_point_at_map_side_operators() {
        let read = shuffle(source(2), 2);
        let map_side_id = read.1.dependencies()[0].id();
        let p = plan(&map(read));
        assert_eq!(p.shuffle_sources(StageId(0)), vec![(map_side_id, StageId(1))]);
    }

    #[test]
    fn shuffle_map_cannot_be_terminal() {
        let src = source(1);
        let map_side: Arc<dyn OperatorBase> = Arc::new(ShuffleMapOperator::new(
            src.0,
            src.1,
            Arc::new(HashPartitioner::<u32>::new(2)),
            Arc::new(BincodeEncoder::<(u32, u32)>::new()),
            None,
        ));
        let graph = OperatorGraph::from_terminal(map_side);
        assert!(matches!(
            StageBuilder::new(StageId(0)).build(&graph),
            Err(EngineError::Planning(_))
        ));
    }
}
