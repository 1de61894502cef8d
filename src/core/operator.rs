use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::codec::{Comparator, Encoder};
use crate::core::partition::Partition;
use crate::core::task::TaskContext;
use crate::error::{EngineError, Result};
use crate::shuffle::client::ShuffleRecords;
use crate::shuffle::writer::{MapStatus, Partitioner, ShuffleWriter};

static NEXT_OPERATOR_ID: AtomicUsize = AtomicUsize::new(0);

/// 算子标识：进程内唯一，建图时分配
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(usize);

impl OperatorId {
    fn next() -> Self {
        Self(NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// 算子能力集
///
/// 只有 `ShuffleMap` 是 stage 边界；`ShuffledRead` 是边界下游一侧的拉取端，
/// 和 `Narrow` 一样在所属 stage 内直接计算。
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatorKind {
    Source,
    Narrow,
    ShuffleMap,
    ShuffledRead,
}

impl OperatorKind {
    pub fn is_stage_boundary(&self) -> bool {
        matches!(self, OperatorKind::ShuffleMap)
    }
}

/// 单个分区的惰性记录流
pub type RecordIter<'a, E> = Box<dyn Iterator<Item = Result<E>> + 'a>;

/// 与记录类型无关的算子视图：建图、切 stage、调度只需要这些
pub trait OperatorBase: Send + Sync {
    fn id(&self) -> OperatorId;
    fn name(&self) -> &'static str;
    fn kind(&self) -> OperatorKind;
    fn num_partitions(&self) -> usize;
    /// 上游算子（血缘）
    fn dependencies(&self) -> Vec<Arc<dyn OperatorBase>>;

    fn as_shuffle_map(&self) -> Option<&dyn ShuffleMapTask> {
        None
    }
}

/// 产出 E 类型记录的算子
pub trait Operator<E>: OperatorBase {
    fn compute<'a>(&'a self, partition: Partition, ctx: &'a TaskContext<'a>) -> Result<RecordIter<'a, E>>;
}

/// ShuffleMap stage 的任务体：计算上游分区并按 reduce id 落盘
pub trait ShuffleMapTask: Send + Sync {
    fn reduce_partitions(&self) -> usize;
    fn run_map_task(
        &self,
        partition: Partition,
        ctx: &TaskContext<'_>,
        writer: &ShuffleWriter,
    ) -> Result<MapStatus>;
}

fn check_partition(op: &dyn OperatorBase, partition: Partition) -> Result<()> {
    if partition.index() >= op.num_partitions() {
        return Err(EngineError::Planning(format!(
            "{} {} has {} partitions, asked for {}",
            op.name(),
            op.id(),
            op.num_partitions(),
            partition.index()
        )));
    }
    Ok(())
}

/// 数据源：把内存中的集合按连续区间切成 n 个分区
pub struct ParallelizeOperator<E> {
    id: OperatorId,
    slices: Vec<Vec<E>>,
}

impl<E> ParallelizeOperator<E> {
    pub fn new(data: Vec<E>, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let len = data.len();
        let mut data = data.into_iter();
        // 分区 p 取 [p*len/n, (p+1)*len/n)
        let slices = (0..partitions)
            .map(|p| {
                let start = p * len / partitions;
                let end = (p + 1) * len / partitions;
                data.by_ref().take(end - start).collect()
            })
            .collect();
        Self {
            id: OperatorId::next(),
            slices,
        }
    }

    pub fn records(&self) -> usize {
        self.slices.iter().map(Vec::len).sum()
    }
}

impl<E: Send + Sync + 'static> OperatorBase for ParallelizeOperator<E> {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &'static str {
        "parallelize"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Source
    }

    fn num_partitions(&self) -> usize {
        self.slices.len()
    }

    fn dependencies(&self) -> Vec<Arc<dyn OperatorBase>> {
        Vec::new()
    }
}

impl<E: Clone + Send + Sync + 'static> Operator<E> for ParallelizeOperator<E> {
    fn compute<'a>(&'a self, partition: Partition, _ctx: &'a TaskContext<'a>) -> Result<RecordIter<'a, E>> {
        check_partition(self, partition)?;
        Ok(Box::new(self.slices[partition.index()].iter().cloned().map(Ok)))
    }
}

/// 逐条映射
pub struct MapOperator<I, O> {
    id: OperatorId,
    parent: Arc<dyn Operator<I>>,
    parent_base: Arc<dyn OperatorBase>,
    f: Arc<dyn Fn(I) -> O + Send + Sync>,
}

impl<I, O> MapOperator<I, O> {
    pub fn new(
        parent: Arc<dyn Operator<I>>,
        parent_base: Arc<dyn OperatorBase>,
        f: Arc<dyn Fn(I) -> O + Send + Sync>,
    ) -> Self {
        Self {
            id: OperatorId::next(),
            parent,
            parent_base,
            f,
        }
    }
}

impl<I, O> OperatorBase for MapOperator<I, O> {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &'static str {
        "map"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Narrow
    }

    fn num_partitions(&self) -> usize {
        self.parent_base.num_partitions()
    }

    fn dependencies(&self) -> Vec<Arc<dyn OperatorBase>> {
        vec![self.parent_base.clone()]
    }
}

impl<I: 'static, O: 'static> Operator<O> for MapOperator<I, O> {
    fn compute<'a>(&'a self, partition: Partition, ctx: &'a TaskContext<'a>) -> Result<RecordIter<'a, O>> {
        let f = &self.f;
        let input = self.parent.compute(partition, ctx)?;
        Ok(Box::new(input.map(move |r| r.map(|x| f(x)))))
    }
}

pub struct FilterOperator<E> {
    id: OperatorId,
    parent: Arc<dyn Operator<E>>,
    parent_base: Arc<dyn OperatorBase>,
    predicate: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> FilterOperator<E> {
    pub fn new(
        parent: Arc<dyn Operator<E>>,
        parent_base: Arc<dyn OperatorBase>,
        predicate: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    ) -> Self {
        Self {
            id: OperatorId::next(),
            parent,
            parent_base,
            predicate,
        }
    }
}

impl<E> OperatorBase for FilterOperator<E> {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &'static str {
        "filter"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Narrow
    }

    fn num_partitions(&self) -> usize {
        self.parent_base.num_partitions()
    }

    fn dependencies(&self) -> Vec<Arc<dyn OperatorBase>> {
        vec![self.parent_base.clone()]
    }
}

impl<E: 'static> Operator<E> for FilterOperator<E> {
    fn compute<'a>(&'a self, partition: Partition, ctx: &'a TaskContext<'a>) -> Result<RecordIter<'a, E>> {
        let predicate = &self.predicate;
        let input = self.parent.compute(partition, ctx)?;
        // 错误记录照常透传，交给下游终止
        Ok(Box::new(input.filter(move |r| match r {
            Ok(x) => predicate(x),
            Err(_) => true,
        })))
    }
}

pub struct FlatMapOperator<I, O> {
    id: OperatorId,
    parent: Arc<dyn Operator<I>>,
    parent_base: Arc<dyn OperatorBase>,
    f: Arc<dyn Fn(I) -> Vec<O> + Send + Sync>,
}

impl<I, O> FlatMapOperator<I, O> {
    pub fn new(
        parent: Arc<dyn Operator<I>>,
        parent_base: Arc<dyn OperatorBase>,
        f: Arc<dyn Fn(I) -> Vec<O> + Send + Sync>,
    ) -> Self {
        Self {
            id: OperatorId::next(),
            parent,
            parent_base,
            f,
        }
    }
}

impl<I, O> OperatorBase for FlatMapOperator<I, O> {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &'static str {
        "flat_map"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Narrow
    }

    fn num_partitions(&self) -> usize {
        self.parent_base.num_partitions()
    }

    fn dependencies(&self) -> Vec<Arc<dyn OperatorBase>> {
        vec![self.parent_base.clone()]
    }
}

impl<I: 'static, O: 'static> Operator<O> for FlatMapOperator<I, O> {
    fn compute<'a>(&'a self, partition: Partition, ctx: &'a TaskContext<'a>) -> Result<RecordIter<'a, O>> {
        let f = &self.f;
        let input = self.parent.compute(partition, ctx)?;
        Ok(Box::new(input.flat_map(move |r| -> Vec<Result<O>> {
            match r {
                Ok(x) => f(x).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            }
        })))
    }
}

/// 整分区变换：先物化上游分区，再整体交给 f（f 可失败）
pub struct MapPartitionsOperator<I, O> {
    id: OperatorId,
    parent: Arc<dyn Operator<I>>,
    parent_base: Arc<dyn OperatorBase>,
    f: Arc<dyn Fn(Partition, Vec<I>) -> Result<Vec<O>> + Send + Sync>,
}

impl<I, O> MapPartitionsOperator<I, O> {
    pub fn new(
        parent: Arc<dyn Operator<I>>,
        parent_base: Arc<dyn OperatorBase>,
        f: Arc<dyn Fn(Partition, Vec<I>) -> Result<Vec<O>> + Send + Sync>,
    ) -> Self {
        Self {
            id: OperatorId::next(),
            parent,
            parent_base,
            f,
        }
    }
}

impl<I, O> OperatorBase for MapPartitionsOperator<I, O> {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &'static str {
        "map_partitions"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Narrow
    }

    fn num_partitions(&self) -> usize {
        self.parent_base.num_partitions()
    }

    fn dependencies(&self) -> Vec<Arc<dyn OperatorBase>> {
        vec![self.parent_base.clone()]
    }
}

impl<I: 'static, O: 'static> Operator<O> for MapPartitionsOperator<I, O> {
    fn compute<'a>(&'a self, partition: Partition, ctx: &'a TaskContext<'a>) -> Result<RecordIter<'a, O>> {
        let input = self
            .parent
            .compute(partition, ctx)?
            .collect::<Result<Vec<I>>>()?;
        let out = (self.f)(partition, input)?;
        Ok(Box::new(out.into_iter().map(Ok)))
    }
}

/// 多个上游首尾相接：分区 i 落在第一个累计分区数超过 i 的上游
pub struct UnionOperator<E> {
    id: OperatorId,
    parents: Vec<(Arc<dyn Operator<E>>, Arc<dyn OperatorBase>)>,
}

impl<E> UnionOperator<E> {
    pub fn new(parents: Vec<(Arc<dyn Operator<E>>, Arc<dyn OperatorBase>)>) -> Self {
        Self {
            id: OperatorId::next(),
            parents,
        }
    }
}

impl<E> OperatorBase for UnionOperator<E> {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &'static str {
        "union"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Narrow
    }

    fn num_partitions(&self) -> usize {
        self.parents.iter().map(|(_, b)| b.num_partitions()).sum()
    }

    fn dependencies(&self) -> Vec<Arc<dyn OperatorBase>> {
        self.parents.iter().map(|(_, b)| b.clone()).collect()
    }
}

impl<E: 'static> Operator<E> for UnionOperator<E> {
    fn compute<'a>(&'a self, partition: Partition, ctx: &'a TaskContext<'a>) -> Result<RecordIter<'a, E>> {
        let mut index = partition.index();
        for (op, base) in &self.parents {
            let n = base.num_partitions();
            if index < n {
                return op.compute(Partition::new(index), ctx);
            }
            index -= n;
        }
        Err(EngineError::Planning(format!(
            "union {} has {} partitions, asked for {}",
            self.id,
            self.num_partitions(),
            partition.index()
        )))
    }
}

/// 重分区的 map 端：stage 边界
///
/// 按 partitioner 把 (K, V) 分桶；给了 key 比较器时桶内按 key 排序后再落盘。
/// shuffle id 取执行它的 stage id。
pub struct ShuffleMapOperator<K, V> {
    id: OperatorId,
    parent: Arc<dyn Operator<(K, V)>>,
    parent_base: Arc<dyn OperatorBase>,
    partitioner: Arc<dyn Partitioner<K>>,
    encoder: Arc<dyn Encoder<(K, V)>>,
    key_order: Option<Comparator<K>>,
}

impl<K, V> ShuffleMapOperator<K, V> {
    pub fn new(
        parent: Arc<dyn Operator<(K, V)>>,
        parent_base: Arc<dyn OperatorBase>,
        partitioner: Arc<dyn Partitioner<K>>,
        encoder: Arc<dyn Encoder<(K, V)>>,
        key_order: Option<Comparator<K>>,
    ) -> Self {
        Self {
            id: OperatorId::next(),
            parent,
            parent_base,
            partitioner,
            encoder,
            key_order,
        }
    }
}

impl<K: 'static, V: 'static> OperatorBase for ShuffleMapOperator<K, V> {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &'static str {
        "shuffle_map"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::ShuffleMap
    }

    fn num_partitions(&self) -> usize {
        self.parent_base.num_partitions()
    }

    fn dependencies(&self) -> Vec<Arc<dyn OperatorBase>> {
        vec![self.parent_base.clone()]
    }

    fn as_shuffle_map(&self) -> Option<&dyn ShuffleMapTask> {
        Some(self)
    }
}

impl<K: 'static, V: 'static> ShuffleMapTask for ShuffleMapOperator<K, V> {
    fn reduce_partitions(&self) -> usize {
        self.partitioner.num_partitions()
    }

    fn run_map_task(
        &self,
        partition: Partition,
        ctx: &TaskContext<'_>,
        writer: &ShuffleWriter,
    ) -> Result<MapStatus> {
        let reducers = self.reduce_partitions();
        let mut buckets: Vec<Vec<(K, V)>> = (0..reducers).map(|_| Vec::new()).collect();
        for record in self.parent.compute(partition, ctx)? {
            let record = record?;
            let reduce_id = self.partitioner.partition(&record.0)? as usize;
            let bucket = buckets.get_mut(reduce_id).ok_or_else(|| {
                EngineError::Planning(format!(
                    "partitioner returned reduce id {reduce_id} for {reducers} reducers"
                ))
            })?;
            bucket.push(record);
        }

        if let Some(order) = &self.key_order {
            for bucket in buckets.iter_mut() {
                sort_by_key_order(bucket, order)?;
            }
        }

        let mut encoded: Vec<Vec<Vec<u8>>> = Vec::with_capacity(reducers);
        for bucket in &buckets {
            let mut out = Vec::with_capacity(bucket.len());
            for record in bucket {
                let mut buf = Vec::new();
                self.encoder.encode(record, &mut buf)?;
                out.push(buf);
            }
            encoded.push(out);
        }
        writer.write_map_output(ctx.stage_id().get(), partition.index(), &encoded)
    }
}

/// 比较器失败时返回第一个错误，桶内顺序此时无意义
fn sort_by_key_order<K, V>(bucket: &mut [(K, V)], order: &Comparator<K>) -> Result<()> {
    let mut failure: Option<EngineError> = None;
    bucket.sort_by(|a, b| match order(&a.0, &b.0) {
        Ok(o) => o,
        Err(e) => {
            if failure.is_none() {
                failure = Some(e);
            }
            CmpOrdering::Equal
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// 重分区的 reduce 端：从所有 shuffle 服务拉取 reduce_id = 分区号 的记录
pub struct ShuffledReadOperator<K, V> {
    id: OperatorId,
    map_side: Arc<dyn OperatorBase>,
    partitions: usize,
    encoder: Arc<dyn Encoder<(K, V)>>,
}

impl<K, V> ShuffledReadOperator<K, V> {
    pub fn new(map_side: Arc<dyn OperatorBase>, partitions: usize, encoder: Arc<dyn Encoder<(K, V)>>) -> Self {
        Self {
            id: OperatorId::next(),
            map_side,
            partitions: partitions.max(1),
            encoder,
        }
    }
}

impl<K: 'static, V: 'static> OperatorBase for ShuffledReadOperator<K, V> {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &'static str {
        "shuffled_read"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::ShuffledRead
    }

    fn num_partitions(&self) -> usize {
        self.partitions
    }

    fn dependencies(&self) -> Vec<Arc<dyn OperatorBase>> {
        vec![self.map_side.clone()]
    }
}

impl<K: 'static, V: 'static> Operator<(K, V)> for ShuffledReadOperator<K, V> {
    fn compute<'a>(
        &'a self,
        partition: Partition,
        ctx: &'a TaskContext<'a>,
    ) -> Result<RecordIter<'a, (K, V)>> {
        check_partition(self, partition)?;
        let shuffle_id = ctx.shuffle_id_of(self.map_side.id())?;
        let reduce_id = u32::try_from(partition.index())
            .map_err(|_| EngineError::Planning(format!("reduce id {} out of range", partition.index())))?;
        let client = ctx.session()?.client()?;
        Ok(Box::new(ShuffleRecords::new(
            client,
            shuffle_id.get(),
            reduce_id,
            self.encoder.clone(),
        )))
    }
}

pub struct OperatorNode {
    pub op: Arc<dyn OperatorBase>,
    /// 上游节点在 arena 中的下标
    pub deps: Vec<usize>,
}

/// 算子 DAG 的 arena 表示：节点按下标寻址，依赖边是下标列表
///
/// 根（终端算子）固定在下标 0；同一算子经多条路径可达时只占一个节点。
pub struct OperatorGraph {
    nodes: Vec<OperatorNode>,
    index: HashMap<OperatorId, usize>,
}

impl OperatorGraph {
    pub fn from_terminal(root: Arc<dyn OperatorBase>) -> Self {
        let mut nodes = Vec::new();
        let mut index = HashMap::new();
        index.insert(root.id(), 0);
        nodes.push(OperatorNode {
            op: root,
            deps: Vec::new(),
        });

        let mut stack = vec![0usize];
        while let Some(i) = stack.pop() {
            let parents = nodes[i].op.dependencies();
            let mut deps = Vec::with_capacity(parents.len());
            for parent in parents {
                let j = match index.get(&parent.id()) {
                    Some(&j) => j,
                    None => {
                        let j = nodes.len();
                        index.insert(parent.id(), j);
                        nodes.push(OperatorNode {
                            op: parent,
                            deps: Vec::new(),
                        });
                        stack.push(j);
                        j
                    }
                };
                deps.push(j);
            }
            nodes[i].deps = deps;
        }
        Self { nodes, index }
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn node(&self, i: usize) -> &OperatorNode {
        &self.nodes[i]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, id: OperatorId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn shuffle_boundaries(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.op.kind().is_stage_boundary())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeEncoder;
    use crate::core::stage::StageId;
    use crate::shuffle::layout::map_outputs_for_reduce;
    use crate::shuffle::frame::split_frames;
    use crate::shuffle::writer::FnPartitioner;
    use std::path::PathBuf;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("mpp-rdd-operator-{}-{}", tag, nanos))
    }

    fn source(data: Vec<u32>, n: usize) -> (Arc<dyn Operator<u32>>, Arc<dyn OperatorBase>) {
        let op = Arc::new(ParallelizeOperator::new(data, n));
        (op.clone(), op)
    }

    fn run<E>(op: &dyn Operator<E>, p: usize) -> Vec<E> {
        let ctx = TaskContext::standalone(StageId(0));
        op.compute(Partition::new(p), &ctx)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn parallelize_splits_contiguously() {
        let op = ParallelizeOperator::new((0..10u32).collect(), 3);
        assert_eq!(op.num_partitions(), 3);
        assert_eq!(op.records(), 10);
        let all: Vec<u32> = (0..3).flat_map(|p| run(&op, p)).collect();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(run(&op, 0), vec![0, 1, 2]);
        assert_eq!(run(&op, 2), vec![6, 7, 8, 9]);

        let ctx = TaskContext::standalone(StageId(0));
        assert!(matches!(
            op.compute(Partition::new(3), &ctx),
            Err(EngineError::Planning(_))
        ));
    }

    #[test]
    fn narrow_chain_computes_per_partition() {
        let (src, base) = source((1..=6).collect(), 2);
        let doubled = Arc::new(MapOperator::new(src, base, Arc::new(|x: u32| x * 2)));
        let even_tens = FilterOperator::new(
            doubled.clone(),
            doubled.clone(),
            Arc::new(|x: &u32| *x % 4 == 0),
        );
        assert_eq!(run(&even_tens, 0), vec![4]);
        assert_eq!(run(&even_tens, 1), vec![8, 12]);
        assert_eq!(even_tens.dependencies()[0].id(), doubled.id());
    }

    #[test]
    fn map_partitions_error_surfaces_from_compute() {
        let (src, base) = source(vec![1, 2, 3], 1);
        let op = MapPartitionsOperator::new(
            src,
            base,
            Arc::new(|_p: Partition, v: Vec<u32>| -> Result<Vec<u32>> {
                if v.contains(&2) {
                    Err(EngineError::Decode("bad record".into()))
                } else {
                    Ok(v)
                }
            }),
        );
        let ctx = TaskContext::standalone(StageId(0));
        assert!(matches!(
            op.compute(Partition::new(0), &ctx),
            Err(EngineError::Decode(_))
        ));
    }

    #[test]
    fn union_addresses_parents_in_order() {
        let (a, ab) = source(vec![1, 2], 2);
        let (b, bb) = source(vec![3, 4, 5], 1);
        let u = UnionOperator::new(vec![(a, ab), (b, bb)]);
        assert_eq!(u.num_partitions(), 3);
        assert_eq!(run(&u, 1), vec![2]);
        assert_eq!(run(&u, 2), vec![3, 4, 5]);
    }

    #[test]
    fn shuffle_map_buckets_and_sorts_by_key() {
        let root = unique_tmp_dir("map");
        let src = Arc::new(ParallelizeOperator::new(
            vec![(5u32, 'a'), (2, 'b'), (4, 'c'), (1, 'd')],
            1,
        ));
        let op = ShuffleMapOperator::new(
            src.clone(),
            src,
            Arc::new(FnPartitioner::<u32, _>::new(2, |k: &u32| *k as u64)),
            Arc::new(BincodeEncoder::<(u32, char)>::new()),
            Some(crate::codec::natural_order()),
        );
        assert!(op.as_shuffle_map().is_some());
        assert_eq!(op.kind(), OperatorKind::ShuffleMap);

        let ctx = TaskContext::standalone(StageId(3));
        let writer = ShuffleWriter::new(&root);
        let status = op.run_map_task(Partition::new(0), &ctx, &writer).unwrap();
        assert_eq!(status.shuffle_id, 3);
        assert_eq!(status.records_per_reduce, vec![2, 2]);

        let enc = BincodeEncoder::<(u32, char)>::new();
        let files = map_outputs_for_reduce(&root, 3, 1).unwrap();
        let bytes = std::fs::read(&files[0]).unwrap();
        let odd: Vec<(u32, char)> = split_frames(&bytes)
            .unwrap()
            .into_iter()
            .map(|f| enc.decode(f).unwrap())
            .collect();
        assert_eq!(odd, vec![(1, 'd'), (5, 'a')]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn graph_dedups_shared_parents() {
        let (src, base) = source(vec![1, 2, 3], 1);
        let left = Arc::new(MapOperator::new(src.clone(), base.clone(), Arc::new(|x: u32| x + 1)));
        let right = Arc::new(MapOperator::new(src, base.clone(), Arc::new(|x: u32| x + 2)));
        let u = Arc::new(UnionOperator::new(vec![
            (left.clone() as Arc<dyn Operator<u32>>, left as Arc<dyn OperatorBase>),
            (right.clone() as Arc<dyn Operator<u32>>, right as Arc<dyn OperatorBase>),
        ]));

        let graph = OperatorGraph::from_terminal(u.clone());
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.node(graph.root()).op.id(), u.id());
        assert_eq!(graph.node(graph.root()).deps.len(), 2);
        let src_idx = graph.index_of(base.id()).unwrap();
        for &d in &graph.node(graph.root()).deps {
            assert_eq!(graph.node(d).deps, vec![src_idx]);
        }
        assert_eq!(graph.shuffle_boundaries(), 0);
    }
}
