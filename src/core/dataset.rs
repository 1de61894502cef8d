use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{BincodeEncoder, Comparator, Encoder};
use crate::core::operator::{
    FilterOperator, FlatMapOperator, MapOperator, MapPartitionsOperator, Operator, OperatorBase,
    OperatorId, ParallelizeOperator, ShuffleMapOperator, ShuffledReadOperator, UnionOperator,
};
use crate::core::partition::Partition;
use crate::error::Result;
use crate::shuffle::writer::{HashPartitioner, Partitioner};

/// 类型化的惰性数据集句柄（只建图，不计算）
///
/// 同时持有同一个算子的两种视图：带记录类型的 `Operator<E>` 用于计算，
/// 擦除类型的 `OperatorBase` 用于建图与切 stage。
pub struct Dataset<E> {
    op: Arc<dyn Operator<E>>,
    base: Arc<dyn OperatorBase>,
}

impl<E> Clone for Dataset<E> {
    fn clone(&self) -> Self {
        Self {
            op: self.op.clone(),
            base: self.base.clone(),
        }
    }
}

impl<E: Send + Sync + 'static> Dataset<E> {
    pub fn from_operator<O: Operator<E> + 'static>(op: O) -> Self {
        let op = Arc::new(op);
        Self {
            op: op.clone(),
            base: op,
        }
    }

    /// 类 Spark sc.parallelize
    pub fn parallelize(data: Vec<E>, partitions: usize) -> Self
    where
        E: Clone,
    {
        Self::from_operator(ParallelizeOperator::new(data, partitions))
    }

    pub fn id(&self) -> OperatorId {
        self.base.id()
    }

    pub fn num_partitions(&self) -> usize {
        self.base.num_partitions()
    }

    pub fn operator(&self) -> &Arc<dyn Operator<E>> {
        &self.op
    }

    pub fn base(&self) -> &Arc<dyn OperatorBase> {
        &self.base
    }

    pub fn map<O, F>(&self, f: F) -> Dataset<O>
    where
        O: Send + Sync + 'static,
        F: Fn(E) -> O + Send + Sync + 'static,
    {
        Dataset::from_operator(MapOperator::new(self.op.clone(), self.base.clone(), Arc::new(f)))
    }

    pub fn filter<F>(&self, predicate: F) -> Dataset<E>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Dataset::from_operator(FilterOperator::new(
            self.op.clone(),
            self.base.clone(),
            Arc::new(predicate),
        ))
    }

    pub fn flat_map<O, F>(&self, f: F) -> Dataset<O>
    where
        O: Send + Sync + 'static,
        F: Fn(E) -> Vec<O> + Send + Sync + 'static,
    {
        Dataset::from_operator(FlatMapOperator::new(self.op.clone(), self.base.clone(), Arc::new(f)))
    }

    pub fn map_partitions<O, F>(&self, f: F) -> Dataset<O>
    where
        O: Send + Sync + 'static,
        F: Fn(Partition, Vec<E>) -> Result<Vec<O>> + Send + Sync + 'static,
    {
        Dataset::from_operator(MapPartitionsOperator::new(
            self.op.clone(),
            self.base.clone(),
            Arc::new(f),
        ))
    }

    pub fn key_by<K, F>(&self, f: F) -> Dataset<(K, E)>
    where
        K: Send + Sync + 'static,
        F: Fn(&E) -> K + Send + Sync + 'static,
    {
        self.map(move |e| (f(&e), e))
    }

    pub fn union(&self, other: &Dataset<E>) -> Dataset<E> {
        Dataset::from_operator(UnionOperator::new(vec![
            (self.op.clone(), self.base.clone()),
            (other.op.clone(), other.base.clone()),
        ]))
    }
}

impl<K, V> Dataset<(K, V)>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// 重分区：插入 ShuffleMap（stage 边界）+ ShuffledRead
    ///
    /// 下游分区数等于 partitioner 的分区数；给了 key_order 时每个 map 输出桶按 key 排序。
    pub fn shuffle_with(
        &self,
        partitioner: Arc<dyn Partitioner<K>>,
        encoder: Arc<dyn Encoder<(K, V)>>,
        key_order: Option<Comparator<K>>,
    ) -> Dataset<(K, V)> {
        let reducers = partitioner.num_partitions();
        let map_side = Arc::new(ShuffleMapOperator::new(
            self.op.clone(),
            self.base.clone(),
            partitioner,
            encoder.clone(),
            key_order,
        ));
        Dataset::from_operator(ShuffledReadOperator::new(map_side, reducers, encoder))
    }
}

impl<K, V> Dataset<(K, V)>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn partition_by(&self, partitioner: Arc<dyn Partitioner<K>>) -> Dataset<(K, V)> {
        self.shuffle_with(partitioner, Arc::new(BincodeEncoder::<(K, V)>::new()), None)
    }

    pub fn partition_by_hash(&self, partitions: usize) -> Dataset<(K, V)> {
        self.partition_by(Arc::new(HashPartitioner::<K>::new(partitions)))
    }

    pub fn sorted_partition_by(
        &self,
        partitioner: Arc<dyn Partitioner<K>>,
        key_order: Comparator<K>,
    ) -> Dataset<(K, V)> {
        self.shuffle_with(
            partitioner,
            Arc::new(BincodeEncoder::<(K, V)>::new()),
            Some(key_order),
        )
    }
}
