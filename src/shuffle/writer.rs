use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::shuffle::frame::write_frame;
use crate::shuffle::layout::map_output_path;

/// key -> reduce id
pub trait Partitioner<K>: Send + Sync {
    fn num_partitions(&self) -> usize;
    fn partition(&self, key: &K) -> Result<u32>;
}

/// 对编码后的 key 字节做 xxh3，再对 reduce 数取模（与进程、平台无关）
pub struct HashPartitioner<K> {
    partitions: usize,
    _marker: PhantomData<fn(&K)>,
}

impl<K> HashPartitioner<K> {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            _marker: PhantomData,
        }
    }
}

impl<K: Serialize> Partitioner<K> for HashPartitioner<K> {
    fn num_partitions(&self) -> usize {
        self.partitions
    }

    fn partition(&self, key: &K) -> Result<u32> {
        let bytes = bincode::serialize(key)?;
        let h = xxhash_rust::xxh3::xxh3_64(&bytes);
        Ok((h % self.partitions as u64) as u32)
    }
}

/// 用闭包决定 reduce id，结果对分区数取模
pub struct FnPartitioner<K, F> {
    partitions: usize,
    f: F,
    _marker: PhantomData<fn(&K)>,
}

impl<K, F> FnPartitioner<K, F>
where
    F: Fn(&K) -> u64 + Send + Sync,
{
    pub fn new(partitions: usize, f: F) -> Self {
        Self {
            partitions: partitions.max(1),
            f,
            _marker: PhantomData,
        }
    }
}

impl<K, F> Partitioner<K> for FnPartitioner<K, F>
where
    F: Fn(&K) -> u64 + Send + Sync,
{
    fn num_partitions(&self) -> usize {
        self.partitions
    }

    fn partition(&self, key: &K) -> Result<u32> {
        Ok(((self.f)(key) % self.partitions as u64) as u32)
    }
}

/// 一个 map 任务的输出概况
#[derive(Clone, Debug, Default)]
pub struct MapStatus {
    pub shuffle_id: u32,
    pub map_partition: usize,
    pub records_per_reduce: Vec<u64>,
    pub bytes_written: u64,
}

impl MapStatus {
    pub fn records(&self) -> u64 {
        self.records_per_reduce.iter().sum()
    }
}

/// map 端 shuffle 输出：每个 reduce id 一个帧文件
pub struct ShuffleWriter {
    root: PathBuf,
}

impl ShuffleWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// buckets[reduce_id] 为该 reduce 的已编码记录；空 bucket 不落盘
    pub fn write_map_output(
        &self,
        shuffle_id: u32,
        map_partition: usize,
        buckets: &[Vec<Vec<u8>>],
    ) -> Result<MapStatus> {
        let mut status = MapStatus {
            shuffle_id,
            map_partition,
            records_per_reduce: vec![0; buckets.len()],
            bytes_written: 0,
        };

        for (reduce_id, records) in buckets.iter().enumerate() {
            if records.is_empty() {
                continue;
            }
            let reduce_id = u32::try_from(reduce_id).map_err(|_| {
                EngineError::InvalidConfig(format!("reduce id {reduce_id} out of range"))
            })?;
            let path = map_output_path(&self.root, shuffle_id, map_partition, reduce_id);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = BufWriter::new(File::create(&path)?);
            for payload in records {
                write_frame(&mut out, payload)?;
                status.bytes_written += 4 + payload.len() as u64;
            }
            out.flush()?;
            status.records_per_reduce[reduce_id as usize] = records.len() as u64;
        }

        tracing::debug!(
            "shuffle {} map {} wrote {} records ({} bytes)",
            shuffle_id,
            map_partition,
            status.records(),
            status.bytes_written
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle::frame::split_frames;
    use crate::shuffle::layout::map_outputs_for_reduce;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("mpp-rdd-writer-{}-{}", tag, nanos))
    }

    #[test]
    fn hash_partitioner_is_stable_and_in_range() {
        let p = HashPartitioner::<String>::new(7);
        for k in ["a", "b", "longer key", ""] {
            let a = p.partition(&k.to_string()).unwrap();
            let b = p.partition(&k.to_string()).unwrap();
            assert_eq!(a, b);
            assert!(a < 7);
        }
    }

    #[test]
    fn writes_one_file_per_non_empty_bucket() {
        let root = unique_tmp_dir("buckets");
        let writer = ShuffleWriter::new(&root);

        let buckets = vec![vec![b"x".to_vec(), b"yy".to_vec()], vec![], vec![b"z".to_vec()]];
        let status = writer.write_map_output(4, 1, &buckets).unwrap();
        assert_eq!(status.records_per_reduce, vec![2, 0, 1]);
        assert_eq!(status.bytes_written, 4 + 1 + 4 + 2 + 4 + 1);

        let files = map_outputs_for_reduce(&root, 4, 0).unwrap();
        assert_eq!(files.len(), 1);
        let bytes = std::fs::read(&files[0]).unwrap();
        assert_eq!(split_frames(&bytes).unwrap(), vec![&b"x"[..], &b"yy"[..]]);
        assert!(map_outputs_for_reduce(&root, 4, 1).unwrap().is_empty());

        let _ = std::fs::remove_dir_all(root);
    }
}
