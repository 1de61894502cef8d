use serde::{Deserialize, Serialize};

/// 分区：一个 stage 内并行工作的单位（仅是下标，分区数在建图时固定）
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    index: usize,
}

impl Partition {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn range(count: usize) -> Vec<Partition> {
        (0..count).map(Partition::new).collect()
    }
}
