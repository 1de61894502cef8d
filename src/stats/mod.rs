use std::fmt;
use std::time::Duration;

use crate::core::stage::StageId;
use crate::shuffle::writer::MapStatus;

/// 单个 job 的执行统计
#[derive(Clone, Debug, Default)]
pub struct JobStats {
    pub job_id: u32,
    pub parallelism: usize,
    /// 按执行顺序
    pub stages: Vec<StageStats>,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct StageStats {
    pub stage: StageId,
    pub tasks: usize,
    /// 仅 ShuffleMap stage 有值
    pub shuffle_records: u64,
    pub shuffle_bytes: u64,
    pub elapsed: Duration,
}

impl StageStats {
    pub fn new(stage: StageId, tasks: usize) -> Self {
        Self {
            stage,
            tasks,
            shuffle_records: 0,
            shuffle_bytes: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn add_map_output(&mut self, status: &MapStatus) {
        self.shuffle_records += status.records();
        self.shuffle_bytes += status.bytes_written;
    }
}

impl JobStats {
    pub fn tasks(&self) -> usize {
        self.stages.iter().map(|s| s.tasks).sum()
    }

    pub fn shuffle_records(&self) -> u64 {
        self.stages.iter().map(|s| s.shuffle_records).sum()
    }

    pub fn shuffle_bytes(&self) -> u64 {
        self.stages.iter().map(|s| s.shuffle_bytes).sum()
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for JobStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "job {}: {} stages, {} tasks, parallelism {}, {:.3}s",
            self.job_id,
            self.stages.len(),
            self.tasks(),
            self.parallelism,
            self.elapsed.as_secs_f64()
        )?;
        for s in &self.stages {
            writeln!(
                f,
                "  stage {:>3}: {:>5} tasks  {:>10} records  {:>10}  {:.3}s",
                s.stage,
                s.tasks,
                s.shuffle_records,
                human_bytes(s.shuffle_bytes),
                s.elapsed.as_secs_f64()
            )?;
        }
        write!(
            f,
            "  shuffle total: {} records, {}",
            self.shuffle_records(),
            human_bytes(self.shuffle_bytes())
        )
    }
}
