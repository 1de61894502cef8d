use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::stage::StageId;

/// job 执行过程中的事件类型
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    JobStarted { stages: usize },
    StageSubmitted { stage: StageId, tasks: usize },
    TaskStarted { stage: StageId, partition: usize, worker: usize },
    TaskFinished { stage: StageId, partition: usize },
    TaskFailed { stage: StageId, partition: usize, message: String },
    StageCompleted { stage: StageId },
    JobFinished,
    JobFailed { message: String },
}

/// 事件记录（seq 全局单调，用于判定先后）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub seq: u64,
    pub timestamp: SystemTime,
    pub job_id: u32,
    pub kind: JobEventKind,
}

/// 追加式事件日志；任务线程并发写入
#[derive(Default)]
pub struct EventLog {
    next_seq: AtomicU64,
    events: Mutex<Vec<JobEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, job_id: u32, kind: JobEventKind) {
        // 取号与入列在同一把锁内，保证 seq 与列表顺序一致
        let mut events = self.events.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        events.push(JobEvent {
            seq,
            timestamp: SystemTime::now(),
            job_id,
            kind,
        });
    }

    pub fn snapshot(&self) -> Vec<JobEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
