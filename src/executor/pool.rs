use std::panic::{catch_unwind, AssertUnwindSafe};

use crossbeam::channel;
use parking_lot::Mutex;

use crate::core::task::ShuffleSession;
use crate::error::{EngineError, Result};

/// worker 线程私有状态：每个 pool 线程一份，任务执行时显式借给任务闭包
pub struct WorkerState {
    worker_id: usize,
    session: ShuffleSession,
    tasks_run: u64,
}

impl WorkerState {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn session(&self) -> &ShuffleSession {
        &self.session
    }
}

/// 任务结果；Err 为 panic 信息
pub type TaskOutcome<R> = std::result::Result<R, String>;

/// 固定大小的任务线程池（rayon），并发任务数 = 线程数
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: Vec<Mutex<WorkerState>>,
}

impl WorkerPool {
    pub fn new(size: usize, mut make_session: impl FnMut(usize) -> ShuffleSession) -> Result<Self> {
        if size == 0 {
            return Err(EngineError::InvalidConfig("worker pool size must be > 0".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("mpp-rdd-worker-{i}"))
            .build()
            .map_err(|e| EngineError::InvalidConfig(format!("build worker pool: {e}")))?;
        let workers = (0..size)
            .map(|worker_id| {
                Mutex::new(WorkerState {
                    worker_id,
                    session: make_session(worker_id),
                    tasks_run: 0,
                })
            })
            .collect();
        Ok(Self { pool, workers })
    }

    /// 提交 0..tasks 共 tasks 个任务并等待全部完成（屏障）；结果按任务下标排列
    ///
    /// 某个任务失败或 panic 不会中止同批的其他任务。
    pub fn run_all<R, F>(&self, tasks: usize, f: F) -> Vec<TaskOutcome<R>>
    where
        R: Send,
        F: Fn(usize, &mut WorkerState) -> R + Sync,
    {
        let (tx, rx) = channel::unbounded::<(usize, TaskOutcome<R>)>();
        let f = &f;
        let workers = &self.workers;
        self.pool.scope(|scope| {
            for index in 0..tasks {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let slot = rayon::current_thread_index().unwrap_or(0) % workers.len();
                    let mut worker = workers[slot].lock();
                    worker.tasks_run += 1;
                    let outcome = catch_unwind(AssertUnwindSafe(|| f(index, &mut worker)))
                        .map_err(|payload| panic_message(payload.as_ref()));
                    let _ = tx.send((index, outcome));
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<TaskOutcome<R>>> = (0..tasks).map(|_| None).collect();
        for (index, outcome) in rx.iter() {
            slots[index] = Some(outcome);
        }
        slots
            .into_iter()
            .map(|o| o.unwrap_or_else(|| Err("task result lost".to_string())))
            .collect()
    }

    pub fn tasks_run(&self) -> u64 {
        self.workers.iter().map(|w| w.lock().tasks_run).sum()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for w in &self.workers {
            w.lock().session.close();
        }
        tracing::debug!("worker pool ({} threads) shut down", self.workers.len());
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
