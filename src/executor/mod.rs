pub mod pool;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Runtime;

use crate::config::EngineConfig;
use crate::core::adaptive::AdaptiveParallelism;
use crate::core::dag::GraphScheduler;
use crate::core::dataset::Dataset;
use crate::core::lineage::{EventLog, JobEvent, JobEventKind};
use crate::core::operator::{OperatorGraph, OperatorId, RecordIter};
use crate::core::partition::Partition;
use crate::core::stage::{StageBuilder, StageId, StageKind};
use crate::core::task::{ShuffleSession, TaskContext};
use crate::error::{EngineError, Result};
use crate::shuffle::client::ClientOptions;
use crate::shuffle::layout::ShuffleDirGuard;
use crate::shuffle::server::{ShuffleServer, ShuffleServerHandle};
use crate::shuffle::writer::ShuffleWriter;
use crate::stats::{JobStats, StageStats};

pub use pool::{TaskOutcome, WorkerPool, WorkerState};

/// 本地 MPP 执行上下文（driver）
///
/// 一次 `run_job`：切 stage -> 按依赖顺序逐个 stage 提交（stage 之间是同步屏障）
/// -> result stage 对每个分区执行 action，按分区号返回结果。
/// 同一个上下文上的 job 串行执行：shuffle 目录同一时刻只属于一个 job。
/// 本地 shuffle 服务随上下文创建，所有 job 共用。
pub struct MppContext {
    config: EngineConfig,
    parallelism: AtomicUsize,
    // 先于 runtime drop
    server: ShuffleServerHandle,
    runtime: Runtime,
    next_job_id: AtomicU32,
    job_lock: Mutex<()>,
    events: EventLog,
    last_stats: Mutex<Option<JobStats>>,
}

impl MppContext {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let parallelism = match config.parallelism {
            Some(n) => n,
            None => AdaptiveParallelism::new().suggest(),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name("mpp-rdd-io")
            .enable_all()
            .build()?;
        let server = ShuffleServer::spawn(
            runtime.handle(),
            config.bind_addr()?,
            config.shuffle_dir.as_path(),
            config.server_batch_frames,
        )?;
        tracing::info!(
            "mpp context ready: parallelism {}, shuffle dir {:?}",
            parallelism,
            config.shuffle_dir
        );
        Ok(Self {
            config,
            parallelism: AtomicUsize::new(parallelism),
            server,
            runtime,
            next_job_id: AtomicU32::new(0),
            job_lock: Mutex::new(()),
            events: EventLog::new(),
            last_stats: Mutex::new(None),
        })
    }

    pub fn local() -> Result<Self> {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 本地 shuffle 服务的实际监听地址
    pub fn shuffle_addr(&self) -> SocketAddr {
        self.server.addr()
    }

    pub fn set_parallelism(&self, parallelism: i32) -> Result<()> {
        if parallelism <= 0 {
            return Err(EngineError::InvalidConfig(format!(
                "parallelism > 0, your {parallelism}"
            )));
        }
        self.parallelism.store(parallelism as usize, Ordering::Relaxed);
        Ok(())
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism.load(Ordering::Relaxed)
    }

    /// 最近一个 job 的事件（按 seq 排序）
    pub fn job_events(&self) -> Vec<JobEvent> {
        self.events.snapshot()
    }

    pub fn last_job_stats(&self) -> Option<JobStats> {
        self.last_stats.lock().clone()
    }

    /// 执行 job：每个 result 分区一个 R，按分区号排列
    ///
    /// 任一任务失败则整个 job 失败，返回第一个（按分区号）观察到的错误；
    /// 无论成败，job 结束时 shuffle 目录都会被删除。
    pub fn run_job<E, R, F>(&self, dataset: &Dataset<E>, action: F) -> Result<Vec<R>>
    where
        E: Send + Sync + 'static,
        R: Send,
        F: Fn(&mut dyn Iterator<Item = E>) -> R + Sync,
    {
        let _serial = self.job_lock.lock();
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let parallelism = self.parallelism();
        tracing::info!("starting... job: {}", job_id);

        self.events.clear();
        let started = Instant::now();
        let mut stats = JobStats {
            job_id,
            parallelism,
            ..JobStats::default()
        };
        let result = ShuffleDirGuard::acquire(&self.config.shuffle_dir).and_then(|guard| {
            self.execute(job_id, parallelism, dataset, &action, &guard, &mut stats)
        });
        stats.elapsed = started.elapsed();

        match &result {
            Ok(_) => {
                self.events.record(job_id, JobEventKind::JobFinished);
                tracing::info!("job {} finished\n{}", job_id, stats);
            }
            Err(e) => {
                self.events.record(
                    job_id,
                    JobEventKind::JobFailed {
                        message: e.to_string(),
                    },
                );
                tracing::error!("job {} failed: {}", job_id, e);
            }
        }
        *self.last_stats.lock() = Some(stats);
        result
    }

    pub fn collect<E>(&self, dataset: &Dataset<E>) -> Result<Vec<E>>
    where
        E: Send + Sync + 'static,
    {
        let parts = self.run_job(dataset, |it| it.collect::<Vec<E>>())?;
        Ok(parts.into_iter().flatten().collect())
    }

    pub fn count<E>(&self, dataset: &Dataset<E>) -> Result<u64>
    where
        E: Send + Sync + 'static,
    {
        let parts = self.run_job(dataset, |it| it.count() as u64)?;
        Ok(parts.into_iter().sum())
    }

    fn execute<E, R, F>(
        &self,
        job_id: u32,
        parallelism: usize,
        dataset: &Dataset<E>,
        action: &F,
        guard: &ShuffleDirGuard,
        stats: &mut JobStats,
    ) -> Result<Vec<R>>
    where
        E: Send + Sync + 'static,
        R: Send,
        F: Fn(&mut dyn Iterator<Item = E>) -> R + Sync,
    {
        let graph = OperatorGraph::from_terminal(dataset.base().clone());
        let plan = StageBuilder::new(StageId(0)).build(&graph)?;
        let scheduler = GraphScheduler::new(&plan);
        let order = scheduler.execution_order()?;
        tracing::debug!("job {} stages:\n{}", job_id, scheduler.explain());
        self.events
            .record(job_id, JobEventKind::JobStarted { stages: plan.len() });

        let mut endpoints = vec![self.server.addr()];
        endpoints.extend(self.config.remote_endpoints.iter().copied());
        let endpoints = Arc::new(endpoints);
        let options = ClientOptions::from_config(&self.config);
        let pool = WorkerPool::new(parallelism, |_| {
            ShuffleSession::new(
                self.runtime.handle().clone(),
                endpoints.clone(),
                options.clone(),
            )
        })?;
        let writer = ShuffleWriter::new(guard.path());

        let mut results: Option<Vec<R>> = None;
        for stage_id in order {
            let stage = plan.stage(stage_id).ok_or_else(|| {
                EngineError::Planning(format!("stage {stage_id} missing from plan"))
            })?;
            let deps: Arc<[StageId]> = Arc::from(plan.dependencies(stage_id).to_vec());
            let sources: Arc<HashMap<OperatorId, StageId>> =
                Arc::new(plan.shuffle_sources(stage_id).into_iter().collect());
            let tasks = stage.partitions().len();

            tracing::info!(
                "starting... stage: {} ({:?}), tasks {}, deps {:?}",
                stage_id,
                stage.kind(),
                tasks,
                deps
            );
            self.events
                .record(job_id, JobEventKind::StageSubmitted { stage: stage_id, tasks });
            let stage_started = Instant::now();
            let mut stage_stats = StageStats::new(stage_id, tasks);

            match stage.kind() {
                StageKind::ShuffleMap => {
                    let map_task = stage.final_operator().as_shuffle_map().ok_or_else(|| {
                        EngineError::Planning(format!(
                            "stage {} ends with {} which writes no shuffle output",
                            stage_id,
                            stage.final_operator().name()
                        ))
                    })?;
                    let outcomes = pool.run_all(tasks, |index, worker| {
                        self.run_task(job_id, stage_id, index, worker, &deps, &sources, |ctx| {
                            map_task.run_map_task(Partition::new(index), ctx, &writer)
                        })
                    });
                    for status in self.join_stage(job_id, stage_id, outcomes)? {
                        stage_stats.add_map_output(&status);
                    }
                }
                StageKind::Result => {
                    let op = dataset.operator();
                    let outcomes = pool.run_all(tasks, |index, worker| {
                        self.run_task(job_id, stage_id, index, worker, &deps, &sources, |ctx| {
                            let mut records = ErrorCapture::new(op.compute(Partition::new(index), ctx)?);
                            let out = action(&mut records);
                            records.finish().map(|_| out)
                        })
                    });
                    results = Some(self.join_stage(job_id, stage_id, outcomes)?);
                }
            }

            stage_stats.elapsed = stage_started.elapsed();
            stats.stages.push(stage_stats);
            self.events
                .record(job_id, JobEventKind::StageCompleted { stage: stage_id });
        }

        results.ok_or_else(|| EngineError::Planning("job has no result stage".into()))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_task<T>(
        &self,
        job_id: u32,
        stage: StageId,
        partition: usize,
        worker: &mut WorkerState,
        deps: &Arc<[StageId]>,
        sources: &Arc<HashMap<OperatorId, StageId>>,
        body: impl FnOnce(&TaskContext<'_>) -> Result<T>,
    ) -> Result<T> {
        self.events.record(
            job_id,
            JobEventKind::TaskStarted {
                stage,
                partition,
                worker: worker.worker_id(),
            },
        );
        let ctx = TaskContext::new(stage, deps.clone(), sources.clone()).with_session(worker.session());
        let out = body(&ctx);
        match &out {
            Ok(_) => self
                .events
                .record(job_id, JobEventKind::TaskFinished { stage, partition }),
            Err(e) => self.events.record(
                job_id,
                JobEventKind::TaskFailed {
                    stage,
                    partition,
                    message: e.to_string(),
                },
            ),
        }
        out
    }

    /// 屏障之后汇总一个 stage：全部成功则按分区号返回，否则返回第一个错误
    fn join_stage<T>(
        &self,
        job_id: u32,
        stage: StageId,
        outcomes: Vec<TaskOutcome<Result<T>>>,
    ) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(outcomes.len());
        let mut first_error: Option<EngineError> = None;
        for (partition, outcome) in outcomes.into_iter().enumerate() {
            let result = outcome.unwrap_or_else(|message| {
                self.events.record(
                    job_id,
                    JobEventKind::TaskFailed {
                        stage,
                        partition,
                        message: message.clone(),
                    },
                );
                Err(EngineError::TaskPanicked {
                    stage: stage.get(),
                    partition,
                    message,
                })
            });
            match result {
                Ok(v) => values.push(v),
                Err(e) => {
                    tracing::warn!("stage {} partition {} failed: {}", stage, partition, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }
}

/// 把 `Result<E>` 流转成交给 action 的 `E` 流；遇到第一个错误即结束并记下错误
struct ErrorCapture<'a, E> {
    inner: RecordIter<'a, E>,
    error: Option<EngineError>,
}

impl<'a, E> ErrorCapture<'a, E> {
    fn new(inner: RecordIter<'a, E>) -> Self {
        Self { inner, error: None }
    }

    fn finish(self) -> Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<E> Iterator for ErrorCapture<'_, E> {
    type Item = E;

    fn next(&mut self) -> Option<E> {
        if self.error.is_some() {
            return None;
        }
        match self.inner.next()? {
            Ok(v) => Some(v),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}
