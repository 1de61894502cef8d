use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::core::operator::OperatorId;
use crate::core::stage::StageId;
use crate::error::{EngineError, Result};
use crate::shuffle::client::{ClientOptions, ShuffleClientManager};

/// 每个 worker 线程一份的 shuffle 会话
///
/// 首次读取 shuffle 时才建立连接，之后该线程在整个 job 内复用同一个 manager。
/// 由执行器创建并显式传入任务闭包，不依赖线程局部变量。
pub struct ShuffleSession {
    runtime: Handle,
    endpoints: Arc<Vec<SocketAddr>>,
    options: ClientOptions,
    client: RefCell<Option<ShuffleClientManager>>,
}

impl ShuffleSession {
    pub fn new(
        runtime: Handle,
        endpoints: Arc<Vec<SocketAddr>>,
        options: ClientOptions,
    ) -> Self {
        Self {
            runtime,
            endpoints,
            options,
            client: RefCell::new(None),
        }
    }

    /// 幂等：已建立则直接返回现有 manager
    pub fn client(&self) -> Result<RefMut<'_, ShuffleClientManager>> {
        let mut slot = self.client.try_borrow_mut().map_err(|_| {
            EngineError::transport("local", "shuffle client is busy with another read")
        })?;
        if slot.is_none() {
            *slot = Some(ShuffleClientManager::start(
                &self.runtime,
                &self.endpoints,
                &self.options,
            )?);
        }
        RefMut::filter_map(slot, |s| s.as_mut())
            .map_err(|_| EngineError::transport("local", "shuffle client unavailable"))
    }

    pub fn close(&self) {
        if let Ok(mut slot) = self.client.try_borrow_mut() {
            if let Some(mut mgr) = slot.take() {
                mgr.close();
            }
        }
    }
}

/// 任务上下文：stage id + 可读取的上游 stage id（每次任务调用新建，算子只读）
pub struct TaskContext<'a> {
    stage_id: StageId,
    dependencies: Arc<[StageId]>,
    /// ShuffleMap 算子 id -> 物化它的 stage id（即 shuffle id）
    shuffle_sources: Arc<HashMap<OperatorId, StageId>>,
    session: Option<&'a ShuffleSession>,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        stage_id: StageId,
        dependencies: Arc<[StageId]>,
        shuffle_sources: Arc<HashMap<OperatorId, StageId>>,
    ) -> Self {
        Self {
            stage_id,
            dependencies,
            shuffle_sources,
            session: None,
        }
    }

    /// 没有上游 shuffle 的上下文（纯窄依赖 stage / 测试）
    pub fn standalone(stage_id: StageId) -> Self {
        Self::new(stage_id, Arc::from(Vec::new()), Arc::new(HashMap::new()))
    }

    pub fn with_session(mut self, session: &'a ShuffleSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn stage_id(&self) -> StageId {
        self.stage_id
    }

    pub fn dependencies(&self) -> &[StageId] {
        &self.dependencies
    }

    pub fn session(&self) -> Result<&'a ShuffleSession> {
        self.session.ok_or_else(|| {
            EngineError::transport("local", "task has no shuffle session")
        })
    }

    pub fn shuffle_id_of(&self, map_operator: OperatorId) -> Result<StageId> {
        self.shuffle_sources.get(&map_operator).copied().ok_or_else(|| {
            EngineError::Planning(format!(
                "stage {} has no dependency producing shuffle for operator {}",
                self.stage_id, map_operator
            ))
        })
    }
}
