use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// 引擎配置（可从 TOML 加载，缺省字段走 Default）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// None 表示自适应（按 CPU 与负载推算）
    pub parallelism: Option<usize>,
    /// job 级临时 shuffle 目录：job 开始前与结束后各删除一次
    pub shuffle_dir: PathBuf,
    /// 本地 shuffle 服务监听地址
    pub shuffle_bind: String,
    /// 额外的远端 shuffle 服务（集群成员发现不在本 crate 内）
    pub remote_endpoints: Vec<SocketAddr>,
    pub connect_timeout_ms: u64,
    pub connect_poll_interval_ms: u64,
    /// 每个连接的接收帧队列容量（背压上限）
    pub frame_queue_capacity: usize,
    /// 服务端每批写多少帧后插入一个 -1 停止标记
    pub server_batch_frames: usize,
    pub io_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: None,
            shuffle_dir: std::env::temp_dir().join("mpp-rdd-shuffle"),
            shuffle_bind: "127.0.0.1:0".to_string(),
            remote_endpoints: Vec::new(),
            connect_timeout_ms: 5000,
            connect_poll_interval_ms: 10,
            frame_queue_capacity: 1024,
            server_batch_frames: 64,
            io_threads: 2,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: EngineConfig = toml::from_str(&text).map_err(|e| {
            EngineError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 默认位置：<config_dir>/mpp-rdd/config.toml；不存在则使用默认配置
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(p) if p.exists() => Self::load(&p),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mpp-rdd").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == Some(0) {
            return Err(EngineError::InvalidConfig(
                "parallelism must be > 0".to_string(),
            ));
        }
        if self.frame_queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "frame_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.server_batch_frames == 0 {
            return Err(EngineError::InvalidConfig(
                "server_batch_frames must be > 0".to_string(),
            ));
        }
        if self.connect_poll_interval_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "connect timeout and poll interval must be > 0".to_string(),
            ));
        }
        if self.io_threads == 0 {
            return Err(EngineError::InvalidConfig("io_threads must be > 0".to_string()));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.shuffle_bind.parse().map_err(|e| {
            EngineError::InvalidConfig(format!("shuffle_bind {:?}: {}", self.shuffle_bind, e))
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }
}
