use thiserror::Error;

/// 引擎统一错误类型
///
/// 分类：
/// - [`EngineError::InvalidConfig`]：调用时同步抛出的配置错误（如 parallelism <= 0）
/// - [`EngineError::Transport`]：shuffle 连接/读取失败，先记录在连接 handler 上，下一次 poll 时抛给任务线程
/// - [`EngineError::TaskPanicked`]：任务闭包 panic；普通计算错误原样在 join 点上浮为 job 失败
/// - [`EngineError::TypeMismatch`] / [`EngineError::Unsupported`]：比较器遇到不同类型或不可排序的值
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// stage 图不合法（悬空依赖、环等）
    #[error("planning error: {0}")]
    Planning(String),

    #[error("shuffle transport error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("task panicked (stage {stage}, partition {partition}): {message}")]
    TaskPanicked {
        stage: u32,
        partition: usize,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn transport(endpoint: impl ToString, message: impl Into<String>) -> Self {
        EngineError::Transport {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
