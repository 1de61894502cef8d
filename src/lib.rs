#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod shuffle;
pub mod stats;

pub use config::EngineConfig;
pub use core::dataset::Dataset;
pub use error::{EngineError, Result};
pub use executor::MppContext;
pub use stats::JobStats;
