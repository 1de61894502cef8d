pub mod client;
pub mod frame;
pub mod layout;
pub mod server;
pub mod writer;

pub use client::{ClientOptions, HandlerState, ShuffleClientHandler, ShuffleClientManager, ShuffleRecords};
pub use frame::{BeginRequest, FrameDecoder, BATCH_STOP, END_OF_STREAM};
pub use layout::ShuffleDirGuard;
pub use server::{ShuffleServer, ShuffleServerHandle};
pub use writer::{FnPartitioner, HashPartitioner, MapStatus, Partitioner, ShuffleWriter};
