pub mod layout;
pub mod persist;
pub mod writer;

pub use layout::{OutputLayout, SessionId};
pub use persist::{
    channel, DrainReport, FrameQueue, PersistencePipeline, PipelineError, PipelineHandle,
    PipelineMessage, PipelineStats,
};
pub use writer::{FrameWriter, RawFileWriter, WriteError};
