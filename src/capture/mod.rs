pub mod frame;
pub mod scheduler;
pub mod sync;

pub use frame::{FrameMetadata, FrameTask};
pub use scheduler::{
    fire_cameras, CaptureError, CaptureFailure, CycleReport, TriggerError, TriggerTiming,
};
pub use sync::{SyncReport, SyncWaiter};
