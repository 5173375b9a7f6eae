use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

use crate::device::{Buffer, PixelFormat};

/// A captured frame on its way to storage
///
/// Owns a copy of the device buffer, so the device may reuse its memory
/// as soon as the task exists.
#[derive(Debug, Clone)]
pub struct FrameTask {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Trigger cycle this frame belongs to
    pub batch: u32,

    /// Serial of the camera that produced it
    pub serial: String,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Host time the frame left the device
    pub captured_at: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: u64,
}

impl FrameTask {
    pub fn copy_of(buffer: &Buffer, batch: u32, serial: &str) -> Self {
        Self {
            data: Bytes::copy_from_slice(&buffer.data),
            batch,
            serial: serial.to_owned(),
            meta: Arc::new(FrameMetadata {
                frame_id: buffer.frame_id,
                width: buffer.width,
                height: buffer.height,
                format: buffer.format,
                device_timestamp: buffer.timestamp,
            }),
            captured_at: Instant::now(),
        }
    }
}
