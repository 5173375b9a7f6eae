//! Per-camera device handle consumed by the trigger and capture paths

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::config::{DeviceConfig, PixelFormat};

/// Failure of a single device operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("timed out after {0:?} waiting for a buffer")]
    Timeout(Duration),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("stream not started")]
    NotStreaming,
    #[error("buffer pool exhausted")]
    PoolExhausted,
    #[error("node {node} rejected: {reason}")]
    Rejected { node: String, reason: String },
    #[error("device disconnected")]
    Disconnected,
}

/// PTP port state reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRole {
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

impl ClockRole {
    pub fn is_master(self) -> bool {
        self == ClockRole::Master
    }
}

impl fmt::Display for ClockRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Device-owned frame memory
///
/// Handed out by [`CameraHandle::get_buffer`] and must go back through
/// [`CameraHandle::requeue_buffer`], otherwise the device pool shrinks.
#[derive(Debug)]
pub struct Buffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_id: u64,
    /// Device clock at exposure, in ticks
    pub timestamp: u64,
}

/// Operations the capture path needs from a camera driver
pub trait CameraHandle: Send {
    fn serial(&self) -> &str;

    fn configure(&mut self, config: &DeviceConfig) -> Result<(), DeviceError>;

    fn clock_role(&self) -> Result<ClockRole, DeviceError>;

    /// Latch the synchronized clock and return the latched value in ticks (ns)
    fn latch_clock(&mut self) -> Result<u64, DeviceError>;

    fn start_stream(&mut self) -> Result<(), DeviceError>;

    fn begin_transfer(&mut self) -> Result<(), DeviceError>;

    fn end_transfer(&mut self) -> Result<(), DeviceError>;

    fn get_buffer(&mut self, timeout: Duration) -> Result<Buffer, DeviceError>;

    fn requeue_buffer(&mut self, buffer: Buffer) -> Result<(), DeviceError>;

    fn execute_command(&mut self, name: &str) -> Result<(), DeviceError>;

    /// Release driver resources. Called once after the pipeline drained.
    fn release(&mut self) {}
}

/// A camera in the fleet
pub struct Camera {
    index: usize,
    serial: String,
    handle: Box<dyn CameraHandle>,
}

impl Camera {
    pub fn new(index: usize, handle: Box<dyn CameraHandle>) -> Self {
        let serial = handle.serial().to_owned();
        Self {
            index,
            serial,
            handle,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn handle(&self) -> &dyn CameraHandle {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> &mut dyn CameraHandle {
        self.handle.as_mut()
    }
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("index", &self.index)
            .field("serial", &self.serial)
            .finish()
    }
}
