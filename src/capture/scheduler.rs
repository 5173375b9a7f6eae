//! One synchronized trigger cycle
//!
//! The first camera's latched PTP clock is the reference. A single scheduled
//! action command, timed `margin` past that reference, exposes every camera
//! sharing the action keys at the same instant. Buffers are then pulled one
//! camera at a time; a camera that fails is recorded and skipped.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::FrameTask;
use crate::device::{ActionTransport, Camera, DeviceError, TransportError};
use crate::pipeline::FrameQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerTiming {
    /// Must exceed command dispatch latency across the whole fleet
    pub margin: Duration,
    pub retrieve_timeout: Duration,
}

impl Default for TriggerTiming {
    fn default() -> Self {
        Self {
            margin: Duration::from_millis(10),
            retrieve_timeout: Duration::from_millis(500),
        }
    }
}

/// Failures that prevent the action command from being sent at all
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("no camera available as clock reference")]
    NoReference,
    #[error("failed to latch clock on {serial}: {source}")]
    Latch {
        serial: String,
        #[source]
        source: DeviceError,
    },
    #[error("failed to schedule action command: {0}")]
    Schedule(#[source] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("frame queue closed")]
    QueueClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFailure {
    pub serial: String,
    pub error: CaptureError,
}

/// Outcome of one trigger cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub batch: u32,
    /// Scheduled exposure time in device clock ticks
    pub fire_time: u64,
    /// Set when the fire command itself reported an error
    pub fire_error: Option<TransportError>,
    pub attempted: usize,
    pub failed: Vec<CaptureFailure>,
}

impl CycleReport {
    pub fn captured(&self) -> usize {
        self.attempted - self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.fire_error.is_none()
    }

    pub fn failed_serials(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.serial.as_str())
    }
}

/// Trigger every camera at once and queue one frame per camera that delivered
#[instrument(skip(cameras, transport, queue, timing))]
pub fn fire_cameras(
    cameras: &mut [Camera],
    transport: &mut dyn ActionTransport,
    queue: &FrameQueue,
    batch: u32,
    timing: TriggerTiming,
) -> Result<CycleReport, TriggerError> {
    let started = Instant::now();

    let reference = cameras.first_mut().ok_or(TriggerError::NoReference)?;
    let latched = reference
        .handle_mut()
        .latch_clock()
        .map_err(|source| TriggerError::Latch {
            serial: reference.serial().to_owned(),
            source,
        })?;

    let fire_time = latched.saturating_add(timing.margin.as_nanos() as u64);
    transport
        .set_execute_time(fire_time)
        .map_err(TriggerError::Schedule)?;

    // Past this point the command may be on the wire, so every camera gets a retrieval attempt
    let fire_error = transport.fire().err();
    if let Some(e) = &fire_error {
        warn!(fire_time, "fire command reported an error: {}", e);
    }

    info!(fire_time, "Retrieving images...");

    let mut failed = Vec::new();
    for camera in cameras.iter_mut() {
        let outcome = retrieve(camera, batch, timing.retrieve_timeout)
            .map_err(CaptureError::from)
            .and_then(|task| queue.push(task).map_err(|_| CaptureError::QueueClosed));

        match outcome {
            Ok(()) => {
                debug!(serial = camera.serial(), "frame queued");
                metrics::counter!("synccap_frames_captured_total").increment(1);
            }
            Err(error) => {
                warn!(serial = camera.serial(), "capture failed: {}", error);
                metrics::counter!("synccap_capture_failures_total").increment(1);
                failed.push(CaptureFailure {
                    serial: camera.serial().to_owned(),
                    error,
                });
            }
        }
    }

    metrics::histogram!("synccap_cycle_seconds").record(started.elapsed().as_secs_f64());

    let report = CycleReport {
        batch,
        fire_time,
        fire_error,
        attempted: cameras.len(),
        failed,
    };
    info!(
        captured = report.captured(),
        attempted = report.attempted,
        "batch {} done",
        batch
    );
    Ok(report)
}

/// Pull a single buffer, copy it out and hand the device memory back
fn retrieve(camera: &mut Camera, batch: u32, timeout: Duration) -> Result<FrameTask, DeviceError> {
    let serial = camera.serial().to_owned();
    let handle = camera.handle_mut();

    handle.begin_transfer()?;

    let buffer = match handle.get_buffer(timeout) {
        Ok(buffer) => buffer,
        Err(e) => {
            if let Err(stop) = handle.end_transfer() {
                debug!(serial, "transfer stop after failed retrieval: {}", stop);
            }
            return Err(e);
        }
    };

    let stopped = handle.end_transfer();
    let task = FrameTask::copy_of(&buffer, batch, &serial);
    let requeued = handle.requeue_buffer(buffer);

    stopped?;
    requeued?;
    Ok(task)
}
