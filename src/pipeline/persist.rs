//! Background persistence of captured frames
//!
//! Capture pushes [`FrameTask`]s into an unbounded channel and returns to the
//! trigger loop immediately; a dedicated worker thread writes them out in
//! arrival order. Shutdown is a message on the same channel, so every frame
//! queued before it is written before the worker acknowledges.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::layout::{OutputLayout, SessionId};
use super::writer::FrameWriter;
use crate::capture::FrameTask;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame queue closed")]
    Closed,
    #[error("failed to spawn persistence worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("persistence worker exited without acknowledging shutdown")]
    WorkerLost,
}

#[derive(Debug)]
pub enum PipelineMessage {
    Frame(FrameTask),
    /// No more frames follow
    Shutdown,
}

/// Producer side of the persistence channel
#[derive(Debug, Clone)]
pub struct FrameQueue {
    tx: Sender<PipelineMessage>,
}

impl FrameQueue {
    pub fn push(&self, task: FrameTask) -> Result<(), PipelineError> {
        self.tx
            .send(PipelineMessage::Frame(task))
            .map_err(|_| PipelineError::Closed)
    }

    /// Messages not yet picked up by the worker
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Unbounded frame channel
pub fn channel() -> (FrameQueue, Receiver<PipelineMessage>) {
    let (tx, rx) = flume::unbounded();
    (FrameQueue { tx }, rx)
}

#[derive(Default)]
struct Counters {
    persisted: AtomicU64,
    failed: AtomicU64,
}

#[derive(Default)]
pub struct PipelineStats {
    counters: CachePadded<Counters>,
}

impl PipelineStats {
    pub fn persisted(&self) -> u64 {
        self.counters.persisted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

/// Sent by the worker once the queue is empty and it is about to exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub session: SessionId,
    pub persisted: u64,
    pub failed: u64,
}

pub struct PersistencePipeline<W> {
    rx: Receiver<PipelineMessage>,
    writer: W,
    layout: OutputLayout,
    stats: Arc<PipelineStats>,
}

impl<W: FrameWriter + 'static> PersistencePipeline<W> {
    /// Start the worker thread
    pub fn spawn(writer: W, layout: OutputLayout) -> Result<PipelineHandle, PipelineError> {
        let (queue, rx) = channel();
        let (ack_tx, ack_rx) = flume::bounded(1);
        let stats = Arc::new(PipelineStats::default());

        let worker = Self {
            rx,
            writer,
            layout: layout.clone(),
            stats: stats.clone(),
        };

        thread::Builder::new()
            .name("synccap-persist".into())
            .spawn(move || {
                let report = worker.run();
                // Nobody waiting means the handle was dropped without shutdown
                let _ = ack_tx.send(report);
            })
            .map_err(PipelineError::Spawn)?;

        info!(
            session = %layout.session(),
            dir = %layout.session_dir().display(),
            "Persistence pipeline started"
        );

        Ok(PipelineHandle {
            queue,
            ack: ack_rx,
            stats,
            layout,
        })
    }

    fn run(mut self) -> DrainReport {
        while let Ok(message) = self.rx.recv() {
            match message {
                PipelineMessage::Frame(task) => self.persist(&task),
                PipelineMessage::Shutdown => break,
            }
        }

        // Frames that raced the shutdown message
        let stragglers: Vec<FrameTask> = self
            .rx
            .try_iter()
            .filter_map(|message| match message {
                PipelineMessage::Frame(task) => Some(task),
                PipelineMessage::Shutdown => None,
            })
            .collect();
        for task in &stragglers {
            self.persist(task);
        }

        let report = DrainReport {
            session: self.layout.session().clone(),
            persisted: self.stats.persisted(),
            failed: self.stats.failed(),
        };
        info!(
            persisted = report.persisted,
            failed = report.failed,
            "Persistence queue drained"
        );
        report
    }

    fn persist(&mut self, task: &FrameTask) {
        let path = self.layout.frame_path(task.batch, &task.serial);

        match self.writer.save(task, &path) {
            Ok(()) => {
                self.stats.counters.persisted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("synccap_frames_persisted_total").increment(1);
                debug!(path = %path.display(), "frame persisted");
            }
            Err(e) => {
                self.stats.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("synccap_persist_failures_total").increment(1);
                error!(
                    batch = task.batch,
                    serial = %task.serial,
                    "failed to persist frame: {}",
                    e
                );
            }
        }
    }
}

/// Owner-side handle of a running pipeline
pub struct PipelineHandle {
    queue: FrameQueue,
    ack: Receiver<DrainReport>,
    stats: Arc<PipelineStats>,
    layout: OutputLayout,
}

impl PipelineHandle {
    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn session(&self) -> &SessionId {
        self.layout.session()
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Signal end of input and wait until every queued frame is written
    pub async fn shutdown(self) -> Result<DrainReport, PipelineError> {
        info!(pending = self.queue.pending(), "Draining persistence queue");

        if self.queue.tx.send(PipelineMessage::Shutdown).is_err() {
            warn!("persistence worker already gone");
        }
        drop(self.queue);

        self.ack
            .recv_async()
            .await
            .map_err(|_| PipelineError::WorkerLost)
    }
}
