//! Session sequencing: configure, sync, stream, capture, drain
//!
//! ```text
//! Configuring -> Syncing -> Streaming -> Capturing (loop) -> Draining -> Terminated
//! ```
//!
//! Every transition is unconditional except leaving `Capturing`, which waits
//! for the operator (or an interrupt).

use std::fmt;
use std::future::Future;
use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;

use flume::Receiver;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};

use crate::capture::{fire_cameras, CycleReport, SyncReport, SyncWaiter, TriggerError};
use crate::device::{apply_configuration, ActionTransport, Camera};
use crate::pipeline::{
    DrainReport, FrameWriter, OutputLayout, PersistencePipeline, PipelineError, PipelineHandle,
    SessionId,
};
use crate::Settings;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("No cameras connected")]
    NoDevices,
    #[error("PTP sync did not settle within {0:?}")]
    SyncTimeout(Duration),
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to read operator input: {0}")]
    Input(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configuring,
    Syncing,
    Streaming,
    Capturing,
    Draining,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Orchestrator {
    cameras: Vec<Camera>,
    transport: Box<dyn ActionTransport>,
    settings: Settings,
    state: SessionState,
    next_batch: u32,
    pipeline: Option<PipelineHandle>,
}

impl Orchestrator {
    /// Take ownership of the fleet. An empty fleet is the one fatal condition.
    pub fn new(
        cameras: Vec<Camera>,
        transport: Box<dyn ActionTransport>,
        settings: Settings,
    ) -> Result<Self, FleetError> {
        if cameras.is_empty() {
            return Err(FleetError::NoDevices);
        }
        info!("Found and connected to {} cameras", cameras.len());

        Ok(Self {
            cameras,
            transport,
            settings,
            state: SessionState::Configuring,
            next_batch: 0,
            pipeline: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    /// Batch index the next trigger will use
    pub fn next_batch(&self) -> u32 {
        self.next_batch
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.pipeline.as_ref().map(PipelineHandle::session)
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "session state");
        self.state = next;
    }

    fn expect_state(&self, expected: SessionState, action: &'static str) -> Result<(), FleetError> {
        if self.state != expected {
            return Err(FleetError::InvalidState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Apply the device configuration and the host action keys.
    ///
    /// Returns the serials that rejected their configuration; they stay in the fleet.
    pub fn configure(&mut self) -> Vec<String> {
        info!("Configuring cameras...");

        let base = self.settings.device.with_action_keys(&self.settings.action);
        let mut rejected = Vec::new();
        for camera in self.cameras.iter_mut() {
            let config = base.for_index(camera.index());
            if let Err(e) = apply_configuration(camera, &config) {
                warn!(serial = camera.serial(), "configuration failed: {}", e);
                rejected.push(camera.serial().to_owned());
            }
        }

        if let Err(e) = self.transport.set_action_keys(&self.settings.action) {
            error!("failed to set action command keys: {}", e);
        }

        info!(
            configured = self.cameras.len() - rejected.len(),
            rejected = rejected.len(),
            "Configuration done"
        );
        rejected
    }

    /// Wait for a single PTP master, bounded by `sync.timeout_ms` when set
    pub async fn synchronize(&mut self) -> Result<SyncReport, FleetError> {
        self.transition(SessionState::Syncing);

        let waiter = SyncWaiter::new(self.settings.sync.poll_interval());
        match self.settings.sync.timeout() {
            Some(limit) => tokio::time::timeout(limit, waiter.wait(&self.cameras))
                .await
                .map_err(|_| FleetError::SyncTimeout(limit)),
            None => Ok(waiter.wait(&self.cameras).await),
        }
    }

    /// Start every stream. Returns the serials left unstreamed.
    pub fn start_streams(&mut self) -> Vec<String> {
        self.transition(SessionState::Streaming);
        info!("Starting streams...");

        let mut unstreamed = Vec::new();
        for camera in self.cameras.iter_mut() {
            if let Err(e) = camera.handle_mut().start_stream() {
                error!(
                    target: "synccap::stream_start",
                    serial = camera.serial(),
                    "* stream not started: {}",
                    e
                );
                unstreamed.push(camera.serial().to_owned());
            }
        }
        unstreamed
    }

    /// Open a new session directory and start the persistence worker
    pub fn start_pipeline<W>(&mut self, writer: W) -> Result<(), FleetError>
    where
        W: FrameWriter + 'static,
    {
        self.expect_state(SessionState::Streaming, "start pipeline")?;

        let layout = OutputLayout::new(self.settings.output.root.clone(), SessionId::now());
        self.pipeline = Some(PersistencePipeline::spawn(writer, layout)?);
        self.transition(SessionState::Capturing);
        Ok(())
    }

    /// Run one trigger cycle with the next batch index
    pub fn trigger(&mut self) -> Result<CycleReport, FleetError> {
        self.expect_state(SessionState::Capturing, "trigger")?;
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Err(FleetError::InvalidState {
                action: "trigger",
                state: self.state,
            });
        };

        // Consumed even if the trigger fails, so indices never repeat
        let batch = self.next_batch;
        self.next_batch += 1;

        let report = fire_cameras(
            &mut self.cameras,
            self.transport.as_mut(),
            pipeline.queue(),
            batch,
            self.settings.trigger.timing(),
        )
        .map_err(|e| {
            error!(batch, "trigger failed: {}", e);
            e
        })?;

        if !report.is_complete() {
            let missing: Vec<&str> = report.failed_serials().collect();
            warn!(batch, ?missing, "partial batch");
        }
        Ok(report)
    }

    /// Trigger on each line received, stop on `q` or once every sender is gone
    pub async fn capture_loop(&mut self, input: &Receiver<String>) -> Result<u32, FleetError> {
        let mut triggered = 0;

        loop {
            println!("Press enter to capture, or q then enter to exit");

            let Ok(line) = input.recv_async().await else {
                info!("input closed");
                break;
            };
            if line == "q" {
                break;
            }

            match self.trigger_blocking() {
                Ok(_) | Err(FleetError::Trigger(_)) => triggered += 1,
                Err(e) => return Err(e),
            }
        }

        Ok(triggered)
    }

    // Capture cycles block and are never cancelled halfway.
    // block_in_place panics on a current-thread runtime.
    fn trigger_blocking(&mut self) -> Result<CycleReport, FleetError> {
        match Handle::current().runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| self.trigger()),
            _ => self.trigger(),
        }
    }

    /// Drain the pipeline, then stop and release every camera
    pub async fn shutdown(&mut self) -> Result<Option<DrainReport>, FleetError> {
        if self.state == SessionState::Terminated {
            return Err(FleetError::InvalidState {
                action: "shut down",
                state: self.state,
            });
        }
        self.transition(SessionState::Draining);

        let drained = match self.pipeline.take() {
            Some(pipeline) => pipeline.shutdown().await.map(Some),
            None => Ok(None),
        };

        for camera in self.cameras.iter_mut() {
            let handle = camera.handle_mut();
            if let Err(e) = handle.execute_command("AcquisitionStop") {
                debug!(serial = handle.serial(), "acquisition stop: {}", e);
            }
            handle.release();
        }

        self.transition(SessionState::Terminated);
        if let Ok(Some(report)) = &drained {
            info!(
                session = %report.session,
                persisted = report.persisted,
                failed = report.failed,
                "Session finished"
            );
        }
        Ok(drained?)
    }

    /// Whole session: configure, sync, stream, capture until `q` or `interrupt`, drain
    pub async fn run<W, I>(
        &mut self,
        writer: W,
        input: Receiver<String>,
        interrupt: I,
    ) -> Result<Option<DrainReport>, FleetError>
    where
        W: FrameWriter + 'static,
        I: Future<Output = ()>,
    {
        tokio::pin!(interrupt);

        self.configure();

        let synced = tokio::select! {
            result = self.synchronize() => Some(result),
            _ = &mut interrupt => None,
        };
        match synced {
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                self.shutdown().await?;
                return Err(e);
            }
            None => {
                info!("interrupted while waiting for sync");
                return self.shutdown().await;
            }
        }

        self.start_streams();
        if let Err(e) = self.start_pipeline(writer) {
            self.shutdown().await?;
            return Err(e);
        }

        let captured = tokio::select! {
            result = self.capture_loop(&input) => result.map(|_| ()),
            _ = &mut interrupt => {
                info!("interrupted");
                Ok(())
            }
        };

        let drained = self.shutdown().await;
        captured?;
        drained
    }
}

/// Forward stdin lines from a detached thread.
///
/// The thread is never joined: it may sit in a blocking read after the session
/// ends, and process exit takes it down.
pub fn stdin_lines() -> Result<Receiver<String>, FleetError> {
    let (tx, rx) = flume::unbounded();

    thread::Builder::new()
        .name("synccap-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("failed to read operator input: {}", e);
                        break;
                    }
                }
            }
        })
        .map_err(FleetError::Input)?;

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockActionTransport;
    use crate::sim::SimFleet;

    #[test]
    fn test_empty_fleet_is_fatal() {
        let result = Orchestrator::new(
            Vec::new(),
            Box::new(MockActionTransport::new()),
            Settings::default(),
        );
        assert!(matches!(result, Err(FleetError::NoDevices)));
    }

    #[test]
    fn test_trigger_requires_capturing_state() {
        let (cameras, transport) = SimFleet::new(&Default::default()).into_parts();
        let mut orchestrator =
            Orchestrator::new(cameras, Box::new(transport), Settings::default()).unwrap();

        let err = orchestrator.trigger().unwrap_err();
        assert!(matches!(
            err,
            FleetError::InvalidState {
                state: SessionState::Configuring,
                ..
            }
        ));
        assert_eq!(orchestrator.next_batch(), 0);
    }

    #[test]
    fn test_configure_sets_action_keys_once() {
        let (cameras, _transport) = SimFleet::new(&Default::default()).into_parts();
        let settings = Settings::default();
        let keys = settings.action;

        let mut transport = MockActionTransport::new();
        transport
            .expect_set_action_keys()
            .withf(move |k| *k == keys)
            .times(1)
            .returning(|_| Ok(()));

        let mut orchestrator = Orchestrator::new(cameras, Box::new(transport), settings).unwrap();
        assert!(orchestrator.configure().is_empty());
    }
}
