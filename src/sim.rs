//! In-process simulated camera fleet
//!
//! Stands in for the vendor driver when no hardware is attached. Cameras
//! share one clock (an ideal PTP domain), keep a fixed buffer pool and only
//! expose on action commands whose keys match their configuration, at the
//! scheduled execute time. Faults can be injected per camera.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::device::config::TriggerSource;
use crate::device::{
    ActionKeys, ActionTransport, Buffer, Camera, CameraHandle, ClockRole, DeviceConfig,
    DeviceError, TransportError,
};
use crate::SimSettings;

/// Clock shared by every simulated camera, in nanosecond ticks
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    origin: Instant,
}

impl SimClock {
    fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    RejectConfiguration,
    RejectStreamStart,
    RejectTransferStop,
    /// Ignore every action command, so retrievals time out
    DropFrames,
    ForceRole(ClockRole),
    /// Fail every PTP status read
    UnreadableRole,
}

#[derive(Debug, Clone, Copy)]
struct Trigger {
    keys: ActionKeys,
    execute_time: u64,
}

#[derive(Debug)]
struct CameraState {
    config: DeviceConfig,
    configured: bool,
    streaming: bool,
    transfer_open: bool,
    pool: Vec<Vec<u8>>,
    pool_size: usize,
    frames_served: u64,
    role_polls: u32,
    faults: Vec<Fault>,
}

impl CameraState {
    fn has(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn forced_role(&self) -> Option<ClockRole> {
        self.faults.iter().find_map(|fault| match fault {
            Fault::ForceRole(role) => Some(*role),
            _ => None,
        })
    }
}

pub struct SimCamera {
    serial: String,
    sensor: (u32, u32),
    settle_polls: u32,
    clock: SimClock,
    triggers: Receiver<Trigger>,
    state: Arc<Mutex<CameraState>>,
}

impl SimCamera {
    fn state(&self) -> Result<MutexGuard<'_, CameraState>, DeviceError> {
        self.state.lock().map_err(|_| DeviceError::Disconnected)
    }

    /// Action commands that arrived while no stream was running
    fn discard_triggers(&self) {
        let stale = self.triggers.try_iter().count();
        if stale > 0 {
            trace!(serial = %self.serial, stale, "discarded action commands");
        }
    }

    fn accepts(&self, trigger: &Trigger) -> Result<bool, DeviceError> {
        let state = self.state()?;
        let config = &state.config;

        Ok(!state.has(Fault::DropFrames)
            && config.trigger_enabled
            && config.trigger_source == TriggerSource::Action0
            && trigger.keys.device_key == config.action_device_key
            && trigger.keys.group_key == config.action_group_key
            && trigger.keys.group_mask & config.action_group_mask != 0)
    }

    fn expose(&self, timestamp: u64) -> Result<Buffer, DeviceError> {
        let mut state = self.state()?;
        let mut data = state.pool.pop().ok_or(DeviceError::PoolExhausted)?;

        state.frames_served += 1;
        let frame_id = state.frames_served;
        let width = state.config.width.unwrap_or(self.sensor.0);
        let height = state.config.height.unwrap_or(self.sensor.1);
        let format = state.config.pixel_format;

        let len = width as usize * height as usize * format.bytes_per_pixel();
        data.clear();
        data.resize(len, frame_id as u8);

        trace!(serial = %self.serial, frame_id, "exposed");
        Ok(Buffer {
            data,
            width,
            height,
            format,
            frame_id,
            timestamp,
        })
    }
}

impl CameraHandle for SimCamera {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn configure(&mut self, config: &DeviceConfig) -> Result<(), DeviceError> {
        let mut state = self.state()?;
        if state.has(Fault::RejectConfiguration) {
            return Err(DeviceError::Rejected {
                node: "PixelFormat".into(),
                reason: "node not writable".into(),
            });
        }

        state.config = config.clone();
        state.configured = true;
        Ok(())
    }

    fn clock_role(&self) -> Result<ClockRole, DeviceError> {
        let mut state = self.state()?;
        state.role_polls += 1;

        if state.has(Fault::UnreadableRole) {
            return Err(DeviceError::Transfer("PtpStatus read failed".into()));
        }
        if let Some(role) = state.forced_role() {
            return Ok(role);
        }
        let role = if !state.config.ptp_enable {
            ClockRole::Disabled
        } else if state.role_polls <= self.settle_polls {
            ClockRole::Listening
        } else if state.config.ptp_slave_only {
            ClockRole::Slave
        } else {
            ClockRole::Master
        };
        Ok(role)
    }

    fn latch_clock(&mut self) -> Result<u64, DeviceError> {
        if !self.state()?.config.ptp_enable {
            return Err(DeviceError::Rejected {
                node: "PtpDataSetLatch".into(),
                reason: "PTP disabled".into(),
            });
        }
        Ok(self.clock.ticks())
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state()?;
        if state.has(Fault::RejectStreamStart) {
            return Err(DeviceError::Rejected {
                node: "StreamStart".into(),
                reason: "insufficient bandwidth".into(),
            });
        }
        if !state.streaming {
            self.discard_triggers();
        }
        state.streaming = true;
        Ok(())
    }

    fn begin_transfer(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state()?;
        if !state.streaming {
            self.discard_triggers();
            return Err(DeviceError::NotStreaming);
        }
        state.transfer_open = true;
        Ok(())
    }

    fn end_transfer(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state()?;
        if state.has(Fault::RejectTransferStop) {
            return Err(DeviceError::Transfer("TransferStop rejected".into()));
        }
        state.transfer_open = false;
        Ok(())
    }

    fn get_buffer(&mut self, timeout: Duration) -> Result<Buffer, DeviceError> {
        {
            let state = self.state()?;
            if !state.streaming {
                return Err(DeviceError::NotStreaming);
            }
            if !state.transfer_open {
                return Err(DeviceError::Transfer("transfer not started".into()));
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let trigger = match self.triggers.recv_timeout(remaining) {
                Ok(trigger) => trigger,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(DeviceError::Timeout(timeout));
                }
            };
            if !self.accepts(&trigger)? {
                continue;
            }

            // Exposure happens at the scheduled time, not on receipt
            let now = self.clock.ticks();
            if trigger.execute_time > now {
                thread::sleep(Duration::from_nanos(trigger.execute_time - now));
            }
            return self.expose(trigger.execute_time);
        }
    }

    fn requeue_buffer(&mut self, buffer: Buffer) -> Result<(), DeviceError> {
        let mut state = self.state()?;
        if state.pool.len() >= state.pool_size {
            return Err(DeviceError::Rejected {
                node: "StreamBuffer".into(),
                reason: "buffer does not belong to this stream".into(),
            });
        }
        state.pool.push(buffer.data);
        Ok(())
    }

    fn execute_command(&mut self, name: &str) -> Result<(), DeviceError> {
        match name {
            "TransferStart" => self.begin_transfer(),
            "TransferStop" => self.end_transfer(),
            "AcquisitionStart" => self.start_stream(),
            "AcquisitionStop" => {
                let mut state = self.state()?;
                state.streaming = false;
                state.transfer_open = false;
                Ok(())
            }
            "PtpDataSetLatch" => self.latch_clock().map(|_| ()),
            other => Err(DeviceError::Rejected {
                node: other.to_owned(),
                reason: "unknown command".into(),
            }),
        }
    }

    fn release(&mut self) {
        if let Ok(mut state) = self.state() {
            state.streaming = false;
            state.transfer_open = false;
        }
        debug!(serial = %self.serial, "released");
    }
}

/// Read-only view of a simulated camera after it was boxed into a [`Camera`]
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<CameraState>>,
}

impl SimProbe {
    fn read<T>(&self, f: impl FnOnce(&CameraState) -> T) -> Option<T> {
        self.state.lock().ok().map(|state| f(&state))
    }

    /// Buffers handed out and not yet requeued
    pub fn outstanding(&self) -> usize {
        self.read(|s| s.pool_size - s.pool.len()).unwrap_or(0)
    }

    pub fn frames_served(&self) -> u64 {
        self.read(|s| s.frames_served).unwrap_or(0)
    }

    pub fn is_configured(&self) -> bool {
        self.read(|s| s.configured).unwrap_or(false)
    }

    pub fn is_streaming(&self) -> bool {
        self.read(|s| s.streaming).unwrap_or(false)
    }

    pub fn config(&self) -> Option<DeviceConfig> {
        self.read(|s| s.config.clone())
    }
}

/// Broadcasts action commands to every simulated camera
pub struct SimTransport {
    subscribers: Vec<Sender<Trigger>>,
    keys: Option<ActionKeys>,
    execute_time: Option<u64>,
    fail_fire: bool,
}

impl ActionTransport for SimTransport {
    fn set_action_keys(&mut self, keys: &ActionKeys) -> Result<(), TransportError> {
        self.keys = Some(*keys);
        Ok(())
    }

    fn set_execute_time(&mut self, ticks: u64) -> Result<(), TransportError> {
        self.execute_time = Some(ticks);
        Ok(())
    }

    fn fire(&mut self) -> Result<(), TransportError> {
        if self.fail_fire {
            return Err(TransportError::Delivery("no route to target".into()));
        }
        let keys = self.keys.ok_or_else(|| TransportError::Rejected {
            node: "ActionCommandDeviceKey".into(),
            reason: "action keys not set".into(),
        })?;
        let execute_time = self.execute_time.ok_or_else(|| TransportError::Rejected {
            node: "ActionCommandExecuteTime".into(),
            reason: "execute time not set".into(),
        })?;

        let trigger = Trigger { keys, execute_time };
        for subscriber in &self.subscribers {
            // A released camera simply stops listening
            let _ = subscriber.send(trigger);
        }
        debug!(execute_time, targets = %keys.target_address, "action command fired");
        Ok(())
    }
}

/// A simulated fleet, assembled before handing cameras to the orchestrator
pub struct SimFleet {
    cameras: Vec<SimCamera>,
    transport: SimTransport,
    clock: SimClock,
}

impl SimFleet {
    pub fn new(settings: &SimSettings) -> Self {
        let clock = SimClock::start();
        let base = DeviceConfig::default();
        let mut subscribers = Vec::with_capacity(settings.cameras);

        let cameras = (0..settings.cameras)
            .map(|index| {
                let (tx, rx) = flume::unbounded();
                subscribers.push(tx);

                let state = CameraState {
                    config: base.for_index(index),
                    configured: false,
                    streaming: false,
                    transfer_open: false,
                    pool: vec![Vec::new(); settings.pool_size],
                    pool_size: settings.pool_size,
                    frames_served: 0,
                    role_polls: 0,
                    faults: Vec::new(),
                };
                SimCamera {
                    serial: format!("SIM{:04}", index),
                    sensor: (settings.width, settings.height),
                    settle_polls: settings.settle_polls,
                    clock,
                    triggers: rx,
                    state: Arc::new(Mutex::new(state)),
                }
            })
            .collect();

        Self {
            cameras,
            transport: SimTransport {
                subscribers,
                keys: None,
                execute_time: None,
                fail_fire: false,
            },
            clock,
        }
    }

    pub fn fault(self, index: usize, fault: Fault) -> Self {
        if let Some(camera) = self.cameras.get(index) {
            if let Ok(mut state) = camera.state.lock() {
                state.faults.push(fault);
            }
        }
        self
    }

    pub fn fail_fire(mut self) -> Self {
        self.transport.fail_fire = true;
        self
    }

    pub fn clock(&self) -> SimClock {
        self.clock
    }

    pub fn probes(&self) -> Vec<SimProbe> {
        self.cameras
            .iter()
            .map(|camera| SimProbe {
                state: camera.state.clone(),
            })
            .collect()
    }

    pub fn into_parts(self) -> (Vec<Camera>, SimTransport) {
        let cameras = self
            .cameras
            .into_iter()
            .enumerate()
            .map(|(index, camera)| Camera::new(index, Box::new(camera)))
            .collect();
        (cameras, self.transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SimSettings {
        SimSettings {
            cameras: 2,
            width: 4,
            height: 2,
            pool_size: 1,
            settle_polls: 0,
        }
    }

    #[test]
    fn test_unmatched_keys_are_ignored() {
        let fleet = SimFleet::new(&settings());
        let (mut cameras, mut transport) = fleet.into_parts();
        let camera = cameras[0].handle_mut();
        camera.start_stream().unwrap();
        camera.begin_transfer().unwrap();

        transport
            .set_action_keys(&ActionKeys {
                group_key: 9,
                ..ActionKeys::default()
            })
            .unwrap();
        transport.set_execute_time(0).unwrap();
        transport.fire().unwrap();

        let err = camera.get_buffer(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, DeviceError::Timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_pool_exhausts_without_requeue() {
        let fleet = SimFleet::new(&settings());
        let probes = fleet.probes();
        let (mut cameras, mut transport) = fleet.into_parts();
        transport.set_action_keys(&ActionKeys::default()).unwrap();
        transport.set_execute_time(0).unwrap();
        let camera = cameras[0].handle_mut();
        camera.start_stream().unwrap();
        camera.begin_transfer().unwrap();

        transport.fire().unwrap();
        let held = camera.get_buffer(Duration::from_millis(50)).unwrap();
        assert_eq!(held.data.len(), 4 * 2 * 2);
        assert_eq!(probes[0].outstanding(), 1);

        transport.fire().unwrap();
        let err = camera.get_buffer(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, DeviceError::PoolExhausted);

        camera.requeue_buffer(held).unwrap();
        assert_eq!(probes[0].outstanding(), 0);
    }

    #[test]
    fn test_only_first_camera_is_elected() {
        let (cameras, _transport) = SimFleet::new(&settings()).into_parts();

        assert_eq!(cameras[0].handle().clock_role().unwrap(), ClockRole::Master);
        assert_eq!(cameras[1].handle().clock_role().unwrap(), ClockRole::Slave);
    }

    #[test]
    fn test_commands_fired_before_streaming_are_not_exposed() {
        let fleet = SimFleet::new(&settings());
        let probes = fleet.probes();
        let (mut cameras, mut transport) = fleet.into_parts();
        transport.set_action_keys(&ActionKeys::default()).unwrap();
        transport.set_execute_time(0).unwrap();
        let camera = cameras[0].handle_mut();

        for _ in 0..3 {
            transport.fire().unwrap();
            assert_eq!(camera.begin_transfer(), Err(DeviceError::NotStreaming));
        }
        transport.fire().unwrap();

        camera.start_stream().unwrap();
        camera.begin_transfer().unwrap();
        let err = camera.get_buffer(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, DeviceError::Timeout(Duration::from_millis(20)));
        assert_eq!(probes[0].frames_served(), 0);
    }

    #[test]
    fn test_unreadable_role_is_an_error() {
        let (cameras, _transport) = SimFleet::new(&settings())
            .fault(0, Fault::UnreadableRole)
            .into_parts();

        assert!(matches!(
            cameras[0].handle().clock_role(),
            Err(DeviceError::Transfer(_))
        ));
        assert_eq!(cameras[1].handle().clock_role().unwrap(), ClockRole::Slave);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let (mut cameras, _transport) = SimFleet::new(&settings()).into_parts();

        assert!(cameras[0].handle_mut().execute_command("PtpDataSetLatch").is_ok());
        assert!(matches!(
            cameras[0].handle_mut().execute_command("SelfDestruct"),
            Err(DeviceError::Rejected { .. })
        ));
    }
}
