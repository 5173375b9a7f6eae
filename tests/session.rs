//! Full sessions against the simulated fleet

use std::path::Path;
use std::time::Duration;

use flume::Receiver;

use synccap::capture::CaptureError;
use synccap::device::{ClockRole, DeviceError};
use synccap::sim::{Fault, SimFleet};
use synccap::{FleetError, Orchestrator, RawFileWriter, SessionState, Settings};
use synccap::SimSettings;
use tempfile::TempDir;

fn settings(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.sync.poll_interval_ms = 5;
    settings.trigger.margin_ms = 2;
    settings.trigger.retrieve_timeout_ms = 50;
    settings.output.root = root.to_path_buf();
    settings.simulator = SimSettings {
        cameras: 3,
        width: 4,
        height: 2,
        pool_size: 2,
        settle_polls: 2,
    };
    settings
}

/// Operator input that ends after `lines`
fn operator(lines: &[&str]) -> Receiver<String> {
    let (tx, rx) = flume::unbounded();
    for line in lines {
        tx.send(line.to_string()).unwrap();
    }
    rx
}

fn orchestrator(fleet: SimFleet, settings: Settings) -> Orchestrator {
    let (cameras, transport) = fleet.into_parts();
    Orchestrator::new(cameras, Box::new(transport), settings).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_on_one_camera_keeps_session_going() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings(temp_dir.path());
    let fleet = SimFleet::new(&settings.simulator).fault(2, Fault::DropFrames);
    let probes = fleet.probes();
    let mut orchestrator = orchestrator(fleet, settings);

    let report = orchestrator
        .run(RawFileWriter, operator(&["", "", "q"]), std::future::pending())
        .await
        .unwrap()
        .expect("pipeline ran");

    assert_eq!(report.persisted, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(orchestrator.state(), SessionState::Terminated);
    assert_eq!(orchestrator.next_batch(), 2);

    let session = temp_dir.path().join(report.session.as_str());
    for scene in ["Scene_000", "Scene_001"] {
        assert!(session.join(scene).join("cam_SIM0000.raw").exists());
        assert!(session.join(scene).join("cam_SIM0001.raw").exists());
        assert!(!session.join(scene).join("cam_SIM0002.raw").exists());
    }
    assert_eq!(
        std::fs::read(session.join("Scene_001/cam_SIM0001.raw")).unwrap().len(),
        4 * 2 * 2
    );

    assert!(probes.iter().all(|p| !p.is_streaming()));
    assert!(probes.iter().all(|p| p.outstanding() == 0));
}

#[tokio::test]
async fn test_batch_indices_increase_by_one() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings(temp_dir.path());
    let fleet = SimFleet::new(&settings.simulator);
    let mut orchestrator = orchestrator(fleet, settings);

    orchestrator.configure();
    orchestrator.synchronize().await.unwrap();
    assert!(orchestrator.start_streams().is_empty());
    orchestrator.start_pipeline(RawFileWriter).unwrap();

    let batches: Vec<u32> = (0..4)
        .map(|_| orchestrator.trigger().unwrap().batch)
        .collect();
    assert_eq!(batches, vec![0, 1, 2, 3]);

    let report = orchestrator.shutdown().await.unwrap().unwrap();
    assert_eq!(report.persisted, 12);
}

#[tokio::test]
async fn test_rejected_configuration_keeps_camera_in_fleet() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings(temp_dir.path());
    let fleet = SimFleet::new(&settings.simulator).fault(1, Fault::RejectConfiguration);
    let probes = fleet.probes();
    let mut orchestrator = orchestrator(fleet, settings);

    assert_eq!(orchestrator.configure(), vec!["SIM0001".to_owned()]);
    assert_eq!(orchestrator.cameras().len(), 3);
    assert!(probes[0].is_configured());
    assert!(!probes[1].is_configured());
    assert!(probes[2].is_configured());
}

#[tokio::test]
async fn test_unstreamed_camera_misses_every_batch() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings(temp_dir.path());
    let fleet = SimFleet::new(&settings.simulator).fault(0, Fault::RejectStreamStart);
    let mut orchestrator = orchestrator(fleet, settings);

    orchestrator.configure();
    orchestrator.synchronize().await.unwrap();
    assert_eq!(orchestrator.start_streams(), vec!["SIM0000".to_owned()]);
    orchestrator.start_pipeline(RawFileWriter).unwrap();

    for _ in 0..2 {
        let report = orchestrator.trigger().unwrap();
        assert_eq!(report.captured(), 2);
        assert_eq!(report.failed[0].serial, "SIM0000");
        assert_eq!(
            report.failed[0].error,
            CaptureError::Device(DeviceError::NotStreaming)
        );
    }

    let report = orchestrator.shutdown().await.unwrap().unwrap();
    assert_eq!(report.persisted, 4);
}

#[tokio::test]
async fn test_sync_timeout_releases_devices() {
    let temp_dir = TempDir::new().unwrap();
    let mut settings = settings(temp_dir.path());
    settings.sync.timeout_ms = Some(50);
    let fleet = SimFleet::new(&settings.simulator).fault(0, Fault::ForceRole(ClockRole::Slave));
    let mut orchestrator = orchestrator(fleet, settings);

    let err = orchestrator
        .run(RawFileWriter, operator(&[""]), std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::SyncTimeout(_)));
    assert_eq!(orchestrator.state(), SessionState::Terminated);
    assert_eq!(orchestrator.next_batch(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_drains_and_terminates() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings(temp_dir.path());
    let fleet = SimFleet::new(&settings.simulator);
    let mut orchestrator = orchestrator(fleet, settings);

    // Operator never types anything
    let (_operator, input) = flume::unbounded::<String>();
    let report = orchestrator
        .run(
            RawFileWriter,
            input,
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await
        .unwrap()
        .expect("pipeline ran");

    assert_eq!(report.persisted, 0);
    assert_eq!(orchestrator.state(), SessionState::Terminated);
    assert!(orchestrator.shutdown().await.is_err());
}

#[tokio::test]
async fn test_session_runs_on_current_thread_runtime() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings(temp_dir.path());
    let fleet = SimFleet::new(&settings.simulator);
    let mut orchestrator = orchestrator(fleet, settings);

    let report = orchestrator
        .run(RawFileWriter, operator(&["", "q"]), std::future::pending())
        .await
        .unwrap()
        .expect("pipeline ran");

    assert_eq!(report.persisted, 3);
    assert_eq!(orchestrator.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_only_lowercase_q_quits() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings(temp_dir.path());
    let fleet = SimFleet::new(&settings.simulator);
    let mut orchestrator = orchestrator(fleet, settings);

    let report = orchestrator
        .run(
            RawFileWriter,
            operator(&["Q", " q", "q", ""]),
            std::future::pending(),
        )
        .await
        .unwrap()
        .expect("pipeline ran");

    assert_eq!(orchestrator.next_batch(), 2);
    assert_eq!(report.persisted, 6);
}

#[tokio::test]
async fn test_device_action_keys_follow_host_keys() {
    let temp_dir = TempDir::new().unwrap();
    let mut settings = settings(temp_dir.path());
    settings.device.action_device_key = 7;
    settings.device.action_group_key = 9;
    settings.action.group_key = 0x24;
    let expected = settings.action;
    let fleet = SimFleet::new(&settings.simulator);
    let probes = fleet.probes();
    let mut orchestrator = orchestrator(fleet, settings);

    assert!(orchestrator.configure().is_empty());
    for probe in &probes {
        let config = probe.config().unwrap();
        assert_eq!(config.action_device_key, expected.device_key);
        assert_eq!(config.action_group_key, expected.group_key);
        assert_eq!(config.action_group_mask, expected.group_mask);
    }

    orchestrator.synchronize().await.unwrap();
    assert!(orchestrator.start_streams().is_empty());
    orchestrator.start_pipeline(RawFileWriter).unwrap();
    assert!(orchestrator.trigger().unwrap().is_complete());

    let report = orchestrator.shutdown().await.unwrap().unwrap();
    assert_eq!(report.persisted, 3);
}
