//! Typed acquisition configuration applied to every camera before sync

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::camera::{Camera, DeviceError};
use super::transport::ActionKeys;

/// Pixel formats we request from the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Mono16,
    BayerRG8,
    BayerRG16,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 | PixelFormat::BayerRG8 => 1,
            PixelFormat::Mono16 | PixelFormat::BayerRG16 => 2,
            PixelFormat::Rgb8 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureAuto {
    Off,
    Once,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    SingleFrame,
    MultiFrame,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Software,
    Line0,
    Action0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSelector {
    FrameStart,
    AcquisitionStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferControlMode {
    Automatic,
    UserControlled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOperationMode {
    Continuous,
    MultiBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionStartMode {
    Normal,
    PtpSync,
}

/// Host-side stream buffer policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferHandling {
    /// Keep every frame, deliver in arrival order
    OldestFirst,
    OldestFirstOverwrite,
    NewestOnly,
}

/// Every option a camera is configured with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// `None` selects the sensor maximum
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: PixelFormat,
    pub exposure_auto: ExposureAuto,
    pub exposure_time_us: f64,
    pub acquisition_mode: AcquisitionMode,
    pub trigger_enabled: bool,
    pub trigger_source: TriggerSource,
    pub trigger_selector: TriggerSelector,
    pub action_unconditional: bool,
    pub action_selector: u32,
    pub action_device_key: u32,
    pub action_group_key: u32,
    pub action_group_mask: u32,
    pub transfer_control: TransferControlMode,
    pub transfer_operation: TransferOperationMode,
    pub ptp_enable: bool,
    pub ptp_slave_only: bool,
    pub acquisition_start: AcquisitionStartMode,
    pub buffer_handling: BufferHandling,
    /// Negotiate jumbo frames
    pub auto_packet_size: bool,
    pub packet_resend: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            pixel_format: PixelFormat::BayerRG16,
            exposure_auto: ExposureAuto::Off,
            exposure_time_us: 30_000.0,
            acquisition_mode: AcquisitionMode::Continuous,
            trigger_enabled: true,
            trigger_source: TriggerSource::Action0,
            trigger_selector: TriggerSelector::FrameStart,
            action_unconditional: true,
            action_selector: 0,
            action_device_key: 1,
            action_group_key: 1,
            action_group_mask: 1,
            transfer_control: TransferControlMode::UserControlled,
            transfer_operation: TransferOperationMode::Continuous,
            ptp_enable: true,
            ptp_slave_only: false,
            acquisition_start: AcquisitionStartMode::PtpSync,
            buffer_handling: BufferHandling::OldestFirst,
            auto_packet_size: true,
            packet_resend: true,
        }
    }
}

impl DeviceConfig {
    /// Only the first camera may become PTP master; every other one is slave-only.
    pub fn for_index(&self, index: usize) -> Self {
        Self {
            ptp_slave_only: index != 0,
            ..self.clone()
        }
    }

    /// Match the camera-side action keys to the ones the host sends with
    pub fn with_action_keys(&self, keys: &ActionKeys) -> Self {
        Self {
            action_device_key: keys.device_key,
            action_group_key: keys.group_key,
            action_group_mask: keys.group_mask,
            ..self.clone()
        }
    }
}

/// Push `config` to the camera and park its transfer engine
#[instrument(skip(camera, config), fields(serial = camera.serial()))]
pub fn apply_configuration(
    camera: &mut Camera,
    config: &DeviceConfig,
) -> Result<(), DeviceError> {
    let handle = camera.handle_mut();
    handle.configure(config)?;

    // User-controlled transfer starts stopped; each capture cycle opens it explicitly
    if config.transfer_control == TransferControlMode::UserControlled {
        handle.end_transfer()?;
    }

    debug!(slave_only = config.ptp_slave_only, "configuration applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_camera_may_be_master() {
        let base = DeviceConfig::default();

        assert!(!base.for_index(0).ptp_slave_only);
        assert!(base.for_index(1).ptp_slave_only);
        assert!(base.for_index(7).ptp_slave_only);
        assert_eq!(base.for_index(3).pixel_format, PixelFormat::BayerRG16);
    }

    #[test]
    fn test_action_keys_follow_host_keys() {
        let mut base = DeviceConfig::default();
        base.action_group_key = 9;
        let keys = ActionKeys {
            device_key: 0x11,
            group_key: 0x22,
            group_mask: 0x4,
            ..ActionKeys::default()
        };

        let config = base.with_action_keys(&keys).for_index(2);
        assert_eq!(config.action_device_key, 0x11);
        assert_eq!(config.action_group_key, 0x22);
        assert_eq!(config.action_group_mask, 0x4);
        assert!(config.ptp_slave_only);
    }

    #[test]
    fn test_defaults_arm_action_trigger() {
        let config = DeviceConfig::default();

        assert!(config.trigger_enabled);
        assert_eq!(config.trigger_source, TriggerSource::Action0);
        assert_eq!(config.acquisition_start, AcquisitionStartMode::PtpSync);
        assert_eq!(config.buffer_handling, BufferHandling::OldestFirst);
        assert_eq!(config.exposure_time_us, 30_000.0);
    }
}
