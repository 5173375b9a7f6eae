pub mod camera;
pub mod config;
pub mod transport;

pub use camera::{Buffer, Camera, CameraHandle, ClockRole, DeviceError};
pub use config::{apply_configuration, DeviceConfig, PixelFormat};
pub use transport::{ActionKeys, ActionTransport, TransportError};

#[cfg(test)]
pub use transport::MockActionTransport;
