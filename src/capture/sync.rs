//! Barrier on PTP master election
//!
//! Master election belongs to the clock protocol; all we can do is wait
//! until the fleet agrees on exactly one master. The wait is unbounded,
//! callers that need a ceiling drop the future (e.g. `tokio::time::timeout`).

use std::time::Duration;

use tracing::{debug, info};

use crate::device::Camera;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Number of role polls it took to settle
    pub polls: u32,
    /// Serial of the elected master
    pub master: String,
}

#[derive(Debug, Clone)]
pub struct SyncWaiter {
    poll_interval: Duration,
}

impl SyncWaiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Resolve once exactly one camera reports the master role
    pub async fn wait(&self, cameras: &[Camera]) -> SyncReport {
        info!(cameras = cameras.len(), "Waiting for PTP sync...");

        let mut polls = 0u32;
        loop {
            polls += 1;

            let masters: Vec<&str> = cameras
                .iter()
                .filter(|camera| match camera.handle().clock_role() {
                    Ok(role) => role.is_master(),
                    Err(e) => {
                        debug!(serial = camera.serial(), "clock role unreadable: {}", e);
                        false
                    }
                })
                .map(Camera::serial)
                .collect();

            if let [master] = masters.as_slice() {
                info!(polls, master, "PTP sync settled");
                return SyncReport {
                    polls,
                    master: master.to_string(),
                };
            }

            debug!(polls, masters = masters.len(), "PTP not settled");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
