//! Host-side scheduled action command interface

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport node {node} rejected: {reason}")]
    Rejected { node: String, reason: String },
    #[error("action command not delivered: {0}")]
    Delivery(String),
}

/// Addressing shared by the host and every camera that should react to a fire command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionKeys {
    pub device_key: u32,
    pub group_key: u32,
    pub group_mask: u32,
    pub target_address: Ipv4Addr,
}

impl Default for ActionKeys {
    fn default() -> Self {
        Self {
            device_key: 1,
            group_key: 1,
            group_mask: 1,
            target_address: Ipv4Addr::BROADCAST,
        }
    }
}

/// Transport layer able to broadcast a scheduled action command
#[cfg_attr(test, mockall::automock)]
pub trait ActionTransport: Send {
    fn set_action_keys(&mut self, keys: &ActionKeys) -> Result<(), TransportError>;

    /// Absolute device clock time (ticks) at which the next fire executes
    fn set_execute_time(&mut self, ticks: u64) -> Result<(), TransportError>;

    fn fire(&mut self) -> Result<(), TransportError>;
}
