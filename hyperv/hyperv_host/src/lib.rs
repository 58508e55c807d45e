// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to the Hyper-V host management layer.
//!
//! The serial console proxy and the lifecycle event dispatcher do not talk to
//! the hypervisor directly. Everything they need from it (pipe names, active
//! instances, instance UUIDs, power-state notifications), from the instance
//! filesystem layout, and from the TCP port pool is expressed by the traits in
//! this crate.

#![forbid(unsafe_code)]

pub mod config;
mod paths;
mod ports;
mod power;

pub use paths::backup_path;
pub use paths::InstanceDirLayout;
pub use paths::InstancePaths;
pub use ports::InvalidPortRange;
pub use ports::PortAllocator;
pub use ports::PortError;
pub use ports::PortPool;
pub use ports::PortRange;
pub use power::PowerState;

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// An error returned by a host management query.
#[derive(Debug, Error)]
pub enum HostError {
    /// The instance is not known to the hypervisor.
    #[error("instance {0} not found")]
    NotFound(String),
    /// Any other failure reported by the management layer.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A raw power-state notification, as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerStateEvent {
    /// The hypervisor-assigned VM identifier.
    pub instance_guid: Uuid,
    /// The raw `EnabledState` code.
    pub raw_state: u16,
    /// The VM name, which is the instance name used everywhere else.
    pub instance_name: String,
}

/// A source of power-state notifications.
pub trait PowerStateEventSource: Send {
    /// Waits up to `timeout` for the next notification.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. A zero timeout polls
    /// without blocking.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<PowerStateEvent>, HostError>;
}

/// Queries against the hypervisor management layer.
pub trait VmHost: Send + Sync {
    /// Returns the named pipe backing the instance's first serial port, or
    /// `None` if the instance has no serial port connection.
    fn serial_port_pipe(&self, instance: &str) -> Result<Option<String>, HostError>;

    /// Returns the names of all running instances.
    fn active_instances(&self) -> Result<Vec<String>, HostError>;

    /// Returns the UUID stamped on the instance when it was provisioned.
    ///
    /// `Ok(None)` means the VM exists but was not provisioned by this system.
    fn instance_uuid(&self, instance: &str) -> Result<Option<Uuid>, HostError>;

    /// Maps a raw `EnabledState` code to a canonical power state.
    fn power_state(&self, raw_state: u16) -> PowerState {
        PowerState::from_enabled_state(raw_state)
    }

    /// Subscribes to power-state modification events covering the last
    /// `timeframe`.
    fn power_state_events(
        &self,
        timeframe: Duration,
    ) -> Result<Box<dyn PowerStateEventSource>, HostError>;
}
