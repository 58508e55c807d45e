// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Serial console proxy for Hyper-V VMs.
//!
//! Hyper-V exposes a VM's serial port as a local named pipe that accepts a
//! single reader and writer. This crate bridges that pipe to a TCP endpoint
//! so that one remote client at a time can attach to the console, and keeps
//! a rotating log of everything the VM prints.
//!
//! ```text
//! VM pipe <-> PipeBridge <-> ConsoleQueues <-> TcpRelay <-> TCP client
//! ```
//!
//! [`ConsoleRegistry`] owns one [`ConsoleHandler`] per instance and
//! serializes operations on the same instance.

#![forbid(unsafe_code)]

mod bridge;
mod console_log;
mod handler;
pub mod pipe;
mod queue;
mod registry;
mod relay;
#[cfg(test)]
mod testing;

pub use bridge::PipeBridge;
pub use console_log::ConsoleLog;
pub use handler::ConnectionInfo;
pub use handler::ConsoleHandler;
pub use queue::ByteQueue;
pub use queue::ClientSignal;
pub use queue::ConsoleQueues;
pub use registry::ConsoleRegistry;
pub use relay::TcpRelay;

use hyperv_host::config::SerialConsoleConfig;
use hyperv_host::HostError;
use hyperv_host::InstancePaths;
use hyperv_host::PortAllocator;
use hyperv_host::PortError;
use hyperv_host::VmHost;
use pipe::PipeConnector;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Size of the buffers used for pipe and socket reads.
const CONSOLE_BUFFER_SIZE: usize = 4096;

/// A console operation failure.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The instance has no serial console, or the console is not exposed
    /// over TCP.
    #[error("serial console is unavailable for instance {instance}")]
    Unavailable {
        /// The instance name.
        instance: String,
    },
    /// Reading or writing console data failed.
    #[error("console i/o failed for instance {instance}")]
    Io {
        /// The instance name.
        instance: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The host management layer failed.
    #[error("host query failed for instance {instance}")]
    Host {
        /// The instance name.
        instance: String,
        /// The underlying error.
        #[source]
        source: HostError,
    },
    /// The TCP relay could not listen.
    #[error("failed to listen on {addr} for instance {instance}")]
    Listen {
        /// The instance name.
        instance: String,
        /// The requested `host:port`.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// No TCP port could be allocated.
    #[error("failed to allocate a console port for instance {instance}")]
    PortAllocation {
        /// The instance name.
        instance: String,
        /// The underlying error.
        #[source]
        source: PortError,
    },
}

/// The collaborators and settings shared by every console handler.
#[derive(Clone)]
pub struct ConsoleContext {
    /// The hypervisor management layer.
    pub host: Arc<dyn VmHost>,
    /// Instance path resolution.
    pub paths: Arc<dyn InstancePaths>,
    /// The TCP port pool.
    pub ports: Arc<dyn PortAllocator>,
    /// Opens console pipes.
    pub pipes: Arc<dyn PipeConnector>,
    /// Serial console options.
    pub config: SerialConsoleConfig,
    /// How long to wait for a console pipe to appear.
    pub pipe_wait_timeout: Duration,
}

impl ConsoleContext {
    /// Creates a context with the default pipe wait timeout.
    pub fn new(
        host: Arc<dyn VmHost>,
        paths: Arc<dyn InstancePaths>,
        ports: Arc<dyn PortAllocator>,
        pipes: Arc<dyn PipeConnector>,
        config: SerialConsoleConfig,
    ) -> Self {
        Self {
            host,
            paths,
            ports,
            pipes,
            config,
            pipe_wait_timeout: pipe::PIPE_WAIT_TIMEOUT,
        }
    }
}
