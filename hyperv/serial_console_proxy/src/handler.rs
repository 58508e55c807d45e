// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One instance's console: a pipe bridge plus an optional TCP relay.

use crate::bridge::LogTarget;
use crate::ConsoleContext;
use crate::ConsoleError;
use crate::ConsoleQueues;
use crate::PipeBridge;
use crate::TcpRelay;
use std::io;
use std::path::PathBuf;

/// Where a client can reach a console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The relay host.
    pub host: String,
    /// The relay port.
    pub port: u16,
}

struct RelayPort {
    relay: TcpRelay,
    host: String,
    /// The port handed out by the allocator, which may differ from the bound
    /// port if the allocator delegates the choice to the OS.
    allocated: u16,
}

/// The live console of one instance.
pub struct ConsoleHandler {
    instance: String,
    ctx: ConsoleContext,
    queues: ConsoleQueues,
    log_paths: Vec<PathBuf>,
    bridge: Option<PipeBridge>,
    relay: Option<RelayPort>,
}

impl ConsoleHandler {
    /// Connects to the instance's console pipe and, if the relay is enabled,
    /// starts listening for a TCP client.
    pub fn start(instance: &str, ctx: &ConsoleContext) -> Result<Self, ConsoleError> {
        let pipe_name = ctx
            .host
            .serial_port_pipe(instance)
            .map_err(|source| ConsoleError::Host {
                instance: instance.to_owned(),
                source,
            })?
            .ok_or_else(|| ConsoleError::Unavailable {
                instance: instance.to_owned(),
            })?;

        let log_paths = ctx.paths.console_log_paths(instance);
        let queues = ConsoleQueues::new();

        let mut this = Self {
            instance: instance.to_owned(),
            ctx: ctx.clone(),
            queues: queues.clone(),
            log_paths,
            bridge: None,
            relay: None,
        };

        // From here on, dropping `this` on failure releases what was set up.
        if ctx.config.enabled {
            this.relay = Some(this.bind_relay()?);
        }

        let log = this.log_paths.first().map(|path| LogTarget {
            path,
            max_size: ctx.config.console_log_max_size,
        });
        this.bridge = Some(PipeBridge::start(
            instance,
            &pipe_name,
            ctx.pipes.as_ref(),
            ctx.pipe_wait_timeout,
            queues,
            log,
        )?);

        if let Some(relay) = &mut this.relay {
            relay
                .relay
                .start()
                .map_err(|source| ConsoleError::Io {
                    instance: instance.to_owned(),
                    source,
                })?;
        }

        tracing::debug!(instance, pipe = %pipe_name, "console handler started");
        Ok(this)
    }

    fn bind_relay(&self) -> Result<RelayPort, ConsoleError> {
        let host = self.ctx.config.proxyclient_address.clone();
        let allocated =
            self.ctx
                .ports
                .acquire(&host)
                .map_err(|source| ConsoleError::PortAllocation {
                    instance: self.instance.clone(),
                    source,
                })?;
        match TcpRelay::bind(&self.instance, &host, allocated, self.queues.clone()) {
            Ok(relay) => Ok(RelayPort {
                relay,
                host,
                allocated,
            }),
            Err(source) => {
                self.release_port(&host, allocated);
                Err(ConsoleError::Listen {
                    instance: self.instance.clone(),
                    addr: format!("{host}:{allocated}"),
                    source,
                })
            }
        }
    }

    fn release_port(&self, host: &str, port: u16) {
        if let Err(err) = self.ctx.ports.release(host, port) {
            tracing::error!(
                instance = %self.instance,
                error = &err as &dyn std::error::Error,
                "failed to release console port"
            );
        }
    }

    /// The instance this console belongs to.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Stops the relay and the bridge, optionally deleting the console logs.
    /// Idempotent.
    pub fn stop(&mut self, delete_logs: bool) {
        if let Some(mut relay) = self.relay.take() {
            relay.relay.stop();
            self.release_port(&relay.host, relay.allocated);
        }
        if let Some(mut bridge) = self.bridge.take() {
            bridge.stop();
            tracing::debug!(instance = %self.instance, "console handler stopped");
        }
        self.queues.close();
        if delete_logs {
            if let Err(err) = self.ctx.paths.delete_console_logs(&self.instance) {
                tracing::error!(
                    instance = %self.instance,
                    error = &err as &dyn std::error::Error,
                    "failed to delete console logs"
                );
            }
        }
    }

    /// Returns where a client can connect, if the console is exposed over TCP.
    pub fn connection_info(&self) -> Result<ConnectionInfo, ConsoleError> {
        let relay = self.relay.as_ref().ok_or_else(|| ConsoleError::Unavailable {
            instance: self.instance.clone(),
        })?;
        Ok(ConnectionInfo {
            host: relay.host.clone(),
            port: relay.relay.local_addr().port(),
        })
    }

    /// Returns the captured console output, oldest first.
    pub fn get_output(&self) -> Result<Vec<u8>, ConsoleError> {
        read_console_logs(&self.log_paths).map_err(|source| ConsoleError::Io {
            instance: self.instance.clone(),
            source,
        })
    }
}

impl Drop for ConsoleHandler {
    fn drop(&mut self) {
        self.stop(false);
    }
}

/// Concatenates the console logs in `paths` (newest first) oldest first,
/// skipping the ones that do not exist.
pub(crate) fn read_console_logs(paths: &[PathBuf]) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    for path in paths.iter().rev() {
        match std::fs::read(path) {
            Ok(data) => output.extend(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(output)
}
