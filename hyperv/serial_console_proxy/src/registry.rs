// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The set of live console handlers, keyed by instance.

use crate::handler::read_console_logs;
use crate::ConnectionInfo;
use crate::ConsoleContext;
use crate::ConsoleError;
use crate::ConsoleHandler;
use anyhow::Context as _;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type Slot = Arc<Mutex<Option<ConsoleHandler>>>;

/// Owns at most one [`ConsoleHandler`] per instance.
///
/// Operations on the same instance are serialized by a per-instance lock.
/// Operations on different instances never wait on each other, apart from
/// briefly looking up the instance's lock.
pub struct ConsoleRegistry {
    ctx: ConsoleContext,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConsoleRegistry {
    /// Creates an empty registry.
    pub fn new(ctx: ConsoleContext) -> Self {
        Self {
            ctx,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` with the instance's handler slot locked.
    ///
    /// The slot is dropped from the map once it is empty and nobody else
    /// holds it.
    fn with_slot<R>(&self, instance: &str, f: impl FnOnce(&mut Option<ConsoleHandler>) -> R) -> R {
        let slot = self
            .slots
            .lock()
            .entry(instance.to_owned())
            .or_default()
            .clone();

        let mut handler = slot.lock();
        let r = f(&mut handler);
        if handler.is_none() {
            let mut slots = self.slots.lock();
            // One reference in the map, one here.
            if Arc::strong_count(&slot) == 2 {
                slots.remove(instance);
            }
        }
        r
    }

    /// Starts the instance's console handler unless one is already running.
    pub fn start_handler(&self, instance: &str) -> Result<(), ConsoleError> {
        self.with_slot(instance, |handler| {
            if handler.is_none() {
                *handler = Some(ConsoleHandler::start(instance, &self.ctx)?);
            }
            Ok(())
        })
    }

    /// Stops the instance's console handler, if any.
    pub fn stop_handler(&self, instance: &str, delete_logs: bool) {
        self.with_slot(instance, |handler| {
            if let Some(mut handler) = handler.take() {
                handler.stop(delete_logs);
            }
        })
    }

    /// Returns whether a handler is running for the instance.
    pub fn is_active(&self, instance: &str) -> bool {
        self.with_slot(instance, |handler| handler.is_some())
    }

    /// Returns where a client can reach the instance's console.
    pub fn connection_info(&self, instance: &str) -> Result<ConnectionInfo, ConsoleError> {
        self.with_slot(instance, |handler| match handler {
            Some(handler) => handler.connection_info(),
            None => Err(ConsoleError::Unavailable {
                instance: instance.to_owned(),
            }),
        })
    }

    /// Returns the instance's captured console output, oldest first.
    ///
    /// Without a running handler this is empty.
    pub fn get_output(&self, instance: &str) -> Result<Vec<u8>, ConsoleError> {
        self.with_slot(instance, |handler| match handler {
            Some(handler) => handler.get_output(),
            None => {
                tracing::warn!(instance, "no console handler running, returning no output");
                Ok(Vec::new())
            }
        })
    }

    /// Starts handlers for all running instances that have an instance
    /// directory, which excludes VMs not managed here.
    ///
    /// Individual failures are logged and skipped.
    pub fn start_all_active(&self) -> anyhow::Result<()> {
        let instances = self
            .ctx
            .host
            .active_instances()
            .context("failed to enumerate active instances")?;

        for instance in instances {
            if !self.ctx.paths.instance_dir_exists(&instance) {
                tracing::debug!(instance = %instance, "skipping unmanaged instance");
                continue;
            }
            if let Err(err) = self.start_handler(&instance) {
                tracing::error!(
                    instance = %instance,
                    error = &err as &dyn std::error::Error,
                    "failed to start console handler"
                );
            }
        }
        Ok(())
    }

    /// Reads the instance's console logs whether or not a handler runs.
    ///
    /// Serialized with the other operations on the instance, so it never
    /// observes a half-deleted log set.
    pub fn read_logs(&self, instance: &str) -> Result<Vec<u8>, ConsoleError> {
        let paths = self.ctx.paths.console_log_paths(instance);
        self.with_slot(instance, |_| {
            read_console_logs(&paths).map_err(|source| ConsoleError::Io {
                instance: instance.to_owned(),
                source,
            })
        })
    }
}

impl Drop for ConsoleRegistry {
    fn drop(&mut self) {
        for (_, slot) in self.slots.get_mut().drain() {
            if let Some(mut handler) = slot.lock().take() {
                handler.stop(false);
            }
        }
    }
}
