// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Turns Hyper-V power-state notifications into VM lifecycle events.
//!
//! A polling thread drains the hypervisor's event source, drops repeated and
//! intermediate states, and resolves the instance UUID. Callbacks run on a
//! separate notifier thread so a slow consumer never holds up polling.

#![forbid(unsafe_code)]

use hyperv_host::config::HyperVConfig;
use hyperv_host::HostError;
use hyperv_host::PowerState;
use hyperv_host::PowerStateEvent;
use hyperv_host::PowerStateEventSource;
use hyperv_host::VmHost;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// A lifecycle transition reported to consumers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LifecycleTransition {
    /// The VM is running.
    Started,
    /// The VM is powered off.
    Stopped,
    /// The VM is paused in memory.
    Paused,
    /// The VM resumed from a pause.
    ///
    /// Hyper-V reports a resumed VM as enabled, so this is never produced
    /// from a raw state.
    Resumed,
    /// The VM state was saved to disk.
    Suspended,
}

impl LifecycleTransition {
    /// Returns the transition reported on entering `state`, or `None` for
    /// intermediate states.
    pub fn from_power_state(state: PowerState) -> Option<Self> {
        let transition = match state {
            PowerState::Enabled => Self::Started,
            PowerState::Disabled => Self::Stopped,
            PowerState::Paused => Self::Paused,
            PowerState::Suspended => Self::Suspended,
            PowerState::Starting
            | PowerState::Snapshotting
            | PowerState::Saving
            | PowerState::Stopping
            | PowerState::Pausing
            | PowerState::Resuming
            | PowerState::Other(_) => return None,
        };
        Some(transition)
    }
}

/// A lifecycle transition of a managed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// The instance UUID.
    pub uuid: Uuid,
    /// What happened.
    pub transition: LifecycleTransition,
}

/// An error starting the dispatcher.
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// The power-state event subscription failed.
    #[error("failed to subscribe to power state events")]
    Subscribe(#[source] HostError),
    /// A dispatcher thread could not be created.
    #[error("failed to spawn dispatcher thread")]
    Spawn(#[source] io::Error),
}

type StateCallback = Box<dyn Fn(LifecycleEvent) + Send>;
type RunningCallback = Box<dyn Fn(&str, Uuid) + Send>;

/// Watches VM power states and reports lifecycle transitions.
pub struct LifecycleEventDispatcher {
    host: Arc<dyn VmHost>,
    check_timeframe: Duration,
    polling_interval: Duration,
    state_callback: StateCallback,
    running_callback: RunningCallback,
}

impl LifecycleEventDispatcher {
    /// Creates a dispatcher.
    ///
    /// `state_callback` receives every transition. `running_callback`
    /// additionally receives the instance name and UUID of every instance
    /// that started.
    pub fn new(
        host: Arc<dyn VmHost>,
        config: &HyperVConfig,
        state_callback: impl Fn(LifecycleEvent) + Send + 'static,
        running_callback: impl Fn(&str, Uuid) + Send + 'static,
    ) -> Self {
        Self {
            host,
            check_timeframe: config.check_timeframe(),
            polling_interval: config.polling_interval(),
            state_callback: Box::new(state_callback),
            running_callback: Box::new(running_callback),
        }
    }

    /// Overrides the delay between polls when no event is pending.
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Subscribes to power-state events and starts the polling and notifier
    /// threads.
    pub fn start(self) -> Result<DispatcherHandle, DispatcherError> {
        let source = self
            .host
            .power_state_events(self.check_timeframe)
            .map_err(DispatcherError::Subscribe)?;

        let (send, recv) = mpsc::channel();
        let notifier = std::thread::Builder::new()
            .name("vm-lifecycle-notify".into())
            .spawn({
                let state_callback = self.state_callback;
                let running_callback = self.running_callback;
                move || notify_loop(recv, state_callback, running_callback)
            })
            .map_err(DispatcherError::Spawn)?;

        let stop = Arc::new(StopSignal::default());
        let mut dispatcher = Dispatcher {
            host: self.host,
            last_state: HashMap::new(),
            notify: send,
        };
        let polling_interval = self.polling_interval;
        // On failure the channel sender is dropped with the closure, which
        // ends the notifier.
        let poller = std::thread::Builder::new()
            .name("vm-lifecycle-poll".into())
            .spawn({
                let stop = stop.clone();
                move || dispatcher.poll_loop(source, polling_interval, &stop)
            })
            .map_err(DispatcherError::Spawn)?;

        tracing::debug!(
            timeframe = ?self.check_timeframe,
            interval = ?polling_interval,
            "lifecycle event dispatcher started"
        );
        Ok(DispatcherHandle {
            stop,
            poller: Some(poller),
            notifier: Some(notifier),
        })
    }
}

/// A running dispatcher. Dropping it stops the dispatcher.
pub struct DispatcherHandle {
    stop: Arc<StopSignal>,
    poller: Option<JoinHandle<()>>,
    notifier: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stops polling, delivers the notifications already produced, and waits
    /// for both threads to exit. Idempotent.
    pub fn stop(&mut self) {
        self.stop.set();
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
        if let Some(notifier) = self.notifier.take() {
            let _ = notifier.join();
            tracing::debug!("lifecycle event dispatcher stopped");
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    fn set(&self) {
        *self.stopped.lock() = true;
        self.changed.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.stopped.lock()
    }

    /// Waits up to `timeout`. Returns whether the signal is set.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.changed.wait_while_for(&mut stopped, |stopped| !*stopped, timeout);
        }
        *stopped
    }
}

enum Notification {
    Transition(LifecycleEvent),
    Running { instance: String, uuid: Uuid },
}

fn notify_loop(
    recv: mpsc::Receiver<Notification>,
    state_callback: StateCallback,
    running_callback: RunningCallback,
) {
    for notification in recv {
        match notification {
            Notification::Transition(event) => state_callback(event),
            Notification::Running { instance, uuid } => running_callback(&instance, uuid),
        }
    }
}

struct Dispatcher {
    host: Arc<dyn VmHost>,
    last_state: HashMap<Uuid, PowerState>,
    notify: mpsc::Sender<Notification>,
}

impl Dispatcher {
    fn poll_loop(
        &mut self,
        mut source: Box<dyn PowerStateEventSource>,
        interval: Duration,
        stop: &StopSignal,
    ) {
        while !stop.is_set() {
            match source.next_event(Duration::ZERO) {
                Ok(Some(event)) => self.dispatch_event(&event),
                Ok(None) => {
                    if stop.wait(interval) {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to poll power state events"
                    );
                    if stop.wait(interval) {
                        break;
                    }
                }
            }
        }
    }

    fn dispatch_event(&mut self, event: &PowerStateEvent) {
        let state = self.host.power_state(event.raw_state);
        let previous = self.last_state.insert(event.instance_guid, state);
        if previous == Some(state) {
            return;
        }
        let Some(transition) = LifecycleTransition::from_power_state(state) else {
            tracing::trace!(
                instance = %event.instance_name,
                ?state,
                "ignoring intermediate power state"
            );
            return;
        };

        let uuid = match self.host.instance_uuid(&event.instance_name) {
            Ok(Some(uuid)) => uuid,
            Ok(None) | Err(HostError::NotFound(_)) => {
                tracing::warn!(
                    instance = %event.instance_name,
                    ?transition,
                    "instance is not managed here, dropping power state event"
                );
                return;
            }
            Err(err) => {
                tracing::error!(
                    instance = %event.instance_name,
                    error = &err as &dyn std::error::Error,
                    "failed to resolve instance uuid, dropping power state event"
                );
                return;
            }
        };

        tracing::debug!(
            instance = %event.instance_name,
            %uuid,
            ?transition,
            "instance lifecycle transition"
        );
        // The notifier only exits once every sender is gone.
        let _ = self
            .notify
            .send(Notification::Transition(LifecycleEvent { uuid, transition }));
        if transition == LifecycleTransition::Started {
            let _ = self.notify.send(Notification::Running {
                instance: event.instance_name.clone(),
                uuid,
            });
        }
    }
}
