// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory collaborators for unit tests.

use crate::pipe::ConsolePipe;
use crate::pipe::PipeConnector;
use crate::ConsoleContext;
use hyperv_host::config::SerialConsoleConfig;
use hyperv_host::HostError;
use hyperv_host::InstanceDirLayout;
use hyperv_host::PortAllocator;
use hyperv_host::PortError;
use hyperv_host::PowerStateEventSource;
use hyperv_host::VmHost;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use uuid::Uuid;

#[derive(Default)]
struct FakePipeState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    cancelled: bool,
    closed: bool,
}

/// A console pipe whose VM side is driven by the test.
#[derive(Default)]
pub struct FakePipe {
    state: Mutex<FakePipeState>,
    changed: Condvar,
}

impl FakePipe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the VM emit `data`.
    pub fn feed(&self, data: &[u8]) {
        self.state.lock().inbound.push_back(data.to_vec());
        self.changed.notify_all();
    }

    /// Makes the VM side close the pipe.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Waits until at least `len` bytes have been written to the VM.
    pub fn wait_written(&self, len: usize) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut state = self.state.lock();
        while state.written.len() < len {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.written.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "i/o cancelled")
}

impl ConsolePipe for FakePipe {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return Err(cancelled());
            }
            if let Some(mut chunk) = state.inbound.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    state.inbound.push_front(chunk.split_off(n));
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            self.changed.wait(&mut state);
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.cancelled || state.closed {
            return Err(cancelled());
        }
        state.written.extend_from_slice(buf);
        self.changed.notify_all();
        Ok(buf.len())
    }

    fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.changed.notify_all();
    }
}

/// Hands out registered [`FakePipe`]s and counts connection attempts.
#[derive(Default)]
pub struct FakeConnector {
    pipes: Mutex<HashMap<String, Arc<FakePipe>>>,
    connects: AtomicUsize,
    opened: AtomicUsize,
}

impl FakeConnector {
    pub fn add_pipe(&self, name: &str, pipe: Arc<FakePipe>) {
        self.pipes.lock().insert(name.into(), pipe);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl PipeConnector for FakeConnector {
    fn connect(&self, pipe: &str) -> io::Result<Arc<dyn ConsolePipe>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let pipe = self
            .pipes
            .lock()
            .get(pipe)
            .cloned()
            .ok_or(io::ErrorKind::NotFound)?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(pipe as Arc<dyn ConsolePipe>)
    }
}

/// A host with fixed serial pipes and running instances.
#[derive(Default)]
pub struct FakeHost {
    pub pipes: HashMap<String, String>,
    pub active: Vec<String>,
}

impl VmHost for FakeHost {
    fn serial_port_pipe(&self, instance: &str) -> Result<Option<String>, HostError> {
        Ok(self.pipes.get(instance).cloned())
    }

    fn active_instances(&self) -> Result<Vec<String>, HostError> {
        Ok(self.active.clone())
    }

    fn instance_uuid(&self, instance: &str) -> Result<Option<Uuid>, HostError> {
        Err(HostError::NotFound(instance.into()))
    }

    fn power_state_events(
        &self,
        _timeframe: Duration,
    ) -> Result<Box<dyn PowerStateEventSource>, HostError> {
        Err(anyhow::anyhow!("power state events are not supported").into())
    }
}

/// Hands out port 0 so relays bind an ephemeral port.
#[derive(Default)]
pub struct FakePorts {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl PortAllocator for FakePorts {
    fn acquire(&self, _host: &str) -> Result<u16, PortError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    fn release(&self, _host: &str, _port: u16) -> Result<(), PortError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A console context over fakes, with instance directories under `root`.
pub struct TestEnv {
    pub ctx: ConsoleContext,
    pub connector: Arc<FakeConnector>,
    pub ports: Arc<FakePorts>,
    pub layout: InstanceDirLayout,
}

impl TestEnv {
    /// Creates an environment in which each of `instances` has a directory
    /// and a serial pipe named `<instance>-com1`.
    pub fn new(root: &std::path::Path, instances: &[&str], relay: bool) -> Self {
        let mut host = FakeHost::default();
        let connector = Arc::new(FakeConnector::default());
        let layout = InstanceDirLayout::new(root);
        for &instance in instances {
            let pipe_name = format!("{instance}-com1");
            connector.add_pipe(&pipe_name, FakePipe::new());
            host.pipes.insert(instance.into(), pipe_name);
            host.active.push(instance.into());
            std::fs::create_dir_all(root.join(instance)).unwrap();
        }
        let ports = Arc::new(FakePorts::default());
        let config = SerialConsoleConfig {
            enabled: relay,
            console_log_max_size: 1024,
            ..Default::default()
        };
        let mut ctx = ConsoleContext::new(
            Arc::new(host),
            Arc::new(layout.clone()),
            ports.clone(),
            connector.clone(),
            config,
        );
        ctx.pipe_wait_timeout = Duration::from_millis(200);
        Self {
            ctx,
            connector,
            ports,
            layout,
        }
    }

    /// The fake pipe of `instance`.
    pub fn pipe(&self, instance: &str) -> Arc<FakePipe> {
        self.connector.pipes.lock()[&format!("{instance}-com1")].clone()
    }
}
