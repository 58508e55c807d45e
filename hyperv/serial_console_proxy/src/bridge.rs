// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Duplex transfer between a VM console pipe and the console queues.

use crate::console_log::ConsoleLog;
use crate::pipe::open_pipe;
use crate::pipe::write_all;
use crate::pipe::ConsolePipe;
use crate::pipe::PipeConnector;
use crate::ConsoleError;
use crate::ConsoleQueues;
use crate::CONSOLE_BUFFER_SIZE;
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Moves bytes between one instance's console pipe and its queues.
///
/// Everything read from the pipe is pushed to the output queue and appended
/// to the console log. Input queue chunks are written to the pipe, but only
/// while a client is attached.
pub struct PipeBridge {
    shared: Arc<BridgeShared>,
    workers: Vec<JoinHandle<()>>,
}

struct BridgeShared {
    instance: String,
    pipe_name: String,
    pipe: Arc<dyn ConsolePipe>,
    queues: ConsoleQueues,
    stopped: AtomicBool,
}

/// Where and how much console output to keep.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogTarget<'a> {
    pub path: &'a Path,
    pub max_size: u64,
}

impl PipeBridge {
    /// Opens the pipe, waiting up to `timeout` for it to appear, and starts
    /// the reader and writer threads.
    pub(crate) fn start(
        instance: &str,
        pipe_name: &str,
        connector: &dyn PipeConnector,
        timeout: Duration,
        queues: ConsoleQueues,
        log: Option<LogTarget<'_>>,
    ) -> Result<Self, ConsoleError> {
        let pipe = open_pipe(connector, pipe_name, timeout)
            .map_err(|source| ConsoleError::Io {
                instance: instance.to_owned(),
                source,
            })?
            .ok_or_else(|| {
                tracing::warn!(
                    instance,
                    pipe = pipe_name,
                    "console pipe did not become available"
                );
                ConsoleError::Unavailable {
                    instance: instance.to_owned(),
                }
            })?;

        // Console capture is best effort.
        let log = log.and_then(|target| match ConsoleLog::open(target.path, target.max_size) {
            Ok(log) => Some(log),
            Err(err) => {
                tracing::error!(
                    instance,
                    path = %target.path.display(),
                    error = &err as &dyn std::error::Error,
                    "failed to open console log, console output will not be captured"
                );
                None
            }
        });

        let shared = Arc::new(BridgeShared {
            instance: instance.to_owned(),
            pipe_name: pipe_name.to_owned(),
            pipe,
            queues,
            stopped: AtomicBool::new(false),
        });

        let mut this = Self {
            shared: shared.clone(),
            workers: Vec::new(),
        };

        let spawn_err = |source| ConsoleError::Io {
            instance: instance.to_owned(),
            source,
        };
        let reader = std::thread::Builder::new()
            .name(format!("console-pipe-read-{instance}"))
            .spawn({
                let shared = shared.clone();
                move || shared.read_loop(log)
            })
            .map_err(spawn_err)?;
        this.workers.push(reader);

        // On failure, dropping `this` stops the reader.
        let writer = std::thread::Builder::new()
            .name(format!("console-pipe-write-{instance}"))
            .spawn(move || shared.write_loop())
            .map_err(spawn_err)?;
        this.workers.push(writer);

        tracing::debug!(instance, pipe = pipe_name, "console pipe bridge started");
        Ok(this)
    }

    /// Returns whether the bridge has stopped, either by request or because
    /// of a pipe failure.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stops both workers and closes the pipe and log. Idempotent.
    pub fn stop(&mut self) {
        self.shared.shutdown();
        let workers = std::mem::take(&mut self.workers);
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            let _ = worker.join();
        }
        tracing::debug!(
            instance = %self.shared.instance,
            pipe = %self.shared.pipe_name,
            "console pipe bridge stopped"
        );
    }
}

impl Drop for PipeBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BridgeShared {
    /// Flags the bridge as stopped and unblocks both workers.
    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pipe.cancel();
        self.queues.input.wake();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn fail(&self, op: &str, err: &io::Error) {
        if !self.is_stopped() {
            tracing::error!(
                instance = %self.instance,
                pipe = %self.pipe_name,
                error = err as &dyn std::error::Error,
                "console pipe {op} failed, stopping bridge"
            );
        }
        self.shutdown();
    }

    fn read_loop(&self, mut log: Option<ConsoleLog>) {
        let mut buf = vec![0; CONSOLE_BUFFER_SIZE];
        while !self.is_stopped() {
            let n = match self.pipe.read(&mut buf) {
                Ok(0) => {
                    self.fail("read", &io::ErrorKind::UnexpectedEof.into());
                    break;
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fail("read", &err);
                    break;
                }
            };
            let data = &buf[..n];
            self.queues.output.put(data);
            if let Some(log) = &mut log {
                if let Err(err) = log.append(data) {
                    tracing::error!(
                        instance = %self.instance,
                        path = %log.path().display(),
                        error = &err as &dyn std::error::Error,
                        "failed to write console log"
                    );
                }
            }
        }
        // Dropping the log closes it.
    }

    fn write_loop(&self) {
        while let Some(chunk) = self.queues.input.get_when_connected(&self.stopped) {
            if let Err(err) = write_all(self.pipe.as_ref(), &chunk) {
                self.fail("write", &err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;
    use crate::testing::FakePipe;
    use std::time::Instant;
    use test_with_tracing::test;

    struct Fixture {
        pipe: Arc<FakePipe>,
        queues: ConsoleQueues,
        bridge: PipeBridge,
        _dir: tempfile::TempDir,
        log_path: std::path::PathBuf,
    }

    fn start_bridge() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("console.log");
        let pipe = FakePipe::new();
        let connector = FakeConnector::default();
        connector.add_pipe("com1", pipe.clone());
        let queues = ConsoleQueues::new();
        let bridge = PipeBridge::start(
            "vm1",
            "com1",
            &connector,
            Duration::from_secs(1),
            queues.clone(),
            Some(LogTarget {
                path: &log_path,
                max_size: 1024,
            }),
        )
        .unwrap();
        Fixture {
            pipe,
            queues,
            bridge,
            _dir: dir,
            log_path,
        }
    }

    fn wait_for(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn input_reaches_pipe_in_order() {
        let mut f = start_bridge();
        f.queues.client.set();
        f.queues.input.put(b"uname".as_slice());
        f.queues.input.put(b" -a\r".as_slice());
        assert_eq!(f.pipe.wait_written(9), b"uname -a\r");
        f.bridge.stop();
    }

    #[test]
    fn output_reaches_queue_and_log() {
        let mut f = start_bridge();
        f.queues.client.set();
        f.pipe.feed(b"login: ");
        assert_eq!(f.queues.output.get(), b"login: ");
        wait_for(|| std::fs::read(&f.log_path).unwrap() == b"login: ");
        f.bridge.stop();
    }

    #[test]
    fn output_without_client_is_queued() {
        let mut f = start_bridge();
        f.pipe.feed(b"boot messages");
        wait_for(|| std::fs::read(&f.log_path).unwrap() == b"boot messages");
        assert_eq!(f.queues.output.len(), 1);

        // A client attaching later still receives it.
        f.queues.client.set();
        let stop = AtomicBool::new(false);
        assert_eq!(
            f.queues.output.get_while_connected(&stop).unwrap(),
            b"boot messages"
        );
        f.bridge.stop();
    }

    #[test]
    fn input_stays_queued_without_client() {
        let mut f = start_bridge();
        f.queues.input.put(b"early".as_slice());
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(f.queues.input.len(), 1);
        assert!(f.pipe.written().is_empty());

        f.queues.client.set();
        assert_eq!(f.pipe.wait_written(5), b"early");
        f.bridge.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut f = start_bridge();
        f.bridge.stop();
        assert!(f.bridge.is_stopped());
        assert!(f.pipe.is_cancelled());
        f.bridge.stop();
    }

    #[test]
    fn pipe_failure_stops_bridge() {
        let mut f = start_bridge();
        f.pipe.close();
        wait_for(|| f.bridge.is_stopped());
        f.bridge.stop();
    }

    #[test]
    fn missing_pipe_is_unavailable() {
        let connector = FakeConnector::default();
        let err = PipeBridge::start(
            "vm1",
            "com1",
            &connector,
            Duration::from_millis(200),
            ConsoleQueues::new(),
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConsoleError::Unavailable { .. }));
    }
}
