// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Byte queues shared by the pipe bridge and the TCP relay.
//!
//! Both queues of a console and its client-connected signal live behind a
//! single lock, so a worker waiting on "data available and client present"
//! (or "data available or client gone") can never miss a wakeup.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Copy, Clone)]
enum Direction {
    Input = 0,
    Output = 1,
}

#[derive(Debug, Default)]
struct GateState {
    chunks: [VecDeque<Vec<u8>>; 2],
    connected: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    fn update(&self, f: impl FnOnce(&mut GateState)) {
        f(&mut self.state.lock());
        self.changed.notify_all();
    }
}

/// The input queue, output queue, and client signal of one console.
#[derive(Debug, Clone)]
pub struct ConsoleQueues {
    /// Bytes from the TCP client, bound for the VM.
    pub input: ByteQueue,
    /// Bytes from the VM, bound for the TCP client.
    pub output: ByteQueue,
    /// Whether a TCP client is attached.
    pub client: ClientSignal,
}

impl ConsoleQueues {
    /// Creates an empty set of queues with no client attached.
    pub fn new() -> Self {
        let gate = Arc::new(Gate::default());
        Self {
            input: ByteQueue {
                gate: gate.clone(),
                direction: Direction::Input,
            },
            output: ByteQueue {
                gate: gate.clone(),
                direction: Direction::Output,
            },
            client: ClientSignal { gate },
        }
    }

    /// Tears the queues down. Every blocked consumer returns and all future
    /// waits return immediately.
    pub fn close(&self) {
        self.client.gate.update(|state| {
            state.closed = true;
            state.connected = false;
        });
    }
}

impl Default for ConsoleQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// The client-connected signal.
#[derive(Debug, Clone)]
pub struct ClientSignal {
    gate: Arc<Gate>,
}

impl ClientSignal {
    /// Marks a client as attached.
    pub fn set(&self) {
        self.gate.update(|state| {
            if !state.closed {
                state.connected = true;
            }
        });
    }

    /// Marks the client as detached.
    pub fn clear(&self) {
        self.gate.update(|state| state.connected = false);
    }

    /// Returns whether a client is attached.
    pub fn is_set(&self) -> bool {
        self.gate.state.lock().connected
    }
}

/// An unbounded FIFO of byte chunks.
///
/// Producers never block. Consumers block until a chunk is available or the
/// queues are closed.
#[derive(Debug, Clone)]
pub struct ByteQueue {
    gate: Arc<Gate>,
    direction: Direction,
}

impl ByteQueue {
    /// Appends a chunk. Empty chunks are dropped.
    pub fn put(&self, chunk: impl Into<Vec<u8>>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.gate
            .update(|state| state.chunks[self.direction as usize].push_back(chunk));
    }

    /// Removes the oldest chunk, blocking until one is available.
    ///
    /// Returns an empty chunk once the queues are closed.
    pub fn get(&self) -> Vec<u8> {
        let mut state = self.gate.state.lock();
        loop {
            if let Some(chunk) = state.chunks[self.direction as usize].pop_front() {
                return chunk;
            }
            if state.closed {
                return Vec::new();
            }
            self.gate.changed.wait(&mut state);
        }
    }

    /// Removes the oldest chunk once a client is attached.
    ///
    /// Nothing is dequeued while no client is attached. Returns `None` when
    /// `stop` is set (followed by a call to [`wake`](Self::wake)) or the
    /// queues are closed.
    pub fn get_when_connected(&self, stop: &AtomicBool) -> Option<Vec<u8>> {
        let mut state = self.gate.state.lock();
        loop {
            if state.closed || stop.load(Ordering::Acquire) {
                return None;
            }
            if state.connected {
                if let Some(chunk) = state.chunks[self.direction as usize].pop_front() {
                    return Some(chunk);
                }
            }
            self.gate.changed.wait(&mut state);
        }
    }

    /// Removes the oldest chunk while a client is attached.
    ///
    /// Returns `None` as soon as the client detaches, `stop` is set (followed
    /// by a call to [`wake`](Self::wake)), or the queues are closed.
    pub fn get_while_connected(&self, stop: &AtomicBool) -> Option<Vec<u8>> {
        let mut state = self.gate.state.lock();
        loop {
            if state.closed || !state.connected || stop.load(Ordering::Acquire) {
                return None;
            }
            if let Some(chunk) = state.chunks[self.direction as usize].pop_front() {
                return Some(chunk);
            }
            self.gate.changed.wait(&mut state);
        }
    }

    /// Wakes blocked consumers so they re-evaluate their stop flags.
    pub fn wake(&self) {
        self.gate.update(|_| ());
    }

    /// The number of queued chunks.
    pub fn len(&self) -> usize {
        self.gate.state.lock().chunks[self.direction as usize].len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use test_with_tracing::test;

    #[test]
    fn fifo_per_direction() {
        let queues = ConsoleQueues::new();
        queues.input.put(b"one".as_slice());
        queues.output.put(b"out".as_slice());
        queues.input.put(b"two".as_slice());
        queues.input.put(Vec::new());

        assert_eq!(queues.input.len(), 2);
        assert_eq!(queues.input.get(), b"one");
        assert_eq!(queues.input.get(), b"two");
        assert_eq!(queues.output.get(), b"out");
        assert!(queues.input.is_empty());
    }

    #[test]
    fn get_returns_empty_on_close() {
        let queues = ConsoleQueues::new();
        let t = thread::spawn({
            let queues = queues.clone();
            move || queues.output.get()
        });
        thread::sleep(Duration::from_millis(50));
        queues.close();
        assert!(t.join().unwrap().is_empty());
    }

    #[test]
    fn waits_for_client_before_dequeuing() {
        let queues = ConsoleQueues::new();
        let stop = Arc::new(AtomicBool::new(false));
        queues.input.put(b"ls\r".as_slice());

        let t = thread::spawn({
            let queues = queues.clone();
            let stop = stop.clone();
            move || queues.input.get_when_connected(&stop)
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queues.input.len(), 1);

        queues.client.set();
        assert_eq!(t.join().unwrap().unwrap(), b"ls\r");
    }

    #[test]
    fn stop_flag_releases_waiter() {
        let queues = ConsoleQueues::new();
        let stop = Arc::new(AtomicBool::new(false));
        let t = thread::spawn({
            let queues = queues.clone();
            let stop = stop.clone();
            move || queues.input.get_when_connected(&stop)
        });
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Release);
        queues.input.wake();
        assert!(t.join().unwrap().is_none());
    }

    #[test]
    fn disconnect_releases_output_waiter() {
        let queues = ConsoleQueues::new();
        let stop = AtomicBool::new(false);
        assert!(queues.output.get_while_connected(&stop).is_none());

        queues.client.set();
        let t = thread::spawn({
            let queues = queues.clone();
            move || queues.output.get_while_connected(&AtomicBool::new(false))
        });
        thread::sleep(Duration::from_millis(50));
        queues.client.clear();
        assert!(t.join().unwrap().is_none());
    }

    #[test]
    fn closed_queues_refuse_clients() {
        let queues = ConsoleQueues::new();
        queues.close();
        queues.client.set();
        assert!(!queues.client.is_set());
    }
}
