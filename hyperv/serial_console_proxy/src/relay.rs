// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TCP endpoint for a console, serving one client at a time.

use crate::ConsoleQueues;
use crate::CONSOLE_BUFFER_SIZE;
use parking_lot::Mutex;
use socket2::Domain;
use socket2::Protocol;
use socket2::SockRef;
use socket2::Socket;
use socket2::Type;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Bridges a single TCP client to a console's queues.
///
/// A second client waits in the listen backlog until the first one
/// disconnects.
pub struct TcpRelay {
    shared: Arc<RelayShared>,
    listener: Option<TcpListener>,
    accept_worker: Option<JoinHandle<()>>,
}

struct RelayShared {
    instance: String,
    local_addr: SocketAddr,
    queues: ConsoleQueues,
    stopped: AtomicBool,
    /// Kept to unblock the accept loop on stop.
    listener: TcpListener,
    /// The active connection, kept to unblock its workers on disconnect.
    conn: Mutex<Option<TcpStream>>,
}

impl TcpRelay {
    /// Binds and listens on `host:port`. Call [`start`](Self::start) to begin
    /// accepting clients.
    pub fn bind(instance: &str, host: &str, port: u16, queues: ConsoleQueues) -> io::Result<Self> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{host} did not resolve to an address"),
            )
        })?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        // SO_REUSEADDR on Windows would allow stealing a port that is in use.
        #[cfg(not(windows))]
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1)?;
        let listener = TcpListener::from(socket);
        let local_addr = listener.local_addr()?;

        tracing::debug!(instance, addr = %local_addr, "console relay listening");
        Ok(Self {
            shared: Arc::new(RelayShared {
                instance: instance.to_owned(),
                local_addr,
                queues,
                stopped: AtomicBool::new(false),
                listener: listener.try_clone()?,
                conn: Mutex::new(None),
            }),
            listener: Some(listener),
            accept_worker: None,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Starts the accept loop. Does nothing if already started.
    pub fn start(&mut self) -> io::Result<()> {
        let Some(listener) = self.listener.take() else {
            return Ok(());
        };
        let shared = self.shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("console-relay-{}", self.shared.instance))
            .spawn(move || shared.accept_loop(listener))?;
        self.accept_worker = Some(worker);
        Ok(())
    }

    /// Disconnects any client and closes the listener. Idempotent.
    pub fn stop(&mut self) {
        let shared = &self.shared;
        if !shared.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                instance = %shared.instance,
                "stopping console relay, clients will be disconnected"
            );
            shared.disconnect();
            shared.wake_accept();
        }
        self.listener = None;
        if let Some(worker) = self.accept_worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TcpRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RelayShared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Unblocks the accept loop after `stopped` has been set.
    fn wake_accept(&self) {
        // Shutting down a listening socket fails accept on Linux. Elsewhere, a
        // throwaway connection does the job.
        let _ = SockRef::from(&self.listener).shutdown(Shutdown::Both);
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        let _ = TcpStream::connect_timeout(&addr, WAKE_CONNECT_TIMEOUT);
    }

    /// Detaches the client and shuts its connection down so that both of its
    /// workers return.
    fn disconnect(&self) {
        self.queues.client.clear();
        if let Some(conn) = self.conn.lock().take() {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }

    /// Handles a socket error on the client connection or the listener.
    fn socket_error(&self, op: &str, err: &io::Error) {
        if !self.is_stopped() && !is_closed_socket_error(err) {
            tracing::error!(
                instance = %self.instance,
                error = err as &dyn std::error::Error,
                "console relay {op} failed, closing connection"
            );
        }
        self.disconnect();
    }

    fn accept_loop(self: &Arc<Self>, listener: TcpListener) {
        while !self.is_stopped() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.is_stopped() {
                        break;
                    }
                    self.serve(stream, peer);
                }
                Err(err) => {
                    if self.is_stopped() {
                        break;
                    }
                    self.socket_error("accept", &err);
                    std::thread::sleep(ACCEPT_RETRY_DELAY);
                }
            }
        }
        tracing::debug!(instance = %self.instance, "console relay stopped");
    }

    fn serve(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (recv_stream, send_stream) = match (stream.try_clone(), stream.try_clone()) {
            (Ok(recv), Ok(send)) => (recv, send),
            (Err(err), _) | (_, Err(err)) => {
                self.socket_error("accept", &err);
                return;
            }
        };

        {
            let mut conn = self.conn.lock();
            if self.is_stopped() {
                return;
            }
            *conn = Some(stream);
            self.queues.client.set();
        }

        tracing::info!(
            instance = %self.instance,
            client = %peer,
            addr = %self.local_addr,
            "console client connected"
        );

        let recv = std::thread::Builder::new()
            .name(format!("console-relay-recv-{}", self.instance))
            .spawn({
                let this = self.clone();
                move || this.recv_loop(recv_stream)
            });
        let send = std::thread::Builder::new()
            .name(format!("console-relay-send-{}", self.instance))
            .spawn({
                let this = self.clone();
                move || this.send_loop(send_stream)
            });
        for worker in [recv, send] {
            match worker {
                Ok(worker) => {
                    let _ = worker.join();
                }
                Err(err) => self.socket_error("spawn", &err),
            }
        }

        self.disconnect();
        tracing::info!(
            instance = %self.instance,
            client = %peer,
            "console client disconnected"
        );
    }

    fn recv_loop(&self, mut stream: TcpStream) {
        let mut buf = vec![0; CONSOLE_BUFFER_SIZE];
        while self.queues.client.is_set() {
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.disconnect();
                    break;
                }
                Ok(n) => self.queues.input.put(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.socket_error("receive", &err);
                    break;
                }
            }
        }
    }

    fn send_loop(&self, mut stream: TcpStream) {
        while let Some(chunk) = self.queues.output.get_while_connected(&self.stopped) {
            if let Err(err) = stream.write_all(&chunk) {
                self.socket_error("send", &err);
                break;
            }
        }
    }
}

/// Returns whether `err` came from using a socket closed by `stop`.
#[cfg(unix)]
fn is_closed_socket_error(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBADF)
}

#[cfg(windows)]
fn is_closed_socket_error(err: &io::Error) -> bool {
    use windows_sys::Win32::Networking::WinSock::WSAEBADF;
    use windows_sys::Win32::Networking::WinSock::WSAENOTSOCK;
    matches!(err.raw_os_error(), Some(WSAEBADF | WSAENOTSOCK))
}

#[cfg(not(any(unix, windows)))]
fn is_closed_socket_error(_err: &io::Error) -> bool {
    false
}
