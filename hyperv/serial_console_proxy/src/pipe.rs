// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The VM side of the console: a single-reader, single-writer byte stream.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// How long to wait for the hypervisor to create the console pipe.
pub const PIPE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

const PIPE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// An open console pipe.
///
/// One thread reads while another writes, so implementations must support
/// concurrent `read` and `write` calls (overlapped I/O for Windows named
/// pipes).
pub trait ConsolePipe: Send + Sync {
    /// Reads into `buf`, blocking until data arrives. Returns 0 if the peer
    /// closed the pipe.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning the number of bytes written.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Cancels in-flight and future I/O so that blocked `read` and `write`
    /// calls return promptly.
    fn cancel(&self);
}

/// Opens console pipes by name.
pub trait PipeConnector: Send + Sync {
    /// Opens the pipe, failing immediately if it does not exist yet.
    fn connect(&self, pipe: &str) -> io::Result<Arc<dyn ConsolePipe>>;
}

/// Writes all of `buf` to `pipe`.
pub(crate) fn write_all(pipe: &dyn ConsolePipe, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match pipe.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Opens `pipe`, retrying while it does not exist or is busy.
///
/// Returns `Ok(None)` if the pipe did not become available within `timeout`.
pub(crate) fn open_pipe(
    connector: &dyn PipeConnector,
    pipe: &str,
    timeout: Duration,
) -> io::Result<Option<Arc<dyn ConsolePipe>>> {
    let deadline = Instant::now() + timeout;
    loop {
        match connector.connect(pipe) {
            Ok(pipe) => return Ok(Some(pipe)),
            Err(err) if is_pipe_pending(&err) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(PIPE_RETRY_INTERVAL.min(deadline - now));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Returns whether `err` means the pipe server has not come up yet.
fn is_pipe_pending(err: &io::Error) -> bool {
    is_pipe_busy(err)
        || matches!(
            err.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
        )
}

#[cfg(windows)]
fn is_pipe_busy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(windows_sys::Win32::Foundation::ERROR_PIPE_BUSY as i32)
}

#[cfg(not(windows))]
fn is_pipe_busy(_err: &io::Error) -> bool {
    false
}

#[cfg(unix)]
pub use unix::UnixPipeConnector;

#[cfg(unix)]
mod unix {
    use super::ConsolePipe;
    use super::PipeConnector;
    use std::io;
    use std::io::Read;
    use std::io::Write;
    use std::net::Shutdown;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    /// Treats pipe names as Unix-domain stream socket paths.
    #[derive(Debug, Default)]
    pub struct UnixPipeConnector;

    struct UnixConsolePipe {
        stream: UnixStream,
    }

    impl PipeConnector for UnixPipeConnector {
        fn connect(&self, pipe: &str) -> io::Result<Arc<dyn ConsolePipe>> {
            let stream = UnixStream::connect(pipe)?;
            Ok(Arc::new(UnixConsolePipe { stream }))
        }
    }

    impl ConsolePipe for UnixConsolePipe {
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            (&self.stream).read(buf)
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            (&self.stream).write(buf)
        }

        fn cancel(&self) {
            // Wakes any thread blocked in read or write.
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}
