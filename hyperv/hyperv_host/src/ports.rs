// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::net::TcpListener;
use std::str::FromStr;
use thiserror::Error;

/// Errors from [`PortAllocator`].
#[derive(Debug, Error)]
pub enum PortError {
    /// Every port in the range is allocated or in use.
    #[error("no free port in range {range} on {host}")]
    Exhausted {
        /// The host the port was requested for.
        host: String,
        /// The configured range.
        range: PortRange,
    },
    /// The port was not allocated.
    #[error("port {port} on {host} is not allocated")]
    Released {
        /// The host the port was released for.
        host: String,
        /// The port.
        port: u16,
    },
}

/// The process-wide pool of TCP ports that console relays listen on.
pub trait PortAllocator: Send + Sync {
    /// Reserves a port on `host`.
    fn acquire(&self, host: &str) -> Result<u16, PortError>;

    /// Returns a port previously reserved with [`acquire`](Self::acquire).
    fn release(&self, host: &str, port: u16) -> Result<(), PortError>;
}

/// An inclusive port range, written as `<min>:<max>`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    /// Creates a range. Returns `None` if `min > max`.
    pub fn new(min: u16, max: u16) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    /// The lowest port in the range.
    pub fn min(&self) -> u16 {
        self.min
    }

    /// The highest port in the range.
    pub fn max(&self) -> u16 {
        self.max
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 10000,
            max: 20000,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.min, self.max)
    }
}

/// An invalid port range string.
#[derive(Debug, Error)]
#[error("invalid port range {0:?}, expected <min>:<max>")]
pub struct InvalidPortRange(String);

impl FromStr for PortRange {
    type Err = InvalidPortRange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidPortRange(s.to_owned());
        let (min, max) = s.split_once(':').ok_or_else(err)?;
        let min = min.trim().parse().map_err(|_| err())?;
        let max = max.trim().parse().map_err(|_| err())?;
        Self::new(min, max).ok_or_else(err)
    }
}

impl TryFrom<String> for PortRange {
    type Error = InvalidPortRange;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A [`PortAllocator`] handing out the lowest free, bindable port in a range.
#[derive(Debug)]
pub struct PortPool {
    range: PortRange,
    allocated: Mutex<HashMap<String, BTreeSet<u16>>>,
}

impl PortPool {
    /// Creates a pool over `range`.
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            allocated: Mutex::new(HashMap::new()),
        }
    }
}

impl PortAllocator for PortPool {
    fn acquire(&self, host: &str) -> Result<u16, PortError> {
        let mut allocated = self.allocated.lock();
        let taken = allocated.entry(host.to_owned()).or_default();
        for port in self.range.min..=self.range.max {
            if taken.contains(&port) {
                continue;
            }
            // Skip ports some other process is already listening on.
            if TcpListener::bind((host, port)).is_err() {
                continue;
            }
            taken.insert(port);
            tracing::debug!(host, port, "allocated console port");
            return Ok(port);
        }
        Err(PortError::Exhausted {
            host: host.to_owned(),
            range: self.range,
        })
    }

    fn release(&self, host: &str, port: u16) -> Result<(), PortError> {
        let mut allocated = self.allocated.lock();
        let removed = allocated
            .get_mut(host)
            .is_some_and(|taken| taken.remove(&port));
        if !removed {
            return Err(PortError::Released {
                host: host.to_owned(),
                port,
            });
        }
        tracing::debug!(host, port, "released console port");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn parse_range() {
        assert_eq!(
            "10000:20000".parse::<PortRange>().unwrap(),
            PortRange::new(10000, 20000).unwrap()
        );
        assert!("20000:10000".parse::<PortRange>().is_err());
        assert!("10000".parse::<PortRange>().is_err());
        assert!("a:b".parse::<PortRange>().is_err());
    }

    fn free_port() -> u16 {
        TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn acquire_release() {
        let port = free_port();
        let pool = PortPool::new(PortRange::new(port, port).unwrap());

        assert_eq!(pool.acquire("127.0.0.1").unwrap(), port);
        assert!(matches!(
            pool.acquire("127.0.0.1"),
            Err(PortError::Exhausted { .. })
        ));

        pool.release("127.0.0.1", port).unwrap();
        assert_eq!(pool.acquire("127.0.0.1").unwrap(), port);
    }

    #[test]
    fn skips_ports_in_use() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = PortPool::new(PortRange::new(port, port).unwrap());
        assert!(matches!(
            pool.acquire("127.0.0.1"),
            Err(PortError::Exhausted { .. })
        ));
    }

    #[test]
    fn release_unknown_port() {
        let pool = PortPool::new(PortRange::default());
        assert!(matches!(
            pool.release("127.0.0.1", 10000),
            Err(PortError::Released { port: 10000, .. })
        ));
    }
}
