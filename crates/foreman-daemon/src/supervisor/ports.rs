//! Worker port allocation.

use std::collections::BTreeSet;
use std::net::TcpListener;

use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("No free port in {start}..{end}")]
    Exhausted { start: u16, end: u32 },

    #[error("Failed to obtain an ephemeral port: {0}")]
    Ephemeral(#[from] std::io::Error),
}

/// Hands out ports from a fixed range, or from the OS when `start` is 0.
#[derive(Debug)]
pub struct PortAllocator {
    host: String,
    start: u16,
    len: u16,
    in_use: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(host: impl Into<String>, start: u16, len: u16) -> Self {
        Self {
            host: host.into(),
            start,
            len,
            in_use: BTreeSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Result<u16, PortError> {
        if self.start == 0 {
            return self.allocate_ephemeral();
        }

        for offset in 0..self.len {
            let Some(port) = self.start.checked_add(offset) else {
                break;
            };
            if self.in_use.contains(&port) {
                continue;
            }
            if TcpListener::bind((self.host.as_str(), port)).is_ok() {
                self.in_use.insert(port);
                debug!(port, "Allocated worker port");
                return Ok(port);
            }
            debug!(port, "Port busy, skipping");
        }
        Err(PortError::Exhausted {
            start: self.start,
            end: u32::from(self.start) + u32::from(self.len),
        })
    }

    fn allocate_ephemeral(&mut self) -> Result<u16, PortError> {
        // The OS rarely hands the same port out twice in a row, but a port
        // we still hold must never be returned.
        for _ in 0..16 {
            let port = TcpListener::bind((self.host.as_str(), 0))?
                .local_addr()?
                .port();
            if self.in_use.insert(port) {
                debug!(port, "Allocated ephemeral worker port");
                return Ok(port);
            }
        }
        Err(PortError::Exhausted { start: 0, end: 0 })
    }

    pub fn release(&mut self, port: u16) {
        if self.in_use.remove(&port) {
            debug!(port, "Released worker port");
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_ports_are_distinct() {
        let mut ports = PortAllocator::new("127.0.0.1", 0, 0);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(ports.in_use(), 2);
        ports.release(a);
        assert_eq!(ports.in_use(), 1);
    }

    #[test]
    fn range_skips_ports_held_by_others() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let start = held.local_addr().unwrap().port();
        let mut ports = PortAllocator::new("127.0.0.1", start, 2);
        match ports.allocate() {
            Ok(port) => assert_eq!(port, start.wrapping_add(1)),
            // the neighbour may be taken too on a busy machine
            Err(PortError::Exhausted { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn range_exhaustion_is_reported() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let start = held.local_addr().unwrap().port();
        let mut ports = PortAllocator::new("127.0.0.1", start, 1);
        let err = ports.allocate().unwrap_err();
        assert!(matches!(err, PortError::Exhausted { .. }));
    }
}
