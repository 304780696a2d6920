//! Host port allocation.

use std::{
    collections::HashSet,
    net::TcpListener,
    sync::{Mutex, PoisonError},
};

use tracing::debug;

use crate::error::PortError;

/// Check if a port can be bound on the loopback interface.
#[must_use]
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[derive(Debug)]
struct PoolState {
    next: u16,
    assigned: HashSet<u16>,
}

/// Hands out host ports from a fixed range.
///
/// Candidates come from a counter that only moves forward (wrapping at the
/// end of the range). Ports held by live sandboxes are never handed out twice.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    probe: bool,
    state: Mutex<PoolState>,
}

impl PortPool {
    /// Create a pool over `start..=end`.
    #[must_use]
    pub fn new(start: u16, end: u16, probe: bool) -> Self {
        let end = end.max(start);
        Self {
            start,
            end,
            probe,
            state: Mutex::new(PoolState {
                next: start,
                assigned: HashSet::new(),
            }),
        }
    }

    /// Reserve a free port.
    ///
    /// # Errors
    ///
    /// Returns `PortError::Exhausted` if every port in the range is taken.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let span = u32::from(self.end - self.start) + 1;

        for _ in 0..span {
            let candidate = state.next;
            state.next = if candidate >= self.end {
                self.start
            } else {
                candidate + 1
            };

            if state.assigned.contains(&candidate) {
                continue;
            }
            if self.probe && !is_port_available(candidate) {
                debug!(port = candidate, "Port in use, skipping");
                continue;
            }
            state.assigned.insert(candidate);
            return Ok(candidate);
        }

        Err(PortError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.assigned.remove(&port);
    }

    #[must_use]
    pub fn is_assigned(&self, port: u16) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.assigned.contains(&port)
    }
}
