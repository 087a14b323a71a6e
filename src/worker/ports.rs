//! Per-session port reservation.
//!
//! Each running worker listens on its own port from the configured range.
//! A reservation is held by a [`PortLease`] and returned to the pool when
//! the lease drops.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::config::PortRangeConfig;
use crate::{AppError, Result};

#[derive(Debug)]
struct PortPool {
    base: u16,
    count: u16,
    reserved: Mutex<HashSet<u16>>,
}

impl PortPool {
    fn release(&self, port: u16) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }
}

/// Hands out distinct ports from a fixed range.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    pool: Arc<PortPool>,
}

impl PortAllocator {
    /// Create an allocator over `range`.
    #[must_use]
    pub fn new(range: PortRangeConfig) -> Self {
        Self {
            pool: Arc::new(PortPool {
                base: range.base,
                count: range.count,
                reserved: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Reserve the lowest free port that no other process is bound to.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LaunchFailed` when every port in the range is taken.
    pub fn reserve(&self) -> Result<PortLease> {
        let mut reserved = self
            .pool
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for offset in 0..self.pool.count {
            let Some(port) = self.pool.base.checked_add(offset) else {
                break;
            };
            if reserved.contains(&port) {
                continue;
            }
            if !port_is_free(port) {
                debug!(port, "port held by another process, skipping");
                continue;
            }
            reserved.insert(port);
            return Ok(PortLease {
                port,
                pool: Arc::clone(&self.pool),
            });
        }

        Err(AppError::LaunchFailed(format!(
            "no free port in range {}..{}",
            self.pool.base,
            u32::from(self.pool.base) + u32::from(self.pool.count)
        )))
    }

    /// Number of ports currently reserved.
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.pool
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Reservation of one port; released on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    pool: Arc<PortPool>,
}

impl PortLease {
    /// Reserved port number.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}
