//! Port allocation for preview dev servers.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Default starting port for preview dev servers.
pub const DEFAULT_PORT_RANGE_START: u16 = 3002;
/// Default ending port for preview dev servers.
pub const DEFAULT_PORT_RANGE_END: u16 = 3012;

/// Snapshot of which pool ports are taken.
///
/// Advisory only: the allocator may change as soon as the lock is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortUsage {
    pub used: Vec<u16>,
    pub available: Vec<u16>,
}

/// Hands out ports from a fixed contiguous range.
pub struct PortAllocator {
    /// Starting port (inclusive).
    base_port: u16,
    /// Maximum port (exclusive).
    max_port: u16,
    /// Ports currently bound to a live session.
    used_ports: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Create a new port allocator with the given range.
    pub fn new(base_port: u16, max_port: u16) -> Self {
        Self {
            base_port,
            max_port: max_port.max(base_port),
            used_ports: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocate the lowest free port.
    ///
    /// Returns `None` if every port in the range is in use.
    pub fn allocate(&self) -> Option<u16> {
        let mut used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        let port = (self.base_port..self.max_port).find(|p| !used.contains(p))?;
        used.insert(port);
        Some(port)
    }

    /// Release a port. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        let mut used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        used.remove(&port);
    }

    /// Used and free ports, both in ascending order.
    pub fn usage(&self) -> PortUsage {
        let used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        PortUsage {
            used: used.iter().copied().collect(),
            available: (self.base_port..self.max_port)
                .filter(|p| !used.contains(p))
                .collect(),
        }
    }

    /// Total number of ports in the pool.
    pub fn capacity(&self) -> usize {
        (self.max_port - self.base_port) as usize
    }

    /// Get the number of currently allocated ports.
    pub fn allocated_count(&self) -> usize {
        let used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        used.len()
    }

    /// Get the number of available ports.
    pub fn available_count(&self) -> usize {
        self.capacity().saturating_sub(self.allocated_count())
    }

    /// Check if a specific port is available.
    pub fn is_available(&self, port: u16) -> bool {
        if port < self.base_port || port >= self.max_port {
            return false;
        }
        let used = self.used_ports.lock().unwrap_or_else(|e| e.into_inner());
        !used.contains(&port)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let allocator = PortAllocator::new(3002, 3005);

        assert_eq!(allocator.allocate(), Some(3002));
        assert_eq!(allocator.allocate(), Some(3003));
        assert_eq!(allocator.allocate(), Some(3004));
        assert_eq!(allocator.allocate(), None); // Range exhausted

        allocator.release(3003);
        assert_eq!(allocator.allocate(), Some(3003));
        assert_eq!(allocator.allocate(), None);
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = PortAllocator::new(3002, 3004);
        let port = allocator.allocate().unwrap();
        allocator.release(port);
        allocator.release(port);
        allocator.release(9999);
        assert_eq!(allocator.allocated_count(), 0);
        assert_eq!(allocator.allocate(), Some(3002));
    }

    #[test]
    fn test_lowest_free_port_wins() {
        let allocator = PortAllocator::new(3002, 3006);
        for _ in 0..4 {
            allocator.allocate();
        }
        allocator.release(3004);
        allocator.release(3003);
        assert_eq!(allocator.allocate(), Some(3003));
    }

    #[test]
    fn test_usage_snapshot() {
        let allocator = PortAllocator::new(3002, 3005);
        allocator.allocate();
        allocator.allocate();
        allocator.release(3002);

        let usage = allocator.usage();
        assert_eq!(usage.used, vec![3003]);
        assert_eq!(usage.available, vec![3002, 3004]);
    }

    #[test]
    fn test_available_count() {
        let allocator = PortAllocator::new(3002, 3007);
        assert_eq!(allocator.capacity(), 5);
        assert_eq!(allocator.available_count(), 5);

        allocator.allocate();
        allocator.allocate();
        assert_eq!(allocator.available_count(), 3);
        assert_eq!(allocator.allocated_count(), 2);
        assert!(!allocator.is_available(3002));
        assert!(allocator.is_available(3004));
        assert!(!allocator.is_available(3007));
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let allocator = PortAllocator::new(4000, 3000);
        assert_eq!(allocator.capacity(), 0);
        assert_eq!(allocator.allocate(), None);
    }
}
