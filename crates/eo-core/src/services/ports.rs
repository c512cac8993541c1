use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::models::{PortAllocation, PORT_RANGE_BASE, PORT_RANGE_CEILING, PORT_RANGE_SIZE};

/// Hands out disjoint port intervals on a fixed grid and reclaims them when
/// a run's services stop. Allocation is idempotent per run id.
pub struct PortAllocator {
    inner: Mutex<HashMap<String, PortAllocation>>,
    interval_size: u16,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_interval_size(PORT_RANGE_SIZE)
    }

    pub fn with_interval_size(interval_size: u16) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            interval_size,
        }
    }

    /// Returns the run's existing interval, or the lowest-numbered free
    /// interval on the grid. Fails once the grid would pass the ceiling.
    pub fn allocate(&self, run_id: &str) -> Result<PortAllocation> {
        let mut live = self.inner.lock().unwrap();
        if let Some(existing) = live.get(run_id) {
            return Ok(existing.clone());
        }

        let mut start = PORT_RANGE_BASE;
        loop {
            // Widened compare: the grid walks right up to the u16 ceiling,
            // so `start + size` itself may not fit in u16.
            if u32::from(start) + u32::from(self.interval_size) > u32::from(PORT_RANGE_CEILING) {
                return Err(OrchestratorError::PortsExhausted(PORT_RANGE_CEILING));
            }
            if !live.values().any(|a| a.start == start) {
                let allocation = PortAllocation {
                    run_id: run_id.to_string(),
                    start,
                    size: self.interval_size,
                };
                live.insert(run_id.to_string(), allocation.clone());
                return Ok(allocation);
            }
            start += self.interval_size;
        }
    }

    pub fn release(&self, run_id: &str) {
        let mut live = self.inner.lock().unwrap();
        live.remove(run_id);
    }

    pub fn allocation_for(&self, run_id: &str) -> Option<PortAllocation> {
        self.inner.lock().unwrap().get(run_id).cloned()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocates_lowest_free_interval() {
        let allocator = PortAllocator::new();
        let a = allocator.allocate("run-a").unwrap();
        let b = allocator.allocate("run-b").unwrap();
        assert_eq!(a.start, 50000);
        assert_eq!(b.start, 51000);
    }

    #[test]
    fn allocate_is_idempotent_per_run() {
        let allocator = PortAllocator::new();
        let first = allocator.allocate("run-a").unwrap();
        let again = allocator.allocate("run-a").unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn released_interval_is_reused() {
        let allocator = PortAllocator::new();
        allocator.allocate("run-a").unwrap();
        allocator.allocate("run-b").unwrap();
        allocator.release("run-a");
        let c = allocator.allocate("run-c").unwrap();
        assert_eq!(c.start, 50000);
    }

    #[test]
    fn exhaustion_returns_error() {
        let allocator = PortAllocator::new();
        for i in 0..15 {
            allocator.allocate(&format!("run-{i}")).unwrap();
        }
        // [50000, 65000) holds exactly 15 intervals of 1000.
        assert!(matches!(
            allocator.allocate("run-overflow"),
            Err(OrchestratorError::PortsExhausted(_))
        ));
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        let allocator = Arc::new(PortAllocator::new());
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let allocator = allocator.clone();
                std::thread::spawn(move || allocator.allocate(&format!("run-{i}")).unwrap())
            })
            .collect();

        let allocations: Vec<PortAllocation> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (i, a) in allocations.iter().enumerate() {
            for b in &allocations[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn release_then_allocate_storm_stays_disjoint() {
        let allocator = Arc::new(PortAllocator::new());
        for round in 0..5 {
            for i in 0..8 {
                allocator.allocate(&format!("run-{round}-{i}")).unwrap();
            }
            for i in 0..8 {
                allocator.release(&format!("run-{round}-{i}"));
            }
        }
        let last = allocator.allocate("final").unwrap();
        assert_eq!(last.start, 50000);
    }
}
