//! Load balancer for host → poller assignment
//!
//! Min-heap of pollers keyed by (assigned hosts, creation index). Only
//! consulted the first time a host is seen.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

pub struct LoadBalancer {
    counts: Vec<usize>,
    heap: BinaryHeap<Reverse<(usize, usize)>>,
}

impl LoadBalancer {
    /// Create a balancer over `pool_size` pollers, all with zero hosts
    pub fn new(pool_size: usize) -> Self {
        Self {
            counts: vec![0; pool_size],
            heap: (0..pool_size).map(|index| Reverse((0, index))).collect(),
        }
    }

    /// Pick the least loaded poller for a new host and charge it one host.
    ///
    /// Ties go to the poller created first. Returns None for an empty pool.
    pub fn pick_worker_for_new_host(&mut self) -> Option<usize> {
        let Reverse((count, index)) = self.heap.pop()?;
        self.counts[index] = count + 1;
        self.heap.push(Reverse((count + 1, index)));
        Some(index)
    }

    /// Give back one host slot after a cache eviction
    pub fn release(&mut self, index: usize) {
        let Some(count) = self.counts.get_mut(index) else {
            return;
        };
        *count = count.saturating_sub(1);
        // BinaryHeap has no decrease-key: rebuild, O(pool) and rare
        self.heap = self
            .counts
            .iter()
            .enumerate()
            .map(|(index, &count)| Reverse((count, index)))
            .collect();
    }

    pub fn assigned_hosts(&self, index: usize) -> usize {
        self.counts.get(index).copied().unwrap_or(0)
    }
}
