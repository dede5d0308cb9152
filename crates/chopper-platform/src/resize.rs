// SPDX-License-Identifier: CEPL-1.0
use std::collections::VecDeque;
use tracing::trace;
use winit::dpi::PhysicalSize;

/// Bounded channel of resize notifications between the event pump and the
/// frame loop, drained once per loop iteration.
///
/// Only the newest size matters for swapchain recreation, so when the queue
/// is full the oldest entry is discarded instead of blocking the pump.
#[derive(Debug)]
pub struct ResizeQueue {
    events: VecDeque<PhysicalSize<u32>>,
    capacity: usize,
    dropped: u64,
}

impl ResizeQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, size: PhysicalSize<u32>) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        trace!("resize queued: {}x{}", size.width, size.height);
        self.events.push_back(size);
    }

    /// Empties the queue and returns the most recent size, if any arrived.
    pub fn drain_latest(&mut self) -> Option<PhysicalSize<u32>> {
        let latest = self.events.back().copied();
        self.events.clear();
        latest
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Notifications discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for ResizeQueue {
    fn default() -> Self {
        Self::new(8)
    }
}
