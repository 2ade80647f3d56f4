//! Intake queue with fixed-window dispatch.
//!
//! Shared by every streaming module: samples accumulate in a FIFO and come
//! out as whole windows through a reusable buffer, so steady-state dispatch
//! allocates nothing. Not internally synchronised; embed it behind the
//! owning module's lock.

use std::collections::VecDeque;

/// FIFO of samples dispatched in fixed windows.
pub struct WindowedQueue {
    queue: VecDeque<f32>,
    window: Vec<f32>,
    window_size: usize,
    submitted: u64,
    dispatched: u64,
}

impl WindowedQueue {
    pub fn new(window_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            window: vec![0.0; window_size],
            window_size,
            submitted: 0,
            dispatched: 0,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.queue.extend(samples.iter().copied());
        self.submitted += samples.len() as u64;
    }

    /// Whether a full window is available.
    pub fn has_window(&self) -> bool {
        self.queue.len() >= self.window_size
    }

    /// Move one window into the reusable buffer and return it.
    ///
    /// Returns `None` while fewer than `window_size` samples are queued;
    /// the remainder stays in the queue.
    pub fn pop_window(&mut self) -> Option<&[f32]> {
        if !self.has_window() {
            return None;
        }
        for slot in self.window.iter_mut() {
            *slot = self.queue.pop_front().unwrap_or(0.0);
        }
        self.dispatched += self.window_size as u64;
        Some(&self.window)
    }

    /// Drain whatever is left, window-sized or not. Used by flush.
    pub fn take_remainder(&mut self) -> Vec<f32> {
        let rest: Vec<f32> = self.queue.drain(..).collect();
        self.dispatched += rest.len() as u64;
        rest
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }
}
