//! Fixed-capacity ring holding the most recent pre-speech audio.
//!
//! While no speech is detected the pipeline appends every window here,
//! overwriting the oldest samples. When a segment is detected the ring's
//! contents are prepended to it, giving the segment a natural onset.

/// Circular sample buffer with power-of-two capacity.
pub struct PaddingRing {
    buf: Vec<f32>,
    head: usize,
    len: usize,
}

impl PaddingRing {
    /// Capacity for `padding_seconds` of audio: `next_power_of_two(max(16,
    /// padding_seconds * sample_rate))`.
    pub fn capacity_for(padding_seconds: f32, sample_rate: u32) -> usize {
        let samples = (padding_seconds * sample_rate as f32).ceil() as usize;
        samples.max(16).next_power_of_two()
    }

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(16).next_power_of_two();
        Self {
            buf: vec![0.0; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append samples, overwriting the oldest once full.
    pub fn push_slice(&mut self, samples: &[f32]) {
        let capacity = self.buf.len();
        // Only the trailing `capacity` samples can survive.
        let tail = if samples.len() > capacity {
            &samples[samples.len() - capacity..]
        } else {
            samples
        };

        for &sample in tail {
            let write = (self.head + self.len) & (capacity - 1);
            self.buf[write] = sample;
            if self.len < capacity {
                self.len += 1;
            } else {
                self.head = (self.head + 1) & (capacity - 1);
            }
        }
    }

    /// Copy out the contents oldest-first without clearing.
    pub fn peek(&self) -> Vec<f32> {
        let capacity = self.buf.len();
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            out.push(self.buf[(self.head + i) & (capacity - 1)]);
        }
        out
    }

    /// Copy out the contents oldest-first and clear the ring.
    pub fn take(&mut self) -> Vec<f32> {
        let out = self.peek();
        self.clear();
        out
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}
