use std::collections::VecDeque;

use crate::frame::Frame;

/// Fixed-capacity ring of the most recent processed frames of one camera.
///
/// Capacity is `recording_fps * buffer_seconds`; pushing past it evicts the oldest frame.
#[derive(Debug)]
pub struct RollingBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
