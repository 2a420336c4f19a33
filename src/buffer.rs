use std::collections::VecDeque;
use std::sync::Arc;

use crate::protocol::FrameEvent;

/// Bounded window of the most recent frames. Pushing past capacity evicts
/// from the head, oldest first.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<Arc<FrameEvent>>,
    capacity: usize,
}

impl FrameBuffer {
    /// Capacity is clamped to at least one frame.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append to the tail. Returns how many frames were evicted.
    pub fn push(&mut self, frame: Arc<FrameEvent>) -> usize {
        self.frames.push_back(frame);
        self.evict_overflow()
    }

    pub fn extend<I>(&mut self, frames: I) -> usize
    where
        I: IntoIterator<Item = Arc<FrameEvent>>,
    {
        frames.into_iter().map(|frame| self.push(frame)).sum()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Independent copy of the current contents, oldest first. Later pushes
    /// or clears never show through an already-taken snapshot.
    pub fn snapshot(&self) -> Vec<Arc<FrameEvent>> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_overflow(&mut self) -> usize {
        let overflow = self.frames.len().saturating_sub(self.capacity);
        if overflow > 0 {
            self.frames.drain(..overflow);
        }
        overflow
    }
}
