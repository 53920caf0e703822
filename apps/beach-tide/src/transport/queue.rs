use std::collections::VecDeque;

use crate::protocol::Envelope;

/// Bounded FIFO of frames emitted while the connection is down. When full
/// the oldest frame is discarded.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<Envelope>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Queues `frame`, returning the frame evicted to make room, if any.
    pub fn push(&mut self, frame: Envelope) -> Option<Envelope> {
        let evicted = if self.frames.len() >= self.capacity {
            self.dropped += 1;
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Puts `frames` back at the head of the queue, keeping their order.
    /// Returns how many of the oldest frames were discarded to stay within
    /// capacity.
    pub fn restore(&mut self, frames: Vec<Envelope>) -> usize {
        for frame in frames.into_iter().rev() {
            self.frames.push_front(frame);
        }
        let mut dropped = 0;
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
            dropped += 1;
        }
        self.dropped += dropped as u64;
        dropped
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Envelope> + '_ {
        self.frames.drain(..)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total frames discarded over the queue's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
