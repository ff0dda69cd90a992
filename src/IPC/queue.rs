// Per-core ring of buffer offsets.
// Not lock-free: every operation runs with the arena lock held, which is what makes
// enqueue order on one ring the global, lock-serialized send order.

use super::layout::{CoreQueue, QUEUE_CAPACITY};
use crate::error::{IpcError, Result};

const MASK: u8 = (QUEUE_CAPACITY - 1) as u8;

impl CoreQueue {
    /// Reset to empty and stamp the capacity. Master only, during bring-up.
    pub fn init(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.size = QUEUE_CAPACITY as u8;
        self.align = 0;
        self.slots = [0; QUEUE_CAPACITY];
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        QUEUE_CAPACITY
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        (self.head.wrapping_add(1) & MASK) == self.tail
    }

    /// Entries waiting to be received.
    #[inline]
    pub fn len(&self) -> usize {
        (self.head.wrapping_sub(self.tail) & MASK) as usize
    }

    /// Append an offset. A full ring is left untouched.
    pub fn push(&mut self, entry: u32) -> Result<()> {
        if self.is_full() {
            return Err(IpcError::QueueFull);
        }
        self.slots[self.head as usize] = entry;
        self.head = self.head.wrapping_add(1) & MASK;
        Ok(())
    }

    /// Remove the oldest offset.
    pub fn pop(&mut self) -> Result<u32> {
        if self.is_empty() {
            return Err(IpcError::QueueEmpty);
        }
        let entry = self.slots[self.tail as usize];
        self.slots[self.tail as usize] = 0;
        self.tail = self.tail.wrapping_add(1) & MASK;
        Ok(entry)
    }

    /// Oldest offset without removing it.
    pub fn peek(&self) -> Option<u32> {
        if self.is_empty() {
            None
        } else {
            Some(self.slots[self.tail as usize])
        }
    }
}

impl Default for CoreQueue {
    fn default() -> Self {
        let mut queue = Self {
            head: 0,
            tail: 0,
            size: 0,
            align: 0,
            slots: [0; QUEUE_CAPACITY],
        };
        queue.init();
        queue
    }
}
