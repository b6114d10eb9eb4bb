//! Minimum-extraction priority queue used to keep the lowest fees of a block.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use thiserror::Error;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("pop from an empty queue")]
pub struct EmptyQueue;

/// Priority queue that always yields its smallest element first.
#[derive(Debug, Clone)]
pub struct MinQueue<T: Ord> {
    heap: BinaryHeap<Reverse<T>>,
}

impl<T: Ord> MinQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: T) {
        self.heap.push(Reverse(value));
    }

    /// Removes the smallest element. Popping an empty queue is an error.
    pub fn pop(&mut self) -> Result<T, EmptyQueue> {
        self.heap.pop().map(|Reverse(v)| v).ok_or(EmptyQueue)
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|Reverse(v)| v)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drains at most `k` of the smallest elements, ascending.
    pub fn take_lowest(mut self, k: usize) -> Vec<T> {
        let mut lowest = Vec::with_capacity(k.min(self.len()));
        while lowest.len() < k {
            match self.pop() {
                Ok(value) => lowest.push(value),
                Err(EmptyQueue) => break,
            }
        }
        lowest
    }
}

impl<T: Ord> Default for MinQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> FromIterator<T> for MinQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            heap: iter.into_iter().map(Reverse).collect(),
        }
    }
}

impl<T: Ord> Extend<T> for MinQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.heap.extend(iter.into_iter().map(Reverse));
    }
}
