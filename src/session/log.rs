//! Bounded in-memory logs.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::Local;

/// Most-recent-N ring buffer of log lines.
///
/// Oldest lines are dropped once `capacity` is reached.
#[derive(Debug)]
pub struct BoundedLog {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl BoundedLog {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(line.into());
    }

    /// Push `"HH:MM:SS - text"` using local time.
    pub fn push_timestamped(&self, text: &str) {
        self.push(format!("{} - {}", Local::now().format("%H:%M:%S"), text));
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
