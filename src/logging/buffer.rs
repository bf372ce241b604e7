//! Fixed-capacity ring buffer of recent log entries

use crate::logging::entry::{LogEntry, LogFilter};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    evicted: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            evicted: 0,
        }
    }

    /// Append, evicting the oldest entry when full
    pub fn push(&mut self, entry: LogEntry) -> Option<LogEntry> {
        let evicted = if self.entries.len() >= self.capacity {
            self.evicted += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn oldest(&self) -> Option<&LogEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// The newest `limit` entries matching `filter`, oldest first
    pub fn recent(&self, filter: Option<&LogFilter>, limit: usize) -> Vec<LogEntry> {
        let mut matched: Vec<LogEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|e| filter.map_or(true, |f| f.matches(e)))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }
}
