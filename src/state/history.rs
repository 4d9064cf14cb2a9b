//! Bounded change history backing `undo`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::value::Value;

/// One applied write. `None` marks a path that did not exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Ring buffer of the most recent change records; the oldest entry is
/// evicted first.
#[derive(Debug)]
pub(crate) struct History {
    entries: VecDeque<ChangeRecord>,
    capacity: usize,
}

impl History {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, record: ChangeRecord) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub(crate) fn pop(&mut self) -> Option<ChangeRecord> {
        self.entries.pop_back()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn records(&self) -> Vec<ChangeRecord> {
        self.entries.iter().cloned().collect()
    }
}
