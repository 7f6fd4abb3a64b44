//! # Session History
//!
//! Append-only log of merged device-state snapshots, one per dynamic
//! telemetry batch. Entries hold raw state only; derived metrics are
//! recomputed whenever an entry is read back.

use serde::Serialize;

use super::derive::DerivedMetrics;
use super::device::DeviceState;

/// Immutable snapshot of the device state at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionHistoryEntry {
    timestamp: String,
    state: DeviceState,
}

impl SessionHistoryEntry {
    /// Capture a snapshot; the state is copied, not shared
    pub fn capture(timestamp: String, state: &DeviceState) -> Self {
        Self {
            timestamp,
            state: state.clone(),
        }
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Metrics for this snapshot, computed with the current formulas
    pub fn metrics(&self) -> DerivedMetrics {
        DerivedMetrics::compute(&self.state)
    }
}

/// Ordered, append-only collection of [`SessionHistoryEntry`]
#[derive(Debug, Clone, Default)]
pub struct SessionHistory {
    entries: Vec<SessionHistoryEntry>,
}

impl SessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot of `state` tagged with `timestamp`
    pub fn append(&mut self, timestamp: String, state: &DeviceState) {
        self.entries.push(SessionHistoryEntry::capture(timestamp, state));
    }

    /// Entries in receipt order
    pub fn entries(&self) -> &[SessionHistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&SessionHistoryEntry> {
        self.entries.last()
    }
}
