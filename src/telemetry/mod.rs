//! # Telemetry Module
//!
//! Turns the session history into export records.
//!
//! This module handles:
//! - Replaying history entries with freshly derived metrics
//! - Formatting as JSONL (JSON Lines)
//! - Writing the export file at the end of a session

pub mod export;
