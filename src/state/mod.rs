//! # State Module
//!
//! Incremental device-state reconstruction.
//!
//! This module handles:
//! - Shallow-merging partial telemetry into one canonical record
//! - Deriving health, lock and cell-balance metrics on demand
//! - Recording an append-only history of merged snapshots

pub mod device;
pub mod derive;
pub mod history;
pub mod engine;
