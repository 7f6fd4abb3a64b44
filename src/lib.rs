//! # BMS Link Library
//!
//! Live diagnostic sessions with a battery-management unit over WebSocket.
//!
//! This library keeps one connection to the device alive, sends commands,
//! and rebuilds a coherent device state from the partial telemetry batches
//! the device pushes back, together with derived health metrics and an
//! append-only session history for export.

pub mod capability;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod timestamp;
pub mod transport;
