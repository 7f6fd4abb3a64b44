//! # Protocol Module
//!
//! JSON text protocol spoken with the device over the session socket.
//!
//! This module handles:
//! - Outbound command identifiers and their timestamped envelope
//! - Decoding inbound frames into a closed set of message kinds

pub mod command;
pub mod message;
