//! Shared types and constants for the UPF monitor
//!
//! This crate provides the records and constants shared between the
//! gtp5g eBPF probes and the userspace daemon.

#![no_std]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{DropEvent, PacketEvent, TrafficCounter};
