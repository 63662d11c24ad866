//! UPF Monitor Userspace Library
//!
//! Correlates PFCP sessions with GTP-U tunnels and joins them with the
//! traffic counters and drop events produced by the kernel probes.

pub mod capture;
pub mod clock;
pub mod collector;
pub mod config;
pub mod control;
pub mod correlation;
pub mod counters;
pub mod engine;
pub mod events;
pub mod exporter;
pub mod frame;
pub mod loader;
pub mod pfcp;
pub mod types;

pub use collector::MetricsCollector;
pub use config::EngineConfig;
pub use correlation::{CorrelationStore, Session};
pub use engine::Engine;
pub use events::{EnrichmentPipeline, EventStream, RingKind};
pub use exporter::{ExporterType, JsonExporter, MetricsExporter};
pub use loader::ProbeLoader;
pub use pfcp::Dissector;
pub use types::*;
