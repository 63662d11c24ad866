//! Userspace type definitions
//!
//! Defines the data structures used by the userspace program for
//! enrichment, aggregation and export.
//!
//! ## Organization
//!
//! This module separates kernel and userspace types:
//! - **Kernel Types**: Types shared with eBPF programs (from upf_common)
//! - **Userspace Types**: Types used only in userspace for enrichment and export

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, net::Ipv4Addr};

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between kernel eBPF programs and userspace
    //!
    //! These are re-exported from the upf-common crate and must
    //! maintain binary compatibility with the eBPF programs.

    pub use upf_common::constants;
    pub use upf_common::types::{DropEvent, PacketEvent, TrafficCounter};
}

// Re-export commonly used kernel types at module level for convenience
pub use kernel::{DropEvent, PacketEvent, TrafficCounter};

use kernel::constants::*;

/// Traffic direction relative to the UPF
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Uplink,
    Downlink,
    Unknown,
}

impl Direction {
    /// Decode the kernel's DIRECTION_* value
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            DIRECTION_UPLINK => Direction::Uplink,
            DIRECTION_DOWNLINK => Direction::Downlink,
            _ => Direction::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
            Direction::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a packet was dropped
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NoPdr,
    InvalidTeid,
    Qos,
    Kernel,
    Other,
}

impl DropReason {
    /// Decode the kernel's DROP_REASON_* value
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            DROP_REASON_NO_PDR => DropReason::NoPdr,
            DROP_REASON_INVALID_TEID => DropReason::InvalidTeid,
            DROP_REASON_QOS => DropReason::Qos,
            DROP_REASON_KERNEL => DropReason::Kernel,
            _ => DropReason::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NoPdr => "NO_PDR",
            DropReason::InvalidTeid => "INVALID_TEID",
            DropReason::Qos => "QOS",
            DropReason::Kernel => "KERNEL_DROP",
            DropReason::Other => "UNKNOWN",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session context attached to a kernel event whose TEID resolved
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionContext {
    /// PFCP session endpoint identifier
    pub seid: u64,
    /// UE address, if learned from the establishment request
    pub ue_ip: Option<Ipv4Addr>,
    /// When the session was established
    pub created_at: DateTime<Utc>,
}

/// Drop event after the correlation lookup
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnrichedDropEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub teid: u32,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub pkt_len: u32,
    pub reason: DropReason,
    pub direction: Direction,
    /// Set when the TEID is zero or not mapped to any session
    pub unresolved: bool,
    pub session: Option<SessionContext>,
}

/// Packet event after the correlation lookup
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnrichedPacketEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub teid: u32,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub pkt_len: u32,
    pub direction: Direction,
    pub qfi: u8,
    pub unresolved: bool,
    pub session: Option<SessionContext>,
}

/// Traffic statistics for one direction
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct DirectionStats {
    /// Packets since the probes were attached
    pub packets: u64,
    /// Bytes since the probes were attached
    pub bytes: u64,
    /// Packets since the previous snapshot
    pub delta_packets: u64,
    /// Bytes since the previous snapshot
    pub delta_bytes: u64,
    /// Throughput over the last interval in Mbit/s
    pub throughput_mbps: f64,
    /// Last time a probe touched the counter
    pub last_updated: Option<DateTime<Utc>>,
}

/// Periodic traffic snapshot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrafficStats {
    pub uplink: DirectionStats,
    pub downlink: DirectionStats,
    /// Seconds covered by the deltas (0 for the first snapshot)
    pub interval_secs: f64,
    pub timestamp: DateTime<Utc>,
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self {
            uplink: DirectionStats::default(),
            downlink: DirectionStats::default(),
            interval_secs: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// One active PFCP session as seen by collaborators
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub seid: u64,
    pub ue_ip: Option<Ipv4Addr>,
    pub upf_ip: Option<Ipv4Addr>,
    pub teids: Vec<u32>,
    pub created_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub pdr_count: u32,
    pub far_count: u32,
    /// Uplink packets summed over the session's TEIDs
    pub packets_ul: u64,
    pub bytes_ul: u64,
    /// Downlink packets cannot be attributed: the downlink hook runs
    /// before the TEID is selected
    pub packets_dl: u64,
    pub bytes_dl: u64,
}

/// Item delivered to downstream consumers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    Traffic(TrafficStats),
    Drop(EnrichedDropEvent),
    Packet(EnrichedPacketEvent),
}

/// Probe health counters summed across CPUs
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeStats {
    pub uplink_packets: u64,
    pub downlink_packets: u64,
    pub drop_events: u64,
    pub drop_ring_full: u64,
    pub packet_events: u64,
    pub packet_ring_full: u64,
    pub teid_insert_failed: u64,
    pub read_errors: u64,
}

impl ProbeStats {
    /// Build from counters indexed by the STAT_* constants
    pub fn from_counts(counts: &[u64]) -> Self {
        let at = |idx: u32| counts.get(idx as usize).copied().unwrap_or(0);
        Self {
            uplink_packets: at(STAT_UPLINK_PACKETS),
            downlink_packets: at(STAT_DOWNLINK_PACKETS),
            drop_events: at(STAT_DROP_EVENTS),
            drop_ring_full: at(STAT_DROP_RING_FULL),
            packet_events: at(STAT_PACKET_EVENTS),
            packet_ring_full: at(STAT_PACKET_RING_FULL),
            teid_insert_failed: at(STAT_TEID_INSERT_FAILED),
            read_errors: at(STAT_READ_ERRORS),
        }
    }
}

/// Userspace pipeline counters
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineCounters {
    pub drops_received: u64,
    pub packets_received: u64,
    pub resolved: u64,
    pub unresolved: u64,
    /// Ring buffer items too short to hold a record
    pub malformed: u64,
    /// Events missed by subscribers that fell behind
    pub queue_overflow: u64,
}

/// PFCP capture counters
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureCounters {
    pub frames: u64,
    /// Frames that were not IPv4/UDP to the PFCP port
    pub skipped: u64,
    /// Times the device was reopened after a read error
    pub reopens: u64,
}

/// Drop count for one reason/direction pair
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DropBreakdown {
    pub reason: String,
    pub direction: String,
    pub count: u64,
}

/// Drop statistics
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct DropStats {
    pub total: u64,
    /// Drops as a percentage of observed packets
    pub rate_percent: f64,
    pub by_reason: HashMap<String, u64>,
    pub by_direction: HashMap<String, u64>,
    /// Sorted by reason, then direction
    pub breakdown: Vec<DropBreakdown>,
    pub resolved: u64,
    pub unresolved: u64,
    /// Most recent first
    pub recent_drops: Vec<EnrichedDropEvent>,
}

/// Aggregated metrics for export
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpfMetrics {
    /// ISO 8601 timestamp when metrics were collected
    pub timestamp: String,
    /// Duration of collection period in seconds
    pub duration_seconds: u64,
    /// Latest traffic snapshot
    pub traffic: TrafficStats,
    /// Drop statistics
    pub drops: DropStats,
    /// Number of active PFCP sessions
    pub active_sessions: usize,
    /// Active sessions
    pub sessions: Vec<SessionSnapshot>,
    /// Packet events seen while detailed tracing was enabled
    pub packet_events: u64,
    /// Userspace pipeline counters
    pub pipeline: PipelineCounters,
    /// Kernel probe counters
    pub probes: ProbeStats,
    /// PFCP capture counters
    pub capture: CaptureCounters,
}

/// Convert a network-byte-order IPv4 address from the kernel
pub fn ipv4_from_raw(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_be(raw))
}

/// Human readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{} B", b),
    }
}
