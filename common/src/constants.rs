//! Shared constants for the UPF monitor probes
//!
//! These constants are used by both kernel and userspace programs
//! to ensure consistency in behavior and limits.

// ============================================================================
// BPF Map Names
// ============================================================================

/// Per-CPU direction counters (uplink, downlink)
pub const MAP_TRAFFIC_STATS: &str = "TRAFFIC_STATS";

/// Per-CPU, per-TEID counters
pub const MAP_TEID_STATS: &str = "TEID_STATS";

/// Ring buffer carrying drop events
pub const MAP_DROP_EVENTS: &str = "DROP_EVENTS";

/// Ring buffer carrying detailed packet events
pub const MAP_PACKET_EVENTS: &str = "PACKET_EVENTS";

/// Runtime configuration slots written by userspace
pub const MAP_AGENT_CONFIG: &str = "AGENT_CONFIG";

/// Probe health counters
pub const MAP_PROBE_STATS: &str = "PROBE_STATS";

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Number of direction counters (uplink + downlink)
pub const MAX_DIRECTIONS: u32 = 2;

/// Maximum number of TEIDs with their own counters.
/// The table is an LRU map, so the least recently updated TEID is evicted.
pub const MAX_TEID_ENTRIES: u32 = 4096;

/// Drop event ring buffer size in bytes (256KB)
pub const DROP_RING_BYTES: u32 = 256 * 1024;

/// Packet event ring buffer size in bytes (512KB)
pub const PACKET_RING_BYTES: u32 = 512 * 1024;

/// Number of runtime configuration slots
pub const MAX_CONFIG_SLOTS: u32 = 4;

// ============================================================================
// Traffic Directions
// ============================================================================

/// GTP-U traffic received from the access network
pub const DIRECTION_UPLINK: u8 = 0;

/// Traffic transmitted towards the access network
pub const DIRECTION_DOWNLINK: u8 = 1;

/// Direction could not be determined (events only)
pub const DIRECTION_UNKNOWN: u8 = 2;

// ============================================================================
// Drop Reasons (for DropEvent.reason)
// ============================================================================

/// No packet detection rule matched
pub const DROP_REASON_NO_PDR: u8 = 0;

/// TEID not known to the UPF
pub const DROP_REASON_INVALID_TEID: u8 = 1;

/// Dropped by QoS enforcement
pub const DROP_REASON_QOS: u8 = 2;

/// Generic kernel drop (skb:kfree_skb)
pub const DROP_REASON_KERNEL: u8 = 3;

// ============================================================================
// Configuration Slots (for AGENT_CONFIG)
// ============================================================================

/// Non-zero enables per-packet events
pub const CONFIG_PACKET_TRACING: u32 = 0;

/// Non-zero enables drop events from kfree_skb
pub const CONFIG_DROP_TRACING: u32 = 1;

/// Overrides the offset of `sk_buff.len` (0 = built-in default)
pub const CONFIG_SKB_LEN_OFFSET: u32 = 2;

/// Overrides the offset of `sk_buff.data` (0 = built-in default)
pub const CONFIG_SKB_DATA_OFFSET: u32 = 3;

// ============================================================================
// sk_buff Layout
// ============================================================================

/// Offset of `len` in `struct sk_buff` (x86_64, 5.15+)
pub const DEFAULT_SKB_LEN_OFFSET: u32 = 112;

/// Offset of `data` in `struct sk_buff` (x86_64, 5.15+)
pub const DEFAULT_SKB_DATA_OFFSET: u32 = 200;

// ============================================================================
// Packet Layout
// ============================================================================

/// GTP-U well-known UDP port
pub const GTPU_PORT: u16 = 2152;

/// PFCP well-known UDP port
pub const PFCP_PORT: u16 = 8805;

/// UDP header length
pub const UDP_HLEN: u32 = 8;

/// Mandatory GTP-U header length
pub const GTPU_HLEN: u32 = 8;

/// Offset of the TEID inside the GTP-U header
pub const GTPU_TEID_OFFSET: u32 = 4;

/// Drops shorter than this are kernel noise and never reported
pub const MIN_DROP_PKT_LEN: u32 = 20;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

// ============================================================================
// Statistics Counter Indices (for PROBE_STATS map)
// ============================================================================

/// Uplink hook invocations
pub const STAT_UPLINK_PACKETS: u32 = 0;

/// Downlink hook invocations
pub const STAT_DOWNLINK_PACKETS: u32 = 1;

/// Drop events submitted to the ring buffer
pub const STAT_DROP_EVENTS: u32 = 2;

/// Drop events lost because the ring buffer was full
pub const STAT_DROP_RING_FULL: u32 = 3;

/// Packet events submitted to the ring buffer
pub const STAT_PACKET_EVENTS: u32 = 4;

/// Packet events lost because the ring buffer was full
pub const STAT_PACKET_RING_FULL: u32 = 5;

/// Failed inserts into the per-TEID table
pub const STAT_TEID_INSERT_FAILED: u32 = 6;

/// Failed kernel memory reads
pub const STAT_READ_ERRORS: u32 = 7;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 8;
