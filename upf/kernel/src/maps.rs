//! BPF map definitions for UPF monitoring
//!
//! Defines the maps shared with userspace: counters read by the daemon,
//! ring buffers drained by the enrichment pipeline, and the runtime
//! configuration written by the daemon.

use aya_ebpf::{
    macros::map,
    maps::{Array, LruPerCpuHashMap, PerCpuArray, RingBuf},
};
use upf_common::{constants::*, types::*};

/// Per-CPU direction counters
///
/// Key: DIRECTION_UPLINK / DIRECTION_DOWNLINK
/// Value: TrafficCounter
///
/// Each CPU updates its own copy so the hot path takes no lock;
/// userspace sums the copies when it reads.
#[map]
pub static TRAFFIC_STATS: PerCpuArray<TrafficCounter> =
    PerCpuArray::with_max_entries(MAX_DIRECTIONS, 0);

/// Per-CPU, per-TEID counters
///
/// Key: TEID (host byte order)
/// Value: TrafficCounter
///
/// Bounded LRU table: when full, the least recently updated TEID is
/// evicted instead of growing with TEID churn.
#[map]
pub static TEID_STATS: LruPerCpuHashMap<u32, TrafficCounter> =
    LruPerCpuHashMap::with_max_entries(MAX_TEID_ENTRIES, 0);

/// Ring buffer carrying DropEvent records to userspace
#[map]
pub static DROP_EVENTS: RingBuf = RingBuf::with_byte_size(DROP_RING_BYTES, 0);

/// Ring buffer carrying PacketEvent records to userspace
#[map]
pub static PACKET_EVENTS: RingBuf = RingBuf::with_byte_size(PACKET_RING_BYTES, 0);

/// Runtime configuration (see CONFIG_* constants)
#[map]
pub static AGENT_CONFIG: Array<u32> = Array::with_max_entries(MAX_CONFIG_SLOTS, 0);

/// Probe health counters
///
/// Key: stat_id (see STAT_* constants)
/// Value: u64 counter
#[map]
pub static PROBE_STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(MAX_STATS, 0);
