//! Helper functions for eBPF programs
//!
//! Counter updates and ring buffer writes. Everything here is O(1) and
//! never waits: ring buffer reservation failures are counted and the
//! event is dropped.

use aya_ebpf::{helpers::bpf_ktime_get_ns, programs::ProbeContext};
use aya_log_ebpf::warn;
use upf_common::{constants::*, types::*};

use crate::maps::*;

/// Get current timestamp in nanoseconds
#[inline(always)]
pub fn get_timestamp() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

/// Increment a probe statistics counter
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    if let Some(count) = PROBE_STATS.get_ptr_mut(stat_id) {
        unsafe { *count += 1 };
    }
}

/// Read a configuration slot (0 when unset)
#[inline(always)]
pub fn config_value(slot: u32) -> u32 {
    AGENT_CONFIG.get(slot).copied().unwrap_or(0)
}

#[inline(always)]
pub fn config_enabled(slot: u32) -> bool {
    config_value(slot) != 0
}

/// Account one packet on this CPU's direction counter
#[inline(always)]
pub fn update_direction_counter(direction: u8, len: u32, now: u64) {
    if let Some(counter) = TRAFFIC_STATS.get_ptr_mut(direction as u32) {
        unsafe {
            (*counter).packets += 1;
            (*counter).bytes += len as u64;
            (*counter).timestamp_ns = now;
        }
    }
}

/// Account one packet on the per-TEID counter, creating it on first sight
#[inline(always)]
pub fn update_teid_counter(ctx: &ProbeContext, teid: u32, len: u32, now: u64) {
    if let Some(counter) = TEID_STATS.get_ptr_mut(&teid) {
        unsafe {
            (*counter).packets += 1;
            (*counter).bytes += len as u64;
            (*counter).timestamp_ns = now;
        }
        return;
    }

    let counter = TrafficCounter {
        packets: 1,
        bytes: len as u64,
        timestamp_ns: now,
    };
    if TEID_STATS.insert(&teid, &counter, 0).is_err() {
        increment_stat(STAT_TEID_INSERT_FAILED);
        warn!(ctx, "teid_stats insert failed for teid {}", teid);
    }
}

/// Submit a drop event, counting it as lost if the ring buffer is full
#[inline(always)]
pub fn emit_drop_event(event: DropEvent) {
    match DROP_EVENTS.reserve::<DropEvent>(0) {
        Some(mut entry) => {
            entry.write(event);
            entry.submit(0);
            increment_stat(STAT_DROP_EVENTS);
        }
        None => increment_stat(STAT_DROP_RING_FULL),
    }
}

/// Submit a packet event, counting it as lost if the ring buffer is full
#[inline(always)]
pub fn emit_packet_event(event: PacketEvent) {
    match PACKET_EVENTS.reserve::<PacketEvent>(0) {
        Some(mut entry) => {
            entry.write(event);
            entry.submit(0);
            increment_stat(STAT_PACKET_EVENTS);
        }
        None => increment_stat(STAT_PACKET_RING_FULL),
    }
}
