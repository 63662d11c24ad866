//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code.

/// Packet and byte counter
///
/// Stored per CPU in `TRAFFIC_STATS` (one slot per direction) and in
/// `TEID_STATS` (one entry per TEID). Userspace sums the per-CPU copies.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficCounter {
    /// Packets observed
    pub packets: u64,
    /// Bytes observed (`skb->len`)
    pub bytes: u64,
    /// Last update (bpf_ktime_get_ns, 0 if never updated)
    pub timestamp_ns: u64,
}

/// One dropped packet, sent through the `DROP_EVENTS` ring buffer
///
/// Attribution fields are best-effort: the generic kfree_skb hook leaves
/// them zero when the buffer does not start with a GTP-U/IPv4 header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DropEvent {
    /// Timestamp when the drop occurred (nanoseconds, monotonic)
    pub timestamp_ns: u64,
    /// Tunnel endpoint identifier (host byte order, 0 = unknown)
    pub teid: u32,
    /// Source IP address (network byte order)
    pub src_ip: u32,
    /// Destination IP address (network byte order)
    pub dst_ip: u32,
    /// Source port (host byte order)
    pub src_port: u16,
    /// Destination port (host byte order)
    pub dst_port: u16,
    /// Packet length
    pub pkt_len: u32,
    /// Drop reason (see DROP_REASON_* constants)
    pub reason: u8,
    /// Direction (see DIRECTION_* constants)
    pub direction: u8,
    /// Padding for alignment
    pub _padding: [u8; 2],
}

/// Per-packet detail, sent through the `PACKET_EVENTS` ring buffer
/// while detailed tracing is enabled.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketEvent {
    /// Timestamp (nanoseconds, monotonic)
    pub timestamp_ns: u64,
    /// Tunnel endpoint identifier (host byte order, 0 = unknown)
    pub teid: u32,
    /// Source IP address (network byte order)
    pub src_ip: u32,
    /// Destination IP address (network byte order)
    pub dst_ip: u32,
    /// Packet length
    pub pkt_len: u32,
    /// Direction (see DIRECTION_* constants)
    pub direction: u8,
    /// QoS flow identifier from the PDU session container (0 if absent)
    pub qfi: u8,
    /// Padding for alignment
    pub _padding: [u8; 6],
}

// Compile-time layout checks
const _: () = {
    assert!(core::mem::size_of::<TrafficCounter>() == 24);
    assert!(core::mem::size_of::<DropEvent>() == 32);
    assert!(core::mem::size_of::<PacketEvent>() == 32);
    assert!(core::mem::size_of::<DropEvent>() % core::mem::align_of::<DropEvent>() == 0);
    assert!(core::mem::size_of::<PacketEvent>() % core::mem::align_of::<PacketEvent>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for TrafficCounter {}
    unsafe impl aya::Pod for DropEvent {}
    unsafe impl aya::Pod for PacketEvent {}
}
