//! eBPF UPF Monitor - Kernel Space Program
//!
//! This eBPF program observes the gtp5g kernel module, counting uplink and
//! downlink traffic per direction and per TEID, and reporting packet drops
//! and (optionally) per-packet detail to userspace through ring buffers.
//!
//! ## Architecture
//!
//! ```text
//! gtp5g_encap_recv() -> TRAFFIC_STATS[uplink], TEID_STATS[teid], PACKET_EVENTS
//! gtp5g_dev_xmit()   -> TRAFFIC_STATS[downlink], PACKET_EVENTS
//! skb:kfree_skb      -> DROP_EVENTS (when enabled in AGENT_CONFIG)
//!                  |
//!                  v
//! Userspace        -> Sum per-CPU counters, drain ring buffers,
//!                     enrich events with PFCP session context
//! ```
//!
//! Handlers only perform O(1) counter updates and non-blocking ring
//! buffer reservations.
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none -p upf-monitor-ebpf
//! ```
//!
//! The compiled bytecode is then loaded by the userspace daemon.

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod skb;

// Re-export probe functions so they're visible to the loader
pub use handlers::{gtp5g_dev_xmit, gtp5g_encap_recv, kfree_skb_drop};

// Re-export maps for verification
pub use maps::{AGENT_CONFIG, DROP_EVENTS, PACKET_EVENTS, PROBE_STATS, TEID_STATS, TRAFFIC_STATS};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // The verifier rejects any path that could reach this
    loop {}
}

#[no_mangle]
#[link_section = "license"]
pub static LICENSE: [u8; 4] = *b"GPL\0";
