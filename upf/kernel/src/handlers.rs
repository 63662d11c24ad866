//! Probe handlers for gtp5g traffic and drop tracking
//!
//! Implements the eBPF programs attached to the gtp5g kernel module and
//! to the skb:kfree_skb tracepoint.

use aya_ebpf::{
    macros::{kprobe, tracepoint},
    programs::{ProbeContext, TracePointContext},
};
use upf_common::{constants::*, types::*};

use crate::{helpers::*, skb::*};

/// Offset of `skbaddr` in the skb:kfree_skb tracepoint record
const KFREE_SKB_SKBADDR_OFFSET: usize = 8;

/// Track uplink packets
///
/// Attached to: gtp5g_encap_recv(struct sock *sk, struct sk_buff *skb)
///
/// Called for every GTP-U datagram received on the gtp5g UDP socket.
/// `skb->data` points at the UDP header, so the TEID can be read from
/// the GTP-U header right behind it.
#[kprobe]
pub fn gtp5g_encap_recv(ctx: ProbeContext) -> u32 {
    match try_gtp5g_encap_recv(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            increment_stat(STAT_READ_ERRORS);
            0
        }
    }
}

fn try_gtp5g_encap_recv(ctx: &ProbeContext) -> Result<u32, i64> {
    let skb: *const u8 = ctx.arg(1).ok_or(-1)?;
    if skb.is_null() {
        return Ok(0);
    }

    let len = skb_len(skb)?;
    let now = get_timestamp();

    increment_stat(STAT_UPLINK_PACKETS);
    update_direction_counter(DIRECTION_UPLINK, len, now);

    let udp = skb_data(skb)?;
    let gtpu = read_gtpu(udp)?;
    if gtpu.teid != 0 {
        update_teid_counter(ctx, gtpu.teid, len, now);
    }

    if config_enabled(CONFIG_PACKET_TRACING) {
        let (src_ip, dst_ip) = read_outer_ipv4(udp);
        emit_packet_event(PacketEvent {
            timestamp_ns: now,
            teid: gtpu.teid,
            src_ip,
            dst_ip,
            pkt_len: len,
            direction: DIRECTION_UPLINK,
            qfi: gtpu.qfi,
            _padding: [0; 6],
        });
    }

    Ok(0)
}

/// Track downlink packets
///
/// Attached to: gtp5g_dev_xmit(struct sk_buff *skb, struct net_device *dev)
///
/// Called when a packet is transmitted through the gtp5g device, before
/// encapsulation: `skb->data` points at the inner IP header and the
/// TEID has not been selected yet.
#[kprobe]
pub fn gtp5g_dev_xmit(ctx: ProbeContext) -> u32 {
    match try_gtp5g_dev_xmit(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            increment_stat(STAT_READ_ERRORS);
            0
        }
    }
}

fn try_gtp5g_dev_xmit(ctx: &ProbeContext) -> Result<u32, i64> {
    let skb: *const u8 = ctx.arg(0).ok_or(-1)?;
    if skb.is_null() {
        return Ok(0);
    }

    let len = skb_len(skb)?;
    let now = get_timestamp();

    increment_stat(STAT_DOWNLINK_PACKETS);
    update_direction_counter(DIRECTION_DOWNLINK, len, now);

    if config_enabled(CONFIG_PACKET_TRACING) {
        let (src_ip, dst_ip) = match read_ipv4(skb_data(skb)?) {
            Ok(ip) => (ip.saddr, ip.daddr),
            Err(_) => (0, 0),
        };
        emit_packet_event(PacketEvent {
            timestamp_ns: now,
            teid: 0,
            src_ip,
            dst_ip,
            pkt_len: len,
            direction: DIRECTION_DOWNLINK,
            qfi: 0,
            _padding: [0; 6],
        });
    }

    Ok(0)
}

/// Track packet drops
///
/// Attached to: tracepoint skb:kfree_skb
///
/// Disabled unless CONFIG_DROP_TRACING is set, since every kernel drop on
/// the host fires it. Attribution is best-effort: if `skb->data` points at
/// an IPv4 header the addresses are filled in, and a GTP-U datagram also
/// yields its TEID.
#[tracepoint]
pub fn kfree_skb_drop(ctx: TracePointContext) -> u32 {
    match try_kfree_skb_drop(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            increment_stat(STAT_READ_ERRORS);
            0
        }
    }
}

fn try_kfree_skb_drop(ctx: &TracePointContext) -> Result<u32, i64> {
    if !config_enabled(CONFIG_DROP_TRACING) {
        return Ok(0);
    }

    let skb = unsafe { ctx.read_at::<u64>(KFREE_SKB_SKBADDR_OFFSET)? } as *const u8;
    if skb.is_null() {
        return Ok(0);
    }

    let len = skb_len(skb)?;
    if len < MIN_DROP_PKT_LEN {
        return Ok(0);
    }

    let mut event = DropEvent {
        timestamp_ns: get_timestamp(),
        pkt_len: len,
        reason: DROP_REASON_KERNEL,
        direction: DIRECTION_UNKNOWN,
        ..Default::default()
    };

    if let Ok(data) = skb_data(skb) {
        if let Ok(ip) = read_ipv4(data) {
            event.src_ip = ip.saddr;
            event.dst_ip = ip.daddr;

            if ip.protocol == IPPROTO_UDP {
                let udp = data.wrapping_add(ip.header_len);
                if let Ok((sport, dport)) = read_udp_ports(udp) {
                    event.src_port = sport;
                    event.dst_port = dport;
                    if dport == GTPU_PORT {
                        if let Ok(gtpu) = read_gtpu(udp) {
                            event.teid = gtpu.teid;
                            event.direction = DIRECTION_UPLINK;
                        }
                    }
                }
            }
        }
    }

    emit_drop_event(event);

    Ok(0)
}
