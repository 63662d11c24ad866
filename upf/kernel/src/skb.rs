//! sk_buff and header parsing utilities
//!
//! The gtp5g hooks receive a `struct sk_buff *`. Only two fields are read
//! (`len` and `data`) at offsets that userspace may override through
//! AGENT_CONFIG when the running kernel's layout differs from the default.
//! All reads go through bpf_probe_read_kernel and are fixed-size.

use aya_ebpf::helpers::bpf_probe_read_kernel;
use upf_common::constants::*;

use crate::helpers::config_value;

/// GTP-U extension header type: PDU session container
const GTPU_EXT_PDU_SESSION: u8 = 0x85;

/// GTP-U flags carrying the optional 4-byte field (E, S, PN)
const GTPU_OPT_FLAGS: u8 = 0x07;

/// GTP-U extension header flag
const GTPU_FLAG_E: u8 = 0x04;

/// Minimum IPv4 header length
const IPV4_MIN_HLEN: usize = 20;

/// Fields pulled from a GTP-U header
#[derive(Clone, Copy)]
pub struct GtpuInfo {
    /// TEID (host byte order)
    pub teid: u32,
    /// QoS flow identifier (0 if no PDU session container)
    pub qfi: u8,
}

/// Fields pulled from an IPv4 header
#[derive(Clone, Copy)]
pub struct Ipv4Info {
    /// Source address (network byte order)
    pub saddr: u32,
    /// Destination address (network byte order)
    pub daddr: u32,
    /// L4 protocol number
    pub protocol: u8,
    /// Header length in bytes
    pub header_len: usize,
}

#[inline(always)]
fn skb_offset(slot: u32, default: u32) -> usize {
    match config_value(slot) {
        0 => default as usize,
        off => off as usize,
    }
}

/// Read `skb->len`
#[inline(always)]
pub fn skb_len(skb: *const u8) -> Result<u32, i64> {
    if skb.is_null() {
        return Err(-1);
    }
    let off = skb_offset(CONFIG_SKB_LEN_OFFSET, DEFAULT_SKB_LEN_OFFSET);
    unsafe { bpf_probe_read_kernel(skb.wrapping_add(off) as *const u32) }
}

/// Read `skb->data`
#[inline(always)]
pub fn skb_data(skb: *const u8) -> Result<*const u8, i64> {
    if skb.is_null() {
        return Err(-1);
    }
    let off = skb_offset(CONFIG_SKB_DATA_OFFSET, DEFAULT_SKB_DATA_OFFSET);
    let data = unsafe { bpf_probe_read_kernel(skb.wrapping_add(off) as *const u64)? };
    if data == 0 {
        return Err(-1);
    }
    Ok(data as *const u8)
}

/// Parse the GTP-U header that follows the UDP header at `udp`
///
/// In gtp5g_encap_recv, `skb->data` still points at the UDP header.
#[inline(always)]
pub fn read_gtpu(udp: *const u8) -> Result<GtpuInfo, i64> {
    let gtp = udp.wrapping_add(UDP_HLEN as usize);
    let hdr = unsafe { bpf_probe_read_kernel(gtp as *const [u8; 16])? };

    let off = GTPU_TEID_OFFSET as usize;
    let teid = u32::from_be_bytes([hdr[off], hdr[off + 1], hdr[off + 2], hdr[off + 3]]);

    // Optional field: seq(2) npdu(1) next-ext-type(1), then the extension
    // header: length(1) pdu-type(1) qfi(1)
    let mut qfi = 0;
    if hdr[0] & GTPU_OPT_FLAGS != 0
        && hdr[0] & GTPU_FLAG_E != 0
        && hdr[11] == GTPU_EXT_PDU_SESSION
    {
        qfi = hdr[14] & 0x3f;
    }

    Ok(GtpuInfo { teid, qfi })
}

/// Parse an IPv4 header at `ip`, failing if it is not one
#[inline(always)]
pub fn read_ipv4(ip: *const u8) -> Result<Ipv4Info, i64> {
    let hdr = unsafe { bpf_probe_read_kernel(ip as *const [u8; IPV4_MIN_HLEN])? };
    if hdr[0] >> 4 != 4 {
        return Err(-2);
    }
    let header_len = ((hdr[0] & 0x0f) as usize) * 4;
    if header_len < IPV4_MIN_HLEN {
        return Err(-2);
    }
    Ok(Ipv4Info {
        saddr: u32::from_ne_bytes([hdr[12], hdr[13], hdr[14], hdr[15]]),
        daddr: u32::from_ne_bytes([hdr[16], hdr[17], hdr[18], hdr[19]]),
        protocol: hdr[9],
        header_len,
    })
}

/// Read UDP source and destination ports (host byte order)
#[inline(always)]
pub fn read_udp_ports(udp: *const u8) -> Result<(u16, u16), i64> {
    let hdr = unsafe { bpf_probe_read_kernel(udp as *const [u8; 4])? };
    Ok((
        u16::from_be_bytes([hdr[0], hdr[1]]),
        u16::from_be_bytes([hdr[2], hdr[3]]),
    ))
}

/// Best-effort outer IPv4 header in front of the UDP header at `udp`
///
/// Assumes no IP options; returns zeros when the guess is wrong.
#[inline(always)]
pub fn read_outer_ipv4(udp: *const u8) -> (u32, u32) {
    match read_ipv4(udp.wrapping_sub(IPV4_MIN_HLEN)) {
        Ok(ip) if ip.header_len == IPV4_MIN_HLEN && ip.protocol == IPPROTO_UDP => {
            (ip.saddr, ip.daddr)
        }
        _ => (0, 0),
    }
}
