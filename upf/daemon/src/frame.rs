//! Link-layer, IPv4 and UDP framing for captured control-plane packets
//!
//! Strips whatever framing the capture device delivers and returns the UDP
//! payload along with the addresses the dissector needs. Only IPv4 is
//! handled; non-first fragments carry no UDP header and are skipped.

use std::net::Ipv4Addr;

// Ethernet
const ETH_HLEN: usize = 14;
const VLAN_HLEN: usize = 4;
const MAX_VLAN_TAGS: usize = 2;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

// Linux cooked capture
const SLL_HLEN: usize = 16;
const SLL_PROTO_OFFSET: usize = 14;
const SLL2_HLEN: usize = 20;
const SLL2_PROTO_OFFSET: usize = 0;

// BSD loopback
const NULL_HLEN: usize = 4;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_FLAGS_FRAG_OFFSET: usize = 6;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;
const PROTO_UDP: u8 = 17;

const UDP_HLEN: usize = 8;

/// Framing of a capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// DLT_EN10MB, optionally VLAN tagged
    Ethernet,
    /// DLT_LINUX_SLL (the "any" device)
    LinuxSll,
    /// DLT_LINUX_SLL2
    LinuxSll2,
    /// DLT_RAW / DLT_IPV4: IP header at offset 0
    Raw,
    /// DLT_NULL / DLT_LOOP: 4-byte address family
    Null,
}

impl LinkType {
    /// Map a pcap data link type, `None` if unsupported
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(LinkType::Ethernet),
            113 => Some(LinkType::LinuxSll),
            276 => Some(LinkType::LinuxSll2),
            12 | 14 | 101 | 228 => Some(LinkType::Raw),
            0 | 108 => Some(LinkType::Null),
            _ => None,
        }
    }
}

/// A UDP datagram carried in a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

fn be16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn ipv4_at(data: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let b = data.get(offset..offset + 4)?;
    Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
}

/// Locate the IPv4 header inside a frame
fn ipv4_payload(frame: &[u8], link: LinkType) -> Option<&[u8]> {
    match link {
        LinkType::Ethernet => {
            let mut ethertype = be16(frame, 12)?;
            let mut offset = ETH_HLEN;
            for _ in 0..MAX_VLAN_TAGS {
                if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
                    break;
                }
                ethertype = be16(frame, offset + 2)?;
                offset += VLAN_HLEN;
            }
            (ethertype == ETHERTYPE_IPV4).then(|| frame.get(offset..)).flatten()
        }
        LinkType::LinuxSll => {
            if be16(frame, SLL_PROTO_OFFSET)? != ETHERTYPE_IPV4 {
                return None;
            }
            frame.get(SLL_HLEN..)
        }
        LinkType::LinuxSll2 => {
            if be16(frame, SLL2_PROTO_OFFSET)? != ETHERTYPE_IPV4 {
                return None;
            }
            frame.get(SLL2_HLEN..)
        }
        LinkType::Raw => (frame.first()? >> 4 == 4).then_some(frame),
        LinkType::Null => {
            let af = frame.get(..NULL_HLEN)?;
            let inet = nix::libc::AF_INET as u32;
            let host = u32::from_ne_bytes([af[0], af[1], af[2], af[3]]);
            let net = u32::from_be_bytes([af[0], af[1], af[2], af[3]]);
            (host == inet || net == inet).then(|| &frame[NULL_HLEN..])
        }
    }
}

/// Parse an IPv4/UDP packet starting at the IP header
pub fn parse_ipv4_udp(ip: &[u8]) -> Option<UdpDatagram<'_>> {
    if ip.len() < IPV4_MIN_HLEN || ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((ip[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_MIN_HLEN || ip.len() < ihl {
        return None;
    }

    // Non-first fragment
    if be16(ip, IPV4_FLAGS_FRAG_OFFSET)? & 0x1FFF != 0 {
        return None;
    }
    if ip[IPV4_PROTO_OFFSET] != PROTO_UDP {
        return None;
    }

    let total_len = be16(ip, 2)? as usize;
    let end = if total_len >= ihl { total_len.min(ip.len()) } else { ip.len() };
    let udp = ip.get(ihl..end)?;
    if udp.len() < UDP_HLEN {
        return None;
    }

    Some(UdpDatagram {
        src_ip: ipv4_at(ip, IPV4_SRC_OFFSET)?,
        dst_ip: ipv4_at(ip, IPV4_DST_OFFSET)?,
        dst_port: be16(udp, 2)?,
        payload: &udp[UDP_HLEN..],
    })
}

/// Extract the UDP datagram from a captured frame
pub fn parse_frame(frame: &[u8], link: LinkType) -> Option<UdpDatagram<'_>> {
    parse_ipv4_udp(ipv4_payload(frame, link)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// IPv4/UDP packet with a valid header layout (checksums zeroed)
    pub(crate) fn ipv4_udp(src: Ipv4Addr, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
        let total = (IPV4_MIN_HLEN + UDP_HLEN + payload.len()) as u16;
        let mut pkt = vec![0x45, 0];
        pkt.extend_from_slice(&total.to_be_bytes());
        pkt.extend_from_slice(&[0, 1, 0x40, 0, 64, PROTO_UDP, 0, 0]);
        pkt.extend_from_slice(&src.octets());
        pkt.extend_from_slice(&dst.octets());
        pkt.extend_from_slice(&8805u16.to_be_bytes());
        pkt.extend_from_slice(&dport.to_be_bytes());
        pkt.extend_from_slice(&((UDP_HLEN + payload.len()) as u16).to_be_bytes());
        pkt.extend_from_slice(&[0, 0]);
        pkt.extend_from_slice(payload);
        pkt
    }

    fn ethernet(vlans: &[u16], ip: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xff; 12];
        for vid in vlans {
            frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
            frame.extend_from_slice(&vid.to_be_bytes());
        }
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(ip);
        frame
    }

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 100, 200, 2);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 100, 200, 3);

    #[test]
    fn test_ethernet_frame() {
        let frame = ethernet(&[], &ipv4_udp(SRC, DST, 8805, b"pfcp"));
        let dgram = parse_frame(&frame, LinkType::Ethernet).unwrap();
        assert_eq!(dgram.src_ip, SRC);
        assert_eq!(dgram.dst_ip, DST);
        assert_eq!(dgram.dst_port, 8805);
        assert_eq!(dgram.payload, b"pfcp");
    }

    #[test]
    fn test_vlan_tagged_frame() {
        let frame = ethernet(&[100, 200], &ipv4_udp(SRC, DST, 8805, b"x"));
        assert_eq!(parse_frame(&frame, LinkType::Ethernet).unwrap().payload, b"x");
    }

    #[test]
    fn test_linux_sll_frame() {
        let mut frame = vec![0u8; SLL_PROTO_OFFSET];
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(&ipv4_udp(SRC, DST, 8805, b"sll"));
        assert_eq!(parse_frame(&frame, LinkType::LinuxSll).unwrap().payload, b"sll");
    }

    #[test]
    fn test_raw_frame() {
        let pkt = ipv4_udp(SRC, DST, 8805, b"raw");
        assert_eq!(parse_frame(&pkt, LinkType::Raw).unwrap().dst_ip, DST);
    }

    #[test]
    fn test_non_first_fragment_skipped() {
        let mut pkt = ipv4_udp(SRC, DST, 8805, b"frag");
        pkt[6] = 0x00;
        pkt[7] = 0x10;
        assert!(parse_frame(&pkt, LinkType::Raw).is_none());
    }

    #[test]
    fn test_truncated_and_foreign_frames() {
        let pkt = ipv4_udp(SRC, DST, 8805, b"");
        assert!(parse_frame(&pkt[..24], LinkType::Raw).is_none());

        let mut arp = vec![0xff; 12];
        arp.extend_from_slice(&0x0806u16.to_be_bytes());
        arp.extend_from_slice(&[0; 28]);
        assert!(parse_frame(&arp, LinkType::Ethernet).is_none());
    }

    #[test]
    fn test_link_type_mapping() {
        assert_eq!(LinkType::from_dlt(1), Some(LinkType::Ethernet));
        assert_eq!(LinkType::from_dlt(113), Some(LinkType::LinuxSll));
        assert_eq!(LinkType::from_dlt(105), None);
    }
}
