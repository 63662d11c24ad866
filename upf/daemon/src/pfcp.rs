//! PFCP dissector
//!
//! Extracts session identifiers, F-TEIDs and UE addresses from PFCP
//! (3GPP TS 29.244) session messages and applies them to the
//! [`CorrelationStore`]. Parsing never fails hard: a truncated IE stops
//! the walk and whatever was found before it is kept.
//!
//! ## Header layout
//!
//! ```text
//! byte 0      version / flags (bit 0 = S, SEID present)
//! byte 1      message type
//! bytes 2-3   message length (excludes the first 4 bytes)
//! bytes 4-11  SEID (only when S is set)
//! IEs start at byte 16 with S set, byte 8 without
//! ```

use crate::correlation::{CorrelationStore, Session};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// PFCP message types
pub mod msg_type {
    pub const HEARTBEAT_REQUEST: u8 = 1;
    pub const HEARTBEAT_RESPONSE: u8 = 2;
    pub const SESSION_ESTABLISHMENT_REQUEST: u8 = 50;
    pub const SESSION_ESTABLISHMENT_RESPONSE: u8 = 51;
    pub const SESSION_MODIFICATION_REQUEST: u8 = 52;
    pub const SESSION_MODIFICATION_RESPONSE: u8 = 53;
    pub const SESSION_DELETION_REQUEST: u8 = 54;
    pub const SESSION_DELETION_RESPONSE: u8 = 55;
}

/// PFCP information element types
pub mod ie_type {
    pub const CREATE_PDR: u16 = 1;
    pub const PDI: u16 = 2;
    pub const CREATE_FAR: u16 = 3;
    pub const CREATED_PDR: u16 = 8;
    pub const UPDATE_PDR: u16 = 9;
    pub const F_TEID: u16 = 21;
    pub const UE_IP_ADDRESS: u16 = 93;
}

/// Header length without SEID
pub const HEADER_LEN: usize = 8;
/// Header length with SEID
pub const HEADER_LEN_WITH_SEID: usize = 16;
/// IE type + length
pub const IE_HEADER_LEN: usize = 4;

const FLAG_SEID: u8 = 0x01;
const UE_IP_FLAG_V4: u8 = 0x02;
const MAX_GROUP_DEPTH: usize = 4;

/// Parsed fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfcpHeader {
    pub message_type: u8,
    pub message_length: u16,
    /// 0 when the S flag is clear
    pub seid: u64,
    pub has_seid: bool,
}

impl PfcpHeader {
    /// Parse the header, or `None` if the datagram is too short to hold it
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let has_seid = data[0] & FLAG_SEID != 0;
        let seid = if has_seid {
            let raw: [u8; 8] = data.get(4..12)?.try_into().ok()?;
            if data.len() < HEADER_LEN_WITH_SEID {
                return None;
            }
            u64::from_be_bytes(raw)
        } else {
            0
        };

        Some(Self {
            message_type: data[1],
            message_length: u16::from_be_bytes([data[2], data[3]]),
            seid,
            has_seid,
        })
    }

    /// Offset of the first IE
    pub fn ie_offset(&self) -> usize {
        if self.has_seid {
            HEADER_LEN_WITH_SEID
        } else {
            HEADER_LEN
        }
    }

    /// The IE region of `data`, bounded by both the declared length and
    /// the captured length
    pub fn ie_region<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let end = (IE_HEADER_LEN + self.message_length as usize).min(data.len());
        data.get(self.ie_offset()..end).unwrap_or(&[])
    }
}

/// One information element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ie<'a> {
    pub ie_type: u16,
    pub value: &'a [u8],
}

/// Iterator over a sequence of IEs
///
/// Stops when fewer than 4 bytes remain or an IE's declared length runs
/// past the end of the buffer.
#[derive(Debug, Clone)]
pub struct IeIter<'a> {
    data: &'a [u8],
    offset: usize,
    truncated: bool,
}

impl<'a> IeIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            truncated: false,
        }
    }

    /// Whether the walk ended on a truncated IE
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl<'a> Iterator for IeIter<'a> {
    type Item = Ie<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.offset..)?;
        if rest.len() < IE_HEADER_LEN {
            self.truncated |= !rest.is_empty();
            self.offset = self.data.len();
            return None;
        }

        let ie_type = u16::from_be_bytes([rest[0], rest[1]]);
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let Some(value) = rest.get(IE_HEADER_LEN..IE_HEADER_LEN + len) else {
            self.truncated = true;
            self.offset = self.data.len();
            return None;
        };

        self.offset += IE_HEADER_LEN + len;
        Some(Ie { ie_type, value })
    }
}

/// Identifiers extracted from an IE region
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extracted {
    /// In encounter order, depth first
    pub teids: Vec<u32>,
    /// First UE IPv4 address found
    pub ue_ip: Option<Ipv4Addr>,
    /// Top-level Create PDR IEs
    pub pdr_count: u32,
    /// Top-level Create FAR IEs
    pub far_count: u32,
    pub truncated: bool,
}

/// TEID from an F-TEID value (flags octet, then TEID)
pub fn parse_fteid(value: &[u8]) -> Option<u32> {
    let raw: [u8; 4] = value.get(1..5)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

/// IPv4 address from a UE IP Address value, if the V4 flag is set
pub fn parse_ue_ip(value: &[u8]) -> Option<Ipv4Addr> {
    if value.len() < 5 || value[0] & UE_IP_FLAG_V4 == 0 {
        return None;
    }
    Some(Ipv4Addr::new(value[1], value[2], value[3], value[4]))
}

fn is_grouped(kind: u16) -> bool {
    matches!(
        kind,
        ie_type::CREATE_PDR | ie_type::PDI | ie_type::CREATED_PDR | ie_type::UPDATE_PDR
    )
}

fn walk(data: &[u8], depth: usize, out: &mut Extracted) {
    let mut iter = IeIter::new(data);
    for ie in iter.by_ref() {
        match ie.ie_type {
            ie_type::F_TEID => {
                if let Some(teid) = parse_fteid(ie.value) {
                    out.teids.push(teid);
                }
            }
            ie_type::UE_IP_ADDRESS if out.ue_ip.is_none() => {
                out.ue_ip = parse_ue_ip(ie.value);
            }
            _ => {}
        }

        if depth == 0 {
            match ie.ie_type {
                ie_type::CREATE_PDR => out.pdr_count += 1,
                ie_type::CREATE_FAR => out.far_count += 1,
                _ => {}
            }
        }

        if is_grouped(ie.ie_type) && depth < MAX_GROUP_DEPTH {
            walk(ie.value, depth + 1, out);
        }
    }
    out.truncated |= iter.truncated();
}

/// Extract TEIDs, UE IP and rule counts from an IE region
pub fn extract(ies: &[u8]) -> Extracted {
    let mut out = Extracted::default();
    walk(ies, 0, &mut out);
    out
}

/// What a datagram did to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Established { seid: u64, teids: Vec<u32> },
    Modified { seid: u64, added: Vec<u32> },
    Deleted { seid: u64 },
    /// Modification or deletion for a SEID the store does not know
    UnknownSession { seid: u64 },
    Ignored { message_type: u8 },
    TooShort,
}

/// Messages seen per outcome
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct DissectorStats {
    pub established: u64,
    pub modified: u64,
    pub deleted: u64,
    pub unknown_session: u64,
    pub ignored: u64,
    pub too_short: u64,
    /// Messages whose IE walk ended on a truncated IE
    pub truncated: u64,
}

#[derive(Debug, Default)]
struct Counters {
    established: AtomicU64,
    modified: AtomicU64,
    deleted: AtomicU64,
    unknown_session: AtomicU64,
    ignored: AtomicU64,
    too_short: AtomicU64,
    truncated: AtomicU64,
}

/// Applies PFCP session messages to the correlation store
#[derive(Debug)]
pub struct Dissector {
    store: Arc<CorrelationStore>,
    counters: Counters,
}

impl Dissector {
    pub fn new(store: Arc<CorrelationStore>) -> Self {
        Self {
            store,
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<CorrelationStore> {
        &self.store
    }

    /// Process one PFCP datagram
    ///
    /// `upf_ip` is the destination address of the carrying IP packet.
    pub fn handle(&self, payload: &[u8], upf_ip: Option<Ipv4Addr>) -> Outcome {
        let Some(header) = PfcpHeader::parse(payload) else {
            self.counters.too_short.fetch_add(1, Ordering::Relaxed);
            return Outcome::TooShort;
        };

        let outcome = match header.message_type {
            msg_type::SESSION_ESTABLISHMENT_REQUEST => {
                let ies = self.extract_counted(&header, payload);
                self.establish(header.seid, ies, upf_ip)
            }
            msg_type::SESSION_MODIFICATION_REQUEST => {
                let ies = self.extract_counted(&header, payload);
                self.modify(header.seid, ies)
            }
            msg_type::SESSION_DELETION_REQUEST => self.delete(header.seid),
            other => {
                debug!("Ignoring PFCP message type {}", other);
                Outcome::Ignored { message_type: other }
            }
        };

        let counter = match &outcome {
            Outcome::Established { .. } => &self.counters.established,
            Outcome::Modified { .. } => &self.counters.modified,
            Outcome::Deleted { .. } => &self.counters.deleted,
            Outcome::UnknownSession { .. } => &self.counters.unknown_session,
            Outcome::Ignored { .. } => &self.counters.ignored,
            Outcome::TooShort => &self.counters.too_short,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        outcome
    }

    fn extract_counted(&self, header: &PfcpHeader, payload: &[u8]) -> Extracted {
        let ies = extract(header.ie_region(payload));
        if ies.truncated {
            self.counters.truncated.fetch_add(1, Ordering::Relaxed);
            debug!("Truncated IE in PFCP message for SEID 0x{:x}", header.seid);
        }
        ies
    }

    fn establish(&self, seid: u64, ies: Extracted, upf_ip: Option<Ipv4Addr>) -> Outcome {
        info!("PFCP Session Establishment: SEID=0x{:x}", seid);

        let session = Session {
            ue_ip: ies.ue_ip,
            upf_ip,
            teids: ies.teids,
            pdr_count: ies.pdr_count,
            far_count: ies.far_count,
            ..Session::new(seid)
        };
        let teids = session.teids.clone();
        self.store.upsert(session);

        info!("  └─ TEIDs: {:?}, UE IP: {:?}", teids, ies.ue_ip);
        Outcome::Established { seid, teids }
    }

    fn modify(&self, seid: u64, ies: Extracted) -> Outcome {
        info!("PFCP Session Modification: SEID=0x{:x}", seid);

        let merged = self.store.modify(seid, |session| {
            let mut added = Vec::new();
            for teid in ies.teids {
                if teid != 0 && !session.teids.contains(&teid) {
                    session.teids.push(teid);
                    added.push(teid);
                }
            }
            if session.ue_ip.is_none() {
                session.ue_ip = ies.ue_ip;
            }
            session.pdr_count += ies.pdr_count;
            session.far_count += ies.far_count;
            session.modified_at = Some(Utc::now());
            added
        });
        let Some(added) = merged else {
            warn!("  └─ Modification for unknown session 0x{:x}", seid);
            return Outcome::UnknownSession { seid };
        };

        if !added.is_empty() {
            info!("  └─ New TEIDs: {:?}", added);
        }
        Outcome::Modified { seid, added }
    }

    fn delete(&self, seid: u64) -> Outcome {
        info!("PFCP Session Deletion: SEID=0x{:x}", seid);
        match self.store.remove(seid) {
            Some(_) => Outcome::Deleted { seid },
            None => {
                debug!("  └─ Session 0x{:x} was not tracked", seid);
                Outcome::UnknownSession { seid }
            }
        }
    }

    pub fn stats(&self) -> DissectorStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DissectorStats {
            established: load(&self.counters.established),
            modified: load(&self.counters.modified),
            deleted: load(&self.counters.deleted),
            unknown_session: load(&self.counters.unknown_session),
            ignored: load(&self.counters.ignored),
            too_short: load(&self.counters.too_short),
            truncated: load(&self.counters.truncated),
        }
    }
}

/// Builders for PFCP datagrams, shared by unit and integration tests
pub mod build {
    use super::*;

    /// Encode one IE
    pub fn ie(ie_type: u16, value: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(IE_HEADER_LEN + value.len());
        out.extend_from_slice(&ie_type.to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
        out
    }

    /// F-TEID IE with an IPv4 address
    pub fn fteid(teid: u32, addr: Ipv4Addr) -> Vec<u8> {
        let mut value = vec![0x01];
        value.extend_from_slice(&teid.to_be_bytes());
        value.extend_from_slice(&addr.octets());
        ie(ie_type::F_TEID, &value)
    }

    /// UE IP Address IE carrying an IPv4 address
    pub fn ue_ip(addr: Ipv4Addr) -> Vec<u8> {
        let mut value = vec![UE_IP_FLAG_V4];
        value.extend_from_slice(&addr.octets());
        ie(ie_type::UE_IP_ADDRESS, &value)
    }

    /// Grouped IE wrapping already encoded children
    pub fn grouped(ie_type: u16, children: &[Vec<u8>]) -> Vec<u8> {
        ie(ie_type, &children.concat())
    }

    /// Full message; `seid` sets the S flag
    pub fn message(message_type: u8, seid: Option<u64>, ies: &[Vec<u8>]) -> Vec<u8> {
        let body = ies.concat();
        let mut out = Vec::new();
        match seid {
            Some(seid) => {
                out.push(0x20 | FLAG_SEID);
                out.push(message_type);
                let len = (HEADER_LEN_WITH_SEID - 4 + body.len()) as u16;
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&seid.to_be_bytes());
                out.extend_from_slice(&[0, 0, 1, 0]);
            }
            None => {
                out.push(0x20);
                out.push(message_type);
                out.extend_from_slice(&((HEADER_LEN - 4 + body.len()) as u16).to_be_bytes());
                out.extend_from_slice(&[0, 0, 1, 0]);
            }
        }
        out.extend_from_slice(&body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;

    const UPF: Ipv4Addr = Ipv4Addr::new(10, 100, 200, 3);

    fn dissector() -> Dissector {
        Dissector::new(Arc::new(CorrelationStore::new()))
    }

    #[test]
    fn test_header_with_seid() {
        let msg = message(msg_type::SESSION_ESTABLISHMENT_REQUEST, Some(0xA1), &[]);
        let header = PfcpHeader::parse(&msg).unwrap();
        assert!(header.has_seid);
        assert_eq!(header.seid, 0xA1);
        assert_eq!(header.ie_offset(), 16);
        assert_eq!(header.message_length, 12);
    }

    #[test]
    fn test_header_too_short() {
        assert!(PfcpHeader::parse(&[0x21, 50, 0, 12]).is_none());
        // S flag set but SEID cut off
        assert!(PfcpHeader::parse(&[0x21, 50, 0, 12, 0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_extracts_n_teids_in_order() {
        let teids = [0x1001, 0x2002, 0x3003, 0x4004];
        let ies: Vec<Vec<u8>> = teids.iter().map(|t| fteid(*t, UPF)).collect();
        let msg = message(msg_type::SESSION_ESTABLISHMENT_REQUEST, Some(1), &ies);

        let header = PfcpHeader::parse(&msg).unwrap();
        let out = extract(header.ie_region(&msg));
        assert_eq!(out.teids, teids);
        assert!(!out.truncated);
    }

    #[test]
    fn test_extracts_nested_fteid_and_ue_ip() {
        let ue = Ipv4Addr::new(10, 60, 0, 1);
        let pdr = grouped(
            ie_type::CREATE_PDR,
            &[ie(56, &[0, 1]), grouped(ie_type::PDI, &[fteid(0xAA, UPF), ue_ip(ue)])],
        );
        let far = ie(ie_type::CREATE_FAR, &[0x00, 0x6c, 0x00, 0x04, 0, 0, 0, 1]);
        let out = extract(&[pdr, far, fteid(0xBB, UPF)].concat());

        assert_eq!(out.teids, vec![0xAA, 0xBB]);
        assert_eq!(out.ue_ip, Some(ue));
        assert_eq!(out.pdr_count, 1);
        assert_eq!(out.far_count, 1);
    }

    #[test]
    fn test_truncated_ie_keeps_earlier_results() {
        let mut body = [fteid(1, UPF), fteid(2, UPF)].concat();
        // F-TEID claiming 9 bytes with only 3 present
        body.extend_from_slice(&[0, 21, 0, 9, 1, 0, 0]);

        let out = extract(&body);
        assert_eq!(out.teids, vec![1, 2]);
        assert!(out.truncated);
    }

    #[test]
    fn test_message_length_bounds_region() {
        let mut msg = message(
            msg_type::SESSION_ESTABLISHMENT_REQUEST,
            Some(1),
            &[fteid(5, UPF)],
        );
        // Trailing bytes past the declared length are not IEs
        msg.extend_from_slice(&fteid(6, UPF));
        let header = PfcpHeader::parse(&msg).unwrap();
        assert_eq!(extract(header.ie_region(&msg)).teids, vec![5]);

        // Declared length larger than the datagram
        msg.truncate(20);
        let header = PfcpHeader::parse(&msg).unwrap();
        assert!(extract(header.ie_region(&msg)).teids.is_empty());
    }

    #[test]
    fn test_short_fteid_and_v6_ue_ip_skipped() {
        let body = [
            ie(ie_type::F_TEID, &[0x01, 0, 0, 1]),
            ie(ie_type::UE_IP_ADDRESS, &[0x01, 10, 0, 0, 1]),
        ]
        .concat();
        let out = extract(&body);
        assert!(out.teids.is_empty());
        assert_eq!(out.ue_ip, None);
    }

    #[test]
    fn test_establish_modify_delete() {
        let d = dissector();
        let ue = Ipv4Addr::new(10, 60, 0, 7);

        let est = message(
            msg_type::SESSION_ESTABLISHMENT_REQUEST,
            Some(0xA1),
            &[fteid(1001, UPF), ue_ip(ue)],
        );
        assert_eq!(
            d.handle(&est, Some(UPF)),
            Outcome::Established {
                seid: 0xA1,
                teids: vec![1001]
            }
        );

        let modify = message(
            msg_type::SESSION_MODIFICATION_REQUEST,
            Some(0xA1),
            &[fteid(1002, UPF), fteid(1001, UPF), fteid(0, UPF)],
        );
        assert_eq!(
            d.handle(&modify, Some(UPF)),
            Outcome::Modified {
                seid: 0xA1,
                added: vec![1002]
            }
        );

        let session = d.store().get_by_teid(1002).unwrap();
        assert_eq!(session.seid, 0xA1);
        assert_eq!(session.teids, vec![1001, 1002]);
        assert_eq!(session.ue_ip, Some(ue));
        assert_eq!(session.upf_ip, Some(UPF));
        assert!(session.modified_at.is_some());

        let del = message(msg_type::SESSION_DELETION_REQUEST, Some(0xA1), &[]);
        assert_eq!(d.handle(&del, Some(UPF)), Outcome::Deleted { seid: 0xA1 });
        assert!(d.store().get_by_teid(1001).is_none());
        assert!(d.store().get_by_teid(1002).is_none());

        let stats = d.stats();
        assert_eq!(stats.established, 1);
        assert_eq!(stats.modified, 1);
        assert_eq!(stats.deleted, 1);
    }

    #[test]
    fn test_modification_for_unknown_session() {
        let d = dissector();
        let modify = message(
            msg_type::SESSION_MODIFICATION_REQUEST,
            Some(0xFF),
            &[fteid(9, UPF)],
        );

        assert_eq!(
            d.handle(&modify, None),
            Outcome::UnknownSession { seid: 0xFF }
        );
        assert!(d.store().is_empty());
        assert_eq!(d.stats().unknown_session, 1);
    }

    #[test]
    fn test_modification_after_reclaim_does_not_revive() {
        let d = dissector();
        let est = message(
            msg_type::SESSION_ESTABLISHMENT_REQUEST,
            Some(0xB2),
            &[fteid(2001, UPF)],
        );
        d.handle(&est, Some(UPF));

        // Idle sweep with a cutoff in the future reclaims everything
        let cutoff = chrono::Utc::now() + chrono::Duration::seconds(60);
        let removed = d.store().remove_idle(cutoff, &std::collections::HashMap::new());
        assert_eq!(removed, vec![0xB2]);

        let modify = message(
            msg_type::SESSION_MODIFICATION_REQUEST,
            Some(0xB2),
            &[fteid(2002, UPF)],
        );
        assert_eq!(
            d.handle(&modify, Some(UPF)),
            Outcome::UnknownSession { seid: 0xB2 }
        );
        assert!(d.store().is_empty());
        assert!(d.store().get_by_teid(2002).is_none());
    }

    #[test]
    fn test_heartbeat_ignored() {
        let d = dissector();
        let hb = message(msg_type::HEARTBEAT_REQUEST, None, &[ie(96, &[0, 0, 0, 1])]);

        assert_eq!(
            d.handle(&hb, None),
            Outcome::Ignored {
                message_type: msg_type::HEARTBEAT_REQUEST
            }
        );
        assert!(d.store().is_empty());
    }

    #[test]
    fn test_short_packet_ignored() {
        let d = dissector();
        assert_eq!(d.handle(&[0x21, 50, 0], None), Outcome::TooShort);
        assert_eq!(d.stats().too_short, 1);
        assert!(d.store().is_empty());
    }
}
