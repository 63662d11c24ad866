//! End-to-end flow through the userspace engine with in-memory probes

use std::{mem, net::Ipv4Addr, sync::Arc, time::Duration};
use upf_monitor::{
    capture::CaptureAdapter,
    clock::KtimeClock,
    collector::MetricsCollector,
    config::EngineConfig,
    control::{MemoryControl, ProbeControl},
    counters::MemoryCounters,
    engine::Engine,
    events::RingKind,
    frame::LinkType,
    pfcp::{build, ie_type, msg_type},
    types::{kernel::constants::*, DropEvent, DropReason, EngineEvent},
};

const SMF: Ipv4Addr = Ipv4Addr::new(10, 100, 200, 2);
const UPF: Ipv4Addr = Ipv4Addr::new(10, 100, 200, 3);
const UE: Ipv4Addr = Ipv4Addr::new(10, 60, 0, 1);

fn raw_ipv4_udp(dport: u16, payload: &[u8]) -> Vec<u8> {
    let total = (20 + 8 + payload.len()) as u16;
    let mut pkt = vec![0x45, 0];
    pkt.extend_from_slice(&total.to_be_bytes());
    pkt.extend_from_slice(&[0, 1, 0x40, 0, 64, 17, 0, 0]);
    pkt.extend_from_slice(&SMF.octets());
    pkt.extend_from_slice(&UPF.octets());
    pkt.extend_from_slice(&8805u16.to_be_bytes());
    pkt.extend_from_slice(&dport.to_be_bytes());
    pkt.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    pkt.extend_from_slice(&[0, 0]);
    pkt.extend_from_slice(payload);
    pkt
}

fn drop_item(teid: u32) -> Vec<u8> {
    let event = DropEvent {
        timestamp_ns: 1_000,
        teid,
        src_ip: u32::from_ne_bytes(UE.octets()),
        dst_ip: u32::from_ne_bytes([8, 8, 8, 8]),
        src_port: 40000,
        dst_port: 53,
        pkt_len: 120,
        reason: DROP_REASON_NO_PDR,
        direction: DIRECTION_UPLINK,
        _padding: [0; 2],
    };
    let ptr = &event as *const DropEvent as *const u8;
    let bytes = unsafe { std::slice::from_raw_parts(ptr, mem::size_of::<DropEvent>()) };
    bytes.to_vec()
}

fn engine(config: EngineConfig) -> (Arc<MemoryCounters>, Arc<MemoryControl>, Engine) {
    let counters = Arc::new(MemoryCounters::new(4, 128));
    let control = Arc::new(MemoryControl::new());
    let clock = KtimeClock::with_offset(0);
    let engine = Engine::new(config, counters.clone(), control.clone(), clock).unwrap();
    (counters, control, engine)
}

#[test]
fn test_captured_session_enriches_drops() {
    let (_, _, engine) = engine(EngineConfig::default());
    let capture = CaptureAdapter::new("lo", PFCP_PORT, Arc::clone(engine.dissector()));
    let mut events = engine.events();
    let mut status = engine.events();

    let pdi = build::grouped(ie_type::PDI, &[build::fteid(0x1001, UPF), build::ue_ip(UE)]);
    let establishment = build::message(
        msg_type::SESSION_ESTABLISHMENT_REQUEST,
        Some(0xA1),
        &[build::grouped(ie_type::CREATE_PDR, &[pdi])],
    );
    capture.process_frame(&raw_ipv4_udp(PFCP_PORT, &establishment), LinkType::Raw);

    let session = engine.store().get_by_teid(0x1001).unwrap();
    assert_eq!(session.seid, 0xA1);
    assert_eq!(session.ue_ip, Some(UE));
    assert_eq!(session.upf_ip, Some(UPF));

    let pipeline = engine.pipeline();
    pipeline.handle_item(RingKind::Drops, &drop_item(0x1001));
    pipeline.handle_item(RingKind::Drops, &drop_item(0));
    pipeline.handle_item(RingKind::Drops, &[0u8; 3]);

    let deletion = build::message(msg_type::SESSION_DELETION_REQUEST, Some(0xA1), &[]);
    capture.process_frame(&raw_ipv4_udp(PFCP_PORT, &deletion), LinkType::Raw);
    assert!(engine.store().is_empty());
    pipeline.handle_item(RingKind::Drops, &drop_item(0x1001));

    let mut collector = MetricsCollector::new(10);
    let mut drops = Vec::new();
    while let Some(event) = events.try_recv() {
        if let EngineEvent::Drop(drop) = &event {
            drops.push(drop.clone());
        }
        collector.add_event(&event);
    }

    assert_eq!(drops.len(), 3);
    let mut status_drops = 0;
    while let Some(event) = status.try_recv() {
        status_drops += matches!(event, EngineEvent::Drop(_)) as usize;
    }
    assert_eq!(status_drops, 3);
    assert!(!drops[0].unresolved);
    assert_eq!(drops[0].reason, DropReason::NoPdr);
    assert_eq!(drops[0].src_ip, UE);
    let ctx = drops[0].session.as_ref().unwrap();
    assert_eq!(ctx.seid, 0xA1);
    assert_eq!(ctx.ue_ip, Some(UE));
    assert!(drops[1].unresolved && drops[1].session.is_none());
    assert!(drops[2].unresolved && drops[2].session.is_none());

    let stats = engine.pipeline_stats();
    assert_eq!(stats.drops_received, 3);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.unresolved, 2);
    assert_eq!(stats.malformed, 1);

    let report = collector.drop_stats();
    assert_eq!(report.total, 3);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.unresolved, 2);
    assert_eq!(capture.stats().skipped.load(std::sync::atomic::Ordering::Relaxed), 0);
}

#[test]
fn test_non_pfcp_frames_are_skipped() {
    let (_, _, engine) = engine(EngineConfig::default());
    let capture = CaptureAdapter::new("lo", PFCP_PORT, Arc::clone(engine.dissector()));

    capture.process_frame(&[0x60, 0, 0, 0], LinkType::Raw);
    capture.process_frame(&raw_ipv4_udp(PFCP_PORT, &[0x20]), LinkType::Raw);

    let stats = capture.stats();
    assert_eq!(stats.frames.load(std::sync::atomic::Ordering::Relaxed), 2);
    assert_eq!(stats.skipped.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert!(engine.store().is_empty());
}

#[tokio::test]
async fn test_traffic_and_toggles_through_engine() {
    let (counters, control, mut engine) = engine(EngineConfig {
        stats_interval: Duration::from_millis(20),
        ..Default::default()
    });
    assert!(!control.drop_tracing().unwrap());
    assert!(!control.packet_tracing().unwrap());

    counters.record(0, DIRECTION_UPLINK, 0x1001, 1_000, 10);
    counters.record(1, DIRECTION_UPLINK, 0x1001, 1_000, 20);
    counters.record(2, DIRECTION_DOWNLINK, 0, 500, 30);
    let mut events = engine.events();
    engine.start();

    let mut collector = MetricsCollector::default();
    let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    collector.add_event(&first);

    assert_eq!(collector.traffic().uplink.packets, 2);
    assert_eq!(collector.traffic().uplink.bytes, 2_000);
    assert_eq!(collector.traffic().downlink.packets, 1);
    assert_eq!(collector.traffic().uplink.delta_packets, 0);

    assert!(engine.control().toggle_packet_tracing().unwrap());
    assert!(engine.control().toggle_drop_tracing().unwrap());
    assert!(control.packet_tracing().unwrap());
    assert!(control.drop_tracing().unwrap());

    engine.shutdown().await;
    while events.recv().await.is_some() {}
    assert!(engine.pipeline().is_closed());
}
