//! Enrichment pipeline
//!
//! Drains the kernel ring buffers, joins each event with its PFCP session
//! through a TEID lookup and broadcasts the result to every subscribed
//! [`EventStream`]. A separate task snapshots the traffic counters on a
//! fixed interval.

use crate::{
    clock::KtimeClock,
    correlation::CorrelationStore,
    counters::{CounterSource, TrafficAggregator},
    types::{
        ipv4_from_raw, Direction, DropEvent, DropReason, EngineEvent, EnrichedDropEvent,
        EnrichedPacketEvent, PacketEvent, PipelineCounters, TrafficStats,
    },
};
use anyhow::{Context, Result};
use aya::maps::{MapData, RingBuf};
use log::{debug, info, warn};
use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::unix::AsyncFd,
    sync::{
        broadcast::{
            self,
            error::{RecvError, TryRecvError},
        },
        watch,
    },
    task::JoinHandle,
    time::interval,
};
use tokio_util::sync::CancellationToken;

/// Which ring buffer a drain task reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Drops,
    Packets,
}

impl RingKind {
    fn name(&self) -> &'static str {
        match self {
            RingKind::Drops => "drop",
            RingKind::Packets => "packet",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    drops_received: AtomicU64,
    packets_received: AtomicU64,
    resolved: AtomicU64,
    unresolved: AtomicU64,
    malformed: AtomicU64,
}

/// One subscriber's view of the engine event stream
///
/// A subscriber that falls more than the channel capacity behind loses
/// the oldest events; the loss is added to the pipeline's overflow count.
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<EngineEvent>,
    overflow: Arc<AtomicU64>,
}

impl EventStream {
    fn lagged(&self, missed: u64) {
        self.overflow.fetch_add(missed, Ordering::Relaxed);
        warn!("Event consumer lagged, dropped {} events", missed);
    }

    /// Wait for the next event; `None` once the stream is closed and drained
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.lagged(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Joins kernel events with session context
#[derive(Debug)]
pub struct EnrichmentPipeline {
    store: Arc<CorrelationStore>,
    clock: KtimeClock,
    /// `None` once the stream has been closed
    sender: RwLock<Option<broadcast::Sender<EngineEvent>>>,
    overflow: Arc<AtomicU64>,
    counters: Counters,
}

/// Decode a fixed-size record from a ring buffer item
fn read_record<T: Copy>(data: &[u8]) -> Option<T> {
    if data.len() < mem::size_of::<T>() {
        return None;
    }
    let ptr = data.as_ptr() as *const T;
    Some(unsafe { ptr.read_unaligned() })
}

impl EnrichmentPipeline {
    /// `capacity` bounds how far a subscriber may fall behind
    pub fn new(store: Arc<CorrelationStore>, clock: KtimeClock, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            store,
            clock,
            sender: RwLock::new(Some(sender)),
            overflow: Arc::new(AtomicU64::new(0)),
            counters: Counters::default(),
        }
    }

    /// Subscribe to events published from now on
    ///
    /// After [`close`](Self::close) the returned stream is already ended.
    pub fn subscribe(&self) -> EventStream {
        let sender = self.sender.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let rx = match sender.as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        };
        EventStream {
            rx,
            overflow: Arc::clone(&self.overflow),
        }
    }

    /// End every stream once its buffered events are read
    pub fn close(&self) {
        let mut sender = self.sender.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        sender.take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    fn count_resolution(&self, resolved: bool) {
        let counter = if resolved {
            &self.counters.resolved
        } else {
            &self.counters.unresolved
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Attach session context to a drop event
    ///
    /// TEID 0 or a TEID with no session yields an event marked unresolved
    /// with no session fields.
    pub fn enrich_drop(&self, event: &DropEvent) -> EnrichedDropEvent {
        let session = self.store.context_for_teid(event.teid);
        self.count_resolution(session.is_some());

        EnrichedDropEvent {
            timestamp: self.clock.to_utc(event.timestamp_ns),
            teid: event.teid,
            src_ip: ipv4_from_raw(event.src_ip),
            dst_ip: ipv4_from_raw(event.dst_ip),
            src_port: event.src_port,
            dst_port: event.dst_port,
            pkt_len: event.pkt_len,
            reason: DropReason::from_raw(event.reason),
            direction: Direction::from_raw(event.direction),
            unresolved: session.is_none(),
            session,
        }
    }

    /// Attach session context to a packet event
    pub fn enrich_packet(&self, event: &PacketEvent) -> EnrichedPacketEvent {
        let session = self.store.context_for_teid(event.teid);
        self.count_resolution(session.is_some());

        EnrichedPacketEvent {
            timestamp: self.clock.to_utc(event.timestamp_ns),
            teid: event.teid,
            src_ip: ipv4_from_raw(event.src_ip),
            dst_ip: ipv4_from_raw(event.dst_ip),
            pkt_len: event.pkt_len,
            direction: Direction::from_raw(event.direction),
            qfi: event.qfi,
            unresolved: session.is_none(),
            session,
        }
    }

    pub fn publish_drop(&self, event: &DropEvent) {
        self.counters.drops_received.fetch_add(1, Ordering::Relaxed);
        let enriched = self.enrich_drop(event);
        self.publish(EngineEvent::Drop(enriched));
    }

    pub fn publish_packet(&self, event: &PacketEvent) {
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        let enriched = self.enrich_packet(event);
        self.publish(EngineEvent::Packet(enriched));
    }

    /// Broadcast an event; it is discarded when nobody is subscribed
    pub fn publish(&self, event: EngineEvent) {
        let sender = self.sender.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match sender.as_ref() {
            Some(sender) => {
                let _ = sender.send(event);
            }
            None => debug!("Event stream closed, event discarded"),
        }
    }

    /// Decode and publish one ring buffer item
    pub fn handle_item(&self, kind: RingKind, data: &[u8]) {
        let published = match kind {
            RingKind::Drops => read_record::<DropEvent>(data).map(|e| self.publish_drop(&e)),
            RingKind::Packets => {
                read_record::<PacketEvent>(data).map(|e| self.publish_packet(&e))
            }
        };
        if published.is_none() {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            debug!("Skipping {}-byte {} ring item", data.len(), kind.name());
        }
    }

    pub fn stats(&self) -> PipelineCounters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineCounters {
            drops_received: load(&self.counters.drops_received),
            packets_received: load(&self.counters.packets_received),
            resolved: load(&self.counters.resolved),
            unresolved: load(&self.counters.unresolved),
            malformed: load(&self.counters.malformed),
            queue_overflow: self.overflow.load(Ordering::Relaxed),
        }
    }

    /// Spawn a task draining one ring buffer until cancelled
    pub fn spawn_drain(
        self: &Arc<Self>,
        ring: RingBuf<MapData>,
        kind: RingKind,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut poll = AsyncFd::new(ring).with_context(|| {
            format!("Failed to register {} ring buffer for polling", kind.name())
        })?;
        let pipeline = Arc::clone(self);

        Ok(tokio::spawn(async move {
            info!("Draining {} events", kind.name());
            loop {
                let mut guard = tokio::select! {
                    _ = token.cancelled() => break,
                    ready = poll.readable_mut() => match ready {
                        Ok(guard) => guard,
                        Err(e) => {
                            warn!("Polling {} ring buffer failed: {}", kind.name(), e);
                            break;
                        }
                    },
                };

                let ring = guard.get_inner_mut();
                while let Some(item) = ring.next() {
                    pipeline.handle_item(kind, &item);
                }
                guard.clear_ready();
            }
            debug!("{} drain stopped", kind.name());
        }))
    }

    /// Spawn the periodic traffic snapshot task
    ///
    /// Every tick publishes a `Traffic` event, zero deltas included, and
    /// stores it in `latest`.
    pub fn spawn_snapshots(
        self: &Arc<Self>,
        counters: Arc<dyn CounterSource>,
        period: Duration,
        latest: watch::Sender<TrafficStats>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        let mut aggregator = TrafficAggregator::new(pipeline.clock);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let totals = match counters.direction_totals() {
                    Ok(totals) => totals,
                    Err(e) => {
                        warn!("Failed to read traffic counters: {:#}", e);
                        continue;
                    }
                };

                let stats = aggregator.update(totals, Instant::now());
                latest.send_replace(stats.clone());
                pipeline.publish(EngineEvent::Traffic(stats));
            }
            debug!("Traffic snapshots stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{correlation::Session, counters::MemoryCounters, types::kernel::constants::*};
    use std::net::Ipv4Addr;

    fn pipeline(capacity: usize) -> (Arc<CorrelationStore>, EnrichmentPipeline) {
        let store = Arc::new(CorrelationStore::new());
        let clock = KtimeClock::with_offset(0);
        let pipeline = EnrichmentPipeline::new(Arc::clone(&store), clock, capacity);
        (store, pipeline)
    }

    fn drop_event(teid: u32) -> DropEvent {
        DropEvent {
            timestamp_ns: 1_000,
            teid,
            src_ip: u32::from_ne_bytes([10, 60, 0, 1]),
            dst_ip: u32::from_ne_bytes([10, 100, 200, 3]),
            src_port: 2152,
            dst_port: 2152,
            pkt_len: 120,
            reason: DROP_REASON_KERNEL,
            direction: DIRECTION_UPLINK,
            _padding: [0; 2],
        }
    }

    fn as_bytes<T>(value: &T) -> &[u8] {
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
    }

    #[test]
    fn test_zero_teid_is_unresolved() {
        let (_, pipeline) = pipeline(8);
        let enriched = pipeline.enrich_drop(&drop_event(0));

        assert!(enriched.unresolved);
        assert!(enriched.session.is_none());
        assert_eq!(enriched.reason, DropReason::Kernel);
        assert_eq!(enriched.src_ip, Ipv4Addr::new(10, 60, 0, 1));
        assert_eq!(pipeline.stats().unresolved, 1);
    }

    #[test]
    fn test_known_teid_is_enriched() {
        let (store, pipeline) = pipeline(8);
        let ue = Ipv4Addr::new(10, 60, 0, 9);
        store.upsert(Session {
            ue_ip: Some(ue),
            teids: vec![0x1234],
            ..Session::new(0xA1)
        });

        let enriched = pipeline.enrich_drop(&drop_event(0x1234));
        assert!(!enriched.unresolved);
        let session = enriched.session.unwrap();
        assert_eq!(session.seid, 0xA1);
        assert_eq!(session.ue_ip, Some(ue));
        assert_eq!(pipeline.stats().resolved, 1);
    }

    #[test]
    fn test_unknown_teid_forwarded() {
        let (_, pipeline) = pipeline(8);
        let mut events = pipeline.subscribe();
        pipeline.handle_item(RingKind::Drops, as_bytes(&drop_event(0xdead)));

        match events.try_recv() {
            Some(EngineEvent::Drop(event)) => {
                assert!(event.unresolved);
                assert_eq!(event.teid, 0xdead);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(pipeline.stats().drops_received, 1);
    }

    #[test]
    fn test_packet_event_enriched() {
        let (store, pipeline) = pipeline(8);
        let mut events = pipeline.subscribe();
        store.upsert(Session {
            teids: vec![77],
            ..Session::new(5)
        });
        let event = PacketEvent {
            timestamp_ns: 10,
            teid: 77,
            pkt_len: 1400,
            direction: DIRECTION_UPLINK,
            qfi: 9,
            ..Default::default()
        };
        pipeline.handle_item(RingKind::Packets, as_bytes(&event));

        match events.try_recv() {
            Some(EngineEvent::Packet(p)) => {
                assert_eq!(p.qfi, 9);
                assert_eq!(p.session.map(|s| s.seid), Some(5));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_short_item_counted_as_malformed() {
        let (_, pipeline) = pipeline(8);
        let events = pipeline.subscribe();
        pipeline.handle_item(RingKind::Drops, &[0u8; 7]);
        assert_eq!(pipeline.stats().malformed, 1);
        assert!(events.is_empty());
    }

    #[test]
    fn test_every_subscriber_sees_every_event() {
        let (_, pipeline) = pipeline(16);
        let mut api = pipeline.subscribe();
        let mut exporter = pipeline.subscribe();
        for teid in 1..=10 {
            pipeline.handle_item(RingKind::Drops, as_bytes(&drop_event(teid)));
        }

        let mut api_seen = 0;
        let mut exporter_seen = 0;
        // Alternate reads the way two independent consumers would
        loop {
            let a = api.try_recv();
            let b = exporter.try_recv();
            if a.is_none() && b.is_none() {
                break;
            }
            api_seen += a.is_some() as usize;
            exporter_seen += b.is_some() as usize;
        }
        assert_eq!(api_seen, 10);
        assert_eq!(exporter_seen, 10);
    }

    #[test]
    fn test_overflow_counted() {
        let (_, pipeline) = pipeline(2);
        let mut events = pipeline.subscribe();
        for teid in 1..=5 {
            pipeline.publish_drop(&drop_event(teid));
        }

        let mut teids = Vec::new();
        while let Some(EngineEvent::Drop(event)) = events.try_recv() {
            teids.push(event.teid);
        }
        // Oldest events are the ones lost
        assert_eq!(teids, vec![4, 5]);

        let stats = pipeline.stats();
        assert_eq!(stats.drops_received, 5);
        assert_eq!(stats.queue_overflow, 3);
    }

    #[tokio::test]
    async fn test_close_ends_streams_after_drain() {
        let (_, pipeline) = pipeline(8);
        let mut events = pipeline.subscribe();
        pipeline.publish_drop(&drop_event(1));
        pipeline.close();

        assert!(pipeline.is_closed());
        assert!(matches!(events.recv().await, Some(EngineEvent::Drop(_))));
        assert!(events.recv().await.is_none());
        assert!(pipeline.subscribe().recv().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshots_emit_zero_deltas() {
        let (_, pipeline) = pipeline(16);
        let pipeline = Arc::new(pipeline);
        let mut events = pipeline.subscribe();
        let counters = Arc::new(MemoryCounters::new(2, 16));
        counters.record(0, DIRECTION_UPLINK, 1, 100, 5);

        let (tx, rx) = watch::channel(TrafficStats::default());
        let token = CancellationToken::new();
        let period = Duration::from_millis(10);
        let task = pipeline.spawn_snapshots(counters, period, tx, token.clone());

        let timeout = Duration::from_secs(1);
        let first = tokio::time::timeout(timeout, events.recv()).await.unwrap();
        let second = tokio::time::timeout(timeout, events.recv()).await.unwrap();
        token.cancel();
        task.await.unwrap();

        match (first, second) {
            (Some(EngineEvent::Traffic(a)), Some(EngineEvent::Traffic(b))) => {
                assert_eq!(a.uplink.packets, 1);
                assert_eq!(b.uplink.delta_packets, 0);
                assert_eq!(b.downlink.delta_packets, 0);
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(rx.borrow().uplink.packets, 1);
    }
}
