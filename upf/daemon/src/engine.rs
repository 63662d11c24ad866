//! Engine façade
//!
//! Owns the correlation store, counter source, probe control and
//! enrichment pipeline, runs their background tasks and offers the
//! snapshot, event stream and toggle operations collaborators use.

use crate::{
    capture::{CaptureAdapter, CaptureStats},
    clock::KtimeClock,
    config::EngineConfig,
    control::ProbeControl,
    correlation::CorrelationStore,
    counters::CounterSource,
    events::{EnrichmentPipeline, EventStream, RingKind},
    pfcp::{Dissector, DissectorStats},
    types::{
        kernel::constants::*, CaptureCounters, PipelineCounters, ProbeStats, SessionSnapshot,
        TrafficStats,
    },
};
use anyhow::{Context, Result};
use aya::maps::{MapData, RingBuf};
use chrono::Utc;
use log::{info, warn};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;

/// Correlation and telemetry engine
pub struct Engine {
    config: EngineConfig,
    clock: KtimeClock,
    store: Arc<CorrelationStore>,
    dissector: Arc<Dissector>,
    counters: Arc<dyn CounterSource>,
    control: Arc<dyn ProbeControl>,
    pipeline: Arc<EnrichmentPipeline>,
    capture: Option<Arc<CaptureStats>>,
    latest_tx: Option<watch::Sender<TrafficStats>>,
    latest: watch::Receiver<TrafficStats>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build an engine and apply the initial probe configuration
    pub fn new(
        config: EngineConfig,
        counters: Arc<dyn CounterSource>,
        control: Arc<dyn ProbeControl>,
        clock: KtimeClock,
    ) -> Result<Self> {
        if let Some(offset) = config.skb_len_offset {
            control
                .set_slot(CONFIG_SKB_LEN_OFFSET, offset)
                .context("Failed to set sk_buff.len offset")?;
        }
        if let Some(offset) = config.skb_data_offset {
            control
                .set_slot(CONFIG_SKB_DATA_OFFSET, offset)
                .context("Failed to set sk_buff.data offset")?;
        }
        control.set_packet_tracing(config.packet_tracing)?;
        control.set_drop_tracing(config.drop_tracing)?;

        let store = Arc::new(CorrelationStore::new());
        let dissector = Arc::new(Dissector::new(Arc::clone(&store)));
        let pipeline = Arc::new(EnrichmentPipeline::new(
            Arc::clone(&store),
            clock,
            config.queue_capacity,
        ));
        let (latest_tx, latest) = watch::channel(TrafficStats::default());

        Ok(Self {
            config,
            clock,
            store,
            dissector,
            counters,
            control,
            pipeline,
            capture: None,
            latest_tx: Some(latest_tx),
            latest,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Start the traffic snapshot task and, if configured, the idle reaper
    pub fn start(&mut self) {
        if let Some(latest_tx) = self.latest_tx.take() {
            let task = self.pipeline.spawn_snapshots(
                Arc::clone(&self.counters),
                self.config.stats_interval,
                latest_tx,
                self.token.child_token(),
            );
            self.tasks.push(task);
        }

        if let (Some(timeout), Some(period)) =
            (self.config.session_idle_timeout, self.config.reap_interval())
        {
            info!("Reclaiming sessions idle for more than {:?}", timeout);
            self.tasks.push(self.spawn_reaper(timeout, period));
        }
    }

    /// Drain a kernel ring buffer into the event stream
    pub fn attach_ring(&mut self, ring: RingBuf<MapData>, kind: RingKind) -> Result<()> {
        let task = self
            .pipeline
            .spawn_drain(ring, kind, self.token.child_token())?;
        self.tasks.push(task);
        Ok(())
    }

    /// Start PFCP capture on the configured interface
    ///
    /// Fails if the device cannot be opened.
    pub fn start_capture(&mut self) -> Result<()> {
        let Some(interface) = self.config.interface.clone() else {
            warn!("No capture interface configured, sessions will not be tracked");
            return Ok(());
        };
        let adapter = CaptureAdapter::new(
            interface,
            self.config.pfcp_port,
            Arc::clone(&self.dissector),
        );
        let stats = adapter.stats();
        let task = adapter.spawn(self.token.child_token())?;
        self.capture = Some(stats);
        self.tasks.push(task);
        Ok(())
    }

    fn spawn_reaper(&self, timeout: Duration, period: Duration) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let clock = self.clock;
        let token = self.token.child_token();
        let max_idle =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let activity: HashMap<_, _> = match counters.teid_totals() {
                    Ok(totals) => totals
                        .into_iter()
                        .filter_map(|(teid, sample)| {
                            Some((teid, clock.to_utc(sample.last_update_ns)?))
                        })
                        .collect(),
                    Err(e) => {
                        warn!("Failed to read TEID counters: {:#}", e);
                        continue;
                    }
                };

                let removed = store.remove_idle(Utc::now() - max_idle, &activity);
                if !removed.is_empty() {
                    info!("Reclaimed {} idle sessions", removed.len());
                }
            }
        })
    }

    /// Latest aggregated uplink/downlink statistics
    pub fn traffic_snapshot(&self) -> TrafficStats {
        self.latest.borrow().clone()
    }

    /// Active sessions with uplink counts summed over their TEIDs
    pub fn sessions_snapshot(&self) -> Result<Vec<SessionSnapshot>> {
        let totals = self.counters.teid_totals()?;
        Ok(self
            .store
            .sessions()
            .iter()
            .map(|session| {
                let mut snapshot = session.snapshot();
                for sample in session.teids.iter().filter_map(|teid| totals.get(teid)) {
                    snapshot.packets_ul += sample.packets;
                    snapshot.bytes_ul += sample.bytes;
                }
                snapshot
            })
            .collect())
    }

    /// Subscribe to the enriched event stream
    ///
    /// Every subscriber receives every event published after it subscribed.
    pub fn events(&self) -> EventStream {
        self.pipeline.subscribe()
    }

    pub fn set_packet_tracing(&self, enabled: bool) -> Result<()> {
        self.control.set_packet_tracing(enabled)
    }

    pub fn set_drop_tracing(&self, enabled: bool) -> Result<()> {
        self.control.set_drop_tracing(enabled)
    }

    pub fn control(&self) -> &Arc<dyn ProbeControl> {
        &self.control
    }

    pub fn pipeline_stats(&self) -> PipelineCounters {
        self.pipeline.stats()
    }

    pub fn probe_stats(&self) -> Result<ProbeStats> {
        self.counters.probe_stats()
    }

    /// Capture counters; zero until capture has started
    pub fn capture_stats(&self) -> CaptureCounters {
        self.capture
            .as_ref()
            .map(|stats| stats.snapshot())
            .unwrap_or_default()
    }

    pub fn dissector_stats(&self) -> DissectorStats {
        self.dissector.stats()
    }

    pub fn dissector(&self) -> &Arc<Dissector> {
        &self.dissector
    }

    pub fn store(&self) -> &Arc<CorrelationStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<EnrichmentPipeline> {
        &self.pipeline
    }

    /// Token cancelled on shutdown
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop every task and close the event stream
    ///
    /// Events already buffered stay available to subscribers.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        self.pipeline.close();
        info!("Engine stopped");
    }
}
