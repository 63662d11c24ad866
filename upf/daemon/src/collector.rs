//! Metrics collection and aggregation
//!
//! Folds the engine's event stream into the totals reported at export time.

use crate::types::*;
use std::collections::{HashMap, VecDeque};

/// Default size of the recent-drops window
pub const DEFAULT_RECENT_DROPS: usize = 100;

/// Metrics collector for aggregating engine events
pub struct MetricsCollector {
    /// Latest traffic snapshot
    traffic: TrafficStats,
    /// Drops per reason label
    by_reason: HashMap<String, u64>,
    /// Drops per direction label
    by_direction: HashMap<String, u64>,
    /// Drops per reason and direction
    by_class: HashMap<(DropReason, Direction), u64>,
    /// Most recent drops, newest first
    recent_drops: VecDeque<EnrichedDropEvent>,
    recent_capacity: usize,
    total_drops: u64,
    resolved_drops: u64,
    unresolved_drops: u64,
    packet_events: u64,
    traffic_updates: u64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_DROPS)
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    ///
    /// # Arguments
    ///
    /// * `recent_capacity` - Number of recent drops kept for the report
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            traffic: TrafficStats::default(),
            by_reason: HashMap::new(),
            by_direction: HashMap::new(),
            by_class: HashMap::new(),
            recent_drops: VecDeque::with_capacity(recent_capacity),
            recent_capacity,
            total_drops: 0,
            resolved_drops: 0,
            unresolved_drops: 0,
            packet_events: 0,
            traffic_updates: 0,
        }
    }

    /// Add an engine event to the collector
    pub fn add_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Traffic(stats) => {
                self.traffic = stats.clone();
                self.traffic_updates += 1;
            }
            EngineEvent::Drop(drop) => self.add_drop(drop),
            EngineEvent::Packet(_) => self.packet_events += 1,
        }
    }

    fn add_drop(&mut self, drop: &EnrichedDropEvent) {
        self.total_drops += 1;
        *self.by_reason.entry(drop.reason.to_string()).or_insert(0) += 1;
        *self.by_direction.entry(drop.direction.to_string()).or_insert(0) += 1;
        *self.by_class.entry((drop.reason, drop.direction)).or_insert(0) += 1;

        if drop.unresolved {
            self.unresolved_drops += 1;
        } else {
            self.resolved_drops += 1;
        }

        if self.recent_capacity == 0 {
            return;
        }
        if self.recent_drops.len() >= self.recent_capacity {
            self.recent_drops.pop_back();
        }
        self.recent_drops.push_front(drop.clone());
    }

    /// Drops as a percentage of packets seen by the traffic probes
    pub fn drop_rate_percent(&self) -> f64 {
        let observed = self.traffic.uplink.packets + self.traffic.downlink.packets;
        if observed == 0 {
            return 0.0;
        }
        self.total_drops as f64 / observed as f64 * 100.0
    }

    pub fn drop_stats(&self) -> DropStats {
        let mut breakdown: Vec<DropBreakdown> = self
            .by_class
            .iter()
            .map(|((reason, direction), count)| DropBreakdown {
                reason: reason.to_string(),
                direction: direction.to_string(),
                count: *count,
            })
            .collect();
        breakdown.sort();

        DropStats {
            total: self.total_drops,
            rate_percent: self.drop_rate_percent(),
            by_reason: self.by_reason.clone(),
            by_direction: self.by_direction.clone(),
            breakdown,
            resolved: self.resolved_drops,
            unresolved: self.unresolved_drops,
            recent_drops: self.recent_drops.iter().cloned().collect(),
        }
    }

    /// Generate aggregated metrics
    ///
    /// # Arguments
    ///
    /// * `elapsed_secs` - Duration of collection period in seconds
    /// * `sessions` - Active sessions at report time
    /// * `pipeline` - Userspace pipeline counters
    /// * `probes` - Kernel probe counters
    /// * `capture` - PFCP capture counters
    pub fn generate_metrics(
        &self,
        elapsed_secs: u64,
        sessions: Vec<SessionSnapshot>,
        pipeline: PipelineCounters,
        probes: ProbeStats,
        capture: CaptureCounters,
    ) -> UpfMetrics {
        UpfMetrics {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            traffic: self.traffic.clone(),
            drops: self.drop_stats(),
            active_sessions: sessions.len(),
            sessions,
            packet_events: self.packet_events,
            pipeline,
            probes,
            capture,
        }
    }

    /// Latest traffic snapshot
    pub fn traffic(&self) -> &TrafficStats {
        &self.traffic
    }

    /// Get total number of drops processed
    pub fn drop_count(&self) -> u64 {
        self.total_drops
    }

    /// Number of traffic snapshots received
    pub fn traffic_updates(&self) -> u64 {
        self.traffic_updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn drop(teid: u32, reason: DropReason, unresolved: bool) -> EnrichedDropEvent {
        EnrichedDropEvent {
            timestamp: None,
            teid,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
            pkt_len: 100,
            reason,
            direction: Direction::Uplink,
            unresolved,
            session: None,
        }
    }

    fn traffic(ul: u64, dl: u64) -> TrafficStats {
        let mut stats = TrafficStats::default();
        stats.uplink.packets = ul;
        stats.downlink.packets = dl;
        stats
    }

    #[test]
    fn test_collector_basic() {
        let mut collector = MetricsCollector::new(10);
        collector.add_event(&EngineEvent::Traffic(traffic(150, 50)));
        collector.add_event(&EngineEvent::Drop(drop(1, DropReason::Kernel, false)));
        collector.add_event(&EngineEvent::Drop(drop(0, DropReason::Kernel, true)));
        collector.add_event(&EngineEvent::Drop(drop(2, DropReason::NoPdr, true)));

        let stats = collector.drop_stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_reason["KERNEL_DROP"], 2);
        assert_eq!(stats.by_reason["NO_PDR"], 1);
        assert_eq!(stats.by_direction["uplink"], 3);
        assert_eq!(
            stats.breakdown[0],
            DropBreakdown {
                reason: "KERNEL_DROP".to_string(),
                direction: "uplink".to_string(),
                count: 2,
            }
        );
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.unresolved, 2);
        assert!((stats.rate_percent - 1.5).abs() < 1e-9);
        // Newest first
        assert_eq!(stats.recent_drops[0].teid, 2);
    }

    #[test]
    fn test_recent_window_bounded() {
        let mut collector = MetricsCollector::new(3);
        for teid in 1..=10 {
            collector.add_event(&EngineEvent::Drop(drop(teid, DropReason::Qos, true)));
        }
        let recent: Vec<u32> = collector.drop_stats().recent_drops.iter().map(|d| d.teid).collect();
        assert_eq!(recent, vec![10, 9, 8]);
        assert_eq!(collector.drop_count(), 10);
    }

    #[test]
    fn test_generate_metrics() {
        let mut collector = MetricsCollector::default();
        collector.add_event(&EngineEvent::Traffic(traffic(0, 0)));

        let metrics = collector.generate_metrics(
            30,
            Vec::new(),
            PipelineCounters::default(),
            ProbeStats::default(),
            CaptureCounters {
                frames: 4,
                ..Default::default()
            },
        );
        assert_eq!(metrics.duration_seconds, 30);
        assert_eq!(metrics.active_sessions, 0);
        assert_eq!(metrics.drops.rate_percent, 0.0);
        assert_eq!(metrics.capture.frames, 4);
        assert_eq!(collector.traffic_updates(), 1);
    }
}
