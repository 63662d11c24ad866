//! Counter Store adapter
//!
//! Reads the per-CPU traffic counters maintained by the kernel probes and
//! turns them into periodic `TrafficStats` snapshots. The kernel keeps one
//! counter per CPU so the hot path never contends; aggregation happens
//! here, only when a snapshot is taken.

use crate::{
    clock::KtimeClock,
    types::{kernel::constants::*, DirectionStats, ProbeStats, TrafficCounter, TrafficStats},
};
use anyhow::{Context, Result};
use aya::maps::{MapData, PerCpuArray, PerCpuHashMap};
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Instant,
};

/// Counter summed across CPUs
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSample {
    pub packets: u64,
    pub bytes: u64,
    /// Most recent kernel timestamp across CPUs (0 = never updated)
    pub last_update_ns: u64,
}

/// Uplink and downlink totals at one point in time
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirectionTotals {
    pub uplink: CounterSample,
    pub downlink: CounterSample,
}

/// Sum per-CPU counters, keeping the latest timestamp
pub fn aggregate<'a, I>(per_cpu: I) -> CounterSample
where
    I: IntoIterator<Item = &'a TrafficCounter>,
{
    per_cpu
        .into_iter()
        .fold(CounterSample::default(), |acc, c| CounterSample {
            packets: acc.packets.wrapping_add(c.packets),
            bytes: acc.bytes.wrapping_add(c.bytes),
            last_update_ns: acc.last_update_ns.max(c.timestamp_ns),
        })
}

/// Source of aggregated traffic counters
pub trait CounterSource: Send + Sync {
    /// Totals per direction, summed across CPUs
    fn direction_totals(&self) -> Result<DirectionTotals>;

    /// Uplink totals per TEID, summed across CPUs
    fn teid_totals(&self) -> Result<HashMap<u32, CounterSample>>;

    /// Probe health counters
    fn probe_stats(&self) -> Result<ProbeStats>;
}

/// Counters read from the kernel maps
pub struct KernelCounters {
    traffic: PerCpuArray<MapData, TrafficCounter>,
    teids: PerCpuHashMap<MapData, u32, TrafficCounter>,
    stats: PerCpuArray<MapData, u64>,
}

impl KernelCounters {
    pub fn new(
        traffic: PerCpuArray<MapData, TrafficCounter>,
        teids: PerCpuHashMap<MapData, u32, TrafficCounter>,
        stats: PerCpuArray<MapData, u64>,
    ) -> Self {
        Self {
            traffic,
            teids,
            stats,
        }
    }

    fn read_direction(&self, direction: u8) -> Result<CounterSample> {
        let values = self
            .traffic
            .get(&(direction as u32), 0)
            .with_context(|| format!("Failed to read {} slot {}", MAP_TRAFFIC_STATS, direction))?;
        Ok(aggregate(values.iter()))
    }
}

impl CounterSource for KernelCounters {
    fn direction_totals(&self) -> Result<DirectionTotals> {
        Ok(DirectionTotals {
            uplink: self.read_direction(DIRECTION_UPLINK)?,
            downlink: self.read_direction(DIRECTION_DOWNLINK)?,
        })
    }

    fn teid_totals(&self) -> Result<HashMap<u32, CounterSample>> {
        let mut totals = HashMap::new();
        for entry in self.teids.iter() {
            // Entries can be evicted between key lookup and value read
            let Ok((teid, values)) = entry else { continue };
            totals.insert(teid, aggregate(values.iter()));
        }
        Ok(totals)
    }

    fn probe_stats(&self) -> Result<ProbeStats> {
        let mut counts = vec![0u64; MAX_STATS as usize];
        for (idx, slot) in counts.iter_mut().enumerate() {
            let values = self
                .stats
                .get(&(idx as u32), 0)
                .with_context(|| format!("Failed to read {} slot {}", MAP_PROBE_STATS, idx))?;
            *slot = values.iter().sum();
        }
        Ok(ProbeStats::from_counts(&counts))
    }
}

#[derive(Debug)]
struct MemoryState {
    directions: [Vec<TrafficCounter>; MAX_DIRECTIONS as usize],
    teids: HashMap<u32, Vec<TrafficCounter>>,
    stats: Vec<u64>,
}

/// In-process counters with explicit per-CPU slots
///
/// Mirrors the kernel layout: every direction and TEID keeps one counter
/// per CPU, and the TEID table is bounded. When it is full the TEID with
/// the oldest update is evicted.
#[derive(Debug)]
pub struct MemoryCounters {
    cpus: usize,
    teid_capacity: usize,
    state: Mutex<MemoryState>,
}

impl MemoryCounters {
    pub fn new(cpus: usize, teid_capacity: usize) -> Self {
        let cpus = cpus.max(1);
        Self {
            cpus,
            teid_capacity: teid_capacity.max(1),
            state: Mutex::new(MemoryState {
                directions: [
                    vec![TrafficCounter::default(); cpus],
                    vec![TrafficCounter::default(); cpus],
                ],
                teids: HashMap::new(),
                stats: vec![0; MAX_STATS as usize],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Account one packet the way the kernel hooks do
    ///
    /// `teid` is only tracked for uplink packets; 0 is never tracked.
    pub fn record(&self, cpu: usize, direction: u8, teid: u32, len: u32, now_ns: u64) {
        let cpu = cpu % self.cpus;
        let mut state = self.lock();

        let (slot, stat) = match direction {
            DIRECTION_UPLINK => (0, STAT_UPLINK_PACKETS),
            DIRECTION_DOWNLINK => (1, STAT_DOWNLINK_PACKETS),
            _ => return,
        };
        bump(&mut state.directions[slot][cpu], len, now_ns);
        state.stats[stat as usize] += 1;

        if direction != DIRECTION_UPLINK || teid == 0 {
            return;
        }

        if !state.teids.contains_key(&teid) && state.teids.len() >= self.teid_capacity {
            let oldest = state
                .teids
                .iter()
                .min_by_key(|(_, per_cpu)| aggregate(per_cpu.iter()).last_update_ns)
                .map(|(teid, _)| *teid);
            if let Some(oldest) = oldest {
                state.teids.remove(&oldest);
            }
        }

        let cpus = self.cpus;
        let per_cpu = state
            .teids
            .entry(teid)
            .or_insert_with(|| vec![TrafficCounter::default(); cpus]);
        bump(&mut per_cpu[cpu], len, now_ns);
    }

    /// Increment a probe statistics counter
    pub fn increment_stat(&self, stat_id: u32) {
        if let Some(slot) = self.lock().stats.get_mut(stat_id as usize) {
            *slot += 1;
        }
    }

    /// Number of TEIDs currently tracked
    pub fn tracked_teids(&self) -> usize {
        self.lock().teids.len()
    }
}

fn bump(counter: &mut TrafficCounter, len: u32, now_ns: u64) {
    counter.packets += 1;
    counter.bytes += len as u64;
    counter.timestamp_ns = now_ns;
}

impl CounterSource for MemoryCounters {
    fn direction_totals(&self) -> Result<DirectionTotals> {
        let state = self.lock();
        Ok(DirectionTotals {
            uplink: aggregate(state.directions[0].iter()),
            downlink: aggregate(state.directions[1].iter()),
        })
    }

    fn teid_totals(&self) -> Result<HashMap<u32, CounterSample>> {
        let state = self.lock();
        Ok(state
            .teids
            .iter()
            .map(|(teid, per_cpu)| (*teid, aggregate(per_cpu.iter())))
            .collect())
    }

    fn probe_stats(&self) -> Result<ProbeStats> {
        Ok(ProbeStats::from_counts(&self.lock().stats))
    }
}

/// Compute one direction's statistics against the previous snapshot
///
/// Deltas saturate at zero if a counter went backwards (LRU eviction or
/// probe reload). Throughput is 0 when no time has elapsed.
pub fn direction_delta(
    current: &CounterSample,
    previous: &CounterSample,
    elapsed_secs: f64,
    clock: &KtimeClock,
) -> DirectionStats {
    let delta_packets = current.packets.saturating_sub(previous.packets);
    let delta_bytes = current.bytes.saturating_sub(previous.bytes);
    let throughput_mbps = if elapsed_secs > 0.0 {
        (delta_bytes as f64 * 8.0) / elapsed_secs / 1_000_000.0
    } else {
        0.0
    };

    DirectionStats {
        packets: current.packets,
        bytes: current.bytes,
        delta_packets,
        delta_bytes,
        throughput_mbps,
        last_updated: clock.to_utc(current.last_update_ns),
    }
}

/// Turns successive counter totals into `TrafficStats` snapshots
#[derive(Debug)]
pub struct TrafficAggregator {
    clock: KtimeClock,
    previous: Option<(DirectionTotals, Instant)>,
}

impl TrafficAggregator {
    pub fn new(clock: KtimeClock) -> Self {
        Self {
            clock,
            previous: None,
        }
    }

    /// Produce a snapshot and remember `totals` as the new baseline
    ///
    /// The first snapshot reports zero deltas and zero throughput.
    pub fn update(&mut self, totals: DirectionTotals, now: Instant) -> TrafficStats {
        let (baseline, elapsed_secs) = match self.previous {
            Some((prev, at)) => (prev, now.saturating_duration_since(at).as_secs_f64()),
            None => (totals, 0.0),
        };

        let stats = TrafficStats {
            uplink: direction_delta(
                &totals.uplink,
                &baseline.uplink,
                elapsed_secs,
                &self.clock,
            ),
            downlink: direction_delta(
                &totals.downlink,
                &baseline.downlink,
                elapsed_secs,
                &self.clock,
            ),
            interval_secs: elapsed_secs,
            timestamp: Utc::now(),
        };

        self.previous = Some((totals, now));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(packets: u64, bytes: u64) -> CounterSample {
        CounterSample {
            packets,
            bytes,
            last_update_ns: 0,
        }
    }

    #[test]
    fn test_aggregate_sums_and_keeps_latest() {
        let per_cpu = [
            TrafficCounter {
                packets: 3,
                bytes: 300,
                timestamp_ns: 50,
            },
            TrafficCounter {
                packets: 2,
                bytes: 100,
                timestamp_ns: 90,
            },
            TrafficCounter::default(),
        ];
        let total = aggregate(per_cpu.iter());
        assert_eq!(total.packets, 5);
        assert_eq!(total.bytes, 400);
        assert_eq!(total.last_update_ns, 90);
    }

    #[test]
    fn test_delta_against_previous_snapshot() {
        let clock = KtimeClock::with_offset(0);
        let mut aggregator = TrafficAggregator::new(clock);
        let start = Instant::now();

        let first = aggregator.update(
            DirectionTotals {
                uplink: sample(60, 60_000),
                downlink: sample(50, 50_000),
            },
            start,
        );
        assert_eq!(first.uplink.delta_packets, 0);
        assert_eq!(first.uplink.throughput_mbps, 0.0);

        let second = aggregator.update(
            DirectionTotals {
                uplink: sample(100, 100_000),
                downlink: sample(80, 80_000),
            },
            start + Duration::from_secs(2),
        );
        assert_eq!(second.uplink.delta_packets, 40);
        assert_eq!(second.downlink.delta_packets, 30);
        assert_eq!(second.uplink.packets, 100);
        assert!((second.interval_secs - 2.0).abs() < 1e-9);
        // 40_000 bytes * 8 / 2 s = 0.16 Mbit/s
        assert!((second.uplink.throughput_mbps - 0.16).abs() < 1e-9);
        assert!((second.downlink.throughput_mbps - 0.12).abs() < 1e-9);
    }

    #[test]
    fn test_zero_deltas_still_reported() {
        let mut aggregator = TrafficAggregator::new(KtimeClock::with_offset(0));
        let start = Instant::now();
        let totals = DirectionTotals {
            uplink: sample(10, 1000),
            downlink: sample(5, 500),
        };
        aggregator.update(totals, start);
        let stats = aggregator.update(totals, start + Duration::from_secs(1));
        assert_eq!(stats.uplink.delta_packets, 0);
        assert_eq!(stats.downlink.delta_bytes, 0);
        assert_eq!(stats.uplink.packets, 10);
    }

    #[test]
    fn test_backwards_counter_saturates() {
        let clock = KtimeClock::with_offset(0);
        let stats = direction_delta(&sample(5, 50), &sample(10, 100), 1.0, &clock);
        assert_eq!(stats.delta_packets, 0);
        assert_eq!(stats.delta_bytes, 0);
    }

    #[test]
    fn test_memory_counters_per_cpu() {
        let counters = MemoryCounters::new(4, 16);
        counters.record(0, DIRECTION_UPLINK, 7, 100, 10);
        counters.record(3, DIRECTION_UPLINK, 7, 200, 20);
        counters.record(1, DIRECTION_DOWNLINK, 0, 50, 30);

        let totals = counters.direction_totals().unwrap();
        assert_eq!(
            totals.uplink,
            CounterSample {
                packets: 2,
                bytes: 300,
                last_update_ns: 20,
            }
        );
        assert_eq!(totals.downlink.packets, 1);

        let teids = counters.teid_totals().unwrap();
        assert_eq!(teids[&7].bytes, 300);
        assert_eq!(teids.len(), 1);

        let stats = counters.probe_stats().unwrap();
        assert_eq!(stats.uplink_packets, 2);
        assert_eq!(stats.downlink_packets, 1);
    }

    #[test]
    fn test_memory_counters_bounded_teid_table() {
        let counters = MemoryCounters::new(1, 2);
        counters.record(0, DIRECTION_UPLINK, 1, 10, 100);
        counters.record(0, DIRECTION_UPLINK, 2, 10, 200);
        counters.record(0, DIRECTION_UPLINK, 3, 10, 300);

        let teids = counters.teid_totals().unwrap();
        assert_eq!(counters.tracked_teids(), 2);
        assert!(!teids.contains_key(&1));
        assert!(teids.contains_key(&3));
    }

    #[test]
    fn test_zero_teid_not_tracked() {
        let counters = MemoryCounters::new(1, 8);
        counters.record(0, DIRECTION_UPLINK, 0, 10, 1);
        assert_eq!(counters.tracked_teids(), 0);
        assert_eq!(counters.direction_totals().unwrap().uplink.packets, 1);
    }
}
