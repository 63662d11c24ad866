//! eBPF program loader
//!
//! Loads the UPF monitor object, attaches its probes to the gtp5g module
//! and the skb:kfree_skb tracepoint, and hands out its maps. Every probe
//! is required: without them the engine has nothing to report.

use crate::{
    control::KernelControl,
    counters::KernelCounters,
    types::kernel::constants::*,
};
use anyhow::{Context, Result};
use aya::{
    maps::{Array, MapData, PerCpuArray, PerCpuHashMap, RingBuf},
    programs::{KProbe, TracePoint},
    Bpf,
};
use aya_log::BpfLogger;
use log::{info, warn};
use std::path::PathBuf;

/// Uplink hook: gtp5g_encap_recv(struct sock *, struct sk_buff *)
pub const UPLINK_PROBE: &str = "gtp5g_encap_recv";
/// Downlink hook: gtp5g_dev_xmit(struct sk_buff *, struct net_device *)
pub const DOWNLINK_PROBE: &str = "gtp5g_dev_xmit";
/// Program attached to skb:kfree_skb
pub const DROP_PROGRAM: &str = "kfree_skb_drop";

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load eBPF program from file or embedded bytecode
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to eBPF object file. If None, uses embedded bytecode.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        info!("Loading eBPF program...");

        let ebpf = if let Some(obj_path) = path {
            info!("Loading eBPF object from: {:?}", obj_path);
            let data = std::fs::read(&obj_path)
                .with_context(|| format!("Failed to read eBPF object file: {:?}", obj_path))?;
            Bpf::load(&data).context("Failed to load eBPF program")?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("Loading embedded eBPF program...");
                let data = include_bytes!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../../target/bpfel-unknown-none/release/upf-monitor"
                ));
                Bpf::load(data).context("Failed to load embedded eBPF program")?
            }
            #[cfg(not(feature = "embedded"))]
            {
                anyhow::bail!(
                    "No eBPF object file provided. \
                     Use --ebpf-object or compile with 'embedded' feature"
                );
            }
        };

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    /// Forward kernel-side log records to the `log` facade
    ///
    /// Non-fatal if it fails.
    pub fn init_logger(&mut self) {
        if let Err(e) = BpfLogger::init(&mut self.ebpf) {
            warn!("eBPF logger not initialised, kernel log records will be lost: {}", e);
        }
    }

    fn attach_kprobe(&mut self, function: &str) -> Result<()> {
        let program: &mut KProbe = self
            .ebpf
            .program_mut(function)
            .with_context(|| format!("{} program not found in eBPF object", function))?
            .try_into()
            .with_context(|| format!("Failed to get {} as KProbe", function))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", function))?;
        program.attach(function, 0).with_context(|| {
            format!("Failed to attach {} kprobe (is the gtp5g module loaded?)", function)
        })?;
        info!("  ✓ Attached to {}", function);
        Ok(())
    }

    /// Attach kprobes to the gtp5g data path
    ///
    /// Attaches to:
    /// - gtp5g_encap_recv (uplink)
    /// - gtp5g_dev_xmit (downlink)
    pub fn attach_kprobes(&mut self) -> Result<()> {
        info!("Attaching kprobes for traffic tracking...");

        self.attach_kprobe(UPLINK_PROBE)?;
        self.attach_kprobe(DOWNLINK_PROBE)?;

        info!("All kprobes attached successfully");
        Ok(())
    }

    /// Attach tracepoints for packet drop tracking
    ///
    /// Attaches to:
    /// - skb:kfree_skb
    pub fn attach_tracepoints(&mut self) -> Result<()> {
        info!("Attaching tracepoints...");

        let program: &mut TracePoint = self
            .ebpf
            .program_mut(DROP_PROGRAM)
            .with_context(|| format!("{} program not found in eBPF object", DROP_PROGRAM))?
            .try_into()
            .with_context(|| format!("Failed to get {} as TracePoint", DROP_PROGRAM))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", DROP_PROGRAM))?;
        program
            .attach("skb", "kfree_skb")
            .context("Failed to attach skb:kfree_skb tracepoint")?;
        info!("  ✓ Attached to skb:kfree_skb tracepoint");

        Ok(())
    }

    /// Per-CPU traffic, per-TEID and probe-health counters
    pub fn counters(&mut self) -> Result<KernelCounters> {
        let traffic = PerCpuArray::try_from(self.take_map(MAP_TRAFFIC_STATS)?)
            .with_context(|| {
                format!("Failed to create PerCpuArray from {} map", MAP_TRAFFIC_STATS)
            })?;
        let teids = PerCpuHashMap::try_from(self.take_map(MAP_TEID_STATS)?)
            .with_context(|| {
                format!("Failed to create PerCpuHashMap from {} map", MAP_TEID_STATS)
            })?;
        let stats = PerCpuArray::try_from(self.take_map(MAP_PROBE_STATS)?)
            .with_context(|| format!("Failed to create PerCpuArray from {} map", MAP_PROBE_STATS))?;

        Ok(KernelCounters::new(traffic, teids, stats))
    }

    /// Runtime configuration slots
    pub fn control(&mut self) -> Result<KernelControl> {
        let config: Array<MapData, u32> = Array::try_from(self.take_map(MAP_AGENT_CONFIG)?)
            .with_context(|| format!("Failed to create Array from {} map", MAP_AGENT_CONFIG))?;
        Ok(KernelControl::new(config))
    }

    /// Ring buffer carrying drop events
    pub fn drop_ring(&mut self) -> Result<RingBuf<MapData>> {
        self.ring(MAP_DROP_EVENTS)
    }

    /// Ring buffer carrying per-packet events
    pub fn packet_ring(&mut self) -> Result<RingBuf<MapData>> {
        self.ring(MAP_PACKET_EVENTS)
    }

    fn ring(&mut self, name: &str) -> Result<RingBuf<MapData>> {
        RingBuf::try_from(self.take_map(name)?)
            .with_context(|| format!("Failed to create RingBuf from {} map", name))
    }

    fn take_map(&mut self, name: &str) -> Result<aya::maps::Map> {
        self.ebpf
            .take_map(name)
            .with_context(|| format!("{} map not found in eBPF object", name))
    }
}
