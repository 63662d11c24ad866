//! eBPF UPF Monitor - Userspace Program
//!
//! Loads the UPF monitor eBPF program, attaches it to the gtp5g module,
//! captures PFCP on the N4 interface to correlate sessions with TEIDs,
//! and exports enriched traffic and drop metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Capture PFCP on eth0 and run until interrupted
//! sudo ./upf-monitor --interface eth0 --ebpf-object upf-monitor.o
//!
//! # Run for 5 minutes, exporting Prometheus text every 15 seconds
//! sudo ./upf-monitor -i eth0 --duration 300 --format prometheus \
//!     --output upf.prom --export-interval 15
//!
//! # Toggle drop tracing / packet tracing at runtime
//! sudo kill -USR1 $(pidof upf-monitor)
//! sudo kill -USR2 $(pidof upf-monitor)
//! ```

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal::{
        self,
        unix::{signal as unix_signal, SignalKind},
    },
    sync::Mutex,
    task::JoinHandle,
    time::{interval_at, sleep_until, Instant},
};
use upf_monitor::{
    clock::KtimeClock,
    collector::MetricsCollector,
    config::EngineConfig,
    control::ProbeControl,
    engine::Engine,
    events::{EventStream, RingKind},
    exporter::{ExporterType, MetricsExporter},
    loader::ProbeLoader,
    types::{format_bytes, EngineEvent, EnrichedDropEvent, UpfMetrics},
};

/// UPF session correlation and telemetry using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Interface carrying PFCP (N4) traffic
    #[clap(short, long)]
    interface: Option<String>,

    /// PFCP UDP port
    #[clap(long, default_value_t = 8805)]
    pfcp_port: u16,

    /// Path to eBPF object file (if not embedded)
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// Traffic snapshot interval in seconds
    #[clap(long, default_value_t = 1)]
    stats_interval: u64,

    /// Events a consumer may fall behind before the oldest are dropped
    #[clap(long, default_value_t = 4096)]
    queue_capacity: usize,

    /// Number of recent drops kept in the report
    #[clap(long, default_value_t = 100)]
    recent_drops: usize,

    /// Enable per-packet tracing at startup
    #[clap(long)]
    packet_tracing: bool,

    /// Enable drop tracing at startup (traces every kfree_skb on the host)
    #[clap(long)]
    drop_tracing: bool,

    /// Reclaim sessions idle for this many seconds (0 = never)
    #[clap(long, default_value_t = 0)]
    session_idle_timeout: u64,

    /// Override the sk_buff.len offset used by the probes
    #[clap(long)]
    skb_len_offset: Option<u32>,

    /// Override the sk_buff.data offset used by the probes
    #[clap(long)]
    skb_data_offset: Option<u32>,

    /// Output file for metrics
    #[clap(short, long, default_value = "upf-metrics.json")]
    output: PathBuf,

    /// Output format (json, prometheus, influx)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Also export every N seconds while running (0 = only at shutdown)
    #[clap(long, default_value_t = 0)]
    export_interval: u64,

    /// Duration to run (in seconds, 0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            interface: self.interface.clone(),
            pfcp_port: self.pfcp_port,
            stats_interval: Duration::from_secs(self.stats_interval.max(1)),
            queue_capacity: self.queue_capacity,
            recent_drops: self.recent_drops,
            packet_tracing: self.packet_tracing,
            drop_tracing: self.drop_tracing,
            session_idle_timeout: (self.session_idle_timeout > 0)
                .then(|| Duration::from_secs(self.session_idle_timeout)),
            skb_len_offset: self.skb_len_offset,
            skb_data_offset: self.skb_data_offset,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("upf-monitor must run as root to load eBPF programs and capture packets");
    }

    let export_format = ExporterType::parse(&args.format)?;
    let exporter = export_format.exporter(args.output.clone());
    let config = args.engine_config();

    info!("Starting UPF monitor...");
    info!(
        "   Interface: {}",
        config.interface.as_deref().unwrap_or("none (no session correlation)")
    );
    info!("   PFCP port: {}", config.pfcp_port);
    info!(
        "   Duration: {}",
        if args.duration == 0 {
            "until interrupted".to_string()
        } else {
            format!("{} seconds", args.duration)
        }
    );
    info!("   Output: {:?} ({:?})", args.output, export_format);

    // Load eBPF program and attach every probe
    let mut loader = ProbeLoader::load(args.ebpf_object.clone())?;
    loader.init_logger();
    loader.attach_kprobes()?;
    loader.attach_tracepoints()?;

    let counters = Arc::new(loader.counters()?);
    let control = Arc::new(loader.control()?);
    let drop_ring = loader.drop_ring()?;
    let packet_ring = loader.packet_ring()?;

    let clock = KtimeClock::new()?;
    let mut engine = Engine::new(config.clone(), counters, control, clock)?;

    // Subscribe before any producer starts
    let collector = Arc::new(Mutex::new(MetricsCollector::new(config.recent_drops)));
    let consumer = spawn_consumer(engine.events(), Arc::clone(&collector));

    engine.attach_ring(drop_ring, RingKind::Drops)?;
    engine.attach_ring(packet_ring, RingKind::Packets)?;
    engine.start();
    engine.start_capture()?;

    info!("Collecting metrics...");
    info!("   SIGUSR1 toggles drop tracing, SIGUSR2 toggles packet tracing");

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sigusr1 = unix_signal(SignalKind::user_defined1())?;
    let mut sigusr2 = unix_signal(SignalKind::user_defined2())?;

    let start_time = Instant::now();
    let deadline = start_time + Duration::from_secs(args.duration);
    let export_period = Duration::from_secs(args.export_interval.max(1));
    let mut export_ticker = interval_at(start_time + export_period, export_period);

    loop {
        tokio::select! {
            _ = sleep_until(deadline), if args.duration > 0 => {
                info!("Duration reached, shutting down...");
                break;
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Terminated, shutting down...");
                break;
            }
            _ = sigusr1.recv() => {
                if let Err(e) = engine.control().toggle_drop_tracing() {
                    warn!("Failed to toggle drop tracing: {:#}", e);
                }
            }
            _ = sigusr2.recv() => {
                if let Err(e) = engine.control().toggle_packet_tracing() {
                    warn!("Failed to toggle packet tracing: {:#}", e);
                }
            }
            _ = export_ticker.tick(), if args.export_interval > 0 => {
                let elapsed = start_time.elapsed().as_secs();
                let metrics = build_metrics(&engine, &collector, elapsed).await;
                match exporter.export(&metrics) {
                    Ok(()) => info!("Metrics written to {:?}", args.output),
                    Err(e) => warn!("Periodic export failed: {:#}", e),
                }
            }
        }
    }

    // Stop producers, then let the consumer drain what is queued
    engine.shutdown().await;
    if let Err(e) = consumer.await {
        warn!("Event consumer ended abnormally: {}", e);
    }

    let elapsed = start_time.elapsed().as_secs();

    info!("Generating metrics report...");
    let metrics = build_metrics(&engine, &collector, elapsed).await;
    exporter.export(&metrics)?;
    info!("Metrics written to {:?}", args.output);

    // Detach every probe before reporting
    drop(engine);
    drop(loader);

    print_summary(&metrics);

    Ok(())
}

/// Fold engine events into the collector and log drops as they arrive
fn spawn_consumer(
    mut events: EventStream,
    collector: Arc<Mutex<MetricsCollector>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let EngineEvent::Drop(drop) = &event {
                log_drop(drop);
            }
            collector.lock().await.add_event(&event);
        }
    })
}

fn log_drop(drop: &EnrichedDropEvent) {
    let session = match &drop.session {
        Some(ctx) => match ctx.ue_ip {
            Some(ue_ip) => format!("seid=0x{:x} ue={}", ctx.seid, ue_ip),
            None => format!("seid=0x{:x}", ctx.seid),
        },
        None => "unresolved".to_string(),
    };
    info!(
        "[DROP] teid=0x{:08x} {}:{} -> {}:{} len={} reason={} dir={} {}",
        drop.teid,
        drop.src_ip,
        drop.src_port,
        drop.dst_ip,
        drop.dst_port,
        drop.pkt_len,
        drop.reason,
        drop.direction,
        session
    );
}

async fn build_metrics(
    engine: &Engine,
    collector: &Mutex<MetricsCollector>,
    elapsed: u64,
) -> UpfMetrics {
    let sessions = engine.sessions_snapshot().unwrap_or_else(|e| {
        warn!("Failed to read session counters: {:#}", e);
        engine.store().sessions().iter().map(|s| s.snapshot()).collect()
    });
    let probes = engine.probe_stats().unwrap_or_else(|e| {
        warn!("Failed to read probe statistics: {:#}", e);
        Default::default()
    });

    collector.lock().await.generate_metrics(
        elapsed,
        sessions,
        engine.pipeline_stats(),
        probes,
        engine.capture_stats(),
    )
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║          eBPF UPF Monitor - gtp5g                 ║
║      Session Correlation & Telemetry              ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(metrics: &UpfMetrics) {
    let traffic = &metrics.traffic;

    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Duration:           {} seconds", metrics.duration_seconds);
    info!("  Active sessions:    {}", metrics.active_sessions);
    info!("");
    info!("  Traffic:");
    info!(
        "    Uplink:   {:>10} pkts  {:>12}  {:>8.2} Mbps",
        traffic.uplink.packets,
        format_bytes(traffic.uplink.bytes),
        traffic.uplink.throughput_mbps
    );
    info!(
        "    Downlink: {:>10} pkts  {:>12}  {:>8.2} Mbps",
        traffic.downlink.packets,
        format_bytes(traffic.downlink.bytes),
        traffic.downlink.throughput_mbps
    );
    info!("");
    info!("  Drops:");
    info!("    Total:      {:>8}", metrics.drops.total);
    info!("    Rate:       {:>8.4} %", metrics.drops.rate_percent);
    info!("    Resolved:   {:>8}", metrics.drops.resolved);
    info!("    Unresolved: {:>8}", metrics.drops.unresolved);
    for entry in &metrics.drops.breakdown {
        info!("    {:<14} {:<9} {:>8}", entry.reason, entry.direction, entry.count);
    }
    info!("");
    info!("  Pipeline:");
    info!("    Packet events:   {:>8}", metrics.packet_events);
    info!("    Queue overflow:  {:>8}", metrics.pipeline.queue_overflow);
    info!("    Malformed items: {:>8}", metrics.pipeline.malformed);
    info!("");
    info!("  Probes:");
    info!("    Drop ring full:     {:>8}", metrics.probes.drop_ring_full);
    info!("    Packet ring full:   {:>8}", metrics.probes.packet_ring_full);
    info!("    TEID insert failed: {:>8}", metrics.probes.teid_insert_failed);
    info!("    Read errors:        {:>8}", metrics.probes.read_errors);
    info!("");
    info!("============================================");
}
