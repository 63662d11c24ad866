//! Metrics exporters
//!
//! Writes a `UpfMetrics` report as JSON, Prometheus text or InfluxDB line
//! protocol.

use crate::types::UpfMetrics;
use anyhow::{Context, Result};
use std::{fs::File, io::Write, path::PathBuf};

/// Trait for metrics exporters
pub trait MetricsExporter: Send + Sync {
    /// Export metrics
    ///
    /// # Arguments
    ///
    /// * `metrics` - Aggregated metrics to export
    fn export(&self, metrics: &UpfMetrics) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus format
    Prometheus,
    /// InfluxDB line protocol
    Influx,
}

impl ExporterType {
    /// Parse a format name as accepted on the command line
    pub fn parse(format: &str) -> Result<Self> {
        match format.to_lowercase().as_str() {
            "json" => Ok(ExporterType::Json),
            "prometheus" | "prom" => Ok(ExporterType::Prometheus),
            "influx" | "influxdb" => Ok(ExporterType::Influx),
            _ => anyhow::bail!(
                "Unsupported format: {}. Use json, prometheus, or influx",
                format
            ),
        }
    }

    /// Build the exporter for this format
    pub fn exporter(self, output_path: PathBuf) -> Box<dyn MetricsExporter> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
            ExporterType::Influx => Box::new(InfluxExporter::new(output_path, "upf".to_string())),
        }
    }
}

fn write_file(path: &PathBuf, data: &str) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(data.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, metrics: &UpfMetrics) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(metrics)?
        } else {
            serde_json::to_string(metrics)?
        };
        write_file(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn header(output: &mut String, name: &str, kind: &str, help: &str) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
    }

    /// Convert metrics to Prometheus format
    fn to_prometheus_format(metrics: &UpfMetrics) -> String {
        let mut output = String::new();
        let traffic = &metrics.traffic;
        let directions = [("uplink", &traffic.uplink), ("downlink", &traffic.downlink)];

        Self::header(
            &mut output,
            "upf_packets_total",
            "counter",
            "Packets seen by the UPF probes",
        );
        for (label, stats) in &directions {
            output.push_str(&format!(
                "upf_packets_total{{direction=\"{}\"}} {}\n",
                label, stats.packets
            ));
        }
        output.push('\n');

        Self::header(
            &mut output,
            "upf_bytes_total",
            "counter",
            "Bytes seen by the UPF probes",
        );
        for (label, stats) in &directions {
            output.push_str(&format!(
                "upf_bytes_total{{direction=\"{}\"}} {}\n",
                label, stats.bytes
            ));
        }
        output.push('\n');

        Self::header(
            &mut output,
            "upf_throughput_mbps",
            "gauge",
            "Throughput over the last interval in Mbit/s",
        );
        for (label, stats) in &directions {
            output.push_str(&format!(
                "upf_throughput_mbps{{direction=\"{}\"}} {:.6}\n",
                label, stats.throughput_mbps
            ));
        }
        output.push('\n');

        Self::header(
            &mut output,
            "upf_packet_drops_total",
            "counter",
            "Packet drops by reason and direction",
        );
        for entry in &metrics.drops.breakdown {
            output.push_str(&format!(
                "upf_packet_drops_total{{reason=\"{}\",direction=\"{}\"}} {}\n",
                entry.reason, entry.direction, entry.count
            ));
        }
        output.push('\n');

        Self::header(
            &mut output,
            "upf_packet_drop_rate_percent",
            "gauge",
            "Drops as a percentage of observed packets",
        );
        output.push_str(&format!(
            "upf_packet_drop_rate_percent {:.6}\n",
            metrics.drops.rate_percent
        ));
        output.push('\n');

        Self::header(&mut output, "upf_active_sessions", "gauge", "Active PFCP sessions");
        output.push_str(&format!("upf_active_sessions {}\n", metrics.active_sessions));
        output.push('\n');

        Self::header(
            &mut output,
            "upf_events_overflow_total",
            "counter",
            "Events lost by subscribers that fell behind",
        );
        output.push_str(&format!(
            "upf_events_overflow_total {}\n",
            metrics.pipeline.queue_overflow
        ));
        output.push('\n');

        Self::header(
            &mut output,
            "upf_events_unresolved_total",
            "counter",
            "Kernel events with no matching session",
        );
        output.push_str(&format!(
            "upf_events_unresolved_total {}\n",
            metrics.pipeline.unresolved
        ));
        output.push('\n');

        Self::header(
            &mut output,
            "upf_probe_ring_full_total",
            "counter",
            "Events lost because a ring buffer was full",
        );
        for (ring, lost) in [
            ("drop", metrics.probes.drop_ring_full),
            ("packet", metrics.probes.packet_ring_full),
        ] {
            output.push_str(&format!(
                "upf_probe_ring_full_total{{ring=\"{}\"}} {}\n",
                ring, lost
            ));
        }
        output.push('\n');

        Self::header(
            &mut output,
            "upf_capture_frames_total",
            "counter",
            "Frames read from the PFCP capture",
        );
        output.push_str(&format!(
            "upf_capture_frames_total {}\n",
            metrics.capture.frames
        ));
        output.push('\n');

        Self::header(
            &mut output,
            "upf_capture_reopens_total",
            "counter",
            "Times the PFCP capture device was reopened",
        );
        output.push_str(&format!(
            "upf_capture_reopens_total {}\n",
            metrics.capture.reopens
        ));
        output.push('\n');

        Self::header(
            &mut output,
            "upf_duration_seconds",
            "gauge",
            "Duration of collection period",
        );
        output.push_str(&format!("upf_duration_seconds {}\n", metrics.duration_seconds));
        output.push('\n');

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, metrics: &UpfMetrics) -> Result<()> {
        write_file(&self.output_path, &Self::to_prometheus_format(metrics))
    }
}

/// InfluxDB line protocol exporter
pub struct InfluxExporter {
    output_path: PathBuf,
    measurement: String,
}

impl InfluxExporter {
    /// Create a new InfluxDB exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `measurement` - Measurement name for InfluxDB
    pub fn new(output_path: PathBuf, measurement: String) -> Self {
        Self {
            output_path,
            measurement,
        }
    }

    /// Convert metrics to InfluxDB line protocol
    fn to_influx_format(metrics: &UpfMetrics, measurement: &str) -> String {
        let mut output = String::new();
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);

        let traffic = &metrics.traffic;
        for (label, stats) in [("uplink", &traffic.uplink), ("downlink", &traffic.downlink)] {
            output.push_str(&format!(
                concat!(
                    "{},type=traffic,direction={} packets={}i,bytes={}i,",
                    "delta_packets={}i,delta_bytes={}i,throughput_mbps={} {}\n"
                ),
                measurement,
                label,
                stats.packets,
                stats.bytes,
                stats.delta_packets,
                stats.delta_bytes,
                stats.throughput_mbps,
                timestamp
            ));
        }

        output.push_str(&format!(
            "{},type=drops total={}i,resolved={}i,unresolved={}i,rate_percent={} {}\n",
            measurement,
            metrics.drops.total,
            metrics.drops.resolved,
            metrics.drops.unresolved,
            metrics.drops.rate_percent,
            timestamp
        ));

        output.push_str(&format!(
            concat!(
                "{},type=summary active_sessions={}i,packet_events={}i,",
                "queue_overflow={}i,duration_seconds={}i {}\n"
            ),
            measurement,
            metrics.active_sessions,
            metrics.packet_events,
            metrics.pipeline.queue_overflow,
            metrics.duration_seconds,
            timestamp
        ));

        output.push_str(&format!(
            "{},type=capture frames={}i,skipped={}i,reopens={}i {}\n",
            measurement,
            metrics.capture.frames,
            metrics.capture.skipped,
            metrics.capture.reopens,
            timestamp
        ));

        output.push_str(&format!(
            concat!(
                "{},type=probes drop_ring_full={}i,packet_ring_full={}i,",
                "teid_insert_failed={}i,read_errors={}i {}\n"
            ),
            measurement,
            metrics.probes.drop_ring_full,
            metrics.probes.packet_ring_full,
            metrics.probes.teid_insert_failed,
            metrics.probes.read_errors,
            timestamp
        ));

        output
    }
}

impl MetricsExporter for InfluxExporter {
    fn export(&self, metrics: &UpfMetrics) -> Result<()> {
        write_file(&self.output_path, &Self::to_influx_format(metrics, &self.measurement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::collections::HashMap;

    fn create_test_metrics() -> UpfMetrics {
        let mut traffic = TrafficStats::default();
        traffic.uplink.packets = 1000;
        traffic.uplink.bytes = 1_500_000;
        traffic.uplink.throughput_mbps = 12.0;
        traffic.downlink.packets = 800;

        let mut by_reason = HashMap::new();
        by_reason.insert("KERNEL_DROP".to_string(), 7);
        let breakdown = vec![DropBreakdown {
            reason: "KERNEL_DROP".to_string(),
            direction: "unknown".to_string(),
            count: 7,
        }];

        UpfMetrics {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            duration_seconds: 60,
            traffic,
            drops: DropStats {
                total: 7,
                by_reason,
                breakdown,
                ..Default::default()
            },
            active_sessions: 2,
            sessions: Vec::new(),
            packet_events: 0,
            pipeline: PipelineCounters {
                queue_overflow: 3,
                ..Default::default()
            },
            probes: ProbeStats {
                drop_ring_full: 4,
                ..Default::default()
            },
            capture: CaptureCounters {
                frames: 12,
                skipped: 2,
                reopens: 1,
            },
        }
    }

    #[test]
    fn test_prometheus_format() {
        let prometheus = PrometheusExporter::to_prometheus_format(&create_test_metrics());

        assert!(prometheus.contains("upf_packets_total{direction=\"uplink\"} 1000"));
        assert!(prometheus.contains("upf_bytes_total{direction=\"uplink\"} 1500000"));
        assert!(prometheus
            .contains("upf_packet_drops_total{reason=\"KERNEL_DROP\",direction=\"unknown\"} 7"));
        assert!(prometheus.contains("upf_active_sessions 2"));
        assert!(prometheus.contains("upf_events_overflow_total 3"));
        assert!(prometheus.contains("upf_probe_ring_full_total{ring=\"drop\"} 4"));
        assert!(prometheus.contains("upf_capture_frames_total 12"));
        assert!(prometheus.contains("upf_capture_reopens_total 1"));
    }

    #[test]
    fn test_influx_format() {
        let influx = InfluxExporter::to_influx_format(&create_test_metrics(), "upf");

        assert!(influx.contains("upf,type=traffic,direction=uplink packets=1000i"));
        assert!(influx.contains("upf,type=drops total=7i"));
        assert!(influx.contains("active_sessions=2i"));
        assert!(influx.contains("upf,type=capture frames=12i,skipped=2i,reopens=1i"));
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(ExporterType::parse("PROM").unwrap(), ExporterType::Prometheus);
        assert_eq!(ExporterType::parse("influxdb").unwrap(), ExporterType::Influx);
        assert!(ExporterType::parse("xml").is_err());
    }

    #[test]
    fn test_json_export_round_trips_to_file() {
        let name = format!("upf-metrics-{}.json", std::process::id());
        let path = std::env::temp_dir().join(name);
        JsonExporter::new(path.clone(), false).export(&create_test_metrics()).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["active_sessions"], 2);
        assert_eq!(written["traffic"]["uplink"]["packets"], 1000);
        std::fs::remove_file(path).unwrap();
    }
}
