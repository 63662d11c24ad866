//! PFCP capture adapter
//!
//! Reads PFCP datagrams from a live pcap handle and feeds them to the
//! [`Dissector`]. The read loop runs on a blocking thread; the short read
//! timeout lets it notice cancellation between packets.

use crate::{
    frame::{parse_frame, LinkType},
    pfcp::Dissector,
    types::CaptureCounters,
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use pcap::{Active, Capture};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SNAPLEN: i32 = 65535;
const READ_TIMEOUT_MS: i32 = 100;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Capture loop counters
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames: AtomicU64,
    /// Frames that were not IPv4/UDP to the PFCP port
    pub skipped: AtomicU64,
    pub reopens: AtomicU64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureCounters {
        CaptureCounters {
            frames: self.frames.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            reopens: self.reopens.load(Ordering::Relaxed),
        }
    }
}

/// Live PFCP capture on one interface
pub struct CaptureAdapter {
    interface: String,
    port: u16,
    dissector: Arc<Dissector>,
    stats: Arc<CaptureStats>,
}

impl CaptureAdapter {
    pub fn new(interface: impl Into<String>, port: u16, dissector: Arc<Dissector>) -> Self {
        Self {
            interface: interface.into(),
            port,
            dissector,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    /// BPF filter selecting PFCP traffic
    pub fn filter(&self) -> String {
        format!("udp dst port {}", self.port)
    }

    /// Open the device and install the filter
    pub fn open(&self) -> Result<(Capture<Active>, LinkType)> {
        let mut cap = Capture::from_device(self.interface.as_str())
            .with_context(|| format!("Failed to find capture device '{}'", self.interface))?
            .promisc(true)
            .snaplen(SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .immediate_mode(true)
            .open()
            .with_context(|| format!("Failed to open capture device '{}'", self.interface))?;

        let filter = self.filter();
        cap.filter(&filter, true)
            .with_context(|| format!("Failed to set capture filter '{}'", filter))?;

        let dlt = cap.get_datalink();
        let link = LinkType::from_dlt(dlt.0)
            .with_context(|| format!("Unsupported link type {} on '{}'", dlt.0, self.interface))?;

        Ok((cap, link))
    }

    /// Open the device and start the capture thread
    ///
    /// Failing to open at startup is returned to the caller. Later errors
    /// are retried with backoff until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> Result<JoinHandle<()>> {
        let (cap, link) = self.open()?;
        info!(
            "PFCP capture started on {} ({:?}), filter: {}",
            self.interface,
            link,
            self.filter()
        );

        Ok(tokio::task::spawn_blocking(move || self.run(cap, link, token)))
    }

    /// Dissect one captured frame
    pub fn process_frame(&self, frame: &[u8], link: LinkType) {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        match parse_frame(frame, link) {
            Some(dgram) if dgram.dst_port == self.port => {
                self.dissector.handle(dgram.payload, Some(dgram.dst_ip));
            }
            Some(dgram) => {
                debug!(
                    "Ignoring UDP datagram from {} to port {}",
                    dgram.src_ip, dgram.dst_port
                );
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn run(self, mut cap: Capture<Active>, mut link: LinkType, token: CancellationToken) {
        while !token.is_cancelled() {
            match cap.next_packet() {
                Ok(packet) => self.process_frame(packet.data, link),
                Err(pcap::Error::TimeoutExpired) => {}
                Err(e) => {
                    warn!("Capture error on {}: {}", self.interface, e);
                    match self.reopen(&token) {
                        Some((new_cap, new_link)) => {
                            cap = new_cap;
                            link = new_link;
                        }
                        None => break,
                    }
                }
            }
        }
        info!("PFCP capture on {} stopped", self.interface);
    }

    /// Retry opening the device until it succeeds or `token` is cancelled
    fn reopen(&self, token: &CancellationToken) -> Option<(Capture<Active>, LinkType)> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if !sleep_unless_cancelled(backoff, token) {
                return None;
            }
            match self.open() {
                Ok(opened) => {
                    self.stats.reopens.fetch_add(1, Ordering::Relaxed);
                    info!("Capture on {} reopened", self.interface);
                    return Some(opened);
                }
                Err(e) => {
                    debug!("Reopen of {} failed: {:#}", self.interface, e);
                    backoff = next_backoff(backoff);
                    warn!("Capture on {} unavailable, retrying in {:?}", self.interface, backoff);
                }
            }
        }
    }
}

/// Double the delay, capped
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Sleep in short slices; false if cancelled first
fn sleep_unless_cancelled(total: Duration, token: &CancellationToken) -> bool {
    let slice = Duration::from_millis(READ_TIMEOUT_MS as u64);
    let mut remaining = total;
    while !remaining.is_zero() {
        if token.is_cancelled() {
            return false;
        }
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
    !token.is_cancelled()
}
