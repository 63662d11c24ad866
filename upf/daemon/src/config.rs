//! Engine configuration

use crate::{collector::DEFAULT_RECENT_DROPS, types::kernel::constants::PFCP_PORT};
use std::time::Duration;

/// Default number of events a subscriber may fall behind
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Settings for an [`Engine`](crate::engine::Engine)
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Interface to capture PFCP on; `None` runs without capture
    pub interface: Option<String>,
    pub pfcp_port: u16,
    /// Traffic snapshot cadence
    pub stats_interval: Duration,
    pub queue_capacity: usize,
    pub recent_drops: usize,
    /// Initial state of detailed packet tracing
    pub packet_tracing: bool,
    /// Initial state of drop tracing; off by default since the hook sees
    /// every `kfree_skb` on the host
    pub drop_tracing: bool,
    /// Reclaim sessions idle for this long; `None` keeps them until deleted
    pub session_idle_timeout: Option<Duration>,
    /// `sk_buff.len` offset override
    pub skb_len_offset: Option<u32>,
    /// `sk_buff.data` offset override
    pub skb_data_offset: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interface: None,
            pfcp_port: PFCP_PORT,
            stats_interval: Duration::from_secs(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            recent_drops: DEFAULT_RECENT_DROPS,
            packet_tracing: false,
            drop_tracing: false,
            session_idle_timeout: None,
            skb_len_offset: None,
            skb_data_offset: None,
        }
    }
}

impl EngineConfig {
    /// Period of the idle-session sweep
    pub fn reap_interval(&self) -> Option<Duration> {
        self.session_idle_timeout
            .map(|timeout| (timeout / 4).max(Duration::from_secs(1)))
    }
}
