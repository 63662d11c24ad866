//! Kernel timestamp conversion
//!
//! Probes stamp records with bpf_ktime_get_ns (CLOCK_MONOTONIC). The offset
//! between that clock and wall-clock time is sampled once at startup.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use nix::time::{clock_gettime, ClockId};

/// Converts kernel monotonic nanoseconds into UTC timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KtimeClock {
    /// Wall-clock nanoseconds at monotonic zero
    boot_offset_ns: i64,
}

impl KtimeClock {
    /// Sample the current monotonic/wall-clock offset
    pub fn new() -> Result<Self> {
        let mono =
            clock_gettime(ClockId::CLOCK_MONOTONIC).context("Failed to read CLOCK_MONOTONIC")?;
        let mono_ns = mono.tv_sec() * 1_000_000_000 + mono.tv_nsec();
        let wall_ns = Utc::now()
            .timestamp_nanos_opt()
            .context("Wall clock out of range")?;

        Ok(Self {
            boot_offset_ns: wall_ns - mono_ns,
        })
    }

    /// Clock with a fixed offset, for replaying recorded events
    pub fn with_offset(boot_offset_ns: i64) -> Self {
        Self { boot_offset_ns }
    }

    /// Convert a kernel timestamp; 0 means "never set"
    pub fn to_utc(&self, ktime_ns: u64) -> Option<DateTime<Utc>> {
        if ktime_ns == 0 {
            return None;
        }
        let ns = self.boot_offset_ns.checked_add(i64::try_from(ktime_ns).ok()?)?;
        Some(Utc.timestamp_nanos(ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_unset() {
        let clock = KtimeClock::with_offset(1_700_000_000_000_000_000);
        assert_eq!(clock.to_utc(0), None);
    }

    #[test]
    fn test_offset_applied() {
        let clock = KtimeClock::with_offset(1_700_000_000_000_000_000);
        let ts = clock.to_utc(5_000_000_000).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_005);
    }

    #[test]
    fn test_live_clock_is_recent() {
        let clock = KtimeClock::new().unwrap();
        let mono = clock_gettime(ClockId::CLOCK_MONOTONIC).unwrap();
        let mono_ns = (mono.tv_sec() * 1_000_000_000 + mono.tv_nsec()) as u64;
        let converted = clock.to_utc(mono_ns).unwrap();
        let skew = (Utc::now() - converted).num_seconds().abs();
        assert!(skew < 5);
    }
}
