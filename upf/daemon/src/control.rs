//! Runtime probe toggles
//!
//! The kernel handlers read their switches from the `AGENT_CONFIG` array
//! on every invocation, so flipping a slot takes effect immediately.

use crate::types::kernel::constants::*;
use anyhow::{Context, Result};
use aya::maps::{Array, MapData};
use log::info;
use std::sync::{Mutex, MutexGuard};

/// Writable view of the probe configuration slots
pub trait ProbeControl: Send + Sync {
    fn set_slot(&self, slot: u32, value: u32) -> Result<()>;

    fn slot(&self, slot: u32) -> Result<u32>;

    fn set_packet_tracing(&self, enabled: bool) -> Result<()> {
        self.set_slot(CONFIG_PACKET_TRACING, enabled as u32)?;
        info!("Packet tracing {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn set_drop_tracing(&self, enabled: bool) -> Result<()> {
        self.set_slot(CONFIG_DROP_TRACING, enabled as u32)?;
        info!("Drop tracing {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn packet_tracing(&self) -> Result<bool> {
        Ok(self.slot(CONFIG_PACKET_TRACING)? != 0)
    }

    fn drop_tracing(&self) -> Result<bool> {
        Ok(self.slot(CONFIG_DROP_TRACING)? != 0)
    }

    /// Flip drop tracing, returning the new state
    fn toggle_drop_tracing(&self) -> Result<bool> {
        let enabled = !self.drop_tracing()?;
        self.set_drop_tracing(enabled)?;
        Ok(enabled)
    }

    /// Flip packet tracing, returning the new state
    fn toggle_packet_tracing(&self) -> Result<bool> {
        let enabled = !self.packet_tracing()?;
        self.set_packet_tracing(enabled)?;
        Ok(enabled)
    }
}

/// `AGENT_CONFIG` map in the loaded eBPF object
pub struct KernelControl {
    config: Mutex<Array<MapData, u32>>,
}

impl KernelControl {
    pub fn new(config: Array<MapData, u32>) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Array<MapData, u32>> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProbeControl for KernelControl {
    fn set_slot(&self, slot: u32, value: u32) -> Result<()> {
        self.lock()
            .set(slot, value, 0)
            .with_context(|| format!("Failed to write {} slot {}", MAP_AGENT_CONFIG, slot))
    }

    fn slot(&self, slot: u32) -> Result<u32> {
        self.lock()
            .get(&slot, 0)
            .with_context(|| format!("Failed to read {} slot {}", MAP_AGENT_CONFIG, slot))
    }
}

/// In-process configuration slots
#[derive(Debug, Default)]
pub struct MemoryControl {
    slots: Mutex<[u32; MAX_CONFIG_SLOTS as usize]>,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProbeControl for MemoryControl {
    fn set_slot(&self, slot: u32, value: u32) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = slots
            .get_mut(slot as usize)
            .with_context(|| format!("Config slot {} out of range", slot))?;
        *entry = value;
        Ok(())
    }

    fn slot(&self, slot: u32) -> Result<u32> {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .get(slot as usize)
            .copied()
            .with_context(|| format!("Config slot {} out of range", slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggles() {
        let control = MemoryControl::new();
        assert!(!control.drop_tracing().unwrap());

        assert!(control.toggle_drop_tracing().unwrap());
        assert_eq!(control.slot(CONFIG_DROP_TRACING).unwrap(), 1);
        assert!(!control.toggle_drop_tracing().unwrap());

        control.set_packet_tracing(true).unwrap();
        assert!(control.packet_tracing().unwrap());
        assert!(!control.drop_tracing().unwrap());
    }

    #[test]
    fn test_offset_slots() {
        let control = MemoryControl::new();
        control.set_slot(CONFIG_SKB_LEN_OFFSET, 120).unwrap();
        assert_eq!(control.slot(CONFIG_SKB_LEN_OFFSET).unwrap(), 120);
        assert!(control.set_slot(MAX_CONFIG_SLOTS, 1).is_err());
    }
}
