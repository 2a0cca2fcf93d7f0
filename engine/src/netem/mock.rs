//! Mock emulation backend for unit testing.
//!
//! Records every operation so tests can assert on counts and targets
//! without touching tc, ipset, or BPF. Failures can be injected per
//! operation kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::address::Ipv4Net;
use crate::netem::NetworkEmulationBackend;
use crate::orchestrator::MachineId;

#[derive(Debug)]
pub struct MockEmulationError(pub String);

impl fmt::Display for MockEmulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock emulation error: {}", self.0)
    }
}

impl std::error::Error for MockEmulationError {}

/// Controls which operations should fail. All default to success.
#[derive(Debug, Clone, Default)]
pub struct MockEmulationConfig {
    pub register_error: Option<String>,
    pub block_error: Option<String>,
    pub unblock_error: Option<String>,
    pub latency_error: Option<String>,
    pub bandwidth_error: Option<String>,
}

/// Shared counters, cloneable into assertions.
#[derive(Debug, Clone, Default)]
pub struct MockEmulationTracker {
    pub registers: Arc<AtomicUsize>,
    pub blocks: Arc<AtomicUsize>,
    pub unblocks: Arc<AtomicUsize>,
    pub latencies: Arc<AtomicUsize>,
    pub bandwidths: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    /// tap registered per machine
    pub taps: Arc<Mutex<HashMap<MachineId, String>>>,
    /// last (latency_us, bandwidth_kbps) pushed per (source, target)
    pub shaping: Arc<Mutex<HashMap<(MachineId, Ipv4Net), (Option<u32>, Option<u64>)>>>,
    /// currently blocked (source, target) pairs
    pub blocked: Arc<Mutex<HashMap<(MachineId, Ipv4Net), bool>>>,
}

impl MockEmulationTracker {
    pub fn register_count(&self) -> usize {
        self.registers.load(Ordering::Relaxed)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.load(Ordering::Relaxed)
    }

    pub fn unblock_count(&self) -> usize {
        self.unblocks.load(Ordering::Relaxed)
    }

    pub fn latency_count(&self) -> usize {
        self.latencies.load(Ordering::Relaxed)
    }

    pub fn bandwidth_count(&self) -> usize {
        self.bandwidths.load(Ordering::Relaxed)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }
}

pub struct MockEmulation {
    pub tracker: MockEmulationTracker,
    pub config: MockEmulationConfig,
}

impl MockEmulation {
    pub fn new() -> (Self, MockEmulationTracker) {
        Self::with_config(MockEmulationConfig::default())
    }

    pub fn with_config(config: MockEmulationConfig) -> (Self, MockEmulationTracker) {
        let tracker = MockEmulationTracker::default();
        (
            Self {
                tracker: tracker.clone(),
                config,
            },
            tracker,
        )
    }
}

impl NetworkEmulationBackend for MockEmulation {
    type Error = MockEmulationError;

    async fn register(&self, id: MachineId, tap: &str) -> Result<(), MockEmulationError> {
        self.tracker.registers.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.register_error {
            return Err(MockEmulationError(e.clone()));
        }
        self.tracker
            .taps
            .lock()
            .unwrap()
            .insert(id, tap.to_string());
        Ok(())
    }

    async fn set_bandwidth(
        &self,
        source: MachineId,
        target: Ipv4Net,
        bandwidth_kbps: u64,
    ) -> Result<(), MockEmulationError> {
        self.tracker.bandwidths.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.bandwidth_error {
            return Err(MockEmulationError(e.clone()));
        }
        self.tracker
            .shaping
            .lock()
            .unwrap()
            .entry((source, target))
            .or_insert((None, None))
            .1 = Some(bandwidth_kbps);
        Ok(())
    }

    async fn set_latency(
        &self,
        source: MachineId,
        target: Ipv4Net,
        latency_us: u32,
    ) -> Result<(), MockEmulationError> {
        self.tracker.latencies.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.latency_error {
            return Err(MockEmulationError(e.clone()));
        }
        self.tracker
            .shaping
            .lock()
            .unwrap()
            .entry((source, target))
            .or_insert((None, None))
            .0 = Some(latency_us);
        Ok(())
    }

    async fn block_link(
        &self,
        source: MachineId,
        target: Ipv4Net,
    ) -> Result<(), MockEmulationError> {
        self.tracker.blocks.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.block_error {
            return Err(MockEmulationError(e.clone()));
        }
        self.tracker
            .blocked
            .lock()
            .unwrap()
            .insert((source, target), true);
        Ok(())
    }

    async fn unblock_link(
        &self,
        source: MachineId,
        target: Ipv4Net,
    ) -> Result<(), MockEmulationError> {
        self.tracker.unblocks.fetch_add(1, Ordering::Relaxed);
        if let Some(ref e) = self.config.unblock_error {
            return Err(MockEmulationError(e.clone()));
        }
        self.tracker
            .blocked
            .lock()
            .unwrap()
            .insert((source, target), false);
        Ok(())
    }

    async fn stop(&self) -> Result<(), MockEmulationError> {
        self.tracker.stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
