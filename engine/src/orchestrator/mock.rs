//! Mock virtualization backend for orchestrator tests.
//!
//! Tracks every call so tests can assert on the exact set of backend
//! operations an initialize or update dispatched, without any taps,
//! supervisors, or kernel state. Failures can be injected per operation.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::address;
use crate::orchestrator::{Host, MachineConfig, MachineId, VirtualizationBackend};

#[derive(Debug)]
pub struct MockVirtError(pub String);

impl fmt::Display for MockVirtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock virt error: {}", self.0)
    }
}

impl std::error::Error for MockVirtError {}

/// Which operations should fail; `None` means success.
#[derive(Debug, Clone, Default)]
pub struct MockVirtConfig {
    pub register_error: Option<String>,
    pub block_error: Option<String>,
    pub unblock_error: Option<String>,
    pub latency_error: Option<String>,
    pub bandwidth_error: Option<String>,
    pub start_error: Option<String>,
    pub stop_machine_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MockVirtTracker {
    pub registers: Arc<AtomicUsize>,
    pub blocks: Arc<AtomicUsize>,
    pub unblocks: Arc<AtomicUsize>,
    pub latencies: Arc<AtomicUsize>,
    pub bandwidths: Arc<AtomicUsize>,
    pub starts: Arc<AtomicUsize>,
    pub machine_stops: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    /// (id, host, name) per registered machine.
    pub registered: Arc<Mutex<Vec<(MachineId, Host, Option<String>)>>>,
    /// Blocked flag per (source, target) as last pushed to the backend.
    pub blocked: Arc<Mutex<HashMap<(MachineId, MachineId), bool>>>,
    /// Last (latency_us, bandwidth_kbps) pushed per (source, target).
    pub shaping: Arc<Mutex<HashMap<(MachineId, MachineId), (Option<u32>, Option<u64>)>>>,
    /// Power transitions in dispatch order.
    pub transitions: Arc<Mutex<Vec<(MachineId, bool)>>>,
}

impl MockVirtTracker {
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

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn machine_stop_count(&self) -> usize {
        self.machine_stops.load(Ordering::Relaxed)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }
}

pub struct MockVirt {
    pub tracker: MockVirtTracker,
    pub config: MockVirtConfig,
}

impl MockVirt {
    pub fn new() -> (Self, MockVirtTracker) {
        Self::with_config(MockVirtConfig::default())
    }

    pub fn with_config(config: MockVirtConfig) -> (Self, MockVirtTracker) {
        let tracker = MockVirtTracker::default();
        (
            Self {
                tracker: tracker.clone(),
                config,
            },
            tracker,
        )
    }
}

fn injected(e: &Option<String>) -> Result<(), MockVirtError> {
    match e {
        Some(msg) => Err(MockVirtError(msg.clone())),
        None => Ok(()),
    }
}

impl VirtualizationBackend for MockVirt {
    type Error = MockVirtError;

    async fn register_machine(
        &self,
        id: MachineId,
        name: Option<String>,
        host: Host,
        _config: MachineConfig,
    ) -> Result<(), MockVirtError> {
        self.tracker.registers.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.register_error)?;
        self.tracker
            .registered
            .lock()
            .unwrap()
            .push((id, host, name));
        Ok(())
    }

    async fn block_link(
        &self,
        source: MachineId,
        target: MachineId,
    ) -> Result<(), MockVirtError> {
        self.tracker.blocks.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.block_error)?;
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
        target: MachineId,
    ) -> Result<(), MockVirtError> {
        self.tracker.unblocks.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.unblock_error)?;
        self.tracker
            .blocked
            .lock()
            .unwrap()
            .insert((source, target), false);
        Ok(())
    }

    async fn set_latency(
        &self,
        source: MachineId,
        target: MachineId,
        latency_us: u32,
    ) -> Result<(), MockVirtError> {
        self.tracker.latencies.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.latency_error)?;
        self.tracker
            .shaping
            .lock()
            .unwrap()
            .entry((source, target))
            .or_insert((None, None))
            .0 = Some(latency_us);
        Ok(())
    }

    async fn set_bandwidth(
        &self,
        source: MachineId,
        target: MachineId,
        bandwidth_kbps: u64,
    ) -> Result<(), MockVirtError> {
        self.tracker.bandwidths.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.bandwidth_error)?;
        self.tracker
            .shaping
            .lock()
            .unwrap()
            .entry((source, target))
            .or_insert((None, None))
            .1 = Some(bandwidth_kbps);
        Ok(())
    }

    async fn start_machine(&self, machine: MachineId) -> Result<(), MockVirtError> {
        self.tracker.starts.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.start_error)?;
        self.tracker
            .transitions
            .lock()
            .unwrap()
            .push((machine, true));
        Ok(())
    }

    async fn stop_machine(&self, machine: MachineId) -> Result<(), MockVirtError> {
        self.tracker.machine_stops.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.stop_machine_error)?;
        self.tracker
            .transitions
            .lock()
            .unwrap()
            .push((machine, false));
        Ok(())
    }

    fn ip_address(&self, id: MachineId) -> Result<Ipv4Addr, MockVirtError> {
        address::plan(id)
            .map(|n| n.ip)
            .map_err(|e| MockVirtError(e.to_string()))
    }

    fn resolve_ip(&self, ip: Ipv4Addr) -> Result<MachineId, MockVirtError> {
        address::resolve(ip).map_err(|e| MockVirtError(e.to_string()))
    }

    async fn stop(&self) -> Result<(), MockVirtError> {
        self.tracker.stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
