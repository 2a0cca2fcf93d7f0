//! Mock supervisor and peering backends for unit testing.
//!
//! Lightweight implementations of the lifecycle traits that track calls
//! without spawning processes or touching the kernel. Failures can be
//! injected per operation.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::address::Ipv4Net;
use crate::orchestrator::Host;
use crate::peering::PeeringBackend;
use crate::virt::supervisor::{
    MicroVm, SupervisorBackend, SupervisorError, VmDefinition, VmProcess,
};

// ─── Supervisor mock ───────────────────────────────────────────────────────

/// Controls which supervisor operations should fail.
#[derive(Debug, Clone, Default)]
pub struct MockSupervisorConfig {
    pub spawn_error: Option<String>,
    pub configure_error: Option<String>,
    pub start_error: Option<String>,
    pub pause_error: Option<String>,
    pub resume_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MockSupervisorTracker {
    pub spawns: Arc<AtomicUsize>,
    pub configures: Arc<AtomicUsize>,
    pub starts: Arc<AtomicUsize>,
    pub pauses: Arc<AtomicUsize>,
    pub resumes: Arc<AtomicUsize>,
    pub kills: Arc<AtomicUsize>,
    pub cleanups: Arc<AtomicUsize>,
    /// Last definition pushed, keyed by machine name.
    pub definitions: Arc<Mutex<HashMap<String, VmDefinition>>>,
}

impl MockSupervisorTracker {
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::Relaxed)
    }

    pub fn configure_count(&self) -> usize {
        self.configures.load(Ordering::Relaxed)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::Relaxed)
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::Relaxed)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::Relaxed)
    }
}

fn injected(e: &Option<String>) -> Result<(), SupervisorError> {
    match e {
        Some(msg) => Err(SupervisorError::Communication(msg.clone())),
        None => Ok(()),
    }
}

pub struct MockMicroVm {
    name: String,
    tracker: MockSupervisorTracker,
    config: MockSupervisorConfig,
}

impl MicroVm for MockMicroVm {
    async fn configure(&self, def: &VmDefinition) -> Result<(), SupervisorError> {
        self.tracker.configures.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.configure_error)?;
        self.tracker
            .definitions
            .lock()
            .unwrap()
            .insert(self.name.clone(), def.clone());
        Ok(())
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        self.tracker.starts.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.start_error)
    }

    async fn pause(&self) -> Result<(), SupervisorError> {
        self.tracker.pauses.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.pause_error)
    }

    async fn resume(&self) -> Result<(), SupervisorError> {
        self.tracker.resumes.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.resume_error)
    }
}

pub struct MockVmProcess {
    tracker: MockSupervisorTracker,
}

impl VmProcess for MockVmProcess {
    async fn kill(&mut self) -> Result<(), SupervisorError> {
        self.tracker.kills.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), SupervisorError> {
        self.tracker.cleanups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct MockSupervisor {
    pub tracker: MockSupervisorTracker,
    pub config: MockSupervisorConfig,
}

impl MockSupervisor {
    pub fn new() -> (Self, MockSupervisorTracker) {
        Self::with_config(MockSupervisorConfig::default())
    }

    pub fn with_config(config: MockSupervisorConfig) -> (Self, MockSupervisorTracker) {
        let tracker = MockSupervisorTracker::default();
        (
            Self {
                tracker: tracker.clone(),
                config,
            },
            tracker,
        )
    }
}

impl SupervisorBackend for MockSupervisor {
    type Vm = MockMicroVm;
    type Process = MockVmProcess;

    async fn spawn(
        &self,
        name: &str,
    ) -> Result<(MockMicroVm, MockVmProcess, PathBuf), SupervisorError> {
        self.tracker.spawns.fetch_add(1, Ordering::Relaxed);
        injected(&self.config.spawn_error)?;

        let socket_path = PathBuf::from(format!("/tmp/mock/{name}.sock"));
        let client = MockMicroVm {
            name: name.to_string(),
            tracker: self.tracker.clone(),
            config: self.config.clone(),
        };
        let process = MockVmProcess {
            tracker: self.tracker.clone(),
        };

        Ok((client, process, socket_path))
    }
}

// ─── Peering mock ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MockPeeringError(pub String);

impl fmt::Display for MockPeeringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock peering error: {}", self.0)
    }
}

impl std::error::Error for MockPeeringError {}

#[derive(Debug, Clone, Default)]
pub struct MockPeeringTracker {
    pub routes: Arc<Mutex<Vec<(Ipv4Net, Host)>>>,
    pub stops: Arc<AtomicUsize>,
}

impl MockPeeringTracker {
    pub fn route_count(&self) -> usize {
        self.routes.lock().unwrap().len()
    }
}

pub struct MockPeering {
    host: Host,
    pub tracker: MockPeeringTracker,
    pub route_error: Option<String>,
}

impl MockPeering {
    pub fn new(host: Host) -> (Self, MockPeeringTracker) {
        let tracker = MockPeeringTracker::default();
        (
            Self {
                host,
                tracker: tracker.clone(),
                route_error: None,
            },
            tracker,
        )
    }
}

impl PeeringBackend for MockPeering {
    type Error = MockPeeringError;

    fn host_id(&self) -> Result<Host, MockPeeringError> {
        Ok(self.host)
    }

    async fn route(&self, network: Ipv4Net, host: Host) -> Result<(), MockPeeringError> {
        if let Some(ref e) = self.route_error {
            return Err(MockPeeringError(e.clone()));
        }
        self.tracker.routes.lock().unwrap().push((network, host));
        Ok(())
    }

    async fn stop(&self) -> Result<(), MockPeeringError> {
        self.tracker.stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
