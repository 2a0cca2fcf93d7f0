//! The orchestrator owns the authoritative in-memory desired state and
//! converges the host to it.
//!
//! It never touches kernel objects itself: everything goes through the
//! virtualization backend, which in turn dispatches to the emulation and
//! peering backends. The state tables sit behind one reader/writer lock;
//! queries and lookups take it shared, initialization and per-update
//! mutation take it exclusively. Backend calls never run under the lock.

pub mod info;
pub mod mock;
mod state;

#[cfg(test)]
mod orchestrator_tests;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};

pub use state::{
    Link, LinkDiff, MachineConfig, MachineId, MachinesState, NetworkState, StateDiff, VmState,
};
pub use state::Host;

#[derive(Debug)]
pub enum OrchestratorError {
    AlreadyInitialized,
    NotInitialized,
    HostNotSet,
    HostAlreadySet,
    UnknownMachine(MachineId),
    UnknownName(String),
    NoName(MachineId),
    SelfPath(MachineId),
    MissingEdge { from: MachineId, to: MachineId },
    Virtualization(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::AlreadyInitialized => write!(f, "orchestrator already initialized"),
            OrchestratorError::NotInitialized => write!(f, "orchestrator not initialized"),
            OrchestratorError::HostNotSet => write!(f, "own host index not set"),
            OrchestratorError::HostAlreadySet => write!(f, "own host index already set"),
            OrchestratorError::UnknownMachine(id) => write!(f, "machine {id} not found"),
            OrchestratorError::UnknownName(name) => {
                write!(f, "machine with name {name} not found")
            }
            OrchestratorError::NoName(id) => write!(f, "machine {id} does not have a name"),
            OrchestratorError::SelfPath(id) => {
                write!(f, "cannot give path from {id} to itself")
            }
            OrchestratorError::MissingEdge { from, to } => {
                write!(f, "missing next-hop edge {from} -> {to}")
            }
            OrchestratorError::Virtualization(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

/// The operation set the orchestrator requires from the layer below. The
/// production implementation is [`crate::virt::Virt`]; tests plug in
/// [`mock::MockVirt`].
pub trait VirtualizationBackend: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn register_machine(
        &self,
        id: MachineId,
        name: Option<String>,
        host: Host,
        config: MachineConfig,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn block_link(
        &self,
        source: MachineId,
        target: MachineId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn unblock_link(
        &self,
        source: MachineId,
        target: MachineId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn set_latency(
        &self,
        source: MachineId,
        target: MachineId,
        latency_us: u32,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn set_bandwidth(
        &self,
        source: MachineId,
        target: MachineId,
        bandwidth_kbps: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn start_machine(
        &self,
        machine: MachineId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn stop_machine(
        &self,
        machine: MachineId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn ip_address(&self, id: MachineId) -> Result<Ipv4Addr, Self::Error>;

    fn resolve_ip(&self, ip: Ipv4Addr) -> Result<MachineId, Self::Error>;

    fn stop(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Everything the driver tells us about one machine at init.
#[derive(Debug, Clone)]
pub struct MachineRegistration {
    pub id: MachineId,
    pub host: Host,
    pub config: MachineConfig,
    pub name: Option<String>,
}

struct MachineEntry {
    name: Option<String>,
    host: Host,
}

struct EngineState {
    machines: HashMap<MachineId, MachineEntry>,
    names: HashMap<String, MachineId>,
    network: NetworkState,
    machines_state: MachinesState,
}

#[derive(Debug, Clone, Copy)]
enum LinkOpKind {
    Block,
    Unblock,
    Latency(u32),
    Bandwidth(u64),
}

#[derive(Debug, Clone, Copy)]
struct LinkOp {
    target: MachineId,
    kind: LinkOpKind,
}

pub struct Orchestrator<V: VirtualizationBackend> {
    virt: Arc<V>,
    host: OnceLock<Host>,
    state: RwLock<Option<EngineState>>,
}

impl<V: VirtualizationBackend> Orchestrator<V> {
    pub fn new(virt: Arc<V>) -> Self {
        Self {
            virt,
            host: OnceLock::new(),
            state: RwLock::new(None),
        }
    }

    /// Record which host of the cluster this engine is. Set exactly once,
    /// when the driver registers the host.
    pub fn set_host(&self, host: Host) -> Result<(), OrchestratorError> {
        self.host
            .set(host)
            .map_err(|_| OrchestratorError::HostAlreadySet)
    }

    pub fn host(&self) -> Option<Host> {
        self.host.get().copied()
    }

    /// CPUs and total RAM this host can offer to the driver's placement.
    pub fn resources(&self) -> (u32, u64) {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        (cpus, total_memory().unwrap_or(0))
    }

    pub async fn ready(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Populate the machine tables, register every machine with the
    /// virtualization layer, and install the all-blocked baseline. Only
    /// returns once both passes have completed.
    #[instrument(skip_all, fields(machines = machines.len()))]
    pub async fn initialize(
        &self,
        machines: Vec<MachineRegistration>,
    ) -> Result<(), OrchestratorError> {
        let own = self.host().ok_or(OrchestratorError::HostNotSet)?;

        let mut guard = self.state.write().await;
        if guard.is_some() {
            return Err(OrchestratorError::AlreadyInitialized);
        }

        let mut table = HashMap::new();
        let mut names = HashMap::new();

        for m in &machines {
            table.insert(
                m.id,
                MachineEntry {
                    name: m.name.clone(),
                    host: m.host,
                },
            );

            if let Some(name) = &m.name {
                names.insert(name.clone(), m.id);
            }
        }

        info!(count = machines.len(), host = %own, "registering machines");

        let results = join_all(machines.iter().map(|m| {
            self.virt
                .register_machine(m.id, m.name.clone(), m.host, m.config.clone())
        }))
        .await;

        for (m, res) in machines.iter().zip(results) {
            res.map_err(|e| {
                OrchestratorError::Virtualization(format!("registering {} failed: {e}", m.id))
            })?;
        }

        // All links start out blocked. One task per local source keeps the
        // backend's per-source serialization intact while sources proceed
        // in parallel.
        let ids: Vec<MachineId> = table.keys().copied().collect();
        let local: Vec<MachineId> = machines
            .iter()
            .filter(|m| m.host == own)
            .map(|m| m.id)
            .collect();

        info!(sources = local.len(), "installing blocked baseline");

        let results = join_all(local.iter().map(|source| {
            let targets = &ids;
            async move {
                for target in targets {
                    if *target == *source {
                        continue;
                    }
                    debug!(source = %source, target = %target, "blocking link");
                    self.virt
                        .block_link(*source, *target)
                        .await
                        .map_err(|e| {
                            OrchestratorError::Virtualization(format!(
                                "blocking {source} -> {target} failed: {e}"
                            ))
                        })?;
                }
                Ok::<(), OrchestratorError>(())
            }
        }))
        .await;

        for res in results {
            res?;
        }

        let mut network: NetworkState = HashMap::new();
        let mut machines_state: MachinesState = HashMap::new();

        for a in &ids {
            machines_state.insert(*a, VmState::Stopped);

            let row = network.entry(*a).or_default();
            for b in &ids {
                if a == b {
                    continue;
                }
                row.insert(
                    *b,
                    Link {
                        blocked: true,
                        latency_us: crate::netem::DEFAULT_LATENCY_US,
                        bandwidth_kbps: crate::netem::DEFAULT_BANDWIDTH_KBPS,
                        // neutral until the driver supplies a real next hop
                        next: *b,
                    },
                );
            }
        }

        *guard = Some(EngineState {
            machines: table,
            names,
            network,
            machines_state,
        });

        info!("initialization complete");

        Ok(())
    }

    /// Apply one accumulated diff: the minimal set of backend calls, fanned
    /// out per source and per machine. Readers may observe a partially
    /// applied diff; diffs are idempotent, so a failed operation is retried
    /// by the next one.
    #[instrument(skip_all, fields(links = diff.network.len(), machines = diff.machines.len()))]
    pub async fn update(&self, diff: StateDiff) -> Result<(), OrchestratorError> {
        // Plan under the read lock: compare against stored state, collect
        // the operations actually needed.
        let mut plans: HashMap<MachineId, Vec<LinkOp>> = HashMap::new();
        let mut next_copies: Vec<(MachineId, MachineId, MachineId)> = Vec::new();
        let mut machine_plans: Vec<(MachineId, VmState)> = Vec::new();

        {
            let guard = self.state.read().await;
            let st = guard.as_ref().ok_or(OrchestratorError::NotInitialized)?;

            for d in &diff.network {
                let cur = st
                    .network
                    .get(&d.source)
                    .and_then(|row| row.get(&d.target))
                    .ok_or(OrchestratorError::UnknownMachine(d.source))?;

                let ops = plans.entry(d.source).or_default();

                if d.link.blocked && !cur.blocked {
                    ops.push(LinkOp {
                        target: d.target,
                        kind: LinkOpKind::Block,
                    });
                }

                if !d.link.blocked && cur.blocked {
                    ops.push(LinkOp {
                        target: d.target,
                        kind: LinkOpKind::Unblock,
                    });
                }

                // numeric fields are not applied while the link stays blocked
                if !d.link.blocked {
                    if d.link.latency_us != cur.latency_us {
                        ops.push(LinkOp {
                            target: d.target,
                            kind: LinkOpKind::Latency(d.link.latency_us),
                        });
                    }

                    if d.link.bandwidth_kbps != cur.bandwidth_kbps {
                        ops.push(LinkOp {
                            target: d.target,
                            kind: LinkOpKind::Bandwidth(d.link.bandwidth_kbps),
                        });
                    }
                }

                // next only affects path queries, no kernel call involved
                if d.link.next != cur.next {
                    next_copies.push((d.source, d.target, d.link.next));
                }
            }

            for (id, desired) in &diff.machines {
                let cur = st
                    .machines_state
                    .get(id)
                    .ok_or(OrchestratorError::UnknownMachine(*id))?;

                if desired != cur {
                    machine_plans.push((*id, *desired));
                }
            }
        }

        // Dispatch. Per-source operations run in driver order; sources are
        // independent of each other, as are machine transitions.
        let link_futures = plans.into_iter().map(|(source, ops)| {
            let virt = self.virt.clone();
            async move {
                let mut applied = Vec::new();
                for op in ops {
                    let res = match op.kind {
                        LinkOpKind::Block => virt.block_link(source, op.target).await,
                        LinkOpKind::Unblock => virt.unblock_link(source, op.target).await,
                        LinkOpKind::Latency(us) => {
                            virt.set_latency(source, op.target, us).await
                        }
                        LinkOpKind::Bandwidth(kbps) => {
                            virt.set_bandwidth(source, op.target, kbps).await
                        }
                    };

                    match res {
                        Ok(()) => applied.push((source, op)),
                        // recorded state stays put so the next diff retries
                        Err(e) => error!(
                            source = %source,
                            target = %op.target,
                            error = %e,
                            "link update failed"
                        ),
                    }
                }
                applied
            }
        });

        let machine_futures = machine_plans.into_iter().map(|(id, desired)| {
            let virt = self.virt.clone();
            async move {
                let res = match desired {
                    VmState::Active => virt.start_machine(id).await,
                    VmState::Stopped => virt.stop_machine(id).await,
                };

                if let Err(e) = res {
                    // record the intended state anyway; the driver's next
                    // transition resolves a stuck supervisor
                    error!(machine = %id, error = %e, "machine transition failed");
                }

                (id, desired)
            }
        });

        let (applied, transitioned) =
            tokio::join!(join_all(link_futures), join_all(machine_futures));

        // Mutate the stored state to match what actually happened.
        let mut guard = self.state.write().await;
        let st = guard.as_mut().ok_or(OrchestratorError::NotInitialized)?;

        for (source, op) in applied.into_iter().flatten() {
            if let Some(link) = st
                .network
                .get_mut(&source)
                .and_then(|row| row.get_mut(&op.target))
            {
                match op.kind {
                    LinkOpKind::Block => link.blocked = true,
                    LinkOpKind::Unblock => link.blocked = false,
                    LinkOpKind::Latency(us) => link.latency_us = us,
                    LinkOpKind::Bandwidth(kbps) => link.bandwidth_kbps = kbps,
                }
            }
        }

        for (source, target, next) in next_copies {
            if let Some(link) = st
                .network
                .get_mut(&source)
                .and_then(|row| row.get_mut(&target))
            {
                link.next = next;
            }
        }

        for (id, desired) in transitioned {
            st.machines_state.insert(id, desired);
        }

        Ok(())
    }

    /// Ordered engine teardown, delegated to the virtualization layer.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        self.virt
            .stop()
            .await
            .map_err(|e| OrchestratorError::Virtualization(e.to_string()))
    }
}

fn total_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;

    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;

    Some(kib * 1024)
}
