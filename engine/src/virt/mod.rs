//! Machine lifecycle on top of the peering and emulation backends.
//!
//! Owns every local machine: its tap, its overlay disk, and the supervisor
//! process behind it. Machines on remote hosts are not represented here at
//! all; registering one only installs an overlay route.
//!
//! Lock order: the machine table lock is only held to locate a machine,
//! every operation on a machine runs under that machine's own mutex.

pub mod machine;
pub mod mock;
pub mod supervisor;

#[cfg(test)]
mod virt_tests;

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, trace};

use crate::address::{self, AddressError, Ipv4Net};
use crate::cmd::CommandError;
use crate::netem::NetworkEmulationBackend;
use crate::orchestrator::{Host, MachineConfig, MachineId, VirtualizationBackend};
use crate::peering::PeeringBackend;
use crate::virt::machine::{machine_name, Machine, MachineState};
use crate::virt::supervisor::{MicroVm, SupervisorBackend, SupervisorError, VmProcess};

#[derive(Debug)]
pub enum VirtError {
    Address(AddressError),
    Command(CommandError),
    Supervisor(SupervisorError),
    Emulation(String),
    Peering(String),
}

impl fmt::Display for VirtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtError::Address(e) => write!(f, "{e}"),
            VirtError::Command(e) => write!(f, "{e}"),
            VirtError::Supervisor(e) => write!(f, "supervisor: {e}"),
            VirtError::Emulation(msg) => write!(f, "emulation backend: {msg}"),
            VirtError::Peering(msg) => write!(f, "peering backend: {msg}"),
        }
    }
}

impl std::error::Error for VirtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VirtError::Address(e) => Some(e),
            VirtError::Command(e) => Some(e),
            VirtError::Supervisor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AddressError> for VirtError {
    fn from(e: AddressError) -> Self {
        VirtError::Address(e)
    }
}

impl From<CommandError> for VirtError {
    fn from(e: CommandError) -> Self {
        VirtError::Command(e)
    }
}

pub struct Virt<P, N, S: SupervisorBackend> {
    peering: Arc<P>,
    netem: Arc<N>,
    supervisor: S,
    machines: RwLock<HashMap<MachineId, Arc<Mutex<Machine<S>>>>>,
}

impl<P, N, S> Virt<P, N, S>
where
    P: PeeringBackend,
    N: NetworkEmulationBackend,
    S: SupervisorBackend,
{
    pub fn new(peering: Arc<P>, netem: Arc<N>, supervisor: S) -> Self {
        Self {
            peering,
            netem,
            supervisor,
            machines: RwLock::new(HashMap::new()),
        }
    }

    async fn lookup(&self, id: MachineId) -> Option<Arc<Mutex<Machine<S>>>> {
        self.machines.read().await.get(&id).cloned()
    }

    /// Target network of a link operation: the /30 of the target machine.
    fn target_net(target: MachineId) -> Result<Ipv4Net, VirtError> {
        Ok(address::plan(target)?.subnet)
    }

    async fn transition(&self, id: MachineId, target: MachineState) -> Result<(), VirtError> {
        let Some(entry) = self.lookup(id).await else {
            // not on this host, nothing to do
            return Ok(());
        };

        let mut m = entry.lock().await;

        if m.state == target {
            return Ok(());
        }

        match (m.state, target) {
            (MachineState::Started, MachineState::Stopped) => {
                trace!(machine = %m.name, "suspending machine");
                if let Some(handle) = m.vm.as_ref() {
                    handle.client.pause().await.map_err(VirtError::Supervisor)?;
                }
                m.state = MachineState::Stopped;
            }
            (MachineState::Registered, MachineState::Stopped) => {
                // never started; stay registered so a later start still boots
            }
            (MachineState::Registered, MachineState::Started) => {
                trace!(machine = %m.name, "starting machine");
                m.boot(&self.supervisor).await?;
                m.state = MachineState::Started;
            }
            (MachineState::Stopped, MachineState::Started) => {
                trace!(machine = %m.name, "resuming machine");
                if let Some(handle) = m.vm.as_ref() {
                    handle
                        .client
                        .resume()
                        .await
                        .map_err(VirtError::Supervisor)?;
                }
                m.state = MachineState::Started;
            }
            (MachineState::Started | MachineState::Stopped, MachineState::Killed) => {
                trace!(machine = %m.name, "killing machine");
                if let Some(handle) = m.vm.as_mut() {
                    handle.process.kill().await.map_err(VirtError::Supervisor)?;
                    let _ = handle.process.cleanup().await;
                }
                m.state = MachineState::Killed;
            }
            (from, to) => {
                trace!(machine = %m.name, ?from, ?to, "ignoring transition");
            }
        }

        Ok(())
    }
}

impl<P, N, S> VirtualizationBackend for Virt<P, N, S>
where
    P: PeeringBackend,
    N: NetworkEmulationBackend,
    S: SupervisorBackend,
{
    type Error = VirtError;

    async fn register_machine(
        &self,
        id: MachineId,
        name: Option<String>,
        host: Host,
        config: MachineConfig,
    ) -> Result<(), VirtError> {
        let name = machine_name(id.group, id.id, name.as_deref());
        let network = address::plan(id)?;

        let own = self
            .peering
            .host_id()
            .map_err(|e| VirtError::Peering(e.to_string()))?;

        if host != own {
            // remote machine: only route its /30 through the overlay
            return self
                .peering
                .route(network.subnet, host)
                .await
                .map_err(|e| VirtError::Peering(e.to_string()));
        }

        let m = Machine::new(name, config, network);

        m.create_network().await?;

        self.netem
            .register(id, &m.network.tap)
            .await
            .map_err(|e| VirtError::Emulation(format!("register failed: {e}")))?;

        self.machines
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(m)));

        Ok(())
    }

    async fn block_link(&self, source: MachineId, target: MachineId) -> Result<(), VirtError> {
        // discard operations whose source machine is not on this host
        if self.lookup(source).await.is_none() {
            return Ok(());
        }

        let net = Self::target_net(target)?;
        self.netem
            .block_link(source, net)
            .await
            .map_err(|e| VirtError::Emulation(format!("block failed: {e}")))
    }

    async fn unblock_link(&self, source: MachineId, target: MachineId) -> Result<(), VirtError> {
        if self.lookup(source).await.is_none() {
            return Ok(());
        }

        let net = Self::target_net(target)?;
        self.netem
            .unblock_link(source, net)
            .await
            .map_err(|e| VirtError::Emulation(format!("unblock failed: {e}")))
    }

    async fn set_latency(
        &self,
        source: MachineId,
        target: MachineId,
        latency_us: u32,
    ) -> Result<(), VirtError> {
        if self.lookup(source).await.is_none() {
            return Ok(());
        }

        let net = Self::target_net(target)?;
        self.netem
            .set_latency(source, net, latency_us)
            .await
            .map_err(|e| VirtError::Emulation(format!("set latency failed: {e}")))
    }

    async fn set_bandwidth(
        &self,
        source: MachineId,
        target: MachineId,
        bandwidth_kbps: u64,
    ) -> Result<(), VirtError> {
        if self.lookup(source).await.is_none() {
            return Ok(());
        }

        let net = Self::target_net(target)?;
        self.netem
            .set_bandwidth(source, net, bandwidth_kbps)
            .await
            .map_err(|e| VirtError::Emulation(format!("set bandwidth failed: {e}")))
    }

    async fn start_machine(&self, machine: MachineId) -> Result<(), VirtError> {
        self.transition(machine, MachineState::Started).await
    }

    async fn stop_machine(&self, machine: MachineId) -> Result<(), VirtError> {
        self.transition(machine, MachineState::Stopped).await
    }

    fn ip_address(&self, id: MachineId) -> Result<Ipv4Addr, VirtError> {
        Ok(address::plan(id)?.ip)
    }

    fn resolve_ip(&self, ip: Ipv4Addr) -> Result<MachineId, VirtError> {
        Ok(address::resolve(ip)?)
    }

    async fn stop(&self) -> Result<(), VirtError> {
        let machines: Vec<_> = {
            let guard = self.machines.read().await;
            guard.keys().copied().collect()
        };

        debug!(count = machines.len(), "stopping machines");

        let results = join_all(
            machines
                .iter()
                .map(|id| self.transition(*id, MachineState::Killed)),
        )
        .await;

        let mut first_err = None;
        for res in results {
            if let Err(e) = res {
                error!(error = %e, "killing machine failed");
                first_err.get_or_insert(e);
            }
        }

        debug!("stopping emulation backend");
        if let Err(e) = self.netem.stop().await {
            let e = VirtError::Emulation(format!("stop failed: {e}"));
            error!(error = %e, "emulation backend stop failed");
            first_err.get_or_insert(e);
        }

        debug!("stopping peering backend");
        if let Err(e) = self.peering.stop().await {
            let e = VirtError::Peering(e.to_string());
            error!(error = %e, "peering backend stop failed");
            first_err.get_or_insert(e);
        }

        debug!("removing network devices");
        let entries: Vec<_> = self.machines.read().await.values().cloned().collect();
        for entry in entries {
            let m = entry.lock().await;
            m.remove_network().await;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
