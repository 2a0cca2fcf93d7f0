//! Control RPC boundary. The simulation driver talks to this service:
//! register the host, push the initial layout, stream state diffs, stop.
//!
//! The RPC system is single-threaded (it runs on a LocalSet); the handlers
//! immediately hand off to the orchestrator, whose fan-out runs on the
//! multi-threaded runtime.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use capnp::capability::Promise;
use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};
use futures::AsyncReadExt;
use tokio::sync::mpsc::Sender;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument};

use celestial_proto::celestial_capnp::{celestial, machine_config, machine_id, state_diff, update_stream};

use crate::orchestrator::{
    Host, MachineConfig, MachineId, MachineRegistration, Orchestrator, OrchestratorError,
    StateDiff, VirtualizationBackend, VmState,
};
use crate::peering::{HostInfo, WireGuard};

/// How long the engine lingers after the driver said stop, so the ack and
/// any trailing queries still get answered.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Signals from the RPC surface to the engine main loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// Driver-requested shutdown; exit cleanly.
    Shutdown,
    /// Unrecoverable startup failure; exit non-zero.
    Fatal(String),
}

pub struct CelestialService<V: VirtualizationBackend> {
    orchestrator: Arc<Orchestrator<V>>,
    peering: Arc<WireGuard>,
    events: Sender<EngineEvent>,
}

impl<V: VirtualizationBackend> Clone for CelestialService<V> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            peering: self.peering.clone(),
            events: self.events.clone(),
        }
    }
}

impl<V: VirtualizationBackend> CelestialService<V> {
    pub fn new(
        orchestrator: Arc<Orchestrator<V>>,
        peering: Arc<WireGuard>,
        events: Sender<EngineEvent>,
    ) -> Self {
        Self {
            orchestrator,
            peering,
            events,
        }
    }
}

/// Accept loop: every driver connection gets its own RPC system sharing the
/// one bootstrap capability.
#[instrument(skip(service))]
pub async fn serve<V: VirtualizationBackend>(
    addr: SocketAddr,
    service: CelestialService<V>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(addr = %addr, "starting control server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let client: celestial::Client = capnp_rpc::new_client(service);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        debug!(peer_addr = %peer_addr, "new driver connection");
        stream.set_nodelay(true)?;
        let (reader, writer) =
            tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();
        let network = twoparty::VatNetwork::new(
            futures::io::BufReader::new(reader),
            futures::io::BufWriter::new(writer),
            rpc_twoparty_capnp::Side::Server,
            Default::default(),
        );

        let rpc_system = RpcSystem::new(Box::new(network), Some(client.clone().client));

        tokio::task::spawn_local(rpc_system);
    }
}

fn read_machine_id(r: machine_id::Reader<'_>) -> MachineId {
    MachineId {
        group: r.get_group(),
        id: r.get_id(),
    }
}

fn read_machine_config(r: machine_config::Reader<'_>) -> Result<MachineConfig, capnp::Error> {
    let mut boot_params = Vec::new();
    for param in r.get_boot_params()? {
        boot_params.push(param?.to_str()?.to_string());
    }

    Ok(MachineConfig {
        vcpu_count: r.get_vcpu_count(),
        ram_mib: r.get_ram_mib(),
        disk_mib: r.get_disk_mib(),
        disk_image: r.get_disk_image()?.to_str()?.to_string(),
        kernel: r.get_kernel()?.to_str()?.to_string(),
        boot_params,
    })
}

fn read_state_diff(
    r: state_diff::Reader<'_>,
    into: &mut StateDiff,
) -> Result<(), capnp::Error> {
    for d in r.get_network_diffs()? {
        into.push_symmetric(
            read_machine_id(d.get_source()?),
            read_machine_id(d.get_target()?),
            d.get_blocked(),
            d.get_latency_us(),
            d.get_bandwidth_kbps(),
            read_machine_id(d.get_next()?),
            read_machine_id(d.get_prev()?),
        );
    }

    for d in r.get_machine_diffs()? {
        let state = match d.get_active()? {
            celestial_proto::celestial_capnp::VmState::Stopped => VmState::Stopped,
            celestial_proto::celestial_capnp::VmState::Active => VmState::Active,
        };
        into.push_machine(read_machine_id(d.get_id()?), state);
    }

    Ok(())
}

fn rpc_error(e: OrchestratorError) -> capnp::Error {
    capnp::Error::failed(e.to_string())
}

impl<V: VirtualizationBackend> celestial::Server for CelestialService<V> {
    fn register(
        &mut self,
        params: celestial::RegisterParams,
        mut results: celestial::RegisterResults,
    ) -> Promise<(), capnp::Error> {
        let host = match params.get() {
            Ok(p) => Host(p.get_host()),
            Err(e) => return Promise::err(e),
        };

        info!(host = %host, "driver registers host");

        let this = self.clone();
        Promise::from_future(async move {
            if let Err(e) = this.peering.register(host).await {
                let msg = format!("registering peering failed: {e}");
                error!(error = %e, "fatal: could not set up overlay");
                let _ = this.events.send(EngineEvent::Fatal(msg.clone())).await;
                return Err(capnp::Error::failed(msg));
            }

            this.orchestrator.set_host(host).map_err(rpc_error)?;

            let (cpus, ram) = this.orchestrator.resources();

            let mut r = results.get();
            r.set_available_cpus(cpus);
            r.set_available_ram(ram);
            r.set_peer_public_key(this.peering.public_key());
            r.set_peer_listen_addr(&this.peering.listen_addr());

            Ok(())
        })
    }

    fn init(
        &mut self,
        params: celestial::InitParams,
        _results: celestial::InitResults,
    ) -> Promise<(), capnp::Error> {
        let parsed = params.get().and_then(|p| {
            let own = self.orchestrator.host();

            let mut remotes = HashMap::new();
            for h in p.get_hosts()? {
                let id = Host(h.get_id());
                if Some(id) == own {
                    continue;
                }
                remotes.insert(
                    id,
                    HostInfo {
                        addr: h.get_peer_listen_addr()?.to_str()?.to_string(),
                        public_key: h.get_peer_public_key()?.to_str()?.to_string(),
                    },
                );
            }

            let mut machines = Vec::new();
            for m in p.get_machines()? {
                let name = m.get_name()?.to_str()?;
                machines.push(MachineRegistration {
                    id: read_machine_id(m.get_id()?),
                    host: Host(m.get_host()),
                    config: read_machine_config(m.get_config()?)?,
                    name: if name.is_empty() {
                        None
                    } else {
                        Some(name.to_string())
                    },
                });
            }

            Ok((remotes, machines))
        });

        let (remotes, machines) = match parsed {
            Ok(v) => v,
            Err(e) => return Promise::err(e),
        };

        info!(
            hosts = remotes.len(),
            machines = machines.len(),
            "driver initializes host"
        );

        let this = self.clone();
        Promise::from_future(async move {
            // an incomplete mesh invalidates the whole emulation
            if let Err(e) = this.peering.init_peering(remotes).await {
                let msg = format!("peering initialization failed: {e}");
                error!(error = %e, "fatal: could not reach all peers");
                let _ = this.events.send(EngineEvent::Fatal(msg.clone())).await;
                return Err(capnp::Error::failed(msg));
            }

            match this.orchestrator.initialize(machines).await {
                Ok(()) => Ok(()),
                // kernel failures at init mean this host cannot participate
                Err(e @ OrchestratorError::Virtualization(_)) => {
                    let msg = e.to_string();
                    error!(error = %msg, "fatal: host initialization failed");
                    let _ = this.events.send(EngineEvent::Fatal(msg.clone())).await;
                    Err(capnp::Error::failed(msg))
                }
                // configuration errors only concern the caller
                Err(e) => Err(rpc_error(e)),
            }
        })
    }

    fn update(
        &mut self,
        _params: celestial::UpdateParams,
        mut results: celestial::UpdateResults,
    ) -> Promise<(), capnp::Error> {
        debug!("driver opens update stream");

        let stream = UpdateStreamImpl {
            orchestrator: self.orchestrator.clone(),
            pending: Rc::new(RefCell::new(StateDiff::default())),
        };

        results.get().set_stream(capnp_rpc::new_client(stream));

        Promise::ok(())
    }

    fn stop(
        &mut self,
        _params: celestial::StopParams,
        _results: celestial::StopResults,
    ) -> Promise<(), capnp::Error> {
        info!("driver requested stop");

        let events = self.events.clone();
        tokio::spawn(async move {
            sleep(STOP_GRACE).await;
            let _ = events.send(EngineEvent::Shutdown).await;
        });

        Promise::ok(())
    }
}

/// One update stream: diffs accumulate until the driver signals the end of
/// the tick, then everything is applied at once. Applying per message would
/// push transient intermediate edges into the kernel.
struct UpdateStreamImpl<V: VirtualizationBackend> {
    orchestrator: Arc<Orchestrator<V>>,
    pending: Rc<RefCell<StateDiff>>,
}

impl<V: VirtualizationBackend> update_stream::Server for UpdateStreamImpl<V> {
    fn push(
        &mut self,
        params: update_stream::PushParams,
        _results: update_stream::PushResults,
    ) -> Promise<(), capnp::Error> {
        let res = params
            .get()
            .and_then(|p| p.get_diff())
            .and_then(|diff| read_state_diff(diff, &mut self.pending.borrow_mut()));

        match res {
            Ok(()) => Promise::ok(()),
            Err(e) => Promise::err(e),
        }
    }

    fn done(
        &mut self,
        _params: update_stream::DoneParams,
        _results: update_stream::DoneResults,
    ) -> Promise<(), capnp::Error> {
        let diff = self.pending.take();

        debug!(
            links = diff.network.len(),
            machines = diff.machines.len(),
            "applying accumulated diff"
        );

        if diff.is_empty() {
            return Promise::ok(());
        }

        let orchestrator = self.orchestrator.clone();
        Promise::from_future(async move {
            orchestrator.update(diff).await.map_err(rpc_error)
        })
    }
}
