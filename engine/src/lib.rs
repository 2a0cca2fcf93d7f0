//! Per-host emulation orchestration engine for large satellite
//! constellations.
//!
//! One engine runs per physical host. It owns the lifecycle of every local
//! micro-VM and its tap, applies the driver's streamed network diffs to the
//! kernel, keeps the in-memory view of the desired global state, and
//! tunnels inter-host VM traffic over an encrypted overlay.

pub mod address;
pub mod cmd;
pub mod dns;
pub mod host;
pub mod infoserver;
pub mod netem;
pub mod orchestrator;
pub mod peering;
pub mod server;
pub mod virt;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task;
use tracing::{error, info};

use crate::netem::NetworkEmulationBackend;
use crate::orchestrator::Orchestrator;
use crate::peering::WireGuard;
use crate::server::{CelestialService, EngineEvent};
use crate::virt::supervisor::FirecrackerBackend;
use crate::virt::Virt;

/// Overlay interface name.
const WG_INTERFACE: &str = "wg0";
/// Overlay UDP listen port.
const WG_PORT: u16 = 3000;
/// Prefix length of the overlay subnet.
const WG_MASK: u8 = 26;
/// Where the overlay private key is written.
const KEY_PATH: &str = "/celestial/privatekey";

pub struct EngineConfig {
    /// Control RPC port.
    pub port: u16,
    pub dns_port: u16,
    pub info_port: u16,
    /// Uplink interface carrying egress and inter-host traffic.
    pub host_interface: String,
}

/// Bring the engine up with the chosen emulation backend and run it until
/// the driver stops it or the process is interrupted. Returns an error on
/// fatal startup or initialization failure; the caller turns that into a
/// non-zero exit.
pub async fn run<N>(
    config: EngineConfig,
    netem_backend: N,
) -> Result<(), Box<dyn std::error::Error>>
where
    N: NetworkEmulationBackend,
{
    host::bootstrap(&config.host_interface).await?;
    info!(interface = %config.host_interface, "host bootstrapped");

    let peering = Arc::new(WireGuard::new(WG_INTERFACE, KEY_PATH, WG_MASK, WG_PORT).await?);

    let supervisor = FirecrackerBackend::new(host::OUTPUT_PATH);

    let virt = Arc::new(Virt::new(
        peering.clone(),
        Arc::new(netem_backend),
        supervisor,
    ));

    let orchestrator = Arc::new(Orchestrator::new(virt));

    let (events_tx, mut events_rx) = mpsc::channel(4);

    {
        let orchestrator = orchestrator.clone();
        let port = config.dns_port;
        tokio::spawn(async move {
            if let Err(e) = dns::serve(port, orchestrator).await {
                error!(error = %e, "dns service failed");
            }
        });
    }

    {
        let orchestrator = orchestrator.clone();
        let port = config.info_port;
        tokio::spawn(async move {
            if let Err(e) = infoserver::serve(port, orchestrator).await {
                error!(error = %e, "info server failed");
            }
        });
    }

    let service = CelestialService::new(orchestrator.clone(), peering.clone(), events_tx);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    // The RPC system is !Send and lives on a LocalSet; the engine's fan-out
    // work still lands on the multi-threaded runtime.
    let outcome: Result<(), Box<dyn std::error::Error>> = task::LocalSet::new()
        .run_until(async move {
            let serve = task::spawn_local(server::serve(addr, service));

            tokio::select! {
                res = serve => match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error>),
                },
                event = events_rx.recv() => match event {
                    Some(EngineEvent::Fatal(msg)) => Err(msg.into()),
                    Some(EngineEvent::Shutdown) | None => Ok(()),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    Ok(())
                }
            }
        })
        .await;

    info!("shutting down engine");

    if let Err(e) = orchestrator.stop().await {
        error!(error = %e, "engine teardown failed");
        if outcome.is_ok() {
            return Err(Box::new(e));
        }
    }

    outcome
}
