//! Encrypted host-to-host overlay.
//!
//! Each host carries one WireGuard interface; every remote host is one peer
//! on it. A machine that lives on another host gets a route for its /30 via
//! that host's overlay address, so guest traffic transparently crosses the
//! tunnel. The allowed-IPs set of a peer only ever grows during a run and
//! is rewritten in full on every route addition.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::address::Ipv4Net;
use crate::cmd::{self, CommandError};
use crate::orchestrator::Host;

/// Overlay hosts live in 192.168.50.0/24, offset by two.
const WG_ADDR_BASE: [u8; 3] = [192, 168, 50];
/// Largest host index the overlay subnet can carry.
pub const MAX_HOST: u8 = 253;

#[derive(Debug)]
pub enum PeeringError {
    NotRegistered,
    HostOutOfRange(u8),
    UnknownHost(Host),
    BadPeerAddress(String),
    Unreachable { host: Host, detail: String },
    Command(CommandError),
    Io(std::io::Error),
}

impl fmt::Display for PeeringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeeringError::NotRegistered => write!(f, "peering not registered yet"),
            PeeringError::HostOutOfRange(h) => {
                write!(f, "host index {h} is larger than allowed {MAX_HOST}")
            }
            PeeringError::UnknownHost(h) => write!(f, "unknown host {h}"),
            PeeringError::BadPeerAddress(a) => write!(f, "could not parse peer address {a}"),
            PeeringError::Unreachable { host, detail } => {
                write!(f, "could not reach host {host}: {detail}")
            }
            PeeringError::Command(e) => write!(f, "{e}"),
            PeeringError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PeeringError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PeeringError::Command(e) => Some(e),
            PeeringError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommandError> for PeeringError {
    fn from(e: CommandError) -> Self {
        PeeringError::Command(e)
    }
}

impl From<std::io::Error> for PeeringError {
    fn from(e: std::io::Error) -> Self {
        PeeringError::Io(e)
    }
}

/// What the driver hands us about one remote host at init.
#[derive(Debug, Clone)]
pub struct HostInfo {
    /// Direct (underlay) address, `host:port`.
    pub addr: String,
    pub public_key: String,
}

/// The slice of the peering service the virtualization layer depends on.
pub trait PeeringBackend: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn host_id(&self) -> Result<Host, Self::Error>;

    /// Route a machine /30 to the host that owns it.
    fn route(
        &self,
        network: Ipv4Net,
        host: Host,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

    fn stop(&self) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;
}

struct Peer {
    direct_addr: String,
    wg_addr: Ipv4Addr,
    public_key: String,
    /// Observed one-way latency to this host.
    latency_us: u64,
    /// /30s currently routed via this peer. Append-only during a run.
    allowed: Vec<Ipv4Net>,
}

pub struct WireGuard {
    interface: String,
    key_path: PathBuf,
    /// Prefix length of the overlay subnet on the interface.
    mask: u8,
    port: u16,
    public_key: String,
    own: std::sync::Mutex<Option<Host>>,
    peers: RwLock<HashMap<Host, Arc<Mutex<Peer>>>>,
}

fn wg_addr(host: Host) -> Result<Ipv4Addr, PeeringError> {
    if host.0 > MAX_HOST {
        return Err(PeeringError::HostOutOfRange(host.0));
    }

    Ok(Ipv4Addr::new(
        WG_ADDR_BASE[0],
        WG_ADDR_BASE[1],
        WG_ADDR_BASE[2],
        2 + host.0,
    ))
}

/// Pull the average RTT in microseconds out of ping's summary line:
/// `rtt min/avg/max/mdev = 0.045/0.052/0.061/0.007 ms`.
fn parse_avg_rtt_us(output: &str) -> Option<u64> {
    let line = output.lines().find(|l| l.contains("min/avg/max"))?;
    let values = line.split('=').nth(1)?.trim();
    let avg_ms: f64 = values.split('/').nth(1)?.parse().ok()?;
    Some((avg_ms * 1000.0) as u64)
}

impl WireGuard {
    /// Generate the host key pair and write the private key out. The
    /// interface itself is only created once the driver registers us.
    pub async fn new(
        interface: impl Into<String>,
        key_path: impl Into<PathBuf>,
        mask: u8,
        port: u16,
    ) -> Result<Self, PeeringError> {
        let interface = interface.into();
        let key_path = key_path.into();

        // remove old interface first, errors are ok
        cmd::run_ignore("ip", &["link", "del", &interface]).await;
        debug!(interface = %interface, "removed stale overlay interface");

        let private_key = cmd::output("wg", &["genkey"]).await?;
        tokio::fs::write(&key_path, &private_key).await?;

        let public_key = cmd::output_with_stdin("wg", &["pubkey"], &private_key).await?;

        debug!(public_key = %public_key, "generated overlay key pair");

        Ok(Self {
            interface,
            key_path,
            mask,
            port,
            public_key,
            own: std::sync::Mutex::new(None),
            peers: RwLock::new(HashMap::new()),
        })
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// The address the underlay listener is bound to. The driver substitutes
    /// the host's routable address before distributing it.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Create the overlay interface for this host and start listening.
    pub async fn register(&self, host: Host) -> Result<(), PeeringError> {
        let addr = wg_addr(host)?;

        cmd::run(
            "ip",
            &["link", "add", &self.interface, "type", "wireguard"],
        )
        .await?;

        let cidr = format!("{}/{}", addr, self.mask);
        cmd::run("ip", &["addr", "add", &cidr, "dev", &self.interface]).await?;

        let key_path = self.key_path.to_string_lossy().into_owned();
        let port = self.port.to_string();
        cmd::run(
            "wg",
            &[
                "set",
                &self.interface,
                "private-key",
                &key_path,
                "listen-port",
                &port,
            ],
        )
        .await?;

        cmd::run("ip", &["link", "set", &self.interface, "up"]).await?;

        info!(host = %host, overlay_addr = %addr, "overlay interface up");

        *self.own.lock().unwrap() = Some(host);

        Ok(())
    }

    /// Configure every remote peer and measure the direct-path latency to
    /// each. An unreachable peer is a configuration error and fatal.
    pub async fn init_peering(
        &self,
        remotes: HashMap<Host, HostInfo>,
    ) -> Result<(), PeeringError> {
        let own_host = (*self.own.lock().unwrap()).ok_or(PeeringError::NotRegistered)?;

        for (remote, peer_info) in remotes {
            if remote == own_host {
                continue;
            }

            let remote_wg_addr = wg_addr(remote)?;

            let (addr, _port) = peer_info
                .addr
                .rsplit_once(':')
                .ok_or_else(|| PeeringError::BadPeerAddress(peer_info.addr.clone()))?;

            let allowed = format!("{remote_wg_addr}/32");
            cmd::run(
                "wg",
                &[
                    "set",
                    &self.interface,
                    "peer",
                    &peer_info.public_key,
                    "allowed-ips",
                    &allowed,
                    "endpoint",
                    &peer_info.addr,
                ],
            )
            .await?;

            // five probes over the direct path; one-way latency is half the
            // average round trip
            let ping = cmd::output("ping", &["-c", "5", "-q", addr])
                .await
                .map_err(|e| PeeringError::Unreachable {
                    host: remote,
                    detail: e.to_string(),
                })?;

            let latency_us = parse_avg_rtt_us(&ping)
                .map(|rtt| rtt / 2)
                .ok_or_else(|| PeeringError::Unreachable {
                    host: remote,
                    detail: "could not parse ping output".into(),
                })?;

            info!(host = %remote, latency_us, "determined latency to peer");

            self.peers.write().await.insert(
                remote,
                Arc::new(Mutex::new(Peer {
                    direct_addr: addr.to_string(),
                    wg_addr: remote_wg_addr,
                    public_key: peer_info.public_key,
                    latency_us,
                    allowed: Vec::new(),
                })),
            );
        }

        Ok(())
    }
}

impl PeeringBackend for WireGuard {
    type Error = PeeringError;

    fn host_id(&self) -> Result<Host, PeeringError> {
        (*self.own.lock().unwrap()).ok_or(PeeringError::NotRegistered)
    }

    async fn route(&self, network: Ipv4Net, host: Host) -> Result<(), PeeringError> {
        let entry = self
            .peers
            .read()
            .await
            .get(&host)
            .cloned()
            .ok_or(PeeringError::UnknownHost(host))?;

        let mut peer = entry.lock().await;

        peer.allowed.push(network);

        // the whole allowed set is rewritten on every addition
        let mut allowed_cidrs = format!("{}/32", peer.wg_addr);
        for net in &peer.allowed {
            allowed_cidrs.push(',');
            allowed_cidrs.push_str(&net.to_string());
        }

        cmd::run(
            "wg",
            &[
                "set",
                &self.interface,
                "peer",
                &peer.public_key,
                "allowed-ips",
                &allowed_cidrs,
            ],
        )
        .await?;

        let net = network.to_string();
        let via = peer.wg_addr.to_string();

        // an old conflicting route may not exist
        cmd::run_ignore("ip", &["route", "del", &net]).await;
        cmd::run(
            "ip",
            &["route", "add", &net, "via", &via, "dev", &self.interface],
        )
        .await?;

        debug!(
            %network,
            host = %host,
            peer = %peer.direct_addr,
            peer_latency_us = peer.latency_us,
            "routed machine network to peer"
        );

        Ok(())
    }

    async fn stop(&self) -> Result<(), PeeringError> {
        cmd::run("ip", &["link", "del", &self.interface]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_addresses_offset_by_two() {
        assert_eq!(wg_addr(Host(0)).unwrap(), Ipv4Addr::new(192, 168, 50, 2));
        assert_eq!(wg_addr(Host(5)).unwrap(), Ipv4Addr::new(192, 168, 50, 7));
        assert_eq!(
            wg_addr(Host(253)).unwrap(),
            Ipv4Addr::new(192, 168, 50, 255)
        );
        assert!(wg_addr(Host(254)).is_err());
    }

    #[test]
    fn ping_summary_parses() {
        let out = "\
5 packets transmitted, 5 received, 0% packet loss, time 4005ms
rtt min/avg/max/mdev = 0.045/0.052/0.061/0.007 ms";
        assert_eq!(parse_avg_rtt_us(out), Some(52));
    }

    #[test]
    fn ping_garbage_is_rejected() {
        assert_eq!(parse_avg_rtt_us("no such host"), None);
        assert_eq!(parse_avg_rtt_us("rtt min/avg/max/mdev = broken"), None);
    }
}
