//! Classical emulation backend: HTB classes + netem qdiscs for shaping,
//! an iptables chain with an ipset for blocking.
//!
//! Per source tap: an HTB root `1:` with a default class `1:1` at an
//! effectively unlimited rate, one 16-bit class handle per referenced
//! target /30 (htb class for bandwidth, netem qdisc for delay, u32 filter
//! for classification), plus a `CT-{g}-{id}` chain jumped to from FORWARD
//! and a `CT-{g}-{id}-bl` ipset backing a single REJECT rule.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::address::Ipv4Net;
use crate::cmd::{self, CommandError};
use crate::netem::NetworkEmulationBackend;
use crate::orchestrator::MachineId;

const DEFAULT_RATE: &str = "10.0Gbps";

#[derive(Debug)]
pub enum TcError {
    AlreadyRegistered(MachineId),
    UnknownMachine(MachineId),
    HandleSpaceExhausted(MachineId),
    Command(CommandError),
}

impl fmt::Display for TcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcError::AlreadyRegistered(id) => write!(f, "machine {id} already exists"),
            TcError::UnknownMachine(id) => write!(f, "machine {id} does not exist"),
            TcError::HandleSpaceExhausted(id) => {
                write!(f, "no free tc class handles left on source {id}")
            }
            TcError::Command(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TcError::Command(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommandError> for TcError {
    fn from(e: CommandError) -> Self {
        TcError::Command(e)
    }
}

struct TcSource {
    tap: String,
    chain: String,
    block_set: String,
    /// Last allocated class handle; `1:1` is the default class.
    handle: u16,
    /// Target /30 -> class handle.
    links: HashMap<Ipv4Net, u16>,
}

/// Format a latency in microseconds the way netem takes it: milliseconds
/// with a tenth-of-a-millisecond fraction. Anything below 100us truncates
/// to zero, netem is not that accurate anyway.
fn netem_delay(latency_us: u32) -> String {
    let ms = latency_us / 1000;
    let tenth = latency_us % 1000 / 100;
    format!("{ms}.{tenth}ms")
}

impl TcSource {
    async fn configure(&mut self, id: MachineId) -> Result<(), TcError> {
        // Wipe anything a previous run left on this tap; errors are fine.
        cmd::run_ignore(
            "iptables",
            &["-w", "-D", "FORWARD", "-i", &self.tap, "-j", &self.chain],
        )
        .await;
        cmd::run_ignore("iptables", &["-w", "-F", &self.chain]).await;
        cmd::run_ignore("iptables", &["-w", "-X", &self.chain]).await;
        cmd::run_ignore("ipset", &["destroy", &self.block_set]).await;
        cmd::run_ignore("tc", &["qdisc", "del", "dev", &self.tap, "root"]).await;

        trace!(machine = %id, tap = %self.tap, "configuring tc root");

        cmd::run(
            "tc",
            &[
                "qdisc", "add", "dev", &self.tap, "root", "handle", "1:", "htb", "default", "1",
                "r2q", "1",
            ],
        )
        .await?;

        cmd::run(
            "tc",
            &[
                "class", "add", "dev", &self.tap, "parent", "1:", "classid", "1:1", "htb", "rate",
                DEFAULT_RATE, "quantum", "1514",
            ],
        )
        .await?;

        self.handle = 1;

        trace!(machine = %id, chain = %self.chain, "configuring filter chain");

        cmd::run("iptables", &["-w", "-N", &self.chain]).await?;
        cmd::run(
            "iptables",
            &["-w", "-A", "FORWARD", "-i", &self.tap, "-j", &self.chain],
        )
        .await?;
        cmd::run(
            "ipset",
            &["create", &self.block_set, "hash:ip", "netmask", "30"],
        )
        .await?;
        cmd::run(
            "iptables",
            &[
                "-w",
                "-A",
                &self.chain,
                "-m",
                "set",
                "--match-set",
                &self.block_set,
                "dst",
                "-j",
                "REJECT",
                "--reject-with",
                "icmp-net-unreachable",
            ],
        )
        .await?;

        Ok(())
    }

    /// Make sure a class + netem qdisc + filter exist for the target,
    /// allocating the next handle on first reference.
    async fn ensure_link(&mut self, source: MachineId, target: Ipv4Net) -> Result<u16, TcError> {
        if let Some(handle) = self.links.get(&target) {
            return Ok(*handle);
        }

        let handle = self
            .handle
            .checked_add(1)
            .ok_or(TcError::HandleSpaceExhausted(source))?;
        self.handle = handle;

        let classid = format!("1:{handle}");
        let qdisc_handle = format!("{handle}:");
        let prio = handle.to_string();
        let target_net = target.to_string();

        cmd::run(
            "tc",
            &[
                "class", "add", "dev", &self.tap, "parent", "1:", "classid", &classid, "htb",
                "rate", DEFAULT_RATE, "quantum", "1514",
            ],
        )
        .await?;

        cmd::run(
            "tc",
            &[
                "qdisc",
                "add",
                "dev",
                &self.tap,
                "parent",
                &classid,
                "handle",
                &qdisc_handle,
                "netem",
                "delay",
                "0.0ms",
                "limit",
                "1000000",
            ],
        )
        .await?;

        // On this tap the only traffic towards the guest carries the remote
        // machine's address as source, so matching `ip src` classifies the
        // target direction correctly.
        cmd::run(
            "tc",
            &[
                "filter",
                "add",
                "dev",
                &self.tap,
                "protocol",
                "ip",
                "parent",
                "1:",
                "prio",
                &prio,
                "u32",
                "match",
                "ip",
                "src",
                &target_net,
                "classid",
                &classid,
            ],
        )
        .await?;

        self.links.insert(target, handle);

        Ok(handle)
    }

    async fn teardown(&self) -> Result<(), TcError> {
        debug!(tap = %self.tap, "removing tc and ipset state");

        cmd::run(
            "iptables",
            &["-D", "FORWARD", "-i", &self.tap, "-j", &self.chain],
        )
        .await?;
        cmd::run("iptables", &["-F", &self.chain]).await?;
        cmd::run("iptables", &["-X", &self.chain]).await?;
        cmd::run("ipset", &["destroy", &self.block_set]).await?;
        cmd::run("tc", &["qdisc", "del", "dev", &self.tap, "root"]).await?;

        Ok(())
    }
}

pub struct TcBackend {
    sources: RwLock<HashMap<MachineId, Arc<Mutex<TcSource>>>>,
}

impl TcBackend {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
        }
    }

    async fn source(&self, id: MachineId) -> Result<Arc<Mutex<TcSource>>, TcError> {
        self.sources
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TcError::UnknownMachine(id))
    }
}

impl Default for TcBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkEmulationBackend for TcBackend {
    type Error = TcError;

    async fn register(&self, id: MachineId, tap: &str) -> Result<(), TcError> {
        if self.sources.read().await.contains_key(&id) {
            return Err(TcError::AlreadyRegistered(id));
        }

        trace!(machine = %id, tap, "registering machine");

        let mut source = TcSource {
            tap: tap.to_string(),
            chain: format!("CT-{}-{}", id.group, id.id),
            block_set: format!("CT-{}-{}-bl", id.group, id.id),
            handle: 1,
            links: HashMap::new(),
        };

        source.configure(id).await?;

        self.sources
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(source)));

        Ok(())
    }

    async fn set_bandwidth(
        &self,
        source: MachineId,
        target: Ipv4Net,
        bandwidth_kbps: u64,
    ) -> Result<(), TcError> {
        let entry = self.source(source).await?;
        let mut src = entry.lock().await;

        let handle = src.ensure_link(source, target).await?;

        trace!(tap = %src.tap, %target, bandwidth_kbps, "updating bandwidth");

        let classid = format!("1:{handle}");
        let rate = format!("{bandwidth_kbps}.0kbit");

        cmd::run(
            "tc",
            &[
                "class", "change", "dev", &src.tap, "parent", "1:", "classid", &classid, "htb",
                "rate", &rate, "quantum", "1514",
            ],
        )
        .await?;

        Ok(())
    }

    async fn set_latency(
        &self,
        source: MachineId,
        target: Ipv4Net,
        latency_us: u32,
    ) -> Result<(), TcError> {
        let entry = self.source(source).await?;
        let mut src = entry.lock().await;

        let handle = src.ensure_link(source, target).await?;

        trace!(tap = %src.tap, %target, latency_us, "updating delay");

        let classid = format!("1:{handle}");
        let qdisc_handle = format!("{handle}:");
        let delay = netem_delay(latency_us);

        cmd::run(
            "tc",
            &[
                "qdisc",
                "change",
                "dev",
                &src.tap,
                "parent",
                &classid,
                "handle",
                &qdisc_handle,
                "netem",
                "delay",
                &delay,
                "limit",
                "1000000",
            ],
        )
        .await?;

        Ok(())
    }

    async fn block_link(&self, source: MachineId, target: Ipv4Net) -> Result<(), TcError> {
        let entry = self.source(source).await?;
        let mut src = entry.lock().await;

        src.ensure_link(source, target).await?;

        let target_net = target.to_string();

        cmd::run("ipset", &["add", &src.block_set, &target_net, "-exist"]).await?;

        Ok(())
    }

    async fn unblock_link(&self, source: MachineId, target: Ipv4Net) -> Result<(), TcError> {
        let entry = self.source(source).await?;
        let mut src = entry.lock().await;

        src.ensure_link(source, target).await?;

        debug!(set = %src.block_set, %target, "unblocking");

        let target_net = target.to_string();

        cmd::run("ipset", &["del", &src.block_set, &target_net]).await?;

        Ok(())
    }

    async fn stop(&self) -> Result<(), TcError> {
        debug!("removing all tc emulation state");

        let sources: Vec<_> = self.sources.read().await.values().cloned().collect();

        let mut set = JoinSet::new();
        for entry in sources {
            set.spawn(async move {
                let src = entry.lock().await;
                src.teardown().await
            });
        }

        let mut first_err = None;
        while let Some(res) = set.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "tc teardown failed");
                    first_err.get_or_insert(e);
                }
                Err(e) => tracing::error!(error = %e, "tc teardown task panicked"),
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netem_delay_converts_to_tenth_milliseconds() {
        assert_eq!(netem_delay(0), "0.0ms");
        assert_eq!(netem_delay(99), "0.0ms");
        assert_eq!(netem_delay(100), "0.1ms");
        assert_eq!(netem_delay(1_000), "1.0ms");
        assert_eq!(netem_delay(100_000), "100.0ms");
        assert_eq!(netem_delay(100_500), "100.5ms");
        assert_eq!(netem_delay(2_345_678), "2345.6ms");
    }
}
