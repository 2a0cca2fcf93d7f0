//! One-shot host configuration.
//!
//! Runs exactly once at engine start, before any machine exists. Everything
//! here is idempotent; any failure is fatal because a half-configured host
//! cannot usefully take part in the emulation.
//!
//! Partially based on the firecracker demo one-time setup.

use std::fmt;
use std::io;

use tracing::warn;

use crate::cmd::{self, CommandError};

/// Root directory for kernel and disk artifacts.
pub const ROOT_PATH: &str = "/celestial";
/// Per-VM stdout/stderr capture, recreated on every start.
pub const OUTPUT_PATH: &str = "/celestial/out";

const CLOCKSOURCE_PATH: &str = "/sys/devices/system/clocksource/clocksource0/current_clocksource";

#[derive(Debug)]
pub enum HostError {
    Command(CommandError),
    Io(io::Error),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Command(e) => write!(f, "host setup command failed: {e}"),
            HostError::Io(e) => write!(f, "host setup i/o failed: {e}"),
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostError::Command(e) => Some(e),
            HostError::Io(e) => Some(e),
        }
    }
}

impl From<CommandError> for HostError {
    fn from(e: CommandError) -> Self {
        HostError::Command(e)
    }
}

impl From<io::Error> for HostError {
    fn from(e: io::Error) -> Self {
        HostError::Io(e)
    }
}

/// Configure packet forwarding, ARP cache sizing, masquerading, and the
/// output directory.
pub async fn bootstrap(host_interface: &str) -> Result<(), HostError> {
    cmd::run("iptables", &["-F"]).await?;

    tokio::fs::write("/proc/sys/net/ipv4/ip_forward", "1").await?;

    cmd::run("sysctl", &["-wq", "net.ipv4.conf.all.forwarding=1"]).await?;

    // Avoid "neighbour: arp_cache: neighbor table overflow!" with thousands
    // of directly attached /30s.
    cmd::run("sysctl", &["-wq", "net.ipv4.neigh.default.gc_thresh1=1024"]).await?;
    cmd::run("sysctl", &["-wq", "net.ipv4.neigh.default.gc_thresh2=2048"]).await?;
    cmd::run("sysctl", &["-wq", "net.ipv4.neigh.default.gc_thresh3=4096"]).await?;

    cmd::run(
        "iptables",
        &["-t", "nat", "-A", "POSTROUTING", "-o", host_interface, "-j", "MASQUERADE"],
    )
    .await?;

    cmd::run(
        "iptables",
        &[
            "-A",
            "FORWARD",
            "-m",
            "conntrack",
            "--ctstate",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ],
    )
    .await?;

    // Recreate the output directory so a new run does not inherit stale
    // guest logs.
    if tokio::fs::metadata(OUTPUT_PATH).await.is_ok() {
        tokio::fs::remove_dir_all(OUTPUT_PATH).await?;
    }
    tokio::fs::create_dir_all(OUTPUT_PATH).await?;

    check_clocksource().await?;

    Ok(())
}

/// Guests rely on an invariant TSC for cheap timekeeping; anything else on
/// the host makes the in-guest clocks drift badly under pause/resume.
async fn check_clocksource() -> Result<(), HostError> {
    let clocksource = tokio::fs::read_to_string(CLOCKSOURCE_PATH).await?;

    if clocksource.trim() != "tsc" {
        warn!(
            current = clocksource.trim(),
            "host clock source is not tsc, switching it"
        );
        tokio::fs::write(CLOCKSOURCE_PATH, "tsc").await?;
    }

    Ok(())
}
