//! Network emulation backends.
//!
//! A backend shapes what a guest can reach and at which latency/bandwidth,
//! keyed by (source machine, target /30). Two interchangeable
//! implementations exist: the classical one built on the kernel's traffic
//! control hierarchy and iptables/ipset ([`tc::TcBackend`]), and an
//! eBPF-based one that paces packet departure timestamps ([`ebpf::EbpfBackend`]).
//!
//! Shared semantics: per-(source, target) state is sticky (last write wins),
//! per-target records are created lazily with default values on first
//! reference, and operations on distinct sources never serialize. The
//! backend-wide lock is only held long enough to locate the per-source
//! record; everything touching kernel objects runs under that source's own
//! mutex.

pub mod ebpf;
pub mod mock;
pub mod tc;

use std::future::Future;

use crate::address::Ipv4Net;
use crate::orchestrator::MachineId;

/// Bandwidth assigned to a link before the driver says otherwise.
pub const DEFAULT_BANDWIDTH_KBPS: u64 = 1_000_000;
/// Latency assigned to a link before the driver says otherwise.
pub const DEFAULT_LATENCY_US: u32 = 0;

/// Capability interface over the two emulation implementations. The engine
/// picks one at startup; everything above is generic over it.
pub trait NetworkEmulationBackend: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Called once per local machine when its tap has been created.
    fn register(
        &self,
        id: MachineId,
        tap: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn set_bandwidth(
        &self,
        source: MachineId,
        target: Ipv4Net,
        bandwidth_kbps: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn set_latency(
        &self,
        source: MachineId,
        target: Ipv4Net,
        latency_us: u32,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn block_link(
        &self,
        source: MachineId,
        target: Ipv4Net,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn unblock_link(
        &self,
        source: MachineId,
        target: Ipv4Net,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Idempotent teardown of every kernel object the backend created.
    fn stop(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
