//! Core identifiers and the desired-state model.

use std::collections::HashMap;
use std::fmt;

/// Identifies one emulated node. Group 0 is reserved for ground stations,
/// satellite shells start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId {
    pub group: u8,
    pub id: u32,
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.group, self.id)
    }
}

/// Index of a physical host in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host(pub u8);

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resources and images of one micro-VM.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub ram_mib: u64,
    pub disk_mib: u64,
    /// Root file system image, relative to the artifact root.
    pub disk_image: String,
    /// Kernel image, relative to the artifact root.
    pub kernel: String,
    /// Extra kernel command line tokens.
    pub boot_params: Vec<String>,
}

/// Driver-visible power state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Stopped,
    Active,
}

/// One directed link. Latency and bandwidth are retained while a link is
/// blocked; they are simply not applied to the kernel until it unblocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub blocked: bool,
    pub latency_us: u32,
    pub bandwidth_kbps: u64,
    /// First hop on the path to the target, as computed by the driver.
    pub next: MachineId,
}

pub type NetworkState = HashMap<MachineId, HashMap<MachineId, Link>>;
pub type MachinesState = HashMap<MachineId, VmState>;

/// A directed link change.
#[derive(Debug, Clone, Copy)]
pub struct LinkDiff {
    pub source: MachineId,
    pub target: MachineId,
    pub link: Link,
}

/// Accumulated changes of one update. The wire format carries one record
/// per unordered machine pair; [`StateDiff::push_symmetric`] expands it
/// into both directions.
#[derive(Debug, Clone, Default)]
pub struct StateDiff {
    pub network: Vec<LinkDiff>,
    pub machines: Vec<(MachineId, VmState)>,
}

impl StateDiff {
    #[allow(clippy::too_many_arguments)]
    pub fn push_symmetric(
        &mut self,
        source: MachineId,
        target: MachineId,
        blocked: bool,
        latency_us: u32,
        bandwidth_kbps: u64,
        next: MachineId,
        prev: MachineId,
    ) {
        self.network.push(LinkDiff {
            source,
            target,
            link: Link {
                blocked,
                latency_us,
                bandwidth_kbps,
                next,
            },
        });
        self.network.push(LinkDiff {
            source: target,
            target: source,
            link: Link {
                blocked,
                latency_us,
                bandwidth_kbps,
                next: prev,
            },
        });
    }

    pub fn push_machine(&mut self, id: MachineId, state: VmState) {
        self.machines.push((id, state));
    }

    pub fn is_empty(&self) -> bool {
        self.network.is_empty() && self.machines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(group: u8, id: u32) -> MachineId {
        MachineId { group, id }
    }

    #[test]
    fn symmetric_diffs_expand_to_both_directions() {
        let mut diff = StateDiff::default();
        diff.push_symmetric(mid(1, 0), mid(1, 3), false, 2_000, 10_000, mid(1, 1), mid(1, 2));

        assert_eq!(diff.network.len(), 2);

        let forward = &diff.network[0];
        assert_eq!(forward.source, mid(1, 0));
        assert_eq!(forward.target, mid(1, 3));
        assert_eq!(forward.link.next, mid(1, 1));
        assert_eq!(forward.link.latency_us, 2_000);

        let backward = &diff.network[1];
        assert_eq!(backward.source, mid(1, 3));
        assert_eq!(backward.target, mid(1, 0));
        assert_eq!(backward.link.next, mid(1, 2));
        assert_eq!(backward.link.bandwidth_kbps, 10_000);
    }

    #[test]
    fn empty_diff_reports_empty() {
        let mut diff = StateDiff::default();
        assert!(diff.is_empty());
        diff.push_machine(mid(0, 1), VmState::Active);
        assert!(!diff.is_empty());
    }
}
