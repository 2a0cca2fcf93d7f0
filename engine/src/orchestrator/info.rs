//! Read-only queries over the engine state. Everything here answers from
//! memory under the shared lock; nothing reaches the kernel.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use super::{MachineId, Orchestrator, OrchestratorError, VirtualizationBackend, VmState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdInfo {
    pub id: MachineId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeIdInfo,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub group: u8,
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstellationInfo {
    pub groups: Vec<GroupInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub source: MachineId,
    pub target: MachineId,
    pub latency_us: u32,
    pub bandwidth_kbps: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub source: MachineId,
    pub target: MachineId,
    pub blocked: bool,
    pub latency_us: u32,
    pub bandwidth_kbps: u64,
    pub segments: Vec<SegmentInfo>,
}

impl<V: VirtualizationBackend> Orchestrator<V> {
    pub fn info_get_ip_address_by_id(
        &self,
        id: MachineId,
    ) -> Result<Ipv4Addr, OrchestratorError> {
        self.virt
            .ip_address(id)
            .map_err(|e| OrchestratorError::Virtualization(e.to_string()))
    }

    pub async fn info_get_ip_address_by_name(
        &self,
        name: &str,
    ) -> Result<Ipv4Addr, OrchestratorError> {
        let guard = self.state.read().await;
        let st = guard.as_ref().ok_or(OrchestratorError::NotInitialized)?;

        let id = st
            .names
            .get(name)
            .copied()
            .ok_or_else(|| OrchestratorError::UnknownName(name.to_string()))?;

        self.virt
            .ip_address(id)
            .map_err(|e| OrchestratorError::Virtualization(e.to_string()))
    }

    pub async fn info_get_node_by_ip(&self, ip: Ipv4Addr) -> Result<NodeInfo, OrchestratorError> {
        let id = self
            .virt
            .resolve_ip(ip)
            .map_err(|e| OrchestratorError::Virtualization(e.to_string()))?;

        self.info_get_node_by_id(id).await
    }

    pub async fn info_get_node_by_id(&self, id: MachineId) -> Result<NodeInfo, OrchestratorError> {
        let guard = self.state.read().await;
        let st = guard.as_ref().ok_or(OrchestratorError::NotInitialized)?;

        let entry = st
            .machines
            .get(&id)
            .ok_or(OrchestratorError::UnknownMachine(id))?;

        Ok(NodeInfo {
            id: NodeIdInfo {
                id,
                name: entry.name.clone(),
            },
            active: st.machines_state.get(&id) == Some(&VmState::Active),
        })
    }

    pub async fn info_get_node_by_name(&self, name: &str) -> Result<NodeInfo, OrchestratorError> {
        let guard = self.state.read().await;
        let st = guard.as_ref().ok_or(OrchestratorError::NotInitialized)?;

        let id = st
            .names
            .get(name)
            .copied()
            .ok_or_else(|| OrchestratorError::UnknownName(name.to_string()))?;

        Ok(NodeInfo {
            id: NodeIdInfo {
                id,
                name: Some(name.to_string()),
            },
            active: st.machines_state.get(&id) == Some(&VmState::Active),
        })
    }

    pub async fn info_get_node_name_by_id(
        &self,
        id: MachineId,
    ) -> Result<String, OrchestratorError> {
        let guard = self.state.read().await;
        let st = guard.as_ref().ok_or(OrchestratorError::NotInitialized)?;

        st.machines
            .get(&id)
            .ok_or(OrchestratorError::UnknownMachine(id))?
            .name
            .clone()
            .ok_or(OrchestratorError::NoName(id))
    }

    pub async fn info_get_constellation(&self) -> Result<ConstellationInfo, OrchestratorError> {
        let guard = self.state.read().await;
        let st = guard.as_ref().ok_or(OrchestratorError::NotInitialized)?;

        let mut groups: BTreeMap<u8, BTreeMap<u32, NodeInfo>> = BTreeMap::new();

        for (id, entry) in &st.machines {
            groups.entry(id.group).or_default().insert(
                id.id,
                NodeInfo {
                    id: NodeIdInfo {
                        id: *id,
                        name: entry.name.clone(),
                    },
                    active: st.machines_state.get(id) == Some(&VmState::Active),
                },
            );
        }

        Ok(ConstellationInfo {
            groups: groups
                .into_iter()
                .map(|(group, nodes)| GroupInfo {
                    group,
                    nodes: nodes.into_values().collect(),
                })
                .collect(),
        })
    }

    pub async fn info_get_group(&self, group: u8) -> Result<GroupInfo, OrchestratorError> {
        let guard = self.state.read().await;
        let st = guard.as_ref().ok_or(OrchestratorError::NotInitialized)?;

        let mut nodes: BTreeMap<u32, NodeInfo> = BTreeMap::new();

        for (id, entry) in &st.machines {
            if id.group != group {
                continue;
            }

            nodes.insert(
                id.id,
                NodeInfo {
                    id: NodeIdInfo {
                        id: *id,
                        name: entry.name.clone(),
                    },
                    active: st.machines_state.get(id) == Some(&VmState::Active),
                },
            );
        }

        Ok(GroupInfo {
            group,
            nodes: nodes.into_values().collect(),
        })
    }

    /// Reconstruct the path A -> B by chasing next hops through the link
    /// matrix. End-to-end latency and bandwidth are the driver-computed
    /// values on the direct record; the segments show each hop.
    pub async fn info_get_path(
        &self,
        source: MachineId,
        target: MachineId,
    ) -> Result<PathInfo, OrchestratorError> {
        if source == target {
            return Err(OrchestratorError::SelfPath(source));
        }

        let guard = self.state.read().await;
        let st = guard.as_ref().ok_or(OrchestratorError::NotInitialized)?;

        let edge = |from: MachineId, to: MachineId| {
            st.network
                .get(&from)
                .and_then(|row| row.get(&to))
                .ok_or(OrchestratorError::MissingEdge { from, to })
        };

        let direct = edge(source, target)?;

        if direct.blocked {
            return Ok(PathInfo {
                source,
                target,
                blocked: true,
                latency_us: 0,
                bandwidth_kbps: 0,
                segments: Vec::new(),
            });
        }

        let mut segments = Vec::new();
        let mut cur = source;

        // the walk visits each machine at most once on a sane topology
        let max_hops = st.machines.len();

        while cur != target {
            if segments.len() > max_hops {
                // next-hop cycle, can only be a driver bug
                return Err(OrchestratorError::MissingEdge { from: cur, to: target });
            }

            let next = edge(cur, target)?.next;
            let hop = edge(cur, next)?;

            segments.push(SegmentInfo {
                source: cur,
                target: next,
                latency_us: hop.latency_us,
                bandwidth_kbps: hop.bandwidth_kbps,
            });

            cur = next;
        }

        Ok(PathInfo {
            source,
            target,
            blocked: false,
            latency_us: direct.latency_us,
            bandwidth_kbps: direct.bandwidth_kbps,
            segments,
        })
    }
}
