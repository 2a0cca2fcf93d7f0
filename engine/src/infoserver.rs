//! Read-only JSON façade over the engine's query API.
//!
//! Guests (and the operator) use this to find out who they are, what the
//! constellation looks like, and which path the emulation currently gives
//! a pair of nodes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::orchestrator::info::{NodeIdInfo, NodeInfo, PathInfo};
use crate::orchestrator::{MachineId, Orchestrator, OrchestratorError, VirtualizationBackend};

/// Group sentinel for ground stations in path routes.
const GST_GROUP: &str = "gst";

#[derive(Debug, Serialize)]
struct Identifier {
    shell: u8,
    id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct Node {
    #[serde(rename = "type")]
    node_type: &'static str,
    active: bool,
    identifier: Identifier,
}

#[derive(Debug, Serialize)]
struct Shell {
    sats: Vec<Node>,
}

#[derive(Debug, Serialize)]
struct Constellation {
    shells: Vec<Shell>,
    groundstations: Vec<Node>,
}

#[derive(Debug, Serialize)]
struct Segment {
    source: Identifier,
    target: Identifier,
    delay_us: u32,
    bandwidth_kbits: u64,
}

#[derive(Debug, Serialize)]
struct PathResponse {
    source: Identifier,
    target: Identifier,
    delay_us: u32,
    bandwidth_kbits: u64,
    blocked: bool,
    segments: Vec<Segment>,
}

impl From<NodeIdInfo> for Identifier {
    fn from(id: NodeIdInfo) -> Self {
        Identifier {
            shell: id.id.group,
            id: id.id.id,
            name: id.name,
        }
    }
}

impl From<NodeInfo> for Node {
    fn from(n: NodeInfo) -> Self {
        let node_type = if n.id.name.is_some() { "gst" } else { "sat" };

        Node {
            node_type,
            active: n.active,
            identifier: n.id.into(),
        }
    }
}

type HttpError = (StatusCode, String);

fn error_response(e: OrchestratorError) -> HttpError {
    let status = match e {
        OrchestratorError::UnknownMachine(_)
        | OrchestratorError::UnknownName(_)
        | OrchestratorError::NoName(_)
        | OrchestratorError::MissingEdge { .. } => StatusCode::NOT_FOUND,
        OrchestratorError::SelfPath(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, e.to_string())
}

pub async fn serve<V: VirtualizationBackend>(
    port: u16,
    orchestrator: Arc<Orchestrator<V>>,
) -> Result<(), hyper::Error> {
    let app = Router::new()
        .route("/self", get(get_self::<V>))
        .route("/info", get(get_info::<V>))
        .route("/shell/:group", get(get_shell::<V>))
        .route("/shell/:group/:id", get(get_sat::<V>))
        .route("/gst/:name", get(get_gst::<V>))
        .route(
            "/path/:source_group/:source_id/:target_group/:target_id",
            get(get_path::<V>),
        )
        .with_state(orchestrator);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "info server listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

async fn get_self<V: VirtualizationBackend>(
    State(orchestrator): State<Arc<Orchestrator<V>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<Node>, HttpError> {
    let IpAddr::V4(ip) = peer.ip() else {
        return Err((
            StatusCode::BAD_REQUEST,
            "could not determine source address".to_string(),
        ));
    };

    let node = orchestrator
        .info_get_node_by_ip(ip)
        .await
        .map_err(error_response)?;

    Ok(Json(node.into()))
}

async fn get_info<V: VirtualizationBackend>(
    State(orchestrator): State<Arc<Orchestrator<V>>>,
) -> Result<Json<Constellation>, HttpError> {
    let constellation = orchestrator
        .info_get_constellation()
        .await
        .map_err(error_response)?;

    let mut shells = Vec::new();
    let mut groundstations = Vec::new();

    for group in constellation.groups {
        let nodes: Vec<Node> = group.nodes.into_iter().map(Node::from).collect();

        if group.group == 0 {
            groundstations = nodes;
        } else {
            shells.push(Shell { sats: nodes });
        }
    }

    Ok(Json(Constellation {
        shells,
        groundstations,
    }))
}

async fn get_shell<V: VirtualizationBackend>(
    State(orchestrator): State<Arc<Orchestrator<V>>>,
    Path(group): Path<u8>,
) -> Result<Json<Shell>, HttpError> {
    let group = orchestrator
        .info_get_group(group)
        .await
        .map_err(error_response)?;

    Ok(Json(Shell {
        sats: group.nodes.into_iter().map(Node::from).collect(),
    }))
}

async fn get_sat<V: VirtualizationBackend>(
    State(orchestrator): State<Arc<Orchestrator<V>>>,
    Path((group, id)): Path<(u8, u32)>,
) -> Result<Json<Node>, HttpError> {
    let node = orchestrator
        .info_get_node_by_id(MachineId { group, id })
        .await
        .map_err(error_response)?;

    Ok(Json(node.into()))
}

async fn get_gst<V: VirtualizationBackend>(
    State(orchestrator): State<Arc<Orchestrator<V>>>,
    Path(name): Path<String>,
) -> Result<Json<Node>, HttpError> {
    let node = orchestrator
        .info_get_node_by_name(&name)
        .await
        .map_err(error_response)?;

    Ok(Json(node.into()))
}

/// `gst` as a group selects a ground station by name instead of a numeric
/// identifier.
async fn resolve_endpoint<V: VirtualizationBackend>(
    orchestrator: &Orchestrator<V>,
    group: &str,
    id: &str,
) -> Result<MachineId, HttpError> {
    if group.eq_ignore_ascii_case(GST_GROUP) {
        let node = orchestrator
            .info_get_node_by_name(id)
            .await
            .map_err(error_response)?;
        return Ok(node.id.id);
    }

    let group: u8 = group
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid group {group}")))?;
    let id: u32 = id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid id {id}")))?;

    Ok(MachineId { group, id })
}

async fn identifier_for<V: VirtualizationBackend>(
    orchestrator: &Orchestrator<V>,
    id: MachineId,
) -> Identifier {
    Identifier {
        shell: id.group,
        id: id.id,
        name: orchestrator.info_get_node_name_by_id(id).await.ok(),
    }
}

async fn get_path<V: VirtualizationBackend>(
    State(orchestrator): State<Arc<Orchestrator<V>>>,
    Path((source_group, source_id, target_group, target_id)): Path<(
        String,
        String,
        String,
        String,
    )>,
) -> Result<Json<PathResponse>, HttpError> {
    let source = resolve_endpoint(&orchestrator, &source_group, &source_id).await?;
    let target = resolve_endpoint(&orchestrator, &target_group, &target_id).await?;

    let path: PathInfo = orchestrator
        .info_get_path(source, target)
        .await
        .map_err(error_response)?;

    let mut segments = Vec::with_capacity(path.segments.len());
    for s in &path.segments {
        segments.push(Segment {
            source: identifier_for(&orchestrator, s.source).await,
            target: identifier_for(&orchestrator, s.target).await,
            delay_us: s.latency_us,
            bandwidth_kbits: s.bandwidth_kbps,
        });
    }

    Ok(Json(PathResponse {
        source: identifier_for(&orchestrator, path.source).await,
        target: identifier_for(&orchestrator, path.target).await,
        delay_us: path.latency_us,
        bandwidth_kbits: path.bandwidth_kbps,
        blocked: path.blocked,
        segments,
    }))
}
