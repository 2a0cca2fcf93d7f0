//! Micro-VM supervisor control.
//!
//! The hypervisor is an external process with a REST API on a Unix socket;
//! the engine only ever talks to that API. Three traits keep the layer
//! swappable for tests:
//!
//! - [`MicroVm`] — per-VM API client (one instance = one VM = one socket).
//! - [`VmProcess`] — handle to the OS process backing one VM.
//! - [`SupervisorBackend`] — factory that spawns supervisor processes and
//!   produces clients.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use hyperlocal::{UnixClientExt, Uri as UnixUri};
use rand::Rng;
use serde::Serialize;
use tokio::time::{sleep, Duration};
use tracing::trace;

#[derive(Debug)]
pub enum SupervisorError {
    Communication(String),
    Api { endpoint: String, message: String },
    SocketTimeout(PathBuf),
    Serialization(serde_json::Error),
    Io(std::io::Error),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Communication(msg) => write!(f, "communication error: {msg}"),
            SupervisorError::Api { endpoint, message } => {
                write!(f, "supervisor rejected {endpoint}: {message}")
            }
            SupervisorError::SocketTimeout(path) => {
                write!(f, "supervisor socket {} never appeared", path.display())
            }
            SupervisorError::Serialization(e) => write!(f, "serialization error: {e}"),
            SupervisorError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Serialization(e) => Some(e),
            SupervisorError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SupervisorError {
    fn from(e: serde_json::Error) -> Self {
        SupervisorError::Serialization(e)
    }
}

impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        SupervisorError::Io(e)
    }
}

/// Supervisor-agnostic description of one machine, assembled by the
/// lifecycle layer from the machine config and its network allocation.
#[derive(Debug, Clone)]
pub struct VmDefinition {
    pub vcpu_count: u8,
    pub ram_mib: u64,
    pub kernel_path: String,
    pub boot_args: String,
    /// Read-only root file system image.
    pub root_drive: String,
    /// Writable overlay, created fresh at first boot.
    pub overlay_drive: String,
    pub mac: String,
    pub tap: String,
}

// ─── Traits ────────────────────────────────────────────────────────────────

/// One instance = one VM = one API socket.
pub trait MicroVm: Send + Sync + 'static {
    /// Push the full VM definition. Must happen before [`MicroVm::start`].
    fn configure(
        &self,
        def: &VmDefinition,
    ) -> impl Future<Output = Result<(), SupervisorError>> + Send;

    /// Boot the configured VM.
    fn start(&self) -> impl Future<Output = Result<(), SupervisorError>> + Send;

    /// Freeze vCPUs.
    fn pause(&self) -> impl Future<Output = Result<(), SupervisorError>> + Send;

    /// Thaw vCPUs.
    fn resume(&self) -> impl Future<Output = Result<(), SupervisorError>> + Send;
}

/// Handle to the OS process backing one VM.
pub trait VmProcess: Send + Sync + 'static {
    /// Terminate the supervisor. Best effort, the VM dies with it.
    fn kill(&mut self) -> impl Future<Output = Result<(), SupervisorError>> + Send;

    /// Remove leftover resources (socket files). Called after `kill`.
    fn cleanup(&mut self) -> impl Future<Output = Result<(), SupervisorError>> + Send;
}

/// Factory spawning one supervisor process per VM.
pub trait SupervisorBackend: Send + Sync + 'static {
    type Vm: MicroVm;
    type Process: VmProcess;

    /// Spawn a supervisor for the named machine and wait until its API
    /// socket accepts requests.
    fn spawn(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(Self::Vm, Self::Process, PathBuf), SupervisorError>> + Send;
}

// ─── Firecracker implementation ────────────────────────────────────────────

// Firecracker API request bodies.

#[derive(Debug, Serialize)]
struct FcMachineConfig {
    vcpu_count: u8,
    mem_size_mib: u64,
    smt: bool,
}

#[derive(Debug, Serialize)]
struct FcBootSource {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct FcDrive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct FcNetworkInterface {
    iface_id: String,
    guest_mac: String,
    host_dev_name: String,
}

#[derive(Debug, Serialize)]
struct FcAction {
    action_type: &'static str,
}

#[derive(Debug, Serialize)]
struct FcVmState {
    state: &'static str,
}

/// Stateless REST client over the supervisor's Unix socket.
#[derive(Clone)]
pub struct Firecracker {
    socket_path: PathBuf,
    client: hyper::Client<hyperlocal::UnixConnector>,
}

impl Firecracker {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: hyper::Client::unix(),
        }
    }

    fn build_uri(&self, endpoint: &str) -> hyper::Uri {
        UnixUri::new(&self.socket_path, endpoint).into()
    }

    async fn request<B: Serialize>(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: &B,
    ) -> Result<(), SupervisorError> {
        let body = serde_json::to_string(body)?;

        trace!(endpoint, body = %body, "supervisor request");

        let req = hyper::Request::builder()
            .method(method)
            .uri(self.build_uri(endpoint))
            .header("Content-Type", "application/json")
            .body(hyper::Body::from(body))
            .map_err(|e| SupervisorError::Communication(e.to_string()))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| SupervisorError::Communication(e.to_string()))?;

        if !resp.status().is_success() {
            let bytes = hyper::body::to_bytes(resp.into_body())
                .await
                .map_err(|e| SupervisorError::Communication(e.to_string()))?;
            return Err(SupervisorError::Api {
                endpoint: endpoint.to_string(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(())
    }

    async fn put<B: Serialize>(&self, endpoint: &str, body: &B) -> Result<(), SupervisorError> {
        self.request(hyper::Method::PUT, endpoint, body).await
    }

    async fn patch<B: Serialize>(&self, endpoint: &str, body: &B) -> Result<(), SupervisorError> {
        self.request(hyper::Method::PATCH, endpoint, body).await
    }
}

impl MicroVm for Firecracker {
    async fn configure(&self, def: &VmDefinition) -> Result<(), SupervisorError> {
        self.put(
            "/machine-config",
            &FcMachineConfig {
                vcpu_count: def.vcpu_count,
                mem_size_mib: def.ram_mib,
                smt: false,
            },
        )
        .await?;

        self.put(
            "/boot-source",
            &FcBootSource {
                kernel_image_path: def.kernel_path.clone(),
                boot_args: def.boot_args.clone(),
            },
        )
        .await?;

        self.put(
            "/drives/root",
            &FcDrive {
                drive_id: "root".into(),
                path_on_host: def.root_drive.clone(),
                is_root_device: true,
                is_read_only: true,
            },
        )
        .await?;

        self.put(
            "/drives/overlay",
            &FcDrive {
                drive_id: "overlay".into(),
                path_on_host: def.overlay_drive.clone(),
                is_root_device: false,
                is_read_only: false,
            },
        )
        .await?;

        self.put(
            "/network-interfaces/net1",
            &FcNetworkInterface {
                iface_id: "net1".into(),
                guest_mac: def.mac.clone(),
                host_dev_name: def.tap.clone(),
            },
        )
        .await?;

        Ok(())
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        self.put(
            "/actions",
            &FcAction {
                action_type: "InstanceStart",
            },
        )
        .await
    }

    async fn pause(&self) -> Result<(), SupervisorError> {
        self.patch("/vm", &FcVmState { state: "Paused" }).await
    }

    async fn resume(&self) -> Result<(), SupervisorError> {
        self.patch("/vm", &FcVmState { state: "Resumed" }).await
    }
}

pub struct FirecrackerProcess {
    child: tokio::process::Child,
    socket_path: PathBuf,
}

impl VmProcess for FirecrackerProcess {
    async fn kill(&mut self) -> Result<(), SupervisorError> {
        self.child.kill().await?;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), SupervisorError> {
        // the socket may already be gone
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        Ok(())
    }
}

pub struct FirecrackerBackend {
    output_dir: PathBuf,
}

impl FirecrackerBackend {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

/// Unique socket path per VM: pid + name + a random suffix, in the system
/// temp directory.
fn socket_path(name: &str) -> PathBuf {
    let filename = format!(
        ".firecracker.sock-{}-{}-{}",
        std::process::id(),
        name,
        rand::thread_rng().gen_range(0..1000)
    );

    std::env::temp_dir().join(filename)
}

async fn wait_for_socket(path: &Path) -> Result<(), SupervisorError> {
    for _ in 0..200 {
        if tokio::fs::metadata(path).await.is_ok() {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }

    Err(SupervisorError::SocketTimeout(path.to_path_buf()))
}

impl SupervisorBackend for FirecrackerBackend {
    type Vm = Firecracker;
    type Process = FirecrackerProcess;

    async fn spawn(
        &self,
        name: &str,
    ) -> Result<(Firecracker, FirecrackerProcess, PathBuf), SupervisorError> {
        let socket = socket_path(name);

        let _ = tokio::fs::remove_file(&socket).await;

        let stdout = std::fs::File::create(self.output_dir.join(format!("{name}.out")))?;
        let stderr = std::fs::File::create(self.output_dir.join(format!("{name}.err")))?;

        let child = tokio::process::Command::new("firecracker")
            .arg("--api-sock")
            .arg(&socket)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;

        wait_for_socket(&socket).await?;

        let client = Firecracker::new(&socket);
        let process = FirecrackerProcess {
            child,
            socket_path: socket.clone(),
        };

        Ok((client, process, socket))
    }
}
