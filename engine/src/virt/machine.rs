//! Per-machine state: lifecycle, tap device, overlay disk, boot arguments.

use std::path::{Path, PathBuf};

use tracing::trace;

use crate::address::MachineNetwork;
use crate::cmd::{self, CommandError};
use crate::host::{OUTPUT_PATH, ROOT_PATH};
use crate::orchestrator::MachineConfig;
use crate::virt::supervisor::{MicroVm, SupervisorBackend, VmDefinition};
use crate::virt::VirtError;

/// Interface name inside the guest.
pub const GUEST_INTERFACE: &str = "eth0";

/// Netmask of the per-machine /30, in dotted form for the kernel `ip=`
/// parameter.
const GUEST_NETMASK: &str = "255.255.255.252";

// see: https://www.kernel.org/doc/html/latest/admin-guide/kernel-parameters.html
const BOOT_PARAMS_BASE: &str = "init=/sbin/ceinit ro console=ttyS0 noapic acpi=off \
reboot=k panic=1 random.trust_cpu=on pci=off tsc=reliable quiet ipv6.disable=1 \
nomodule overlay_root=vdb loglevel=3 i8042.noaux i8042.nomux i8042.nopnp i8042.dumbkbd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Registered,
    Started,
    Stopped,
    Killed,
}

/// Handle to a running supervisor and its per-VM client.
pub struct VmHandle<S: SupervisorBackend> {
    pub client: S::Vm,
    pub process: S::Process,
    #[allow(dead_code)]
    pub socket_path: PathBuf,
}

pub struct Machine<S: SupervisorBackend> {
    /// Used only for log paths and diagnostics.
    pub name: String,
    pub state: MachineState,
    pub config: MachineConfig,
    pub network: MachineNetwork,
    /// Present after the machine was started for the first time.
    pub vm: Option<VmHandle<S>>,
}

impl<S: SupervisorBackend> Machine<S> {
    pub fn new(name: String, config: MachineConfig, network: MachineNetwork) -> Self {
        Self {
            name,
            state: MachineState::Registered,
            config,
            network,
            vm: None,
        }
    }

    /// Create the guest-facing tap. Wipes a stale device of the same name
    /// first; errors during the wipe are irrelevant.
    pub async fn create_network(&self) -> Result<(), CommandError> {
        trace!(ip = %self.network.ip, "creating network");

        let _ = remove_network_device(&self.network.tap).await;

        create_network_device(&self.network).await
    }

    /// Remove the tap. Errors are ignored, the device may be gone already.
    pub async fn remove_network(&self) {
        let _ = remove_network_device(&self.network.tap).await;
    }

    /// Kernel command line: fixed prefix, guest IP configuration, then
    /// whatever the driver configured on top.
    pub fn boot_args(&self) -> String {
        let mut args = format!(
            "{} ip={}::{}:{}::{}:off:{}",
            BOOT_PARAMS_BASE,
            self.network.ip,
            self.network.gateway,
            GUEST_NETMASK,
            GUEST_INTERFACE,
            self.network.gateway,
        );

        for param in &self.config.boot_params {
            args.push(' ');
            args.push_str(param);
        }

        args
    }

    fn overlay_path(&self) -> PathBuf {
        Path::new(ROOT_PATH).join(format!("ce{}.ext4", self.name))
    }

    /// First start: overlay disk, supervisor process, full configuration,
    /// boot.
    pub async fn boot(&mut self, backend: &S) -> Result<(), VirtError> {
        let overlay = self.overlay_path();
        let overlay_str = overlay.to_string_lossy().into_owned();

        // sparse overlay of the configured size, ext4-formatted
        let of = format!("of={overlay_str}");
        let count = format!("count={}", self.config.disk_mib);
        cmd::run(
            "dd",
            &["if=/dev/zero", &of, "conv=sparse", "bs=1M", &count],
        )
        .await?;

        cmd::run("mkfs.ext4", &[&overlay_str]).await?;

        let (client, process, socket_path) = backend
            .spawn(&self.name)
            .await
            .map_err(VirtError::Supervisor)?;

        let definition = VmDefinition {
            vcpu_count: self.config.vcpu_count,
            ram_mib: self.config.ram_mib,
            kernel_path: Path::new(ROOT_PATH)
                .join(&self.config.kernel)
                .to_string_lossy()
                .into_owned(),
            boot_args: self.boot_args(),
            root_drive: Path::new(ROOT_PATH)
                .join(&self.config.disk_image)
                .to_string_lossy()
                .into_owned(),
            overlay_drive: overlay_str,
            mac: self.network.mac.to_string(),
            tap: self.network.tap.clone(),
        };

        client
            .configure(&definition)
            .await
            .map_err(VirtError::Supervisor)?;
        client.start().await.map_err(VirtError::Supervisor)?;

        self.vm = Some(VmHandle {
            client,
            process,
            socket_path,
        });

        Ok(())
    }

    /// Where this machine's console output lands.
    #[allow(dead_code)]
    pub fn output_paths(&self) -> (PathBuf, PathBuf) {
        (
            Path::new(OUTPUT_PATH).join(format!("{}.out", self.name)),
            Path::new(OUTPUT_PATH).join(format!("{}.err", self.name)),
        )
    }
}

/// Derive the display name: driver-named machines (ground stations) get a
/// `gst-` prefix, everything else is `{group}-{id}`.
pub fn machine_name(group: u8, id: u32, name: Option<&str>) -> String {
    match name {
        Some(n) if !n.is_empty() => format!("gst-{n}"),
        _ => format!("{group}-{id}"),
    }
}

async fn create_network_device(network: &MachineNetwork) -> Result<(), CommandError> {
    let tap = network.tap.as_str();

    cmd::run("ip", &["tuntap", "add", tap, "mode", "tap"]).await?;

    // proxy ARP lets the host answer for every remote /30 the guest asks for
    let proxy_arp = format!("net.ipv4.conf.{tap}.proxy_arp=1");
    cmd::run("sysctl", &["-w", &proxy_arp]).await?;

    let disable_ipv6 = format!("net.ipv6.conf.{tap}.disable_ipv6=1");
    cmd::run("sysctl", &["-w", &disable_ipv6]).await?;

    let gateway = format!("{}/{}", network.gateway, network.subnet.prefix());
    cmd::run("ip", &["addr", "add", &gateway, "dev", tap]).await?;

    cmd::run("ip", &["link", "set", tap, "up"]).await?;

    Ok(())
}

async fn remove_network_device(tap: &str) -> Result<(), CommandError> {
    cmd::run("ip", &["link", "del", tap]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_derive_from_id_or_driver_name() {
        assert_eq!(machine_name(1, 4, None), "1-4");
        assert_eq!(machine_name(0, 2, Some("berlin")), "gst-berlin");
        assert_eq!(machine_name(0, 2, Some("")), "0-2");
    }
}
