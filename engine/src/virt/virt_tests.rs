#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use crate::address::{self, Ipv4Net};
    use crate::netem::mock::{MockEmulation, MockEmulationTracker};
    use crate::orchestrator::{Host, MachineConfig, MachineId, VirtualizationBackend};
    use crate::virt::machine::{Machine, MachineState, VmHandle};
    use crate::virt::mock::{MockPeering, MockPeeringTracker, MockSupervisor, MockSupervisorTracker};
    use crate::virt::supervisor::SupervisorBackend;
    use crate::virt::Virt;

    type TestVirt = Virt<MockPeering, MockEmulation, MockSupervisor>;

    fn mid(group: u8, id: u32) -> MachineId {
        MachineId { group, id }
    }

    fn test_config() -> MachineConfig {
        MachineConfig {
            vcpu_count: 2,
            ram_mib: 256,
            disk_mib: 512,
            disk_image: "rootfs.img".to_string(),
            kernel: "vmlinux.bin".to_string(),
            boot_params: vec!["loglevel=7".to_string()],
        }
    }

    fn test_virt() -> (
        TestVirt,
        MockPeeringTracker,
        MockEmulationTracker,
        MockSupervisorTracker,
    ) {
        let (peering, peering_tracker) = MockPeering::new(Host(0));
        let (netem, netem_tracker) = MockEmulation::new();
        let (supervisor, supervisor_tracker) = MockSupervisor::new();

        (
            Virt::new(Arc::new(peering), Arc::new(netem), supervisor),
            peering_tracker,
            netem_tracker,
            supervisor_tracker,
        )
    }

    /// Insert a machine as if it had been registered and started, without
    /// touching taps or disks.
    async fn insert_machine(virt: &TestVirt, id: MachineId, state: MachineState) {
        let (backend, _) = MockSupervisor::new();

        let mut m = Machine::new(
            format!("{}-{}", id.group, id.id),
            test_config(),
            address::plan(id).unwrap(),
        );

        if state != MachineState::Registered {
            let (client, process, socket_path) = backend.spawn(&m.name).await.unwrap();
            m.vm = Some(VmHandle {
                client,
                process,
                socket_path,
            });
            m.state = state;
        }

        virt.machines
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(m)));
    }

    // ─── Registration ──────────────────────────────────────────────────

    #[tokio::test]
    async fn remote_machines_are_routed_not_created() {
        let (virt, peering_tracker, netem_tracker, supervisor_tracker) = test_virt();

        virt.register_machine(mid(1, 1), None, Host(1), test_config())
            .await
            .unwrap();

        // only an overlay route, no tap, no emulation record, no supervisor
        let routes = peering_tracker.routes.lock().unwrap().clone();
        assert_eq!(
            routes,
            vec![(
                Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 4), 30),
                Host(1)
            )]
        );
        assert_eq!(netem_tracker.register_count(), 0);
        assert_eq!(supervisor_tracker.spawn_count(), 0);
        assert!(virt.machines.read().await.is_empty());
    }

    #[tokio::test]
    async fn link_operations_for_unknown_sources_are_discarded() {
        let (virt, _, netem_tracker, _) = test_virt();

        // no machine registered at all: every op is a silent no-op
        virt.block_link(mid(1, 0), mid(1, 1)).await.unwrap();
        virt.unblock_link(mid(1, 0), mid(1, 1)).await.unwrap();
        virt.set_latency(mid(1, 0), mid(1, 1), 1_000).await.unwrap();
        virt.set_bandwidth(mid(1, 0), mid(1, 1), 10_000).await.unwrap();

        assert_eq!(netem_tracker.block_count(), 0);
        assert_eq!(netem_tracker.unblock_count(), 0);
        assert_eq!(netem_tracker.latency_count(), 0);
        assert_eq!(netem_tracker.bandwidth_count(), 0);
    }

    #[tokio::test]
    async fn link_operations_use_the_target_slash_30() {
        let (virt, _, netem_tracker, _) = test_virt();
        insert_machine(&virt, mid(1, 0), MachineState::Registered).await;

        virt.block_link(mid(1, 0), mid(1, 1)).await.unwrap();

        let blocked = netem_tracker.blocked.lock().unwrap().clone();
        let target = Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 4), 30);
        assert_eq!(blocked.get(&(mid(1, 0), target)), Some(&true));
    }

    // ─── Transitions ───────────────────────────────────────────────────

    #[tokio::test]
    async fn started_machines_pause_and_resume() {
        let (virt, _, _, _) = test_virt();
        insert_machine(&virt, mid(1, 0), MachineState::Started).await;

        virt.stop_machine(mid(1, 0)).await.unwrap();
        virt.start_machine(mid(1, 0)).await.unwrap();

        let entry = virt.machines.read().await.get(&mid(1, 0)).cloned().unwrap();
        let m = entry.lock().await;
        assert_eq!(m.state, MachineState::Started);
    }

    #[tokio::test]
    async fn stopping_a_registered_machine_keeps_it_bootable() {
        let (virt, _, _, supervisor_tracker) = test_virt();
        insert_machine(&virt, mid(1, 0), MachineState::Registered).await;

        virt.stop_machine(mid(1, 0)).await.unwrap();

        let entry = virt.machines.read().await.get(&mid(1, 0)).cloned().unwrap();
        let m = entry.lock().await;
        // still registered, so a later start boots it for the first time
        assert_eq!(m.state, MachineState::Registered);
        assert_eq!(supervisor_tracker.pause_count(), 0);
    }

    #[tokio::test]
    async fn transitions_for_unknown_machines_are_no_ops() {
        let (virt, _, _, _) = test_virt();

        virt.start_machine(mid(7, 7)).await.unwrap();
        virt.stop_machine(mid(7, 7)).await.unwrap();
    }

    // ─── Teardown ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn stop_kills_machines_then_backends() {
        let (virt, peering_tracker, netem_tracker, _) = test_virt();
        insert_machine(&virt, mid(1, 0), MachineState::Started).await;
        insert_machine(&virt, mid(1, 1), MachineState::Stopped).await;
        insert_machine(&virt, mid(1, 2), MachineState::Registered).await;

        virt.stop().await.unwrap();

        for id in [mid(1, 0), mid(1, 1)] {
            let entry = virt.machines.read().await.get(&id).cloned().unwrap();
            let m = entry.lock().await;
            assert_eq!(m.state, MachineState::Killed);
        }

        // a never-started machine has no supervisor to kill
        let entry = virt.machines.read().await.get(&mid(1, 2)).cloned().unwrap();
        let m = entry.lock().await;
        assert_eq!(m.state, MachineState::Registered);

        assert_eq!(netem_tracker.stop_count(), 1);
        assert_eq!(peering_tracker.stops.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    // ─── Boot arguments ────────────────────────────────────────────────

    #[test]
    fn boot_args_carry_ip_configuration_and_extras() {
        let m: Machine<MockSupervisor> = Machine::new(
            "1-0".to_string(),
            test_config(),
            address::plan(mid(1, 0)).unwrap(),
        );

        let args = m.boot_args();

        assert!(args.starts_with("init=/sbin/ceinit"));
        assert!(args.contains("ip=10.1.0.2::10.1.0.1:255.255.255.252::eth0:off:10.1.0.1"));
        assert!(args.ends_with("loglevel=7"));
    }
}
