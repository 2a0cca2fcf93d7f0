//! eBPF emulation backend.
//!
//! Attaches a single egress program to every registered tap (clsact hook,
//! with an fq root qdisc so the kernel honors the departure timestamps the
//! program sets). The program looks the packet's source address up in a
//! per-source hash map `ip -> (throttle-kbps, delay-us)` and paces/delays
//! accordingly. Operations here only write map entries; the heavy lifting
//! happens in the kernel.
//!
//! The program object is compiled by `build.rs` and embedded; loading and
//! attachment go through libbpf.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::address::Ipv4Net;
use crate::cmd::{self, CommandError};
use crate::netem::{NetworkEmulationBackend, DEFAULT_BANDWIDTH_KBPS, DEFAULT_LATENCY_US};
use crate::orchestrator::MachineId;

/// Shaping sentinel for blocked links: rate 0 drops every packet.
const BLOCKED_BANDWIDTH_KBPS: u32 = 0;
/// Delay sentinel for blocked links.
const BLOCKED_LATENCY_US: u32 = 1_000_000_000;

const PROGRAM_NAME: &str = "tc_main";
const MAP_NAME: &str = "IP_HANDLE_KBPS_DELAY";

static BPF_OBJECT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/edt.bpf.o"));

#[derive(Debug)]
pub enum BpfError {
    /// The embedded program object is empty (built without clang).
    ObjectUnavailable,
    AlreadyRegistered(MachineId),
    UnknownMachine(MachineId),
    InterfaceNotFound(String),
    Load(String),
    Attach(String),
    MapUpdate(c_int),
    Command(CommandError),
}

impl fmt::Display for BpfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BpfError::ObjectUnavailable => {
                write!(f, "eBPF program object is empty, rebuild with clang available")
            }
            BpfError::AlreadyRegistered(id) => write!(f, "machine {id} already exists"),
            BpfError::UnknownMachine(id) => write!(f, "machine {id} does not exist"),
            BpfError::InterfaceNotFound(tap) => write!(f, "interface {tap} not found"),
            BpfError::Load(msg) => write!(f, "loading eBPF objects failed: {msg}"),
            BpfError::Attach(msg) => write!(f, "attaching eBPF program failed: {msg}"),
            BpfError::MapUpdate(rc) => write!(f, "eBPF map update failed: {rc}"),
            BpfError::Command(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BpfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BpfError::Command(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommandError> for BpfError {
    fn from(e: CommandError) -> Self {
        BpfError::Command(e)
    }
}

/// Map value layout, must match `struct handle_kbps_delay` in the program.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct HandleKbpsDelay {
    throttle_rate_kbps: u32,
    delay_us: u32,
}

/// Loaded program state for one tap. The raw object pointer is only ever
/// touched under the owning source mutex.
struct BpfHandle {
    obj: *mut libbpf_sys::bpf_object,
    map_fd: c_int,
}

unsafe impl Send for BpfHandle {}

impl BpfHandle {
    /// Load the embedded object and attach its egress program to the tap.
    fn load_and_attach(tap: &str) -> Result<Self, BpfError> {
        if BPF_OBJECT.is_empty() {
            return Err(BpfError::ObjectUnavailable);
        }

        let ifindex = {
            let name = CString::new(tap).map_err(|_| BpfError::InterfaceNotFound(tap.into()))?;
            let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
            if idx == 0 {
                return Err(BpfError::InterfaceNotFound(tap.into()));
            }
            idx as c_int
        };

        unsafe {
            let obj = libbpf_sys::bpf_object__open_mem(
                BPF_OBJECT.as_ptr() as *const c_void,
                BPF_OBJECT.len() as _,
                std::ptr::null(),
            );
            if obj.is_null() {
                return Err(BpfError::Load("bpf_object__open_mem returned null".into()));
            }

            if libbpf_sys::bpf_object__load(obj) != 0 {
                libbpf_sys::bpf_object__close(obj);
                return Err(BpfError::Load("bpf_object__load failed".into()));
            }

            let prog_name = CString::new(PROGRAM_NAME).unwrap();
            let prog = libbpf_sys::bpf_object__find_program_by_name(obj, prog_name.as_ptr());
            if prog.is_null() {
                libbpf_sys::bpf_object__close(obj);
                return Err(BpfError::Load(format!("program {PROGRAM_NAME} not found")));
            }
            let prog_fd = libbpf_sys::bpf_program__fd(prog);

            let map_name = CString::new(MAP_NAME).unwrap();
            let map = libbpf_sys::bpf_object__find_map_by_name(obj, map_name.as_ptr());
            if map.is_null() {
                libbpf_sys::bpf_object__close(obj);
                return Err(BpfError::Load(format!("map {MAP_NAME} not found")));
            }
            let map_fd = libbpf_sys::bpf_map__fd(map);

            // clsact hook on egress; EEXIST is fine, the qdisc may survive
            // from an earlier registration attempt.
            let mut hook: libbpf_sys::bpf_tc_hook = mem::zeroed();
            hook.sz = mem::size_of::<libbpf_sys::bpf_tc_hook>() as _;
            hook.ifindex = ifindex;
            hook.attach_point = libbpf_sys::BPF_TC_EGRESS;

            let rc = libbpf_sys::bpf_tc_hook_create(&mut hook);
            if rc != 0 && rc != -libc::EEXIST {
                libbpf_sys::bpf_object__close(obj);
                return Err(BpfError::Attach(format!("bpf_tc_hook_create: {rc}")));
            }

            let mut opts: libbpf_sys::bpf_tc_opts = mem::zeroed();
            opts.sz = mem::size_of::<libbpf_sys::bpf_tc_opts>() as _;
            opts.prog_fd = prog_fd;
            opts.handle = 1;
            opts.priority = 1;

            let rc = libbpf_sys::bpf_tc_attach(&hook, &mut opts);
            if rc != 0 {
                libbpf_sys::bpf_object__close(obj);
                return Err(BpfError::Attach(format!("bpf_tc_attach: {rc}")));
            }

            Ok(Self { obj, map_fd })
        }
    }

    fn update(&self, ip_key: u32, value: &HandleKbpsDelay) -> Result<(), BpfError> {
        let rc = unsafe {
            libbpf_sys::bpf_map_update_elem(
                self.map_fd,
                &ip_key as *const u32 as *const c_void,
                value as *const HandleKbpsDelay as *const c_void,
                libbpf_sys::BPF_ANY as u64,
            )
        };

        if rc != 0 {
            return Err(BpfError::MapUpdate(rc));
        }

        Ok(())
    }

    fn close(&mut self) {
        if !self.obj.is_null() {
            unsafe { libbpf_sys::bpf_object__close(self.obj) };
            self.obj = std::ptr::null_mut();
        }
    }
}

struct EbpfSource {
    tap: String,
    handle: BpfHandle,
    /// Retained shaping per target /30; blocked links keep their last
    /// values here while the map carries the drop sentinel.
    records: HashMap<Ipv4Net, HandleKbpsDelay>,
}

impl EbpfSource {
    fn record(&mut self, target: Ipv4Net) -> HandleKbpsDelay {
        *self.records.entry(target).or_insert(HandleKbpsDelay {
            throttle_rate_kbps: DEFAULT_BANDWIDTH_KBPS as u32,
            delay_us: DEFAULT_LATENCY_US,
        })
    }

    /// Write a value for every member address of the target /30. The map is
    /// keyed by the address exactly as it appears on the wire.
    fn put(&self, target: Ipv4Net, value: &HandleKbpsDelay) -> Result<(), BpfError> {
        for ip in target.addresses() {
            let key = u32::from_ne_bytes(ip.octets());
            self.handle.update(key, value)?;
        }
        Ok(())
    }
}

pub struct EbpfBackend {
    sources: RwLock<HashMap<MachineId, Arc<Mutex<EbpfSource>>>>,
}

impl EbpfBackend {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
        }
    }

    async fn source(&self, id: MachineId) -> Result<Arc<Mutex<EbpfSource>>, BpfError> {
        self.sources
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(BpfError::UnknownMachine(id))
    }
}

impl Default for EbpfBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkEmulationBackend for EbpfBackend {
    type Error = BpfError;

    async fn register(&self, id: MachineId, tap: &str) -> Result<(), BpfError> {
        if self.sources.read().await.contains_key(&id) {
            return Err(BpfError::AlreadyRegistered(id));
        }

        // fq honors skb departure timestamps, which is how both pacing and
        // delay are realized here.
        trace!(machine = %id, tap, "creating fq qdisc");
        cmd::run("tc", &["qdisc", "replace", "dev", tap, "root", "fq"]).await?;

        trace!(machine = %id, tap, "loading and attaching egress program");
        let handle = BpfHandle::load_and_attach(tap)?;

        self.sources.write().await.insert(
            id,
            Arc::new(Mutex::new(EbpfSource {
                tap: tap.to_string(),
                handle,
                records: HashMap::new(),
            })),
        );

        Ok(())
    }

    async fn set_bandwidth(
        &self,
        source: MachineId,
        target: Ipv4Net,
        bandwidth_kbps: u64,
    ) -> Result<(), BpfError> {
        let entry = self.source(source).await?;
        let mut src = entry.lock().await;

        let mut record = src.record(target);
        record.throttle_rate_kbps = bandwidth_kbps as u32;
        src.records.insert(target, record);

        trace!(tap = %src.tap, %target, bandwidth_kbps, "updating bandwidth");
        src.put(target, &record)
    }

    async fn set_latency(
        &self,
        source: MachineId,
        target: Ipv4Net,
        latency_us: u32,
    ) -> Result<(), BpfError> {
        let entry = self.source(source).await?;
        let mut src = entry.lock().await;

        let mut record = src.record(target);
        record.delay_us = latency_us;
        src.records.insert(target, record);

        trace!(tap = %src.tap, %target, latency_us, "updating latency");
        src.put(target, &record)
    }

    async fn block_link(&self, source: MachineId, target: Ipv4Net) -> Result<(), BpfError> {
        let entry = self.source(source).await?;
        let mut src = entry.lock().await;

        // Keep the retained record; only the map carries the sentinel.
        src.record(target);

        trace!(tap = %src.tap, %target, "blocking");
        src.put(
            target,
            &HandleKbpsDelay {
                throttle_rate_kbps: BLOCKED_BANDWIDTH_KBPS,
                delay_us: BLOCKED_LATENCY_US,
            },
        )
    }

    async fn unblock_link(&self, source: MachineId, target: Ipv4Net) -> Result<(), BpfError> {
        let entry = self.source(source).await?;
        let mut src = entry.lock().await;

        let record = src.record(target);

        trace!(tap = %src.tap, %target, "unblocking");
        src.put(target, &record)
    }

    async fn stop(&self) -> Result<(), BpfError> {
        debug!("closing all eBPF objects");

        let sources: Vec<_> = self.sources.write().await.drain().collect();

        for (id, entry) in sources {
            let mut src = entry.lock().await;
            trace!(machine = %id, tap = %src.tap, "closing eBPF object");
            src.handle.close();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn map_keys_follow_wire_byte_order() {
        let net = Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 4), 30);
        let keys: Vec<u32> = net
            .addresses()
            .map(|ip| u32::from_ne_bytes(ip.octets()))
            .collect();

        assert_eq!(keys.len(), 4);
        // the first octet sits in the lowest byte on little-endian hosts
        assert_eq!(
            keys[0].to_ne_bytes(),
            [10, 1, 0, 4],
            "key must preserve address byte order"
        );
    }
}
