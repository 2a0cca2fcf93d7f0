//! The deterministic address plan.
//!
//! Every machine gets its own /30 derived from its identifier, so identity
//! and addressing can be converted in both directions without any lookup
//! table. Group is limited to 8 bits and ID to 14 bits because of IPv4: the
//! network is `10.[group].[id>>6 & 0xFF].[id<<2 & 0xFF]/30`, which leaves
//! network + 1 as the gateway IP and network + 2 as the guest IP. The limit
//! also keeps the tap device name under the kernel's 14-character cap.
//! Ground stations are group 0, satellite shells start at 1.

use std::fmt;
use std::net::Ipv4Addr;

use crate::orchestrator::MachineId;

/// Largest machine ID the /30 plan can represent (14 bits).
pub const MAX_ID: u32 = 16_384;

#[derive(Debug)]
pub enum AddressError {
    IdOutOfRange(u32),
    NotInRange(Ipv4Addr),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::IdOutOfRange(id) => {
                write!(f, "id {id} is larger than permitted {MAX_ID}")
            }
            AddressError::NotInRange(ip) => {
                write!(f, "could not resolve address {ip} (not in 10.0.0.0/8)")
            }
        }
    }
}

impl std::error::Error for AddressError {}

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// All member addresses of the network, network and broadcast included.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.addr);
        let count = 1u64 << (32 - self.prefix);
        (0..count).map(move |i| Ipv4Addr::from(base + i as u32))
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// A hardware address in the locally-administered `aa:ce` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr([u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// The complete network allocation for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineNetwork {
    /// The machine's /30.
    pub subnet: Ipv4Net,
    /// Host-side address on the tap (network + 1).
    pub gateway: Ipv4Addr,
    /// Guest address (network + 2).
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    /// Canonical tap device name, `ct-{group}-{id}`.
    pub tap: String,
}

/// Compute the network allocation for a machine identifier.
pub fn plan(id: MachineId) -> Result<MachineNetwork, AddressError> {
    if id.id > MAX_ID {
        return Err(AddressError::IdOutOfRange(id.id));
    }

    let third = ((id.id >> 6) & 0xFF) as u8;
    let fourth = ((id.id << 2) & 0xFF) as u8;

    let mac_id = id.id + 2;

    Ok(MachineNetwork {
        subnet: Ipv4Net::new(Ipv4Addr::new(10, id.group, third, fourth), 30),
        gateway: Ipv4Addr::new(10, id.group, third, fourth + 1),
        ip: Ipv4Addr::new(10, id.group, third, fourth + 2),
        mac: MacAddr([
            0xAA,
            0xCE,
            id.group,
            0x00,
            ((mac_id >> 8) & 0xFF) as u8,
            (mac_id & 0xFF) as u8,
        ]),
        tap: format!("ct-{}-{}", id.group, id.id),
    })
}

/// Recover a machine identifier from any address inside its /30.
pub fn resolve(ip: Ipv4Addr) -> Result<MachineId, AddressError> {
    let o = ip.octets();

    if o[0] != 10 {
        return Err(AddressError::NotInRange(ip));
    }

    Ok(MachineId {
        group: o[1],
        id: ((o[2] as u32) << 6) | ((o[3] as u32) >> 2),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(group: u8, id: u32) -> MachineId {
        MachineId { group, id }
    }

    #[test]
    fn plan_small_id() {
        let n = plan(mid(1, 1)).unwrap();
        assert_eq!(n.subnet, Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 4), 30));
        assert_eq!(n.gateway, Ipv4Addr::new(10, 1, 0, 5));
        assert_eq!(n.ip, Ipv4Addr::new(10, 1, 0, 6));
        assert_eq!(n.mac.to_string(), "aa:ce:01:00:00:03");
        assert_eq!(n.tap, "ct-1-1");
    }

    #[test]
    fn plan_id_zero() {
        let n = plan(mid(1, 0)).unwrap();
        assert_eq!(n.subnet, Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 0), 30));
        assert_eq!(n.ip, Ipv4Addr::new(10, 1, 0, 2));
        assert_eq!(n.tap, "ct-1-0");
    }

    #[test]
    fn plan_mid_group() {
        let n = plan(mid(4, 17)).unwrap();
        assert_eq!(n.subnet, Ipv4Net::new(Ipv4Addr::new(10, 4, 0, 68), 30));
        assert_eq!(n.gateway, Ipv4Addr::new(10, 4, 0, 69));
        assert_eq!(n.ip, Ipv4Addr::new(10, 4, 0, 70));
        assert_eq!(n.mac.to_string(), "aa:ce:04:00:00:13");
        assert_eq!(n.tap, "ct-4-17");
    }

    #[test]
    fn plan_large_id() {
        let n = plan(mid(1, 1385)).unwrap();
        assert_eq!(n.subnet, Ipv4Net::new(Ipv4Addr::new(10, 1, 21, 164), 30));
        assert_eq!(n.gateway, Ipv4Addr::new(10, 1, 21, 165));
        assert_eq!(n.ip, Ipv4Addr::new(10, 1, 21, 166));
    }

    #[test]
    fn plan_rejects_out_of_range() {
        assert!(plan(mid(1, 16_385)).is_err());
        assert!(plan(mid(1, MAX_ID)).is_ok());
    }

    #[test]
    fn resolve_rejects_foreign_ranges() {
        assert!(resolve(Ipv4Addr::new(192, 168, 50, 2)).is_err());
        assert!(resolve(Ipv4Addr::new(11, 0, 0, 1)).is_err());
    }

    #[test]
    fn resolve_is_inverse_of_plan() {
        for group in [0u8, 1, 4, 107, 255] {
            for id in [0u32, 1, 17, 63, 64, 1385, 8_191, 16_383] {
                let m = mid(group, id);
                let n = plan(m).unwrap();
                assert_eq!(resolve(n.ip).unwrap(), m, "guest ip of {m}");
                assert_eq!(resolve(n.gateway).unwrap(), m, "gateway of {m}");
                assert_eq!(resolve(n.subnet.addr()).unwrap(), m, "base of {m}");
            }
        }
    }

    #[test]
    fn subnet_addresses_enumerate_the_slash_30() {
        let n = plan(mid(1, 1)).unwrap();
        let addrs: Vec<_> = n.subnet.addresses().collect();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(10, 1, 0, 4),
                Ipv4Addr::new(10, 1, 0, 5),
                Ipv4Addr::new(10, 1, 0, 6),
                Ipv4Addr::new(10, 1, 0, 7),
            ]
        );
    }
}
