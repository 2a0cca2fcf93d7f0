//! DNS façade for the synthetic `celestial.` TLD.
//!
//! UDP only, answers only A queries of the shapes
//! `{id}.{group}.celestial.` (satellites) and `{name}.gst.celestial.`
//! (ground stations), straight from the engine's query API. The wire
//! handling is deliberately minimal: one question, one answer, no
//! compression beyond the standard question-name pointer, TTL zero so
//! guests re-resolve as the constellation moves.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::orchestrator::{MachineId, Orchestrator, VirtualizationBackend};

const QTYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;

const RCODE_NXDOMAIN: u16 = 3;

pub async fn serve<V: VirtualizationBackend>(
    port: u16,
    orchestrator: Arc<Orchestrator<V>>,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    info!(port, "dns service listening");

    let mut buf = [0u8; 512];

    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;

        if let Some(response) = handle_query(&buf[..len], &orchestrator).await {
            let _ = socket.send_to(&response, peer).await;
        }
    }
}

struct Question {
    labels: Vec<String>,
    qtype: u16,
    qclass: u16,
    /// Raw question bytes, echoed verbatim into the response.
    raw: Vec<u8>,
}

fn parse_question(packet: &[u8]) -> Option<Question> {
    if packet.len() < 12 {
        return None;
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut pos = 12;
    let mut labels = Vec::new();

    loop {
        let len = *packet.get(pos)? as usize;
        pos += 1;

        if len == 0 {
            break;
        }

        // no compression in questions
        if len & 0xC0 != 0 {
            return None;
        }

        let label = packet.get(pos..pos + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += len;
    }

    let qtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
    let qclass = u16::from_be_bytes([*packet.get(pos + 2)?, *packet.get(pos + 3)?]);

    Some(Question {
        labels,
        qtype,
        qclass,
        raw: packet[12..pos + 4].to_vec(),
    })
}

/// `{id}.{group}.celestial` or `{name}.gst.celestial`.
async fn resolve_name<V: VirtualizationBackend>(
    labels: &[String],
    orchestrator: &Orchestrator<V>,
) -> Option<Ipv4Addr> {
    if labels.len() != 3 {
        return None;
    }

    if !labels[2].eq_ignore_ascii_case("celestial") {
        return None;
    }

    if labels[1].eq_ignore_ascii_case("gst") {
        return orchestrator
            .info_get_ip_address_by_name(&labels[0])
            .await
            .ok();
    }

    let group: u8 = labels[1].parse().ok()?;
    let id: u32 = labels[0].parse().ok()?;

    orchestrator
        .info_get_ip_address_by_id(MachineId { group, id })
        .ok()
}

async fn handle_query<V: VirtualizationBackend>(
    packet: &[u8],
    orchestrator: &Orchestrator<V>,
) -> Option<Vec<u8>> {
    let question = parse_question(packet)?;

    let id = [packet[0], packet[1]];
    let flags = u16::from_be_bytes([packet[2], packet[3]]);

    // only standard queries
    if (flags >> 11) & 0xF != 0 {
        return Some(build_response(id, flags, &question, None, 0));
    }

    if question.qtype != QTYPE_A || question.qclass != CLASS_IN {
        debug!(?question.labels, qtype = question.qtype, "unsupported query");
        return Some(build_response(id, flags, &question, None, 0));
    }

    match resolve_name(&question.labels, orchestrator).await {
        Some(ip) => {
            debug!(?question.labels, %ip, "resolved");
            Some(build_response(id, flags, &question, Some(ip), 0))
        }
        None => {
            debug!(?question.labels, "no address found");
            Some(build_response(id, flags, &question, None, RCODE_NXDOMAIN))
        }
    }
}

fn build_response(
    id: [u8; 2],
    query_flags: u16,
    question: &Question,
    answer: Option<Ipv4Addr>,
    rcode: u16,
) -> Vec<u8> {
    let flags = FLAG_RESPONSE
        | FLAG_AUTHORITATIVE
        | (query_flags & FLAG_RECURSION_DESIRED)
        | rcode;

    let ancount: u16 = answer.is_some() as u16;

    let mut out = Vec::with_capacity(12 + question.raw.len() + 16);
    out.extend_from_slice(&id);
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount
    out.extend_from_slice(&question.raw);

    if let Some(ip) = answer {
        out.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
        out.extend_from_slice(&QTYPE_A.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // ttl
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&ip.octets());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::mock::MockVirt;
    use crate::orchestrator::{Host, MachineConfig, MachineRegistration};

    fn query(name: &str, qtype: u16) -> Vec<u8> {
        let mut out = vec![
            0x12, 0x34, // id
            0x01, 0x00, // standard query, recursion desired
            0x00, 0x01, // one question
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        for label in name.split('.').filter(|l| !l.is_empty()) {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);

        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());

        out
    }

    async fn orchestrator() -> Arc<Orchestrator<MockVirt>> {
        let (virt, _) = MockVirt::new();
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(virt)));
        orchestrator.set_host(Host(0)).unwrap();

        let config = MachineConfig {
            vcpu_count: 1,
            ram_mib: 128,
            disk_mib: 256,
            disk_image: "rootfs.img".into(),
            kernel: "vmlinux.bin".into(),
            boot_params: vec![],
        };

        orchestrator
            .initialize(vec![
                MachineRegistration {
                    id: MachineId { group: 1, id: 1 },
                    host: Host(0),
                    config: config.clone(),
                    name: None,
                },
                MachineRegistration {
                    id: MachineId { group: 0, id: 0 },
                    host: Host(0),
                    config,
                    name: Some("station".into()),
                },
            ])
            .await
            .unwrap();

        orchestrator
    }

    fn answer_ip(response: &[u8]) -> Option<Ipv4Addr> {
        let ancount = u16::from_be_bytes([response[6], response[7]]);
        if ancount == 0 {
            return None;
        }
        let tail = &response[response.len() - 4..];
        Some(Ipv4Addr::new(tail[0], tail[1], tail[2], tail[3]))
    }

    #[tokio::test]
    async fn satellite_names_resolve() {
        let orchestrator = orchestrator().await;

        let response = handle_query(&query("1.1.celestial.", QTYPE_A), &orchestrator)
            .await
            .unwrap();

        assert_eq!(answer_ip(&response), Some(Ipv4Addr::new(10, 1, 0, 6)));
        // response flag set, rcode clear
        assert_eq!(response[2] & 0x80, 0x80);
        assert_eq!(response[3] & 0x0F, 0);
    }

    #[tokio::test]
    async fn ground_station_names_resolve() {
        let orchestrator = orchestrator().await;

        let response = handle_query(&query("station.gst.celestial.", QTYPE_A), &orchestrator)
            .await
            .unwrap();

        assert_eq!(answer_ip(&response), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[tokio::test]
    async fn unknown_names_get_nxdomain() {
        let orchestrator = orchestrator().await;

        let response = handle_query(&query("nowhere.gst.celestial.", QTYPE_A), &orchestrator)
            .await
            .unwrap();

        assert_eq!(answer_ip(&response), None);
        assert_eq!(response[3] & 0x0F, RCODE_NXDOMAIN as u8);
    }

    #[tokio::test]
    async fn foreign_tlds_are_not_answered() {
        let orchestrator = orchestrator().await;

        let response = handle_query(&query("example.com.", QTYPE_A), &orchestrator)
            .await
            .unwrap();

        assert_eq!(answer_ip(&response), None);
    }

    #[tokio::test]
    async fn non_a_queries_get_empty_answers() {
        let orchestrator = orchestrator().await;

        let response = handle_query(&query("1.1.celestial.", 28), &orchestrator)
            .await
            .unwrap();

        assert_eq!(answer_ip(&response), None);
        assert_eq!(response[3] & 0x0F, 0);
    }

    #[test]
    fn truncated_packets_are_dropped() {
        assert!(parse_question(&[0x12, 0x34, 0x01]).is_none());
        assert!(parse_question(&query("1.1.celestial.", QTYPE_A)[..14]).is_none());
    }
}
