//! Shared fixtures for the SMF scenario tests
//!
//! A recording PFCP transport, a fake UPF answering session requests, and a
//! logger capturing warnings so anomalies can be asserted on.

#![allow(dead_code)]

use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nextgcore_smfd::n4_build::{pfcp_ie, pfcp_type, PfcpCause, PfcpMessageBuilder};
use nextgcore_smfd::n4_handler::parse_f_seid;
use nextgcore_smfd::pfcp_path::{find_ie, parse_ies, PfcpHeader, PfcpTransport};
use nextgcore_smfd::{Collaborators, SmfConfig, SmfContext, SmfResult};

/// Offset between the SMF's SEID and the one the fake UPF hands back
pub const UPF_SEID_OFFSET: u64 = 0x1000;

pub const TWO_HOP_CONFIG: &str = r#"
smf:
  name: smf-test
  pfcp: { addr: 127.0.0.1, port: 8805, node_id: 10.200.200.1 }
  outcome_deadline_ms: 2000
user_plane:
  up_nodes:
    - name: gNB1
      type: AN
      an_ip: 192.168.1.10
    - name: I-UPF
      type: UPF
      node_id: 10.200.200.101
      snssai_infos:
        - snssai: { sst: 1, sd: "010203" }
          dnn_upf_info_list:
            - dnn: internet
      interfaces:
        - { interface_type: N3, endpoints: [10.200.200.101], network_instances: [internet] }
        - { interface_type: N9, endpoints: [10.200.201.101], network_instances: [internet] }
    - name: PSA-UPF
      type: UPF
      node_id: 10.200.200.102
      snssai_infos:
        - snssai: { sst: 1, sd: "010203" }
          dnn_upf_info_list:
            - dnn: internet
              dnai_list: [mec]
              pools: [{ cidr: 10.60.0.0/16 }]
      interfaces:
        - { interface_type: N9, endpoints: [10.200.201.102], network_instances: [internet] }
  links:
    - { a: gNB1, b: I-UPF }
    - { a: I-UPF, b: PSA-UPF }
route_profiles:
  MEC1: { forwarding_policy_id: "10" }
"#;

// ============================================================================
// Transport
// ============================================================================

/// Keeps every datagram the SMF sends
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
}

impl PfcpTransport for RecordingTransport {
    fn send(&self, peer: SocketAddr, datagram: Bytes) -> SmfResult<()> {
        self.sent.lock().unwrap().push((peer, datagram));
        Ok(())
    }
}

impl RecordingTransport {
    pub fn take(&self) -> Vec<(SocketAddr, PfcpHeader, Bytes)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
            .into_iter()
            .map(|(peer, data)| {
                let (header, body) = PfcpHeader::decode(&data).unwrap();
                (peer, header, body)
            })
            .collect()
    }
}

pub fn smf_context(yaml: &str, collaborators: Collaborators) -> (Arc<SmfContext>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let config = SmfConfig::from_str(yaml).unwrap();
    let smf = SmfContext::new(config, transport.clone(), collaborators).unwrap();
    (smf, transport)
}

// ============================================================================
// Fake UPF
// ============================================================================

fn is_session_request(message_type: u8) -> bool {
    matches!(
        message_type,
        pfcp_type::SESSION_ESTABLISHMENT_REQUEST
            | pfcp_type::SESSION_MODIFICATION_REQUEST
            | pfcp_type::SESSION_DELETION_REQUEST
    )
}

/// Response a UPF would send to one session request
pub fn upf_response(header: &PfcpHeader, body: &Bytes, cause: PfcpCause) -> Bytes {
    let establishment = header.message_type == pfcp_type::SESSION_ESTABLISHMENT_REQUEST;
    let local_seid = if establishment {
        let ies = parse_ies(body).unwrap();
        parse_f_seid(&find_ie(&ies, pfcp_ie::F_SEID).unwrap().value).unwrap().0
    } else {
        header.seid.unwrap() - UPF_SEID_OFFSET
    };
    let mut b = PfcpMessageBuilder::new();
    b.add_cause(cause);
    if establishment {
        b.add_f_seid(local_seid + UPF_SEID_OFFSET, Ipv4Addr::new(10, 200, 200, 1));
    }
    PfcpHeader::new(header.message_type + 1, Some(local_seid), header.sequence_number).encode(&b.build())
}

/// Wait for the SMF's session requests without answering them
pub async fn session_requests(transport: &RecordingTransport) -> Vec<(SocketAddr, PfcpHeader, Bytes)> {
    for _ in 0..400 {
        let requests: Vec<_> = transport
            .take()
            .into_iter()
            .filter(|(_, h, _)| is_session_request(h.message_type))
            .collect();
        if !requests.is_empty() {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no PFCP session request sent");
}

/// Answer every session request sent so far
pub async fn answer_upfs(smf: &Arc<SmfContext>, transport: &RecordingTransport, cause: PfcpCause) -> Vec<u8> {
    let requests = session_requests(transport).await;
    let types = requests.iter().map(|(_, h, _)| h.message_type).collect();
    for (peer, header, body) in requests {
        smf.handle_pfcp_datagram(peer, &upf_response(&header, &body, cause)).await;
    }
    types
}

// ============================================================================
// Log capture
// ============================================================================

struct CaptureLogger {
    records: Mutex<Vec<String>>,
}

impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.records.lock().unwrap().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static LOGGER: OnceLock<&'static CaptureLogger> = OnceLock::new();

fn logger() -> &'static CaptureLogger {
    LOGGER.get_or_init(|| {
        let logger: &'static CaptureLogger = Box::leak(Box::new(CaptureLogger {
            records: Mutex::new(Vec::new()),
        }));
        if log::set_logger(logger).is_ok() {
            log::set_max_level(log::LevelFilter::Warn);
        }
        logger
    })
}

/// Start capturing warnings and errors for this test binary
pub fn capture_logs() {
    logger();
}

/// Captured warnings and errors containing `needle`
pub fn captured(needle: &str) -> Vec<String> {
    logger()
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.contains(needle))
        .cloned()
        .collect()
}
