//! N4 (PFCP) Message Handler
//!
//! Entry point for every datagram received on the N4 socket. Session
//! responses are routed to their SM context by the SEID in the header;
//! node messages (association, heartbeat) only touch the UPF's status.

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::consumer::{N1N2Message, N2SmInfoType};
use crate::context::{SmfContext, UpCnxState};
use crate::n4_build::{self, pfcp_ie, pfcp_type, PfcpCause};
use crate::pfcp_path::{find_ie, parse_ies, PfcpHeader, PfcpIe};
use crate::topology::{UpIpResourceInfo, UpNode};

// ============================================================================
// SBI HTTP Status Codes
// ============================================================================

/// SBI HTTP Status codes
pub mod sbi_status {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const NO_CONTENT: u16 = 204;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const GATEWAY_TIMEOUT: u16 = 504;
}

/// HTTP status reported to the AMF for a PFCP cause
pub fn sbi_status_from_pfcp(cause: PfcpCause) -> u16 {
    match cause {
        PfcpCause::RequestAccepted => sbi_status::OK,
        PfcpCause::RequestRejected => sbi_status::FORBIDDEN,
        PfcpCause::SessionContextNotFound => sbi_status::NOT_FOUND,
        PfcpCause::MandatoryIeMissing
        | PfcpCause::ConditionalIeMissing
        | PfcpCause::InvalidLength
        | PfcpCause::MandatoryIeIncorrect
        | PfcpCause::InvalidForwardingPolicy
        | PfcpCause::InvalidFTeidAllocationOption
        | PfcpCause::RuleCreationModificationFailure
        | PfcpCause::PfcpEntityInCongestion
        | PfcpCause::NoResourcesAvailable => sbi_status::BAD_REQUEST,
        PfcpCause::NoEstablishedPfcpAssociation => sbi_status::GATEWAY_TIMEOUT,
        PfcpCause::ServiceNotSupported => sbi_status::SERVICE_UNAVAILABLE,
        PfcpCause::SystemFailure => sbi_status::INTERNAL_SERVER_ERROR,
    }
}

/// Downlink data report bit of the Report Type IE
const REPORT_TYPE_DLDR: u8 = 0x01;

// ============================================================================
// IE values
// ============================================================================

fn ie_cause(ies: &[PfcpIe]) -> PfcpCause {
    find_ie(ies, pfcp_ie::CAUSE)
        .and_then(|ie| ie.value.first().copied())
        .map(PfcpCause::from)
        .unwrap_or(PfcpCause::MandatoryIeMissing)
}

fn ie_u32(ies: &[PfcpIe], ie_type: u16) -> Option<u32> {
    let value = &find_ie(ies, ie_type)?.value;
    let raw: [u8; 4] = value.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

/// F-SEID: flags, SEID, then IPv4 when V4 is set
pub fn parse_f_seid(value: &[u8]) -> Option<(u64, Option<Ipv4Addr>)> {
    let flags = *value.first()?;
    let raw: [u8; 8] = value.get(1..9)?.try_into().ok()?;
    let ipv4 = if flags & 0x02 != 0 {
        let ip: [u8; 4] = value.get(9..13)?.try_into().ok()?;
        Some(Ipv4Addr::from(ip))
    } else {
        None
    };
    Some((u64::from_be_bytes(raw), ipv4))
}

/// Node ID of type IPv4
pub fn parse_node_id(value: &[u8]) -> Option<Ipv4Addr> {
    if *value.first()? != 0 {
        return None;
    }
    let ip: [u8; 4] = value.get(1..5)?.try_into().ok()?;
    Some(Ipv4Addr::from(ip))
}

/// User Plane IP Resource Information
pub fn parse_up_ip_resource_info(value: &[u8]) -> Option<UpIpResourceInfo> {
    let flags = *value.first()?;
    let v4 = flags & 0x01 != 0;
    let v6 = flags & 0x02 != 0;
    let teidri = (flags >> 2) & 0x07;
    let assoni = flags & 0x20 != 0;
    let assosi = flags & 0x40 != 0;

    let mut offset = 1;
    let mut info = UpIpResourceInfo::default();
    if teidri != 0 {
        info.teid_range = Some((teidri, *value.get(offset)?));
        offset += 1;
    }
    if v4 {
        let ip: [u8; 4] = value.get(offset..offset + 4)?.try_into().ok()?;
        info.ipv4 = Some(Ipv4Addr::from(ip));
        offset += 4;
    }
    if v6 {
        offset += 16;
    }
    if assoni {
        let end = if assosi { value.len().saturating_sub(1) } else { value.len() };
        let ni = value.get(offset..end)?;
        if !ni.is_empty() {
            info.network_instance = Some(String::from_utf8_lossy(ni).into_owned());
        }
    }
    Some(info)
}

// ============================================================================
// Dispatch
// ============================================================================

impl SmfContext {
    /// Handle one datagram from the N4 socket
    pub async fn handle_pfcp_datagram(self: &Arc<Self>, peer: SocketAddr, data: &[u8]) {
        let (header, body) = match PfcpHeader::decode(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Malformed PFCP message from {}: {}", peer, e);
                return;
            }
        };
        let ies = match parse_ies(&body) {
            Ok(ies) => ies,
            Err(e) => {
                log::warn!(
                    "Malformed {} from {}: {}",
                    pfcp_type::name(header.message_type),
                    peer,
                    e
                );
                return;
            }
        };
        log::debug!(
            "{} from {} (seq={}, seid={:?})",
            pfcp_type::name(header.message_type),
            peer,
            header.sequence_number,
            header.seid
        );

        match header.message_type {
            pfcp_type::HEARTBEAT_REQUEST => self.handle_heartbeat_request(peer, &header),
            pfcp_type::HEARTBEAT_RESPONSE => self.handle_heartbeat_response(peer, &header, &ies),
            pfcp_type::ASSOCIATION_SETUP_REQUEST => {
                self.handle_association_setup_request(peer, &header, &ies)
            }
            pfcp_type::ASSOCIATION_SETUP_RESPONSE => {
                self.handle_association_setup_response(peer, &header, &ies)
            }
            pfcp_type::ASSOCIATION_RELEASE_REQUEST => {
                self.handle_association_release_request(peer, &header, &ies)
            }
            pfcp_type::SESSION_ESTABLISHMENT_RESPONSE
            | pfcp_type::SESSION_MODIFICATION_RESPONSE
            | pfcp_type::SESSION_DELETION_RESPONSE => self.handle_session_response(&header, &ies),
            pfcp_type::SESSION_REPORT_REQUEST => {
                self.handle_session_report_request(peer, &header, &ies).await
            }
            other => log::warn!("Not implemented PFCP message type {} from {}", other, peer),
        }
    }

    /// Resolve the sending UPF from the Node ID IE, or the source address
    fn sending_node(&self, peer: SocketAddr, ies: &[PfcpIe]) -> Option<Arc<UpNode>> {
        let node_id = find_ie(ies, pfcp_ie::NODE_ID).and_then(|ie| parse_node_id(&ie.value));
        let peer_ip = match peer.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        };
        node_id
            .or(peer_ip)
            .and_then(|ip| self.topology.node_by_id(ip))
    }

    fn respond(&self, peer: SocketAddr, message_type: u8, seid: Option<u64>, seq: u32, body: Bytes) {
        if let Err(e) = self.exchange.send_response(peer, message_type, seid, seq, body) {
            log::error!("{} to {} failed: {}", pfcp_type::name(message_type), peer, e);
        }
    }

    // ------------------------------------------------------------------------
    // Node messages
    // ------------------------------------------------------------------------

    fn handle_heartbeat_request(&self, peer: SocketAddr, header: &PfcpHeader) {
        self.respond(
            peer,
            pfcp_type::HEARTBEAT_RESPONSE,
            None,
            header.sequence_number,
            n4_build::build_heartbeat_response(self.recovery_time_stamp),
        );
    }

    fn handle_heartbeat_response(self: &Arc<Self>, peer: SocketAddr, header: &PfcpHeader, ies: &[PfcpIe]) {
        self.exchange.complete(header.sequence_number);
        match self.sending_node(peer, ies) {
            Some(node) => self.heartbeat_answered(&node),
            None => log::warn!("Heartbeat response from unknown peer {}", peer),
        }
    }

    fn handle_association_setup_request(
        self: &Arc<Self>,
        peer: SocketAddr,
        header: &PfcpHeader,
        ies: &[PfcpIe],
    ) {
        let Some(node) = self.sending_node(peer, ies) else {
            log::warn!("Association setup request from unknown UPF {}", peer);
            self.respond(
                peer,
                pfcp_type::ASSOCIATION_SETUP_RESPONSE,
                None,
                header.sequence_number,
                n4_build::build_association_setup_response(
                    self.exchange.node_id(),
                    PfcpCause::RequestRejected,
                    self.recovery_time_stamp,
                ),
            );
            return;
        };

        let up_ip = find_ie(ies, pfcp_ie::USER_PLANE_IP_RESOURCE_INFORMATION)
            .and_then(|ie| parse_up_ip_resource_info(&ie.value));
        let recovery = ie_u32(ies, pfcp_ie::RECOVERY_TIME_STAMP);
        self.association_established(&node, up_ip, recovery);

        self.respond(
            peer,
            pfcp_type::ASSOCIATION_SETUP_RESPONSE,
            None,
            header.sequence_number,
            n4_build::build_association_setup_response(
                self.exchange.node_id(),
                PfcpCause::RequestAccepted,
                self.recovery_time_stamp,
            ),
        );
    }

    fn handle_association_setup_response(
        self: &Arc<Self>,
        peer: SocketAddr,
        header: &PfcpHeader,
        ies: &[PfcpIe],
    ) {
        self.exchange.complete(header.sequence_number);
        let Some(node) = self.sending_node(peer, ies) else {
            log::warn!("Association setup response from unknown UPF {}", peer);
            return;
        };

        let cause = ie_cause(ies);
        if !cause.is_accepted() {
            self.association_rejected(&node, cause as u8);
            return;
        }
        let up_ip = find_ie(ies, pfcp_ie::USER_PLANE_IP_RESOURCE_INFORMATION)
            .and_then(|ie| parse_up_ip_resource_info(&ie.value));
        let recovery = ie_u32(ies, pfcp_ie::RECOVERY_TIME_STAMP);
        self.association_established(&node, up_ip, recovery);
    }

    fn handle_association_release_request(
        self: &Arc<Self>,
        peer: SocketAddr,
        header: &PfcpHeader,
        ies: &[PfcpIe],
    ) {
        let cause = match self.sending_node(peer, ies) {
            Some(node) => {
                self.association_released(&node);
                PfcpCause::RequestAccepted
            }
            None => {
                log::warn!("Association release request from unknown UPF {}", peer);
                PfcpCause::RequestRejected
            }
        };
        self.respond(
            peer,
            pfcp_type::ASSOCIATION_RELEASE_RESPONSE,
            None,
            header.sequence_number,
            n4_build::build_association_release_response(self.exchange.node_id(), cause),
        );
    }

    // ------------------------------------------------------------------------
    // Session messages
    // ------------------------------------------------------------------------

    /// Establishment, modification and deletion responses. A response
    /// counts only when it closes the outstanding request with its sequence
    /// number, sent to the same node for the same session; anything else is
    /// dropped without touching the context or the transaction table.
    fn handle_session_response(&self, header: &PfcpHeader, ies: &[PfcpIe]) {
        let seid = header.seid.unwrap_or_default();
        let seq = header.sequence_number;

        let Some(handle) = self.registry.find_by_seid(seid) else {
            log::warn!(
                "Unmatched {} (seid={}, seq={})",
                pfcp_type::name(header.message_type),
                seid,
                seq
            );
            return;
        };

        let mut ctx = handle.lock();
        let tag = ctx.tag();
        let Some((node, pfcp)) = ctx.pfcp.iter_mut().find(|(_, p)| p.local_seid == seid) else {
            log::warn!("[{}] no PFCP session for seid={}", tag, seid);
            return;
        };
        let node = node.clone();

        if self
            .exchange
            .complete_session(seq, header.message_type, &node, seid)
            .is_none()
        {
            log::debug!(
                "[{}] [{}] {} answers no outstanding request (seq={})",
                tag,
                node,
                pfcp_type::name(header.message_type),
                seq
            );
            return;
        }

        let cause = ie_cause(ies);
        if cause.is_accepted() {
            match header.message_type {
                pfcp_type::SESSION_ESTABLISHMENT_RESPONSE => {
                    match find_ie(ies, pfcp_ie::F_SEID).and_then(|ie| parse_f_seid(&ie.value)) {
                        Some((remote_seid, _)) => pfcp.remote_seid = Some(remote_seid),
                        None => log::warn!("[{}] [{}] establishment response without F-SEID", tag, node),
                    }
                    pfcp.acknowledge(seq);
                }
                pfcp_type::SESSION_DELETION_RESPONSE => pfcp.acknowledge_all(),
                _ => pfcp.acknowledge(seq),
            }
        } else {
            log::warn!(
                "[{}] {} rejected by [{}] (cause={:?})",
                tag,
                pfcp_type::name(header.message_type),
                node,
                cause
            );
        }

        ctx.node_responded(&node, cause.is_accepted());
    }

    async fn handle_session_report_request(
        self: &Arc<Self>,
        peer: SocketAddr,
        header: &PfcpHeader,
        ies: &[PfcpIe],
    ) {
        let seid = header.seid.unwrap_or_default();
        let report_type = find_ie(ies, pfcp_ie::REPORT_TYPE)
            .and_then(|ie| ie.value.first().copied())
            .unwrap_or_default();

        let handle = self.registry.find_by_seid(seid);
        let (cause, remote_seid, paging) = match &handle {
            Some(handle) => {
                let ctx = handle.lock();
                let remote_seid = ctx
                    .pfcp
                    .values()
                    .find(|p| p.local_seid == seid)
                    .and_then(|p| p.remote_seid)
                    .unwrap_or_default();
                let paging = (report_type & REPORT_TYPE_DLDR != 0
                    && ctx.up_cnx_state == UpCnxState::Deactivated)
                    .then(|| (ctx.supi.clone(), ctx.psi));
                (PfcpCause::RequestAccepted, remote_seid, paging)
            }
            None => {
                log::warn!("Session report for unknown seid={}", seid);
                (PfcpCause::SessionContextNotFound, 0, None)
            }
        };

        self.respond(
            peer,
            pfcp_type::SESSION_REPORT_RESPONSE,
            Some(remote_seid),
            header.sequence_number,
            n4_build::build_session_report_response(cause),
        );

        if let Some((supi, psi)) = paging {
            log::info!("[{}:{}] downlink data report, requesting N2 setup", supi, psi);
            let msg = N1N2Message {
                psi,
                n1: None,
                n2: Some(N2SmInfoType::PduResSetupReq),
            };
            if let Err(e) = self.collaborators.amf.n1n2_message_transfer(&supi, msg).await {
                log::error!("[{}:{}] N1N2 message transfer failed: {}", supi, psi, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::context::{PendingOp, PfcpOutcome, PfcpSessionContext};
    use crate::n4_build::PfcpMessageBuilder;
    use crate::rule::{RetiredIds, SyncSections};
    use crate::topology::SNssai;

    fn upf_peer() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::new(10, 200, 200, 102).into(), 8805)
    }

    fn session_response(message_type: u8, seid: u64, seq: u32, cause: PfcpCause, remote: Option<u64>) -> Bytes {
        let mut b = PfcpMessageBuilder::new();
        b.add_node_id(Ipv4Addr::new(10, 200, 200, 102));
        b.add_cause(cause);
        if let Some(remote) = remote {
            b.add_f_seid(remote, Ipv4Addr::new(10, 200, 200, 102));
        }
        PfcpHeader::new(message_type, Some(seid), seq).encode(&b.build())
    }

    /// Session on PSA-UPF with a PFCP session already established
    fn established_session(smf: &SmfContext) -> (Arc<crate::context::SessionHandle>, u64, Arc<UpNode>) {
        let handle = smf.registry.create("imsi-1", 1, SNssai::new(1, Some(0x010203)), "internet");
        let seid = smf.registry.allocate_seid(handle.id());
        let upf = smf.topology.node("PSA-UPF").unwrap();
        let mut pfcp = PfcpSessionContext::new(upf.clone(), seid);
        pfcp.remote_seid = Some(REMOTE_SEID);
        handle.lock().pfcp.insert("PSA-UPF".into(), pfcp);
        (handle, seid, upf)
    }

    const REMOTE_SEID: u64 = 0x99;

    /// Modification removing one FAR; returns the request's sequence number
    /// and the parked FAR id
    fn send_far_removal(smf: &SmfContext, handle: &crate::context::SessionHandle, seid: u64, upf: &UpNode) -> (u32, u32) {
        let far = upf.ids().alloc_far_id().unwrap();
        let seq = smf
            .exchange
            .send_modification_request(upf, seid, REMOTE_SEID, &SyncSections::default())
            .unwrap();
        let retired = RetiredIds {
            far: vec![far],
            ..Default::default()
        };
        handle.lock().pfcp.get_mut("PSA-UPF").unwrap().park(seq, retired);
        (seq, far)
    }

    #[test]
    fn test_sbi_status_from_pfcp() {
        assert_eq!(sbi_status_from_pfcp(PfcpCause::RequestAccepted), sbi_status::OK);
        assert_eq!(sbi_status_from_pfcp(PfcpCause::RequestRejected), sbi_status::FORBIDDEN);
        assert_eq!(sbi_status_from_pfcp(PfcpCause::SessionContextNotFound), sbi_status::NOT_FOUND);
        assert_eq!(sbi_status_from_pfcp(PfcpCause::InvalidLength), sbi_status::BAD_REQUEST);
        assert_eq!(
            sbi_status_from_pfcp(PfcpCause::NoEstablishedPfcpAssociation),
            sbi_status::GATEWAY_TIMEOUT
        );
        assert_eq!(
            sbi_status_from_pfcp(PfcpCause::ServiceNotSupported),
            sbi_status::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            sbi_status_from_pfcp(PfcpCause::from(200)),
            sbi_status::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_parse_f_seid() {
        let value = [0x02, 0, 0, 0, 0, 0, 0, 0x10, 0x01, 10, 0, 0, 1];
        assert_eq!(parse_f_seid(&value), Some((0x1001, Some(Ipv4Addr::new(10, 0, 0, 1)))));
        assert_eq!(parse_f_seid(&value[..5]), None);
    }

    #[test]
    fn test_parse_up_ip_resource_info() {
        // TEIDRI=1, V4, ASSONI
        let mut value = vec![0x01 | (1 << 2) | 0x20, 0x80, 10, 200, 200, 102];
        value.extend_from_slice(b"internet");
        let info = parse_up_ip_resource_info(&value).unwrap();
        assert_eq!(info.teid_range, Some((1, 0x80)));
        assert_eq!(info.ipv4, Some(Ipv4Addr::new(10, 200, 200, 102)));
        assert_eq!(info.network_instance.as_deref(), Some("internet"));
    }

    #[tokio::test]
    async fn test_establishment_response_stores_remote_seid() {
        let (smf, _transport) = test_context(None);
        let handle = smf.registry.create("imsi-1", 1, SNssai::new(1, Some(0x010203)), "internet");
        let seid = smf.registry.allocate_seid(handle.id());
        let upf = smf.topology.node("PSA-UPF").unwrap();
        let seq = smf
            .exchange
            .send_establishment_request(&upf, seid, &SyncSections::default(), "internet", &SNssai::new(1, None))
            .unwrap();
        let mut rx = {
            let mut ctx = handle.lock();
            ctx.pfcp.insert("PSA-UPF".into(), PfcpSessionContext::new(upf, seid));
            ctx.begin_pending(PendingOp::Update, ["PSA-UPF".to_string()])
        };

        let data = session_response(
            pfcp_type::SESSION_ESTABLISHMENT_RESPONSE,
            seid,
            seq,
            PfcpCause::RequestAccepted,
            Some(0xabcd),
        );
        smf.handle_pfcp_datagram(upf_peer(), &data).await;

        assert_eq!(rx.try_recv().unwrap(), PfcpOutcome::SessionUpdateSuccess);
        let ctx = handle.lock();
        assert_eq!(ctx.pfcp["PSA-UPF"].remote_seid, Some(0xabcd));
        assert_eq!(smf.exchange.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_rejected_modification_keeps_ids_parked() {
        let (smf, _transport) = test_context(None);
        let (handle, seid, upf) = established_session(&smf);
        let (seq, far) = send_far_removal(&smf, &handle, seid, &upf);
        let mut rx = handle
            .lock()
            .begin_pending(PendingOp::Update, ["PSA-UPF".to_string()]);

        let data = session_response(
            pfcp_type::SESSION_MODIFICATION_RESPONSE,
            seid,
            seq,
            PfcpCause::RuleCreationModificationFailure,
            None,
        );
        smf.handle_pfcp_datagram(upf_peer(), &data).await;
        assert_eq!(rx.try_recv().unwrap(), PfcpOutcome::SessionUpdateFailed);
        assert!(upf.ids().far.is_awaiting_removal(far));

        // The session deletion clears whatever the UPF still held
        let seq = smf
            .exchange
            .send_deletion_request(&upf, seid, REMOTE_SEID)
            .unwrap();
        let _rx = handle
            .lock()
            .begin_pending(PendingOp::Release, ["PSA-UPF".to_string()]);
        let data = session_response(
            pfcp_type::SESSION_DELETION_RESPONSE,
            seid,
            seq,
            PfcpCause::RequestAccepted,
            None,
        );
        smf.handle_pfcp_datagram(upf_peer(), &data).await;
        assert!(!upf.ids().far.is_awaiting_removal(far));
    }

    #[tokio::test]
    async fn test_response_with_foreign_sequence_is_ignored() {
        let (smf, _transport) = test_context(None);
        let (handle, seid, upf) = established_session(&smf);
        let (seq, far) = send_far_removal(&smf, &handle, seid, &upf);
        let mut rx = handle
            .lock()
            .begin_pending(PendingOp::Update, ["PSA-UPF".to_string()]);

        let stale = session_response(
            pfcp_type::SESSION_MODIFICATION_RESPONSE,
            seid,
            seq + 1000,
            PfcpCause::RequestAccepted,
            None,
        );
        smf.handle_pfcp_datagram(upf_peer(), &stale).await;
        assert!(rx.try_recv().is_err());
        assert!(handle.lock().has_pending());
        assert!(upf.ids().far.is_awaiting_removal(far));
        assert_eq!(smf.exchange.outstanding(), 1);

        // Right number, wrong message type
        let wrong_type = session_response(
            pfcp_type::SESSION_DELETION_RESPONSE,
            seid,
            seq,
            PfcpCause::RequestAccepted,
            None,
        );
        smf.handle_pfcp_datagram(upf_peer(), &wrong_type).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(smf.exchange.outstanding(), 1);

        let answer = session_response(
            pfcp_type::SESSION_MODIFICATION_RESPONSE,
            seid,
            seq,
            PfcpCause::RequestAccepted,
            None,
        );
        smf.handle_pfcp_datagram(upf_peer(), &answer).await;
        assert_eq!(rx.try_recv().unwrap(), PfcpOutcome::SessionUpdateSuccess);
        assert!(!upf.ids().far.is_awaiting_removal(far));
        assert_eq!(smf.exchange.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_does_not_resolve_next_wait() {
        let (smf, _transport) = test_context(None);
        let (handle, seid, upf) = established_session(&smf);
        let (seq, _far) = send_far_removal(&smf, &handle, seid, &upf);
        let _rx = handle
            .lock()
            .begin_pending(PendingOp::Update, ["PSA-UPF".to_string()]);
        let answer = session_response(
            pfcp_type::SESSION_MODIFICATION_RESPONSE,
            seid,
            seq,
            PfcpCause::RequestAccepted,
            None,
        );
        smf.handle_pfcp_datagram(upf_peer(), &answer).await;

        // A second modification is in flight when the first answer repeats
        let (next_seq, next_far) = send_far_removal(&smf, &handle, seid, &upf);
        let mut rx = handle
            .lock()
            .begin_pending(PendingOp::Update, ["PSA-UPF".to_string()]);
        smf.handle_pfcp_datagram(upf_peer(), &answer).await;
        assert!(rx.try_recv().is_err());
        assert!(upf.ids().far.is_awaiting_removal(next_far));

        let answer = session_response(
            pfcp_type::SESSION_MODIFICATION_RESPONSE,
            seid,
            next_seq,
            PfcpCause::RequestAccepted,
            None,
        );
        smf.handle_pfcp_datagram(upf_peer(), &answer).await;
        assert_eq!(rx.try_recv().unwrap(), PfcpOutcome::SessionUpdateSuccess);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let (smf, _transport) = test_context(None);
        let (handle, seid, upf) = established_session(&smf);
        let (seq, far) = send_far_removal(&smf, &handle, seid, &upf);
        let mut rx = handle
            .lock()
            .begin_pending(PendingOp::Update, ["PSA-UPF".to_string()]);

        // Same sequence number, SEID of no session
        let data = session_response(
            pfcp_type::SESSION_MODIFICATION_RESPONSE,
            424242,
            seq,
            PfcpCause::RequestAccepted,
            None,
        );
        smf.handle_pfcp_datagram(upf_peer(), &data).await;

        assert_eq!(smf.exchange.outstanding(), 1);
        assert!(rx.try_recv().is_err());
        assert!(handle.lock().has_pending());
        assert!(upf.ids().far.is_awaiting_removal(far));
        assert_eq!(smf.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_request_answered() {
        let (smf, transport) = test_context(None);
        let data = PfcpHeader::new(pfcp_type::HEARTBEAT_REQUEST, None, 9)
            .encode(&n4_build::build_heartbeat_request(1));
        smf.handle_pfcp_datagram(upf_peer(), &data).await;

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, upf_peer());
        assert_eq!(sent[0].1.message_type, pfcp_type::HEARTBEAT_RESPONSE);
        assert_eq!(sent[0].1.sequence_number, 9);
    }

    #[tokio::test]
    async fn test_association_setup_request_from_upf() {
        let (smf, transport) = test_context(None);
        let mut b = PfcpMessageBuilder::new();
        b.add_node_id(Ipv4Addr::new(10, 200, 200, 102));
        b.add_recovery_time_stamp(1234);
        b.add_tlv(
            pfcp_ie::USER_PLANE_IP_RESOURCE_INFORMATION,
            &[0x01, 10, 200, 201, 102],
        );
        let data = PfcpHeader::new(pfcp_type::ASSOCIATION_SETUP_REQUEST, None, 3).encode(&b.build());
        smf.handle_pfcp_datagram(upf_peer(), &data).await;

        let upf = smf.topology.node("PSA-UPF").unwrap();
        assert!(upf.is_associated());
        let status = upf.status();
        assert_eq!(status.recovery_time_stamp, Some(1234));
        assert_eq!(status.up_ip_resource.unwrap().ipv4, Some(Ipv4Addr::new(10, 200, 201, 102)));

        let sent = transport.take();
        assert_eq!(sent[0].1.message_type, pfcp_type::ASSOCIATION_SETUP_RESPONSE);
        let ies = parse_ies(&sent[0].2).unwrap();
        assert_eq!(ie_cause(&ies), PfcpCause::RequestAccepted);

        // Release from the UPF
        let mut b = PfcpMessageBuilder::new();
        b.add_node_id(Ipv4Addr::new(10, 200, 200, 102));
        let data = PfcpHeader::new(pfcp_type::ASSOCIATION_RELEASE_REQUEST, None, 4).encode(&b.build());
        smf.handle_pfcp_datagram(upf_peer(), &data).await;
        assert!(!upf.is_associated());
        smf.associations.clear();
    }

    #[tokio::test]
    async fn test_session_report_unknown_session() {
        let (smf, transport) = test_context(None);
        let mut b = PfcpMessageBuilder::new();
        b.add_u8(pfcp_ie::REPORT_TYPE, REPORT_TYPE_DLDR);
        let data = PfcpHeader::new(pfcp_type::SESSION_REPORT_REQUEST, Some(99), 5).encode(&b.build());
        smf.handle_pfcp_datagram(upf_peer(), &data).await;

        let sent = transport.take();
        assert_eq!(sent[0].1.message_type, pfcp_type::SESSION_REPORT_RESPONSE);
        let ies = parse_ies(&sent[0].2).unwrap();
        assert_eq!(ie_cause(&ies), PfcpCause::SessionContextNotFound);
    }

    #[tokio::test]
    async fn test_malformed_datagram_ignored() {
        let (smf, transport) = test_context(None);
        smf.handle_pfcp_datagram(upf_peer(), &[0x20, 1, 0]).await;
        assert!(transport.take().is_empty());
    }
}
