//! SMF N4 (PFCP) Message Building
//!
//! Message bodies (the IE part after the PFCP header) for the session and
//! node procedures the SMF originates or answers. Rule IEs are built from
//! the create/update/remove sections of a rule set.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use crate::rule::{Bar, Far, ForwardingParameters, Pdr, Qer, SyncSections};
use crate::topology::SNssai;

// ============================================================================
// PFCP Message Types
// ============================================================================

/// PFCP message types
pub mod pfcp_type {
    pub const HEARTBEAT_REQUEST: u8 = 1;
    pub const HEARTBEAT_RESPONSE: u8 = 2;
    pub const ASSOCIATION_SETUP_REQUEST: u8 = 5;
    pub const ASSOCIATION_SETUP_RESPONSE: u8 = 6;
    pub const ASSOCIATION_RELEASE_REQUEST: u8 = 9;
    pub const ASSOCIATION_RELEASE_RESPONSE: u8 = 10;
    pub const SESSION_ESTABLISHMENT_REQUEST: u8 = 50;
    pub const SESSION_ESTABLISHMENT_RESPONSE: u8 = 51;
    pub const SESSION_MODIFICATION_REQUEST: u8 = 52;
    pub const SESSION_MODIFICATION_RESPONSE: u8 = 53;
    pub const SESSION_DELETION_REQUEST: u8 = 54;
    pub const SESSION_DELETION_RESPONSE: u8 = 55;
    pub const SESSION_REPORT_REQUEST: u8 = 56;
    pub const SESSION_REPORT_RESPONSE: u8 = 57;

    /// Session messages carry a SEID in the header
    pub fn has_seid(message_type: u8) -> bool {
        message_type >= SESSION_ESTABLISHMENT_REQUEST
    }

    pub fn name(message_type: u8) -> &'static str {
        match message_type {
            HEARTBEAT_REQUEST => "Heartbeat Request",
            HEARTBEAT_RESPONSE => "Heartbeat Response",
            ASSOCIATION_SETUP_REQUEST => "Association Setup Request",
            ASSOCIATION_SETUP_RESPONSE => "Association Setup Response",
            ASSOCIATION_RELEASE_REQUEST => "Association Release Request",
            ASSOCIATION_RELEASE_RESPONSE => "Association Release Response",
            SESSION_ESTABLISHMENT_REQUEST => "Session Establishment Request",
            SESSION_ESTABLISHMENT_RESPONSE => "Session Establishment Response",
            SESSION_MODIFICATION_REQUEST => "Session Modification Request",
            SESSION_MODIFICATION_RESPONSE => "Session Modification Response",
            SESSION_DELETION_REQUEST => "Session Deletion Request",
            SESSION_DELETION_RESPONSE => "Session Deletion Response",
            SESSION_REPORT_REQUEST => "Session Report Request",
            SESSION_REPORT_RESPONSE => "Session Report Response",
            _ => "Unknown",
        }
    }
}

// ============================================================================
// PFCP Cause Values
// ============================================================================

/// PFCP cause values (3GPP TS 29.244)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PfcpCause {
    #[default]
    RequestAccepted = 1,
    RequestRejected = 64,
    SessionContextNotFound = 65,
    MandatoryIeMissing = 66,
    ConditionalIeMissing = 67,
    InvalidLength = 68,
    MandatoryIeIncorrect = 69,
    InvalidForwardingPolicy = 70,
    InvalidFTeidAllocationOption = 71,
    NoEstablishedPfcpAssociation = 72,
    RuleCreationModificationFailure = 73,
    PfcpEntityInCongestion = 74,
    NoResourcesAvailable = 75,
    ServiceNotSupported = 76,
    SystemFailure = 77,
}

impl From<u8> for PfcpCause {
    fn from(value: u8) -> Self {
        match value {
            1 => PfcpCause::RequestAccepted,
            64 => PfcpCause::RequestRejected,
            65 => PfcpCause::SessionContextNotFound,
            66 => PfcpCause::MandatoryIeMissing,
            67 => PfcpCause::ConditionalIeMissing,
            68 => PfcpCause::InvalidLength,
            69 => PfcpCause::MandatoryIeIncorrect,
            70 => PfcpCause::InvalidForwardingPolicy,
            71 => PfcpCause::InvalidFTeidAllocationOption,
            72 => PfcpCause::NoEstablishedPfcpAssociation,
            73 => PfcpCause::RuleCreationModificationFailure,
            74 => PfcpCause::PfcpEntityInCongestion,
            75 => PfcpCause::NoResourcesAvailable,
            76 => PfcpCause::ServiceNotSupported,
            _ => PfcpCause::SystemFailure,
        }
    }
}

impl PfcpCause {
    pub fn is_accepted(&self) -> bool {
        *self == PfcpCause::RequestAccepted
    }
}

// ============================================================================
// PFCP IE Types
// ============================================================================

/// PFCP IE types (3GPP TS 29.244)
pub mod pfcp_ie {
    pub const CREATE_PDR: u16 = 1;
    pub const PDI: u16 = 2;
    pub const CREATE_FAR: u16 = 3;
    pub const FORWARDING_PARAMETERS: u16 = 4;
    pub const CREATE_QER: u16 = 7;
    pub const UPDATE_PDR: u16 = 9;
    pub const UPDATE_FAR: u16 = 10;
    pub const UPDATE_FORWARDING_PARAMETERS: u16 = 11;
    pub const UPDATE_QER: u16 = 14;
    pub const REMOVE_PDR: u16 = 15;
    pub const REMOVE_FAR: u16 = 16;
    pub const REMOVE_QER: u16 = 18;
    pub const CAUSE: u16 = 19;
    pub const SOURCE_INTERFACE: u16 = 20;
    pub const F_TEID: u16 = 21;
    pub const NETWORK_INSTANCE: u16 = 22;
    pub const SDF_FILTER: u16 = 23;
    pub const APPLICATION_ID: u16 = 24;
    pub const GATE_STATUS: u16 = 25;
    pub const MBR: u16 = 26;
    pub const PRECEDENCE: u16 = 29;
    pub const REPORT_TYPE: u16 = 39;
    pub const OFFENDING_IE: u16 = 40;
    pub const FORWARDING_POLICY: u16 = 41;
    pub const DESTINATION_INTERFACE: u16 = 42;
    pub const APPLY_ACTION: u16 = 44;
    pub const PDR_ID: u16 = 56;
    pub const F_SEID: u16 = 57;
    pub const NODE_ID: u16 = 60;
    pub const OUTER_HEADER_CREATION: u16 = 84;
    pub const CREATE_BAR: u16 = 85;
    pub const UPDATE_BAR: u16 = 86;
    pub const REMOVE_BAR: u16 = 87;
    pub const BAR_ID: u16 = 88;
    pub const CP_FUNCTION_FEATURES: u16 = 89;
    pub const UE_IP_ADDRESS: u16 = 93;
    pub const OUTER_HEADER_REMOVAL: u16 = 95;
    pub const RECOVERY_TIME_STAMP: u16 = 96;
    pub const FAR_ID: u16 = 108;
    pub const QER_ID: u16 = 109;
    pub const PDN_TYPE: u16 = 113;
    pub const USER_PLANE_IP_RESOURCE_INFORMATION: u16 = 116;
    pub const QFI: u16 = 124;
    pub const SUGGESTED_BUFFERING_PACKETS_COUNT: u16 = 140;
    pub const APN_DNN: u16 = 159;
    pub const S_NSSAI: u16 = 257;
}

// ============================================================================
// PFCP Interface Types
// ============================================================================

/// PFCP source/destination interface values
pub mod interface {
    pub const ACCESS: u8 = 0;
    pub const CORE: u8 = 1;
    pub const SGI_LAN_N6_LAN: u8 = 2;
    pub const CP_FUNCTION: u8 = 3;
}

/// PFCP apply action flags
pub mod apply_action {
    pub const DROP: u16 = 1 << 0;
    pub const FORW: u16 = 1 << 1;
    pub const BUFF: u16 = 1 << 2;
    pub const NOCP: u16 = 1 << 3;
    pub const DUPL: u16 = 1 << 4;
}

/// Node ID type: IPv4 address
const NODE_ID_TYPE_IPV4: u8 = 0;
/// PDN type: IPv4
const PDN_TYPE_IPV4: u8 = 1;

// ============================================================================
// PFCP Message Builder
// ============================================================================

/// PFCP IE builder
#[derive(Debug, Clone, Default)]
pub struct PfcpMessageBuilder {
    buffer: BytesMut,
}

impl PfcpMessageBuilder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(512),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn build(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Add a TLV IE (Type-Length-Value)
    pub fn add_tlv(&mut self, ie_type: u16, value: &[u8]) -> &mut Self {
        self.buffer.put_u16(ie_type);
        self.buffer.put_u16(value.len() as u16);
        self.buffer.put_slice(value);
        self
    }

    /// Add a grouped IE built by `f`
    pub fn add_grouped<F>(&mut self, ie_type: u16, f: F) -> &mut Self
    where
        F: FnOnce(&mut PfcpMessageBuilder),
    {
        let mut inner = PfcpMessageBuilder::new();
        f(&mut inner);
        self.add_tlv(ie_type, &inner.buffer)
    }

    pub fn add_u8(&mut self, ie_type: u16, value: u8) -> &mut Self {
        self.add_tlv(ie_type, &[value])
    }

    pub fn add_u16(&mut self, ie_type: u16, value: u16) -> &mut Self {
        self.add_tlv(ie_type, &value.to_be_bytes())
    }

    pub fn add_u32(&mut self, ie_type: u16, value: u32) -> &mut Self {
        self.add_tlv(ie_type, &value.to_be_bytes())
    }

    pub fn add_node_id(&mut self, node_id: Ipv4Addr) -> &mut Self {
        let mut value = [0u8; 5];
        value[0] = NODE_ID_TYPE_IPV4;
        value[1..].copy_from_slice(&node_id.octets());
        self.add_tlv(pfcp_ie::NODE_ID, &value)
    }

    pub fn add_f_seid(&mut self, seid: u64, ipv4: Ipv4Addr) -> &mut Self {
        let mut value = BytesMut::with_capacity(13);
        value.put_u8(0x02); // V4
        value.put_u64(seid);
        value.put_slice(&ipv4.octets());
        self.add_tlv(pfcp_ie::F_SEID, &value)
    }

    pub fn add_cause(&mut self, cause: PfcpCause) -> &mut Self {
        self.add_u8(pfcp_ie::CAUSE, cause as u8)
    }

    pub fn add_recovery_time_stamp(&mut self, ts: u32) -> &mut Self {
        self.add_u32(pfcp_ie::RECOVERY_TIME_STAMP, ts)
    }

    /// Flags go out in octet order: DROP..DUPL in the first octet
    pub fn add_apply_action(&mut self, action: u16) -> &mut Self {
        self.add_tlv(pfcp_ie::APPLY_ACTION, &[(action & 0xff) as u8, (action >> 8) as u8])
    }

    pub fn add_apn_dnn(&mut self, apn: &str) -> &mut Self {
        let mut fqdn = Vec::with_capacity(apn.len() + 1);
        for label in apn.split('.') {
            fqdn.push(label.len() as u8);
            fqdn.extend_from_slice(label.as_bytes());
        }
        self.add_tlv(pfcp_ie::APN_DNN, &fqdn)
    }

    pub fn add_s_nssai(&mut self, snssai: &SNssai) -> &mut Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u8(snssai.sst);
        if let Some(sd) = snssai.sd {
            value.put_slice(&sd.to_be_bytes()[1..]);
        }
        self.add_tlv(pfcp_ie::S_NSSAI, &value)
    }

    pub fn add_f_teid(&mut self, teid: u32, ipv4: Ipv4Addr) -> &mut Self {
        let mut value = BytesMut::with_capacity(9);
        value.put_u8(0x01); // V4
        value.put_u32(teid);
        value.put_slice(&ipv4.octets());
        self.add_tlv(pfcp_ie::F_TEID, &value)
    }

    pub fn add_ue_ip_address(&mut self, ipv4: Ipv4Addr, destination: bool) -> &mut Self {
        let mut flags = 0x02; // V4
        if destination {
            flags |= 0x04; // S/D
        }
        let mut value = BytesMut::with_capacity(5);
        value.put_u8(flags);
        value.put_slice(&ipv4.octets());
        self.add_tlv(pfcp_ie::UE_IP_ADDRESS, &value)
    }

    pub fn add_outer_header_creation(
        &mut self,
        ohc: &crate::rule::OuterHeaderCreation,
    ) -> &mut Self {
        let mut value = BytesMut::with_capacity(12);
        value.put_u16(ohc.description);
        if ohc.description == crate::rule::OUTER_HEADER_CREATION_GTPU_UDP_IPV4 {
            value.put_u32(ohc.teid);
        }
        value.put_slice(&ohc.ipv4.octets());
        if let Some(port) = ohc.port {
            value.put_u16(port);
        }
        self.add_tlv(pfcp_ie::OUTER_HEADER_CREATION, &value)
    }

    /// MBR in kbps, 5 octets per direction
    pub fn add_mbr(&mut self, uplink: u64, downlink: u64) -> &mut Self {
        let mut value = BytesMut::with_capacity(10);
        value.put_slice(&uplink.to_be_bytes()[3..8]);
        value.put_slice(&downlink.to_be_bytes()[3..8]);
        self.add_tlv(pfcp_ie::MBR, &value)
    }

    pub fn add_gate_status(&mut self, dl_gate: u8, ul_gate: u8) -> &mut Self {
        let value = (dl_gate & 0x03) | ((ul_gate & 0x03) << 2);
        self.add_u8(pfcp_ie::GATE_STATUS, value)
    }

    /// SDF filter with a flow description only
    pub fn add_sdf_filter(&mut self, flow_description: &str) -> &mut Self {
        let fd = flow_description.as_bytes();
        let mut value = BytesMut::with_capacity(fd.len() + 4);
        value.put_u8(0x01); // FD
        value.put_u8(0);
        value.put_u16(fd.len() as u16);
        value.put_slice(fd);
        self.add_tlv(pfcp_ie::SDF_FILTER, &value)
    }

    pub fn add_forwarding_policy(&mut self, id: &str) -> &mut Self {
        let mut value = Vec::with_capacity(id.len() + 1);
        value.push(id.len() as u8);
        value.extend_from_slice(id.as_bytes());
        self.add_tlv(pfcp_ie::FORWARDING_POLICY, &value)
    }
}

// ============================================================================
// Rule IEs
// ============================================================================

fn add_pdr_body(b: &mut PfcpMessageBuilder, pdr: &Pdr) {
    b.add_u16(pfcp_ie::PDR_ID, pdr.id);
    b.add_u32(pfcp_ie::PRECEDENCE, pdr.precedence);
    b.add_grouped(pfcp_ie::PDI, |pdi| {
        pdi.add_u8(pfcp_ie::SOURCE_INTERFACE, pdr.pdi.source_interface);
        if let Some(fteid) = pdr.pdi.local_fteid {
            pdi.add_f_teid(fteid.teid, fteid.ipv4);
        }
        if let Some(ni) = &pdr.pdi.network_instance {
            pdi.add_tlv(pfcp_ie::NETWORK_INSTANCE, ni.as_bytes());
        }
        if let Some(ue_ip) = pdr.pdi.ue_ip_address {
            // Downlink detection at the anchor matches the destination
            let destination =
                pdr.pdi.source_interface == interface::CORE && pdr.pdi.local_fteid.is_none();
            pdi.add_ue_ip_address(ue_ip, destination);
        }
        if let Some(sdf) = &pdr.pdi.sdf_filter {
            pdi.add_sdf_filter(sdf);
        }
        if let Some(app_id) = &pdr.pdi.application_id {
            pdi.add_tlv(pfcp_ie::APPLICATION_ID, app_id.as_bytes());
        }
    });
    if let Some(ohr) = pdr.outer_header_removal {
        b.add_u8(pfcp_ie::OUTER_HEADER_REMOVAL, ohr);
    }
    b.add_u32(pfcp_ie::FAR_ID, pdr.far_id);
    for qer_id in &pdr.qer_ids {
        b.add_u32(pfcp_ie::QER_ID, *qer_id);
    }
}

fn add_forwarding_parameters(b: &mut PfcpMessageBuilder, fp: &ForwardingParameters) {
    b.add_u8(pfcp_ie::DESTINATION_INTERFACE, fp.destination_interface);
    if let Some(ni) = &fp.network_instance {
        b.add_tlv(pfcp_ie::NETWORK_INSTANCE, ni.as_bytes());
    }
    if let Some(ohc) = &fp.outer_header_creation {
        b.add_outer_header_creation(ohc);
    }
    if let Some(policy) = &fp.forwarding_policy_id {
        b.add_forwarding_policy(policy);
    }
}

fn add_far_body(b: &mut PfcpMessageBuilder, far: &Far, update: bool) {
    b.add_u32(pfcp_ie::FAR_ID, far.id);
    b.add_apply_action(far.apply_action);
    if let Some(fp) = &far.forwarding_parameters {
        let ie = if update {
            pfcp_ie::UPDATE_FORWARDING_PARAMETERS
        } else {
            pfcp_ie::FORWARDING_PARAMETERS
        };
        b.add_grouped(ie, |g| add_forwarding_parameters(g, fp));
    }
    if let Some(bar_id) = far.bar_id {
        b.add_u8(pfcp_ie::BAR_ID, bar_id);
    }
}

fn add_qer_body(b: &mut PfcpMessageBuilder, qer: &Qer) {
    b.add_u32(pfcp_ie::QER_ID, qer.id);
    b.add_gate_status(0, 0);
    b.add_mbr(qer.mbr_ul, qer.mbr_dl);
    b.add_u8(pfcp_ie::QFI, qer.qfi);
}

fn add_bar_body(b: &mut PfcpMessageBuilder, bar: &Bar) {
    b.add_u8(pfcp_ie::BAR_ID, bar.id);
    b.add_u8(pfcp_ie::SUGGESTED_BUFFERING_PACKETS_COUNT, bar.suggested_buffering_packets_count);
}

fn add_create_sections(b: &mut PfcpMessageBuilder, sections: &SyncSections) {
    for pdr in &sections.pdrs.create {
        b.add_grouped(pfcp_ie::CREATE_PDR, |g| add_pdr_body(g, pdr));
    }
    for far in &sections.fars.create {
        b.add_grouped(pfcp_ie::CREATE_FAR, |g| add_far_body(g, far, false));
    }
    for qer in &sections.qers.create {
        b.add_grouped(pfcp_ie::CREATE_QER, |g| add_qer_body(g, qer));
    }
    for bar in &sections.bars.create {
        b.add_grouped(pfcp_ie::CREATE_BAR, |g| add_bar_body(g, bar));
    }
}

// ============================================================================
// Session messages
// ============================================================================

/// Build PFCP Session Establishment Request
pub fn build_session_establishment_request(
    node_id: Ipv4Addr,
    local_seid: u64,
    sections: &SyncSections,
    dnn: &str,
    snssai: &SNssai,
) -> Bytes {
    let mut b = PfcpMessageBuilder::new();
    b.add_node_id(node_id);
    b.add_f_seid(local_seid, node_id);
    add_create_sections(&mut b, sections);
    b.add_u8(pfcp_ie::PDN_TYPE, PDN_TYPE_IPV4);
    b.add_apn_dnn(dnn);
    b.add_s_nssai(snssai);
    b.build()
}

/// Build PFCP Session Modification Request. Removals go first so a
/// replacement rule never collides with the one it replaces.
pub fn build_session_modification_request(sections: &SyncSections) -> Bytes {
    let mut b = PfcpMessageBuilder::new();

    for id in &sections.pdrs.remove {
        b.add_grouped(pfcp_ie::REMOVE_PDR, |g| {
            g.add_u16(pfcp_ie::PDR_ID, *id);
        });
    }
    for id in &sections.fars.remove {
        b.add_grouped(pfcp_ie::REMOVE_FAR, |g| {
            g.add_u32(pfcp_ie::FAR_ID, *id);
        });
    }
    for id in &sections.qers.remove {
        b.add_grouped(pfcp_ie::REMOVE_QER, |g| {
            g.add_u32(pfcp_ie::QER_ID, *id);
        });
    }
    for id in &sections.bars.remove {
        b.add_grouped(pfcp_ie::REMOVE_BAR, |g| {
            g.add_u8(pfcp_ie::BAR_ID, *id);
        });
    }

    add_create_sections(&mut b, sections);

    for pdr in &sections.pdrs.update {
        b.add_grouped(pfcp_ie::UPDATE_PDR, |g| add_pdr_body(g, pdr));
    }
    for far in &sections.fars.update {
        b.add_grouped(pfcp_ie::UPDATE_FAR, |g| add_far_body(g, far, true));
    }
    for qer in &sections.qers.update {
        b.add_grouped(pfcp_ie::UPDATE_QER, |g| add_qer_body(g, qer));
    }
    for bar in &sections.bars.update {
        b.add_grouped(pfcp_ie::UPDATE_BAR, |g| add_bar_body(g, bar));
    }
    b.build()
}

/// Build PFCP Session Deletion Request; the header SEID says it all
pub fn build_session_deletion_request() -> Bytes {
    Bytes::new()
}

pub fn build_session_report_response(cause: PfcpCause) -> Bytes {
    let mut b = PfcpMessageBuilder::new();
    b.add_cause(cause);
    b.build()
}

// ============================================================================
// Node messages
// ============================================================================

pub fn build_association_setup_request(node_id: Ipv4Addr, recovery_time_stamp: u32) -> Bytes {
    let mut b = PfcpMessageBuilder::new();
    b.add_node_id(node_id);
    b.add_recovery_time_stamp(recovery_time_stamp);
    b.add_u8(pfcp_ie::CP_FUNCTION_FEATURES, 0);
    b.build()
}

pub fn build_association_setup_response(
    node_id: Ipv4Addr,
    cause: PfcpCause,
    recovery_time_stamp: u32,
) -> Bytes {
    let mut b = PfcpMessageBuilder::new();
    b.add_node_id(node_id);
    b.add_cause(cause);
    b.add_recovery_time_stamp(recovery_time_stamp);
    b.add_u8(pfcp_ie::CP_FUNCTION_FEATURES, 0);
    b.build()
}

pub fn build_association_release_response(node_id: Ipv4Addr, cause: PfcpCause) -> Bytes {
    let mut b = PfcpMessageBuilder::new();
    b.add_node_id(node_id);
    b.add_cause(cause);
    b.build()
}

pub fn build_heartbeat_request(recovery_time_stamp: u32) -> Bytes {
    let mut b = PfcpMessageBuilder::new();
    b.add_recovery_time_stamp(recovery_time_stamp);
    b.build()
}

pub fn build_heartbeat_response(recovery_time_stamp: u32) -> Bytes {
    build_heartbeat_request(recovery_time_stamp)
}
