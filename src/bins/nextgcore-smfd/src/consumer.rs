//! SBI Consumers
//!
//! Collaborators the session core calls out to (PCF, UDM, NRF, AMF and the
//! status notification target), the policy data they return, and static
//! local implementations used when no network function is reachable.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::{SmfError, SmfResult};
use crate::gsm::GsmMessage;
use crate::topology::SNssai;

// ============================================================================
// Policy data
// ============================================================================

/// Aggregate bitrate in kbps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ambr {
    pub uplink: u64,
    pub downlink: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRule {
    pub id: String,
    pub ambr: Ambr,
    pub default_5qi: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PccRule {
    pub id: String,
    pub precedence: u32,
    pub app_id: Option<String>,
    pub flow_description: Option<String>,
    /// Traffic control data this rule refers to
    pub tc_data_ref: Option<String>,
}

/// N6 tunnel target of a route to location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteInformation {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteToLocation {
    pub dnai: String,
    pub route_info: Option<RouteInformation>,
    pub route_profile_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrafficControlData {
    pub id: String,
    pub route_to_locs: Vec<RouteToLocation>,
}

/// SM policy decision. A `None` value removes the entry with that key.
#[derive(Debug, Clone, Default)]
pub struct SmPolicyDecision {
    pub sess_rules: BTreeMap<String, Option<SessionRule>>,
    pub pcc_rules: BTreeMap<String, Option<PccRule>>,
    pub traff_cont_decs: BTreeMap<String, Option<TrafficControlData>>,
}

/// Input of a policy association
#[derive(Debug, Clone)]
pub struct PolicyAssociationRequest {
    pub supi: String,
    pub psi: u8,
    pub dnn: String,
    pub snssai: SNssai,
    pub ue_ipv4: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionData {
    pub default_5qi: u8,
    pub session_ambr: Ambr,
    pub static_ipv4: Option<Ipv4Addr>,
}

impl Default for SubscriptionData {
    fn default() -> Self {
        Self {
            default_5qi: 9,
            session_ambr: Ambr {
                uplink: 1_000_000,
                downlink: 1_000_000,
            },
            static_ipv4: None,
        }
    }
}

// ============================================================================
// Discovery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NfType {
    Udm,
    Pcf,
    Amf,
}

impl NfType {
    pub fn name(&self) -> &'static str {
        match self {
            NfType::Udm => "UDM",
            NfType::Pcf => "PCF",
            NfType::Amf => "AMF",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfProfile {
    pub nf_instance_id: String,
    pub nf_type: NfType,
    pub api_root: String,
}

// ============================================================================
// N1/N2 transfer
// ============================================================================

/// N2 SM information carried next to an N1 message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum N2SmInfoType {
    PduResSetupReq,
    PduResModReq,
    PduResRelCmd,
    PathSwitchReqAck,
    HandoverCmd,
}

impl N2SmInfoType {
    pub fn name(&self) -> &'static str {
        match self {
            N2SmInfoType::PduResSetupReq => "PDU_RES_SETUP_REQ",
            N2SmInfoType::PduResModReq => "PDU_RES_MOD_REQ",
            N2SmInfoType::PduResRelCmd => "PDU_RES_REL_CMD",
            N2SmInfoType::PathSwitchReqAck => "PATH_SWITCH_REQ_ACK",
            N2SmInfoType::HandoverCmd => "HANDOVER_CMD",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct N1N2Message {
    pub psi: u8,
    pub n1: Option<Bytes>,
    pub n2: Option<N2SmInfoType>,
}

/// SM context status notification payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmContextStatus {
    Released,
}

impl SmContextStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SmContextStatus::Released => "RELEASED",
        }
    }
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// 5GSM encoding and decoding
pub trait NasCodec: Send + Sync {
    fn decode(&self, data: &[u8]) -> SmfResult<GsmMessage>;
    fn encode(&self, msg: &GsmMessage) -> Bytes;
}

/// Npcf_SMPolicyControl
#[async_trait]
pub trait PolicyClient: Send + Sync {
    async fn create_policy_association(
        &self,
        req: &PolicyAssociationRequest,
    ) -> SmfResult<(String, SmPolicyDecision)>;

    async fn terminate_policy_association(&self, policy_id: &str) -> SmfResult<()>;
}

/// Nudm_SDM
#[async_trait]
pub trait SubscriberDataClient: Send + Sync {
    async fn get_session_subscription_data(
        &self,
        supi: &str,
        snssai: &SNssai,
        dnn: &str,
    ) -> SmfResult<SubscriptionData>;
}

/// Nnrf_NFDiscovery
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn discover(&self, nf_type: NfType) -> SmfResult<Vec<NfProfile>>;
}

/// SM context status notification towards the AMF callback
#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn notify_status(&self, uri: &str, status: SmContextStatus) -> SmfResult<()>;
}

/// Namf_Communication
#[async_trait]
pub trait AmfClient: Send + Sync {
    async fn n1n2_message_transfer(&self, supi: &str, msg: N1N2Message) -> SmfResult<()>;
}

/// Every collaborator the session core needs
#[derive(Clone)]
pub struct Collaborators {
    pub nas: Arc<dyn NasCodec>,
    pub policy: Arc<dyn PolicyClient>,
    pub subscriber_data: Arc<dyn SubscriberDataClient>,
    pub discovery: Arc<dyn DiscoveryClient>,
    pub notification: Arc<dyn NotificationClient>,
    pub amf: Arc<dyn AmfClient>,
}

impl Collaborators {
    /// Static local collaborators answering from configuration defaults
    pub fn local(default_decision: SmPolicyDecision) -> Self {
        Self {
            nas: Arc::new(crate::gsm::GsmCodec),
            policy: Arc::new(StaticPolicy::new(default_decision)),
            subscriber_data: Arc::new(StaticSubscriberData::default()),
            discovery: Arc::new(StaticDiscovery::default()),
            notification: Arc::new(LoggingNotifier),
            amf: Arc::new(LoggingAmf),
        }
    }
}

// ============================================================================
// Local implementations
// ============================================================================

/// Hands every session the same policy decision
pub struct StaticPolicy {
    decision: SmPolicyDecision,
    next_id: std::sync::atomic::AtomicU64,
}

impl StaticPolicy {
    pub fn new(decision: SmPolicyDecision) -> Self {
        Self {
            decision,
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl PolicyClient for StaticPolicy {
    async fn create_policy_association(
        &self,
        req: &PolicyAssociationRequest,
    ) -> SmfResult<(String, SmPolicyDecision)> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        log::debug!("[{}:{}] local policy association {}", req.supi, req.psi, id);
        Ok((id.to_string(), self.decision.clone()))
    }

    async fn terminate_policy_association(&self, policy_id: &str) -> SmfResult<()> {
        log::debug!("local policy association {} terminated", policy_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticSubscriberData {
    pub data: SubscriptionData,
}

#[async_trait]
impl SubscriberDataClient for StaticSubscriberData {
    async fn get_session_subscription_data(
        &self,
        _supi: &str,
        _snssai: &SNssai,
        _dnn: &str,
    ) -> SmfResult<SubscriptionData> {
        Ok(self.data.clone())
    }
}

#[derive(Default)]
pub struct StaticDiscovery {
    pub profiles: Vec<NfProfile>,
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
    async fn discover(&self, nf_type: NfType) -> SmfResult<Vec<NfProfile>> {
        let found: Vec<NfProfile> = self
            .profiles
            .iter()
            .filter(|p| p.nf_type == nf_type)
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(SmfError::Collaborator(format!("no {} instance", nf_type.name())));
        }
        Ok(found)
    }
}

pub struct LoggingNotifier;

#[async_trait]
impl NotificationClient for LoggingNotifier {
    async fn notify_status(&self, uri: &str, status: SmContextStatus) -> SmfResult<()> {
        log::info!("SM context status [{}] -> {}", status.name(), uri);
        Ok(())
    }
}

pub struct LoggingAmf;

#[async_trait]
impl AmfClient for LoggingAmf {
    async fn n1n2_message_transfer(&self, supi: &str, msg: N1N2Message) -> SmfResult<()> {
        log::info!(
            "[{}:{}] N1N2 message transfer (n1={} bytes, n2={})",
            supi,
            msg.psi,
            msg.n1.as_ref().map_or(0, |b| b.len()),
            msg.n2.map_or("-", |n2| n2.name())
        );
        Ok(())
    }
}
