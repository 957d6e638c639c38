//! SMF Context Management
//!
//! The process-wide SMF context and the per-session SM context.
//!
//! An SM context owns the session's data paths, its per-node rule sets and
//! PFCP sessions, and the pending-node set that turns asynchronous PFCP
//! responses into one outcome for the waiting procedure.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

use crate::config::SmfConfig;
use crate::consumer::{Ambr, Collaborators, PccRule, SessionRule, TrafficControlData};
use crate::datapath::{NodeRuleSets, PathParams, UpTunnel};
use crate::error::{SmfError, SmfResult};
use crate::pfcp_path::{PfcpExchange, PfcpTransport};
use crate::pfcp_sm::AssociationTable;
use crate::pool::UeIpAllocation;
use crate::registry::SessionRegistry;
use crate::rule::RetiredIds;
use crate::sess_sm::SmFsm;
use crate::timer::{stop_timer, RetryTimer, SmfTimerConfigs};
use crate::topology::{SNssai, Topology, UpNode, UpSelection};
use crate::ulcl::{UeRouting, UlclState};

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

// ============================================================================
// PFCP outcomes
// ============================================================================

/// Terminal result of one pending PFCP operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfcpOutcome {
    SessionUpdateSuccess,
    SessionUpdateFailed,
    SessionReleaseSuccess,
    SessionReleaseFailed,
    /// No outcome within the configured deadline
    Timeout,
}

impl PfcpOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            PfcpOutcome::SessionUpdateSuccess => "SessionUpdateSuccess",
            PfcpOutcome::SessionUpdateFailed => "SessionUpdateFailed",
            PfcpOutcome::SessionReleaseSuccess => "SessionReleaseSuccess",
            PfcpOutcome::SessionReleaseFailed => "SessionReleaseFailed",
            PfcpOutcome::Timeout => "Timeout",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PfcpOutcome::SessionUpdateSuccess | PfcpOutcome::SessionReleaseSuccess)
    }
}

/// Kind of PFCP operation a pending set waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    Update,
    Release,
}

impl PendingOp {
    fn success(self) -> PfcpOutcome {
        match self {
            PendingOp::Update => PfcpOutcome::SessionUpdateSuccess,
            PendingOp::Release => PfcpOutcome::SessionReleaseSuccess,
        }
    }

    fn failure(self) -> PfcpOutcome {
        match self {
            PendingOp::Update => PfcpOutcome::SessionUpdateFailed,
            PendingOp::Release => PfcpOutcome::SessionReleaseFailed,
        }
    }
}

#[derive(Debug)]
struct PendingSet {
    op: PendingOp,
    nodes: BTreeSet<String>,
    tx: Option<oneshot::Sender<PfcpOutcome>>,
}

/// Wait for the outcome of a pending set. Without a deadline the wait ends
/// only when the set resolves or is abandoned.
pub async fn wait_outcome(rx: oneshot::Receiver<PfcpOutcome>, deadline: Option<Duration>) -> PfcpOutcome {
    let received = match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, rx).await {
            Ok(received) => received,
            Err(_) => return PfcpOutcome::Timeout,
        },
        None => rx.await,
    };
    received.unwrap_or(PfcpOutcome::Timeout)
}

// ============================================================================
// SM Context
// ============================================================================

/// UP connection state requested by the AMF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpCnxState {
    #[default]
    Activated,
    Deactivated,
    Activating,
}

impl UpCnxState {
    pub fn name(&self) -> &'static str {
        match self {
            UpCnxState::Activated => "ACTIVATED",
            UpCnxState::Deactivated => "DEACTIVATED",
            UpCnxState::Activating => "ACTIVATING",
        }
    }
}

/// PFCP session with one UPF
#[derive(Debug)]
pub struct PfcpSessionContext {
    pub node: Arc<UpNode>,
    pub local_seid: u64,
    /// Learnt from the establishment response
    pub remote_seid: Option<u64>,
    /// Ids of rules sent for removal, keyed by the sequence number of the
    /// request that removed them
    pub awaiting_ack: BTreeMap<u32, RetiredIds>,
}

impl PfcpSessionContext {
    pub fn new(node: Arc<UpNode>, local_seid: u64) -> Self {
        Self {
            node,
            local_seid,
            remote_seid: None,
            awaiting_ack: BTreeMap::new(),
        }
    }

    pub fn is_established(&self) -> bool {
        self.remote_seid.is_some()
    }

    /// Take `retired` out of the node's id space until request `seq` is acknowledged
    pub fn park(&mut self, seq: u32, retired: RetiredIds) {
        if retired.is_empty() {
            return;
        }
        self.node.ids().retire(&retired);
        self.awaiting_ack.entry(seq).or_default().extend(retired);
    }

    /// Request `seq` was accepted: its ids go back to the node
    pub fn acknowledge(&mut self, seq: u32) {
        if let Some(retired) = self.awaiting_ack.remove(&seq) {
            self.node.ids().confirm(&retired);
        }
    }

    /// The whole PFCP session is gone from the node
    pub fn acknowledge_all(&mut self) {
        for (_, retired) in std::mem::take(&mut self.awaiting_ack) {
            self.node.ids().confirm(&retired);
        }
    }
}

pub struct SmContext {
    pub id: u64,
    pub supi: String,
    pub psi: u8,
    pub pti: u8,
    pub sm_context_ref: String,
    pub snssai: SNssai,
    pub dnn: String,
    pub fsm: SmFsm,

    pub selection: UpSelection,
    pub tunnel: UpTunnel,
    pub rules: NodeRuleSets,
    /// PFCP sessions keyed by node name
    pub pfcp: BTreeMap<String, PfcpSessionContext>,
    pending: Option<PendingSet>,

    pub ue_ip: Option<UeIpAllocation>,
    pub policy_id: Option<String>,
    pub session_rule: Option<SessionRule>,
    pub pcc_rules: BTreeMap<String, PccRule>,
    pub tc_data: BTreeMap<String, TrafficControlData>,
    pub qfi: u8,
    pub default_5qi: u8,
    pub ambr: Ambr,

    pub up_cnx_state: UpCnxState,
    /// Set for members of a UE routing group when ULCL is enabled
    pub ulcl: Option<UlclState>,
    /// Release requested because the AMF saw a duplicate PDU session id
    pub release_due_to_duplicate: bool,
    pub status_uri: Option<String>,
    pub t3591: Option<RetryTimer>,
    pub t3592: Option<RetryTimer>,
}

impl SmContext {
    pub fn new(id: u64, supi: &str, psi: u8, snssai: SNssai, dnn: &str) -> Self {
        let tag = format!("{}:{}", supi, psi);
        Self {
            id,
            supi: supi.to_string(),
            psi,
            pti: 0,
            sm_context_ref: format!("urn:uuid:{}", uuid::Uuid::new_v4()),
            snssai,
            dnn: dnn.to_string(),
            fsm: SmFsm::new(tag),
            selection: UpSelection::new(snssai, dnn),
            tunnel: UpTunnel::new(),
            rules: NodeRuleSets::new(),
            pfcp: BTreeMap::new(),
            pending: None,
            ue_ip: None,
            policy_id: None,
            session_rule: None,
            pcc_rules: BTreeMap::new(),
            tc_data: BTreeMap::new(),
            qfi: 1,
            default_5qi: 9,
            ambr: Ambr::default(),
            up_cnx_state: UpCnxState::default(),
            ulcl: None,
            release_due_to_duplicate: false,
            status_uri: None,
            t3591: None,
            t3592: None,
        }
    }

    /// Log tag
    pub fn tag(&self) -> String {
        format!("{}:{}", self.supi, self.psi)
    }

    pub fn ue_ipv4(&self) -> Option<Ipv4Addr> {
        self.ue_ip.as_ref().map(|a| a.addr)
    }

    /// Activation parameters for a path carrying the session's QoS flow
    pub fn path_params(&self, precedence: u32) -> PathParams {
        PathParams {
            precedence,
            dnn: self.dnn.clone(),
            ue_ip: self.ue_ipv4(),
            qfi: self.qfi,
            ambr_ul: self.ambr.uplink,
            ambr_dl: self.ambr.downlink,
            an_tunnel: self.tunnel.an_tunnel,
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------------
    // Pending nodes
    // ------------------------------------------------------------------------

    /// Start waiting for `nodes`. With no node to wait for, the success
    /// outcome is already in the channel.
    pub fn begin_pending(
        &mut self,
        op: PendingOp,
        nodes: impl IntoIterator<Item = String>,
    ) -> oneshot::Receiver<PfcpOutcome> {
        let (tx, rx) = oneshot::channel();
        let nodes: BTreeSet<String> = nodes.into_iter().collect();

        if let Some(stale) = self.pending.take() {
            log::warn!(
                "[{}] pending {:?} set with {} node(s) replaced",
                self.tag(),
                stale.op,
                stale.nodes.len()
            );
        }

        if nodes.is_empty() {
            let _ = tx.send(op.success());
            return rx;
        }
        log::debug!("[{}] waiting for {:?} on {:?}", self.tag(), op, nodes);
        self.pending = Some(PendingSet {
            op,
            nodes,
            tx: Some(tx),
        });
        rx
    }

    /// Record one node's answer. Returns the outcome when this answer
    /// resolved the pending set. A rejection resolves it at once; later
    /// answers from the other nodes find nothing pending.
    pub fn node_responded(&mut self, node: &str, accepted: bool) -> Option<PfcpOutcome> {
        let tag = self.tag();
        let Some(pending) = self.pending.as_mut() else {
            log::debug!("[{}] response from [{}] with nothing pending", tag, node);
            return None;
        };
        if !pending.nodes.remove(node) {
            log::debug!("[{}] response from [{}] not pending", tag, node);
            return None;
        }

        let outcome = if !accepted {
            pending.op.failure()
        } else if pending.nodes.is_empty() {
            pending.op.success()
        } else {
            return None;
        };

        if let Some(tx) = self.pending.take().and_then(|p| p.tx) {
            let _ = tx.send(outcome);
        }
        log::debug!("[{}] pending set resolved: {}", tag, outcome.name());
        Some(outcome)
    }

    /// Drop the pending set without an outcome, as after a timeout
    pub fn abandon_pending(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn pending_nodes(&self) -> Vec<String> {
        self.pending
            .as_ref()
            .map(|p| p.nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn stop_timers(&mut self) {
        stop_timer(&mut self.t3591);
        stop_timer(&mut self.t3592);
    }
}

// ============================================================================
// Session Handle
// ============================================================================

/// Registry entry of one SM context.
///
/// `fence` serializes signaling procedures on the context and is held
/// across the PFCP wait. `ctx` guards the fields and is only held for
/// short critical sections, never across an await; PFCP response handlers
/// take `ctx` alone.
pub struct SessionHandle {
    id: u64,
    sm_context_ref: String,
    fence: tokio::sync::Mutex<()>,
    ctx: Mutex<SmContext>,
}

impl SessionHandle {
    pub fn new(ctx: SmContext) -> Self {
        Self {
            id: ctx.id,
            sm_context_ref: ctx.sm_context_ref.clone(),
            fence: tokio::sync::Mutex::new(()),
            ctx: Mutex::new(ctx),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sm_context_ref(&self) -> &str {
        &self.sm_context_ref
    }

    pub fn lock(&self) -> MutexGuard<'_, SmContext> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn fence(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.fence.lock().await
    }
}

// ============================================================================
// SMF Context
// ============================================================================

/// Process-wide state shared by every procedure
pub struct SmfContext {
    pub config: SmfConfig,
    pub topology: Arc<Topology>,
    pub registry: SessionRegistry,
    pub exchange: PfcpExchange,
    pub timers: SmfTimerConfigs,
    pub collaborators: Collaborators,
    pub associations: AssociationTable,
    pub ue_routing: UeRouting,
    pub recovery_time_stamp: u32,
}

impl SmfContext {
    pub fn new(
        config: SmfConfig,
        transport: Arc<dyn PfcpTransport>,
        collaborators: Collaborators,
    ) -> SmfResult<Arc<Self>> {
        let topology = Arc::new(Topology::build(&config.user_plane)?);
        let node_id: Ipv4Addr = config.smf.pfcp.node_id.parse().map_err(|_| {
            SmfError::Config(format!("invalid PFCP node_id [{}]", config.smf.pfcp.node_id))
        })?;
        let exchange = PfcpExchange::new(transport, node_id, config.smf.pfcp.port)
            .with_xact_lifetime(Duration::from_millis(config.smf.pfcp.xact_lifetime_ms));
        let timers = SmfTimerConfigs::from_conf(&config.timers);
        let ue_routing = UeRouting::build(&config.ue_routing, &topology)?;

        log::info!(
            "SMF context [{}] with {} UP node(s), PFCP node id {}",
            config.smf.name,
            topology.nodes().len(),
            node_id
        );

        Ok(Arc::new(Self {
            config,
            topology,
            registry: SessionRegistry::new(),
            exchange,
            timers,
            collaborators,
            associations: AssociationTable::default(),
            ue_routing,
            recovery_time_stamp: recovery_time_stamp_now(),
        }))
    }

    pub fn outcome_deadline(&self) -> Option<Duration> {
        self.config.smf.outcome_deadline()
    }
}

fn recovery_time_stamp_now() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    (unix + NTP_UNIX_OFFSET) as u32
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PfdConf;
    use crate::consumer::SmPolicyDecision;
    use crate::pfcp_path::PfcpHeader;
    use crate::topology::tests::LINE_TOPOLOGY;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Keeps every datagram the SMF sends
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        sent: Mutex<Vec<(SocketAddr, Bytes)>>,
        down: AtomicBool,
    }

    impl PfcpTransport for RecordingTransport {
        fn send(&self, peer: SocketAddr, datagram: Bytes) -> SmfResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(SmfError::Transport(format!("{} unreachable", peer)));
            }
            self.sent.lock().unwrap().push((peer, datagram));
            Ok(())
        }
    }

    impl RecordingTransport {
        /// Make every following send fail until switched back
        pub(crate) fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        /// Drain and decode what was sent so far
        pub(crate) fn take(&self) -> Vec<(SocketAddr, PfcpHeader, Bytes)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
                .into_iter()
                .map(|(peer, data)| {
                    let (header, body) = PfcpHeader::decode(&data).unwrap();
                    (peer, header, body)
                })
                .collect()
        }

        pub(crate) fn message_types(&self) -> Vec<u8> {
            self.take().into_iter().map(|(_, h, _)| h.message_type).collect()
        }
    }

    pub(crate) fn test_config() -> SmfConfig {
        let mut config = SmfConfig::from_str(LINE_TOPOLOGY).unwrap();
        config.smf.outcome_deadline_ms = Some(500);
        config.route_profiles.insert(
            "MEC1".to_string(),
            crate::config::RouteProfileConf {
                forwarding_policy_id: "10".to_string(),
            },
        );
        config.pfds.push(PfdConf {
            app_id: "edge".to_string(),
            flow_descriptions: vec!["permit out ip from 10.100.0.0/16 to assigned".to_string()],
        });
        config
    }

    pub(crate) fn test_context(
        collaborators: Option<Collaborators>,
    ) -> (Arc<SmfContext>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let collaborators =
            collaborators.unwrap_or_else(|| Collaborators::local(SmPolicyDecision::default()));
        let smf = SmfContext::new(test_config(), transport.clone(), collaborators).unwrap();
        (smf, transport)
    }

    fn ctx() -> SmContext {
        SmContext::new(1, "imsi-001010000000001", 5, SNssai::new(1, Some(0x010203)), "internet")
    }

    #[test]
    fn test_sm_context_new() {
        let ctx = ctx();
        assert_eq!(ctx.tag(), "imsi-001010000000001:5");
        assert!(ctx.sm_context_ref.starts_with("urn:uuid:"));
        assert!(!ctx.has_pending());
        assert_eq!(ctx.up_cnx_state, UpCnxState::Activated);
    }

    #[test]
    fn test_empty_pending_set_posts_immediately() {
        let mut ctx = ctx();
        let mut rx = ctx.begin_pending(PendingOp::Update, Vec::new());
        assert_eq!(rx.try_recv().unwrap(), PfcpOutcome::SessionUpdateSuccess);
        assert!(!ctx.has_pending());
    }

    #[test]
    fn test_pending_converges_after_all_nodes() {
        let mut ctx = ctx();
        let mut rx = ctx.begin_pending(PendingOp::Release, ["U1".to_string(), "U2".to_string()]);
        assert_eq!(ctx.node_responded("U2", true), None);
        assert_eq!(ctx.pending_nodes(), vec!["U1".to_string()]);
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.node_responded("U1", true), Some(PfcpOutcome::SessionReleaseSuccess));
        assert_eq!(rx.try_recv().unwrap(), PfcpOutcome::SessionReleaseSuccess);
    }

    #[test]
    fn test_reject_resolves_early() {
        let mut ctx = ctx();
        let mut rx = ctx.begin_pending(PendingOp::Update, ["U1".to_string(), "U2".to_string()]);
        assert_eq!(ctx.node_responded("U1", false), Some(PfcpOutcome::SessionUpdateFailed));
        assert_eq!(rx.try_recv().unwrap(), PfcpOutcome::SessionUpdateFailed);
        // Late answer is drained
        assert_eq!(ctx.node_responded("U2", true), None);
    }

    #[test]
    fn test_unknown_node_ignored() {
        let mut ctx = ctx();
        assert_eq!(ctx.node_responded("U1", true), None);
        let _rx = ctx.begin_pending(PendingOp::Update, ["U1".to_string()]);
        assert_eq!(ctx.node_responded("U9", true), None);
        assert!(ctx.has_pending());
    }

    #[tokio::test]
    async fn test_wait_outcome_deadline() {
        let mut ctx = ctx();
        let rx = ctx.begin_pending(PendingOp::Update, ["U1".to_string()]);
        let outcome = wait_outcome(rx, Some(Duration::from_millis(20))).await;
        assert_eq!(outcome, PfcpOutcome::Timeout);
        assert!(ctx.abandon_pending());
    }

    #[tokio::test]
    async fn test_wait_outcome_abandoned() {
        let mut ctx = ctx();
        let rx = ctx.begin_pending(PendingOp::Update, ["U1".to_string()]);
        ctx.abandon_pending();
        assert_eq!(wait_outcome(rx, None).await, PfcpOutcome::Timeout);
    }

    #[test]
    fn test_recovery_time_stamp() {
        assert!(recovery_time_stamp_now() > 0);
    }
}
