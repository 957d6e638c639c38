//! PFCP (Packet Forwarding Control Protocol) State Machine
//!
//! Per-UPF association state machine. Association setup is retried on the
//! association timer until the node answers or the retry budget runs out;
//! once associated, a heartbeat timer watches the node and falls back to
//! association setup when it goes silent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::context::SmfContext;
use crate::timer::{replace_timer, stop_timer, RetryTimer, SmfTimerId};
use crate::topology::{UpIpResourceInfo, UpNode};

/// PFCP FSM states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PfcpState {
    #[default]
    Initial,
    /// Association setup in progress
    WillAssociate,
    Associated,
    /// Association retries exhausted
    Exception,
}

impl PfcpState {
    pub fn name(&self) -> &'static str {
        match self {
            PfcpState::Initial => "PFCP_STATE_INITIAL",
            PfcpState::WillAssociate => "PFCP_STATE_WILL_ASSOCIATE",
            PfcpState::Associated => "PFCP_STATE_ASSOCIATED",
            PfcpState::Exception => "PFCP_STATE_EXCEPTION",
        }
    }
}

/// Association events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfcpEvent {
    Start,
    AssociationAccepted,
    AssociationRejected,
    AssociationReleased,
    HeartbeatLost,
    RetryExhausted,
}

impl PfcpEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PfcpEvent::Start => "START",
            PfcpEvent::AssociationAccepted => "ASSOCIATION_ACCEPTED",
            PfcpEvent::AssociationRejected => "ASSOCIATION_REJECTED",
            PfcpEvent::AssociationReleased => "ASSOCIATION_RELEASED",
            PfcpEvent::HeartbeatLost => "HEARTBEAT_LOST",
            PfcpEvent::RetryExhausted => "RETRY_EXHAUSTED",
        }
    }
}

/// Result of PFCP FSM event handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfcpFsmResult {
    Transition(PfcpState),
    Ignored,
}

/// PFCP State Machine for one UPF
#[derive(Debug, Clone)]
pub struct PfcpFsm {
    state: PfcpState,
    node: String,
}

impl PfcpFsm {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            state: PfcpState::Initial,
            node: node.into(),
        }
    }

    pub fn state(&self) -> PfcpState {
        self.state
    }

    pub fn is_associated(&self) -> bool {
        self.state == PfcpState::Associated
    }

    pub fn dispatch(&mut self, event: PfcpEvent) -> PfcpFsmResult {
        use PfcpState::*;
        let target = match (self.state, event) {
            (Initial | Exception, PfcpEvent::Start) => WillAssociate,
            (WillAssociate | Exception, PfcpEvent::AssociationAccepted) => Associated,
            (Associated, PfcpEvent::AssociationAccepted) => {
                log::warn!("[{}] association accepted while already associated", self.node);
                return PfcpFsmResult::Ignored;
            }
            (Associated, PfcpEvent::AssociationReleased | PfcpEvent::HeartbeatLost) => WillAssociate,
            (WillAssociate, PfcpEvent::RetryExhausted) => Exception,
            (WillAssociate, PfcpEvent::AssociationRejected) => WillAssociate,
            (state, event) => {
                log::debug!("[{}] {} ignored in {}", self.node, event.name(), state.name());
                return PfcpFsmResult::Ignored;
            }
        };

        if self.state != target {
            log::debug!(
                "[{}] PFCP state transition: {} -> {} ({})",
                self.node,
                self.state.name(),
                target.name(),
                event.name()
            );
        }
        self.state = target;
        PfcpFsmResult::Transition(target)
    }
}

// ============================================================================
// Association table
// ============================================================================

struct NodeAssociation {
    fsm: PfcpFsm,
    association_timer: Option<RetryTimer>,
    heartbeat_timer: Option<RetryTimer>,
}

impl NodeAssociation {
    fn new(node: &str) -> Self {
        Self {
            fsm: PfcpFsm::new(node),
            association_timer: None,
            heartbeat_timer: None,
        }
    }
}

/// Association state of every UPF, keyed by node name
#[derive(Default)]
pub struct AssociationTable {
    nodes: Mutex<HashMap<String, NodeAssociation>>,
}

impl AssociationTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, NodeAssociation>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_node<R>(&self, node: &str, f: impl FnOnce(&mut NodeAssociation) -> R) -> R {
        let mut nodes = self.lock();
        let entry = nodes
            .entry(node.to_string())
            .or_insert_with(|| NodeAssociation::new(node));
        f(entry)
    }

    pub fn state(&self, node: &str) -> PfcpState {
        self.lock()
            .get(node)
            .map(|n| n.fsm.state())
            .unwrap_or_default()
    }

    /// Stop every timer
    pub fn clear(&self) {
        self.lock().clear();
    }
}

// ============================================================================
// Association procedures
// ============================================================================

impl SmfContext {
    /// Start association setup towards every UPF in the topology
    pub fn associate_all(self: &Arc<Self>) {
        for node in self.topology.upfs() {
            self.start_association(node.clone());
        }
    }

    fn send_association_setup(&self, node: &UpNode) {
        if let Err(e) = self
            .exchange
            .send_association_setup_request(node, self.recovery_time_stamp)
        {
            log::error!("[{}] association setup request failed: {}", node.name, e);
        }
    }

    /// Enter association setup and arm its retry timer
    pub fn start_association(self: &Arc<Self>, node: Arc<UpNode>) {
        let weak = Arc::downgrade(self);
        let on_retry = {
            let weak = weak.clone();
            let node = node.clone();
            move |retry: u32| {
                if let Some(smf) = weak.upgrade() {
                    log::warn!("[{}] retry association setup ({})", node.name, retry);
                    smf.send_association_setup(&node);
                }
            }
        };
        let on_exhausted = {
            let node = node.clone();
            move || {
                if let Some(smf) = weak.upgrade() {
                    log::error!("[{}] association setup gave up", node.name);
                    smf.exchange.forget_node(&node.name);
                    smf.associations.with_node(&node.name, |n| {
                        n.fsm.dispatch(PfcpEvent::RetryExhausted);
                        n.association_timer = None;
                    });
                }
            }
        };

        let config = self.timers.get(SmfTimerId::PfcpAssociation);
        self.associations.with_node(&node.name, |n| {
            n.fsm.dispatch(PfcpEvent::Start);
            stop_timer(&mut n.heartbeat_timer);
            replace_timer(
                &mut n.association_timer,
                RetryTimer::start(SmfTimerId::PfcpAssociation, config, on_retry, on_exhausted),
            );
        });
        self.send_association_setup(&node);
    }

    /// Association setup completed in either direction
    pub fn association_established(
        self: &Arc<Self>,
        node: &Arc<UpNode>,
        up_ip_resource: Option<UpIpResourceInfo>,
        recovery_time_stamp: Option<u32>,
    ) {
        node.set_associated(up_ip_resource, recovery_time_stamp);
        let result = self.associations.with_node(&node.name, |n| {
            let result = n.fsm.dispatch(PfcpEvent::AssociationAccepted);
            stop_timer(&mut n.association_timer);
            result
        });
        if result == PfcpFsmResult::Transition(PfcpState::Associated) {
            log::info!("[{}] PFCP associated", node.name);
            self.arm_heartbeat(node);
        }
    }

    pub fn association_rejected(&self, node: &UpNode, cause: u8) {
        log::warn!("[{}] association setup rejected (cause={})", node.name, cause);
        self.associations
            .with_node(&node.name, |n| n.fsm.dispatch(PfcpEvent::AssociationRejected));
    }

    /// The UPF released the association; set it up again
    pub fn association_released(self: &Arc<Self>, node: &Arc<UpNode>) {
        node.set_not_associated();
        log::info!("[{}] PFCP de-associated", node.name);
        self.associations
            .with_node(&node.name, |n| n.fsm.dispatch(PfcpEvent::AssociationReleased));
        self.start_association(node.clone());
    }

    /// Heartbeat response received: restart the watch
    pub fn heartbeat_answered(self: &Arc<Self>, node: &Arc<UpNode>) {
        if self.associations.state(&node.name) == PfcpState::Associated {
            self.arm_heartbeat(node);
        }
    }

    fn arm_heartbeat(self: &Arc<Self>, node: &Arc<UpNode>) {
        let weak: Weak<SmfContext> = Arc::downgrade(self);
        let on_expire = {
            let weak = weak.clone();
            let node = node.clone();
            move |_retry: u32| {
                if let Some(smf) = weak.upgrade() {
                    if let Err(e) = smf.exchange.send_heartbeat_request(&node, smf.recovery_time_stamp) {
                        log::error!("[{}] heartbeat request failed: {}", node.name, e);
                    }
                }
            }
        };
        let on_exhausted = {
            let node = node.clone();
            move || {
                if let Some(smf) = weak.upgrade() {
                    log::warn!("[{}] no heartbeat", node.name);
                    smf.exchange.forget_node(&node.name);
                    node.set_not_associated();
                    smf.associations
                        .with_node(&node.name, |n| n.fsm.dispatch(PfcpEvent::HeartbeatLost));
                    smf.start_association(node.clone());
                }
            }
        };

        let config = self.timers.get(SmfTimerId::PfcpNoHeartbeat);
        self.associations.with_node(&node.name, |n| {
            replace_timer(
                &mut n.heartbeat_timer,
                RetryTimer::start(SmfTimerId::PfcpNoHeartbeat, config, on_expire, on_exhausted),
            );
        });
    }
}
