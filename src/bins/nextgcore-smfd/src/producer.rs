//! Nsmf_PDUSession Producer
//!
//! SM context create, update and release as the AMF drives them. Each
//! procedure runs under the context fence: it changes the context, pushes
//! the rule sync to the UPFs and then waits for the single outcome of the
//! pending node set before answering.

use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::consumer::{
    N1N2Message, N2SmInfoType, NfType, PccRule, PolicyAssociationRequest, SmContextStatus,
    SmPolicyDecision, SubscriptionData,
};
use crate::context::{
    wait_outcome, PendingOp, PfcpOutcome, PfcpSessionContext, SessionHandle, SmContext, SmfContext,
    UpCnxState,
};
use crate::datapath::{AnTunnel, DataPath, DEFAULT_PRECEDENCE, ULCL_PRECEDENCE};
use crate::error::{SmfError, SmfResult};
use crate::gsm::{message_type, GsmCause, GsmMessage};
use crate::n4_handler::sbi_status;
use crate::pool::{allocate_ue_ip, release_ue_ip};
use crate::rule::OuterHeaderCreation;
use crate::sess_sm::{SmEvent, SmState};
use crate::timer::{replace_timer, stop_timer, RetryTimer, SmfTimerId};
use crate::topology::{SNssai, UpNode};
use crate::ulcl::{SpecificPath, UlclState};

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone)]
pub struct CreateSmContextRequest {
    pub supi: String,
    pub psi: u8,
    pub dnn: String,
    pub snssai: SNssai,
    /// PDU session establishment request
    pub n1_sm_msg: Bytes,
    pub sm_context_status_uri: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSmContextResponse {
    pub status: u16,
    pub sm_context_ref: Option<String>,
    pub ue_ipv4: Option<Ipv4Addr>,
    /// Establishment reject when the session could not be set up
    pub n1_sm_msg: Option<Bytes>,
}

impl CreateSmContextResponse {
    pub fn is_created(&self) -> bool {
        self.status == sbi_status::CREATED
    }
}

/// N2 SM information the AMF relays from the access network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum N2SmInfo {
    PduResSetupRsp(AnTunnel),
    PduResSetupFail,
    PduResRelRsp,
    PathSwitchReq(AnTunnel),
    HandoverReqAck(AnTunnel),
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSmContextRequest {
    pub n1_sm_msg: Option<Bytes>,
    pub up_cnx_state: Option<UpCnxState>,
    pub n2_sm_info: Option<N2SmInfo>,
    /// Release due to a duplicate PDU session id
    pub release: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSmContextResponse {
    pub status: u16,
    pub n1_sm_msg: Option<Bytes>,
    pub n2_sm_info_type: Option<N2SmInfoType>,
    pub up_cnx_state: Option<UpCnxState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseSmContextResponse {
    pub status: u16,
}

/// What an update decided while holding the context
#[derive(Default)]
struct UpdatePlan {
    modify: bool,
    /// Deletion already sent
    release: Option<oneshot::Receiver<PfcpOutcome>>,
    terminate_policy: Option<String>,
    /// Nothing is left of the context; notify and drop it
    finished: bool,
}

// ============================================================================
// Create
// ============================================================================

impl SmfContext {
    pub async fn create_session(self: &Arc<Self>, req: CreateSmContextRequest) -> CreateSmContextResponse {
        let tag = format!("{}:{}", req.supi, req.psi);
        let request = match self.collaborators.nas.decode(&req.n1_sm_msg) {
            Ok(msg) if msg.message_type == message_type::PDU_SESSION_ESTABLISHMENT_REQUEST => msg,
            Ok(msg) => {
                log::error!("[{}] unexpected N1 message type 0x{:02x}", tag, msg.message_type);
                return CreateSmContextResponse {
                    status: sbi_status::FORBIDDEN,
                    ..Default::default()
                };
            }
            Err(e) => {
                log::error!("[{}] N1 decode failed: {}", tag, e);
                return CreateSmContextResponse {
                    status: sbi_status::FORBIDDEN,
                    ..Default::default()
                };
            }
        };

        if let Some(old) = self.registry.find_by_supi_psi(&req.supi, req.psi) {
            log::warn!("[{}] duplicate SM context [{}], releasing it", tag, old.sm_context_ref());
            let old_uri = old.lock().status_uri.clone();
            let notify_uri = old_uri.filter(|uri| Some(uri.as_str()) != req.sm_context_status_uri.as_deref());
            let _old_fence = old.fence().await;
            self.release_locally(old.clone(), notify_uri).await;
        }

        let handle = self.registry.create(&req.supi, req.psi, req.snssai, &req.dnn);
        let _fence = handle.fence().await;
        {
            let mut ctx = handle.lock();
            ctx.pti = request.pti;
            ctx.status_uri = req.sm_context_status_uri.clone();
            if self.config.smf.ulcl && self.ue_routing.group_of(&req.supi).is_some() {
                log::info!("[{}] has pre-configured UE routes", tag);
                ctx.ulcl = Some(UlclState::Uninitialized);
            }
        }
        log::info!("[{}] [Added] SM context [{}]", tag, handle.sm_context_ref());

        let subscription = self.session_subscription(&tag, &req).await;
        let rx = match self.prepare_session(&handle, subscription).await {
            Ok(rx) => rx,
            Err(e) => {
                log::error!("[{}] PDU session establishment failed: {}", tag, e);
                let cause = if e.is_insufficient_resources() {
                    GsmCause::InsufficientResourcesForSpecificSliceAndDnn
                } else {
                    GsmCause::NetworkFailure
                };
                self.release_locally(handle.clone(), None).await;
                return self.establishment_reject(&req, request.pti, sbi_status::INTERNAL_SERVER_ERROR, cause);
            }
        };

        let outcome = wait_outcome(rx, self.outcome_deadline()).await;
        let established = {
            let mut ctx = handle.lock();
            if outcome == PfcpOutcome::Timeout && ctx.abandon_pending() {
                log::warn!("[{}] no PFCP outcome within the deadline", tag);
            }
            if outcome.is_success() {
                ctx.fsm.dispatch(SmEvent::UpdateSuccess);
                Some(ctx.ue_ipv4())
            } else {
                ctx.fsm.dispatch(SmEvent::EstablishmentFailed);
                None
            }
        };

        let Some(ue_ipv4) = established else {
            log::error!("[{}] PFCP establishment: {}", tag, outcome.name());
            self.release_locally(handle.clone(), None).await;
            let status = if outcome == PfcpOutcome::Timeout {
                sbi_status::GATEWAY_TIMEOUT
            } else {
                sbi_status::INTERNAL_SERVER_ERROR
            };
            return self.establishment_reject(&req, request.pti, status, GsmCause::NetworkFailure);
        };

        let accept = self
            .collaborators
            .nas
            .encode(&GsmMessage::establishment_accept(req.psi, request.pti, ue_ipv4));
        let msg = N1N2Message {
            psi: req.psi,
            n1: Some(accept),
            n2: Some(N2SmInfoType::PduResSetupReq),
        };
        if let Err(e) = self.collaborators.amf.n1n2_message_transfer(&req.supi, msg).await {
            log::error!("[{}] N1N2 message transfer failed: {}", tag, e);
        }

        CreateSmContextResponse {
            status: sbi_status::CREATED,
            sm_context_ref: Some(handle.sm_context_ref().to_string()),
            ue_ipv4,
            n1_sm_msg: None,
        }
    }

    async fn session_subscription(&self, tag: &str, req: &CreateSmContextRequest) -> SubscriptionData {
        match self.collaborators.discovery.discover(NfType::Udm).await {
            Ok(profiles) => log::debug!("[{}] {} UDM instance(s)", tag, profiles.len()),
            Err(e) => log::warn!("[{}] UDM discovery: {}", tag, e),
        }
        match self
            .collaborators
            .subscriber_data
            .get_session_subscription_data(&req.supi, &req.snssai, &req.dnn)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                log::warn!("[{}] session subscription data: {}, using defaults", tag, e);
                SubscriptionData::default()
            }
        }
    }

    /// UE IP, policy, default path and the first rule sync
    async fn prepare_session(
        &self,
        handle: &SessionHandle,
        subscription: SubscriptionData,
    ) -> SmfResult<oneshot::Receiver<PfcpOutcome>> {
        let policy_req = {
            let mut ctx = handle.lock();
            ctx.default_5qi = subscription.default_5qi;
            ctx.ambr = subscription.session_ambr;
            ctx.selection.pdu_address = subscription.static_ipv4;

            let alloc = allocate_ue_ip(&self.topology, &ctx.selection)?;
            log::info!(
                "[{}] UE IP [{}] from {} pool of [{}]",
                ctx.tag(),
                alloc.addr,
                alloc.kind.name(),
                alloc.upf.name
            );
            ctx.ue_ip = Some(alloc);
            PolicyAssociationRequest {
                supi: ctx.supi.clone(),
                psi: ctx.psi,
                dnn: ctx.dnn.clone(),
                snssai: ctx.snssai,
                ue_ipv4: ctx.ue_ipv4(),
            }
        };

        let (policy_id, decision) = self.collaborators.policy.create_policy_association(&policy_req).await?;

        {
            let mut guard = handle.lock();
            let ctx = &mut *guard;
            ctx.policy_id = Some(policy_id);
            self.apply_sm_policy_from_decision(ctx, &decision);
            self.create_default_path(ctx)?;
            ctx.fsm.dispatch(SmEvent::EstablishmentStarted);
        }
        Ok(self.send_pfcp_rules(handle).await)
    }

    /// Path from the access side to the UPF owning the UE address
    fn create_default_path(&self, ctx: &mut SmContext) -> SmfResult<u32> {
        let anchor = ctx
            .ue_ip
            .as_ref()
            .map(|alloc| alloc.upf.clone())
            .ok_or_else(|| SmfError::NotFound("UE IP not allocated".to_string()))?;
        let source = self.topology.source()?;
        let nodes = self.topology.find_path_to(&source.name, &anchor.name, &ctx.selection)?;
        let mut path = DataPath::generate(nodes.get(1..).unwrap_or_default())?;
        path.is_default = true;

        let params = ctx.path_params(DEFAULT_PRECEDENCE);
        path.activate(&mut ctx.rules, &params)?;
        log::info!("[{}] default path [{}]", ctx.tag(), path.describe());
        Ok(ctx.tunnel.add_data_path(path))
    }

    fn establishment_reject(
        &self,
        req: &CreateSmContextRequest,
        pti: u8,
        status: u16,
        cause: GsmCause,
    ) -> CreateSmContextResponse {
        let n1 = self
            .collaborators
            .nas
            .encode(&GsmMessage::establishment_reject(req.psi, pti, cause));
        CreateSmContextResponse {
            status,
            n1_sm_msg: Some(n1),
            ..Default::default()
        }
    }
}

// ============================================================================
// Update
// ============================================================================

impl SmfContext {
    pub async fn update_session(
        self: &Arc<Self>,
        sm_context_ref: &str,
        req: UpdateSmContextRequest,
    ) -> UpdateSmContextResponse {
        let Some(handle) = self.registry.find_by_ref(sm_context_ref) else {
            log::warn!("SM context [{}] not found", sm_context_ref);
            return UpdateSmContextResponse {
                status: sbi_status::NOT_FOUND,
                up_cnx_state: Some(UpCnxState::Deactivated),
                ..Default::default()
            };
        };
        let _fence = handle.fence().await;

        let gsm = match &req.n1_sm_msg {
            Some(n1) => match self.collaborators.nas.decode(n1) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    log::error!("[{}] N1 decode failed: {}", handle.lock().tag(), e);
                    return UpdateSmContextResponse {
                        status: sbi_status::FORBIDDEN,
                        ..Default::default()
                    };
                }
            },
            None => None,
        };

        let mut rsp = UpdateSmContextResponse {
            status: sbi_status::OK,
            ..Default::default()
        };
        let (plan, tag) = {
            let mut guard = handle.lock();
            let ctx = &mut *guard;
            let plan = self.apply_update(&handle, ctx, gsm, &req, &mut rsp);
            (plan, ctx.tag())
        };

        if let Some(policy_id) = &plan.terminate_policy {
            self.terminate_policy(&tag, policy_id).await;
        }

        let pending = match plan.release {
            Some(rx) => Some((PendingOp::Release, rx)),
            None if plan.modify => {
                handle.lock().fsm.dispatch(SmEvent::PfcpDispatched);
                Some((PendingOp::Update, self.send_pfcp_rules(&handle).await))
            }
            None => None,
        };

        let Some((op, rx)) = pending else {
            {
                let mut ctx = handle.lock();
                if ctx.fsm.is_state(SmState::ModificationPending) {
                    ctx.fsm.dispatch(SmEvent::ModificationDone);
                }
            }
            if plan.finished {
                self.finish_release(&handle);
            }
            return rsp;
        };

        let outcome = wait_outcome(rx, self.outcome_deadline()).await;
        let finished = {
            let mut guard = handle.lock();
            let ctx = &mut *guard;
            if outcome == PfcpOutcome::Timeout && ctx.abandon_pending() {
                log::warn!("[{}] no PFCP outcome within the deadline", tag);
            }
            let failure_status = if outcome == PfcpOutcome::Timeout {
                sbi_status::GATEWAY_TIMEOUT
            } else {
                sbi_status::INTERNAL_SERVER_ERROR
            };

            match (op, outcome.is_success()) {
                (PendingOp::Update, true) => {
                    ctx.fsm.dispatch(SmEvent::UpdateSuccess);
                    false
                }
                (PendingOp::Update, false) => {
                    log::error!("[{}] PFCP modification: {}", tag, outcome.name());
                    ctx.fsm.dispatch(SmEvent::UpdateFailed);
                    rsp.status = failure_status;
                    false
                }
                (PendingOp::Release, true) => {
                    ctx.fsm.dispatch(SmEvent::ReleaseSuccess);
                    ctx.pfcp.clear();
                    ctx.release_due_to_duplicate
                }
                (PendingOp::Release, false) => {
                    log::error!("[{}] PFCP release: {}", tag, outcome.name());
                    ctx.fsm.dispatch(SmEvent::ReleaseFailed);
                    stop_timer(&mut ctx.t3592);
                    let reject = GsmMessage::new(ctx.psi, ctx.pti, message_type::PDU_SESSION_RELEASE_REJECT)
                        .with_cause(GsmCause::NetworkFailure);
                    rsp.status = failure_status;
                    rsp.n1_sm_msg = Some(self.collaborators.nas.encode(&reject));
                    rsp.n2_sm_info_type = None;
                    false
                }
            }
        };

        if finished {
            self.finish_release(&handle);
        }
        rsp
    }

    /// Context changes of one update, in N1, UP connection state, N2 and
    /// release flag order
    fn apply_update(
        &self,
        handle: &Arc<SessionHandle>,
        ctx: &mut SmContext,
        gsm: Option<GsmMessage>,
        req: &UpdateSmContextRequest,
        rsp: &mut UpdateSmContextResponse,
    ) -> UpdatePlan {
        let tag = ctx.tag();
        let mut plan = UpdatePlan::default();

        if let Some(msg) = gsm {
            match msg.message_type {
                message_type::PDU_SESSION_RELEASE_REQUEST => {
                    log::info!("[{}] PDU session release request", tag);
                    ctx.pti = msg.pti;
                    self.free_ue_ip(ctx);
                    plan.terminate_policy = ctx.policy_id.take();

                    let command = self.collaborators.nas.encode(&GsmMessage::release_command(
                        ctx.psi,
                        ctx.pti,
                        GsmCause::RegularDeactivation,
                    ));
                    self.start_nas_timer(handle, ctx, SmfTimerId::T3592, command.clone());
                    rsp.n1_sm_msg = Some(command);
                    rsp.n2_sm_info_type = Some(N2SmInfoType::PduResRelCmd);

                    plan.release = Some(self.release_tunnel(ctx));
                    ctx.fsm.dispatch(SmEvent::PfcpDispatched);
                }
                message_type::PDU_SESSION_RELEASE_COMPLETE => {
                    log::info!("[{}] PDU session release complete", tag);
                    ctx.fsm.dispatch(SmEvent::ReleaseCompleted);
                    stop_timer(&mut ctx.t3592);
                    ctx.up_cnx_state = UpCnxState::Deactivated;
                    rsp.up_cnx_state = Some(UpCnxState::Deactivated);
                    plan.finished = ctx.tunnel.an_tunnel.is_none();
                }
                message_type::PDU_SESSION_MODIFICATION_REQUEST => {
                    log::info!("[{}] PDU session modification request", tag);
                    ctx.pti = msg.pti;
                    let command = self
                        .collaborators
                        .nas
                        .encode(&GsmMessage::modification_command(ctx.psi, ctx.pti));
                    self.start_nas_timer(handle, ctx, SmfTimerId::T3591, command.clone());
                    rsp.n1_sm_msg = Some(command);
                    rsp.n2_sm_info_type = Some(N2SmInfoType::PduResModReq);
                    return plan;
                }
                message_type::PDU_SESSION_MODIFICATION_COMPLETE
                | message_type::PDU_SESSION_MODIFICATION_COMMAND_REJECT => {
                    log::debug!("[{}] modification procedure ended (0x{:02x})", tag, msg.message_type);
                    stop_timer(&mut ctx.t3591);
                }
                other => log::warn!("[{}] unexpected N1 message type 0x{:02x}", tag, other),
            }
        }

        match req.up_cnx_state {
            Some(UpCnxState::Activating) => {
                ctx.fsm.dispatch(SmEvent::ModificationStarted);
                ctx.up_cnx_state = UpCnxState::Activating;
                rsp.up_cnx_state = Some(UpCnxState::Activating);
                rsp.n2_sm_info_type = Some(N2SmInfoType::PduResSetupReq);
            }
            Some(UpCnxState::Deactivated) => {
                rsp.up_cnx_state = Some(UpCnxState::Deactivated);
                if ctx.fsm.is_state(SmState::InactivePending) {
                    log::info!("[{}] already released, no PFCP modification", tag);
                    return plan;
                }
                ctx.fsm.dispatch(SmEvent::ModificationStarted);
                ctx.up_cnx_state = UpCnxState::Deactivated;
                if ctx.tunnel.set_an_tunnel(&mut ctx.rules, None) {
                    plan.modify = true;
                } else {
                    log::warn!("[{}] access network resource already released", tag);
                }
            }
            Some(UpCnxState::Activated) | None => {}
        }

        if let Some(n2) = req.n2_sm_info {
            match n2 {
                N2SmInfo::PduResSetupRsp(an) | N2SmInfo::PathSwitchReq(an) | N2SmInfo::HandoverReqAck(an) => {
                    ctx.fsm.dispatch(SmEvent::ModificationStarted);
                    ctx.up_cnx_state = UpCnxState::Activated;
                    log::info!("[{}] AN tunnel [{}] teid={:#x}", tag, an.ipv4, an.teid);
                    plan.modify |= ctx.tunnel.set_an_tunnel(&mut ctx.rules, Some(an));
                    plan.modify |= self.add_ulcl_branches(ctx);
                    match n2 {
                        N2SmInfo::PathSwitchReq(_) => rsp.n2_sm_info_type = Some(N2SmInfoType::PathSwitchReqAck),
                        N2SmInfo::HandoverReqAck(_) => rsp.n2_sm_info_type = Some(N2SmInfoType::HandoverCmd),
                        _ => {}
                    }
                }
                N2SmInfo::PduResSetupFail => log::warn!("[{}] PDU session resource setup failed", tag),
                N2SmInfo::PduResRelRsp => {
                    log::info!("[{}] PDU session resource released", tag);
                    ctx.tunnel.an_tunnel = None;
                    if ctx.fsm.is_state(SmState::Inactive) {
                        plan.finished = true;
                    }
                }
            }
        }

        if req.release {
            log::info!("[{}] release due to duplicate PDU session id", tag);
            ctx.release_due_to_duplicate = true;
            let state = ctx.fsm.state();
            match state {
                SmState::ActivePending | SmState::ModificationPending | SmState::Active
                    if plan.release.is_none() =>
                {
                    rsp.n2_sm_info_type = Some(N2SmInfoType::PduResRelCmd);
                    self.free_ue_ip(ctx);
                    plan.terminate_policy = ctx.policy_id.take();
                    plan.release = Some(self.release_tunnel(ctx));
                    plan.modify = false;
                    ctx.fsm.dispatch(SmEvent::PfcpDispatched);
                }
                _ => log::info!("[{}] no PFCP release in {}", tag, state.name()),
            }
        }

        plan
    }

    /// SM policy update notification from the PCF. Returns the SBI status.
    pub async fn update_sm_policy(self: &Arc<Self>, sm_context_ref: &str, decision: &SmPolicyDecision) -> u16 {
        let Some(handle) = self.registry.find_by_ref(sm_context_ref) else {
            log::warn!("SM context [{}] not found", sm_context_ref);
            return sbi_status::NOT_FOUND;
        };
        let _fence = handle.fence().await;
        {
            let mut guard = handle.lock();
            let ctx = &mut *guard;
            ctx.fsm.dispatch(SmEvent::ModificationStarted);
            self.apply_sm_policy_from_decision(ctx, decision);
            ctx.fsm.dispatch(SmEvent::PfcpDispatched);
        }

        let rx = self.send_pfcp_rules(&handle).await;
        let outcome = wait_outcome(rx, self.outcome_deadline()).await;
        let mut ctx = handle.lock();
        if outcome == PfcpOutcome::Timeout {
            ctx.abandon_pending();
        }
        if outcome.is_success() {
            ctx.fsm.dispatch(SmEvent::UpdateSuccess);
            sbi_status::NO_CONTENT
        } else {
            log::error!("[{}] policy update: {}", ctx.tag(), outcome.name());
            ctx.fsm.dispatch(SmEvent::UpdateFailed);
            sbi_status::INTERNAL_SERVER_ERROR
        }
    }
}

// ============================================================================
// Release
// ============================================================================

impl SmfContext {
    pub async fn release_session(self: &Arc<Self>, sm_context_ref: &str) -> ReleaseSmContextResponse {
        let Some(handle) = self.registry.find_by_ref(sm_context_ref) else {
            log::warn!("SM context [{}] not found", sm_context_ref);
            return ReleaseSmContextResponse {
                status: sbi_status::NOT_FOUND,
            };
        };
        let _fence = handle.fence().await;

        let (rx, policy_id, tag, dispatched) = {
            let mut guard = handle.lock();
            let ctx = &mut *guard;
            ctx.stop_timers();
            self.free_ue_ip(ctx);
            let policy_id = ctx.policy_id.take();
            let dispatched = matches!(
                ctx.fsm.state(),
                SmState::ActivePending | SmState::Active | SmState::ModificationPending | SmState::PfcpModification
            );
            let rx = if dispatched {
                let rx = self.release_tunnel(ctx);
                ctx.fsm.dispatch(SmEvent::PfcpDispatched);
                rx
            } else {
                ctx.begin_pending(PendingOp::Release, Vec::new())
            };
            (rx, policy_id, ctx.tag(), dispatched)
        };

        if let Some(policy_id) = &policy_id {
            self.terminate_policy(&tag, policy_id).await;
        }

        let outcome = wait_outcome(rx, self.outcome_deadline()).await;
        let status = {
            let mut ctx = handle.lock();
            if outcome == PfcpOutcome::Timeout {
                ctx.abandon_pending();
            }
            if outcome.is_success() {
                if dispatched {
                    ctx.fsm.dispatch(SmEvent::ReleaseSuccess);
                }
                ctx.fsm.dispatch(SmEvent::ReleaseCompleted);
                ctx.pfcp.clear();
                sbi_status::NO_CONTENT
            } else {
                log::error!("[{}] PFCP release: {}", tag, outcome.name());
                ctx.fsm.dispatch(SmEvent::ReleaseFailed);
                if outcome == PfcpOutcome::Timeout {
                    sbi_status::GATEWAY_TIMEOUT
                } else {
                    sbi_status::INTERNAL_SERVER_ERROR
                }
            }
        };

        self.remove_context(&handle);
        log::info!("[{}] [Removed] SM context", tag);
        ReleaseSmContextResponse { status }
    }

    /// Tear a context down without an AMF exchange. Deletion goes out to
    /// every established UPF; the registry entry goes once they answered,
    /// in the background when anything is pending.
    async fn release_locally(self: &Arc<Self>, handle: Arc<SessionHandle>, notify_uri: Option<String>) {
        let (rx, policy_id, tag, waiting) = {
            let mut guard = handle.lock();
            let ctx = &mut *guard;
            ctx.stop_timers();
            self.free_ue_ip(ctx);
            let rx = self.release_tunnel(ctx);
            ctx.fsm.dispatch(SmEvent::LocalRelease);
            (rx, ctx.policy_id.take(), ctx.tag(), ctx.has_pending())
        };

        if let Some(policy_id) = &policy_id {
            self.terminate_policy(&tag, policy_id).await;
        }

        let smf = self.clone();
        let finish = async move {
            let outcome = wait_outcome(rx, smf.outcome_deadline()).await;
            if outcome == PfcpOutcome::Timeout {
                handle.lock().abandon_pending();
            }
            if !outcome.is_success() {
                log::warn!("[{}] local release: {}", tag, outcome.name());
            }
            if let Some(uri) = notify_uri {
                smf.notify_released(&tag, uri);
            }
            smf.remove_context(&handle);
            log::info!("[{}] [Removed] SM context (local release)", tag);
        };

        if waiting {
            tokio::spawn(finish);
        } else {
            finish.await;
        }
    }

    /// Nothing is left of the context: tell the AMF and drop it
    fn finish_release(&self, handle: &SessionHandle) {
        let (tag, uri) = {
            let mut ctx = handle.lock();
            if !ctx.fsm.is_state(SmState::Inactive) {
                ctx.fsm.dispatch(SmEvent::ReleaseCompleted);
            }
            ctx.stop_timers();
            (ctx.tag(), ctx.status_uri.clone())
        };
        if let Some(uri) = uri {
            self.notify_released(&tag, uri);
        }
        self.remove_context(handle);
        log::info!("[{}] [Removed] SM context", tag);
    }

    fn notify_released(&self, tag: &str, uri: String) {
        let notifier = self.collaborators.notification.clone();
        let tag = tag.to_string();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_status(&uri, SmContextStatus::Released).await {
                log::warn!("[{}] status notification failed: {}", tag, e);
            }
        });
    }

    async fn terminate_policy(&self, tag: &str, policy_id: &str) {
        if let Err(e) = self.collaborators.policy.terminate_policy_association(policy_id).await {
            log::error!("[{}] SM policy association termination: {}", tag, e);
        }
    }

    fn free_ue_ip(&self, ctx: &mut SmContext) {
        if let Some(alloc) = ctx.ue_ip.take() {
            log::info!("[{}] release UE IP [{}]", ctx.tag(), alloc.addr);
            release_ue_ip(&alloc.upf, alloc.addr, alloc.kind);
        }
    }
}

// ============================================================================
// PFCP
// ============================================================================

impl SmfContext {
    /// Send every changed rule set to its UPF: establishment for a node
    /// without a PFCP session, modification otherwise. The returned channel
    /// yields the outcome once every node answered.
    async fn send_pfcp_rules(&self, handle: &SessionHandle) -> oneshot::Receiver<PfcpOutcome> {
        let (rx, nodes, tag) = {
            let mut guard = handle.lock();
            let ctx = &mut *guard;
            let tag = ctx.tag();
            let id = ctx.id;
            let mut nodes = Vec::new();

            for (name, set) in ctx.rules.iter() {
                if set.partition().is_empty() {
                    continue;
                }
                let Some(node) = self.topology.node(name) else {
                    log::warn!("[{}] rules for unknown node [{}]", tag, name);
                    continue;
                };
                ctx.pfcp
                    .entry(name.clone())
                    .or_insert_with(|| PfcpSessionContext::new(node.clone(), self.registry.allocate_seid(id)));
                nodes.push(node);
            }

            let rx = ctx.begin_pending(PendingOp::Update, nodes.iter().map(|n| n.name.clone()));
            (rx, nodes, tag)
        };

        for node in &nodes {
            if let Err(e) = self.dispatch_rule_sync(handle, node).await {
                log::error!("[{}] [{}] rule sync not sent: {}", tag, node.name, e);
                handle.lock().node_responded(&node.name, false);
            }
        }
        rx
    }

    /// Establishment is retried on transport errors with a fixed backoff
    async fn dispatch_rule_sync(&self, handle: &SessionHandle, node: &UpNode) -> SmfResult<u32> {
        let establishing = handle
            .lock()
            .pfcp
            .get(&node.name)
            .is_some_and(|p| !p.is_established());
        let retry = &self.config.smf.pfcp_retry;
        let max_retry = if establishing { retry.max_retry } else { 0 };

        let mut attempt = 0;
        loop {
            match self.send_rule_sync(handle, node) {
                Err(SmfError::Transport(e)) if attempt < max_retry => {
                    attempt += 1;
                    log::warn!(
                        "[{}] establishment send failed ({}), retry {}/{}",
                        node.name,
                        e,
                        attempt,
                        max_retry
                    );
                    tokio::time::sleep(Duration::from_millis(retry.backoff_ms)).await;
                }
                result => return result,
            }
        }
    }

    /// Put one node's changed rules on the wire. The rule states are
    /// committed only once the request left; removed rules stay parked
    /// under its sequence number. On error nothing changes and the next
    /// sync sends the same sections again.
    fn send_rule_sync(&self, handle: &SessionHandle, node: &UpNode) -> SmfResult<u32> {
        let mut guard = handle.lock();
        let ctx = &mut *guard;
        let (Some(set), Some(pfcp)) = (ctx.rules.get_mut(&node.name), ctx.pfcp.get_mut(&node.name)) else {
            return Err(SmfError::NotFound(format!("PFCP session on [{}]", node.name)));
        };

        let sections = set.partition();
        let seq = match pfcp.remote_seid {
            Some(remote_seid) => {
                self.exchange
                    .send_modification_request(node, pfcp.local_seid, remote_seid, &sections)?
            }
            None => self.exchange.send_establishment_request(
                node,
                pfcp.local_seid,
                &sections,
                &ctx.dnn,
                &ctx.snssai,
            )?,
        };
        pfcp.park(seq, set.commit_sync());
        Ok(seq)
    }

    /// Deactivate every path and send a deletion to each UPF holding a PFCP
    /// session. Rule ids of a node without one go straight back to its id
    /// space; the others wait for the deletion answer.
    fn release_tunnel(&self, ctx: &mut SmContext) -> oneshot::Receiver<PfcpOutcome> {
        let tag = ctx.tag();
        ctx.tunnel.deactivate_all(&mut ctx.rules);
        ctx.tunnel.data_paths.clear();
        let mut rules = std::mem::take(&mut ctx.rules);

        let mut pending = Vec::new();
        for (name, pfcp) in ctx.pfcp.iter_mut() {
            let retired = rules.remove(name).map(|mut set| set.drain()).unwrap_or_default();
            let Some(remote_seid) = pfcp.remote_seid else {
                pfcp.node.ids().release(&retired);
                continue;
            };
            match self
                .exchange
                .send_deletion_request(&pfcp.node, pfcp.local_seid, remote_seid)
            {
                Ok(seq) => {
                    pfcp.park(seq, retired);
                    pending.push(name.clone());
                }
                Err(e) => {
                    // The UPF may still hold these rules
                    pfcp.node.ids().retire(&retired);
                    log::error!("[{}] [{}] deletion not sent: {}", tag, name, e);
                }
            }
        }
        for (name, mut set) in rules {
            if let Some(node) = self.topology.node(&name) {
                node.ids().release(&set.drain());
            }
        }

        ctx.begin_pending(PendingOp::Release, pending)
    }

    /// Drop the registry entry and every request still outstanding for it
    fn remove_context(&self, handle: &SessionHandle) {
        let seids: Vec<u64> = handle.lock().pfcp.values().map(|p| p.local_seid).collect();
        for seid in seids {
            self.exchange.forget_session(seid);
        }
        self.registry.remove(handle.id());
    }
}

// ============================================================================
// NAS timers
// ============================================================================

impl SmfContext {
    /// Arm T3591 or T3592 to resend `n1` through the AMF. On exhaustion the
    /// AMF is told the context is released.
    fn start_nas_timer(&self, handle: &Arc<SessionHandle>, ctx: &mut SmContext, timer_id: SmfTimerId, n1: Bytes) {
        let amf = self.collaborators.amf.clone();
        let notifier = self.collaborators.notification.clone();
        let supi = ctx.supi.clone();
        let psi = ctx.psi;
        let tag = ctx.tag();
        let weak: Weak<SessionHandle> = Arc::downgrade(handle);

        let resend_tag = tag.clone();
        let on_expire = move |retry: u32| {
            log::debug!("[{}] {} expired, resend #{}", resend_tag, timer_id.name(), retry);
            let amf = amf.clone();
            let supi = supi.clone();
            let msg = N1N2Message {
                psi,
                n1: Some(n1.clone()),
                n2: None,
            };
            tokio::spawn(async move {
                if let Err(e) = amf.n1n2_message_transfer(&supi, msg).await {
                    log::warn!("[{}:{}] N1 resend failed: {}", supi, psi, e);
                }
            });
        };

        let on_exhausted = move || {
            log::warn!("[{}] {} exhausted", tag, timer_id.name());
            let Some(handle) = weak.upgrade() else {
                return;
            };
            let uri = {
                let mut ctx = handle.lock();
                match timer_id {
                    SmfTimerId::T3591 => ctx.t3591 = None,
                    _ => ctx.t3592 = None,
                }
                ctx.status_uri.clone()
            };
            if let Some(uri) = uri {
                tokio::spawn(async move {
                    if let Err(e) = notifier.notify_status(&uri, SmContextStatus::Released).await {
                        log::warn!("[{}] status notification failed: {}", tag, e);
                    }
                });
            }
        };

        let timer = RetryTimer::start(timer_id, self.timers.get(timer_id), on_expire, on_exhausted);
        let slot = match timer_id {
            SmfTimerId::T3591 => &mut ctx.t3591,
            _ => &mut ctx.t3592,
        };
        replace_timer(slot, timer);
    }
}

// ============================================================================
// SM policy
// ============================================================================

impl SmfContext {
    /// Merge a policy decision into the context. A PCC rule gets its own
    /// data path; a path that cannot be built is logged and the rule kept.
    pub fn apply_sm_policy_from_decision(&self, ctx: &mut SmContext, decision: &SmPolicyDecision) {
        let tag = ctx.tag();

        for (id, rule) in &decision.sess_rules {
            let active = ctx.session_rule.as_ref().map(|r| r.id.as_str());
            match rule {
                Some(rule) if active.is_none() || active == Some(id.as_str()) => {
                    log::debug!("[{}] session rule [{}]", tag, id);
                    ctx.session_rule = Some(rule.clone());
                }
                Some(_) => {}
                None if active == Some(id.as_str()) => {
                    log::debug!("[{}] session rule [{}] removed", tag, id);
                    ctx.session_rule = None;
                }
                None => {}
            }
        }
        if ctx.session_rule.is_none() {
            ctx.session_rule = decision.sess_rules.values().flatten().next().cloned();
        }
        if let Some(rule) = &ctx.session_rule {
            ctx.ambr = rule.ambr;
            ctx.default_5qi = rule.default_5qi;
        }

        for (id, tc) in &decision.traff_cont_decs {
            match tc {
                Some(tc) => {
                    ctx.tc_data.insert(id.clone(), tc.clone());
                }
                None => {
                    ctx.tc_data.remove(id);
                }
            }
        }

        for (id, rule) in &decision.pcc_rules {
            match rule {
                None => {
                    if ctx.pcc_rules.remove(id).is_none() {
                        log::warn!("[{}] PCC rule [{}] not installed", tag, id);
                        continue;
                    }
                    log::info!("[{}] remove PCC rule [{}]", tag, id);
                    remove_pcc_rule_data_path(ctx, id);
                }
                Some(rule) => {
                    match ctx.pcc_rules.get(id) {
                        Some(installed) if installed == rule => continue,
                        Some(_) => {
                            log::info!("[{}] modify PCC rule [{}]", tag, id);
                            remove_pcc_rule_data_path(ctx, id);
                        }
                        None => log::info!("[{}] install PCC rule [{}]", tag, id),
                    }
                    if let Err(e) = self.create_pcc_rule_data_path(ctx, id, rule) {
                        log::error!("[{}] PCC rule [{}] data path: {}", tag, id, e);
                    }
                    ctx.pcc_rules.insert(id.clone(), rule.clone());
                }
            }
        }
    }

    /// Data path steering one PCC rule's traffic, through the DNAI of its
    /// traffic control data when it has one
    pub fn create_pcc_rule_data_path(&self, ctx: &mut SmContext, pcc_rule_id: &str, rule: &PccRule) -> SmfResult<u32> {
        let tag = ctx.tag();
        let route = rule
            .tc_data_ref
            .as_ref()
            .and_then(|tc_id| ctx.tc_data.get(tc_id))
            .and_then(|tc| tc.route_to_locs.first())
            .cloned();

        let mut selection = ctx.selection.clone();
        selection.dnai = route.as_ref().map(|r| r.dnai.clone());
        let source = self.topology.source()?;
        let nodes = self.topology.find_path(&source.name, &selection)?;
        let mut path = DataPath::generate(nodes.get(1..).unwrap_or_default())?;
        path.pcc_rule_id = Some(pcc_rule_id.to_string());

        let mut params = ctx.path_params(DEFAULT_PRECEDENCE.saturating_sub(rule.precedence));
        match &rule.app_id {
            Some(app_id) => match self.config.find_pfd(app_id) {
                Some(pfd) => params.sdf_filter = pfd.flow_descriptions.first().cloned(),
                None => {
                    log::warn!("[{}] no PFD for application [{}]", tag, app_id);
                    params.application_id = Some(app_id.clone());
                }
            },
            None => params.sdf_filter = rule.flow_description.clone(),
        }
        path.activate(&mut ctx.rules, &params)?;

        if let Some(route) = &route {
            if let Some(far) = path.anchor_ul_far_mut(&mut ctx.rules) {
                let fwd = far.forwarding_parameters.get_or_insert_with(Default::default);
                if let Some(info) = route.route_info {
                    fwd.outer_header_creation = Some(OuterHeaderCreation::udp(info.ipv4, info.port));
                }
                if let Some(profile_id) = &route.route_profile_id {
                    match self.config.route_profiles.get(profile_id) {
                        Some(profile) => fwd.forwarding_policy_id = Some(profile.forwarding_policy_id.clone()),
                        None => log::warn!("[{}] route profile [{}] not found", tag, profile_id),
                    }
                }
            }
        }

        log::info!("[{}] PCC rule [{}] path [{}]", tag, pcc_rule_id, path.describe());
        Ok(ctx.tunnel.add_data_path(path))
    }
}

// ============================================================================
// ULCL
// ============================================================================

impl SmfContext {
    /// Add one branch per specific path of the UE's routing group, once per
    /// session. The second anchors get an establishment and the classifier
    /// a modification at the next rule sync. Returns whether rules changed.
    fn add_ulcl_branches(&self, ctx: &mut SmContext) -> bool {
        if ctx.ulcl != Some(UlclState::Uninitialized) {
            return false;
        }
        let tag = ctx.tag();
        let Some(group) = self.ue_routing.group_of(&ctx.supi) else {
            ctx.ulcl = None;
            return false;
        };

        let mut added = false;
        for specific in &group.paths {
            match self.add_ulcl_branch(ctx, specific) {
                Ok(_) => added = true,
                Err(e) => log::error!("[{}] ULCL branch [{}]: {}", tag, specific.describe(), e),
            }
        }
        ctx.ulcl = Some(UlclState::Added);
        added
    }

    fn add_ulcl_branch(&self, ctx: &mut SmContext, specific: &SpecificPath) -> SmfResult<u32> {
        let default = ctx
            .tunnel
            .default_path()
            .ok_or_else(|| SmfError::NotFound("default path".to_string()))?;
        let split = specific
            .split_index(default)
            .ok_or_else(|| SmfError::NotFound("branch point on the default path".to_string()))?;
        let classifier = &specific.nodes[split];
        let branch_point = default
            .branch_point_at(&classifier.name)
            .ok_or_else(|| SmfError::NotFound(format!("uplink tunnel on [{}]", classifier.name)))?;

        let mut path = DataPath::generate(&specific.nodes[split..])?;
        path.branch = Some(branch_point);
        let mut params = ctx.path_params(ULCL_PRECEDENCE);
        params.sdf_filter = Some(specific.flow_description());
        path.activate(&mut ctx.rules, &params)?;

        log::info!(
            "[{}] ULCL [{}] branch [{}] for [{}]",
            ctx.tag(),
            classifier.name,
            path.describe(),
            specific.dest
        );
        Ok(ctx.tunnel.add_data_path(path))
    }
}

fn remove_pcc_rule_data_path(ctx: &mut SmContext, pcc_rule_id: &str) {
    let Some(path_id) = ctx.tunnel.path_for_pcc_rule(pcc_rule_id).map(|p| p.id) else {
        return;
    };
    if let Some(mut path) = ctx.tunnel.remove_data_path(path_id) {
        path.deactivate(&mut ctx.rules);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SpecificPathConf, TimerConf, UeRoutingGroupConf, UpLinkConf, UpNodeConf};
    use crate::consumer::{
        Collaborators, NasCodec, NotificationClient, RouteInformation, RouteToLocation, TrafficControlData,
    };
    use crate::context::tests::{test_config, test_context, RecordingTransport};
    use crate::gsm::GsmCodec;
    use crate::n4_build::{apply_action, pfcp_ie, pfcp_type, PfcpCause, PfcpMessageBuilder};
    use crate::n4_handler::parse_f_seid;
    use crate::pfcp_path::{find_ie, parse_ies, PfcpHeader};
    use crate::rule::RuleState;

    const SUPI: &str = "imsi-001010000000001";
    const UPF_SEID_OFFSET: u64 = 0x1000;

    fn establishment_request(psi: u8) -> Bytes {
        GsmCodec.encode(&GsmMessage::new(psi, 1, message_type::PDU_SESSION_ESTABLISHMENT_REQUEST))
    }

    fn create_request(dnn: &str) -> CreateSmContextRequest {
        CreateSmContextRequest {
            supi: SUPI.to_string(),
            psi: 5,
            dnn: dnn.to_string(),
            snssai: SNssai::new(1, Some(0x010203)),
            n1_sm_msg: establishment_request(5),
            sm_context_status_uri: Some("http://amf/status/1".to_string()),
        }
    }

    fn upf_response(header: &PfcpHeader, body: &Bytes, cause: PfcpCause) -> Bytes {
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

    /// Answer the session requests sent so far and return their types
    async fn answer_upfs(smf: &Arc<SmfContext>, transport: &RecordingTransport, cause: PfcpCause) -> Vec<u8> {
        for _ in 0..200 {
            let requests: Vec<_> = transport
                .take()
                .into_iter()
                .filter(|(_, h, _)| {
                    matches!(
                        h.message_type,
                        pfcp_type::SESSION_ESTABLISHMENT_REQUEST
                            | pfcp_type::SESSION_MODIFICATION_REQUEST
                            | pfcp_type::SESSION_DELETION_REQUEST
                    )
                })
                .collect();
            if requests.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
            let types = requests.iter().map(|(_, h, _)| h.message_type).collect();
            for (peer, header, body) in requests {
                let rsp = upf_response(&header, &body, cause);
                smf.handle_pfcp_datagram(peer, &rsp).await;
            }
            return types;
        }
        panic!("no PFCP session request sent");
    }

    async fn established(smf: &Arc<SmfContext>, transport: &RecordingTransport) -> Arc<SessionHandle> {
        let task = tokio::spawn({
            let smf = smf.clone();
            async move { smf.create_session(create_request("internet")).await }
        });
        answer_upfs(smf, transport, PfcpCause::RequestAccepted).await;
        let rsp = task.await.unwrap();
        assert!(rsp.is_created());
        smf.registry.find_by_ref(rsp.sm_context_ref.as_deref().unwrap()).unwrap()
    }

    async fn update(
        smf: &Arc<SmfContext>,
        transport: &RecordingTransport,
        handle: &Arc<SessionHandle>,
        req: UpdateSmContextRequest,
    ) -> (UpdateSmContextResponse, Vec<u8>) {
        let task = tokio::spawn({
            let smf = smf.clone();
            let sm_ref = handle.sm_context_ref().to_string();
            async move { smf.update_session(&sm_ref, req).await }
        });
        let types = answer_upfs(smf, transport, PfcpCause::RequestAccepted).await;
        (task.await.unwrap(), types)
    }

    #[tokio::test]
    async fn test_create_session_establishes_every_node() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;

        let ctx = handle.lock();
        assert!(ctx.fsm.is_state(SmState::Active));
        assert_eq!(ctx.pfcp.len(), 2);
        assert!(ctx.pfcp.values().all(|p| p.remote_seid == Some(p.local_seid + UPF_SEID_OFFSET)));
        assert!(ctx.ue_ipv4().is_some());
        assert!(ctx.tunnel.default_path().is_some());
        assert_eq!(smf.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_create_session_rejected_by_upf() {
        let (smf, transport) = test_context(None);
        let task = tokio::spawn({
            let smf = smf.clone();
            async move { smf.create_session(create_request("internet")).await }
        });
        answer_upfs(&smf, &transport, PfcpCause::RequestRejected).await;
        let rsp = task.await.unwrap();

        assert_eq!(rsp.status, sbi_status::INTERNAL_SERVER_ERROR);
        let reject = GsmCodec.decode(&rsp.n1_sm_msg.unwrap()).unwrap();
        assert_eq!(reject.message_type, message_type::PDU_SESSION_ESTABLISHMENT_REJECT);
        assert_eq!(reject.cause, Some(GsmCause::NetworkFailure));
        assert!(smf.registry.is_empty());
    }

    #[tokio::test]
    async fn test_create_session_without_pool_rejects() {
        let (smf, transport) = test_context(None);
        let rsp = smf.create_session(create_request("ims")).await;

        assert_eq!(rsp.status, sbi_status::INTERNAL_SERVER_ERROR);
        let reject = GsmCodec.decode(&rsp.n1_sm_msg.unwrap()).unwrap();
        assert_eq!(reject.cause, Some(GsmCause::InsufficientResourcesForSpecificSliceAndDnn));
        assert!(smf.registry.is_empty());
        assert!(transport.take().is_empty());
    }

    #[tokio::test]
    async fn test_create_session_bad_n1() {
        let (smf, _) = test_context(None);
        let mut req = create_request("internet");
        req.n1_sm_msg = GsmCodec.encode(&GsmMessage::new(5, 1, message_type::PDU_SESSION_RELEASE_REQUEST));
        assert_eq!(smf.create_session(req).await.status, sbi_status::FORBIDDEN);
        assert!(smf.registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_session_replaces_old_context() {
        let (smf, transport) = test_context(None);
        let old = established(&smf, &transport).await;

        let task = tokio::spawn({
            let smf = smf.clone();
            async move { smf.create_session(create_request("internet")).await }
        });
        let mut types = Vec::new();
        while !types.contains(&pfcp_type::SESSION_ESTABLISHMENT_REQUEST) {
            types.extend(answer_upfs(&smf, &transport, PfcpCause::RequestAccepted).await);
        }
        let rsp = task.await.unwrap();
        assert!(rsp.is_created());
        assert!(types.contains(&pfcp_type::SESSION_DELETION_REQUEST));

        for _ in 0..100 {
            if smf.registry.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(smf.registry.len(), 1);
        assert!(smf.registry.find(old.id()).is_none());
        assert!(old.lock().fsm.is_state(SmState::Inactive));
    }

    #[tokio::test]
    async fn test_release_session_deletes_on_every_node() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;

        let task = tokio::spawn({
            let smf = smf.clone();
            let sm_ref = handle.sm_context_ref().to_string();
            async move { smf.release_session(&sm_ref).await }
        });
        let types = answer_upfs(&smf, &transport, PfcpCause::RequestAccepted).await;
        assert_eq!(types, vec![pfcp_type::SESSION_DELETION_REQUEST; 2]);
        assert_eq!(task.await.unwrap().status, sbi_status::NO_CONTENT);
        assert!(smf.registry.is_empty());
        assert!(handle.lock().fsm.is_state(SmState::Inactive));

        let rsp = smf.release_session(handle.sm_context_ref()).await;
        assert_eq!(rsp.status, sbi_status::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_n2_setup_response_installs_an_tunnel() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;
        let an = AnTunnel {
            teid: 0x99,
            ipv4: Ipv4Addr::new(10, 10, 0, 1),
        };

        let req = UpdateSmContextRequest {
            n2_sm_info: Some(N2SmInfo::PduResSetupRsp(an)),
            ..Default::default()
        };
        let (rsp, types) = update(&smf, &transport, &handle, req).await;
        assert_eq!(rsp.status, sbi_status::OK);
        assert_eq!(types, vec![pfcp_type::SESSION_MODIFICATION_REQUEST]);

        let guard = handle.lock();
        let ctx = &*guard;
        assert!(ctx.fsm.is_state(SmState::Active));
        assert_eq!(ctx.tunnel.an_tunnel, Some(an));
        let first = ctx.tunnel.default_path().unwrap().first().unwrap();
        let far = ctx.rules[first.name()].fars.get(first.dl.far_id.unwrap()).unwrap();
        assert_eq!(far.apply_action, apply_action::FORW);
        let ohc = far.forwarding_parameters.as_ref().unwrap().outer_header_creation.unwrap();
        assert_eq!(ohc.teid, 0x99);
    }

    #[tokio::test]
    async fn test_unsent_modification_is_resent_next_sync() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;
        let an = |teid| AnTunnel {
            teid,
            ipv4: Ipv4Addr::new(10, 10, 0, 1),
        };
        let dl_far = |handle: &SessionHandle| {
            let guard = handle.lock();
            let first = guard.tunnel.default_path().unwrap().first().unwrap();
            guard.rules[first.name()].fars.get(first.dl.far_id.unwrap()).unwrap().clone()
        };

        transport.set_down(true);
        let req = UpdateSmContextRequest {
            n2_sm_info: Some(N2SmInfo::PduResSetupRsp(an(0x99))),
            ..Default::default()
        };
        let rsp = smf.update_session(handle.sm_context_ref(), req).await;
        assert_eq!(rsp.status, sbi_status::INTERNAL_SERVER_ERROR);
        assert!(transport.take().is_empty());
        assert_eq!(dl_far(&handle).state, RuleState::Update);
        assert_eq!(smf.exchange.outstanding(), 0);

        transport.set_down(false);
        let req = UpdateSmContextRequest {
            n2_sm_info: Some(N2SmInfo::PduResSetupRsp(an(0x9a))),
            ..Default::default()
        };
        let (rsp, types) = update(&smf, &transport, &handle, req).await;
        assert_eq!(rsp.status, sbi_status::OK);
        assert_eq!(types, vec![pfcp_type::SESSION_MODIFICATION_REQUEST]);
        let far = dl_far(&handle);
        assert_eq!(far.state, RuleState::Synced);
        let ohc = far.forwarding_parameters.unwrap().outer_header_creation.unwrap();
        assert_eq!(ohc.teid, 0x9a);
    }

    #[tokio::test]
    async fn test_release_timeout_forgets_outstanding_deletions() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;

        let rsp = smf.release_session(handle.sm_context_ref()).await;
        assert_eq!(rsp.status, sbi_status::GATEWAY_TIMEOUT);
        assert_eq!(transport.message_types(), vec![pfcp_type::SESSION_DELETION_REQUEST; 2]);
        assert!(smf.registry.is_empty());
        assert_eq!(smf.exchange.outstanding(), 0);
    }

    fn ulcl_context() -> (Arc<SmfContext>, Arc<RecordingTransport>) {
        let mut config = test_config();
        config.smf.ulcl = true;
        config.user_plane.up_nodes.push(
            serde_yaml::from_str::<UpNodeConf>(
                r#"
name: PSA2-UPF
type: UPF
node_id: 10.200.200.104
snssai_infos:
  - snssai: { sst: 1, sd: "010203" }
    dnn_upf_info_list:
      - dnn: internet
interfaces:
  - { interface_type: N9, endpoints: [10.200.201.104], network_instances: [internet] }
"#,
            )
            .unwrap(),
        );
        config.user_plane.links.push(UpLinkConf {
            a: "I-UPF".into(),
            b: "PSA2-UPF".into(),
        });
        config.ue_routing.push(UeRoutingGroupConf {
            name: "edge-users".into(),
            members: vec![SUPI.into()],
            specific_paths: vec![SpecificPathConf {
                dest: "10.100.100.0/24".into(),
                dest_port: None,
                path: vec!["I-UPF".into(), "PSA2-UPF".into()],
            }],
        });
        let transport = Arc::new(RecordingTransport::default());
        let smf = SmfContext::new(config, transport.clone(), Collaborators::local(SmPolicyDecision::default())).unwrap();
        (smf, transport)
    }

    #[tokio::test]
    async fn test_an_tunnel_adds_ulcl_branch() {
        let (smf, transport) = ulcl_context();
        let handle = established(&smf, &transport).await;
        {
            let ctx = handle.lock();
            assert_eq!(ctx.ulcl, Some(UlclState::Uninitialized));
            assert_eq!(ctx.pfcp.len(), 2);
            assert_eq!(ctx.tunnel.branches().count(), 0);
        }

        let an = AnTunnel {
            teid: 0x99,
            ipv4: Ipv4Addr::new(10, 10, 0, 1),
        };
        let req = UpdateSmContextRequest {
            n2_sm_info: Some(N2SmInfo::PduResSetupRsp(an)),
            ..Default::default()
        };
        let (rsp, types) = update(&smf, &transport, &handle, req).await;
        assert_eq!(rsp.status, sbi_status::OK);
        // Classifier modified, second anchor established
        assert_eq!(
            types,
            vec![pfcp_type::SESSION_MODIFICATION_REQUEST, pfcp_type::SESSION_ESTABLISHMENT_REQUEST]
        );

        {
            let guard = handle.lock();
            let ctx = &*guard;
            assert_eq!(ctx.ulcl, Some(UlclState::Added));
            assert!(ctx.fsm.is_state(SmState::Active));
            assert_eq!(ctx.pfcp.len(), 3);
            assert!(ctx.pfcp["PSA2-UPF"].is_established());

            let branch = ctx.tunnel.branches().next().unwrap();
            assert_eq!(branch.describe(), "I-UPF -> PSA2-UPF");
            let default_first = ctx.tunnel.default_path().unwrap().first().unwrap();
            let classifier = branch.first().unwrap();
            let iupf = &ctx.rules["I-UPF"];
            let rule = iupf.pdrs.get(classifier.ul.pdr_id.unwrap()).unwrap();
            assert_eq!(rule.precedence, ULCL_PRECEDENCE);
            assert_eq!(rule.pdi.local_fteid.map(|f| f.teid), default_first.ul.teid);
            assert_eq!(rule.pdi.sdf_filter.as_deref(), Some("permit out ip from 10.100.100.0/24 to assigned"));
            assert_eq!(rule.state, RuleState::Synced);
            let dl_far = iupf.fars.get(classifier.dl.far_id.unwrap()).unwrap();
            assert_eq!(dl_far.forwarding_parameters.as_ref().unwrap().outer_header_creation.unwrap().teid, 0x99);
        }

        // Branches are added once per session
        let req = UpdateSmContextRequest {
            n2_sm_info: Some(N2SmInfo::PathSwitchReq(AnTunnel { teid: 0x9a, ..an })),
            ..Default::default()
        };
        let (rsp, types) = update(&smf, &transport, &handle, req).await;
        assert_eq!(rsp.status, sbi_status::OK);
        assert_eq!(types, vec![pfcp_type::SESSION_MODIFICATION_REQUEST]);
        assert_eq!(handle.lock().tunnel.branches().count(), 1);

        let task = tokio::spawn({
            let smf = smf.clone();
            let sm_ref = handle.sm_context_ref().to_string();
            async move { smf.release_session(&sm_ref).await }
        });
        let types = answer_upfs(&smf, &transport, PfcpCause::RequestAccepted).await;
        assert_eq!(types, vec![pfcp_type::SESSION_DELETION_REQUEST; 3]);
        assert_eq!(task.await.unwrap().status, sbi_status::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_ulcl_disabled_keeps_single_anchor() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;
        let req = UpdateSmContextRequest {
            n2_sm_info: Some(N2SmInfo::PduResSetupRsp(AnTunnel {
                teid: 0x99,
                ipv4: Ipv4Addr::new(10, 10, 0, 1),
            })),
            ..Default::default()
        };
        let (_, types) = update(&smf, &transport, &handle, req).await;
        assert_eq!(types, vec![pfcp_type::SESSION_MODIFICATION_REQUEST]);
        let ctx = handle.lock();
        assert_eq!(ctx.ulcl, None);
        assert_eq!(ctx.tunnel.branches().count(), 0);
    }

    #[tokio::test]
    async fn test_deactivation_buffers_downlink() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;
        let an = AnTunnel {
            teid: 0x99,
            ipv4: Ipv4Addr::new(10, 10, 0, 1),
        };
        let req = UpdateSmContextRequest {
            n2_sm_info: Some(N2SmInfo::PduResSetupRsp(an)),
            ..Default::default()
        };
        update(&smf, &transport, &handle, req).await;

        let req = UpdateSmContextRequest {
            up_cnx_state: Some(UpCnxState::Deactivated),
            ..Default::default()
        };
        let (rsp, types) = update(&smf, &transport, &handle, req).await;
        assert_eq!(rsp.up_cnx_state, Some(UpCnxState::Deactivated));
        assert_eq!(types, vec![pfcp_type::SESSION_MODIFICATION_REQUEST]);

        let guard = handle.lock();
        let ctx = &*guard;
        let first = ctx.tunnel.default_path().unwrap().first().unwrap();
        let far = ctx.rules[first.name()].fars.get(first.dl.far_id.unwrap()).unwrap();
        assert_eq!(far.apply_action, apply_action::BUFF | apply_action::NOCP);
        assert!(far.forwarding_parameters.as_ref().unwrap().outer_header_creation.is_none());
        assert_eq!(ctx.up_cnx_state, UpCnxState::Deactivated);
    }

    #[tokio::test]
    async fn test_activating_answers_without_pfcp() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;

        let req = UpdateSmContextRequest {
            up_cnx_state: Some(UpCnxState::Activating),
            ..Default::default()
        };
        let rsp = smf.update_session(handle.sm_context_ref(), req).await;
        assert_eq!(rsp.status, sbi_status::OK);
        assert_eq!(rsp.n2_sm_info_type, Some(N2SmInfoType::PduResSetupReq));
        assert!(transport.take().is_empty());
        assert!(handle.lock().fsm.is_state(SmState::Active));
    }

    #[tokio::test]
    async fn test_n1_release_then_complete() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;

        let req = UpdateSmContextRequest {
            n1_sm_msg: Some(GsmCodec.encode(&GsmMessage::new(5, 2, message_type::PDU_SESSION_RELEASE_REQUEST))),
            ..Default::default()
        };
        let (rsp, types) = update(&smf, &transport, &handle, req).await;
        assert_eq!(rsp.status, sbi_status::OK);
        assert_eq!(types, vec![pfcp_type::SESSION_DELETION_REQUEST; 2]);
        assert_eq!(rsp.n2_sm_info_type, Some(N2SmInfoType::PduResRelCmd));
        let command = GsmCodec.decode(&rsp.n1_sm_msg.unwrap()).unwrap();
        assert_eq!(command.message_type, message_type::PDU_SESSION_RELEASE_COMMAND);
        assert_eq!(command.pti, 2);
        {
            let ctx = handle.lock();
            assert!(ctx.fsm.is_state(SmState::InactivePending));
            assert!(ctx.t3592.is_some());
            assert!(ctx.ue_ip.is_none());
        }

        let req = UpdateSmContextRequest {
            n1_sm_msg: Some(GsmCodec.encode(&GsmMessage::new(5, 2, message_type::PDU_SESSION_RELEASE_COMPLETE))),
            ..Default::default()
        };
        let rsp = smf.update_session(handle.sm_context_ref(), req).await;
        assert_eq!(rsp.status, sbi_status::OK);
        assert!(smf.registry.is_empty());
        assert!(handle.lock().t3592.is_none());
    }

    #[tokio::test]
    async fn test_release_flag_with_duplicate_removes_context() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;

        let req = UpdateSmContextRequest {
            release: true,
            ..Default::default()
        };
        let (rsp, types) = update(&smf, &transport, &handle, req).await;
        assert_eq!(rsp.n2_sm_info_type, Some(N2SmInfoType::PduResRelCmd));
        assert_eq!(types, vec![pfcp_type::SESSION_DELETION_REQUEST; 2]);
        assert!(smf.registry.is_empty());
    }

    #[tokio::test]
    async fn test_modification_request_arms_t3591() {
        let (smf, transport) = test_context(None);
        let handle = established(&smf, &transport).await;

        let req = UpdateSmContextRequest {
            n1_sm_msg: Some(GsmCodec.encode(&GsmMessage::new(5, 3, message_type::PDU_SESSION_MODIFICATION_REQUEST))),
            ..Default::default()
        };
        let rsp = smf.update_session(handle.sm_context_ref(), req).await;
        assert_eq!(rsp.n2_sm_info_type, Some(N2SmInfoType::PduResModReq));
        assert!(handle.lock().t3591.is_some());

        let req = UpdateSmContextRequest {
            n1_sm_msg: Some(GsmCodec.encode(&GsmMessage::new(5, 3, message_type::PDU_SESSION_MODIFICATION_COMPLETE))),
            ..Default::default()
        };
        smf.update_session(handle.sm_context_ref(), req).await;
        assert!(handle.lock().t3591.is_none());
        assert!(transport.take().is_empty());
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl NotificationClient for RecordingNotifier {
        async fn notify_status(&self, uri: &str, _status: SmContextStatus) -> SmfResult<()> {
            self.sent.lock().unwrap().push(uri.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_t3592_exhaustion_notifies_status_uri() {
        let mut config = test_config();
        config.timers.t3592 = TimerConf {
            enable: true,
            expire_ms: 10,
            max_retry: 2,
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let mut collaborators = Collaborators::local(SmPolicyDecision::default());
        collaborators.notification = notifier.clone() as Arc<dyn NotificationClient>;
        let transport = Arc::new(RecordingTransport::default());
        let smf = SmfContext::new(config, transport.clone(), collaborators).unwrap();
        let handle = established(&smf, &transport).await;

        let req = UpdateSmContextRequest {
            n1_sm_msg: Some(GsmCodec.encode(&GsmMessage::new(5, 2, message_type::PDU_SESSION_RELEASE_REQUEST))),
            ..Default::default()
        };
        update(&smf, &transport, &handle, req).await;

        for _ in 0..100 {
            if !notifier.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*notifier.sent.lock().unwrap(), vec!["http://amf/status/1".to_string()]);
        assert!(handle.lock().t3592.is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_context() {
        let (smf, _) = test_context(None);
        let rsp = smf.update_session("urn:uuid:none", UpdateSmContextRequest::default()).await;
        assert_eq!(rsp.status, sbi_status::NOT_FOUND);
    }

    fn edge_decision(route_profile: &str) -> SmPolicyDecision {
        let mut decision = SmPolicyDecision::default();
        decision.traff_cont_decs.insert(
            "tc1".to_string(),
            Some(TrafficControlData {
                id: "tc1".to_string(),
                route_to_locs: vec![RouteToLocation {
                    dnai: "mec".to_string(),
                    route_info: Some(RouteInformation {
                        ipv4: Ipv4Addr::new(192, 168, 1, 1),
                        port: 2152,
                    }),
                    route_profile_id: Some(route_profile.to_string()),
                }],
            }),
        );
        decision.pcc_rules.insert(
            "pcc1".to_string(),
            Some(PccRule {
                id: "pcc1".to_string(),
                precedence: 10,
                app_id: Some("edge".to_string()),
                flow_description: None,
                tc_data_ref: Some("tc1".to_string()),
            }),
        );
        decision
    }

    #[tokio::test]
    async fn test_pcc_rule_gets_own_data_path() {
        let (smf, _) = test_context(Some(Collaborators::local(SmPolicyDecision::default())));
        let mut ctx = SmContext::new(1, SUPI, 5, SNssai::new(1, Some(0x010203)), "internet");
        smf.apply_sm_policy_from_decision(&mut ctx, &edge_decision("MEC1"));

        let path = ctx.tunnel.path_for_pcc_rule("pcc1").unwrap().clone();
        assert!(path.activated);
        assert!(ctx.pcc_rules.contains_key("pcc1"));

        let anchor = path.anchor().unwrap();
        let set = &ctx.rules[anchor.name()];
        let ul_pdr = set.pdrs.get(anchor.ul.pdr_id.unwrap()).unwrap();
        assert_eq!(ul_pdr.precedence, 245);
        assert_eq!(
            ul_pdr.pdi.sdf_filter.as_deref(),
            Some("permit out ip from 10.100.0.0/16 to assigned")
        );
        let fwd = set
            .fars
            .get(anchor.ul.far_id.unwrap())
            .unwrap()
            .forwarding_parameters
            .clone()
            .unwrap();
        assert_eq!(fwd.forwarding_policy_id.as_deref(), Some("10"));
        let ohc = fwd.outer_header_creation.unwrap();
        assert_eq!(ohc.port, Some(2152));

        // Same decision again changes nothing
        smf.apply_sm_policy_from_decision(&mut ctx, &edge_decision("MEC1"));
        assert_eq!(ctx.tunnel.data_paths.len(), 1);

        let mut removal = SmPolicyDecision::default();
        removal.pcc_rules.insert("pcc1".to_string(), None);
        smf.apply_sm_policy_from_decision(&mut ctx, &removal);
        assert!(ctx.tunnel.path_for_pcc_rule("pcc1").is_none());
        assert!(ctx.pcc_rules.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_profile_keeps_rule() {
        let (smf, _) = test_context(None);
        let mut ctx = SmContext::new(1, SUPI, 5, SNssai::new(1, Some(0x010203)), "internet");
        smf.apply_sm_policy_from_decision(&mut ctx, &edge_decision("NOPE"));

        let path = ctx.tunnel.path_for_pcc_rule("pcc1").unwrap().clone();
        let far = path.anchor_ul_far_mut(&mut ctx.rules).unwrap();
        let fwd = far.forwarding_parameters.as_ref().unwrap();
        assert!(fwd.forwarding_policy_id.is_none());
        assert!(fwd.outer_header_creation.is_some());
    }
}
