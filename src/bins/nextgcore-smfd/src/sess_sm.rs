//! SM Context State Machine
//!
//! Per-session state machine reconciling N1/N2 signaling with PFCP
//! outcomes. Transitions come from a single table; every event names the
//! states it expects to start from. Starting anywhere else is logged as a
//! protocol anomaly and the transition still happens.

/// SM context states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmState {
    /// Newly created, or waiting for the release complete
    #[default]
    InactivePending,
    /// PFCP establishment in flight
    ActivePending,
    /// Operational
    Active,
    /// Signaling update in progress, no PFCP yet
    ModificationPending,
    /// PFCP modification or deletion in flight
    PfcpModification,
    /// Terminal
    Inactive,
}

impl SmState {
    pub fn name(&self) -> &'static str {
        match self {
            SmState::InactivePending => "INACTIVE_PENDING",
            SmState::ActivePending => "ACTIVE_PENDING",
            SmState::Active => "ACTIVE",
            SmState::ModificationPending => "MODIFICATION_PENDING",
            SmState::PfcpModification => "PFCP_MODIFICATION",
            SmState::Inactive => "INACTIVE",
        }
    }

    /// States that no pending operation leaves behind
    pub fn is_stable(&self) -> bool {
        matches!(self, SmState::Active | SmState::Inactive)
    }
}

/// SM context events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEvent {
    /// Establishment requests dispatched
    EstablishmentStarted,
    /// Every node accepted the rule sync
    UpdateSuccess,
    /// Establishment rejected or timed out
    EstablishmentFailed,
    /// Modification rejected or timed out
    UpdateFailed,
    /// Update request received from the AMF
    ModificationStarted,
    /// Modification or deletion requests dispatched
    PfcpDispatched,
    /// Update handled without PFCP traffic
    ModificationDone,
    /// Every node confirmed the deletion
    ReleaseSuccess,
    /// Deletion rejected or timed out
    ReleaseFailed,
    /// UE acknowledged the release, or release finished locally
    ReleaseCompleted,
    /// Drop the session without signaling
    LocalRelease,
}

impl SmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SmEvent::EstablishmentStarted => "ESTABLISHMENT_STARTED",
            SmEvent::UpdateSuccess => "UPDATE_SUCCESS",
            SmEvent::EstablishmentFailed => "ESTABLISHMENT_FAILED",
            SmEvent::UpdateFailed => "UPDATE_FAILED",
            SmEvent::ModificationStarted => "MODIFICATION_STARTED",
            SmEvent::PfcpDispatched => "PFCP_DISPATCHED",
            SmEvent::ModificationDone => "MODIFICATION_DONE",
            SmEvent::ReleaseSuccess => "RELEASE_SUCCESS",
            SmEvent::ReleaseFailed => "RELEASE_FAILED",
            SmEvent::ReleaseCompleted => "RELEASE_COMPLETED",
            SmEvent::LocalRelease => "LOCAL_RELEASE",
        }
    }

    /// Transition table: expected source states and the target state.
    /// An empty source list accepts any state.
    pub fn transition(&self) -> (&'static [SmState], SmState) {
        use SmState::*;
        match self {
            SmEvent::EstablishmentStarted => (&[InactivePending], ActivePending),
            SmEvent::UpdateSuccess => (&[ActivePending, PfcpModification], Active),
            SmEvent::EstablishmentFailed => (&[ActivePending], Inactive),
            SmEvent::UpdateFailed => (&[PfcpModification], Active),
            SmEvent::ModificationStarted => (&[Active], ModificationPending),
            SmEvent::PfcpDispatched => (&[Active, ModificationPending], PfcpModification),
            SmEvent::ModificationDone => (&[ModificationPending, PfcpModification], Active),
            SmEvent::ReleaseSuccess => (&[PfcpModification], InactivePending),
            SmEvent::ReleaseFailed => (&[PfcpModification], Active),
            SmEvent::ReleaseCompleted => (&[InactivePending], Inactive),
            SmEvent::LocalRelease => (&[], Inactive),
        }
    }
}

/// Result of SM FSM event handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmFsmResult {
    /// State transition occurred
    Transition(SmState),
    /// Event was ignored (terminal state)
    Ignored,
}

/// SM context state machine
#[derive(Debug, Clone, Default)]
pub struct SmFsm {
    state: SmState,
    /// Log tag of the owning session
    tag: String,
    /// Number of transitions taken from an unexpected state
    anomalies: u32,
}

impl SmFsm {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            state: SmState::InactivePending,
            tag: tag.into(),
            anomalies: 0,
        }
    }

    pub fn state(&self) -> SmState {
        self.state
    }

    pub fn is_state(&self, state: SmState) -> bool {
        self.state == state
    }

    pub fn anomalies(&self) -> u32 {
        self.anomalies
    }

    /// Check the current state against `expected`. A mismatch is logged
    /// and counted; the caller carries on regardless.
    pub fn assert_expected(&mut self, expected: &[SmState], what: &str) -> bool {
        if expected.is_empty() || expected.contains(&self.state) {
            return true;
        }
        self.anomalies += 1;
        let expected: Vec<&str> = expected.iter().map(|s| s.name()).collect();
        log::warn!(
            "[{}] {} in state {} (expected {})",
            self.tag,
            what,
            self.state.name(),
            expected.join("|")
        );
        false
    }

    /// Dispatch an event through the transition table
    pub fn dispatch(&mut self, event: SmEvent) -> SmFsmResult {
        if self.state == SmState::Inactive {
            log::debug!("[{}] {} ignored in terminal state", self.tag, event.name());
            return SmFsmResult::Ignored;
        }

        let (expected, target) = event.transition();
        self.assert_expected(expected, event.name());
        if self.state != target {
            log::debug!(
                "[{}] SM state transition: {} -> {} ({})",
                self.tag,
                self.state.name(),
                target.name(),
                event.name()
            );
        }
        self.state = target;
        SmFsmResult::Transition(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SmState::InactivePending.name(), "INACTIVE_PENDING");
        assert_eq!(SmState::PfcpModification.name(), "PFCP_MODIFICATION");
        assert_eq!(SmState::default(), SmState::InactivePending);
        assert!(SmState::Active.is_stable());
        assert!(!SmState::ActivePending.is_stable());
    }

    #[test]
    fn test_establishment_flow() {
        let mut fsm = SmFsm::new("imsi-001:1");
        assert_eq!(
            fsm.dispatch(SmEvent::EstablishmentStarted),
            SmFsmResult::Transition(SmState::ActivePending)
        );
        fsm.dispatch(SmEvent::UpdateSuccess);
        assert!(fsm.is_state(SmState::Active));
        assert_eq!(fsm.anomalies(), 0);
    }

    #[test]
    fn test_modification_flow() {
        let mut fsm = SmFsm::new("t");
        fsm.dispatch(SmEvent::EstablishmentStarted);
        fsm.dispatch(SmEvent::UpdateSuccess);
        fsm.dispatch(SmEvent::ModificationStarted);
        assert!(fsm.is_state(SmState::ModificationPending));
        fsm.dispatch(SmEvent::PfcpDispatched);
        assert!(fsm.is_state(SmState::PfcpModification));
        fsm.dispatch(SmEvent::UpdateFailed);
        assert!(fsm.is_state(SmState::Active));
        assert_eq!(fsm.anomalies(), 0);
    }

    #[test]
    fn test_release_flow() {
        let mut fsm = SmFsm::new("t");
        fsm.dispatch(SmEvent::EstablishmentStarted);
        fsm.dispatch(SmEvent::UpdateSuccess);
        fsm.dispatch(SmEvent::PfcpDispatched);
        fsm.dispatch(SmEvent::ReleaseSuccess);
        assert!(fsm.is_state(SmState::InactivePending));
        fsm.dispatch(SmEvent::ReleaseCompleted);
        assert!(fsm.is_state(SmState::Inactive));
        assert_eq!(fsm.dispatch(SmEvent::UpdateSuccess), SmFsmResult::Ignored);
    }

    #[test]
    fn test_unexpected_state_proceeds() {
        let mut fsm = SmFsm::new("t");
        // Release complete before anything was set up
        fsm.dispatch(SmEvent::PfcpDispatched);
        assert_eq!(fsm.anomalies(), 1);
        assert!(fsm.is_state(SmState::PfcpModification));
    }

    #[test]
    fn test_local_release_from_any_state() {
        for start in [SmEvent::EstablishmentStarted, SmEvent::ModificationStarted] {
            let mut fsm = SmFsm::new("t");
            fsm.dispatch(start);
            fsm.dispatch(SmEvent::LocalRelease);
            assert!(fsm.is_state(SmState::Inactive));
        }
    }

    #[test]
    fn test_assert_expected() {
        let mut fsm = SmFsm::new("t");
        assert!(fsm.assert_expected(&[SmState::InactivePending], "create"));
        assert!(!fsm.assert_expected(&[SmState::Active], "release request"));
        assert_eq!(fsm.anomalies(), 1);
        assert!(fsm.is_state(SmState::InactivePending));
    }
}
