//! SMF Timer Management
//!
//! Timer ids, their configuration, and a bounded retry timer backed by a
//! tokio task.

use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{TimerConf, TimersConf};

// ============================================================================
// Timer IDs
// ============================================================================

/// SMF timer identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmfTimerId {
    /// PDU session modification command retransmission
    T3591,
    /// PDU session release command retransmission
    T3592,
    /// PFCP association setup retry
    PfcpAssociation,
    /// PFCP heartbeat
    PfcpNoHeartbeat,
}

impl SmfTimerId {
    /// Get timer name
    pub fn name(&self) -> &'static str {
        match self {
            Self::T3591 => "SMF_TIMER_T3591",
            Self::T3592 => "SMF_TIMER_T3592",
            Self::PfcpAssociation => "SMF_TIMER_PFCP_ASSOCIATION",
            Self::PfcpNoHeartbeat => "SMF_TIMER_PFCP_NO_HEARTBEAT",
        }
    }

    /// Check if this is a PFCP timer
    pub fn is_pfcp_timer(&self) -> bool {
        matches!(self, Self::PfcpAssociation | Self::PfcpNoHeartbeat)
    }
}

// ============================================================================
// Timer Configuration
// ============================================================================

/// Timer configuration
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Timer is configured
    pub enabled: bool,
    /// Maximum retry count
    pub max_count: u32,
    /// Timer duration
    pub duration: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_count: 0,
            duration: Duration::ZERO,
        }
    }
}

impl TimerConfig {
    /// Create a timer configuration with milliseconds
    pub fn new_millis(max_count: u32, duration_millis: u64) -> Self {
        Self {
            enabled: true,
            max_count,
            duration: Duration::from_millis(duration_millis),
        }
    }
}

impl From<&TimerConf> for TimerConfig {
    fn from(conf: &TimerConf) -> Self {
        Self {
            enabled: conf.enable,
            max_count: conf.max_retry,
            duration: Duration::from_millis(conf.expire_ms),
        }
    }
}

/// SMF timer configurations
#[derive(Debug, Clone, Default)]
pub struct SmfTimerConfigs {
    pub t3591: TimerConfig,
    pub t3592: TimerConfig,
    pub pfcp_association: TimerConfig,
    pub pfcp_no_heartbeat: TimerConfig,
}

impl SmfTimerConfigs {
    pub fn from_conf(conf: &TimersConf) -> Self {
        Self {
            t3591: (&conf.t3591).into(),
            t3592: (&conf.t3592).into(),
            pfcp_association: (&conf.pfcp_association).into(),
            pfcp_no_heartbeat: (&conf.pfcp_heartbeat).into(),
        }
    }

    /// Get timer configuration by ID
    pub fn get(&self, timer_id: SmfTimerId) -> &TimerConfig {
        match timer_id {
            SmfTimerId::T3591 => &self.t3591,
            SmfTimerId::T3592 => &self.t3592,
            SmfTimerId::PfcpAssociation => &self.pfcp_association,
            SmfTimerId::PfcpNoHeartbeat => &self.pfcp_no_heartbeat,
        }
    }
}

// ============================================================================
// Retry Timer
// ============================================================================

/// Bounded retransmission timer.
///
/// Every `duration` the timer calls `on_expire` with the retry number, up to
/// `max_count` times; one more expiry after that calls `on_exhausted` and
/// ends the timer. Dropping or stopping the timer cancels it.
#[derive(Debug)]
pub struct RetryTimer {
    timer_id: SmfTimerId,
    handle: JoinHandle<()>,
}

impl RetryTimer {
    /// Arm a timer. Returns `None` when the timer is disabled. Must be
    /// called from within a tokio runtime.
    pub fn start<F, G>(timer_id: SmfTimerId, config: &TimerConfig, on_expire: F, on_exhausted: G) -> Option<Self>
    where
        F: Fn(u32) + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        if !config.enabled {
            log::debug!("Timer {} is not enabled", timer_id.name());
            return None;
        }

        let duration = config.duration;
        let max_count = config.max_count;
        let handle = tokio::spawn(async move {
            let mut retry = 0;
            loop {
                tokio::time::sleep(duration).await;
                if retry >= max_count {
                    log::warn!("Timer {} exhausted after {} retries", timer_id.name(), retry);
                    on_exhausted();
                    break;
                }
                retry += 1;
                log::debug!("Timer {} expired (retry {}/{})", timer_id.name(), retry, max_count);
                on_expire(retry);
            }
        });

        log::debug!("Started timer {} (duration: {:?})", timer_id.name(), duration);
        Some(Self { timer_id, handle })
    }

    pub fn timer_id(&self) -> SmfTimerId {
        self.timer_id
    }

    /// Stop the timer. Calling it again, or on a finished timer, is harmless.
    pub fn stop(&self) {
        if !self.handle.is_finished() {
            self.handle.abort();
            log::debug!("Stopped timer {}", self.timer_id.name());
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Stop whatever is armed in `slot`, then arm a new timer there
pub fn replace_timer(slot: &mut Option<RetryTimer>, timer: Option<RetryTimer>) {
    if let Some(old) = slot.take() {
        old.stop();
    }
    *slot = timer;
}

/// Stop and clear a timer slot; idempotent
pub fn stop_timer(slot: &mut Option<RetryTimer>) {
    if let Some(old) = slot.take() {
        old.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================
