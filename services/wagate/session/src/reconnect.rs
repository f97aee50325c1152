//! Reconnect policy and scheduler.
//!
//! Closures are split into terminal ones (the stored credentials are
//! permanently unusable) and retryable ones. Retryable closures arm one
//! looping task per session that sleeps with capped exponential backoff and
//! re-enters the lifecycle manager until a reconnect succeeds or the session
//! is removed. There is no attempt ceiling.

use crate::manager::SessionManager;
use crate::session::{RetryPlan, SharedSession};
use crate::SessionError;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wagate_client::closure::codes;

/// Outcome of classifying a closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureClass {
    /// Credentials are unusable; never reconnect automatically
    Terminal,
    /// Transient; reconnect with backoff
    Retryable,
}

/// Backoff parameters and the set of terminal closure codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any retry delay
    pub max_delay: Duration,
    /// Closure codes that end a session for good
    pub terminal_codes: BTreeSet<u16>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            terminal_codes: codes::DEFAULT_TERMINAL.into_iter().collect(),
        }
    }
}

impl ReconnectPolicy {
    /// Classify a closure by its status code. No code means retryable.
    pub fn classify(&self, code: Option<u16>) -> ClosureClass {
        match code {
            Some(code) if self.terminal_codes.contains(&code) => ClosureClass::Terminal,
            _ => ClosureClass::Retryable,
        }
    }

    /// Delay for the `attempt`-th retry: `min(base * 2^(attempt-1), max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Arms and runs reconnect timers
#[derive(Debug, Clone, Default)]
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
}

impl ReconnectScheduler {
    /// Scheduler applying `policy`
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    /// Policy in effect
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Count one more attempt and spawn the retry loop for `session`.
    ///
    /// A loop armed earlier for the same session is cancelled first, so at
    /// most one timer per session is ever pending.
    pub fn schedule(&self, manager: &SessionManager, session: &SharedSession) -> RetryPlan {
        let (plan, token) = session.arm_retry(&self.policy);
        info!(
            "Reconnecting session {} in {:?} (attempt {})",
            session.id(),
            plan.delay,
            plan.attempt
        );

        tokio::spawn(run_retry_loop(
            manager.clone(),
            session.clone(),
            self.policy.clone(),
            token,
            plan,
        ));
        plan
    }
}

async fn run_retry_loop(
    manager: SessionManager,
    session: SharedSession,
    policy: ReconnectPolicy,
    token: CancellationToken,
    mut plan: RetryPlan,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Reconnect timer for session {} cancelled", session.id());
                return;
            }
            _ = tokio::time::sleep_until(plan.due_at) => {}
        }

        if !manager.registry().contains(session.id()) {
            debug!("Session {} is gone, dropping reconnect timer", session.id());
            return;
        }
        session.retry_fired();

        let user_id = session.user_id();
        match manager
            .reconnect_boxed(session.id().to_string(), user_id)
            .await
        {
            Ok(_) => {
                debug!(
                    "Session {} reconnected on attempt {}",
                    session.id(),
                    plan.attempt
                );
                return;
            }
            Err(SessionError::NotFound(_)) => return,
            Err(e) => {
                if token.is_cancelled() {
                    return;
                }
                plan = session.advance_retry(&policy);
                warn!(
                    "Reconnect of session {} failed: {}; retrying in {:?} (attempt {})",
                    session.id(),
                    e,
                    plan.delay,
                    plan.attempt
                );
            }
        }
    }
}
