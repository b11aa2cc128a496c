//! Reconnect policy: fixed delay per session class, optional cap and jitter.

use std::time::Duration;

use rand::Rng;

use crate::{config::Config, domain::SessionClass, protocol::CloseReason};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub jitter: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalReason {
    LoggedOut,
    RetriesExhausted,
    Requested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { delay: Duration },
    Terminal(TerminalReason),
}

impl ReconnectPolicy {
    pub fn fixed(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_retries: None,
            jitter: Duration::ZERO,
        }
    }

    pub fn for_class(cfg: &Config, class: SessionClass) -> Self {
        let base_delay = match class {
            SessionClass::User => cfg.user_reconnect_delay,
            SessionClass::Operator => cfg.operator_reconnect_delay,
        };
        Self {
            base_delay,
            max_retries: cfg.reconnect_max_retries,
            jitter: cfg.reconnect_jitter,
        }
    }

    /// Decide what follows a closure, given how many retries already ran.
    pub fn decide(&self, reason: &CloseReason, retry_count: u32) -> ReconnectDecision {
        if reason.is_terminal() {
            return ReconnectDecision::Terminal(TerminalReason::LoggedOut);
        }
        if let Some(max) = self.max_retries {
            if retry_count >= max {
                return ReconnectDecision::Terminal(TerminalReason::RetriesExhausted);
            }
        }
        ReconnectDecision::Retry {
            delay: self.jittered(),
        }
    }

    fn jittered(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base_delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.base_delay + Duration::from_millis(extra)
    }
}
