//! Auto-restart decisions for crashed projects.
//!
//! Pure policy: given how a run ended, say whether to restart and after what
//! delay. Issuing the restart is the registry's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RestartConfig;

/// How a `Running` child ended without being asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashReport {
    pub exit_code: Option<i32>,
    pub ran_for: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    Disabled,
    /// Died before `min_uptime`; restarting would just loop.
    StartupFailure,
    /// `max_restarts` consecutive restarts already spent.
    RetriesExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart {
        delay: Duration,
        /// 1-based attempt number, also the new restart count.
        attempt: u32,
    },
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_restarts: u32,
    pub min_uptime: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub stable_after: Duration,
}

impl RestartPolicy {
    /// Build from config; `min_uptime` falls back to the start grace period.
    pub fn from_config(config: &RestartConfig, start_grace: Duration) -> Self {
        Self {
            enabled: config.enabled,
            max_restarts: config.max_restarts,
            min_uptime: config.min_uptime.unwrap_or(start_grace),
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            stable_after: config.stable_after,
        }
    }

    /// Decide what to do about `crash`, given `restart_count` consecutive
    /// automatic restarts so far.
    pub fn decide(&self, crash: &CrashReport, restart_count: u32) -> RestartDecision {
        if !self.enabled {
            return RestartDecision::GiveUp(GiveUpReason::Disabled);
        }
        if crash.ran_for < self.min_uptime {
            return RestartDecision::GiveUp(GiveUpReason::StartupFailure);
        }
        let previous = if crash.ran_for >= self.stable_after {
            0
        } else {
            restart_count
        };
        if previous >= self.max_restarts {
            return RestartDecision::GiveUp(GiveUpReason::RetriesExhausted);
        }
        RestartDecision::Restart {
            delay: self.backoff(previous),
            attempt: previous + 1,
        }
    }

    /// `backoff_base * 2^n`, capped at `backoff_max`.
    pub fn backoff(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.min(31)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}
