//! License gate — the input-constraint oracle consulted before mutating
//! operations. Only the contract lives here; acquiring and verifying a
//! license (remote verification, encrypted storage) happens elsewhere and
//! this module just reads the resulting state file.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::fsjson;

/// Free-trial limits applied while no license is activated.
pub const FREE_TRIAL_MAX_TASKS: usize = 1;
pub const FREE_TRIAL_INTERVAL_SECS: u32 = 7200;

/// Durable license state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LicenseState {
    NotActivated,
    Activated {
        /// Maximum number of concurrent tasks the license allows.
        task_num: usize,
        /// Instant after which the license no longer grants anything.
        end_time: NaiveDateTime,
    },
}

/// Gate over the current license state. An activated-but-expired license
/// grants the same limits as the free trial.
pub struct LicenseGate {
    state: LicenseState,
    clock: Arc<dyn Clock>,
}

impl LicenseGate {
    pub fn new(state: LicenseState, clock: Arc<dyn Clock>) -> Self {
        Self { state, clock }
    }

    /// Read the license state file; absent or unreadable means free trial.
    pub fn load(path: &Path, clock: Arc<dyn Clock>) -> Self {
        let state = if path.exists() {
            match fsjson::read::<LicenseState>(path) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("⚠️ license state unreadable ({e}), running as free trial");
                    LicenseState::NotActivated
                }
            }
        } else {
            LicenseState::NotActivated
        };
        Self::new(state, clock)
    }

    pub fn is_activated(&self) -> bool {
        matches!(self.state, LicenseState::Activated { .. })
    }

    /// True iff activated and past the license end time.
    pub fn is_expired(&self) -> bool {
        match &self.state {
            LicenseState::NotActivated => false,
            LicenseState::Activated { end_time, .. } => self.clock.now() >= *end_time,
        }
    }

    fn trial_limits(&self) -> bool {
        !self.is_activated() || self.is_expired()
    }

    /// Maximum task count currently allowed.
    pub fn max_tasks(&self) -> usize {
        if self.trial_limits() {
            return FREE_TRIAL_MAX_TASKS;
        }
        match &self.state {
            LicenseState::Activated { task_num, .. } => *task_num,
            LicenseState::NotActivated => FREE_TRIAL_MAX_TASKS,
        }
    }

    /// Interval the trial forces onto every task, or `None` when the caller's
    /// value is accepted.
    pub fn forced_interval(&self) -> Option<u32> {
        if self.trial_limits() {
            Some(FREE_TRIAL_INTERVAL_SECS)
        } else {
            None
        }
    }

    /// Whether execute-now is permitted at all.
    pub fn can_execute_now(&self) -> bool {
        self.is_activated() && !self.is_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::NaiveDate;

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn free_trial_limits() {
        let gate = LicenseGate::new(LicenseState::NotActivated, Arc::new(FixedClock::at(at(10))));
        assert_eq!(gate.max_tasks(), 1);
        assert_eq!(gate.forced_interval(), Some(7200));
        assert!(!gate.can_execute_now());
        assert!(!gate.is_expired());
    }

    #[test]
    fn activated_license_lifts_limits() {
        let gate = LicenseGate::new(
            LicenseState::Activated {
                task_num: 10,
                end_time: at(23),
            },
            Arc::new(FixedClock::at(at(10))),
        );
        assert_eq!(gate.max_tasks(), 10);
        assert_eq!(gate.forced_interval(), None);
        assert!(gate.can_execute_now());
    }

    #[test]
    fn expired_license_falls_back_to_trial_limits() {
        let clock = Arc::new(FixedClock::at(at(10)));
        let gate = LicenseGate::new(
            LicenseState::Activated {
                task_num: 10,
                end_time: at(9),
            },
            clock,
        );
        assert!(gate.is_expired());
        assert_eq!(gate.max_tasks(), 1);
        assert_eq!(gate.forced_interval(), Some(7200));
        assert!(!gate.can_execute_now());
    }

    #[test]
    fn missing_state_file_means_trial() {
        let gate = LicenseGate::load(
            Path::new("/nonexistent/postpilot-license.json"),
            Arc::new(FixedClock::at(at(10))),
        );
        assert!(!gate.is_activated());
    }
}
