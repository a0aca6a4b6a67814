use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::FetchError;

/// The number of failures kept in [`RequestStats::recent_errors`].
pub const MAX_RECENT_ERRORS: usize = 5;

/// A failed request, as remembered by [`RequestStats`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Request bookkeeping for a single key.
///
/// Counters only ever increase. They are reset solely by dropping the whole record.
#[derive(Clone, Debug, Serialize)]
pub struct RequestStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    /// The most recent failures, oldest first.
    pub recent_errors: VecDeque<ErrorRecord>,
}

impl RequestStats {
    pub(super) fn new() -> Self {
        Self {
            attempts: 0,
            successes: 0,
            failures: 0,
            first_attempt: Utc::now(),
            last_attempt: None,
            last_success: None,
            last_failure: None,
            recent_errors: VecDeque::with_capacity(MAX_RECENT_ERRORS),
        }
    }

    pub(super) fn record_attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt = Some(Utc::now());
    }

    pub(super) fn record_success(&mut self) {
        self.successes += 1;
        self.last_success = Some(Utc::now());
    }

    pub(super) fn record_failure(&mut self, error: &FetchError) {
        let now = Utc::now();
        self.failures += 1;
        self.last_failure = Some(now);

        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(ErrorRecord {
            timestamp: now,
            message: error.to_string(),
        });
    }

    /// The share of successful attempts, formatted as a percentage with two decimals.
    pub fn success_rate(&self) -> String {
        if self.attempts == 0 {
            return "0%".into();
        }
        let rate = self.successes as f64 / self.attempts as f64 * 100.0;
        format!("{rate:.2}%")
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            attempts: self.attempts,
            successes: self.successes,
            failures: self.failures,
            success_rate: self.success_rate(),
        }
    }
}

/// The counters of [`RequestStats`] as reported by
/// [`SizeInfoManager::status`](super::SizeInfoManager::status).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: String,
}
