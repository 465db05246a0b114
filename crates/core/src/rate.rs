//! Per-subject, per-operation fixed-window rate limiting.
//!
//! Each `(subject, class)` pair gets its own counter. A window starts with the
//! first admitted request and the counter resets on the first check once the
//! window has fully elapsed. Denials do not count against the allowance.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, trace};
use trotro_transit::{Session, UserIdentifier};

use crate::config::RateLimits;

/// Who a request is attributed to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Subject {
    Anonymous,
    User(UserIdentifier),
}

impl Subject {
    pub fn from_session(session: Option<&Session>) -> Self {
        match session {
            Some(session) => Subject::User(session.user_id.clone()),
            None => Subject::Anonymous,
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Anonymous => f.write_str("anonymous"),
            Subject::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OperationClass {
    RouteSearch,
    SuggestionLookup,
    ProfileInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// Whole seconds until the window resets, only set on denial.
    pub retry_after_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
struct RateLimitRecord {
    count: u32,
    window_started_at: Instant,
}

pub struct RateGovernor {
    limits: RateLimits,
    records: Mutex<HashMap<(Subject, OperationClass), RateLimitRecord>>,
}

impl RateGovernor {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    pub fn check(&self, subject: &Subject, class: OperationClass) -> RateDecision {
        self.check_at(subject, class, Instant::now())
    }

    /// Admit or deny one request at `now`, updating the counter when admitted.
    pub fn check_at(&self, subject: &Subject, class: OperationClass, now: Instant) -> RateDecision {
        let policy = self.limits.policy(class);
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        let record = records
            .entry((subject.clone(), class))
            .or_insert(RateLimitRecord {
                count: 0,
                window_started_at: now,
            });

        let elapsed = now.saturating_duration_since(record.window_started_at);
        if elapsed >= policy.window {
            record.count = 0;
            record.window_started_at = now;
        }

        if record.count >= policy.max_requests {
            let left = policy.window.saturating_sub(elapsed);
            let retry_after_secs = (left.as_millis().div_ceil(1000) as u64).max(1);
            debug!(%subject, %class, retry_after_secs, "rate limit exceeded");
            return RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: Some(retry_after_secs),
            };
        }

        record.count += 1;
        let remaining = policy.max_requests - record.count;
        trace!(%subject, %class, remaining, "request admitted");

        RateDecision {
            allowed: true,
            remaining,
            retry_after_secs: None,
        }
    }

    /// Requests left for `subject` without consuming one.
    pub fn remaining(&self, subject: &Subject, class: OperationClass) -> u32 {
        self.remaining_at(subject, class, Instant::now())
    }

    pub fn remaining_at(&self, subject: &Subject, class: OperationClass, now: Instant) -> u32 {
        let policy = self.limits.policy(class);
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        match records.get(&(subject.clone(), class)) {
            Some(record)
                if now.saturating_duration_since(record.window_started_at) < policy.window =>
            {
                policy.max_requests.saturating_sub(record.count)
            }
            _ => policy.max_requests,
        }
    }

    /// Drop every record whose window has elapsed. Returns how many went.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();

        records.retain(|(_, class), record| {
            now.saturating_duration_since(record.window_started_at)
                < self.limits.policy(*class).window
        });

        let swept = before - records.len();
        if swept > 0 {
            debug!(swept, "evicted expired rate-limit records");
        }
        swept
    }

    pub fn tracked(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sweep periodically until the governor is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let governor: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(governor) = governor.upgrade() else {
                    break;
                };
                governor.sweep_expired(Instant::now());
            }
        })
    }
}
