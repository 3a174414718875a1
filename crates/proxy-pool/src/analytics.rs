//! Engine counters and a bounded event log.
//!
//! Counters are incremented on error paths too, so a failing pool is just
//! as observable as a healthy one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

const EVENT_LOG_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Fetch,
    Validation,
    Selection,
    RequestOutcome,
    Session,
    Strategy,
    Cache,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

/// Point-in-time copy of all counters plus the retained events.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub proxies_fetched: u64,
    pub validations_run: u64,
    pub validations_passed: u64,
    pub selections: u64,
    pub request_successes: u64,
    pub request_failures: u64,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub errors: u64,
    pub events: Vec<AnalyticsEvent>,
}

#[derive(Default)]
pub struct Analytics {
    proxies_fetched: AtomicU64,
    validations_run: AtomicU64,
    validations_passed: AtomicU64,
    selections: AtomicU64,
    request_successes: AtomicU64,
    request_failures: AtomicU64,
    sessions_created: AtomicU64,
    sessions_evicted: AtomicU64,
    errors: AtomicU64,
    events: Mutex<VecDeque<AnalyticsEvent>>,
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fetched(&self, count: u64) {
        self.proxies_fetched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_validation(&self, passed: bool) {
        self.validations_run.fetch_add(1, Ordering::Relaxed);
        if passed {
            self.validations_passed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_selection(&self) {
        self.selections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_request_outcome(&self, success: bool) {
        if success {
            self.request_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.request_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_session_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Appends to the bounded event log, dropping the oldest entry at cap.
    pub fn record(&self, kind: EventKind, detail: impl Into<String>) {
        let mut events = self.events.lock();
        if events.len() == EVENT_LOG_CAP {
            events.pop_front();
        }
        events.push_back(AnalyticsEvent {
            id: Uuid::new_v4(),
            at: Utc::now(),
            kind,
            detail: detail.into(),
        });
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            proxies_fetched: self.proxies_fetched.load(Ordering::Relaxed),
            validations_run: self.validations_run.load(Ordering::Relaxed),
            validations_passed: self.validations_passed.load(Ordering::Relaxed),
            selections: self.selections.load(Ordering::Relaxed),
            request_successes: self.request_successes.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            events: self.events.lock().iter().cloned().collect(),
        }
    }

    pub fn reset(&self) {
        self.proxies_fetched.store(0, Ordering::Relaxed);
        self.validations_run.store(0, Ordering::Relaxed);
        self.validations_passed.store(0, Ordering::Relaxed);
        self.selections.store(0, Ordering::Relaxed);
        self.request_successes.store(0, Ordering::Relaxed);
        self.request_failures.store(0, Ordering::Relaxed);
        self.sessions_created.store(0, Ordering::Relaxed);
        self.sessions_evicted.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.events.lock().clear();
    }
}
