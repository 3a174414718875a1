use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

const ALPHA_OUTCOME: f64 = 0.2;
const ALPHA_UPTIME: f64 = 0.1;
const STABILITY_WINDOW: usize = 10;
const MAX_RESPONSE_TIME_MS: f64 = 30_000.0;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Rolling quality score for one proxy.
///
/// Created lazily on the first observed outcome and mutated only through
/// [`ScoreBook`]. `success_rate` and `uptime` carry a neutral 0.5 prior so a
/// fresh proxy is neither trusted nor condemned; three straight successes
/// lift `success_rate` to 0.744.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyScore {
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_used_ms: i64,
    pub uptime: f64,
    pub stability: f64,
    pub first_seen_ms: i64,
    pub geo_distance_score: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    #[serde(skip)]
    recent_response_times: VecDeque<f64>,
}

impl ProxyScore {
    pub fn new() -> Self {
        Self {
            success_rate: 0.5,
            avg_response_time_ms: 0.0,
            successful_requests: 0,
            failed_requests: 0,
            last_used_ms: 0,
            uptime: 0.5,
            stability: 1.0,
            first_seen_ms: now_ms(),
            geo_distance_score: 0.5,
            consecutive_successes: 0,
            consecutive_failures: 0,
            recent_response_times: VecDeque::with_capacity(STABILITY_WINDOW),
        }
    }

    pub fn record_success(&mut self, response_time_ms: u64) {
        let rt = (response_time_ms as f64).clamp(0.0, MAX_RESPONSE_TIME_MS);
        self.success_rate = ALPHA_OUTCOME * 1.0 + (1.0 - ALPHA_OUTCOME) * self.success_rate;
        self.uptime = ALPHA_UPTIME * 1.0 + (1.0 - ALPHA_UPTIME) * self.uptime;
        self.avg_response_time_ms = if self.successful_requests == 0 {
            rt
        } else {
            (ALPHA_OUTCOME * rt + (1.0 - ALPHA_OUTCOME) * self.avg_response_time_ms)
                .clamp(0.0, MAX_RESPONSE_TIME_MS)
        };
        self.successful_requests += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;

        if self.recent_response_times.len() == STABILITY_WINDOW {
            self.recent_response_times.pop_front();
        }
        self.recent_response_times.push_back(rt);
        self.stability = self.compute_stability();
    }

    pub fn record_failure(&mut self) {
        self.success_rate = (1.0 - ALPHA_OUTCOME) * self.success_rate;
        self.uptime = (1.0 - ALPHA_UPTIME) * self.uptime;
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    pub fn touch(&mut self) {
        self.last_used_ms = now_ms();
    }

    pub fn age_hours(&self) -> f64 {
        ((now_ms() - self.first_seen_ms).max(0) as f64) / 3_600_000.0
    }

    /// Weighted composite in [0, 1] driving the scored strategies.
    pub fn composite(&self) -> f64 {
        let rt_score = (1.0 - self.avg_response_time_ms / 5000.0).clamp(0.0, 1.0);
        let age_score = (self.age_hours() / 168.0).clamp(0.0, 1.0);
        let streak = self.consecutive_successes as f64 - self.consecutive_failures as f64;
        let streak_score = (streak / 5.0).clamp(0.0, 1.0);

        0.30 * self.success_rate
            + 0.20 * rt_score
            + 0.15 * self.uptime
            + 0.15 * self.stability
            + 0.05 * age_score
            + 0.05 * self.geo_distance_score
            + 0.10 * streak_score
    }

    /// 1 − min(1, σ/μ) over the last ten response times; 1 with fewer than
    /// two samples.
    fn compute_stability(&self) -> f64 {
        let n = self.recent_response_times.len();
        if n < 2 {
            return 1.0;
        }
        let mean: f64 = self.recent_response_times.iter().sum::<f64>() / n as f64;
        if mean <= f64::EPSILON {
            return 1.0;
        }
        let variance: f64 = self
            .recent_response_times
            .iter()
            .map(|rt| (rt - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        1.0 - (variance.sqrt() / mean).min(1.0)
    }
}

impl Default for ProxyScore {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared score registry, keyed by [`Proxy::key`](crate::Proxy::key).
///
/// The pool manager is the only writer of outcomes; strategies read
/// composites and stamp `last_used_ms` on selection. Non-suspending.
#[derive(Clone, Default)]
pub struct ScoreBook {
    inner: Arc<RwLock<HashMap<String, ProxyScore>>>,
}

impl ScoreBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ProxyScore> {
        self.inner.read().get(key).cloned()
    }

    pub fn record_success(&self, key: &str, response_time_ms: u64) -> ProxyScore {
        let mut map = self.inner.write();
        let score = map.entry(key.to_string()).or_default();
        score.record_success(response_time_ms);
        score.clone()
    }

    pub fn record_failure(&self, key: &str) -> ProxyScore {
        let mut map = self.inner.write();
        let score = map.entry(key.to_string()).or_default();
        score.record_failure();
        score.clone()
    }

    /// Stamps selection time. Creates the entry if the proxy has no outcome
    /// history yet, so LRU ordering covers never-used proxies too.
    pub fn touch(&self, key: &str) {
        let mut map = self.inner.write();
        map.entry(key.to_string()).or_default().touch();
    }

    pub fn last_used_ms(&self, key: &str) -> i64 {
        self.inner.read().get(key).map(|s| s.last_used_ms).unwrap_or(0)
    }

    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.inner
            .read()
            .get(key)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Composite for a key; unknown proxies score as a fresh neutral record
    /// without inserting one.
    pub fn composite(&self, key: &str) -> f64 {
        self.inner
            .read()
            .get(key)
            .map(|s| s.composite())
            .unwrap_or_else(|| ProxyScore::new().composite())
    }

    pub fn remove(&self, key: &str) {
        self.inner.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, ProxyScore> {
        self.inner.read().clone()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} !~ {}", a, b);
    }

    #[test]
    fn ewma_reaches_documented_anchor() {
        let mut score = ProxyScore::new();
        score.record_success(100);
        score.record_success(100);
        score.record_success(100);
        approx(score.success_rate, 0.744);
        assert_eq!(score.successful_requests, 3);
        assert_eq!(score.consecutive_successes, 3);

        score.record_failure();
        approx(score.success_rate, 0.5952);
        assert_eq!(score.successful_requests, 3);
        assert_eq!(score.failed_requests, 1);
        assert_eq!(score.consecutive_successes, 0);
        assert_eq!(score.consecutive_failures, 1);
    }

    #[test]
    fn streaks_never_both_nonzero() {
        let mut score = ProxyScore::new();
        score.record_success(50);
        score.record_failure();
        score.record_failure();
        assert_eq!(score.consecutive_successes, 0);
        assert_eq!(score.consecutive_failures, 2);
        score.record_success(50);
        assert_eq!(score.consecutive_successes, 1);
        assert_eq!(score.consecutive_failures, 0);
    }

    #[test]
    fn stability_penalizes_jitter() {
        let mut steady = ProxyScore::new();
        for _ in 0..10 {
            steady.record_success(200);
        }
        approx(steady.stability, 1.0);

        let mut jittery = ProxyScore::new();
        for rt in [50u64, 4000, 80, 3500, 60, 4200, 90, 3900, 70, 4100] {
            jittery.record_success(rt);
        }
        assert!(jittery.stability < steady.stability);
        assert!((0.0..=1.0).contains(&jittery.stability));
    }

    #[test]
    fn composite_stays_in_unit_interval() {
        let mut score = ProxyScore::new();
        assert!((0.0..=1.0).contains(&score.composite()));
        for _ in 0..20 {
            score.record_success(10);
        }
        assert!((0.0..=1.0).contains(&score.composite()));
        for _ in 0..30 {
            score.record_failure();
        }
        assert!((0.0..=1.0).contains(&score.composite()));
    }

    #[test]
    fn response_time_is_clamped() {
        let mut score = ProxyScore::new();
        score.record_success(120_000);
        assert!(score.avg_response_time_ms <= MAX_RESPONSE_TIME_MS);
    }

    #[test]
    fn book_touch_creates_entry() {
        let book = ScoreBook::new();
        assert_eq!(book.last_used_ms("1.1.1.1:80/http"), 0);
        book.touch("1.1.1.1:80/http");
        assert!(book.last_used_ms("1.1.1.1:80/http") > 0);
        assert_eq!(book.len(), 1);
    }
}
