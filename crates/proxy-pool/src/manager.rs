//! The pool manager facade.
//!
//! Owns the pool subsets, score registry, strategy, sessions, analytics and
//! the network machinery, and serializes state mutation so callers observe
//! `add/remove/record*` linearized against selection. Network fan-out is
//! the only suspending part; selection and bookkeeping never block on I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{info, warn};

use crate::analytics::{Analytics, AnalyticsSnapshot, EventKind};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::executor::{CancelToken, ParallelExecutor, ProgressFn};
use crate::http_client::HttpClient;
use crate::proxy::Proxy;
use crate::rotation::{build_strategy, RotationStrategy, RotationStrategyKind};
use crate::scoring::{ScoreBook, ProxyScore};
use crate::session::{Session, SessionManager};
use crate::sources::{FetchOptions, SourceRegistry};
use crate::store::{KeyValueStore, MemoryStore, ProxyCache};
use crate::validator::{ProxyValidator, ValidationOutcome, ValidatorConfig};

/// Options for a single selection through the facade.
#[derive(Debug, Clone, Copy)]
pub struct SelectionOptions {
    /// Restrict selection to the validated subset.
    pub validated: bool,
    /// Random strategy only: sample proportional to composite score.
    pub use_scoring: bool,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self { validated: true, use_scoring: false }
    }
}

#[derive(Default)]
struct PoolState {
    candidates: Vec<Proxy>,
    validated: Vec<Proxy>,
}

impl PoolState {
    fn contains(&self, proxy: &Proxy) -> bool {
        self.candidates.contains(proxy) || self.validated.contains(proxy)
    }

    fn promote(&mut self, proxy: &Proxy) {
        self.candidates.retain(|p| p != proxy);
        if !self.validated.contains(proxy) {
            self.validated.push(proxy.clone());
        }
    }

    fn demote(&mut self, proxy: &Proxy) -> bool {
        let was_validated = self.validated.contains(proxy);
        if was_validated {
            self.validated.retain(|p| p != proxy);
            if !self.candidates.contains(proxy) {
                self.candidates.push(proxy.clone());
            }
        }
        was_validated
    }

    fn remove(&mut self, proxy: &Proxy) {
        self.candidates.retain(|p| p != proxy);
        self.validated.retain(|p| p != proxy);
    }
}

/// The engine facade. One value per host; no process-wide state.
pub struct ProxyPoolManager {
    config: PoolConfig,
    registry: SourceRegistry,
    validator: ProxyValidator,
    executor: ParallelExecutor,
    cache: ProxyCache,
    scores: ScoreBook,
    sessions: SessionManager,
    analytics: Analytics,
    state: RwLock<PoolState>,
    strategy: Mutex<Box<dyn RotationStrategy>>,
}

impl ProxyPoolManager {
    /// Builds an engine backed by the in-memory store.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Builds an engine persisting through the host's key-value store.
    pub fn with_store(config: PoolConfig, kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let client = Arc::new(
            HttpClient::new(config.source_timeout())
                .map_err(|e| PoolError::Fetch(format!("http client init: {}", e)))?,
        );
        let registry = SourceRegistry::from_selection(&config.sources, client);
        Ok(Self::assemble(config, kv, registry))
    }

    /// Builds an engine over host-supplied sources instead of the built-in
    /// selection.
    pub fn with_sources(
        config: PoolConfig,
        kv: Arc<dyn KeyValueStore>,
        sources: Vec<Arc<dyn crate::sources::ProxySource>>,
    ) -> Self {
        Self::assemble(config, kv, SourceRegistry::from_sources(sources))
    }

    fn assemble(config: PoolConfig, kv: Arc<dyn KeyValueStore>, registry: SourceRegistry) -> Self {
        let validator = ProxyValidator::new(ValidatorConfig {
            test_url: config.test_url.clone(),
            timeout: config.validation_timeout(),
        });
        let executor = ParallelExecutor::new(config.max_concurrent_validations);
        let scores = ScoreBook::new();
        let strategy = Mutex::new(build_strategy(config.rotation, scores.clone()));
        let sessions = SessionManager::new(config.sessions.clone());

        Self {
            cache: ProxyCache::new(kv),
            registry,
            validator,
            executor,
            scores,
            sessions,
            analytics: Analytics::new(),
            state: RwLock::new(PoolState::default()),
            strategy,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn scores(&self) -> &ScoreBook {
        &self.scores
    }

    pub(crate) fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    // -- discovery ----------------------------------------------------------

    /// Aggregates candidates from every enabled source, deduplicates by
    /// proxy identity, applies the filter options and caches the candidate
    /// set. Fails only when every source came back empty.
    pub async fn fetch_proxies(&self, options: &FetchOptions) -> Result<Vec<Proxy>> {
        let fetched = self.registry.fetch_all(self.config.source_timeout()).await;
        self.analytics.add_fetched(fetched.len() as u64);
        self.analytics
            .record(EventKind::Fetch, format!("{} unique candidates fetched", fetched.len()));

        if fetched.is_empty() {
            self.analytics.add_error();
            return Err(PoolError::Fetch("all sources returned empty or failed".to_string()));
        }

        let selected: Vec<Proxy> = fetched
            .into_iter()
            .filter(|p| options.matches(p))
            .take(options.count.max(1))
            .collect();

        let candidates_snapshot = {
            let mut state = self.state.write();
            for proxy in &selected {
                if !state.contains(proxy) {
                    state.candidates.push(proxy.clone());
                }
            }
            state.candidates.clone()
        };
        self.cache.store_proxies(&candidates_snapshot).await?;

        Ok(selected)
    }

    /// Fetches candidates, probes them through the bounded executor and
    /// promotes the survivors. Results keep candidate order; a cancel
    /// discards partial results and surfaces [`PoolError::Cancelled`].
    pub async fn fetch_validated_proxies(
        &self,
        options: &FetchOptions,
        on_progress: Option<ProgressFn<'_>>,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<Proxy>> {
        // Validation thins the list, so gather extra candidates up front.
        let mut widened = options.clone();
        widened.count = options.count.max(1).saturating_mul(3);
        let candidates = self.fetch_proxies(&widened).await?;

        let outcome = self
            .executor
            .run(
                candidates.clone(),
                |proxy| {
                    let validator = &self.validator;
                    async move {
                        match validator.validate(&proxy).await {
                            Ok(result) => result,
                            Err(_) => ValidationOutcome { valid: false, response_time_ms: 0 },
                        }
                    }
                },
                on_progress,
                cancel,
            )
            .await;

        if outcome.cancelled {
            self.analytics.add_error();
            self.analytics.record(EventKind::Validation, "validation batch cancelled");
            return Err(PoolError::Cancelled);
        }

        let mut survivors = Vec::new();
        for (proxy, result) in candidates.iter().zip(outcome.results.iter()) {
            let Some(result) = result else { continue };
            self.analytics.add_validation(result.valid);
            if result.valid {
                self.scores.record_success(&proxy.key(), result.response_time_ms);
                survivors.push(proxy.clone());
            } else {
                self.scores.record_failure(&proxy.key());
            }
        }
        survivors.truncate(options.count.max(1));

        let validated_snapshot = {
            let mut state = self.state.write();
            for proxy in &survivors {
                state.promote(proxy);
            }
            state.validated.clone()
        };
        self.strategy.lock().update_proxies(validated_snapshot.clone());
        self.cache.store_validated(&validated_snapshot).await?;

        info!("validated {}/{} candidates", survivors.len(), candidates.len());
        self.analytics.record(
            EventKind::Validation,
            format!("{} of {} candidates passed", survivors.len(), candidates.len()),
        );
        Ok(survivors)
    }

    /// Single-shot probe of one proxy; optionally records the outcome on
    /// its score.
    pub async fn validate_specific_proxy(
        &self,
        proxy: &Proxy,
        timeout: Option<Duration>,
        update_score: bool,
    ) -> Result<ValidationOutcome> {
        let timeout = timeout.unwrap_or_else(|| self.config.validation_timeout());
        let outcome = self.validator.validate_with(proxy, &self.config.test_url, timeout).await?;
        self.analytics.add_validation(outcome.valid);
        if update_score {
            if outcome.valid {
                self.scores.record_success(&proxy.key(), outcome.response_time_ms);
            } else {
                self.scores.record_failure(&proxy.key());
            }
        }
        Ok(outcome)
    }

    // -- selection ----------------------------------------------------------

    /// Next proxy under the current strategy. `validated: false` widens the
    /// pick to the whole pool, uniformly.
    pub fn get_next_proxy(&self, options: SelectionOptions) -> Result<Proxy> {
        self.analytics.add_selection();

        if options.validated {
            let mut strategy = self.strategy.lock();
            strategy.set_use_scoring(options.use_scoring);
            match strategy.get_next() {
                Some(proxy) => {
                    self.analytics.record(EventKind::Selection, proxy.key());
                    Ok(proxy)
                }
                None => {
                    self.analytics.add_error();
                    Err(PoolError::NoValidProxies)
                }
            }
        } else {
            let state = self.state.read();
            let total = state.validated.len() + state.candidates.len();
            if total == 0 {
                drop(state);
                self.analytics.add_error();
                return Err(PoolError::NoValidProxies);
            }
            let index = rand::thread_rng().gen_range(0..total);
            let proxy = if index < state.validated.len() {
                state.validated[index].clone()
            } else {
                state.candidates[index - state.validated.len()].clone()
            };
            drop(state);
            self.scores.touch(&proxy.key());
            self.analytics.record(EventKind::Selection, proxy.key());
            Ok(proxy)
        }
    }

    /// Uniform pick from the validated subset.
    pub fn get_random_proxy(&self) -> Result<Proxy> {
        self.analytics.add_selection();
        let state = self.state.read();
        if state.validated.is_empty() {
            drop(state);
            self.analytics.add_error();
            return Err(PoolError::NoValidProxies);
        }
        let proxy = state.validated[rand::thread_rng().gen_range(0..state.validated.len())].clone();
        drop(state);
        self.scores.touch(&proxy.key());
        self.analytics.record(EventKind::Selection, proxy.key());
        Ok(proxy)
    }

    /// Validated proxy with the oldest `last_used_ms`.
    pub fn get_least_recently_used_proxy(&self) -> Result<Proxy> {
        self.analytics.add_selection();
        let state = self.state.read();
        let proxy = state
            .validated
            .iter()
            .min_by_key(|p| self.scores.last_used_ms(&p.key()))
            .cloned();
        drop(state);
        match proxy {
            Some(proxy) => {
                self.scores.touch(&proxy.key());
                self.analytics.record(EventKind::Selection, proxy.key());
                Ok(proxy)
            }
            None => {
                self.analytics.add_error();
                Err(PoolError::NoValidProxies)
            }
        }
    }

    /// Swaps the strategy, transferring the current validated pool.
    pub fn set_rotation_strategy(&self, kind: RotationStrategyKind) {
        let validated = self.state.read().validated.clone();
        let mut strategy = build_strategy(kind, self.scores.clone());
        strategy.update_proxies(validated);
        *self.strategy.lock() = strategy;
        self.analytics.record(EventKind::Strategy, format!("strategy set to {}", kind));
        info!("rotation strategy set to {}", kind);
    }

    pub fn rotation_strategy_kind(&self) -> RotationStrategyKind {
        self.strategy.lock().kind()
    }

    // -- outcome recording --------------------------------------------------

    /// Records a successful request through `proxy`.
    pub fn record_success(&self, proxy: &Proxy, response_time_ms: u64) {
        self.scores.record_success(&proxy.key(), response_time_ms);
        self.analytics.add_request_outcome(true);
        self.strategy.lock().record_success(proxy);
    }

    /// Records a failed request; at the consecutive-failure cap the proxy is
    /// demoted back to the candidate set. Its sessions stay alive.
    pub fn record_failure(&self, proxy: &Proxy) {
        let score = self.scores.record_failure(&proxy.key());
        self.analytics.add_request_outcome(false);
        self.strategy.lock().record_failure(proxy);

        if score.consecutive_failures >= self.config.max_consecutive_failures {
            let demoted = self.state.write().demote(proxy);
            if demoted {
                warn!(
                    "{} demoted to candidates after {} consecutive failures",
                    proxy.key(),
                    score.consecutive_failures
                );
                let validated = self.state.read().validated.clone();
                self.strategy.lock().update_proxies(validated);
                self.analytics.record(
                    EventKind::Strategy,
                    format!("{} demoted after {} consecutive failures", proxy.key(), score.consecutive_failures),
                );
            }
        }
    }

    // -- explicit pool edits ------------------------------------------------

    /// Adds proxies straight into the chosen subset. Adding as validated
    /// promotes entries already known as candidates.
    pub fn add_proxies(&self, proxies: Vec<Proxy>, validated: bool) {
        let snapshot = {
            let mut state = self.state.write();
            for proxy in proxies {
                if validated {
                    state.promote(&proxy);
                } else if !state.contains(&proxy) {
                    state.candidates.push(proxy);
                }
            }
            validated.then(|| state.validated.clone())
        };
        if let Some(validated_pool) = snapshot {
            self.strategy.lock().update_proxies(validated_pool);
        }
    }

    /// Explicitly sends a validated proxy back to the candidate set without
    /// touching its score or sessions.
    pub fn invalidate_proxy(&self, proxy: &Proxy) {
        let demoted = self.state.write().demote(proxy);
        if demoted {
            let validated = self.state.read().validated.clone();
            self.strategy.lock().update_proxies(validated);
            self.analytics
                .record(EventKind::Strategy, format!("{} explicitly invalidated", proxy.key()));
        }
    }

    /// Removes a proxy from the pool entirely, dropping its score and any
    /// sessions pinned to its endpoint.
    pub fn remove_proxy(&self, proxy: &Proxy) {
        let validated = {
            let mut state = self.state.write();
            state.remove(proxy);
            state.validated.clone()
        };
        self.scores.remove(&proxy.key());
        self.sessions.invalidate_proxy(proxy);
        self.strategy.lock().update_proxies(validated);
    }

    pub fn candidate_count(&self) -> usize {
        self.state.read().candidates.len()
    }

    pub fn validated_count(&self) -> usize {
        self.state.read().validated.len()
    }

    pub fn candidates(&self) -> Vec<Proxy> {
        self.state.read().candidates.clone()
    }

    pub fn validated(&self) -> Vec<Proxy> {
        self.state.read().validated.clone()
    }

    pub fn score_of(&self, proxy: &Proxy) -> Option<ProxyScore> {
        self.scores.get(&proxy.key())
    }

    // -- persistence --------------------------------------------------------

    /// Loads both cached sets into the pool; returns how many entered each
    /// subset.
    pub async fn warm_start(&self) -> Result<(usize, usize)> {
        let cached = self.cache.load_proxies().await?;
        let validated = self.cache.load_validated().await?;

        let (added_candidates, added_validated, snapshot) = {
            let mut state = self.state.write();
            let mut added_candidates = 0;
            for proxy in cached {
                if !state.contains(&proxy) {
                    state.candidates.push(proxy);
                    added_candidates += 1;
                }
            }
            let mut added_validated = 0;
            for proxy in validated {
                if !state.validated.contains(&proxy) {
                    state.candidates.retain(|p| *p != proxy);
                    state.validated.push(proxy);
                    added_validated += 1;
                }
            }
            (added_candidates, added_validated, state.validated.clone())
        };
        self.strategy.lock().update_proxies(snapshot);
        self.analytics.record(
            EventKind::Cache,
            format!("warm start: {} candidates, {} validated", added_candidates, added_validated),
        );
        Ok((added_candidates, added_validated))
    }

    /// Writes both subsets to the store.
    pub async fn persist(&self) -> Result<()> {
        let (candidates, validated) = {
            let state = self.state.read();
            (state.candidates.clone(), state.validated.clone())
        };
        self.cache.store_proxies(&candidates).await?;
        self.cache.store_validated(&validated).await
    }

    // -- sessions -----------------------------------------------------------

    /// Sticky session for `(proxy, domain)` with synthesized defaults.
    pub fn create_session(&self, proxy: &Proxy, domain: &str) -> Session {
        self.create_session_with(proxy, domain, None, None, None)
    }

    pub fn create_session_with(
        &self,
        proxy: &Proxy,
        domain: &str,
        user_agent: Option<String>,
        cookies: Option<HashMap<String, String>>,
        headers: Option<HashMap<String, String>>,
    ) -> Session {
        let reusing = self.sessions.find_session(proxy, domain).is_some();
        let will_evict = !reusing
            && self.sessions.session_count_for(proxy) >= self.config.sessions.max_sessions_per_proxy;

        let session = self
            .sessions
            .create_session(proxy, domain, user_agent, cookies, headers);

        if !reusing {
            self.analytics.add_session_created();
            self.analytics.record(EventKind::Session, format!("session {} on {}", session.id, domain));
            if will_evict {
                self.analytics.add_session_evicted();
            }
        }
        session
    }

    /// Outgoing header set for a session, or `None` once it expired.
    pub fn session_headers(&self, session_id: &str) -> Option<HashMap<String, String>> {
        self.sessions.get_session(session_id).map(|s| s.request_headers())
    }

    pub fn invalidate_session(&self, session_id: &str) {
        self.sessions.invalidate_session(session_id);
    }

    // -- analytics ----------------------------------------------------------

    pub fn analytics_snapshot(&self) -> AnalyticsSnapshot {
        self.analytics.snapshot()
    }

    pub fn reset_analytics(&self) {
        self.analytics.reset();
    }

    pub(crate) fn analytics(&self) -> &Analytics {
        &self.analytics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyProtocol;

    fn seeded_manager() -> ProxyPoolManager {
        let manager = ProxyPoolManager::new(PoolConfig::default()).unwrap();
        manager.add_proxies(
            vec![
                Proxy::new("1.1.1.1", 80, ProxyProtocol::Http),
                Proxy::new("2.2.2.2", 80, ProxyProtocol::Http),
                Proxy::new("3.3.3.3", 80, ProxyProtocol::Http),
            ],
            true,
        );
        manager
    }

    #[test]
    fn round_robin_cycles_through_seeded_pool() {
        let manager = seeded_manager();
        let picks: Vec<String> = (0..5)
            .map(|_| manager.get_next_proxy(SelectionOptions::default()).unwrap().ip)
            .collect();
        assert_eq!(picks, ["1.1.1.1", "2.2.2.2", "3.3.3.3", "1.1.1.1", "2.2.2.2"]);
    }

    #[test]
    fn empty_pool_yields_no_valid_proxies() {
        let manager = ProxyPoolManager::new(PoolConfig::default()).unwrap();
        assert!(matches!(
            manager.get_next_proxy(SelectionOptions::default()),
            Err(PoolError::NoValidProxies)
        ));
        assert!(matches!(manager.get_random_proxy(), Err(PoolError::NoValidProxies)));
        assert!(matches!(
            manager.get_least_recently_used_proxy(),
            Err(PoolError::NoValidProxies)
        ));
    }

    #[test]
    fn strategy_swap_round_trips_and_keeps_pool() {
        let manager = seeded_manager();
        manager.set_rotation_strategy(RotationStrategyKind::LeastRecentlyUsed);
        assert_eq!(manager.rotation_strategy_kind(), RotationStrategyKind::LeastRecentlyUsed);
        assert!(manager.get_next_proxy(SelectionOptions::default()).is_ok());
    }

    #[test]
    fn repeated_failures_demote_to_candidates() {
        let manager = seeded_manager();
        let proxy = Proxy::new("1.1.1.1", 80, ProxyProtocol::Http);
        for _ in 0..5 {
            manager.record_failure(&proxy);
        }
        assert_eq!(manager.validated_count(), 2);
        assert_eq!(manager.candidate_count(), 1);
        assert!(manager.candidates().contains(&proxy));

        // The demoted proxy is out of strategy rotation.
        for _ in 0..10 {
            assert_ne!(manager.get_next_proxy(SelectionOptions::default()).unwrap(), proxy);
        }
    }

    #[test]
    fn unvalidated_selection_draws_from_whole_pool() {
        let manager = ProxyPoolManager::new(PoolConfig::default()).unwrap();
        manager.add_proxies(vec![Proxy::new("9.9.9.9", 80, ProxyProtocol::Http)], false);
        assert!(matches!(
            manager.get_next_proxy(SelectionOptions::default()),
            Err(PoolError::NoValidProxies)
        ));
        let picked = manager
            .get_next_proxy(SelectionOptions { validated: false, use_scoring: false })
            .unwrap();
        assert_eq!(picked.ip, "9.9.9.9");
    }

    #[test]
    fn explicit_invalidation_demotes_without_touching_score() {
        let manager = seeded_manager();
        let proxy = Proxy::new("3.3.3.3", 80, ProxyProtocol::Http);
        manager.record_success(&proxy, 90);

        manager.invalidate_proxy(&proxy);
        assert_eq!(manager.validated_count(), 2);
        assert!(manager.candidates().contains(&proxy));
        assert_eq!(manager.score_of(&proxy).unwrap().successful_requests, 1);

        // Idempotent: a second invalidation is a no-op.
        manager.invalidate_proxy(&proxy);
        assert_eq!(manager.candidate_count(), 1);
    }

    #[test]
    fn remove_proxy_also_drops_sessions_and_score() {
        let manager = seeded_manager();
        let proxy = Proxy::new("2.2.2.2", 80, ProxyProtocol::Http);
        manager.record_success(&proxy, 120);
        manager.create_session(&proxy, "example.com");
        assert_eq!(manager.sessions().active_session_count(), 1);

        manager.remove_proxy(&proxy);
        assert_eq!(manager.validated_count(), 2);
        assert!(manager.score_of(&proxy).is_none());
        assert_eq!(manager.sessions().active_session_count(), 0);
    }
}
