//! Rotation strategies.
//!
//! A strategy owns its view of the active pool plus any strategy-local
//! state (cursors, usage counters, Q-values); observed quality lives in the
//! shared [`ScoreBook`]. Every selection stamps `last_used_ms`. An empty
//! pool yields `None`, never an error.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::proxy::Proxy;
use crate::scoring::ScoreBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategyKind {
    RoundRobin,
    Random,
    Weighted,
    Advanced,
    GeoBased,
    Adaptive,
    LeastRecentlyUsed,
}

impl fmt::Display for RotationStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationStrategyKind::RoundRobin => "round_robin",
            RotationStrategyKind::Random => "random",
            RotationStrategyKind::Weighted => "weighted",
            RotationStrategyKind::Advanced => "advanced",
            RotationStrategyKind::GeoBased => "geo_based",
            RotationStrategyKind::Adaptive => "adaptive",
            RotationStrategyKind::LeastRecentlyUsed => "least_recently_used",
        };
        f.write_str(name)
    }
}

/// Fixed method set every strategy satisfies.
pub trait RotationStrategy: Send + Sync {
    fn kind(&self) -> RotationStrategyKind;

    /// Replaces the strategy's view of the active pool.
    fn update_proxies(&mut self, proxies: Vec<Proxy>);

    /// Picks the next proxy and stamps its `last_used_ms`; `None` iff the
    /// pool is empty.
    fn get_next(&mut self) -> Option<Proxy>;

    fn record_success(&mut self, proxy: &Proxy);

    fn record_failure(&mut self, proxy: &Proxy);

    /// Random strategy only: toggles composite-weighted sampling.
    fn set_use_scoring(&mut self, _on: bool) {}
}

/// Builds a boxed strategy over the shared score registry.
pub fn build_strategy(kind: RotationStrategyKind, scores: ScoreBook) -> Box<dyn RotationStrategy> {
    match kind {
        RotationStrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new(scores)),
        RotationStrategyKind::Random => Box::new(RandomStrategy::new(scores)),
        RotationStrategyKind::Weighted => Box::new(WeightedStrategy::new(scores)),
        RotationStrategyKind::Advanced => Box::new(AdvancedStrategy::new(scores)),
        RotationStrategyKind::GeoBased => Box::new(GeoBasedStrategy::new(scores)),
        RotationStrategyKind::Adaptive => Box::new(AdaptiveStrategy::new(scores)),
        RotationStrategyKind::LeastRecentlyUsed => Box::new(LruStrategy::new(scores)),
    }
}

// ---------------------------------------------------------------------------
// Round robin
// ---------------------------------------------------------------------------

pub struct RoundRobinStrategy {
    proxies: Vec<Proxy>,
    cursor: usize,
    scores: ScoreBook,
}

impl RoundRobinStrategy {
    pub fn new(scores: ScoreBook) -> Self {
        Self { proxies: Vec::new(), cursor: 0, scores }
    }
}

impl RotationStrategy for RoundRobinStrategy {
    fn kind(&self) -> RotationStrategyKind {
        RotationStrategyKind::RoundRobin
    }

    fn update_proxies(&mut self, proxies: Vec<Proxy>) {
        self.proxies = proxies;
        if self.proxies.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.proxies.len();
        }
    }

    fn get_next(&mut self) -> Option<Proxy> {
        if self.proxies.is_empty() {
            return None;
        }
        let proxy = self.proxies[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.proxies.len();
        self.scores.touch(&proxy.key());
        Some(proxy)
    }

    fn record_success(&mut self, _proxy: &Proxy) {}

    fn record_failure(&mut self, _proxy: &Proxy) {}
}

// ---------------------------------------------------------------------------
// Random (optionally score-weighted)
// ---------------------------------------------------------------------------

pub struct RandomStrategy {
    proxies: Vec<Proxy>,
    scores: ScoreBook,
    use_scoring: bool,
}

impl RandomStrategy {
    pub fn new(scores: ScoreBook) -> Self {
        Self { proxies: Vec::new(), scores, use_scoring: false }
    }
}

impl RotationStrategy for RandomStrategy {
    fn kind(&self) -> RotationStrategyKind {
        RotationStrategyKind::Random
    }

    fn update_proxies(&mut self, proxies: Vec<Proxy>) {
        self.proxies = proxies;
    }

    fn get_next(&mut self) -> Option<Proxy> {
        if self.proxies.is_empty() {
            return None;
        }
        let proxy = if self.use_scoring {
            sample_weighted(&self.proxies, &self.scores)
        } else {
            let index = rand::thread_rng().gen_range(0..self.proxies.len());
            self.proxies[index].clone()
        };
        self.scores.touch(&proxy.key());
        Some(proxy)
    }

    fn record_success(&mut self, _proxy: &Proxy) {}

    fn record_failure(&mut self, _proxy: &Proxy) {}

    fn set_use_scoring(&mut self, on: bool) {
        self.use_scoring = on;
    }
}

// ---------------------------------------------------------------------------
// Weighted
// ---------------------------------------------------------------------------

pub struct WeightedStrategy {
    proxies: Vec<Proxy>,
    scores: ScoreBook,
}

impl WeightedStrategy {
    pub fn new(scores: ScoreBook) -> Self {
        Self { proxies: Vec::new(), scores }
    }
}

impl RotationStrategy for WeightedStrategy {
    fn kind(&self) -> RotationStrategyKind {
        RotationStrategyKind::Weighted
    }

    fn update_proxies(&mut self, proxies: Vec<Proxy>) {
        self.proxies = proxies;
    }

    fn get_next(&mut self) -> Option<Proxy> {
        if self.proxies.is_empty() {
            return None;
        }
        let proxy = sample_weighted(&self.proxies, &self.scores);
        self.scores.touch(&proxy.key());
        Some(proxy)
    }

    fn record_success(&mut self, _proxy: &Proxy) {}

    fn record_failure(&mut self, _proxy: &Proxy) {}
}

/// Categorical sample proportional to composite score; a degenerate total
/// weight falls back to least-recently-used order.
fn sample_weighted(proxies: &[Proxy], scores: &ScoreBook) -> Proxy {
    let weights: Vec<f64> = proxies.iter().map(|p| scores.composite(&p.key()).max(0.0)).collect();
    let total: f64 = weights.iter().sum();
    if total <= f64::EPSILON {
        return proxies
            .iter()
            .min_by_key(|p| scores.last_used_ms(&p.key()))
            .cloned()
            .expect("non-empty pool");
    }
    let mut roll = rand::thread_rng().gen_range(0.0..total);
    for (proxy, weight) in proxies.iter().zip(&weights) {
        if roll < *weight {
            return proxy.clone();
        }
        roll -= weight;
    }
    proxies[proxies.len() - 1].clone()
}

// ---------------------------------------------------------------------------
// Advanced (LRU-weighted argmax)
// ---------------------------------------------------------------------------

const ADVANCED_USAGE_DECAY: f64 = 0.9;
const ADVANCED_USAGE_WEIGHT: f64 = 0.2;
const ADVANCED_FAILURE_WEIGHT: f64 = 0.3;

pub struct AdvancedStrategy {
    proxies: Vec<Proxy>,
    scores: ScoreBook,
    usage: HashMap<String, f64>,
}

impl AdvancedStrategy {
    pub fn new(scores: ScoreBook) -> Self {
        Self { proxies: Vec::new(), scores, usage: HashMap::new() }
    }
}

impl RotationStrategy for AdvancedStrategy {
    fn kind(&self) -> RotationStrategyKind {
        RotationStrategyKind::Advanced
    }

    fn update_proxies(&mut self, proxies: Vec<Proxy>) {
        self.usage.retain(|key, _| proxies.iter().any(|p| p.key() == *key));
        self.proxies = proxies;
    }

    fn get_next(&mut self) -> Option<Proxy> {
        if self.proxies.is_empty() {
            return None;
        }
        for counter in self.usage.values_mut() {
            *counter *= ADVANCED_USAGE_DECAY;
        }
        let max_usage = self.usage.values().cloned().fold(1.0_f64, f64::max);

        let mut best: Option<(&Proxy, f64)> = None;
        for proxy in &self.proxies {
            let key = proxy.key();
            let usage = self.usage.get(&key).copied().unwrap_or(0.0) / max_usage;
            let failures = self.scores.consecutive_failures(&key) as f64;
            let penalty = (failures / 5.0).min(1.0);
            let score = self.scores.composite(&key)
                - ADVANCED_USAGE_WEIGHT * usage
                - ADVANCED_FAILURE_WEIGHT * penalty;
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((proxy, score));
            }
        }

        let proxy = best.map(|(p, _)| p.clone())?;
        *self.usage.entry(proxy.key()).or_insert(0.0) += 1.0;
        self.scores.touch(&proxy.key());
        Some(proxy)
    }

    fn record_success(&mut self, _proxy: &Proxy) {}

    fn record_failure(&mut self, _proxy: &Proxy) {}
}

// ---------------------------------------------------------------------------
// Geo-based
// ---------------------------------------------------------------------------

pub struct GeoBasedStrategy {
    scores: ScoreBook,
    /// Country buckets in first-appearance order; `None` collects proxies
    /// without a country code.
    buckets: Vec<(Option<String>, Vec<Proxy>)>,
    country_cursor: usize,
    inner_cursors: HashMap<Option<String>, usize>,
}

impl GeoBasedStrategy {
    pub fn new(scores: ScoreBook) -> Self {
        Self {
            scores,
            buckets: Vec::new(),
            country_cursor: 0,
            inner_cursors: HashMap::new(),
        }
    }
}

impl RotationStrategy for GeoBasedStrategy {
    fn kind(&self) -> RotationStrategyKind {
        RotationStrategyKind::GeoBased
    }

    fn update_proxies(&mut self, proxies: Vec<Proxy>) {
        self.buckets.clear();
        for proxy in proxies {
            let country = proxy.country_code.clone();
            match self.buckets.iter_mut().find(|(c, _)| *c == country) {
                Some((_, bucket)) => bucket.push(proxy),
                None => self.buckets.push((country, vec![proxy])),
            }
        }
        self.inner_cursors.retain(|country, _| self.buckets.iter().any(|(c, _)| c == country));
        if self.buckets.is_empty() {
            self.country_cursor = 0;
        } else {
            self.country_cursor %= self.buckets.len();
        }
    }

    fn get_next(&mut self) -> Option<Proxy> {
        if self.buckets.is_empty() {
            return None;
        }
        let (country, bucket) = &self.buckets[self.country_cursor];
        self.country_cursor = (self.country_cursor + 1) % self.buckets.len();

        let cursor = self.inner_cursors.entry(country.clone()).or_insert(0);
        let proxy = bucket[*cursor % bucket.len()].clone();
        *cursor = (*cursor + 1) % bucket.len();

        self.scores.touch(&proxy.key());
        Some(proxy)
    }

    fn record_success(&mut self, _proxy: &Proxy) {}

    fn record_failure(&mut self, _proxy: &Proxy) {}
}

// ---------------------------------------------------------------------------
// Adaptive (epsilon-greedy)
// ---------------------------------------------------------------------------

const ADAPTIVE_EPSILON: f64 = 0.1;
const ADAPTIVE_LEARNING_RATE: f64 = 0.1;

pub struct AdaptiveStrategy {
    proxies: Vec<Proxy>,
    scores: ScoreBook,
    q_values: HashMap<String, f64>,
}

impl AdaptiveStrategy {
    pub fn new(scores: ScoreBook) -> Self {
        Self { proxies: Vec::new(), scores, q_values: HashMap::new() }
    }

    fn learn(&mut self, proxy: &Proxy, reward: f64) {
        let q = self.q_values.entry(proxy.key()).or_insert(0.0);
        *q += ADAPTIVE_LEARNING_RATE * (reward - *q);
    }

    pub fn q_value(&self, proxy: &Proxy) -> f64 {
        self.q_values.get(&proxy.key()).copied().unwrap_or(0.0)
    }
}

impl RotationStrategy for AdaptiveStrategy {
    fn kind(&self) -> RotationStrategyKind {
        RotationStrategyKind::Adaptive
    }

    fn update_proxies(&mut self, proxies: Vec<Proxy>) {
        self.q_values.retain(|key, _| proxies.iter().any(|p| p.key() == *key));
        self.proxies = proxies;
    }

    fn get_next(&mut self) -> Option<Proxy> {
        if self.proxies.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        let proxy = if rng.gen::<f64>() < ADAPTIVE_EPSILON {
            self.proxies[rng.gen_range(0..self.proxies.len())].clone()
        } else {
            self.proxies
                .iter()
                .max_by(|a, b| {
                    self.q_value(a)
                        .partial_cmp(&self.q_value(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned()
                .expect("non-empty pool")
        };
        self.scores.touch(&proxy.key());
        Some(proxy)
    }

    fn record_success(&mut self, proxy: &Proxy) {
        self.learn(proxy, 1.0);
    }

    fn record_failure(&mut self, proxy: &Proxy) {
        self.learn(proxy, -1.0);
    }
}

// ---------------------------------------------------------------------------
// Least recently used
// ---------------------------------------------------------------------------

pub struct LruStrategy {
    proxies: Vec<Proxy>,
    scores: ScoreBook,
}

impl LruStrategy {
    pub fn new(scores: ScoreBook) -> Self {
        Self { proxies: Vec::new(), scores }
    }
}

impl RotationStrategy for LruStrategy {
    fn kind(&self) -> RotationStrategyKind {
        RotationStrategyKind::LeastRecentlyUsed
    }

    fn update_proxies(&mut self, proxies: Vec<Proxy>) {
        self.proxies = proxies;
    }

    fn get_next(&mut self) -> Option<Proxy> {
        let proxy = self
            .proxies
            .iter()
            .min_by_key(|p| self.scores.last_used_ms(&p.key()))
            .cloned()?;
        self.scores.touch(&proxy.key());
        Some(proxy)
    }

    fn record_success(&mut self, _proxy: &Proxy) {}

    fn record_failure(&mut self, _proxy: &Proxy) {}
}
