//! Tests for the pool manager facade
//!
//! This module tests:
//! - Aggregate fetch with filters over host-supplied sources
//! - Validated fetch end to end against in-process mock proxies
//! - Selection invariants and cancellation
//! - Warm start / persist through the KV store
//! - The debugger's staged recovery

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use proxy_pool::sources::ProxySource;
use proxy_pool::{
    CancelToken, FetchOptions, MemoryStore, PoolConfig, PoolDebugger, PoolError, Proxy,
    ProxyPoolManager, ProxyProtocol, SelectionOptions,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// ============================================================================
// Fixtures
// ============================================================================

/// Source serving a fixed list; `fail` makes it error instead.
struct StaticSource {
    name: String,
    proxies: Vec<Proxy>,
    fail: bool,
    last_updated: Mutex<Option<DateTime<Utc>>>,
}

impl StaticSource {
    fn new(name: &str, proxies: Vec<Proxy>) -> Arc<dyn ProxySource> {
        Arc::new(Self {
            name: name.to_string(),
            proxies,
            fail: false,
            last_updated: Mutex::new(None),
        })
    }

    fn failing(name: &str) -> Arc<dyn ProxySource> {
        Arc::new(Self {
            name: name.to_string(),
            proxies: Vec::new(),
            fail: true,
            last_updated: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ProxySource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        *self.last_updated.lock()
    }

    fn touch(&self) {
        *self.last_updated.lock() = Some(Utc::now());
    }

    async fn fetch(&self) -> AnyResult<Vec<Proxy>> {
        if self.fail {
            anyhow::bail!("upstream unavailable");
        }
        self.touch();
        Ok(self.proxies.clone())
    }
}

fn manager_over(sources: Vec<Arc<dyn ProxySource>>, config: PoolConfig) -> ProxyPoolManager {
    ProxyPoolManager::with_sources(config, Arc::new(MemoryStore::new()), sources)
}

/// Mock HTTP proxy answering every CONNECT with 200.
async fn spawn_good_proxy() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let mut collected = Vec::new();
                while !collected.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => collected.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await;
            });
        }
    });
    port
}

/// Port with nothing listening behind it.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn fast_config() -> PoolConfig {
    PoolConfig {
        test_url: "https://127.0.0.1/".to_string(),
        validation_timeout_secs: 2,
        source_timeout_secs: 2,
        ..PoolConfig::default()
    }
}

// ============================================================================
// Aggregate fetch and filters
// ============================================================================

#[tokio::test]
async fn fetch_applies_filters_and_dedupes() {
    let us_https = Proxy::new("1.1.1.1", 443, ProxyProtocol::Https).with_country("US");
    let ca_http = Proxy::new("2.2.2.2", 80, ProxyProtocol::Http).with_country("CA");
    let us_socks = Proxy::new("3.3.3.3", 1080, ProxyProtocol::Socks5).with_country("US");

    let manager = manager_over(
        vec![
            StaticSource::new("a", vec![us_https.clone(), ca_http.clone()]),
            // Second source repeats one entry and adds the SOCKS5 one.
            StaticSource::new("b", vec![us_https.clone(), us_socks.clone()]),
        ],
        fast_config(),
    );

    let options = FetchOptions::default().with_count(10).https_only().in_countries(["US"]);
    let fetched = manager.fetch_proxies(&options).await.unwrap();

    assert_eq!(fetched.len(), 2);
    assert!(fetched.contains(&us_https));
    assert!(fetched.contains(&us_socks));
    assert!(!fetched.contains(&ca_http));
}

#[tokio::test]
async fn all_sources_failing_is_a_fetch_error() {
    let manager = manager_over(
        vec![StaticSource::failing("x"), StaticSource::failing("y")],
        fast_config(),
    );
    let result = manager.fetch_proxies(&FetchOptions::default()).await;
    assert!(matches!(result, Err(PoolError::Fetch(_))));
    assert_eq!(manager.analytics_snapshot().errors, 1);
}

#[tokio::test]
async fn one_failing_source_is_swallowed() {
    let good = Proxy::new("1.1.1.1", 80, ProxyProtocol::Http);
    let manager = manager_over(
        vec![
            StaticSource::failing("broken"),
            StaticSource::new("ok", vec![good.clone()]),
        ],
        fast_config(),
    );
    let fetched = manager.fetch_proxies(&FetchOptions::default()).await.unwrap();
    assert_eq!(fetched, vec![good]);
}

// ============================================================================
// Validated fetch
// ============================================================================

#[tokio::test]
async fn validated_fetch_promotes_survivors_in_order() {
    let good_port = spawn_good_proxy().await;
    let other_good_port = spawn_good_proxy().await;
    let dead = dead_port().await;

    let proxies = vec![
        Proxy::new("127.0.0.1", good_port, ProxyProtocol::Http),
        Proxy::new("127.0.0.1", dead, ProxyProtocol::Http),
        Proxy::new("127.0.0.1", other_good_port, ProxyProtocol::Http),
    ];
    let manager = manager_over(vec![StaticSource::new("local", proxies.clone())], fast_config());

    let mut progress: Vec<(usize, usize)> = Vec::new();
    let mut on_progress = |completed: usize, total: usize| progress.push((completed, total));
    let survivors = manager
        .fetch_validated_proxies(&FetchOptions::default().with_count(10), Some(&mut on_progress), None)
        .await
        .unwrap();

    // Survivors keep candidate order; the dead endpoint is dropped.
    assert_eq!(survivors, vec![proxies[0].clone(), proxies[2].clone()]);
    assert_eq!(manager.validated_count(), 2);
    assert_eq!(manager.candidate_count(), 1);

    // Progress covered every probed candidate.
    assert_eq!(progress.last().copied(), Some((3, 3)));
    assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));

    // Invariant: whatever selection returns was validated first.
    for _ in 0..6 {
        let picked = manager.get_next_proxy(SelectionOptions::default()).unwrap();
        assert!(survivors.contains(&picked));
    }

    // Outcomes fed the score book.
    let score = manager.score_of(&proxies[0]).unwrap();
    assert_eq!(score.successful_requests, 1);
    let dead_score = manager.score_of(&proxies[1]).unwrap();
    assert_eq!(dead_score.failed_requests, 1);
}

#[tokio::test]
async fn validated_fetch_truncates_to_requested_count() {
    let mut proxies = Vec::new();
    for _ in 0..4 {
        let port = spawn_good_proxy().await;
        proxies.push(Proxy::new("127.0.0.1", port, ProxyProtocol::Http));
    }
    let manager = manager_over(vec![StaticSource::new("local", proxies)], fast_config());

    let survivors = manager
        .fetch_validated_proxies(&FetchOptions::default().with_count(2), None, None)
        .await
        .unwrap();
    assert_eq!(survivors.len(), 2);
    assert_eq!(manager.validated_count(), 2);
}

#[tokio::test]
async fn cancelled_validation_surfaces_cancelled() {
    // Listener that accepts and never answers, so probes sit at the
    // deadline until the cancel lands. Bound to 0.0.0.0 so every loopback
    // alias below reaches it.
    let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            held.push(stream);
        }
    });

    // Distinct loopback aliases give the silent listener four identities.
    let proxies: Vec<Proxy> = (1..=4)
        .map(|i| Proxy::new(format!("127.0.0.{}", i), port, ProxyProtocol::Http))
        .collect();

    let manager = manager_over(vec![StaticSource::new("slow", proxies)], fast_config());

    let token = CancelToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let result = manager
        .fetch_validated_proxies(&FetchOptions::default(), None, Some(&token))
        .await;
    assert!(matches!(result, Err(PoolError::Cancelled)));
    assert_eq!(manager.validated_count(), 0, "partial results are discarded");
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn persist_and_warm_start_round_trip() {
    let kv = Arc::new(MemoryStore::new());
    let candidate = Proxy::new("1.1.1.1", 80, ProxyProtocol::Http);
    let validated = Proxy::new("2.2.2.2", 443, ProxyProtocol::Https).with_country("US");

    {
        let manager = ProxyPoolManager::with_sources(fast_config(), kv.clone(), Vec::new());
        manager.add_proxies(vec![candidate.clone()], false);
        manager.add_proxies(vec![validated.clone()], true);
        manager.persist().await.unwrap();
    }

    let manager = ProxyPoolManager::with_sources(fast_config(), kv, Vec::new());
    let (candidates_added, validated_added) = manager.warm_start().await.unwrap();
    assert_eq!(candidates_added, 1);
    assert_eq!(validated_added, 1);
    assert_eq!(manager.candidates(), vec![candidate]);
    assert_eq!(manager.validated(), vec![validated.clone()]);

    // The warm-started pool feeds the strategy directly.
    assert_eq!(manager.get_next_proxy(SelectionOptions::default()).unwrap(), validated);
}

// ============================================================================
// Sessions through the facade
// ============================================================================

#[tokio::test]
async fn facade_sessions_carry_headers_and_analytics() {
    let manager = ProxyPoolManager::with_sources(fast_config(), Arc::new(MemoryStore::new()), Vec::new());
    let proxy = Proxy::new("1.1.1.1", 80, ProxyProtocol::Http);

    let mut cookies = HashMap::new();
    cookies.insert("sid".to_string(), "abc".to_string());
    let session = manager.create_session_with(&proxy, "example.com", None, Some(cookies), None);

    let headers = manager.session_headers(&session.id).unwrap();
    assert_eq!(headers.get("Cookie").map(String::as_str), Some("sid=abc"));
    assert!(headers.contains_key("User-Agent"));

    assert_eq!(manager.analytics_snapshot().sessions_created, 1);
    manager.invalidate_session(&session.id);
    assert!(manager.session_headers(&session.id).is_none());
}

// ============================================================================
// Debugger
// ============================================================================

#[tokio::test]
async fn diagnostics_report_reflects_a_broken_engine() {
    let manager = manager_over(vec![StaticSource::failing("down")], fast_config());
    let report = PoolDebugger::new(&manager).run_diagnostics().await;

    assert!(!report.healthy());
    assert_eq!(report.sources.len(), 1);
    assert!(report.sources[0].error.is_some());
    assert!(report.fetch_validated_error.is_some());
    assert!(report.selection_error.is_some());
    assert_eq!(report.validated_count, 0);
}

#[tokio::test]
async fn attempt_fix_falls_back_to_unvalidated_candidates() {
    let unreachable = Proxy::new("127.0.0.1", dead_port().await, ProxyProtocol::Http);
    let manager = manager_over(
        vec![StaticSource::new("flaky", vec![unreachable.clone()])],
        fast_config(),
    );

    let fix = PoolDebugger::new(&manager).attempt_fix().await;
    assert!(fix.recovered, "unvalidated fallback should hand out the candidate");
    assert_eq!(fix.proxy, Some(unreachable));
    let last = fix.steps.last().unwrap();
    assert_eq!(last.action, "unvalidated_fallback");
    assert!(last.succeeded);
    assert!(fix.steps.iter().any(|s| s.action == "relaxed_fetch" && s.succeeded));
}

#[tokio::test]
async fn attempt_fix_prefers_validated_selection() {
    let port = spawn_good_proxy().await;
    let good = Proxy::new("127.0.0.1", port, ProxyProtocol::Http);
    let manager = manager_over(vec![StaticSource::new("local", vec![good.clone()])], fast_config());

    let fix = PoolDebugger::new(&manager).attempt_fix().await;
    assert!(fix.recovered);
    assert_eq!(fix.proxy, Some(good));
    assert!(fix
        .steps
        .iter()
        .any(|s| s.action == "validated_selection" && s.succeeded));
}
