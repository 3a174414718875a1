//! Self-diagnosis and recovery.
//!
//! `run_diagnostics` walks the engine end to end and returns a structured
//! report; `attempt_fix` escalates through progressively relaxed retries,
//! recording every step, and falls back to an unvalidated pick as the last
//! resort.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::analytics::EventKind;
use crate::error::Result;
use crate::manager::{ProxyPoolManager, SelectionOptions};
use crate::proxy::Proxy;
use crate::sources::FetchOptions;

const SAMPLE_PROBES: usize = 5;
const DIAGNOSTIC_FETCH_COUNT: usize = 10;
const RELAXED_FETCH_COUNT: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub proxies: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleProbe {
    pub proxy: String,
    pub valid: bool,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub at: DateTime<Utc>,
    pub candidate_count: usize,
    pub validated_count: usize,
    pub active_sessions: usize,
    pub sources: Vec<SourceReport>,
    pub samples: Vec<SampleProbe>,
    pub fetch_validated_result: Option<usize>,
    pub fetch_validated_error: Option<String>,
    pub selection: Option<String>,
    pub selection_error: Option<String>,
}

impl DiagnosticsReport {
    /// A healthy engine can fetch, validate and select.
    pub fn healthy(&self) -> bool {
        self.fetch_validated_error.is_none() && self.selection_error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FixStep {
    pub action: String,
    pub succeeded: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixReport {
    pub steps: Vec<FixStep>,
    pub recovered: bool,
    pub proxy: Option<Proxy>,
}

pub struct PoolDebugger<'a> {
    manager: &'a ProxyPoolManager,
}

impl<'a> PoolDebugger<'a> {
    pub fn new(manager: &'a ProxyPoolManager) -> Self {
        Self { manager }
    }

    pub async fn run_diagnostics(&self) -> DiagnosticsReport {
        info!("running pool diagnostics");
        let manager = self.manager;

        let mut sources = Vec::new();
        for source in manager.registry().sources() {
            let started = Instant::now();
            let fetched =
                tokio::time::timeout(manager.config().source_timeout(), source.fetch()).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let (proxies, error) = match fetched {
                Ok(Ok(list)) => (list.len(), None),
                Ok(Err(e)) => (0, Some(e.to_string())),
                Err(_) => (0, Some("timed out".to_string())),
            };
            sources.push(SourceReport {
                name: source.name().to_string(),
                proxies,
                elapsed_ms,
                error,
            });
        }

        let mut samples = Vec::new();
        for proxy in manager.validated().into_iter().take(SAMPLE_PROBES) {
            match manager.validate_specific_proxy(&proxy, None, false).await {
                Ok(outcome) => samples.push(SampleProbe {
                    proxy: proxy.key(),
                    valid: outcome.valid,
                    response_time_ms: outcome.response_time_ms,
                }),
                Err(e) => samples.push(SampleProbe {
                    proxy: format!("{} ({})", proxy.key(), e),
                    valid: false,
                    response_time_ms: 0,
                }),
            }
        }

        let options = FetchOptions::default().with_count(DIAGNOSTIC_FETCH_COUNT);
        let (fetch_validated_result, fetch_validated_error) =
            match manager.fetch_validated_proxies(&options, None, None).await {
                Ok(list) => (Some(list.len()), None),
                Err(e) => (None, Some(e.to_string())),
            };

        let (selection, selection_error) = match manager.get_next_proxy(SelectionOptions::default()) {
            Ok(proxy) => (Some(proxy.key()), None),
            Err(e) => (None, Some(e.to_string())),
        };

        DiagnosticsReport {
            at: Utc::now(),
            candidate_count: manager.candidate_count(),
            validated_count: manager.validated_count(),
            active_sessions: manager.sessions().active_session_count(),
            sources,
            samples,
            fetch_validated_result,
            fetch_validated_error,
            selection,
            selection_error,
        }
    }

    /// Escalating recovery: relaxed fetch, patient re-validation of a
    /// candidate slice, strategy selection, and finally an unvalidated
    /// pick.
    pub async fn attempt_fix(&self) -> FixReport {
        let manager = self.manager;
        let mut steps = Vec::new();

        // Step 1: refill candidates with every filter dropped.
        let relaxed = FetchOptions::default().with_count(RELAXED_FETCH_COUNT);
        let fetched = manager.fetch_proxies(&relaxed).await;
        steps.push(match &fetched {
            Ok(list) => FixStep {
                action: "relaxed_fetch".to_string(),
                succeeded: !list.is_empty(),
                detail: format!("{} candidates", list.len()),
            },
            Err(e) => FixStep {
                action: "relaxed_fetch".to_string(),
                succeeded: false,
                detail: e.to_string(),
            },
        });

        // Step 2: revalidate a slice of candidates with double the deadline.
        let patient_timeout = manager.config().validation_timeout() * 2;
        let mut promoted = 0usize;
        for proxy in manager.candidates().into_iter().take(DIAGNOSTIC_FETCH_COUNT) {
            if let Ok(outcome) = manager
                .validate_specific_proxy(&proxy, Some(patient_timeout), true)
                .await
            {
                if outcome.valid {
                    manager.add_proxies(vec![proxy], true);
                    promoted += 1;
                }
            }
        }
        steps.push(FixStep {
            action: "patient_revalidation".to_string(),
            succeeded: promoted > 0,
            detail: format!("{} candidates promoted", promoted),
        });

        // Step 3: strategy selection over whatever is validated now.
        if let Ok(proxy) = manager.get_next_proxy(SelectionOptions::default()) {
            steps.push(FixStep {
                action: "validated_selection".to_string(),
                succeeded: true,
                detail: proxy.key(),
            });
            manager.analytics().record(EventKind::Error, "debugger recovered via validated selection");
            return FixReport { steps, recovered: true, proxy: Some(proxy) };
        }
        steps.push(FixStep {
            action: "validated_selection".to_string(),
            succeeded: false,
            detail: "pool still empty".to_string(),
        });

        // Last resort: hand out an unvalidated candidate.
        let fallback: Result<Proxy> =
            manager.get_next_proxy(SelectionOptions { validated: false, use_scoring: false });
        match fallback {
            Ok(proxy) => {
                steps.push(FixStep {
                    action: "unvalidated_fallback".to_string(),
                    succeeded: true,
                    detail: proxy.key(),
                });
                manager
                    .analytics()
                    .record(EventKind::Error, "debugger fell back to unvalidated selection");
                FixReport { steps, recovered: true, proxy: Some(proxy) }
            }
            Err(e) => {
                steps.push(FixStep {
                    action: "unvalidated_fallback".to_string(),
                    succeeded: false,
                    detail: e.to_string(),
                });
                FixReport { steps, recovered: false, proxy: None }
            }
        }
    }
}
