//! Sticky per-(proxy, domain) sessions.
//!
//! One owning map keyed by session id; the endpoint and domain indexes hold
//! ids only, never second owners. Expired sessions are swept lazily at the
//! top of every public call, so no background task is needed.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::proxy::Proxy;

const SESSION_ID_LEN: usize = 16;
const SESSION_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Browser user agents synthesized onto sessions created without one.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36 Edg/119.0.2151.97",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

/// Default headers a session merge starts from; session headers win.
const DEFAULT_HEADERS: &[(&str, &str)] = &[
    ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Accept-Encoding", "gzip, deflate, br"),
];

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub proxy: Proxy,
    pub domain: String,
    pub user_agent: String,
    pub cookies: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub request_count: u64,
    pub active: bool,
}

impl Session {
    /// Header merge: defaults, then session headers, then `User-Agent`,
    /// then a `Cookie` header when any cookies are set.
    pub fn request_headers(&self) -> HashMap<String, String> {
        let mut merged: HashMap<String, String> = DEFAULT_HEADERS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (k, v) in &self.headers {
            merged.insert(k.clone(), v.clone());
        }
        merged.insert("User-Agent".to_string(), self.user_agent.clone());
        if !self.cookies.is_empty() {
            let mut pairs: Vec<(&String, &String)> = self.cookies.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let cookie = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            merged.insert("Cookie".to_string(), cookie);
        }
        merged
    }
}

#[derive(Default)]
struct SessionIndexes {
    /// Owning map.
    by_id: HashMap<String, Session>,
    /// `ip:port` → session ids.
    by_endpoint: HashMap<String, HashSet<String>>,
    /// domain → proxy key → session id.
    by_domain: HashMap<String, HashMap<String, String>>,
}

impl SessionIndexes {
    fn insert(&mut self, session: Session) {
        self.by_endpoint
            .entry(session.proxy.endpoint())
            .or_default()
            .insert(session.id.clone());
        self.by_domain
            .entry(session.domain.clone())
            .or_default()
            .insert(session.proxy.key(), session.id.clone());
        self.by_id.insert(session.id.clone(), session);
    }

    fn remove(&mut self, id: &str) -> Option<Session> {
        let session = self.by_id.remove(id)?;
        let endpoint = session.proxy.endpoint();
        if let Some(ids) = self.by_endpoint.get_mut(&endpoint) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_endpoint.remove(&endpoint);
            }
        }
        if let Some(per_proxy) = self.by_domain.get_mut(&session.domain) {
            per_proxy.remove(&session.proxy.key());
            if per_proxy.is_empty() {
                self.by_domain.remove(&session.domain);
            }
        }
        Some(session)
    }
}

pub struct SessionManager {
    config: SessionConfig,
    inner: Mutex<SessionIndexes>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(SessionIndexes::default()),
        }
    }

    /// Fetches or creates the session for `(proxy, domain)`.
    ///
    /// Sweeps expired sessions first; reusing an existing session touches
    /// its access time. At the per-proxy cap the least recently used
    /// session on that endpoint is evicted to make room.
    pub fn create_session(
        &self,
        proxy: &Proxy,
        domain: &str,
        user_agent: Option<String>,
        cookies: Option<HashMap<String, String>>,
        headers: Option<HashMap<String, String>>,
    ) -> Session {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);

        if let Some(id) = inner
            .by_domain
            .get(domain)
            .and_then(|per_proxy| per_proxy.get(&proxy.key()))
            .cloned()
        {
            if let Some(session) = inner.by_id.get_mut(&id) {
                session.last_access = Utc::now();
                return session.clone();
            }
        }

        let endpoint = proxy.endpoint();
        let at_capacity = inner
            .by_endpoint
            .get(&endpoint)
            .map(|ids| ids.len() >= self.config.max_sessions_per_proxy)
            .unwrap_or(false);
        if at_capacity {
            let oldest = inner
                .by_endpoint
                .get(&endpoint)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.by_id.get(id))
                .min_by_key(|s| s.last_access)
                .map(|s| s.id.clone());
            if let Some(id) = oldest {
                debug!("evicting session {} from {}", id, endpoint);
                inner.remove(&id);
            }
        }

        let id = Self::unique_session_id(&inner);
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            proxy: proxy.clone(),
            domain: domain.to_string(),
            user_agent: user_agent.unwrap_or_else(synthesize_user_agent),
            cookies: cookies.unwrap_or_default(),
            headers: headers.unwrap_or_default(),
            created_at: now,
            last_access: now,
            request_count: 0,
            active: true,
        };
        inner.insert(session.clone());
        info!("created session {} for {} on {}", id, proxy.key(), domain);
        session
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        inner.by_id.get(id).cloned()
    }

    /// Finds the active session for `(proxy, domain)` without creating one.
    pub fn find_session(&self, proxy: &Proxy, domain: &str) -> Option<Session> {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        let id = inner.by_domain.get(domain)?.get(&proxy.key())?.clone();
        inner.by_id.get(&id).cloned()
    }

    /// Marks one request issued on the session, bumping its access time.
    pub fn touch_session(&self, id: &str) -> Option<Session> {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        let session = inner.by_id.get_mut(id)?;
        session.last_access = Utc::now();
        session.request_count += 1;
        Some(session.clone())
    }

    pub fn set_cookie(&self, id: &str, name: impl Into<String>, value: impl Into<String>) -> bool {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        match inner.by_id.get_mut(id) {
            Some(session) => {
                session.cookies.insert(name.into(), value.into());
                session.last_access = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Idempotent removal by id.
    pub fn invalidate_session(&self, id: &str) {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        inner.remove(id);
    }

    /// Idempotent removal of every session on the proxy's endpoint.
    pub fn invalidate_proxy(&self, proxy: &Proxy) {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        let ids: Vec<String> = inner
            .by_endpoint
            .get(&proxy.endpoint())
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            inner.remove(&id);
        }
    }

    pub fn active_session_count(&self) -> usize {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        inner.by_id.len()
    }

    pub fn session_count_for(&self, proxy: &Proxy) -> usize {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        inner
            .by_endpoint
            .get(&proxy.endpoint())
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = SessionIndexes::default();
    }

    fn sweep(&self, inner: &mut SessionIndexes) {
        let now = Utc::now();
        let max_age_ms = self.config.max_session_age_secs as i64 * 1000;
        let max_idle_ms = self.config.max_session_idle_secs as i64 * 1000;
        let expired: Vec<String> = inner
            .by_id
            .values()
            .filter(|s| {
                (now - s.created_at).num_milliseconds() > max_age_ms
                    || (now - s.last_access).num_milliseconds() > max_idle_ms
            })
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        if !expired.is_empty() {
            info!("swept {} expired sessions", expired.len());
        }
    }

    fn unique_session_id(inner: &SessionIndexes) -> String {
        loop {
            let id = generate_session_id();
            if !inner.by_id.contains_key(&id) {
                return id;
            }
        }
    }
}

/// 16 chars over `[a-z0-9]`, drawn from the OS CSPRNG.
fn generate_session_id() -> String {
    let mut rng = rand::rngs::OsRng;
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect()
}

fn synthesize_user_agent() -> String {
    let mut rng = rand::thread_rng();
    USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())].to_string()
}
