//! Candidate discovery sources.
//!
//! Every source is best-effort: a failure to reach or parse an upstream
//! list yields an empty contribution and never fails the aggregate fetch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CustomSourceConfig, SourceSelection};
use crate::http_client::HttpClient;
use crate::proxy::{AnonymityLevel, Proxy, ProxyProtocol};

/// Upper bound on entries taken from a single source.
const PER_SOURCE_CAP: usize = 300;

/// Filter options applied to an aggregate fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchOptions {
    pub count: usize,
    pub only_https: bool,
    pub countries: Option<HashSet<String>>,
    pub regions: Option<HashSet<String>>,
    pub isps: Option<HashSet<String>>,
    pub min_speed_mbps: Option<f64>,
    pub require_websockets: bool,
    pub require_socks: bool,
    pub socks_version: Option<u8>,
    pub require_authentication: bool,
    pub require_anonymous: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            count: 20,
            only_https: false,
            countries: None,
            regions: None,
            isps: None,
            min_speed_mbps: None,
            require_websockets: false,
            require_socks: false,
            socks_version: None,
            require_authentication: false,
            require_anonymous: false,
        }
    }
}

impl FetchOptions {
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    pub fn https_only(mut self) -> Self {
        self.only_https = true;
        self
    }

    pub fn in_countries<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.countries = Some(codes.into_iter().map(|c| c.into().to_uppercase()).collect());
        self
    }

    pub fn socks_only(mut self, version: Option<u8>) -> Self {
        self.require_socks = true;
        self.socks_version = version;
        self
    }

    pub fn anonymous_only(mut self) -> Self {
        self.require_anonymous = true;
        self
    }

    pub fn matches(&self, proxy: &Proxy) -> bool {
        if self.only_https && !proxy.supports_https() {
            return false;
        }
        if let Some(countries) = &self.countries {
            match &proxy.country_code {
                Some(code) if countries.contains(code) => {}
                _ => return false,
            }
        }
        if let Some(regions) = &self.regions {
            match &proxy.region {
                Some(region) if regions.contains(region) => {}
                _ => return false,
            }
        }
        if let Some(isps) = &self.isps {
            match &proxy.isp {
                Some(isp) if isps.contains(isp) => {}
                _ => return false,
            }
        }
        if let Some(min) = self.min_speed_mbps {
            match proxy.speed_mbps {
                Some(speed) if speed >= min => {}
                _ => return false,
            }
        }
        if self.require_websockets && !proxy.supports_websockets {
            return false;
        }
        if self.require_socks && !proxy.protocol.is_socks() {
            return false;
        }
        if let Some(version) = self.socks_version {
            if proxy.effective_socks_version() != Some(version) {
                return false;
            }
        }
        if self.require_authentication && !(proxy.supports_auth || proxy.has_credentials()) {
            return false;
        }
        if self.require_anonymous {
            match proxy.anonymity_level {
                Some(level) if level.hides_client() => {}
                _ => return false,
            }
        }
        true
    }
}

/// Capability set every discovery source satisfies.
#[async_trait]
pub trait ProxySource: Send + Sync {
    fn name(&self) -> &str;
    fn last_updated(&self) -> Option<DateTime<Utc>>;
    fn touch(&self);
    async fn fetch(&self) -> Result<Vec<Proxy>>;
}

/// Shared bookkeeping embedded in each source.
struct SourceMeta {
    name: String,
    last_updated: Mutex<Option<DateTime<Utc>>>,
}

impl SourceMeta {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_updated: Mutex::new(None),
        }
    }

    fn touch(&self) {
        *self.last_updated.lock() = Some(Utc::now());
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        *self.last_updated.lock()
    }
}

// ---------------------------------------------------------------------------
// free-proxy-list.net
// ---------------------------------------------------------------------------

pub struct FreeProxyListSource {
    meta: SourceMeta,
    client: Arc<HttpClient>,
    url: String,
}

impl FreeProxyListSource {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            meta: SourceMeta::new("FreeProxyList"),
            client,
            url: "https://free-proxy-list.net/".to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl ProxySource for FreeProxyListSource {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta.last_updated()
    }

    fn touch(&self) {
        self.meta.touch();
    }

    async fn fetch(&self) -> Result<Vec<Proxy>> {
        let html = self.client.get_text(&self.url).await?;
        self.touch();

        let document = Html::parse_document(&html);
        let row_selector = selector("table tbody tr")?;
        let cell_selector = selector("td")?;

        let mut proxies = Vec::new();
        for row in document.select(&row_selector) {
            let cells: Vec<String> = row
                .select(&cell_selector)
                .map(|c| c.text().collect::<String>().trim().to_string())
                .collect();
            if cells.len() < 8 {
                continue;
            }

            let Ok(port) = cells[1].parse::<u16>() else { continue };
            if port == 0 || cells[0].is_empty() {
                continue;
            }
            let protocol = if cells[6].eq_ignore_ascii_case("yes") {
                ProxyProtocol::Https
            } else {
                ProxyProtocol::Http
            };

            let mut proxy = Proxy::new(cells[0].clone(), port, protocol);
            if !cells[2].is_empty() {
                proxy.country_code = Some(cells[2].to_uppercase());
            }
            proxy.anonymity_level = AnonymityLevel::from_name(&cells[4]);
            proxies.push(proxy);

            if proxies.len() >= PER_SOURCE_CAP {
                break;
            }
        }

        debug!("free-proxy-list yielded {} proxies", proxies.len());
        Ok(proxies)
    }
}

// ---------------------------------------------------------------------------
// geonode.com API
// ---------------------------------------------------------------------------

pub struct GeonodeSource {
    meta: SourceMeta,
    client: Arc<HttpClient>,
    url: String,
}

impl GeonodeSource {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            meta: SourceMeta::new("Geonode"),
            client,
            url: "https://proxylist.geonode.com/api/proxy-list?limit=200&page=1&sort_by=lastChecked&sort_type=desc"
                .to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[derive(Deserialize)]
struct GeonodeResponse {
    data: Vec<GeonodeEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeonodeEntry {
    ip: String,
    port: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    anonymity_level: Option<String>,
    #[serde(default)]
    protocols: Vec<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    speed: Option<f64>,
}

#[async_trait]
impl ProxySource for GeonodeSource {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta.last_updated()
    }

    fn touch(&self) {
        self.meta.touch();
    }

    async fn fetch(&self) -> Result<Vec<Proxy>> {
        let response: GeonodeResponse = self.client.get_json(&self.url).await?;
        self.touch();

        let mut proxies = Vec::new();
        for entry in response.data.into_iter().take(PER_SOURCE_CAP) {
            let Ok(port) = entry.port.parse::<u16>() else { continue };
            let Some(protocol) = entry.protocols.first().and_then(|p| ProxyProtocol::from_name(p))
            else {
                continue;
            };

            let mut proxy = Proxy::new(entry.ip, port, protocol);
            proxy.country_code = entry.country.map(|c| c.to_uppercase());
            proxy.anonymity_level = entry.anonymity_level.as_deref().and_then(AnonymityLevel::from_name);
            proxy.isp = entry.isp;
            proxy.region = entry.region;
            proxy.speed_mbps = entry.speed;
            proxies.push(proxy);
        }

        debug!("geonode yielded {} proxies", proxies.len());
        Ok(proxies)
    }
}

// ---------------------------------------------------------------------------
// proxyscrape.com plain-text API
// ---------------------------------------------------------------------------

pub struct ProxyScrapeSource {
    meta: SourceMeta,
    client: Arc<HttpClient>,
    url: String,
}

impl ProxyScrapeSource {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            meta: SourceMeta::new("ProxyScrape"),
            client,
            url: "https://api.proxyscrape.com/v2/?request=displayproxies&protocol=http&timeout=10000&country=all"
                .to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl ProxySource for ProxyScrapeSource {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta.last_updated()
    }

    fn touch(&self) {
        self.meta.touch();
    }

    async fn fetch(&self) -> Result<Vec<Proxy>> {
        let body = self.client.get_text(&self.url).await?;
        self.touch();
        let proxies = parse_plain_list(&body, ProxyProtocol::Http);
        debug!("proxyscrape yielded {} proxies", proxies.len());
        Ok(proxies)
    }
}

// ---------------------------------------------------------------------------
// proxynova.com
// ---------------------------------------------------------------------------

pub struct ProxyNovaSource {
    meta: SourceMeta,
    client: Arc<HttpClient>,
    url: String,
}

impl ProxyNovaSource {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            meta: SourceMeta::new("ProxyNova"),
            client,
            url: "https://www.proxynova.com/proxy-server-list/".to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl ProxySource for ProxyNovaSource {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta.last_updated()
    }

    fn touch(&self) {
        self.meta.touch();
    }

    async fn fetch(&self) -> Result<Vec<Proxy>> {
        let html = self.client.get_text(&self.url).await?;
        self.touch();

        let document = Html::parse_document(&html);
        let row_selector = selector("table#tbl_proxy_list tbody tr")?;
        let cell_selector = selector("td")?;

        let mut proxies = Vec::new();
        for row in document.select(&row_selector) {
            let cells: Vec<String> = row
                .select(&cell_selector)
                .map(|c| c.text().collect::<String>().trim().to_string())
                .collect();
            if cells.len() < 5 {
                continue;
            }
            let Ok(port) = cells[1].parse::<u16>() else { continue };
            if port == 0 || cells[0].is_empty() {
                continue;
            }

            let mut proxy = Proxy::new(cells[0].clone(), port, ProxyProtocol::Http);
            if !cells[2].is_empty() {
                proxy.country_code = Some(cells[2].chars().take(2).collect::<String>().to_uppercase());
            }
            proxy.speed_mbps = cells[3].trim_end_matches(" ms").parse::<f64>().ok().map(speed_from_latency);
            proxies.push(proxy);

            if proxies.len() >= PER_SOURCE_CAP {
                break;
            }
        }

        debug!("proxynova yielded {} proxies", proxies.len());
        Ok(proxies)
    }
}

// ---------------------------------------------------------------------------
// hidemy.name
// ---------------------------------------------------------------------------

pub struct HideMyNameSource {
    meta: SourceMeta,
    client: Arc<HttpClient>,
    url: String,
}

impl HideMyNameSource {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            meta: SourceMeta::new("HideMyName"),
            client,
            url: "https://hidemy.name/en/proxy-list/".to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl ProxySource for HideMyNameSource {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta.last_updated()
    }

    fn touch(&self) {
        self.meta.touch();
    }

    async fn fetch(&self) -> Result<Vec<Proxy>> {
        let html = self.client.get_text(&self.url).await?;
        self.touch();

        let document = Html::parse_document(&html);
        let row_selector = selector("table tbody tr")?;
        let cell_selector = selector("td")?;

        let mut proxies = Vec::new();
        for row in document.select(&row_selector) {
            let cells: Vec<String> = row
                .select(&cell_selector)
                .map(|c| c.text().collect::<String>().trim().to_string())
                .collect();
            if cells.len() < 6 {
                continue;
            }
            let Ok(port) = cells[1].parse::<u16>() else { continue };
            if port == 0 || cells[0].is_empty() {
                continue;
            }

            // Type cell lists e.g. "HTTP", "HTTPS", "SOCKS4", "SOCKS5" or a
            // comma-joined combination; take the strongest listed.
            let type_cell = cells[4].to_lowercase();
            let protocol = if type_cell.contains("socks5") {
                ProxyProtocol::Socks5
            } else if type_cell.contains("socks4") {
                ProxyProtocol::Socks4
            } else if type_cell.contains("https") {
                ProxyProtocol::Https
            } else {
                ProxyProtocol::Http
            };

            let mut proxy = Proxy::new(cells[0].clone(), port, protocol);
            if !cells[2].is_empty() {
                proxy.country_code = Some(cells[2].chars().take(2).collect::<String>().to_uppercase());
            }
            proxy.anonymity_level = AnonymityLevel::from_name(&cells[5]);
            proxies.push(proxy);

            if proxies.len() >= PER_SOURCE_CAP {
                break;
            }
        }

        debug!("hidemy.name yielded {} proxies", proxies.len());
        Ok(proxies)
    }
}

// ---------------------------------------------------------------------------
// proxy-list.to
// ---------------------------------------------------------------------------

pub struct ProxyListToSource {
    meta: SourceMeta,
    client: Arc<HttpClient>,
    url: String,
}

impl ProxyListToSource {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            meta: SourceMeta::new("ProxyListTo"),
            client,
            url: "https://proxy-list.to/http/".to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl ProxySource for ProxyListToSource {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta.last_updated()
    }

    fn touch(&self) {
        self.meta.touch();
    }

    async fn fetch(&self) -> Result<Vec<Proxy>> {
        let body = self.client.get_text(&self.url).await?;
        self.touch();

        // The download endpoint is plain ip:port lines; the HTML page embeds
        // the same pairs, so the line parser covers both shapes.
        let proxies = parse_plain_list(&body, ProxyProtocol::Http);
        debug!("proxy-list.to yielded {} proxies", proxies.len());
        Ok(proxies)
    }
}

// ---------------------------------------------------------------------------
// Host-supplied plain-text list
// ---------------------------------------------------------------------------

pub struct CustomSource {
    meta: SourceMeta,
    client: Arc<HttpClient>,
    url: String,
    protocol: ProxyProtocol,
}

impl CustomSource {
    pub fn new(client: Arc<HttpClient>, url: impl Into<String>, protocol: ProxyProtocol) -> Self {
        let url = url.into();
        Self {
            meta: SourceMeta::new(format!("Custom({})", url)),
            client,
            url,
            protocol,
        }
    }
}

#[async_trait]
impl ProxySource for CustomSource {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta.last_updated()
    }

    fn touch(&self) {
        self.meta.touch();
    }

    async fn fetch(&self) -> Result<Vec<Proxy>> {
        let body = self.client.get_text(&self.url).await?;
        self.touch();
        Ok(parse_plain_list(&body, self.protocol))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The set of enabled sources, fetched in parallel with a per-source
/// deadline. Failures are logged and swallowed; the result is deduplicated
/// by proxy identity, first occurrence winning.
pub struct SourceRegistry {
    sources: Vec<Arc<dyn ProxySource>>,
}

impl SourceRegistry {
    pub fn from_selection(selection: &SourceSelection, client: Arc<HttpClient>) -> Self {
        let mut sources: Vec<Arc<dyn ProxySource>> = Vec::new();
        if selection.free_proxy_list {
            sources.push(Arc::new(FreeProxyListSource::new(client.clone())));
        }
        if selection.geonode {
            sources.push(Arc::new(GeonodeSource::new(client.clone())));
        }
        if selection.proxy_scrape {
            sources.push(Arc::new(ProxyScrapeSource::new(client.clone())));
        }
        if selection.proxy_nova {
            sources.push(Arc::new(ProxyNovaSource::new(client.clone())));
        }
        if selection.hide_my_name {
            sources.push(Arc::new(HideMyNameSource::new(client.clone())));
        }
        if selection.proxy_list_to {
            sources.push(Arc::new(ProxyListToSource::new(client.clone())));
        }
        for CustomSourceConfig { url, protocol } in &selection.custom_urls {
            sources.push(Arc::new(CustomSource::new(client.clone(), url.clone(), *protocol)));
        }
        Self { sources }
    }

    pub fn from_sources(sources: Vec<Arc<dyn ProxySource>>) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &[Arc<dyn ProxySource>] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub async fn fetch_all(&self, per_source_timeout: Duration) -> Vec<Proxy> {
        let fetches = self.sources.iter().map(|source| {
            let source = source.clone();
            async move {
                match tokio::time::timeout(per_source_timeout, source.fetch()).await {
                    Ok(Ok(proxies)) => {
                        info!("fetched {} proxies from {}", proxies.len(), source.name());
                        proxies
                    }
                    Ok(Err(e)) => {
                        warn!("source {} failed: {}", source.name(), e);
                        Vec::new()
                    }
                    Err(_) => {
                        warn!("source {} timed out after {:?}", source.name(), per_source_timeout);
                        Vec::new()
                    }
                }
            }
        });

        let batches = futures::future::join_all(fetches).await;

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for proxy in batches.into_iter().flatten() {
            if seen.insert(proxy.key()) {
                merged.push(proxy);
            }
        }
        info!("aggregated {} unique proxies from {} sources", merged.len(), self.sources.len());
        merged
    }
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("bad selector {:?}: {}", css, e))
}

/// Parses `ip:port` pairs, one per line; tolerates surrounding noise.
pub(crate) fn parse_plain_list(body: &str, protocol: ProxyProtocol) -> Vec<Proxy> {
    let mut proxies = Vec::new();
    for line in body.lines() {
        let Some((ip, port)) = parse_endpoint(line) else { continue };
        proxies.push(Proxy::new(ip, port, protocol));
        if proxies.len() >= PER_SOURCE_CAP {
            break;
        }
    }
    proxies
}

pub(crate) fn parse_endpoint(line: &str) -> Option<(String, u16)> {
    let trimmed = line.trim();
    let (host, port) = trimmed.rsplit_once(':')?;
    let port: u16 = port.trim().parse().ok()?;
    if port == 0 || host.is_empty() || host.contains(char::is_whitespace) {
        return None;
    }
    Some((host.to_string(), port))
}

/// Rough Mbps estimate from a latency figure, capped to a sane range.
fn speed_from_latency(latency_ms: f64) -> f64 {
    if latency_ms <= 0.0 {
        return 0.0;
    }
    (1000.0 / latency_ms).min(100.0)
}
