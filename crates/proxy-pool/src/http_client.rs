//! Outbound HTTP plumbing for the discovery sources.
//!
//! Retry with exponential backoff plus a direct rate limiter so the engine
//! stays polite toward the free proxy-list endpoints.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use tracing::debug;

const USER_AGENT: &str = "proxy-pool/0.3 (+https://crates.io/crates/proxy-pool)";

pub struct HttpClient {
    client: ClientWithMiddleware,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(1), Duration::from_secs(10))
            .build_with_max_retries(2);

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        let rate_limiter = Arc::new(RateLimiter::direct(
            Quota::per_second(NonZeroU32::new(5).expect("5 is non-zero"))
                .allow_burst(NonZeroU32::new(10).expect("10 is non-zero")),
        ));

        Ok(Self { client, rate_limiter })
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        self.rate_limiter.until_ready().await;
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("GET {} failed: {}", url, e))?;

        response
            .text()
            .await
            .map_err(|e| anyhow!("reading body of {} failed: {}", url, e))
    }

    pub async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        self.rate_limiter.until_ready().await;
        debug!("GET {} (json)", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("GET {} failed: {}", url, e))?;

        response
            .json::<T>()
            .await
            .map_err(|e| anyhow!("parsing body of {} failed: {}", url, e))
    }
}
