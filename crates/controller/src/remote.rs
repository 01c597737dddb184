//! Remote parameter override: polls the configured endpoint for a candidate
//! parameter set.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::params::{Candidate, ParamSource, ParameterStore, Params};
use crate::telemetry::HTTP_TIMEOUT;

pub struct RemoteConfigClient {
    http: reqwest::Client,
    url: String,
    every: Duration,
    next_due: Instant,
    enabled: bool,
}

impl RemoteConfigClient {
    /// First fetch is due at `start`.
    pub fn new(params: &Params, start: Instant) -> Result<Self> {
        Self::with_endpoint(
            &params.config_url,
            params.remote_config_interval(),
            params.remote_config,
            start,
        )
    }

    pub(crate) fn with_endpoint(url: &str, every: Duration, enabled: bool, start: Instant) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build remote config http client")?;
        Ok(Self {
            http,
            url: url.to_string(),
            every,
            next_due: start,
            enabled,
        })
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.enabled.then_some(self.next_due)
    }

    /// Fetch a candidate if a check is due.  Failures are logged and yield
    /// `None`; the next check is armed either way.
    pub async fn poll(&mut self, now: Instant) -> Option<Candidate> {
        if !self.enabled || now < self.next_due {
            return None;
        }
        self.next_due = now + self.every;
        match self.fetch().await {
            Ok(candidate) => {
                debug!(keys = candidate.len(), "remote parameters fetched");
                Some(candidate)
            }
            Err(e) => {
                warn!("remote config check failed: {e:#}");
                None
            }
        }
    }

    async fn fetch(&self) -> Result<Candidate> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {}", self.url))?;
        if resp.status() != StatusCode::OK {
            bail!("GET {} returned {}", self.url, resp.status());
        }
        let body: Value = resp.json().await.context("remote parameters are not JSON")?;
        ParameterStore::load(&ParamSource::Remote(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::stub;

    const EVERY: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn fetches_first_element_of_array() {
        let (url, request) = stub::serve_once(200, r#"[{"ideal_ph": 7.0, "balance_ph": false}]"#).await;
        let t0 = Instant::now();
        let mut client = RemoteConfigClient::with_endpoint(&url, EVERY, true, t0).unwrap();

        let candidate = client.poll(t0).await.unwrap();
        assert_eq!(candidate.get("ideal_ph"), Some(&serde_json::json!(7.0)));
        assert!(request.await.unwrap().starts_with("GET / "));
        assert_eq!(client.next_due(), Some(t0 + EVERY));
    }

    #[tokio::test]
    async fn non_ok_status_yields_nothing() {
        let (url, _request) = stub::serve_once(404, "").await;
        let t0 = Instant::now();
        let mut client = RemoteConfigClient::with_endpoint(&url, EVERY, true, t0).unwrap();
        assert!(client.poll(t0).await.is_none());
        assert_eq!(client.next_due(), Some(t0 + EVERY));
    }

    #[tokio::test]
    async fn object_body_is_rejected() {
        let (url, _request) = stub::serve_once(200, r#"{"ideal_ph": 7.0}"#).await;
        let t0 = Instant::now();
        let mut client = RemoteConfigClient::with_endpoint(&url, EVERY, true, t0).unwrap();
        assert!(client.poll(t0).await.is_none());
    }

    #[tokio::test]
    async fn not_due_or_disabled_does_not_fetch() {
        let t0 = Instant::now();
        let mut client =
            RemoteConfigClient::with_endpoint("http://127.0.0.1:9", EVERY, true, t0 + EVERY).unwrap();
        assert!(client.poll(t0).await.is_none());

        let mut off = RemoteConfigClient::with_endpoint("http://127.0.0.1:9", EVERY, false, t0).unwrap();
        assert!(off.poll(t0).await.is_none());
        assert_eq!(off.next_due(), None);
    }
}
