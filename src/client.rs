use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{HealthInfo, TranscribeRequest, TranscribeStarted, UsageInfo};

/// Short probe timeout: `/health` doubles as the liveness check for an
/// already-bound port during startup, so it must fail fast.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

const USAGE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const BODY_SNIPPET_CHARS: usize = 512;

/// Typed HTTP client for the local inference daemon. Cheap to clone; all
/// clones share one connection pool.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// No client-wide timeout: the SSE stream stays open for the whole job.
    /// Short-lived endpoints set per-request timeouts instead.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthInfo> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .context("health request failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!("health returned {}", resp.status()));
        }
        resp.json::<HealthInfo>()
            .await
            .context("invalid health payload")
    }

    pub async fn usage(&self) -> Result<UsageInfo> {
        let resp = self
            .http
            .get(format!("{}/usage", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .context("usage request failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!("usage returned {}", resp.status()));
        }
        resp.json::<UsageInfo>().await.context("invalid usage payload")
    }

    /// Submit a transcription job. The returned `job_id` names both the
    /// event stream and the cancellation endpoint.
    pub async fn submit(&self, request: &TranscribeRequest) -> Result<TranscribeStarted> {
        let resp = self
            .http
            .post(format!("{}/transcribe", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("E_SUBMIT_FAILED: transcription request failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "E_SUBMIT_FAILED: backend rejected job ({status}): {}",
                snippet(&body)
            ));
        }
        resp.json::<TranscribeStarted>()
            .await
            .map_err(|e| anyhow!("E_SUBMIT_FAILED: invalid submit response: {e}"))
    }

    /// Best-effort server-side cancellation. The caller has already decided
    /// the job is over; a failure here only means the backend finishes work
    /// nobody is listening to.
    pub async fn cancel(&self, job_id: &str) {
        let _ = self
            .http
            .delete(format!("{}/transcribe/{job_id}", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
    }

    /// Open the SSE event stream for a submitted job. The response body is
    /// consumed incrementally via `bytes_stream`.
    pub async fn open_stream(&self, job_id: &str) -> Result<reqwest::Response> {
        let resp = self
            .http
            .get(format!("{}/transcribe/{job_id}/stream", self.base_url))
            .send()
            .await
            .map_err(|e| anyhow!("E_STREAM_CLOSED: could not open event stream: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!(
                "E_STREAM_CLOSED: event stream rejected ({status})"
            ));
        }
        Ok(resp)
    }
}

fn snippet(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(BODY_SNIPPET_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    body[..end].trim_end()
}

/// Polls `/usage` on a fixed cadence and forwards readings until cancelled
/// or the receiver is dropped. Failed polls are skipped, not fatal.
pub struct UsageMonitor;

impl UsageMonitor {
    pub fn spawn(client: BackendClient, token: CancellationToken) -> mpsc::Receiver<UsageInfo> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(USAGE_POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        if let Ok(info) = client.usage().await {
                            if tx.send(info).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        rx
    }
}
