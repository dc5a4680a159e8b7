//! HTTP script runner (§4.C): POSTs a script to a configured runner URL
//! with a linear-jitter retry policy, deadline-aware.
//!
//! Request construction follows this codebase's usual idiom (`reqwest::Client`,
//! `#[tracing::instrument]` with `tracing::field::Empty` span fields filled in
//! after the response arrives), with a sleep-then-retry loop generalized to
//! linear+jitter and made deadline-aware instead of attempt-count-only.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};
use serde::Serialize;
use tracing::instrument;

use crate::errors::ProbeAgentError;
use crate::model::{RunResponse, Script, SecretStore};

use super::backoff::{linear_jitter, reduced_by_elapsed};
use super::{RunContext, Runner};

/// One attempt's outcome, before the retry loop decides what to do with it.
enum AttemptOutcome {
    Done(RunResponse),
    PermanentStatus(u16),
    Retriable(String),
}

#[derive(Serialize)]
struct SettingsWire {
    timeout: u64,
}

#[derive(Serialize)]
struct CheckWire<'a> {
    #[serde(rename = "type")]
    check_type: &'a str,
    metadata: serde_json::Value,
}

#[derive(Serialize)]
struct SecretStoreWire<'a> {
    url: &'a str,
    token: &'a str,
}

#[derive(Serialize)]
struct RunRequestWire<'a> {
    script: String,
    settings: SettingsWire,
    check: CheckWire<'a>,
    #[serde(rename = "secretStore")]
    secret_store: SecretStoreWire<'a>,
    #[serde(rename = "notAfter")]
    not_after: chrono::DateTime<chrono::Utc>,
}

/// Per-attempt grace time layered on top of `scriptTimeout` (§4.C).
///
/// `attempts` and `attempts_per_run` are fresh per instance rather than
/// registered against the process-wide default registry: `HttpRunner` is a
/// long-lived, reused runner, so its own counters are enough to answer "how
/// many attempts, how many succeeded" without a shared registry pulling in
/// collectors from unrelated runs.
pub struct HttpRunner {
    client: reqwest::Client,
    url: String,
    base_backoff: Duration,
    grace_time: Duration,
    attempts: IntCounterVec,
    attempts_per_run: HistogramVec,
}

impl HttpRunner {
    /// Panics if `base_backoff` is zero: a tight failure loop against the
    /// runner would effectively DoS it (§4.C panic invariant).
    pub fn new(client: reqwest::Client, url: impl Into<String>, base_backoff: Duration, grace_time: Duration) -> Self {
        assert!(
            !base_backoff.is_zero(),
            "HttpRunner: base_backoff must be non-zero"
        );
        let attempts = IntCounterVec::new(
            Opts::new("script_runner_http_attempts_total", "HTTP script runner attempts by outcome"),
            &["outcome"],
        )
        .expect("static attempts counter opts are valid");
        let attempts_per_run = HistogramVec::new(
            HistogramOpts::new(
                "script_runner_http_attempts_per_run",
                "number of attempts taken by one HTTP script run",
            ),
            &["success"],
        )
        .expect("static attempts-per-run histogram opts are valid");
        Self {
            client,
            url: url.into(),
            base_backoff,
            grace_time,
            attempts,
            attempts_per_run,
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> Option<AttemptOutcome> {
        match status.as_u16() {
            200 | 408 | 422 | 500 => None, // handled by the caller, body carries the result
            400 => Some(AttemptOutcome::PermanentStatus(400)),
            other => Some(AttemptOutcome::Retriable(format!("unexpected status {other}"))),
        }
    }

    #[instrument(
        name = "script_runner_http_attempt",
        skip_all,
        fields(http.url = %self.url, http.status_code = tracing::field::Empty)
    )]
    async fn attempt(
        &self,
        script: &Script,
        secrets: &SecretStore,
        per_attempt_timeout: Duration,
    ) -> AttemptOutcome {
        let span = tracing::Span::current();
        let not_after = chrono::Utc::now()
            + chrono::Duration::from_std(per_attempt_timeout).unwrap_or_default();

        let body = RunRequestWire {
            script: base64_payload(&script.payload),
            settings: SettingsWire {
                timeout: script.timeout.as_millis() as u64,
            },
            check: CheckWire {
                check_type: script.check_type.as_str(),
                metadata: serde_json::json!({ "checkId": script.check_id }),
            },
            secret_store: SecretStoreWire {
                url: &secrets.url,
                token: &secrets.token,
            },
            not_after,
        };

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .timeout(per_attempt_timeout)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::Retriable(e.to_string()),
        };

        span.record("http.status_code", response.status().as_u16() as i64);

        if let Some(outcome) = Self::classify_status(response.status()) {
            return outcome;
        }

        match response.json::<RunResponse>().await {
            Ok(parsed) => AttemptOutcome::Done(parsed),
            Err(e) => AttemptOutcome::Retriable(format!("body decode failed: {e}")),
        }
    }
}

fn base64_payload(payload: &[u8]) -> String {
    // The wire contract only names a `script` string field; scripts are
    // treated as opaque text here (§1: script content/semantics out of scope).
    String::from_utf8_lossy(payload).into_owned()
}

#[async_trait]
impl Runner for HttpRunner {
    async fn run(
        &self,
        script: &Script,
        secrets: &SecretStore,
        ctx: &RunContext,
    ) -> Result<RunResponse, ProbeAgentError> {
        let per_attempt_timeout = script.timeout + self.grace_time;
        let mut attempt_n: u32 = 0;
        let mut last_error = String::new();

        loop {
            if ctx.expired() {
                return Err(ProbeAgentError::Transport(format!(
                    "outer deadline exceeded, last error: {last_error}"
                )));
            }

            attempt_n += 1;
            let attempt_start = Instant::now();
            match self.attempt(script, secrets, per_attempt_timeout).await {
                AttemptOutcome::Done(response) => {
                    self.attempts.with_label_values(&["success"]).inc();
                    self.attempts_per_run
                        .with_label_values(&["1"])
                        .observe(attempt_n as f64);
                    return Ok(response);
                }
                AttemptOutcome::PermanentStatus(status) => {
                    self.attempts.with_label_values(&["success"]).inc();
                    self.attempts_per_run
                        .with_label_values(&["0"])
                        .observe(attempt_n as f64);
                    return Err(ProbeAgentError::UnexpectedStatus(status));
                }
                AttemptOutcome::Retriable(msg) => {
                    self.attempts.with_label_values(&["retriable"]).inc();
                    last_error = msg;
                    tracing::warn!(
                        attempt = attempt_n,
                        error = %last_error,
                        "script runner HTTP attempt failed, retrying"
                    );

                    if ctx.expired() {
                        self.attempts_per_run
                            .with_label_values(&["0"])
                            .observe(attempt_n as f64);
                        return Err(ProbeAgentError::Transport(format!(
                            "outer deadline exceeded, last error: {last_error}"
                        )));
                    }

                    let wait = linear_jitter(attempt_n, self.base_backoff);
                    let wait = reduced_by_elapsed(wait, attempt_start.elapsed());
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
