//! Local subprocess script runner (§4.D): invokes a k6-shaped binary,
//! capturing its metrics/logs files plus stdout/stderr under a timeout.
//!
//! Written in this codebase's idiom — `anyhow::Context`-wrapped errors,
//! `#[instrument]` spans — using `tokio::process::Command`, the same
//! `type Command = tokio::process::Command` / spawn-with-timeout shape seen
//! in `other_examples/1e0f503a_atomize-hq-codex-wrapper`.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::errors::{classify, user_attributable_for_raw_output, ExitSignal, ProbeAgentError};
use crate::extractor::logfmt::decode_logfmt;
use crate::limits::{truncate_at_line_boundary, truncation_notice, OutputCaps};
use crate::model::{RunResponse, Script, SecretStore};

use super::{RunContext, Runner};

#[derive(Serialize)]
struct SecretConfigWire<'a> {
    url: &'a str,
    token: &'a str,
}

/// Path to the k6-shaped binary and its fixed argument set (§6 "Local
/// subprocess invocation").
pub struct LocalRunner {
    binary_path: String,
    caps: OutputCaps,
}

impl LocalRunner {
    pub fn new(binary_path: impl Into<String>, caps: OutputCaps) -> Self {
        Self {
            binary_path: binary_path.into(),
            caps,
        }
    }

    fn build_args(
        &self,
        script: &Script,
        metrics_path: &std::path::Path,
        logs_path: &std::path::Path,
        script_path: &std::path::Path,
        secret_config_path: Option<&std::path::Path>,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            script_path.display().to_string(),
            format!("--out=sm={}", metrics_path.display()),
            "--log-format".to_string(),
            "logfmt".to_string(),
            format!("--log-output=file={}", logs_path.display()),
            "--blacklist-ip".to_string(),
            "169.254.169.254/32".to_string(),
            "--block-hostnames".to_string(),
            "*.cluster.local".to_string(),
            "--no-thresholds".to_string(),
            "--no-usage-report".to_string(),
            "--no-color".to_string(),
            "--no-summary".to_string(),
            "--verbose".to_string(),
            "--throw".to_string(),
            "--dns".to_string(),
            "ttl=30s,select=random,policy=preferIPv4".to_string(),
            "--address".to_string(),
            "".to_string(),
            "--max-redirects".to_string(),
            "10".to_string(),
            "--batch".to_string(),
            "10".to_string(),
            "--batch-per-host".to_string(),
            "4".to_string(),
            "--no-connection-reuse".to_string(),
            "--summary-time-unit".to_string(),
            "s".to_string(),
        ];

        if !matches!(script.check_type, crate::model::CheckType::Browser) {
            args.push("--vus".to_string());
            args.push("1".to_string());
            args.push("--iterations".to_string());
            args.push("1".to_string());
        }

        if let Some(config_path) = secret_config_path {
            args.push("--secret-source".to_string());
            args.push(format!(
                "grafanasecrets=config={}",
                config_path.display()
            ));
        }

        args
    }

    fn build_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.entry("K6_BROWSER_LOG".to_string())
            .or_insert_with(|| "info".to_string());
        env.entry("K6_AUTO_EXTENSION_RESOLUTION".to_string())
            .or_insert_with(|| "false".to_string());
        env
    }
}

#[async_trait]
impl Runner for LocalRunner {
    #[instrument(name = "script_runner_local", skip_all, fields(check.id = %script.check_id))]
    async fn run(
        &self,
        script: &Script,
        secrets: &SecretStore,
        _ctx: &RunContext,
    ) -> Result<RunResponse, ProbeAgentError> {
        if script.timeout.is_zero() {
            return Err(ProbeAgentError::InvalidAdHocRequest(
                "scriptTimeout must be > 0 for local runner",
            ));
        }

        let temp_dir = tempfile::tempdir()
            .map_err(|e| ProbeAgentError::Transport(format!("temp dir creation failed: {e}")))?;
        let metrics_path = temp_dir.path().join("metrics.out");
        let logs_path = temp_dir.path().join("logs.out");
        let script_path = temp_dir.path().join("script.js");

        tokio::fs::write(&script_path, &script.payload)
            .await
            .map_err(|e| ProbeAgentError::Transport(format!("script write failed: {e}")))?;
        tokio::fs::write(&metrics_path, b"")
            .await
            .map_err(|e| ProbeAgentError::Transport(format!("metrics file create failed: {e}")))?;
        tokio::fs::write(&logs_path, b"")
            .await
            .map_err(|e| ProbeAgentError::Transport(format!("logs file create failed: {e}")))?;

        let secret_config_path = if secrets.is_configured() {
            let config_path = temp_dir.path().join("secrets.json");
            let wire = SecretConfigWire {
                url: &secrets.url,
                token: &secrets.token,
            };
            let body = serde_json::to_vec(&wire)
                .map_err(|e| ProbeAgentError::Transport(format!("secrets encode failed: {e}")))?;
            let mut file = tokio::fs::File::create(&config_path)
                .await
                .map_err(|e| ProbeAgentError::Transport(format!("secrets file create failed: {e}")))?;
            file.write_all(&body)
                .await
                .map_err(|e| ProbeAgentError::Transport(format!("secrets file write failed: {e}")))?;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| ProbeAgentError::Transport(format!("secrets chmod failed: {e}")))?;
            Some(config_path)
        } else {
            None
        };

        let args = self.build_args(
            script,
            &metrics_path,
            &logs_path,
            &script_path,
            secret_config_path.as_deref(),
        );
        let env = self.build_env();

        let mut command = tokio::process::Command::new(&self.binary_path);
        command.args(&args).envs(&env);

        let run_result = tokio::time::timeout(script.timeout, command.output()).await;

        let (exit, stdout, stderr, timed_out): (Option<ExitSignal>, Vec<u8>, Vec<u8>, bool) = match run_result {
            Ok(Ok(output)) => (
                Some(ExitSignal {
                    exit_code: output.status.code(),
                }),
                output.stdout,
                output.stderr,
                false,
            ),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to spawn local script runner");
                return Err(ProbeAgentError::Transport(format!("spawn failed: {e}")));
            }
            Err(_) => (None, Vec::new(), Vec::new(), true),
        };

        let logs_raw = tokio::fs::read(&logs_path).await.unwrap_or_default();
        let metrics_raw = tokio::fs::read(&metrics_path).await.unwrap_or_default();

        let mut decoded_records = Vec::new();
        let _ = decode_logfmt(&logs_raw, |line| decoded_records.push(line.record));
        let had_error = timed_out || exit.map(|e| e.exit_code != Some(0)).unwrap_or(true);
        let kind = classify(had_error, timed_out, &decoded_records, exit);

        if had_error && !user_attributable_for_raw_output(timed_out, exit) {
            tracing::error!(
                stdout = %String::from_utf8_lossy(&stdout),
                stderr = %String::from_utf8_lossy(&stderr),
                logs = %String::from_utf8_lossy(&logs_raw),
                "local script run failed with a non-user-attributable error"
            );
            return Err(ProbeAgentError::Transport(
                "local script run failed without a usable response".to_string(),
            ));
        }

        let (logs_slice, logs_truncated) = truncate_at_line_boundary(&logs_raw, self.caps.logs_bytes);
        let mut logs = logs_slice.to_vec();
        let (metrics_slice, metrics_truncated) =
            truncate_at_line_boundary(&metrics_raw, self.caps.metrics_bytes);
        let metrics = metrics_slice.to_vec();

        if metrics_truncated {
            logs.extend_from_slice(truncation_notice("Metrics", self.caps.metrics_bytes).as_bytes());
        }
        if logs_truncated {
            logs.extend_from_slice(truncation_notice("Log", self.caps.logs_bytes).as_bytes());
        }

        let (error, error_code) = if kind.as_str().is_empty() {
            (None, None)
        } else {
            (
                Some(format!("script run classified as {}", kind.as_str())),
                Some(kind.as_str().to_string()),
            )
        };

        Ok(RunResponse {
            metrics,
            logs,
            error,
            error_code,
        })
    }
}
