//! Process configuration (§10.3), env-driven. Same parse-and-fallback idiom
//! as `limits::OutputCaps::from_env` and `telemetry::TelemetryConfig::from_env`:
//! a missing or malformed var falls back to a documented default, it never
//! panics.

use std::time::Duration;

use crate::limits::OutputCaps;

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

/// Every tunable named across §4-§6: control-plane endpoint, script-runner
/// retry/grace timing, output caps, the k6 binary location, and the
/// process-lifetime-immutable network policy (blacklist CIDR, blocked-host
/// glob).
#[derive(Debug, Clone)]
pub struct Config {
    pub control_plane_endpoint: String,
    pub http_runner_url: Option<String>,
    pub local_runner_binary_path: String,
    pub base_backoff: Duration,
    pub grace_time: Duration,
    pub output_caps: OutputCaps,
    pub blacklist_cidr: String,
    pub blocked_hostname_glob: String,
    pub reconnect_backoff_initial: Duration,
    pub reconnect_backoff_max: Duration,
    pub reconnect_backoff_factor: f64,
    pub feature_flags: Vec<String>,
    pub build_version: String,
    pub build_commit: String,
    pub build_timestamp: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            control_plane_endpoint: env_string("PROBE_AGENT_CONTROL_PLANE_ENDPOINT", "http://localhost:4317"),
            http_runner_url: std::env::var("PROBE_AGENT_HTTP_RUNNER_URL").ok(),
            local_runner_binary_path: env_string("PROBE_AGENT_K6_BINARY", "k6"),
            base_backoff: env_duration_ms("PROBE_AGENT_BASE_BACKOFF_MS", Duration::from_millis(500)),
            grace_time: env_duration_ms("PROBE_AGENT_GRACE_TIME_MS", Duration::from_secs(5)),
            output_caps: OutputCaps::from_env(),
            blacklist_cidr: env_string("PROBE_AGENT_BLACKLIST_CIDR", "169.254.169.254/32"),
            blocked_hostname_glob: env_string("PROBE_AGENT_BLOCKED_HOSTNAME_GLOB", "*.cluster.local"),
            reconnect_backoff_initial: env_duration_ms("PROBE_AGENT_RECONNECT_BACKOFF_INITIAL_MS", Duration::from_millis(500)),
            reconnect_backoff_max: env_duration_ms("PROBE_AGENT_RECONNECT_BACKOFF_MAX_MS", Duration::from_secs(60)),
            reconnect_backoff_factor: std::env::var("PROBE_AGENT_RECONNECT_BACKOFF_FACTOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2.0),
            feature_flags: std::env::var("PROBE_AGENT_FEATURE_FLAGS")
                .ok()
                .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
            build_version: env_string("PROBE_AGENT_BUILD_VERSION", env!("CARGO_PKG_VERSION")),
            build_commit: env_string("PROBE_AGENT_BUILD_COMMIT", "unknown"),
            build_timestamp: env_string("PROBE_AGENT_BUILD_TIMESTAMP", "unknown"),
        }
    }

    pub fn supports_protocol_secrets(&self) -> bool {
        self.feature_flags.iter().any(|f| f == "protocol-secrets")
    }
}
