//! Output-size caps and per-tenant limit validation (§6 "Output caps", §1
//! Non-goal "multi-tenant fairness beyond per-tenant limit validation").
//!
//! Same shape as `ExecutionLimits` elsewhere in this codebase: a config
//! struct with an `from_env()` constructor, plus a pure validation function
//! that returns a list of violations rather than a bool.

use serde::{Deserialize, Serialize};

pub const DEFAULT_LOGS_CAP_BYTES: usize = 255 * 1024;
pub const DEFAULT_METRICS_CAP_BYTES: usize = 100 * 1024;

/// Output caps applied to local-runner captures (§4.D step 9).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutputCaps {
    pub logs_bytes: usize,
    pub metrics_bytes: usize,
}

impl Default for OutputCaps {
    fn default() -> Self {
        Self {
            logs_bytes: DEFAULT_LOGS_CAP_BYTES,
            metrics_bytes: DEFAULT_METRICS_CAP_BYTES,
        }
    }
}

impl OutputCaps {
    pub fn from_env() -> Self {
        let mut caps = Self::default();
        if let Ok(val) = std::env::var("PROBE_AGENT_LOGS_CAP_BYTES") {
            if let Ok(n) = val.parse() {
                caps.logs_bytes = n;
            }
        }
        if let Ok(val) = std::env::var("PROBE_AGENT_METRICS_CAP_BYTES") {
            if let Ok(n) = val.parse() {
                caps.metrics_bytes = n;
            }
        }
        caps
    }
}

/// Truncates `buf` to at most `cap` bytes without splitting a line: rewinds
/// to the last `\n` at or before the cap. Returns `(truncated, was_truncated)`.
pub fn truncate_at_line_boundary(buf: &[u8], cap: usize) -> (&[u8], bool) {
    if buf.len() <= cap {
        return (buf, false);
    }
    let window = &buf[..cap];
    match window.iter().rposition(|&b| b == b'\n') {
        Some(idx) => (&buf[..=idx], true),
        None => (&[], true),
    }
}

/// Error-level logfmt truncation notice, appended after a cap trims output.
pub fn truncation_notice(what: &str, at_bytes: usize) -> String {
    format!(
        "level=error msg=\"{} output truncated at {} bytes\"\n",
        what, at_bytes
    )
}

/// Per-tenant concurrency limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TenantLimits {
    pub max_concurrent_runs: usize,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantLimitViolation {
    pub message: String,
}

pub fn validate_tenant_concurrency(
    in_flight: usize,
    limits: &TenantLimits,
) -> Result<(), TenantLimitViolation> {
    if in_flight > limits.max_concurrent_runs {
        return Err(TenantLimitViolation {
            message: format!(
                "tenant has {} runs in flight, limit is {}",
                in_flight, limits.max_concurrent_runs
            ),
        });
    }
    Ok(())
}
