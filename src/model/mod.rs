//! Core data model (§3): `Check`, `AdHocRequest`, `Script`, `SecretStore`,
//! `RunResponse`, probe registration state, and the backoff-state contract.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ProbeAgentError;

/// Tenant identifier, globally unique across regions (Glossary: GlobalID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalId {
    pub region: i32,
    pub local_id: i64,
}

impl GlobalId {
    pub fn is_zero(&self) -> bool {
        self.region == 0 && self.local_id == 0
    }
}

/// One of the check type tags named in §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Ping,
    Http,
    Dns,
    Tcp,
    Traceroute,
    Scripted,
    Browser,
    Multihttp,
    Grpc,
}

impl CheckType {
    /// Script-based types route through a script runner (C or D) rather
    /// than a direct network prober (§4.F).
    pub fn is_script_based(&self) -> bool {
        matches!(
            self,
            CheckType::Scripted | CheckType::Browser | CheckType::Multihttp
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Ping => "ping",
            CheckType::Http => "http",
            CheckType::Dns => "dns",
            CheckType::Tcp => "tcp",
            CheckType::Traceroute => "traceroute",
            CheckType::Scripted => "scripted",
            CheckType::Browser => "browser",
            CheckType::Multihttp => "multihttp",
            CheckType::Grpc => "grpc",
        }
    }
}

/// Type-specific settings for a check. Kept opaque (raw JSON) since the
/// individual probe algorithms and their settings schemas are out of scope
/// (§1) — the dispatcher only needs to pass this through to the prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSettings(pub serde_json::Value);

/// A declarative description of work (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub id: String,
    pub tenant_id: GlobalId,
    pub target: String,
    pub check_type: CheckType,
    pub timeout_ms: u64,
    pub frequency_ms: Option<u64>,
    pub settings: CheckSettings,
}

impl Check {
    /// Validates the invariants named in §3: non-zero timeout for
    /// script-based types, non-zero tenant id.
    pub fn validate(&self) -> Result<(), ProbeAgentError> {
        if self.tenant_id.is_zero() {
            return Err(ProbeAgentError::InvalidAdHocRequest("tenantId must not be zero"));
        }
        if self.check_type.is_script_based() && self.timeout_ms == 0 {
            return Err(ProbeAgentError::InvalidAdHocRequest(
                "timeout must be > 0 for script-based check types",
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A tenant refresh payload, optionally riding along with an `AdHocRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: GlobalId,
    pub stack_id: String,
}

/// A Check plus optional tenant refresh and a unique adhoc id (§3).
/// Consumed once; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocRequest {
    pub adhoc_id: Uuid,
    pub check: Check,
    pub tenant: Option<Tenant>,
}

impl AdHocRequest {
    /// Boundary scenario 8: construction fails for a nil check or a zero
    /// tenant id with the same sentinel error.
    pub fn validate(&self) -> Result<(), ProbeAgentError> {
        self.check.validate()
    }
}

/// Script payload and check metadata, immutable after construction (§3).
#[derive(Debug, Clone)]
pub struct Script {
    pub payload: Vec<u8>,
    pub timeout: Duration,
    pub check_id: String,
    pub tenant_id: GlobalId,
    pub region: i32,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub check_type: CheckType,
}

/// URL + token pair, scoped to a single script run (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretStore {
    pub url: String,
    pub token: String,
}

impl SecretStore {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.token.is_empty()
    }
}

/// Raw runner output (§3). Invariant: `error` and `error_code` are both
/// empty or both non-empty — anything else is a buggy-runner condition,
/// checked by the processor (§4.E step 2), not by this type, since
/// constructing the invalid combination is exactly what a buggy runner does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub metrics: Vec<u8>,
    pub logs: Vec<u8>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "errorCode")]
    pub error_code: Option<String>,
}

impl RunResponse {
    /// `true` iff exactly one of `error`/`error_code` is set.
    pub fn violates_invariant(&self) -> bool {
        self.error.as_ref().is_some_and(|s| !s.is_empty())
            != self.error_code.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// Probe identity after a successful handshake (§3). Cleared on reconnect.
#[derive(Debug, Clone)]
pub struct ProbeRegistration {
    pub probe_id: i64,
    pub name: String,
    pub tenant_id: GlobalId,
    pub capabilities: Vec<String>,
}

/// A duration provider that supports reset (§3). The control loop resets it
/// on clean reconnect and on probe-unregistered recovery (§4.G).
pub trait BackoffState: Send {
    fn next(&mut self) -> Duration;
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_check(tenant: GlobalId, timeout_ms: u64, check_type: CheckType) -> Check {
        Check {
            id: "c1".into(),
            tenant_id: tenant,
            target: "example.com".into(),
            check_type,
            timeout_ms,
            frequency_ms: None,
            settings: CheckSettings(serde_json::json!({})),
        }
    }

    #[test]
    fn zero_tenant_id_is_invalid() {
        let check = sample_check(GlobalId { region: 0, local_id: 0 }, 1000, CheckType::Ping);
        assert!(matches!(
            check.validate(),
            Err(ProbeAgentError::InvalidAdHocRequest(_))
        ));
    }

    #[test]
    fn zero_timeout_is_invalid_for_script_based_types() {
        let check = sample_check(GlobalId { region: 1, local_id: 1 }, 0, CheckType::Scripted);
        assert!(check.validate().is_err());
    }

    #[test]
    fn zero_timeout_is_fine_for_non_script_types() {
        let check = sample_check(GlobalId { region: 1, local_id: 1 }, 0, CheckType::Ping);
        assert!(check.validate().is_ok());
    }

    #[test]
    fn run_response_invariant_detects_half_set_fields() {
        let r = RunResponse {
            metrics: vec![],
            logs: vec![],
            error: Some("set".into()),
            error_code: None,
        };
        assert!(r.violates_invariant());

        let ok = RunResponse {
            metrics: vec![],
            logs: vec![],
            error: None,
            error_code: None,
        };
        assert!(!ok.violates_invariant());
    }

    #[test]
    fn secret_store_requires_both_fields() {
        assert!(!SecretStore::default().is_configured());
        assert!(SecretStore {
            url: "https://secrets".into(),
            token: "tok".into()
        }
        .is_configured());
    }
}
