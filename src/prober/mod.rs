//! Prober trait and factory/dispatch (§4.F).
//!
//! `Prober::supports`/`Prober::run` follow the same can-it-handle-this /
//! run-it shape used elsewhere for per-request-kind dispatch; every check
//! is spawned independently since §4.F dispatch has no dependency graph.

pub mod factory;
pub mod network;

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ProbeAgentError;
use crate::model::{Check, CheckType};

/// Outcome of one probe run: the two gauges every check type produces
/// regardless of implementation (§4.F step 4).
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub success: bool,
    pub duration: Duration,
}

#[async_trait]
pub trait Prober: Send + Sync {
    fn supports(&self, check_type: CheckType) -> bool;

    async fn run(&self, check: &Check) -> Result<ProbeOutcome, ProbeAgentError>;
}

/// A fully assembled per-run payload (§4.F step 5): metric series plus log
/// streams plus the owning tenant, ready for the publisher.
#[derive(Debug, Clone)]
pub struct RunPayload {
    pub tenant_id: crate::model::GlobalId,
    pub metric_families: Vec<prometheus::proto::MetricFamily>,
    pub log_line: String,
}
