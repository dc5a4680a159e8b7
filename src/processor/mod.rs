//! Processor (§4.E): orchestrates one runner invocation, enforces the
//! error/errorCode invariant, drives extraction, decides success.
//!
//! Grounded on `main.rs`'s `execute_step_with_retry` orchestration shape
//! (invoke, branch on result, decide outcome), generalized from step-retry
//! to run-interpretation.

use std::time::Duration;

use prometheus::Registry;

use crate::errors::{ErrorKind, ProbeAgentError};
use crate::extractor::{fan_out, logfmt::decode_logfmt, CheckResultCollector, DurationCollector, GenericCollector};
use crate::model::{RunResponse, Script, SecretStore};
use crate::runner::{RunContext, Runner};

/// Outcome of processing one run.
pub struct ProcessedRun {
    pub success: bool,
    pub duration: Option<Duration>,
    /// Set when `errorCode` names a kind outside the user-attributable set
    /// (§4.E step 6) — surfaced for upstream logging, not treated as a
    /// processor failure.
    pub unknown_error: Option<ProbeAgentError>,
    /// Latched by the check-result collector; consumed by the prober
    /// dispatcher (§4.F) when assembling `probe_checks_total`-derived gauges.
    pub check_failure: bool,
}

pub async fn process(
    runner: &dyn Runner,
    script: &Script,
    secrets: &SecretStore,
    ctx: &RunContext,
    registry: &Registry,
    log_sink: &mut impl FnMut(crate::extractor::logfmt::DecodedLine),
) -> Result<ProcessedRun, ProbeAgentError> {
    let response: RunResponse = runner.run(script, secrets, ctx).await?;

    if response.violates_invariant() {
        return Err(ProbeAgentError::BuggyRunner {
            error: response.error.clone(),
            error_code: response.error_code.clone(),
        });
    }

    // Step 3: the diagnostic log emission for a non-empty errorCode is
    // deferred until after script logs have been forwarded below, so the
    // error summary reads last in the stream.
    let diagnostic = response
        .error_code
        .as_ref()
        .filter(|c| !c.is_empty())
        .map(|c| (c.clone(), response.error.clone().unwrap_or_default()));

    let logs_result = decode_logfmt(&response.logs, |line| log_sink(line));
    if let Err(e) = logs_result {
        let partial = e.forwarded;
        return Err(ProbeAgentError::LogsDecode {
            partial,
            source: anyhow::anyhow!(e),
        });
    }

    if let Some((code, message)) = diagnostic {
        log_sink(crate::extractor::logfmt::DecodedLine {
            fields: Default::default(),
            record: crate::errors::LogRecord {
                level: Some("error".to_string()),
                source: None,
                msg: Some(format!("run reported errorCode={code}: {message}")),
            },
        });
    }

    let mut generic = GenericCollector::default();
    let mut check_result = CheckResultCollector::default();
    let mut duration = DurationCollector::default();
    fan_out(
        &response.metrics,
        &mut [&mut generic, &mut check_result, &mut duration],
    )
    .map_err(|e| ProbeAgentError::MetricsDecode(e.to_string()))?;

    // §4.E step 5: register the generic collector's samples as an
    // unchecked gauge vec so cardinality survives without pre-declared
    // descriptors.
    for sample in &generic.samples {
        let label_pairs: Vec<(&str, &str)> = sample
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let opts = prometheus::Opts::new(sample.name.clone(), "generic probe sample");
        if let Ok(gauge) = prometheus::GaugeVec::new(
            opts,
            &label_pairs.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
        ) {
            let values: Vec<&str> = label_pairs.iter().map(|(_, v)| *v).collect();
            if let Ok(metric) = gauge.get_metric_with_label_values(&values) {
                metric.set(sample.value);
            }
            let _ = registry.register(Box::new(gauge));
        }
    }

    let error_code = response.error_code.clone().unwrap_or_default();
    let kind = ErrorKind::parse(&error_code).unwrap_or(ErrorKind::Unknown);

    let (success, unknown_error) = if error_code.is_empty() {
        (true, None)
    } else if kind.is_user_attributable() {
        (false, None)
    } else {
        (
            false,
            Some(ProbeAgentError::RunnerReportedError {
                code: error_code.clone(),
                message: response.error.clone().unwrap_or_default(),
            }),
        )
    };

    Ok(ProcessedRun {
        success,
        duration: duration.duration,
        unknown_error,
        check_failure: check_result.failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckType, GlobalId};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Instant;

    struct FixedRunner(RunResponse);

    #[async_trait]
    impl Runner for FixedRunner {
        async fn run(
            &self,
            _script: &Script,
            _secrets: &SecretStore,
            _ctx: &RunContext,
        ) -> Result<RunResponse, ProbeAgentError> {
            Ok(self.0.clone())
        }
    }

    fn sample_script() -> Script {
        Script {
            payload: vec![],
            timeout: Duration::from_secs(1),
            check_id: "c1".into(),
            tenant_id: GlobalId { region: 1, local_id: 1 },
            region: 1,
            created: Utc::now(),
            modified: Utc::now(),
            check_type: CheckType::Scripted,
        }
    }

    fn ctx() -> RunContext {
        RunContext::with_deadline(Instant::now() + Duration::from_secs(5))
    }

    #[tokio::test]
    async fn empty_error_code_is_success() {
        let runner = FixedRunner(RunResponse {
            metrics: b"probe_script_duration_seconds 1.5\n".to_vec(),
            logs: vec![],
            error: None,
            error_code: None,
        });
        let registry = Registry::new();
        let mut sink = |_| {};
        let result = process(&runner, &sample_script(), &SecretStore::default(), &ctx(), &registry, &mut sink)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.duration, Some(Duration::from_secs_f64(1.5)));
    }

    #[tokio::test]
    async fn user_attributable_error_code_is_failure_without_surfaced_error() {
        let runner = FixedRunner(RunResponse {
            metrics: vec![],
            logs: vec![],
            error: Some("boom".into()),
            error_code: Some("timeout".into()),
        });
        let registry = Registry::new();
        let mut sink = |_| {};
        let result = process(&runner, &sample_script(), &SecretStore::default(), &ctx(), &registry, &mut sink)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.unknown_error.is_none());
    }

    #[tokio::test]
    async fn unknown_error_code_is_surfaced() {
        let runner = FixedRunner(RunResponse {
            metrics: vec![],
            logs: vec![],
            error: Some("weird".into()),
            error_code: Some("something_else".into()),
        });
        let registry = Registry::new();
        let mut sink = |_| {};
        let result = process(&runner, &sample_script(), &SecretStore::default(), &ctx(), &registry, &mut sink)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(matches!(
            result.unknown_error,
            Some(ProbeAgentError::RunnerReportedError { .. })
        ));
    }

    #[tokio::test]
    async fn logs_decode_error_reports_the_true_forwarded_count() {
        let runner = FixedRunner(RunResponse {
            metrics: vec![],
            logs: b"level=info msg=ok\nthis is \x07not valid logfmt \x07at all\n".to_vec(),
            error: None,
            error_code: None,
        });
        let registry = Registry::new();
        let mut sink = |_| {};
        let err = process(&runner, &sample_script(), &SecretStore::default(), &ctx(), &registry, &mut sink)
            .await
            .unwrap_err();
        match err {
            ProbeAgentError::LogsDecode { partial, .. } => assert_eq!(partial, 1),
            other => panic!("expected LogsDecode, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invariant_violation_is_buggy_runner_error() {
        let runner = FixedRunner(RunResponse {
            metrics: vec![],
            logs: vec![],
            error: Some("set".into()),
            error_code: None,
        });
        let registry = Registry::new();
        let mut sink = |_| {};
        let err = process(&runner, &sample_script(), &SecretStore::default(), &ctx(), &registry, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeAgentError::BuggyRunner { .. }));
    }
}
