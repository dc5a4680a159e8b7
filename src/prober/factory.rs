//! Prober factory & dispatch (§4.F).
//!
//! The per-request spawn here mirrors `planner::DagPlanner`'s
//! `Arc::clone`-into-task idiom, minus the `JoinSet`/semaphore/dependency
//! bookkeeping: dispatch has no DAG to schedule against, so each run is
//! simply handed to its own `tokio::spawn` and forgotten.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::errors::ProbeAgentError;
use crate::limits::{validate_tenant_concurrency, TenantLimits};
use crate::model::{Check, CheckType, GlobalId, Script, SecretStore, Tenant};
use crate::processor;
use crate::runner::{RunContext, Runner};

use super::network::{DnsReachabilityProber, GrpcReachabilityProber, HttpReachabilityProber, TcpReachabilityProber};
use super::{Prober, RunPayload};

/// Canonical reserved header name injected for HTTP-shaped checks (§4.F):
/// user-supplied headers with this name (any case) are dropped in favor of
/// the factory's own value.
pub const RESERVED_PROBE_ID_HEADER: &str = "x-probe-id";

/// Builds the reserved-header map for an http/multihttp check, folding in
/// whatever the check's settings already declare under `headers` minus any
/// entry whose canonical (lowercased) name collides with the reserved one.
pub fn injected_headers(check: &Check, probe_id: i64) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = check
        .settings
        .0
        .get("headers")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.to_ascii_lowercase(), s.to_string())))
                .filter(|(k, _)| k != RESERVED_PROBE_ID_HEADER)
                .collect()
        })
        .unwrap_or_default();

    headers.insert(
        RESERVED_PROBE_ID_HEADER.to_string(),
        format!("{}-{}", check.id, probe_id),
    );
    headers
}

/// Selects and owns the probers available for dispatch. Construction fails
/// (`unsupported_check_type`) for any check type with no prober registered.
pub struct ProberFactory {
    script_runner: Arc<dyn Runner>,
    network: Vec<Arc<dyn Prober>>,
    script_grace: Duration,
}

impl ProberFactory {
    pub fn new(script_runner: Arc<dyn Runner>, script_grace: Duration) -> Self {
        Self {
            script_runner,
            network: vec![
                Arc::new(TcpReachabilityProber::new(CheckType::Tcp)),
                Arc::new(TcpReachabilityProber::new(CheckType::Ping)),
                Arc::new(TcpReachabilityProber::new(CheckType::Traceroute)),
                Arc::new(HttpReachabilityProber::new(reqwest::Client::new())),
                Arc::new(DnsReachabilityProber),
                Arc::new(GrpcReachabilityProber),
            ],
            script_grace,
        }
    }

    fn network_prober(&self, check_type: CheckType) -> Option<Arc<dyn Prober>> {
        self.network.iter().find(|p| p.supports(check_type)).cloned()
    }

    pub fn supports(&self, check_type: CheckType) -> bool {
        check_type.is_script_based() || self.network_prober(check_type).is_some()
    }
}

/// Counts dispatched runs by check-type tag (§4.F step 1). A plain
/// `Mutex<HashMap<..>>`, same shared-state idiom `DagPlanner` uses for its
/// `completed`/`failed` node sets.
#[derive(Default)]
pub struct OpsCounters(Mutex<HashMap<&'static str, u64>>);

impl OpsCounters {
    pub async fn increment(&self, check_type: CheckType) {
        let mut guard = self.0.lock().await;
        *guard.entry(check_type.as_str()).or_insert(0) += 1;
    }

    pub async fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.0.lock().await.clone()
    }
}

/// Per-process dispatcher state: factory, counters, the secrets used for
/// script runs, and the channel the assembled payloads are published on.
pub struct Dispatcher {
    factory: Arc<ProberFactory>,
    ops: Arc<OpsCounters>,
    secrets: SecretStore,
    payloads: mpsc::Sender<RunPayload>,
    tenants: mpsc::Sender<Tenant>,
    in_flight: Arc<Mutex<HashMap<GlobalId, usize>>>,
    tenant_limits: TenantLimits,
}

impl Dispatcher {
    pub fn new(
        factory: Arc<ProberFactory>,
        secrets: SecretStore,
        payloads: mpsc::Sender<RunPayload>,
        tenants: mpsc::Sender<Tenant>,
    ) -> Self {
        Self {
            factory,
            ops: Arc::new(OpsCounters::default()),
            secrets,
            payloads,
            tenants,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            tenant_limits: TenantLimits::default(),
        }
    }

    pub async fn ops_snapshot(&self) -> HashMap<&'static str, u64> {
        self.ops.snapshot().await
    }

    /// Dispatches one request (§4.F steps 1-5). Identical for the ad-hoc and
    /// scheduled paths; lifecycle (cancel-on-delete) is the changes loop's
    /// concern, layered on top of this via `cancel`: deletion cancels the
    /// token, which aborts the spawned run's `tokio::select!` if it is still
    /// in flight.
    pub async fn dispatch(
        &self,
        check: Check,
        probe_id: i64,
        probe_name: String,
        tenant_refresh: Option<Tenant>,
        cancel: CancellationToken,
    ) -> Result<(), ProbeAgentError> {
        check.validate()?;

        if !self.factory.supports(check.check_type) {
            return Err(ProbeAgentError::InvalidAdHocRequest("unsupported check type"));
        }

        {
            let mut guard = self.in_flight.lock().await;
            let current = *guard.get(&check.tenant_id).unwrap_or(&0);
            if let Err(violation) = validate_tenant_concurrency(current + 1, &self.tenant_limits) {
                tracing::warn!(
                    tenant.region = check.tenant_id.region,
                    tenant.local_id = check.tenant_id.local_id,
                    error = %violation.message,
                    "rejecting dispatch: tenant concurrency limit exceeded"
                );
                return Err(ProbeAgentError::InvalidAdHocRequest("tenant concurrency limit exceeded"));
            }
            *guard.entry(check.tenant_id).or_insert(0) += 1;
        }

        self.ops.increment(check.check_type).await;

        if let Some(tenant) = tenant_refresh {
            let _ = self.tenants.send(tenant).await;
        }

        let timeout = if check.check_type.is_script_based() {
            check.timeout() + self.factory.script_grace
        } else {
            check.timeout()
        };

        let factory = Arc::clone(&self.factory);
        let payloads = self.payloads.clone();
        let secrets = self.secrets.clone();
        let probe_name_owned = probe_name;
        let in_flight = Arc::clone(&self.in_flight);
        let tenant_id = check.tenant_id;

        tokio::spawn(async move {
            tokio::select! {
                payload = run_one(&factory, &check, probe_id, &probe_name_owned, timeout, &secrets) => {
                    match payload {
                        Ok(payload) => {
                            let _ = payloads.try_send(payload);
                        }
                        Err(e) => {
                            tracing::warn!(check.id = %check.id, error = %e, "dispatched run failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!(check.id = %check.id, "in-flight run cancelled (check deleted or updated)");
                }
            }

            let mut guard = in_flight.lock().await;
            if let Some(count) = guard.get_mut(&tenant_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    guard.remove(&tenant_id);
                }
            }
        });

        Ok(())
    }
}

async fn run_one(
    factory: &ProberFactory,
    check: &Check,
    probe_id: i64,
    probe_name: &str,
    timeout: Duration,
    secrets: &SecretStore,
) -> Result<RunPayload, ProbeAgentError> {
    let registry = Registry::new();
    let success_gauge = prometheus::Gauge::new("probe_success", "1 if the probe succeeded, 0 otherwise")
        .map_err(|e| ProbeAgentError::MetricsDecode(e.to_string()))?;
    let duration_gauge = prometheus::Gauge::new("probe_duration_seconds", "duration of the probe run in seconds")
        .map_err(|e| ProbeAgentError::MetricsDecode(e.to_string()))?;
    registry
        .register(Box::new(success_gauge.clone()))
        .map_err(|e| ProbeAgentError::MetricsDecode(e.to_string()))?;
    registry
        .register(Box::new(duration_gauge.clone()))
        .map_err(|e| ProbeAgentError::MetricsDecode(e.to_string()))?;

    let ctx = RunContext::with_deadline(Instant::now() + timeout);
    let mut log_lines: Vec<String> = Vec::new();

    let (success, duration) = if check.check_type.is_script_based() {
        let script = Script {
            payload: serde_json::to_vec(&check.settings.0).unwrap_or_default(),
            timeout: check.timeout(),
            check_id: check.id.clone(),
            tenant_id: check.tenant_id,
            region: check.tenant_id.region,
            created: chrono::Utc::now(),
            modified: chrono::Utc::now(),
            check_type: check.check_type,
        };
        let mut sink = |line: crate::extractor::logfmt::DecodedLine| {
            if let Some(msg) = line.record.msg {
                log_lines.push(msg);
            }
        };
        let processed = processor::process(
            factory_script_runner(factory),
            &script,
            secrets,
            &ctx,
            &registry,
            &mut sink,
        )
        .await?;
        (processed.success, processed.duration.unwrap_or_default())
    } else {
        let prober = factory
            .network_prober(check.check_type)
            .ok_or(ProbeAgentError::InvalidAdHocRequest("unsupported check type"))?;
        let outcome = prober.run(check).await?;
        (outcome.success, outcome.duration)
    };

    success_gauge.set(if success { 1.0 } else { 0.0 });
    duration_gauge.set(duration.as_secs_f64());

    log_lines.push("ad-hoc check done".to_string());

    let metric_families = registry.gather();
    let mut encoded = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut encoded)
        .map_err(|e| ProbeAgentError::MetricsDecode(e.to_string()))?;

    let log_line = serde_json::json!({
        "id": check.id,
        "target": check.target,
        "probe": probe_id,
        "check_name": probe_name,
        "logs": log_lines,
        "series": String::from_utf8_lossy(&encoded),
    })
    .to_string();

    Ok(RunPayload {
        tenant_id: check.tenant_id,
        metric_families,
        log_line,
    })
}

fn factory_script_runner(factory: &ProberFactory) -> &dyn Runner {
    factory.script_runner.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckSettings, RunResponse};
    use async_trait::async_trait;

    fn sample_check(check_type: CheckType, headers: serde_json::Value) -> Check {
        Check {
            id: "c1".into(),
            tenant_id: GlobalId { region: 1, local_id: 1 },
            target: "example.com".into(),
            check_type,
            timeout_ms: 1000,
            frequency_ms: None,
            settings: CheckSettings(serde_json::json!({ "headers": headers })),
        }
    }

    /// A script runner that never resolves on its own, so tests can prove a
    /// dispatched run is actually aborted by cancellation rather than just
    /// finishing quickly.
    struct StallingRunner;

    #[async_trait]
    impl Runner for StallingRunner {
        async fn run(&self, _script: &Script, _secrets: &SecretStore, _ctx: &RunContext) -> Result<RunResponse, ProbeAgentError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(RunResponse {
                metrics: vec![],
                logs: vec![],
                error: None,
                error_code: None,
            })
        }
    }

    #[test]
    fn reserved_header_overrides_user_supplied_value() {
        let check = sample_check(
            CheckType::Http,
            serde_json::json!({ "X-Probe-Id": "user-supplied", "Accept": "text/plain" }),
        );
        let headers = injected_headers(&check, 42);
        assert_eq!(headers.get(RESERVED_PROBE_ID_HEADER), Some(&"c1-42".to_string()));
        assert_eq!(headers.get("accept"), Some(&"text/plain".to_string()));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn factory_supports_every_declared_check_type_except_unregistered_ones() {
        let factory = ProberFactory::new(
            Arc::new(crate::runner::local::LocalRunner::new("k6", crate::limits::OutputCaps::default())),
            Duration::from_secs(1),
        );
        for t in [
            CheckType::Ping,
            CheckType::Http,
            CheckType::Dns,
            CheckType::Tcp,
            CheckType::Traceroute,
            CheckType::Scripted,
            CheckType::Browser,
            CheckType::Multihttp,
            CheckType::Grpc,
        ] {
            assert!(factory.supports(t), "expected support for {t:?}");
        }
    }

    fn test_dispatcher(
        runner: Arc<dyn Runner>,
    ) -> (Dispatcher, mpsc::Receiver<RunPayload>, mpsc::Receiver<Tenant>) {
        let factory = Arc::new(ProberFactory::new(runner, Duration::from_secs(1)));
        let (payload_tx, payload_rx) = mpsc::channel(8);
        let (tenant_tx, tenant_rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(factory, SecretStore::default(), payload_tx, tenant_tx);
        (dispatcher, payload_rx, tenant_rx)
    }

    struct ImmediateRunner;

    #[async_trait]
    impl Runner for ImmediateRunner {
        async fn run(&self, _script: &Script, _secrets: &SecretStore, _ctx: &RunContext) -> Result<RunResponse, ProbeAgentError> {
            Ok(RunResponse {
                metrics: vec![],
                logs: vec![],
                error: None,
                error_code: None,
            })
        }
    }

    #[tokio::test]
    async fn completed_ad_hoc_run_logs_the_completion_message() {
        let (dispatcher, mut payload_rx, _tenant_rx) = test_dispatcher(Arc::new(ImmediateRunner));
        let check = sample_check(CheckType::Scripted, serde_json::json!({}));
        dispatcher
            .dispatch(check, 1, "probe-1".to_string(), None, CancellationToken::new())
            .await
            .unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(1), payload_rx.recv())
            .await
            .expect("dispatch did not complete in time")
            .expect("payload channel closed");
        assert!(payload.log_line.contains("ad-hoc check done"));
    }

    #[tokio::test]
    async fn deleting_a_check_cancels_its_in_flight_run() {
        let (dispatcher, mut payload_rx, _tenant_rx) = test_dispatcher(Arc::new(StallingRunner));
        let check = sample_check(CheckType::Scripted, serde_json::json!({}));
        let token = CancellationToken::new();
        dispatcher
            .dispatch(check, 1, "probe-1".to_string(), None, token.clone())
            .await
            .unwrap();

        token.cancel();

        let received = tokio::time::timeout(Duration::from_millis(200), payload_rx.recv()).await;
        assert!(
            received.is_err(),
            "cancelled run must not publish a payload"
        );
    }

    #[tokio::test]
    async fn dispatch_rejects_a_run_once_the_tenant_concurrency_limit_is_exceeded() {
        let (mut dispatcher, _payload_rx, _tenant_rx) = test_dispatcher(Arc::new(StallingRunner));
        dispatcher.tenant_limits = TenantLimits { max_concurrent_runs: 1 };

        let first = sample_check(CheckType::Scripted, serde_json::json!({}));
        dispatcher
            .dispatch(first, 1, "probe-1".to_string(), None, CancellationToken::new())
            .await
            .unwrap();

        let second = sample_check(CheckType::Scripted, serde_json::json!({}));
        let err = dispatcher
            .dispatch(second, 1, "probe-1".to_string(), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeAgentError::InvalidAdHocRequest(_)));
    }
}
