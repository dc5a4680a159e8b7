//! Ad-hoc control-stream loop (§4.G): `Connect → Register → Consume → Disconnect`,
//! reconnecting per the outer reaction table in `control::react`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::model::{AdHocRequest, BackoffState, CheckSettings, CheckType, GlobalId, Tenant};
use crate::pb::AdHocRequestMsg;
use crate::prober::factory::Dispatcher;

use super::transport::ControlPlaneTransport;
use super::{react, ControlSignal, OuterAction};

/// Build metadata submitted on the registration handshake (§4.G).
pub struct ProbeIdentity {
    pub version: String,
    pub commit: String,
    pub buildstamp: String,
    pub supports_protocol_secrets: bool,
}

fn parse_check_type(tag: &str) -> Option<CheckType> {
    match tag {
        "ping" => Some(CheckType::Ping),
        "http" => Some(CheckType::Http),
        "dns" => Some(CheckType::Dns),
        "tcp" => Some(CheckType::Tcp),
        "traceroute" => Some(CheckType::Traceroute),
        "scripted" => Some(CheckType::Scripted),
        "browser" => Some(CheckType::Browser),
        "multihttp" => Some(CheckType::Multihttp),
        "grpc" => Some(CheckType::Grpc),
        _ => None,
    }
}

fn decode_request(msg: AdHocRequestMsg) -> Result<AdHocRequest, String> {
    let check_msg = msg.check.ok_or("ad-hoc request missing check")?;
    let check_type = parse_check_type(&check_msg.check_type)
        .ok_or_else(|| format!("unknown check type tag {:?}", check_msg.check_type))?;
    let settings_json: serde_json::Value = check_msg
        .settings
        .map(|s| serde_json::from_slice(&s.json).unwrap_or(serde_json::Value::Null))
        .unwrap_or(serde_json::Value::Null);

    let check = crate::model::Check {
        id: check_msg.id,
        tenant_id: GlobalId {
            region: 0,
            local_id: check_msg.tenant_id,
        },
        target: check_msg.target,
        check_type,
        timeout_ms: check_msg.timeout_ms as u64,
        frequency_ms: if check_msg.frequency_ms == 0 {
            None
        } else {
            Some(check_msg.frequency_ms as u64)
        },
        settings: CheckSettings(settings_json),
    };

    let adhoc_id = uuid::Uuid::parse_str(&msg.adhoc_id).unwrap_or_else(|_| uuid::Uuid::nil());
    let tenant = msg.has_tenant.then(|| {
        let t = msg.tenant.unwrap_or(crate::pb::Tenant {
            id: 0,
            stack_id: String::new(),
        });
        Tenant {
            id: GlobalId { region: 0, local_id: t.id },
            stack_id: t.stack_id,
        }
    });

    Ok(AdHocRequest { adhoc_id, check, tenant })
}

/// One connect/register/consume attempt. Returns `Ok(true)` when the parent
/// cancelled (outer loop should exit cleanly), `Ok(false)` on graceful
/// end-of-stream (EOF — see `DESIGN.md` Open Question decision #1, handled
/// by the *caller* as a backoff-and-retry case, not folded in here), or
/// `Err` on a transport-level status.
async fn run_once(
    endpoint: &str,
    identity: &ProbeIdentity,
    dispatcher: &Dispatcher,
    probe_name: Arc<std::sync::Mutex<String>>,
    cancel: &CancellationToken,
) -> Result<bool, Status> {
    let mut transport = ControlPlaneTransport::connect(endpoint.to_string())
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;

    let registration = transport
        .register(
            identity.version.clone(),
            identity.commit.clone(),
            identity.buildstamp.clone(),
            identity.supports_protocol_secrets,
        )
        .await?;
    *probe_name.lock().unwrap() = registration.name.clone();

    let mut stream = transport.get_ad_hoc_checks().await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(true),
            msg = stream.message() => match msg {
                Ok(Some(raw)) => {
                    match decode_request(raw) {
                        Ok(request) => {
                            if let Err(e) = request.validate() {
                                tracing::warn!(error = %e, "rejected invalid ad-hoc request");
                                continue;
                            }
                            let name = probe_name.lock().unwrap().clone();
                            if let Err(e) = dispatcher
                                .dispatch(request.check, registration.probe_id, name, request.tenant, cancel.child_token())
                                .await
                            {
                                tracing::warn!(error = %e, "ad-hoc dispatch failed");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to decode ad-hoc request"),
                    }
                }
                Ok(None) => return Ok(false),
                Err(status) => return Err(status),
            },
        }
    }
}

/// Runs the ad-hoc control-stream loop until the cancellation token fires or
/// a fatal signal is received (§4.G).
pub async fn run(
    endpoint: String,
    identity: ProbeIdentity,
    dispatcher: Dispatcher,
    mut backoff: impl BackoffState,
    cancel: CancellationToken,
) {
    let probe_name = Arc::new(std::sync::Mutex::new(String::new()));

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let outcome = run_once(&endpoint, &identity, &dispatcher, Arc::clone(&probe_name), &cancel).await;

        let action = match outcome {
            Ok(true) => return,
            Ok(false) => react(&ControlSignal::Other("eof".to_string()), || backoff.next()),
            Err(status) => react(&ControlSignal::from_status(&status), || backoff.next()),
        };

        match action {
            OuterAction::ExitCleanly => return,
            OuterAction::Fatal => {
                tracing::error!("ad-hoc control loop terminated fatally");
                return;
            }
            OuterAction::RetryImmediatelyWithBackoffReset => {
                backoff.reset();
            }
            OuterAction::SleepThenRetry(wait) => {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            OuterAction::SleepOneMinuteInterruptibleThenRetryWithBackoffReset => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    _ = cancel.cancelled() => return,
                }
                backoff.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_check_type_tags() {
        assert_eq!(parse_check_type("http"), Some(CheckType::Http));
        assert_eq!(parse_check_type("nonsense"), None);
    }

    #[test]
    fn decode_rejects_missing_check() {
        let msg = AdHocRequestMsg {
            adhoc_id: uuid::Uuid::nil().to_string(),
            check: None,
            tenant: None,
            has_tenant: false,
        };
        assert!(decode_request(msg).is_err());
    }
}
