//! Changes control loop (§4.H): same state machine and reaction table as the
//! ad-hoc loop, but the message is a delta of additions/updates/deletions
//! applied to an in-memory check map. Deletions cancel in-flight runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::model::{BackoffState, Check, CheckSettings, GlobalId};
use crate::pb::{CheckMsg, ChangesMsg};
use crate::prober::factory::Dispatcher;

use super::adhoc::ProbeIdentity;
use super::transport::ControlPlaneTransport;
use super::{react, ControlSignal, OuterAction};

fn parse_check_type(tag: &str) -> Option<crate::model::CheckType> {
    use crate::model::CheckType::*;
    match tag {
        "ping" => Some(Ping),
        "http" => Some(Http),
        "dns" => Some(Dns),
        "tcp" => Some(Tcp),
        "traceroute" => Some(Traceroute),
        "scripted" => Some(Scripted),
        "browser" => Some(Browser),
        "multihttp" => Some(Multihttp),
        "grpc" => Some(Grpc),
        _ => None,
    }
}

fn decode_check(msg: CheckMsg) -> Result<Check, String> {
    let check_type = parse_check_type(&msg.check_type)
        .ok_or_else(|| format!("unknown check type tag {:?}", msg.check_type))?;
    let settings_json: serde_json::Value = msg
        .settings
        .map(|s| serde_json::from_slice(&s.json).unwrap_or(serde_json::Value::Null))
        .unwrap_or(serde_json::Value::Null);

    Ok(Check {
        id: msg.id,
        tenant_id: GlobalId { region: 0, local_id: msg.tenant_id },
        target: msg.target,
        check_type,
        timeout_ms: msg.timeout_ms as u64,
        frequency_ms: if msg.frequency_ms == 0 { None } else { Some(msg.frequency_ms as u64) },
        settings: CheckSettings(settings_json),
    })
}

/// The in-memory check set the changes loop maintains, keyed by check id.
/// In-flight runs for a deleted check are cancelled via their own
/// per-run cancellation token, stored alongside the check.
#[derive(Default)]
pub struct CheckTable {
    checks: Mutex<HashMap<String, (Check, CancellationToken)>>,
}

impl CheckTable {
    /// Applies one delta, creating each added/updated check's cancellation
    /// token as a child of `parent` so a disconnect or shutdown of the loop
    /// itself cancels every in-flight run along with it, not just per-check
    /// deletions. Returns the tokens alongside their checks so the caller can
    /// pass them into dispatch.
    pub fn apply_delta(
        &self,
        msg: ChangesMsg,
        parent: &CancellationToken,
    ) -> (Vec<(Check, CancellationToken)>, Vec<(Check, CancellationToken)>, usize) {
        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut table = self.checks.lock().unwrap();

        for raw in msg.additions {
            if let Ok(check) = decode_check(raw) {
                let token = parent.child_token();
                table.insert(check.id.clone(), (check.clone(), token.clone()));
                added.push((check, token));
            }
        }
        for raw in msg.updates {
            if let Ok(check) = decode_check(raw) {
                if let Some((_, old_token)) = table.remove(&check.id) {
                    old_token.cancel();
                }
                let token = parent.child_token();
                table.insert(check.id.clone(), (check.clone(), token.clone()));
                updated.push((check, token));
            }
        }
        let mut deleted = 0;
        for id in msg.deletions {
            if let Some((_, token)) = table.remove(&id) {
                token.cancel();
                deleted += 1;
            }
        }

        (added, updated, deleted)
    }
}

async fn run_once(
    endpoint: &str,
    identity: &ProbeIdentity,
    dispatcher: &Dispatcher,
    table: &CheckTable,
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

    let mut stream = transport.get_changes().await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(true),
            msg = stream.message() => match msg {
                Ok(Some(delta)) => {
                    let (added, updated, deleted) = table.apply_delta(delta, cancel);
                    tracing::info!(added = added.len(), updated = updated.len(), deleted, "applied check delta");
                    let name = probe_name.lock().unwrap().clone();
                    for (check, token) in added.into_iter().chain(updated.into_iter()) {
                        if check.validate().is_err() {
                            continue;
                        }
                        if let Err(e) = dispatcher.dispatch(check, registration.probe_id, name.clone(), None, token).await {
                            tracing::warn!(error = %e, "changes-loop dispatch failed");
                        }
                    }
                }
                Ok(None) => return Ok(false),
                Err(status) => return Err(status),
            },
        }
    }
}

/// Runs the changes control loop until the cancellation token fires or a
/// fatal signal is received (§4.H, sharing §4.G's classification table).
pub async fn run(
    endpoint: String,
    identity: ProbeIdentity,
    dispatcher: Dispatcher,
    table: Arc<CheckTable>,
    mut backoff: impl BackoffState,
    cancel: CancellationToken,
) {
    let probe_name = Arc::new(std::sync::Mutex::new(String::new()));

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let outcome = run_once(&endpoint, &identity, &dispatcher, &table, Arc::clone(&probe_name), &cancel).await;

        let action = match outcome {
            Ok(true) => return,
            Ok(false) => react(&ControlSignal::Other("eof".to_string()), || backoff.next()),
            Err(status) => react(&ControlSignal::from_status(&status), || backoff.next()),
        };

        match action {
            OuterAction::ExitCleanly => return,
            OuterAction::Fatal => {
                tracing::error!("changes control loop terminated fatally");
                return;
            }
            OuterAction::RetryImmediatelyWithBackoffReset => backoff.reset(),
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

    fn sample_check_msg(id: &str) -> CheckMsg {
        CheckMsg {
            id: id.to_string(),
            tenant_id: 1,
            target: "example.com".into(),
            check_type: "http".into(),
            timeout_ms: 1000,
            frequency_ms: 0,
            settings: None,
        }
    }

    #[test]
    fn additions_and_deletions_update_the_table() {
        let table = CheckTable::default();
        let parent = CancellationToken::new();
        let (added, _, _) = table.apply_delta(
            ChangesMsg {
                additions: vec![sample_check_msg("c1")],
                updates: vec![],
                deletions: vec![],
            },
            &parent,
        );
        assert_eq!(added.len(), 1);
        assert_eq!(table.checks.lock().unwrap().len(), 1);

        let (_, _, deleted) = table.apply_delta(
            ChangesMsg {
                additions: vec![],
                updates: vec![],
                deletions: vec!["c1".to_string()],
            },
            &parent,
        );
        assert_eq!(deleted, 1);
        assert!(table.checks.lock().unwrap().is_empty());
    }

    #[test]
    fn update_cancels_the_previous_token() {
        let table = CheckTable::default();
        let parent = CancellationToken::new();
        table.apply_delta(
            ChangesMsg {
                additions: vec![sample_check_msg("c1")],
                updates: vec![],
                deletions: vec![],
            },
            &parent,
        );
        let old_token = table.checks.lock().unwrap().get("c1").unwrap().1.clone();
        table.apply_delta(
            ChangesMsg {
                additions: vec![],
                updates: vec![sample_check_msg("c1")],
                deletions: vec![],
            },
            &parent,
        );
        assert!(old_token.is_cancelled());
    }

    #[test]
    fn cancelling_the_parent_cancels_every_child_token() {
        let table = CheckTable::default();
        let parent = CancellationToken::new();
        let (added, _, _) = table.apply_delta(
            ChangesMsg {
                additions: vec![sample_check_msg("c1")],
                updates: vec![],
                deletions: vec![],
            },
            &parent,
        );
        let (_, token) = &added[0];
        assert!(!token.is_cancelled());
        parent.cancel();
        assert!(token.is_cancelled());
    }
}
