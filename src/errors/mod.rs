//! Error taxonomy for script runs, and the structured error type used at
//! the orchestration seams (control loop, processor, dispatcher).
//!
//! The six-value taxonomy below and the ordered classification rules are the
//! core of §4.A: callers never invent a seventh bucket, and the order the
//! rules are checked in is itself part of the contract (a log line that
//! matches both the "stacktrace" and "killed" heuristics is `aborted`, not
//! `killed`, because the log scan runs before the exit-code check).

use std::fmt;

use thiserror::Error;

/// One of the six buckets a script run can land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    None,
    Failed,
    Timeout,
    Killed,
    Aborted,
    Unknown,
}

impl ErrorKind {
    /// The wire representation used in `RunResponse.error_code`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "",
            ErrorKind::Failed => "failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Killed => "killed",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Parses a wire error code, accepting the legacy `"user"` alias for
    /// `aborted` (§9 "Legacy errorCode alias") but never producing it.
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "" => Some(ErrorKind::None),
            "failed" => Some(ErrorKind::Failed),
            "timeout" => Some(ErrorKind::Timeout),
            "killed" => Some(ErrorKind::Killed),
            "aborted" | "user" => Some(ErrorKind::Aborted),
            "unknown" => Some(ErrorKind::Unknown),
            _ => None,
        }
    }

    /// Whether this kind is attributable to the user's script rather than
    /// the runner infrastructure (§4.A, §4.D step 8, §7's processor rule).
    pub fn is_user_attributable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Killed | ErrorKind::Failed | ErrorKind::Aborted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The signal a subprocess invocation produced, as seen by the classifier.
/// `exit_code` is `None` when the process was killed by a signal before it
/// could exit normally (mirrored here rather than folded into a sentinel
/// value, since "no exit code" and "exit code 0" are different things).
#[derive(Debug, Clone, Copy)]
pub struct ExitSignal {
    pub exit_code: Option<i32>,
}

/// A decoded logfmt record, enough of it for the classifier's log scan.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Option<String>,
    pub source: Option<String>,
    pub msg: Option<String>,
}

/// The narrower "user-attributable" test used at §4.D step 8 to decide
/// whether to surface raw stdout/stderr/logs back to the caller: exactly
/// context-deadline-exceeded or a subprocess exit code < 127. This is a
/// different set from `ErrorKind::is_user_attributable` — that one covers
/// the post-log-scan bucket (`Timeout`/`Killed`/`Failed`/`Aborted`), which
/// folds in log-heuristic matches and high exit codes (`Killed`, code ≥ 128)
/// that step 8 must not treat as user-attributable. Computed directly from
/// the raw signals so a log-scan match never leaks into this decision.
pub fn user_attributable_for_raw_output(ctx_deadline_exceeded: bool, exit: Option<ExitSignal>) -> bool {
    ctx_deadline_exceeded || exit.and_then(|e| e.exit_code).is_some_and(|code| code < 127)
}

/// Applies the ordered rules of §4.A and returns the resulting bucket.
///
/// `ctx_deadline_exceeded` models "context error is a deadline", `exit`
/// models the subprocess signal (absent for non-subprocess runners, in which
/// case rule 5/6 never fire and classification falls through to `unknown`
/// unless an earlier rule matched), and `logs` is the already-decoded (or
/// partially decoded) log stream.
pub fn classify(
    had_error: bool,
    ctx_deadline_exceeded: bool,
    logs: &[LogRecord],
    exit: Option<ExitSignal>,
) -> ErrorKind {
    if !had_error {
        return ErrorKind::None;
    }
    if ctx_deadline_exceeded {
        return ErrorKind::Timeout;
    }
    if logs.iter().any(|r| {
        r.level.as_deref() == Some("error") && r.source.as_deref() == Some("stacktrace")
    }) {
        return ErrorKind::Aborted;
    }
    if logs.iter().any(|r| {
        r.level.as_deref() == Some("error")
            && r.msg
                .as_deref()
                .is_some_and(|m| m.starts_with("Uncaught (in promise)"))
    }) {
        return ErrorKind::Failed;
    }
    if let Some(signal) = exit {
        match signal.exit_code {
            Some(code) if code >= 128 => return ErrorKind::Killed,
            Some(code) if code < 127 => return ErrorKind::Aborted,
            _ => {}
        }
    }
    ErrorKind::Unknown
}

/// Errors surfaced upward per §7's table. Distinct variants matter: callers
/// match on these rather than stringly-typed messages (e.g. the control loop
/// treats `NotAuthorized`/`IncompatibleApi` as fatal, everything else as
/// reconnect-worthy).
#[derive(Debug, Error)]
pub enum ProbeAgentError {
    #[error("probe registration was not authorized")]
    NotAuthorized,

    #[error("control plane reported an incompatible API version")]
    IncompatibleApi,

    #[error("runner violated the error/errorCode invariant: error={error:?} errorCode={error_code:?}")]
    BuggyRunner {
        error: Option<String>,
        error_code: Option<String>,
    },

    #[error("runner reported error code {code}: {message}")]
    RunnerReportedError { code: String, message: String },

    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("metrics decode failed: {0}")]
    MetricsDecode(String),

    #[error("logs decode failed after {partial} record(s) forwarded: {source}")]
    LogsDecode {
        partial: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid ad-hoc request: {0}")]
    InvalidAdHocRequest(&'static str),

    #[error("script runner transport failed after retries: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_error_is_none() {
        assert_eq!(classify(false, false, &[], None), ErrorKind::None);
    }

    #[test]
    fn deadline_exceeded_wins_over_everything_else() {
        let logs = vec![LogRecord {
            level: Some("error".into()),
            source: Some("stacktrace".into()),
            msg: None,
        }];
        assert_eq!(
            classify(true, true, &logs, Some(ExitSignal { exit_code: Some(200) })),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn stacktrace_log_wins_over_exit_code() {
        let logs = vec![LogRecord {
            level: Some("error".into()),
            source: Some("stacktrace".into()),
            msg: None,
        }];
        assert_eq!(
            classify(true, false, &logs, Some(ExitSignal { exit_code: Some(200) })),
            ErrorKind::Aborted
        );
    }

    #[test]
    fn uncaught_promise_is_failed() {
        let logs = vec![LogRecord {
            level: Some("error".into()),
            source: None,
            msg: Some("Uncaught (in promise) TypeError".into()),
        }];
        assert_eq!(classify(true, false, &logs, None), ErrorKind::Failed);
    }

    #[test]
    fn high_exit_code_is_killed() {
        assert_eq!(
            classify(true, false, &[], Some(ExitSignal { exit_code: Some(137) })),
            ErrorKind::Killed
        );
    }

    #[test]
    fn low_exit_code_is_aborted() {
        assert_eq!(
            classify(true, false, &[], Some(ExitSignal { exit_code: Some(1) })),
            ErrorKind::Aborted
        );
    }

    #[test]
    fn exit_code_127_falls_through_to_unknown() {
        assert_eq!(
            classify(true, false, &[], Some(ExitSignal { exit_code: Some(127) })),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn no_exit_signal_and_no_log_match_is_unknown() {
        assert_eq!(classify(true, false, &[], None), ErrorKind::Unknown);
    }

    #[test]
    fn legacy_user_alias_parses_as_aborted_but_never_emits() {
        assert_eq!(ErrorKind::parse("user"), Some(ErrorKind::Aborted));
        assert_eq!(ErrorKind::Aborted.as_str(), "aborted");
    }

    #[test]
    fn user_attributable_matches_the_six_bucket_taxonomy() {
        assert!(ErrorKind::Timeout.is_user_attributable());
        assert!(ErrorKind::Killed.is_user_attributable());
        assert!(ErrorKind::Failed.is_user_attributable());
        assert!(ErrorKind::Aborted.is_user_attributable());
        assert!(!ErrorKind::Unknown.is_user_attributable());
        assert!(!ErrorKind::None.is_user_attributable());
    }

    #[test]
    fn raw_output_attributability_excludes_high_exit_code() {
        // Killed (code >= 128) is user-attributable under the 6-bucket
        // taxonomy but must NOT count for the raw-output decision.
        assert!(!user_attributable_for_raw_output(false, Some(ExitSignal { exit_code: Some(137) })));
        assert!(user_attributable_for_raw_output(false, Some(ExitSignal { exit_code: Some(1) })));
        assert!(user_attributable_for_raw_output(true, Some(ExitSignal { exit_code: Some(137) })));
        assert!(!user_attributable_for_raw_output(false, None));
    }
}
