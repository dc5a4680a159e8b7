//! Control-stream loop (§4.G) and changes loop (§4.H): long-lived
//! connect/register/consume state machines against the upstream control
//! plane, with backoff-governed reconnect.
//!
//! Modeled as a `tonic`/`prost` gRPC service, following the `GrpcClient`
//! pattern: a `Streaming<T>` receive half plus request construction against
//! a `tonic::transport::Channel`.

pub mod adhoc;
pub mod backoff;
pub mod changes;
pub mod transport;

use tonic::Status;

/// The outer loop's classification of why the inner loop stopped (§4.G
/// reaction table). `transport::classify` is the only place a `tonic::Status`
/// gets turned into one of these — everything downstream matches on the enum,
/// never on a status code or message string again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Inner loop ended with no error (parent cancelled, or EOF — see
    /// `DESIGN.md` Open Question decision #1).
    Clean,
    NotAuthorized,
    IncompatibleApi,
    TransportClosing,
    Cancelled,
    ProbeUnregistered,
    Other(String),
}

impl ControlSignal {
    pub fn from_status(status: &Status) -> Self {
        match status.code() {
            tonic::Code::PermissionDenied => ControlSignal::NotAuthorized,
            tonic::Code::Unimplemented => ControlSignal::IncompatibleApi,
            tonic::Code::Canceled => ControlSignal::Cancelled,
            _ if status.message() == "transport is closing" => ControlSignal::TransportClosing,
            _ if status.message() == "probe unregistered" => ControlSignal::ProbeUnregistered,
            _ => ControlSignal::Other(status.message().to_string()),
        }
    }
}

/// What the outer loop does in response to one `ControlSignal` (§4.G table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OuterAction {
    ExitCleanly,
    Fatal,
    RetryImmediatelyWithBackoffReset,
    SleepThenRetry(std::time::Duration),
    SleepOneMinuteInterruptibleThenRetryWithBackoffReset,
}

pub fn react(
    signal: &ControlSignal,
    next_backoff: impl FnOnce() -> std::time::Duration,
) -> OuterAction {
    match signal {
        ControlSignal::Clean => OuterAction::ExitCleanly,
        ControlSignal::NotAuthorized | ControlSignal::IncompatibleApi => OuterAction::Fatal,
        ControlSignal::TransportClosing => OuterAction::RetryImmediatelyWithBackoffReset,
        ControlSignal::Cancelled => OuterAction::ExitCleanly,
        ControlSignal::ProbeUnregistered => {
            OuterAction::SleepOneMinuteInterruptibleThenRetryWithBackoffReset
        }
        ControlSignal::Other(_) => OuterAction::SleepThenRetry(next_backoff()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_is_fatal() {
        let status = Status::permission_denied("nope");
        assert_eq!(ControlSignal::from_status(&status), ControlSignal::NotAuthorized);
        assert_eq!(react(&ControlSignal::NotAuthorized, || std::time::Duration::ZERO), OuterAction::Fatal);
    }

    #[test]
    fn transport_closing_resets_and_retries_immediately() {
        let status = Status::unknown("transport is closing");
        assert_eq!(ControlSignal::from_status(&status), ControlSignal::TransportClosing);
        assert_eq!(
            react(&ControlSignal::TransportClosing, || std::time::Duration::from_secs(9)),
            OuterAction::RetryImmediatelyWithBackoffReset
        );
    }

    #[test]
    fn other_sleeps_for_the_next_backoff_value() {
        let status = Status::internal("boom");
        let signal = ControlSignal::from_status(&status);
        assert_eq!(signal, ControlSignal::Other("boom".to_string()));
        assert_eq!(
            react(&signal, || std::time::Duration::from_millis(250)),
            OuterAction::SleepThenRetry(std::time::Duration::from_millis(250))
        );
    }

    #[test]
    fn cancelled_status_exits_cleanly() {
        let status = Status::cancelled("bye");
        assert_eq!(ControlSignal::from_status(&status), ControlSignal::Cancelled);
        assert_eq!(react(&ControlSignal::Cancelled, || std::time::Duration::ZERO), OuterAction::ExitCleanly);
    }
}
