//! Thin stand-in probers for the network-level check types (§4.F
//! "Probers in scope for this implementation"). These perform a bare
//! reachability check, not the full ICMP/DNS/TCP/HTTP algorithms, which
//! §1 puts out of scope as external collaborators.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::errors::ProbeAgentError;
use crate::model::{Check, CheckType};

use super::{Prober, ProbeOutcome};

async fn timed<F>(fut: F) -> (bool, Duration)
where
    F: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    let success = fut.await;
    (success, start.elapsed())
}

/// TCP connect reachability, used directly for `tcp` and as the underlying
/// primitive for `ping`/`traceroute` stand-ins (no raw sockets available
/// without elevated privileges, so ICMP echo is not attempted).
pub struct TcpReachabilityProber {
    check_type: CheckType,
}

impl TcpReachabilityProber {
    pub fn new(check_type: CheckType) -> Self {
        Self { check_type }
    }
}

#[async_trait]
impl Prober for TcpReachabilityProber {
    fn supports(&self, check_type: CheckType) -> bool {
        check_type == self.check_type
    }

    async fn run(&self, check: &Check) -> Result<ProbeOutcome, ProbeAgentError> {
        let target = check.target.clone();
        let (success, duration) = timed(async move { TcpStream::connect(&target).await.is_ok() }).await;
        Ok(ProbeOutcome { success, duration })
    }
}

/// Bare HTTP reachability: a GET that completes with any response is a
/// success, matching the "reachability, not algorithmic completeness" scope.
pub struct HttpReachabilityProber {
    client: reqwest::Client,
}

impl HttpReachabilityProber {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Prober for HttpReachabilityProber {
    fn supports(&self, check_type: CheckType) -> bool {
        check_type == CheckType::Http
    }

    async fn run(&self, check: &Check) -> Result<ProbeOutcome, ProbeAgentError> {
        let client = self.client.clone();
        let url = check.target.clone();
        let (success, duration) = timed(async move { client.get(&url).send().await.is_ok() }).await;
        Ok(ProbeOutcome { success, duration })
    }
}

/// DNS resolution reachability: any address resolving for the target name
/// counts as success.
pub struct DnsReachabilityProber;

#[async_trait]
impl Prober for DnsReachabilityProber {
    fn supports(&self, check_type: CheckType) -> bool {
        check_type == CheckType::Dns
    }

    async fn run(&self, check: &Check) -> Result<ProbeOutcome, ProbeAgentError> {
        let target = check.target.clone();
        let (success, duration) = timed(async move {
            tokio::net::lookup_host((target.as_str(), 0))
                .await
                .map(|mut it| it.next().is_some())
                .unwrap_or(false)
        })
        .await;
        Ok(ProbeOutcome { success, duration })
    }
}

/// gRPC reachability: a bare TCP connect to the target, since standing up a
/// health-check client per arbitrary target service is out of scope here.
pub struct GrpcReachabilityProber;

#[async_trait]
impl Prober for GrpcReachabilityProber {
    fn supports(&self, check_type: CheckType) -> bool {
        check_type == CheckType::Grpc
    }

    async fn run(&self, check: &Check) -> Result<ProbeOutcome, ProbeAgentError> {
        let target = check.target.clone();
        let (success, duration) = timed(async move { TcpStream::connect(&target).await.is_ok() }).await;
        Ok(ProbeOutcome { success, duration })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckSettings, GlobalId};

    fn sample_check(target: &str, check_type: CheckType) -> Check {
        Check {
            id: "c1".into(),
            tenant_id: GlobalId { region: 1, local_id: 1 },
            target: target.into(),
            check_type,
            timeout_ms: 1000,
            frequency_ms: None,
            settings: CheckSettings(serde_json::json!({})),
        }
    }

    #[tokio::test]
    async fn tcp_prober_fails_closed_on_unreachable_target() {
        let prober = TcpReachabilityProber::new(CheckType::Tcp);
        let check = sample_check("127.0.0.1:1", CheckType::Tcp);
        let outcome = prober.run(&check).await.unwrap();
        assert!(!outcome.success);
    }

    #[test]
    fn supports_matches_only_its_own_type() {
        let prober = TcpReachabilityProber::new(CheckType::Ping);
        assert!(prober.supports(CheckType::Ping));
        assert!(!prober.supports(CheckType::Tcp));
    }
}
