//! Script runners (§4.C HTTP, §4.D local) and the shared backoff helper.

pub mod backoff;
pub mod http;
pub mod local;

use std::time::Instant;

use async_trait::async_trait;

use crate::errors::ProbeAgentError;
use crate::model::{RunResponse, Script, SecretStore};

/// An explicit outer deadline for one run, including every retry attempt.
/// §9 decision: no `Default` that picks a deadline — callers must supply one.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub deadline: Instant,
}

impl RunContext {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// A script runner: HTTP (§4.C) or local subprocess (§4.D).
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        script: &Script,
        secrets: &SecretStore,
        ctx: &RunContext,
    ) -> Result<RunResponse, ProbeAgentError>;
}
