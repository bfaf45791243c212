//! The seam between the state machine and whatever decides *what* to do.
//!
//! The machine owns sequencing, policy and persistence; a [`PhaseAgent`]
//! only proposes operation requests. It plans each phase, diagnoses failed
//! operations, and proposes remediation for conformance violations.

use async_trait::async_trait;

use crate::architecture::{ArtifactSet, Violation};
use crate::gateway::{OperationRequest, RemoteRepoRef};
use crate::phase::Phase;
use crate::qa::QaArtifact;
use crate::retry::AttemptRecord;
use crate::sandbox::SandboxRoot;

/// An operation request plus the retry class that bounds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOperation {
    pub request: OperationRequest,
    pub class: Option<String>,
}

impl PlannedOperation {
    pub fn new(request: OperationRequest) -> Self {
        Self {
            request,
            class: None,
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }
}

/// A proposed fix: a description for the report and the operations applying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remediation {
    pub description: String,
    pub operations: Vec<OperationRequest>,
}

/// Read-only view of the run handed to the agent.
pub struct PhaseContext<'a> {
    pub phase: Phase,
    pub sandbox: &'a SandboxRoot,
    pub artifacts: &'a ArtifactSet,
    pub remote: Option<&'a RemoteRepoRef>,
    pub qa: Option<&'a QaArtifact>,
    pub fix_cycle: bool,
}

#[async_trait]
pub trait PhaseAgent: Send + Sync {
    /// Operations for `ctx.phase`, in submission order.
    async fn plan(&self, ctx: &PhaseContext<'_>) -> anyhow::Result<Vec<PlannedOperation>>;

    /// Propose a fix for a failed operation, or `None` to retry unchanged.
    async fn diagnose(
        &self,
        request: &OperationRequest,
        failure: &str,
        record: &AttemptRecord,
    ) -> anyhow::Result<Option<Remediation>>;

    /// Propose operations resolving `violations`; `pass` counts from 1.
    async fn remediate(
        &self,
        ctx: &PhaseContext<'_>,
        violations: &[Violation],
        pass: u32,
    ) -> anyhow::Result<Option<Remediation>>;
}
