//! Phase state machine.
//!
//! Drives a [`PipelineRunState`] through the phase sequence. For each phase it:
//!
//! 1. asks the agent for the phase's operations
//! 2. partitions them into batches and dispatches each batch concurrently,
//!    every operation under its own retry record
//! 3. snapshots the artifact set through the filesystem role
//! 4. from `Implement` onward, runs the conformance gate with a bounded
//!    number of remediation passes
//! 5. appends the phase outcome record and transitions
//!
//! Any unresolved failure moves the run to `Blocked`, raises the halt flag
//! and writes the blocked report. The machine is the only writer of the run
//! state; tools and the agent only see read-only views.

use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::agent::{PhaseAgent, PhaseContext, PlannedOperation};
use super::state::{PipelineRunState, StateManager};
use crate::architecture::{RuleSet, Violation};
use crate::audit::{AuditLogger, BlockedReport, PhaseOutcomeRecord, PhaseStatus, TestSummary};
use crate::config::PipelineToml;
use crate::errors::{ErrorKind, GatewayError, OrchestratorError, TransitionError};
use crate::gateway::{
    Capability, DispatchContext, DispatchGuard, ExecOutput, OperationRequest, OperationResult,
    ToolAction, ToolGateway,
};
use crate::phase::{Phase, RunStage};
use crate::qa::QaArtifact;
use crate::retry::{Attempt, AttemptError, AttemptRecord, HaltFlag, RetryOutcome, RetryPolicy};
use crate::sandbox::SandboxRoot;
use crate::util::truncate_output;

const FAILURE_EXCERPT_BYTES: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSettings {
    pub max_remediation_passes: u32,
    pub list_depth: usize,
}

impl MachineSettings {
    pub fn from_config(toml: &PipelineToml) -> Self {
        Self {
            max_remediation_passes: toml.architecture.max_remediation_passes,
            list_depth: toml.sandbox.list_depth,
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            max_remediation_passes: 2,
            list_depth: 12,
        }
    }
}

/// Result of executing a single phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseVerdict {
    Completed(PhaseOutcomeRecord),
    Blocked {
        record: PhaseOutcomeRecord,
        report: BlockedReport,
    },
}

/// Why a phase could not complete.
#[derive(Debug, Clone)]
struct BlockCause {
    kind: ErrorKind,
    message: String,
    failing_command: Option<String>,
    suspected_cause: Option<String>,
    fixes: Vec<String>,
    violations: Vec<Violation>,
}

impl BlockCause {
    fn rejected(request: &OperationRequest, err: &GatewayError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            failing_command: Some(request.action.describe()),
            suspected_cause: None,
            fixes: Vec::new(),
            violations: Vec::new(),
        }
    }

    fn simple(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            failing_command: None,
            suspected_cause: None,
            fixes: Vec::new(),
            violations: Vec::new(),
        }
    }
}

/// Accumulated facts of the phase being executed.
#[derive(Debug, Default)]
struct PhaseProgress {
    operations: Vec<AttemptRecord>,
    exec_outputs: Vec<ExecOutput>,
    remediations: Vec<String>,
    remediation_passes: u32,
    violations: Vec<Violation>,
}

struct Resolved {
    request: OperationRequest,
    record: AttemptRecord,
    outcome: RetryOutcome<OperationResult>,
}

/// One operation run through the gateway under the retry policy.
struct OperationAttempt<'a> {
    gateway: &'a ToolGateway,
    agent: &'a dyn PhaseAgent,
    request: &'a OperationRequest,
    ctx: DispatchContext<'a>,
}

fn exec_failure(command: &str, output: &ExecOutput) -> String {
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    format!(
        "`{}` exited with code {}: {}",
        command,
        output.exit_code,
        truncate_output(detail, FAILURE_EXCERPT_BYTES)
    )
}

#[async_trait]
impl Attempt for OperationAttempt<'_> {
    type Output = OperationResult;

    async fn run(&mut self) -> Result<OperationResult, AttemptError> {
        let result = self.gateway.dispatch(self.request, &self.ctx).await?;
        if let OperationResult::Exec(output) = &result
            && !output.succeeded()
            && let ToolAction::Execution(exec) = &self.request.action
        {
            return Err(AttemptError::Retryable(exec_failure(&exec.command, output)));
        }
        Ok(result)
    }

    async fn diagnose(
        &mut self,
        failure: &str,
        record: &AttemptRecord,
    ) -> Result<Option<String>, GatewayError> {
        let remediation = match self.agent.diagnose(self.request, failure, record).await {
            Ok(Some(remediation)) => remediation,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(operation = %self.request.id, error = %format!("{:#}", e), "diagnosis failed");
                return Ok(None);
            }
        };

        for op in &remediation.operations {
            match self.gateway.dispatch(op, &self.ctx).await {
                Ok(OperationResult::Exec(output)) if !output.succeeded() => {
                    return Ok(Some(format!(
                        "{} (fix step {} exited with code {})",
                        remediation.description, op.id, output.exit_code
                    )));
                }
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    return Ok(Some(format!(
                        "{} (fix step {} failed: {})",
                        remediation.description, op.id, err
                    )));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Some(remediation.description))
    }
}

/// Split operations into ordered batches that may each run concurrently.
///
/// Operations share a batch only when their tool roles are pairwise
/// distinct and their paths pairwise disjoint (neither contains the other).
/// Submission order is preserved: an operation that cannot join the open
/// batch closes it.
pub fn partition_batches(
    sandbox: &SandboxRoot,
    operations: Vec<PlannedOperation>,
) -> Vec<Vec<PlannedOperation>> {
    let mut batches: Vec<Vec<PlannedOperation>> = Vec::new();
    let mut current: Vec<PlannedOperation> = Vec::new();
    let mut roles: Vec<Capability> = Vec::new();
    let mut paths: Vec<PathBuf> = Vec::new();

    for op in operations {
        let role = op.request.action.role();
        let op_paths: Vec<PathBuf> = op
            .request
            .action
            .paths()
            .into_iter()
            .map(|p| sandbox.resolve(p))
            .collect();
        let overlaps = op_paths
            .iter()
            .any(|p| paths.iter().any(|q| p.starts_with(q) || q.starts_with(p)));

        if !current.is_empty() && (roles.contains(&role) || overlaps) {
            batches.push(std::mem::take(&mut current));
            roles.clear();
            paths.clear();
        }
        roles.push(role);
        paths.extend(op_paths);
        current.push(op);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

pub struct PhaseStateMachine {
    gateway: Arc<ToolGateway>,
    agent: Arc<dyn PhaseAgent>,
    retry: RetryPolicy,
    rules: RuleSet,
    audit: AuditLogger,
    store: StateManager,
    settings: MachineSettings,
    halt: HaltFlag,
    qa: Option<QaArtifact>,
}

impl PhaseStateMachine {
    pub fn new(
        gateway: Arc<ToolGateway>,
        agent: Arc<dyn PhaseAgent>,
        retry: RetryPolicy,
        rules: RuleSet,
        audit: AuditLogger,
        store: StateManager,
        settings: MachineSettings,
    ) -> Self {
        Self {
            gateway,
            agent,
            retry,
            rules,
            audit,
            store,
            settings,
            halt: HaltFlag::default(),
            qa: None,
        }
    }

    /// Attach the QA findings handed to the agent during fix cycles.
    pub fn with_qa(mut self, qa: QaArtifact) -> Self {
        self.qa = Some(qa);
        self
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn persist(&self, state: &PipelineRunState) -> Result<(), OrchestratorError> {
        self.store
            .save(state)
            .map_err(|source| OrchestratorError::StatePersist {
                path: self.store.path().to_path_buf(),
                source,
            })
    }

    /// Stage following a successful `phase`.
    pub fn next_stage(state: &PipelineRunState, phase: Phase) -> RunStage {
        match phase {
            Phase::Publish => RunStage::Done,
            Phase::SmokeTest if state.fix_cycle => RunStage::Revalidated,
            other => other
                .successor()
                .map(RunStage::Active)
                .unwrap_or(RunStage::Done),
        }
    }

    /// Run phases until the run comes to rest (`Done`, `Revalidated` or `Blocked`).
    pub async fn run(
        &self,
        state: &mut PipelineRunState,
        guard: &dyn DispatchGuard,
    ) -> Result<RunStage, OrchestratorError> {
        if state.is_blocked() || self.halt.is_halted() {
            return Err(TransitionError::RunBlocked.into());
        }

        while let RunStage::Active(phase) = state.stage {
            tracing::info!(run = %state.run_id, phase = %phase, fix_cycle = state.fix_cycle, "phase started");
            match self.execute_phase(state, phase, guard).await {
                PhaseVerdict::Completed(record) => {
                    self.audit
                        .append(&record)
                        .map_err(OrchestratorError::Audit)?;
                    let next = Self::next_stage(state, phase);
                    state.advance(next)?;
                    if next == RunStage::Done {
                        state.fix_cycle = false;
                        state.publish_dispatched = false;
                        state.qa = None;
                    }
                    tracing::info!(phase = %phase, attempts = record.attempts, "phase succeeded");
                }
                PhaseVerdict::Blocked { record, report } => {
                    self.halt.halt();
                    tracing::error!(
                        phase = %phase,
                        kind = %report.error_kind,
                        message = %report.message,
                        "run blocked"
                    );
                    state.blocked = Some(report.clone());
                    state.advance(RunStage::Blocked)?;
                    self.persist(state)?;

                    let appended = self.audit.append(&record);
                    let written = self.audit.write_blocked(&report);
                    appended.and(written).map_err(OrchestratorError::Audit)?;
                    break;
                }
            }
            self.persist(state)?;
        }

        Ok(state.stage)
    }

    /// Execute one phase without transitioning.
    pub async fn execute_phase(
        &self,
        state: &mut PipelineRunState,
        phase: Phase,
        guard: &dyn DispatchGuard,
    ) -> PhaseVerdict {
        let mut progress = PhaseProgress::default();
        let outcome = match self.drive_phase(state, phase, guard, &mut progress).await {
            Ok(()) => guard
                .verify_phase(phase)
                .map_err(|e| BlockCause::simple(e.kind(), e.to_string())),
            Err(cause) => Err(cause),
        };

        let mut record = PhaseOutcomeRecord::new(state.run_id, phase, PhaseStatus::Succeeded);
        record.fix_cycle = state.fix_cycle;
        record.attempts = progress.operations.iter().map(|r| r.attempts).sum();
        record.remediation_passes = progress.remediation_passes;
        if phase.is_verification() {
            record.test_summary = summarize(&progress.exec_outputs);
        }

        match outcome {
            Ok(()) => {
                record.operations = progress.operations;
                PhaseVerdict::Completed(record)
            }
            Err(cause) => {
                record.status = PhaseStatus::Blocked;
                record.error = Some(cause.kind);
                record.violations = cause.violations.clone();
                record.operations = progress.operations;

                let mut report =
                    BlockedReport::new(state.run_id, phase, cause.kind, cause.message);
                report.failing_command = cause.failing_command;
                report.suspected_cause = cause.suspected_cause;
                report.fixes_attempted = cause.fixes;
                report.remediations = progress.remediations;
                report.violations = cause.violations;
                PhaseVerdict::Blocked { record, report }
            }
        }
    }

    async fn drive_phase(
        &self,
        state: &mut PipelineRunState,
        phase: Phase,
        guard: &dyn DispatchGuard,
        progress: &mut PhaseProgress,
    ) -> Result<(), BlockCause> {
        let planned = {
            let ctx = self.context(state, phase);
            self.agent.plan(&ctx).await
        }
        .map_err(|e| BlockCause::simple(ErrorKind::PlanningFailed, format!("{:#}", e)))?;
        tracing::debug!(phase = %phase, operations = planned.len(), "phase planned");

        self.run_operations(state, phase, planned, guard, progress)
            .await?;
        self.snapshot(state, phase, guard).await?;

        if !phase.checks_architecture() {
            return Ok(());
        }

        let mut violations = self.rules.evaluate(&state.artifacts);
        while !violations.is_empty() {
            if progress.remediation_passes >= self.settings.max_remediation_passes {
                break;
            }
            let pass = progress.remediation_passes + 1;
            tracing::warn!(phase = %phase, pass, violations = violations.len(), "conformance violations, remediating");

            let remediation = {
                let ctx = self.context(state, phase);
                self.agent.remediate(&ctx, &violations, pass).await
            };
            let remediation = match remediation {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(phase = %phase, error = %format!("{:#}", e), "remediation proposal failed");
                    break;
                }
            };
            progress.remediation_passes = pass;
            progress.remediations.push(remediation.description.clone());

            let ops = remediation
                .operations
                .into_iter()
                .map(PlannedOperation::new)
                .collect();
            self.run_operations(state, phase, ops, guard, progress)
                .await?;
            self.snapshot(state, phase, guard).await?;
            violations = self.rules.evaluate(&state.artifacts);
        }

        progress.violations = violations.clone();
        if violations.is_empty() {
            return Ok(());
        }
        Err(BlockCause {
            kind: ErrorKind::ArchitectureViolation,
            message: format!(
                "{} conformance violation(s) remain after {} remediation pass(es)",
                violations.len(),
                progress.remediation_passes
            ),
            failing_command: None,
            suspected_cause: violations.first().map(|v| v.to_string()),
            fixes: Vec::new(),
            violations,
        })
    }

    fn context<'a>(&'a self, state: &'a PipelineRunState, phase: Phase) -> PhaseContext<'a> {
        PhaseContext {
            phase,
            sandbox: self.gateway.sandbox(),
            artifacts: &state.artifacts,
            remote: state.remote.as_ref(),
            qa: if state.fix_cycle { self.qa.as_ref() } else { None },
            fix_cycle: state.fix_cycle,
        }
    }

    async fn run_operations(
        &self,
        state: &mut PipelineRunState,
        phase: Phase,
        operations: Vec<PlannedOperation>,
        guard: &dyn DispatchGuard,
        progress: &mut PhaseProgress,
    ) -> Result<(), BlockCause> {
        for batch in partition_batches(self.gateway.sandbox(), operations) {
            let remote = state.remote.clone();
            let ctx = DispatchContext {
                phase,
                remote: remote.as_ref(),
                guard,
            };
            let resolved = join_all(batch.into_iter().map(|op| self.run_operation(op, ctx))).await;

            let mut cause: Option<BlockCause> = None;
            let mut halted = false;
            for Resolved {
                request,
                record,
                outcome,
            } in resolved
            {
                match outcome {
                    RetryOutcome::Succeeded(result) => {
                        Self::apply_result(state, progress, result);
                    }
                    RetryOutcome::ExhaustedRetries { last_failure } => {
                        cause.get_or_insert_with(|| BlockCause {
                            kind: ErrorKind::ExhaustedRetries,
                            message: format!(
                                "operation {} failed {} time(s)",
                                request.id, record.attempts
                            ),
                            failing_command: Some(request.action.describe()),
                            suspected_cause: Some(last_failure),
                            fixes: record.fixes_attempted.clone(),
                            violations: Vec::new(),
                        });
                    }
                    RetryOutcome::Rejected(err) => {
                        cause.get_or_insert_with(|| {
                            let mut c = BlockCause::rejected(&request, &err);
                            c.fixes = record.fixes_attempted.clone();
                            c
                        });
                    }
                    RetryOutcome::Halted => halted = true,
                }
                progress.operations.push(record);
            }

            if let Some(cause) = cause {
                return Err(cause);
            }
            if halted {
                return Err(BlockCause::simple(
                    ErrorKind::ToolFailure,
                    "run halted while operations were in flight",
                ));
            }
        }
        Ok(())
    }

    async fn run_operation(&self, op: PlannedOperation, ctx: DispatchContext<'_>) -> Resolved {
        let mut record = self.retry.record(&op.request.id, op.class.as_deref());
        let outcome = {
            let mut attempt = OperationAttempt {
                gateway: &self.gateway,
                agent: self.agent.as_ref(),
                request: &op.request,
                ctx,
            };
            self.retry
                .execute(&mut record, &mut attempt, &self.halt)
                .await
        };
        if matches!(
            outcome,
            RetryOutcome::ExhaustedRetries { .. } | RetryOutcome::Rejected(_)
        ) {
            // Stop sibling operations still retrying in this batch.
            self.halt.halt();
        }
        Resolved {
            request: op.request,
            record,
            outcome,
        }
    }

    fn apply_result(
        state: &mut PipelineRunState,
        progress: &mut PhaseProgress,
        result: OperationResult,
    ) {
        match result {
            OperationResult::Repository(remote) => {
                tracing::info!(repo = %remote.slug(), "remote repository confirmed");
                state.remote = Some(remote);
            }
            OperationResult::Exec(output) => progress.exec_outputs.push(output),
            _ => {}
        }
    }

    async fn snapshot(
        &self,
        state: &mut PipelineRunState,
        phase: Phase,
        guard: &dyn DispatchGuard,
    ) -> Result<(), BlockCause> {
        if !phase.permits(Capability::Filesystem) {
            return Ok(());
        }
        let ctx = DispatchContext {
            phase,
            remote: state.remote.as_ref(),
            guard,
        };
        let artifacts = self
            .gateway
            .collect_artifacts(self.settings.list_depth, &ctx)
            .await
            .map_err(|e| {
                let mut cause = BlockCause::simple(e.kind(), e.to_string());
                cause.failing_command = Some("snapshot artifact set".to_string());
                cause
            })?;
        state.artifacts = artifacts;
        Ok(())
    }
}

fn summarize(outputs: &[ExecOutput]) -> Option<TestSummary> {
    outputs
        .iter()
        .filter_map(|o| TestSummary::parse(&format!("{}\n{}", o.stdout, o.stderr)))
        .reduce(|a, b| TestSummary {
            total: a.total + b.total,
            passed: a.passed + b.passed,
            failed: a.failed + b.failed,
        })
}
