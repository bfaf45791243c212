//! Fix mode: a restricted re-entry into the phase state machine driven by QA
//! findings.
//!
//! The controller reuses the forward machinery with a narrowed dispatch
//! guard. Filesystem mutation is limited to the application subtree; the QA
//! artifact set and the project root are immutable; repositories cannot be
//! created and `Scaffold`/`Bootstrap` cannot be re-run.

use std::path::{Path, PathBuf};

use crate::config::SandboxSection;
use crate::errors::{GatewayError, OrchestratorError, TransitionError};
use crate::gateway::{DispatchGuard, FsAction, OperationRequest, RepoAction, ToolAction};
use crate::phase::{Phase, RunStage};
use crate::qa::QaRef;
use crate::sandbox::SandboxRoot;

use super::machine::PhaseStateMachine;
use super::state::PipelineRunState;

/// Dispatch guard applied to every request of a fix cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixModePolicy {
    app_subtree: PathBuf,
    qa_dir: PathBuf,
    qa_artifact: Option<PathBuf>,
    pinned: Option<QaRef>,
}

fn forbid(reason: impl Into<String>) -> GatewayError {
    GatewayError::ForbiddenInFixMode {
        reason: reason.into(),
    }
}

impl FixModePolicy {
    pub fn new(
        sandbox: &SandboxRoot,
        app_subtree: &Path,
        qa_dir: &Path,
        qa_artifact: Option<&Path>,
    ) -> Self {
        Self {
            app_subtree: sandbox.resolve(app_subtree),
            qa_dir: sandbox.resolve(qa_dir),
            qa_artifact: qa_artifact.map(|p| sandbox.resolve(p)),
            pinned: None,
        }
    }

    /// Require `qa` to keep its fingerprint through every phase of the cycle.
    pub fn pin_qa(mut self, qa: QaRef) -> Self {
        self.pinned = Some(qa);
        self
    }

    pub fn from_config(sandbox: &SandboxRoot, section: &SandboxSection, qa: &QaRef) -> Self {
        Self::new(
            sandbox,
            &section.app_subtree,
            &section.qa_dir,
            Some(qa.path.as_path()),
        )
        .pin_qa(qa.clone())
    }

    fn check_mutation(&self, sandbox: &SandboxRoot, path: &Path) -> Result<(), GatewayError> {
        let resolved = sandbox.resolve(path);
        if resolved == sandbox.path() {
            return Err(forbid("the project root cannot be deleted or renamed"));
        }
        let touches_qa = resolved.starts_with(&self.qa_dir)
            || self.qa_artifact.as_ref().is_some_and(|qa| qa == &resolved);
        if touches_qa {
            return Err(forbid(format!(
                "{} belongs to the QA artifact set",
                resolved.display()
            )));
        }
        if !resolved.starts_with(&self.app_subtree) {
            return Err(forbid(format!(
                "{} is outside the application subtree {}",
                resolved.display(),
                self.app_subtree.display()
            )));
        }
        Ok(())
    }
}

impl DispatchGuard for FixModePolicy {
    fn check(&self, request: &OperationRequest, sandbox: &SandboxRoot) -> Result<(), GatewayError> {
        if matches!(request.phase, Phase::Bootstrap | Phase::Scaffold) {
            return Err(forbid(format!(
                "{} operations cannot run in fix mode",
                request.phase
            )));
        }

        match &request.action {
            ToolAction::Filesystem(FsAction::Mkdir { path } | FsAction::Write { path, .. }) => {
                self.check_mutation(sandbox, path)
            }
            ToolAction::Filesystem(FsAction::Move { from, to }) => {
                if sandbox.resolve(from) == self.app_subtree {
                    return Err(forbid("the application subtree cannot be renamed"));
                }
                self.check_mutation(sandbox, from)?;
                self.check_mutation(sandbox, to)
            }
            ToolAction::Filesystem(_) | ToolAction::Execution(_) => Ok(()),
            ToolAction::RemoteRepo(RepoAction::CreateRepository { name }) => Err(forbid(format!(
                "creating repository {} is not permitted",
                name
            ))),
            ToolAction::RemoteRepo(_) => Ok(()),
        }
    }

    fn verify_phase(&self, phase: Phase) -> Result<(), GatewayError> {
        let Some(qa) = &self.pinned else {
            return Ok(());
        };
        match qa.verify() {
            Ok(true) => Ok(()),
            Ok(false) => Err(forbid(format!(
                "QA artifact {} changed during {}",
                qa.path.display(),
                phase
            ))),
            Err(e) => Err(forbid(format!(
                "QA artifact {} could not be verified after {}: {:#}",
                qa.path.display(),
                phase,
                e
            ))),
        }
    }
}

/// Drives fix cycles: `FixMode → UnitTest → SmokeTest → Revalidated`, then
/// `Publish` only on explicit re-dispatch.
pub struct FixModeController {
    machine: PhaseStateMachine,
    policy: FixModePolicy,
    qa: QaRef,
}

impl FixModeController {
    pub fn new(machine: PhaseStateMachine, policy: FixModePolicy, qa: QaRef) -> Self {
        Self {
            machine,
            policy,
            qa,
        }
    }

    pub fn machine(&self) -> &PhaseStateMachine {
        &self.machine
    }

    pub fn policy(&self) -> &FixModePolicy {
        &self.policy
    }

    /// Attach the QA reference and move the run into `FixMode`.
    ///
    /// On failure the state is left untouched.
    pub fn enter(&self, state: &mut PipelineRunState) -> Result<(), OrchestratorError> {
        let mut next = state.clone();
        next.qa = Some(self.qa.clone());
        next.fix_cycle = true;
        next.publish_dispatched = false;
        next.advance(RunStage::Active(Phase::FixMode))?;
        next.fix_cycles += 1;
        *state = next;
        tracing::info!(
            run = %state.run_id,
            findings = self.qa.findings,
            cycle = state.fix_cycles,
            "entered fix mode"
        );
        Ok(())
    }

    /// Run `phase` within fix mode.
    ///
    /// `FixMode` starts a cycle and runs it to `Revalidated`; `Publish` is the
    /// explicit re-dispatch after revalidation. Re-running `Scaffold` or
    /// `Bootstrap` fails with `ForbiddenInFixMode` without touching the state.
    pub async fn invoke(
        &self,
        state: &mut PipelineRunState,
        phase: Phase,
    ) -> Result<RunStage, OrchestratorError> {
        match phase {
            Phase::Bootstrap | Phase::Scaffold => {
                return Err(OrchestratorError::ForbiddenInFixMode {
                    reason: format!("{} cannot be re-run in fix mode", phase),
                });
            }
            _ if state.is_blocked() => return Err(TransitionError::RunBlocked.into()),
            Phase::FixMode => self.enter(state)?,
            Phase::Publish => {
                let mut next = state.clone();
                next.publish_dispatched = true;
                next.advance(RunStage::Active(Phase::Publish))?;
                *state = next;
                tracing::info!(run = %state.run_id, "publish re-dispatched after revalidation");
            }
            other => {
                return Err(TransitionError::Illegal {
                    from: state.stage,
                    to: RunStage::Active(other),
                }
                .into());
            }
        }

        self.machine.persist(state)?;
        self.machine.run(state, &self.policy).await
    }

    /// One full fix cycle, optionally followed by publishing the fixes.
    pub async fn run_cycle(
        &self,
        state: &mut PipelineRunState,
        publish: bool,
    ) -> Result<RunStage, OrchestratorError> {
        let stage = self.invoke(state, Phase::FixMode).await?;
        if publish && stage == RunStage::Revalidated {
            return self.invoke(state, Phase::Publish).await;
        }
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::PhaseStatus;
    use crate::errors::ErrorKind;
    use crate::gateway::{DispatchContext, ExecMode, RemoteRepoTool, RepoFile};
    use crate::orchestrator::agent::PlannedOperation;
    use crate::orchestrator::machine::tests::{TestAgent, exec, harness, write};
    use crate::orchestrator::state::StateManager;
    use crate::qa;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn sandbox() -> SandboxRoot {
        SandboxRoot::new("/work/shop").unwrap()
    }

    fn policy() -> FixModePolicy {
        FixModePolicy::new(
            &sandbox(),
            Path::new("codebase/src"),
            Path::new("codebase/tests/e2e"),
            Some(Path::new("qa/findings.json")),
        )
    }

    fn fs_request(action: FsAction) -> OperationRequest {
        OperationRequest::filesystem("op", Phase::FixMode, action)
    }

    fn kind(result: Result<(), GatewayError>) -> Option<ErrorKind> {
        result.err().map(|e| e.kind())
    }

    #[test]
    fn test_writes_limited_to_app_subtree() {
        let policy = policy();
        let sandbox = sandbox();
        let ok = fs_request(FsAction::Write {
            path: "codebase/src/pages/Cart.tsx".into(),
            content: String::new(),
        });
        assert!(policy.check(&ok, &sandbox).is_ok());

        for path in ["package.json", "codebase/tests/e2e/cart.spec.ts", "qa/findings.json"] {
            let req = fs_request(FsAction::Write {
                path: path.into(),
                content: String::new(),
            });
            assert_eq!(
                kind(policy.check(&req, &sandbox)),
                Some(ErrorKind::ForbiddenInFixMode),
                "{}",
                path
            );
        }
    }

    #[test]
    fn test_root_and_subtree_cannot_be_renamed() {
        let policy = policy();
        let sandbox = sandbox();
        for (from, to) in [(".", "../shop2"), ("codebase/src", "codebase/app")] {
            let req = fs_request(FsAction::Move {
                from: from.into(),
                to: to.into(),
            });
            assert!(policy.check(&req, &sandbox).is_err(), "{} -> {}", from, to);
        }
        let rename_file = fs_request(FsAction::Move {
            from: "codebase/src/a.ts".into(),
            to: "codebase/src/b.ts".into(),
        });
        assert!(policy.check(&rename_file, &sandbox).is_ok());
    }

    #[test]
    fn test_reads_exec_and_push_pass_create_repo_fails() {
        let policy = policy();
        let sandbox = sandbox();
        let read = fs_request(FsAction::Read {
            path: "codebase/tests/e2e/cart.spec.ts".into(),
        });
        assert!(policy.check(&read, &sandbox).is_ok());

        let test = OperationRequest::execution(
            "unit",
            Phase::UnitTest,
            "npx vitest run",
            ".",
            ExecMode::ReadOnly,
        );
        assert!(policy.check(&test, &sandbox).is_ok());

        let create = OperationRequest::remote(
            "create",
            Phase::FixMode,
            RepoAction::CreateRepository {
                name: "shop-v2".into(),
            },
        );
        assert_eq!(
            kind(policy.check(&create, &sandbox)),
            Some(ErrorKind::ForbiddenInFixMode)
        );
    }

    #[test]
    fn test_scaffold_labelled_requests_are_forbidden() {
        let req = OperationRequest::execution(
            "scaffold",
            Phase::Scaffold,
            "npm create vite@latest",
            ".",
            ExecMode::Network,
        );
        assert_eq!(
            kind(policy().check(&req, &sandbox())),
            Some(ErrorKind::ForbiddenInFixMode)
        );
    }

    #[tokio::test]
    async fn test_gateway_applies_policy_after_boundary_check() {
        let h = harness(TestAgent::default());
        let policy = policy();
        let ctx = DispatchContext {
            phase: Phase::FixMode,
            remote: None,
            guard: &policy,
        };
        let outside = fs_request(FsAction::Write {
            path: "../elsewhere.ts".into(),
            content: String::new(),
        });
        let err = h.machine.gateway().dispatch(&outside, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundary);
    }

    struct Fixture {
        controller: FixModeController,
        fs: std::sync::Arc<crate::gateway::memory::MemoryFilesystem>,
        qa_path: PathBuf,
        _qa_dir: TempDir,
        state_dir: TempDir,
    }

    async fn fixture(fix_ops: Vec<PlannedOperation>) -> Fixture {
        fixture_with(fix_ops, None).await
    }

    /// `edit_qa_in`: phase whose planning rewrites the QA file behind the
    /// gateway's back.
    async fn fixture_with(fix_ops: Vec<PlannedOperation>, edit_qa_in: Option<Phase>) -> Fixture {
        let qa_dir = TempDir::new().unwrap();
        let qa_path = qa_dir.path().join("qa.json");
        fs::write(
            &qa_path,
            r#"[{"id":"QA-1","description":"cart total wrong","severity":"high","reproductionSteps":["add two items"]}]"#,
        )
        .unwrap();

        let mut plans = HashMap::new();
        plans.insert(Phase::FixMode, fix_ops);
        plans.insert(
            Phase::UnitTest,
            vec![exec("unit", Phase::UnitTest, "npx vitest run")],
        );
        plans.insert(
            Phase::SmokeTest,
            vec![exec("smoke", Phase::SmokeTest, "npx playwright test")],
        );
        plans.insert(
            Phase::Publish,
            vec![PlannedOperation::new(OperationRequest::remote(
                "publish",
                Phase::Publish,
                RepoAction::PushFiles {
                    owner: "acme".into(),
                    repo: "shop".into(),
                    branch: "main".into(),
                    files: vec![RepoFile {
                        path: "codebase/src/pages/Cart.tsx".into(),
                        content: "fixed".into(),
                    }],
                    message: "fix: address QA findings".into(),
                },
            ))],
        );
        let on_plan: Option<Box<dyn Fn(Phase) + Send + Sync>> = edit_qa_in.map(|target| {
            let path = qa_path.clone();
            Box::new(move |phase: Phase| {
                if phase == target {
                    fs::write(&path, r#"[{"id":"QA-1","description":"resolved","severity":"low"}]"#)
                        .unwrap();
                }
            }) as Box<dyn Fn(Phase) + Send + Sync>
        });
        let h = harness(TestAgent {
            plans,
            on_plan,
            ..Default::default()
        });
        h.repo.create_repository("shop").await.unwrap();

        let (artifact, qa_ref) = qa::load(&qa_path).unwrap();
        let policy = FixModePolicy::new(
            h.machine.gateway().sandbox(),
            Path::new("codebase/src"),
            Path::new("codebase/tests/e2e"),
            Some(qa_ref.path.as_path()),
        )
        .pin_qa(qa_ref.clone());
        Fixture {
            controller: FixModeController::new(h.machine.with_qa(artifact), policy, qa_ref),
            fs: h.fs,
            qa_path,
            _qa_dir: qa_dir,
            state_dir: h.dir,
        }
    }

    async fn done_state(controller: &FixModeController) -> PipelineRunState {
        let mut state = PipelineRunState::new("shop");
        state.stage = RunStage::Done;
        state.remote = controller
            .machine()
            .gateway()
            .dispatch(
                &OperationRequest::remote(
                    "confirm",
                    Phase::Bootstrap,
                    RepoAction::ConfirmRepository {
                        owner: "acme".into(),
                        name: "shop".into(),
                    },
                ),
                &DispatchContext {
                    phase: Phase::Bootstrap,
                    remote: None,
                    guard: &crate::gateway::OpenGuard,
                },
            )
            .await
            .ok()
            .and_then(|r| match r {
                crate::gateway::OperationResult::Repository(remote) => Some(remote),
                _ => None,
            });
        assert!(state.remote.is_some());
        state
    }

    fn cart_fix() -> Vec<PlannedOperation> {
        vec![write(
            "fix-cart",
            Phase::FixMode,
            "codebase/src/pages/Cart.tsx",
            "export default function Cart() { return null; }\n",
        )]
    }

    #[tokio::test]
    async fn test_fix_cycle_revalidates_then_publishes_on_request() {
        let fx = fixture(cart_fix()).await;
        let mut state = done_state(&fx.controller).await;

        let stage = fx.controller.run_cycle(&mut state, false).await.unwrap();
        assert_eq!(stage, RunStage::Revalidated);
        assert_eq!(state.fix_cycles, 1);
        assert!(state.qa.is_some());
        assert!(fx.fs.file("/work/shop/codebase/src/pages/Cart.tsx").is_some());
        let tail: Vec<Phase> = state.visited_phases();
        assert_eq!(tail, vec![Phase::Bootstrap, Phase::FixMode, Phase::UnitTest, Phase::SmokeTest]);

        let stage = fx.controller.invoke(&mut state, Phase::Publish).await.unwrap();
        assert_eq!(stage, RunStage::Done);
        assert!(!state.fix_cycle);
        assert!(state.qa.is_none());

        let records = fx.controller.machine().audit().records().unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().take(3).all(|r| r.fix_cycle));
        assert!(records.iter().all(|r| r.status == PhaseStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_invoking_scaffold_leaves_state_unchanged() {
        let fx = fixture(cart_fix()).await;
        let mut state = done_state(&fx.controller).await;
        fx.controller.enter(&mut state).unwrap();
        let before = state.clone();

        let err = fx
            .controller
            .invoke(&mut state, Phase::Scaffold)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ForbiddenInFixMode));
        assert_eq!(state, before);
        assert_eq!(fx.fs.file_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_requires_revalidation() {
        let fx = fixture(cart_fix()).await;
        let mut state = done_state(&fx.controller).await;
        fx.controller.enter(&mut state).unwrap();
        let before = state.clone();

        let err = fx
            .controller
            .invoke(&mut state, Phase::Publish)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Transition(TransitionError::Illegal { .. })
        ));
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_writing_qa_tests_blocks_the_cycle() {
        let fx = fixture(vec![write(
            "weaken-test",
            Phase::FixMode,
            "codebase/tests/e2e/cart.spec.ts",
            "test.skip('cart', () => {});\n",
        )])
        .await;
        let mut state = done_state(&fx.controller).await;

        let stage = fx.controller.run_cycle(&mut state, true).await.unwrap();
        assert_eq!(stage, RunStage::Blocked);
        assert_eq!(
            state.blocked.as_ref().map(|b| b.error_kind),
            Some(ErrorKind::ForbiddenInFixMode)
        );
        assert_eq!(fx.fs.file_count(), 0);
        assert!(fs::read_to_string(&fx.qa_path).unwrap().contains("QA-1"));
    }

    #[tokio::test]
    async fn test_qa_edited_mid_cycle_blocks_before_revalidation() {
        let fx = fixture_with(cart_fix(), Some(Phase::UnitTest)).await;
        let mut state = done_state(&fx.controller).await;

        let stage = fx.controller.run_cycle(&mut state, true).await.unwrap();
        assert_eq!(stage, RunStage::Blocked);
        let report = state.blocked.clone().unwrap();
        assert_eq!(report.phase, Phase::UnitTest);
        assert_eq!(report.error_kind, ErrorKind::ForbiddenInFixMode);
        assert!(report.message.contains("changed during unit_test"));

        let saved = StateManager::new(fx.state_dir.path().join("state.json"))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(saved.stage, RunStage::Blocked);
        assert_eq!(
            fx.controller.machine().audit().blocked().unwrap(),
            Some(report)
        );

        let mut resumed = saved;
        let err = fx
            .controller
            .invoke(&mut resumed, Phase::Publish)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Transition(TransitionError::RunBlocked)
        ));
    }

    #[tokio::test]
    async fn test_enter_without_terminal_stage_fails() {
        let fx = fixture(cart_fix()).await;
        let mut state = PipelineRunState::new("shop");
        let before = state.clone();
        assert!(fx.controller.enter(&mut state).is_err());
        assert_eq!(state, before);
    }
}
