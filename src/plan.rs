//! Declarative pipeline plans and the agent that replays them.
//!
//! A plan is a TOML file listing, per phase, the steps to dispatch, plus the
//! fixes to try when a step fails and the remediation passes to offer when
//! the conformance checker reports violations:
//!
//! ```toml
//! project = "Shop Front"
//!
//! [[phases.scaffold]]
//! id = "install"
//! kind = "exec"
//! command = "npm install"
//! network = true
//! class = "install"
//! fixes = [{ description = "clear npm cache", steps = [{ id = "cache", kind = "exec", command = "npm cache clean --force" }] }]
//!
//! [[remediation]]
//! description = "move data access into services/"
//! steps = [{ id = "app", kind = "write", path = "codebase/src/App.tsx", content = "..." }]
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::architecture::Violation;
use crate::gateway::{ExecMode, FsAction, OperationRequest, RepoAction, RepoFile};
use crate::orchestrator::{PhaseAgent, PhaseContext, PlannedOperation, Remediation};
use crate::phase::Phase;
use crate::retry::AttemptRecord;
use crate::util::slugify;

fn current_dir() -> PathBuf {
    PathBuf::from(".")
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Mkdir {
        path: PathBuf,
    },
    Write {
        path: PathBuf,
        content: String,
    },
    Move {
        from: PathBuf,
        to: PathBuf,
    },
    Read {
        path: PathBuf,
    },
    Search {
        pattern: String,
        #[serde(default = "current_dir")]
        root: PathBuf,
    },
    Exec {
        command: String,
        #[serde(default = "current_dir")]
        cwd: PathBuf,
        /// Whether the command needs network access (installs, scaffolding).
        #[serde(default)]
        network: bool,
    },
    /// Create the project repository; the name defaults to the project slug.
    CreateRepo {
        #[serde(default)]
        name: Option<String>,
    },
    /// Confirm an existing repository.
    ConfirmRepo {
        #[serde(default)]
        owner: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    /// Push `files` plus the snapshot files matching `include` to the
    /// confirmed repository.
    Push {
        #[serde(default)]
        include: Vec<String>,
        #[serde(default)]
        files: Vec<RepoFile>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        branch: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    /// Retry class; selects a bound override from `[retry.classes]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Fixes tried in order after each failed attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixes: Vec<PlanFix>,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFix {
    pub description: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSteps {
    #[serde(default)]
    pub bootstrap: Vec<PlanStep>,
    #[serde(default)]
    pub scaffold: Vec<PlanStep>,
    #[serde(default)]
    pub implement: Vec<PlanStep>,
    #[serde(default)]
    pub unit_test: Vec<PlanStep>,
    #[serde(default)]
    pub smoke_test: Vec<PlanStep>,
    #[serde(default)]
    pub publish: Vec<PlanStep>,
    #[serde(default)]
    pub fix_mode: Vec<PlanStep>,
}

impl PhaseSteps {
    pub fn get(&self, phase: Phase) -> &[PlanStep] {
        match phase {
            Phase::Bootstrap => &self.bootstrap,
            Phase::Scaffold => &self.scaffold,
            Phase::Implement => &self.implement,
            Phase::UnitTest => &self.unit_test,
            Phase::SmokeTest => &self.smoke_test,
            Phase::Publish => &self.publish,
            Phase::FixMode => &self.fix_mode,
        }
    }
}

/// A remediation pass offered to the conformance gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationPass {
    pub description: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
    /// Human-readable project name; the repository name is its slug.
    pub project: String,
    #[serde(default)]
    pub phases: PhaseSteps,
    #[serde(default)]
    pub remediation: Vec<RemediationPass>,
}

impl PipelinePlan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid plan {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let plan: PipelinePlan = toml::from_str(content).context("Failed to parse plan")?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn slug(&self) -> String {
        slugify(&self.project)
    }

    /// Step ids must be unique within a phase so diagnosis finds the right fixes.
    fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            anyhow::bail!("plan has no project name");
        }
        for phase in Phase::FORWARD.iter().chain([Phase::FixMode].iter()) {
            let mut seen = std::collections::HashSet::new();
            for step in self.phases.get(*phase) {
                if !seen.insert(step.id.as_str()) {
                    anyhow::bail!("duplicate step id '{}' in phase {}", step.id, phase);
                }
                for include in step_includes(step) {
                    Pattern::new(include)
                        .with_context(|| format!("Invalid include glob '{}' in step {}", include, step.id))?;
                }
            }
        }
        Ok(())
    }

    fn find_step(&self, phase: Phase, id: &str) -> Option<&PlanStep> {
        self.phases.get(phase).iter().find(|s| s.id == id)
    }
}

fn step_includes(step: &PlanStep) -> &[String] {
    match &step.action {
        StepAction::Push { include, .. } => include.as_slice(),
        _ => &[],
    }
}

const INCLUDE_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Repository facts a step needs to become a request.
struct RepoTarget<'a> {
    owner: Option<&'a str>,
    name: String,
    branch: &'a str,
}

/// A [`PhaseAgent`] replaying a [`PipelinePlan`].
pub struct ScriptedAgent {
    plan: PipelinePlan,
    owner: Option<String>,
    branch: String,
}

impl ScriptedAgent {
    pub fn new(plan: PipelinePlan, owner: Option<String>, branch: impl Into<String>) -> Self {
        Self {
            plan,
            owner,
            branch: branch.into(),
        }
    }

    fn target<'a>(&'a self, ctx: Option<&'a PhaseContext<'_>>) -> RepoTarget<'a> {
        match ctx.and_then(|c| c.remote) {
            Some(remote) => RepoTarget {
                owner: Some(remote.owner.as_str()),
                name: remote.name.clone(),
                branch: &self.branch,
            },
            None => RepoTarget {
                owner: self.owner.as_deref(),
                name: self.plan.slug(),
                branch: &self.branch,
            },
        }
    }

    fn request(
        &self,
        step: &PlanStep,
        phase: Phase,
        ctx: Option<&PhaseContext<'_>>,
    ) -> Result<OperationRequest> {
        let id = step.id.clone();
        let request = match &step.action {
            StepAction::Mkdir { path } => {
                OperationRequest::filesystem(id, phase, FsAction::Mkdir { path: path.clone() })
            }
            StepAction::Write { path, content } => OperationRequest::filesystem(
                id,
                phase,
                FsAction::Write {
                    path: path.clone(),
                    content: content.clone(),
                },
            ),
            StepAction::Move { from, to } => OperationRequest::filesystem(
                id,
                phase,
                FsAction::Move {
                    from: from.clone(),
                    to: to.clone(),
                },
            ),
            StepAction::Read { path } => {
                OperationRequest::filesystem(id, phase, FsAction::Read { path: path.clone() })
            }
            StepAction::Search { pattern, root } => OperationRequest::filesystem(
                id,
                phase,
                FsAction::Search {
                    pattern: pattern.clone(),
                    root: root.clone(),
                },
            ),
            StepAction::Exec {
                command,
                cwd,
                network,
            } => {
                let mode = if *network {
                    ExecMode::Network
                } else {
                    ExecMode::ReadOnly
                };
                OperationRequest::execution(id, phase, command.clone(), cwd.clone(), mode)
            }
            StepAction::CreateRepo { name } => OperationRequest::remote(
                id,
                phase,
                RepoAction::CreateRepository {
                    name: name.clone().unwrap_or_else(|| self.plan.slug()),
                },
            ),
            StepAction::ConfirmRepo { owner, name } => {
                let target = self.target(ctx);
                let owner = owner
                    .as_deref()
                    .or(target.owner)
                    .context("no repository owner configured; set [remote].owner")?;
                OperationRequest::remote(
                    id,
                    phase,
                    RepoAction::ConfirmRepository {
                        owner: owner.to_string(),
                        name: name.clone().unwrap_or(target.name),
                    },
                )
            }
            StepAction::Push {
                include,
                files: inline,
                message,
                branch,
            } => {
                let ctx = ctx.with_context(|| {
                    format!("push step '{}' can only run as a planned phase step", step.id)
                })?;
                let target = self.target(Some(ctx));
                let owner = target
                    .owner
                    .context("no repository owner configured; set [remote].owner")?;
                let patterns: Vec<Pattern> = include
                    .iter()
                    .map(|p| Pattern::new(p).with_context(|| format!("Invalid include glob '{}'", p)))
                    .collect::<Result<_>>()?;
                let mut files = inline.clone();
                if !patterns.is_empty() {
                    files.extend(
                        ctx.artifacts
                            .iter()
                            .filter(|(path, _)| {
                                patterns.iter().any(|p| p.matches_with(path, INCLUDE_OPTIONS))
                                    && !inline.iter().any(|f| f.path == *path)
                            })
                            .map(|(path, content)| RepoFile {
                                path: path.to_string(),
                                content: content.to_string(),
                            }),
                    );
                }
                if files.is_empty() {
                    anyhow::bail!("push step '{}' matched no files in the snapshot", step.id);
                }
                OperationRequest::remote(
                    id,
                    phase,
                    RepoAction::PushFiles {
                        owner: owner.to_string(),
                        repo: target.name,
                        branch: branch.clone().unwrap_or_else(|| target.branch.to_string()),
                        files,
                        message: message.clone(),
                    },
                )
            }
        };
        Ok(request)
    }

    fn planned(&self, step: &PlanStep, phase: Phase, ctx: &PhaseContext<'_>) -> Result<PlannedOperation> {
        let op = PlannedOperation::new(self.request(step, phase, Some(ctx))?);
        Ok(match &step.class {
            Some(class) => op.with_class(class.clone()),
            None => op,
        })
    }
}

#[async_trait]
impl PhaseAgent for ScriptedAgent {
    async fn plan(&self, ctx: &PhaseContext<'_>) -> Result<Vec<PlannedOperation>> {
        if let Some(qa) = ctx.qa {
            for finding in qa.by_severity() {
                tracing::info!(finding = %finding.id, severity = %finding.severity, "addressing QA finding");
            }
        }
        self.plan
            .phases
            .get(ctx.phase)
            .iter()
            .map(|step| self.planned(step, ctx.phase, ctx))
            .collect()
    }

    async fn diagnose(
        &self,
        request: &OperationRequest,
        failure: &str,
        record: &AttemptRecord,
    ) -> Result<Option<Remediation>> {
        let Some(step) = self.plan.find_step(request.phase, &request.id) else {
            return Ok(None);
        };
        let index = record.attempts.saturating_sub(1) as usize;
        let Some(fix) = step.fixes.get(index) else {
            tracing::debug!(step = %step.id, failure = %failure, "no scripted fix left");
            return Ok(None);
        };
        let operations = fix
            .steps
            .iter()
            .map(|s| self.request(s, request.phase, None))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Remediation {
            description: fix.description.clone(),
            operations,
        }))
    }

    async fn remediate(
        &self,
        ctx: &PhaseContext<'_>,
        violations: &[Violation],
        pass: u32,
    ) -> Result<Option<Remediation>> {
        let Some(remediation) = self.plan.remediation.get(pass.saturating_sub(1) as usize) else {
            return Ok(None);
        };
        tracing::debug!(pass, violations = violations.len(), "scripted remediation");
        let operations = remediation
            .steps
            .iter()
            .map(|s| self.request(s, ctx.phase, Some(ctx)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Remediation {
            description: remediation.description.clone(),
            operations,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::ArtifactSet;
    use crate::gateway::{RemoteRepoRef, ToolAction};
    use crate::sandbox::SandboxRoot;

    const PLAN: &str = r#"
project = "Shop Front"

[[phases.bootstrap]]
id = "create-repo"
kind = "create_repo"

[[phases.scaffold]]
id = "install"
kind = "exec"
command = "npm install"
cwd = "codebase"
network = true
class = "install"
fixes = [
  { description = "pin react@18", steps = [{ id = "pin", kind = "exec", command = "npm install react@18", cwd = "codebase", network = true }] },
  { description = "remove lockfile" },
]

[[phases.publish]]
id = "publish"
kind = "push"
include = ["codebase/src/**"]
message = "docs: publish release"

[[remediation]]
description = "move fetch into services"
steps = [{ id = "app", kind = "write", path = "codebase/src/App.tsx", content = "export default App;" }]
"#;

    fn agent() -> ScriptedAgent {
        ScriptedAgent::new(PipelinePlan::parse(PLAN).unwrap(), Some("acme".into()), "main")
    }

    fn ctx<'a>(
        phase: Phase,
        sandbox: &'a SandboxRoot,
        artifacts: &'a ArtifactSet,
        remote: Option<&'a RemoteRepoRef>,
    ) -> PhaseContext<'a> {
        PhaseContext {
            phase,
            sandbox,
            artifacts,
            remote,
            qa: None,
            fix_cycle: false,
        }
    }

    #[test]
    fn test_parse_plan() {
        let plan = PipelinePlan::parse(PLAN).unwrap();
        assert_eq!(plan.slug(), "shop-front");
        assert_eq!(plan.phases.get(Phase::Scaffold).len(), 1);
        assert_eq!(plan.phases.get(Phase::Scaffold)[0].fixes.len(), 2);
        assert!(plan.phases.get(Phase::Implement).is_empty());
        assert_eq!(plan.remediation.len(), 1);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let plan = r#"
project = "x"
[[phases.implement]]
id = "a"
kind = "mkdir"
path = "codebase/src"
[[phases.implement]]
id = "a"
kind = "mkdir"
path = "codebase/src/pages"
"#;
        let err = PipelinePlan::parse(plan).unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate step id"));
    }

    #[tokio::test]
    async fn test_plan_resolves_repo_name_and_class() {
        let agent = agent();
        let sandbox = SandboxRoot::new("/work/shop").unwrap();
        let artifacts = ArtifactSet::default();

        let ops = agent
            .plan(&ctx(Phase::Bootstrap, &sandbox, &artifacts, None))
            .await
            .unwrap();
        assert_eq!(
            ops[0].request.action,
            ToolAction::RemoteRepo(RepoAction::CreateRepository {
                name: "shop-front".into()
            })
        );

        let ops = agent
            .plan(&ctx(Phase::Scaffold, &sandbox, &artifacts, None))
            .await
            .unwrap();
        assert_eq!(ops[0].class.as_deref(), Some("install"));
        assert!(matches!(
            &ops[0].request.action,
            ToolAction::Execution(exec) if exec.mode == ExecMode::Network
        ));
    }

    #[tokio::test]
    async fn test_push_collects_matching_snapshot_files() {
        let agent = agent();
        let sandbox = SandboxRoot::new("/work/shop").unwrap();
        let artifacts: ArtifactSet = [
            ("codebase/src/App.tsx", "app"),
            ("codebase/package.json", "{}"),
            ("codebase/src/pages/Home.tsx", "home"),
        ]
        .into_iter()
        .collect();
        let remote = RemoteRepoRef {
            owner: "acme".into(),
            name: "shop-front".into(),
            url: "memory://acme/shop-front".into(),
        };

        let ops = agent
            .plan(&ctx(Phase::Publish, &sandbox, &artifacts, Some(&remote)))
            .await
            .unwrap();
        let ToolAction::RemoteRepo(RepoAction::PushFiles { files, message, repo, .. }) =
            &ops[0].request.action
        else {
            panic!("expected a push");
        };
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["codebase/src/App.tsx", "codebase/src/pages/Home.tsx"]);
        assert_eq!(message, "docs: publish release");
        assert_eq!(repo, "shop-front");
    }

    #[tokio::test]
    async fn test_diagnose_walks_fixes_in_order() {
        let agent = agent();
        let request = OperationRequest::execution(
            "install",
            Phase::Scaffold,
            "npm install",
            "codebase",
            ExecMode::Network,
        );
        let mut record = AttemptRecord::new("install", 3);

        record.attempts = 1;
        let first = agent.diagnose(&request, "ERESOLVE", &record).await.unwrap().unwrap();
        assert_eq!(first.description, "pin react@18");
        assert_eq!(first.operations.len(), 1);

        record.attempts = 2;
        let second = agent.diagnose(&request, "ERESOLVE", &record).await.unwrap().unwrap();
        assert_eq!(second.description, "remove lockfile");
        assert!(second.operations.is_empty());

        record.attempts = 3;
        assert!(agent.diagnose(&request, "ERESOLVE", &record).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remediation_passes_are_indexed_from_one() {
        let agent = agent();
        let sandbox = SandboxRoot::new("/work/shop").unwrap();
        let artifacts = ArtifactSet::default();
        let c = ctx(Phase::Implement, &sandbox, &artifacts, None);

        let first = agent.remediate(&c, &[], 1).await.unwrap().unwrap();
        assert_eq!(first.operations[0].phase, Phase::Implement);
        assert!(agent.remediate(&c, &[], 2).await.unwrap().is_none());
    }
}
