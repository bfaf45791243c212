//! Pipeline execution for `shipwright run` and `shipwright fix`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use shipwright::architecture::RuleSet;
use shipwright::audit::AuditLogger;
use shipwright::config::PipelineConfig;
use shipwright::gateway::local::{GitHubRepository, LocalFilesystem, ShellExecutor};
use shipwright::gateway::memory::{MemoryFilesystem, MemoryRepository, ScriptedExecutor};
use shipwright::gateway::{OpenGuard, ToolGateway};
use shipwright::init::PLAN_FILE;
use shipwright::orchestrator::{
    FixModeController, FixModePolicy, MachineSettings, PhaseStateMachine, PipelineRunState,
    RunLock, StateManager,
};
use shipwright::phase::{Phase, RunStage};
use shipwright::plan::{PipelinePlan, ScriptedAgent};
use shipwright::retry::RetryPolicy;
use shipwright::sandbox::SandboxRoot;

use super::stage_exit;

/// Directory holding state and reports of dry runs, apart from real runs.
const DRY_RUN_DIR: &str = "dry-run";
const DRY_RUN_OWNER: &str = "dry-run";
const STATE_FILE: &str = "state.json";

struct Engine {
    machine: PhaseStateMachine,
    plan_project: String,
}

fn resolve_plan(config: &PipelineConfig, plan: Option<&Path>) -> Result<PipelinePlan> {
    let path = match plan {
        Some(path) => path.to_path_buf(),
        None => config.shipwright_dir.join(PLAN_FILE),
    };
    if !path.exists() {
        anyhow::bail!(
            "No plan found at {}. Run 'shipwright init' or pass --plan.",
            path.display()
        );
    }
    PipelinePlan::load(&path)
}

fn state_dir(config: &PipelineConfig, dry_run: bool) -> PathBuf {
    if dry_run {
        config.shipwright_dir.join(DRY_RUN_DIR)
    } else {
        config.shipwright_dir.clone()
    }
}

/// Wire the machine to real tools, or to in-memory ones for a dry run.
///
/// A resumed dry run starts its in-memory tools from `resume`: the recorded
/// artifact snapshot becomes the sandbox's files and the confirmed repository
/// exists again.
fn build_engine(
    config: &PipelineConfig,
    plan: PipelinePlan,
    dry_run: bool,
    resume: Option<&PipelineRunState>,
) -> Result<Engine> {
    let toml = &config.toml;
    let sandbox = SandboxRoot::new(config.sandbox_root())
        .context("Sandbox root must resolve to an absolute path")?;

    // Dry runs have no real repository owner to fall back on.
    let owner = match (&toml.remote.owner, dry_run) {
        (Some(owner), _) => Some(owner.clone()),
        (None, true) => Some(DRY_RUN_OWNER.to_string()),
        (None, false) => None,
    };

    let gateway = if dry_run {
        let files: Vec<(PathBuf, String)> = resume
            .map(|state| {
                state
                    .artifacts
                    .iter()
                    .map(|(path, content)| (sandbox.resolve(Path::new(path)), content.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let mut repo = MemoryRepository::new(owner.clone().unwrap_or_default());
        if let Some(remote) = resume.and_then(|state| state.remote.as_ref()) {
            repo = repo.with_repository(&remote.name);
        }
        ToolGateway::new(
            sandbox,
            Arc::new(MemoryFilesystem::with_files(files)),
            Arc::new(ScriptedExecutor::default()),
            Arc::new(repo),
        )
    } else {
        ToolGateway::new(
            sandbox,
            Arc::new(LocalFilesystem::new(toml.sandbox.ignore.clone())),
            Arc::new(ShellExecutor::new(
                Duration::from_secs(toml.execution.timeout_secs),
                toml.execution.output_limit_bytes,
            )),
            Arc::new(GitHubRepository::new(
                toml.remote.api_base.clone(),
                config.remote_token(),
            )),
        )
    };

    let plan_project = plan.project.clone();
    let agent = ScriptedAgent::new(plan, owner, toml.remote.branch.clone());

    let dir = state_dir(config, dry_run);
    let machine = PhaseStateMachine::new(
        Arc::new(gateway),
        Arc::new(agent),
        RetryPolicy::from_config(&toml.retry),
        RuleSet::standard(&toml.architecture)?,
        AuditLogger::new(&dir.join("reports.jsonl"), &dir.join("blocked.json")),
        StateManager::new(dir.join(STATE_FILE)),
        MachineSettings::from_config(toml),
    );

    Ok(Engine {
        machine,
        plan_project,
    })
}

fn print_outcome(state: &PipelineRunState) {
    println!();
    match state.stage {
        RunStage::Done => println!(
            "{} run {} complete",
            console::style("✓").green().bold(),
            state.run_id
        ),
        RunStage::Revalidated => {
            println!(
                "{} fix cycle {} revalidated",
                console::style("✓").green().bold(),
                state.fix_cycles
            );
            println!("  Run 'shipwright fix --publish' to push the fixes.");
        }
        RunStage::Blocked => {
            println!("{} run {} blocked", console::style("✗").red().bold(), state.run_id);
            if let Some(report) = &state.blocked {
                println!();
                print!("{}", report.render());
            }
        }
        RunStage::Active(phase) => println!("Stopped in {}", phase),
    }
    if let Some(remote) = &state.remote {
        println!("  Repository: {}", remote.url);
    }
    println!();
}

pub async fn cmd_run(
    project_dir: &Path,
    verbose: bool,
    plan: Option<&Path>,
    dry_run: bool,
    retry_bound: Option<u32>,
) -> Result<ExitCode> {
    let config = PipelineConfig::load(project_dir, verbose)?.with_retry_bound(retry_bound);
    let plan = resolve_plan(&config, plan)?;
    let store = StateManager::new(state_dir(&config, dry_run).join(STATE_FILE));

    let _lock = RunLock::acquire(&config.lock_file())?;

    // A finished or blocked dry run is replaced by a fresh one.
    let previous = match store.load()? {
        Some(state) if dry_run && (state.is_blocked() || state.stage == RunStage::Done) => None,
        other => other,
    };
    let engine = build_engine(&config, plan, dry_run, previous.as_ref())?;
    if dry_run {
        if previous.is_none() {
            store.reset()?;
            engine.machine.audit().clear()?;
        }
        println!("Dry run: tools are in-memory, nothing touches disk or network.");
    }

    let mut state = match previous {
        Some(state) if state.is_blocked() => {
            print_outcome(&state);
            println!("Run is blocked. Fix the cause, then 'shipwright reset' to start over.");
            return Ok(stage_exit(state.stage));
        }
        Some(state) if state.stage == RunStage::Done => {
            println!("Run {} already complete. Use 'shipwright fix' for QA findings.", state.run_id);
            return Ok(ExitCode::SUCCESS);
        }
        Some(state) if state.stage == RunStage::Revalidated => {
            anyhow::bail!("Run is awaiting publish after a fix cycle; use 'shipwright fix --publish'.");
        }
        Some(state) => {
            println!("Resuming run {} at {}", state.run_id, state.stage);
            state
        }
        None => PipelineRunState::new(engine.plan_project.clone()),
    };
    store.save(&state)?;

    let stage = engine.machine.run(&mut state, &OpenGuard).await?;
    print_outcome(&state);
    Ok(stage_exit(stage))
}

pub async fn cmd_fix(
    project_dir: &Path,
    verbose: bool,
    plan: Option<&Path>,
    qa_path: &Path,
    publish: bool,
    dry_run: bool,
    retry_bound: Option<u32>,
) -> Result<ExitCode> {
    let config = PipelineConfig::load(project_dir, verbose)?.with_retry_bound(retry_bound);
    let plan = resolve_plan(&config, plan)?;
    let store = StateManager::new(state_dir(&config, dry_run).join(STATE_FILE));

    let _lock = RunLock::acquire(&config.lock_file())?;

    let mut state = store.load()?.with_context(|| {
        if dry_run {
            "No run state found. Run 'shipwright run --dry-run' first."
        } else {
            "No run state found. Run 'shipwright run' first."
        }
    })?;
    let engine = build_engine(&config, plan, dry_run, Some(&state))?;
    if dry_run {
        println!("Dry run: tools are in-memory, nothing touches disk or network.");
    }

    let (artifact, qa_ref) = shipwright::qa::load(qa_path)?;
    println!(
        "Loaded {} QA finding(s) from {}",
        artifact.findings.len(),
        qa_ref.path.display()
    );

    let sandbox = engine.machine.gateway().sandbox().clone();
    let policy = FixModePolicy::from_config(&sandbox, &config.toml.sandbox, &qa_ref);
    let controller = FixModeController::new(engine.machine.with_qa(artifact), policy, qa_ref);

    let stage = if state.stage == RunStage::Revalidated && publish {
        controller.invoke(&mut state, Phase::Publish).await?
    } else {
        controller.run_cycle(&mut state, publish).await?
    };
    print_outcome(&state);
    Ok(stage_exit(stage))
}
