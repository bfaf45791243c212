//! Standalone conformance check for `shipwright check`.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use shipwright::architecture::RuleSet;
use shipwright::config::PipelineConfig;
use shipwright::gateway::local::LocalFilesystem;
use shipwright::gateway::memory::{MemoryRepository, ScriptedExecutor};
use shipwright::gateway::{DispatchContext, OpenGuard, ToolGateway};
use shipwright::phase::Phase;
use shipwright::sandbox::SandboxRoot;

use super::EXIT_INVALID;

/// Evaluate the layering rules against the files under the sandbox root.
pub async fn cmd_check(project_dir: &Path) -> Result<ExitCode> {
    let config = PipelineConfig::load(project_dir, false)?;
    let toml = &config.toml;
    let sandbox = SandboxRoot::new(config.sandbox_root())
        .context("Sandbox root must resolve to an absolute path")?;
    let root = sandbox.path().to_path_buf();

    // Read-only: only the filesystem role is real.
    let gateway = ToolGateway::new(
        sandbox,
        Arc::new(LocalFilesystem::new(toml.sandbox.ignore.clone())),
        Arc::new(ScriptedExecutor::default()),
        Arc::new(MemoryRepository::new("local")),
    );
    let ctx = DispatchContext {
        phase: Phase::Implement,
        remote: None,
        guard: &OpenGuard,
    };
    let artifacts = gateway
        .collect_artifacts(toml.sandbox.list_depth, &ctx)
        .await
        .with_context(|| format!("Failed to snapshot {}", root.display()))?;

    let rules = RuleSet::standard(&toml.architecture)?;
    let violations = rules.evaluate(&artifacts);

    println!();
    println!(
        "Checked {} file(s) under {} against {} rule(s)",
        artifacts.len(),
        root.display(),
        rules.len()
    );
    println!();

    if violations.is_empty() {
        println!("{} No violations", console::style("✓").green().bold());
        println!();
        return Ok(ExitCode::SUCCESS);
    }

    for violation in &violations {
        println!("  {} {}", console::style("✗").red(), violation);
    }
    println!();
    println!("{} violation(s)", violations.len());
    println!();
    Ok(ExitCode::from(EXIT_INVALID))
}
