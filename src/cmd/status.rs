//! Run status, outcome report, and reset commands.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;

use shipwright::audit::{AuditLogger, PhaseStatus};
use shipwright::config::PipelineConfig;
use shipwright::orchestrator::StateManager;
use shipwright::phase::RunStage;

use super::stage_exit;

pub fn cmd_status(project_dir: &Path) -> Result<ExitCode> {
    let config = PipelineConfig::load(project_dir, false)?;
    let store = StateManager::new(config.state_file());

    let Some(state) = store.load()? else {
        println!();
        println!("No run recorded. Run 'shipwright run' to start one.");
        println!();
        return Ok(ExitCode::SUCCESS);
    };

    let stage = match state.stage {
        RunStage::Done | RunStage::Revalidated => {
            console::style(state.stage.to_string()).green().bold()
        }
        RunStage::Blocked => console::style(state.stage.to_string()).red().bold(),
        RunStage::Active(_) => console::style(state.stage.to_string()).yellow(),
    };

    println!();
    println!("Run:      {}", state.run_id);
    println!("Project:  {}", state.project);
    println!("Started:  {}", state.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Stage:    {}", stage);
    if let Some(remote) = &state.remote {
        println!("Remote:   {} ({})", remote.slug(), remote.url);
    }
    if state.fix_cycles > 0 {
        println!("Fix cycles: {}", state.fix_cycles);
    }
    if let Some(qa) = &state.qa {
        println!(
            "QA:       {} ({} finding(s))",
            qa.path.display(),
            qa.findings
        );
    }
    println!();

    println!("History:");
    for entry in &state.history {
        println!(
            "  {}  {}",
            console::style(entry.timestamp.format("%H:%M:%S")).dim(),
            entry.stage
        );
    }
    println!();

    if let Some(report) = &state.blocked {
        print!("{}", report.render());
        println!();
    }

    Ok(stage_exit(state.stage))
}

pub fn cmd_report(project_dir: &Path, json: bool) -> Result<()> {
    let config = PipelineConfig::load(project_dir, false)?;
    let audit = AuditLogger::new(&config.reports_file(), &config.blocked_file());
    let records = audit.records()?;

    if json {
        let rendered =
            serde_json::to_string_pretty(&records).context("Failed to render records")?;
        println!("{}", rendered);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("No phase outcomes recorded.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<12} {:<10} {:<9} {:<11} {:<5} When",
        "Phase", "Status", "Attempts", "Violations", "Fix"
    );
    println!(
        "{:<12} {:<10} {:<9} {:<11} {:<5} ----",
        "-----", "------", "--------", "----------", "---"
    );
    for record in &records {
        let status = match record.status {
            PhaseStatus::Succeeded => console::style(record.status.to_string()).green(),
            PhaseStatus::Blocked => console::style(record.status.to_string()).red(),
        };
        println!(
            "{:<12} {:<10} {:<9} {:<11} {:<5} {}",
            record.phase.to_string(),
            status,
            record.attempts,
            record.violations.len(),
            if record.fix_cycle { "yes" } else { "" },
            record.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(summary) = &record.test_summary {
            println!(
                "             tests: {} passed, {} failed of {}",
                summary.passed, summary.failed, summary.total
            );
        }
        if let Some(kind) = &record.error {
            println!("             error: {}", kind);
        }
    }
    println!();

    if let Some(report) = audit.blocked()? {
        print!("{}", report.render());
        println!();
    }
    Ok(())
}

pub fn cmd_reset(project_dir: &Path, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let config = PipelineConfig::load(project_dir, false)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This clears the run state and outcome records. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    StateManager::new(config.state_file()).reset()?;
    AuditLogger::new(&config.reports_file(), &config.blocked_file()).clear()?;
    println!("Run state and outcome records cleared.");
    Ok(())
}
