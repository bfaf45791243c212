//! Configuration view and validation commands for `shipwright config`.

use anyhow::{Context, Result};
use std::process::ExitCode;

use super::super::ConfigCommands;
use super::EXIT_INVALID;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<ExitCode> {
    use shipwright::config::{PipelineConfig, PipelineToml};
    use shipwright::init::{CONFIG_FILE, shipwright_dir};

    let dir = shipwright_dir(project_dir);
    let config_path = dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Shipwright Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No pipeline.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            // Effective values include .env and SHIPWRIGHT_* overrides.
            let config = PipelineConfig::load(project_dir, false)?;
            let rendered = toml::to_string_pretty(&config.toml)
                .context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();
            println!("Sandbox root: {}", config.sandbox_root().display());
            let token = if config.remote_token().is_some() {
                "set"
            } else {
                "not set"
            };
            println!("Remote token ({}): {}", config.toml.remote.token_env, token);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                PipelineToml::load(&config_path)?
            } else {
                println!("No pipeline.toml found. Checking defaults.");
                PipelineToml::default()
            };
            let problems = toml.validate();

            if problems.is_empty() {
                println!("Configuration is valid.");
                println!();
            } else {
                println!("Configuration problems:");
                for problem in problems {
                    println!("  - {}", problem);
                }
                println!();
                return Ok(ExitCode::from(EXIT_INVALID));
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("pipeline.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(ExitCode::SUCCESS);
            }

            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            PipelineToml::default().save(&config_path)?;

            println!("Created pipeline.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [sandbox] root, app_subtree, qa_dir");
            println!("  - [retry] bound, backoff_ms and per-class overrides");
            println!("  - [architecture] remediation passes and layering patterns");
            println!("  - [remote] owner, branch, token_env");
            println!();
        }
    }

    Ok(ExitCode::SUCCESS)
}
