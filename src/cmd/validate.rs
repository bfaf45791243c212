//! Path boundary check for `shipwright validate-path`.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;

use shipwright::config::PipelineConfig;
use shipwright::sandbox::SandboxRoot;

use super::EXIT_INVALID;

pub fn cmd_validate_path(project_dir: &Path, candidate: &Path) -> Result<ExitCode> {
    let config = PipelineConfig::load(project_dir, false)?;
    let sandbox = SandboxRoot::new(config.sandbox_root())
        .context("Sandbox root must resolve to an absolute path")?;

    match sandbox.validate(candidate) {
        Ok(resolved) => {
            println!("Valid: {}", resolved.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{}: {}", e.kind(), e);
            Ok(ExitCode::from(EXIT_INVALID))
        }
    }
}
