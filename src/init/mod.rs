//! Project initialization.
//!
//! `shipwright init` creates the `.shipwright/` directory:
//!
//! ```text
//! .shipwright/
//! ├── pipeline.toml    # Configuration (sandbox, retry, architecture, remote)
//! ├── plan.toml        # Pipeline plan template, one section per phase
//! ├── state.json       # Run state (written by `run` and `fix`)
//! ├── reports.jsonl    # Append-only phase outcome records
//! ├── blocked.json     # Blocked report of the last blocked run
//! └── logs/            # Daily-rolled JSON tracing logs
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::PipelineToml;
use crate::phase::Phase;
use crate::util::slugify;

/// The name of the shipwright directory inside a project.
pub const SHIPWRIGHT_DIR: &str = ".shipwright";
pub const CONFIG_FILE: &str = "pipeline.toml";
pub const PLAN_FILE: &str = "plan.toml";
pub const LOG_DIR: &str = "logs";

#[derive(Debug)]
pub struct InitResult {
    pub shipwright_dir: PathBuf,
    /// Whether the directory was newly created.
    pub created: bool,
    /// Files written by this call; existing files are never overwritten.
    pub written: Vec<PathBuf>,
}

pub fn shipwright_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(SHIPWRIGHT_DIR)
}

pub fn is_initialized(project_dir: &Path) -> bool {
    shipwright_dir(project_dir).join(CONFIG_FILE).exists()
}

/// Initialize `.shipwright/` in `project_dir`.
///
/// `name` is the human project name used in the plan template; it defaults
/// to the project directory's name.
pub fn init_project(project_dir: &Path, name: Option<&str>) -> Result<InitResult> {
    let dir = shipwright_dir(project_dir);
    let created = !dir.exists();
    let logs = dir.join(LOG_DIR);
    std::fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create directory: {}", logs.display()))?;

    let mut written = Vec::new();

    let config = dir.join(CONFIG_FILE);
    if !config.exists() {
        PipelineToml::default().save(&config)?;
        written.push(config);
    }

    let plan = dir.join(PLAN_FILE);
    if !plan.exists() {
        let name = match name {
            Some(name) => name.to_string(),
            None => project_dir
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "project".to_string()),
        };
        std::fs::write(&plan, plan_template(&name))
            .with_context(|| format!("Failed to write plan template: {}", plan.display()))?;
        written.push(plan);
    }

    Ok(InitResult {
        shipwright_dir: dir,
        created,
        written,
    })
}

fn milestone(phase: Phase) -> &'static str {
    phase.milestone_message().unwrap_or_default()
}

/// A runnable plan for a Vite + React project, with milestone commits.
pub fn plan_template(name: &str) -> String {
    let slug = slugify(name);
    format!(
        r##"# Pipeline plan for {name}.
# Steps run in order per phase; `fixes` are tried after failed attempts and
# `[[remediation]]` passes are offered when conformance rules are violated.
project = "{name}"

[[phases.bootstrap]]
id = "create-repo"
kind = "create_repo"

[[phases.bootstrap]]
id = "initial-commit"
kind = "push"
files = [{{ path = "README.md", content = "# {slug}\n" }}]
message = "{bootstrap}"

[[phases.scaffold]]
id = "create-app"
kind = "exec"
command = "npm create vite@latest codebase -- --template react-ts"
network = true

[[phases.scaffold]]
id = "install"
kind = "exec"
command = "npm install"
cwd = "codebase"
network = true
class = "install"
fixes = [
  {{ description = "clear the npm cache", steps = [{{ id = "clean-cache", kind = "exec", command = "npm cache clean --force", cwd = "codebase" }}] }},
  {{ description = "install with legacy peer dependencies", steps = [{{ id = "legacy-install", kind = "exec", command = "npm install --legacy-peer-deps", cwd = "codebase", network = true }}] }},
]

[[phases.implement]]
id = "pages-dir"
kind = "mkdir"
path = "codebase/src/pages"

[[phases.implement]]
id = "services-dir"
kind = "mkdir"
path = "codebase/src/services"

[[phases.implement]]
id = "api-client"
kind = "write"
path = "codebase/src/services/api.ts"
content = "export const apiBase = '/api';\n"

[[phases.unit_test]]
id = "unit-tests"
kind = "exec"
command = "npx vitest run --reporter=json"
cwd = "codebase"

[[phases.smoke_test]]
id = "smoke-tests"
kind = "exec"
command = "npx playwright test"
cwd = "codebase"

[[phases.publish]]
id = "publish"
kind = "push"
include = ["codebase/**"]
message = "{publish}"

[[phases.fix_mode]]
id = "fix-unit-tests"
kind = "exec"
command = "npx vitest run"
cwd = "codebase"

# Milestone messages for pushes added later:
#   implement:  "{implement}"
#   smoke_test: "{smoke}"
#   fix_mode:   "{fix}"
"##,
        name = name,
        slug = slug,
        bootstrap = milestone(Phase::Bootstrap),
        implement = milestone(Phase::Implement),
        smoke = milestone(Phase::SmokeTest),
        publish = milestone(Phase::Publish),
        fix = milestone(Phase::FixMode),
    )
}
