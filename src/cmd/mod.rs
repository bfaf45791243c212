//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `run`           | `Run`, `Fix`                                       |
//! | `status`        | `Status`, `Report`, `Reset`                        |
//! | `project`       | `Init`                                             |
//! | `check`         | `Check`                                            |
//! | `validate`      | `ValidatePath`                                     |
//! | `config`        | `Config`                                           |

use std::process::ExitCode;

use shipwright::phase::RunStage;

pub mod check;
pub mod config;
pub mod project;
pub mod run;
pub mod status;
pub mod validate;

pub use check::cmd_check;
pub use config::cmd_config;
pub use project::cmd_init;
pub use run::{cmd_fix, cmd_run};
pub use status::{cmd_report, cmd_reset, cmd_status};
pub use validate::cmd_validate_path;

/// Exit code for rejected paths, violations, and invalid configuration.
pub const EXIT_INVALID: u8 = 1;
/// Exit code for a run that ended blocked.
pub const EXIT_BLOCKED: u8 = 3;

/// Exit code for the stage a run came to rest in.
pub fn stage_exit(stage: RunStage) -> ExitCode {
    match stage {
        RunStage::Blocked => ExitCode::from(EXIT_BLOCKED),
        _ => ExitCode::SUCCESS,
    }
}
