pub mod agent;
pub mod fix_mode;
pub mod machine;
pub mod state;

pub use agent::{PhaseAgent, PhaseContext, PlannedOperation, Remediation};
pub use fix_mode::{FixModeController, FixModePolicy};
pub use machine::{MachineSettings, PhaseStateMachine, PhaseVerdict};
pub use state::{PipelineRunState, RunLock, StateManager};
