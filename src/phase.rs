//! Phase definitions and the run-stage transition table.
//!
//! This module provides:
//! - `Phase`, the fixed, ordered steps of the delivery pipeline
//! - the permitted capability set of every phase
//! - `RunStage`, the position of a pipeline run including its terminal states
//! - `check_transition`, the pure transition table the state machine enforces

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::TransitionError;
use crate::gateway::Capability;

/// A discrete, ordered stage of the delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Bootstrap,
    Scaffold,
    Implement,
    UnitTest,
    SmokeTest,
    Publish,
    FixMode,
}

const BOOTSTRAP_CAPS: &[Capability] = &[Capability::Filesystem, Capability::RemoteRepo];
const LOCAL_CAPS: &[Capability] = &[Capability::Filesystem, Capability::Execution];
const PUBLISH_CAPS: &[Capability] = &[Capability::RemoteRepo];
const FIX_CAPS: &[Capability] = &[
    Capability::Filesystem,
    Capability::Execution,
    Capability::RemoteRepo,
];

impl Phase {
    /// The forward pipeline, in execution order.
    pub const FORWARD: [Phase; 6] = [
        Phase::Bootstrap,
        Phase::Scaffold,
        Phase::Implement,
        Phase::UnitTest,
        Phase::SmokeTest,
        Phase::Publish,
    ];

    pub fn ordinal(self) -> u8 {
        match self {
            Phase::Bootstrap => 0,
            Phase::Scaffold => 1,
            Phase::Implement => 2,
            Phase::UnitTest => 3,
            Phase::SmokeTest => 4,
            Phase::Publish => 5,
            Phase::FixMode => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Bootstrap => "bootstrap",
            Phase::Scaffold => "scaffold",
            Phase::Implement => "implement",
            Phase::UnitTest => "unit_test",
            Phase::SmokeTest => "smoke_test",
            Phase::Publish => "publish",
            Phase::FixMode => "fix_mode",
        }
    }

    /// Capabilities a request may declare while this phase is active.
    pub fn permitted(self) -> &'static [Capability] {
        match self {
            Phase::Bootstrap => BOOTSTRAP_CAPS,
            Phase::Scaffold | Phase::Implement | Phase::UnitTest | Phase::SmokeTest => LOCAL_CAPS,
            Phase::Publish => PUBLISH_CAPS,
            Phase::FixMode => FIX_CAPS,
        }
    }

    pub fn permits(self, capability: Capability) -> bool {
        self.permitted().contains(&capability)
    }

    /// Whether the architecture conformance gate applies before completion.
    pub fn checks_architecture(self) -> bool {
        self.ordinal() >= Phase::Implement.ordinal()
    }

    /// Phases that run test commands and report a test summary.
    pub fn is_verification(self) -> bool {
        matches!(self, Phase::UnitTest | Phase::SmokeTest)
    }

    /// Next phase on the forward path. `Publish` completes the run and
    /// `FixMode` always hands over to unit-test revalidation.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Bootstrap => Some(Phase::Scaffold),
            Phase::Scaffold => Some(Phase::Implement),
            Phase::Implement => Some(Phase::UnitTest),
            Phase::UnitTest => Some(Phase::SmokeTest),
            Phase::SmokeTest => Some(Phase::Publish),
            Phase::Publish => None,
            Phase::FixMode => Some(Phase::UnitTest),
        }
    }

    /// Conventional commit message for pushes made at this milestone.
    pub fn milestone_message(self) -> Option<&'static str> {
        match self {
            Phase::Bootstrap => Some("chore: initialize repository"),
            Phase::Implement => Some("feat: add application code with unit tests"),
            Phase::SmokeTest => Some("test: add smoke tests"),
            Phase::Publish => Some("docs: publish release"),
            Phase::FixMode => Some("fix: address QA findings"),
            Phase::Scaffold | Phase::UnitTest => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "bootstrap" => Ok(Phase::Bootstrap),
            "scaffold" => Ok(Phase::Scaffold),
            "implement" => Ok(Phase::Implement),
            "unit_test" | "unittest" => Ok(Phase::UnitTest),
            "smoke_test" | "smoketest" => Ok(Phase::SmokeTest),
            "publish" => Ok(Phase::Publish),
            "fix_mode" | "fixmode" | "fix" => Ok(Phase::FixMode),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: bootstrap, scaffold, implement, unit_test, smoke_test, publish, fix_mode",
                s
            ),
        }
    }
}

/// Where a pipeline run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "stage", content = "phase", rename_all = "snake_case")]
pub enum RunStage {
    /// A phase is executing (or about to).
    Active(Phase),
    /// A fix cycle passed revalidation and waits for an explicit publish re-dispatch.
    Revalidated,
    Done,
    Blocked,
}

impl RunStage {
    pub fn phase(self) -> Option<Phase> {
        match self {
            RunStage::Active(phase) => Some(phase),
            _ => None,
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStage::Active(phase) => write!(f, "{}", phase),
            RunStage::Revalidated => f.write_str("revalidated"),
            RunStage::Done => f.write_str("done"),
            RunStage::Blocked => f.write_str("blocked"),
        }
    }
}

/// Facts about the run that gate transitions beyond the raw stage pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// The run is inside a fix cycle (entered `FixMode`, not yet re-published).
    pub fix_cycle: bool,
    /// A QA artifact reference is attached to the run.
    pub qa_attached: bool,
    /// Publishing was explicitly re-dispatched after revalidation.
    pub publish_dispatched: bool,
}

/// Validate a stage transition against the pipeline's transition table.
pub fn check_transition(
    from: RunStage,
    to: RunStage,
    ctx: TransitionContext,
) -> Result<(), TransitionError> {
    let illegal = || TransitionError::Illegal { from, to };

    if from == RunStage::Blocked {
        return Err(TransitionError::RunBlocked);
    }
    if to == RunStage::Blocked {
        return Ok(());
    }

    match (from, to) {
        (
            RunStage::Done | RunStage::Revalidated | RunStage::Active(Phase::Publish),
            RunStage::Active(Phase::FixMode),
        ) => {
            if ctx.qa_attached {
                Ok(())
            } else {
                Err(TransitionError::MissingQaArtifact)
            }
        }
        (RunStage::Revalidated, RunStage::Active(Phase::Publish)) if ctx.publish_dispatched => {
            Ok(())
        }
        (RunStage::Active(Phase::SmokeTest), RunStage::Revalidated) if ctx.fix_cycle => Ok(()),
        (RunStage::Active(Phase::SmokeTest), RunStage::Active(Phase::Publish))
            if ctx.fix_cycle =>
        {
            Err(illegal())
        }
        (RunStage::Active(Phase::Publish), RunStage::Done) => Ok(()),
        (RunStage::Active(current), RunStage::Active(next))
            if current.successor() == Some(next) =>
        {
            Ok(())
        }
        _ => Err(illegal()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward() -> TransitionContext {
        TransitionContext::default()
    }

    fn fix_cycle() -> TransitionContext {
        TransitionContext {
            fix_cycle: true,
            qa_attached: true,
            publish_dispatched: false,
        }
    }

    #[test]
    fn test_ordinals_are_strictly_increasing_on_forward_path() {
        let ordinals: Vec<u8> = Phase::FORWARD.iter().map(|p| p.ordinal()).collect();
        assert!(ordinals.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_publish_permits_only_remote_repo() {
        assert!(Phase::Publish.permits(Capability::RemoteRepo));
        assert!(!Phase::Publish.permits(Capability::Execution));
        assert!(!Phase::Publish.permits(Capability::Filesystem));
    }

    #[test]
    fn test_implement_permits_local_tools_only() {
        assert!(Phase::Implement.permits(Capability::Filesystem));
        assert!(Phase::Implement.permits(Capability::Execution));
        assert!(!Phase::Implement.permits(Capability::RemoteRepo));
    }

    #[test]
    fn test_architecture_gate_applies_from_implement_onward() {
        assert!(!Phase::Bootstrap.checks_architecture());
        assert!(!Phase::Scaffold.checks_architecture());
        assert!(Phase::Implement.checks_architecture());
        assert!(Phase::Publish.checks_architecture());
        assert!(Phase::FixMode.checks_architecture());
    }

    #[test]
    fn test_phase_from_str_accepts_kebab_and_snake() {
        assert_eq!("unit-test".parse::<Phase>().unwrap(), Phase::UnitTest);
        assert_eq!("smoke_test".parse::<Phase>().unwrap(), Phase::SmokeTest);
        assert_eq!("FIX".parse::<Phase>().unwrap(), Phase::FixMode);
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_forward_transitions_follow_successor() {
        for pair in Phase::FORWARD.windows(2) {
            check_transition(RunStage::Active(pair[0]), RunStage::Active(pair[1]), forward())
                .unwrap();
        }
        check_transition(RunStage::Active(Phase::Publish), RunStage::Done, forward()).unwrap();
    }

    #[test]
    fn test_skipping_a_phase_is_illegal() {
        let err = check_transition(
            RunStage::Active(Phase::Scaffold),
            RunStage::Active(Phase::UnitTest),
            forward(),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::Illegal { .. }));
    }

    #[test]
    fn test_done_never_reenters_earlier_phases() {
        for phase in Phase::FORWARD {
            assert!(
                check_transition(RunStage::Done, RunStage::Active(phase), fix_cycle()).is_err(),
                "done must not re-enter {}",
                phase
            );
        }
    }

    #[test]
    fn test_fix_mode_requires_qa_artifact() {
        let err = check_transition(RunStage::Done, RunStage::Active(Phase::FixMode), forward())
            .unwrap_err();
        assert_eq!(err, TransitionError::MissingQaArtifact);
        check_transition(RunStage::Done, RunStage::Active(Phase::FixMode), fix_cycle()).unwrap();
    }

    #[test]
    fn test_fix_mode_exits_only_into_unit_test() {
        let from = RunStage::Active(Phase::FixMode);
        check_transition(from, RunStage::Active(Phase::UnitTest), fix_cycle()).unwrap();
        assert!(check_transition(from, RunStage::Done, fix_cycle()).is_err());
        assert!(check_transition(from, RunStage::Active(Phase::Publish), fix_cycle()).is_err());
        assert!(check_transition(from, RunStage::Active(Phase::SmokeTest), fix_cycle()).is_err());
    }

    #[test]
    fn test_fix_cycle_smoke_test_rests_at_revalidated() {
        let from = RunStage::Active(Phase::SmokeTest);
        check_transition(from, RunStage::Revalidated, fix_cycle()).unwrap();
        assert!(check_transition(from, RunStage::Active(Phase::Publish), fix_cycle()).is_err());
        assert!(check_transition(from, RunStage::Revalidated, forward()).is_err());
    }

    #[test]
    fn test_revalidated_publishes_only_when_dispatched() {
        assert!(
            check_transition(
                RunStage::Revalidated,
                RunStage::Active(Phase::Publish),
                fix_cycle()
            )
            .is_err()
        );
        let dispatched = TransitionContext {
            publish_dispatched: true,
            ..fix_cycle()
        };
        check_transition(
            RunStage::Revalidated,
            RunStage::Active(Phase::Publish),
            dispatched,
        )
        .unwrap();
        assert!(check_transition(RunStage::Revalidated, RunStage::Done, dispatched).is_err());
    }

    #[test]
    fn test_blocked_is_reachable_from_anywhere_and_never_left() {
        check_transition(RunStage::Active(Phase::Scaffold), RunStage::Blocked, forward()).unwrap();
        check_transition(RunStage::Revalidated, RunStage::Blocked, fix_cycle()).unwrap();
        let err = check_transition(
            RunStage::Blocked,
            RunStage::Active(Phase::Bootstrap),
            forward(),
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::RunBlocked);
    }

    #[test]
    fn test_run_stage_serializes_with_phase_payload() {
        let json = serde_json::to_string(&RunStage::Active(Phase::UnitTest)).unwrap();
        assert_eq!(json, r#"{"stage":"active","phase":"unit_test"}"#);
        let done: RunStage = serde_json::from_str(r#"{"stage":"done"}"#).unwrap();
        assert_eq!(done, RunStage::Done);
    }
}
