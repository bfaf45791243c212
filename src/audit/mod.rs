//! Phase outcome records and blocked reports.
//!
//! One [`PhaseOutcomeRecord`] is appended per completed or blocked phase; a
//! blocked run also gets a [`BlockedReport`] naming the failing phase, the
//! error kind, the failing command and every remediation tried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::architecture::Violation;
use crate::errors::ErrorKind;
use crate::phase::Phase;
use crate::retry::AttemptRecord;

pub mod logger;
pub mod summary;

pub use logger::AuditLogger;
pub use summary::TestSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseStatus {
    Succeeded,
    Blocked,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Succeeded => write!(f, "Succeeded"),
            PhaseStatus::Blocked => write!(f, "Blocked"),
        }
    }
}

/// Append-only record of one phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcomeRecord {
    pub run_id: Uuid,
    pub phase: Phase,
    pub status: PhaseStatus,
    /// Total attempts across the phase's operations.
    pub attempts: u32,
    pub violations: Vec<Violation>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fix_cycle: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<AttemptRecord>,
    #[serde(default)]
    pub remediation_passes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_summary: Option<TestSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl PhaseOutcomeRecord {
    pub fn new(run_id: Uuid, phase: Phase, status: PhaseStatus) -> Self {
        Self {
            run_id,
            phase,
            status,
            attempts: 0,
            violations: Vec::new(),
            timestamp: Utc::now(),
            fix_cycle: false,
            operations: Vec::new(),
            remediation_passes: 0,
            test_summary: None,
            error: None,
        }
    }
}

/// Structured report written when a run enters `Blocked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedReport {
    pub run_id: Uuid,
    pub phase: Phase,
    pub error_kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspected_cause: Option<String>,
    #[serde(default)]
    pub fixes_attempted: Vec<String>,
    #[serde(default)]
    pub remediations: Vec<String>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    pub timestamp: DateTime<Utc>,
}

impl BlockedReport {
    pub fn new(run_id: Uuid, phase: Phase, error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            run_id,
            phase,
            error_kind,
            message: message.into(),
            failing_command: None,
            suspected_cause: None,
            fixes_attempted: Vec::new(),
            remediations: Vec::new(),
            violations: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Multi-line human rendering for `status` and CLI output.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Blocked in {} ({}): {}\n",
            self.phase, self.error_kind, self.message
        );
        if let Some(cmd) = &self.failing_command {
            out.push_str(&format!("  failing command: {}\n", cmd));
        }
        if let Some(cause) = &self.suspected_cause {
            out.push_str(&format!("  suspected cause: {}\n", cause.trim()));
        }
        for fix in &self.fixes_attempted {
            out.push_str(&format!("  fix attempted: {}\n", fix));
        }
        for remediation in &self.remediations {
            out.push_str(&format!("  remediation: {}\n", remediation));
        }
        for violation in &self.violations {
            out.push_str(&format!("  violation: {}\n", violation));
        }
        out
    }
}
