use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::architecture::ArtifactSet;
use crate::audit::BlockedReport;
use crate::errors::TransitionError;
use crate::gateway::RemoteRepoRef;
use crate::phase::{Phase, RunStage, TransitionContext, check_transition};
use crate::qa::QaRef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: RunStage,
    pub timestamp: DateTime<Utc>,
}

/// The single owned state of a pipeline run.
///
/// Only the phase state machine mutates it; stage changes go through
/// [`PipelineRunState::advance`], which enforces the transition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunState {
    pub run_id: Uuid,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub stage: RunStage,
    #[serde(default)]
    pub history: Vec<StageEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteRepoRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa: Option<QaRef>,
    #[serde(default)]
    pub fix_cycle: bool,
    #[serde(default)]
    pub fix_cycles: u32,
    #[serde(default)]
    pub publish_dispatched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<BlockedReport>,
    /// Last artifact snapshot, persisted so a resumed run gates on the same
    /// files; replaced by the next filesystem-capable phase.
    #[serde(default, skip_serializing_if = "ArtifactSet::is_empty")]
    pub artifacts: ArtifactSet,
}

impl PipelineRunState {
    pub fn new(project: impl Into<String>) -> Self {
        let now = Utc::now();
        let stage = RunStage::Active(Phase::Bootstrap);
        Self {
            run_id: Uuid::new_v4(),
            project: project.into(),
            started_at: now,
            stage,
            history: vec![StageEntry {
                stage,
                timestamp: now,
            }],
            remote: None,
            qa: None,
            fix_cycle: false,
            fix_cycles: 0,
            publish_dispatched: false,
            blocked: None,
            artifacts: ArtifactSet::default(),
        }
    }

    pub fn transition_context(&self) -> TransitionContext {
        TransitionContext {
            fix_cycle: self.fix_cycle,
            qa_attached: self.qa.is_some(),
            publish_dispatched: self.publish_dispatched,
        }
    }

    /// Move to `to` if the transition table allows it.
    pub fn advance(&mut self, to: RunStage) -> Result<(), TransitionError> {
        check_transition(self.stage, to, self.transition_context())?;
        tracing::info!(run = %self.run_id, from = %self.stage, to = %to, "stage transition");
        self.stage = to;
        self.history.push(StageEntry {
            stage: to,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn is_blocked(&self) -> bool {
        self.stage == RunStage::Blocked
    }

    /// Phases that finished on the forward path or in a fix cycle, in order.
    pub fn visited_phases(&self) -> Vec<Phase> {
        self.history.iter().filter_map(|e| e.stage.phase()).collect()
    }
}

/// JSON persistence of the run state.
pub struct StateManager {
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    pub fn load(&self) -> Result<Option<PipelineRunState>> {
        if !self.state_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.state_file).context("Failed to read state file")?;
        let state = serde_json::from_str(&content).context("Failed to parse state file")?;
        Ok(Some(state))
    }

    /// Write the state through a temporary file so readers never see a
    /// partial document.
    pub fn save(&self, state: &PipelineRunState) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let json = serde_json::to_string_pretty(state).context("Failed to serialize run state")?;
        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, json).context("Failed to write state file")?;
        fs::rename(&tmp, &self.state_file).context("Failed to replace state file")?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        if self.state_file.exists() {
            fs::remove_file(&self.state_file).context("Failed to remove state file")?;
        }
        Ok(())
    }
}

/// Exclusive lock held for the duration of a run or fix cycle.
pub struct RunLock {
    file: fs::File,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create lock directory")?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        file.try_lock_exclusive()
            .with_context(|| format!("Another run holds {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
