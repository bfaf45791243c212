use super::{BlockedReport, PhaseOutcomeRecord};
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes outcome records to an append-only JSONL file and the blocked
/// report to its own JSON file.
pub struct AuditLogger {
    reports_file: PathBuf,
    blocked_file: PathBuf,
}

impl AuditLogger {
    pub fn new(reports_file: &Path, blocked_file: &Path) -> Self {
        Self {
            reports_file: reports_file.to_path_buf(),
            blocked_file: blocked_file.to_path_buf(),
        }
    }

    /// Append one record; existing lines are never rewritten.
    pub fn append(&self, record: &PhaseOutcomeRecord) -> Result<()> {
        if let Some(parent) = self.reports_file.parent() {
            fs::create_dir_all(parent).context("Failed to create reports directory")?;
        }
        let line = serde_json::to_string(record).context("Failed to serialize outcome record")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.reports_file)
            .with_context(|| format!("Failed to open {}", self.reports_file.display()))?;
        writeln!(file, "{}", line).context("Failed to append outcome record")?;
        Ok(())
    }

    pub fn records(&self) -> Result<Vec<PhaseOutcomeRecord>> {
        if !self.reports_file.exists() {
            return Ok(Vec::new());
        }
        let content =
            fs::read_to_string(&self.reports_file).context("Failed to read reports file")?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Failed to parse outcome record on line {}", i + 1))
            })
            .collect()
    }

    pub fn write_blocked(&self, report: &BlockedReport) -> Result<()> {
        let json =
            serde_json::to_string_pretty(report).context("Failed to serialize blocked report")?;
        fs::write(&self.blocked_file, json)
            .with_context(|| format!("Failed to write {}", self.blocked_file.display()))
    }

    pub fn blocked(&self) -> Result<Option<BlockedReport>> {
        if !self.blocked_file.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.blocked_file).context("Failed to read blocked report")?;
        let report = serde_json::from_str(&content).context("Failed to parse blocked report")?;
        Ok(Some(report))
    }

    /// Remove both files (used by `reset`).
    pub fn clear(&self) -> Result<()> {
        for file in [&self.reports_file, &self.blocked_file] {
            if file.exists() {
                fs::remove_file(file)
                    .with_context(|| format!("Failed to remove {}", file.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::PhaseStatus;
    use crate::errors::ErrorKind;
    use crate::phase::Phase;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn setup_logger() -> (AuditLogger, TempDir) {
        let dir = TempDir::new().unwrap();
        let logger = AuditLogger::new(
            &dir.path().join("reports.jsonl"),
            &dir.path().join("blocked.json"),
        );
        (logger, dir)
    }

    #[test]
    fn test_records_empty_without_file() {
        let (logger, _dir) = setup_logger();
        assert!(logger.records().unwrap().is_empty());
        assert!(logger.blocked().unwrap().is_none());
    }

    #[test]
    fn test_append_is_one_line_per_record() {
        let (logger, dir) = setup_logger();
        let run_id = Uuid::new_v4();
        for phase in [Phase::Bootstrap, Phase::Scaffold, Phase::Implement] {
            logger
                .append(&PhaseOutcomeRecord::new(run_id, phase, PhaseStatus::Succeeded))
                .unwrap();
        }
        let content = fs::read_to_string(dir.path().join("reports.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 3);

        let records = logger.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].phase, Phase::Implement);
    }

    #[test]
    fn test_blocked_report_roundtrip_and_clear() {
        let (logger, _dir) = setup_logger();
        let report = BlockedReport::new(
            Uuid::new_v4(),
            Phase::Implement,
            ErrorKind::ArchitectureViolation,
            "violations persisted",
        );
        logger.write_blocked(&report).unwrap();
        assert_eq!(logger.blocked().unwrap(), Some(report));

        logger.clear().unwrap();
        assert!(logger.blocked().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_line_is_reported() {
        let (logger, dir) = setup_logger();
        fs::write(dir.path().join("reports.jsonl"), "not json\n").unwrap();
        let err = logger.records().unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
