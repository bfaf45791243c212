//! QA artifact input consumed by fix mode.
//!
//! The artifact is a JSON list of findings produced by an external QA pass.
//! It is read, fingerprinted and never written back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaFinding {
    pub id: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub reproduction_steps: Vec<String>,
}

/// The full list of findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QaArtifact {
    pub findings: Vec<QaFinding>,
}

impl QaArtifact {
    pub fn parse(content: &str) -> Result<Self> {
        let artifact: QaArtifact =
            serde_json::from_str(content).context("Failed to parse QA artifact")?;
        if artifact.findings.is_empty() {
            anyhow::bail!("QA artifact contains no findings");
        }
        Ok(artifact)
    }

    /// Findings ordered most severe first.
    pub fn by_severity(&self) -> Vec<&QaFinding> {
        let mut findings: Vec<&QaFinding> = self.findings.iter().collect();
        findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));
        findings
    }
}

/// Reference to a QA artifact attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaRef {
    pub path: PathBuf,
    pub sha256: String,
    pub findings: usize,
}

impl QaRef {
    /// Whether the artifact on disk still matches the attached fingerprint.
    pub fn verify(&self) -> Result<bool> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read QA artifact {}", self.path.display()))?;
        Ok(fingerprint(&bytes) == self.sha256)
    }
}

pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Load and fingerprint a QA artifact.
pub fn load(path: &Path) -> Result<(QaArtifact, QaRef)> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read QA artifact {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    let artifact = QaArtifact::parse(&content)?;
    let path = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve QA artifact path {}", path.display()))?;
    let qa_ref = QaRef {
        path,
        sha256: fingerprint(&bytes),
        findings: artifact.findings.len(),
    };
    Ok((artifact, qa_ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"[
        {"id": "QA-2", "description": "Cart total ignores quantity", "severity": "high",
         "reproductionSteps": ["add two items", "open cart"]},
        {"id": "QA-1", "description": "Footer typo", "severity": "low"}
    ]"#;

    #[test]
    fn test_parse_camel_case_findings() {
        let artifact = QaArtifact::parse(SAMPLE).unwrap();
        assert_eq!(artifact.findings.len(), 2);
        assert_eq!(artifact.findings[0].reproduction_steps.len(), 2);
        assert!(artifact.findings[1].reproduction_steps.is_empty());
        assert_eq!(artifact.by_severity()[0].id, "QA-2");
    }

    #[test]
    fn test_empty_artifact_is_rejected() {
        assert!(QaArtifact::parse("[]").is_err());
        assert!(QaArtifact::parse("{}").is_err());
    }

    #[test]
    fn test_fingerprint_is_lowercase_hex_sha256() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_load_fingerprints_and_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qa.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let (_, qa_ref) = load(&path).unwrap();
        assert_eq!(qa_ref.findings, 2);
        assert_eq!(qa_ref.sha256.len(), 64);
        assert!(qa_ref.verify().unwrap());

        std::fs::write(&path, SAMPLE.replace("typo", "tpyo")).unwrap();
        assert!(!qa_ref.verify().unwrap());
    }
}
