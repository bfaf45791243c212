//! Test summaries parsed from unit and smoke test output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

const TOTAL_KEY: &str = "\"numTotalTests\"";

static PASSED_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+passed").unwrap());
static FAILED_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+failed").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport {
    num_total_tests: u32,
    #[serde(default)]
    num_passed_tests: u32,
    #[serde(default)]
    num_failed_tests: u32,
}

impl TestSummary {
    /// Parse a summary from test runner output.
    ///
    /// Tries, in order: a JSON report with `numTotalTests`, textual
    /// `N passed` / `N failed` counters, then ✓/✗ markers.
    pub fn parse(output: &str) -> Option<Self> {
        Self::from_json(output)
            .or_else(|| Self::from_counters(output))
            .or_else(|| Self::from_marks(output))
    }

    /// Single pass over the output: each object that directly holds a
    /// `numTotalTests` key is parsed once, when its closing brace is seen.
    fn from_json(output: &str) -> Option<Self> {
        let mut open: Vec<(usize, bool)> = Vec::new();
        for (i, ch) in output.char_indices() {
            match ch {
                '{' => open.push((i, false)),
                '}' => {
                    if let Some((start, true)) = open.pop()
                        && let Ok(report) = serde_json::from_str::<JsonReport>(&output[start..=i])
                    {
                        return Some(Self {
                            total: report.num_total_tests,
                            passed: report.num_passed_tests,
                            failed: report.num_failed_tests,
                        });
                    }
                }
                '"' if output[i..].starts_with(TOTAL_KEY) => {
                    if let Some(top) = open.last_mut() {
                        top.1 = true;
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn from_counters(output: &str) -> Option<Self> {
        let count = |re: &Regex| -> Option<u32> {
            re.captures_iter(output)
                .filter_map(|c| c[1].parse::<u32>().ok())
                .last()
        };
        let passed = count(&PASSED_COUNT);
        let failed = count(&FAILED_COUNT);
        if passed.is_none() && failed.is_none() {
            return None;
        }
        let (passed, failed) = (passed.unwrap_or(0), failed.unwrap_or(0));
        Some(Self {
            total: passed + failed,
            passed,
            failed,
        })
    }

    fn from_marks(output: &str) -> Option<Self> {
        let passed = output.matches('✓').count() as u32;
        let failed = output.matches('✗').count() as u32 + output.matches('×').count() as u32;
        if passed + failed == 0 {
            return None;
        }
        Some(Self {
            total: passed + failed,
            passed,
            failed,
        })
    }
}
