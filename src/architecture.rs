//! Architecture conformance checker.
//!
//! Rules are declarative predicates over file location (glob patterns) and
//! content shape (line patterns, inline type spans). Evaluation is a pure
//! function of the artifact set and the compiled rules: it detects and
//! reports, it never fixes.

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::config::ArchitectureSection;

pub const NO_LOGIC_IN_COMPOSITION_ROOT: &str = "no-logic-in-composition-root";
pub const NO_EXTERNAL_CALLS_IN_UI: &str = "no-external-calls-in-ui";
pub const NO_INLINE_SHARED_TYPES: &str = "no-inline-shared-types";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Snapshot of the sandbox's files, keyed by root-relative `/`-separated path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactSet {
    files: BTreeMap<String, String>,
}

impl ArtifactSet {
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }
}

impl<P: Into<String>, C: Into<String>> FromIterator<(P, C)> for ArtifactSet {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        let mut set = ArtifactSet::default();
        for (path, content) in iter {
            set.insert(path, content);
        }
        set
    }
}

/// Content predicate of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RuleCheck {
    /// No line may match `pattern`.
    ForbidPattern { pattern: String },
    /// No type or interface definition may span more than `max_lines` lines.
    MaxInlineTypeLines { max_lines: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureRule {
    pub id: String,
    pub description: String,
    /// Globs selecting the files the rule applies to.
    pub applies_to: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(flatten)]
    pub check: RuleCheck,
}

/// A single rule breach, surfaced verbatim to the calling phase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub line: usize,
    pub rule_id: String,
    pub excerpt: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} [{}] {}: {}",
            self.path, self.line, self.rule_id, self.message, self.excerpt
        )
    }
}

enum CompiledCheck {
    Forbid(Regex),
    InlineTypes(usize),
}

struct CompiledRule {
    rule: ArchitectureRule,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    check: CompiledCheck,
}

impl CompiledRule {
    fn applies(&self, path: &str) -> bool {
        self.include
            .iter()
            .any(|p| p.matches_with(path, MATCH_OPTIONS))
            && !self
                .exclude
                .iter()
                .any(|p| p.matches_with(path, MATCH_OPTIONS))
    }

    fn violation(&self, path: &str, line: usize, excerpt: &str, message: String) -> Violation {
        Violation {
            path: path.to_string(),
            line,
            rule_id: self.rule.id.clone(),
            excerpt: excerpt.trim().to_string(),
            message,
        }
    }

    fn evaluate(&self, path: &str, content: &str, out: &mut Vec<Violation>) {
        match &self.check {
            CompiledCheck::Forbid(re) => {
                for (idx, line) in content.lines().enumerate() {
                    if re.is_match(line) {
                        out.push(self.violation(path, idx + 1, line, self.rule.description.clone()));
                    }
                }
            }
            CompiledCheck::InlineTypes(max_lines) => {
                for (start, span, header) in type_definition_spans(content) {
                    if span > *max_lines {
                        out.push(self.violation(
                            path,
                            start + 1,
                            header,
                            format!(
                                "{} (definition spans {} lines, limit {})",
                                self.rule.description, span, max_lines
                            ),
                        ));
                    }
                }
            }
        }
    }
}

/// A compiled, ready-to-evaluate set of rules.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| &r.rule.id))
            .finish()
    }
}

impl RuleSet {
    pub fn compile(rules: Vec<ArchitectureRule>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let globs = |patterns: &[String]| -> Result<Vec<Pattern>> {
                patterns
                    .iter()
                    .map(|p| {
                        Pattern::new(p)
                            .with_context(|| format!("Invalid glob '{}' in rule {}", p, rule.id))
                    })
                    .collect()
            };
            let include = globs(&rule.applies_to)?;
            let exclude = globs(&rule.exclude)?;
            let check = match &rule.check {
                RuleCheck::ForbidPattern { pattern } => CompiledCheck::Forbid(
                    Regex::new(pattern)
                        .with_context(|| format!("Invalid pattern in rule {}", rule.id))?,
                ),
                RuleCheck::MaxInlineTypeLines { max_lines } => {
                    CompiledCheck::InlineTypes(*max_lines)
                }
            };
            compiled.push(CompiledRule {
                rule,
                include,
                exclude,
                check,
            });
        }
        Ok(Self { rules: compiled })
    }

    /// The three built-in layering rules, parameterized by configuration.
    pub fn standard(config: &ArchitectureSection) -> Result<Self> {
        let mut component_files = config.ui_dirs.clone();
        component_files.extend(config.page_dirs.iter().cloned());

        Self::compile(vec![
            ArchitectureRule {
                id: NO_LOGIC_IN_COMPOSITION_ROOT.to_string(),
                description: "no business logic in composition root".to_string(),
                applies_to: config.composition_roots.clone(),
                exclude: Vec::new(),
                check: RuleCheck::ForbidPattern {
                    pattern: config.external_call_pattern.clone(),
                },
            },
            ArchitectureRule {
                id: NO_EXTERNAL_CALLS_IN_UI.to_string(),
                description: "UI components must not call external services".to_string(),
                applies_to: config.ui_dirs.clone(),
                exclude: Vec::new(),
                check: RuleCheck::ForbidPattern {
                    pattern: config.external_call_pattern.clone(),
                },
            },
            ArchitectureRule {
                id: NO_INLINE_SHARED_TYPES.to_string(),
                description: "type definitions in components and pages must be externalized"
                    .to_string(),
                applies_to: component_files,
                exclude: Vec::new(),
                check: RuleCheck::MaxInlineTypeLines {
                    max_lines: config.max_inline_type_lines,
                },
            },
        ])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate every rule against every applicable file.
    ///
    /// The result is sorted, so an unchanged artifact set always yields an
    /// identical violation list.
    pub fn evaluate(&self, artifacts: &ArtifactSet) -> Vec<Violation> {
        let mut violations = Vec::new();
        for (path, content) in artifacts.iter() {
            for rule in self.rules.iter().filter(|r| r.applies(path)) {
                rule.evaluate(path, content, &mut violations);
            }
        }
        violations.sort();
        violations.dedup();
        violations
    }
}

static TYPE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(export\s+)?(declare\s+)?(interface|type)\s+[A-Za-z_$][\w$]*").unwrap()
});

/// Whether a brace-less definition carries on past `line`.
fn continues_after(line: &str, next: Option<&&str>) -> bool {
    let line = line.trim_end();
    if line.ends_with(';') {
        return false;
    }
    let trailing = ['=', '|', '&', '<', ','].iter().any(|c| line.ends_with(*c));
    let leading = next
        .map(|n| n.trim_start())
        .is_some_and(|n| ['|', '&', '=', '>', '{'].iter().any(|c| n.starts_with(*c)));
    trailing || leading
}

/// `(start line index, span in lines, header line)` of each type or
/// interface definition in `content`.
fn type_definition_spans(content: &str) -> Vec<(usize, usize, &str)> {
    let lines: Vec<&str> = content.lines().collect();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if !TYPE_HEADER.is_match(lines[i]) {
            i += 1;
            continue;
        }
        let mut depth: i32 = 0;
        let mut opened = false;
        let mut end = lines.len() - 1;
        for (j, line) in lines.iter().enumerate().skip(i) {
            for ch in line.chars() {
                match ch {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            let closed = if opened {
                depth <= 0
            } else {
                !continues_after(line, lines.get(j + 1))
            };
            if closed {
                end = j;
                break;
            }
        }
        spans.push((i, end - i + 1, lines[i]));
        i = end + 1;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> RuleSet {
        RuleSet::standard(&ArchitectureSection::default()).unwrap()
    }

    #[test]
    fn test_composition_root_external_call_is_one_violation() {
        let artifacts: ArtifactSet = [(
            "codebase/src/App.tsx",
            "import Home from './pages/Home';\nconst data = fetch('/api/items');\nexport default function App() { return <Home />; }\n",
        )]
        .into_iter()
        .collect();
        let violations = rules().evaluate(&artifacts);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_id, NO_LOGIC_IN_COMPOSITION_ROOT);
        assert_eq!(violations[0].line, 2);
        assert_eq!(violations[0].message, "no business logic in composition root");
    }

    #[test]
    fn test_compliant_tree_has_no_violations() {
        let artifacts: ArtifactSet = [
            (
                "codebase/src/App.tsx",
                "import Home from './pages/Home';\nexport default function App() { return <Home />; }\n",
            ),
            (
                "codebase/src/services/api.ts",
                "export const load = () => fetch('/api/items');\n",
            ),
            (
                "codebase/src/components/Card.tsx",
                "import type { Item } from '../types';\nexport function Card({ item }: { item: Item }) { return null; }\n",
            ),
        ]
        .into_iter()
        .collect();
        assert!(rules().evaluate(&artifacts).is_empty());
    }

    #[test]
    fn test_ui_component_calls_are_flagged() {
        let artifacts: ArtifactSet = [(
            "codebase/src/components/List.tsx",
            "import axios from 'axios';\nexport const List = () => null;\n",
        )]
        .into_iter()
        .collect();
        let violations = rules().evaluate(&artifacts);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_id, NO_EXTERNAL_CALLS_IN_UI);
    }

    #[test]
    fn test_long_inline_interface_in_page_is_flagged() {
        let page = "interface Props {\n  id: string;\n  name: string;\n  price: number;\n  tags: string[];\n  owner: string;\n}\ntype Short = { id: string };\nexport default function Page(p: Props) { return null; }\n";
        let artifacts: ArtifactSet = [("codebase/src/pages/Shop.tsx", page)].into_iter().collect();
        let violations = rules().evaluate(&artifacts);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_id, NO_INLINE_SHARED_TYPES);
        assert_eq!(violations[0].line, 1);
        assert!(violations[0].message.contains("spans 7 lines"));
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let artifacts: ArtifactSet = [
            ("codebase/src/main.tsx", "fetch('/a');\nnew WebSocket('ws://x');\n"),
            ("codebase/src/components/B.tsx", "const x = new XMLHttpRequest();\n"),
        ]
        .into_iter()
        .collect();
        let set = rules();
        let first = set.evaluate(&artifacts);
        let second = set.evaluate(&artifacts);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_glob_does_not_cross_directories_for_single_star() {
        let set = RuleSet::compile(vec![ArchitectureRule {
            id: "top-level-only".into(),
            description: "no TODO at top level".into(),
            applies_to: vec!["src/*.ts".into()],
            exclude: vec!["src/skip.ts".into()],
            check: RuleCheck::ForbidPattern {
                pattern: "TODO".into(),
            },
        }])
        .unwrap();
        let artifacts: ArtifactSet = [
            ("src/a.ts", "// TODO"),
            ("src/nested/b.ts", "// TODO"),
            ("src/skip.ts", "// TODO"),
        ]
        .into_iter()
        .collect();
        let violations = set.evaluate(&artifacts);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "src/a.ts");
    }

    #[test]
    fn test_invalid_pattern_fails_compilation() {
        let err = RuleSet::compile(vec![ArchitectureRule {
            id: "broken".into(),
            description: "broken".into(),
            applies_to: vec!["**/*.ts".into()],
            exclude: Vec::new(),
            check: RuleCheck::ForbidPattern {
                pattern: "fetch(".into(),
            },
        }])
        .unwrap_err();
        assert!(format!("{:#}", err).contains("broken"));
    }

    #[test]
    fn test_type_spans_handle_unions_and_nesting() {
        let src = "type A =\n  | 'a'\n  | 'b';\ninterface B {\n  inner: { x: number };\n}\n";
        let spans: Vec<_> = type_definition_spans(src)
            .into_iter()
            .map(|(s, n, _)| (s, n))
            .collect();
        assert_eq!(spans, vec![(0, 3), (3, 3)]);
    }

    #[test]
    fn test_unterminated_alias_ends_on_its_own_line() {
        let page = "type Id = string\nexport default function Shop() {\n  const a = 1;\n  const b = 2;\n  const c = 3;\n  const d = 4;\n  return null;\n}\n";
        let spans: Vec<_> = type_definition_spans(page)
            .into_iter()
            .map(|(s, n, _)| (s, n))
            .collect();
        assert_eq!(spans, vec![(0, 1)]);

        let artifacts: ArtifactSet = [("codebase/src/pages/Shop.tsx", page)].into_iter().collect();
        assert!(rules().evaluate(&artifacts).is_empty());
    }

    #[test]
    fn test_multiline_alias_without_semicolon_spans_its_members() {
        let src = "type Status =\n  | 'open'\n  | 'closed'\nconst x = 1;\n";
        let spans: Vec<_> = type_definition_spans(src)
            .into_iter()
            .map(|(s, n, _)| (s, n))
            .collect();
        assert_eq!(spans, vec![(0, 3)]);
    }
}
