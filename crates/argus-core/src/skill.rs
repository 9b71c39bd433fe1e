//! The repair skill document and its self-improvement step.
//!
//! [`SkillStore`] owns the one live copy of the instructions every patch
//! request is built from. The only way to change it is
//! [`SkillStore::replace`], which [`SkillImprover`] calls after a validated
//! rewrite.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::inference::{strip_markdown_fences, BackendChain, InferenceError, ResponseFormat};
use crate::obs;
use crate::prompts::{self, DEFAULT_REPAIR_SKILL, REPAIR_SKILL_FILE};
use crate::trace::{TraceEntry, TraceLog};

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("skill rewrite request failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("skill rewrite is empty")]
    Empty,

    #[error("skill rewrite dropped heading {0:?}")]
    MissingHeading(String),

    #[error("skill rewrite dropped rule {0:?}")]
    DroppedRule(String),

    #[error("skill rewrite must add exactly one rule (had {before}, got {after})")]
    RuleCount { before: usize, after: usize },

    #[error("new rule {0:?} does not mention the failure it is meant to prevent")]
    UnrelatedRule(String),

    #[error("failed to persist skill document: {0}")]
    Persist(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SkillError>;

/// Versioned instruction text. Version 1 is whatever was loaded at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillDocument {
    pub content: String,
    pub version: u64,
}

impl SkillDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            version: 1,
        }
    }

    pub fn headings(&self) -> Vec<&str> {
        headings(&self.content)
    }

    pub fn rules(&self) -> Vec<&str> {
        rule_lines(&self.content)
    }
}

fn headings(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('#'))
        .collect()
}

/// Markdown list items: `- x`, `* x`, `1. x`.
fn is_rule_line(line: &str) -> bool {
    if line.starts_with("- ") || line.starts_with("* ") {
        return true;
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && line[digits..].starts_with(". ")
}

fn rule_lines(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| is_rule_line(l))
        .collect()
}

/// Words too common in test output to tie a rule to a failure.
const NOISE_WORDS: &[&str] = &[
    "assert", "assertion", "assertionerror", "error", "exception", "expected", "failed",
    "false", "file", "from", "line", "none", "self", "test", "tests", "that", "this",
    "traceback", "true", "with",
];

/// Lowercase words of four or more characters that say something about
/// `failure`.
fn failure_terms(failure: &str) -> Vec<String> {
    let mut terms: Vec<String> = failure
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|word| word.chars().count() >= 4)
        .map(str::to_lowercase)
        .filter(|word| !NOISE_WORDS.contains(&word.as_str()))
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Check that `candidate` keeps every heading and rule of `prior` and adds
/// exactly one rule that mentions a term from `failure`. A failure with no
/// usable terms skips that last check. Returns the cleaned candidate text.
pub fn validate_rewrite(prior: &str, candidate: &str, failure: &str) -> Result<String> {
    let cleaned = strip_markdown_fences(candidate).unwrap_or_else(|| candidate.trim().to_string());
    if cleaned.trim().is_empty() {
        return Err(SkillError::Empty);
    }

    let new_headings = headings(&cleaned);
    for heading in headings(prior) {
        if !new_headings.contains(&heading) {
            return Err(SkillError::MissingHeading(heading.to_string()));
        }
    }

    let old_rules = rule_lines(prior);
    let mut remaining = rule_lines(&cleaned);
    for rule in &old_rules {
        match remaining.iter().position(|r| r == rule) {
            Some(idx) => {
                remaining.swap_remove(idx);
            }
            None => return Err(SkillError::DroppedRule((*rule).to_string())),
        }
    }
    if remaining.len() != 1 {
        return Err(SkillError::RuleCount {
            before: old_rules.len(),
            after: old_rules.len() + remaining.len(),
        });
    }
    let added = remaining[0].to_lowercase();
    let terms = failure_terms(failure);
    if !terms.is_empty() && !terms.iter().any(|term| added.contains(term.as_str())) {
        return Err(SkillError::UnrelatedRule(remaining[0].to_string()));
    }

    let mut out = cleaned;
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// Process-wide holder of the repair skill.
#[derive(Debug)]
pub struct SkillStore {
    document: RwLock<SkillDocument>,
    path: Option<PathBuf>,
}

impl SkillStore {
    /// Not backed by a file; updates live only in memory.
    pub fn in_memory(content: impl Into<String>) -> Self {
        Self {
            document: RwLock::new(SkillDocument::new(content)),
            path: None,
        }
    }

    /// Load `<skills_dir>/repair_code.md`, falling back to the embedded default.
    pub fn load(skills_dir: &Path) -> Self {
        let path = skills_dir.join(REPAIR_SKILL_FILE);
        let content = std::fs::read_to_string(&path)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REPAIR_SKILL.to_string());
        Self {
            document: RwLock::new(SkillDocument::new(content)),
            path: Some(path),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn snapshot(&self) -> SkillDocument {
        self.document.read().await.clone()
    }

    /// Replace the document, bumping its version. The backing file is written
    /// first; if that fails the in-memory document is unchanged.
    pub async fn replace(&self, content: String) -> Result<SkillDocument> {
        let mut guard = self.document.write().await;
        if let Some(path) = &self.path {
            persist_atomic(path, &content)?;
        }
        guard.content = content;
        guard.version += 1;
        Ok(guard.clone())
    }
}

fn persist_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Rewrites the skill so the same failure is not repeated.
pub struct SkillImprover {
    chain: BackendChain,
    trace: Arc<TraceLog>,
}

impl SkillImprover {
    pub fn new(chain: BackendChain, trace: Arc<TraceLog>) -> Self {
        Self { chain, trace }
    }

    /// Ask for a rewrite that adds one rule addressing `failure`, validate it,
    /// and install it. On any error the store is left untouched.
    pub async fn improve(&self, store: &SkillStore, failure: &str) -> Result<SkillDocument> {
        let current = store.snapshot().await;
        let prompt = prompts::improve_skill_prompt(&current.content, failure);
        let response = self.chain.generate(&prompt, ResponseFormat::Text).await?;
        self.trace.record(TraceEntry::new(
            "ImproverAgent",
            &response.backend,
            "improve_skill",
            &format!("Rewriting {REPAIR_SKILL_FILE}"),
            &response.text,
        ));

        let rewritten = validate_rewrite(&current.content, &response.text, failure)?;
        let updated = store.replace(rewritten).await?;
        obs::emit_skill_upgraded(updated.version, updated.rules().len());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIOR: &str = "# Skill\n\n## Rules\n\n- Keep signatures.\n- Use parameters.\n";
    const FAILURE: &str = "AssertionError: shlex module imported twice";

    #[test]
    fn rule_lines_recognise_list_styles() {
        let doc = "- a\n* b\n12. c\n-not a rule\n  - nested\n";
        assert_eq!(rule_lines(doc), vec!["- a", "* b", "12. c", "- nested"]);
    }

    #[test]
    fn accepts_one_added_rule() {
        let candidate = format!("{PRIOR}- Never import `shlex` twice.\n");
        let out = validate_rewrite(PRIOR, &candidate, FAILURE).unwrap();
        assert!(out.contains("shlex"));
    }

    #[test]
    fn strips_fences_before_validating() {
        let candidate = format!("```markdown\n{PRIOR}- Import shlex once.\n```");
        let out = validate_rewrite(PRIOR, &candidate, FAILURE).unwrap();
        assert!(!out.contains("```"));
    }

    #[test]
    fn rejects_empty_rewrite() {
        assert!(matches!(validate_rewrite(PRIOR, "  \n", FAILURE), Err(SkillError::Empty)));
    }

    #[test]
    fn rejects_dropped_heading() {
        let candidate = "# Skill\n\n- Keep signatures.\n- Use parameters.\n- New.\n";
        assert!(matches!(
            validate_rewrite(PRIOR, candidate, FAILURE),
            Err(SkillError::MissingHeading(h)) if h == "## Rules"
        ));
    }

    #[test]
    fn rejects_dropped_rule() {
        let candidate = "# Skill\n\n## Rules\n\n- Keep signatures.\n- New one.\n- Another.\n";
        assert!(matches!(
            validate_rewrite(PRIOR, candidate, FAILURE),
            Err(SkillError::DroppedRule(r)) if r == "- Use parameters."
        ));
    }

    #[test]
    fn rejects_zero_or_two_new_rules() {
        assert!(matches!(
            validate_rewrite(PRIOR, PRIOR, FAILURE),
            Err(SkillError::RuleCount { before: 2, after: 2 })
        ));
        let two = format!("{PRIOR}- One.\n- Two.\n");
        assert!(matches!(
            validate_rewrite(PRIOR, &two, FAILURE),
            Err(SkillError::RuleCount { before: 2, after: 4 })
        ));
    }

    #[test]
    fn rejects_rule_unrelated_to_failure() {
        let candidate = format!("{PRIOR}- Prefer tabs over spaces.\n");
        assert!(matches!(
            validate_rewrite(PRIOR, &candidate, FAILURE),
            Err(SkillError::UnrelatedRule(r)) if r == "- Prefer tabs over spaces."
        ));
    }

    #[test]
    fn failure_terms_skip_noise() {
        assert_eq!(
            failure_terms("AssertionError: cursor was never closed (test failed)"),
            vec!["closed", "cursor", "never"]
        );
        assert!(failure_terms("E   assert 1 == 2").is_empty());
        let candidate = format!("{PRIOR}- Anything at all.\n");
        assert!(validate_rewrite(PRIOR, &candidate, "E   assert 1 == 2").is_ok());
    }

    #[tokio::test]
    async fn replace_bumps_version_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkillStore::load(dir.path());
        assert_eq!(store.snapshot().await.version, 1);
        assert_eq!(store.snapshot().await.content, DEFAULT_REPAIR_SKILL);

        let updated = store.replace("# New\n- rule\n".to_string()).await.unwrap();
        assert_eq!(updated.version, 2);
        let on_disk = std::fs::read_to_string(dir.path().join(REPAIR_SKILL_FILE)).unwrap();
        assert_eq!(on_disk, "# New\n- rule\n");
    }

    #[tokio::test]
    async fn load_prefers_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(REPAIR_SKILL_FILE), PRIOR).unwrap();
        let store = SkillStore::load(dir.path());
        assert_eq!(store.snapshot().await.rules().len(), 2);
    }
}
