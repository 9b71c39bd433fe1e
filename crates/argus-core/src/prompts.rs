//! Prompt assembly for every inference operation.
//!
//! Instruction documents are embedded defaults; the audit document can be
//! overridden from the skills directory and the repair document is the live
//! [`crate::skill::SkillStore`] content.

use std::path::Path;

use crate::domain::VulnerabilityRecord;

pub const REPAIR_SKILL_FILE: &str = "repair_code.md";
pub const AUDIT_SKILL_FILE: &str = "audit_code.md";

pub const DEFAULT_REPAIR_SKILL: &str = include_str!("../skills/repair_code.md");
pub const DEFAULT_AUDIT_SKILL: &str = include_str!("../skills/audit_code.md");
pub const EXPLOIT_INSTRUCTIONS: &str = include_str!("../skills/generate_exploit.md");
pub const ATTACK_GRAPH_INSTRUCTIONS: &str = include_str!("../skills/attack_graph.md");

/// Maximum characters of verifier output fed back into a retry.
pub const MAX_FEEDBACK_CHARS: usize = 1000;

/// `<skills_dir>/audit_code.md` if readable, else the embedded default.
pub fn load_audit_instructions(skills_dir: &Path) -> String {
    std::fs::read_to_string(skills_dir.join(AUDIT_SKILL_FILE))
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_AUDIT_SKILL.to_string())
}

fn vulnerability_json(vulnerability: &VulnerabilityRecord) -> String {
    serde_json::to_string_pretty(vulnerability).unwrap_or_else(|_| format!("{vulnerability:?}"))
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// One request covering every file in a scan batch. `files` holds
/// `(file name, redacted content)` pairs.
pub fn scan_prompt(instructions: &str, files: &[(String, String)]) -> String {
    let mut prompt = format!("{instructions}\n\nCode to Analyze:\n");
    for (name, content) in files {
        prompt.push_str(&format!("\n### File: {name}\n```python\n{content}\n```\n"));
    }
    prompt
}

pub fn patch_prompt(
    skill: &str,
    vulnerability: &VulnerabilityRecord,
    file_name: &str,
    content: &str,
    feedback: Option<&str>,
) -> String {
    let mut prompt = format!(
        "{skill}\n\nVulnerability Details:\n{}\n\nFile Name: {file_name}\n\nOriginal Code:\n```python\n{content}\n```\n",
        vulnerability_json(vulnerability),
    );
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\n\nIMPORTANT: Your previous patch attempt FAILED with this error:\n```\n{}\n```\nAnalyze the error and generate a CORRECTED patch.\n",
            truncate_chars(feedback, MAX_FEEDBACK_CHARS)
        ));
    }
    prompt
}

pub fn exploit_prompt(vulnerability: &VulnerabilityRecord, file_name: &str, content: &str) -> String {
    format!(
        "{EXPLOIT_INSTRUCTIONS}\n\nVulnerability Details:\n{}\n\nFile Name: {file_name}\n\nTarget Code:\n```python\n{content}\n```\n",
        vulnerability_json(vulnerability),
    )
}

pub fn attack_graph_prompt(vulnerability: &VulnerabilityRecord, file_name: &str) -> String {
    format!(
        "{ATTACK_GRAPH_INSTRUCTIONS}\n\nVulnerability Details:\n{}\n\nFile Name: {file_name}\n",
        vulnerability_json(vulnerability),
    )
}

pub fn improve_skill_prompt(current_skill: &str, failure: &str) -> String {
    format!(
        r#"You maintain the instructions that guide a code-repair agent.

## Context
The agent followed the instructions below to fix a vulnerability and failed on every attempt.

## The Failure
```text
{failure}
```

## Current Instructions
```markdown
{current_skill}
```

## Task
Rewrite the instructions so this failure cannot happen again.
* Add exactly ONE new rule, as a markdown list item, that addresses the failure.
* Keep every existing heading and every existing rule word for word.
* Keep the format STRICTLY the same.
* Return ONLY the new content of the markdown file.
"#
    )
}
