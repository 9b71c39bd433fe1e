//! Vulnerability records produced by the scan orchestrator.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// File tag used when the inference service names a file outside the batch.
pub const UNKNOWN_FILE: &str = "unknown";

/// Reported severity, parsed case-insensitively from model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
            Self::Info => "Info",
            Self::Unknown => "Unknown",
        }
    }
}

impl From<String> for Severity {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "medium" | "moderate" => Self::Medium,
            "low" => Self::Low,
            "info" | "informational" => Self::Info,
            _ => Self::Unknown,
        }
    }
}

impl From<Severity> for String {
    fn from(severity: Severity) -> Self {
        severity.as_str().to_string()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding reported by the inference service.
///
/// `file` is the file's label: its bare name, or the shortest trailing path
/// that tells it apart when another scanned file shares the name. The pipeline
/// resolves it back to a path with [`crate::scan::file_labels`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    #[serde(default = "unknown_file")]
    pub file: String,
    #[serde(default, deserialize_with = "lenient_line")]
    pub line: u32,
    #[serde(rename = "type", alias = "vulnerability", default)]
    pub vuln_type: String,
    #[serde(default = "unknown_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_graph: Option<String>,
}

fn unknown_file() -> String {
    UNKNOWN_FILE.to_string()
}

fn unknown_severity() -> Severity {
    Severity::Unknown
}

/// Models return line numbers as integers, strings, or ranges like "12-14".
fn lenient_line<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        serde_json::Value::String(s) => s
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| !part.is_empty())
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0),
        _ => 0,
    })
}

/// Identity used for dashboards, events and report aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VulnerabilityId {
    pub file: String,
    pub vuln_type: String,
    pub line: u32,
}

impl fmt::Display for VulnerabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.file, self.line, self.vuln_type)
    }
}

const KNOWN_CATEGORIES: &[(&str, &str)] = &[
    ("sql injection", "SQL Injection"),
    ("command injection", "Command Injection"),
    ("path traversal", "Path Traversal"),
    ("ssrf", "SSRF"),
    ("hardcoded", "Hardcoded Secret"),
];

const MAX_CATEGORY_LEN: usize = 25;

impl VulnerabilityRecord {
    pub fn new(
        file: impl Into<String>,
        line: u32,
        vuln_type: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            line,
            vuln_type: vuln_type.into(),
            severity,
            description: description.into(),
            attack_graph: None,
        }
    }

    pub fn id(&self) -> VulnerabilityId {
        VulnerabilityId {
            file: self.file.clone(),
            vuln_type: self.vuln_type.clone(),
            line: self.line,
        }
    }

    /// Short canonical category label for display.
    ///
    /// Matches well-known classes against the type and description; anything
    /// else falls back to the raw type, truncated.
    pub fn category(&self) -> String {
        let kind = self.vuln_type.to_lowercase();
        let description = self.description.to_lowercase();
        for (needle, label) in KNOWN_CATEGORIES {
            if kind.contains(needle) || description.contains(needle) {
                return (*label).to_string();
            }
        }
        if self.vuln_type.trim().is_empty() {
            return "Unknown".to_string();
        }
        self.vuln_type.chars().take(MAX_CATEGORY_LEN).collect()
    }

    /// Return a copy attributed to another file name.
    pub fn retagged(&self, file: &str) -> Self {
        Self {
            file: file.to_string(),
            ..self.clone()
        }
    }

    pub fn is_unknown_file(&self) -> bool {
        self.file == UNKNOWN_FILE
    }
}
