//! Append-only log of every inference exchange.
//!
//! The log is a JSON array at `<reports_dir>/agent_trace.json`. Writing is
//! best-effort: a failed append is logged at `warn` and never interrupts a run.
//! A log that no longer parses is renamed to `agent_trace.json.corrupt`
//! before a new one is started.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::obs;

pub const TRACE_FILE_NAME: &str = "agent_trace.json";

const PROMPT_SUMMARY_LEN: usize = 200;
const RESPONSE_PREVIEW_LEN: usize = 500;

/// One exchange between an agent and a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub agent: String,
    pub model: String,
    pub action: String,
    pub prompt_summary: String,
    pub response_preview: String,
}

impl TraceEntry {
    pub fn new(agent: &str, model: &str, action: &str, prompt: &str, response: &str) -> Self {
        Self {
            agent: agent.to_string(),
            model: model.to_string(),
            action: action.to_string(),
            prompt_summary: preview(prompt, PROMPT_SUMMARY_LEN),
            response_preview: preview(response, RESPONSE_PREVIEW_LEN),
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Trace sink. A disabled log accepts and drops entries.
#[derive(Debug, Default)]
pub struct TraceLog {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl TraceLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// `<dir>/agent_trace.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(TRACE_FILE_NAME))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, entry: TraceEntry) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = append(path, entry) {
            obs::emit_persist_error("trace", &err);
        }
    }

    /// Start a fresh log for a new run.
    pub fn reset(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => obs::emit_persist_error("trace", &e),
        }
    }

    /// Read every entry back; empty when the log is disabled or missing.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.path
            .as_deref()
            .and_then(|p| std::fs::read(p).ok())
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }
}

/// Where an unreadable log is moved before a fresh one is started.
pub fn corrupt_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    path.with_file_name(name)
}

fn append(path: &Path, entry: TraceEntry) -> std::io::Result<()> {
    let mut entries: Vec<TraceEntry> = match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                let aside = corrupt_path_for(path);
                tracing::warn!(
                    event = "trace.corrupt",
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "starting a new agent trace"
                );
                std::fs::rename(path, &aside)?;
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };
    entries.push(entry);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(&entries)?;
    std::fs::write(path, json)
}
