//! Cache-aware batched scanning.
//!
//! For every candidate file the orchestrator hashes the current content and
//! consults the scan cache, first by path and then by identical content
//! anywhere in the cache. Whatever is left is sent as one redacted batch.
//! Files in the batch with identical content are sent once.
//!
//! Each file is shown to the model under its label (see [`file_labels`]) and
//! findings are attributed by matching the reported file against those
//! labels. A finding that fits several files is dropped and none of those
//! files is cached, so the next scan asks again.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CacheStore, ContentHash, ScanCache, ScanCacheEntry};
use crate::domain::{VulnerabilityRecord, UNKNOWN_FILE};
use crate::inference::{
    parse_structured, BackendChain, ResponseFormat, Result, ScanResult, UsageLedger,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::prompts;
use crate::redact::redact_secrets;
use crate::trace::{TraceEntry, TraceLog};

/// What one scan produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Findings attributed to requested files, in input file order.
    pub vulnerabilities: Vec<VulnerabilityRecord>,
    /// Findings that named no requested file, or more than one, tagged `unknown`.
    pub discarded: Vec<VulnerabilityRecord>,
    /// Files whose results came from the cache.
    pub cached_files: Vec<PathBuf>,
    /// Files sent for inference, one per distinct content.
    pub scanned_files: Vec<PathBuf>,
    /// Batched inference requests issued (0 or 1).
    pub inference_requests: usize,
}

/// Bare file name used to attribute findings.
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// `path` made absolute against the working directory, without touching the
/// filesystem. Cache keys and sibling artifacts are built from this form.
pub fn absolute_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn normal_components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Label per file, in input order.
///
/// A label is the bare file name unless another requested file shares it.
/// Then it is the shortest run of trailing path components that no other
/// requested path ends with, so `auth/login.py` and `legacy/login.py` stay
/// apart.
pub fn file_labels(files: &[PathBuf]) -> Vec<String> {
    let parts: Vec<Vec<String>> = files.iter().map(|p| normal_components(p)).collect();
    parts
        .iter()
        .enumerate()
        .map(|(i, own)| {
            (1..=own.len())
                .map(|k| &own[own.len() - k..])
                .find(|suffix| {
                    !parts
                        .iter()
                        .enumerate()
                        .any(|(j, other)| j != i && other != own && other.ends_with(suffix))
                })
                .map(|suffix| suffix.join("/"))
                .unwrap_or_else(|| own.join("/"))
        })
        .collect()
}

/// Which pending file a reported name refers to.
#[derive(Debug, PartialEq, Eq)]
enum Attribution {
    File(usize),
    Ambiguous(Vec<usize>),
    Unknown,
}

fn attribute(reported: &str, labels: &[Vec<&str>]) -> Attribution {
    let reported: Vec<&str> = reported
        .trim()
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    if reported.is_empty() {
        return Attribution::Unknown;
    }
    // The model echoed a label, possibly with extra leading directories.
    if let Some(idx) = labels.iter().position(|label| reported.ends_with(label)) {
        return Attribution::File(idx);
    }
    // The model shortened a label, usually to the bare name.
    let matches: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|(_, label)| label.ends_with(&reported))
        .map(|(idx, _)| idx)
        .collect();
    match matches.len() {
        0 => Attribution::Unknown,
        1 => Attribution::File(matches[0]),
        _ => Attribution::Ambiguous(matches),
    }
}

struct Candidate {
    path: PathBuf,
    label: String,
    hash: ContentHash,
    content: String,
}

/// Fresh findings per batch index, plus the indices whose results are
/// incomplete and must not be cached.
struct BatchFindings {
    by_index: Vec<Vec<VulnerabilityRecord>>,
    unsettled: HashSet<usize>,
}

pub struct ScanOrchestrator {
    chain: BackendChain,
    store: Arc<dyn CacheStore>,
    cache: ScanCache,
    instructions: String,
    trace: Arc<TraceLog>,
}

impl ScanOrchestrator {
    /// Loads the cache from `store` immediately; corruption yields an empty cache.
    pub fn new(
        chain: BackendChain,
        store: Arc<dyn CacheStore>,
        instructions: impl Into<String>,
        trace: Arc<TraceLog>,
    ) -> Self {
        let cache = store.load();
        Self {
            chain,
            store,
            cache,
            instructions: instructions.into(),
            trace,
        }
    }

    pub fn cache(&self) -> &ScanCache {
        &self.cache
    }

    /// Ledger shared by this scanner's chain and every clone of it.
    pub fn usage_ledger(&self) -> Arc<UsageLedger> {
        self.chain.ledger()
    }

    /// Scan `files`, reusing cached results where the content is unchanged.
    ///
    /// # Errors
    ///
    /// Backend exhaustion or a malformed scan result. The cache is not
    /// written in that case.
    pub async fn scan(&mut self, files: &[PathBuf]) -> Result<ScanOutcome> {
        let files: Vec<PathBuf> = files.iter().map(|p| absolute_path(p)).collect();
        let labels = file_labels(&files);
        let mut outcome = ScanOutcome::default();
        let mut per_file: HashMap<PathBuf, Vec<VulnerabilityRecord>> = HashMap::new();
        let mut order = Vec::with_capacity(files.len());
        let mut pending: Vec<Candidate> = Vec::new();
        // Batch index of the first file with a given hash.
        let mut first_by_hash: HashMap<ContentHash, usize> = HashMap::new();
        let mut duplicates: Vec<(Candidate, usize)> = Vec::new();
        let mut dirty = false;

        for (path, label) in files.iter().zip(labels) {
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(event = "scan.unreadable", path = %path.display(), error = %e);
                    continue;
                }
            };
            let hash = ContentHash::compute(&bytes);
            order.push(path.clone());

            if let Some(vulns) = self.cache.lookup(path, &hash) {
                METRICS.inc_cache_hits();
                per_file.insert(path.clone(), retag_all(vulns, &label));
                outcome.cached_files.push(path.clone());
                continue;
            }
            if let Some((_, vulns)) = self.cache.lookup_by_hash(&hash) {
                METRICS.inc_cache_hits();
                let vulns = retag_all(vulns, &label);
                self.cache.insert(ScanCacheEntry {
                    path: path.clone(),
                    content_hash: hash,
                    vulnerabilities: vulns.clone(),
                });
                dirty = true;
                per_file.insert(path.clone(), vulns);
                outcome.cached_files.push(path.clone());
                continue;
            }

            let candidate = Candidate {
                path: path.clone(),
                label,
                hash,
                content: String::from_utf8_lossy(&bytes).into_owned(),
            };
            match first_by_hash.get(&hash) {
                Some(&idx) => duplicates.push((candidate, idx)),
                None => {
                    first_by_hash.insert(hash, pending.len());
                    pending.push(candidate);
                }
            }
        }

        if !pending.is_empty() {
            let fresh = self.scan_batch(&pending, &mut outcome).await?;
            outcome.inference_requests = 1;

            for (idx, candidate) in pending.iter().enumerate() {
                let vulns = fresh.by_index[idx].clone();
                if !fresh.unsettled.contains(&idx) {
                    self.cache.insert(ScanCacheEntry {
                        path: candidate.path.clone(),
                        content_hash: candidate.hash,
                        vulnerabilities: vulns.clone(),
                    });
                }
                per_file.insert(candidate.path.clone(), vulns);
                outcome.scanned_files.push(candidate.path.clone());
            }
            for (candidate, idx) in duplicates {
                METRICS.inc_cache_hits();
                let vulns = retag_all(&fresh.by_index[idx], &candidate.label);
                if !fresh.unsettled.contains(&idx) {
                    self.cache.insert(ScanCacheEntry {
                        path: candidate.path.clone(),
                        content_hash: candidate.hash,
                        vulnerabilities: vulns.clone(),
                    });
                }
                per_file.insert(candidate.path.clone(), vulns);
                outcome.cached_files.push(candidate.path);
            }
            dirty = true;
        }

        if dirty {
            if let Err(err) = self.store.persist(&self.cache) {
                obs::emit_persist_error("scan_cache", &err);
            }
        }

        for path in &order {
            if let Some(vulns) = per_file.remove(path) {
                outcome.vulnerabilities.extend(vulns);
            }
        }
        obs::emit_scan_batch(
            files.len(),
            outcome.cached_files.len(),
            outcome.scanned_files.len(),
            outcome.vulnerabilities.len(),
        );
        Ok(outcome)
    }

    /// One request for every pending file.
    async fn scan_batch(
        &self,
        pending: &[Candidate],
        outcome: &mut ScanOutcome,
    ) -> Result<BatchFindings> {
        let redacted: Vec<(String, String)> = pending
            .iter()
            .map(|c| (c.label.clone(), redact_secrets(&c.content)))
            .collect();
        let prompt = prompts::scan_prompt(&self.instructions, &redacted);

        let response = self.chain.generate(&prompt, ResponseFormat::Json).await?;
        self.trace.record(TraceEntry::new(
            "ScannerAgent",
            &response.backend,
            "scan_project",
            &format!("Scanning {} files in batch", pending.len()),
            &response.text,
        ));
        let result: ScanResult = parse_structured(&response.text)?;

        let labels: Vec<Vec<&str>> = pending
            .iter()
            .map(|c| c.label.split('/').collect())
            .collect();
        let mut findings = BatchFindings {
            by_index: vec![Vec::new(); pending.len()],
            unsettled: HashSet::new(),
        };
        for record in result.vulnerabilities {
            match attribute(&record.file, &labels) {
                Attribution::File(idx) => {
                    let tagged = record.retagged(&pending[idx].label);
                    findings.by_index[idx].push(tagged);
                }
                Attribution::Ambiguous(indices) => {
                    tracing::warn!(
                        event = "scan.ambiguous_file",
                        file = %record.file,
                        candidates = indices.len(),
                        "finding matches several files; not caching them"
                    );
                    findings.unsettled.extend(indices);
                    outcome.discarded.push(record.retagged(UNKNOWN_FILE));
                }
                Attribution::Unknown => {
                    obs::emit_hallucinated_file(&record.file);
                    outcome.discarded.push(record.retagged(UNKNOWN_FILE));
                }
            }
        }
        Ok(findings)
    }
}

fn retag_all(vulns: &[VulnerabilityRecord], name: &str) -> Vec<VulnerabilityRecord> {
    vulns.iter().map(|v| v.retagged(name)).collect()
}
