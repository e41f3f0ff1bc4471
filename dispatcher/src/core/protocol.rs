//! Parser for the agent's stdout protocol.
//!
//! The agent may wrap its final message in a JSON result envelope. Inside the
//! message (or the raw stdout), structured fields are delimited by literal
//! start/end markers. Candidates are scanned in order: the envelope's `result`
//! text first, then the full raw stdout, because the final assistant turn can
//! omit markers that an earlier turn printed.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::types::{ExecutionMetrics, TokenUsage};

pub const FLAG_START: &str = "TASK_FLAGGED";
pub const FLAG_END: &str = "TASK_FLAGGED_END";
pub const COMMIT_START: &str = "COMMIT_HASH_START";
pub const COMMIT_END: &str = "COMMIT_HASH_END";
pub const NOTES_START: &str = "DEV_NOTES_START";
pub const NOTES_END: &str = "DEV_NOTES_END";

const REASON_LABEL: &str = "Reason:";

static COMMIT_HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{7,40}$").expect("commit hash regex"));

/// Structured fields recovered from one agent run's stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    /// Final assistant text from the JSON envelope, if stdout was one.
    pub result: Option<String>,
    pub metrics: Option<ExecutionMetrics>,
    pub flagged: Option<String>,
    pub commit_hash: Option<String>,
    pub dev_notes: Option<String>,
}

/// Content of a commit-hash block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMarker {
    /// The agent declared `none`.
    NoCommit,
    Hash(String),
    /// Anything else; never surfaced as a hash.
    Invalid,
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    usage: Option<EnvelopeUsage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvelopeUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_input_tokens: u64,
    cache_read_input_tokens: u64,
}

impl ResultEnvelope {
    fn metrics(&self) -> Option<ExecutionMetrics> {
        let metrics = ExecutionMetrics {
            turns: self.num_turns,
            cost_usd: self.total_cost_usd.or(self.cost_usd),
            duration_ms: self.duration_ms,
            usage: self.usage.as_ref().map(|usage| TokenUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_creation_input_tokens: usage.cache_creation_input_tokens,
                cache_read_input_tokens: usage.cache_read_input_tokens,
            }),
        };
        (metrics != ExecutionMetrics::default()).then_some(metrics)
    }
}

/// Parse the agent's stdout into structured fields. Pure; performs no I/O.
pub fn parse_agent_output(stdout: &str) -> ParsedOutput {
    let envelope = parse_envelope(stdout);
    let result = envelope
        .as_ref()
        .and_then(|env| env.result.clone())
        .filter(|text| !text.trim().is_empty());
    let metrics = envelope.as_ref().and_then(ResultEnvelope::metrics);

    let mut candidates: Vec<&str> = Vec::with_capacity(2);
    if let Some(text) = result.as_deref() {
        candidates.push(text);
    }
    candidates.push(stdout);

    ParsedOutput {
        flagged: first_present(&candidates, extract_flag_reason),
        commit_hash: extract_commit_hash(&candidates),
        dev_notes: first_present(&candidates, extract_dev_notes),
        result,
        metrics,
    }
}

/// Return the trimmed text between the first `start` marker and the first
/// `end` marker, or `None` when either is missing or `end` comes first.
///
/// A `start` that is a prefix of `end` (`TASK_FLAGGED` in `TASK_FLAGGED_END`)
/// is not matched inside an end marker.
pub fn extract_block<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let start_idx = text
        .match_indices(start)
        .map(|(idx, _)| idx)
        .find(|&idx| !text[idx..].starts_with(end))?;
    let end_idx = text.find(end)?;
    let body_start = start_idx + start.len();
    if end_idx < body_start {
        return None;
    }
    Some(text[body_start..end_idx].trim())
}

/// Classify the content of a commit-hash block.
pub fn parse_commit_marker(content: &str) -> CommitMarker {
    let content = content.trim();
    if content.eq_ignore_ascii_case("none") {
        return CommitMarker::NoCommit;
    }
    if COMMIT_HASH_RE.is_match(content) {
        return CommitMarker::Hash(content.to_string());
    }
    CommitMarker::Invalid
}

fn extract_flag_reason(text: &str) -> Option<String> {
    let block = extract_block(text, FLAG_START, FLAG_END)?;
    let reason = match block.find(REASON_LABEL) {
        Some(idx) => {
            let after = block[idx + REASON_LABEL.len()..].trim();
            if after.is_empty() { block } else { after }
        }
        None => block,
    };
    (!reason.is_empty()).then(|| reason.to_string())
}

fn extract_dev_notes(text: &str) -> Option<String> {
    extract_block(text, NOTES_START, NOTES_END)
        .filter(|notes| !notes.is_empty())
        .map(str::to_string)
}

fn extract_commit_hash(candidates: &[&str]) -> Option<String> {
    for text in candidates {
        let Some(block) = extract_block(text, COMMIT_START, COMMIT_END) else {
            continue;
        };
        match parse_commit_marker(block) {
            CommitMarker::NoCommit => return None,
            CommitMarker::Hash(hash) => return Some(hash),
            CommitMarker::Invalid => continue,
        }
    }
    None
}

fn first_present(candidates: &[&str], extract: fn(&str) -> Option<String>) -> Option<String> {
    candidates.iter().find_map(|text| extract(text))
}

/// Accept either a single JSON object or a stream whose last line is one.
fn parse_envelope(stdout: &str) -> Option<ResultEnvelope> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(envelope) = parse_object(trimmed) {
        return Some(envelope);
    }
    let last_line = trimmed.lines().rev().find(|line| !line.trim().is_empty())?;
    parse_object(last_line.trim())
}

fn parse_object(text: &str) -> Option<ResultEnvelope> {
    if !text.starts_with('{') {
        return None;
    }
    serde_json::from_str(text).ok()
}
