//! Folding a supervised agent run into a [`SubprocessResult`].

use std::time::Duration;

use crate::core::classifier::looks_like_system_error;
use crate::core::protocol::parse_agent_output;
use crate::core::types::{ProcessOutcome, SubprocessResult};

/// Keep at most this many trailing characters of captured output in error text.
const ERROR_TAIL_CHARS: usize = 2_000;

/// The agent process could not be started at all.
pub fn spawn_failure(error: &str) -> SubprocessResult {
    SubprocessResult {
        success: false,
        error: Some(format!("could not start agent: {error}")),
        is_system_error: Some(looks_like_system_error(error)),
        ..SubprocessResult::default()
    }
}

/// Interpret a finished (or killed) agent process.
pub fn from_process(outcome: &ProcessOutcome, timeout: Duration) -> SubprocessResult {
    if outcome.timed_out {
        return SubprocessResult {
            success: false,
            error: Some(format!(
                "agent timed out after {timeout:?} and was terminated"
            )),
            ..SubprocessResult::default()
        };
    }

    if !outcome.success {
        let captured = if outcome.stderr.trim().is_empty() {
            outcome.stdout.as_str()
        } else {
            outcome.stderr.as_str()
        };
        let code = outcome
            .exit_code
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        let detail = tail(captured.trim(), ERROR_TAIL_CHARS);
        let error = if detail.is_empty() {
            format!("agent exited with status {code}")
        } else {
            format!("agent exited with status {code}: {detail}")
        };
        let combined = format!("{}\n{}", outcome.stderr, outcome.stdout);
        return SubprocessResult {
            success: false,
            error: Some(error),
            is_system_error: Some(looks_like_system_error(&combined)),
            ..SubprocessResult::default()
        };
    }

    let parsed = parse_agent_output(&outcome.stdout);
    SubprocessResult {
        success: true,
        notes: parsed.dev_notes,
        error: None,
        is_system_error: None,
        metrics: parsed.metrics,
        flagged: parsed.flagged,
        commit_hash: parsed.commit_hash,
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(exit_code: i32, stdout: &str, stderr: &str) -> ProcessOutcome {
        ProcessOutcome {
            success: exit_code == 0,
            exit_code: Some(exit_code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            ..ProcessOutcome::default()
        }
    }

    #[test]
    fn timeout_is_failure_without_classification() {
        let outcome = ProcessOutcome {
            timed_out: true,
            exit_code: None,
            ..ProcessOutcome::default()
        };
        let result = from_process(&outcome, Duration::from_secs(90));
        assert!(!result.success);
        assert!(result.error.as_deref().expect("error").contains("timed out after 90s"));
        assert_eq!(result.is_system_error, None);
    }

    #[test]
    fn sub_second_timeout_is_reported_precisely() {
        let outcome = ProcessOutcome {
            timed_out: true,
            ..ProcessOutcome::default()
        };
        let result = from_process(&outcome, Duration::from_millis(250));
        assert_eq!(
            result.error.as_deref(),
            Some("agent timed out after 250ms and was terminated")
        );
    }

    #[test]
    fn non_zero_exit_prefers_stderr() {
        let result = from_process(&finished(2, "partial", "boom"), Duration::from_secs(1));
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("agent exited with status 2: boom")
        );
        assert_eq!(result.is_system_error, Some(false));
    }

    #[test]
    fn non_zero_exit_classifies_environment_failures() {
        let result = from_process(
            &finished(1, "", "Error: Invalid API key"),
            Duration::from_secs(1),
        );
        assert_eq!(result.is_system_error, Some(true));
    }

    #[test]
    fn spawn_failure_is_classified_as_system() {
        let result = spawn_failure("No such file or directory (os error 2)");
        assert!(!result.success);
        assert!(result.error.as_deref().expect("error").starts_with("could not start agent"));
        assert_eq!(result.is_system_error, Some(true));
    }

    #[test]
    fn zero_exit_parses_protocol() {
        let stdout = "DEV_NOTES_START\nnotes\nDEV_NOTES_END\nCOMMIT_HASH_START\nabc1234\nCOMMIT_HASH_END";
        let result = from_process(&finished(0, stdout, ""), Duration::from_secs(1));
        assert!(result.success);
        assert_eq!(result.notes.as_deref(), Some("notes"));
        assert_eq!(result.commit_hash.as_deref(), Some("abc1234"));
        assert_eq!(result.flagged, None);
    }

    #[test]
    fn tail_keeps_last_characters() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 3), "abc");
        assert_eq!(tail("ééé", 2), "éé");
    }
}
