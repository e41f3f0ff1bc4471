//! Heuristic classification of failed agent runs.
//!
//! A "system" error means the environment is broken (missing binary, bad
//! credentials, throttling) rather than the task itself failing. The flag is
//! diagnostic metadata only; nothing retries or escalates on it.

const SYSTEM_ERROR_PATTERNS: &[&str] = &[
    "command not found",
    "enoent",
    "no such file or directory",
    "permission denied",
    "eacces",
    "authentication",
    "unauthorized",
    "invalid api key",
    "rate limit",
    "rate_limit",
    "too many requests",
];

/// True if the captured text matches a known environmental failure pattern.
pub fn looks_like_system_error(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    SYSTEM_ERROR_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}
