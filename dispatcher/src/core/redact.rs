//! Secret redaction for anything logged or sent to a notification sink.

use std::sync::LazyLock;

use regex::Regex;

pub const PLACEHOLDER: &str = "[REDACTED]";

/// Configured secrets shorter than this are ignored to avoid scrubbing common words.
const MIN_SECRET_LEN: usize = 6;

static CREDENTIAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Authorization headers.
        r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]{8,}",
        // Vendor API keys and tokens with well-known prefixes.
        r"\bsk-[A-Za-z0-9_-]{16,}",
        r"\bgh[pousr]_[A-Za-z0-9]{20,}",
        r"\bgithub_pat_[A-Za-z0-9_]{20,}",
        r"\bxox[abprs]-[A-Za-z0-9-]{10,}",
        // JWT-shaped triples.
        r"\beyJ[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("credential pattern"))
    .collect()
});

/// Replaces configured secret values and credential-shaped tokens with a placeholder.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|secret| secret.trim().len() >= MIN_SECRET_LEN)
            .collect();
        // Longest first so a secret containing another is replaced whole.
        secrets.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
        secrets.dedup();
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), PLACEHOLDER);
            }
        }
        for pattern in CREDENTIAL_PATTERNS.iter() {
            if pattern.is_match(&out) {
                out = pattern.replace_all(&out, PLACEHOLDER).into_owned();
            }
        }
        out
    }
}
