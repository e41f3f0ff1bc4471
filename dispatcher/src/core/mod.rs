//! Deterministic, pure logic shared by the dispatcher.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (captured process output, task records) and return deterministic
//! results suitable for tests against literal strings.

pub mod classifier;
pub mod directive;
pub mod outcome;
pub mod protocol;
pub mod redact;
pub mod types;
