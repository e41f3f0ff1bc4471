//! Unattended task dispatcher.
//!
//! Operators queue natural-language tasks in a store; the [`executor`] picks
//! them up one at a time, hands each to an external coding agent, verifies
//! the commit it reports against the remote, and notifies the outcome.
//!
//! - **[`core`]**: Pure logic (output protocol parsing, error classification,
//!   redaction, directive rendering). No I/O.
//! - **[`io`]**: Side-effecting adapters (process supervision, git, task
//!   store, notifications, config). Each is a trait seam so tests can script it.
//!
//! [`executor`] and [`pipeline`] coordinate the two; [`idle`] tracks callers
//! waiting for in-flight work to drain.

pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod idle;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
