//! Incident reporting for unexpected failures.
//!
//! Expected failures are answered on the wire and never reach a reporter.
//! Everything else (I/O, corrupt storage, unreadable audio) is reported
//! together with the account that triggered it.

use crate::error::Error;

/// Identity used when no account is logged in on the connection.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Sink for unexpected failures.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, identity: &str, error: &Error);
}

/// Reports incidents as `tracing` errors under the `incident` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, identity: &str, error: &Error) {
        tracing::error!(target: "incident", user = %identity, error = %error, "Unexpected failure");
    }
}
