// SPDX-License-Identifier: MIT
//! Distinguished error types shared across the engine.

/// Raised when a fallible operation exhausted its retry budget and the
/// caller should *degrade the job's state* rather than treat this as an
/// ordinary operation failure.
///
/// A distinct type carrying the same information as a plain exhaustion,
/// used purely so callers can pattern-match on "should I degrade this job?"
/// instead of inspecting error strings.
#[derive(Debug, thiserror::Error)]
#[error("state-level retry exhausted: {0}")]
pub struct StateRetryError(pub String);

impl StateRetryError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Errors surfaced by the remote transfer facade.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote returned a non-success status: {status} — {message}")]
    Api { status: String, message: String },
    #[error("descriptor was rejected as a duplicate after {attempts} attempts")]
    DuplicateDescriptorRetriesExhausted { attempts: u32 },
    #[error("descriptor file not found: {0}")]
    DescriptorMissing(String),
    #[error("descriptor I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the local fetcher facade.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("download request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("download I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
