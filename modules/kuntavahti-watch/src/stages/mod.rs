//! Pipeline stages. Each stage claims a document, does its work with every
//! side effect durable before the status moves, and finishes with a
//! compare-and-set transition; a lost CAS means another worker got there
//! first and the result is discarded.

pub mod case_build;
pub mod discover;
pub mod extract;
pub mod fetch;
pub mod triage;

pub use discover::{run_discover, DiscoverStats};

/// How a stage run ended for one document. The stage runner applies the
/// transition policy: retryable failures leave the status in place,
/// permanent ones park the document in `error` with a diagnostic.
#[derive(Debug)]
pub enum StageError {
    Retryable(String),
    Permanent(String),
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageError::Retryable(msg) => write!(f, "retryable: {msg}"),
            StageError::Permanent(msg) => write!(f, "permanent: {msg}"),
        }
    }
}

pub type StageResult = std::result::Result<(), StageError>;

impl From<kuntavahti_store::StoreError> for StageError {
    fn from(e: kuntavahti_store::StoreError) -> Self {
        // DB contention clears; a busy store is never a reason to park a
        // document in error.
        StageError::Retryable(e.to_string())
    }
}
