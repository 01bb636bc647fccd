pub mod merge;
pub mod migrate;
pub mod records;
pub mod store;

pub use merge::{score_case_match, MergeCandidate, MergeQuery, MERGE_THRESHOLD};
pub use records::{
    CaseEventRow, CaseRow, DocumentRow, EvidenceRow, FileRow, NewCase, SourceRow, UpsertOutcome,
};
pub use store::Store;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored value: {0}")]
    Corrupt(String),
}
