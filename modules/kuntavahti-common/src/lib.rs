pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{FetchError, FetchErrorKind, FetchResult};
pub use types::{
    CaseEventType, CaseStatus, Category, Confidence, DocType, DocumentRef, DocumentStatus,
    Platform, SourceConfig, Stage, TextStatus,
};
