pub mod cloudnc;
pub mod connector;
pub mod dynasty;
pub mod gateway;
pub mod municipal_website;
pub mod parse;
pub mod security;
pub mod tweb;

pub use connector::{make_connector, Connector, SourceSpec};
pub use gateway::{Gateway, Response};
pub use security::UrlValidator;
