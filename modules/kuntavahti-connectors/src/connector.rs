//! The capability every platform integration exposes: discover documents.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use kuntavahti_common::{DocumentRef, Platform, SourceConfig};

use crate::cloudnc::CloudNcConnector;
use crate::dynasty::DynastyConnector;
use crate::gateway::Gateway;
use crate::municipal_website::MunicipalWebsiteConnector;
use crate::tweb::TwebConnector;

/// The slice of a source row a connector needs.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub id: i64,
    pub municipality: String,
    pub base_url: String,
    pub config: SourceConfig,
}

impl SourceSpec {
    /// Municipality label for emitted refs; the config may override the row.
    pub fn municipality_label(&self) -> String {
        self.config
            .municipality
            .clone()
            .unwrap_or_else(|| self.municipality.clone())
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn platform(&self) -> Platform;

    /// Discover currently listed documents. A single unparseable item is
    /// skipped; a failure to read a whole listing page propagates.
    async fn discover(&self) -> Result<Vec<DocumentRef>>;
}

/// Build the connector for a source's platform.
pub fn make_connector(
    platform: Platform,
    spec: SourceSpec,
    gateway: Arc<Gateway>,
) -> Box<dyn Connector> {
    match platform {
        Platform::Cloudnc => Box::new(CloudNcConnector::new(spec, gateway)),
        Platform::Dynasty => Box::new(DynastyConnector::new(spec, gateway)),
        Platform::Tweb => Box::new(TwebConnector::new(spec, gateway)),
        Platform::MunicipalWebsite => Box::new(MunicipalWebsiteConnector::new(spec, gateway)),
    }
}
