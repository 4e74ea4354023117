use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{modules::SharedContext, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub name: String,
    pub currency_code: String,
}

#[async_trait]
pub trait RegionService: Send + Sync {
    async fn retrieve(&self, id: &str, ctx: &SharedContext) -> Result<Region>;
    async fn list(&self, ctx: &SharedContext) -> Result<Vec<Region>>;
}

#[derive(Debug, Default)]
pub struct InMemoryRegionService {
    regions: RwLock<BTreeMap<String, Region>>,
}

impl InMemoryRegionService {
    pub fn new(regions: impl IntoIterator<Item = Region>) -> Self {
        Self {
            regions: RwLock::new(regions.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }
}

#[async_trait]
impl RegionService for InMemoryRegionService {
    async fn retrieve(&self, id: &str, ctx: &SharedContext) -> Result<Region> {
        debug!("Retrieving region {} (transaction {:?})", id, ctx.transaction_id);
        self.regions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Region with id: {} was not found", id)))
    }

    async fn list(&self, _ctx: &SharedContext) -> Result<Vec<Region>> {
        Ok(self.regions.read().await.values().cloned().collect())
    }
}
