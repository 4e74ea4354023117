use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{links::LinkRegistry, modules::SharedContext, Error, Result};

/// One end of a concrete link: `service.key = id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEnd {
    pub service: String,
    pub key: String,
    pub id: String,
}

impl LinkEnd {
    pub fn new(service: impl Into<String>, key: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            key: key.into(),
            id: id.into(),
        }
    }
}

/// A link between two records, with optional extra data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDefinition {
    pub left: LinkEnd,
    pub right: LinkEnd,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LinkDefinition {
    pub fn new(left: LinkEnd, right: LinkEnd) -> Self {
        Self { left, right, data: None }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn same_records(&self, other: &LinkDefinition) -> bool {
        (self.left == other.left && self.right == other.right)
            || (self.left == other.right && self.right == other.left)
    }
}

#[async_trait]
pub trait RemoteLink: Send + Sync {
    /// Returns the links that were created.
    async fn create(&self, links: Vec<LinkDefinition>, ctx: &SharedContext) -> Result<Vec<LinkDefinition>>;
    /// Returns the links that existed and were removed.
    async fn dismiss(&self, links: Vec<LinkDefinition>, ctx: &SharedContext) -> Result<Vec<LinkDefinition>>;
    /// Replaces the data of existing links. Returns their previous versions.
    async fn update(&self, links: Vec<LinkDefinition>, ctx: &SharedContext) -> Result<Vec<LinkDefinition>>;
    async fn list(&self, ctx: &SharedContext) -> Result<Vec<LinkDefinition>>;
}

pub struct InMemoryRemoteLink {
    registry: Arc<LinkRegistry>,
    links: RwLock<Vec<LinkDefinition>>,
}

impl InMemoryRemoteLink {
    pub fn new(registry: Arc<LinkRegistry>) -> Self {
        Self {
            registry,
            links: RwLock::new(Vec::new()),
        }
    }

    fn check_declared(&self, link: &LinkDefinition) -> Result<()> {
        let left = (link.left.service.as_str(), link.left.key.as_str());
        let right = (link.right.service.as_str(), link.right.key.as_str());
        self.registry.find_link(left, right).map(|_| ()).ok_or_else(|| {
            Error::NotFound(format!(
                "Module to link {} and {} was not found",
                link.left.service, link.right.service
            ))
        })
    }
}

#[async_trait]
impl RemoteLink for InMemoryRemoteLink {
    async fn create(&self, links: Vec<LinkDefinition>, ctx: &SharedContext) -> Result<Vec<LinkDefinition>> {
        for link in &links {
            self.check_declared(link)?;
        }
        let mut stored = self.links.write().await;
        let mut created = Vec::new();
        for link in links {
            if stored.iter().any(|existing| existing.same_records(&link)) {
                continue;
            }
            debug!(
                "Linking {}.{} to {}.{} (transaction {:?})",
                link.left.service, link.left.id, link.right.service, link.right.id, ctx.transaction_id
            );
            stored.push(link.clone());
            created.push(link);
        }
        Ok(created)
    }

    async fn dismiss(&self, links: Vec<LinkDefinition>, ctx: &SharedContext) -> Result<Vec<LinkDefinition>> {
        let mut stored = self.links.write().await;
        let mut dismissed = Vec::new();
        for link in links {
            if let Some(position) = stored.iter().position(|existing| existing.same_records(&link)) {
                debug!(
                    "Dismissing link {}.{} to {}.{} (transaction {:?})",
                    link.left.service, link.left.id, link.right.service, link.right.id, ctx.transaction_id
                );
                dismissed.push(stored.remove(position));
            }
        }
        Ok(dismissed)
    }

    async fn update(&self, links: Vec<LinkDefinition>, _ctx: &SharedContext) -> Result<Vec<LinkDefinition>> {
        let mut stored = self.links.write().await;
        let mut previous = Vec::with_capacity(links.len());
        for link in &links {
            let existing = stored
                .iter()
                .find(|existing| existing.same_records(link))
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "Link between {} {} and {} {} was not found",
                        link.left.service, link.left.id, link.right.service, link.right.id
                    ))
                })?;
            previous.push(existing.clone());
        }
        for link in links {
            if let Some(existing) = stored.iter_mut().find(|existing| existing.same_records(&link)) {
                existing.data = link.data;
            }
        }
        Ok(previous)
    }

    async fn list(&self, _ctx: &SharedContext) -> Result<Vec<LinkDefinition>> {
        Ok(self.links.read().await.clone())
    }
}
