use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    modules::{generate_id, SharedContext},
    Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderChangeAction {
    pub order_change_id: Option<String>,
    pub order_id: String,
    #[serde(default)]
    pub return_id: Option<String>,
    #[serde(default)]
    pub claim_id: Option<String>,
    #[serde(default)]
    pub version: Option<i64>,
    pub action: String,
    #[serde(default)]
    pub internal_note: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderChangeAction {
    pub id: String,
    #[serde(flatten)]
    pub data: CreateOrderChangeAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderClaim {
    #[serde(rename = "type")]
    pub claim_type: String,
    pub order_id: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderClaim {
    pub id: String,
    #[serde(flatten)]
    pub data: CreateOrderClaim,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderChange {
    pub change_type: String,
    pub order_id: String,
    #[serde(default)]
    pub claim_id: Option<String>,
    #[serde(default)]
    pub return_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub internal_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderChange {
    pub id: String,
    pub status: String,
    pub version: i64,
    #[serde(flatten)]
    pub data: CreateOrderChange,
}

#[async_trait]
pub trait OrderService: Send + Sync {
    async fn create_order_change_actions(
        &self,
        data: Vec<CreateOrderChangeAction>,
        ctx: &SharedContext,
    ) -> Result<Vec<OrderChangeAction>>;
    async fn delete_order_change_actions(&self, ids: Vec<String>, ctx: &SharedContext) -> Result<()>;
    async fn list_order_change_actions(&self, order_id: &str, ctx: &SharedContext) -> Result<Vec<OrderChangeAction>>;

    async fn create_claims(&self, data: Vec<CreateOrderClaim>, ctx: &SharedContext) -> Result<Vec<OrderClaim>>;
    async fn delete_claims(&self, ids: Vec<String>, ctx: &SharedContext) -> Result<()>;
    async fn list_claims(&self, order_id: &str, ctx: &SharedContext) -> Result<Vec<OrderClaim>>;

    async fn create_order_change(&self, data: CreateOrderChange, ctx: &SharedContext) -> Result<OrderChange>;
    async fn delete_order_changes(&self, ids: Vec<String>, ctx: &SharedContext) -> Result<()>;
    async fn list_order_changes(&self, order_id: &str, ctx: &SharedContext) -> Result<Vec<OrderChange>>;
}

#[derive(Debug, Default)]
pub struct InMemoryOrderService {
    actions: RwLock<BTreeMap<String, OrderChangeAction>>,
    claims: RwLock<BTreeMap<String, OrderClaim>>,
    changes: RwLock<BTreeMap<String, OrderChange>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn create_order_change_actions(
        &self,
        data: Vec<CreateOrderChangeAction>,
        ctx: &SharedContext,
    ) -> Result<Vec<OrderChangeAction>> {
        let mut actions = self.actions.write().await;
        let created: Vec<OrderChangeAction> = data
            .into_iter()
            .map(|data| OrderChangeAction {
                id: generate_id("ordchact"),
                data,
            })
            .collect();
        for action in &created {
            debug!("Creating order change action {} (transaction {:?})", action.id, ctx.transaction_id);
            actions.insert(action.id.clone(), action.clone());
        }
        Ok(created)
    }

    async fn delete_order_change_actions(&self, ids: Vec<String>, _ctx: &SharedContext) -> Result<()> {
        let mut actions = self.actions.write().await;
        for id in ids {
            actions.remove(&id);
        }
        Ok(())
    }

    async fn list_order_change_actions(&self, order_id: &str, _ctx: &SharedContext) -> Result<Vec<OrderChangeAction>> {
        Ok(self
            .actions
            .read()
            .await
            .values()
            .filter(|a| a.data.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn create_claims(&self, data: Vec<CreateOrderClaim>, ctx: &SharedContext) -> Result<Vec<OrderClaim>> {
        let mut claims = self.claims.write().await;
        let created: Vec<OrderClaim> = data
            .into_iter()
            .map(|data| OrderClaim {
                id: generate_id("claim"),
                data,
            })
            .collect();
        for claim in &created {
            debug!("Creating claim {} (transaction {:?})", claim.id, ctx.transaction_id);
            claims.insert(claim.id.clone(), claim.clone());
        }
        Ok(created)
    }

    async fn delete_claims(&self, ids: Vec<String>, _ctx: &SharedContext) -> Result<()> {
        let mut claims = self.claims.write().await;
        for id in ids {
            claims.remove(&id);
        }
        Ok(())
    }

    async fn list_claims(&self, order_id: &str, _ctx: &SharedContext) -> Result<Vec<OrderClaim>> {
        Ok(self
            .claims
            .read()
            .await
            .values()
            .filter(|c| c.data.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn create_order_change(&self, data: CreateOrderChange, ctx: &SharedContext) -> Result<OrderChange> {
        let mut changes = self.changes.write().await;
        let version = changes
            .values()
            .filter(|c| c.data.order_id == data.order_id)
            .count() as i64
            + 1;
        let change = OrderChange {
            id: generate_id("ordch"),
            status: "pending".to_string(),
            version,
            data,
        };
        debug!("Creating order change {} (transaction {:?})", change.id, ctx.transaction_id);
        changes.insert(change.id.clone(), change.clone());
        Ok(change)
    }

    async fn delete_order_changes(&self, ids: Vec<String>, _ctx: &SharedContext) -> Result<()> {
        let mut changes = self.changes.write().await;
        for id in ids {
            changes.remove(&id);
        }
        Ok(())
    }

    async fn list_order_changes(&self, order_id: &str, _ctx: &SharedContext) -> Result<Vec<OrderChange>> {
        Ok(self
            .changes
            .read()
            .await
            .values()
            .filter(|c| c.data.order_id == order_id)
            .cloned()
            .collect())
    }
}
