use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    modules::{generate_id, SharedContext},
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: String,
    pub region_id: Option<String>,
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub currency_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateCart {
    #[serde(default)]
    pub region_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub currency_code: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[async_trait]
pub trait CartService: Send + Sync {
    async fn create_carts(&self, data: Vec<CreateCart>, ctx: &SharedContext) -> Result<Vec<Cart>>;
    async fn delete_carts(&self, ids: Vec<String>, ctx: &SharedContext) -> Result<()>;
    async fn retrieve(&self, id: &str, ctx: &SharedContext) -> Result<Cart>;
}

#[derive(Debug, Default)]
pub struct InMemoryCartService {
    carts: RwLock<BTreeMap<String, Cart>>,
}

impl InMemoryCartService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.carts.read().await.len()
    }
}

#[async_trait]
impl CartService for InMemoryCartService {
    async fn create_carts(&self, data: Vec<CreateCart>, ctx: &SharedContext) -> Result<Vec<Cart>> {
        let mut carts = self.carts.write().await;
        let mut created = Vec::with_capacity(data.len());
        for input in data {
            if input.currency_code.is_empty() {
                return Err(Error::Validation("currency_code is required to create a cart".into()));
            }
            let cart = Cart {
                id: generate_id("cart"),
                region_id: input.region_id,
                customer_id: input.customer_id,
                email: input.email,
                currency_code: input.currency_code.to_lowercase(),
                metadata: input.metadata,
            };
            debug!("Creating cart {} (transaction {:?})", cart.id, ctx.transaction_id);
            carts.insert(cart.id.clone(), cart.clone());
            created.push(cart);
        }
        Ok(created)
    }

    async fn delete_carts(&self, ids: Vec<String>, ctx: &SharedContext) -> Result<()> {
        let mut carts = self.carts.write().await;
        for id in ids {
            debug!("Deleting cart {} (transaction {:?})", id, ctx.transaction_id);
            carts.remove(&id);
        }
        Ok(())
    }

    async fn retrieve(&self, id: &str, _ctx: &SharedContext) -> Result<Cart> {
        self.carts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Cart with id: {} was not found", id)))
    }
}
