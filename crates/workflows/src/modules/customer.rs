use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    modules::{generate_id, SharedContext},
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateCustomer {
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[async_trait]
pub trait CustomerService: Send + Sync {
    async fn retrieve(&self, id: &str, ctx: &SharedContext) -> Result<Customer>;
    async fn list_by_email(&self, email: &str, ctx: &SharedContext) -> Result<Vec<Customer>>;
    async fn create(&self, data: Vec<CreateCustomer>, ctx: &SharedContext) -> Result<Vec<Customer>>;
    async fn delete(&self, ids: Vec<String>, ctx: &SharedContext) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCustomerService {
    customers: RwLock<BTreeMap<String, Customer>>,
}

impl InMemoryCustomerService {
    pub fn new(customers: impl IntoIterator<Item = Customer>) -> Self {
        Self {
            customers: RwLock::new(customers.into_iter().map(|c| (c.id.clone(), c)).collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.customers.read().await.len()
    }
}

#[async_trait]
impl CustomerService for InMemoryCustomerService {
    async fn retrieve(&self, id: &str, _ctx: &SharedContext) -> Result<Customer> {
        self.customers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Customer with id: {} was not found", id)))
    }

    async fn list_by_email(&self, email: &str, _ctx: &SharedContext) -> Result<Vec<Customer>> {
        Ok(self
            .customers
            .read()
            .await
            .values()
            .filter(|c| c.email.as_deref() == Some(email))
            .cloned()
            .collect())
    }

    async fn create(&self, data: Vec<CreateCustomer>, ctx: &SharedContext) -> Result<Vec<Customer>> {
        let mut customers = self.customers.write().await;
        let created: Vec<Customer> = data
            .into_iter()
            .map(|input| Customer {
                id: generate_id("cus"),
                email: input.email,
                first_name: input.first_name,
                last_name: input.last_name,
            })
            .collect();
        for customer in &created {
            debug!("Creating customer {} (transaction {:?})", customer.id, ctx.transaction_id);
            customers.insert(customer.id.clone(), customer.clone());
        }
        Ok(created)
    }

    async fn delete(&self, ids: Vec<String>, ctx: &SharedContext) -> Result<()> {
        let mut customers = self.customers.write().await;
        for id in ids {
            debug!("Deleting customer {} (transaction {:?})", id, ctx.transaction_id);
            customers.remove(&id);
        }
        Ok(())
    }
}
