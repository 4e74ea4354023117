//! Commerce module services reached from workflow steps.
//!
//! Every service method takes the caller's [`SharedContext`] explicitly; a
//! step obtains one from [`crate::workflow::StepContext::shared`].

pub mod cart;
pub mod customer;
pub mod order;
pub mod region;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use cart::{Cart, CartService, CreateCart, InMemoryCartService};
pub use customer::{CreateCustomer, Customer, CustomerService, InMemoryCustomerService};
pub use order::{
    CreateOrderChange, CreateOrderChangeAction, CreateOrderClaim, InMemoryOrderService, OrderChange,
    OrderChangeAction, OrderClaim, OrderService,
};
pub use region::{InMemoryRegionService, Region, RegionService};

/// Transactional context handed to module services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedContext {
    pub transaction_id: Option<String>,
    pub workflow_id: Option<String>,
}

impl SharedContext {
    pub fn for_transaction(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: Some(transaction_id.into()),
            workflow_id: None,
        }
    }
}

/// Call `f` with the given context, or with a fresh one when the caller has none.
pub fn with_shared_context<T, F>(context: Option<&SharedContext>, f: F) -> T
where
    F: FnOnce(&SharedContext) -> T,
{
    match context {
        Some(context) => f(context),
        None => f(&SharedContext::default()),
    }
}

pub(crate) fn generate_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}
