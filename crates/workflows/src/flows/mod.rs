//! Core commerce workflows built on the engine.

pub mod cart;
pub mod common;
pub mod links;
pub mod order;

pub use cart::{create_cart_workflow, CREATE_CART_WORKFLOW_ID};
pub use common::{use_remote_query_step, RemoteQueryInput, USE_REMOTE_QUERY_STEP_ID};
pub use links::{
    create_link_workflow, dismiss_link_workflow, update_link_workflow, CREATE_LINK_WORKFLOW_ID,
    DISMISS_LINK_WORKFLOW_ID, UPDATE_LINK_WORKFLOW_ID,
};
pub use order::{
    begin_claim_order_workflow, request_item_return_workflow, BEGIN_CLAIM_ORDER_WORKFLOW_ID,
    REQUEST_ITEM_RETURN_WORKFLOW_ID,
};

use tracing::info;

use crate::{workflow::WorkflowEngine, Result};

/// Register every core flow on `engine`.
pub async fn register_core_flows(engine: &WorkflowEngine) -> Result<()> {
    for definition in [
        create_cart_workflow()?,
        request_item_return_workflow()?,
        begin_claim_order_workflow()?,
        create_link_workflow()?,
        dismiss_link_workflow()?,
        update_link_workflow()?,
    ] {
        engine.register(definition).await?;
    }
    info!("Registered {} core flows", engine.workflow_ids().await.len());
    Ok(())
}
