use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    flows::common::{use_remote_query_step, RemoteQueryInput},
    modules::{CreateOrderChange, CreateOrderChangeAction, CreateOrderClaim, OrderService},
    workflow::{
        create_step, create_workflow, parse_input, Data, StepConfig, StepContext, StepDefinition,
        StepResponse, WorkflowDefinition,
    },
    Error, Result,
};

pub const REQUEST_ITEM_RETURN_WORKFLOW_ID: &str = "request-item-return";
pub const BEGIN_CLAIM_ORDER_WORKFLOW_ID: &str = "begin-claim-order";

pub const CREATE_ORDER_CHANGE_ACTIONS_STEP_ID: &str = "create-order-change-actions";
pub const CREATE_ORDER_CLAIMS_STEP_ID: &str = "create-order-claims";
pub const CREATE_ORDER_CHANGE_STEP_ID: &str = "create-order-change";

const RETURN_ITEM_ACTION: &str = "RETURN_ITEM";

fn is_canceled(status: Option<&str>) -> bool {
    matches!(status, Some("canceled") | Some("cancelled"))
}

fn status(entity: &Value) -> Option<&str> {
    entity.get("status").and_then(Value::as_str)
}

fn id(entity: &Value) -> &str {
    entity.get("id").and_then(Value::as_str).unwrap_or_default()
}

pub fn throw_if_order_is_cancelled(order: &Value) -> Result<()> {
    if is_canceled(status(order)) {
        return Err(Error::NotAllowed(format!(
            "Order with id {} has been cancelled.",
            id(order)
        )));
    }
    Ok(())
}

pub fn throw_if_return_is_cancelled(order_return: &Value) -> Result<()> {
    if is_canceled(status(order_return)) {
        return Err(Error::NotAllowed(format!(
            "Return with id {} has been cancelled.",
            id(order_return)
        )));
    }
    Ok(())
}

/// An order change accepts new actions only while it is still open.
pub fn throw_if_order_change_is_not_active(order_change: &Value) -> Result<()> {
    if order_change.is_null() {
        return Err(Error::NotAllowed("An active order change is required".to_string()));
    }
    match status(order_change) {
        Some(closed @ ("canceled" | "cancelled" | "declined" | "confirmed")) => Err(Error::NotAllowed(
            format!("Order change {} is {}", id(order_change), closed),
        )),
        _ => Ok(()),
    }
}

pub fn throw_if_items_does_not_exists_in_order(order: &Value, items: &[ReturnItem]) -> Result<()> {
    let order_items = order.get("items").and_then(Value::as_array);
    let missing: Vec<&str> = items
        .iter()
        .filter(|item| {
            !order_items.map_or(false, |order_items| {
                order_items.iter().any(|oi| oi.get("id").and_then(Value::as_str) == Some(item.id.as_str()))
            })
        })
        .map(|item| item.id.as_str())
        .collect();

    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "Items with ids {} does not exist in order with id {}.",
            missing.join(", "),
            id(order)
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReturnItem {
    pub id: String,
    pub quantity: i64,
    #[serde(default)]
    pub internal_note: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RequestItemReturnValidation {
    order: Value,
    order_return: Value,
    order_change: Value,
    #[serde(default)]
    items: Vec<ReturnItem>,
}

fn request_item_return_validation_step() -> StepDefinition {
    create_step("request-item-return-validation", validate_request_item_return)
}

async fn validate_request_item_return(input: Value, _ctx: StepContext) -> Result<StepResponse> {
    let input: RequestItemReturnValidation = parse_input("request-item-return-validation", input)?;
    throw_if_order_is_cancelled(&input.order)?;
    throw_if_return_is_cancelled(&input.order_return)?;
    throw_if_order_change_is_not_active(&input.order_change)?;
    throw_if_items_does_not_exists_in_order(&input.order, &input.items)?;
    Ok(StepResponse::empty())
}

fn begin_claim_order_validation_step() -> StepDefinition {
    create_step("begin-claim-order-validation", validate_begin_claim_order)
}

async fn validate_begin_claim_order(input: Value, _ctx: StepContext) -> Result<StepResponse> {
    throw_if_order_is_cancelled(&input["order"])?;
    Ok(StepResponse::empty())
}

pub fn create_order_change_actions_step() -> StepDefinition {
    create_step(CREATE_ORDER_CHANGE_ACTIONS_STEP_ID, create_order_change_actions)
        .compensate(delete_order_change_actions)
}

async fn create_order_change_actions(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let data: Vec<CreateOrderChangeAction> = parse_input(CREATE_ORDER_CHANGE_ACTIONS_STEP_ID, input)?;
    let service = ctx.resolve::<dyn OrderService>()?;
    let actions = service.create_order_change_actions(data, &ctx.shared()).await?;
    let ids: Vec<&str> = actions.iter().map(|a| a.id.as_str()).collect();
    let compensate_input = json!(ids);
    Ok(StepResponse::with_compensation(serde_json::to_value(&actions)?, compensate_input))
}

async fn delete_order_change_actions(input: Value, ctx: StepContext) -> Result<()> {
    let ids: Vec<String> = parse_input(CREATE_ORDER_CHANGE_ACTIONS_STEP_ID, input)?;
    if ids.is_empty() {
        return Ok(());
    }
    let service = ctx.resolve::<dyn OrderService>()?;
    service.delete_order_change_actions(ids, &ctx.shared()).await
}

pub fn create_order_claims_step() -> StepDefinition {
    create_step(CREATE_ORDER_CLAIMS_STEP_ID, create_order_claims).compensate(delete_order_claims)
}

async fn create_order_claims(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let data: Vec<CreateOrderClaim> = parse_input(CREATE_ORDER_CLAIMS_STEP_ID, input)?;
    let service = ctx.resolve::<dyn OrderService>()?;
    let claims = service.create_claims(data, &ctx.shared()).await?;
    let ids: Vec<&str> = claims.iter().map(|c| c.id.as_str()).collect();
    let compensate_input = json!(ids);
    Ok(StepResponse::with_compensation(serde_json::to_value(&claims)?, compensate_input))
}

async fn delete_order_claims(input: Value, ctx: StepContext) -> Result<()> {
    let ids: Vec<String> = parse_input(CREATE_ORDER_CLAIMS_STEP_ID, input)?;
    if ids.is_empty() {
        return Ok(());
    }
    let service = ctx.resolve::<dyn OrderService>()?;
    service.delete_claims(ids, &ctx.shared()).await
}

pub fn create_order_change_step() -> StepDefinition {
    create_step(CREATE_ORDER_CHANGE_STEP_ID, create_order_change).compensate(delete_order_change)
}

async fn create_order_change(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let data: CreateOrderChange = parse_input(CREATE_ORDER_CHANGE_STEP_ID, input)?;
    let service = ctx.resolve::<dyn OrderService>()?;
    let change = service.create_order_change(data, &ctx.shared()).await?;
    let compensate_input = json!(change.id);
    Ok(StepResponse::with_compensation(serde_json::to_value(&change)?, compensate_input))
}

async fn delete_order_change(input: Value, ctx: StepContext) -> Result<()> {
    let Some(id) = input.as_str() else {
        return Ok(());
    };
    let service = ctx.resolve::<dyn OrderService>()?;
    service.delete_order_changes(vec![id.to_string()], &ctx.shared()).await
}

/// One `RETURN_ITEM` action per requested item, attached to the open order change.
fn return_item_actions(data: Value) -> Result<Value> {
    let items: Vec<ReturnItem> = serde_json::from_value(data["items"].clone())
        .map_err(|e| Error::Validation(format!("Invalid return items: {}", e)))?;
    let order = &data["order"];
    let order_change = &data["order_change"];
    let order_return = &data["order_return"];

    let actions: Vec<Value> = items
        .into_iter()
        .map(|item| {
            json!({
                "order_change_id": order_change["id"],
                "order_id": order["id"],
                "return_id": order_return["id"],
                "version": order_change["version"],
                "action": RETURN_ITEM_ACTION,
                "internal_note": item.internal_note,
                "reference": "return",
                "reference_id": order_return["id"],
                "details": {
                    "reference_id": item.id,
                    "return_id": order_return["id"],
                    "quantity": item.quantity,
                    "metadata": item.metadata,
                },
            })
        })
        .collect();
    Ok(Value::Array(actions))
}

pub fn request_item_return_workflow() -> Result<WorkflowDefinition> {
    create_workflow(REQUEST_ITEM_RETURN_WORKFLOW_ID, |b, input| {
        let query = use_remote_query_step();

        let order_return = b.invoke_with(
            &query,
            RemoteQueryInput::entry_point("return", &["id", "status", "refund_amount", "order_id", "items.*"])
                .variable("id", input.get("return_id"))
                .single()
                .throw_if_key_not_found(),
            StepConfig::named("return-query"),
        )?;
        let order = b.invoke_with(
            &query,
            RemoteQueryInput::entry_point("orders", &["id", "status", "items.*"])
                .variable("id", order_return.get("order_id"))
                .single()
                .throw_if_key_not_found(),
            StepConfig::named("order-query"),
        )?;
        let order_change = b.invoke_with(
            &query,
            RemoteQueryInput::entry_point("order_change", &["id", "status", "version"])
                .variable("order_id", order_return.get("order_id"))
                .single(),
            StepConfig::named("order-change-query"),
        )?;

        let validation = b.invoke(
            &request_item_return_validation_step(),
            Data::object([
                ("order", order.clone()),
                ("items", input.get("items")),
                ("order_return", order_return.clone()),
                ("order_change", order_change.clone()),
            ]),
        )?;

        let actions_input = b.transform(
            "return-item-actions",
            Data::object([
                ("order", order),
                ("order_change", order_change),
                ("order_return", order_return),
                ("items", input.get("items")),
            ]),
            return_item_actions,
        )?;
        b.after(&actions_input, &[&validation])?;

        b.invoke(&create_order_change_actions_step(), actions_input)
    })
}

fn claim_order_change(data: Value) -> Result<Value> {
    let input = &data["input"];
    let claim_id = data["created"]
        .get(0)
        .and_then(|claim| claim.get("id"))
        .cloned()
        .ok_or_else(|| Error::Internal("no claim was created".to_string()))?;
    Ok(json!({
        "change_type": "claim",
        "order_id": input["order_id"],
        "claim_id": claim_id,
        "created_by": input["created_by"],
        "description": input["description"],
        "internal_note": input["internal_note"],
    }))
}

pub fn begin_claim_order_workflow() -> Result<WorkflowDefinition> {
    create_workflow(BEGIN_CLAIM_ORDER_WORKFLOW_ID, |b, input| {
        let order = b.invoke(
            &use_remote_query_step(),
            RemoteQueryInput::entry_point("orders", &["id", "status"])
                .variable("id", input.get("order_id"))
                .single()
                .throw_if_key_not_found(),
        )?;

        let validation = b.invoke(
            &begin_claim_order_validation_step(),
            Data::object([("order", order)]),
        )?;

        let created = b.invoke(
            &create_order_claims_step(),
            Data::array([Data::object([
                ("type", input.get("type")),
                ("order_id", input.get("order_id")),
                ("metadata", input.get("metadata")),
            ])]),
        )?;
        b.after(&created, &[&validation])?;

        let change_input = b.transform(
            "claim-order-change",
            Data::object([("created", created), ("input", input.clone())]),
            claim_order_change,
        )?;
        b.invoke(&create_order_change_step(), change_input)
    })
}
