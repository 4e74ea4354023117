use serde_json::Value;

use crate::{
    links::{LinkDefinition, RemoteLink},
    workflow::{create_step, create_workflow, parse_input, StepContext, StepDefinition, StepResponse, WorkflowDefinition},
    Result,
};

pub const CREATE_LINK_WORKFLOW_ID: &str = "create-link";
pub const DISMISS_LINK_WORKFLOW_ID: &str = "dismiss-link";
pub const UPDATE_LINK_WORKFLOW_ID: &str = "update-link";

pub const CREATE_REMOTE_LINKS_STEP_ID: &str = "create-remote-links";
pub const DISMISS_REMOTE_LINKS_STEP_ID: &str = "dismiss-remote-links";
pub const UPDATE_REMOTE_LINKS_STEP_ID: &str = "update-remote-links";

/// Creates links; compensation dismisses the ones this step created.
pub fn create_remote_links_step() -> StepDefinition {
    create_step(CREATE_REMOTE_LINKS_STEP_ID, create_remote_links).compensate(dismiss_links)
}

async fn create_remote_links(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let links: Vec<LinkDefinition> = parse_input(CREATE_REMOTE_LINKS_STEP_ID, input)?;
    if links.is_empty() {
        return Ok(StepResponse::with_compensation(Value::Array(Vec::new()), Value::Array(Vec::new())));
    }
    let remote_link = ctx.resolve::<dyn RemoteLink>()?;
    let created = remote_link.create(links, &ctx.shared()).await?;
    let created = serde_json::to_value(created)?;
    Ok(StepResponse::with_compensation(created.clone(), created))
}

/// Dismisses links; compensation restores the ones that existed.
pub fn dismiss_remote_links_step() -> StepDefinition {
    create_step(DISMISS_REMOTE_LINKS_STEP_ID, dismiss_remote_links).compensate(restore_links)
}

async fn dismiss_remote_links(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let links: Vec<LinkDefinition> = parse_input(DISMISS_REMOTE_LINKS_STEP_ID, input)?;
    if links.is_empty() {
        return Ok(StepResponse::with_compensation(Value::Array(Vec::new()), Value::Array(Vec::new())));
    }
    let remote_link = ctx.resolve::<dyn RemoteLink>()?;
    let dismissed = remote_link.dismiss(links, &ctx.shared()).await?;
    let dismissed = serde_json::to_value(dismissed)?;
    Ok(StepResponse::with_compensation(dismissed.clone(), dismissed))
}

/// Replaces link data; compensation writes the previous data back.
pub fn update_remote_links_step() -> StepDefinition {
    create_step(UPDATE_REMOTE_LINKS_STEP_ID, update_remote_links).compensate(revert_link_updates)
}

async fn update_remote_links(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let links: Vec<LinkDefinition> = parse_input(UPDATE_REMOTE_LINKS_STEP_ID, input)?;
    if links.is_empty() {
        return Ok(StepResponse::with_compensation(Value::Array(Vec::new()), Value::Array(Vec::new())));
    }
    let remote_link = ctx.resolve::<dyn RemoteLink>()?;
    let previous = remote_link.update(links.clone(), &ctx.shared()).await?;
    Ok(StepResponse::with_compensation(
        serde_json::to_value(links)?,
        serde_json::to_value(previous)?,
    ))
}

async fn dismiss_links(input: Value, ctx: StepContext) -> Result<()> {
    let links: Vec<LinkDefinition> = parse_input(CREATE_REMOTE_LINKS_STEP_ID, input)?;
    if links.is_empty() {
        return Ok(());
    }
    let remote_link = ctx.resolve::<dyn RemoteLink>()?;
    remote_link.dismiss(links, &ctx.shared()).await.map(|_| ())
}

async fn restore_links(input: Value, ctx: StepContext) -> Result<()> {
    let links: Vec<LinkDefinition> = parse_input(DISMISS_REMOTE_LINKS_STEP_ID, input)?;
    if links.is_empty() {
        return Ok(());
    }
    let remote_link = ctx.resolve::<dyn RemoteLink>()?;
    remote_link.create(links, &ctx.shared()).await.map(|_| ())
}

async fn revert_link_updates(input: Value, ctx: StepContext) -> Result<()> {
    let previous: Vec<LinkDefinition> = parse_input(UPDATE_REMOTE_LINKS_STEP_ID, input)?;
    if previous.is_empty() {
        return Ok(());
    }
    let remote_link = ctx.resolve::<dyn RemoteLink>()?;
    remote_link.update(previous, &ctx.shared()).await.map(|_| ())
}

pub fn create_link_workflow() -> Result<WorkflowDefinition> {
    create_workflow(CREATE_LINK_WORKFLOW_ID, |b, input| b.invoke(&create_remote_links_step(), input))
}

pub fn dismiss_link_workflow() -> Result<WorkflowDefinition> {
    create_workflow(DISMISS_LINK_WORKFLOW_ID, |b, input| b.invoke(&dismiss_remote_links_step(), input))
}

pub fn update_link_workflow() -> Result<WorkflowDefinition> {
    create_workflow(UPDATE_LINK_WORKFLOW_ID, |b, input| b.invoke(&update_remote_links_step(), input))
}
