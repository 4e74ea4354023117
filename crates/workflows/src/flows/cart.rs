use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    modules::{CartService, CreateCart, CreateCustomer, CustomerService, RegionService},
    workflow::{
        create_step, create_workflow, parse_input, Data, StepContext, StepDefinition, StepResponse,
        WorkflowDefinition,
    },
    Error, Result,
};

pub const CREATE_CART_WORKFLOW_ID: &str = "create-cart";
pub const FIND_ONE_OR_ANY_REGION_STEP_ID: &str = "find-one-or-any-region";
pub const FIND_OR_CREATE_CUSTOMER_STEP_ID: &str = "find-or-create-customer";
pub const CREATE_CARTS_STEP_ID: &str = "create-carts";

#[derive(Debug, Deserialize)]
struct FindRegionInput {
    #[serde(default, alias = "regionId")]
    region_id: Option<String>,
}

pub fn find_one_or_any_region_step() -> StepDefinition {
    create_step(FIND_ONE_OR_ANY_REGION_STEP_ID, find_one_or_any_region)
}

async fn find_one_or_any_region(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let input: FindRegionInput = parse_input(FIND_ONE_OR_ANY_REGION_STEP_ID, input)?;
    let service = ctx.resolve::<dyn RegionService>()?;
    let shared = ctx.shared();

    let region = match input.region_id {
        Some(id) => service.retrieve(&id, &shared).await?,
        None => service
            .list(&shared)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound("No regions found".to_string()))?,
    };
    Ok(StepResponse::new(serde_json::to_value(region)?))
}

#[derive(Debug, Deserialize)]
struct FindOrCreateCustomerInput {
    #[serde(default, alias = "customerId")]
    customer_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Resolves the cart's customer by id, then by email, creating one from the
/// email when none exists. Only a customer created here is compensated.
pub fn find_or_create_customer_step() -> StepDefinition {
    create_step(FIND_OR_CREATE_CUSTOMER_STEP_ID, find_or_create_customer)
        .compensate(delete_created_customer)
}

async fn find_or_create_customer(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let input: FindOrCreateCustomerInput = parse_input(FIND_OR_CREATE_CUSTOMER_STEP_ID, input)?;
    let service = ctx.resolve::<dyn CustomerService>()?;
    let shared = ctx.shared();

    let mut customer = match &input.customer_id {
        Some(id) => Some(service.retrieve(id, &shared).await?),
        None => None,
    };
    let mut created = None;

    if customer.is_none() {
        if let Some(email) = &input.email {
            customer = service.list_by_email(email, &shared).await?.into_iter().next();
            if customer.is_none() {
                let new_customer = service
                    .create(
                        vec![CreateCustomer {
                            email: Some(email.clone()),
                            ..CreateCustomer::default()
                        }],
                        &shared,
                    )
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::Internal("customer service created nothing".into()))?;
                created = Some(new_customer.id.clone());
                customer = Some(new_customer);
            }
        }
    }

    let email = input
        .email
        .or_else(|| customer.as_ref().and_then(|c| c.email.clone()));
    Ok(StepResponse::with_compensation(
        json!({ "customer": customer, "email": email }),
        json!({ "created_customer_id": created }),
    ))
}

async fn delete_created_customer(input: Value, ctx: StepContext) -> Result<()> {
    let Some(id) = input.get("created_customer_id").and_then(Value::as_str) else {
        return Ok(());
    };
    let service = ctx.resolve::<dyn CustomerService>()?;
    service.delete(vec![id.to_string()], &ctx.shared()).await
}

pub fn create_carts_step() -> StepDefinition {
    create_step(CREATE_CARTS_STEP_ID, create_carts).compensate(delete_carts)
}

async fn create_carts(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let data: Vec<CreateCart> = parse_input(CREATE_CARTS_STEP_ID, input)?;
    let service = ctx.resolve::<dyn CartService>()?;
    let carts = service.create_carts(data, &ctx.shared()).await?;
    let ids: Vec<&str> = carts.iter().map(|cart| cart.id.as_str()).collect();
    let compensate_input = json!(ids);
    Ok(StepResponse::with_compensation(serde_json::to_value(&carts)?, compensate_input))
}

async fn delete_carts(input: Value, ctx: StepContext) -> Result<()> {
    let ids: Vec<String> = parse_input(CREATE_CARTS_STEP_ID, input)?;
    if ids.is_empty() {
        return Ok(());
    }
    let service = ctx.resolve::<dyn CartService>()?;
    service.delete_carts(ids, &ctx.shared()).await
}

/// Cart creation input: explicit fields win over what the region and the
/// customer lookup provide.
fn prepare_cart_input(data: Value) -> Result<Value> {
    let mut cart = data.get("input").cloned().unwrap_or_else(|| json!({}));
    let Some(fields) = cart.as_object_mut() else {
        return Err(Error::Validation("create-cart input must be an object".into()));
    };
    let region = &data["region"];

    if fields.get("currency_code").map_or(true, Value::is_null) {
        fields.insert("currency_code".into(), region["currency_code"].clone());
    }
    fields.insert("region_id".into(), region["id"].clone());

    let customer = &data["customer_data"]["customer"];
    if let Some(customer_id) = customer.get("id").filter(|id| !id.is_null()) {
        fields.insert("customer_id".into(), customer_id.clone());
        if fields.get("email").map_or(true, Value::is_null) {
            fields.insert("email".into(), customer["email"].clone());
        }
    }
    Ok(cart)
}

pub fn create_cart_workflow() -> Result<WorkflowDefinition> {
    create_workflow(CREATE_CART_WORKFLOW_ID, |b, input| {
        let region = b.invoke(
            &find_one_or_any_region_step(),
            Data::object([("region_id", input.get("region_id"))]),
        )?;
        let customer_data = b.invoke(
            &find_or_create_customer_step(),
            Data::object([
                ("customer_id", input.get("customer_id")),
                ("email", input.get("email")),
            ]),
        )?;

        let cart_input = b.transform(
            "prepare-cart-input",
            Data::object([
                ("input", input.clone()),
                ("region", region),
                ("customer_data", customer_data),
            ]),
            prepare_cart_input,
        )?;

        let carts = b.invoke(&create_carts_step(), Data::array([cart_input]))?;
        Ok(carts.at(0))
    })
}
