use std::sync::Arc;

use async_trait::async_trait;
use medusa_workflows::{
    container::Container,
    flows::{
        cart::create_carts_step, register_core_flows, BEGIN_CLAIM_ORDER_WORKFLOW_ID,
        CREATE_CART_WORKFLOW_ID, CREATE_LINK_WORKFLOW_ID, DISMISS_LINK_WORKFLOW_ID,
        REQUEST_ITEM_RETURN_WORKFLOW_ID, UPDATE_LINK_WORKFLOW_ID,
    },
    links::{InMemoryRemoteLink, LinkRegistry, ModuleDefinition, RemoteLink},
    modules::{
        Cart, CartService, CreateCart, Customer, CustomerService, InMemoryCartService,
        InMemoryCustomerService, InMemoryOrderService, InMemoryRegionService, OrderService, Region,
        RegionService, SharedContext,
    },
    remote_query::{InMemoryRemoteQuery, RemoteQuery},
    store::MemoryRunStore,
    workflow::{
        create_step, create_workflow, ErrorKind, RunOptions, RunStatus, StepExecutor, StepStatus,
        WorkflowEngine,
    },
    Error, Result,
};
use mockall::mock;
use serde_json::{json, Value};

struct Services {
    customers: Arc<InMemoryCustomerService>,
    carts: Arc<InMemoryCartService>,
    orders: Arc<InMemoryOrderService>,
    links: Arc<InMemoryRemoteLink>,
}

fn remote_query() -> InMemoryRemoteQuery {
    InMemoryRemoteQuery::new()
        .with_entities(
            "orders",
            vec![
                json!({"id": "order_1", "status": "pending",
                       "items": [{"id": "item_1", "title": "Shirt", "quantity": 2}]}),
                json!({"id": "order_2", "status": "cancelled",
                       "items": [{"id": "item_2", "title": "Hat", "quantity": 1}]}),
            ],
        )
        .with_entities(
            "return",
            vec![
                json!({"id": "ret_1", "status": "requested", "order_id": "order_1", "items": []}),
                json!({"id": "ret_2", "status": "requested", "order_id": "order_2", "items": []}),
            ],
        )
        .with_entities(
            "order_change",
            vec![
                json!({"id": "ordch_1", "order_id": "order_1", "status": "pending", "version": 3}),
                json!({"id": "ordch_2", "order_id": "order_2", "status": "pending", "version": 1}),
            ],
        )
}

fn link_registry() -> LinkRegistry {
    let mut registry = LinkRegistry::new();
    registry
        .register_module(ModuleDefinition::from_models("cart", ["Cart"]))
        .unwrap();
    registry
        .register_module(ModuleDefinition::from_linkable_keys(
            "customer",
            [("customer_id", "Customer")],
        ))
        .unwrap();
    let cart = registry.module("cart").unwrap().linkable("cart_id").unwrap();
    let customer = registry.module("customer").unwrap().linkable("customer_id").unwrap();
    registry.define_link(cart, customer).unwrap();
    registry
}

async fn setup() -> (WorkflowEngine, Services) {
    let services = Services {
        customers: Arc::new(InMemoryCustomerService::new([Customer {
            id: "cus_1".into(),
            email: Some("known@example.com".into()),
            first_name: None,
            last_name: None,
        }])),
        carts: Arc::new(InMemoryCartService::new()),
        orders: Arc::new(InMemoryOrderService::new()),
        links: Arc::new(InMemoryRemoteLink::new(Arc::new(link_registry()))),
    };
    let regions: Arc<dyn RegionService> = Arc::new(InMemoryRegionService::new([
        Region {
            id: "reg_eu".into(),
            name: "Europe".into(),
            currency_code: "eur".into(),
        },
        Region {
            id: "reg_us".into(),
            name: "United States".into(),
            currency_code: "usd".into(),
        },
    ]));
    let customers: Arc<dyn CustomerService> = services.customers.clone();
    let carts: Arc<dyn CartService> = services.carts.clone();
    let orders: Arc<dyn OrderService> = services.orders.clone();
    let links: Arc<dyn RemoteLink> = services.links.clone();
    let query: Arc<dyn RemoteQuery> = Arc::new(remote_query());

    let container = Container::new()
        .with(regions)
        .with(customers)
        .with(carts)
        .with(orders)
        .with(links)
        .with(query);
    let engine = WorkflowEngine::new(
        Arc::new(MemoryRunStore::new()),
        Arc::new(StepExecutor::default()),
        Arc::new(container),
    );
    register_core_flows(&engine).await.expect("core flows register");
    (engine, services)
}

#[tokio::test]
async fn test_create_cart_takes_currency_from_found_region() {
    let (engine, services) = setup().await;

    let result = engine
        .run(
            CREATE_CART_WORKFLOW_ID,
            RunOptions::new(json!({"email": "new@example.com"})),
        )
        .await
        .expect("create-cart should succeed");

    let cart = result.result.expect("cart is returned");
    assert_eq!(cart["currency_code"], json!("eur"));
    assert_eq!(cart["region_id"], json!("reg_eu"));
    assert_eq!(cart["email"], json!("new@example.com"));
    assert!(cart["customer_id"].as_str().unwrap().starts_with("cus_"));
    assert_eq!(services.carts.len().await, 1);
    assert_eq!(services.customers.len().await, 2);
}

#[tokio::test]
async fn test_create_cart_reuses_existing_customer_and_explicit_region() {
    let (engine, services) = setup().await;

    let result = engine
        .run(
            CREATE_CART_WORKFLOW_ID,
            RunOptions::new(json!({"region_id": "reg_us", "email": "known@example.com"})),
        )
        .await
        .unwrap();

    let cart = result.result.unwrap();
    assert_eq!(cart["currency_code"], json!("usd"));
    assert_eq!(cart["customer_id"], json!("cus_1"));
    assert_eq!(services.customers.len().await, 1);
}

#[tokio::test]
async fn test_create_cart_unknown_region_deletes_created_customer() {
    let (engine, services) = setup().await;

    let result = engine
        .run(
            CREATE_CART_WORKFLOW_ID,
            RunOptions::new(json!({"region_id": "reg_mars", "email": "new@example.com"}))
                .throw_on_error(false),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Reverted);
    assert_eq!(result.errors[0].kind, ErrorKind::NotFound);
    // The customer created in parallel with the region lookup is removed again
    assert_eq!(services.customers.len().await, 1);
    assert_eq!(services.carts.len().await, 0);
}

#[tokio::test]
async fn test_request_item_return_creates_actions() {
    let (engine, services) = setup().await;

    let result = engine
        .run(
            REQUEST_ITEM_RETURN_WORKFLOW_ID,
            RunOptions::new(json!({
                "return_id": "ret_1",
                "items": [{"id": "item_1", "quantity": 1, "internal_note": "scuffed"}]
            })),
        )
        .await
        .expect("request-item-return should succeed");

    let actions = result.result.unwrap();
    assert_eq!(actions.as_array().unwrap().len(), 1);
    assert_eq!(actions[0]["action"], json!("RETURN_ITEM"));
    assert_eq!(actions[0]["order_change_id"], json!("ordch_1"));
    assert_eq!(actions[0]["version"], json!(3));
    assert_eq!(actions[0]["details"]["reference_id"], json!("item_1"));

    let stored = services
        .orders
        .list_order_change_actions("order_1", &SharedContext::default())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn test_request_item_return_on_cancelled_order_fails_validation() {
    let (engine, services) = setup().await;

    let err = engine
        .run(
            REQUEST_ITEM_RETURN_WORKFLOW_ID,
            RunOptions::new(json!({
                "return_id": "ret_2",
                "items": [{"id": "item_2", "quantity": 1}]
            })),
        )
        .await
        .unwrap_err();

    let Error::RunFailed(failure) = err else {
        panic!("expected a run failure");
    };
    assert_eq!(failure.first.step_id, "request-item-return-validation");
    assert_eq!(failure.first.kind, ErrorKind::NotAllowed);
    assert!(failure.first.message.contains("order_2 has been cancelled"));

    let run = engine.get_run(&failure.run_id).await.unwrap().unwrap();
    assert_eq!(
        run.step("create-order-change-actions").unwrap().status,
        StepStatus::Pending
    );
    let stored = services
        .orders
        .list_order_change_actions("order_2", &SharedContext::default())
        .await
        .unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn test_request_item_return_rejects_unknown_items() {
    let (engine, _) = setup().await;

    let result = engine
        .run(
            REQUEST_ITEM_RETURN_WORKFLOW_ID,
            RunOptions::new(json!({
                "return_id": "ret_1",
                "items": [{"id": "item_404", "quantity": 1}]
            }))
            .throw_on_error(false),
        )
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Reverted);
    assert_eq!(result.errors[0].kind, ErrorKind::Validation);
}

#[tokio::test]
async fn test_request_item_return_unknown_return_is_not_found() {
    let (engine, _) = setup().await;

    let result = engine
        .run(
            REQUEST_ITEM_RETURN_WORKFLOW_ID,
            RunOptions::new(json!({"return_id": "ret_404", "items": []})).throw_on_error(false),
        )
        .await
        .unwrap();
    assert_eq!(result.errors[0].step_id, "return-query");
    assert_eq!(result.errors[0].kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_begin_claim_order_creates_claim_and_change() {
    let (engine, services) = setup().await;

    let result = engine
        .run(
            BEGIN_CLAIM_ORDER_WORKFLOW_ID,
            RunOptions::new(json!({
                "order_id": "order_1",
                "type": "refund",
                "created_by": "user_1",
                "description": "damaged in transit"
            })),
        )
        .await
        .unwrap();

    let change = result.result.unwrap();
    assert_eq!(change["change_type"], json!("claim"));
    assert_eq!(change["status"], json!("pending"));
    assert!(change["claim_id"].as_str().unwrap().starts_with("claim_"));

    let ctx = SharedContext::default();
    assert_eq!(services.orders.list_claims("order_1", &ctx).await.unwrap().len(), 1);
    assert_eq!(services.orders.list_order_changes("order_1", &ctx).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_begin_claim_on_cancelled_order_creates_nothing() {
    let (engine, services) = setup().await;

    let result = engine
        .run(
            BEGIN_CLAIM_ORDER_WORKFLOW_ID,
            RunOptions::new(json!({"order_id": "order_2", "type": "replace"})).throw_on_error(false),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Reverted);
    assert_eq!(result.errors[0].kind, ErrorKind::NotAllowed);
    let claims = services
        .orders
        .list_claims("order_2", &SharedContext::default())
        .await
        .unwrap();
    assert!(claims.is_empty());
}

fn cart_customer_link(cart_id: &str) -> Value {
    json!({
        "left": {"service": "cart", "key": "cart_id", "id": cart_id},
        "right": {"service": "customer", "key": "customer_id", "id": "cus_1"}
    })
}

#[tokio::test]
async fn test_link_workflows_create_update_and_dismiss() {
    let (engine, services) = setup().await;
    let ctx = SharedContext::default();

    engine
        .run(CREATE_LINK_WORKFLOW_ID, RunOptions::new(json!([cart_customer_link("cart_1")])))
        .await
        .unwrap();
    assert_eq!(services.links.list(&ctx).await.unwrap().len(), 1);

    let mut updated = cart_customer_link("cart_1");
    updated["data"] = json!({"note": "vip"});
    engine
        .run(UPDATE_LINK_WORKFLOW_ID, RunOptions::new(json!([updated])))
        .await
        .unwrap();
    assert_eq!(
        services.links.list(&ctx).await.unwrap()[0].data,
        Some(json!({"note": "vip"}))
    );

    engine
        .run(DISMISS_LINK_WORKFLOW_ID, RunOptions::new(json!([cart_customer_link("cart_1")])))
        .await
        .unwrap();
    assert!(services.links.list(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_undeclared_link_is_rejected() {
    let (engine, services) = setup().await;
    let bogus = json!([{
        "left": {"service": "cart", "key": "cart_id", "id": "cart_1"},
        "right": {"service": "region", "key": "region_id", "id": "reg_eu"}
    }]);

    let result = engine
        .run(CREATE_LINK_WORKFLOW_ID, RunOptions::new(bogus).throw_on_error(false))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Reverted);
    assert_eq!(result.errors[0].kind, ErrorKind::NotFound);
    assert!(services.links.list(&SharedContext::default()).await.unwrap().is_empty());
}

mock! {
    Carts {}

    #[async_trait]
    impl CartService for Carts {
        async fn create_carts(&self, data: Vec<CreateCart>, ctx: &SharedContext) -> Result<Vec<Cart>>;
        async fn delete_carts(&self, ids: Vec<String>, ctx: &SharedContext) -> Result<()>;
        async fn retrieve(&self, id: &str, ctx: &SharedContext) -> Result<Cart>;
    }
}

#[tokio::test]
async fn test_created_carts_are_deleted_when_a_later_step_fails() {
    let mut carts = MockCarts::new();
    carts.expect_create_carts().times(1).returning(|data, _| {
        Ok(data
            .into_iter()
            .enumerate()
            .map(|(i, input)| Cart {
                id: format!("cart_{}", i + 1),
                region_id: input.region_id,
                customer_id: input.customer_id,
                email: input.email,
                currency_code: input.currency_code,
                metadata: input.metadata,
            })
            .collect())
    });
    carts
        .expect_delete_carts()
        .withf(|ids, ctx| ids.len() == 1 && ids[0] == "cart_1" && ctx.transaction_id.is_some())
        .times(1)
        .returning(|_, _| Ok(()));
    let carts: Arc<dyn CartService> = Arc::new(carts);

    let notify = create_step("notify-customer", |_input, _ctx| async {
        Err(Error::StepExecution {
            step_id: "notify-customer".to_string(),
            message: "mailer offline".to_string(),
        })
    });
    let definition = create_workflow("carts-then-notify", |b, input| {
        let created = b.invoke(&create_carts_step(), input)?;
        b.invoke(&notify, created)
    })
    .unwrap();

    let engine = WorkflowEngine::new(
        Arc::new(MemoryRunStore::new()),
        Arc::new(StepExecutor::default()),
        Arc::new(Container::new().with(carts)),
    );
    engine.register(definition).await.unwrap();

    let result = engine
        .run(
            "carts-then-notify",
            RunOptions::new(json!([{"currency_code": "eur"}])).throw_on_error(false),
        )
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Reverted);
}
