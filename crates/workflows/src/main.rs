use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use medusa_workflows::{
    config::Config,
    container::Container,
    flows::register_core_flows,
    links::{InMemoryRemoteLink, LinkRegistry, ModuleDefinition, RemoteLink},
    metrics::gather_metrics,
    modules::{
        CartService, Customer, CustomerService, InMemoryCartService, InMemoryCustomerService,
        InMemoryOrderService, InMemoryRegionService, OrderService, Region, RegionService,
    },
    remote_query::{InMemoryRemoteQuery, RemoteQuery},
    store::create_store,
    workflow::{RunOptions, StepExecutor, WorkflowEngine, WorkflowResult},
};

#[derive(Parser)]
#[command(author, version, about = "Run and inspect Medusa workflows", long_about = None)]
struct Cli {
    /// Log level (debug, info, warn, error). Overrides LOG_LEVEL.
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered workflows
    Workflows,

    /// Start a workflow run
    Run {
        /// Workflow id, e.g. create-cart
        workflow_id: String,

        /// Run input as JSON
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Reuse a transaction id; an existing run is returned as stored
        #[arg(short, long)]
        transaction_id: Option<String>,

        /// Print errors as part of the result instead of failing
        #[arg(long)]
        no_throw: bool,
    },

    /// Complete a waiting step of a run
    Succeed {
        run_id: String,
        step_id: String,

        /// Step output as JSON
        #[arg(short, long, default_value = "null")]
        output: String,
    },

    /// Fail a waiting step of a run
    Fail {
        run_id: String,
        step_id: String,

        #[arg(short, long, default_value = "failed by operator")]
        message: String,
    },

    /// Continue a run that was interrupted
    Resume { run_id: String },

    /// Show the stored state of a run
    Status { run_id: String },

    /// List recent runs
    List {
        #[arg(short, long)]
        workflow: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Print Prometheus metrics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
    info!("Loaded configuration: {:?}", config);

    let store = create_store(&config.database).await?;
    let executor = Arc::new(StepExecutor::new(config.engine.step_defaults()));
    let container = Arc::new(demo_container()?);
    let engine = WorkflowEngine::new(store.clone(), executor, container);
    register_core_flows(&engine).await?;

    match cli.command {
        Commands::Workflows => {
            for id in engine.workflow_ids().await {
                println!("{}", id);
            }
        }
        Commands::Run {
            workflow_id,
            input,
            transaction_id,
            no_throw,
        } => {
            let input: Value = serde_json::from_str(&input).context("--input must be valid JSON")?;
            let mut options = RunOptions::new(input).throw_on_error(!no_throw);
            if let Some(id) = transaction_id {
                options = options.transaction_id(id);
            }
            print_result(&engine.run(&workflow_id, options).await?)?;
        }
        Commands::Succeed {
            run_id,
            step_id,
            output,
        } => {
            let output: Value = serde_json::from_str(&output).context("--output must be valid JSON")?;
            print_result(&engine.set_step_success(&run_id, &step_id, output).await?)?;
        }
        Commands::Fail {
            run_id,
            step_id,
            message,
        } => {
            print_result(&engine.set_step_failure(&run_id, &step_id, message).await?)?;
        }
        Commands::Resume { run_id } => {
            print_result(&engine.resume(&run_id).await?)?;
        }
        Commands::Status { run_id } => {
            let run = engine
                .get_run(&run_id)
                .await?
                .with_context(|| format!("run {} not found", run_id))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::List { workflow, limit } => {
            for summary in store.list(workflow.as_deref(), limit).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    summary.run_id, summary.workflow_id, summary.status, summary.updated_at
                );
            }
        }
        Commands::Metrics => {
            print!("{}", gather_metrics()?);
        }
    }

    Ok(())
}

fn print_result(result: &WorkflowResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

/// In-memory module services seeded with a small catalogue, so every core
/// flow can be exercised from the command line.
fn demo_container() -> Result<Container> {
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
    let customers: Arc<dyn CustomerService> = Arc::new(InMemoryCustomerService::new([Customer {
        id: "cus_demo".into(),
        email: Some("demo@medusa-test.com".into()),
        first_name: Some("Demo".into()),
        last_name: None,
    }]));
    let carts: Arc<dyn CartService> = Arc::new(InMemoryCartService::new());
    let orders: Arc<dyn OrderService> = Arc::new(InMemoryOrderService::new());

    let query: Arc<dyn RemoteQuery> = Arc::new(
        InMemoryRemoteQuery::new()
            .with_entities(
                "orders",
                vec![
                    json!({"id": "order_1", "status": "pending",
                           "items": [{"id": "item_1", "title": "Shirt", "quantity": 2}]}),
                    json!({"id": "order_2", "status": "canceled",
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
                    json!({"id": "ordch_1", "order_id": "order_1", "status": "pending", "version": 1}),
                    json!({"id": "ordch_2", "order_id": "order_2", "status": "pending", "version": 1}),
                ],
            )
            .with_service("order", "orders"),
    );

    let mut registry = LinkRegistry::new();
    registry.register_module(ModuleDefinition::from_models("cart", ["Cart"]))?;
    registry.register_module(ModuleDefinition::from_linkable_keys(
        "customer",
        [("customer_id", "Customer")],
    ))?;
    let cart = registry
        .module("cart")
        .context("cart module missing")?
        .linkable("cart_id")?;
    let customer = registry
        .module("customer")
        .context("customer module missing")?
        .linkable("customer_id")?;
    registry.define_link(cart, customer)?;
    let links: Arc<dyn RemoteLink> = Arc::new(InMemoryRemoteLink::new(Arc::new(registry)));

    Ok(Container::new()
        .with(regions)
        .with(customers)
        .with(carts)
        .with(orders)
        .with(query)
        .with(links))
}
