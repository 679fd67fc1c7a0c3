//! Shared fixtures for the integration tests.
//!
//! Every test runs on a current-thread runtime inside a `LocalSet`, the way
//! a node process runs.

#![allow(dead_code)]

use livenode::schema::{IndexDef, NodeDefinition, NodeSchemaBuilder, Stream};
use livenode::{Context, ContextBuilder, Node, NodeResult, RuntimeConfig, Value};
use std::cell::Cell;
use std::future::Future;
use std::path::Path;

thread_local! {
    /// Times the `city` handler of `Street` ran on this thread
    pub static CITY_CHANGES: Cell<usize> = Cell::new(0);
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run `f` to completion inside a fresh `LocalSet`.
pub async fn local<F: Future>(f: F) -> F::Output {
    init_logging();
    tokio::task::LocalSet::new().run_until(f).await
}

pub struct Owner;

impl NodeDefinition for Owner {
    const NAME: &'static str = "Owner";

    fn describe(builder: NodeSchemaBuilder) -> NodeSchemaBuilder {
        builder
            .stream(Stream::text("name").required())
            .index(IndexDef::new("by_name", &["name"]).unique())
    }
}

pub struct Widget;

impl NodeDefinition for Widget {
    const NAME: &'static str = "Widget";

    fn describe(builder: NodeSchemaBuilder) -> NodeSchemaBuilder {
        builder
            .stream(Stream::text("name").required())
            .stream(Stream::text("colour").with_default("grey"))
            .stream(Stream::integer("weight"))
            .stream(Stream::reference("owner", "Owner"))
            .identity(&["name", "owner"])
            .index(IndexDef::new("by_colour", &["colour"]))
            .statement(
                "heavier_than",
                "SELECT * FROM {table} WHERE \"weight\" > ?1 ORDER BY \"weight\" DESC",
            )
            .derived("label", |node: &Node| {
                let name = node.get("name")?;
                let colour = node.get("colour")?;
                Ok(Value::from(format!(
                    "{} {}",
                    colour.as_str().unwrap_or_default(),
                    name.as_str().unwrap_or_default()
                )))
            })
    }
}

pub struct Country;

impl NodeDefinition for Country {
    const NAME: &'static str = "Country";

    fn describe(builder: NodeSchemaBuilder) -> NodeSchemaBuilder {
        builder.stream(Stream::text("name").required())
    }
}

pub struct City;

impl NodeDefinition for City {
    const NAME: &'static str = "City";

    fn describe(builder: NodeSchemaBuilder) -> NodeSchemaBuilder {
        builder
            .stream(Stream::text("name").required())
            .stream(Stream::reference("country", "Country"))
    }
}

pub struct Street;

impl NodeDefinition for Street {
    const NAME: &'static str = "Street";

    fn describe(builder: NodeSchemaBuilder) -> NodeSchemaBuilder {
        builder
            .stream(Stream::text("name").required())
            .stream(Stream::reference("city", "City").on_invalidate("city_changed"))
            .handler("city_changed", |_node: &Node, _stream: &str| {
                CITY_CHANGES.with(|count| count.set(count.get() + 1))
            })
    }
}

pub struct Employee;

impl NodeDefinition for Employee {
    const NAME: &'static str = "Employee";

    fn describe(builder: NodeSchemaBuilder) -> NodeSchemaBuilder {
        builder
            .stream(Stream::text("name").required())
            .stream(Stream::reference("manager", "Employee"))
            .derived("reports_to", |node: &Node| match node.resolve("manager")? {
                Some(manager) => manager.get("name"),
                None => Ok(Value::Null),
            })
    }
}

pub fn config() -> RuntimeConfig {
    RuntimeConfig::default().with_environment_id("test-env")
}

pub fn config_in(dir: &Path) -> RuntimeConfig {
    config().with_directory(dir)
}

/// A builder with every fixture type registered
pub fn builder(config: RuntimeConfig) -> NodeResult<ContextBuilder> {
    Context::builder(config)
        .register_type::<Owner>()?
        .register_type::<Widget>()?
        .register_type::<Country>()?
        .register_type::<City>()?
        .register_type::<Street>()?
        .register_type::<Employee>()
}

pub fn context_with(config: RuntimeConfig) -> NodeResult<Context> {
    builder(config)?.build()
}

pub fn context() -> Context {
    context_with(config()).expect("Failed to build test context")
}

pub fn owner(ctx: &Context, name: &str) -> Node {
    let node = Node::new(ctx, "Owner", [("name", Value::from(name))]).expect("Failed to build owner");
    node.create(true).expect("Failed to create owner");
    node
}

pub fn widget(ctx: &Context, name: &str, owner: Option<&Node>) -> Node {
    let node = Node::new(ctx, "Widget", [("name", Value::from(name))]).expect("Failed to build widget");
    if let Some(owner) = owner {
        node.set_node("owner", owner).expect("Failed to set owner");
    }
    node.create(true).expect("Failed to create widget");
    node
}
