//! Cross-module read boundary used by the `use-remote-query` step.
//!
//! A query names an entry point (or a service that maps to one), the fields
//! to return, and variables that filter the entities. Fields may reach into
//! relations: `items.*` returns every field of each related item while
//! `items.id` keeps only `id`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTarget {
    EntryPoint(String),
    Service(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteQueryObject {
    pub target: QueryTarget,
    pub fields: Vec<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl RemoteQueryObject {
    pub fn entry_point(entry_point: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            target: QueryTarget::EntryPoint(entry_point.into()),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            variables: Map::new(),
        }
    }

    pub fn variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }
}

/// Which relations must be present on every returned entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationCheck {
    #[default]
    Never,
    All,
    Only(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryConfig {
    pub throw_if_key_not_found: bool,
    pub throw_if_relation_not_found: RelationCheck,
}

#[async_trait]
pub trait RemoteQuery: Send + Sync {
    async fn query(&self, query: &RemoteQueryObject, config: &QueryConfig) -> Result<Vec<Value>>;
}

/// Field selection compiled into a tree.
#[derive(Debug, Default)]
struct FieldTree {
    all: bool,
    children: BTreeMap<String, FieldTree>,
}

impl FieldTree {
    fn parse(fields: &[String]) -> Self {
        let mut root = FieldTree::default();
        if fields.is_empty() {
            root.all = true;
        }
        for field in fields {
            let mut node = &mut root;
            for part in field.split('.') {
                if part == "*" {
                    node.all = true;
                    break;
                }
                node = node.children.entry(part.to_string()).or_default();
            }
        }
        root
    }

    fn is_leaf(&self) -> bool {
        !self.all && self.children.is_empty()
    }

    fn project(&self, value: &Value) -> Value {
        match value {
            Value::Array(items) => Value::Array(items.iter().map(|item| self.project(item)).collect()),
            Value::Object(object) if !self.is_leaf() => {
                let mut projected = if self.all { object.clone() } else { Map::new() };
                for (key, child) in &self.children {
                    if let Some(inner) = object.get(key) {
                        let value = if child.is_leaf() { inner.clone() } else { child.project(inner) };
                        projected.insert(key.clone(), value);
                    }
                }
                Value::Object(projected)
            }
            other => other.clone(),
        }
    }

    /// Top-level fields that select into a relation.
    fn relations(&self) -> Vec<&str> {
        self.children
            .iter()
            .filter(|(_, child)| !child.is_leaf())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

fn matches_variables(entity: &Value, variables: &Map<String, Value>) -> bool {
    variables.iter().all(|(key, expected)| {
        let actual = entity.get(key).unwrap_or(&Value::Null);
        match expected {
            Value::Array(options) => options.contains(actual),
            single => single == actual,
        }
    })
}

/// Query engine over entities held in memory, keyed by entry point.
#[derive(Debug, Default)]
pub struct InMemoryRemoteQuery {
    entities: RwLock<HashMap<String, Vec<Value>>>,
    services: HashMap<String, String>,
}

impl InMemoryRemoteQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(mut self, entry_point: impl Into<String>, entities: Vec<Value>) -> Self {
        self.entities.get_mut().insert(entry_point.into(), entities);
        self
    }

    /// Let queries addressed to `service` read from `entry_point`.
    pub fn with_service(mut self, service: impl Into<String>, entry_point: impl Into<String>) -> Self {
        self.services.insert(service.into(), entry_point.into());
        self
    }

    pub async fn insert(&self, entry_point: &str, entity: Value) {
        self.entities
            .write()
            .await
            .entry(entry_point.to_string())
            .or_default()
            .push(entity);
    }

    fn entry_point<'a>(&'a self, target: &'a QueryTarget) -> &'a str {
        match target {
            QueryTarget::EntryPoint(entry_point) => entry_point.as_str(),
            QueryTarget::Service(service) => self
                .services
                .get(service)
                .map(String::as_str)
                .unwrap_or(service.as_str()),
        }
    }
}

#[async_trait]
impl RemoteQuery for InMemoryRemoteQuery {
    async fn query(&self, query: &RemoteQueryObject, config: &QueryConfig) -> Result<Vec<Value>> {
        let entry_point = self.entry_point(&query.target);
        debug!("Remote query on {} with {:?}", entry_point, query.variables);

        let entities = self.entities.read().await;
        let candidates = entities
            .get(entry_point)
            .ok_or_else(|| Error::NotFound(format!("Entry point {} is not registered", entry_point)))?;
        let matched: Vec<&Value> = candidates
            .iter()
            .filter(|entity| matches_variables(entity, &query.variables))
            .collect();

        if config.throw_if_key_not_found {
            if let Some(requested) = query.variables.get("id") {
                let requested: Vec<&Value> = match requested {
                    Value::Array(ids) => ids.iter().collect(),
                    id => vec![id],
                };
                let missing: Vec<String> = requested
                    .into_iter()
                    .filter(|id| !matched.iter().any(|e| e.get("id") == Some(*id)))
                    .map(|id| id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string()))
                    .collect();
                if !missing.is_empty() {
                    return Err(Error::NotFound(format!(
                        "{} id not found: {}",
                        entry_point,
                        missing.join(", ")
                    )));
                }
            }
        }

        let tree = FieldTree::parse(&query.fields);
        if config.throw_if_key_not_found {
            let required: Vec<&str> = match &config.throw_if_relation_not_found {
                RelationCheck::Never => Vec::new(),
                RelationCheck::All => tree.relations(),
                RelationCheck::Only(names) => names.iter().map(String::as_str).collect(),
            };
            for entity in &matched {
                for relation in &required {
                    if entity.get(*relation).map_or(true, Value::is_null) {
                        return Err(Error::RelationNotFound(format!(
                            "{} not found for {} {}",
                            relation,
                            entry_point,
                            entity.get("id").and_then(Value::as_str).unwrap_or("")
                        )));
                    }
                }
            }
        }

        Ok(matched.into_iter().map(|entity| tree.project(entity)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query_engine() -> InMemoryRemoteQuery {
        InMemoryRemoteQuery::new()
            .with_entities(
                "orders",
                vec![
                    json!({"id": "order_1", "status": "pending", "email": "a@b.c",
                           "items": [{"id": "item_1", "quantity": 2, "title": "Shirt"}]}),
                    json!({"id": "order_2", "status": "canceled", "items": null}),
                ],
            )
            .with_service("order", "orders")
    }

    #[tokio::test]
    async fn projects_fields_and_relations() {
        let query = RemoteQueryObject::entry_point("orders", &["id", "items.id"])
            .variable("id", json!("order_1"));
        let result = query_engine().query(&query, &QueryConfig::default()).await.unwrap();
        assert_eq!(result, vec![json!({"id": "order_1", "items": [{"id": "item_1"}]})]);

        let query = RemoteQueryObject::entry_point("orders", &["id", "items.*"])
            .variable("id", json!("order_1"));
        let result = query_engine().query(&query, &QueryConfig::default()).await.unwrap();
        assert_eq!(result[0]["items"][0]["title"], json!("Shirt"));
        assert!(result[0].get("status").is_none());
    }

    #[tokio::test]
    async fn list_variables_filter_and_services_resolve() {
        let query = RemoteQueryObject {
            target: QueryTarget::Service("order".into()),
            fields: vec!["id".into()],
            variables: Map::new(),
        }
        .variable("id", json!(["order_1", "order_2"]));
        let result = query_engine().query(&query, &QueryConfig::default()).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn missing_keys_and_relations_fail_when_asked() {
        let engine = query_engine();
        let query = RemoteQueryObject::entry_point("orders", &["id"]).variable("id", json!("order_9"));
        assert!(engine.query(&query, &QueryConfig::default()).await.unwrap().is_empty());

        let strict = QueryConfig {
            throw_if_key_not_found: true,
            ..QueryConfig::default()
        };
        let err = engine.query(&query, &strict).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(msg) if msg == "orders id not found: order_9"));

        let query = RemoteQueryObject::entry_point("orders", &["id", "items.*"])
            .variable("id", json!("order_2"));
        let relations = QueryConfig {
            throw_if_key_not_found: true,
            throw_if_relation_not_found: RelationCheck::All,
        };
        let err = engine.query(&query, &relations).await.unwrap_err();
        assert!(matches!(err, Error::RelationNotFound(_)));
    }
}
