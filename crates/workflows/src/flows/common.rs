use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    remote_query::{QueryConfig, QueryTarget, RelationCheck, RemoteQuery, RemoteQueryObject},
    workflow::{create_step, parse_input, Data, StepContext, StepDefinition, StepResponse},
    Error, Result,
};

pub const USE_REMOTE_QUERY_STEP_ID: &str = "use-remote-query";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelationFlag {
    All(bool),
    Only(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RemoteQueryStepInput {
    entry_point: Option<String>,
    service: Option<String>,
    fields: Vec<String>,
    #[serde(default)]
    variables: Option<Map<String, Value>>,
    #[serde(default)]
    list: Option<bool>,
    #[serde(default)]
    throw_if_key_not_found: bool,
    #[serde(default)]
    throw_if_relation_not_found: Option<RelationFlag>,
}

/// Read entities through the remote query registered in the container.
/// Returns a list, or the first match (or `null`) when `list` is false.
pub fn use_remote_query_step() -> StepDefinition {
    create_step(USE_REMOTE_QUERY_STEP_ID, remote_query)
}

async fn remote_query(input: Value, ctx: StepContext) -> Result<StepResponse> {
    let input: RemoteQueryStepInput = parse_input(USE_REMOTE_QUERY_STEP_ID, input)?;
    let query = ctx.resolve::<dyn RemoteQuery>()?;

    let target = match (input.entry_point, input.service) {
        (Some(entry_point), _) => QueryTarget::EntryPoint(entry_point),
        (None, Some(service)) => QueryTarget::Service(service),
        (None, None) => {
            return Err(Error::Validation(
                "use-remote-query needs either an entry_point or a service".into(),
            ))
        }
    };
    let query_object = RemoteQueryObject {
        target,
        fields: input.fields,
        variables: input.variables.unwrap_or_default(),
    };
    // Relation checks only apply together with key checks.
    let config = QueryConfig {
        throw_if_key_not_found: input.throw_if_key_not_found,
        throw_if_relation_not_found: match input.throw_if_relation_not_found {
            Some(_) if !input.throw_if_key_not_found => RelationCheck::Never,
            Some(RelationFlag::All(true)) => RelationCheck::All,
            Some(RelationFlag::Only(names)) => RelationCheck::Only(names),
            _ => RelationCheck::Never,
        },
    };

    let entities = query.query(&query_object, &config).await?;
    let result = if input.list.unwrap_or(true) {
        Value::Array(entities)
    } else {
        entities.into_iter().next().unwrap_or(Value::Null)
    };
    Ok(StepResponse::new(result))
}

/// Builder for the symbolic input of [`use_remote_query_step`].
#[derive(Debug, Clone)]
pub struct RemoteQueryInput {
    target: (&'static str, String),
    fields: Vec<String>,
    variables: Vec<(String, Data)>,
    list: bool,
    throw_if_key_not_found: bool,
}

impl RemoteQueryInput {
    pub fn entry_point(entry_point: impl Into<String>, fields: &[&str]) -> Self {
        Self::new("entry_point", entry_point.into(), fields)
    }

    pub fn service(service: impl Into<String>, fields: &[&str]) -> Self {
        Self::new("service", service.into(), fields)
    }

    fn new(kind: &'static str, name: String, fields: &[&str]) -> Self {
        Self {
            target: (kind, name),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            variables: Vec::new(),
            list: true,
            throw_if_key_not_found: false,
        }
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<Data>) -> Self {
        self.variables.push((key.into(), value.into()));
        self
    }

    pub fn single(mut self) -> Self {
        self.list = false;
        self
    }

    pub fn throw_if_key_not_found(mut self) -> Self {
        self.throw_if_key_not_found = true;
        self
    }
}

impl From<RemoteQueryInput> for Data {
    fn from(input: RemoteQueryInput) -> Self {
        Data::object([
            (input.target.0.to_string(), Data::literal(input.target.1)),
            ("fields".to_string(), Data::literal(input.fields)),
            ("variables".to_string(), Data::object(input.variables)),
            ("list".to_string(), Data::literal(input.list)),
            (
                "throw_if_key_not_found".to_string(),
                Data::literal(input.throw_if_key_not_found),
            ),
        ])
    }
}
