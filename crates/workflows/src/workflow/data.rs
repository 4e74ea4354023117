//! Symbolic values used while composing a workflow.
//!
//! A [`Data`] never holds a runtime value of a step. It describes where a
//! value will come from (a node output, a field of it, or a literal) and is
//! resolved by the engine once the referenced nodes have produced output.

use serde_json::{Map, Value};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Ref {
        scope: u64,
        node: String,
        path: Vec<PathSegment>,
    },
    Object(Vec<(String, Data)>),
    Array(Vec<Data>),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data(Expr);

impl Data {
    pub(crate) fn node(scope: u64, node: impl Into<String>) -> Self {
        Data(Expr::Ref {
            scope,
            node: node.into(),
            path: Vec::new(),
        })
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Data(Expr::Literal(value.into()))
    }

    pub fn null() -> Self {
        Data(Expr::Literal(Value::Null))
    }

    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Data)>,
        K: Into<String>,
    {
        Data(Expr::Object(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn array<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Data>,
    {
        Data(Expr::Array(items.into_iter().collect()))
    }

    /// Field `key` of this value. Missing fields resolve to `null`.
    pub fn get(&self, key: &str) -> Data {
        self.project(PathSegment::Key(key.to_string()))
    }

    /// Element `index` of this value. Out of range resolves to `null`.
    pub fn at(&self, index: usize) -> Data {
        self.project(PathSegment::Index(index))
    }

    fn project(&self, segment: PathSegment) -> Data {
        match &self.0 {
            Expr::Ref { scope, node, path } => {
                let mut path = path.clone();
                path.push(segment);
                Data(Expr::Ref {
                    scope: *scope,
                    node: node.clone(),
                    path,
                })
            }
            Expr::Object(fields) => match segment {
                PathSegment::Key(key) => fields
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(Data::null),
                PathSegment::Index(_) => Data::null(),
            },
            Expr::Array(items) => match segment {
                PathSegment::Index(index) => items.get(index).cloned().unwrap_or_else(Data::null),
                PathSegment::Key(_) => Data::null(),
            },
            Expr::Literal(value) => Data::literal(select(value, &[segment]).clone()),
        }
    }

    /// The node this expression is a bare reference to, if any.
    pub(crate) fn as_node(&self) -> Option<(u64, &str)> {
        match &self.0 {
            Expr::Ref { scope, node, path } if path.is_empty() => Some((*scope, node.as_str())),
            _ => None,
        }
    }

    /// Every node referenced anywhere in the expression.
    pub(crate) fn references(&self) -> Vec<(u64, &str)> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<(u64, &'a str)>) {
        match &self.0 {
            Expr::Ref { scope, node, .. } => {
                if !refs.iter().any(|(s, n)| *s == *scope && *n == node.as_str()) {
                    refs.push((*scope, node.as_str()));
                }
            }
            Expr::Object(fields) => fields.iter().for_each(|(_, v)| v.collect_references(refs)),
            Expr::Array(items) => items.iter().for_each(|v| v.collect_references(refs)),
            Expr::Literal(_) => {}
        }
    }

    /// Build the runtime value, looking node outputs up through `lookup`.
    pub(crate) fn resolve<'a, F>(&self, lookup: &F) -> Result<Value>
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        match &self.0 {
            Expr::Ref { node, path, .. } => {
                let output = lookup(node)
                    .ok_or_else(|| Error::UnknownStepReference(node.clone()))?;
                Ok(select(output, path).clone())
            }
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), value.resolve(lookup)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Array(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Literal(value) => Ok(value.clone()),
        }
    }
}

fn select<'a>(value: &'a Value, path: &[PathSegment]) -> &'a Value {
    static NULL: Value = Value::Null;
    path.iter().fold(value, |current, segment| match segment {
        PathSegment::Key(key) => current.get(key.as_str()).unwrap_or(&NULL),
        PathSegment::Index(index) => current.get(*index).unwrap_or(&NULL),
    })
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        Data::literal(value)
    }
}

impl From<&Data> for Data {
    fn from(data: &Data) -> Self {
        data.clone()
    }
}
