//! Module links: which modules exist, which of their keys can be linked, and
//! the link definitions declared between them.
//!
//! The registry is an ordinary value owned by whoever assembles the
//! application; nothing here is global.

mod remote_link;

pub use remote_link::{InMemoryRemoteLink, LinkDefinition, LinkEnd, RemoteLink};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A module as seen by the link layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub service_name: String,
    /// Linkable key -> entity it identifies, e.g. `cart_id -> Cart`.
    pub linkable_keys: BTreeMap<String, String>,
    pub primary_keys: Vec<String>,
}

impl ModuleDefinition {
    /// Derive linkable keys from model names: `Cart` yields `cart_id`.
    pub fn from_models<I, S>(service_name: impl Into<String>, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let linkable_keys = models
            .into_iter()
            .map(|model| {
                let model = model.into();
                (format!("{}_id", camel_to_snake(&model)), model)
            })
            .collect();
        Self {
            service_name: service_name.into(),
            linkable_keys,
            primary_keys: vec!["id".to_string()],
        }
    }

    /// Declare linkable keys explicitly.
    pub fn from_linkable_keys<I, K, E>(service_name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = (K, E)>,
        K: Into<String>,
        E: Into<String>,
    {
        Self {
            service_name: service_name.into(),
            linkable_keys: keys.into_iter().map(|(k, e)| (k.into(), e.into())).collect(),
            primary_keys: vec!["id".to_string()],
        }
    }

    pub fn with_primary_keys(mut self, keys: &[&str]) -> Self {
        self.primary_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Handle on one linkable key, for use with [`LinkRegistry::define_link`].
    pub fn linkable(&self, key: &str) -> Result<Linkable> {
        let entity = self.linkable_keys.get(key).ok_or_else(|| {
            Error::Validation(format!(
                "Key {} is not linkable on service {}",
                key, self.service_name
            ))
        })?;
        Ok(Linkable {
            service_name: self.service_name.clone(),
            key: key.to_string(),
            field: camel_to_snake(entity),
            primary_key: self.primary_keys.first().cloned().unwrap_or_else(|| "id".to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Linkable {
    pub service_name: String,
    pub key: String,
    pub field: String,
    pub primary_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOptions {
    pub linkable: Linkable,
    pub is_list: bool,
    pub delete_cascade: bool,
}

impl LinkOptions {
    pub fn list(linkable: Linkable) -> Self {
        Self {
            linkable,
            is_list: true,
            delete_cascade: false,
        }
    }

    pub fn delete_cascade(mut self) -> Self {
        self.delete_cascade = true;
        self
    }
}

impl From<Linkable> for LinkOptions {
    fn from(linkable: Linkable) -> Self {
        Self {
            linkable,
            is_list: false,
            delete_cascade: false,
        }
    }
}

/// One side of a declared link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSide {
    pub service_name: String,
    pub key: String,
    pub alias: String,
    pub primary_key: String,
    pub is_list: bool,
    pub delete_cascade: bool,
}

/// A link declared between two modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLink {
    pub service_name: String,
    pub left: LinkSide,
    pub right: LinkSide,
}

impl ModuleLink {
    pub fn connects(&self, left: (&str, &str), right: (&str, &str)) -> bool {
        let matches = |side: &LinkSide, (service, key): (&str, &str)| side.service_name == service && side.key == key;
        (matches(&self.left, left) && matches(&self.right, right))
            || (matches(&self.left, right) && matches(&self.right, left))
    }
}

#[derive(Debug, Default)]
pub struct LinkRegistry {
    modules: BTreeMap<String, ModuleDefinition>,
    links: BTreeMap<String, ModuleLink>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&mut self, module: ModuleDefinition) -> Result<()> {
        if self.modules.contains_key(&module.service_name) {
            return Err(Error::Validation(format!(
                "Service {} is already registered",
                module.service_name
            )));
        }
        self.modules.insert(module.service_name.clone(), module);
        Ok(())
    }

    pub fn module(&self, service_name: &str) -> Option<&ModuleDefinition> {
        self.modules.get(service_name)
    }

    pub fn define_link(
        &mut self,
        left: impl Into<LinkOptions>,
        right: impl Into<LinkOptions>,
    ) -> Result<ModuleLink> {
        let left = self.side(left.into())?;
        let right = self.side(right.into())?;

        let service_name = format!(
            "{}_{}_{}_{}",
            left.service_name, left.alias, right.service_name, right.alias
        );
        if self.links.contains_key(&service_name) {
            return Err(Error::Validation(format!("Link {} is already defined", service_name)));
        }

        let link = ModuleLink {
            service_name: service_name.clone(),
            left,
            right,
        };
        self.links.insert(service_name, link.clone());
        Ok(link)
    }

    fn side(&self, options: LinkOptions) -> Result<LinkSide> {
        let linkable = options.linkable;
        let module = self
            .modules
            .get(&linkable.service_name)
            .ok_or_else(|| Error::Validation(format!("Service {} was not found", linkable.service_name)))?;
        if !module.linkable_keys.contains_key(&linkable.key) {
            return Err(Error::Validation(format!(
                "Key {} is not linkable on service {}",
                linkable.key, linkable.service_name
            )));
        }
        if !module.primary_keys.contains(&linkable.primary_key) {
            return Err(Error::Validation(format!(
                "Primary key {} is not defined on service {}",
                linkable.primary_key, linkable.service_name
            )));
        }
        Ok(LinkSide {
            service_name: linkable.service_name,
            key: linkable.key,
            alias: camel_to_snake(&linkable.field),
            primary_key: linkable.primary_key,
            is_list: options.is_list,
            delete_cascade: options.delete_cascade,
        })
    }

    /// The declared link joining the two `(service, key)` pairs, in either order.
    pub fn find_link(&self, left: (&str, &str), right: (&str, &str)) -> Option<&ModuleLink> {
        self.links.values().find(|link| link.connects(left, right))
    }

    pub fn links(&self) -> impl Iterator<Item = &ModuleLink> {
        self.links.values()
    }
}

pub fn camel_to_snake(value: &str) -> String {
    let mut snake = String::with_capacity(value.len() + 4);
    for (i, c) in value.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                snake.push('_');
            }
            snake.extend(c.to_lowercase());
        } else {
            snake.push(c);
        }
    }
    snake
}
