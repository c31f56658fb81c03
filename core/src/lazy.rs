//! Deferred references to other resources.
//!
//! # Design
//! A loader is owned by the attribute that holds it and resolves at most once.
//! Resolution is explicit: `load` takes the `Client` that should perform the
//! GET, so reading an attribute can never trigger I/O on its own. List and
//! map forms are introspectable without any network call.

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{CallResult, Client};
use crate::error::ApiError;
use crate::http::HttpMethod;
use crate::request::Params;

/// What an unresolved loader points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LazyRef {
    Url(String),
    List(Vec<LazyAssociationLoader>),
    Map(IndexMap<String, LazyAssociationLoader>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LazyAssociationLoader {
    name: String,
    resource_type: String,
    reference: LazyRef,
    #[serde(skip)]
    resolved: OnceCell<CallResult>,
}

impl PartialEq for LazyAssociationLoader {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.resource_type == other.resource_type
            && self.reference == other.reference
    }
}

impl LazyAssociationLoader {
    /// Build a loader for field `name`, fetched as `resource_type`.
    ///
    /// Accepts a URL string, a map with a `url` or `href` key, an array of
    /// either, or a map of named references.
    pub fn new(
        name: &str,
        resource_type: &str,
        value: &serde_json::Value,
    ) -> Result<Self, ApiError> {
        let reference = match value {
            serde_json::Value::String(url) => LazyRef::Url(url.clone()),
            serde_json::Value::Array(items) => LazyRef::List(
                items
                    .iter()
                    .map(|item| Self::new(name, resource_type, item))
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => match url_key(map) {
                Some(url) => LazyRef::Url(url.to_string()),
                None => LazyRef::Map(
                    map.iter()
                        .map(|(key, item)| Ok((key.clone(), Self::new(name, resource_type, item)?)))
                        .collect::<Result<_, ApiError>>()?,
                ),
            },
            other => {
                return Err(ApiError::InvalidLazyAssociation {
                    name: name.to_string(),
                    reason: format!("expected a URL, an array or a map, got {other}"),
                })
            }
        };
        Ok(Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            reference,
            resolved: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn reference(&self) -> &LazyRef {
        &self.reference
    }

    pub fn url(&self) -> Option<&str> {
        match &self.reference {
            LazyRef::Url(url) => Some(url),
            _ => None,
        }
    }

    /// Number of sub-loaders; a single URL counts as one.
    pub fn len(&self) -> usize {
        match &self.reference {
            LazyRef::Url(_) => 1,
            LazyRef::List(items) => items.len(),
            LazyRef::Map(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sub-loaders in order. A URL form yields nothing.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &LazyAssociationLoader> + '_> {
        match &self.reference {
            LazyRef::Url(_) => Box::new(std::iter::empty()),
            LazyRef::List(items) => Box::new(items.iter()),
            LazyRef::Map(map) => Box::new(map.values()),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        let keys: Vec<&str> = match &self.reference {
            LazyRef::Map(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        };
        keys.into_iter()
    }

    /// Named sub-loader of a map form.
    pub fn get(&self, key: &str) -> Option<&LazyAssociationLoader> {
        match &self.reference {
            LazyRef::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Positional sub-loader of a list form.
    pub fn at(&self, idx: usize) -> Option<&LazyAssociationLoader> {
        match &self.reference {
            LazyRef::List(items) => items.get(idx),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    pub fn resolved(&self) -> Option<&CallResult> {
        self.resolved.get()
    }

    /// Fetch the referenced resource on first use and keep it.
    pub fn load(&self, client: &Client) -> Result<&CallResult, ApiError> {
        self.resolved.get_or_try_init(|| {
            let url = self.url().ok_or_else(|| ApiError::InvalidLazyAssociation {
                name: self.name.clone(),
                reason: "only URL references can be loaded; load individual entries".to_string(),
            })?;
            debug!(association = %self.name, url, "resolving lazy association");
            client.request(&self.resource_type, url, HttpMethod::Get, Params::new())
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.reference {
            LazyRef::Url(url) => serde_json::Value::String(url.clone()),
            LazyRef::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            LazyRef::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn url_key(map: &serde_json::Map<String, serde_json::Value>) -> Option<&str> {
    map.get("url")
        .or_else(|| map.get("href"))
        .and_then(serde_json::Value::as_str)
}

/// A whole mapped call whose dispatch waits until first use.
#[derive(Debug)]
pub struct LazyCall {
    resource: String,
    target: LazyTarget,
    params: Params,
    resolved: OnceCell<CallResult>,
}

#[derive(Debug)]
enum LazyTarget {
    Mapped(String),
    Direct { url: String, method: HttpMethod },
}

impl LazyCall {
    pub(crate) fn mapped(resource: &str, call: &str, params: Params) -> Self {
        Self {
            resource: resource.to_string(),
            target: LazyTarget::Mapped(call.to_string()),
            params,
            resolved: OnceCell::new(),
        }
    }

    pub(crate) fn direct(resource: &str, url: &str, method: HttpMethod, params: Params) -> Self {
        Self {
            resource: resource.to_string(),
            target: LazyTarget::Direct {
                url: url.to_string(),
                method,
            },
            params,
            resolved: OnceCell::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Perform the call on first use; later calls return the kept result.
    pub fn get(&self, client: &Client) -> Result<&CallResult, ApiError> {
        self.resolved.get_or_try_init(|| match &self.target {
            LazyTarget::Mapped(call) => client.call(&self.resource, call, self.params.clone()),
            LazyTarget::Direct { url, method } => {
                client.request(&self.resource, url, *method, self.params.clone())
            }
        })
    }
}
