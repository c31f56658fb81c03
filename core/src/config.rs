//! Process-wide defaults and per-type configuration.
//!
//! # Design
//! Configuration is composed once, when a resource type is registered:
//! `ClientDefaults` supplies the baseline and each type's `ConfigOverrides`
//! win where set. The resulting `ResourceConfig` is immutable, so call-time
//! code never walks a fallback chain.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::http::HeaderList;

/// Default User-Agent string for outgoing requests.
pub const DEFAULT_USER_AGENT: &str = concat!("restclient-core/", env!("CARGO_PKG_VERSION"));

/// How non-GET parameters are written to the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    #[default]
    FormEncoded,
    Json,
}

/// Baseline configuration shared by every registered type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientDefaults {
    pub base_url: Option<String>,
    pub perform_caching: bool,
    pub request_body_type: BodyEncoding,
    pub headers: IndexMap<String, String>,
    pub user_agent: String,
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            base_url: None,
            perform_caching: false,
            request_body_type: BodyEncoding::FormEncoded,
            headers: IndexMap::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ClientDefaults {
    /// Parse defaults from a TOML document. Missing keys keep their defaults.
    ///
    /// ```toml
    /// base_url = "http://api.example.com"
    /// perform_caching = true
    /// request_body_type = "json"
    ///
    /// [headers]
    /// X-Api-Key = "secret"
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, ApiError> {
        toml::from_str(input).map_err(|err| ApiError::InvalidConfig(err.to_string()))
    }
}

/// Per-type settings; `None` means "use the default".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub perform_caching: Option<bool>,
    pub request_body_type: Option<BodyEncoding>,
    pub headers: IndexMap<String, String>,
    pub user_agent: Option<String>,
}

impl ConfigOverrides {
    /// Fill anything this type leaves unset from its parent's overrides.
    pub(crate) fn inherit_from(&mut self, parent: &ConfigOverrides) {
        if self.base_url.is_none() {
            self.base_url.clone_from(&parent.base_url);
        }
        if self.perform_caching.is_none() {
            self.perform_caching = parent.perform_caching;
        }
        if self.request_body_type.is_none() {
            self.request_body_type = parent.request_body_type;
        }
        if self.user_agent.is_none() {
            self.user_agent.clone_from(&parent.user_agent);
        }
        let mut headers = parent.headers.clone();
        headers.extend(std::mem::take(&mut self.headers));
        self.headers = headers;
    }
}

/// Effective, immutable configuration of one resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    pub base_url: Option<String>,
    pub perform_caching: bool,
    pub request_body_type: BodyEncoding,
    pub headers: HeaderList,
    pub user_agent: String,
}

impl ResourceConfig {
    pub fn compose(defaults: &ClientDefaults, overrides: &ConfigOverrides) -> Self {
        let headers = defaults
            .headers
            .iter()
            .chain(overrides.headers.iter())
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        Self {
            base_url: overrides
                .base_url
                .clone()
                .or_else(|| defaults.base_url.clone())
                .map(|url| url.trim_end_matches('/').to_string()),
            perform_caching: overrides.perform_caching.unwrap_or(defaults.perform_caching),
            request_body_type: overrides
                .request_body_type
                .unwrap_or(defaults.request_body_type),
            headers,
            user_agent: overrides
                .user_agent
                .clone()
                .unwrap_or_else(|| defaults.user_agent.clone()),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self::compose(&ClientDefaults::default(), &ConfigOverrides::default())
    }
}
