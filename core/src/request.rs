//! Per-invocation request state and the pure steps that build it.

use std::ops::Index;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::BodyEncoding;
use crate::error::ApiError;
use crate::http::{HeaderList, HttpMethod};
use crate::value::{self, Value};

static URL_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([a-zA-Z_][a-zA-Z0-9_]*)").expect("valid token regex"));

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Call parameters, kept in insertion order with unique keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(IndexMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy every entry of `other` over this one; `other` wins on conflicts.
    pub fn overlay(&mut self, other: &Params) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    fn sorted_pairs(&self) -> Vec<(&str, String)> {
        let mut pairs: Vec<(&str, String)> = self
            .0
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_param_string()))
            .collect();
        pairs.sort();
        pairs
    }
}

impl Index<&str> for Params {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        self.0.get(key).unwrap_or_else(|| value::null())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Mutable state of one invocation, handed to before-filters and proxies.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub resource: String,
    pub call: String,
    pub method: HttpMethod,
    /// Working URL: relative to the base URL, or absolute for direct calls.
    pub url: String,
    /// Set by a filter to replace `url` wholesale.
    pub forced_url: Option<String>,
    pub get_params: Params,
    pub post_params: Params,
    pub body: Option<String>,
    pub headers: HeaderList,
    /// `url` as it stood once the query was appended; used for cache keys.
    pub original_url: String,
}

impl RequestContext {
    pub(crate) fn new(resource: &str, call: &str, method: HttpMethod) -> Self {
        Self {
            resource: resource.to_string(),
            call: call.to_string(),
            method,
            url: String::new(),
            forced_url: None,
            get_params: Params::new(),
            post_params: Params::new(),
            body: None,
            headers: HeaderList::new(),
            original_url: String::new(),
        }
    }

    /// Route resolved parameters to the query or the body by verb.
    pub(crate) fn route_params(&mut self, params: Params) {
        if self.method == HttpMethod::Get {
            self.get_params = params;
        } else {
            self.post_params = params;
        }
    }

    pub(crate) fn expand_template(&mut self, template: &str) {
        self.url = expand_template(template, &mut self.get_params, &mut self.post_params);
    }

    pub(crate) fn append_get_params(&mut self) -> Result<(), ApiError> {
        if self.method == HttpMethod::Get {
            self.url = append_query(&self.url, &self.get_params)?;
        }
        Ok(())
    }

    /// Encode `post_params` unless a filter already supplied a body.
    pub(crate) fn prepare_body(&mut self, encoding: BodyEncoding) -> Result<(), ApiError> {
        if matches!(self.method, HttpMethod::Get | HttpMethod::Delete) {
            return Ok(());
        }
        if self.body.is_none() {
            self.body = Some(encode_body(&self.post_params, encoding)?);
        }
        if !self.headers.contains("content-type") {
            self.headers.set("Content-Type", content_type_for(encoding));
        }
        Ok(())
    }
}

/// Replace `:token`s with matching GET then POST params, consuming them.
/// Tokens without a value expand to the empty string.
pub fn expand_template(template: &str, get: &mut Params, post: &mut Params) -> String {
    URL_TOKEN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let token = &caps[1];
            get.remove(token)
                .or_else(|| post.remove(token))
                .map(|v| v.to_param_string())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Append `params` as a query string with keys in sorted order.
pub fn append_query(url: &str, params: &Params) -> Result<String, ApiError> {
    if params.is_empty() {
        return Ok(url.to_string());
    }
    let query = serde_urlencoded::to_string(params.sorted_pairs())?;
    let separator = if url.contains('?') { '&' } else { '?' };
    Ok(format!("{url}{separator}{query}"))
}

pub fn encode_body(params: &Params, encoding: BodyEncoding) -> Result<String, ApiError> {
    match encoding {
        BodyEncoding::FormEncoded => Ok(serde_urlencoded::to_string(params.sorted_pairs())?),
        BodyEncoding::Json => {
            let object: serde_json::Map<String, serde_json::Value> =
                params.iter().map(|(k, v)| (k.to_string(), v.to_json())).collect();
            Ok(serde_json::to_string(&object)?)
        }
    }
}

pub fn content_type_for(encoding: BodyEncoding) -> &'static str {
    match encoding {
        BodyEncoding::FormEncoded => FORM_CONTENT_TYPE,
        BodyEncoding::Json => JSON_CONTENT_TYPE,
    }
}

/// Path component of a relative or absolute URL, without the query.
pub fn path_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}

/// `url` with any query string removed.
pub fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_consumes_get_then_post_params() {
        let mut get = Params::new().with("id", 1234).with("debug", true);
        let mut post = Params::new().with("name", "Billy");
        let url = expand_template("/find/:id/:name", &mut get, &mut post);
        assert_eq!(url, "/find/1234/Billy");
        assert!(!get.contains_key("id"));
        assert!(get.contains_key("debug"));
        assert!(post.is_empty());
    }

    #[test]
    fn unmatched_tokens_become_empty() {
        let url = expand_template("/people/:id/photos", &mut Params::new(), &mut Params::new());
        assert_eq!(url, "/people//photos");
    }

    #[test]
    fn ports_and_schemes_are_not_tokens() {
        let mut get = Params::new().with("id", 1);
        let url = expand_template("http://localhost:8080/p/:id", &mut get, &mut Params::new());
        assert_eq!(url, "http://localhost:8080/p/1");
    }

    #[test]
    fn query_is_sorted_and_escaped() {
        let params = Params::new().with("name", "John Smith").with("age", 21);
        assert_eq!(append_query("/all", &params).unwrap(), "/all?age=21&name=John+Smith");
        assert_eq!(append_query("/all?x=1", &params).unwrap(), "/all?x=1&age=21&name=John+Smith");
        assert_eq!(append_query("/all", &Params::new()).unwrap(), "/all");
    }

    #[test]
    fn encodes_form_and_json_bodies() {
        let params = Params::new().with("name", "Billy").with("age", 12);
        assert_eq!(encode_body(&params, BodyEncoding::FormEncoded).unwrap(), "age=12&name=Billy");
        assert_eq!(
            encode_body(&params, BodyEncoding::Json).unwrap(),
            r#"{"name":"Billy","age":12}"#
        );
    }

    #[test]
    fn filter_supplied_body_is_kept() {
        let mut ctx = RequestContext::new("Person", "create", HttpMethod::Post);
        ctx.post_params = Params::new().with("name", "Billy");
        ctx.body = Some("raw".to_string());
        ctx.prepare_body(BodyEncoding::FormEncoded).unwrap();
        assert_eq!(ctx.body.as_deref(), Some("raw"));
        assert_eq!(ctx.headers.get_str("content-type"), Some(FORM_CONTENT_TYPE));
    }

    #[test]
    fn paths_ignore_queries() {
        assert_eq!(path_of("/people/1?x=2"), "/people/1");
        assert_eq!(path_of("http://example.com/people/1?x=2"), "/people/1");
        assert_eq!(strip_query("/people?x=2"), "/people");
    }
}
