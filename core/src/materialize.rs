//! Turns response bodies into resource graphs.
//!
//! # Design
//! Bodies are first decoded into a generic `serde_json::Value` (XML goes
//! through `xml::parse`), passed through the call's translator, and only
//! then walked into `ResourceObject`s, `ResultIterator`s and lazy loaders.
//!
//! Type overrides follow the field names down the tree: a field declared
//! `has_many`/`has_one` switches the type for everything beneath it until
//! another declared field is met. HAL envelopes are only unpacked on the
//! top-level object; anything that cannot be embedded degrades to a lazy
//! loader, and anything that cannot be a loader stays raw data.

use serde_json::{Map, Value as Json};
use tracing::{debug, trace};

use crate::client::CallResult;
use crate::error::ApiError;
use crate::http::RawResponse;
use crate::lazy::LazyAssociationLoader;
use crate::mapping::MappedCall;
use crate::proxy::Translator;
use crate::resource::ResourceObject;
use crate::result_iterator::ResultIterator;
use crate::value::Value;
use crate::xml;

const HAL_LINKS: &str = "_links";
const HAL_EMBEDDED: &str = "_embedded";

pub(crate) struct Materializer<'a> {
    pub resource: &'a str,
    pub call: &'a MappedCall,
    pub translator: Option<&'a Translator>,
    pub url: &'a str,
}

impl Materializer<'_> {
    /// Decode `raw` and build the call result. Empty bodies become an empty
    /// object; top-level scalars come back as the raw body.
    pub fn materialize(&self, raw: &RawResponse) -> Result<CallResult, ApiError> {
        if raw.body.trim().is_empty() {
            let mut object = ResourceObject::new(self.resource);
            object.set_response_meta(raw.status, &raw.headers);
            return Ok(CallResult::Object(object));
        }

        let mut payload = self.decode(raw)?;
        if let Some(translator) = self.translator {
            payload = translator.apply(&self.call.name, payload);
        }

        match payload {
            Json::Array(items) => {
                let mut list = self.build_list(&items, None)?;
                list.set_response_meta(raw.status, &raw.headers);
                trace!(resource = self.resource, items = list.len(), "materialized list");
                Ok(CallResult::List(list))
            }
            Json::Object(map) => {
                let mut object = if is_hal(&map) {
                    self.build_hal_object(map)?
                } else {
                    self.build_object(&map, self.resource, None)?
                };
                object.set_response_meta(raw.status, &raw.headers);
                Ok(CallResult::Object(object))
            }
            _ => Ok(CallResult::Plain(raw.body.clone())),
        }
    }

    fn decode(&self, raw: &RawResponse) -> Result<Json, ApiError> {
        if raw.is_xml() {
            let document = xml::parse(&raw.body).map_err(|message| self.parse_error(raw, message))?;
            Ok(match &self.call.options.ignore_xml_root {
                Some(root) => xml::strip_root(document, root),
                None => document,
            })
        } else {
            serde_json::from_str(&raw.body).map_err(|err| self.parse_error(raw, err.to_string()))
        }
    }

    fn parse_error(&self, raw: &RawResponse, message: String) -> ApiError {
        ApiError::ResponseParseFailed {
            status: raw.status,
            url: self.url.to_string(),
            message,
        }
    }

    /// The declared field that governs types beneath `key`.
    fn select_name<'k>(&'k self, key: &'k str, inherited: Option<&'k str>) -> Option<&'k str> {
        let options = &self.call.options;
        if options.has_many.contains_key(key) || options.has_one.contains_key(key) {
            Some(key)
        } else {
            inherited
        }
    }

    fn object_type(&self, name: Option<&str>) -> &str {
        let options = &self.call.options;
        name.and_then(|n| options.has_one.get(n).or_else(|| options.has_many.get(n)))
            .map_or(self.resource, String::as_str)
    }

    fn item_type(&self, name: Option<&str>) -> &str {
        let options = &self.call.options;
        name.and_then(|n| options.has_many.get(n).or_else(|| options.has_one.get(n)))
            .map_or(self.resource, String::as_str)
    }

    fn lazy_type(&self, key: &str) -> Option<&str> {
        let declared = self.call.options.lazy.get(key)?;
        Some(match declared {
            Some(resource_type) => resource_type.as_str(),
            None => self.object_type(Some(key)),
        })
    }

    fn build_value(&self, key: &str, value: &Json, inherited: Option<&str>) -> Result<Value, ApiError> {
        if let Some(resource_type) = self.lazy_type(key) {
            return Ok(Value::Lazy(LazyAssociationLoader::new(key, resource_type, value)?));
        }
        let name = self.select_name(key, inherited);
        match value {
            Json::Object(map) => Ok(self.build_object(map, self.object_type(name), name)?.into()),
            Json::Array(items) => Ok(self.build_list(items, name)?.into()),
            scalar => Ok(Value::from_json_scalar(scalar).unwrap_or_default()),
        }
    }

    fn build_object(
        &self,
        map: &Map<String, Json>,
        type_name: &str,
        name: Option<&str>,
    ) -> Result<ResourceObject, ApiError> {
        let mut object = ResourceObject::new(type_name);
        for (key, value) in map {
            object.insert_clean(key.clone(), self.build_value(key, value, name)?);
        }
        Ok(object)
    }

    fn build_list(&self, items: &[Json], name: Option<&str>) -> Result<ResultIterator, ApiError> {
        let mut list = ResultIterator::new();
        for item in items {
            let value: Value = match item {
                Json::Object(map) => self.build_object(map, self.item_type(name), name)?.into(),
                Json::Array(nested) => self.build_list(nested, name)?.into(),
                scalar => Value::from_json_scalar(scalar).unwrap_or_default(),
            };
            list.push(value);
        }
        Ok(list)
    }

    /// Unpack `_links`/`_embedded` into attributes, then map the rest.
    fn build_hal_object(&self, mut map: Map<String, Json>) -> Result<ResourceObject, ApiError> {
        let links = take_map(&mut map, HAL_LINKS);
        let mut embedded = take_map(&mut map, HAL_EMBEDDED);
        let mut object = ResourceObject::new(self.resource);

        for (rel, link) in &links {
            if let Some(href) = href_of(link) {
                object.insert_link(rel.clone(), href.to_string());
            }
            let value = match embedded.remove(rel) {
                Some(candidate) => match self.embed(rel, link, &candidate) {
                    Some(value) => value,
                    None => {
                        debug!(rel = rel.as_str(), "embedded content did not match link, deferring");
                        self.link_value(rel, link)?
                    }
                },
                None => self.link_value(rel, link)?,
            };
            object.insert_clean(rel.clone(), value);
        }

        for (rel, value) in &embedded {
            object.insert_clean(rel.clone(), self.build_value(rel, value, None)?);
        }
        for (key, value) in &map {
            object.insert_clean(key.clone(), self.build_value(key, value, None)?);
        }
        Ok(object)
    }

    /// Materialize embedded content for `rel`, or `None` if it does not line
    /// up with the link.
    fn embed(&self, rel: &str, link: &Json, candidate: &Json) -> Option<Value> {
        let name = self.select_name(rel, None).or(Some(rel));
        match (link, candidate) {
            (Json::Array(links), Json::Array(entries)) => {
                let mut list = ResultIterator::new();
                for link in links {
                    let href = href_of(link)?;
                    let entry = entries.iter().find(|e| self_href(e) == Some(href))?;
                    let map = entry.as_object()?;
                    list.push(self.build_object(map, self.item_type(name), name).ok()?);
                }
                Some(list.into())
            }
            (_, Json::Array(entries)) => {
                let href = href_of(link)?;
                let entry = entries.iter().find(|e| self_href(e) == Some(href))?;
                let map = entry.as_object()?;
                Some(self.build_object(map, self.object_type(name), name).ok()?.into())
            }
            (_, Json::Object(map)) => {
                Some(self.build_object(map, self.object_type(name), name).ok()?.into())
            }
            _ => None,
        }
    }

    /// A link that could not be embedded: lazy if possible, raw otherwise.
    fn link_value(&self, rel: &str, link: &Json) -> Result<Value, ApiError> {
        let resource_type = self
            .lazy_type(rel)
            .unwrap_or_else(|| self.object_type(self.select_name(rel, None)));
        match LazyAssociationLoader::new(rel, resource_type, link) {
            Ok(loader) => Ok(Value::Lazy(loader)),
            Err(_) => self.build_value(rel, link, None),
        }
    }
}

fn is_hal(map: &Map<String, Json>) -> bool {
    map.contains_key(HAL_LINKS) || map.contains_key(HAL_EMBEDDED)
}

fn take_map(map: &mut Map<String, Json>, key: &str) -> Map<String, Json> {
    match map.remove(key) {
        Some(Json::Object(inner)) => inner,
        _ => Map::new(),
    }
}

fn href_of(link: &Json) -> Option<&str> {
    match link {
        Json::String(href) => Some(href),
        Json::Object(map) => map.get("href").and_then(Json::as_str),
        _ => None,
    }
}

fn self_href(entry: &Json) -> Option<&str> {
    entry.get(HAL_LINKS)?.get("self").and_then(href_of)
}
