//! Materialized resource instances.
//!
//! # Design
//! A `ResourceObject` is an ordered map from attribute name to `Value` plus a
//! parallel set of dirty keys. Objects built from a server response start
//! clean; every write through `set` marks its key dirty until `clean` is
//! called. Reading never performs I/O: lazy associations stay unresolved
//! until the caller explicitly loads them through a `Client`.

use std::fmt;
use std::ops::Index;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::http::HeaderList;
use crate::request::Params;
use crate::value::{self, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    type_name: String,
    attributes: IndexMap<String, Value>,
    dirty: IndexSet<String>,
    status: Option<u16>,
    etag: Option<String>,
    headers: HeaderList,
    links: IndexMap<String, String>,
}

impl ResourceObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    /// Build a locally-constructed object. String values go through the same
    /// ISO-8601 coercion as server data, and every key starts dirty.
    pub fn with_attributes<K, V, I>(type_name: impl Into<String>, attributes: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut object = Self::new(type_name);
        for (key, value) in attributes {
            let value = match value.into() {
                Value::String(s) => Value::parse_scalar(&s),
                other => other,
            };
            object.set(key, value);
        }
        object
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Strict lookup: absent attributes are an error rather than `Null`.
    pub fn attr(&self, key: &str) -> Result<&Value, ApiError> {
        self.attributes
            .get(key)
            .ok_or_else(|| ApiError::MissingAttribute(key.to_string()))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.dirty.insert(key.clone());
        self.attributes.insert(key, value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.dirty.shift_remove(key);
        self.attributes.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn attributes(&self) -> &IndexMap<String, Value> {
        &self.attributes
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn is_dirty_key(&self, key: &str) -> bool {
        self.dirty.contains(key)
    }

    pub fn dirty_keys(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Mark every attribute as matching the server.
    pub fn clean(&mut self) {
        self.dirty.clear();
    }

    /// HTTP status of the response this object was materialized from.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// Single-href HAL links seen on the response, keyed by relation.
    pub fn links(&self) -> &IndexMap<String, String> {
        &self.links
    }

    pub(crate) fn insert_clean(&mut self, key: String, value: Value) {
        self.attributes.insert(key, value);
    }

    pub(crate) fn insert_link(&mut self, rel: String, href: String) {
        self.links.insert(rel, href);
    }

    pub(crate) fn set_response_meta(&mut self, status: u16, headers: &HeaderList) {
        self.status = Some(status);
        self.etag = headers.get_str("etag").map(str::to_string);
        self.headers = headers.clone();
    }

    /// Replace this instance's state with a freshly materialized one,
    /// keeping its identity for the caller.
    pub(crate) fn replace_from(&mut self, fresh: ResourceObject) {
        let type_name = std::mem::take(&mut self.type_name);
        *self = fresh;
        if self.type_name.is_empty() {
            self.type_name = type_name;
        }
        self.clean();
    }

    pub fn to_params(&self) -> Params {
        self.attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Wire form of the attributes; nested objects and lists recurse.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl Index<&str> for ResourceObject {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        self.attributes.get(key).unwrap_or_else(|| value::null())
    }
}

impl fmt::Display for ResourceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<{}", self.type_name)?;
        if self.attributes.is_empty() && self.status.is_none() && self.etag.is_none() {
            return f.write_str(" [uninitialized]>");
        }
        let mut parts: Vec<String> = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        if let Some(etag) = &self.etag {
            parts.push(format!("ETag: {etag}"));
        }
        if let Some(status) = self.status {
            parts.push(format!("Status: {status}"));
        }
        write!(f, " {}", parts.join(", "))?;
        if !self.dirty.is_empty() {
            let dirty: Vec<&str> = self.dirty.iter().map(String::as_str).collect();
            write!(f, " (unsaved: {})", dirty.join(", "))?;
        }
        f.write_str(">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn person() -> ResourceObject {
        ResourceObject::with_attributes("Person", [("id", Value::from(1)), ("name", "John Smith".into())])
    }

    #[test]
    fn constructor_attributes_start_dirty() {
        let object = person();
        assert!(object.is_dirty());
        assert_eq!(object.dirty_keys().collect::<Vec<_>>(), vec!["id", "name"]);
    }

    #[test]
    fn clean_then_write_marks_dirty_again() {
        let mut object = ResourceObject::with_attributes("Person", [("hello", "World")]);
        object.clean();
        assert!(!object.is_dirty());
        object.set("hello", "Everybody");
        assert!(object.is_dirty_key("hello"));
        assert_eq!(object["hello"], "Everybody");
    }

    #[test]
    fn coerces_iso_strings_on_construction() {
        let object = ResourceObject::with_attributes("Person", [("dob", "2015-01-02")]);
        assert_eq!(object["dob"].as_date(), NaiveDate::from_ymd_opt(2015, 1, 2));
    }

    #[test]
    fn missing_attributes() {
        let object = person();
        assert!(object["first_name"].is_null());
        assert!(matches!(
            object.attr("first_name"),
            Err(ApiError::MissingAttribute(ref k)) if k == "first_name"
        ));
    }

    #[test]
    fn display_lists_attributes_and_unsaved_keys() {
        assert_eq!(
            person().to_string(),
            "#<Person id: 1, name: \"John Smith\" (unsaved: id, name)>"
        );
        let mut clean = person();
        clean.clean();
        assert_eq!(clean.to_string(), "#<Person id: 1, name: \"John Smith\">");
    }

    #[test]
    fn display_shows_dates_etag_and_status() {
        let mut object =
            ResourceObject::with_attributes("Person", [("dob", "2015-01-02T03:04:05Z")]);
        let headers: HeaderList = [("ETag", "sample_etag")].into_iter().collect();
        object.set_response_meta(200, &headers);
        object.clean();
        assert_eq!(
            object.to_string(),
            "#<Person dob: \"2015-01-02 03:04:05\", ETag: sample_etag, Status: 200>"
        );
    }

    #[test]
    fn display_marks_empty_objects() {
        assert_eq!(ResourceObject::new("Person").to_string(), "#<Person [uninitialized]>");
    }

    #[test]
    fn to_json_recurses_into_children() {
        let location = ResourceObject::with_attributes("Location", [("place", "Room 1408")]);
        let mut course = ResourceObject::with_attributes("Course", [("name", "Programming 101")]);
        course.set("location", location);
        course.set("seats", 31);
        let json = course.to_json();
        assert_eq!(json["location"]["place"], "Room 1408");
        assert_eq!(json["seats"], 31);
        assert!(json.get("dirty").is_none());
    }
}
