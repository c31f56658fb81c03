//! Attribute values held by materialized resources.
//!
//! A resource is schema-less: every attribute is one of the variants below.
//! Strings that look like ISO-8601 dates, times or datetimes are coerced on
//! the way in and written back exactly as they arrived on the way out.

use std::fmt;
use std::ops::Index;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::lazy::LazyAssociationLoader;
use crate::resource::ResourceObject;
use crate::result_iterator::ResultIterator;

static DATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid date regex"));

static TIME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{2}:\d{2}:\d{2}(\.\d+)?$").expect("valid time regex"));

static DATETIME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?$")
        .expect("valid datetime regex")
});

static NULL: Value = Value::Null;

/// One attribute value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(Timestamp),
    Object(Box<ResourceObject>),
    List(ResultIterator),
    Lazy(LazyAssociationLoader),
}

impl Value {
    /// Coerce a wire string: ISO-8601 dates and datetimes become typed values,
    /// everything else stays a string.
    pub fn parse_scalar(s: &str) -> Value {
        if DATE_PATTERN.is_match(s) {
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Value::Date(date);
            }
        } else if DATETIME_PATTERN.is_match(s) {
            if let Some(dt) = parse_datetime(s) {
                return Value::DateTime(Timestamp::with_wire(dt, s));
            }
        } else if TIME_PATTERN.is_match(s) {
            // chrono pads fractions to 3, 6 or 9 digits; other widths stay strings
            if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
                if format_time(time) == s {
                    return Value::Time(time);
                }
            }
        }
        Value::String(s.to_string())
    }

    /// Convert a generic JSON scalar. Containers are the materializer's job
    /// and come back as `None`.
    pub(crate) fn from_json_scalar(value: &serde_json::Value) -> Option<Value> {
        match value {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => Some(Value::Number(n.clone())),
            serde_json::Value::String(s) => Some(Value::parse_scalar(s)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Value::DateTime(ts) => Some(ts.value()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ResourceObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ResultIterator> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_lazy(&self) -> Option<&LazyAssociationLoader> {
        match self {
            Value::Lazy(l) => Some(l),
            _ => None,
        }
    }

    /// Wire representation. Lazy associations serialize as their reference.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(_) | Value::Time(_) | Value::DateTime(_) => {
                serde_json::Value::String(self.to_param_string())
            }
            Value::Object(o) => o.to_json(),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Lazy(l) => l.to_json(),
        }
    }

    /// Flat string form used for URL tokens, query strings and form bodies.
    pub fn to_param_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => format_time(*t),
            Value::DateTime(ts) => ts.to_wire(),
            other => other.to_json().to_string(),
        }
    }
}

fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M:%S%.f").to_string()
}

/// A datetime attribute. Values coerced from a response remember their wire
/// form so writing them back reproduces the server's string byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamp {
    value: DateTime<FixedOffset>,
    wire: Option<String>,
}

impl Timestamp {
    pub fn new(value: DateTime<FixedOffset>) -> Self {
        Self { value, wire: None }
    }

    fn with_wire(value: DateTime<FixedOffset>, wire: &str) -> Self {
        Self {
            value,
            wire: Some(wire.to_string()),
        }
    }

    pub fn value(&self) -> DateTime<FixedOffset> {
        self.value
    }

    /// The received string, or RFC 3339 for values built locally.
    pub fn to_wire(&self) -> String {
        match &self.wire {
            Some(wire) => wire.clone(),
            None => self.value.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    let normalized = s.replacen(' ', "T", 1);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z"] {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, format) {
            return Some(dt);
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(naive.and_utc().fixed_offset());
        }
    }
    None
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("nil"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::DateTime(ts) => write!(f, "\"{}\"", ts.value().format("%Y-%m-%d %H:%M:%S")),
            Value::Date(d) => write!(f, "\"{}\"", d.format("%Y-%m-%d")),
            Value::Object(o) => write!(f, "{o}"),
            Value::Lazy(l) => write!(f, "#<lazy {}>", l.to_json()),
            other => f.write_str(&other.to_param_string()),
        }
    }
}

impl Index<&str> for Value {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        match self {
            Value::Object(o) => &o[key],
            _ => &NULL,
        }
    }
}

impl Index<usize> for Value {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        match self {
            Value::List(l) => l.get(idx).unwrap_or(&NULL),
            _ => &NULL,
        }
    }
}

pub(crate) fn null() -> &'static Value {
    &NULL
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Value::DateTime(Timestamp::new(dt))
    }
}

impl From<ResourceObject> for Value {
    fn from(o: ResourceObject) -> Self {
        Value::Object(Box::new(o))
    }
}

impl From<ResultIterator> for Value {
    fn from(l: ResultIterator) -> Self {
        Value::List(l)
    }
}

impl From<LazyAssociationLoader> for Value {
    fn from(l: LazyAssociationLoader) -> Self {
        Value::Lazy(l)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl PartialEq<&str> for Value {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

impl PartialEq<str> for Value {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == Some(other)
    }
}

impl PartialEq<i64> for Value {
    fn eq(&self, other: &i64) -> bool {
        self.as_i64() == Some(*other)
    }
}

impl PartialEq<bool> for Value {
    fn eq(&self, other: &bool) -> bool {
        self.as_bool() == Some(*other)
    }
}
