//! Ordered collections returned by list endpoints.

use std::ops::Index;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::http::HeaderList;
use crate::value::{self, Value};

/// An in-memory, restartable sequence of materialized values carrying the
/// same transport metadata as a single `ResourceObject`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultIterator {
    items: Vec<Value>,
    status: Option<u16>,
    etag: Option<String>,
    headers: HeaderList,
}

impl ResultIterator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn push(&mut self, item: impl Into<Value>) {
        self.items.push(item.into());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.items.get(idx)
    }

    pub fn first(&self) -> Option<&Value> {
        self.items.first()
    }

    pub fn last(&self) -> Option<&Value> {
        self.items.last()
    }

    pub fn position(&self, item: &Value) -> Option<usize> {
        self.items.iter().position(|candidate| candidate == item)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub(crate) fn set_response_meta(&mut self, status: u16, headers: &HeaderList) {
        self.status = Some(status);
        self.etag = headers.get_str("etag").map(str::to_string);
        self.headers = headers.clone();
    }

    /// Run `f` over every item on its own scoped thread and collect the
    /// results in input order, whatever order the workers finish in.
    pub fn parallelise<R, F>(&self, f: F) -> Vec<R>
    where
        F: Fn(&Value) -> R + Sync,
        R: Send,
    {
        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .items
                .iter()
                .map(|item| scope.spawn(move || f(item)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

impl Index<usize> for ResultIterator {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        self.items.get(idx).unwrap_or_else(|| value::null())
    }
}

impl<'a> IntoIterator for &'a ResultIterator {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl IntoIterator for ResultIterator {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl FromIterator<Value> for ResultIterator {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn letters() -> ResultIterator {
        let mut result = ResultIterator::new();
        result.push("a");
        result.push("z");
        result
    }

    #[test]
    fn keeps_status_from_creation() {
        assert_eq!(ResultIterator::with_status(200).status(), Some(200));
    }

    #[test]
    fn positional_access() {
        let result = letters();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], "a");
        assert_eq!(result[1], "z");
        assert!(result[2].is_null());
        assert_eq!(result.first(), Some(&Value::from("a")));
        assert_eq!(result.last(), Some(&Value::from("z")));
        assert_eq!(result.position(&Value::from("z")), Some(1));
    }

    #[test]
    fn empty_until_pushed() {
        let mut result = ResultIterator::new();
        assert!(result.is_empty());
        result.push("a");
        assert!(!result.is_empty());
    }

    #[test]
    fn iteration_is_restartable() {
        let result = letters();
        let first: Vec<_> = result.iter().collect();
        let second: Vec<_> = (&result).into_iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn parallelise_preserves_input_order() {
        let mut result = ResultIterator::new();
        for n in [3, 2, 1] {
            result.push(n);
        }
        let delay = Duration::from_millis(50);
        let start = Instant::now();
        let doubled = result.parallelise(|item| {
            let n = item.as_i64().unwrap();
            std::thread::sleep(delay * u32::try_from(n).unwrap());
            n * 2
        });
        assert!(start.elapsed() < delay * 6);
        assert_eq!(doubled, vec![6, 4, 2]);
    }
}
