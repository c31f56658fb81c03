//! Declarative field validation run before instance-bound calls.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ApiError;
use crate::resource::ResourceObject;
use crate::value::Value;

/// Custom check: return a message to record a failure for the field.
pub type CustomRule = Arc<dyn Fn(&ResourceObject, &str, &Value) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub enum Rule {
    Presence,
    Length { min: Option<usize>, max: Option<usize> },
    Numericality,
    Minimum(f64),
    Maximum(f64),
    Custom(CustomRule),
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Presence => f.write_str("Presence"),
            Rule::Length { min, max } => f
                .debug_struct("Length")
                .field("min", min)
                .field("max", max)
                .finish(),
            Rule::Numericality => f.write_str("Numericality"),
            Rule::Minimum(n) => f.debug_tuple("Minimum").field(n).finish(),
            Rule::Maximum(n) => f.debug_tuple("Maximum").field(n).finish(),
            Rule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Rule {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&ResourceObject, &str, &Value) -> Option<String> + Send + Sync + 'static,
    {
        Rule::Custom(Arc::new(f))
    }

    fn check(&self, object: &ResourceObject, field: &str, value: &Value) -> Option<String> {
        match self {
            Rule::Presence => value.is_null().then(|| "must be present".to_string()),
            Rule::Length { min, max } => {
                let len = value.to_param_string().chars().count();
                if min.is_some_and(|min| len < min) {
                    min.map(|min| format!("must be at least {min} characters long"))
                } else if max.is_some_and(|max| len > max) {
                    max.map(|max| format!("must be no more than {max} characters long"))
                } else {
                    None
                }
            }
            Rule::Numericality => numeric(value)
                .is_none()
                .then(|| "must be numeric".to_string()),
            Rule::Minimum(bound) => match numeric(value) {
                Some(n) if n < *bound => Some(format!("must be at least {bound}")),
                _ => None,
            },
            Rule::Maximum(bound) => match numeric(value) {
                Some(n) if n > *bound => Some(format!("must be no more than {bound}")),
                _ => None,
            },
            Rule::Custom(check) => check(object, field, value),
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Check every rule, collecting all failures before returning.
pub fn validate(object: &ResourceObject, rules: &[(String, Rule)]) -> Result<(), ApiError> {
    let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (field, rule) in rules {
        let value = &object[field.as_str()];
        if let Some(message) = rule.check(object, field, value) {
            errors.entry(field.clone()).or_default().push(message);
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::ValidationFailed { errors })
    }
}
