//! Field validation rules.
//!
//! A [`Rule`] is a named predicate over an optional field value (`None` when
//! the field is missing). [`Rules`] applies them in declaration order and
//! stops at the first violation, naming the failing field.

use std::fmt;
use std::sync::Arc;

use crate::types::{Error, Result};
use crate::value::Value;

/// Predicate over a possibly-missing value.
pub type Rule = Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>;

/// Ordered field -> rule list.
#[derive(Clone, Default)]
pub struct Rules {
    fields: Vec<(String, Rule)>,
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule for `field`. A field may carry several rules.
    pub fn field(mut self, field: impl Into<String>, rule: Rule) -> Self {
        self.fields.push((field.into(), rule));
        self
    }

    /// Check `data` (expected to be a record) field by field.
    pub fn check(&self, data: &Value) -> Result<()> {
        for (field, rule) in &self.fields {
            if !rule(data.field(field)) {
                return Err(Error::validation(format!("field '{field}' is invalid")));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Debug for Rules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.fields.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Field must be present and not null.
pub fn required() -> Rule {
    Arc::new(|v: Option<&Value>| matches!(v, Some(v) if !v.is_null()))
}

/// Field must be a non-empty string.
pub fn non_empty_string() -> Rule {
    Arc::new(|v: Option<&Value>| {
        matches!(v.and_then(Value::as_str), Some(s) if !s.is_empty())
    })
}

/// Field must be a bool.
pub fn is_bool() -> Rule {
    Arc::new(|v: Option<&Value>| v.and_then(Value::as_bool).is_some())
}

/// Field must be a list.
pub fn is_list() -> Rule {
    Arc::new(|v: Option<&Value>| v.and_then(Value::as_list).is_some())
}

/// Field must be a set.
pub fn is_set() -> Rule {
    Arc::new(|v: Option<&Value>| v.and_then(Value::as_set).is_some())
}

/// Field must be a record.
pub fn is_record() -> Rule {
    Arc::new(|v: Option<&Value>| v.and_then(Value::as_record).is_some())
}

/// Field must be a number within `[min, max]`.
pub fn number_in(min: f64, max: f64) -> Rule {
    Arc::new(move |v: Option<&Value>| {
        matches!(v.and_then(Value::as_f64), Some(n) if n >= min && n <= max)
    })
}

/// Field must be a positive integer.
pub fn positive_int() -> Rule {
    Arc::new(|v: Option<&Value>| matches!(v.and_then(Value::as_i64), Some(n) if n > 0))
}

/// Field must be one of the given strings.
pub fn one_of(allowed: &[&str]) -> Rule {
    let allowed: Vec<String> = allowed.iter().map(|s| (*s).to_string()).collect();
    Arc::new(move |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .is_some_and(|s| allowed.iter().any(|a| a == s))
    })
}

/// Missing or null passes; anything else must satisfy `rule`.
pub fn optional(rule: Rule) -> Rule {
    Arc::new(move |v: Option<&Value>| match v {
        None | Some(Value::Null) => true,
        Some(_) => rule(v),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fails_fast_on_first_violation() {
        let rules = Rules::new()
            .field("title", non_empty_string())
            .field("rating", number_in(0.0, 5.0))
            .field("year", positive_int());

        let data = Value::from(json!({"title": "", "rating": 9}));
        let err = rules.check(&data).unwrap_err();
        assert!(err.to_string().contains("'title'"));

        let data = Value::from(json!({"title": "Blue", "rating": 9}));
        let err = rules.check(&data).unwrap_err();
        assert!(err.to_string().contains("'rating'"));
    }

    #[test]
    fn test_passes_valid_record() {
        let rules = Rules::new()
            .field("id", required())
            .field("view", one_of(&["tree", "list"]))
            .field("comment", optional(non_empty_string()));

        assert!(rules
            .check(&Value::from(json!({"id": 7, "view": "tree"})))
            .is_ok());
        assert!(rules
            .check(&Value::from(json!({"id": 7, "view": "tree", "comment": null})))
            .is_ok());
        assert!(rules
            .check(&Value::from(json!({"id": null, "view": "tree"})))
            .is_err());
    }

    #[test]
    fn test_type_rules() {
        assert!(is_bool()(Some(&Value::Bool(true))));
        assert!(!is_bool()(Some(&Value::Int(1))));
        assert!(is_list()(Some(&Value::List(vec![]))));
        assert!(is_record()(Some(&Value::record())));
        assert!(!is_set()(None));
    }
}
