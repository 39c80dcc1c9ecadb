//! Filter vocabulary and in-memory evaluation.
//!
//! A [`Filter`] is the wire-level map `{OPERATOR: {property: operand}}`.
//! Nested operand objects address nested properties, so
//! `{"EQ": {"address": {"city": "Oslo"}}}` constrains `address.city`.
//! [`Filter::conditions`] flattens the map into `(operator, property, operand)`
//! triples.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::{Item, ResourceModel, TYPE};

/// Filter operators, with their wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Eq,
    Neq,
    In,
    NotIn,
    Between,
    StartsWith,
    Contains,
    NotContains,
    Lt,
    Lte,
    Gt,
    Gte,
    Null,
    SubclassOf,
}

impl Operator {
    /// Operators the store accepts in a key condition. Only `EQ` may select a
    /// partition.
    pub fn is_key_condition_eligible(self) -> bool {
        matches!(
            self,
            Operator::Eq
                | Operator::Lt
                | Operator::Lte
                | Operator::Gt
                | Operator::Gte
                | Operator::Between
                | Operator::StartsWith
        )
    }
}

/// One flattened filter constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub op: Operator,
    pub property: String,
    pub value: Value,
}

/// A structured filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    clauses: BTreeMap<Operator, Map<String, Value>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the wire form. Unknown operators are rejected.
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::invalid(format!("malformed filter: {e}")))
    }

    /// Add a constraint, returning a new filter.
    pub fn with(mut self, op: Operator, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses
            .entry(op)
            .or_default()
            .insert(property.into(), value.into());
        self
    }

    pub fn eq(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Operator::Eq, property, value)
    }

    /// A copy of this filter bound to a resource type.
    pub fn for_type(&self, type_id: &str) -> Self {
        self.clone().eq(TYPE, type_id)
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.values().all(|m| m.is_empty())
    }

    /// Operands of the `EQ` clause, flattened.
    pub fn equalities(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for c in self.conditions().filter(|c| c.op == Operator::Eq) {
            out.entry(c.property).or_insert(c.value);
        }
        out
    }

    /// Iterate every constraint as a flattened triple.
    pub fn conditions(&self) -> Conditions<'_> {
        let mut stack = Vec::new();
        for (op, props) in self.clauses.iter().rev() {
            for (name, value) in props.iter().rev() {
                stack.push((*op, name.clone(), value));
            }
        }
        Conditions { stack }
    }

    /// Check every constraint against the model: known properties and
    /// well-formed operands.
    pub fn validate(&self, model: &ResourceModel) -> Result<()> {
        for c in self.conditions() {
            if !model.is_declared(&c.property) {
                return Err(Error::invalid(format!(
                    "filter references unknown property '{}' of '{}'",
                    c.property, model.id
                )));
            }
            c.validate()?;
        }
        Ok(())
    }
}

/// Worklist iterator over a filter's flattened constraints.
pub struct Conditions<'a> {
    stack: Vec<(Operator, String, &'a Value)>,
}

impl Iterator for Conditions<'_> {
    type Item = Condition;

    fn next(&mut self) -> Option<Condition> {
        while let Some((op, path, value)) = self.stack.pop() {
            match value {
                Value::Object(nested) if !nested.is_empty() => {
                    for (name, v) in nested.iter().rev() {
                        self.stack.push((op, format!("{path}.{name}"), v));
                    }
                }
                _ => {
                    return Some(Condition {
                        op,
                        property: path,
                        value: value.clone(),
                    });
                }
            }
        }
        None
    }
}

impl Condition {
    pub fn new(op: Operator, property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op,
            property: property.into(),
            value: value.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        let ok = match self.op {
            Operator::Between => self.value.as_array().is_some_and(|a| a.len() == 2),
            Operator::In | Operator::NotIn => self.value.is_array(),
            Operator::Null => self.value.is_boolean(),
            Operator::StartsWith => self.value.is_string(),
            Operator::SubclassOf => match &self.value {
                Value::String(_) => true,
                Value::Array(a) => a.iter().all(Value::is_string),
                _ => false,
            },
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::invalid(format!(
                "invalid operand {} for {:?} on '{}'",
                self.value, self.op, self.property
            )))
        }
    }

    /// Evaluate against an item. `is_subclass(child, ancestor)` answers
    /// type-hierarchy questions for `SUBCLASS_OF`.
    pub fn matches(&self, item: &Item, is_subclass: &dyn Fn(&str, &str) -> bool) -> bool {
        let actual = lookup(item, &self.property).unwrap_or(&Value::Null);
        match self.op {
            Operator::Eq => values_equal(actual, &self.value),
            Operator::Neq => !values_equal(actual, &self.value),
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|vs| vs.iter().any(|v| values_equal(actual, v))),
            Operator::NotIn => self
                .value
                .as_array()
                .is_some_and(|vs| !vs.iter().any(|v| values_equal(actual, v))),
            Operator::Between => match self.value.as_array().map(Vec::as_slice) {
                Some([low, high]) => {
                    matches!(
                        compare_values(actual, low),
                        Some(Ordering::Greater | Ordering::Equal)
                    ) && matches!(
                        compare_values(actual, high),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                }
                _ => false,
            },
            Operator::StartsWith => match (actual, &self.value) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Operator::Contains => contains(actual, &self.value),
            Operator::NotContains => !contains(actual, &self.value),
            Operator::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Null => {
                let absent = actual.is_null();
                self.value.as_bool() == Some(absent)
            }
            Operator::SubclassOf => {
                let Some(child) = actual.as_str() else {
                    return false;
                };
                match &self.value {
                    Value::String(ancestor) => is_subclass(child, ancestor),
                    Value::Array(ancestors) => ancestors
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|a| is_subclass(child, a)),
                    _ => false,
                }
            }
        }
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match (actual, needle) {
        (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|v| values_equal(v, n)),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Look up a property path on an item.
///
/// An exact key wins over a dot-separated nested path, so flat maps such as
/// cursors resolve the same way as the rows they were taken from.
pub fn lookup<'a>(item: &'a Item, path: &str) -> Option<&'a Value> {
    if let Some(v) = item.get(path) {
        return Some(v);
    }
    let mut segments = path.split('.');
    let mut current = item.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Compare two JSON values, returning an ordering if the types are comparable.
///
/// - Numbers: compared as f64
/// - Strings: compared lexicographically
/// - Booleans: false < true
/// - Null == Null
/// - Mismatched types: returns `None`
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

pub fn values_equal(left: &Value, right: &Value) -> bool {
    match compare_values(left, right) {
        Some(o) => o == Ordering::Equal,
        None => left == right,
    }
}

/// Total order over JSON values for sorting: null < bool < number < string
/// < array < object, then by value.
pub fn total_cmp(left: &Value, right: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.total_cmp(&b)
        }
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            left.to_string().cmp(&right.to_string())
        }
        _ => compare_values(left, right).unwrap_or_else(|| rank(left).cmp(&rank(right))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Item {
        json!({
            "_t": "Order",
            "name": "Alice",
            "age": 30,
            "tags": ["admin", "user"],
            "address": {"city": "Portland"},
            "notes": "ship fast",
            "gone": null
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn no_types(_: &str, _: &str) -> bool {
        false
    }

    fn check(op: Operator, prop: &str, value: Value) -> bool {
        Condition::new(op, prop, value).matches(&sample(), &no_types)
    }

    #[test]
    fn test_from_json_rejects_unknown_operator() {
        assert!(Filter::from_json(json!({"EQ": {"a": 1}})).is_ok());
        assert!(Filter::from_json(json!({"LIKE": {"a": 1}})).is_err());
    }

    #[test]
    fn test_conditions_flatten_nested_paths() {
        let f = Filter::from_json(json!({
            "EQ": {"address": {"city": "Portland", "zip": {"code": "97201"}}, "name": "Alice"},
            "GT": {"age": 20}
        }))
        .unwrap();
        let triples: Vec<(Operator, String)> =
            f.conditions().map(|c| (c.op, c.property)).collect();
        assert_eq!(
            triples,
            vec![
                (Operator::Eq, "address.city".to_string()),
                (Operator::Eq, "address.zip.code".to_string()),
                (Operator::Eq, "name".to_string()),
                (Operator::Gt, "age".to_string()),
            ]
        );
        // Restartable.
        assert_eq!(f.conditions().count(), 4);
    }

    #[test]
    fn test_for_type_leaves_original_untouched() {
        let f = Filter::new().eq("name", "Alice");
        let bound = f.for_type("Order");
        assert_eq!(f.equalities().len(), 1);
        assert_eq!(bound.equalities()["_t"], json!("Order"));
    }

    #[test]
    fn test_comparisons() {
        assert!(check(Operator::Eq, "age", json!(30)));
        assert!(check(Operator::Eq, "age", json!(30.0)));
        assert!(check(Operator::Neq, "age", json!(31)));
        assert!(check(Operator::Lt, "age", json!(31)));
        assert!(!check(Operator::Lt, "age", json!(30)));
        assert!(check(Operator::Lte, "age", json!(30)));
        assert!(check(Operator::Gt, "age", json!(29)));
        assert!(check(Operator::Gte, "age", json!(30)));
        assert!(!check(Operator::Gt, "age", json!("29")));
        assert!(check(Operator::Between, "age", json!([30, 40])));
        assert!(!check(Operator::Between, "age", json!([31, 40])));
    }

    #[test]
    fn test_membership_and_strings() {
        assert!(check(Operator::In, "name", json!(["Bob", "Alice"])));
        assert!(!check(Operator::NotIn, "name", json!(["Bob", "Alice"])));
        assert!(check(Operator::StartsWith, "name", json!("Al")));
        assert!(check(Operator::Contains, "notes", json!("fast")));
        assert!(check(Operator::Contains, "tags", json!("admin")));
        assert!(check(Operator::NotContains, "tags", json!("root")));
        assert!(check(Operator::Eq, "address.city", json!("Portland")));
    }

    #[test]
    fn test_null_operator() {
        assert!(check(Operator::Null, "gone", json!(true)));
        assert!(check(Operator::Null, "missing", json!(true)));
        assert!(check(Operator::Null, "name", json!(false)));
        assert!(!check(Operator::Null, "name", json!(true)));
    }

    #[test]
    fn test_subclass_of() {
        let hierarchy = |child: &str, ancestor: &str| child == ancestor || ancestor == "Form";
        let c = Condition::new(Operator::SubclassOf, "_t", json!("Form"));
        assert!(c.matches(&sample(), &hierarchy));
        let c = Condition::new(Operator::SubclassOf, "_t", json!(["Invoice"]));
        assert!(!c.matches(&sample(), &|a: &str, b: &str| a == b));
    }

    #[test]
    fn test_validate_operand_shapes() {
        let model: ResourceModel = serde_json::from_value(json!({
            "id": "Order",
            "properties": [{"name": "age", "property_type": "number"}],
            "primary_key": {"hash": "{age}"}
        }))
        .unwrap();
        assert!(Filter::new().with(Operator::Between, "age", json!([1, 2])).validate(&model).is_ok());
        assert!(Filter::new().with(Operator::Between, "age", json!(1)).validate(&model).is_err());
        assert!(Filter::new().with(Operator::In, "age", json!(1)).validate(&model).is_err());
        assert!(Filter::new().with(Operator::Null, "age", json!("x")).validate(&model).is_err());
        assert!(Filter::new().eq("nope", 1).validate(&model).is_err());
        assert!(Filter::new().eq("_t", "Order").validate(&model).is_ok());
    }

    #[test]
    fn test_total_cmp_mixed_types() {
        let mut vals = vec![json!("b"), json!(2), json!(null), json!(true), json!(10), json!("a")];
        vals.sort_by(total_cmp);
        assert_eq!(
            vals,
            vec![json!(null), json!(true), json!(2), json!(10), json!("a"), json!("b")]
        );
    }
}
