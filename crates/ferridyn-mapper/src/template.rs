//! Key templates: composite key values rendered from resource properties.
//!
//! A template is a format string mixing literals with `{property}`
//! placeholders, e.g. `"{_t}#{buyerId}"`. Placeholder values are
//! percent-encoded before substitution, so [`KeyTemplate::parse`] is the exact
//! inverse of [`KeyTemplate::render`].
//!
//! A *bare* template (`"{time}"`, a single placeholder and nothing else)
//! renders to the property's own JSON value, which keeps numeric sort keys
//! numerically ordered in the store.

use std::collections::BTreeMap;

use serde_json::{Number, Value};

use crate::error::{Error, Result};
use crate::filter::lookup;
use crate::types::{Item, PropertyType};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A compiled key template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

/// Characters percent-encoding never escapes. `%` itself shows up in
/// encoded output, so it cannot separate placeholders either.
fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '%')
}

/// First character of a literal that can never occur inside an encoded
/// value, with its byte offset.
fn separator(literal: &str) -> Option<(usize, char)> {
    literal.char_indices().find(|(_, c)| !is_unreserved(*c))
}

impl KeyTemplate {
    /// Compile a template string.
    pub fn compile(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => {
                                return Err(Error::invalid(format!(
                                    "nested '{{' in key template '{source}'"
                                )));
                            }
                            _ => name.push(c),
                        }
                    }
                    let name = name.trim();
                    if !closed || name.is_empty() {
                        return Err(Error::invalid(format!(
                            "malformed placeholder in key template '{source}'"
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name.to_string()));
                }
                '}' => {
                    return Err(Error::invalid(format!(
                        "unmatched '}}' in key template '{source}'"
                    )));
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if segments.is_empty() {
            return Err(Error::invalid("empty key template"));
        }

        // Placeholders must be told apart when parsing.
        for pair in segments.windows(3) {
            if let [Segment::Placeholder(_), Segment::Literal(lit), Segment::Placeholder(_)] = pair
                && separator(lit).is_none()
            {
                return Err(Error::invalid(format!(
                    "key template '{source}' separates placeholders with '{lit}', \
                     which needs a character other than [A-Za-z0-9-_.~%]"
                )));
            }
        }
        for pair in segments.windows(2) {
            if let [Segment::Placeholder(_), Segment::Placeholder(_)] = pair {
                return Err(Error::invalid(format!(
                    "key template '{source}' has adjacent placeholders"
                )));
            }
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Property paths referenced by this template, in order of appearance.
    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn references(&self, property: &str) -> bool {
        self.properties().any(|p| p == property)
    }

    /// The property of a bare template (`"{prop}"`).
    pub fn bare_property(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [Segment::Placeholder(p)] => Some(p),
            _ => None,
        }
    }

    /// Render against a resource. Returns `None` when any referenced
    /// property is missing, empty, or not a scalar.
    pub fn render(&self, item: &Item) -> Option<Value> {
        self.render_with(|path| lookup(item, path))
    }

    /// Render with an arbitrary property lookup (e.g. filter equality values).
    pub fn render_with<'a>(&self, get: impl Fn(&str) -> Option<&'a Value>) -> Option<Value> {
        if let Some(prop) = self.bare_property() {
            return match get(prop)? {
                Value::String(s) if !s.is_empty() => Some(Value::String(s.clone())),
                Value::Number(n) => Some(Value::Number(n.clone())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            };
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Placeholder(prop) => {
                    let raw = scalar_to_string(get(prop)?)?;
                    out.push_str(&urlencoding::encode(&raw));
                }
            }
        }
        Some(Value::String(out))
    }

    /// Recover the raw (decoded, untyped) property values from a rendered key.
    ///
    /// Returns `None` if `rendered` was not produced by this template.
    pub fn parse(&self, rendered: &Value) -> Option<BTreeMap<String, String>> {
        if let Some(prop) = self.bare_property() {
            let raw = scalar_to_string(rendered)?;
            return Some(BTreeMap::from([(prop.to_string(), raw)]));
        }

        let mut rest = rendered.as_str()?;
        let mut out = BTreeMap::new();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(lit) => rest = rest.strip_prefix(lit.as_str())?,
                Segment::Placeholder(prop) => {
                    let encoded = match self.segments.get(i + 1) {
                        None => std::mem::take(&mut rest),
                        Some(Segment::Literal(lit)) if i + 2 == self.segments.len() => {
                            let value = rest.strip_suffix(lit.as_str())?;
                            rest = &rest[value.len()..];
                            value
                        }
                        Some(Segment::Literal(lit)) => {
                            let (offset, sep) = separator(lit)?;
                            let end = rest.find(sep)?.checked_sub(offset)?;
                            let value = rest.get(..end)?;
                            rest = rest.get(end..)?;
                            value
                        }
                        Some(Segment::Placeholder(_)) => return None,
                    };
                    if encoded.is_empty() {
                        return None;
                    }
                    let decoded = urlencoding::decode(encoded).ok()?.into_owned();
                    out.insert(prop.clone(), decoded);
                }
            }
        }
        rest.is_empty().then_some(out)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Convert a parsed raw segment back to its declared type.
///
/// Undeclared (nested) paths stay strings. Objects and arrays cannot be key
/// components.
pub fn typed_parse(property: &str, raw: &str, property_type: Option<PropertyType>) -> Result<Value> {
    match property_type {
        None | Some(PropertyType::String) => Ok(Value::String(raw.to_string())),
        Some(PropertyType::Number | PropertyType::Date) => parse_number(raw)
            .ok_or_else(|| Error::invalid(format!("'{raw}' is not a number for '{property}'"))),
        Some(PropertyType::Boolean) => match raw {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(Error::invalid(format!(
                "'{raw}' is not a boolean for '{property}'"
            ))),
        },
        Some(PropertyType::Object | PropertyType::Array) => Err(Error::invalid(format!(
            "property '{property}' cannot be a key component"
        ))),
    }
}

fn parse_number(raw: &str) -> Option<Value> {
    if let Ok(n) = raw.parse::<u64>() {
        return Some(Value::Number(n.into()));
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Some(Value::Number(n.into()));
    }
    let f = raw.parse::<f64>().ok()?;
    Number::from_f64(f).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(v: Value) -> Item {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_render_composite() {
        let t = KeyTemplate::compile("{_t}#{buyerId}").unwrap();
        let r = t.render(&item(json!({"_t": "Order", "buyerId": 42})));
        assert_eq!(r, Some(json!("Order#42")));
    }

    #[test]
    fn test_render_bare_keeps_type() {
        let t = KeyTemplate::compile("{time}").unwrap();
        assert_eq!(t.bare_property(), Some("time"));
        assert_eq!(t.render(&item(json!({"time": 17}))), Some(json!(17)));
        assert_eq!(t.render(&item(json!({"time": ""}))), None);
    }

    #[test]
    fn test_render_unrenderable() {
        let t = KeyTemplate::compile("{a}:{b}").unwrap();
        assert_eq!(t.render(&item(json!({"a": "x"}))), None);
        assert_eq!(t.render(&item(json!({"a": "x", "b": ""}))), None);
        assert_eq!(t.render(&item(json!({"a": "x", "b": {"c": 1}}))), None);
        assert_eq!(t.render(&item(json!({"a": "x", "b": null}))), None);
    }

    #[test]
    fn test_render_nested_path() {
        let t = KeyTemplate::compile("user:{author.id}").unwrap();
        let r = t.render(&item(json!({"author": {"id": "bob"}})));
        assert_eq!(r, Some(json!("user:bob")));
    }

    #[test]
    fn test_parse_inverts_render() {
        let t = KeyTemplate::compile("pre_{a}:{b}#{c}.end").unwrap();
        let src = item(json!({"a": "x:y#z", "b": "::", "c": "100% sure.end"}));
        let rendered = t.render(&src).unwrap();
        let parsed = t.parse(&rendered).unwrap();
        assert_eq!(parsed["a"], "x:y#z");
        assert_eq!(parsed["b"], "::");
        assert_eq!(parsed["c"], "100% sure.end");
    }

    #[test]
    fn test_parse_separator_with_unreserved_prefix() {
        // The literal starts with '_', which may also end an encoded value.
        let t = KeyTemplate::compile("{a}_#{b}").unwrap();
        let rendered = t.render(&item(json!({"a": "x_", "b": "y"}))).unwrap();
        assert_eq!(rendered, json!("x__#y"));
        let parsed = t.parse(&rendered).unwrap();
        assert_eq!(parsed["a"], "x_");
        assert_eq!(parsed["b"], "y");
    }

    #[test]
    fn test_parse_rejects_foreign_strings() {
        let t = KeyTemplate::compile("Order#{id}").unwrap();
        assert!(t.parse(&json!("Invoice#1")).is_none());
        assert!(t.parse(&json!("Order#")).is_none());
        assert!(t.parse(&json!(5)).is_none());
    }

    #[test]
    fn test_compile_errors() {
        assert!(KeyTemplate::compile("").is_err());
        assert!(KeyTemplate::compile("{a").is_err());
        assert!(KeyTemplate::compile("a}").is_err());
        assert!(KeyTemplate::compile("{}").is_err());
        assert!(KeyTemplate::compile("{a}{b}").is_err());
        assert!(KeyTemplate::compile("{a}_{b}").is_err());
        assert!(KeyTemplate::compile("{a}_:{b}").is_ok());
        assert!(KeyTemplate::compile("constant").is_ok());
    }

    #[test]
    fn test_typed_parse() {
        assert_eq!(
            typed_parse("n", "42", Some(PropertyType::Number)).unwrap(),
            json!(42)
        );
        assert_eq!(
            typed_parse("n", "-3", Some(PropertyType::Number)).unwrap(),
            json!(-3)
        );
        assert_eq!(
            typed_parse("n", "2.5", Some(PropertyType::Number)).unwrap(),
            json!(2.5)
        );
        assert_eq!(
            typed_parse("d", "1700000000000", Some(PropertyType::Date)).unwrap(),
            json!(1_700_000_000_000u64)
        );
        assert_eq!(
            typed_parse("b", "true", Some(PropertyType::Boolean)).unwrap(),
            json!(true)
        );
        assert_eq!(typed_parse("s", "abc", None).unwrap(), json!("abc"));
        assert!(typed_parse("n", "abc", Some(PropertyType::Number)).is_err());
        assert!(typed_parse("o", "{}", Some(PropertyType::Object)).is_err());
        assert!(typed_parse("a", "[]", Some(PropertyType::Array)).is_err());
    }

    #[test]
    fn test_typed_round_trip() {
        let t = KeyTemplate::compile("{_t}#{total}#{paid}").unwrap();
        let src = item(json!({"_t": "Order", "total": 12.75, "paid": false}));
        let parsed = t.parse(&t.render(&src).unwrap()).unwrap();
        assert_eq!(
            typed_parse("total", &parsed["total"], Some(PropertyType::Number)).unwrap(),
            json!(12.75)
        );
        assert_eq!(
            typed_parse("paid", &parsed["paid"], Some(PropertyType::Boolean)).unwrap(),
            json!(false)
        );
        assert_eq!(parsed["_t"], "Order");
    }
}
