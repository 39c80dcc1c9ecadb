//! Select projection: return only the requested properties of a resource.
//!
//! Identity properties (`_t`, `_link`, `_permalink`) are always kept so a
//! projected resource can still be re-read or updated.

use serde_json::{Map, Value};

use crate::filter::lookup;
use crate::types::{Item, LINK, PERMALINK, TYPE};

/// Properties every projected resource keeps.
pub const IDENTITY: [&str; 3] = [TYPE, LINK, PERMALINK];

/// Keep `paths` (dot-separated for nested properties) plus `always`. An
/// empty `paths` returns the resource unchanged.
pub fn apply_projection(resource: &Item, paths: &[String], always: &[&str]) -> Item {
    if paths.is_empty() {
        return resource.clone();
    }

    let mut result = Map::new();
    for &name in always {
        if let Some(v) = resource.get(name) {
            result.insert(name.to_string(), v.clone());
        }
    }
    for path in paths {
        if let Some(v) = lookup(resource, path)
            && !v.is_null()
        {
            set_nested_path(&mut result, path, v.clone());
        }
    }
    result
}

/// Set a value at a dot-separated path, creating intermediate objects. A
/// path running through a non-object value is skipped.
fn set_nested_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let Some((parents, leaf)) = path.rsplit_once('.') else {
        target.insert(path.to_string(), value);
        return;
    };
    let mut current = target;
    for segment in parents.split('.') {
        let entry = current
            .entry(segment)
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(next) = entry.as_object_mut() else {
            return;
        };
        current = next;
    }
    current.insert(leaf.to_string(), value);
}
