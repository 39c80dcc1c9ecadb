//! Minification: keep stored rows under the item size ceiling.
//!
//! Oversized resources lose their bulkiest optional properties on write. The
//! names of removed properties are kept in the row's `_cut` list and the full
//! payload lives in the object store under the resource's `_link`, so reads
//! can restore it on demand with [`maybe_inflate`].

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::keys::CompiledModel;
use crate::store::ObjectStore;
use crate::types::{CUT, Item, LINK, is_system_property};

/// Result of [`minify`].
#[derive(Debug, Clone, PartialEq)]
pub struct Minified {
    /// The resource to store, with `_cut` listing every removed property.
    pub min: Item,
    /// Removed properties and their original values.
    pub diff: Item,
}

impl Minified {
    pub fn is_cut(&self) -> bool {
        !self.diff.is_empty()
    }
}

/// Names in a row's `_cut` list.
pub fn cut_list(item: &Item) -> Vec<String> {
    match item.get(CUT) {
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn serialized_size<T: serde::Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map_or(0, |v| v.len())
}

fn top_segment(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Shrink `item` below `max_size` serialized bytes.
///
/// Optional properties, declared or not, go largest first. Properties
/// referenced by a renderable key template, required properties and system
/// properties are never removed. If the item cannot get under the ceiling
/// the best-effort result is returned.
pub fn minify(model: &CompiledModel, item: &Item, max_size: Option<usize>) -> Minified {
    let unchanged = || Minified {
        min: item.clone(),
        diff: Item::new(),
    };
    let Some(max_size) = max_size else {
        return unchanged();
    };
    if serialized_size(item) <= max_size {
        return unchanged();
    }

    let pinned: BTreeSet<String> = model
        .derive_keys(item)
        .map(|keys| {
            keys.pinned()
                .iter()
                .map(|p| top_segment(p).to_string())
                .collect()
        })
        .unwrap_or_default();
    let removable = |name: &str| {
        !is_system_property(name) && !pinned.contains(name) && !model.model.is_required(name)
    };

    let mut candidates: Vec<(&String, usize)> = item
        .iter()
        .filter(|(name, _)| removable(name))
        .map(|(name, value)| (name, serialized_size(value)))
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    let mut min = item.clone();
    let mut diff = Item::new();
    let mut cut = cut_list(item);
    for (name, _) in candidates {
        if serialized_size(&min) <= max_size {
            break;
        }
        if let Some(value) = min.remove(name) {
            diff.insert(name.clone(), value);
            cut.push(name.clone());
            min.insert(CUT.to_string(), Value::from(cut.clone()));
        }
    }
    Minified { min, diff }
}

/// What a read asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct InflateOptions<'a> {
    /// Requested property paths; `None` means the whole resource.
    pub select: Option<&'a [String]>,
    pub force: bool,
}

/// Whether a minified resource must be restored to satisfy a read.
pub fn needs_inflate(resource: &Item, options: &InflateOptions<'_>) -> bool {
    let cut = cut_list(resource);
    if cut.is_empty() {
        return false;
    }
    if options.force {
        return true;
    }
    match options.select {
        None => true,
        Some(paths) => paths.iter().any(|p| cut.iter().any(|c| c == top_segment(p))),
    }
}

/// Restore the full payload of a minified resource from the object store,
/// when the read needs any of the removed properties.
pub async fn maybe_inflate(
    resource: Item,
    options: &InflateOptions<'_>,
    objects: Option<&dyn ObjectStore>,
) -> Result<Item> {
    if !needs_inflate(&resource, options) {
        return Ok(resource);
    }
    let Some(objects) = objects else {
        warn!(cut = ?cut_list(&resource), "minified resource read without an object store");
        return Ok(resource);
    };
    let link = resource
        .get(LINK)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid("minified resource has no _link"))?;
    let full = objects
        .get(link)
        .await?
        .ok_or_else(|| Error::NotFound(format!("object {link}")))?;

    let mut merged = resource;
    merged.extend(full);
    merged.remove(CUT);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::{order_model, table_schema};
    use crate::memory::MemoryObjectStore;
    use serde_json::json;

    fn model() -> CompiledModel {
        CompiledModel::compile(order_model(), &table_schema()).unwrap()
    }

    fn item(v: Value) -> Item {
        v.as_object().unwrap().clone()
    }

    fn big_order() -> Item {
        item(json!({
            "_t": "Order",
            "_link": "L1",
            "buyerId": 42,
            "orderId": "A",
            "notes": "n".repeat(800),
            "bio": "b".repeat(4000),
        }))
    }

    #[test]
    fn test_no_ceiling_or_small_item_unchanged() {
        let m = model();
        let src = big_order();
        let out = minify(&m, &src, None);
        assert_eq!(out.min, src);
        assert!(!out.is_cut());
        let out = minify(&m, &src, Some(100_000));
        assert_eq!(out.min, src);
        assert!(out.diff.is_empty());
    }

    #[test]
    fn test_largest_optional_removed_first() {
        let m = model();
        let src = big_order();
        let out = minify(&m, &src, Some(1000));
        assert_eq!(out.diff.keys().collect::<Vec<_>>(), vec!["bio"]);
        assert_eq!(out.diff["bio"], src["bio"]);
        assert_eq!(cut_list(&out.min), vec!["bio".to_string()]);
        assert!(!out.min.contains_key("bio"));
        assert_eq!(out.min["notes"], src["notes"]);
        assert!(serialized_size(&out.min) <= 1000);
    }

    #[test]
    fn test_pinned_and_required_never_removed() {
        let m = model();
        let src = item(json!({
            "_t": "Order",
            "buyerId": 42,
            "orderId": "o".repeat(2000),
            "sellerId": "s".repeat(2000),
            "bio": "b".repeat(100),
        }));
        let out = minify(&m, &src, Some(500));
        // sellerId renders an index key; orderId is required and pinned.
        assert_eq!(out.diff.keys().collect::<Vec<_>>(), vec!["bio"]);
        assert_eq!(out.min["sellerId"], src["sellerId"]);
        assert_eq!(out.min["orderId"], src["orderId"]);
        assert!(serialized_size(&out.min) > 500);
    }

    #[test]
    fn test_large_undeclared_property_cut_before_small_declared_one() {
        let m = model();
        let src = item(json!({
            "_t": "Order",
            "buyerId": 42,
            "orderId": "A",
            "extra": "e".repeat(3000),
            "notes": "n".repeat(600),
        }));
        let out = minify(&m, &src, Some(1000));
        assert_eq!(cut_list(&out.min), vec!["extra".to_string()]);
        assert_eq!(out.min["notes"], src["notes"]);
        assert!(serialized_size(&out.min) <= 1000);
    }

    #[test]
    fn test_reminify_is_noop() {
        let m = model();
        let once = minify(&m, &big_order(), Some(1000));
        let twice = minify(&m, &once.min, Some(1000));
        assert!(twice.diff.is_empty());
        assert_eq!(twice.min, once.min);

        let stuck = minify(&m, &item(json!({"_t": "Order", "buyerId": 1, "orderId": "x".repeat(900)})), Some(100));
        let again = minify(&m, &stuck.min, Some(100));
        assert!(again.diff.is_empty());
        assert_eq!(again.min, stuck.min);
    }

    #[test]
    fn test_needs_inflate() {
        let min = item(json!({"_t": "Order", "_cut": ["bio"]}));
        let select = ["bio.text".to_string()];
        let other = ["notes".to_string()];
        assert!(needs_inflate(&min, &InflateOptions::default()));
        assert!(needs_inflate(&min, &InflateOptions { select: Some(&select), force: false }));
        assert!(!needs_inflate(&min, &InflateOptions { select: Some(&other), force: false }));
        assert!(needs_inflate(&min, &InflateOptions { select: Some(&other), force: true }));
        assert!(!needs_inflate(&item(json!({"_t": "Order"})), &InflateOptions::default()));
    }

    #[tokio::test]
    async fn test_maybe_inflate_restores_cut_properties() {
        let m = model();
        let src = big_order();
        let out = minify(&m, &src, Some(1000));
        let objects = MemoryObjectStore::new();
        objects.insert("L1", src.clone());

        let restored = maybe_inflate(out.min.clone(), &InflateOptions::default(), Some(&objects))
            .await
            .unwrap();
        assert_eq!(restored, src);

        // Without an object store the minified form comes back as-is.
        let same = maybe_inflate(out.min.clone(), &InflateOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(same, out.min);
    }

    #[tokio::test]
    async fn test_maybe_inflate_missing_object() {
        let min = item(json!({"_t": "Order", "_link": "gone", "_cut": ["bio"]}));
        let objects = MemoryObjectStore::new();
        let err = maybe_inflate(min, &InflateOptions::default(), Some(&objects))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
