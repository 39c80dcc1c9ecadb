//! In-memory implementations of the collaborator traits.
//!
//! [`MemoryStore`] behaves like a single DynamoDB table: rows are addressed
//! by their primary key attributes, indexes are sparse and honour their
//! projection, queries read in sort-key order with an exclusive start key and
//! a pre-filter `limit`, and conditional writes are atomic. Transient
//! failures and unprocessed batch rows can be injected for tests.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::StoreError;
use crate::expr::Expr;
use crate::filter::{total_cmp, values_equal};
use crate::store::{
    BatchWriteOutput, ModelRegistry, ObjectStore, QueryOutput, QueryRequest, ScanRequest,
    StorageAdapter,
};
use crate::types::{Item, Projection, ResourceModel, TableSchema};

static ALL: Projection = Projection::All;

#[derive(Default)]
struct Faults {
    fail_next: VecDeque<StoreError>,
    unprocessed_rounds: u32,
}

/// An in-memory table.
pub struct MemoryStore {
    schema: TableSchema,
    /// Keyed by the canonical JSON of `[hash, range]`.
    rows: RwLock<BTreeMap<String, Item>>,
    faults: Mutex<Faults>,
    calls: AtomicUsize,
}

struct Layout<'a> {
    hash_key: &'a str,
    range_key: Option<&'a str>,
    projection: &'a Projection,
}

impl MemoryStore {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` calls (of any kind) with `error`.
    pub fn fail_next(&self, n: usize, error: StoreError) {
        let mut faults = self.faults.lock();
        faults.fail_next.extend(std::iter::repeat_n(error, n));
    }

    /// For the next `rounds` batch writes, apply only the first half of the
    /// rows and report the rest as unprocessed.
    pub fn leave_unprocessed(&self, rounds: u32) {
        self.faults.lock().unprocessed_rounds = rounds;
    }

    /// Number of remote calls made so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Every stored row, in primary key order.
    pub fn rows(&self) -> Vec<Item> {
        self.rows.read().values().cloned().collect()
    }

    fn begin(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        match self.faults.lock().fail_next.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn primary_key(&self, item: &Item) -> Result<String, StoreError> {
        let hash = item.get(&self.schema.partition_key.name).ok_or_else(|| {
            StoreError::Other(format!(
                "missing partition key '{}'",
                self.schema.partition_key.name
            ))
        })?;
        let range = match &self.schema.sort_key {
            Some(sk) => item
                .get(&sk.name)
                .ok_or_else(|| StoreError::Other(format!("missing sort key '{}'", sk.name)))?,
            None => &Value::Null,
        };
        serde_json::to_string(&[hash, range]).map_err(|e| StoreError::Other(e.to_string()))
    }

    fn layout(&self, index: Option<&str>) -> Result<Layout<'_>, StoreError> {
        match index {
            None => Ok(Layout {
                hash_key: &self.schema.partition_key.name,
                range_key: self.schema.sort_key.as_ref().map(|k| k.name.as_str()),
                projection: &ALL,
            }),
            Some(name) => {
                let def = self
                    .schema
                    .index(name)
                    .ok_or_else(|| StoreError::Other(format!("no index '{name}'")))?;
                Ok(Layout {
                    hash_key: &def.partition_key.name,
                    range_key: def.sort_key.as_ref().map(|k| k.name.as_str()),
                    projection: &def.projection,
                })
            }
        }
    }

    /// Attributes identifying a row's position in a query result.
    fn position_key(&self, row: &Item, layout: &Layout<'_>) -> Item {
        let names = self
            .schema
            .primary_key_attributes()
            .into_iter()
            .chain([layout.hash_key])
            .chain(layout.range_key);
        names
            .filter_map(|n| row.get(n).map(|v| (n.to_string(), v.clone())))
            .collect()
    }

    fn project(&self, row: &Item, layout: &Layout<'_>) -> Item {
        let keep = |name: &str| match layout.projection {
            Projection::All => true,
            Projection::KeysOnly => false,
            Projection::Include(attrs) => attrs.iter().any(|a| a == name),
        };
        let mut out: Item = row
            .iter()
            .filter(|(name, _)| keep(name))
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        out.extend(self.position_key(row, layout));
        out
    }

    /// Sort order of a query: range value, then primary key.
    fn compare(&self, a: &Item, b: &Item, range_key: Option<&str>) -> Ordering {
        let range = range_key.map_or(Ordering::Equal, |rk| {
            total_cmp(
                a.get(rk).unwrap_or(&Value::Null),
                b.get(rk).unwrap_or(&Value::Null),
            )
        });
        range.then_with(|| {
            let pk = |row: &Item| self.primary_key(row).unwrap_or_default();
            pk(a).cmp(&pk(b))
        })
    }

    fn page(
        &self,
        rows: Vec<Item>,
        layout: &Layout<'_>,
        filter: Option<&Expr>,
        limit: Option<usize>,
    ) -> Result<QueryOutput, StoreError> {
        let limit = limit.unwrap_or(usize::MAX);
        let more = rows.len() > limit;
        let evaluated: Vec<Item> = rows.into_iter().take(limit).collect();
        let last_evaluated_key = match (more, evaluated.last()) {
            (true, Some(last)) => Some(self.position_key(last, layout)),
            _ => None,
        };
        let mut items = Vec::with_capacity(evaluated.len());
        for row in &evaluated {
            let projected = self.project(row, layout);
            let keep = match filter {
                Some(expr) => expr
                    .eval(&projected)
                    .map_err(|e| StoreError::Other(e.to_string()))?,
                None => true,
            };
            if keep {
                items.push(projected);
            }
        }
        Ok(QueryOutput {
            items,
            last_evaluated_key,
        })
    }

    fn check(condition: Option<&Expr>, current: Option<&Item>) -> Result<(), StoreError> {
        let Some(condition) = condition else {
            return Ok(());
        };
        let empty = Item::new();
        let holds = condition
            .eval(current.unwrap_or(&empty))
            .map_err(|e| StoreError::Other(e.to_string()))?;
        if holds {
            Ok(())
        } else {
            Err(StoreError::ConditionalCheckFailed)
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn get(&self, key: &Item, _consistent_read: bool) -> Result<Option<Item>, StoreError> {
        self.begin()?;
        let k = self.primary_key(key)?;
        Ok(self.rows.read().get(&k).cloned())
    }

    async fn put(&self, item: &Item, condition: Option<&Expr>) -> Result<(), StoreError> {
        self.begin()?;
        let k = self.primary_key(item)?;
        let mut rows = self.rows.write();
        Self::check(condition, rows.get(&k))?;
        rows.insert(k, item.clone());
        Ok(())
    }

    async fn delete(&self, key: &Item, condition: Option<&Expr>) -> Result<(), StoreError> {
        self.begin()?;
        let k = self.primary_key(key)?;
        let mut rows = self.rows.write();
        Self::check(condition, rows.get(&k))?;
        rows.remove(&k);
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryOutput, StoreError> {
        self.begin()?;
        let layout = self.layout(request.index.as_deref())?;
        let mut rows: Vec<Item> = self
            .rows
            .read()
            .values()
            .filter(|row| {
                row.get(layout.hash_key)
                    .is_some_and(|v| values_equal(v, &request.hash_value))
            })
            .filter(|row| match layout.range_key {
                None => true,
                Some(rk) => row.get(rk).is_some_and(|v| {
                    request.range_condition.as_ref().is_none_or(|c| c.matches(v))
                }),
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| self.compare(a, b, layout.range_key));
        if !request.ascending {
            rows.reverse();
        }
        if let Some(start) = &request.start_key {
            let after = |row: &Item| {
                let ord = self.compare(row, start, layout.range_key);
                if request.ascending {
                    ord == Ordering::Greater
                } else {
                    ord == Ordering::Less
                }
            };
            rows.retain(after);
        }
        self.page(rows, &layout, request.filter.as_ref(), request.limit)
    }

    async fn scan(&self, request: &ScanRequest) -> Result<QueryOutput, StoreError> {
        self.begin()?;
        let layout = self.layout(None)?;
        let start = request
            .start_key
            .as_ref()
            .map(|k| self.primary_key(k))
            .transpose()?;
        let rows: Vec<Item> = self
            .rows
            .read()
            .iter()
            .filter(|(k, _)| start.as_ref().is_none_or(|s| k.as_str() > s.as_str()))
            .map(|(_, row)| row.clone())
            .collect();
        self.page(rows, &layout, request.filter.as_ref(), request.limit)
    }

    async fn batch_write(&self, items: &[Item]) -> Result<BatchWriteOutput, StoreError> {
        self.begin()?;
        let applied = {
            let mut faults = self.faults.lock();
            if faults.unprocessed_rounds > 0 {
                faults.unprocessed_rounds -= 1;
                items.len() / 2
            } else {
                items.len()
            }
        };
        let mut rows = self.rows.write();
        for item in &items[..applied] {
            rows.insert(self.primary_key(item)?, item.clone());
        }
        Ok(BatchWriteOutput {
            unprocessed: items[applied..].to_vec(),
        })
    }
}

/// Full payloads of minified resources, by link.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Item>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, link: impl Into<String>, payload: Item) {
        self.objects.write().insert(link.into(), payload);
    }

    pub fn remove(&self, link: &str) -> Option<Item> {
        self.objects.write().remove(link)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, link: &str) -> Result<Option<Item>, StoreError> {
        Ok(self.objects.read().get(link).cloned())
    }
}

/// A registry holding a fixed, growable set of models.
#[derive(Default)]
pub struct StaticRegistry {
    models: RwLock<HashMap<String, ResourceModel>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, model: ResourceModel) -> Self {
        self.insert(model);
        self
    }

    pub fn insert(&self, model: ResourceModel) {
        self.models.write().insert(model.id.clone(), model);
    }
}

impl ModelRegistry for StaticRegistry {
    fn get_model(&self, id: &str) -> Option<ResourceModel> {
        self.models.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::table_schema;
    use crate::store::SortCondition;
    use serde_json::json;

    fn row(h: &str, r: &str, extra: Value) -> Item {
        let mut item = json!({"_h": h, "_r": r}).as_object().unwrap().clone();
        item.extend(extra.as_object().unwrap().clone());
        item
    }

    fn query(hash: &str) -> QueryRequest {
        QueryRequest {
            index: None,
            hash_key: "_h".to_string(),
            hash_value: json!(hash),
            range_key: Some("_r".to_string()),
            range_condition: None,
            ascending: true,
            filter: None,
            start_key: None,
            limit: None,
            consistent_read: false,
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new(table_schema());
        for (r, n) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            store.put(&row("P", r, json!({"n": n})), None).await.unwrap();
        }
        store.put(&row("Q", "a", json!({"n": 9})), None).await.unwrap();
        store
    }

    fn range_values(out: &QueryOutput) -> Vec<&str> {
        out.items.iter().map(|i| i["_r"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_query_order_and_paging() {
        let store = seeded().await;
        let mut req = query("P");
        req.limit = Some(3);
        let page = store.query(&req).await.unwrap();
        assert_eq!(range_values(&page), vec!["a", "b", "c"]);
        let lek = page.last_evaluated_key.unwrap();
        assert_eq!(lek["_r"], json!("c"));

        req.start_key = Some(lek);
        let page = store.query(&req).await.unwrap();
        assert_eq!(range_values(&page), vec!["d"]);
        assert!(page.last_evaluated_key.is_none());

        let mut desc = query("P");
        desc.ascending = false;
        desc.range_condition = Some(SortCondition::Le(json!("c")));
        let page = store.query(&desc).await.unwrap();
        assert_eq!(range_values(&page), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_limit_applies_before_filter() {
        let store = seeded().await;
        let mut req = query("P");
        req.limit = Some(2);
        req.filter = Some(Expr::compare("n", crate::expr::Comparison::Gt, 1));
        let page = store.query(&req).await.unwrap();
        assert_eq!(range_values(&page), vec!["b"]);
        assert!(page.last_evaluated_key.is_some());
    }

    #[tokio::test]
    async fn test_index_projection_and_sparseness() {
        let store = MemoryStore::new(table_schema());
        store
            .put(&row("P", "a", json!({"_x0h": "S", "_x0r": 2, "n": 1})), None)
            .await
            .unwrap();
        store.put(&row("P", "b", json!({"n": 2})), None).await.unwrap();
        let req = QueryRequest {
            index: Some("idx0".to_string()),
            hash_key: "_x0h".to_string(),
            hash_value: json!("S"),
            range_key: Some("_x0r".to_string()),
            ..query("S")
        };
        let page = store.query(&req).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(
            page.items[0],
            json!({"_h": "P", "_r": "a", "_x0h": "S", "_x0r": 2}).as_object().unwrap().clone()
        );
    }

    #[tokio::test]
    async fn test_scan_pages_through_everything() {
        let store = seeded().await;
        let mut seen = Vec::new();
        let mut start = None;
        loop {
            let out = store
                .scan(&ScanRequest {
                    filter: None,
                    start_key: start,
                    limit: Some(2),
                    consistent_read: false,
                })
                .await
                .unwrap();
            seen.extend(out.items);
            start = out.last_evaluated_key;
            if start.is_none() {
                break;
            }
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let store = MemoryStore::new(table_schema());
        let first = row("P", "a", json!({"_time": 100}));
        let cond = Expr::any(vec![Expr::not_exists("_h"), Expr::lt("_time", 150)]).unwrap();
        store.put(&first, Some(&cond)).await.unwrap();

        let cond = Expr::any(vec![Expr::not_exists("_h"), Expr::lt("_time", 90)]).unwrap();
        let err = store.put(&row("P", "a", json!({"_time": 90})), Some(&cond)).await;
        assert_eq!(err, Err(StoreError::ConditionalCheckFailed));
        assert_eq!(store.rows()[0]["_time"], json!(100));

        let err = store.delete(&row("P", "z", json!({})), Some(&Expr::exists("_h"))).await;
        assert_eq!(err, Err(StoreError::ConditionalCheckFailed));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new(table_schema());
        store.fail_next(1, StoreError::Throttled("slow down".into()));
        assert!(store.get(&row("P", "a", json!({})), false).await.is_err());
        assert_eq!(store.get(&row("P", "a", json!({})), false).await, Ok(None));
        assert_eq!(store.calls(), 2);

        store.leave_unprocessed(1);
        let items: Vec<Item> = (0..5).map(|i| row("P", &i.to_string(), json!({}))).collect();
        let out = store.batch_write(&items).await.unwrap();
        assert_eq!(out.unprocessed.len(), 3);
        assert_eq!(store.len(), 2);
        let out = store.batch_write(&out.unprocessed).await.unwrap();
        assert!(out.unprocessed.is_empty());
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_registry() {
        let model: ResourceModel = serde_json::from_value(json!({
            "id": "Order",
            "properties": [],
            "primary_key": {"hash": "{_t}"}
        }))
        .unwrap();
        let registry = StaticRegistry::new().with(model);
        assert!(registry.get_model("Order").is_some());
        assert!(registry.get_model("Invoice").is_none());
    }
}
