use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffError, run_with_backoff};
use crate::config::TableOptions;
use crate::error::{Error, Result, StoreError};
use crate::expr::Expr;
use crate::filter::lookup;
use crate::keys::{CompiledModel, DerivedKeySet};
use crate::minify::{InflateOptions, maybe_inflate, minify};
use crate::pagination::{RowSource, paginate};
use crate::planner::{self, Operation, QueryPlan};
use crate::store::{ModelRegistry, ObjectStore, StorageAdapter};
use crate::types::{
    Item, LINK, PERMALINK, ResourceModel, TIME, TYPE, TableSchema, is_system_property,
};

use super::builders::{FindRequest, FindResult, GetOptions, TableBuilder};
use super::projection::{IDENTITY, apply_projection};

/// Longest `subclass_of` chain followed before giving up.
const MAX_TYPE_DEPTH: usize = 32;

struct TableInner {
    store: Arc<dyn StorageAdapter>,
    registry: Arc<dyn ModelRegistry>,
    objects: Option<Arc<dyn ObjectStore>>,
    options: TableOptions,
    schema: TableSchema,
    /// Compiled models by type. Grows only.
    models: RwLock<HashMap<String, Arc<CompiledModel>>>,
}

/// A handle on one physical table shared by any number of resource types.
///
/// `Table` is cheaply clonable (`Arc`-based) and `Send + Sync`.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

impl Table {
    pub fn builder(store: Arc<dyn StorageAdapter>, registry: Arc<dyn ModelRegistry>) -> TableBuilder {
        TableBuilder::new(store, registry)
    }

    pub(crate) fn new(
        store: Arc<dyn StorageAdapter>,
        registry: Arc<dyn ModelRegistry>,
        objects: Option<Arc<dyn ObjectStore>>,
        options: TableOptions,
    ) -> Self {
        let schema = store.schema().clone();
        Self {
            inner: Arc::new(TableInner {
                store,
                registry,
                objects,
                options,
                schema,
                models: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.inner.schema
    }

    pub fn options(&self) -> &TableOptions {
        &self.inner.options
    }

    // -----------------------------------------------------------------------
    // Models
    // -----------------------------------------------------------------------

    /// Register a model. Registering the same definition again is a no-op; a
    /// different definition for a known type is rejected.
    pub fn add_model(&self, model: ResourceModel) -> Result<Arc<CompiledModel>> {
        let compiled = Arc::new(CompiledModel::compile(model, &self.inner.schema)?);
        let mut models = self.inner.models.write();
        if let Some(existing) = models.get(compiled.id()) {
            if existing.model == compiled.model {
                return Ok(existing.clone());
            }
            return Err(Error::invalid(format!(
                "type '{}' is already registered with a different definition",
                compiled.id()
            )));
        }
        models.insert(compiled.id().to_string(), compiled.clone());
        info!(model = compiled.id(), table = %self.inner.schema.name, "registered model");
        Ok(compiled)
    }

    /// The compiled model for a type, loading it from the registry on first
    /// use.
    pub fn model(&self, type_id: &str) -> Result<Arc<CompiledModel>> {
        if let Some(model) = self.inner.models.read().get(type_id) {
            return Ok(model.clone());
        }
        let model = self
            .inner
            .registry
            .get_model(type_id)
            .ok_or_else(|| Error::invalid(format!("unknown type '{type_id}'")))?;
        self.add_model(model)
    }

    fn parent_of(&self, type_id: &str) -> Option<String> {
        if let Some(model) = self.inner.models.read().get(type_id) {
            return model.model.subclass_of.clone();
        }
        self.inner.registry.get_model(type_id)?.subclass_of
    }

    /// Whether `child` is `ancestor` or descends from it.
    pub fn is_subclass(&self, child: &str, ancestor: &str) -> bool {
        let mut current = child.to_string();
        for _ in 0..MAX_TYPE_DEPTH {
            if current == ancestor {
                return true;
            }
            match self.parent_of(&current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    fn model_of(&self, resource: &Item) -> Result<Arc<CompiledModel>> {
        let type_id = resource
            .get(TYPE)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid("resource has no _t"))?;
        self.model(type_id)
    }

    /// Every key a resource would be stored under.
    pub fn derive_keys(&self, resource: &Item) -> Result<DerivedKeySet> {
        let model = self.model_of(resource)?;
        model
            .derive_keys(resource)
            .ok_or_else(|| Error::invalid(format!("primary key of '{}' is not renderable", model.id())))
    }

    // -----------------------------------------------------------------------
    // Remote calls
    // -----------------------------------------------------------------------

    async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        run_with_backoff(&self.inner.options.backoff, StoreError::is_retryable, operation)
            .await
            .map_err(|e| match e {
                BackoffError::Aborted(e) => Error::Upstream(e),
                BackoffError::TimedOut {
                    attempts, elapsed, ..
                } => Error::TimedOut { attempts, elapsed },
            })
    }

    fn objects(&self) -> Option<&dyn ObjectStore> {
        self.inner.objects.as_deref()
    }

    /// Turn a stored row into the caller-facing resource: drop rendered key
    /// attributes, inflate if needed, apply `select`.
    async fn to_resource(
        &self,
        mut row: Item,
        model: &CompiledModel,
        select: Option<&[String]>,
        force: bool,
    ) -> Result<Item> {
        for attr in self.inner.schema.key_attributes() {
            if !model.is_property(attr) && !is_system_property(attr) {
                row.remove(attr);
            }
        }
        let resource = maybe_inflate(row, &InflateOptions { select, force }, self.objects()).await?;
        Ok(match select {
            Some(paths) => apply_projection(&resource, paths, &IDENTITY),
            None => resource,
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Plan a find without executing it.
    pub fn plan(&self, request: &FindRequest) -> Result<QueryPlan> {
        let model = self.model(&request.type_id)?;
        let forbid = request.forbid_scan.unwrap_or(self.inner.options.forbid_scan);
        planner::plan(&model, &request.filter, request.order_by.as_ref(), forbid)
    }

    /// Find resources of one type. Fails with `ScanForbidden` before any
    /// remote call when only a scan could answer and scans are forbidden.
    pub async fn find(&self, request: FindRequest) -> Result<FindResult> {
        let model = self.model(&request.type_id)?;
        let plan = self.plan(&request)?;
        let source = PlanSource {
            table: self,
            plan: &plan,
            consistent_read: request.consistent_read,
            memory_properties: plan.memory_properties().map(str::to_string).collect(),
        };
        let page = paginate(
            &plan,
            &self.inner.schema,
            &source,
            request.limit,
            request.cursor.clone(),
        )
        .await?;

        let mut items = Vec::with_capacity(page.items.len());
        for row in page.items {
            items.push(
                self.to_resource(row, &model, request.select.as_deref(), false)
                    .await?,
            );
        }
        debug!(model = model.id(), returned = items.len(), more = page.end_position.is_some(), "find");
        Ok(FindResult {
            items,
            start_position: page.start_position,
            end_position: page.end_position,
        })
    }

    /// Read one resource by the properties its primary key is rendered from.
    /// Absence is `Ok(None)`.
    pub async fn get(&self, type_id: &str, keys: &Item, options: &GetOptions) -> Result<Option<Item>> {
        let model = self.model(type_id)?;
        let key = primary_key(&model, type_id, keys)?;
        let row = self
            .call(|| self.inner.store.get(&key, options.consistent_read))
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        if row.get(TYPE).and_then(Value::as_str) != Some(type_id) {
            return Ok(None);
        }
        let resource = self
            .to_resource(row, &model, options.select.as_deref(), options.force_inflate)
            .await?;
        Ok(Some(resource))
    }

    /// The current record for a permalink. The model's primary key must be
    /// renderable from `_t` and `_permalink` alone.
    pub async fn latest(&self, type_id: &str, permalink: &str) -> Result<Option<Item>> {
        let mut keys = Item::new();
        keys.insert(PERMALINK.to_string(), Value::from(permalink));
        self.get(type_id, &keys, &GetOptions::default().consistent_read(true))
            .await
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Build the row to store for a resource.
    fn prepare(&self, resource: &Item) -> Result<(Arc<CompiledModel>, Item)> {
        let model = self.model_of(resource)?;
        if let Some(missing) = model
            .model
            .required()
            .find(|p| lookup(resource, p).is_none_or(Value::is_null))
        {
            return Err(Error::invalid(format!(
                "'{}' is missing required property '{missing}'",
                model.id()
            )));
        }
        let keys = model.derive_keys(resource).ok_or_else(|| {
            Error::invalid(format!("primary key of '{}' is not renderable", model.id()))
        })?;

        let minified = minify(&model, resource, self.inner.options.max_item_size);
        if minified.is_cut() && !resource.get(LINK).is_some_and(Value::is_string) {
            return Err(Error::invalid(format!(
                "'{}' exceeds the item size limit and has no _link to inflate from",
                model.id()
            )));
        }
        if minified.is_cut() {
            debug!(model = model.id(), cut = ?minified.diff.keys().collect::<Vec<_>>(), "minified");
        }
        let mut row = minified.min;
        row.extend(keys.attributes());
        Ok((model, row))
    }

    /// Write a resource. Versioned resources (carrying `_permalink` and
    /// `_time`) only replace an older record or the same revision; losing that
    /// race fails with `ConditionalWriteFailed`.
    pub async fn put(&self, resource: Item) -> Result<Item> {
        let (model, row) = self.prepare(&resource)?;
        let condition = last_writer_wins(&resource, &self.inner.schema.partition_key.name);
        match self
            .call(|| self.inner.store.put(&row, condition.as_ref()))
            .await
        {
            Ok(()) => Ok(resource),
            Err(Error::Upstream(StoreError::ConditionalCheckFailed)) => {
                Err(Error::ConditionalWriteFailed(format!(
                    "a newer revision of this '{}' is already stored",
                    model.id()
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Merge `changes` over the stored resource and write the result.
    pub async fn update(&self, changes: Item) -> Result<Item> {
        let model = self.model_of(&changes)?;
        let type_id = model.id().to_string();
        let current = self
            .get(&type_id, &changes, &GetOptions::default().consistent_read(true).force_inflate(true))
            .await?
            .ok_or_else(|| Error::NotFound(format!("{type_id} to update")))?;
        let mut merged = current;
        merged.extend(changes);
        self.put(merged).await
    }

    /// Delete a resource by the properties its primary key is rendered from.
    pub async fn del(&self, type_id: &str, keys: &Item) -> Result<()> {
        let model = self.model(type_id)?;
        let key = primary_key(&model, type_id, keys)?;
        let condition = Expr::exists(self.inner.schema.partition_key.name.clone());
        match self
            .call(|| self.inner.store.delete(&key, Some(&condition)))
            .await
        {
            Err(Error::Upstream(StoreError::ConditionalCheckFailed)) => {
                Err(Error::NotFound(format!("{type_id} to delete")))
            }
            other => other,
        }
    }

    /// Write many resources without conditions. Rows the store leaves
    /// unprocessed are retried on their own; rows already written stay
    /// written.
    pub async fn batch_put(&self, resources: &[Item]) -> Result<()> {
        let rows = resources
            .iter()
            .map(|r| self.prepare(r).map(|(_, row)| row))
            .collect::<Result<Vec<_>>>()?;
        let chunks: Vec<&[Item]> = rows.chunks(self.inner.options.batch_size.max(1)).collect();

        for (i, chunk) in chunks.iter().enumerate() {
            let pending = Mutex::new(chunk.to_vec());
            let attempts = AtomicU32::new(0);
            let result = {
                let pending = &pending;
                let attempts = &attempts;
                let store = &self.inner.store;
                run_with_backoff(
                    &self.inner.options.backoff,
                    BatchAttemptError::is_retryable,
                    move || async move {
                        attempts.fetch_add(1, Ordering::Relaxed);
                        let attempt = pending.lock().clone();
                        let out = match store.batch_write(&attempt).await {
                            Ok(out) => out,
                            Err(e) => return Err(BatchAttemptError::Store(e)),
                        };
                        if out.unprocessed.is_empty() {
                            return Ok(());
                        }
                        let left = out.unprocessed.len();
                        *pending.lock() = out.unprocessed;
                        Err(BatchAttemptError::Unprocessed(left))
                    },
                )
                .await
            };

            match result {
                Ok(()) => {}
                Err(BackoffError::Aborted(BatchAttemptError::Store(e))) => {
                    return Err(Error::Upstream(e));
                }
                Err(BackoffError::TimedOut {
                    attempts,
                    elapsed,
                    last: None | Some(BatchAttemptError::Store(_)),
                }) => return Err(Error::TimedOut { attempts, elapsed }),
                Err(_) => {
                    let mut unprocessed = pending.into_inner();
                    for later in &chunks[i + 1..] {
                        unprocessed.extend_from_slice(later);
                    }
                    warn!(unprocessed = unprocessed.len(), "batch write gave up");
                    return Err(Error::PartialBatchFailure {
                        unprocessed,
                        attempts: attempts.into_inner(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Primary key attributes for a resource identified by `keys`.
fn primary_key(model: &CompiledModel, type_id: &str, keys: &Item) -> Result<Item> {
    let mut props = keys.clone();
    props.insert(TYPE.to_string(), Value::from(type_id));
    model
        .derive_keys(&props)
        .map(|k| k.primary.to_item())
        .ok_or_else(|| {
            Error::invalid(format!(
                "keys do not render the primary key of '{type_id}'"
            ))
        })
}

/// Write condition settling races between revisions of one permalink: the
/// slot is empty, holds an older revision, or holds this very revision.
fn last_writer_wins(resource: &Item, hash_key: &str) -> Option<Expr> {
    resource.get(PERMALINK)?;
    let time = resource.get(TIME)?.clone();
    let mut alternatives = vec![Expr::not_exists(hash_key), Expr::lt(TIME, time)];
    if let Some(link) = resource.get(LINK) {
        alternatives.push(Expr::eq(LINK, link.clone()));
    }
    Expr::any(alternatives)
}

#[derive(Debug)]
enum BatchAttemptError {
    Store(StoreError),
    Unprocessed(usize),
}

impl BatchAttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            BatchAttemptError::Store(e) => e.is_retryable(),
            BatchAttemptError::Unprocessed(_) => true,
        }
    }
}

impl fmt::Display for BatchAttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchAttemptError::Store(e) => write!(f, "{e}"),
            BatchAttemptError::Unprocessed(n) => write!(f, "{n} rows unprocessed"),
        }
    }
}

/// Rows for one find: runs the planned operation, completes index rows,
/// inflates and applies the in-memory filter.
struct PlanSource<'a> {
    table: &'a Table,
    plan: &'a QueryPlan,
    consistent_read: bool,
    memory_properties: Vec<String>,
}

#[async_trait]
impl RowSource for PlanSource<'_> {
    async fn fetch(
        &self,
        start_key: Option<Item>,
        limit: Option<usize>,
    ) -> Result<(Vec<Item>, Option<Item>)> {
        let store = &self.table.inner.store;
        let out = match self.plan.operation {
            Operation::Query => {
                let request = self
                    .plan
                    .query_request(start_key, limit, self.consistent_read)
                    .ok_or_else(|| Error::invalid("query plan without a key"))?;
                self.table.call(|| store.query(&request)).await?
            }
            Operation::Scan => {
                let request = self.plan.scan_request(start_key, limit, self.consistent_read);
                self.table.call(|| store.scan(&request)).await?
            }
        };
        Ok((out.items, out.last_evaluated_key))
    }

    async fn admit(&self, row: Item) -> Result<Option<Item>> {
        let mut row = row;
        if self.plan.needs_fetch {
            let key: Item = self
                .table
                .schema()
                .primary_key_attributes()
                .into_iter()
                .filter_map(|n| row.get(n).map(|v| (n.to_string(), v.clone())))
                .collect();
            let store = &self.table.inner.store;
            match self
                .table
                .call(|| store.get(&key, self.consistent_read))
                .await?
            {
                Some(full) => row = full,
                None => return Ok(None),
            }
        }
        if self.plan.memory_filter.is_empty() {
            return Ok(Some(row));
        }

        let options = InflateOptions {
            select: Some(&self.memory_properties),
            force: false,
        };
        let row = maybe_inflate(row, &options, self.table.objects()).await?;
        let is_subclass = |child: &str, ancestor: &str| self.table.is_subclass(child, ancestor);
        let keep = self
            .plan
            .memory_filter
            .iter()
            .all(|c| c.matches(&row, &is_subclass));
        Ok(keep.then_some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::{order_model, table_schema};
    use crate::memory::{MemoryStore, StaticRegistry};
    use serde_json::json;

    fn table() -> (Table, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(table_schema()));
        let registry = Arc::new(StaticRegistry::new().with(order_model()));
        (Table::builder(store.clone(), registry).build(), store)
    }

    fn item(v: Value) -> Item {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_models_load_lazily_and_are_immutable() {
        let (table, _) = table();
        let first = table.model("Order").unwrap();
        assert!(Arc::ptr_eq(&first, &table.model("Order").unwrap()));
        assert!(table.add_model(order_model()).is_ok());

        let mut changed = order_model();
        changed.primary_key.range = Some("o:{orderId}".to_string());
        assert!(matches!(table.add_model(changed), Err(Error::InvalidInput(_))));
        assert!(matches!(table.model("Invoice"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_subclass_chain() {
        let (table, _) = table();
        let mut form = order_model();
        form.id = "Form".to_string();
        let mut order = order_model();
        order.id = "Order2".to_string();
        order.subclass_of = Some("Form".to_string());
        table.add_model(form).unwrap();
        table.add_model(order).unwrap();
        assert!(table.is_subclass("Order2", "Form"));
        assert!(table.is_subclass("Form", "Form"));
        assert!(!table.is_subclass("Form", "Order2"));
    }

    #[tokio::test]
    async fn test_put_stores_rendered_keys_and_get_strips_them() {
        let (table, store) = table();
        let order = item(json!({"_t": "Order", "buyerId": 42, "orderId": "B", "sellerId": "s1", "_time": 5}));
        table.put(order.clone()).await.unwrap();

        let row = &store.rows()[0];
        assert_eq!(row["_h"], json!("Order#42"));
        assert_eq!(row["_x0h"], json!("Order#s1"));

        let keys = item(json!({"buyerId": 42, "orderId": "B"}));
        let got = table.get("Order", &keys, &GetOptions::default()).await.unwrap();
        assert_eq!(got, Some(order));
    }

    #[tokio::test]
    async fn test_put_validates_input() {
        let (table, _) = table();
        let missing = item(json!({"_t": "Order", "orderId": "B"}));
        assert!(matches!(table.put(missing).await, Err(Error::InvalidInput(_))));
        let untyped = item(json!({"buyerId": 1, "orderId": "B"}));
        assert!(matches!(table.put(untyped).await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_oversized_resource_needs_link() {
        let store = Arc::new(MemoryStore::new(table_schema()));
        let registry = Arc::new(StaticRegistry::new().with(order_model()));
        let table = Table::builder(store, registry)
            .options(TableOptions::default().max_item_size(Some(200)))
            .build();
        let big = item(json!({"_t": "Order", "buyerId": 1, "orderId": "A", "bio": "b".repeat(500)}));
        assert!(matches!(table.put(big.clone()).await, Err(Error::InvalidInput(_))));
        let mut linked = big;
        linked.insert("_link".to_string(), json!("L1"));
        assert!(table.put(linked).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (table, store) = table();
        let keys = item(json!({"_t": "Order", "buyerId": 42, "orderId": "B"}));
        assert!(matches!(table.update(keys.clone()).await, Err(Error::NotFound(_))));

        let mut order = keys.clone();
        order.insert("notes".to_string(), json!("first"));
        table.put(order).await.unwrap();
        let mut change = keys.clone();
        change.insert("total".to_string(), json!(10));
        let updated = table.update(change).await.unwrap();
        assert_eq!(updated["notes"], json!("first"));
        assert_eq!(updated["total"], json!(10));

        table.del("Order", &keys).await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(table.del("Order", &keys).await, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_last_writer_wins_condition() {
        let versioned = item(json!({"_permalink": "P1", "_time": 100, "_link": "L1"}));
        let cond = last_writer_wins(&versioned, "_h").unwrap();
        assert!(cond.eval(&Item::new()).unwrap());
        assert!(cond.eval(&item(json!({"_h": "x", "_time": 50, "_link": "L0"}))).unwrap());
        assert!(cond.eval(&item(json!({"_h": "x", "_time": 100, "_link": "L1"}))).unwrap());
        assert!(!cond.eval(&item(json!({"_h": "x", "_time": 100, "_link": "L2"}))).unwrap());
        assert!(last_writer_wins(&item(json!({"_time": 1})), "_h").is_none());
    }
}
