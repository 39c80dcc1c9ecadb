//! Pages and cursors over planned results.
//!
//! Store-ordered plans page natively: the cursor is the last row's key and
//! becomes the store's exclusive start key. Everything else is fetched in
//! full, filtered and sorted here, and resumed by finding the cursor's row in
//! the sorted set.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::filter::{lookup, total_cmp};
use crate::planner::QueryPlan;
use crate::types::{Item, TableSchema};

/// Opaque resume position: key attributes of a row, plus the order property
/// for in-memory ordering.
pub type Cursor = Item;

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    /// Cursor of the first row, or the resume cursor for an empty page.
    pub start_position: Option<Cursor>,
    /// Cursor of the last row; `None` once nothing remains.
    pub end_position: Option<Cursor>,
}

/// Where the rows of a plan come from.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Run the planned operation once. Returns the rows and the store's
    /// last evaluated key.
    async fn fetch(
        &self,
        start_key: Option<Item>,
        limit: Option<usize>,
    ) -> Result<(Vec<Item>, Option<Item>)>;

    /// Complete a raw row (fetch, inflate) and apply the in-memory filter.
    /// `None` drops the row.
    async fn admit(&self, row: Item) -> Result<Option<Item>>;
}

/// The cursor identifying `row` under `plan`.
pub fn cursor_for(row: &Item, plan: &QueryPlan, schema: &TableSchema) -> Cursor {
    let mut names: Vec<&str> = schema.primary_key_attributes();
    if let Some(key) = &plan.key {
        names.push(&key.hash_key);
        names.extend(key.range_key.as_deref());
    }
    let mut cursor: Cursor = names
        .into_iter()
        .filter_map(|n| row.get(n).map(|v| (n.to_string(), v.clone())))
        .collect();
    if !plan.store_ordered
        && let Some(order) = &plan.order_by
    {
        let value = lookup(row, &order.property).cloned().unwrap_or(Value::Null);
        cursor.insert(order.property.clone(), value);
    }
    cursor
}

/// Produce one page. `limit: None` returns everything after the cursor.
pub async fn paginate(
    plan: &QueryPlan,
    schema: &TableSchema,
    source: &dyn RowSource,
    limit: Option<usize>,
    cursor: Option<Cursor>,
) -> Result<Page> {
    if limit == Some(0) {
        return Err(Error::invalid("limit must be at least 1"));
    }
    if plan.store_ordered {
        collect_ordered(plan, schema, source, limit, cursor).await
    } else {
        collect_sorted(plan, schema, source, limit, cursor).await
    }
}

async fn collect_ordered(
    plan: &QueryPlan,
    schema: &TableSchema,
    source: &dyn RowSource,
    limit: Option<usize>,
    cursor: Option<Cursor>,
) -> Result<Page> {
    // One row past the limit proves more remain.
    let target = limit.map(|l| l + 1);
    let batch = match limit {
        Some(l) if plan.is_filtered() => Some((2 * l).max(10)),
        _ => target,
    };

    let mut rows = Vec::new();
    let mut start = cursor.clone();
    let mut rounds = 0u32;
    'fetch: loop {
        rounds += 1;
        let (batch_rows, last) = source.fetch(start.take(), batch).await?;
        debug!(round = rounds, fetched = batch_rows.len(), "fetched store-ordered batch");
        for row in batch_rows {
            if let Some(row) = source.admit(row).await? {
                rows.push(row);
                if target == Some(rows.len()) {
                    break 'fetch;
                }
            }
        }
        match last {
            Some(key) => start = Some(key),
            None => break,
        }
    }

    Ok(window(rows, 0, limit, plan, schema, cursor))
}

async fn collect_sorted(
    plan: &QueryPlan,
    schema: &TableSchema,
    source: &dyn RowSource,
    limit: Option<usize>,
    cursor: Option<Cursor>,
) -> Result<Page> {
    let mut rows = Vec::new();
    let mut start = None;
    let mut rounds = 0u32;
    loop {
        rounds += 1;
        let (batch_rows, last) = source.fetch(start.take(), None).await?;
        for row in batch_rows {
            if let Some(row) = source.admit(row).await? {
                rows.push(row);
            }
        }
        match last {
            Some(key) => start = Some(key),
            None => break,
        }
    }
    debug!(rounds, rows = rows.len(), "sorting in memory");

    rows.sort_by(|a, b| compare_rows(a, b, plan, schema));
    let offset = match &cursor {
        None => 0,
        Some(c) => rows
            .iter()
            .position(|r| cursor_for(r, plan, schema) == *c)
            .map(|i| i + 1)
            .unwrap_or_else(|| {
                rows.iter()
                    .position(|r| compare_rows(r, c, plan, schema) == Ordering::Greater)
                    .unwrap_or(rows.len())
            }),
    };
    Ok(window(rows, offset, limit, plan, schema, cursor))
}

fn window(
    rows: Vec<Item>,
    offset: usize,
    limit: Option<usize>,
    plan: &QueryPlan,
    schema: &TableSchema,
    cursor: Option<Cursor>,
) -> Page {
    let end = limit.map_or(rows.len(), |l| rows.len().min(offset.saturating_add(l)));
    let more = end < rows.len();
    let items: Vec<Item> = rows.into_iter().take(end).skip(offset).collect();
    let start_position = items
        .first()
        .map(|r| cursor_for(r, plan, schema))
        .or(cursor);
    let end_position = match (more, items.last()) {
        (true, Some(last)) => Some(cursor_for(last, plan, schema)),
        _ => None,
    };
    Page {
        items,
        start_position,
        end_position,
    }
}

/// In-memory result order: the order property, then the primary key. A
/// descending order reverses both.
fn compare_rows(a: &Item, b: &Item, plan: &QueryPlan, schema: &TableSchema) -> Ordering {
    let get = |row: &Item, path: &str| lookup(row, path).cloned().unwrap_or(Value::Null);
    let mut ord = Ordering::Equal;
    if let Some(order) = &plan.order_by {
        ord = total_cmp(&get(a, &order.property), &get(b, &order.property));
    }
    for attr in schema.primary_key_attributes() {
        ord = ord.then_with(|| total_cmp(&get(a, attr), &get(b, attr)));
    }
    if plan.ascending() { ord } else { ord.reverse() }
}
