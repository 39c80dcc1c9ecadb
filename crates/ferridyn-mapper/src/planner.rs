//! Query planning: pick query or scan, pick the key, split the filter.
//!
//! The store can only select a partition by equality on a hash key and
//! narrow it by one condition on the sort key. Everything else is either a
//! store-side post-filter (evaluated on rows the store already read) or an
//! in-memory filter applied here after the rows arrive.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::filter::{Condition, Filter, Operator};
use crate::keys::{CompiledKey, CompiledModel};
use crate::store::{QueryRequest, ScanRequest, SortCondition};
use crate::types::{CUT, Item, KeyType, Projection, is_system_property};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Query,
    Scan,
}

/// Requested result order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub property: String,
    #[serde(default)]
    pub desc: bool,
}

impl OrderBy {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            desc: false,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            desc: true,
        }
    }
}

/// The key a query runs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyChoice {
    /// `None` for the table's primary key.
    pub index: Option<String>,
    pub hash_key: String,
    pub hash_value: Value,
    pub range_key: Option<String>,
    pub range_type: Option<KeyType>,
    /// Model property the range key orders by, for bare range templates.
    pub range_property: Option<String>,
    pub projection: Projection,
}

/// How a find request is executed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub operation: Operation,
    /// `None` for scans.
    pub key: Option<KeyChoice>,
    pub key_condition: Option<SortCondition>,
    /// Evaluated by the store on the rows it reads.
    pub store_filter: Option<Expr>,
    /// Evaluated here, on full (fetched and inflated) resources.
    pub memory_filter: Vec<Condition>,
    /// Rows arrive in the requested order and native cursors apply.
    pub store_ordered: bool,
    pub order_by: Option<OrderBy>,
    /// Index rows lack attributes; full rows come from the base table.
    pub needs_fetch: bool,
}

impl QueryPlan {
    pub fn ascending(&self) -> bool {
        self.order_by.as_ref().is_none_or(|o| !o.desc)
    }

    /// Whether any rows the store returns may be dropped before the page is
    /// filled.
    pub fn is_filtered(&self) -> bool {
        self.store_filter.is_some() || !self.memory_filter.is_empty()
    }

    /// Properties the in-memory filter reads.
    pub fn memory_properties(&self) -> impl Iterator<Item = &str> {
        self.memory_filter.iter().map(|c| c.property.as_str())
    }

    pub fn query_request(
        &self,
        start_key: Option<Item>,
        limit: Option<usize>,
        consistent_read: bool,
    ) -> Option<QueryRequest> {
        let key = self.key.as_ref()?;
        Some(QueryRequest {
            index: key.index.clone(),
            hash_key: key.hash_key.clone(),
            hash_value: key.hash_value.clone(),
            range_key: key.range_key.clone(),
            range_condition: self.key_condition.clone(),
            // In-memory ordering does not care which way the store reads.
            ascending: !self.store_ordered || self.ascending(),
            filter: self.store_filter.clone(),
            start_key,
            limit,
            consistent_read,
        })
    }

    pub fn scan_request(
        &self,
        start_key: Option<Item>,
        limit: Option<usize>,
        consistent_read: bool,
    ) -> ScanRequest {
        ScanRequest {
            filter: self.store_filter.clone(),
            start_key,
            limit,
            consistent_read,
        }
    }
}

/// Plan a find for `model`. The filter is bound to the model's type first.
///
/// Fails with `InvalidInput` for filters or orderings over unknown
/// properties, and with `ScanForbidden` when only a scan could answer and
/// `forbid_scan` is set.
pub fn plan(
    model: &CompiledModel,
    filter: &Filter,
    order_by: Option<&OrderBy>,
    forbid_scan: bool,
) -> Result<QueryPlan> {
    let filter = filter.for_type(model.id());
    filter.validate(&model.model)?;
    if let Some(order) = order_by
        && !model.model.is_declared(&order.property)
    {
        return Err(Error::invalid(format!(
            "cannot order by unknown property '{}' of '{}'",
            order.property,
            model.id()
        )));
    }

    let equalities = filter.equalities();
    let usable: Vec<(&CompiledKey, Value)> = model
        .keys()
        .iter()
        .filter(|k| k.hash.properties().all(|p| equalities.contains_key(p)))
        .filter_map(|k| Some((k, k.render_hash(|p| equalities.get(p))?)))
        .collect();

    let chosen = usable
        .iter()
        .find(|(k, _)| k.is_primary())
        .or_else(|| usable.iter().find(|(k, _)| k.projection == Projection::All))
        .or_else(|| usable.first());

    let Some((key, hash_value)) = chosen else {
        if forbid_scan {
            return Err(Error::ScanForbidden(format!(
                "no equality on a hash key of '{}'",
                model.id()
            )));
        }
        let plan = split(model, &filter, None, order_by);
        debug!(model = model.id(), operation = "scan", "planned find");
        return Ok(plan);
    };

    let choice = KeyChoice {
        index: key.index.clone(),
        hash_key: key.hash_key.name.clone(),
        hash_value: hash_value.clone(),
        range_key: key.range_key.as_ref().map(|d| d.name.clone()),
        range_type: key.range_key.as_ref().map(|d| d.key_type),
        range_property: key.range_property().map(str::to_string),
        projection: key.projection.clone(),
    };
    let plan = split(model, &filter, Some((key, choice)), order_by);
    debug!(
        model = model.id(),
        operation = "query",
        index = plan.key.as_ref().and_then(|k| k.index.as_deref()).unwrap_or("primary"),
        store_ordered = plan.store_ordered,
        "planned find"
    );
    Ok(plan)
}

fn split(
    model: &CompiledModel,
    filter: &Filter,
    key: Option<(&CompiledKey, KeyChoice)>,
    order_by: Option<&OrderBy>,
) -> QueryPlan {
    let (compiled, choice) = key.unzip();
    let range_property = choice.as_ref().and_then(|c| c.range_property.clone());
    let projection = choice
        .as_ref()
        .map_or(Projection::All, |c| c.projection.clone());

    let store_ordered = choice.is_some()
        && order_by.is_none_or(|o| range_property.as_deref() == Some(o.property.as_str()));

    let mut key_condition = None;
    let mut store = Vec::new();
    let mut memory = Vec::new();
    for c in filter.conditions() {
        if c.op == Operator::Eq && compiled.is_some_and(|k| k.hash.references(&c.property)) {
            continue;
        }
        if key_condition.is_none()
            && range_property.as_deref() == Some(c.property.as_str())
            && let Some(key) = compiled
            && let Some(condition) = sort_condition(&c, |v| key.render_range(&c.property, v))
        {
            key_condition = Some(condition);
            continue;
        }
        if c.op == Operator::SubclassOf {
            memory.push(c);
            continue;
        }
        if !projection.carries(&c.property) {
            memory.push(c);
            continue;
        }
        let Some(expr) = Expr::from_condition(&c) else {
            memory.push(c);
            continue;
        };
        let top = c.property.split('.').next().unwrap_or(&c.property);
        if is_system_property(top) || model.model.is_required(top) {
            store.push(expr);
        } else if !projection.carries(CUT) {
            memory.push(c);
        } else {
            // The row may have been minified; let it through and re-check
            // after inflation.
            store.push(Expr::Or(vec![
                expr,
                Expr::Contains {
                    path: CUT.to_string(),
                    value: Value::from(top),
                },
            ]));
            memory.push(c);
        }
    }

    QueryPlan {
        operation: if choice.is_some() {
            Operation::Query
        } else {
            Operation::Scan
        },
        needs_fetch: projection != Projection::All,
        key: choice,
        key_condition,
        store_filter: Expr::all(store),
        memory_filter: memory,
        store_ordered,
        order_by: order_by.cloned(),
    }
}

/// Operands are rendered the way the range attribute is stored; a condition
/// whose operand does not render stays a filter.
fn sort_condition(
    c: &Condition,
    render: impl Fn(&Value) -> Option<Value>,
) -> Option<SortCondition> {
    if !c.op.is_key_condition_eligible() {
        return None;
    }
    Some(match c.op {
        Operator::Eq => SortCondition::Eq(render(&c.value)?),
        Operator::Lt => SortCondition::Lt(render(&c.value)?),
        Operator::Lte => SortCondition::Le(render(&c.value)?),
        Operator::Gt => SortCondition::Gt(render(&c.value)?),
        Operator::Gte => SortCondition::Ge(render(&c.value)?),
        Operator::Between => match c.value.as_array()?.as_slice() {
            [low, high] => SortCondition::Between(render(low)?, render(high)?),
            _ => return None,
        },
        Operator::StartsWith => match render(&c.value)? {
            Value::String(prefix) => SortCondition::BeginsWith(prefix),
            _ => return None,
        },
        _ => return None,
    })
}
