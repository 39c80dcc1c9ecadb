use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::TableOptions;
use crate::filter::{Filter, Operator};
use crate::pagination::Cursor;
use crate::planner::OrderBy;
use crate::store::{ModelRegistry, ObjectStore, StorageAdapter};
use crate::types::Item;

use super::table::Table;

// ---------------------------------------------------------------------------
// TableBuilder
// ---------------------------------------------------------------------------

/// Builder for a [`Table`] handle.
pub struct TableBuilder {
    store: Arc<dyn StorageAdapter>,
    registry: Arc<dyn ModelRegistry>,
    objects: Option<Arc<dyn ObjectStore>>,
    options: TableOptions,
}

impl TableBuilder {
    pub(crate) fn new(store: Arc<dyn StorageAdapter>, registry: Arc<dyn ModelRegistry>) -> Self {
        Self {
            store,
            registry,
            objects: None,
            options: TableOptions::default(),
        }
    }

    /// Where full payloads of minified resources are read from.
    pub fn object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn options(mut self, options: TableOptions) -> Self {
        self.options = options;
        self
    }

    pub fn forbid_scan(mut self, forbid: bool) -> Self {
        self.options.forbid_scan = forbid;
        self
    }

    pub fn build(self) -> Table {
        Table::new(self.store, self.registry, self.objects, self.options)
    }
}

// ---------------------------------------------------------------------------
// FindRequest
// ---------------------------------------------------------------------------

/// A structured find: type, filter, order, page size and resume position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FindRequest {
    #[serde(rename = "type")]
    pub type_id: String,
    pub filter: Filter,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    /// The `end_position` of the previous page.
    pub cursor: Option<Cursor>,
    pub select: Option<Vec<String>>,
    /// Overrides [`TableOptions::forbid_scan`] for this request.
    pub forbid_scan: Option<bool>,
    pub consistent_read: bool,
}

impl FindRequest {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Add an `EQ` constraint.
    pub fn eq(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = self.filter.eq(property, value);
        self
    }

    /// Add a constraint with any operator.
    pub fn condition(
        mut self,
        op: Operator,
        property: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.filter = self.filter.with(op, property, value);
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cursor(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn select<S: Into<String>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
        self.select = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn forbid_scan(mut self, forbid: bool) -> Self {
        self.forbid_scan = Some(forbid);
        self
    }

    pub fn consistent_read(mut self, consistent: bool) -> Self {
        self.consistent_read = consistent;
        self
    }
}

/// Result of [`Table::find`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindResult {
    pub items: Vec<Item>,
    pub start_position: Option<Cursor>,
    /// `None` once nothing remains.
    pub end_position: Option<Cursor>,
}

// ---------------------------------------------------------------------------
// GetOptions
// ---------------------------------------------------------------------------

/// Options for point reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetOptions {
    pub select: Option<Vec<String>>,
    pub consistent_read: bool,
    /// Restore minified properties even when `select` does not ask for them.
    pub force_inflate: bool,
}

impl GetOptions {
    pub fn select<S: Into<String>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
        self.select = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn consistent_read(mut self, consistent: bool) -> Self {
        self.consistent_read = consistent;
        self
    }

    pub fn force_inflate(mut self, force: bool) -> Self {
        self.force_inflate = force;
        self
    }
}
