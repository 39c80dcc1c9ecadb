//! # ferridyn-mapper
//!
//! A client-side data mapper that stores many resource types in one
//! DynamoDB-style hash/range table.
//!
//! Each [`ResourceModel`](types::ResourceModel) declares how its properties
//! render into the table's partition and sort keys and into the keys of the
//! table's secondary indexes. Finds are planned against those templates: the
//! planner picks the table key or an index, splits the filter into a key
//! condition, a store-side filter and an in-memory residue, and the
//! paginator keeps returning full pages with resumable cursors. Resources too
//! large for one row are minified on write and inflated from an object store
//! on read. Every remote call is retried with exponential backoff.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ferridyn_mapper::api::{FindRequest, Table};
//! use ferridyn_mapper::memory::{MemoryStore, StaticRegistry};
//! use ferridyn_mapper::planner::OrderBy;
//! use ferridyn_mapper::types::{
//!     KeyDefinition, PrimaryKeyTemplate, PropertyDef, PropertyType, ResourceModel, TableSchema,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> ferridyn_mapper::error::Result<()> {
//! let schema = TableSchema {
//!     name: "objects".to_string(),
//!     partition_key: KeyDefinition::string("_h"),
//!     sort_key: Some(KeyDefinition::string("_r")),
//!     indexes: vec![],
//! };
//! let order = ResourceModel {
//!     id: "Order".to_string(),
//!     properties: vec![
//!         PropertyDef { name: "buyerId".to_string(), property_type: PropertyType::Number, required: true },
//!         PropertyDef { name: "orderId".to_string(), property_type: PropertyType::String, required: true },
//!     ],
//!     primary_key: PrimaryKeyTemplate {
//!         hash: "{_t}#{buyerId}".to_string(),
//!         range: Some("{orderId}".to_string()),
//!     },
//!     indexes: vec![],
//!     subclass_of: None,
//! };
//!
//! let store = Arc::new(MemoryStore::new(schema));
//! let registry = Arc::new(StaticRegistry::new().with(order));
//! let table = Table::builder(store, registry).forbid_scan(true).build();
//!
//! table
//!     .put(json!({"_t": "Order", "buyerId": 42, "orderId": "A"}).as_object().cloned().unwrap_or_default())
//!     .await?;
//!
//! let page = table
//!     .find(FindRequest::new("Order").eq("buyerId", 42).order_by(OrderBy::asc("orderId")).limit(10))
//!     .await?;
//! assert_eq!(page.items.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod expr;
pub mod filter;
pub mod keys;
pub mod memory;
pub mod minify;
pub mod pagination;
pub mod planner;
pub mod store;
pub mod template;
pub mod types;

pub use api::{FindRequest, FindResult, GetOptions, Table, TableBuilder};
pub use config::TableOptions;
pub use error::{Error, Result, StoreError};
pub use filter::{Filter, Operator};
pub use types::{Item, ResourceModel, TableSchema};
