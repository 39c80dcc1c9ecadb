//! Interfaces to the external collaborators: the storage adapter executing
//! raw operations, the object store holding full payloads of minified
//! resources, and the registry resolving type names to models.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::expr::Expr;
use crate::filter::compare_values;
use crate::types::{Item, ResourceModel, TableSchema};

/// Condition on the sort key of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SortCondition {
    Eq(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    Between(Value, Value),
    BeginsWith(String),
}

impl SortCondition {
    pub fn matches(&self, value: &Value) -> bool {
        let cmp = |other: &Value| compare_values(value, other);
        match self {
            SortCondition::Eq(v) => cmp(v) == Some(Ordering::Equal),
            SortCondition::Lt(v) => cmp(v) == Some(Ordering::Less),
            SortCondition::Le(v) => matches!(cmp(v), Some(Ordering::Less | Ordering::Equal)),
            SortCondition::Gt(v) => cmp(v) == Some(Ordering::Greater),
            SortCondition::Ge(v) => matches!(cmp(v), Some(Ordering::Greater | Ordering::Equal)),
            SortCondition::Between(low, high) => {
                matches!(cmp(low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(cmp(high), Some(Ordering::Less | Ordering::Equal))
            }
            SortCondition::BeginsWith(prefix) => value
                .as_str()
                .is_some_and(|s| s.starts_with(prefix.as_str())),
        }
    }
}

/// A native query: equality on a partition key, optional sort key condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Secondary index to query; `None` for the table itself.
    pub index: Option<String>,
    pub hash_key: String,
    pub hash_value: Value,
    pub range_key: Option<String>,
    pub range_condition: Option<SortCondition>,
    pub ascending: bool,
    pub filter: Option<Expr>,
    /// Resume strictly after this key.
    pub start_key: Option<Item>,
    /// Maximum rows evaluated (before the filter), as with DynamoDB.
    pub limit: Option<usize>,
    pub consistent_read: bool,
}

/// An unordered full-table scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub filter: Option<Expr>,
    pub start_key: Option<Item>,
    pub limit: Option<usize>,
    pub consistent_read: bool,
}

/// One page of raw rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub items: Vec<Item>,
    /// `None` once the store has no more rows.
    pub last_evaluated_key: Option<Item>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteOutput {
    /// Rows the store did not apply and that may be retried.
    pub unprocessed: Vec<Item>,
}

/// Raw operations against one table of the backing store.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Primary key and secondary indexes of the table.
    fn schema(&self) -> &TableSchema;

    async fn get(&self, key: &Item, consistent_read: bool) -> Result<Option<Item>, StoreError>;

    /// Write a row. Fails with [`StoreError::ConditionalCheckFailed`] when
    /// `condition` does not hold for the current row (or `{}` if absent).
    async fn put(&self, item: &Item, condition: Option<&Expr>) -> Result<(), StoreError>;

    async fn delete(&self, key: &Item, condition: Option<&Expr>) -> Result<(), StoreError>;

    async fn query(&self, request: &QueryRequest) -> Result<QueryOutput, StoreError>;

    async fn scan(&self, request: &ScanRequest) -> Result<QueryOutput, StoreError>;

    async fn batch_write(&self, items: &[Item]) -> Result<BatchWriteOutput, StoreError>;
}

/// Storage for full, un-minified payloads, addressed by link.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, link: &str) -> Result<Option<Item>, StoreError>;
}

/// Resolves type names to models. May learn new models at runtime.
pub trait ModelRegistry: Send + Sync {
    fn get_model(&self, id: &str) -> Option<ResourceModel>;
}
