//! Table-level configuration.

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffOptions;
use crate::types::{MAX_BATCH_WRITE, MAX_ITEM_SIZE};

/// Policy applied to every operation on a [`Table`](crate::api::Table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    /// Refuse requests the planner can only answer with a full scan.
    pub forbid_scan: bool,
    /// Serialized size above which resources are minified on write. `None`
    /// disables minification.
    pub max_item_size: Option<usize>,
    /// Rows per batch-write call.
    pub batch_size: usize,
    pub backoff: BackoffOptions,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            forbid_scan: false,
            max_item_size: Some(MAX_ITEM_SIZE),
            batch_size: MAX_BATCH_WRITE,
            backoff: BackoffOptions::default(),
        }
    }
}

impl TableOptions {
    pub fn forbid_scan(mut self, forbid: bool) -> Self {
        self.forbid_scan = forbid;
        self
    }

    pub fn max_item_size(mut self, size: Option<usize>) -> Self {
        self.max_item_size = size;
        self
    }

    /// Clamped to `1..=25`.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(1, MAX_BATCH_WRITE);
        self
    }

    pub fn backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = backoff;
        self
    }
}
