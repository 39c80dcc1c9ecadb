//! Public API: the table handle, request builders and select projection.

pub mod builders;
pub mod projection;
pub mod table;

pub use builders::{FindRequest, FindResult, GetOptions, TableBuilder};
pub use projection::{IDENTITY, apply_projection};
pub use table::Table;
