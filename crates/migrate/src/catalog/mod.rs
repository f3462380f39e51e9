//! Built-in migration units

pub mod suppliers;

pub use suppliers::{supplier_unit, DEFAULT_OWNING_TABLES, UNKNOWN_SUPPLIER_CODE};
