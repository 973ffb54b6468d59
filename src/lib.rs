/// Custom resource types served by this operator
pub mod api;

/// Client for the database's native backup API
pub mod arango;

/// Controllers and the backup state machine
pub mod controllers;

/// Log, metric and error plumbing
pub mod util;

pub use util::errors::{Error, Result};
