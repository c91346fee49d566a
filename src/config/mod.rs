//! Configuration
//!
//! `AppConfig` is read from a TOML file; every section and field has a
//! default, so partial files are valid.

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
