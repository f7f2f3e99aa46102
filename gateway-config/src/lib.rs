//! Typed, hot-reloaded settings registry for the photo gateway: a flat
//! `KEY=VALUE` text file, range-validated on load, polled for changes, and
//! published to subscribers as immutable snapshots.

pub mod error;
pub mod loader;
pub mod registry;
pub mod restart;
pub mod snapshot;

pub use error::{ConfigError, Result};
pub use loader::ConfigWarning;
pub use registry::ConfigRegistry;
pub use snapshot::ConfigSnapshot;
