//! Cache, coalescing, and filesystem-lookup primitives shared by the gateway
//! server. This crate has no HTTP or WebDAV awareness; it only knows about
//! paths, bytes, and keys.

pub mod coalescer;
pub mod error;
pub mod fs_cache;
pub mod rendition_cache;
pub mod rendition_key;

pub use coalescer::Coalescer;
pub use error::{GatewayError, Result};
pub use fs_cache::{FsCache, StatRecord};
pub use rendition_cache::{CachedEntry, DiskRenditionCache, PendingWrite};
pub use rendition_key::{LongEdge, RenditionKey, RenditionSpec};
