//! Local event synchronization and cache layer for Nostr bounty clients.
//!
//! Events arrive from many untrusted relays, are verified, deduplicated and
//! reconciled in an [`EventStore`], and are read back through live views and
//! typed projections. [`Services`] wires the components together.

pub mod cache_meta;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod live;
pub mod loaders;
pub mod pool;
pub mod profile_cache;
pub mod projection;
pub mod rate_limit;
pub mod reputation;
pub mod services;
pub mod store;
pub mod transport;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use config::Settings;
pub use error::{SyncError, SyncResult, ValidationError};
pub use event::{Address, Event, Identity, Tag};
pub use filter::Filter;
pub use live::Live;
pub use services::Services;
pub use store::EventStore;
