//! # Flagshift
//!
//! Scheduled feature-flag changes and dependency cascades, usable both as a
//! standalone server and as a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! flagshift = { version = "0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flagshift::cache::FlagCache;
//! use flagshift::queue::{QueueConfig, SqliteDelayQueue};
//! use flagshift::server::{AppState, create_router};
//! use flagshift::store::{SqliteStore, Store};
//!
//! let store = Arc::new(SqliteStore::new("./data/flagshift.db").unwrap());
//! store.initialize().unwrap();
//! let queue = Arc::new(SqliteDelayQueue::new("./data/flagshift.db", QueueConfig::default()).unwrap());
//! queue.initialize().unwrap();
//!
//! let state = Arc::new(AppState::new(store, queue, Arc::new(FlagCache::default())));
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `flagshift` binary. Disable with `default-features = false`.

pub mod cache;
pub mod cascade;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod schedule;
pub mod server;
pub mod store;
pub mod types;
pub mod worker;
