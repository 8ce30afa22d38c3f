//! # rtcache
//!
//! Distributed read-through cache backed by Redis.
//!
//! Expensive results are requested by id. A cached result is returned
//! immediately; otherwise the id goes onto a persistent priority queue, one
//! worker somewhere computes it, and every requester blocks until the result
//! is published. See [`cache::ReadThroughCache`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtcache::{ComputeError, JsonCodec, ReadThroughCache, RedisStore, worker};
//!
//! # async fn demo() -> rtcache::error::Result<()> {
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1:6379").await?);
//! let compute = worker::from_fn(|_priority, id: String| async move {
//!     Ok::<_, ComputeError>(id.len())
//! });
//! let cache = ReadThroughCache::new(store, "lengths", Some(compute), JsonCodec::<usize>::new(), 4).await?;
//!
//! assert_eq!(cache.get(1, "hello").await?, 5);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod notifier;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use cache::ReadThroughCache;
pub use codec::{BytesCodec, Codec, JsonCodec};
pub use store::{MemoryStore, RedisStore, Store};
pub use worker::{ComputeError, ReadThroughFn};
