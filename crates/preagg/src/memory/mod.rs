//! In-process implementations of the cache backend and rebuild queue
//!
//! These serve single-process deployments and tests. State lives only as long
//! as the value; a restart forgets cached listings, tables-used markers and
//! queued work, which only delays refreshes and garbage collection.

mod cache;
mod queue;

pub use cache::LocalCacheBackend;
pub use queue::LocalQueue;
