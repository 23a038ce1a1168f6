//! KeyDB (Redis-compatible) plumbing.
//!
//! One connection pool backs both the pub/sub channel that policy clients
//! subscribe to and, by default, the scope store.

pub mod pubsub;
pub mod redis;
