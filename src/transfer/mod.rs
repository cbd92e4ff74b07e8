//! Data movement between the local pool and external backends.
//!
//! - [`store`]: `KvStore` backends (in-memory and sharded on-disk)
//! - [`queue`]: bounded background save queue with backpressure
//! - [`health`]: consecutive-failure tracking per backend

pub mod health;
pub mod queue;
pub mod store;
