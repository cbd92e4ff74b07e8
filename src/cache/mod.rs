//! Local KV block bookkeeping.
//!
//! - [`block`]: block ids, content hashes and the worker-local block pool
//! - [`state`]: per-request transfer status and scheduler-side reservations

pub mod block;
pub mod state;
