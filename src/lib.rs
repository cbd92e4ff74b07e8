//! kv-connector: KV-cache connector layer for disaggregated LLM serving.
//!
//! Lets a serving engine obtain KV blocks from, and publish them to, external
//! sources so prefill and decode can run in separate engine instances:
//!   Scheduler half (lookup, reservations) ⇄ metadata/output ⇄ Worker half (load, save)
//!
//! Implementations are resolved by name through a [`connector::ConnectorRegistry`]
//! and constructed per role by a [`connector::ConnectorFactory`].

pub mod cache;
pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod server;
pub mod transfer;
