//! Admin HTTP surface: health, transfer stats and Prometheus metrics.

pub mod admin_api;
