//! Prometheus counters for connector traffic.
//! Statics are incremented directly on the transfer paths.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

const PREFIX: &str = "kv_connector";

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(format!("{PREFIX}_{name}"), help), labels)
        .unwrap_or_else(|e| panic!("invalid metric definition {name}: {e}"))
}

/// `outcome` label values: "hit", "miss", "failed", "timeout"
pub static LOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "loads_total",
        "External block loads by connector and outcome",
        &["connector", "outcome"],
    )
});

/// `outcome` label values: "ok", "failed"
pub static SAVES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "saves_total",
        "External block saves by connector and outcome",
        &["connector", "outcome"],
    )
});

pub static CANCELLATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "cancellations_total",
        "Requests cancelled with transfers pending",
        &["connector"],
    )
});

pub static CAPACITY_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "capacity_rejections_total",
        "Transfers rejected or throttled for exceeding in-flight capacity",
        &["connector", "policy"],
    )
});

/// Process-wide registry holding every connector metric.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    for collector in [
        LOADS_TOTAL.clone(),
        SAVES_TOTAL.clone(),
        CANCELLATIONS_TOTAL.clone(),
        CAPACITY_REJECTIONS_TOTAL.clone(),
    ] {
        if let Err(e) = registry.register(Box::new(collector)) {
            tracing::error!(error = %e, "Failed to register metric");
        }
    }
    registry
});

/// Render the connector metrics in the text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
