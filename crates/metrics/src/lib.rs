//! Shared metrics plumbing: a single Prometheus registry plus macros for
//! declaring counters/gauges/histograms in a `metrics` submodule next to the
//! code they describe, following Prometheus's naming conventions
//! (<https://prometheus.io/docs/practices/naming/>).
//!
//! Convention: every crate keeps its metric declarations in a `metrics`
//! module, and the interface it exposes to the rest of the crate is high
//! level ("this event happened"), not "log an f64 to this metric name".

use std::{
    env,
    sync::LazyLock,
};

mod labels;
mod macros;
mod registry;
mod reporting;
mod timer;

pub use prometheus;

pub use crate::{
    labels::{
        IntoLabel,
        Labels,
        MetricLabel,
        StaticMetricLabel,
        STATUS_LABEL,
    },
    registry::{
        MetricHelp,
        MetricName,
        ENGINE_METRICS_REGISTRY,
    },
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
        log_gauge_with_labels,
    },
    timer::{
        StatusTimer,
        Timer,
    },
};

/// Identifies this process in metric labels; derived from the executable
/// name so every binary in the workspace gets a sensible default without
/// extra configuration.
pub static SERVICE_NAME: LazyLock<String> = LazyLock::new(|| {
    env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "session_sync".to_owned())
        .replace('-', "_")
});
