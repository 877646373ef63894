use std::{
    ops::Deref,
    sync::LazyLock,
};

use prometheus::Registry;

const ALLOWED_SUFFIXES: &[&str] = &[
    "_seconds", "_bytes", "_sessions", "_participants", "_connections", "_requests", "_timeouts",
    "_hits", "_misses", "_evictions", "_threads", "_errors", "_reads", "_writes", "_operations",
    "_updates", "_jobs", "_total", "_info",
];

/// The process-wide Prometheus registry every metric in the workspace
/// registers against.
pub static ENGINE_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    Registry::new_custom(Some("session_sync".to_owned()), None)
        .expect("failed to initialize metrics registry")
});

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MetricName(&'static str);

impl MetricName {
    pub const fn new(name: &'static str) -> Self {
        validate_metric_name(name);
        Self(name)
    }
}

impl Deref for MetricName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricHelp(&'static str);

impl MetricHelp {
    pub const fn new(help_str: &'static str) -> Self {
        if help_str.is_empty() {
            panic!("metric help strings must be nonempty");
        }
        Self(help_str)
    }
}

impl Deref for MetricHelp {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

const fn ends_with(s: &[u8], suffix: &[u8]) -> bool {
    if s.len() < suffix.len() {
        return false;
    }
    let base = s.len() - suffix.len();
    let mut i = 0;
    while i < suffix.len() {
        if s[base + i] != suffix[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn validate_metric_name(name: &str) {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let ok = (b'A' <= c && c <= b'Z')
            || (b'a' <= c && c <= b'z')
            || (b'0' <= c && c <= b'9')
            || c == b'_';
        if !ok {
            panic!("metric names can only contain alphanumerics and underscores");
        }
        i += 1;
    }
    let mut i = 0;
    let mut found = false;
    while i < ALLOWED_SUFFIXES.len() {
        if ends_with(bytes, ALLOWED_SUFFIXES[i].as_bytes()) {
            found = true;
            break;
        }
        i += 1;
    }
    if !found {
        panic!("metric names must end with a unit suffix such as `_total` or `_seconds`");
    }
}

/// Force metric name validation to happen at compile time.
#[macro_export]
macro_rules! metric_name {
    ($name:expr) => {{
        const METRIC_NAME: $crate::MetricName = $crate::MetricName::new($name);
        METRIC_NAME
    }};
}

#[macro_export]
macro_rules! metric_help {
    ($help:literal) => {{
        const METRIC_HELP: $crate::MetricHelp = $crate::MetricHelp::new($help);
        METRIC_HELP
    }};
}
