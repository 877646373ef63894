use metrics::{
    register_convex_counter,
    register_convex_histogram,
    STATUS_LABEL,
};

register_convex_histogram!(
    pub SWITCH_CYCLE_SECONDS,
    "Latency of the switchCycle hot path, end to end",
    &STATUS_LABEL
);
register_convex_counter!(
    pub SWITCH_CYCLE_CONCURRENCY_CONFLICTS_TOTAL,
    "Count of switchCycle calls that lost the optimistic-concurrency race"
);
