use metrics::{
    register_convex_counter,
    register_convex_gauge,
};

register_convex_gauge!(pub AUDIT_QUEUE_DEPTH, "Number of audit jobs waiting or in flight");
register_convex_counter!(pub AUDIT_JOBS_RETRIED_TOTAL, "Count of audit job attempts that failed and were retried");
register_convex_counter!(pub AUDIT_JOBS_DEAD_LETTERED_TOTAL, "Count of audit jobs exhausted retries and were dead-lettered");
