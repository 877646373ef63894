use metrics::register_convex_counter;

register_convex_counter!(pub BAD_REQUEST_ERROR_TOTAL, "Count of bad request errors");
register_convex_counter!(pub NOT_FOUND_ERROR_TOTAL, "Count of not found errors");
register_convex_counter!(pub CONFLICT_ERROR_TOTAL, "Count of optimistic-concurrency conflicts");
register_convex_counter!(pub INTERNAL_ERROR_TOTAL, "Count of internal server errors");
