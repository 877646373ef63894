use metrics::register_convex_gauge;

register_convex_gauge!(pub STATE_STORE_SESSIONS, "Number of sessions currently held in the state store");
