use metrics::register_convex_gauge;

register_convex_gauge!(pub DELIVERY_PLANE_CONNECTIONS, "Number of client connections attached to this replica");
