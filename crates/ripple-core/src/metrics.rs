//! Metric registration and record helpers.
//!
//! Instrumentation goes through the `metrics` facade; the server binary
//! installs the Prometheus exporter.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_ACTIVE: &str = "ripple_connections_active";
    pub const MESSAGES_TOTAL: &str = "ripple_messages_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "ripple_subscriptions_total";
    pub const AUTH_DURATION_SECONDS: &str = "ripple_auth_duration_seconds";
    pub const AUTH_FAILURES_TOTAL: &str = "ripple_auth_failures_total";
    pub const BREAKER_OPEN_TOTAL: &str = "ripple_circuit_breaker_open_total";
    pub const CLIENT_DROPPED_TOTAL: &str = "ripple_client_dropped_messages_total";
    pub const BROKER_DROPPED_TOTAL: &str = "ripple_broker_dropped_messages_total";
}

/// Describe all metrics. Call once at startup.
pub fn describe() {
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active WebSocket connections"
    );
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Total number of messages published to the hub"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel subscriptions"
    );
    metrics::describe_histogram!(
        names::AUTH_DURATION_SECONDS,
        "Duration of remote authorization calls in seconds"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of failed authorization calls, by reason"
    );
    metrics::describe_counter!(
        names::BREAKER_OPEN_TOTAL,
        "Authorization calls rejected because the circuit breaker was open"
    );
    metrics::describe_counter!(
        names::CLIENT_DROPPED_TOTAL,
        "Messages dropped because a client outbound queue was full"
    );
    metrics::describe_counter!(
        names::BROKER_DROPPED_TOTAL,
        "Messages dropped by the in-memory broker under backpressure"
    );
}

/// Record a client registration.
pub fn record_connection() {
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a client unregistration.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a published message.
pub fn record_message() {
    counter!(names::MESSAGES_TOTAL).increment(1);
}

/// Record a channel subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record the duration of a remote authorization call.
pub fn record_auth_duration(seconds: f64) {
    histogram!(names::AUTH_DURATION_SECONDS).record(seconds);
}

/// Record a failed authorization with its reason label.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Record an authorization short-circuited by the open breaker.
pub fn record_breaker_open() {
    counter!(names::BREAKER_OPEN_TOTAL).increment(1);
}

/// Record a message dropped on a slow client.
pub fn record_client_dropped() {
    counter!(names::CLIENT_DROPPED_TOTAL).increment(1);
}

/// Record a message dropped by the in-memory broker.
pub fn record_broker_dropped() {
    counter!(names::BROKER_DROPPED_TOTAL).increment(1);
}
