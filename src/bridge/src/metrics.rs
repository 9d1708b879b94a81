//! Process-wide bridge counters, labelled by broker host.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

pub static MESSAGES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "bridge_messages_received_total",
        "Number of inbound payloads turned into observations",
        &["broker"]
    )
    .expect("create bridge messages_received counter vec")
});

pub static MESSAGES_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "bridge_messages_published_total",
        "Number of observations acknowledged by the outbound broker",
        &["broker"]
    )
    .expect("create bridge messages_published counter vec")
});

pub static MESSAGES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "bridge_messages_dropped_total",
        "Number of observations discarded before reaching the outbound broker",
        &["broker", "reason"]
    )
    .expect("create bridge messages_dropped counter vec")
});

pub static CONNECT_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "bridge_connect_failures_total",
        "Number of failed broker connection attempts",
        &["broker"]
    )
    .expect("create bridge connect_failures counter vec")
});

/// Render the default registry in the prometheus text format.
pub fn render() -> String {
    // Touch the counters so they are listed even before the first event.
    Lazy::force(&MESSAGES_RECEIVED);
    Lazy::force(&MESSAGES_PUBLISHED);
    Lazy::force(&MESSAGES_DROPPED);
    Lazy::force(&CONNECT_FAILURES);

    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
