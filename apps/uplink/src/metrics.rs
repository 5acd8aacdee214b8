use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static REQUESTS_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "uplink_requests_sent_total",
            "Client-to-server messages handed to a channel",
        ),
        &["channel", "kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static MESSAGES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "uplink_messages_total",
            "Server messages by what the sequencer did with them",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RESYNCHRONIZATIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "uplink_resynchronizations_total",
        "Full resynchronizations requested from the server",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONNECT_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "uplink_reconnect_attempts_total",
            "Recovery attempts by failure source",
        ),
        &["source"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static GIVE_UPS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "uplink_give_ups_total",
        "Times recovery was abandoned",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PUSH_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("uplink_push_frames_total", "Push frames by direction"),
        &["direction"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PENDING_MESSAGES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "uplink_pending_messages",
        "Server messages buffered waiting for order or unlock",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Text exposition of everything registered so far.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(target: "uplink::metrics", error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
