use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub fan_out_total: IntCounterVec,
    pub deliveries_total: IntCounterVec,
    pub booking_transitions_total: IntCounterVec,
    pub live_connections: IntGaugeVec,
    pub consumer_messages_total: IntCounterVec,
    pub match_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let fan_out_total = IntCounterVec::new(
            Opts::new("fan_out_total", "Candidate operators handled per outcome"),
            &["outcome"],
        )
        .expect("valid fan_out_total metric");

        let deliveries_total = IntCounterVec::new(
            Opts::new("deliveries_total", "Routed frames by delivery route"),
            &["route"],
        )
        .expect("valid deliveries_total metric");

        let booking_transitions_total = IntCounterVec::new(
            Opts::new("booking_transitions_total", "Lifecycle events emitted by status"),
            &["status"],
        )
        .expect("valid booking_transitions_total metric");

        let live_connections = IntGaugeVec::new(
            Opts::new("live_connections", "Registered live channels by role"),
            &["role"],
        )
        .expect("valid live_connections metric");

        let consumer_messages_total = IntCounterVec::new(
            Opts::new("consumer_messages_total", "Topic messages by consumer outcome"),
            &["topic", "outcome"],
        )
        .expect("valid consumer_messages_total metric");

        let match_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "match_latency_seconds",
            "Time from pending request to finished fan-out",
        ))
        .expect("valid match_latency_seconds metric");

        registry
            .register(Box::new(fan_out_total.clone()))
            .expect("register fan_out_total");
        registry
            .register(Box::new(deliveries_total.clone()))
            .expect("register deliveries_total");
        registry
            .register(Box::new(booking_transitions_total.clone()))
            .expect("register booking_transitions_total");
        registry
            .register(Box::new(live_connections.clone()))
            .expect("register live_connections");
        registry
            .register(Box::new(consumer_messages_total.clone()))
            .expect("register consumer_messages_total");
        registry
            .register(Box::new(match_latency_seconds.clone()))
            .expect("register match_latency_seconds");

        Self {
            registry,
            fan_out_total,
            deliveries_total,
            booking_transitions_total,
            live_connections,
            consumer_messages_total,
            match_latency_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
