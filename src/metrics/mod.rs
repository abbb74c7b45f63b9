// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers:
// - broker consumption and dispatch latency
// - push outcomes and self-healed subscriptions
// - live local connections and outbound backpressure
// - outbox relay throughput and producer circuit breaker state
// - cross-node router deliveries
//
// Everything is registered on one Registry, scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Dispatcher
    pub events_consumed: IntCounterVec,
    pub dispatch_duration: HistogramVec,
    pub pushes: IntCounterVec,
    pub stale_subscriptions_removed: IntCounter,

    // Gateway
    pub active_connections: IntGauge,
    pub backpressure_rejections: IntCounter,

    // Relay
    pub relay_published: IntCounterVec,
    pub relay_failed: IntCounterVec,
    pub circuit_breaker_state: IntGauge,

    // Router
    pub rpc_deliveries: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_consumed = IntCounterVec::new(
            Opts::new("notify_events_consumed_total", "Broker events consumed by the dispatcher"),
            &["event_type", "outcome"],
        )?;
        registry.register(Box::new(events_consumed.clone()))?;

        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new("notify_dispatch_duration_seconds", "Time spent dispatching one event")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["event_type"],
        )?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        let pushes = IntCounterVec::new(
            Opts::new("notify_pushes_total", "Push attempts to connections by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(pushes.clone()))?;

        let stale_subscriptions_removed = IntCounter::new(
            "notify_stale_subscriptions_removed_total",
            "Subscriptions removed because their connection was gone",
        )?;
        registry.register(Box::new(stale_subscriptions_removed.clone()))?;

        let active_connections = IntGauge::new(
            "gateway_active_connections",
            "Live sessions owned by this node",
        )?;
        registry.register(Box::new(active_connections.clone()))?;

        let backpressure_rejections = IntCounter::new(
            "gateway_backpressure_rejections_total",
            "Messages rejected because an outbound queue was full",
        )?;
        registry.register(Box::new(backpressure_rejections.clone()))?;

        let relay_published = IntCounterVec::new(
            Opts::new("relay_published_total", "Outbox rows published to the broker"),
            &["event_type"],
        )?;
        registry.register(Box::new(relay_published.clone()))?;

        let relay_failed = IntCounterVec::new(
            Opts::new("relay_failed_total", "Outbox rows that failed to publish"),
            &["event_type"],
        )?;
        registry.register(Box::new(relay_failed.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Producer circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let rpc_deliveries = IntCounterVec::new(
            Opts::new("router_deliveries_total", "Deliver RPCs served by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(rpc_deliveries.clone()))?;

        Ok(Self {
            registry,
            events_consumed,
            dispatch_duration,
            pushes,
            stale_subscriptions_removed,
            active_connections,
            backpressure_rejections,
            relay_published,
            relay_failed,
            circuit_breaker_state,
            rpc_deliveries,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_consumed(&self, event_type: &str, outcome: &str, duration_secs: f64) {
        self.events_consumed.with_label_values(&[event_type, outcome]).inc();
        self.dispatch_duration.with_label_values(&[event_type]).observe(duration_secs);
    }

    pub fn record_push(&self, outcome: &str) {
        self.pushes.with_label_values(&[outcome]).inc();
    }

    pub fn record_relay(&self, event_type: &str, success: bool) {
        if success {
            self.relay_published.with_label_values(&[event_type]).inc();
        } else {
            self.relay_failed.with_label_values(&[event_type]).inc();
        }
    }

    pub fn record_rpc(&self, outcome: &str) {
        self.rpc_deliveries.with_label_values(&[outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_push("delivered");
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_consumed() {
        let metrics = Metrics::new().unwrap();
        metrics.record_consumed("FileDescriptorChangedEvent", "processed", 0.02);
        metrics.record_consumed("FileDescriptorChangedEvent", "processed", 0.01);

        let counter = metrics
            .events_consumed
            .with_label_values(&["FileDescriptorChangedEvent", "processed"]);
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_record_relay_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_relay("ConnectionChangedEvent", true);
        metrics.record_relay("ConnectionChangedEvent", false);
        metrics.record_relay("ConnectionChangedEvent", true);

        assert_eq!(metrics.relay_published.with_label_values(&["ConnectionChangedEvent"]).get(), 2);
        assert_eq!(metrics.relay_failed.with_label_values(&["ConnectionChangedEvent"]).get(), 1);
    }

    #[test]
    fn test_circuit_breaker_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.circuit_breaker_state.set(1);
        assert_eq!(metrics.circuit_breaker_state.get(), 1);
    }
}
