//! Prometheus metrics for the execution engine.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use msq_exec::Status;

/// Engine metrics, registered on a registry owned by this struct.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    /// Requests handed to the dispatcher and not yet answered
    pub in_flight: IntGauge,
    /// Dispatcher workers currently inside an exchange call
    pub dispatcher_busy_workers: IntGauge,
    responses: IntCounterVec,
    /// Commands moved CREATED → TIMED_OUT by the sweeper
    pub commands_expired: IntCounter,
    store_errors: IntCounterVec,
}

impl EngineMetrics {
    /// Create and register every metric.
    ///
    /// # Errors
    /// Fails if a metric is malformed or registered twice
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let in_flight = IntGauge::new(
            "msq_in_flight",
            "Requests handed to the dispatcher and not yet answered",
        )?;
        let dispatcher_busy_workers = IntGauge::new(
            "msq_dispatcher_busy_workers",
            "Dispatcher workers currently executing a request",
        )?;
        let responses = IntCounterVec::new(
            Opts::new("msq_responses_total", "Dispatcher responses by status"),
            &["status"],
        )?;
        let commands_expired = IntCounter::new(
            "msq_commands_expired_total",
            "Commands timed out without trying to execute",
        )?;
        let store_errors = IntCounterVec::new(
            Opts::new("msq_store_errors_total", "Command store errors by component"),
            &["component"],
        )?;

        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(dispatcher_busy_workers.clone()))?;
        registry.register(Box::new(responses.clone()))?;
        registry.register(Box::new(commands_expired.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;

        Ok(Self {
            registry,
            in_flight,
            dispatcher_busy_workers,
            responses,
            commands_expired,
            store_errors,
        })
    }

    /// Count one dispatcher response
    pub fn observe_response(&self, status: Status) {
        self.responses.with_label_values(&[status.as_str()]).inc();
    }

    /// Count one store error in `component`
    pub fn store_error(&self, component: &str) {
        self.store_errors.with_label_values(&[component]).inc();
    }

    pub fn responses(&self, status: Status) -> u64 {
        self.responses.with_label_values(&[status.as_str()]).get()
    }

    pub fn store_errors(&self, component: &str) -> u64 {
        self.store_errors.with_label_values(&[component]).get()
    }

    /// Render every metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.in_flight.set(3);
        metrics.observe_response(Status::Ok);
        metrics.observe_response(Status::Ok);
        metrics.store_error("dumper");
        metrics.commands_expired.inc_by(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("msq_in_flight 3"));
        assert!(text.contains("msq_responses_total{status=\"ok\"} 2"));
        assert!(text.contains("msq_store_errors_total{component=\"dumper\"} 1"));
        assert!(text.contains("msq_commands_expired_total 2"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = EngineMetrics::new().unwrap();
        let b = EngineMetrics::new().unwrap();
        a.observe_response(Status::Rejected);

        assert_eq!(a.responses(Status::Rejected), 1);
        assert_eq!(b.responses(Status::Rejected), 0);
    }
}
