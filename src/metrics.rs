//! # Metrics Registry
//!
//! Process-wide Prometheus counters and histograms, built once at startup and
//! shared by reference with every pipeline invocation. All updates are atomic
//! increments, so no extra locking is needed around them.
//!
//! The registry is owned by this struct rather than being the prometheus global
//! default, so each test can build an isolated instance and read exact values.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::models::Transport;

pub const REQUESTS_TOTAL: &str = "requests_total";
pub const ERRORS_TOTAL: &str = "errors_total";
pub const REQUEST_DURATION_SECONDS: &str = "request_duration_seconds";
pub const ACTIVE_SESSIONS: &str = "active_sessions";
pub const ENGINE_SLOTS_AVAILABLE: &str = "engine_slots_available";

/// Bucket edges tuned for whole-chunk transcription, from sub-second
/// short clips up to multi-minute uploads on CPU.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0,
];

pub struct MetricsRegistry {
    registry: Registry,
    requests: IntCounterVec,
    errors: IntCounterVec,
    duration: HistogramVec,
    active_sessions: IntGauge,
    slots_available: IntGauge,
}

impl MetricsRegistry {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(REQUESTS_TOTAL, "Transcription requests received"),
            &["transport"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new(ERRORS_TOTAL, "Transcription requests that failed"),
            &["transport", "kind"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(REQUEST_DURATION_SECONDS, "Transcription request duration (s)")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["transport"],
        )?;
        let active_sessions = IntGauge::new(ACTIVE_SESSIONS, "Open streaming sessions")?;
        let slots_available =
            IntGauge::new(ENGINE_SLOTS_AVAILABLE, "Idle inference engine instances")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(slots_available.clone()))?;

        Ok(Self {
            registry,
            requests,
            errors,
            duration,
            active_sessions,
            slots_available,
        })
    }

    pub fn record_request(&self, transport: Transport) {
        self.requests.with_label_values(&[transport.as_str()]).inc();
    }

    pub fn record_error(&self, transport: Transport, kind: &str) {
        self.errors.with_label_values(&[transport.as_str(), kind]).inc();
    }

    pub fn record_duration(&self, transport: Transport, elapsed: Duration) {
        self.duration
            .with_label_values(&[transport.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn session_opened(&self) {
        self.active_sessions.inc();
    }

    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    pub fn set_slots_available(&self, available: usize) {
        self.slots_available.set(available as i64);
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    #[cfg(test)]
    pub fn requests(&self, transport: Transport) -> u64 {
        self.requests.with_label_values(&[transport.as_str()]).get()
    }

    /// Total errors for a transport across all kinds.
    #[cfg(test)]
    pub fn errors(&self, transport: Transport) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == ERRORS_TOTAL)
            .flat_map(|family| family.get_metric())
            .filter(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == "transport" && l.get_value() == transport.as_str())
            })
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    #[cfg(test)]
    pub fn errors_of_kind(&self, transport: Transport, kind: &str) -> u64 {
        self.errors.with_label_values(&[transport.as_str(), kind]).get()
    }

    #[cfg(test)]
    pub fn duration_samples(&self, transport: Transport) -> u64 {
        self.duration
            .with_label_values(&[transport.as_str()])
            .get_sample_count()
    }

    #[cfg(test)]
    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }
}
