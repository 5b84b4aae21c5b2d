//! Prometheus metrics for budget, policy and action outcomes

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_gauge_with_registry,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, CounterVec, Gauge, HistogramVec, IntCounter,
    IntCounterVec, Opts, Registry,
};
use std::sync::Arc;
use std::time::Duration;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> =
    Lazy::new(|| Arc::new(Metrics::new().expect("Failed to initialize metrics")));

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Ledger
    pub reservations: IntCounterVec,
    pub commits: IntCounter,
    pub releases: IntCounter,
    pub lamports_spent: CounterVec,
    pub budget_available: Gauge,

    // Policy
    pub policy_denials: IntCounterVec,

    // Executor
    pub actions: IntCounterVec,
    pub action_duration: HistogramVec,

    // Facilitator
    pub facilitator_duration: HistogramVec,

    // Telemetry
    pub telemetry_sink_errors: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reservations = register_int_counter_vec_with_registry!(
            Opts::new("spend_reservations_total", "Budget reservations by outcome"),
            &["outcome"],
            registry
        )?;

        let commits = register_int_counter_with_registry!(
            Opts::new("spend_commits_total", "Reservations committed as spend"),
            registry
        )?;

        let releases = register_int_counter_with_registry!(
            Opts::new("spend_releases_total", "Reservations released without spend"),
            registry
        )?;

        let lamports_spent = register_counter_vec_with_registry!(
            Opts::new("spend_lamports_total", "Lamports committed, by source"),
            &["source"],
            registry
        )?;

        let budget_available = register_gauge_with_registry!(
            Opts::new(
                "spend_budget_available_lamports",
                "Available budget after the last ledger change"
            ),
            registry
        )?;

        let policy_denials = register_int_counter_vec_with_registry!(
            Opts::new("spend_policy_denials_total", "Policy denials by reason"),
            &["reason"],
            registry
        )?;

        let actions = register_int_counter_vec_with_registry!(
            Opts::new("spend_actions_total", "Executed actions by status"),
            &["status"],
            registry
        )?;

        let action_duration = register_histogram_vec_with_registry!(
            "spend_action_duration_seconds",
            "Adapter execution time in seconds",
            &["adapter"],
            registry
        )?;

        let facilitator_duration = register_histogram_vec_with_registry!(
            "spend_facilitator_request_duration_seconds",
            "Facilitator request duration in seconds",
            &["operation"],
            registry
        )?;

        let telemetry_sink_errors = register_int_counter_with_registry!(
            Opts::new(
                "spend_telemetry_sink_errors_total",
                "Telemetry events a sink failed to accept"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            reservations,
            commits,
            releases,
            lamports_spent,
            budget_available,
            policy_denials,
            actions,
            action_duration,
            facilitator_duration,
            telemetry_sink_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a reservation attempt: `accepted`, `insufficient` or `duplicate`
    pub fn record_reservation(&self, outcome: &str) {
        self.reservations.with_label_values(&[outcome]).inc();
    }

    pub fn record_commit(&self, lamports: u64) {
        self.commits.inc();
        self.lamports_spent
            .with_label_values(&["ledger"])
            .inc_by(lamports as f64);
    }

    pub fn record_release(&self) {
        self.releases.inc();
    }

    pub fn set_available(&self, lamports: u64) {
        self.budget_available.set(lamports as f64);
    }

    pub fn record_policy_denial(&self, reason: &str) {
        self.policy_denials.with_label_values(&[reason]).inc();
    }

    /// Record a finished action and how long its adapter ran. Durations are
    /// labelled by adapter name, never by the caller's action type.
    pub fn record_action(&self, adapter: &str, status: &str, duration: Duration) {
        self.actions.with_label_values(&[status]).inc();
        self.action_duration
            .with_label_values(&[adapter])
            .observe(duration.as_secs_f64());
    }

    /// Record an action refused before it ran
    pub fn record_refused_action(&self, status: &str) {
        self.actions.with_label_values(&[status]).inc();
    }

    pub fn observe_facilitator(&self, operation: &str, elapsed: Duration) {
        self.facilitator_duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_sink_error(&self) {
        self.telemetry_sink_errors.inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}
