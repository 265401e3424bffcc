//! Prometheus metrics for agent observability.
//!
//! Exposed at `GET /metrics` on the admin listener. Child gauges are
//! sampled from the supervisor snapshot at scrape time; update outcomes
//! are counted as they happen.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use payram_agent_core::supervisor::SupervisorStatus;

/// Errors from metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Update attempt outcome labels.
pub const OUTCOME_SUCCESS: &str = "success";
/// Label for attempts that failed before or at the switch.
pub const OUTCOME_FAILURE: &str = "failure";
/// Label for attempts undone by the automatic health rollback.
pub const OUTCOME_ROLLED_BACK: &str = "rolled_back";

/// Registry plus the agent's metric families.
pub struct AgentMetrics {
    registry: Registry,
    update_attempts: IntCounterVec,
    child_restarts: IntGaugeVec,
    child_up: IntGaugeVec,
}

impl AgentMetrics {
    /// Creates and registers the agent metric families.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::RegistrationFailed`] when a family cannot
    /// be registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let update_attempts = IntCounterVec::new(
            Opts::new(
                "payram_agent_update_attempts_total",
                "Update attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(update_attempts.clone()))?;

        let child_restarts = IntGaugeVec::new(
            Opts::new(
                "payram_agent_child_restarts",
                "Restart count per supervised child",
            ),
            &["component"],
        )?;
        registry.register(Box::new(child_restarts.clone()))?;

        let child_up = IntGaugeVec::new(
            Opts::new(
                "payram_agent_child_up",
                "Whether the supervised child currently has a live process",
            ),
            &["component"],
        )?;
        registry.register(Box::new(child_up.clone()))?;

        Ok(Self {
            registry,
            update_attempts,
            child_restarts,
            child_up,
        })
    }

    /// Counts one update attempt under the given outcome label.
    pub fn record_update_outcome(&self, outcome: &str) {
        self.update_attempts.with_label_values(&[outcome]).inc();
    }

    /// Refreshes the child gauges from a supervisor snapshot.
    pub fn observe_children(&self, status: &SupervisorStatus) {
        for component in &status.components {
            self.child_restarts
                .with_label_values(&[component.name.as_str()])
                .set(i64::from(component.restarts));
            self.child_up
                .with_label_values(&[component.name.as_str()])
                .set(i64::from(component.pid != 0));
        }
    }

    /// Encodes the registry in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::EncodingFailed`] on encoder failure.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_are_counted_and_encoded() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.record_update_outcome(OUTCOME_SUCCESS);
        metrics.record_update_outcome(OUTCOME_ROLLED_BACK);
        metrics.record_update_outcome(OUTCOME_SUCCESS);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains(r#"payram_agent_update_attempts_total{outcome="success"} 2"#));
        assert!(text.contains(r#"payram_agent_update_attempts_total{outcome="rolled_back"} 1"#));
    }

    #[test]
    fn child_gauges_follow_the_snapshot() {
        use payram_agent_core::supervisor::ComponentStatus;

        let metrics = AgentMetrics::new().unwrap();
        metrics.observe_children(&SupervisorStatus {
            components: vec![ComponentStatus {
                name: "chat".to_string(),
                pid: 4242,
                start_time: None,
                restarts: 3,
                last_exit: None,
            }],
        });

        let text = metrics.encode_text().unwrap();
        assert!(text.contains(r#"payram_agent_child_restarts{component="chat"} 3"#));
        assert!(text.contains(r#"payram_agent_child_up{component="chat"} 1"#));
    }
}
