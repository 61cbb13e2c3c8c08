//! Metrics sink fed by the scheduler after every attempt.

use crate::types::{EndpointId, Outcome};
use core_logic::MetricsCollector;
use std::time::Duration;

/// Receives one record per scheduling attempt.
///
/// Errors are logged by the scheduler and dropped; a failing sink never
/// fails a task.
pub trait MetricsSink: Send + Sync {
    fn record(
        &self,
        task: &str,
        outcome: &Outcome,
        endpoint: Option<EndpointId>,
        duration: Duration,
    ) -> anyhow::Result<()>;
}

impl MetricsSink for MetricsCollector {
    fn record(
        &self,
        task: &str,
        outcome: &Outcome,
        endpoint: Option<EndpointId>,
        duration: Duration,
    ) -> anyhow::Result<()> {
        self.record_task(task, duration, outcome.success);
        if let Some(endpoint) = endpoint {
            self.record_endpoint(&endpoint.to_string(), outcome.success);
        }
        if let Some(class) = outcome.error {
            self.record_error(class.as_str());
        }
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(
        &self,
        _: &str,
        _: &Outcome,
        _: Option<EndpointId>,
        _: Duration,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn collector_counts_by_task_endpoint_and_class() {
        let collector = MetricsCollector::default();

        collector
            .record(
                "parallel_burst",
                &Outcome::success("ok", None),
                Some(EndpointId(2)),
                Duration::from_millis(40),
            )
            .unwrap();
        collector
            .record(
                "parallel_burst",
                &Outcome::failure("slow", ErrorClass::Timeout),
                Some(EndpointId(2)),
                Duration::from_millis(900),
            )
            .unwrap();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.tasks.total, 2);
        assert_eq!(snapshot.by_endpoint["ep-002"].failed, 1);
        assert_eq!(snapshot.errors["timeout"], 1);
    }
}
