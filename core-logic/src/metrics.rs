use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_secs: u64,
    pub tasks: TaskMetrics,
    pub performance: PerformanceMetrics,
    pub by_task: BTreeMap<String, Breakdown>,
    pub by_endpoint: BTreeMap<String, Breakdown>,
    pub errors: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub total_duration_ms: u64,
    pub avg_task_duration_ms: f64,
    pub min_task_duration_ms: u64,
    pub max_task_duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Breakdown {
    pub success: u64,
    pub failed: u64,
}

/// Process-wide counters for executed tasks.
///
/// Totals are lock-free atomics; the per-task, per-endpoint and per-error
/// breakdowns sit behind one short-lived mutex each.
#[derive(Debug)]
pub struct MetricsCollector {
    tasks_total: AtomicU64,
    tasks_success: AtomicU64,
    tasks_failed: AtomicU64,
    task_duration_sum_ms: AtomicU64,
    task_min_duration_ms: AtomicU64,
    task_max_duration_ms: AtomicU64,
    by_task: Mutex<BTreeMap<String, Breakdown>>,
    by_endpoint: Mutex<BTreeMap<String, Breakdown>>,
    errors: Mutex<BTreeMap<String, u64>>,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            tasks_total: AtomicU64::new(0),
            tasks_success: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            task_duration_sum_ms: AtomicU64::new(0),
            task_min_duration_ms: AtomicU64::new(u64::MAX),
            task_max_duration_ms: AtomicU64::new(0),
            by_task: Mutex::new(BTreeMap::new()),
            by_endpoint: Mutex::new(BTreeMap::new()),
            errors: Mutex::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }
}

fn bump(map: &Mutex<BTreeMap<String, Breakdown>>, key: &str, success: bool) {
    // A poisoned map only loses a counter update.
    if let Ok(mut guard) = map.lock() {
        let entry = guard.entry(key.to_string()).or_default();
        if success {
            entry.success += 1;
        } else {
            entry.failed += 1;
        }
    }
}

impl MetricsCollector {
    pub fn record_task(&self, name: &str, duration: Duration, success: bool) {
        let duration_ms = duration.as_millis() as u64;

        self.tasks_total.fetch_add(1, Ordering::SeqCst);
        self.task_duration_sum_ms
            .fetch_add(duration_ms, Ordering::SeqCst);
        self.task_min_duration_ms
            .fetch_min(duration_ms, Ordering::SeqCst);
        self.task_max_duration_ms
            .fetch_max(duration_ms, Ordering::SeqCst);

        if success {
            self.tasks_success.fetch_add(1, Ordering::SeqCst);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        }

        bump(&self.by_task, name, success);
    }

    pub fn record_endpoint(&self, endpoint: &str, success: bool) {
        bump(&self.by_endpoint, endpoint, success);
    }

    pub fn record_error(&self, class: &str) {
        if let Ok(mut guard) = self.errors.lock() {
            *guard.entry(class.to_string()).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_tasks = self.tasks_total.load(Ordering::SeqCst);
        let total_duration = self.task_duration_sum_ms.load(Ordering::SeqCst);
        let min_duration = self.task_min_duration_ms.load(Ordering::SeqCst);
        let max_duration = self.task_max_duration_ms.load(Ordering::SeqCst);
        let total_success = self.tasks_success.load(Ordering::SeqCst);

        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            uptime_secs: self.uptime().as_secs(),
            tasks: TaskMetrics {
                total: total_tasks,
                success: total_success,
                failed: self.tasks_failed.load(Ordering::SeqCst),
                success_rate: if total_tasks > 0 {
                    total_success as f64 / total_tasks as f64 * 100.0
                } else {
                    0.0
                },
            },
            performance: PerformanceMetrics {
                total_duration_ms: total_duration,
                avg_task_duration_ms: if total_tasks > 0 {
                    total_duration as f64 / total_tasks as f64
                } else {
                    0.0
                },
                min_task_duration_ms: if min_duration == u64::MAX {
                    0
                } else {
                    min_duration
                },
                max_task_duration_ms: max_duration,
            },
            by_task: self.by_task.lock().map(|g| g.clone()).unwrap_or_default(),
            by_endpoint: self
                .by_endpoint
                .lock()
                .map(|g| g.clone())
                .unwrap_or_default(),
            errors: self.errors.lock().map(|g| g.clone()).unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> String {
        let snapshot = self.snapshot();
        serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn to_compact_json(&self) -> String {
        let snapshot = self.snapshot();
        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    pub async fn export_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = self.to_json();
        tokio::fs::write(path, json).await
    }

    pub fn tasks_total(&self) -> u64 {
        self.tasks_total.load(Ordering::SeqCst)
    }

    pub fn tasks_success(&self) -> u64 {
        self.tasks_success.load(Ordering::SeqCst)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector() {
        let metrics = MetricsCollector::default();

        metrics.record_task("transfer", Duration::from_millis(100), true);
        metrics.record_task("transfer", Duration::from_millis(200), true);
        metrics.record_task("burst", Duration::from_millis(150), false);

        assert_eq!(metrics.tasks_total(), 3);
        assert_eq!(metrics.tasks_success(), 2);
        assert_eq!(metrics.tasks_failed(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks.total, 3);
        assert!((snapshot.tasks.success_rate - 66.67).abs() < 0.1);
        assert_eq!(snapshot.performance.min_task_duration_ms, 100);
        assert_eq!(snapshot.performance.max_task_duration_ms, 200);
        assert_eq!(
            snapshot.by_task.get("transfer"),
            Some(&Breakdown {
                success: 2,
                failed: 0
            })
        );
        assert_eq!(snapshot.by_task["burst"].failed, 1);
    }

    #[test]
    fn test_endpoint_and_error_breakdown() {
        let metrics = MetricsCollector::default();
        metrics.record_endpoint("ep-0", true);
        metrics.record_endpoint("ep-0", false);
        metrics.record_error("timeout");
        metrics.record_error("timeout");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.by_endpoint["ep-0"].success, 1);
        assert_eq!(snapshot.by_endpoint["ep-0"].failed, 1);
        assert_eq!(snapshot.errors["timeout"], 2);
    }

    #[test]
    fn test_json_export() {
        let metrics = MetricsCollector::default();
        metrics.record_task("test", Duration::from_millis(100), true);

        let json = metrics.to_json();
        assert!(json.contains("tasks"));
        assert!(json.contains("performance"));
        assert!(json.contains("by_task"));
    }
}
