//! Thread-safe metrics collection
//!
//! Atomic counters for run and task lifecycle events plus mutex-protected
//! per-stage execution statistics. Exposed through the health server's
//! `/metrics` route and the `status` CLI command.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Samples kept per series before the oldest are dropped
const MAX_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Run lifecycle
    runs_submitted: AtomicU64,
    runs_completed: AtomicU64,
    runs_completed_with_warnings: AtomicU64,
    runs_aborted: AtomicU64,

    // Task lifecycle (atomic for high frequency)
    tasks_enqueued: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_permanently_failed: AtomicU64,
    replays_skipped: AtomicU64,
    spawn_failures: AtomicU64,
    artifacts_written: AtomicU64,
    audit_events_dropped: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    last_task_finished: AtomicU64,

    execution_times: Mutex<Vec<u64>>,
    stage_stats: Mutex<HashMap<String, StageExecutionStats>>,

    started_at: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            runs_submitted: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_completed_with_warnings: AtomicU64::new(0),
            runs_aborted: AtomicU64::new(0),
            tasks_enqueued: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
            tasks_succeeded: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_permanently_failed: AtomicU64::new(0),
            replays_skipped: AtomicU64::new(0),
            spawn_failures: AtomicU64::new(0),
            artifacts_written: AtomicU64::new(0),
            audit_events_dropped: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
            last_task_finished: AtomicU64::new(0),
            execution_times: Mutex::new(Vec::new()),
            stage_stats: Mutex::new(HashMap::new()),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Run lifecycle
    pub fn run_submitted(&self) {
        self.runs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_completed(&self, with_warnings: bool) {
        if with_warnings {
            self.runs_completed_with_warnings
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn run_aborted(&self) {
        self.runs_aborted.fetch_add(1, Ordering::Relaxed);
    }

    // Task lifecycle
    pub fn task_enqueued(&self) {
        self.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replay_skipped(&self) {
        self.replays_skipped.fetch_add(1, Ordering::Relaxed);
        self.mark_task_finished();
    }

    pub fn spawn_failed(&self) {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn artifact_written(&self) {
        self.artifacts_written.fetch_add(1, Ordering::Relaxed);
    }

    /// An audit event that could not be appended
    pub fn audit_event_dropped(&self) {
        self.audit_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// An agent started executing; tracks the high-water mark of concurrency
    pub fn execution_started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight.fetch_max(now, Ordering::Relaxed);
    }

    /// An agent finished executing, whatever the outcome
    pub fn execution_finished(&self, stage: &str, duration: Duration, outcome: ExecutionOutcome) {
        // Saturating: a reset() between start and finish must not wrap the gauge
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });

        match outcome {
            ExecutionOutcome::Succeeded => {
                self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            ExecutionOutcome::PermanentlyFailed => {
                self.tasks_permanently_failed
                    .fetch_add(1, Ordering::Relaxed);
            }
            ExecutionOutcome::Retried | ExecutionOutcome::TimedOut => {}
        }
        self.mark_task_finished();

        let millis = duration.as_millis() as u64;
        if let Ok(mut times) = self.execution_times.lock() {
            push_sample(&mut times, millis);
        }
        if let Ok(mut stats) = self.stage_stats.lock() {
            stats
                .entry(stage.to_string())
                .or_default()
                .record(millis, outcome);
        }
    }

    fn mark_task_finished(&self) {
        self.last_task_finished
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Unix seconds of the last task that reached an outcome, 0 if none yet
    pub fn last_task_finished(&self) -> u64 {
        self.last_task_finished.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        current_timestamp().saturating_sub(self.started_at.load(Ordering::Relaxed))
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.runs_submitted,
            &self.runs_completed,
            &self.runs_completed_with_warnings,
            &self.runs_aborted,
            &self.tasks_enqueued,
            &self.tasks_dispatched,
            &self.tasks_succeeded,
            &self.tasks_retried,
            &self.tasks_permanently_failed,
            &self.replays_skipped,
            &self.spawn_failures,
            &self.artifacts_written,
            &self.audit_events_dropped,
            &self.in_flight,
            &self.max_in_flight,
            &self.last_task_finished,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.started_at
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.execution_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.stage_stats.lock() {
            stats.clear();
        }
    }

    fn execution_time_statistics(&self) -> (f64, f64, f64, f64) {
        match self.execution_times.lock() {
            Ok(times) if !times.is_empty() => {
                let mut sorted = times.clone();
                sorted.sort_unstable();
                let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
                (
                    avg,
                    percentile(&sorted, 50.0),
                    percentile(&sorted, 95.0),
                    percentile(&sorted, 99.0),
                )
            }
            _ => (0.0, 0.0, 0.0, 0.0),
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let (avg, p50, p95, p99) = self.execution_time_statistics();
        let stages = self
            .stage_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(name, s)| (name.clone(), s.snapshot(name)))
                    .collect()
            })
            .unwrap_or_default();

        MetricsSnapshot {
            timestamp: current_timestamp(),
            uptime_seconds: self.uptime_seconds(),
            runs: RunMetrics {
                submitted: self.runs_submitted.load(Ordering::Relaxed),
                completed: self.runs_completed.load(Ordering::Relaxed),
                completed_with_warnings: self
                    .runs_completed_with_warnings
                    .load(Ordering::Relaxed),
                aborted: self.runs_aborted.load(Ordering::Relaxed),
            },
            tasks: TaskMetrics {
                enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
                dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
                succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
                retried: self.tasks_retried.load(Ordering::Relaxed),
                permanently_failed: self.tasks_permanently_failed.load(Ordering::Relaxed),
                replays_skipped: self.replays_skipped.load(Ordering::Relaxed),
                spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
                artifacts_written: self.artifacts_written.load(Ordering::Relaxed),
                audit_events_dropped: self.audit_events_dropped.load(Ordering::Relaxed),
                in_flight: self.in_flight.load(Ordering::Relaxed),
                max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
                avg_execution_time_ms: avg,
                p50_execution_time_ms: p50,
                p95_execution_time_ms: p95,
                p99_execution_time_ms: p99,
            },
            stages,
        }
    }
}

/// How one agent execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Retried,
    TimedOut,
    PermanentlyFailed,
}

#[derive(Debug, Default)]
struct StageExecutionStats {
    executions: u64,
    failures: u64,
    timeouts: u64,
    execution_times: Vec<u64>,
}

impl StageExecutionStats {
    fn record(&mut self, millis: u64, outcome: ExecutionOutcome) {
        self.executions += 1;
        match outcome {
            ExecutionOutcome::Succeeded => {}
            ExecutionOutcome::TimedOut => {
                self.timeouts += 1;
                self.failures += 1;
            }
            ExecutionOutcome::Retried | ExecutionOutcome::PermanentlyFailed => {
                self.failures += 1;
            }
        }
        push_sample(&mut self.execution_times, millis);
    }

    fn snapshot(&self, name: &str) -> StageStatsSnapshot {
        let avg = if self.execution_times.is_empty() {
            0.0
        } else {
            self.execution_times.iter().sum::<u64>() as f64 / self.execution_times.len() as f64
        };
        let success_rate = if self.executions == 0 {
            0.0
        } else {
            (self.executions - self.failures) as f64 / self.executions as f64
        };
        StageStatsSnapshot {
            stage: name.to_string(),
            executions: self.executions,
            failures: self.failures,
            timeouts: self.timeouts,
            success_rate,
            avg_execution_time_ms: avg,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub runs: RunMetrics,
    pub tasks: TaskMetrics,
    pub stages: HashMap<String, StageStatsSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub completed_with_warnings: u64,
    pub aborted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub enqueued: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub permanently_failed: u64,
    pub replays_skipped: u64,
    pub spawn_failures: u64,
    pub artifacts_written: u64,
    pub audit_events_dropped: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
    pub avg_execution_time_ms: f64,
    pub p50_execution_time_ms: f64,
    pub p95_execution_time_ms: f64,
    pub p99_execution_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageStatsSnapshot {
    pub stage: String,
    pub executions: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub success_rate: f64,
    pub avg_execution_time_ms: f64,
}

fn push_sample(samples: &mut Vec<u64>, value: u64) {
    samples.push(value);
    if samples.len() > MAX_SAMPLES {
        samples.remove(0);
    }
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_run_metrics() {
        let collector = MetricsCollector::new();
        collector.run_submitted();
        collector.run_submitted();
        collector.run_completed(false);
        collector.run_completed(true);
        collector.run_aborted();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.runs.submitted, 2);
        assert_eq!(snapshot.runs.completed, 1);
        assert_eq!(snapshot.runs.completed_with_warnings, 1);
        assert_eq!(snapshot.runs.aborted, 1);
    }

    #[test]
    fn test_execution_tracking() {
        let collector = MetricsCollector::new();
        collector.execution_started();
        collector.execution_started();
        assert_eq!(collector.get_metrics().tasks.in_flight, 2);

        collector.execution_finished(
            "analyse",
            Duration::from_millis(1500),
            ExecutionOutcome::Succeeded,
        );
        collector.execution_finished(
            "analyse",
            Duration::from_millis(500),
            ExecutionOutcome::TimedOut,
        );

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.tasks.in_flight, 0);
        assert_eq!(snapshot.tasks.max_in_flight, 2);
        assert_eq!(snapshot.tasks.succeeded, 1);
        assert!(snapshot.tasks.avg_execution_time_ms > 900.0);

        let stage = &snapshot.stages["analyse"];
        assert_eq!(stage.executions, 2);
        assert_eq!(stage.timeouts, 1);
        assert_eq!(stage.success_rate, 0.5);
        assert!(collector.last_task_finished() > 0);
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let collector = MetricsCollector::new();
        collector.execution_finished("plan", Duration::ZERO, ExecutionOutcome::Retried);
        assert_eq!(collector.get_metrics().tasks.in_flight, 0);
    }

    #[test]
    fn test_percentile() {
        let data = [10, 20, 30, 40, 50];
        assert_eq!(percentile(&data, 50.0), 30.0);
        assert_eq!(percentile(&data, 0.0), 10.0);
        assert_eq!(percentile(&data, 100.0), 50.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert!((percentile(&[0, 100], 95.0) - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_samples_are_bounded() {
        let collector = MetricsCollector::new();
        for _ in 0..(MAX_SAMPLES + 50) {
            collector.execution_finished("plan", Duration::from_millis(1), ExecutionOutcome::Succeeded);
        }
        assert_eq!(collector.execution_times.lock().unwrap().len(), MAX_SAMPLES);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.task_enqueued();
        collector.spawn_failed();
        collector.audit_event_dropped();
        collector.execution_finished("plan", Duration::from_millis(5), ExecutionOutcome::Succeeded);
        collector.reset();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.tasks.enqueued, 0);
        assert_eq!(snapshot.tasks.spawn_failures, 0);
        assert_eq!(snapshot.tasks.audit_events_dropped, 0);
        assert!(snapshot.stages.is_empty());
    }

    #[test]
    fn test_concurrent_counters() {
        let collector = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        c.task_dispatched();
                        c.artifact_written();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.tasks.dispatched, 800);
        assert_eq!(snapshot.tasks.artifacts_written, 800);
    }
}
