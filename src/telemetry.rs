//! Per-request operation tracing and aggregate performance statistics.
//!
//! Each request owns a [`RequestTrace`] that collects one [`OperationRecord`] per pipeline
//! stage. Finalized traces are logged with a bottleneck summary and pushed into a bounded
//! ring buffer; the buffer backs the aggregate statistics endpoint. The buffer is the only
//! process-wide mutable state outside the resource registry and is guarded by a single
//! mutex.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Duration threshold in seconds above which a whole request is logged as slow.
const TOTAL_REQUEST_THRESHOLD: f64 = 30.0;
/// Completed traces kept for aggregate statistics.
const DEFAULT_TRACE_CAPACITY: usize = 100;

/// Per-stage duration thresholds in seconds used for bottleneck analysis.
fn threshold_for(operation: &str) -> f64 {
    match operation {
        "document_processing" => 10.0,
        "document_chunking" => 5.0,
        "vector_store_creation" => 15.0,
        "answer_generation" => 20.0,
        _ => 5.0,
    }
}

/// Telemetry for one pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    /// Stage name.
    pub name: String,
    /// Wall-clock duration in seconds.
    pub duration_secs: f64,
    /// Whether the stage completed without error.
    pub success: bool,
    /// Failure description, when the stage failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form stage annotations (counts, sizes).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// A bottleneck identified in one request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Bottleneck {
    /// The stage that consumed the largest share of the request.
    SlowestOperation {
        /// Stage name.
        operation: String,
        /// Stage duration in seconds.
        duration_secs: f64,
        /// Share of the total request duration, in percent.
        percentage_of_total: f64,
    },
    /// A stage that exceeded its own threshold.
    ThresholdExceeded {
        /// Stage name.
        operation: String,
        /// Stage duration in seconds.
        duration_secs: f64,
        /// Threshold the stage was expected to stay under.
        threshold_secs: f64,
        /// Seconds over the threshold.
        excess_secs: f64,
    },
}

/// Telemetry collected across one request.
#[derive(Debug)]
pub struct RequestTrace {
    /// Request identifier carried through logs.
    pub request_id: Uuid,
    started: Instant,
    /// Total request duration, set by [`RequestTrace::finish`].
    pub total_secs: Option<f64>,
    /// Per-stage records in execution order.
    pub operations: Vec<OperationRecord>,
}

impl RequestTrace {
    /// Start a trace for the given request id.
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            started: Instant::now(),
            total_secs: None,
            operations: Vec::new(),
        }
    }

    /// Record one completed stage.
    pub fn record(
        &mut self,
        name: &str,
        duration: Duration,
        success: bool,
        error: Option<String>,
    ) {
        self.record_with_metadata(name, duration, success, error, BTreeMap::new());
    }

    /// Record one completed stage with annotations.
    pub fn record_with_metadata(
        &mut self,
        name: &str,
        duration: Duration,
        success: bool,
        error: Option<String>,
        metadata: BTreeMap<String, String>,
    ) {
        let duration_secs = duration.as_secs_f64();
        if duration_secs > threshold_for(name) {
            tracing::warn!(
                operation = name,
                duration_secs,
                threshold = threshold_for(name),
                "Operation exceeded its threshold"
            );
        }
        self.operations.push(OperationRecord {
            name: name.to_string(),
            duration_secs,
            success,
            error,
            metadata,
        });
    }

    /// Close the trace, fixing the total duration.
    pub fn finish(&mut self) {
        self.total_secs = Some(self.started.elapsed().as_secs_f64());
    }

    /// Identify the slowest stage and any threshold violations.
    pub fn bottlenecks(&self) -> Vec<Bottleneck> {
        let mut found = Vec::new();
        if self.operations.is_empty() {
            return found;
        }

        if let Some(slowest) = self
            .operations
            .iter()
            .max_by(|a, b| a.duration_secs.total_cmp(&b.duration_secs))
            && slowest.duration_secs > 0.0
        {
            let total = self.total_secs.unwrap_or(0.0);
            let percentage = if total > 0.0 {
                (slowest.duration_secs / total) * 100.0
            } else {
                0.0
            };
            found.push(Bottleneck::SlowestOperation {
                operation: slowest.name.clone(),
                duration_secs: slowest.duration_secs,
                percentage_of_total: percentage,
            });
        }

        for operation in &self.operations {
            let threshold = threshold_for(&operation.name);
            if operation.duration_secs > threshold {
                found.push(Bottleneck::ThresholdExceeded {
                    operation: operation.name.clone(),
                    duration_secs: operation.duration_secs,
                    threshold_secs: threshold,
                    excess_secs: operation.duration_secs - threshold,
                });
            }
        }

        found
    }
}

/// Aggregate statistics over one operation name.
#[derive(Debug, Clone, Serialize, Default)]
pub struct OperationStats {
    /// Times the operation ran.
    pub count: usize,
    /// Times the operation failed.
    pub failures: usize,
    /// Mean duration in seconds.
    pub average_duration: f64,
    /// Fastest observed duration.
    pub min_duration: f64,
    /// Slowest observed duration.
    pub max_duration: f64,
    /// Median duration.
    pub p50: f64,
    /// 95th-percentile duration.
    pub p95: f64,
    /// 99th-percentile duration.
    pub p99: f64,
    /// Runs that exceeded the operation's threshold.
    pub threshold_violations: usize,
}

/// Aggregate statistics across the completed-trace ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    /// Requests currently represented in the buffer.
    pub total_requests: usize,
    /// Mean request duration in seconds.
    pub average_duration: f64,
    /// Fastest request duration.
    pub fastest_request: f64,
    /// Slowest request duration.
    pub slowest_request: f64,
    /// Per-operation aggregates keyed by stage name.
    pub operation_stats: BTreeMap<String, OperationStats>,
    /// Bottleneck instance counts keyed by `type:operation`.
    pub bottleneck_counts: BTreeMap<String, usize>,
}

/// Bounded buffer of completed request traces.
pub struct TraceStore {
    completed: Mutex<VecDeque<RequestTrace>>,
    capacity: usize,
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}

impl TraceStore {
    /// Create a store keeping at most `capacity` traces.
    pub fn new(capacity: usize) -> Self {
        Self {
            completed: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Close the trace, log its summary, and retire it into the buffer.
    pub fn finalize(&self, mut trace: RequestTrace) {
        trace.finish();
        let total = trace.total_secs.unwrap_or(0.0);

        let status = if total > TOTAL_REQUEST_THRESHOLD {
            "SLOW"
        } else if total > TOTAL_REQUEST_THRESHOLD * 0.7 {
            "ACCEPTABLE"
        } else {
            "FAST"
        };
        tracing::info!(
            request_id = %trace.request_id,
            total_secs = total,
            status,
            "Request completed"
        );

        for operation in &trace.operations {
            tracing::debug!(
                request_id = %trace.request_id,
                operation = %operation.name,
                duration_secs = operation.duration_secs,
                success = operation.success,
                error = operation.error.as_deref(),
                "Stage timing"
            );
        }

        for bottleneck in trace.bottlenecks() {
            match &bottleneck {
                Bottleneck::SlowestOperation {
                    operation,
                    duration_secs,
                    percentage_of_total,
                } => tracing::debug!(
                    request_id = %trace.request_id,
                    operation = %operation,
                    duration_secs = *duration_secs,
                    percentage_of_total = *percentage_of_total,
                    "Slowest stage"
                ),
                Bottleneck::ThresholdExceeded {
                    operation,
                    duration_secs,
                    threshold_secs,
                    excess_secs,
                } => tracing::warn!(
                    request_id = %trace.request_id,
                    operation = %operation,
                    duration_secs = *duration_secs,
                    threshold_secs = *threshold_secs,
                    excess_secs = *excess_secs,
                    "Stage exceeded threshold"
                ),
            }
        }

        let mut completed = self.completed.lock().expect("trace buffer lock poisoned");
        if completed.len() == self.capacity {
            completed.pop_front();
        }
        completed.push_back(trace);
    }

    /// Compute aggregate statistics over the buffered traces.
    pub fn stats(&self) -> PerformanceStats {
        let completed = self.completed.lock().expect("trace buffer lock poisoned");

        let durations: Vec<f64> = completed.iter().filter_map(|trace| trace.total_secs).collect();
        let mut operation_durations: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut operation_stats: BTreeMap<String, OperationStats> = BTreeMap::new();
        let mut bottleneck_counts: BTreeMap<String, usize> = BTreeMap::new();

        for trace in completed.iter() {
            for bottleneck in trace.bottlenecks() {
                let key = match &bottleneck {
                    Bottleneck::SlowestOperation { operation, .. } => {
                        format!("slowest_operation:{operation}")
                    }
                    Bottleneck::ThresholdExceeded { operation, .. } => {
                        format!("threshold_exceeded:{operation}")
                    }
                };
                *bottleneck_counts.entry(key).or_insert(0) += 1;
            }

            for operation in &trace.operations {
                let stats = operation_stats.entry(operation.name.clone()).or_default();
                stats.count += 1;
                if !operation.success {
                    stats.failures += 1;
                }
                if operation.duration_secs > threshold_for(&operation.name) {
                    stats.threshold_violations += 1;
                }
                operation_durations
                    .entry(operation.name.clone())
                    .or_default()
                    .push(operation.duration_secs);
            }
        }

        for (name, mut samples) in operation_durations {
            samples.sort_by(f64::total_cmp);
            if let Some(stats) = operation_stats.get_mut(&name) {
                let n = samples.len();
                stats.average_duration = samples.iter().sum::<f64>() / n as f64;
                stats.min_duration = samples[0];
                stats.max_duration = samples[n - 1];
                stats.p50 = samples[(n / 2).min(n - 1)];
                stats.p95 = samples[((n as f64 * 0.95) as usize).min(n - 1)];
                stats.p99 = samples[((n as f64 * 0.99) as usize).min(n - 1)];
            }
        }

        PerformanceStats {
            total_requests: completed.len(),
            average_duration: if durations.is_empty() {
                0.0
            } else {
                durations.iter().sum::<f64>() / durations.len() as f64
            },
            fastest_request: if durations.is_empty() {
                0.0
            } else {
                durations.iter().copied().fold(f64::INFINITY, f64::min)
            },
            slowest_request: durations.iter().copied().fold(0.0, f64::max),
            operation_stats,
            bottleneck_counts,
        }
    }
}
