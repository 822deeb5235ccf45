//! Progress Tracker: thread-safe execution record with hierarchical
//! optional-flow nesting and atomic JSON persistence (SPEC_FULL §4.6/§6).

use crate::error::TrackerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Jumped,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JumpTaken {
    None,
    Success,
    Failure,
}

/// The persistent record of one step's execution attempt-set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StepExecution {
    pub execution_id: Uuid,
    pub step_name: String,
    pub step_index: Option<usize>,

    #[serde(skip, default = "Instant::now")]
    started_at_instant: Instant,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,

    pub status: StepStatus,
    pub final_result: bool,

    pub retry_attempts: u32,
    pub retry_durations: Vec<f64>,

    pub jump_taken: JumpTaken,
    pub jump_target: Option<String>,

    pub optional_flows_triggered: Vec<String>,
    pub optional_flow_results: HashMap<String, bool>,

    pub error_messages: Vec<String>,
    pub error_handler_name: Option<String>,
    pub error_handler_result: Option<bool>,

    pub parameters: Map<String, serde_json::Value>,
}

impl StepExecution {
    pub fn new(step_name: impl Into<String>, step_index: Option<usize>, parameters: Map<String, serde_json::Value>) -> Self {
        StepExecution {
            execution_id: Uuid::new_v4(),
            step_name: step_name.into(),
            step_index,
            started_at_instant: Instant::now(),
            started_at: Utc::now(),
            completed_at: None,
            duration: None,
            status: StepStatus::Running,
            final_result: false,
            retry_attempts: 0,
            retry_durations: Vec::new(),
            jump_taken: JumpTaken::None,
            jump_target: None,
            optional_flows_triggered: Vec::new(),
            optional_flow_results: HashMap::new(),
            error_messages: Vec::new(),
            error_handler_name: None,
            error_handler_result: None,
            parameters,
        }
    }

    pub fn add_retry(&mut self, duration: Duration) {
        self.retry_attempts += 1;
        self.retry_durations.push(duration.as_secs_f64());
    }

    pub fn complete(&mut self, final_result: bool, error_messages: Vec<String>) {
        self.final_result = final_result;
        self.status = if final_result { StepStatus::Completed } else { StepStatus::Failed };
        self.completed_at = Some(Utc::now());
        self.duration = Some(self.started_at_instant.elapsed().as_secs_f64());
        self.error_messages = error_messages;
    }
}

/// The aggregate record of one flow's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FlowInfo {
    pub flow_name: String,
    pub is_optional_flow: bool,
    pub parent_flow_name: Option<String>,
    #[serde(rename = "caller")]
    pub triggered_by_step: Option<String>,

    pub status: FlowStatus,
    pub current_step: String,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub current_step_index: usize,

    #[serde(skip, default = "Instant::now")]
    started_at_instant: Instant,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_testtime: f64,
    pub total_optional_flow_testtime: f64,
    pub total_non_optional_flow_testtime: f64,

    pub retries_executed: u32,
    pub jump_on_success_executed: u32,
    pub jump_on_failure_executed: u32,
    pub total_step_duration: f64,
    pub total_retry_attempts: u32,
    pub total_optional_flows_triggered: u32,
    pub total_jumps_taken: u32,
    pub failed_steps_count: u32,
    pub average_step_duration: f64,
    pub longest_step_duration: f64,
    pub step_with_most_retries: String,

    pub error_messages: Vec<String>,
    pub steps_executed: Vec<StepExecution>,
    pub optional_flows: HashMap<String, FlowInfo>,
}

impl FlowInfo {
    pub fn new(
        flow_name: impl Into<String>,
        total_steps: u32,
        parent_flow_name: Option<String>,
        triggered_by_step: Option<String>,
    ) -> Self {
        let is_optional_flow = parent_flow_name.is_some();
        FlowInfo {
            flow_name: flow_name.into(),
            is_optional_flow,
            parent_flow_name,
            triggered_by_step,
            status: FlowStatus::Pending,
            current_step: String::new(),
            completed_steps: 0,
            total_steps,
            current_step_index: 0,
            started_at_instant: Instant::now(),
            started_at: Utc::now(),
            completed_at: None,
            total_testtime: 0.0,
            total_optional_flow_testtime: 0.0,
            total_non_optional_flow_testtime: 0.0,
            retries_executed: 0,
            jump_on_success_executed: 0,
            jump_on_failure_executed: 0,
            total_step_duration: 0.0,
            total_retry_attempts: 0,
            total_optional_flows_triggered: 0,
            total_jumps_taken: 0,
            failed_steps_count: 0,
            average_step_duration: 0.0,
            longest_step_duration: 0.0,
            step_with_most_retries: String::new(),
            error_messages: Vec::new(),
            steps_executed: Vec::new(),
            optional_flows: HashMap::new(),
        }
    }

    /// Appends a completed [`StepExecution`] and recomputes every derived
    /// counter from scratch (SPEC_FULL invariant 7: counters are pure
    /// functions of `steps_executed`, never written independently).
    pub fn append_step(&mut self, execution: StepExecution) {
        self.completed_steps += 1;
        self.current_step_index = execution.step_index.map(|i| i + 1).unwrap_or(self.current_step_index);
        self.steps_executed.push(execution);
        self.recompute_counters();
    }

    fn recompute_counters(&mut self) {
        let steps = &self.steps_executed;
        self.retries_executed = steps.iter().filter(|s| s.retry_attempts > 0).count() as u32;
        self.jump_on_success_executed = steps.iter().filter(|s| s.jump_taken == JumpTaken::Success).count() as u32;
        self.jump_on_failure_executed = steps.iter().filter(|s| s.jump_taken == JumpTaken::Failure).count() as u32;
        self.total_step_duration = steps.iter().filter_map(|s| s.duration).sum();
        self.total_retry_attempts = steps.iter().map(|s| s.retry_attempts).sum();
        self.total_optional_flows_triggered =
            steps.iter().map(|s| s.optional_flows_triggered.len() as u32).sum();
        self.total_jumps_taken = self.jump_on_success_executed + self.jump_on_failure_executed;
        self.failed_steps_count = steps.iter().filter(|s| !s.final_result).count() as u32;
        self.average_step_duration = if steps.is_empty() {
            0.0
        } else {
            self.total_step_duration / steps.len() as f64
        };
        self.longest_step_duration = steps.iter().filter_map(|s| s.duration).fold(0.0, f64::max);
        self.step_with_most_retries = steps
            .iter()
            .max_by_key(|s| s.retry_attempts)
            .filter(|s| s.retry_attempts > 0)
            .map(|s| s.step_name.clone())
            .unwrap_or_default();

        self.total_optional_flow_testtime = self.optional_flows.values().map(|f| f.total_testtime).sum();
        self.total_non_optional_flow_testtime =
            (self.total_testtime - self.total_optional_flow_testtime).max(0.0);
    }

    pub fn set_running(&mut self) {
        if self.status == FlowStatus::Pending {
            self.status = FlowStatus::Running;
        }
    }

    pub fn set_completed(&mut self) {
        self.status = FlowStatus::Completed;
        self.finish_timing();
    }

    pub fn set_failed(&mut self, error_messages: Vec<String>, current_step: String) {
        self.status = FlowStatus::Failed;
        self.error_messages = error_messages;
        self.current_step = current_step;
        self.finish_timing();
    }

    pub fn set_current_step(&mut self, description: String) {
        self.current_step = description;
    }

    pub fn set_error(&mut self, message: String) {
        self.status = FlowStatus::Error;
        self.completed_steps = 0;
        self.error_messages = vec![message];
        self.finish_timing();
    }

    fn finish_timing(&mut self) {
        self.completed_at = Some(Utc::now());
        self.total_testtime = self.started_at_instant.elapsed().as_secs_f64();
        self.recompute_counters();
    }
}

struct TrackerState {
    flows: HashMap<String, FlowInfo>,
    output_path: Option<PathBuf>,
}

/// The tracker's single shared state behind one mutex (SPEC_FULL §4.6/§5.1).
/// No tracker method calls another while already holding the lock, so a
/// plain non-reentrant `Mutex` gives the spec's "reentrant mutex" semantics
/// without ever exercising true reentrancy.
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(output_path: Option<PathBuf>) -> Self {
        ProgressTracker {
            state: Mutex::new(TrackerState {
                flows: HashMap::new(),
                output_path,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let result = f(&mut guard);
        self.persist(&guard);
        result
    }

    pub fn add_flow(
        &self,
        name: &str,
        total_steps: u32,
        parent: Option<&str>,
        triggered_by: Option<&str>,
    ) {
        self.with_state(|state| {
            let info = FlowInfo::new(
                name,
                total_steps,
                parent.map(str::to_string),
                triggered_by.map(str::to_string),
            );
            if let Some(parent_name) = parent {
                if let Some(parent_info) = state.flows.get_mut(parent_name) {
                    parent_info.optional_flows.insert(name.to_string(), info);
                    return;
                }
            }
            state.flows.insert(name.to_string(), info);
        });
    }

    fn find_flow_mut<'a>(flows: &'a mut HashMap<String, FlowInfo>, name: &str) -> Option<&'a mut FlowInfo> {
        if let Some(found) = flows.get_mut(name) {
            return Some(found);
        }
        for flow in flows.values_mut() {
            if let Some(found) = Self::find_flow_mut(&mut flow.optional_flows, name) {
                return Some(found);
            }
        }
        None
    }

    pub fn set_flow_running(&self, name: &str) -> Result<(), TrackerError> {
        self.mutate_flow(name, |flow| flow.set_running())
    }

    pub fn set_flow_completed(&self, name: &str) -> Result<(), TrackerError> {
        self.mutate_flow(name, |flow| flow.set_completed())
    }

    pub fn set_flow_failed(&self, name: &str, error_messages: Vec<String>, current_step: String) -> Result<(), TrackerError> {
        self.mutate_flow(name, move |flow| flow.set_failed(error_messages, current_step))
    }

    pub fn set_flow_error(&self, name: &str, message: String) -> Result<(), TrackerError> {
        self.mutate_flow(name, move |flow| flow.set_error(message))
    }

    pub fn append_step(&self, flow_name: &str, execution: StepExecution) -> Result<(), TrackerError> {
        self.mutate_flow(flow_name, move |flow| flow.append_step(execution))
    }

    pub fn set_current_step(&self, flow_name: &str, description: String) -> Result<(), TrackerError> {
        self.mutate_flow(flow_name, move |flow| flow.set_current_step(description))
    }

    fn mutate_flow(&self, name: &str, f: impl FnOnce(&mut FlowInfo)) -> Result<(), TrackerError> {
        self.with_state(|state| {
            let flow = Self::find_flow_mut(&mut state.flows, name)
                .ok_or_else(|| TrackerError::UnknownFlow(name.to_string()))?;
            f(flow);
            Ok(())
        })
    }

    /// Returns a deep snapshot of a flow for inspection (tests, the Output
    /// Event Bus's json-snapshot presenter).
    pub fn snapshot(&self, name: &str) -> Option<FlowInfo> {
        let guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.flows.get(name).cloned()
    }

    fn persist(&self, state: &TrackerState) {
        let Some(path) = &state.output_path else { return };
        if let Err(err) = write_progress_file(path, &state.flows) {
            tracing::warn!(error = %err, "failed to persist progress file; in-memory state remains authoritative");
        }
    }
}

#[derive(Serialize)]
struct ProgressFile<'a> {
    timestamp: DateTime<Utc>,
    flows: &'a HashMap<String, FlowInfo>,
}

fn write_progress_file(path: &Path, flows: &HashMap<String, FlowInfo>) -> Result<(), TrackerError> {
    let document = ProgressFile {
        timestamp: Utc::now(),
        flows,
    };
    let json = serde_json::to_vec_pretty(&document).map_err(|e| TrackerError::PersistFailed {
        path: path.display().to_string(),
        details: e.to_string(),
    })?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json).map_err(|e| TrackerError::PersistFailed {
        path: path.display().to_string(),
        details: e.to_string(),
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| TrackerError::PersistFailed {
        path: path.display().to_string(),
        details: e.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn completed_step(name: &str, final_result: bool, retry_attempts: u32) -> StepExecution {
        let mut execution = StepExecution::new(name, None, Map::new());
        for _ in 0..retry_attempts {
            execution.add_retry(Duration::from_millis(1));
        }
        execution.complete(final_result, Vec::new());
        execution
    }

    #[test]
    fn append_step_recomputes_counters() {
        let tracker = ProgressTracker::new(None);
        tracker.add_flow("main", 2, None, None);
        tracker.append_step("main", completed_step("a", true, 0)).unwrap();
        tracker.append_step("main", completed_step("b", false, 2)).unwrap();

        let snapshot = tracker.snapshot("main").unwrap();
        assert_eq!(snapshot.failed_steps_count, 1);
        assert_eq!(snapshot.total_retry_attempts, 2);
        assert_eq!(snapshot.step_with_most_retries, "b");
    }

    #[test]
    fn set_error_resets_completed_steps() {
        let tracker = ProgressTracker::new(None);
        tracker.add_flow("main", 2, None, None);
        tracker.append_step("main", completed_step("a", true, 0)).unwrap();
        tracker.set_flow_error("main", "boom".to_string()).unwrap();

        let snapshot = tracker.snapshot("main").unwrap();
        assert_eq!(snapshot.completed_steps, 0);
        assert_eq!(snapshot.status, FlowStatus::Error);
    }

    #[test]
    fn optional_flow_nests_under_parent() {
        let tracker = ProgressTracker::new(None);
        tracker.add_flow("main", 1, None, None);
        tracker.add_flow("rec", 1, Some("main"), Some("A"));
        tracker.append_step("rec", completed_step("r", true, 0)).unwrap();

        let snapshot = tracker.snapshot("main").unwrap();
        let child = snapshot.optional_flows.get("rec").unwrap();
        assert_eq!(child.triggered_by_step.as_deref(), Some("A"));
        assert_eq!(child.steps_executed.len(), 1);
    }

    #[test]
    fn set_running_is_idempotent_past_pending() {
        let tracker = ProgressTracker::new(None);
        tracker.add_flow("main", 1, None, None);
        tracker.set_flow_running("main").unwrap();
        tracker.set_flow_completed("main").unwrap();
        tracker.set_flow_running("main").unwrap();
        let snapshot = tracker.snapshot("main").unwrap();
        assert_eq!(snapshot.status, FlowStatus::Completed);
    }

    #[test]
    fn unknown_flow_mutation_errors() {
        let tracker = ProgressTracker::new(None);
        let err = tracker.set_flow_completed("nope").unwrap_err();
        assert!(matches!(err, TrackerError::UnknownFlow(_)));
    }

    #[test]
    fn concurrent_appends_are_serialized() {
        let tracker = std::sync::Arc::new(ProgressTracker::new(None));
        tracker.add_flow("main", 100, None, None);
        let mut handles = Vec::new();
        for i in 0..20 {
            let tracker = std::sync::Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                tracker
                    .append_step("main", completed_step(&format!("s{i}"), true, 0))
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = tracker.snapshot("main").unwrap();
        assert_eq!(snapshot.steps_executed.len(), 20);
    }
}
