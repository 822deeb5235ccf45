//! Step Executor: single-step retry loop with inter-retry wait, timing, and
//! per-step error-message collection (SPEC_FULL §4.2).

use crate::dispatcher::OperationDispatcher;
use crate::logging::StepErrorScope;
use crate::model::Step;
use crate::progress::StepExecution;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Drives one step's attempt loop to completion and returns the resulting
/// [`StepExecution`]. Never raises — every terminal failure is encoded in
/// `final_result`/`status` on the returned record (SPEC_FULL §7:
/// "Step Executor never raises to Flow Executor").
pub async fn execute(step: &Step, dispatcher: &OperationDispatcher) -> StepExecution {
    let mut execution = StepExecution::new(step.name.clone(), step.step_index, step.parameters.clone());

    let ((final_result, retry_durations, last_message), collected_errors) =
        StepErrorScope::run(run_attempts(step, dispatcher)).await;

    // retry_attempts counts attempts made before the terminal one, whether
    // that terminal attempt succeeded or exhausted the retry budget — so
    // `retry_durations.len()` is always `retry_attempts + 1` (I4).
    for duration in retry_durations.iter().take(retry_durations.len().saturating_sub(1)) {
        execution.add_retry(*duration);
    }
    if let Some(last) = retry_durations.last() {
        execution.retry_durations.push(last.as_secs_f64());
    }

    if final_result && step.wait_after_seconds > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(step.wait_after_seconds)).await;
    }

    let mut messages = collected_errors;
    if let Some(last) = last_message {
        if !messages.contains(&last) {
            messages.push(last);
        }
    }
    execution.complete(final_result, messages);
    execution
}

/// Runs the attempt loop itself, returning `(succeeded, per-attempt
/// durations, last failure message)`. Split out so the error-collection
/// scope in [`execute`] wraps exactly this work, matching SPEC_FULL §4.2
/// step 2's "installs on step start ... uninstalls on step end".
async fn run_attempts(step: &Step, dispatcher: &OperationDispatcher) -> (bool, Vec<Duration>, Option<String>) {
    let mut durations = Vec::new();
    let mut last_message = None;

    for attempt in 0..=step.retry_count {
        if attempt > 0 && step.wait_between_retries_seconds > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(step.wait_between_retries_seconds)).await;
        }

        let t0 = Instant::now();
        let outcome = match step.timeout_seconds {
            Some(secs) => match timeout(Duration::from_secs_f64(secs), dispatch_once(step, dispatcher)).await {
                Ok(result) => result,
                Err(_) => Err(format!("step '{}' timed out after {secs}s", step.name)),
            },
            None => dispatch_once(step, dispatcher).await,
        };
        durations.push(t0.elapsed());

        match outcome {
            Ok(true) => return (true, durations, None),
            Ok(false) => {
                last_message = Some(format!("operation '{}' returned failure", step.operation));
            }
            Err(message) => {
                tracing::error!(step = %step.name, error = %message, "step attempt failed");
                last_message = Some(message);
            }
        }
    }

    (false, durations, last_message)
}

async fn dispatch_once(step: &Step, dispatcher: &OperationDispatcher) -> Result<bool, String> {
    dispatcher
        .invoke(step.device_type, &step.device_id, &step.operation, &step.parameters)
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DeviceOpProvider;
    use crate::model::DeviceType;
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct ScriptedProvider {
        results: Vec<bool>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DeviceOpProvider for ScriptedProvider {
        async fn invoke(&self, _operation: &str, _parameters: &Map<String, Value>) -> Result<bool, crate::error::DispatchError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(*self.results.get(i).unwrap_or(self.results.last().unwrap()))
        }
    }

    struct FixedFactory(Arc<ScriptedProvider>);

    #[async_trait]
    impl crate::dispatcher::DeviceProviderFactory for FixedFactory {
        async fn create(&self, _device_id: &str) -> Result<Arc<dyn DeviceOpProvider>, crate::error::DispatchError> {
            Ok(self.0.clone())
        }
    }

    fn dispatcher_with(results: Vec<bool>) -> OperationDispatcher {
        let provider = Arc::new(ScriptedProvider { results, calls: AtomicU32::new(0) });
        let mut factories: HashMap<DeviceType, Arc<dyn crate::dispatcher::DeviceProviderFactory>> = HashMap::new();
        factories.insert(DeviceType::Compute, Arc::new(FixedFactory(provider)));
        OperationDispatcher::new(factories)
    }

    fn base_step(retry_count: u32) -> Step {
        Step {
            name: "flash".to_string(),
            operation: "flash_bios".to_string(),
            device_type: DeviceType::Compute,
            device_id: "node-1".to_string(),
            tag: None,
            step_index: Some(0),
            retry_count,
            timeout_seconds: None,
            wait_after_seconds: 0.0,
            wait_between_retries_seconds: 0.0,
            parameters: Map::new(),
            jump_on_success: None,
            jump_on_failure: None,
            execute_on_error: None,
            execute_optional_flow: None,
        }
    }

    #[tokio::test]
    async fn first_attempt_success_has_zero_retries() {
        let dispatcher = dispatcher_with(vec![true]);
        let step = base_step(3);
        let execution = execute(&step, &dispatcher).await;
        assert!(execution.final_result);
        assert_eq!(execution.retry_attempts, 0);
        assert_eq!(execution.retry_durations.len(), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let dispatcher = dispatcher_with(vec![false, false, true]);
        let step = base_step(2);
        let execution = execute(&step, &dispatcher).await;
        assert!(execution.final_result);
        assert_eq!(execution.retry_attempts, 2);
        assert_eq!(execution.retry_durations.len(), 3);
    }

    #[tokio::test]
    async fn exhausts_retries_and_fails() {
        let dispatcher = dispatcher_with(vec![false]);
        let step = base_step(1);
        let execution = execute(&step, &dispatcher).await;
        assert!(!execution.final_result);
        assert_eq!(execution.retry_attempts, 2);
        assert_eq!(execution.retry_durations.len(), 2);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let dispatcher = dispatcher_with(vec![false]);
        let step = base_step(0);
        let execution = execute(&step, &dispatcher).await;
        assert!(!execution.final_result);
        assert_eq!(execution.retry_durations.len(), 1);
    }
}
