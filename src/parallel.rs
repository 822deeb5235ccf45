//! Parallel Coordinator: runs several flows concurrently and reports
//! aggregate success (SPEC_FULL §4.7).

use crate::dispatcher::{OperationDispatcher, ParallelRunner};
use crate::error::DispatchError;
use crate::error_handler::ErrorHandlerRegistry;
use crate::flow_executor::{self, FlowExecutorContext};
use crate::model::Flow;
use crate::output::OutputBus;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Shared state a [`ParallelCoordinator`] needs to hand each concurrent flow
/// its own [`FlowExecutorContext`].
pub struct ParallelCoordinator {
    dispatcher: Arc<OperationDispatcher>,
    tracker: Arc<crate::progress::ProgressTracker>,
    registry: Arc<ErrorHandlerRegistry>,
    optional_flows: Arc<HashMap<String, Flow>>,
    output: Arc<OutputBus>,
}

impl ParallelCoordinator {
    pub fn new(
        dispatcher: Arc<OperationDispatcher>,
        tracker: Arc<crate::progress::ProgressTracker>,
        registry: Arc<ErrorHandlerRegistry>,
        optional_flows: Arc<HashMap<String, Flow>>,
        output: Arc<OutputBus>,
    ) -> Self {
        ParallelCoordinator { dispatcher, tracker, registry, optional_flows, output }
    }

    /// Runs `flows` concurrently, one tracker entry per flow name, and
    /// returns whether every one succeeded. Never clears existing tracker
    /// state — see SPEC_FULL §4.7.1 (this is also reached mid-flow via the
    /// `run_flows_in_parallel` dispatch sentinel, where clearing would
    /// destroy the calling flow's own record).
    pub async fn run(&self, flows: Vec<Flow>) -> bool {
        let mut join_set: JoinSet<bool> = JoinSet::new();
        let mut flow_names: HashMap<tokio::task::Id, String> = HashMap::new();

        for flow in flows {
            self.tracker.add_flow(&flow.name, flow.elements.len() as u32, None, None);
            let flow_name = flow.name.clone();

            let dispatcher = Arc::clone(&self.dispatcher);
            let tracker = Arc::clone(&self.tracker);
            let registry = Arc::clone(&self.registry);
            let optional_flows = Arc::clone(&self.optional_flows);
            let output = Arc::clone(&self.output);

            let abort_handle = join_set.spawn(async move {
                let ctx = FlowExecutorContext {
                    dispatcher,
                    tracker: &tracker,
                    registry: &registry,
                    optional_flows: &optional_flows,
                    output: output.as_ref(),
                };
                let flow_name = flow.name.clone();
                let ok = flow_executor::execute(&flow, &flow_name, &ctx).await;
                if !ok {
                    tracing::warn!(flow = %flow_name, "flow failed during parallel run");
                }
                ok
            });
            flow_names.insert(abort_handle.id(), flow_name);
        }

        let mut all_ok = true;
        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((_, ok)) => all_ok &= ok,
                Err(panic) => {
                    let flow_name = flow_names.get(&panic.id()).cloned().unwrap_or_else(|| "unknown".to_string());
                    tracing::error!(flow = %flow_name, error = %panic, "flow execution task panicked during parallel run");
                    self.tracker.set_flow_error(&flow_name, panic.to_string()).ok();
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    /// Groups consecutive `Nested(Flow)` elements from a driver's top-level
    /// element list into batches, so that three adjacent independent flows
    /// run under one `run()` call rather than sequentially (SPEC_FULL §4.7).
    /// A `Step` or `Parallel` element breaks the current batch: it has no
    /// independent flow to join, so it must run in its own turn.
    pub fn batch_independent_flows(elements: &[crate::model::FlowElement]) -> Vec<Vec<Flow>> {
        let mut batches = Vec::new();
        let mut current = Vec::new();
        for element in elements {
            match element {
                crate::model::FlowElement::Nested(flow) => current.push(flow.clone()),
                _ => {
                    if !current.is_empty() {
                        batches.push(std::mem::take(&mut current));
                    }
                }
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

#[async_trait]
impl ParallelRunner for ParallelCoordinator {
    async fn run_in_parallel(&self, flows: Vec<Flow>) -> bool {
        self.run(flows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DeviceOpProvider, DeviceProviderFactory};
    use crate::model::{DeviceType, FlowElement, Step};
    use crate::progress::ProgressTracker;
    use async_trait::async_trait as async_trait_attr;
    use serde_json::{Map, Value};

    struct AlwaysOk;

    #[async_trait_attr]
    impl DeviceOpProvider for AlwaysOk {
        async fn invoke(&self, _operation: &str, _parameters: &Map<String, Value>) -> Result<bool, DispatchError> {
            Ok(true)
        }
    }

    struct AlwaysOkFactory;

    #[async_trait_attr]
    impl DeviceProviderFactory for AlwaysOkFactory {
        async fn create(&self, _device_id: &str) -> Result<Arc<dyn DeviceOpProvider>, DispatchError> {
            Ok(Arc::new(AlwaysOk))
        }
    }

    fn step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            operation: "noop".to_string(),
            device_type: DeviceType::Compute,
            device_id: "node-1".to_string(),
            tag: None,
            step_index: None,
            retry_count: 0,
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
    async fn all_flows_succeed_reports_true() {
        let mut factories: HashMap<DeviceType, Arc<dyn DeviceProviderFactory>> = HashMap::new();
        factories.insert(DeviceType::Compute, Arc::new(AlwaysOkFactory));
        let dispatcher = Arc::new(OperationDispatcher::new(factories));
        let tracker = Arc::new(ProgressTracker::new(None));
        let registry = Arc::new(ErrorHandlerRegistry::new());
        let optional_flows = Arc::new(HashMap::new());
        let output = Arc::new(OutputBus::new());
        let coordinator = ParallelCoordinator::new(dispatcher, tracker.clone(), registry, optional_flows, output);

        let flows = vec![
            Flow::new("tray-a", vec![FlowElement::Step(step("power-on"))]),
            Flow::new("tray-b", vec![FlowElement::Step(step("power-on"))]),
        ];

        let ok = coordinator.run(flows).await;
        assert!(ok);
        assert!(tracker.snapshot("tray-a").is_some());
        assert!(tracker.snapshot("tray-b").is_some());
    }

    #[tokio::test]
    async fn consecutive_nested_flows_batch_together() {
        let elements = vec![
            FlowElement::Step(step("setup")),
            FlowElement::Nested(Flow::new("a", Vec::new())),
            FlowElement::Nested(Flow::new("b", Vec::new())),
            FlowElement::Step(step("teardown")),
            FlowElement::Nested(Flow::new("c", Vec::new())),
        ];
        let batches = ParallelCoordinator::batch_independent_flows(&elements);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }
}
