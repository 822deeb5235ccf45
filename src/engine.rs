//! `WorkflowEngine`: the facade that wires the Loader, Operation Dispatcher,
//! Progress Tracker, Error-Handler Registry, Parallel Coordinator, and Output
//! Event Bus into one runnable unit (SPEC_FULL §2/§6).

use crate::dispatcher::{DeviceProviderFactory, OperationDispatcher};
use crate::error::LoadError;
use crate::error_handler::{ErrorHandlerRegistry, Handler, RegistryError};
use crate::flow_executor::{self, FlowExecutorContext};
use crate::loader;
use crate::model::{DeviceType, WorkflowDocument};
use crate::output::OutputBus;
use crate::parallel::ParallelCoordinator;
use crate::progress::ProgressTracker;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A loaded, runnable workflow document bound to its tracker/dispatcher/bus.
///
/// Built from a raw document with [`WorkflowEngine::builder`]; `run` drives
/// the main flow to completion and returns its aggregate success, the same
/// contract `RunInParallel` uses per-flow internally.
pub struct WorkflowEngine {
    dispatcher: Arc<OperationDispatcher>,
    tracker: Arc<ProgressTracker>,
    registry: Arc<ErrorHandlerRegistry>,
    output: Arc<OutputBus>,
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new()
    }

    /// Progress Tracker handle, for reading snapshots or wiring into a
    /// long-lived presenter outside of `run`.
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn output(&self) -> &Arc<OutputBus> {
        &self.output
    }

    /// Parses and validates `yaml_text` against this engine's registered
    /// error handlers (SPEC_FULL §4.1).
    pub fn load(&self, yaml_text: &str) -> Result<WorkflowDocument, LoadError> {
        loader::load_document(yaml_text, &self.registry)
    }

    /// Runs `document`'s main flow to completion, registering it with the
    /// Progress Tracker first. Wires a fresh [`ParallelCoordinator`] into the
    /// dispatcher scoped to this document's optional flows, so a
    /// `run_flows_in_parallel` step dispatched mid-run sees the same
    /// optional-flow registry as the main flow.
    pub async fn run(&self, document: &WorkflowDocument) -> bool {
        let optional_flows = Arc::new(document.optional_flows.clone());
        let coordinator = Arc::new(ParallelCoordinator::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.tracker),
            Arc::clone(&self.registry),
            Arc::clone(&optional_flows),
            Arc::clone(&self.output),
        ));
        self.dispatcher.set_parallel_runner(coordinator);

        let flow_name = document.main_flow.name.clone();
        self.tracker.add_flow(&flow_name, document.main_flow.elements.len() as u32, None, None);
        self.output.publish(crate::output::Event::FlowAdded { flow_name: flow_name.clone() });

        let ctx = FlowExecutorContext {
            dispatcher: Arc::clone(&self.dispatcher),
            tracker: &self.tracker,
            registry: &self.registry,
            optional_flows: &optional_flows,
            output: self.output.as_ref(),
        };
        flow_executor::execute(&document.main_flow, &flow_name, &ctx).await
    }
}

/// Fluent builder for [`WorkflowEngine`], following the same `add`/`build`
/// shape as this crate's teacher-era workflow builder.
pub struct WorkflowEngineBuilder {
    factories: HashMap<DeviceType, Arc<dyn DeviceProviderFactory>>,
    registry: ErrorHandlerRegistry,
    progress_file: Option<PathBuf>,
}

impl Default for WorkflowEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowEngineBuilder {
    pub fn new() -> Self {
        WorkflowEngineBuilder {
            factories: HashMap::new(),
            registry: ErrorHandlerRegistry::new(),
            progress_file: None,
        }
    }

    /// Registers the provider factory for one device kind. Required for
    /// every `device_type` a loaded document's steps reference; an
    /// unregistered kind fails at dispatch time with
    /// [`crate::error::DispatchError::UnknownDeviceType`].
    pub fn with_device_factory(mut self, device_type: DeviceType, factory: Arc<dyn DeviceProviderFactory>) -> Self {
        self.factories.insert(device_type, factory);
        self
    }

    /// Registers a named error handler for `execute_on_error` references.
    pub fn with_error_handler(mut self, name: impl Into<String>, handler: Handler) -> Result<Self, RegistryError> {
        self.registry.register(name, handler)?;
        Ok(self)
    }

    /// Persists the Progress Tracker's state to `path` on every mutation.
    pub fn with_progress_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.progress_file = Some(path.into());
        self
    }

    pub fn build(self) -> WorkflowEngine {
        WorkflowEngine {
            dispatcher: Arc::new(OperationDispatcher::new(self.factories)),
            tracker: Arc::new(ProgressTracker::new(self.progress_file)),
            registry: Arc::new(self.registry),
            output: Arc::new(OutputBus::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DeviceOpProvider;
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    struct AlwaysOk;

    #[async_trait]
    impl DeviceOpProvider for AlwaysOk {
        async fn invoke(&self, _operation: &str, _parameters: &Map<String, Value>) -> Result<bool, crate::error::DispatchError> {
            Ok(true)
        }
    }

    struct AlwaysOkFactory;

    #[async_trait]
    impl DeviceProviderFactory for AlwaysOkFactory {
        async fn create(&self, _device_id: &str) -> Result<Arc<dyn DeviceOpProvider>, crate::error::DispatchError> {
            Ok(Arc::new(AlwaysOk))
        }
    }

    #[tokio::test]
    async fn loads_and_runs_a_minimal_document() {
        let yaml = r#"
steps:
  - name: power_on
    device_type: compute
    device_id: node-1
    operation: power_on
"#;
        let engine = WorkflowEngine::builder()
            .with_device_factory(DeviceType::Compute, Arc::new(AlwaysOkFactory))
            .build();
        let document = engine.load(yaml).expect("document should load");
        let ok = engine.run(&document).await;
        assert!(ok);
        let snapshot = engine.tracker().snapshot("main").unwrap();
        assert_eq!(snapshot.steps_executed.len(), 1);
    }
}
