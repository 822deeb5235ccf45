//! # factory-flow
//!
//! A workflow execution engine for bringing up, configuring, and
//! firmware-updating heterogeneous hardware trays (compute nodes, network
//! switches, power shelves) in a manufacturing environment.
//!
//! Workflows are declarative YAML documents: an ordered list of device
//! operations with retry policy, conditional jumps, optional-flow recovery,
//! and parallel groups. The engine loads and validates a document, then
//! drives it to completion while publishing progress to a tracker and an
//! event bus.
//!
//! ## Quick Start
//!
//! ```rust
//! use factory_flow::prelude::*;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct PowerShelfProvider;
//!
//! #[async_trait]
//! impl DeviceOpProvider for PowerShelfProvider {
//!     async fn invoke(&self, operation: &str, _parameters: &serde_json::Map<String, serde_json::Value>) -> Result<bool, DispatchError> {
//!         Ok(operation == "power_on")
//!     }
//! }
//!
//! struct PowerShelfFactory;
//!
//! #[async_trait]
//! impl DeviceProviderFactory for PowerShelfFactory {
//!     async fn create(&self, _device_id: &str) -> Result<Arc<dyn DeviceOpProvider>, DispatchError> {
//!         Ok(Arc::new(PowerShelfProvider))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let engine = WorkflowEngine::builder()
//!     .with_device_factory(DeviceType::PowerShelf, Arc::new(PowerShelfFactory))
//!     .build();
//!
//! let document = engine.load(r#"
//! steps:
//!   - name: energize
//!     device_type: power_shelf
//!     device_id: shelf-1
//!     operation: power_on
//!     retry_count: 2
//! "#).expect("document should load");
//!
//! let ok = engine.run(&document).await;
//! assert!(ok);
//! # }
//! ```
//!
//! ## Retry, jumps, and optional-flow recovery
//!
//! A step's `retry_count` governs its own attempt loop; `jump_on_success` /
//! `jump_on_failure` redirect the flow to another step by `tag`;
//! `execute_optional_flow` runs a named recovery flow on failure and, if it
//! succeeds, retries the original step once more with a widened budget
//! before falling through to `jump_on_failure` and finally
//! `execute_on_error`. See the module-level docs on [`flow_executor`] for the
//! exact precedence.
//!
//! ## Error handling
//!
//! Loading is fail-fast: [`loader::load_document`] returns the first
//! [`error::LoadError`] it finds (missing fields, unresolved jump targets,
//! jump/optional-flow cycles, undefined `${variable}` references). Once
//! running, a step's terminal failure is recorded on its [`progress::StepExecution`]
//! and never raised as a Rust error — see [`error::WorkflowError`] for the
//! kinds surfaced by flow-level failures instead.

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod error_handler;
pub mod flow_executor;
pub mod loader;
pub mod logging;
pub mod model;
pub mod output;
pub mod parallel;
pub mod progress;
pub mod step_executor;
pub mod variables;

pub mod prelude;

pub use dispatcher::{DeviceOpProvider, DeviceProviderFactory, OperationDispatcher};
pub use engine::{WorkflowEngine, WorkflowEngineBuilder};
pub use error::{DispatchError, LoadError, LoadReason, RegistryError, TrackerError, WorkflowError};
pub use error_handler::{ErrorContext, ErrorHandlerRegistry};
pub use model::{DeviceType, Flow, FlowElement, ParallelGroup, Settings, Step, WorkflowDocument};
pub use output::{Event, OutputBus, Presenter};
pub use progress::{FlowInfo, FlowStatus, ProgressTracker, StepExecution, StepStatus};
