//! Commonly used types and traits.

pub use crate::dispatcher::{DeviceOpProvider, DeviceProviderFactory, OperationDispatcher};
pub use crate::engine::{WorkflowEngine, WorkflowEngineBuilder};
pub use crate::error::{DispatchError, LoadError, LoadReason, RegistryError, TrackerError, WorkflowError};
pub use crate::error_handler::{ErrorContext, ErrorHandlerRegistry};
pub use crate::model::{DeviceType, Flow, FlowElement, ParallelGroup, Settings, Step, WorkflowDocument};
pub use crate::output::{Event, OutputBus, Presenter};
pub use crate::progress::{FlowInfo, FlowStatus, ProgressTracker, StepExecution, StepStatus};
