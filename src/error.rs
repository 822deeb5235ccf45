use thiserror::Error;

/// Why a workflow document failed to load.
///
/// Mirrors the closed set of validation failures the loader can produce;
/// matching on `reason` lets callers branch without string parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LoadReason {
    MissingField,
    EmptyField,
    BadEnum,
    DuplicateTag,
    UnresolvedTag,
    UnresolvedHandler,
    UnresolvedOptionalFlow,
    JumpCycle,
    OptionalFlowCycle,
    VariableUndefined,
    BadParametersType,
}

impl std::fmt::Display for LoadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadReason::MissingField => "missing-field",
            LoadReason::EmptyField => "empty-field",
            LoadReason::BadEnum => "bad-enum",
            LoadReason::DuplicateTag => "duplicate-tag",
            LoadReason::UnresolvedTag => "unresolved-tag",
            LoadReason::UnresolvedHandler => "unresolved-handler",
            LoadReason::UnresolvedOptionalFlow => "unresolved-optional-flow",
            LoadReason::JumpCycle => "jump-cycle",
            LoadReason::OptionalFlowCycle => "optional-flow-cycle",
            LoadReason::VariableUndefined => "variable-undefined",
            LoadReason::BadParametersType => "bad-parameters-type",
        };
        write!(f, "{s}")
    }
}

/// A fatal error raised while loading and validating a workflow document.
#[derive(Error, Debug)]
#[error("failed to load workflow at {path}: {reason} ({details})")]
pub struct LoadError {
    /// A path-like location within the document, e.g. `"steps[2].parallel[1]"`.
    pub path: String,
    pub reason: LoadReason,
    pub details: String,
}

impl LoadError {
    pub fn new(path: impl Into<String>, reason: LoadReason, details: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason,
            details: details.into(),
        }
    }
}

/// Errors raised by the Operation Dispatcher.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("unknown device type: {device_type}")]
    UnknownDeviceType { device_type: String },

    #[error("device {device_type}/{device_id} has no operation named '{operation}'")]
    UnknownOperation {
        device_type: String,
        device_id: String,
        operation: String,
    },

    #[error("operation '{operation}' on {device_type}/{device_id} raised: {details}")]
    OperationFailed {
        device_type: String,
        device_id: String,
        operation: String,
        details: String,
    },
}

/// Errors raised while executing a step or a flow.
///
/// This is the terminal-failure error surfaced by the Step Executor and Flow
/// Executor; it is distinct from [`LoadError`] (load time) and
/// [`DispatchError`] (operation invocation).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    #[error("step '{step_name}' failed after {attempts} attempt(s): {details}")]
    StepFailed {
        step_name: String,
        attempts: u32,
        details: String,
    },

    #[error("step '{step_name}' timed out")]
    Timeout { step_name: String },

    #[error("jump target '{tag}' not found in flow '{flow_name}'")]
    UnresolvedJumpTarget { flow_name: String, tag: String },

    #[error("optional flow '{name}' not found")]
    OptionalFlowNotFound { name: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Errors raised by the Error-Handler Registry.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("handler name must not be empty")]
    EmptyName,

    #[error("handler '{name}' already registered")]
    AlreadyRegistered { name: String },
}

/// Errors raised by the Progress Tracker's persistence layer.
///
/// These are logged, never propagated: in-memory state remains authoritative
/// and the next mutation retries the write (see design notes on Tracker
/// errors).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrackerError {
    #[error("failed to persist progress file at {path}: {details}")]
    PersistFailed { path: String, details: String },

    #[error("unknown step execution id: {0}")]
    UnknownExecution(uuid::Uuid),

    #[error("unknown flow: {0}")]
    UnknownFlow(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_reason_display() {
        assert_eq!(LoadReason::JumpCycle.to_string(), "jump-cycle");
        assert_eq!(LoadReason::MissingField.to_string(), "missing-field");
    }

    #[test]
    fn load_error_display() {
        let err = LoadError::new(
            "steps[0]",
            LoadReason::MissingField,
            "device_type is required",
        );
        assert_eq!(
            err.to_string(),
            "failed to load workflow at steps[0]: missing-field (device_type is required)"
        );
    }

    #[test]
    fn workflow_error_display() {
        let err = WorkflowError::Timeout {
            step_name: "flash_bios".to_string(),
        };
        assert_eq!(err.to_string(), "step 'flash_bios' timed out");
    }
}
