//! Error-Handler Registry: name -> diagnostic callable, invoked after retry,
//! jump, and optional-flow recovery have all been exhausted for a step.

use crate::error::RegistryError;
use crate::model::Step;
use std::collections::HashMap;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Context handed to an error handler: flow/device/parameter/retry context
/// plus the name of any optional flow already attempted (SPEC_FULL §6).
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub flow_name: String,
    pub device_type: String,
    pub device_id: String,
    pub operation: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub retry_attempts: u32,
    pub optional_flow_executed: Option<String>,
}

/// A diagnostic handler invoked on step failure. Handlers are advisory: a
/// `true` return means "treat as recovered", `false` means "flow fails
/// here". Recovery proper is the job of optional flows, not handlers.
pub type Handler = Arc<dyn Fn(&Step, &str, &ErrorContext) -> bool + Send + Sync>;

/// The literal handler name that is always resolvable, even with an empty
/// registry — it is the document's `settings.default_error_handler` sentinel
/// (SPEC_FULL §4.1.1).
pub const DEFAULT_ERROR_HANDLER: &str = "default_error_handler";

#[derive(Default, Clone)]
pub struct ErrorHandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl ErrorHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Handler) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered { name });
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Names resolvable for `execute_on_error`/`default_error_handler`
    /// references: every registered name plus the always-present default.
    pub fn known_names(&self) -> HashSet<&str> {
        let mut names: HashSet<&str> = self.handlers.keys().map(String::as_str).collect();
        names.insert(DEFAULT_ERROR_HANDLER);
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        name == DEFAULT_ERROR_HANDLER || self.handlers.contains_key(name)
    }

    /// Invokes the named handler, catching any panic it raises and treating
    /// it identically to a `false` return (SPEC_FULL §4.5.1).
    pub fn invoke(&self, name: &str, step: &Step, error_message: &str, ctx: &ErrorContext) -> bool {
        let Some(handler) = self.handlers.get(name) else {
            if name == DEFAULT_ERROR_HANDLER {
                tracing::warn!(handler = name, "default error handler has no registered body");
            } else {
                tracing::warn!(handler = name, "unknown error handler invoked");
            }
            return false;
        };
        let handler = Arc::clone(handler);
        match catch_unwind(AssertUnwindSafe(|| handler(step, error_message, ctx))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                tracing::error!(handler = name, error = %message, "error handler panicked");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceType;

    fn sample_step() -> Step {
        Step {
            name: "flash".to_string(),
            operation: "flash_bios".to_string(),
            device_type: DeviceType::Compute,
            device_id: "node-1".to_string(),
            tag: None,
            step_index: None,
            retry_count: 3,
            timeout_seconds: None,
            wait_after_seconds: 0.0,
            wait_between_retries_seconds: 0.0,
            parameters: serde_json::Map::new(),
            jump_on_success: None,
            jump_on_failure: None,
            execute_on_error: None,
            execute_optional_flow: None,
        }
    }

    fn sample_context() -> ErrorContext {
        ErrorContext {
            flow_name: "main".to_string(),
            device_type: "compute".to_string(),
            device_id: "node-1".to_string(),
            operation: "flash_bios".to_string(),
            parameters: serde_json::Map::new(),
            retry_attempts: 0,
            optional_flow_executed: None,
        }
    }

    #[test]
    fn default_handler_name_always_resolvable() {
        let registry = ErrorHandlerRegistry::new();
        assert!(registry.contains(DEFAULT_ERROR_HANDLER));
        assert!(!registry.contains("unknown"));
    }

    #[test]
    fn register_rejects_empty_name() {
        let mut registry = ErrorHandlerRegistry::new();
        let err = registry.register("", Arc::new(|_, _, _| true)).unwrap_err();
        assert!(matches!(err, RegistryError::EmptyName));
    }

    #[test]
    fn invoke_runs_registered_handler() {
        let mut registry = ErrorHandlerRegistry::new();
        registry
            .register("log_only", Arc::new(|_, _, _| false))
            .unwrap();
        let result = registry.invoke("log_only", &sample_step(), "boom", &sample_context());
        assert!(!result);
    }

    #[test]
    fn invoke_catches_panicking_handler() {
        let mut registry = ErrorHandlerRegistry::new();
        registry
            .register("panics", Arc::new(|_, _, _| panic!("handler bug")))
            .unwrap();
        let result = registry.invoke("panics", &sample_step(), "boom", &sample_context());
        assert!(!result);
    }

    #[test]
    fn invoke_unknown_handler_returns_false() {
        let registry = ErrorHandlerRegistry::new();
        let result = registry.invoke("missing", &sample_step(), "boom", &sample_context());
        assert!(!result);
    }
}
