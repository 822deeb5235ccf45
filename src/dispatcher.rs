//! Operation Dispatcher: maps `(device_type, device_id)` to a cached
//! device-operation provider and invokes named operations on it
//! (SPEC_FULL §4.4).

use crate::error::DispatchError;
use crate::model::{DeviceType, Flow};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// The sentinel operation name that escalates a step into a multi-flow
/// fan-out via the Parallel Coordinator instead of a real device call.
pub const RUN_FLOWS_IN_PARALLEL: &str = "run_flows_in_parallel";

/// A hardware-specific operation implementation. Opaque to the core beyond
/// "invoke a named operation with parameters, get a boolean or an error".
#[async_trait]
pub trait DeviceOpProvider: Send + Sync {
    async fn invoke(&self, operation: &str, parameters: &Map<String, Value>) -> Result<bool, DispatchError>;
}

/// Constructs a [`DeviceOpProvider`] for one device, on first use. Providers
/// may be expensive to build (opening a BMC session, say); the dispatcher
/// guarantees `create` runs exactly once per `(device_type, device_id)` even
/// under concurrent access.
#[async_trait]
pub trait DeviceProviderFactory: Send + Sync {
    async fn create(&self, device_id: &str) -> Result<Arc<dyn DeviceOpProvider>, DispatchError>;
}

/// Runs a set of flows concurrently; satisfied by the Parallel Coordinator.
/// Injected after construction to avoid a compile-time cycle between the
/// dispatcher and the coordinator that depends on it.
#[async_trait]
pub trait ParallelRunner: Send + Sync {
    async fn run_in_parallel(&self, flows: Vec<Flow>) -> bool;
}

type ProviderCache = Mutex<HashMap<(DeviceType, String), Arc<OnceCell<Arc<dyn DeviceOpProvider>>>>>;

pub struct OperationDispatcher {
    factories: HashMap<DeviceType, Arc<dyn DeviceProviderFactory>>,
    cache: ProviderCache,
    parallel_runner: Mutex<Option<Arc<dyn ParallelRunner>>>,
}

impl OperationDispatcher {
    pub fn new(factories: HashMap<DeviceType, Arc<dyn DeviceProviderFactory>>) -> Self {
        OperationDispatcher {
            factories,
            cache: Mutex::new(HashMap::new()),
            parallel_runner: Mutex::new(None),
        }
    }

    pub fn set_parallel_runner(&self, runner: Arc<dyn ParallelRunner>) {
        *self.parallel_runner.lock().unwrap_or_else(|p| p.into_inner()) = Some(runner);
    }

    pub async fn invoke(
        &self,
        device_type: DeviceType,
        device_id: &str,
        operation: &str,
        parameters: &Map<String, Value>,
    ) -> Result<bool, DispatchError> {
        if operation == RUN_FLOWS_IN_PARALLEL {
            return self.dispatch_parallel(parameters).await;
        }

        let provider = self.provider_for(device_type, device_id).await?;
        provider.invoke(operation, parameters).await
    }

    async fn dispatch_parallel(&self, parameters: &Map<String, Value>) -> Result<bool, DispatchError> {
        let flows_value = parameters.get("flows").cloned().unwrap_or(Value::Array(Vec::new()));
        let flows: Vec<Flow> = serde_json::from_value(flows_value).map_err(|e| DispatchError::OperationFailed {
            device_type: "n/a".to_string(),
            device_id: "n/a".to_string(),
            operation: RUN_FLOWS_IN_PARALLEL.to_string(),
            details: format!("invalid 'flows' parameter: {e}"),
        })?;
        let runner = self
            .parallel_runner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| DispatchError::OperationFailed {
                device_type: "n/a".to_string(),
                device_id: "n/a".to_string(),
                operation: RUN_FLOWS_IN_PARALLEL.to_string(),
                details: "no parallel runner registered".to_string(),
            })?;
        Ok(runner.run_in_parallel(flows).await)
    }

    /// Double-checked provider lookup: the outer [`Mutex`] only ever guards
    /// a cheap `HashMap` operation; the actual (possibly slow) construction
    /// happens inside the per-entry [`OnceCell`], so concurrent callers for
    /// distinct devices never block each other and concurrent callers for
    /// the same device converge on one construction.
    async fn provider_for(&self, device_type: DeviceType, device_id: &str) -> Result<Arc<dyn DeviceOpProvider>, DispatchError> {
        let factory = self
            .factories
            .get(&device_type)
            .ok_or_else(|| DispatchError::UnknownDeviceType {
                device_type: device_type.to_string(),
            })?
            .clone();

        let cell = {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(
                cache
                    .entry((device_type, device_id.to_string()))
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        cell.get_or_try_init(|| async { factory.create(device_id).await })
            .await
            .cloned()
    }
}
