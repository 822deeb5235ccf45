//! In-memory workflow representation: [`Step`], [`ParallelGroup`], [`Flow`],
//! and the root [`WorkflowDocument`].
//!
//! Two fields the specification calls "runtime mutable" on `Step`
//! (`has_jumped_on_failure`, `last_exception`) are deliberately not stored
//! here. Flows can run concurrently (parallel flows, parallel groups) while
//! sharing the same loaded `Step` values, so per-execution state lives on the
//! Flow Executor's own call stack instead of on the shared model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// The three device categories this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Compute,
    Switch,
    PowerShelf,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Compute => "compute",
            DeviceType::Switch => "switch",
            DeviceType::PowerShelf => "power_shelf",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compute" => Some(DeviceType::Compute),
            "switch" => Some(DeviceType::Switch),
            "power_shelf" => Some(DeviceType::PowerShelf),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One hardware operation on one device, with retry/branching policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub operation: String,
    pub device_type: DeviceType,
    pub device_id: String,
    pub tag: Option<String>,
    /// Position within its enclosing flow's top-level element list, assigned
    /// by the loader; used as the jump resolution unit instead of any
    /// truthy/integer ambiguity (see design notes on jump targets).
    #[serde(skip)]
    pub step_index: Option<usize>,

    pub retry_count: u32,
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub wait_after_seconds: f64,
    #[serde(default)]
    pub wait_between_retries_seconds: f64,
    #[serde(default)]
    pub parameters: Map<String, Value>,

    pub jump_on_success: Option<String>,
    pub jump_on_failure: Option<String>,
    pub execute_on_error: Option<String>,
    pub execute_optional_flow: Option<String>,
}

impl Step {
    /// A clone of `self` with a widened retry budget, used by the Flow
    /// Executor when retrying a step after a successful optional flow
    /// (SPEC_FULL §4.3.1): one additional attempt beyond the step's own
    /// configured `retry_count`.
    pub fn with_extra_retry(&self) -> Step {
        let mut clone = self.clone();
        clone.retry_count += 1;
        clone
    }
}

/// An unordered set of steps executed concurrently; succeeds iff every
/// member succeeds. Members may not declare jumps — the loader rejects any
/// that do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub name: Option<String>,
    pub members: Vec<Step>,
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub wait_after_seconds: f64,
}

/// One element of a flow's ordered sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowElement {
    Step(Step),
    Parallel(ParallelGroup),
    Nested(Flow),
}

/// An ordered sequence of steps / parallel groups / nested flows sharing a
/// tag namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub elements: Vec<FlowElement>,
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub wait_after_seconds: f64,

    /// Built at load time from each element's `tag`; not (de)serialized.
    #[serde(skip)]
    pub tag_to_index: HashMap<String, usize>,
}

impl Flow {
    pub fn new(name: impl Into<String>, elements: Vec<FlowElement>) -> Self {
        let mut flow = Flow {
            name: name.into(),
            elements,
            max_workers: None,
            wait_after_seconds: 0.0,
            tag_to_index: HashMap::new(),
        };
        flow.reindex();
        flow
    }

    /// Recomputes `tag_to_index` and each [`Step::step_index`] from
    /// `elements`'s current order. Called by the loader after construction
    /// and after any variable-expansion rewrite.
    pub fn reindex(&mut self) {
        self.tag_to_index.clear();
        for (index, element) in self.elements.iter_mut().enumerate() {
            if let FlowElement::Step(step) = element {
                step.step_index = Some(index);
                if let Some(tag) = &step.tag {
                    self.tag_to_index.insert(tag.clone(), index);
                }
            }
        }
    }
}

/// Document-level settings (`settings` key in the workflow document).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub default_retry_count: Option<u32>,
    pub default_error_handler: Option<String>,
}

/// The root container produced by the Loader: the main flow, the optional
/// flow registry, and document-level settings. Variables are consumed
/// entirely during loading (see `variables.rs`) and are not retained here.
#[derive(Debug, Clone)]
pub struct WorkflowDocument {
    pub main_flow: Flow,
    pub optional_flows: HashMap<String, Flow>,
    pub settings: Settings,
}

pub const DEFAULT_RETRY_COUNT: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_step(name: &str, tag: Option<&str>) -> Step {
        Step {
            name: name.to_string(),
            operation: "noop".to_string(),
            device_type: DeviceType::Compute,
            device_id: "node-1".to_string(),
            tag: tag.map(str::to_string),
            step_index: None,
            retry_count: DEFAULT_RETRY_COUNT,
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

    #[test]
    fn device_type_round_trips_through_wire_names() {
        assert_eq!(DeviceType::parse("power_shelf"), Some(DeviceType::PowerShelf));
        assert_eq!(DeviceType::PowerShelf.as_str(), "power_shelf");
        assert_eq!(DeviceType::parse("unknown"), None);
    }

    #[test]
    fn flow_reindex_builds_tag_map_and_step_indices() {
        let flow = Flow::new(
            "main",
            vec![
                FlowElement::Step(sample_step("a", Some("tag_a"))),
                FlowElement::Step(sample_step("b", None)),
                FlowElement::Step(sample_step("c", Some("tag_c"))),
            ],
        );
        assert_eq!(flow.tag_to_index.get("tag_a"), Some(&0));
        assert_eq!(flow.tag_to_index.get("tag_c"), Some(&2));
        assert_eq!(flow.tag_to_index.get("missing"), None);
        if let FlowElement::Step(step) = &flow.elements[2] {
            assert_eq!(step.step_index, Some(2));
        } else {
            panic!("expected step element");
        }
    }

    #[test]
    fn with_extra_retry_widens_budget_by_one() {
        let step = sample_step("a", None);
        let widened = step.with_extra_retry();
        assert_eq!(widened.retry_count, step.retry_count + 1);
    }
}
