//! Workflow Loader & Validator: parses a declarative workflow document,
//! expands `${var}` references, validates structure/references/cycles, and
//! produces a [`WorkflowDocument`].

use crate::error::{LoadError, LoadReason};
use crate::error_handler::ErrorHandlerRegistry;
use crate::model::{DeviceType, Flow, FlowElement, ParallelGroup, Settings, Step, WorkflowDocument, DEFAULT_RETRY_COUNT};
use crate::variables::expand_variables;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Parses and validates `yaml_text`, resolving handler references against
/// `registry`. On success returns a fully validated [`WorkflowDocument`];
/// on any structural, reference, or cycle problem returns the first
/// [`LoadError`] encountered.
pub fn load_document(yaml_text: &str, registry: &ErrorHandlerRegistry) -> Result<WorkflowDocument, LoadError> {
    let raw: Value = serde_yaml::from_str(yaml_text).map_err(|e| {
        LoadError::new("<document>", LoadReason::BadEnum, format!("invalid YAML: {e}"))
    })?;
    let raw = serde_json::to_value(raw)
        .map_err(|e| LoadError::new("<document>", LoadReason::BadEnum, format!("invalid document: {e}")))?;

    let root = raw.as_object().ok_or_else(|| {
        LoadError::new("<document>", LoadReason::BadEnum, "document root must be a mapping")
    })?;

    let variables = root
        .get("variables")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let settings: Settings = root
        .get("settings")
        .map(|v| expand_variables(v, &variables))
        .transpose()?
        .map(|v| serde_json::from_value(v).map_err(|e| {
            LoadError::new("settings", LoadReason::BadEnum, format!("invalid settings: {e}"))
        }))
        .transpose()?
        .unwrap_or_default();

    let default_retry_count = settings.default_retry_count.unwrap_or(DEFAULT_RETRY_COUNT);

    let raw_steps = root
        .get("steps")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let expanded_steps = raw_steps
        .iter()
        .map(|v| expand_variables(v, &variables))
        .collect::<Result<Vec<_>, _>>()?;
    let main_elements = convert_elements(&expanded_steps, "steps", default_retry_count)?;
    let main_flow = Flow::new("main", main_elements);

    let mut optional_flows = HashMap::new();
    if let Some(raw_optional) = root.get("optional_flows").and_then(Value::as_object) {
        for (name, raw_flow_steps) in raw_optional {
            let raw_flow_steps = raw_flow_steps.as_array().cloned().ok_or_else(|| {
                LoadError::new(
                    format!("optional_flows.{name}"),
                    LoadReason::BadEnum,
                    "optional flow body must be a list of steps",
                )
            })?;
            let expanded = raw_flow_steps
                .iter()
                .map(|v| expand_variables(v, &variables))
                .collect::<Result<Vec<_>, _>>()?;
            let elements = convert_elements(&expanded, &format!("optional_flows.{name}"), default_retry_count)?;
            optional_flows.insert(name.clone(), Flow::new(name.clone(), elements));
        }
    }

    validate(&main_flow, &optional_flows, registry)?;

    Ok(WorkflowDocument {
        main_flow,
        optional_flows,
        settings,
    })
}

const REQUIRED_DEVICE_TYPES: &str = "compute, switch, power_shelf";

fn convert_elements(raw: &[Value], location: &str, default_retry_count: u32) -> Result<Vec<FlowElement>, LoadError> {
    let mut elements = Vec::with_capacity(raw.len());
    // Tags are unique within a flow (SPEC_FULL §3): tracked across this
    // whole list, not just within one parallel group, so an ordinary step
    // and a parallel-group member (or two groups) can't collide either.
    // Nested flows get their own list via a fresh recursive call, so they
    // have their own scope, same as optional flows.
    let mut seen_tags: HashSet<String> = HashSet::new();
    for (index, item) in raw.iter().enumerate() {
        let path = format!("{location}[{index}]");
        let obj = item.as_object().ok_or_else(|| {
            LoadError::new(&path, LoadReason::BadEnum, "element must be a mapping")
        })?;

        if let Some(nested_raw) = obj.get("independent_flows").and_then(Value::as_array) {
            for (sub_index, sub) in nested_raw.iter().enumerate() {
                let sub_path = format!("{path}.independent_flows[{sub_index}]");
                let sub_obj = sub.as_object().ok_or_else(|| {
                    LoadError::new(&sub_path, LoadReason::BadEnum, "independent flow entry must be a mapping")
                })?;
                let sub_steps = sub_obj
                    .get("steps")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let sub_elements = convert_elements(&sub_steps, &sub_path, default_retry_count)?;
                let name = sub_obj
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("independent_flow_{index}_{sub_index}"));
                elements.push(FlowElement::Nested(Flow::new(name, sub_elements)));
            }
            continue;
        }

        if let Some(members_raw) = obj.get("parallel").and_then(Value::as_array) {
            let mut members = Vec::with_capacity(members_raw.len());
            for (member_index, member) in members_raw.iter().enumerate() {
                let member_path = format!("{path}.parallel[{member_index}]");
                let step = convert_step(member, &member_path, default_retry_count)?;
                if step.jump_on_success.is_some() || step.jump_on_failure.is_some() {
                    return Err(LoadError::new(
                        &member_path,
                        LoadReason::BadEnum,
                        "parallel group members may not declare jumps",
                    ));
                }
                if let Some(tag) = &step.tag {
                    if !seen_tags.insert(tag.clone()) {
                        return Err(LoadError::new(
                            &member_path,
                            LoadReason::DuplicateTag,
                            format!("duplicate tag '{tag}' within flow '{location}'"),
                        ));
                    }
                }
                members.push(step);
            }
            let max_workers = obj.get("max_workers").and_then(Value::as_u64).map(|n| n as usize);
            let wait_after_seconds = obj.get("wait_after_seconds").and_then(Value::as_f64).unwrap_or(0.0);
            let name = obj.get("name").and_then(Value::as_str).map(str::to_string);
            elements.push(FlowElement::Parallel(ParallelGroup {
                name,
                members,
                max_workers,
                wait_after_seconds,
            }));
            continue;
        }

        let step = convert_step(item, &path, default_retry_count)?;
        if let Some(tag) = &step.tag {
            if !seen_tags.insert(tag.clone()) {
                return Err(LoadError::new(
                    &path,
                    LoadReason::DuplicateTag,
                    format!("duplicate tag '{tag}' within flow '{location}'"),
                ));
            }
        }
        elements.push(FlowElement::Step(step));
    }
    Ok(elements)
}

fn convert_step(raw: &Value, path: &str, default_retry_count: u32) -> Result<Step, LoadError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| LoadError::new(path, LoadReason::BadEnum, "step must be a mapping"))?;

    let device_type_str = non_empty_string(obj, "device_type", path)?;
    let device_type = DeviceType::parse(&device_type_str).ok_or_else(|| {
        LoadError::new(
            path,
            LoadReason::BadEnum,
            format!("device_type '{device_type_str}' must be one of: {REQUIRED_DEVICE_TYPES}"),
        )
    })?;
    let device_id = non_empty_string(obj, "device_id", path)?;
    let operation = non_empty_string(obj, "operation", path)?;

    let parameters = match obj.get("parameters") {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(LoadError::new(
                path,
                LoadReason::BadParametersType,
                "parameters must be a mapping",
            ))
        }
    };

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| operation.clone());

    Ok(Step {
        name,
        operation,
        device_type,
        device_id,
        tag: obj.get("tag").and_then(Value::as_str).map(str::to_string),
        step_index: None,
        retry_count: obj
            .get("retry_count")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(default_retry_count),
        timeout_seconds: obj.get("timeout_seconds").and_then(Value::as_f64),
        wait_after_seconds: obj.get("wait_after_seconds").and_then(Value::as_f64).unwrap_or(0.0),
        wait_between_retries_seconds: obj
            .get("wait_between_retries_seconds")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        parameters,
        jump_on_success: obj.get("jump_on_success").and_then(Value::as_str).map(str::to_string),
        jump_on_failure: obj.get("jump_on_failure").and_then(Value::as_str).map(str::to_string),
        execute_on_error: obj.get("execute_on_error").and_then(Value::as_str).map(str::to_string),
        execute_optional_flow: obj
            .get("execute_optional_flow")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn non_empty_string(obj: &Map<String, Value>, field: &str, path: &str) -> Result<String, LoadError> {
    match obj.get(field) {
        None => Err(LoadError::new(path, LoadReason::MissingField, format!("missing field '{field}'"))),
        Some(Value::String(s)) if s.is_empty() => Err(LoadError::new(
            path,
            LoadReason::EmptyField,
            format!("field '{field}' must not be empty"),
        )),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(LoadError::new(path, LoadReason::BadEnum, format!("field '{field}' must be a string"))),
    }
}

/// Reference, tag, and cycle validation over the fully converted model.
fn validate(
    main_flow: &Flow,
    optional_flows: &HashMap<String, Flow>,
    registry: &ErrorHandlerRegistry,
) -> Result<(), LoadError> {
    let known_handlers = registry.known_names();

    validate_flow_references(main_flow, optional_flows, &known_handlers)?;
    for flow in optional_flows.values() {
        validate_flow_references(flow, optional_flows, &known_handlers)?;
    }

    check_jump_cycles(main_flow)?;
    for flow in optional_flows.values() {
        check_jump_cycles(flow)?;
    }

    check_optional_flow_cycles(main_flow, optional_flows)?;

    Ok(())
}

fn validate_flow_references(
    flow: &Flow,
    optional_flows: &HashMap<String, Flow>,
    known_handlers: &HashSet<&str>,
) -> Result<(), LoadError> {
    for element in &flow.elements {
        match element {
            FlowElement::Step(step) => {
                for tag in [&step.jump_on_success, &step.jump_on_failure].into_iter().flatten() {
                    if !flow.tag_to_index.contains_key(tag) {
                        return Err(LoadError::new(
                            format!("flow:{}", flow.name),
                            LoadReason::UnresolvedTag,
                            format!("jump target '{tag}' does not resolve in flow '{}'", flow.name),
                        ));
                    }
                }
                if let Some(name) = &step.execute_optional_flow {
                    if !optional_flows.contains_key(name) {
                        return Err(LoadError::new(
                            format!("flow:{}", flow.name),
                            LoadReason::UnresolvedOptionalFlow,
                            format!("optional flow '{name}' is not defined"),
                        ));
                    }
                }
                if let Some(name) = &step.execute_on_error {
                    if !known_handlers.contains(name.as_str()) {
                        return Err(LoadError::new(
                            format!("flow:{}", flow.name),
                            LoadReason::UnresolvedHandler,
                            format!("error handler '{name}' is not registered"),
                        ));
                    }
                }
            }
            FlowElement::Parallel(_) => {}
            FlowElement::Nested(inner) => {
                validate_flow_references(inner, optional_flows, known_handlers)?;
            }
        }
    }
    Ok(())
}

/// Walks `jump_on_failure` edges within one flow's tag scope and fails on
/// any cycle, including a self-jump (SPEC_FULL §4.1 step 5).
fn check_jump_cycles(flow: &Flow) -> Result<(), LoadError> {
    let mut edges: HashMap<usize, usize> = HashMap::new();
    for element in &flow.elements {
        if let FlowElement::Step(step) = element {
            if let (Some(index), Some(target_tag)) = (step.step_index, &step.jump_on_failure) {
                if let Some(&target) = flow.tag_to_index.get(target_tag) {
                    edges.insert(index, target);
                }
            }
        }
        if let FlowElement::Nested(inner) = element {
            check_jump_cycles(inner)?;
        }
    }

    for &start in edges.keys() {
        let mut visited = vec![start];
        let mut current = start;
        while let Some(&next) = edges.get(&current) {
            if let Some(pos) = visited.iter().position(|&v| v == next) {
                let cycle_steps: Vec<String> = flow
                    .elements
                    .iter()
                    .filter_map(|e| match e {
                        FlowElement::Step(s) if s.step_index.map(|i| visited[pos..].contains(&i)).unwrap_or(false) => {
                            Some(s.name.clone())
                        }
                        _ => None,
                    })
                    .collect();
                return Err(LoadError::new(
                    format!("flow:{}", flow.name),
                    LoadReason::JumpCycle,
                    format!("circular jump_on_failure among steps: {}", cycle_steps.join(" -> ")),
                ));
            }
            visited.push(next);
            current = next;
        }
    }
    Ok(())
}

/// Walks `execute_optional_flow` edges across the whole document and fails
/// on any cycle (SPEC_FULL §4.1 step 5). `__main__` is the synthetic node
/// name for the document's top-level flow.
fn check_optional_flow_cycles(
    main_flow: &Flow,
    optional_flows: &HashMap<String, Flow>,
) -> Result<(), LoadError> {
    const MAIN: &str = "__main__";
    let mut graph: HashMap<&str, HashSet<&str>> = HashMap::new();
    graph.insert(MAIN, collect_optional_flow_refs(main_flow));
    for (name, flow) in optional_flows {
        graph.insert(name.as_str(), collect_optional_flow_refs(flow));
    }

    fn walk<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, HashSet<&'a str>>,
        visited: &mut Vec<&'a str>,
    ) -> Result<(), Vec<String>> {
        if let Some(pos) = visited.iter().position(|&v| v == node) {
            return Err(visited[pos..].iter().map(|s| s.to_string()).collect());
        }
        visited.push(node);
        if let Some(next_nodes) = graph.get(node) {
            for &next in next_nodes {
                walk(next, graph, &mut visited.clone())?;
            }
        }
        Ok(())
    }

    for &start in graph.keys() {
        if let Err(cycle) = walk(start, &graph, &mut Vec::new()) {
            return Err(LoadError::new(
                "optional_flows",
                LoadReason::OptionalFlowCycle,
                format!("circular execute_optional_flow among: {}", cycle.join(" -> ")),
            ));
        }
    }
    Ok(())
}

fn collect_optional_flow_refs(flow: &Flow) -> HashSet<&str> {
    let mut refs = HashSet::new();
    for element in &flow.elements {
        match element {
            FlowElement::Step(step) => {
                if let Some(name) = &step.execute_optional_flow {
                    refs.insert(name.as_str());
                }
            }
            FlowElement::Nested(inner) => refs.extend(collect_optional_flow_refs(inner)),
            FlowElement::Parallel(_) => {}
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_registry() -> ErrorHandlerRegistry {
        ErrorHandlerRegistry::new()
    }

    #[test]
    fn loads_minimal_workflow() {
        let yaml = r#"
steps:
  - device_type: compute
    device_id: node-1
    operation: power_on
"#;
        let doc = load_document(yaml, &empty_registry()).unwrap();
        assert_eq!(doc.main_flow.elements.len(), 1);
    }

    #[test]
    fn missing_required_field_fails() {
        let yaml = r#"
steps:
  - device_type: compute
    operation: power_on
"#;
        let err = load_document(yaml, &empty_registry()).unwrap_err();
        assert_eq!(err.reason, LoadReason::MissingField);
    }

    #[test]
    fn bad_device_type_fails() {
        let yaml = r#"
steps:
  - device_type: toaster
    device_id: node-1
    operation: power_on
"#;
        let err = load_document(yaml, &empty_registry()).unwrap_err();
        assert_eq!(err.reason, LoadReason::BadEnum);
    }

    #[test]
    fn unresolved_jump_target_fails() {
        let yaml = r#"
steps:
  - device_type: compute
    device_id: node-1
    operation: power_on
    jump_on_failure: nope
"#;
        let err = load_document(yaml, &empty_registry()).unwrap_err();
        assert_eq!(err.reason, LoadReason::UnresolvedTag);
    }

    #[test]
    fn self_jump_cycle_fails() {
        let yaml = r#"
steps:
  - device_type: compute
    device_id: node-1
    operation: power_on
    tag: a
    jump_on_failure: a
"#;
        let err = load_document(yaml, &empty_registry()).unwrap_err();
        assert_eq!(err.reason, LoadReason::JumpCycle);
    }

    #[test]
    fn mutual_jump_cycle_fails() {
        let yaml = r#"
steps:
  - device_type: compute
    device_id: node-1
    operation: a
    tag: a
    jump_on_failure: b
  - device_type: compute
    device_id: node-1
    operation: b
    tag: b
    jump_on_failure: a
"#;
        let err = load_document(yaml, &empty_registry()).unwrap_err();
        assert_eq!(err.reason, LoadReason::JumpCycle);
    }

    #[test]
    fn unresolved_optional_flow_fails() {
        let yaml = r#"
steps:
  - device_type: compute
    device_id: node-1
    operation: a
    execute_optional_flow: missing
"#;
        let err = load_document(yaml, &empty_registry()).unwrap_err();
        assert_eq!(err.reason, LoadReason::UnresolvedOptionalFlow);
    }

    #[test]
    fn optional_flow_cycle_fails() {
        let yaml = r#"
steps:
  - device_type: compute
    device_id: node-1
    operation: a
    execute_optional_flow: rec
optional_flows:
  rec:
    - device_type: compute
      device_id: node-1
      operation: b
      execute_optional_flow: rec
"#;
        let err = load_document(yaml, &empty_registry()).unwrap_err();
        assert_eq!(err.reason, LoadReason::OptionalFlowCycle);
    }

    #[test]
    fn variable_expansion_applies_before_validation() {
        let yaml = r#"
variables:
  node: node-42
steps:
  - device_type: compute
    device_id: "${node}"
    operation: power_on
"#;
        let doc = load_document(yaml, &empty_registry()).unwrap();
        if let FlowElement::Step(step) = &doc.main_flow.elements[0] {
            assert_eq!(step.device_id, "node-42");
        } else {
            panic!("expected step element");
        }
    }

    #[test]
    fn default_retry_count_is_three() {
        let yaml = r#"
steps:
  - device_type: compute
    device_id: node-1
    operation: power_on
"#;
        let doc = load_document(yaml, &empty_registry()).unwrap();
        if let FlowElement::Step(step) = &doc.main_flow.elements[0] {
            assert_eq!(step.retry_count, DEFAULT_RETRY_COUNT);
        } else {
            panic!("expected step element");
        }
    }

    #[test]
    fn settings_default_retry_count_overrides_builtin() {
        let yaml = r#"
settings:
  default_retry_count: 7
steps:
  - device_type: compute
    device_id: node-1
    operation: power_on
"#;
        let doc = load_document(yaml, &empty_registry()).unwrap();
        if let FlowElement::Step(step) = &doc.main_flow.elements[0] {
            assert_eq!(step.retry_count, 7);
        } else {
            panic!("expected step element");
        }
    }

    #[test]
    fn parallel_group_member_with_jump_fails() {
        let yaml = r#"
steps:
  - parallel:
      - device_type: compute
        device_id: node-1
        operation: a
        jump_on_success: z
"#;
        let err = load_document(yaml, &empty_registry()).unwrap_err();
        assert_eq!(err.reason, LoadReason::BadEnum);
    }
}
