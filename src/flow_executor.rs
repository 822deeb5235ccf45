//! Flow Executor: sequential step walk, jump resolution, optional-flow
//! recovery, and error-handler invocation (SPEC_FULL §4.3).

use crate::dispatcher::OperationDispatcher;
use crate::error_handler::{ErrorContext, ErrorHandlerRegistry};
use crate::model::{Flow, FlowElement, ParallelGroup, Step};
use crate::output::{Event, OutputBus};
use crate::progress::{JumpTaken, ProgressTracker, StepExecution};
use crate::step_executor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Shared handles a flow execution needs. `dispatcher` is an [`Arc`] because
/// parallel-group members run as spawned tasks, which require `'static`
/// futures; the sequential paths just borrow through it via deref coercion.
pub struct FlowExecutorContext<'a> {
    pub dispatcher: Arc<OperationDispatcher>,
    pub tracker: &'a ProgressTracker,
    pub registry: &'a ErrorHandlerRegistry,
    pub optional_flows: &'a HashMap<String, Flow>,
    pub output: &'a OutputBus,
}

/// Drives one flow to terminal outcome, returning overall success
/// (SPEC_FULL §4.3). `flow_name` is the tracker key this execution reports
/// progress under; it may differ from `flow.name` for optional-flow
/// invocations, which are tracked under a synthetic nested name.
pub async fn execute(flow: &Flow, flow_name: &str, ctx: &FlowExecutorContext<'_>) -> bool {
    ctx.tracker.set_flow_running(flow_name).ok();
    ctx.output.publish(Event::FlowRunning { flow_name: flow_name.to_string() });

    // One-shot loop-prevention flag per step index, local to this call —
    // shared `Step` values may be executed concurrently by sibling flows,
    // so this cannot live on the model itself (see model.rs doc comment).
    let mut has_jumped_on_failure = vec![false; flow.elements.len()];
    let mut index = 0usize;

    while index < flow.elements.len() {
        match &flow.elements[index] {
            FlowElement::Step(step) => {
                ctx.tracker
                    .set_current_step(flow_name, format!("Step '{}'", step.name))
                    .ok();
                ctx.output
                    .publish(Event::StepStarted { flow_name: flow_name.to_string(), step_name: step.name.clone() });
                let execution = step_executor::execute(step, &ctx.dispatcher).await;
                if execution.retry_attempts > 0 {
                    ctx.output.publish(Event::StepProgress {
                        flow_name: flow_name.to_string(),
                        step_name: step.name.clone(),
                        retry_attempts: execution.retry_attempts,
                    });
                }
                ctx.output.publish(Event::StepCompleted {
                    flow_name: flow_name.to_string(),
                    step_name: step.name.clone(),
                    final_result: execution.final_result,
                });

                let outcome = if execution.final_result {
                    advance_on_success(flow, flow_name, step, index, &mut has_jumped_on_failure, ctx, execution).await
                } else {
                    handle_failure(flow, flow_name, step, index, &mut has_jumped_on_failure, ctx, execution).await
                };
                match outcome {
                    Ok(next) => index = next,
                    Err(()) => return false,
                }
            }
            FlowElement::Parallel(group) => {
                let all_ok = execute_parallel_group(group, flow_name, ctx).await;
                if !all_ok {
                    fail_flow(flow_name, ctx, "parallel group failed".to_string());
                    return false;
                }
                if group.wait_after_seconds > 0.0 {
                    tokio::time::sleep(std::time::Duration::from_secs_f64(group.wait_after_seconds)).await;
                }
                index += 1;
            }
            FlowElement::Nested(inner) => {
                let nested_name = format!("{flow_name}/{}", inner.name);
                let nested_ok = Box::pin(execute(inner, &nested_name, ctx)).await;
                if !nested_ok {
                    fail_flow(flow_name, ctx, format!("nested flow '{}' failed", inner.name));
                    return false;
                }
                index += 1;
            }
        }
    }

    ctx.tracker.set_flow_completed(flow_name).ok();
    ctx.output.publish(Event::FlowCompleted { flow_name: flow_name.to_string() });
    true
}

/// Applies the success-path jump/advance logic shared by a plain success and
/// a post-optional-flow retry success (SPEC_FULL §4.3 step 2).
async fn advance_on_success(
    flow: &Flow,
    flow_name: &str,
    step: &Step,
    index: usize,
    has_jumped_on_failure: &mut [bool],
    ctx: &FlowExecutorContext<'_>,
    mut execution: StepExecution,
) -> Result<usize, ()> {
    let next = if let Some(tag) = &step.jump_on_success {
        let Some(&target) = flow.tag_to_index.get(tag) else {
            ctx.tracker.append_step(flow_name, execution).ok();
            fail_flow(flow_name, ctx, format!("jump target '{tag}' unresolved"));
            return Err(());
        };
        if target == index {
            ctx.tracker.append_step(flow_name, execution).ok();
            fail_flow(flow_name, ctx, "self-jump on success is not allowed".to_string());
            return Err(());
        }
        execution.jump_taken = JumpTaken::Success;
        execution.jump_target = Some(tag.clone());
        for flag in has_jumped_on_failure.iter_mut().take(target) {
            *flag = false;
        }
        target
    } else {
        index + 1
    };

    ctx.tracker.append_step(flow_name, execution).ok();

    if step.wait_after_seconds > 0.0 {
        tokio::time::sleep(std::time::Duration::from_secs_f64(step.wait_after_seconds)).await;
    }
    Ok(next)
}

/// Evaluates the fixed-order failure policy: optional flow, then
/// jump-on-failure, then error handler (SPEC_FULL §4.3 step 2, failure
/// path).
async fn handle_failure(
    flow: &Flow,
    flow_name: &str,
    step: &Step,
    index: usize,
    has_jumped_on_failure: &mut [bool],
    ctx: &FlowExecutorContext<'_>,
    mut execution: StepExecution,
) -> Result<usize, ()> {
    if let Some(opt_name) = &step.execute_optional_flow {
        match ctx.optional_flows.get(opt_name) {
            None => {
                tracing::warn!(optional_flow = %opt_name, "optional flow not found, continuing to jump/handler");
            }
            Some(opt_flow) => {
                let child_name = format!("{flow_name}/optional/{opt_name}");
                ctx.tracker.add_flow(&child_name, opt_flow.elements.len() as u32, Some(flow_name), Some(&step.name));
                let opt_result = Box::pin(execute(opt_flow, &child_name, ctx)).await;
                execution.optional_flows_triggered.push(opt_name.clone());
                execution.optional_flow_results.insert(opt_name.clone(), opt_result);

                if !opt_result {
                    ctx.tracker.append_step(flow_name, execution).ok();
                    fail_flow(flow_name, ctx, format!("optional flow '{opt_name}' failed"));
                    return Err(());
                }

                let retried_step = step.with_extra_retry();
                let mut retried_execution = step_executor::execute(&retried_step, &ctx.dispatcher).await;
                retried_execution.optional_flows_triggered = execution.optional_flows_triggered.clone();
                retried_execution.optional_flow_results = execution.optional_flow_results.clone();
                if retried_execution.final_result {
                    return advance_on_success(flow, flow_name, step, index, has_jumped_on_failure, ctx, retried_execution).await;
                }
                execution = retried_execution;
            }
        }
    }

    if let Some(tag) = &step.jump_on_failure {
        if !has_jumped_on_failure[index] {
            let Some(&target) = flow.tag_to_index.get(tag) else {
                ctx.tracker.append_step(flow_name, execution).ok();
                fail_flow(flow_name, ctx, format!("jump target '{tag}' unresolved"));
                return Err(());
            };
            has_jumped_on_failure[index] = true;
            for flag in has_jumped_on_failure.iter_mut().take(target) {
                *flag = false;
            }
            execution.jump_taken = JumpTaken::Failure;
            execution.jump_target = Some(tag.clone());
            ctx.tracker.append_step(flow_name, execution).ok();
            return Ok(target);
        }
    }

    let last_message = execution.error_messages.last().cloned().unwrap_or_default();

    if let Some(handler_name) = &step.execute_on_error {
        let handler_ctx = ErrorContext {
            flow_name: flow_name.to_string(),
            device_type: step.device_type.to_string(),
            device_id: step.device_id.clone(),
            operation: step.operation.clone(),
            parameters: step.parameters.clone(),
            retry_attempts: execution.retry_attempts,
            optional_flow_executed: execution.optional_flows_triggered.first().cloned(),
        };
        let handled = ctx.registry.invoke(handler_name, step, &last_message, &handler_ctx);
        execution.error_handler_name = Some(handler_name.clone());
        execution.error_handler_result = Some(handled);
        ctx.tracker.append_step(flow_name, execution).ok();
        if handled {
            return Ok(index + 1);
        }
        fail_flow(flow_name, ctx, format!("step '{}' failed: {last_message}", step.name));
        return Err(());
    }

    ctx.tracker.append_step(flow_name, execution).ok();
    fail_flow(flow_name, ctx, format!("step '{}' failed: {last_message}", step.name));
    Err(())
}

fn fail_flow(flow_name: &str, ctx: &FlowExecutorContext<'_>, message: String) {
    ctx.tracker.set_flow_failed(flow_name, vec![message.clone()], message.clone()).ok();
    ctx.output.publish(Event::FlowFailed { flow_name: flow_name.to_string(), error_messages: vec![message] });
}

/// Runs every member concurrently, bounded by `max_workers` (defaulting to
/// the member count), and succeeds only if every member does
/// (SPEC_FULL §4.3.1 / §5).
async fn execute_parallel_group(group: &ParallelGroup, flow_name: &str, ctx: &FlowExecutorContext<'_>) -> bool {
    let max_workers = group.max_workers.unwrap_or_else(|| group.members.len().max(1));
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut join_set: JoinSet<StepExecution> = JoinSet::new();

    for member in group.members.clone() {
        ctx.output
            .publish(Event::StepStarted { flow_name: flow_name.to_string(), step_name: member.name.clone() });
        let semaphore = Arc::clone(&semaphore);
        let dispatcher = Arc::clone(&ctx.dispatcher);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            step_executor::execute(&member, &dispatcher).await
        });
    }

    let mut all_ok = true;
    while let Some(joined) = join_set.join_next().await {
        let execution = match joined {
            Ok(execution) => execution,
            Err(_) => {
                let mut execution = StepExecution::new("parallel-member", None, Default::default());
                execution.complete(false, vec!["group member task panicked".to_string()]);
                execution
            }
        };
        if !execution.final_result {
            all_ok = false;
        }
        ctx.output.publish(Event::StepCompleted {
            flow_name: flow_name.to_string(),
            step_name: execution.step_name.clone(),
            final_result: execution.final_result,
        });
        ctx.tracker.append_step(flow_name, execution).ok();
    }
    all_ok
}
