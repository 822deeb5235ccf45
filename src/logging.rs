//! Ambient logging: an installable `tracing-subscriber` pipeline plus the
//! per-step ERROR-message collector the Step Executor scopes around each
//! attempt-set (SPEC_FULL §4.2/§5.1).

use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (defaulting to
/// `info`), the same shape as the teacher ecosystem's
/// `tracing_subscriber::registry().with(...).with(...).init()` chain.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(StepErrorCollectorLayer)
        .init();
}

tokio::task_local! {
    static STEP_ERROR_SINK: Arc<Mutex<Vec<String>>>;
}

/// A guard that installs a fresh error sink for the duration of one Step
/// Executor attempt-set and hands back the collected messages when dropped.
/// `Drop` is not relied upon for flushing (async drop doesn't exist); call
/// [`StepErrorScope::finish`] explicitly on every exit path instead.
pub struct StepErrorScope;

impl StepErrorScope {
    /// Runs `fut` with a fresh, task-local error sink installed, returning
    /// `(future's output, collected ERROR messages)`.
    pub async fn run<F, T>(fut: F) -> (T, Vec<String>)
    where
        F: std::future::Future<Output = T>,
    {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let output = STEP_ERROR_SINK.scope(Arc::clone(&sink), fut).await;
        let messages = sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        (output, messages)
    }
}

struct StepErrorCollectorLayer;

struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for StepErrorCollectorLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != tracing::Level::ERROR {
            return;
        }
        let Ok(sink) = STEP_ERROR_SINK.try_with(Arc::clone) else {
            return;
        };
        let mut visitor = MessageVisitor { message: None };
        event.record(&mut visitor);
        if let Some(message) = visitor.message {
            sink.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(message);
        }
    }
}
