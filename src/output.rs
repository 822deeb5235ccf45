//! Output Event Bus: a thin publish-subscribe surface over flow/step
//! lifecycle events, with four selectable presenter policies (SPEC_FULL
//! §4.8/§6).

use crate::progress::FlowInfo;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::broadcast;

/// One lifecycle notification. `#[non_exhaustive]` so new event kinds can be
/// added without breaking downstream `match` arms outside this crate.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    FlowAdded { flow_name: String },
    FlowRunning { flow_name: String },
    FlowCompleted { flow_name: String },
    FlowFailed { flow_name: String, error_messages: Vec<String> },
    StepStarted { flow_name: String, step_name: String },
    StepProgress { flow_name: String, step_name: String, retry_attempts: u32 },
    StepCompleted { flow_name: String, step_name: String, final_result: bool },
}

const CHANNEL_CAPACITY: usize = 1024;

/// Producers publish through this handle; it never awaits a subscriber.
#[derive(Clone)]
pub struct OutputBus {
    sender: broadcast::Sender<Event>,
}

impl OutputBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        OutputBus { sender }
    }

    pub fn publish(&self, event: Event) {
        // A lagging/absent subscriber yields Err(SendError); there being no
        // one listening is not itself an error condition for a publisher.
        let _ = self.sender.send(event);
    }

    /// Spawns `presenter` on its own task, subscribed to this bus. A
    /// presenter that panics is caught at its task boundary and logged, never
    /// propagated to the publisher or other subscribers.
    pub fn subscribe(&self, presenter: Box<dyn Presenter>) -> tokio::task::JoinHandle<()> {
        let receiver = self.sender.subscribe();
        tokio::spawn(run_presenter(presenter, receiver))
    }
}

impl Default for OutputBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_presenter(mut presenter: Box<dyn Presenter>, mut receiver: broadcast::Receiver<Event>) {
    let mut ticker = presenter.tick_interval().map(tokio::time::interval);

    loop {
        let outcome = match &mut ticker {
            Some(ticker) => {
                tokio::select! {
                    received = receiver.recv() => Outcome::Event(received),
                    _ = ticker.tick() => Outcome::Tick,
                }
            }
            None => Outcome::Event(receiver.recv().await),
        };

        match outcome {
            Outcome::Event(Ok(event)) => {
                if catch_presenter(AssertUnwindSafe(|| presenter.on_event(&event))).is_err() {
                    tracing::error!("presenter panicked while handling an event; continuing");
                }
            }
            Outcome::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::warn!(skipped, "presenter fell behind the output bus and dropped events");
            }
            Outcome::Event(Err(broadcast::error::RecvError::Closed)) => return,
            Outcome::Tick => {
                if catch_presenter(AssertUnwindSafe(|| presenter.on_tick())).is_err() {
                    tracing::error!("presenter panicked during its periodic refresh; continuing");
                }
            }
        }
    }
}

enum Outcome {
    Event(Result<Event, broadcast::error::RecvError>),
    Tick,
}

fn catch_presenter(f: impl FnOnce() + std::panic::UnwindSafe) -> Result<(), ()> {
    std::panic::catch_unwind(f).map_err(|_| ())
}

/// One output policy. `tick_interval` lets a presenter request a periodic
/// "redraw even with no new events" callback (used by [`LiveTable`]).
pub trait Presenter: Send + 'static {
    fn on_event(&mut self, event: &Event);

    fn on_tick(&mut self) {}

    fn tick_interval(&self) -> Option<Duration> {
        None
    }
}

/// Discards every event. The default when no presentation is requested.
pub struct Silent;

impl Presenter for Silent {
    fn on_event(&mut self, _event: &Event) {}
}

/// Redraws a one-line-per-flow summary table, refreshed at least once per
/// second while any flow is running (SPEC_FULL §4.8.1).
pub struct LiveTable {
    rows: std::collections::BTreeMap<String, String>,
}

impl LiveTable {
    pub fn new() -> Self {
        LiveTable { rows: std::collections::BTreeMap::new() }
    }

    fn redraw(&self) {
        for (flow_name, status) in &self.rows {
            println!("{flow_name:<32} {status}");
        }
    }
}

impl Default for LiveTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Presenter for LiveTable {
    fn on_event(&mut self, event: &Event) {
        let (flow_name, status) = match event {
            Event::FlowAdded { flow_name } => (flow_name.clone(), "added".to_string()),
            Event::FlowRunning { flow_name } => (flow_name.clone(), "running".to_string()),
            Event::FlowCompleted { flow_name } => (flow_name.clone(), "completed".to_string()),
            Event::FlowFailed { flow_name, .. } => (flow_name.clone(), "failed".to_string()),
            Event::StepStarted { flow_name, step_name } => (flow_name.clone(), format!("running: {step_name}")),
            Event::StepProgress { flow_name, step_name, retry_attempts } => {
                (flow_name.clone(), format!("retry {retry_attempts}: {step_name}"))
            }
            Event::StepCompleted { flow_name, step_name, final_result } => {
                (flow_name.clone(), format!("{step_name}: {}", if *final_result { "ok" } else { "failed" }))
            }
        };
        self.rows.insert(flow_name, status);
        self.redraw();
    }

    fn on_tick(&mut self) {
        self.redraw();
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }
}

/// Logs every event through `tracing` at `info` level.
pub struct LogStream;

impl Presenter for LogStream {
    fn on_event(&mut self, event: &Event) {
        match event {
            Event::FlowAdded { flow_name } => tracing::info!(flow = %flow_name, "flow added"),
            Event::FlowRunning { flow_name } => tracing::info!(flow = %flow_name, "flow running"),
            Event::FlowCompleted { flow_name } => tracing::info!(flow = %flow_name, "flow completed"),
            Event::FlowFailed { flow_name, error_messages } => {
                tracing::info!(flow = %flow_name, errors = ?error_messages, "flow failed")
            }
            Event::StepStarted { flow_name, step_name } => {
                tracing::info!(flow = %flow_name, step = %step_name, "step started")
            }
            Event::StepProgress { flow_name, step_name, retry_attempts } => {
                tracing::info!(flow = %flow_name, step = %step_name, retry_attempts, "step retrying")
            }
            Event::StepCompleted { flow_name, step_name, final_result } => {
                tracing::info!(flow = %flow_name, step = %step_name, final_result, "step completed")
            }
        }
    }
}

/// Accumulates the latest [`FlowInfo`] snapshots for external polling
/// (e.g. a CLI's `--json` flag reading progress without touching the
/// Progress Tracker directly).
pub struct JsonSnapshot {
    snapshots: std::collections::BTreeMap<String, String>,
}

impl JsonSnapshot {
    pub fn new() -> Self {
        JsonSnapshot { snapshots: std::collections::BTreeMap::new() }
    }

    pub fn record(&mut self, flow_name: &str, info: &FlowInfo) {
        match serde_json::to_string(info) {
            Ok(json) => {
                self.snapshots.insert(flow_name.to_string(), json);
            }
            Err(err) => tracing::warn!(flow = %flow_name, error = %err, "failed to serialize flow snapshot"),
        }
    }
}

impl Default for JsonSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Presenter for JsonSnapshot {
    fn on_event(&mut self, event: &Event) {
        let flow_name = match event {
            Event::FlowAdded { flow_name }
            | Event::FlowRunning { flow_name }
            | Event::FlowCompleted { flow_name }
            | Event::FlowFailed { flow_name, .. }
            | Event::StepStarted { flow_name, .. }
            | Event::StepProgress { flow_name, .. }
            | Event::StepCompleted { flow_name, .. } => flow_name.clone(),
        };
        println!("{{\"flow\":\"{flow_name}\",\"event\":\"{event:?}\"}}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingPresenter(Arc<AtomicUsize>);

    impl Presenter for CountingPresenter {
        fn on_event(&mut self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingPresenter;

    impl Presenter for PanickingPresenter {
        fn on_event(&mut self, _event: &Event) {
            panic!("presenter bug");
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = OutputBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = bus.subscribe(Box::new(CountingPresenter(Arc::clone(&count))));

        bus.publish(Event::FlowAdded { flow_name: "main".to_string() });
        bus.publish(Event::FlowCompleted { flow_name: "main".to_string() });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = OutputBus::new();
        bus.publish(Event::FlowAdded { flow_name: "main".to_string() });
    }

    #[tokio::test]
    async fn panicking_presenter_does_not_kill_its_task() {
        let bus = OutputBus::new();
        let handle = bus.subscribe(Box::new(PanickingPresenter));
        bus.publish(Event::FlowAdded { flow_name: "main".to_string() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
