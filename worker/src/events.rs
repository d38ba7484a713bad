//! Lifecycle event emission toward the host.

use echoscribe_proto::{LoadingStatus, PartialResult, Segment, WorkerEvent};
use tokio::sync::broadcast;

/// Shared sender for worker lifecycle events.
///
/// Wraps a broadcast channel so any number of host-side consumers can
/// subscribe; send errors (no subscribers) are ignored, matching the
/// fire-and-forget postMessage semantics of the protocol.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventSink {
    pub fn new(tx: broadcast::Sender<WorkerEvent>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn loading(&self, status: LoadingStatus) {
        self.emit(WorkerEvent::loading(status));
    }

    pub fn loading_error(&self, status: LoadingStatus, error: impl Into<String>) {
        self.emit(WorkerEvent::loading_error(status, error));
    }

    /// `LOADING`/`loading` with a progress fraction and human-readable detail.
    pub fn loading_progress(&self, progress: f32, details: impl Into<String>) {
        self.emit(WorkerEvent::Loading {
            status: LoadingStatus::Loading,
            error: None,
            attempt: None,
            max_attempts: None,
            progress: Some(progress),
            details: Some(details.into()),
        });
    }

    /// Per-attempt model load failure, before the retry policy gives up.
    pub fn loading_attempt_error(&self, error: impl Into<String>, attempt: u32, max: u32) {
        self.emit(WorkerEvent::Loading {
            status: LoadingStatus::Error,
            error: Some(error.into()),
            attempt: Some(attempt),
            max_attempts: Some(max),
            progress: None,
            details: None,
        });
    }

    pub fn downloading(&self, file: &str, progress: f32, loaded: u64, total: u64) {
        self.emit(WorkerEvent::Downloading {
            file: file.to_string(),
            progress,
            loaded,
            total,
        });
    }

    pub fn result(
        &self,
        results: Vec<Segment>,
        is_done: bool,
        completed_until: u32,
        job_id: Option<String>,
    ) {
        self.emit(WorkerEvent::Result {
            results,
            is_done,
            completed_until_timestamp: completed_until,
            job_id,
        });
    }

    pub fn partial(&self, text: String, start: u32) {
        self.emit(WorkerEvent::ResultPartial {
            result: PartialResult {
                text,
                start,
                end: None,
            },
        });
    }

    pub fn inference_done(&self, job_id: Option<String>) {
        self.emit(WorkerEvent::InferenceDone { job_id });
    }

    pub fn cancelled(&self) {
        self.emit(WorkerEvent::Cancelled);
    }
}
