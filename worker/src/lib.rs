//! echoscribe transcription worker.
//!
//! Hosts drive the worker through message passing: [`spawn`] starts the
//! controller task and returns a [`WorkerHandle`] carrying the request
//! sender and an event subscription. Requests and events use the
//! [`echoscribe_proto`] types, so the same surface serializes cleanly for
//! out-of-process hosts.

pub mod accumulator;
pub mod config;
pub mod controller;
pub mod dirs;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod wav;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use config::Config;
use controller::TranscriptionController;
use engine::local::LocalEngine;
use engine::remote::RemoteEngine;
use events::EventSink;
use models::ModelManager;

/// Environment variable overriding the configured log level.
pub const LOG_ENV_VAR: &str = "ECHOSCRIBE_LOG";

/// Text of the synthetic segment emitted for audio with no detectable
/// speech.
pub const NO_SPEECH_TEXT: &str = "No speech detected in audio.";

/// Handle to a running worker.
pub struct WorkerHandle {
    requests: mpsc::Sender<echoscribe_proto::WorkerRequest>,
    events: EventSink,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Send one request to the worker. Fails only after [`shutdown`].
    ///
    /// [`shutdown`]: WorkerHandle::shutdown
    pub async fn send(&self, request: echoscribe_proto::WorkerRequest) -> anyhow::Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("worker is shut down"))
    }

    /// Subscribe to the worker's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<echoscribe_proto::WorkerEvent> {
        self.events.subscribe()
    }

    /// Close the request channel and wait for the controller to dispose and
    /// stop.
    pub async fn shutdown(self) {
        drop(self.requests);
        let _ = self.task.await;
    }
}

/// Spawn a worker with the default local inference backend.
pub fn spawn(config: Config) -> anyhow::Result<WorkerHandle> {
    spawn_with_loader(config, engine::default_loader())
}

/// Spawn a worker with an injected decoder loader.
pub fn spawn_with_loader(
    config: Config,
    loader: Arc<dyn engine::DecoderLoader>,
) -> anyhow::Result<WorkerHandle> {
    let (req_tx, req_rx) = mpsc::channel(16);
    let (ev_tx, _) = broadcast::channel(256);
    let sink = EventSink::new(ev_tx);

    let local = LocalEngine::new(config.local.clone(), ModelManager::new()?, loader);
    let remote = RemoteEngine::new(config.revai.clone());
    let controller = TranscriptionController::new(config, sink.clone(), local, remote);
    let task = tokio::spawn(controller.run(req_rx));

    Ok(WorkerHandle {
        requests: req_tx,
        events: sink,
        task,
    })
}
