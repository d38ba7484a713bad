//! Worker-side transcription controller.
//!
//! Owns the engines and drives the per-job lifecycle: at most one job is
//! active at a time, every job emits exactly one terminal event, and
//! cancellation and disposal are safe in any state. Requests arrive on an
//! mpsc channel and events leave through the broadcast [`EventSink`], the
//! in-process rendition of a message-passing worker boundary.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::local::LocalEngine;
use crate::engine::remote::{RemoteEngine, SubmitOptions};
use crate::error::{JobError, JobOutcome};
use crate::events::EventSink;
use crate::wav;
use echoscribe_proto::{
    CaptionFormat, EngineChoice, LoadingStatus, Segment, WorkerEvent, WorkerRequest,
};

/// Coarse lifecycle phase of the active job, as seen by the controller.
/// Finer-grained states (downloading, transcribing) travel in the event
/// stream; this exists for submission guarding and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Running,
    Complete,
    Error,
    Cancelled,
}

struct ActiveJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    phase: watch::Receiver<JobPhase>,
}

/// One-job-at-a-time transcription state machine.
pub struct TranscriptionController {
    config: Config,
    sink: EventSink,
    local: Arc<Mutex<LocalEngine>>,
    remote: Arc<RemoteEngine>,
    active: Option<ActiveJob>,
    /// Key seen on the most recent remote submission, reused for caption
    /// fetches that arrive after the job completed.
    last_api_key: Option<String>,
}

impl TranscriptionController {
    pub fn new(
        config: Config,
        sink: EventSink,
        local: LocalEngine,
        remote: RemoteEngine,
    ) -> Self {
        Self {
            config,
            sink,
            local: Arc::new(Mutex::new(local)),
            remote: Arc::new(remote),
            active: None,
            last_api_key: None,
        }
    }

    /// Serve requests until the channel closes, then dispose.
    pub async fn run(mut self, mut requests: mpsc::Receiver<WorkerRequest>) {
        info!("Transcription controller started");
        while let Some(request) = requests.recv().await {
            self.handle(request).await;
        }
        self.dispose().await;
        info!("Transcription controller stopped");
    }

    async fn handle(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::InferenceRequest {
                audio,
                model_name,
                api_key,
                custom_vocabulary,
                rush,
                verbatim,
                human_transcription,
                model,
            } => {
                if let Some(key) = &api_key {
                    self.last_api_key = Some(key.clone());
                }
                let options = SubmitOptions {
                    custom_vocabulary,
                    rush: rush.unwrap_or(false),
                    verbatim: verbatim.unwrap_or(false),
                    human_transcription: human_transcription.unwrap_or(false),
                };
                let engine = model.unwrap_or(self.config.engine.default);
                self.submit(audio, model_name, options, api_key, engine);
            }
            WorkerRequest::CancelTranscription => self.cancel(),
            WorkerRequest::Dispose => self.dispose().await,
            WorkerRequest::CaptionsRequest {
                job_id,
                caption_format,
            } => self.fetch_captions(job_id, caption_format),
        }
    }

    /// Start a new job unless one is active. Validation happens here,
    /// before any engine is touched.
    fn submit(
        &mut self,
        audio: Vec<f32>,
        model_name: Option<String>,
        options: SubmitOptions,
        api_key: Option<String>,
        engine: EngineChoice,
    ) {
        if let Some(active) = &self.active
            && !active.handle.is_finished()
        {
            warn!(
                phase = ?*active.phase.borrow(),
                "Ignoring job submission while a job is active"
            );
            return;
        }

        let duration = wav::duration_secs(&audio);
        let limits = &self.config.limits;
        if duration < limits.min_duration_secs {
            let error = JobError::Validation(format!(
                "duration {duration:.2}s is below the {:.1}s minimum",
                limits.min_duration_secs
            ));
            self.sink
                .loading_error(LoadingStatus::Error, error.to_string());
            return;
        }
        if duration > limits.max_duration_secs {
            let error = JobError::Validation(format!(
                "duration {duration:.1}s exceeds the {:.0}s maximum",
                limits.max_duration_secs
            ));
            self.sink
                .loading_error(LoadingStatus::Error, error.to_string());
            return;
        }

        // Silence is a successful outcome with a synthetic segment, not an
        // error.
        if wav::rms(&audio) <= limits.rms_speech_threshold {
            info!(duration, "Input is silent, completing without inference");
            let end = duration.round() as u32;
            let segment = Segment {
                index: 0,
                text: crate::NO_SPEECH_TEXT.to_string(),
                start: 0,
                end,
                speaker: None,
            };
            self.sink.result(vec![segment], true, end, None);
            self.sink.inference_done(None);
            return;
        }

        info!(?engine, duration, "Starting transcription job");
        let cancel = CancellationToken::new();
        let (phase_tx, phase_rx) = watch::channel(JobPhase::Running);
        let sink = self.sink.clone();
        let local = Arc::clone(&self.local);
        let remote = Arc::clone(&self.remote);
        let job_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let outcome = match engine {
                EngineChoice::Local => {
                    let mut local = local.lock().await;
                    local
                        .run(audio, model_name.as_deref(), &sink, &job_cancel)
                        .await
                }
                EngineChoice::Revai => {
                    remote
                        .run(audio, options, api_key.as_deref(), &sink, &job_cancel)
                        .await
                }
            };
            let _ = phase_tx.send(finish(&sink, outcome));
        });

        self.active = Some(ActiveJob {
            cancel,
            handle,
            phase: phase_rx,
        });
    }

    /// Request cooperative cancellation of the active job. The terminal
    /// `CANCELLED` event comes from the job itself once it unwinds.
    fn cancel(&self) {
        match &self.active {
            Some(active) if !active.handle.is_finished() => {
                info!("Cancelling active job");
                active.cancel.cancel();
            }
            _ => debug!("Cancel requested with no active job"),
        }
    }

    /// Cancel any active job, wait for it to unwind, and release the local
    /// engine's model state. Safe in any state.
    async fn dispose(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if let Err(error) = active.handle.await {
                warn!(%error, "Job task ended abnormally during dispose");
            }
        }
        self.local.lock().await.dispose();
        info!("Worker disposed");
    }

    /// Fetch the remote service's native captions for a completed job.
    /// Runs detached; a live transcription job is not blocked.
    fn fetch_captions(&self, job_id: String, format: CaptionFormat) {
        let Some(key) = self.remote.resolve_key(self.last_api_key.as_deref()) else {
            self.sink.loading_error(
                LoadingStatus::Error,
                "no Rev AI API key available for caption fetch",
            );
            return;
        };
        let client = self.remote.client(&key);
        let sink = self.sink.clone();
        tokio::spawn(async move {
            match client.captions(&job_id, format).await {
                Ok(captions) => {
                    debug!(job_id, format = format.as_str(), "Captions fetched");
                    sink.emit(WorkerEvent::CaptionsResult {
                        captions,
                        format,
                        job_id,
                    });
                }
                Err(error) => {
                    warn!(%error, job_id, "Caption fetch failed");
                    sink.loading_error(LoadingStatus::Error, error.to_string());
                }
            }
        });
    }
}

/// Emit the single terminal event sequence for a finished job.
fn finish(sink: &EventSink, outcome: Result<JobOutcome, JobError>) -> JobPhase {
    match outcome {
        Ok(JobOutcome::Complete { segments, job_id }) => {
            let completed_until = segments.last().map_or(0, |s| s.end);
            info!(
                segments = segments.len(),
                job_id = job_id.as_deref().unwrap_or("-"),
                "Job complete"
            );
            sink.result(segments, true, completed_until, job_id.clone());
            sink.inference_done(job_id);
            JobPhase::Complete
        }
        Ok(JobOutcome::Cancelled) => {
            info!("Job cancelled");
            sink.cancelled();
            JobPhase::Cancelled
        }
        Err(error) => {
            warn!(%error, "Job failed");
            let status = match &error {
                JobError::Processing(_) | JobError::Timeout(_) => LoadingStatus::Failed,
                JobError::Validation(_) | JobError::Acquisition(_) => LoadingStatus::Error,
            };
            sink.loading_error(status, error.to_string());
            JobPhase::Error
        }
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod tests;
