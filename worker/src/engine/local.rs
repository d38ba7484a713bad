//! Local engine: ordered multi-candidate model acquisition and windowed
//! chunk inference.
//!
//! Inference runs once per job over the whole buffer, sliced into
//! overlapping windows (window > stride). Each decoded window is pushed
//! through a channel and merged by the [`ResultAccumulator`]; the host sees
//! a monotonically improving transcript, never a delta.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{RawChunk, ResultAccumulator};
use crate::config::LocalConfig;
use crate::engine::{ChunkDecoder, DecoderLoader, InferenceOutput};
use crate::error::{JobError, JobOutcome};
use crate::events::EventSink;
use crate::models::{self, DownloadTracker, ModelCandidate, ModelManager};
use crate::wav::SAMPLE_RATE;
use echoscribe_proto::LoadingStatus;

/// Model state persisted across jobs within one worker lifetime.
///
/// `cursor` remembers the last candidate index that loaded successfully so a
/// later cold start skips candidates already known bad; it survives
/// `dispose` (the weights do not) and resets to 0 once every candidate has
/// been exhausted.
#[derive(Default)]
struct LocalEngineState {
    cursor: usize,
    decoder: Option<Box<dyn ChunkDecoder>>,
    tracker: DownloadTracker,
}

enum Acquire {
    Ready,
    Cancelled,
}

/// In-process transcription engine.
pub struct LocalEngine {
    config: LocalConfig,
    manager: ModelManager,
    loader: Arc<dyn DecoderLoader>,
    candidates: Vec<ModelCandidate>,
    state: LocalEngineState,
}

impl LocalEngine {
    pub fn new(config: LocalConfig, manager: ModelManager, loader: Arc<dyn DecoderLoader>) -> Self {
        let candidates = models::candidates_for(config.model.as_deref());
        Self {
            config,
            manager,
            loader,
            candidates,
            state: LocalEngineState::default(),
        }
    }

    /// Replace the built-in candidate list (embedders and tests).
    pub fn with_candidates(mut self, candidates: Vec<ModelCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Whether a decoder is loaded and memoized.
    pub fn is_loaded(&self) -> bool {
        self.state.decoder.is_some()
    }

    #[cfg(test)]
    fn tracked_files(&self) -> usize {
        self.state.tracker.file_count()
    }

    /// Release the loaded model weights and download bookkeeping. The
    /// candidate cursor is kept so the next load skips known-bad entries.
    pub fn dispose(&mut self) {
        if self.state.decoder.take().is_some() {
            info!("Released local model instance");
        }
        self.state.tracker.reset();
    }

    /// Run one inference job over `audio`. Emits intermediate events through
    /// `sink`; the terminal events are the controller's responsibility.
    pub async fn run(
        &mut self,
        audio: Vec<f32>,
        pinned_model: Option<&str>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        sink.loading(LoadingStatus::Loading);
        match self.acquire(pinned_model, sink, cancel).await? {
            Acquire::Cancelled => return Ok(JobOutcome::Cancelled),
            Acquire::Ready => {}
        }
        sink.loading(LoadingStatus::Success);

        let Some(mut decoder) = self.state.decoder.take() else {
            return Err(JobError::Processing("no decoder after acquisition".into()));
        };

        let duration = crate::wav::duration_secs(&audio).round() as u32;
        let window = self.config.window_secs;
        let stride = self.config.stride_secs;
        let partial_every = self.config.partial_every;

        let (tx, mut rx) = mpsc::channel::<DecodeEvent>(32);
        let decode_cancel = cancel.child_token();
        let decode_token = decode_cancel.clone();
        let join = task::spawn_blocking(move || {
            let output = decode_all(
                decoder.as_mut(),
                &audio,
                window,
                stride,
                partial_every,
                &tx,
                &decode_token,
            );
            (decoder, output)
        });

        let mut acc = ResultAccumulator::new(stride);
        let budget = Duration::from_secs(self.config.inference_timeout_secs);
        let consumed = timeout(budget, async {
            while let Some(event) = rx.recv().await {
                if cancel.is_cancelled() {
                    continue;
                }
                match event {
                    DecodeEvent::Partial { text, start } => sink.partial(text, start),
                    DecodeEvent::Chunk(chunk) => {
                        acc.merge(chunk);
                        sink.result(acc.segments().to_vec(), false, acc.last_timestamp(), None);
                    }
                }
            }
            join.await
        })
        .await;

        let joined = match consumed {
            Err(_) => {
                decode_cancel.cancel();
                return Err(JobError::Timeout(format!(
                    "inference exceeded the {}s wall-clock budget",
                    self.config.inference_timeout_secs
                )));
            }
            Ok(Err(join_err)) => {
                return Err(JobError::Processing(format!(
                    "inference task failed: {join_err}"
                )));
            }
            Ok(Ok(joined)) => joined,
        };

        let (decoder, output) = joined;
        // The instance stays loaded for later jobs in this worker lifetime.
        self.state.decoder = Some(decoder);

        if cancel.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }

        let output = output.map_err(|e| JobError::Processing(e.to_string()))?;
        if acc.is_empty() {
            synthesize_from_aggregate(&mut acc, output, duration);
        }

        Ok(JobOutcome::Complete {
            segments: acc.into_segments(),
            job_id: None,
        })
    }

    /// Walk the candidate list from the cursor until a decoder loads.
    ///
    /// Parse-style download failures (HTML error page instead of weights)
    /// move on immediately; anything else waits an exponential backoff
    /// first. Exhausting the list resets the cursor and fails the job.
    async fn acquire(
        &mut self,
        pinned_model: Option<&str>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Acquire, JobError> {
        if self.state.decoder.is_some() {
            debug!("Reusing loaded model instance");
            return Ok(Acquire::Ready);
        }

        let candidates = match pinned_model {
            Some(name) => models::candidates_for(Some(name)),
            None => self.candidates.clone(),
        };
        let max_attempts = candidates.len() as u32;
        let start = self.state.cursor.min(candidates.len().saturating_sub(1));
        let load_budget = Duration::from_secs(self.config.load_timeout_secs);

        let mut last_error: Option<anyhow::Error> = None;
        let mut backoffs = 0u32;

        for (i, candidate) in candidates.iter().enumerate().skip(start) {
            if cancel.is_cancelled() {
                return Ok(Acquire::Cancelled);
            }
            // fresh fraction per candidate; a failed predecessor's partial
            // bytes must not deflate this one's overall progress
            self.state.tracker.reset();
            info!(
                candidate = %candidate.name,
                attempt = i + 1,
                total = candidates.len(),
                "Trying model candidate"
            );

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Ok(Acquire::Cancelled),
                attempt = self.try_candidate(candidate, load_budget, sink) => attempt,
            };

            match attempt {
                Ok(decoder) => {
                    info!(model = decoder.model_name(), "Model candidate loaded");
                    self.state.cursor = i;
                    self.state.decoder = Some(decoder);
                    return Ok(Acquire::Ready);
                }
                Err(error) => {
                    warn!(candidate = %candidate.name, error = %error, "Model candidate failed");
                    sink.loading_attempt_error(error.to_string(), (i + 1) as u32, max_attempts);

                    let parse_failure = models::is_parse_failure(&error);
                    last_error = Some(error);
                    // no delay before the fatal error once the list is spent
                    if parse_failure || i + 1 >= candidates.len() {
                        continue;
                    }

                    backoffs += 1;
                    let delay = Duration::from_secs(1 << backoffs.min(4));
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(Acquire::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        // Candidates are not blacklisted permanently; a future cold start
        // retries from the beginning.
        self.state.cursor = 0;
        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        Err(JobError::Acquisition(format!(
            "failed to load any model candidate; last error: {last}"
        )))
    }

    /// Download and load one candidate. Cancellation is handled by the
    /// caller dropping this future, which aborts any in-flight transfer.
    async fn try_candidate(
        &mut self,
        candidate: &ModelCandidate,
        load_budget: Duration,
        sink: &EventSink,
    ) -> anyhow::Result<Box<dyn ChunkDecoder>> {
        let tracker = &mut self.state.tracker;
        let mut on_progress = |file: &str, loaded: u64, total: u64| {
            let overall = tracker.update(file, loaded, total);
            sink.downloading(file, overall, loaded, total);
        };
        let artifacts = self
            .manager
            .ensure_candidate(candidate, &mut on_progress)
            .await?;

        let loader = Arc::clone(&self.loader);
        let name = candidate.name.clone();
        let load = task::spawn_blocking(move || loader.load(&name, &artifacts));
        match timeout(load_budget, load).await {
            Err(_) => Err(anyhow!(
                "model load timeout after {}s",
                load_budget.as_secs()
            )),
            Ok(Err(join_err)) => Err(anyhow!("model load task failed: {join_err}")),
            Ok(Ok(result)) => result,
        }
    }
}

enum DecodeEvent {
    Partial { text: String, start: u32 },
    Chunk(RawChunk),
}

/// Blocking decode loop over overlapping windows.
///
/// Runs on a blocking thread; checks the cancellation token between windows
/// and stops pushing once the consumer goes away. Returns the aggregate
/// output for the fallback path where no chunk event ever fired.
fn decode_all(
    decoder: &mut dyn ChunkDecoder,
    audio: &[f32],
    window_secs: u32,
    stride_secs: u32,
    partial_every: u32,
    tx: &mpsc::Sender<DecodeEvent>,
    cancel: &CancellationToken,
) -> anyhow::Result<InferenceOutput> {
    let window_len = (window_secs * SAMPLE_RATE) as usize;
    let stride_len = (stride_secs * SAMPLE_RATE) as usize;

    let mut aggregate: Vec<RawChunk> = Vec::new();
    let mut decodes = 0u32;
    let mut start = 0usize;

    while start < audio.len() {
        if cancel.is_cancelled() {
            debug!("Decode loop cancelled");
            break;
        }

        let end = (start + window_len).min(audio.len());
        let offset = (start / SAMPLE_RATE as usize) as u32;
        let output = decoder.decode_window(&audio[start..end], offset)?;
        decodes += 1;

        let chunks = match output {
            InferenceOutput::Chunks(chunks) => chunks,
            InferenceOutput::FlatText(text) => vec![RawChunk::new(text, offset, None)],
            InferenceOutput::Empty => Vec::new(),
        };
        for chunk in chunks {
            aggregate.push(chunk.clone());
            if tx.blocking_send(DecodeEvent::Chunk(chunk)).is_err() {
                return Ok(InferenceOutput::Empty);
            }
        }

        if partial_every > 0
            && decodes % partial_every == 0
            && let Some(last) = aggregate.last()
        {
            let _ = tx.blocking_send(DecodeEvent::Partial {
                text: last.text.clone(),
                start: last.start,
            });
        }

        if end == audio.len() {
            break;
        }
        start += stride_len;
    }

    Ok(if aggregate.is_empty() {
        InferenceOutput::Empty
    } else {
        InferenceOutput::Chunks(aggregate)
    })
}

/// Fallback when the streaming channel never produced a chunk: synthesize
/// the final sequence directly from whatever aggregate shape came back.
fn synthesize_from_aggregate(acc: &mut ResultAccumulator, output: InferenceOutput, duration: u32) {
    match output {
        InferenceOutput::Chunks(chunks) => {
            for chunk in chunks {
                acc.merge(chunk);
            }
        }
        InferenceOutput::FlatText(text) => {
            acc.merge(RawChunk::new(text, 0, Some(duration)));
        }
        InferenceOutput::Empty => {}
    }
    if acc.is_empty() {
        acc.merge(RawChunk::new(crate::NO_SPEECH_TEXT, 0, Some(duration)));
    }
}

#[cfg(test)]
#[path = "local_test.rs"]
mod tests;
