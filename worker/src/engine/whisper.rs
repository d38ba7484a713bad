//! Whisper inference backend.
//!
//! Uses whisper.cpp via whisper-rs. Compiled in only with the `whisper`
//! feature; without it the worker falls back to the remote engine.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState,
};

use super::{ChunkDecoder, DecoderLoader, InferenceOutput};
use crate::accumulator::RawChunk;

/// Builds [`WhisperDecoder`]s from downloaded GGML weights.
#[derive(Default)]
pub struct WhisperLoader;

impl DecoderLoader for WhisperLoader {
    fn load(
        &self,
        candidate: &str,
        artifacts: &[PathBuf],
    ) -> anyhow::Result<Box<dyn ChunkDecoder>> {
        let model_path = artifacts
            .first()
            .context("model candidate has no artifacts")?;
        Ok(Box::new(WhisperDecoder::new(candidate, model_path)?))
    }
}

/// Whisper speech-to-text decoder.
///
/// The underlying WhisperContext is leaked intentionally - for a long-lived
/// worker the model stays loaded until `DISPOSE`, and a 'static reference
/// avoids self-referential struct patterns while the state is reused across
/// windows.
pub struct WhisperDecoder {
    name: String,
    state: WhisperState,
}

impl WhisperDecoder {
    pub fn new(name: &str, model_path: impl AsRef<Path>) -> Result<Self> {
        // Route whisper.cpp and GGML logs through tracing
        static LOG_HOOKS: std::sync::Once = std::sync::Once::new();
        LOG_HOOKS.call_once(whisper_rs::install_logging_hooks);

        let path = model_path
            .as_ref()
            .to_str()
            .context("Invalid model path")?
            .to_string();

        info!(path = %path, model = name, "Loading Whisper model");

        // GPU first; a machine without one still gets a working decoder, and
        // a device failure must not consume a fallback attempt.
        let mut gpu = WhisperContextParameters::default();
        gpu.use_gpu(true);
        let ctx = match WhisperContext::new_with_params(&path, gpu) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(error = %err, "GPU context failed, retrying on CPU");
                let mut cpu = WhisperContextParameters::default();
                cpu.use_gpu(false);
                WhisperContext::new_with_params(&path, cpu)
                    .context("Failed to load Whisper model")?
            }
        };

        // Box and leak the context to get a 'static reference; the model
        // lives until the worker is disposed.
        let ctx_ref: &'static WhisperContext = Box::leak(Box::new(ctx));
        let state = ctx_ref
            .create_state()
            .context("Failed to create Whisper state")?;

        info!(model = name, "Whisper model and state loaded");

        Ok(Self {
            name: name.to_string(),
            state,
        })
    }
}

impl ChunkDecoder for WhisperDecoder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn decode_window(&mut self, samples: &[f32], offset: u32) -> Result<InferenceOutput> {
        debug!(
            samples = samples.len(),
            offset, "Decoding window with Whisper"
        );

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some("en"));
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_token_timestamps(true);

        self.state
            .full(params, samples)
            .context("Whisper inference failed")?;

        let num_segments = self.state.full_n_segments();
        let mut chunks = Vec::new();
        for i in 0..num_segments {
            let Some(segment) = self.state.get_segment(i) else {
                continue;
            };
            let Ok(text) = segment.to_str_lossy() else {
                continue;
            };
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            // whisper reports centiseconds relative to the window start
            let start = offset + (segment.start_timestamp() as f32 / 100.0).round() as u32;
            let end = offset + (segment.end_timestamp() as f32 / 100.0).round() as u32;
            chunks.push(RawChunk {
                text,
                start,
                end: Some(end),
                speaker: None,
            });
        }

        debug!(chunks = chunks.len(), "Window decoded");

        Ok(if chunks.is_empty() {
            InferenceOutput::Empty
        } else {
            InferenceOutput::Chunks(chunks)
        })
    }
}
