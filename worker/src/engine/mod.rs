//! Transcription engines.
//!
//! Two engines sit behind the same job contract: [`local`] runs chunked
//! in-process inference with multi-candidate model fallback, [`remote`]
//! uploads the audio to Rev AI and polls. Both report through the shared
//! [`EventSink`](crate::events::EventSink) and honor cooperative
//! cancellation at every suspension point.

pub mod local;
pub mod remote;
#[cfg(feature = "whisper")]
pub mod whisper;

use std::path::PathBuf;
use std::sync::Arc;

use crate::accumulator::RawChunk;

/// Result shapes a decoder may produce for one window.
///
/// The shape is resolved once here, at the boundary where the opaque model
/// result is received, so nothing downstream has to sniff it again.
#[derive(Debug)]
pub enum InferenceOutput {
    /// Timed chunks, the normal streaming case.
    Chunks(Vec<RawChunk>),
    /// One undifferentiated transcript for the whole window.
    FlatText(String),
    /// The window decoded to nothing.
    Empty,
}

/// Decodes overlapping audio windows one at a time.
///
/// The driver guarantees windows arrive in order and that at most one job
/// is active per worker, so implementations can keep mutable model state.
pub trait ChunkDecoder: Send {
    /// Model identifier, for logging.
    fn model_name(&self) -> &str;

    /// Decode one window of 16 kHz mono samples. `offset` is the window
    /// start in whole seconds; timestamps in the output must be absolute.
    fn decode_window(&mut self, samples: &[f32], offset: u32) -> anyhow::Result<InferenceOutput>;
}

/// Builds a decoder from downloaded model artifacts.
///
/// Loading is blocking and potentially slow; the driver runs it on a
/// blocking thread under the model-load timeout.
pub trait DecoderLoader: Send + Sync {
    fn load(
        &self,
        candidate: &str,
        artifacts: &[PathBuf],
    ) -> anyhow::Result<Box<dyn ChunkDecoder>>;
}

/// Loader installed when no local inference backend is compiled in.
pub struct UnavailableLoader;

impl DecoderLoader for UnavailableLoader {
    fn load(
        &self,
        _candidate: &str,
        _artifacts: &[PathBuf],
    ) -> anyhow::Result<Box<dyn ChunkDecoder>> {
        anyhow::bail!(
            "no local inference backend compiled in; rebuild with the `whisper` feature or use the remote engine"
        )
    }
}

/// The loader the worker uses unless one is injected.
pub fn default_loader() -> Arc<dyn DecoderLoader> {
    #[cfg(feature = "whisper")]
    {
        Arc::new(whisper::WhisperLoader::default())
    }
    #[cfg(not(feature = "whisper"))]
    {
        Arc::new(UnavailableLoader)
    }
}
