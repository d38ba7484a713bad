//! Model download and management for the local engine.
//!
//! A model is described by an ordered list of interchangeable candidates;
//! the loader walks that list until one downloads and loads. Candidates may
//! ship as multiple binary artifacts, so download progress is tracked per
//! sub-file and combined into one overall fraction.

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const HF_BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// One binary artifact of a model candidate.
#[derive(Debug, Clone)]
pub struct ModelFile {
    /// Filename to save as.
    pub filename: String,
    /// Download URL.
    pub url: String,
    /// Expected file size for validation (optional).
    pub size_bytes: Option<u64>,
}

/// One entry in the ordered fallback list of interchangeable models.
#[derive(Debug, Clone)]
pub struct ModelCandidate {
    pub name: String,
    pub files: Vec<ModelFile>,
}

impl ModelCandidate {
    fn ggml(name: &str, size_bytes: Option<u64>) -> Self {
        let filename = format!("ggml-{name}.bin");
        Self {
            name: name.to_string(),
            files: vec![ModelFile {
                url: format!("{HF_BASE_URL}/{filename}"),
                filename,
                size_bytes,
            }],
        }
    }
}

/// Built-in candidate order: small English models first, growing only when
/// the smaller ones are unavailable.
pub fn default_candidates() -> Vec<ModelCandidate> {
    vec![
        ModelCandidate::ggml("tiny.en", Some(77_704_715)),
        ModelCandidate::ggml("tiny.en-q5_1", None),
        ModelCandidate::ggml("base.en", Some(147_964_211)),
        ModelCandidate::ggml("small.en", Some(487_614_201)),
    ]
}

/// Candidate list with an optional pinned first entry.
///
/// A pin naming a known candidate moves it to the front; an unknown name is
/// synthesized from the standard artifact naming and tried first.
pub fn candidates_for(pinned: Option<&str>) -> Vec<ModelCandidate> {
    let mut candidates = default_candidates();
    let Some(name) = pinned else {
        return candidates;
    };

    match candidates.iter().position(|c| c.name == name) {
        Some(i) => {
            let picked = candidates.remove(i);
            candidates.insert(0, picked);
        }
        None => candidates.insert(0, ModelCandidate::ggml(name, None)),
    }
    candidates
}

/// Marker for downloads that returned a page instead of binary model data
/// (typically a 404 proxied through a CDN). These skip the backoff delay and
/// move straight to the next candidate.
#[derive(Debug, Error)]
#[error("received an HTML page instead of model data for {file}")]
pub struct HtmlBodyError {
    pub file: String,
}

/// True when the failure is a parse-style failure (HTML error page), which
/// the fallback policy treats as "try the next candidate immediately".
pub fn is_parse_failure(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<HtmlBodyError>().is_some())
}

/// Combines per-sub-file byte counts into one overall download fraction.
///
/// Sub-files discovered mid-download are added to the denominator as soon as
/// their size is known, so the overall fraction can occasionally decrease;
/// that is accepted protocol behavior, not smoothed over here.
#[derive(Debug, Default)]
pub struct DownloadTracker {
    files: Vec<(String, u64, u64)>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.files.clear();
    }

    /// Number of sub-files currently tracked.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Record progress for one sub-file and return the overall fraction.
    pub fn update(&mut self, file: &str, loaded: u64, total: u64) -> f32 {
        match self.files.iter_mut().find(|(name, _, _)| name == file) {
            Some(entry) => {
                entry.1 = loaded;
                entry.2 = entry.2.max(total);
            }
            None => self.files.push((file.to_string(), loaded, total)),
        }

        let loaded_sum: u64 = self.files.iter().map(|(_, l, _)| *l).sum();
        let total_sum: u64 = self.files.iter().map(|(_, _, t)| *t).sum();
        if total_sum == 0 {
            return 0.0;
        }
        (loaded_sum as f64 / total_sum as f64).min(1.0) as f32
    }
}

/// Per-sub-file progress callback: `(filename, bytes_loaded, bytes_total)`.
/// `Send` because downloads run inside spawned job tasks.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(&str, u64, u64) + Send);

/// Manages model downloads and storage.
pub struct ModelManager {
    models_dir: PathBuf,
    http: reqwest::Client,
}

impl ModelManager {
    /// Create a new ModelManager using the default models directory.
    ///
    /// Default: `~/.local/share/echoscribe/models/`
    pub fn new() -> Result<Self> {
        Ok(Self::with_dir(crate::config::Config::models_dir()?))
    }

    /// Create a ModelManager with a custom models directory.
    pub fn with_dir(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Get the models directory path.
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Ensure every artifact of a candidate is present, downloading missing
    /// ones. Returns the artifact paths in declaration order.
    pub async fn ensure_candidate(
        &self,
        candidate: &ModelCandidate,
        on_progress: ProgressFn<'_>,
    ) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(candidate.files.len());
        for file in &candidate.files {
            paths.push(self.ensure_file(file, on_progress).await?);
        }
        Ok(paths)
    }

    async fn ensure_file(&self, file: &ModelFile, on_progress: ProgressFn<'_>) -> Result<PathBuf> {
        let path = self.models_dir.join(&file.filename);

        if path.exists() {
            let metadata = fs::metadata(&path)
                .await
                .context("Failed to read model metadata")?;
            match file.size_bytes {
                Some(expected) if metadata.len() != expected => {
                    warn!(
                        file = %file.filename,
                        expected,
                        actual = metadata.len(),
                        "Model size mismatch, re-downloading"
                    );
                    fs::remove_file(&path)
                        .await
                        .context("Failed to remove corrupted model")?;
                }
                _ => {
                    debug!(path = %path.display(), "Model already exists");
                    on_progress(&file.filename, metadata.len(), metadata.len());
                    return Ok(path);
                }
            }
        }

        self.download_file(file, &path, on_progress).await?;
        Ok(path)
    }

    /// Stream one artifact to disk, reporting progress per received chunk.
    async fn download_file(
        &self,
        file: &ModelFile,
        dest: &Path,
        on_progress: ProgressFn<'_>,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create models directory")?;
        }

        info!(url = %file.url, dest = %dest.display(), "Downloading model");

        let response = self
            .http
            .get(&file.url)
            .send()
            .await
            .with_context(|| format!("Failed to download model from {}", file.url))?;

        if !response.status().is_success() {
            bail!("Failed to download model: HTTP {}", response.status());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if content_type.contains("text/html") {
            return Err(HtmlBodyError {
                file: file.filename.clone(),
            }
            .into());
        }

        let total = match (response.content_length(), file.size_bytes) {
            (Some(len), _) => len,
            (None, Some(declared)) => declared,
            (None, None) => 0,
        };

        let temp_path = dest.with_extension("tmp");
        let mut out = fs::File::create(&temp_path)
            .await
            .context("Failed to create temporary model file")?;

        let mut stream = response.bytes_stream();
        let mut loaded: u64 = 0;
        let mut first_chunk = true;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read response body")?;
            if first_chunk {
                first_chunk = false;
                if looks_like_html(&chunk) {
                    drop(out);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(HtmlBodyError {
                        file: file.filename.clone(),
                    }
                    .into());
                }
            }
            out.write_all(&chunk)
                .await
                .context("Failed to write model file")?;
            loaded += chunk.len() as u64;
            on_progress(&file.filename, loaded, total.max(loaded));
        }
        out.sync_all().await.context("Failed to sync model file")?;
        drop(out);

        if let Some(expected) = file.size_bytes
            && loaded != expected
        {
            let _ = fs::remove_file(&temp_path).await;
            bail!("Downloaded model size mismatch: expected {expected}, got {loaded}");
        }

        fs::rename(&temp_path, dest)
            .await
            .context("Failed to finalize model file")?;

        info!(path = %dest.display(), size = loaded, "Model downloaded successfully");

        Ok(())
    }
}

/// A body that opens with markup is an error page, not model weights.
fn looks_like_html(chunk: &[u8]) -> bool {
    let head = chunk
        .iter()
        .take(64)
        .skip_while(|b| b.is_ascii_whitespace())
        .copied()
        .collect::<Vec<u8>>();
    let head = head.to_ascii_lowercase();
    head.starts_with(b"<!doctype") || head.starts_with(b"<html")
}

#[cfg(test)]
#[path = "models_test.rs"]
mod tests;
