//! Remote engine: Rev AI upload-and-poll.
//!
//! The audio is encoded to WAV, submitted as one multipart job, and the job
//! is polled on a fixed interval until it transcribes, fails, or exhausts
//! the attempt budget. Remote results arrive as one complete transcript, so
//! no accumulator is involved; monologues flatten directly into segments.

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RevAiConfig;
use crate::error::{JobError, JobOutcome, RemoteError};
use crate::events::EventSink;
use crate::wav;
use echoscribe_proto::Segment;

const TRANSCRIPT_ACCEPT: &str = "application/vnd.rev.transcript.v1.0+json";
const SUBMIT_METADATA: &str = "Audio transcription from echoscribe";

/// Per-job options forwarded to the remote service.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub custom_vocabulary: Option<Vec<String>>,
    pub rush: bool,
    pub verbatim: bool,
    pub human_transcription: bool,
}

impl SubmitOptions {
    /// The `options` JSON part of the submission form. Human transcription
    /// is what unlocks the rush and verbatim flags.
    fn to_json(&self) -> serde_json::Value {
        let mut options = serde_json::json!({ "metadata": SUBMIT_METADATA });
        if let Some(vocabulary) = &self.custom_vocabulary
            && !vocabulary.is_empty()
        {
            options["custom_vocabularies"] = serde_json::json!([{ "phrases": vocabulary }]);
        }
        if self.human_transcription {
            options["transcriber"] = serde_json::json!("human");
            options["verbatim"] = serde_json::json!(self.verbatim);
            options["rush"] = serde_json::json!(self.rush);
        }
        options
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    status: String,
    #[serde(default)]
    failure_detail: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Transcript {
    pub monologues: Vec<Monologue>,
}

#[derive(Debug, Deserialize)]
pub struct Monologue {
    #[serde(default)]
    pub speaker: Option<u32>,
    pub elements: Vec<Element>,
}

#[derive(Debug, Deserialize)]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub ts: Option<f64>,
    #[serde(default)]
    pub end_ts: Option<f64>,
}

/// Thin HTTP client for the Rev AI asynchronous speech-to-text API.
pub struct RevAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RevAiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Submit one WAV payload as a new transcription job.
    pub async fn submit(
        &self,
        wav_bytes: Vec<u8>,
        options: &SubmitOptions,
    ) -> Result<String, RemoteError> {
        let media = Part::bytes(wav_bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .part("media", media)
            .text("options", options.to_json().to_string());

        let response = self
            .http
            .post(format!("{}/jobs", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse(response).await?;
        info!(job_id = %submitted.id, "Remote job submitted");
        Ok(submitted.id)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, RemoteError> {
        let response = self
            .http
            .get(format!("{}/jobs/{job_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Fetch the structured transcript of a transcribed job.
    pub async fn transcript(&self, job_id: &str) -> Result<Transcript, RemoteError> {
        let response = self
            .http
            .get(format!("{}/jobs/{job_id}/transcript", self.base_url))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, TRANSCRIPT_ACCEPT)
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Fetch the service's native caption rendering of a transcribed job.
    pub async fn captions(
        &self,
        job_id: &str,
        format: echoscribe_proto::CaptionFormat,
    ) -> Result<String, RemoteError> {
        let accept = match format {
            echoscribe_proto::CaptionFormat::Srt => "application/x-subrip",
            echoscribe_proto::CaptionFormat::Vtt => "text/vtt",
        };
        let response = self
            .http
            .get(format!("{}/jobs/{job_id}/captions", self.base_url))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, accept)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), body));
        }
        Ok(response.text().await?)
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))
    }
}

/// Flatten a monologue-structured transcript into the segment sequence.
///
/// Each monologue becomes one segment: its element values concatenate into
/// the text (punctuation elements carry their own spacing), the first
/// timestamp opens the segment and the last closes it. An entirely empty
/// transcript yields the standard no-speech segment.
pub fn convert_transcript(transcript: Transcript) -> Vec<Segment> {
    let mut segments = Vec::new();
    for monologue in transcript.monologues {
        let mut text = String::new();
        let mut start: Option<f64> = None;
        let mut end: Option<f64> = None;
        for element in &monologue.elements {
            text.push_str(&element.value);
            if let Some(ts) = element.ts {
                start.get_or_insert(ts);
            }
            if let Some(end_ts) = element.end_ts {
                end = Some(end_ts);
            }
        }
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let start = start.unwrap_or(0.0).round() as u32;
        let end = end.map_or(start, |e| e.round() as u32).max(start);
        segments.push(Segment {
            index: segments.len(),
            text: text.to_string(),
            start,
            end,
            speaker: monologue.speaker,
        });
    }

    if segments.is_empty() {
        segments.push(Segment {
            index: 0,
            text: crate::NO_SPEECH_TEXT.to_string(),
            start: 0,
            end: 0,
            speaker: None,
        });
    }
    segments
}

/// Upload-and-poll transcription engine.
pub struct RemoteEngine {
    config: RevAiConfig,
}

impl RemoteEngine {
    pub fn new(config: RevAiConfig) -> Self {
        Self { config }
    }

    /// Resolve the API key for a job; the per-job key wins over the
    /// configured one.
    pub fn resolve_key(&self, job_key: Option<&str>) -> Option<String> {
        job_key
            .map(str::to_string)
            .or_else(|| self.config.api_key.clone())
    }

    pub fn client(&self, api_key: &str) -> RevAiClient {
        RevAiClient::new(self.config.base_url.clone(), api_key)
    }

    /// Run one remote transcription job end to end.
    pub async fn run(
        &self,
        audio: Vec<f32>,
        options: SubmitOptions,
        api_key: Option<&str>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let Some(key) = self.resolve_key(api_key) else {
            return Err(JobError::Acquisition(
                "no Rev AI API key provided".to_string(),
            ));
        };
        if cancel.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }

        let duration = wav::duration_secs(&audio);
        let client = self.client(&key);

        sink.loading_progress(0.1, "uploading audio");
        let wav_bytes = wav::encode_wav(&audio);
        debug!(bytes = wav_bytes.len(), "Encoded WAV payload");

        let submit = client.submit(wav_bytes, &options);
        let job_id = tokio::select! {
            _ = cancel.cancelled() => return Ok(JobOutcome::Cancelled),
            submitted = submit => submitted.map_err(|e| JobError::Acquisition(e.to_string()))?,
        };
        sink.loading_progress(0.2, "job submitted");

        self.poll(&client, &job_id, duration, sink, cancel).await
    }

    /// Poll until the job transcribes, fails, or the attempt budget runs out.
    async fn poll(
        &self,
        client: &RevAiClient,
        job_id: &str,
        duration_secs: f32,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let interval = std::time::Duration::from_millis(self.config.poll_interval_ms);
        let max_attempts = self.config.max_poll_attempts;

        // first status check happens immediately; the interval separates
        // subsequent polls
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Ok(JobOutcome::Cancelled);
            }

            let status = client
                .job_status(job_id)
                .await
                .map_err(|e| JobError::Processing(e.to_string()))?;

            match status.status.as_str() {
                "transcribed" => {
                    let transcript = client
                        .transcript(job_id)
                        .await
                        .map_err(|e| JobError::Processing(e.to_string()))?;
                    return Ok(JobOutcome::Complete {
                        segments: convert_transcript(transcript),
                        job_id: Some(job_id.to_string()),
                    });
                }
                "failed" => {
                    let detail = status
                        .failure_detail
                        .unwrap_or_else(|| "remote job failed".to_string());
                    return Err(JobError::Processing(detail));
                }
                other => {
                    // in_progress and any status added later keep polling
                    debug!(job_id, status = other, attempt, "Remote job pending");
                    let progress = (attempt as f32 / max_attempts as f32).min(0.9);
                    let elapsed = (attempt - 1) as f32 * interval.as_secs_f32();
                    let expected = duration_secs * self.config.processing_rate;
                    let details = if expected > elapsed {
                        format!(
                            "transcribing remotely, about {}s remaining",
                            (expected - elapsed).ceil() as u64
                        )
                    } else {
                        "transcribing remotely".to_string()
                    };
                    sink.loading_progress(progress, details);
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(JobOutcome::Cancelled),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        warn!(job_id, max_attempts, "Remote job polling budget exhausted");
        Err(JobError::Timeout(format!(
            "remote job {job_id} still pending after {max_attempts} polls"
        )))
    }
}

#[cfg(test)]
#[path = "remote_test.rs"]
mod tests;
