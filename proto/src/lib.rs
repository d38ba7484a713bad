//! Host-to-worker message protocol for echoscribe.
//!
//! The worker is driven exclusively through asynchronous message passing:
//! [`WorkerRequest`] values go in, [`WorkerEvent`] values come out. The serde
//! representation matches the JSON wire protocol consumed by hosts
//! (SCREAMING_CASE `type` tags, camelCase payload fields), so the same types
//! serve both in-process channels and serialized transports.

use serde::{Deserialize, Serialize};

/// One finalized, timestamped unit of transcript text.
///
/// Segments are always held in a sequence sorted ascending by `start`;
/// `index` is the ordinal position within that sequence and is reassigned
/// whenever the sequence changes. Timestamps are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub text: String,
    pub start: u32,
    pub end: u32,
    /// Speaker label, present only for engines that provide diarization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<u32>,
}

/// Ephemeral decode preview carried by `RESULT_PARTIAL`. Never merged into
/// the accumulated transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub text: String,
    pub start: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u32>,
}

/// Which transcription engine a job should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineChoice {
    /// In-process model inference with multi-candidate fallback.
    #[default]
    Local,
    /// Rev AI upload-and-poll.
    Revai,
}

/// Status values carried by `LOADING` lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingStatus {
    Loading,
    Success,
    Error,
    Failed,
    Cancelled,
}

/// Native caption serialization offered by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptionFormat {
    Srt,
    Vtt,
}

impl CaptionFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptionFormat::Srt => "srt",
            CaptionFormat::Vtt => "vtt",
        }
    }
}

/// Messages the host sends to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    /// Submit a new transcription job. Ignored if a job is already active.
    #[serde(rename = "INFERENCE_REQUEST", rename_all = "camelCase")]
    InferenceRequest {
        /// Mono 16 kHz f32 PCM samples. Owned by the job until it reaches a
        /// terminal state.
        audio: Vec<f32>,
        /// Pins the first local model candidate to try.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_name: Option<String>,
        /// Rev AI API key (remote engine only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        /// Custom vocabulary phrases forwarded to the remote service.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_vocabulary: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rush: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verbatim: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        human_transcription: Option<bool>,
        /// Engine selection; defaults to the configured engine.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<EngineChoice>,
    },
    /// Cooperatively cancel the active job. No-op when idle.
    #[serde(rename = "CANCEL_TRANSCRIPTION")]
    CancelTranscription,
    /// Cancel any active job and release the engine and model state.
    #[serde(rename = "DISPOSE")]
    Dispose,
    /// Fetch the remote service's native caption file for a completed job.
    #[serde(rename = "CAPTIONS_REQUEST", rename_all = "camelCase")]
    CaptionsRequest {
        job_id: String,
        caption_format: CaptionFormat,
    },
}

/// Messages the worker sends to the host.
///
/// For a single job, events are delivered in generation order and exactly one
/// terminal marker is emitted: `INFERENCE_DONE` (after the final `RESULT`),
/// `CANCELLED`, or a `LOADING` event with an `error`/`failed` status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// Model or asset fetch progress. `progress` is the overall fraction
    /// across all known sub-files and may occasionally decrease when a new
    /// sub-file's size becomes known.
    #[serde(rename = "DOWNLOADING")]
    Downloading {
        file: String,
        progress: f32,
        loaded: u64,
        total: u64,
    },
    /// Lifecycle and progress status.
    #[serde(rename = "LOADING", rename_all = "camelCase")]
    Loading {
        status: LoadingStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_attempts: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// Current best transcript, intermediate (`is_done == false`) or final.
    /// Always carries the complete accumulated sequence, never a delta.
    #[serde(rename = "RESULT", rename_all = "camelCase")]
    Result {
        results: Vec<Segment>,
        is_done: bool,
        completed_until_timestamp: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    /// Throttled decode preview; not part of the accumulated transcript.
    #[serde(rename = "RESULT_PARTIAL")]
    ResultPartial { result: PartialResult },
    /// Terminal success marker; always follows the final `RESULT`.
    #[serde(rename = "INFERENCE_DONE", rename_all = "camelCase")]
    InferenceDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    /// Terminal cancellation marker.
    #[serde(rename = "CANCELLED")]
    Cancelled,
    /// Native caption text fetched on demand for a completed remote job.
    #[serde(rename = "CAPTIONS_RESULT", rename_all = "camelCase")]
    CaptionsResult {
        captions: String,
        format: CaptionFormat,
        job_id: String,
    },
}

impl WorkerEvent {
    /// A bare `LOADING` event with only a status.
    pub fn loading(status: LoadingStatus) -> Self {
        WorkerEvent::Loading {
            status,
            error: None,
            attempt: None,
            max_attempts: None,
            progress: None,
            details: None,
        }
    }

    /// A `LOADING`/`error` event carrying a message.
    pub fn loading_error(status: LoadingStatus, error: impl Into<String>) -> Self {
        WorkerEvent::Loading {
            status,
            error: Some(error.into()),
            attempt: None,
            max_attempts: None,
            progress: None,
            details: None,
        }
    }

    /// True for events after which no further events follow for the job.
    pub fn is_terminal(&self) -> bool {
        match self {
            WorkerEvent::InferenceDone { .. } | WorkerEvent::Cancelled => true,
            WorkerEvent::Loading { status, .. } => {
                matches!(status, LoadingStatus::Error | LoadingStatus::Failed)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tag_names_match_wire_protocol() {
        let json = serde_json::to_value(&WorkerRequest::CancelTranscription).unwrap();
        assert_eq!(json["type"], "CANCEL_TRANSCRIPTION");

        let json = serde_json::to_value(&WorkerRequest::CaptionsRequest {
            job_id: "j1".into(),
            caption_format: CaptionFormat::Srt,
        })
        .unwrap();
        assert_eq!(json["type"], "CAPTIONS_REQUEST");
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["captionFormat"], "srt");
    }

    #[test]
    fn test_inference_request_omits_unset_options() {
        let req = WorkerRequest::InferenceRequest {
            audio: vec![0.0, 0.5],
            model_name: None,
            api_key: None,
            custom_vocabulary: None,
            rush: None,
            verbatim: None,
            human_transcription: None,
            model: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "INFERENCE_REQUEST");
        assert!(json.get("apiKey").is_none());
        assert!(json.get("modelName").is_none());
    }

    #[test]
    fn test_result_event_uses_camel_case_fields() {
        let event = WorkerEvent::Result {
            results: vec![Segment {
                index: 0,
                text: "hello".into(),
                start: 0,
                end: 2,
                speaker: None,
            }],
            is_done: true,
            completed_until_timestamp: 2,
            job_id: Some("j1".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RESULT");
        assert_eq!(json["isDone"], true);
        assert_eq!(json["completedUntilTimestamp"], 2);
        assert_eq!(json["jobId"], "j1");
        assert!(json["results"][0].get("speaker").is_none());
    }

    #[test]
    fn test_request_round_trips_through_json() {
        let req = WorkerRequest::InferenceRequest {
            audio: vec![0.25; 4],
            model_name: Some("tiny.en".into()),
            api_key: Some("key".into()),
            custom_vocabulary: Some(vec!["echoscribe".into()]),
            rush: Some(true),
            verbatim: Some(false),
            human_transcription: None,
            model: Some(EngineChoice::Revai),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: WorkerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_terminal_event_classification() {
        assert!(WorkerEvent::Cancelled.is_terminal());
        assert!(WorkerEvent::InferenceDone { job_id: None }.is_terminal());
        assert!(WorkerEvent::loading_error(LoadingStatus::Failed, "boom").is_terminal());
        assert!(!WorkerEvent::loading(LoadingStatus::Loading).is_terminal());
        assert!(
            !WorkerEvent::Result {
                results: vec![],
                is_done: true,
                completed_until_timestamp: 0,
                job_id: None,
            }
            .is_terminal()
        );
    }
}
