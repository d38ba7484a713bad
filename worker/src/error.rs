//! Error taxonomy for transcription jobs.
//!
//! Every failure surfaced to the host is classified into one of these
//! categories; the category is part of the rendered message so the
//! presentation layer can distinguish retryable situations from fatal ones
//! without parsing transport errors.

use thiserror::Error;

/// A fatal, job-terminating failure.
#[derive(Debug, Error)]
pub enum JobError {
    /// The input audio was rejected before any engine ran (silent input is
    /// not a validation error; it completes with a synthetic segment).
    #[error("invalid audio: {0}")]
    Validation(String),
    /// Model load or upload failed after the retry policy was exhausted.
    #[error("acquisition failed: {0}")]
    Acquisition(String),
    /// The engine itself failed; not retried within a job.
    #[error("transcription failed: {0}")]
    Processing(String),
    /// A fixed wall-clock or attempt budget was exceeded.
    #[error("timed out: {0}")]
    Timeout(String),
}

/// Outcome of a job that reached a terminal state without a fatal error.
#[derive(Debug)]
pub enum JobOutcome {
    /// Final segment sequence, plus the remote job identifier when one exists.
    Complete {
        segments: Vec<echoscribe_proto::Segment>,
        job_id: Option<String>,
    },
    /// The job was cancelled cooperatively. Not an error.
    Cancelled,
}

/// Remote transcription API failures, classified by HTTP status so the
/// message names a user-facing category rather than the raw transport error.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid Rev AI API credentials (HTTP {status})")]
    InvalidCredentials { status: u16 },
    #[error("audio file too large for the transcription service (HTTP 413)")]
    PayloadTooLarge,
    #[error("rate limited by the transcription service (HTTP 429)")]
    RateLimited,
    #[error("transcription service request failed (HTTP {status}): {body}")]
    Api { status: u16, body: String },
    #[error("transcription service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed transcription service response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => RemoteError::InvalidCredentials { status },
            413 => RemoteError::PayloadTooLarge,
            429 => RemoteError::RateLimited,
            _ => RemoteError::Api { status, body },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            RemoteError::from_status(401, String::new()),
            RemoteError::InvalidCredentials { status: 401 }
        ));
        assert!(matches!(
            RemoteError::from_status(403, String::new()),
            RemoteError::InvalidCredentials { status: 403 }
        ));
        assert!(matches!(
            RemoteError::from_status(413, String::new()),
            RemoteError::PayloadTooLarge
        ));
        assert!(matches!(
            RemoteError::from_status(429, String::new()),
            RemoteError::RateLimited
        ));
        assert!(matches!(
            RemoteError::from_status(500, "oops".into()),
            RemoteError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn test_messages_name_the_category() {
        let e = JobError::Timeout("job polling exceeded 150 attempts".into());
        assert!(e.to_string().starts_with("timed out"));

        let e = RemoteError::from_status(401, String::new());
        assert!(e.to_string().contains("credentials"));
    }
}
