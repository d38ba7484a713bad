use super::*;
use crate::accumulator::RawChunk;
use crate::engine::{ChunkDecoder, DecoderLoader, InferenceOutput};
use crate::models::{ModelCandidate, ModelFile, ModelManager};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestDecoder {
    delay: Duration,
}

impl ChunkDecoder for TestDecoder {
    fn model_name(&self) -> &str {
        "test"
    }

    fn decode_window(&mut self, _samples: &[f32], offset: u32) -> anyhow::Result<InferenceOutput> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(InferenceOutput::Chunks(vec![RawChunk::new(
            format!("window at {offset}"),
            offset,
            Some(offset + 2),
        )]))
    }
}

struct TestLoader {
    loads: AtomicUsize,
    decode_delay: Duration,
}

impl TestLoader {
    fn instant() -> Arc<Self> {
        Self::with_decode_delay(Duration::ZERO)
    }

    fn with_decode_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            decode_delay: delay,
        })
    }
}

impl DecoderLoader for TestLoader {
    fn load(
        &self,
        _candidate: &str,
        _artifacts: &[PathBuf],
    ) -> anyhow::Result<Box<dyn ChunkDecoder>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestDecoder {
            delay: self.decode_delay,
        }))
    }
}

fn cached_candidate(dir: &TempDir) -> ModelCandidate {
    std::fs::write(dir.path().join("ggml-test.bin"), [0u8; 8]).unwrap();
    ModelCandidate {
        name: "test".to_string(),
        files: vec![ModelFile {
            filename: "ggml-test.bin".to_string(),
            url: "http://127.0.0.1:9/ggml-test.bin".to_string(),
            size_bytes: Some(8),
        }],
    }
}

fn spawn_worker(
    config: Config,
    loader: Arc<dyn DecoderLoader>,
    dir: &TempDir,
) -> (
    mpsc::Sender<WorkerRequest>,
    broadcast::Receiver<WorkerEvent>,
) {
    let (req_tx, req_rx) = mpsc::channel(16);
    let (ev_tx, ev_rx) = broadcast::channel(256);
    let sink = EventSink::new(ev_tx);
    let local = LocalEngine::new(
        config.local.clone(),
        ModelManager::with_dir(dir.path()),
        loader,
    )
    .with_candidates(vec![cached_candidate(dir)]);
    let remote = RemoteEngine::new(config.revai.clone());
    tokio::spawn(TranscriptionController::new(config, sink, local, remote).run(req_rx));
    (req_tx, ev_rx)
}

fn request(audio: Vec<f32>) -> WorkerRequest {
    WorkerRequest::InferenceRequest {
        audio,
        model_name: None,
        api_key: None,
        custom_vocabulary: None,
        rush: None,
        verbatim: None,
        human_transcription: None,
        model: None,
    }
}

fn speech(secs: usize) -> Vec<f32> {
    vec![0.1; secs * wav::SAMPLE_RATE as usize]
}

async fn next(rx: &mut broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event within 5s")
        .expect("event channel closed")
}

/// Collect events up to and including the terminal one.
async fn collect_job(rx: &mut broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    loop {
        let event = next(rx).await;
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

#[tokio::test]
async fn test_silent_input_completes_with_synthetic_segment() {
    let dir = TempDir::new().unwrap();
    let loader = TestLoader::instant();
    let counted = Arc::clone(&loader);
    let (tx, mut rx) = spawn_worker(Config::default(), loader, &dir);

    tx.send(request(vec![0.0; 2 * wav::SAMPLE_RATE as usize]))
        .await
        .unwrap();

    let events = collect_job(&mut rx).await;
    let WorkerEvent::Result {
        results, is_done, ..
    } = &events[0]
    else {
        panic!("expected a final RESULT first, got {:?}", events[0]);
    };
    assert!(*is_done);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].text, crate::NO_SPEECH_TEXT);
    assert_eq!((results[0].start, results[0].end), (0, 2));
    assert!(matches!(events[1], WorkerEvent::InferenceDone { .. }));
    // no engine was touched
    assert_eq!(counted.loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_too_short_input_is_a_validation_error() {
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = spawn_worker(Config::default(), TestLoader::instant(), &dir);

    tx.send(request(vec![0.1; 160])).await.unwrap();

    let events = collect_job(&mut rx).await;
    assert_eq!(events.len(), 1);
    let WorkerEvent::Loading {
        status: LoadingStatus::Error,
        error: Some(error),
        ..
    } = &events[0]
    else {
        panic!("expected a LOADING error, got {:?}", events[0]);
    };
    assert!(error.contains("minimum"));
}

#[tokio::test]
async fn test_too_long_input_is_a_validation_error() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.limits.max_duration_secs = 1.0;
    let (tx, mut rx) = spawn_worker(config, TestLoader::instant(), &dir);

    tx.send(request(speech(2))).await.unwrap();

    let events = collect_job(&mut rx).await;
    let WorkerEvent::Loading {
        error: Some(error), ..
    } = &events[0]
    else {
        panic!("expected a LOADING error, got {:?}", events[0]);
    };
    assert!(error.contains("maximum"));
}

#[tokio::test]
async fn test_local_job_reaches_inference_done() {
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = spawn_worker(Config::default(), TestLoader::instant(), &dir);

    tx.send(request(speech(2))).await.unwrap();

    let events = collect_job(&mut rx).await;
    assert!(matches!(
        events.last(),
        Some(WorkerEvent::InferenceDone { .. })
    ));

    let final_result = events
        .iter()
        .rev()
        .find_map(|e| match e {
            WorkerEvent::Result {
                results,
                is_done: true,
                completed_until_timestamp,
                ..
            } => Some((results.clone(), *completed_until_timestamp)),
            _ => None,
        })
        .expect("no final RESULT emitted");
    assert_eq!(final_result.0[0].text, "window at 0");
    assert_eq!(final_result.1, 2);

    // the model reported ready before any results
    assert!(events.iter().any(|e| matches!(
        e,
        WorkerEvent::Loading {
            status: LoadingStatus::Success,
            ..
        }
    )));
}

#[tokio::test]
async fn test_second_submission_while_active_is_ignored() {
    let dir = TempDir::new().unwrap();
    let loader = TestLoader::with_decode_delay(Duration::from_millis(300));
    let (tx, mut rx) = spawn_worker(Config::default(), loader, &dir);

    tx.send(request(speech(2))).await.unwrap();
    tx.send(request(speech(2))).await.unwrap();

    let events = collect_job(&mut rx).await;
    assert!(matches!(
        events.last(),
        Some(WorkerEvent::InferenceDone { .. })
    ));

    // the ignored submission produces nothing at all
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_cancel_yields_cancelled_and_nothing_after() {
    let dir = TempDir::new().unwrap();
    let loader = TestLoader::with_decode_delay(Duration::from_millis(300));
    let (tx, mut rx) = spawn_worker(Config::default(), loader, &dir);

    tx.send(request(speech(2))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(WorkerRequest::CancelTranscription).await.unwrap();

    let events = collect_job(&mut rx).await;
    assert!(matches!(events.last(), Some(WorkerEvent::Cancelled)));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, WorkerEvent::Result { is_done: true, .. }))
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_cancel_with_no_active_job_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = spawn_worker(Config::default(), TestLoader::instant(), &dir);

    tx.send(WorkerRequest::CancelTranscription).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_dispose_releases_the_model() {
    let dir = TempDir::new().unwrap();
    let loader = TestLoader::instant();
    let counted = Arc::clone(&loader);
    let (tx, mut rx) = spawn_worker(Config::default(), loader, &dir);

    tx.send(request(speech(2))).await.unwrap();
    collect_job(&mut rx).await;
    assert_eq!(counted.loads.load(Ordering::SeqCst), 1);

    tx.send(WorkerRequest::Dispose).await.unwrap();

    tx.send(request(speech(2))).await.unwrap();
    collect_job(&mut rx).await;
    assert_eq!(counted.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_captions_without_api_key_is_an_error() {
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = spawn_worker(Config::default(), TestLoader::instant(), &dir);

    tx.send(WorkerRequest::CaptionsRequest {
        job_id: "job-1".to_string(),
        caption_format: CaptionFormat::Srt,
    })
    .await
    .unwrap();

    let WorkerEvent::Loading {
        status: LoadingStatus::Error,
        error: Some(error),
        ..
    } = next(&mut rx).await
    else {
        panic!("expected a LOADING error");
    };
    assert!(error.contains("API key"));
}

#[tokio::test]
async fn test_remote_job_and_caption_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jobs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "job-1"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/job-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "job-1",
            "status": "transcribed"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/job-1/transcript"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "monologues": [{
                "speaker": 0,
                "elements": [{"type": "text", "value": "remote text", "ts": 0.0, "end_ts": 1.5}]
            }]
        })))
        .mount(&server)
        .await;
    let srt = "1\n00:00:00,000 --> 00:00:01,500\nremote text\n";
    Mock::given(method("GET"))
        .and(path("/jobs/job-1/captions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(srt))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.revai.base_url = server.uri();
    config.revai.poll_interval_ms = 5;
    let (tx, mut rx) = spawn_worker(config, TestLoader::instant(), &dir);

    tx.send(WorkerRequest::InferenceRequest {
        audio: speech(1),
        model_name: None,
        api_key: Some("key".to_string()),
        custom_vocabulary: None,
        rush: None,
        verbatim: None,
        human_transcription: None,
        model: Some(EngineChoice::Revai),
    })
    .await
    .unwrap();

    let events = collect_job(&mut rx).await;
    let Some(WorkerEvent::InferenceDone { job_id }) = events.last() else {
        panic!("expected INFERENCE_DONE, got {:?}", events.last());
    };
    assert_eq!(job_id.as_deref(), Some("job-1"));
    assert!(events.iter().any(|e| matches!(
        e,
        WorkerEvent::Result {
            is_done: true,
            job_id: Some(id),
            ..
        } if id == "job-1"
    )));

    // captions reuse the key from the submission
    tx.send(WorkerRequest::CaptionsRequest {
        job_id: "job-1".to_string(),
        caption_format: CaptionFormat::Srt,
    })
    .await
    .unwrap();

    let WorkerEvent::CaptionsResult {
        captions,
        format,
        job_id,
    } = next(&mut rx).await
    else {
        panic!("expected CAPTIONS_RESULT");
    };
    assert_eq!(captions, srt);
    assert_eq!(format, CaptionFormat::Srt);
    assert_eq!(job_id, "job-1");
}
