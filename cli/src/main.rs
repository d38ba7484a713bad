use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use echoscribe_proto::{
    CaptionFormat, EngineChoice, LoadingStatus, WorkerEvent, WorkerRequest,
};
use echoscribe_worker::config::Config;
use echoscribe_worker::{LOG_ENV_VAR, wav};

#[derive(Parser)]
#[command(name = "echoscribe")]
#[command(about = "echoscribe CLI - transcribe a WAV file and stream worker events")]
#[command(version)]
struct Cli {
    /// Config file path (defaults to the XDG config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcribe a 16 kHz mono WAV file
    Transcribe {
        /// Input WAV file (16 kHz, mono)
        input: PathBuf,
        /// Engine to use: local or revai
        #[arg(long, value_enum)]
        engine: Option<CliEngine>,
        /// Pin the first local model candidate to try
        #[arg(long)]
        model: Option<String>,
        /// Rev AI API key (falls back to the config file)
        #[arg(long)]
        api_key: Option<String>,
        /// Custom vocabulary phrase, repeatable
        #[arg(long = "vocab")]
        vocabulary: Vec<String>,
        /// Request rush processing (human transcription only)
        #[arg(long)]
        rush: bool,
        /// Request verbatim transcription (human transcription only)
        #[arg(long)]
        verbatim: bool,
        /// Request human instead of machine transcription
        #[arg(long)]
        human: bool,
        /// Also fetch native captions for a completed remote job
        #[arg(long, value_enum)]
        captions: Option<CliCaptions>,
    },
    /// Write the default config to the standard location
    Init,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliEngine {
    Local,
    Revai,
}

impl From<CliEngine> for EngineChoice {
    fn from(value: CliEngine) -> Self {
        match value {
            CliEngine::Local => EngineChoice::Local,
            CliEngine::Revai => EngineChoice::Revai,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliCaptions {
    Srt,
    Vtt,
}

impl From<CliCaptions> for CaptionFormat {
    fn from(value: CliCaptions) -> Self {
        match value {
            CliCaptions::Srt => CaptionFormat::Srt,
            CliCaptions::Vtt => CaptionFormat::Vtt,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_default(),
    };

    // ECHOSCRIBE_LOG env var overrides the config file level
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(config.logging.level.as_directive().parse()?)
        .from_env()?;

    let _log_guard = match &cli.log_file {
        Some(path) => {
            let dir = path.parent().context("log path has no parent directory")?;
            let file = path.file_name().context("log path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
            None
        }
    };

    match cli.command {
        Commands::Transcribe {
            input,
            engine,
            model,
            api_key,
            vocabulary,
            rush,
            verbatim,
            human,
            captions,
        } => {
            transcribe(
                config, input, engine, model, api_key, vocabulary, rush, verbatim, human, captions,
            )
            .await
        }
        Commands::Init => {
            let path = Config::config_path()?;
            Config::default().save_to(&path)?;
            println!("Wrote default config to {}", path.display());
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn transcribe(
    config: Config,
    input: PathBuf,
    engine: Option<CliEngine>,
    model: Option<String>,
    api_key: Option<String>,
    vocabulary: Vec<String>,
    rush: bool,
    verbatim: bool,
    human: bool,
    captions: Option<CliCaptions>,
) -> anyhow::Result<()> {
    let audio = read_wav(&input)?;
    tracing::info!(
        file = %input.display(),
        duration_secs = wav::duration_secs(&audio),
        "Loaded input audio"
    );

    let worker = echoscribe_worker::spawn(config)?;
    let mut events = worker.subscribe();

    worker
        .send(WorkerRequest::InferenceRequest {
            audio,
            model_name: model,
            api_key,
            custom_vocabulary: (!vocabulary.is_empty()).then_some(vocabulary),
            rush: rush.then_some(true),
            verbatim: verbatim.then_some(true),
            human_transcription: human.then_some(true),
            model: engine.map(Into::into),
        })
        .await?;

    let mut download_bar: Option<ProgressBar> = None;
    let mut job_id: Option<String> = None;

    loop {
        let event = events.recv().await.context("worker event stream closed")?;
        match event {
            WorkerEvent::Downloading {
                file,
                loaded,
                total,
                ..
            } => {
                let bar = download_bar.get_or_insert_with(|| {
                    let bar = ProgressBar::new(total.max(1));
                    bar.set_style(
                        ProgressStyle::with_template(
                            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                    );
                    bar
                });
                bar.set_message(format!("downloading {file}"));
                bar.set_length(total.max(1));
                bar.set_position(loaded);
            }
            WorkerEvent::Loading {
                status,
                error,
                attempt,
                max_attempts,
                progress,
                details,
            } => {
                if let Some(bar) = download_bar.take() {
                    bar.finish_and_clear();
                }
                match status {
                    LoadingStatus::Success => eprintln!("model ready, transcribing..."),
                    LoadingStatus::Loading => {
                        if let (Some(p), Some(d)) = (progress, details) {
                            eprintln!("[{:>3.0}%] {d}", p * 100.0);
                        }
                    }
                    LoadingStatus::Error | LoadingStatus::Failed => {
                        let message = error.unwrap_or_else(|| "unknown error".to_string());
                        if let (Some(a), Some(m)) = (attempt, max_attempts) {
                            eprintln!("attempt {a}/{m} failed: {message}");
                            continue;
                        }
                        bail!("transcription failed: {message}");
                    }
                    LoadingStatus::Cancelled => bail!("transcription cancelled"),
                }
            }
            WorkerEvent::ResultPartial { result } => {
                eprintln!("... {}", result.text);
            }
            WorkerEvent::Result {
                results,
                is_done,
                job_id: id,
                ..
            } => {
                if !is_done {
                    continue;
                }
                job_id = id;
                for segment in &results {
                    println!("[{:>4}s - {:>4}s] {}", segment.start, segment.end, segment.text);
                }
            }
            WorkerEvent::InferenceDone { job_id: id } => {
                job_id = job_id.or(id);
                break;
            }
            WorkerEvent::Cancelled => bail!("transcription cancelled"),
            WorkerEvent::CaptionsResult { .. } => {}
        }
    }

    if let Some(format) = captions {
        let Some(job_id) = job_id else {
            bail!("captions are only available for remote jobs");
        };
        worker
            .send(WorkerRequest::CaptionsRequest {
                job_id,
                caption_format: format.into(),
            })
            .await?;
        loop {
            let event = events.recv().await.context("worker event stream closed")?;
            match event {
                WorkerEvent::CaptionsResult { captions, .. } => {
                    println!("{captions}");
                    break;
                }
                WorkerEvent::Loading {
                    status: LoadingStatus::Error,
                    error,
                    ..
                } => bail!(
                    "caption fetch failed: {}",
                    error.unwrap_or_else(|| "unknown error".to_string())
                ),
                _ => {}
            }
        }
    }

    worker.shutdown().await;
    Ok(())
}

/// Read a 16 kHz mono WAV into f32 samples. Resampling is out of scope, so
/// anything else is rejected.
fn read_wav(path: &PathBuf) -> anyhow::Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != wav::SAMPLE_RATE {
        bail!(
            "expected 16 kHz mono WAV, got {} Hz {} channel(s)",
            spec.sample_rate,
            spec.channels
        );
    }

    let samples = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = f32::from(i16::MAX);
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / scale))
                .collect::<Result<Vec<f32>, _>>()?
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<f32>, _>>()?,
    };
    Ok(samples)
}
