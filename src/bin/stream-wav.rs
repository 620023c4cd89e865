//! Streams a WAV file through the pipeline and prints live events as JSON
//! lines, one per event — the same shapes a WebSocket client would receive.
//!
//! The file is pushed in network-sized byte chunks (deliberately unaligned to
//! frame boundaries) so the demo exercises the same reassembly path as a real
//! transport.

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use voxflow::engine::{InferenceEngine, MockEngine};
use voxflow::publish::BrokerSink;
use voxflow::{Config, Pipeline, StreamFormat};

#[derive(Parser)]
#[command(name = "stream-wav", version = voxflow::version_string())]
#[command(about = "Stream a WAV file through the transcription pipeline")]
struct Args {
    /// Input WAV file (16-bit mono PCM)
    wav: PathBuf,

    /// Configuration file; defaults to ~/.config/voxflow/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Feed audio at its real-time rate instead of as fast as possible
    #[arg(long)]
    realtime: bool,

    /// Size of the simulated network chunks, in bytes
    #[arg(long, default_value_t = 1000)]
    chunk_bytes: usize,

    /// Shutdown grace period (e.g. "10s", "1m")
    #[arg(long, default_value = "10s")]
    grace: humantime::Duration,

    /// Echo broker-topic payloads to stderr
    #[arg(long)]
    show_broker: bool,

    /// Path to a ggml whisper model; the mock engine is used when omitted
    #[cfg(feature = "whisper")]
    #[arg(long)]
    model: Option<PathBuf>,
}

/// Broker seam for the demo: the durable topic is stderr.
struct StderrBroker {
    echo: bool,
}

#[async_trait]
impl BrokerSink for StderrBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> voxflow::Result<()> {
        if self.echo {
            eprintln!("[{}] {}", topic, String::from_utf8_lossy(payload));
        }
        Ok(())
    }
}

fn build_engine(args: &Args) -> anyhow::Result<Arc<dyn InferenceEngine>> {
    #[cfg(feature = "whisper")]
    if let Some(model) = &args.model {
        use voxflow::engine::whisper::{WhisperEngine, WhisperEngineConfig};
        let engine = WhisperEngine::new(WhisperEngineConfig {
            model_path: model.clone(),
            threads: None,
        })
        .context("failed to load whisper model")?;
        return Ok(Arc::new(engine));
    }
    let _ = args;
    Ok(Arc::new(
        MockEngine::new("mock").with_response("[mock transcript]"),
    ))
}

/// Reads the WAV into raw little-endian PCM bytes plus its declared format.
fn read_wav(path: &PathBuf) -> anyhow::Result<(Vec<u8>, StreamFormat)> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 1 {
        bail!("expected mono audio, got {} channels", spec.channels);
    }
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        bail!("expected 16-bit signed PCM");
    }

    let samples: Vec<i16> = reader
        .into_samples::<i16>()
        .collect::<std::result::Result<_, _>>()
        .context("failed to decode samples")?;
    let bytes = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

    let format = StreamFormat::new(spec.sample_rate, 1, 20)?;
    Ok((bytes, format))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?.with_env_overrides();

    let (bytes, format) = read_wav(&args.wav)?;
    let engine = build_engine(&args)?;
    let broker = Arc::new(StderrBroker {
        echo: args.show_broker,
    });

    let pipeline = Pipeline::new(config, engine, broker)?;
    let (handle, mut events) = pipeline.open_stream(format)?;

    // Print events as they arrive while audio is still streaming in.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(error) => eprintln!("failed to serialize event: {}", error),
            }
        }
    });

    let chunk_bytes = args.chunk_bytes.max(2);
    let chunk_duration = Duration::from_secs_f64(
        chunk_bytes as f64 / 2.0 / format.sample_rate as f64,
    );
    for chunk in bytes.chunks(chunk_bytes) {
        handle.push(chunk.to_vec()).await?;
        if args.realtime {
            tokio::time::sleep(chunk_duration).await;
        }
    }
    handle.close().await?;

    pipeline.shutdown(args.grace.into()).await;
    printer.await.ok();
    Ok(())
}
