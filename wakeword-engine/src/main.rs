//! Wake-word detection service binary
//!
//! Runs the engine against the default microphone (or a WAV file) and logs
//! detections until Ctrl-C or a fatal engine error.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use wakeword_engine::{
    AudioSource, ChannelSink, DetectionEngine, EnergyClassifier, EngineConfig, EngineEvent,
    MicrophoneSource, WavFileSource,
};

const DEFAULT_LABEL: &str = "hey_aether";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakeword_engine=info".parse()?),
        )
        .init();

    info!("Starting wake-word detection service");

    let config = load_config().context("failed to load configuration")?;
    let label = std::env::var("WAKEWORD_LABEL").unwrap_or_else(|_| DEFAULT_LABEL.to_string());

    match std::env::var_os("WAKEWORD_INPUT_WAV").map(PathBuf::from) {
        Some(path) => {
            let source = WavFileSource::new(path).realtime(true);
            info!("Reading audio from {}", source.path().display());
            run(config, source, label).await
        }
        None => run(config, MicrophoneSource::new(), label).await,
    }
}

async fn run<S>(config: EngineConfig, source: S, label: String) -> Result<()>
where
    S: AudioSource + 'static,
{
    let (sink, mut events) = ChannelSink::new();
    let classifier = Arc::new(EnergyClassifier::new(label));

    let mut engine = DetectionEngine::new(config, source, classifier.clone(), Arc::new(sink))
        .context("invalid engine configuration")?;

    engine.start().context("failed to start wake-word engine")?;
    info!("Listening for '{}'...", classifier.label());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(EngineEvent::Detection(event)) => {
                    info!(
                        "Wake-word detected! label={}, confidence={:.2}, timestamp={}",
                        event.label, event.confidence, event.timestamp
                    );
                }
                Some(EngineEvent::Error { kind, message }) => {
                    error!("Engine stopped ({}): {}", kind, message);
                    break;
                }
                None => {
                    warn!("Event channel closed, shutting down");
                    break;
                }
            },
        }
    }

    // Joining the worker can wait for a full read timeout
    tokio::task::spawn_blocking(move || engine.stop())
        .await
        .context("engine shutdown task failed")?;

    info!("Wake-word detection service stopped");
    Ok(())
}

/// Load configuration from an optional JSON file plus environment overrides
fn load_config() -> Result<EngineConfig> {
    let mut config = match std::env::var_os("WAKEWORD_CONFIG") {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", PathBuf::from(&path).display()))?;
            serde_json::from_str(&text).context("parsing engine config")?
        }
        None => EngineConfig::default(),
    };

    if let Ok(threshold) = std::env::var("WAKEWORD_THRESHOLD") {
        config.default_threshold = Some(
            threshold
                .parse::<f32>()
                .context("WAKEWORD_THRESHOLD must be a number")?,
        );
    }

    if let Ok(device) = std::env::var("WAKEWORD_DEVICE") {
        config.device = Some(device);
    }

    config.validate()?;
    Ok(config)
}
