use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use reader_tts::audio::{default_output, AudioOutput, WavFileOutput};
use reader_tts::engine::{default_loader, NeuralEngine, SystemEngine};
use reader_tts::models::{all_models, model_by_id, ModelDownloadManager};
use reader_tts::timer::{stop_on_expiry, SleepTimer};
use reader_tts::update::UpdateChecker;
use reader_tts::{PlaybackEvent, PlaybackManager, PlaybackParts, PlaybackState, PreferencesManager, TtsConfig};

#[derive(Parser, Debug)]
#[command(name = "reader-tts")]
#[command(author, version, about = "Offline text-to-speech with downloadable voices")]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the voice catalog
    Models,

    /// Download and install a voice model
    Download { model_id: String },

    /// Delete an installed voice model
    Remove { model_id: String },

    /// Make a model the default voice
    SetModel { model_id: String },

    /// Read text aloud
    Speak {
        /// Text to read
        #[arg(short, long, conflicts_with = "file")]
        text: Option<String>,

        /// Plain-text file to read
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Model id for this run only
        #[arg(short, long)]
        model: Option<String>,

        #[arg(long)]
        speed: Option<f32>,

        #[arg(long)]
        speaker: Option<u32>,

        /// Write audio to a WAV file instead of the sound card
        #[arg(long)]
        wav: Option<PathBuf>,

        /// Stop reading after this many minutes
        #[arg(long)]
        sleep_minutes: Option<u64>,
    },

    /// Look for a newer release
    CheckUpdate {
        /// Version to compare against
        #[arg(long)]
        current: Option<String>,
    },
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("reader_tts={default_level}").into());

    let fmt_layer = if cli.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = TtsConfig::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Models => list_models(&config),
        Commands::Download { model_id } => download(&config, &model_id).await,
        Commands::Remove { model_id } => remove(&config, &model_id).await,
        Commands::SetModel { model_id } => set_model(&config, &model_id).await,
        Commands::Speak {
            text,
            file,
            model,
            speed,
            speaker,
            wav,
            sleep_minutes,
        } => {
            let text = match (text, file) {
                (Some(text), _) => text,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => bail!("Pass --text or --file"),
            };
            let overrides = SpeakOverrides {
                model,
                speed,
                speaker,
            };
            speak(&config, &text, overrides, wav, sleep_minutes).await
        }
        Commands::CheckUpdate { current } => {
            let current = current.unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
            let checker = UpdateChecker::new(&config)?;
            match checker.check_latest(&current).await? {
                Some(release) => {
                    println!("Update available: {} (published {})", release.version, release.published_at);
                    println!("{}", release.download_url);
                    if !release.notes.is_empty() {
                        println!("\n{}", release.notes);
                    }
                }
                None => println!("{current} is up to date"),
            }
            Ok(())
        }
    }
}

fn list_models(config: &TtsConfig) -> Result<()> {
    let downloads = ModelDownloadManager::new(config)?;
    for model in all_models() {
        let mark = if downloads.is_ready(model.id) { "*" } else { " " };
        let size = if model.size_bytes > 0 {
            format!("{:>5} MB", model.size_bytes / 1_000_000)
        } else {
            "       -".to_string()
        };
        println!(
            "{mark} {:<24} {size}  {:<36} [{}]",
            model.id,
            model.display_name,
            model.languages.join(", ")
        );
    }
    Ok(())
}

async fn download(config: &TtsConfig, model_id: &str) -> Result<()> {
    let model = model_by_id(model_id).with_context(|| format!("Unknown model: {model_id}"))?;
    if model.is_system() {
        bail!("{model_id} is built in and needs no download");
    }
    let downloads = ModelDownloadManager::new(config)?;

    let progress = downloads.acquire(model);
    tokio::pin!(progress);
    let mut last_percent = None;
    while let Some(step) = progress.next().await {
        if let Some(error) = step.error {
            bail!("Download of {model_id} failed: {error}");
        }
        if step.complete {
            println!("Installed {model_id} into {}", downloads.model_dir(model_id).display());
            break;
        }
        if step.extracting {
            println!("Extracting...");
            continue;
        }
        let percent = (step.fraction() * 100.0) as u32;
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            println!("{percent:>3}%  {} / {} bytes", step.bytes_downloaded, step.total_bytes);
        }
    }
    Ok(())
}

async fn remove(config: &TtsConfig, model_id: &str) -> Result<()> {
    let downloads = ModelDownloadManager::new(config)?;
    if !downloads.remove(model_id) {
        bail!("{model_id} is not installed");
    }
    PreferencesManager::new()?.on_model_removed(model_id).await?;
    println!("Removed {model_id}");
    Ok(())
}

async fn set_model(config: &TtsConfig, model_id: &str) -> Result<()> {
    if model_by_id(model_id).is_none() {
        bail!("Unknown model: {model_id}");
    }
    let downloads = ModelDownloadManager::new(config)?;
    if !downloads.is_ready(model_id) {
        warn!(model_id, "Model is not downloaded yet; reading will fail until it is");
    }
    PreferencesManager::new()?.set_tts_model_id(model_id).await?;
    println!("Default voice set to {model_id}");
    Ok(())
}

struct SpeakOverrides {
    model: Option<String>,
    speed: Option<f32>,
    speaker: Option<u32>,
}

async fn speak(
    config: &TtsConfig,
    text: &str,
    overrides: SpeakOverrides,
    wav: Option<PathBuf>,
    sleep_minutes: Option<u64>,
) -> Result<()> {
    let mut preferences = PreferencesManager::new()?.get_preferences().await;
    if let Some(model) = overrides.model {
        preferences.tts_model_id = model;
    }
    if let Some(speed) = overrides.speed {
        preferences.tts_speed = speed.clamp(reader_tts::preferences::MIN_SPEED, reader_tts::preferences::MAX_SPEED);
    }
    if let Some(speaker) = overrides.speaker {
        preferences.tts_speaker_id = speaker;
    }
    info!(model_id = %preferences.tts_model_id, speed = preferences.tts_speed, "Reading");
    let (_preferences_tx, preferences_rx) = watch::channel(preferences);

    let wav_output = wav.map(|path| Arc::new(WavFileOutput::new(path)));
    let output: Arc<dyn AudioOutput> = match &wav_output {
        Some(wav) => wav.clone() as Arc<dyn AudioOutput>,
        None => Arc::from(default_output().context("No audio output available")?),
    };

    let manager = Arc::new(PlaybackManager::new(PlaybackParts {
        neural: NeuralEngine::new(default_loader()),
        system: SystemEngine::detect(),
        downloads: Arc::new(ModelDownloadManager::new(config)?),
        output,
        preferences: preferences_rx,
        playback_slack: Duration::from_millis(config.playback_slack_ms),
    }));

    let timer = SleepTimer::new();
    let timer_task = stop_on_expiry(&timer, &manager);
    if let Some(minutes) = sleep_minutes {
        timer.start(minutes);
    }

    let mut events = manager.events();
    manager.start_reading(text);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                manager.stop();
                break;
            }
            event = events.recv() => match event {
                Ok(PlaybackEvent::SentenceStarted { index, total }) => {
                    info!(sentence = index + 1, total, "Reading sentence");
                }
                Ok(PlaybackEvent::Finished) => break,
                Ok(PlaybackEvent::StateChanged(PlaybackState::Idle)) => {
                    // Idle without Finished: load failure, stop or sleep timer.
                    if manager.state() == PlaybackState::Idle {
                        break;
                    }
                }
                Ok(PlaybackEvent::StateChanged(_)) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    timer.cancel();
    drop(timer);
    let _ = timer_task.await;

    if let Some(wav) = wav_output {
        wav.finalize()?;
    }
    match Arc::try_unwrap(manager) {
        Ok(manager) => manager.release(),
        Err(_) => warn!("Playback manager still shared at exit"),
    }
    Ok(())
}
