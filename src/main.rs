//! avatar-speech: speech scheduling service for avatar characters.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use avatar_speech::api::{self, ApiState};
use avatar_speech::config::{BackendKind, Config};
use avatar_speech::{
    history, HttpSynthesizer, PlaybackBackend, PolicyMode, RodioBackend, Scheduler,
    SchedulerOptions, SimulatedBackend, Synthesizer,
};

#[derive(Parser, Debug)]
#[command(name = "avatar-speech", about = "Speech scheduler for avatar characters")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scheduling mode: queue, interrupt, or priority (overrides config)
    #[arg(short, long)]
    mode: Option<PolicyMode>,

    /// Play nothing; time requests on a simulated device
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the speech report for a date (YYYY-MM-DD or "today") and exit
    #[arg(long, value_name = "DATE")]
    report: Option<String>,
}

fn open_backend(config: &Config, dry_run: bool) -> Arc<dyn PlaybackBackend> {
    let max_duration = Duration::from_secs(config.playback.max_duration_secs);
    let simulated = || Arc::new(SimulatedBackend::new(Duration::from_secs(1), max_duration));

    if dry_run || config.playback.backend == BackendKind::Simulated {
        return simulated();
    }
    match RodioBackend::open(&config.playback) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            warn!("Failed to open audio output: {e}");
            info!("Falling back to simulated playback");
            simulated()
        }
    }
}

fn build_synthesizer(config: &Config) -> Option<Arc<dyn Synthesizer>> {
    if !config.tts.enabled {
        info!("TTS disabled, only pre-rendered audio will be accepted");
        return None;
    }
    match HttpSynthesizer::new(&config.tts) {
        Ok(synth) => {
            info!(
                "TTS via {} (model: {}, voice: {})",
                config.tts.base_url, config.tts.model, config.tts.default_voice
            );
            Some(Arc::new(synth))
        }
        Err(e) => {
            warn!("Failed to set up TTS client: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (keep HTTP internals quiet)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,hyper=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(args.config.as_deref());

    if let Some(date) = &args.report {
        println!("{}", history::generate_report(&config.history.resolved_dir(), date));
        return Ok(());
    }

    info!("avatar-speech starting");
    if let Some(mode) = args.mode {
        config.scheduler.mode = mode;
    }
    info!("Mode: {}", config.scheduler.mode);

    let backend = open_backend(&config, args.dry_run);
    let synthesizer = build_synthesizer(&config);
    let scheduler = Scheduler::start(
        backend,
        synthesizer,
        SchedulerOptions::from(&config.scheduler),
    );
    info!("Scheduler running on {} backend", scheduler.backend_name());

    let recorder = if config.history.enabled {
        let dir = config.history.resolved_dir();
        info!("Recording speech history to {}", dir.display());
        Some(history::spawn_recorder(scheduler.subscribe(), dir))
    } else {
        None
    };

    if config.api.enabled {
        let state = ApiState {
            scheduler: scheduler.clone(),
        };
        api::start_api(state, config.api.port).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scheduler.shutdown().await;

    // Shutdown closed the event stream; the recorder ends after the last write
    if let Some(recorder) = recorder {
        if let Err(e) = recorder.await {
            warn!("History recorder ended abnormally: {e}");
        }
    }

    Ok(())
}
