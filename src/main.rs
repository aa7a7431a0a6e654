use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use moa_voice_translate::translate::HttpTranslator;
use moa_voice_translate::voice::{
    AppContext, AudioSink, AudioSource, LanguageCode, PacedSink, SessionEvent,
    SessionOrchestrator, StdinPcmSource, WavFileSink, WavFileSource,
};
use moa_voice_translate::Config;

#[derive(Parser)]
#[command(name = "moa-voice-translate")]
#[command(version)]
#[command(about = "Real-time voice translation: streaming STT, segmentation, translation and TTS", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/moa/voice-translate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream audio through the translation pipeline
    Run(RunArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args)]
struct RunArgs {
    /// WAV file to replay, or `-` for raw s16le mono PCM on stdin
    #[arg(long)]
    input: String,

    /// Sample rate of stdin PCM
    #[arg(long, default_value_t = 48_000)]
    capture_rate: u32,

    /// Source language code
    #[arg(long)]
    source: Option<String>,

    /// Target language code
    #[arg(long)]
    target: Option<String>,

    /// Speak translations
    #[arg(long)]
    tts: bool,

    /// Write synthesized speech to this WAV file
    #[arg(long)]
    output: Option<PathBuf>,

    /// How long to wait for late results after input ends
    #[arg(long, default_value_t = 3_000)]
    drain_ms: u64,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("moa_voice_translate=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml_redacted()?);
            Ok(())
        }
        Command::Run(args) => run(config, args).await,
    }
}

async fn run(mut config: Config, args: RunArgs) -> anyhow::Result<()> {
    if let Some(source) = args.source {
        config.languages.source = source;
    }
    if let Some(target) = args.target {
        config.languages.target = target;
    }
    config.tts.enabled |= args.tts;
    config.validate()?;
    eprintln!(
        "Translating {} -> {}",
        language_name(&config.languages.source),
        language_name(&config.languages.target)
    );

    let audio_source: Arc<dyn AudioSource> = if args.input == "-" {
        Arc::new(StdinPcmSource::new(args.capture_rate))
    } else {
        Arc::new(WavFileSource::new(&args.input))
    };
    let audio_sink: Arc<dyn AudioSink> = match &args.output {
        Some(path) => Arc::new(WavFileSink::new(path, true)),
        None => Arc::new(PacedSink),
    };
    let translator = Arc::new(HttpTranslator::from_config(&config.translation));

    let orchestrator = SessionOrchestrator::new(AppContext {
        config,
        translator,
        audio_source,
        audio_sink,
    });
    let mut events = orchestrator.subscribe();
    orchestrator.start().await?;

    let drain = Duration::from_millis(args.drain_ms);
    let mut drain_deadline: Option<Instant> = None;

    loop {
        let deadline = drain_deadline;
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::CaptureEnded) => {
                    orchestrator.stop().await;
                    drain_deadline = Some(Instant::now() + drain);
                }
                Ok(event) => print_event(&orchestrator, &event),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            () = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            } => {
                let status = orchestrator.status().await;
                if status.translations_in_flight > 0 || orchestrator.tts().is_playing() {
                    drain_deadline = Some(Instant::now() + Duration::from_millis(500));
                } else {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    orchestrator.shutdown().await;

    let history = orchestrator.history();
    let translated = history.iter().filter(|s| s.is_translated()).count();
    eprintln!("{} segments, {} translated", history.len(), translated);
    Ok(())
}

fn language_name(code: &str) -> String {
    LanguageCode::from_str_code(code)
        .map_or_else(|| code.to_string(), |lang| lang.display_name().to_string())
}

fn print_event(orchestrator: &SessionOrchestrator, event: &SessionEvent) {
    match event {
        SessionEvent::SegmentCreated { segment } => {
            println!("[{}] {}", segment.id, segment.original_text);
        }
        SessionEvent::SegmentTranslated { id, translated } => match orchestrator.segment(*id) {
            Some(segment) => println!("[{id}] {} => {translated}", segment.original_text),
            None => println!("[{id}] => {translated}"),
        },
        SessionEvent::SegmentFailed { id, error } => {
            eprintln!("[{id}] translation failed: {error}");
        }
        SessionEvent::SpeechFailed { id, error } => {
            eprintln!("[{id}] speech failed: {error}");
        }
        SessionEvent::SttError { message } => eprintln!("stt error: {message}"),
        SessionEvent::SttState { state } => tracing::info!(state = %state, "STT"),
        SessionEvent::TtsState { state } => tracing::info!(state = %state, "TTS"),
        SessionEvent::CaptureEnded => {}
    }
}
