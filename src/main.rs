use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rpchat::voice::SAMPLE_RATE;
use rpchat::{
    AudioCapture, AudioClip, AudioPlayback, Capabilities, ChatCompletionClient, Config,
    ConversationOrchestrator, ConversationRepo, OrchestratorConfig, SpeechToText, StatusEvent,
    TextToSpeech, DEFAULT_SESSION_TITLE,
};

/// RPChat - voice and text conversations with an OpenAI-compatible LLM
#[derive(Parser)]
#[command(name = "rpchat", version, about)]
struct Cli {
    /// Path to config file (defaults to the platform config dir)
    #[arg(short, long, env = "RPCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Type turns on stdin instead of speaking them
    #[arg(long)]
    text: bool,

    /// Continue an existing session instead of starting a new one
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone capture
    TestMic {
        /// Maximum seconds to wait for an utterance
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
    /// Test speaker output with a short tone
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Probe the completion endpoint
    TestApi,
    /// List stored sessions
    Sessions,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,rpchat=info",
        1 => "info,rpchat=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Command::TestMic { duration }) => return test_mic(&config, duration).await,
        Some(Command::TestSpeaker) => return test_speaker().await,
        Some(Command::TestTts { text }) => return test_tts(&config, &text).await,
        Some(Command::TestApi) => return test_api(&config).await,
        Some(Command::Sessions) => return list_sessions(&config),
        None => {}
    }

    let pool = rpchat::store::init(&config.database_path)?;
    let store = ConversationRepo::new(pool);

    let completions = Arc::new(ChatCompletionClient::new(&config.api)?);
    let caps = Capabilities {
        capture: Arc::new(AudioCapture::new(&config.audio)),
        playback: Arc::new(AudioPlayback::new()?),
        recognizer: Arc::new(SpeechToText::from_config(&config.voice, &config.api)?),
        synthesizer: Arc::new(TextToSpeech::from_config(&config.voice, &config.api)?),
        completions,
    };

    let orchestrator =
        ConversationOrchestrator::new(caps, store.clone(), OrchestratorConfig::from(&config));

    let session = match &cli.session {
        Some(id) => store.get_session(id)?,
        None => store.create_session(DEFAULT_SESSION_TITLE)?,
    };
    tracing::info!(session = %session.id, title = %session.title, "session ready");

    // ctrl-c cancels the active turn and exits
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    if cli.text {
        run_text_mode(&orchestrator, &session.id, &shutdown).await
    } else {
        run_voice_mode(&orchestrator, &session.id, &shutdown).await
    }
}

/// Voice session: one command starts the loop; auto-resume keeps it going
async fn run_voice_mode(
    orchestrator: &Arc<ConversationOrchestrator>,
    session_id: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();
    orchestrator.start_voice_turn(session_id)?;
    println!("listening... (ctrl-c to quit)");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                orchestrator.cancel(session_id);
                // let the turn drain before exiting
                wait_for_idle(&mut events, session_id).await;
                break;
            }
            event = events.recv() => {
                let Ok(event) = event else { continue };
                if event.session_id() != session_id {
                    continue;
                }
                print_event(&event);
                if matches!(event, StatusEvent::Idle { .. }) {
                    // auto-resume disabled, error, or nothing heard
                    break;
                }
            }
        }
    }

    println!("bye");
    Ok(())
}

/// Text session: read stdin lines, stream responses to stdout
async fn run_text_mode(
    orchestrator: &Arc<ConversationOrchestrator>,
    session_id: &str,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    println!("type a message and press enter (ctrl-c to quit)");

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if shutdown.is_cancelled() {
            break;
        }

        let mut events = orchestrator.subscribe();
        orchestrator.start_text_turn(session_id, line)?;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    orchestrator.cancel(session_id);
                    wait_for_idle(&mut events, session_id).await;
                    println!();
                    return Ok(());
                }
                event = events.recv() => {
                    let Ok(event) = event else { continue };
                    if event.session_id() != session_id {
                        continue;
                    }
                    match &event {
                        StatusEvent::CompletionDelta { text, .. } => {
                            print!("{text}");
                            std::io::stdout().flush()?;
                        }
                        StatusEvent::Error { message, .. } => eprintln!("\nerror: {message}"),
                        StatusEvent::Idle { .. } => {
                            println!();
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(())
}

async fn wait_for_idle(
    events: &mut tokio::sync::broadcast::Receiver<StatusEvent>,
    session_id: &str,
) {
    let drain = async {
        while let Ok(event) = events.recv().await {
            if event.session_id() == session_id && matches!(event, StatusEvent::Idle { .. }) {
                break;
            }
        }
    };
    // bounded: a stuck turn must not block shutdown
    let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
}

fn print_event(event: &StatusEvent) {
    match event {
        StatusEvent::Listening { .. } => println!("[listening]"),
        StatusEvent::NothingHeard { .. } => println!("[nothing heard]"),
        StatusEvent::Recognized { text, .. } => println!("you: {text}"),
        StatusEvent::CompletionDelta { text, .. } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        StatusEvent::CompletionDone { .. } => println!(),
        StatusEvent::Speaking { .. } => println!("[speaking]"),
        StatusEvent::Interrupted { .. } => println!("[interrupted]"),
        StatusEvent::Error { message, .. } => eprintln!("error: {message}"),
        _ => {}
    }
}

async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("say something ({duration}s max)...");

    let mut audio = config.audio.clone();
    audio.no_speech_timeout = Duration::from_secs(duration);
    audio.max_utterance = Duration::from_secs(duration);

    let capture = AudioCapture::new(&audio);
    let outcome = capture
        .record(CancellationToken::new(), CancellationToken::new())
        .await?;

    match outcome {
        rpchat::CaptureOutcome::Clip(clip) if !clip.is_empty() => {
            println!("captured {:.2}s of audio", clip.duration_secs());
        }
        _ => println!("no speech detected"),
    }
    Ok(())
}

async fn test_speaker() -> anyhow::Result<()> {
    println!("playing test tone...");

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..SAMPLE_RATE)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            0.2 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
        })
        .collect();

    let playback = AudioPlayback::new()?;
    playback
        .play(AudioClip::new(samples, SAMPLE_RATE), CancellationToken::new())
        .await?;

    println!("done");
    Ok(())
}

async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("synthesizing: {text}");

    let tts = TextToSpeech::from_config(&config.voice, &config.api)?;
    let clip = tts.synthesize(text).await?;
    println!("got {:.2}s of audio", clip.duration_secs());

    let playback = AudioPlayback::new()?;
    playback.play(clip, CancellationToken::new()).await?;
    Ok(())
}

async fn test_api(config: &Config) -> anyhow::Result<()> {
    println!("probing {} with model {}...", config.api.base_url, config.api.model);

    let client = ChatCompletionClient::new(&config.api)?;
    if client.test_connection(&config.api.model).await {
        println!("ok");
        Ok(())
    } else {
        anyhow::bail!("completion endpoint unreachable or rejected the request")
    }
}

fn list_sessions(config: &Config) -> anyhow::Result<()> {
    let pool = rpchat::store::init(&config.database_path)?;
    let store = ConversationRepo::new(pool);

    let sessions = store.list_sessions()?;
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }

    for session in sessions {
        let count = store.message_count(&session.id)?;
        println!(
            "{}  {}  ({count} messages, updated {})",
            session.id,
            session.title,
            session.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
