//! `jarvis` command-line front-end.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use rustyline::error::ReadlineError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use jarvis::audio::{list_devices, CpalMicrophone, CpalSpeaker};
use jarvis::chat::{user_notice, ChatService, GeminiChatClient, SendOutcome};
use jarvis::config::Config;
use jarvis::i18n::Language;
use jarvis::profile::{Account, MemoryStore, UserProfile};
use jarvis::voice::{
    GeminiLiveTransport, SessionState, TranscriptRole, VoiceController, VoiceControllerConfig,
    VoiceObserver,
};
use jarvis::{VoiceError, VoiceResult};

#[derive(Debug, Parser)]
#[command(name = "jarvis", about = "Voice and chat assistant for Gemini", version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Response language: en, es or fr
    #[arg(long, global = true)]
    language: Option<Language>,

    /// Prebuilt voice for live sessions
    #[arg(long, global = true)]
    voice: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Live voice conversation. Enter toggles the microphone, Ctrl+C quits.
    Voice {
        /// Save each session's model audio as WAV in this directory
        #[arg(long)]
        record_dir: Option<PathBuf>,
    },
    /// Interactive streaming text chat
    Chat,
    /// List audio input and output devices
    Devices,
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(language) = cli.language {
        config.profile.language = language.code().to_string();
    }
    if let Some(voice) = cli.voice {
        config.profile.voice = voice;
    }
    config.validate()?;

    init_tracing(&config.logging.level);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "jarvis starting");

    match cli.command {
        Command::Voice { record_dir } => run_voice(&config, record_dir).await,
        Command::Chat => run_chat(&config).await,
        Command::Devices => print_devices(),
        Command::Config => print_config(&config),
    }
}

/// Logs go to stderr so stdout stays clean for conversation output.
fn init_tracing(default_directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
}

// ── voice ──────────────────────────────────────────────────────────

struct ConsoleObserver;

impl VoiceObserver for ConsoleObserver {
    fn on_alert(&self, message: &str) {
        println!("{}", style(message).red().bold());
    }

    fn on_state(&self, state: SessionState) {
        let label = match state {
            SessionState::Active => style("● listening").green(),
            SessionState::Inactive => style("○ idle").dim(),
        };
        println!("{label}");
    }

    fn on_transcript(&self, role: TranscriptRole, text: &str) {
        match role {
            TranscriptRole::User => println!("{} {text}", style("you:").cyan()),
            TranscriptRole::Model => println!("{} {text}", style("jarvis:").magenta()),
        }
    }
}

async fn run_voice(config: &Config, record_dir: Option<PathBuf>) -> Result<()> {
    let transport = GeminiLiveTransport::new(&config.gemini.live_url, config.api_key()?)?;
    let microphone = CpalMicrophone::new(
        config.voice.input_device.clone(),
        config.voice.input_sample_rate,
    );
    let speaker = CpalSpeaker::new(config.voice.output_device.clone());

    let profile = UserProfile::from_defaults(&config.profile);
    let strings = profile.language.translations();
    let controller_config = VoiceControllerConfig {
        record_dir,
        ..VoiceControllerConfig::from_config(config)
    };

    let (controller, handle) = VoiceController::new(
        controller_config,
        profile.voice_preferences(),
        Arc::new(microphone),
        Arc::new(speaker),
        Arc::new(transport),
        Arc::new(ConsoleObserver),
    );
    let task = controller.spawn();

    println!(
        "{}  Enter: {} / {}  ·  Ctrl+C: quit",
        style("JARVIS").cyan().bold(),
        strings.start_listening,
        strings.stop_listening
    );

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    // The start runs as its own task so Enter and Ctrl+C stay responsive
    // while devices are being acquired; a stop cancels it.
    let mut starting: Option<JoinHandle<VoiceResult<()>>> = None;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.trim().eq_ignore_ascii_case("q") => break,
                    Some(_) => {
                        if starting.is_some() || handle.state() == SessionState::Active {
                            handle.stop().await;
                        } else {
                            let handle = handle.clone();
                            starting = Some(tokio::spawn(async move { handle.start().await }));
                        }
                    }
                    None => break,
                }
            }
            result = join_start(&mut starting) => {
                starting = None;
                report_start(result);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.stop().await;
    if let Some(task) = starting.take() {
        report_start(task.await);
    }
    handle.shutdown();
    task.await.context("Voice controller task failed")?;
    Ok(())
}

/// Resolves with the in-flight start's result, or never when there is none.
async fn join_start(
    starting: &mut Option<JoinHandle<VoiceResult<()>>>,
) -> Result<VoiceResult<()>, tokio::task::JoinError> {
    match starting.as_mut() {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// Failures were already surfaced through the observer; this only adds
/// the retry hint.
fn report_start(result: Result<VoiceResult<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(VoiceError::Cancelled)) => tracing::debug!("Voice session start cancelled"),
        Ok(Err(e)) if e.is_retryable() => {
            tracing::debug!(error = %e, "Voice session start failed");
            println!("{}", style("Press Enter to try again.").dim());
        }
        Ok(Err(e)) => tracing::debug!(error = %e, "Voice session start failed"),
        Err(e) => tracing::error!(error = %e, "Voice session start task failed"),
    }
}

// ── chat ───────────────────────────────────────────────────────────

enum Input {
    Line(String),
    Interrupted,
    Eof,
}

/// Owns the line editor on a dedicated thread. Each prompt sent in
/// yields one [`Input`] back.
fn spawn_line_reader() -> Result<(std::sync::mpsc::Sender<String>, mpsc::UnboundedReceiver<Input>)> {
    let mut editor = rustyline::DefaultEditor::new().context("Failed to initialise line editor")?;
    let (prompt_tx, prompt_rx) = std::sync::mpsc::channel::<String>();
    let (input_tx, input_rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("jarvis-readline".into())
        .spawn(move || {
            while let Ok(prompt) = prompt_rx.recv() {
                let input = match editor.readline(&prompt) {
                    Ok(line) => {
                        if !line.trim().is_empty() {
                            let _ = editor.add_history_entry(line.as_str());
                        }
                        Input::Line(line)
                    }
                    Err(ReadlineError::Interrupted) => Input::Interrupted,
                    Err(ReadlineError::Eof) => Input::Eof,
                    Err(e) => {
                        tracing::error!(error = %e, "Line editor failed");
                        Input::Eof
                    }
                };
                if input_tx.send(input).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn line reader")?;

    Ok((prompt_tx, input_rx))
}

fn attachment_name(path: &str) -> Result<String> {
    let path = Path::new(path.trim());
    anyhow::ensure!(path.is_file(), "No such file: {}", path.display());
    Ok(path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string()))
}

async fn run_chat(config: &Config) -> Result<()> {
    let client = GeminiChatClient::from_config(config)?;
    let mut account = Account::load(
        Arc::new(MemoryStore::new()),
        UserProfile::from_defaults(&config.profile),
    );
    account.log_in();

    let language = account.profile().language;
    let strings = language.translations();
    let mut service = ChatService::new(client, language);
    service.new_conversation();

    println!(
        "{} {}",
        style("jarvis:").magenta().bold(),
        strings.welcome_message
    );
    println!(
        "{}",
        style("/attach <file>  /new  /history  /open <n>  /upgrade  /quota  /quit").dim()
    );

    let (prompt_tx, mut inputs) = spawn_line_reader()?;
    let mut attachments: Vec<String> = Vec::new();

    loop {
        let prompt = if attachments.is_empty() {
            "> ".to_string()
        } else {
            format!("[{}] > ", attachments.len())
        };
        if prompt_tx.send(prompt).is_err() {
            break;
        }
        let line = match inputs.recv().await {
            Some(Input::Line(line)) => line,
            Some(Input::Interrupted) | Some(Input::Eof) | None => break,
        };
        let line = line.trim();

        match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest)) {
            ("/quit", _) | ("/exit", _) => break,
            ("/attach", path) => match attachment_name(path) {
                Ok(name) => {
                    println!("{} {name}", style("+").green());
                    attachments.push(name);
                }
                Err(e) => println!("{}", style(e).red()),
            },
            ("/new", _) => {
                service.new_conversation();
                println!("{} {}", style("jarvis:").magenta().bold(), strings.welcome_message);
            }
            ("/history", _) => {
                println!("{}", style(strings.history).bold());
                let active = service.history().active_id().map(str::to_string);
                for (i, conversation) in service.history().conversations().iter().enumerate() {
                    let marker = if Some(&conversation.id) == active.as_ref() { "*" } else { " " };
                    println!(
                        "{marker} {:>2}  {}  {}",
                        i + 1,
                        conversation
                            .created_at
                            .with_timezone(&chrono::Local)
                            .format("%H:%M"),
                        conversation.title
                    );
                }
            }
            ("/open", n) => {
                let id = n
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| service.history().conversations().get(i))
                    .map(|c| c.id.clone());
                match id {
                    Some(id) => {
                        service.select(&id);
                        if let Some(conversation) = service.history().active() {
                            for message in &conversation.messages {
                                println!("{:?}: {}", message.role, message.parts);
                            }
                        }
                    }
                    None => println!("{}", style("No such conversation").red()),
                }
            }
            ("/upgrade", _) => {
                account.upgrade_to_pro();
                println!("{}", style(strings.pro_membership_title).yellow().bold());
            }
            ("/quota", _) => match account.uploads_remaining() {
                Some(left) => println!("{}", strings.uploads_remaining(left, account.quota().limit())),
                None => println!("{}", strings.pro_membership_title),
            },
            _ => {
                let files = std::mem::take(&mut attachments);
                print!("{} ", style("jarvis:").magenta().bold());
                let _ = std::io::stdout().flush();
                let outcome = service
                    .send_message(&mut account, line, &files, |fragment| {
                        print!("{fragment}");
                        let _ = std::io::stdout().flush();
                    })
                    .await;
                match outcome {
                    Ok(SendOutcome::Replied(_)) => println!(),
                    Ok(SendOutcome::Failed) => {
                        println!("\n{}", style(strings.error_sending_message).red())
                    }
                    Ok(SendOutcome::Empty) => println!(),
                    Err(e @ VoiceError::UploadLimitReached { .. }) => {
                        println!("{}", style(user_notice(&e, language)).red());
                        attachments = files;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    Ok(())
}

// ── devices / config ───────────────────────────────────────────────

fn print_devices() -> Result<()> {
    let devices = list_devices().context("Failed to enumerate audio devices")?;
    let mark = |name: &str, default: &Option<String>| {
        if default.as_deref() == Some(name) {
            "*"
        } else {
            " "
        }
    };

    println!("{}", style("Input devices").bold());
    for name in &devices.inputs {
        println!("{} {name}", mark(name, &devices.default_input));
    }
    println!("{}", style("Output devices").bold());
    for name in &devices.outputs {
        println!("{} {name}", mark(name, &devices.default_output));
    }
    Ok(())
}

fn print_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    if shown.gemini.api_key.is_some() {
        shown.gemini.api_key = Some("<redacted>".to_string());
    }
    print!("{}", shown.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn join_start_waits_only_for_an_in_flight_start() {
        let mut idle = None;
        let waited = tokio::time::timeout(Duration::from_millis(20), join_start(&mut idle)).await;
        assert!(waited.is_err());

        let mut starting = Some(tokio::spawn(async { Err(VoiceError::Cancelled) }));
        let result = join_start(&mut starting).await;
        assert!(matches!(result, Ok(Err(VoiceError::Cancelled))));
    }

    #[test]
    fn voice_subcommand_takes_record_dir() {
        let cli = Cli::try_parse_from(["jarvis", "--language", "fr", "voice", "--record-dir", "out"])
            .unwrap();
        assert_eq!(cli.language, Some(Language::Fr));
        assert!(matches!(
            cli.command,
            Command::Voice { record_dir: Some(ref dir) } if dir == Path::new("out")
        ));
    }
}
