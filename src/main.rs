//! Interview Voice - terminal front end
//!
//! Runs one mock-interview call against the voice agent. The interviewer's
//! speech plays through the default output device; the transcript is printed
//! as it arrives.
//!
//! Commands on stdin:
//! - `/code <path>` submits a source file as the candidate's solution
//! - `/close` dismisses the code editor
//! - `/quit` ends the call

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use interview_voice::{
    CallStatus, InterviewProfile, Role, SessionController, SessionDeps, Turn, UiEvent, VoiceConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Load prior turns from `INTERVIEW_HISTORY_FILE` (a JSON array of
/// `{role, content}`), if set.
fn load_history() -> Result<Vec<Turn>> {
    let Ok(path) = std::env::var("INTERVIEW_HISTORY_FILE") else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading history file {}", path))?;
    let history: Vec<Turn> =
        serde_json::from_str(&raw).with_context(|| format!("parsing history file {}", path))?;
    info!("Loaded {} prior turns from {}", history.len(), path);
    Ok(history)
}

async fn print_ui_events(mut rx: broadcast::Receiver<UiEvent>) {
    loop {
        match rx.recv().await {
            Ok(UiEvent::Transcript(turn)) => {
                let speaker = match turn.role {
                    Role::User => "You",
                    Role::Assistant => "Interviewer",
                };
                println!("{}: {}", speaker, turn.content);
            }
            Ok(UiEvent::Status(status)) => println!("[{}]", status.as_str()),
            Ok(UiEvent::Listening(true)) => println!("(listening...)"),
            Ok(UiEvent::Listening(false)) => {}
            Ok(UiEvent::CodeMode(true)) => {
                println!("[code editor open: submit with /code <path>, dismiss with /close]")
            }
            Ok(UiEvent::CodeMode(false)) => println!("[code editor closed]"),
            Ok(UiEvent::TranscriptCleared) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("UI printer skipped {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Apply one command line. Returns false when the call should end.
async fn handle_command(controller: &mut SessionController, line: &str) -> Result<bool> {
    match line.split_once(' ').map(|(cmd, arg)| (cmd, arg.trim())).unwrap_or((line, "")) {
        ("/quit", _) => return Ok(false),
        ("/close", _) => controller.close_code_editor(),
        ("/code", "") => println!("usage: /code <path>"),
        ("/code", path) => {
            let code = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path))?;
            controller.submit_code(&code).context("submitting code")?;
            println!("[submitted {} ({} bytes)]", path, code.len());
        }
        ("", _) => {}
        _ => println!("commands: /code <path>, /close, /quit"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("interview_voice=info")),
        )
        .init();
    info!("Starting interview voice session");

    let config = VoiceConfig::from_env().context("loading configuration")?;
    let profile = InterviewProfile::from_env();
    let history = load_history()?;
    let voice_id = std::env::var("INTERVIEW_VOICE_ID").unwrap_or_default();

    let deps = SessionDeps::production(&config);
    let mut controller = SessionController::new(config, profile, deps);
    tokio::spawn(print_ui_events(controller.subscribe()));

    controller
        .start_call(history, &voice_id)
        .await
        .context("starting the call")?;
    println!("Call started. Speak into your microphone; /quit to hang up.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = controller.next_event() => {
                controller.handle_event(event).await;
                if controller.status() != CallStatus::Active {
                    info!("Call ended by the agent");
                    break;
                }
            }
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => match handle_command(&mut controller, line.trim()).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => eprintln!("{:#}", e),
                    },
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let failed = controller.status() == CallStatus::Error;
    controller.end_call().await;
    if failed {
        anyhow::bail!("call ended with a connection error");
    }
    Ok(())
}
