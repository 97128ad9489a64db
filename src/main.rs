//! callwire: telephone-facing AI voice agent.
//!
//! Dials a number through an out-of-process SIP user agent, bridges the
//! call audio to a voice backend, and runs the conversation until a
//! farewell or sustained silence ends it.

mod assistant;
mod audio;
mod backend;
mod config;
mod llm;
mod session;
mod sip;
mod triggers;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use assistant::{AssistantClient, AssistantConfig};
use backend::local::{LocalBackend, LocalConfig};
use backend::realtime::{RealtimeBackend, RealtimeConfig, ToolDef};
use backend::BackendAdapter;
use config::paths::{audio_socket_path, get_data_dir, lock_path};
use config::{read_settings, AgentProfile, Settings};
use llm::Role;
use session::{SessionBuilder, SessionPaths};
use sip::SipControl;
use triggers::{DelegateTrigger, FarewellTrigger, SilenceTrigger, TriggerManager, WakeTrigger};

/// Session-level silence timeout (the trigger default is shorter).
const SESSION_SILENCE_SECS: f64 = 30.0;

#[derive(Debug)]
struct CliArgs {
    command: Command,
    backend: Option<String>,
    profile: Option<String>,
    transcript: Option<PathBuf>,
    verbose: bool,
}

#[derive(Debug)]
enum Command {
    Call { number: String },
    Hangup,
}

fn usage() -> ! {
    eprintln!("Usage: callwire <number> [--local] [--profile NAME] [--transcript FILE] [--verbose]");
    eprintln!("       callwire hangup");
    std::process::exit(1);
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut positional: Option<String> = None;
    let mut cli = CliArgs {
        command: Command::Hangup,
        backend: None,
        profile: None,
        transcript: None,
        verbose: false,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--local" => cli.backend = Some("local".to_string()),
            "--realtime" => cli.backend = Some("realtime".to_string()),
            "--profile" => cli.profile = args.next().or_else(|| usage()),
            "--transcript" => cli.transcript = args.next().map(PathBuf::from).or_else(|| usage()),
            "--verbose" | "-v" => cli.verbose = true,
            other if other.starts_with('-') => usage(),
            other => {
                if positional.is_some() {
                    usage();
                }
                positional = Some(other.to_string());
            }
        }
    }

    match positional.as_deref() {
        Some("hangup") => cli.command = Command::Hangup,
        Some(number) => {
            cli.command = Command::Call {
                number: number.to_string(),
            }
        }
        None => usage(),
    }
    cli
}

#[tokio::main]
async fn main() {
    // Respect RUST_LOG; default to info.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Log to a file under the data dir when possible, stderr otherwise.
    let data_dir = get_data_dir();
    let use_file = std::fs::create_dir_all(&data_dir).is_ok();
    let _guard: Option<tracing_appender::non_blocking::WorkerGuard>;
    if use_file {
        let file_appender = tracing_appender::rolling::never(&data_dir, "callwire.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _guard = Some(guard);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
    } else {
        _guard = None;
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = parse_args();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = if e.downcast_ref::<session::lock::LockHeld>().is_some() {
            2
        } else {
            1
        };
        std::process::exit(code);
    }
}

async fn run(cli: CliArgs) -> Result<()> {
    let settings = read_settings();

    match &cli.command {
        Command::Hangup => hangup_running_call(&settings).await,
        Command::Call { number } => {
            let number = number.clone();
            place_call(cli, number, settings).await
        }
    }
}

/// Remediation path: end whatever call the lock file points at.
async fn hangup_running_call(settings: &Settings) -> Result<()> {
    let server = settings.sip_server().unwrap_or("localhost");
    let sip = SipControl::new(settings.sip_control(), server);
    match sip.hangup().await {
        Ok(_) => info!("Hangup sent"),
        Err(e) => warn!(error = %e, "SIP hangup failed (call may already be down)"),
    }
    let _ = std::fs::remove_file(lock_path());
    Ok(())
}

async fn place_call(cli: CliArgs, number: String, settings: Settings) -> Result<()> {
    let profile_name = cli
        .profile
        .as_deref()
        .or(settings.profile.as_deref())
        .unwrap_or("garbo");
    let profile = AgentProfile::named(profile_name)?;
    let api_key = config::api_key()?;

    let backend_name = cli
        .backend
        .as_deref()
        .unwrap_or_else(|| settings.backend_name());
    let backend = match backend_name {
        "realtime" => BackendAdapter::Realtime(RealtimeBackend::new(RealtimeConfig {
            url: settings.realtime_url().to_string(),
            api_key: api_key.clone(),
            voice: profile.voice.clone(),
            instructions: profile.instructions.clone(),
            tools: vec![classify_intent_tool()],
        })),
        "local" => {
            let stt_command = settings
                .stt_command
                .clone()
                .context("local backend needs stt_command in settings")?;
            let tts_command = settings
                .tts_command
                .clone()
                .context("local backend needs tts_command in settings")?;
            BackendAdapter::Local(LocalBackend::new(LocalConfig {
                stt_command,
                tts_command,
                llm_endpoint: settings.chat_url().to_string(),
                llm_api_key: api_key.clone(),
                llm_model: settings.chat_model().to_string(),
                instructions: profile.instructions.clone(),
            }))
        }
        other => bail!("Unknown backend: {}", other),
    };

    let mut triggers = TriggerManager::new();
    triggers.add(FarewellTrigger::new().for_role(Role::User));
    triggers.add(SilenceTrigger::with_timeout(SESSION_SILENCE_SECS));
    triggers.add(DelegateTrigger::new());
    let wake_prefix = format!("Hey {}", profile.name);
    triggers.add(WakeTrigger::new(&[wake_prefix.as_str()]).for_role(Role::User));

    let assistant = AssistantClient::new(AssistantConfig {
        endpoint: settings.chat_url().to_string(),
        api_key,
        model: settings.chat_model().to_string(),
    })?;

    let sip = SipControl::new(settings.sip_control(), settings.sip_server()?);
    let paths = SessionPaths {
        lock: lock_path(),
        audio_socket: audio_socket_path(),
    };

    let transcript_path = cli.transcript.clone().or_else(|| {
        settings.transcript_dir.as_ref().map(|dir| {
            dir.join(format!(
                "call-{}-{}.txt",
                sip::canonicalize_number(&number),
                chrono::Local::now().format("%Y%m%d-%H%M%S")
            ))
        })
    });

    info!(number = %number, backend = backend_name, profile = %profile.name, "Starting call");
    SessionBuilder::new(&number, backend, sip, paths)
        .triggers(triggers)
        .assistant(assistant)
        .transcript_path(transcript_path)
        .greeting(settings.greeting.clone())
        .verbose(cli.verbose)
        .build()
        .run()
        .await
}

/// The delegation tool the realtime agent may invoke.
fn classify_intent_tool() -> ToolDef {
    ToolDef::function(
        "classify_intent",
        "Classify a caller request that needs out-of-band handling (sending \
         a text, looking something up) and hand it to the assistant.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "intent": {
                    "type": "string",
                    "description": "Short intent label, e.g. send_text",
                },
                "request": {
                    "type": "string",
                    "description": "The caller's request, restated plainly",
                },
            },
            "required": ["intent", "request"],
        }),
    )
}
