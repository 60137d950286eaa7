//! sessionguard - inspect and drive a guarded session from the terminal.
//!
//! Usage:
//!   sessionguard status
//!   sessionguard login-token <token> <secret> [expires-in-secs]
//!   sessionguard logout
//!   sessionguard verify
//!   sessionguard watch

mod app;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionguard_core::{
    ChannelObserver, PushApprovalGateway, PushEvent, PushOutcome, SessionConfig, SessionEvent,
    SessionRecord, Verifier,
};

use app::App;

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the observer channel used by `watch`
const EVENT_BUFFER: usize = 32;

const LOG_FILE: &str = "sessionguard.log";

enum Command {
    Status,
    LoginToken {
        token: String,
        secret: String,
        expires_in_secs: i64,
    },
    Logout,
    Verify,
    Watch,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        match args.first().map(String::as_str) {
            None | Some("status") => Ok(Command::Status),
            Some("login-token") => {
                let token = args.get(1).context("login-token needs <token>")?;
                let secret = args.get(2).context("login-token needs <secret>")?;
                let expires_in_secs = match args.get(3) {
                    Some(raw) => raw
                        .parse()
                        .with_context(|| format!("Invalid expires-in-secs: {}", raw))?,
                    None => 0,
                };
                Ok(Command::LoginToken {
                    token: token.clone(),
                    secret: secret.clone(),
                    expires_in_secs,
                })
            }
            Some("logout") => Ok(Command::Logout),
            Some("verify") => Ok(Command::Verify),
            Some("watch") => Ok(Command::Watch),
            Some(other) => Err(anyhow::anyhow!("Unknown command: {}", other)),
        }
    }
}

/// Initialize the tracing subscriber for logging.
///
/// Console output follows `RUST_LOG` (default `warn`); the rolling log file in
/// the data directory always records `info` and above.
fn init_tracing(config: &SessionConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let console = fmt::layer().with_writer(io::stderr).with_filter(filter);

    let appender = config.data_dir().ok().and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE)
            .build(dir.join("logs"))
            .map_err(|e| eprintln!("File logging disabled: {}", e))
            .ok()
    });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new("info,sessionguard_core=debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();
    guard
}

fn load_config() -> Result<SessionConfig> {
    let mut config = SessionConfig::load().context("Failed to load configuration")?;
    if let Ok(url) = std::env::var("SESSIONGUARD_API_URL") {
        config.api_base_url = Some(url);
    }
    if let Ok(secret) = std::env::var("SESSIONGUARD_DEVICE_SECRET") {
        config.device_secret = Some(secret);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::parse(&args)?;

    let config = load_config()?;
    let _log_guard = init_tracing(&config);
    info!("sessionguard starting");

    let app = App::new(config)?;

    match command {
        Command::Status => print_json(&app.status()),
        Command::LoginToken {
            token,
            secret,
            expires_in_secs,
        } => {
            let record = SessionRecord::expiring_in(
                token,
                secret,
                expires_in_secs,
                app.machine.now_millis(),
            );
            app.machine.login(record).context("Login failed")?;
            eprintln!("Session stored");
            print_json(&app.status());
        }
        Command::Logout => {
            app.machine.logout().context("Logout failed")?;
            eprintln!("Logged out");
        }
        Command::Verify => {
            let verifier = app.verifier(app.identity()?);
            let outcome = verifier.verify_now().await;
            eprintln!("Verification: {:?}", outcome);
            print_json(&app.status());
        }
        Command::Watch => watch(&app).await?,
    }

    info!("sessionguard shutting down");
    Ok(())
}

/// Run the verifier and accept step-up commands on stdin until interrupted
/// or the session is invalidated.
async fn watch(app: &App) -> Result<()> {
    let identity = app.identity()?;
    let (observer, mut events) = ChannelObserver::channel(EVENT_BUFFER);
    app.machine.register_observer(Arc::new(observer));

    let verifier = app.verifier(identity.clone());
    let gateway = app.gateway(identity);
    if !verifier.start() {
        eprintln!("Periodic verification disabled");
    }
    eprintln!("Watching session; commands: status, verify, step-up, logout, <push payload JSON>");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            Some(event) = events.recv() => {
                let invalidated = matches!(event, SessionEvent::Invalidated(_));
                report_event(&event);
                if invalidated {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        if !handle_line(app, &verifier, &gateway, line.trim()).await {
                            break;
                        }
                    }
                    None => stdin_open = false,
                }
            }
        }
    }

    verifier.stop();
    Ok(())
}

/// Returns `false` when the watch loop should end
async fn handle_line(
    app: &App,
    verifier: &Verifier,
    gateway: &PushApprovalGateway,
    line: &str,
) -> bool {
    match line {
        "" => {}
        "status" => print_json(&app.status()),
        "verify" => {
            let outcome = verifier.verify_now().await;
            eprintln!("Verification: {:?}", outcome);
        }
        "step-up" => match app.machine.begin_step_up(app.config.step_up_ttl()) {
            Ok(ticket) => print_json(&serde_json::json!({
                "ticket": ticket.id().as_str(),
                "expires_at": ticket.expires_at(),
            })),
            Err(e) => eprintln!("Step-up refused: {}", e),
        },
        "logout" => {
            if let Err(e) = app.machine.logout() {
                warn!(error = %e, "Logout did not clear the vault");
            }
            eprintln!("Logged out");
            return false;
        }
        payload if payload.starts_with('{') => match parse_payload(payload) {
            Ok(event) => match gateway.handle(event).await {
                Ok(PushOutcome::Approved(ticket)) => eprintln!("Approved {}", ticket.id()),
                Ok(PushOutcome::Denied(ticket)) => eprintln!("Denied {}", ticket.id()),
                Ok(PushOutcome::Ignored) => eprintln!("Ignored"),
                Err(e) => eprintln!("Push event rejected: {}", e),
            },
            Err(e) => eprintln!("Invalid payload: {:#}", e),
        },
        other => eprintln!("Unknown command: {}", other),
    }
    true
}

/// Push data arrives as a flat object; non-string values are stringified
fn parse_payload(raw: &str) -> Result<PushEvent> {
    let object: HashMap<String, serde_json::Value> =
        serde_json::from_str(raw).context("Expected a JSON object")?;
    let payload: HashMap<String, String> = object
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect();
    Ok(PushEvent::from_payload(&payload))
}

fn report_event(event: &SessionEvent) {
    match event {
        SessionEvent::Invalidated(reason) => eprintln!("Session invalidated: {}", reason),
        SessionEvent::SuppressPrompt(prompt) => {
            if let Some(ref ticket) = prompt.ticket_id {
                eprintln!("Dismiss prompt for ticket {}", ticket);
            }
        }
        SessionEvent::StateChanged(state) => eprintln!("State: {:?}", state),
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to render output: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_login_token() {
        match Command::parse(&args(&["login-token", "T1", "S1", "3600"])).unwrap() {
            Command::LoginToken {
                token,
                secret,
                expires_in_secs,
            } => {
                assert_eq!((token.as_str(), secret.as_str()), ("T1", "S1"));
                assert_eq!(expires_in_secs, 3600);
            }
            _ => panic!("expected login-token"),
        }
        assert!(Command::parse(&args(&["login-token", "T1"])).is_err());
        assert!(Command::parse(&args(&["bogus"])).is_err());
        assert!(matches!(Command::parse(&[]).unwrap(), Command::Status));
    }

    #[test]
    fn test_parse_payload_stringifies_values() {
        let event = parse_payload(
            r#"{"mode": "verify", "action": "Approve", "ticketToken": "vt", "notificationId": 7}"#,
        )
        .unwrap();
        assert_eq!(event.notification_id, Some(7));
        assert_eq!(event.ticket_token.as_deref(), Some("vt"));
        assert!(parse_payload("[1, 2]").is_err());
    }
}
