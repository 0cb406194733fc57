//! `tether` command-line client.
//!
//! Loads `config.ron` (CLI flags override it), connects over TCP, and prints
//! engine notifications until Ctrl-C or a terminal connection status.
//! With `--send <event>` it issues one request, prints the outcome, and exits.
//!
//! Run with `cargo run -p tether-client -- --url tcp://127.0.0.1:7400`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tether_config::{CliArgs, Config};
use tether_net::{
    Client, ClientConfig, ConnectionStatus, Notification, Payload, PendingResponse, RequestResult,
    TcpConnector,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("tether"))
            .unwrap_or_else(|| PathBuf::from(".tether"))
    });

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        return ExitCode::from(2);
    }

    let log_dir = config_dir.join("logs");
    tether_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let client_config = ClientConfig::from_settings(&config);
    let auto_connect = client_config.auto_connect;
    info!(url = %client_config.url, auto_connect, "Starting client");

    let client = Client::spawn(client_config, TcpConnector::from_settings(&config));
    let notifications = client.subscribe();

    let request = args.send.as_ref().map(|event| {
        if !auto_connect {
            client.connect();
        }
        let payload = Payload::from_bytes(args.data.clone().unwrap_or_default().into_bytes());
        match args.timeout_ms {
            Some(ms) => client.send_with_timeout(event.as_str(), payload, Duration::from_millis(ms)),
            None => client.send(event.as_str(), payload),
        }
    });

    let code = run(&client, notifications, request, config.debug.print_notifications).await;

    client.terminate();
    client.stopped().await;
    code
}

/// Drive the client until Ctrl-C, a terminal status, or the one-shot request
/// completes.
async fn run(
    client: &Client,
    mut notifications: tokio::sync::broadcast::Receiver<Notification>,
    mut request: Option<PendingResponse>,
    print_notifications: bool,
) -> ExitCode {
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for ctrl-c: {e}");
                }
                info!("Shutting down...");
                return ExitCode::SUCCESS;
            }
            outcome = wait_for(&mut request) => {
                return match outcome {
                    Ok(payload) => {
                        println!("{}", render(&payload));
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("request failed: {e}");
                        ExitCode::FAILURE
                    }
                };
            }
            received = notifications.recv() => match received {
                Ok(notification) => {
                    if print_notifications {
                        println!("{}", describe(&notification));
                    }
                    if let Notification::StatusChanged(status) = notification
                        && status.is_terminal()
                    {
                        warn!(?status, "Connection ended");
                        return match status {
                            ConnectionStatus::UserClosed | ConnectionStatus::Terminated => {
                                ExitCode::SUCCESS
                            }
                            _ => ExitCode::FAILURE,
                        };
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notification consumer fell behind");
                }
                Err(RecvError::Closed) => return ExitCode::SUCCESS,
            },
        }

        if client.status() == ConnectionStatus::Terminated {
            return ExitCode::SUCCESS;
        }
    }
}

/// Resolve the one-shot request, or never when there is none.
async fn wait_for(request: &mut Option<PendingResponse>) -> RequestResult {
    match request {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

/// One-line description of a notification.
fn describe(notification: &Notification) -> String {
    match notification {
        Notification::StatusChanged(status) => format!("status  {status:?}"),
        Notification::EventReceived(event) => {
            format!("event   {} {}", event.event, render(&event.payload))
        }
        Notification::ResponseReceived {
            correlation_id,
            result: Ok(payload),
        } => format!("reply   #{correlation_id} {}", render(payload)),
        Notification::ResponseReceived {
            correlation_id,
            result: Err(e),
        } => format!("reply   #{correlation_id} failed: {e}"),
        Notification::DecodeFailed { reason } => format!("decode  {reason}"),
    }
}

/// Payloads are opaque; show them as text when they are valid UTF-8.
fn render(payload: &Payload) -> String {
    match std::str::from_utf8(payload.as_bytes()) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<{} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_net::{RequestError, ServerEvent};

    #[test]
    fn test_render_text_and_binary() {
        assert_eq!(render(&Payload::from_bytes(b"hi".to_vec())), "hi");
        assert_eq!(render(&Payload::from_bytes(vec![0xff, 0xfe])), "<2 bytes>");
    }

    #[test]
    fn test_describe_notifications() {
        assert_eq!(
            describe(&Notification::StatusChanged(ConnectionStatus::Open)),
            "status  Open"
        );
        assert_eq!(
            describe(&Notification::EventReceived(ServerEvent {
                event: "news".into(),
                payload: Payload::from_bytes(b"x".to_vec()),
            })),
            "event   news x"
        );
        assert_eq!(
            describe(&Notification::ResponseReceived {
                correlation_id: 3,
                result: Err(RequestError::Timeout),
            }),
            "reply   #3 failed: request timed out"
        );
    }
}
