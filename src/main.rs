//! # wsstomp
//!
//! STOMP-over-WebSocket broker and its companion demo client.
//!
//! ```text
//! wsstomp server [--host H] [-p PORT] [--heartbeat-ms MS]
//! wsstomp client [-u URL] [-t TOPIC] [-m MESSAGE] [--login L --passcode P]
//! ```
//!
//! Settings come from `~/.wsstomp/settings.json` and `WSSTOMP_*` variables;
//! flags given here win.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use wsstomp_broker::{AllowAll, Authenticator, StaticCredentials};
use wsstomp_client::{Credentials, StompClient};
use wsstomp_logging::{LogFormat, init_logging};
use wsstomp_server::{ServerConfig, WsStompServer, metrics, shutdown};
use wsstomp_settings::WsStompSettings;

/// STOMP over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "wsstomp", version, about = "STOMP over WebSocket broker and demo client")]
struct Cli {
    /// Settings file (defaults to `~/.wsstomp/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the broker.
    Server {
        /// Host to bind.
        #[arg(long)]
        host: Option<String>,
        /// Port to bind.
        #[arg(short, long)]
        port: Option<u16>,
        /// Heart-beat interval in milliseconds (0 disables).
        #[arg(long)]
        heartbeat_ms: Option<u64>,
        /// Serve Prometheus metrics on `/metrics`.
        #[arg(long)]
        metrics: bool,
    },
    /// Subscribe and print, or publish one message.
    Client {
        /// Broker WebSocket URL.
        #[arg(short, long)]
        url: Option<String>,
        /// Destination to use.
        #[arg(short, long)]
        topic: Option<String>,
        /// Message to publish; omit to subscribe.
        #[arg(short, long)]
        message: Option<String>,
        /// Login sent on CONNECT.
        #[arg(long, requires = "passcode")]
        login: Option<String>,
        /// Passcode sent on CONNECT.
        #[arg(long, requires = "login")]
        passcode: Option<String>,
    },
}

impl Cli {
    /// Overlay command-line flags on loaded settings.
    fn apply(&self, settings: &mut WsStompSettings) {
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.log_json {
            settings.logging.json = true;
        }
        match &self.command {
            Mode::Server {
                host,
                port,
                heartbeat_ms,
                ..
            } => {
                if let Some(host) = host {
                    settings.server.host.clone_from(host);
                }
                if let Some(port) = port {
                    settings.server.port = *port;
                }
                if let Some(ms) = heartbeat_ms {
                    settings.server.heartbeat_ms = *ms;
                }
            }
            Mode::Client {
                url,
                topic,
                message,
                login,
                passcode,
            } => {
                if let Some(url) = url {
                    settings.client.url.clone_from(url);
                }
                if let Some(topic) = topic {
                    settings.client.topic.clone_from(topic);
                }
                if let Some(message) = message {
                    settings.client.message.clone_from(message);
                }
                if login.is_some() {
                    settings.client.login.clone_from(login);
                    settings.client.passcode.clone_from(passcode);
                }
            }
        }
    }
}

fn authenticator(settings: &WsStompSettings) -> Arc<dyn Authenticator> {
    if settings.auth.users.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(StaticCredentials::new(settings.auth.users.clone()))
    }
}

async fn run_server(settings: &WsStompSettings, with_metrics: bool) -> Result<()> {
    let config = ServerConfig::from_settings(settings);
    let shutdown_timeout = config.shutdown_timeout;
    let mut server = WsStompServer::new(config, authenticator(settings));
    if with_metrics {
        server = server.with_metrics(metrics::install_recorder()?);
    }

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to start server")?;
    let mut handles = vec![handle];
    handles.extend(server.take_background_tasks());
    tracing::info!(users = settings.auth.users.len(), "broker ready on ws://{addr}/ws");

    shutdown::shutdown_signal().await;
    let _ = server
        .shutdown()
        .graceful_shutdown(handles, shutdown_timeout)
        .await;
    Ok(())
}

async fn run_client(settings: &WsStompSettings) -> Result<()> {
    let client_settings = &settings.client;
    let credentials = match (&client_settings.login, &client_settings.passcode) {
        (Some(login), Some(passcode)) => Some(Credentials::new(login.as_str(), passcode.as_str())),
        _ => None,
    };

    let mut client = StompClient::connect(&client_settings.url, credentials.as_ref())
        .await
        .with_context(|| format!("Failed to connect to {}", client_settings.url))?;

    if client_settings.message.is_empty() {
        client
            .subscribe(&client_settings.topic, "0")
            .await
            .context("Failed to subscribe")?;
        tracing::info!(topic = %client_settings.topic, "subscribed, waiting for messages");
        let seen = client
            .for_each_message(|frame| println!("{}", String::from_utf8_lossy(&frame.body)))
            .await
            .context("Subscription ended with an error")?;
        tracing::info!(seen, "connection closed");
    } else {
        client
            .publish(&client_settings.topic, client_settings.message.clone())
            .await
            .context("Failed to publish")?;
        client.disconnect().await.context("Failed to disconnect")?;
        tracing::info!(topic = %client_settings.topic, "message published");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(wsstomp_settings::settings_path);
    let mut settings = wsstomp_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    let _ = init_logging(
        &settings.logging.level,
        LogFormat::from_json_flag(settings.logging.json),
    );

    match cli.command {
        Mode::Server { metrics, .. } => run_server(&settings, metrics).await,
        Mode::Client { .. } => run_client(&settings).await,
    }
}
