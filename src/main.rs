use clap::Parser;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use twitch_exporter::app::App;
use twitch_exporter::config::{ConfigOverrides, LogLevel, SafeConfig};
use twitch_exporter::util::logging;

/// Prometheus exporter for Twitch channel metrics
#[derive(Parser, Debug)]
#[command(name = "twitch-exporter", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long = "config.file", value_name = "PATH")]
    config_file: Option<PathBuf>,

    /// Address to listen on for the web interface and telemetry
    #[arg(long = "web.listen-address", default_value = "0.0.0.0:9184")]
    listen_address: SocketAddr,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    telemetry_path: String,

    /// Client ID for the Twitch Helix API
    #[arg(long = "twitch.client-id")]
    client_id: Option<String>,

    /// Client secret for the Twitch Helix API
    #[arg(long = "twitch.client-secret")]
    client_secret: Option<String>,

    /// User access token for the Twitch Helix API
    #[arg(long = "twitch.access-token")]
    access_token: Option<String>,

    /// Refresh token used to renew the user access token
    #[arg(long = "twitch.refresh-token")]
    refresh_token: Option<String>,

    /// Name of a Twitch channel to request metrics for (repeatable)
    #[arg(long = "twitch.channel", value_name = "NAME")]
    channels: Vec<String>,

    /// Enable webhook event subscriptions
    #[arg(long = "eventsub.enabled")]
    eventsub_enabled: bool,

    /// Public URL event deliveries are posted to
    #[arg(long = "eventsub.webhook-url")]
    webhook_url: Option<String>,

    /// Secret used to sign event deliveries
    #[arg(long = "eventsub.webhook-secret")]
    webhook_secret: Option<String>,

    /// Enable a collector (repeatable)
    #[arg(long = "collector.enable", value_name = "NAME")]
    enable: Vec<String>,

    /// Disable a collector (repeatable)
    #[arg(long = "collector.disable", value_name = "NAME")]
    disable: Vec<String>,

    /// Disable every collector not explicitly enabled
    #[arg(long = "collector.disable-defaults")]
    disable_defaults: bool,

    /// Seconds a scrape waits for collectors; 0 waits forever
    #[arg(long = "scrape.timeout", value_name = "SECONDS")]
    scrape_timeout: Option<u64>,

    /// Logging level
    #[arg(long = "log-level", value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            channels: self.channels.clone(),
            eventsub_enabled: self.eventsub_enabled,
            webhook_url: self.webhook_url.clone(),
            webhook_secret: self.webhook_secret.clone(),
            enable: self.enable.clone(),
            disable: self.disable.clone(),
            disable_defaults: self.disable_defaults,
            scrape_timeout_seconds: self.scrape_timeout,
            log_level: self.log_level,
        }
    }
}

#[cfg(unix)]
async fn reload_on_hangup(app: Arc<App>) {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => {
            while hangup.recv().await.is_some() {
                info!("Received SIGHUP, reloading configuration");
                if let Err(e) = app.reload().await {
                    error!("Reload failed: {}", e);
                }
            }
        }
        Err(e) => warn!("Could not install SIGHUP handler: {}", e),
    }

    // reloads stay available over HTTP
    std::future::pending::<()>().await
}

#[cfg(not(unix))]
async fn reload_on_hangup(_app: Arc<App>) {
    std::future::pending::<()>().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match SafeConfig::load(args.config_file.clone(), args.overrides()) {
        Ok(config) => {
            logging::init(config.current().log_level);
            if let Some(path) = config.path() {
                info!("Configuration loaded from {}", path.display());
            }
            config
        }
        Err(e) => {
            logging::init(LogLevel::Error);
            error!("Failed to load configuration: {}", e);
            return Err(anyhow::anyhow!("Failed to load configuration: {}", e));
        }
    };

    info!("Starting twitch-exporter {}", twitch_exporter::VERSION);

    let app = match App::start(config).await {
        Ok(app) => Arc::new(app),
        Err(e) => {
            error!("Failed to start exporter: {}", e);
            return Err(e.into());
        }
    };

    if app.eventsub().is_some() {
        info!(
            "Event subscriptions enabled, deliveries accepted on {}",
            twitch_exporter::server::EVENTSUB_PATH
        );
    }

    let listener = TcpListener::bind(args.listen_address).await?;

    tokio::select! {
        result = twitch_exporter::server::serve(Arc::clone(&app), listener, args.telemetry_path.clone()) => {
            if let Err(e) = result {
                error!("HTTP server stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = reload_on_hangup(Arc::clone(&app)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt signal, shutting down...");
        }
    }

    Ok(())
}
