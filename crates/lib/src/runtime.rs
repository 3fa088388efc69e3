//! Process runtime: build connections from config, run the supervisor and optional HTTP server,
//! and translate SIGINT/SIGTERM into cancellation.

use crate::channels::{DiscordConnection, PlatformConnection, TelegramConnection, WebhookSettings};
use crate::config::{BridgeSettings, Config};
use crate::relay::RelayRouter;
use crate::server::{self, ServerState};
use crate::supervisor::{ReconnectPolicy, Supervisor};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Connections built from config, before they are handed to the supervisor.
pub struct Connections {
    pub telegram: Arc<TelegramConnection>,
    pub discord: Arc<DiscordConnection>,
}

pub fn build_connections(config: &Config, settings: &BridgeSettings) -> Connections {
    let mut telegram = TelegramConnection::new(settings.telegram_token.clone());
    if let Some(ref base) = config.telegram.api_base {
        telegram = telegram.with_api_base(base.clone());
    }
    if let Some(secs) = config.telegram.poll_timeout_secs {
        telegram = telegram.with_poll_timeout(secs);
    }
    if let Some(ref url) = config.telegram.webhook_url {
        telegram = telegram.with_webhook(WebhookSettings {
            url: url.clone(),
            secret: config.telegram.webhook_secret.clone(),
        });
    }
    let mut discord = DiscordConnection::new(settings.discord_token.clone())
        .with_guild(config.discord.guild_id.clone());
    if let Some(ref base) = config.discord.api_base {
        discord = discord.with_api_base(base.clone());
    }
    Connections {
        telegram: Arc::new(telegram),
        discord: Arc::new(discord),
    }
}

/// Run the bridge until SIGINT/SIGTERM. Fails on invalid config or unrecoverable startup errors.
pub async fn run_bridge(config: Config) -> Result<()> {
    let settings = config.validate().context("invalid configuration")?;
    log::info!("bridging {} route(s)", settings.routes.len());
    let connections = build_connections(&config, &settings);

    let telegram: Arc<dyn PlatformConnection> = connections.telegram.clone();
    let discord: Arc<dyn PlatformConnection> = connections.discord.clone();
    let router = Arc::new(RelayRouter::new(
        Arc::new(settings.routes),
        telegram.clone(),
        discord.clone(),
    ));
    let supervisor = Supervisor::new(
        telegram,
        discord.clone(),
        router,
        ReconnectPolicy::from(&config.reconnect),
    );

    let shutdown = CancellationToken::new();

    // Bind before connecting so Telegram can reach the webhook as soon as it is registered.
    let server_task = if config.server_enabled() {
        let bind_addr = format!("{}:{}", config.server.bind.trim(), config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding to {}", bind_addr))?;
        let state = ServerState {
            telegram: connections.telegram.clone(),
            discord,
        };
        Some(tokio::spawn(server::serve(listener, state, shutdown.clone())))
    } else {
        None
    };

    let signal_task = tokio::spawn(cancel_on_signal(shutdown.clone()));
    let result = supervisor.run(shutdown.clone()).await;
    shutdown.cancel();
    signal_task.abort();
    if let Some(task) = server_task {
        match task.await {
            Ok(Err(e)) => log::warn!("{:#}", e),
            Err(e) => log::warn!("server task: {}", e),
            Ok(Ok(())) => {}
        }
    }
    result.context("bridge failed to start")?;
    log::info!("bridge stopped");
    Ok(())
}

/// Cancels `shutdown` when the process receives SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, disconnecting");
    shutdown.cancel();
}
