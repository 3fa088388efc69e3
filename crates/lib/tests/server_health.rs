//! Integration test: serve health and webhook routes on a free port, and run the whole bridge
//! against local Telegram and Discord stand-ins.

mod common;

use bridge::channels::{DiscordConnection, PlatformConnection, TelegramConnection, WebhookSettings};
use bridge::config::{Config, RouteConfig, RouteDirection};
use bridge::server::{self, ServerState};
use common::GOOD_TOKEN;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn start_server(telegram: Arc<TelegramConnection>) -> (String, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let url = format!("http://{}", listener.local_addr().expect("local_addr"));
    let discord: Arc<dyn PlatformConnection> = Arc::new(DiscordConnection::new("unused"));
    let shutdown = CancellationToken::new();
    tokio::spawn(server::serve(
        listener,
        ServerState { telegram, discord },
        shutdown.clone(),
    ));
    (url, shutdown)
}

fn webhook_connection(base: &str) -> TelegramConnection {
    TelegramConnection::new(GOOD_TOKEN)
        .with_api_base(base)
        .with_webhook(WebhookSettings {
            url: "https://relay.example.com/telegram/webhook".into(),
            secret: Some("s3cret".into()),
        })
}

#[tokio::test]
async fn health_reports_connection_states() {
    let telegram = Arc::new(TelegramConnection::new(GOOD_TOKEN));
    let (url, shutdown) = start_server(telegram).await;

    let resp = reqwest::get(format!("{}/", url)).await.expect("GET /");
    assert!(resp.status().is_success());
    let json: Value = resp.json().await.expect("parse JSON");
    assert_eq!(json["runtime"].as_str(), Some("running"));
    assert_eq!(json["connections"]["telegram"].as_str(), Some("disconnected"));
    assert_eq!(json["connections"]["discord"].as_str(), Some("disconnected"));
    shutdown.cancel();
}

#[tokio::test]
async fn webhook_is_not_found_in_polling_mode() {
    let telegram = Arc::new(TelegramConnection::new(GOOD_TOKEN));
    let (url, shutdown) = start_server(telegram).await;
    let status = reqwest::Client::new()
        .post(format!("{}/telegram/webhook", url))
        .body("{}")
        .send()
        .await
        .expect("POST webhook")
        .status();
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    shutdown.cancel();
}

#[tokio::test]
async fn webhook_checks_secret_and_feeds_stream() {
    let api = common::spawn_telegram().await;
    let telegram = Arc::new(webhook_connection(&api.base));
    let (url, shutdown) = start_server(telegram.clone()).await;
    let client = reqwest::Client::new();
    let endpoint = format!("{}/telegram/webhook", url);
    let update = common::telegram_update(1, -100, 7, "alice", "hello from telegram").to_string();

    let status = client
        .post(&endpoint)
        .header("X-Telegram-Bot-Api-Secret-Token", "wrong")
        .body(update.clone())
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::FORBIDDEN);

    // No active stream yet.
    let status = client
        .post(&endpoint)
        .header("X-Telegram-Bot-Api-Secret-Token", "s3cret")
        .body(update.clone())
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE);

    telegram.connect().await.unwrap();
    assert!(api.called("setWebhook"));
    let mut stream = telegram.inbound_stream().unwrap();

    let status = client
        .post(&endpoint)
        .header("X-Telegram-Bot-Api-Secret-Token", "s3cret")
        .body("not json")
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);

    let status = client
        .post(&endpoint)
        .header("X-Telegram-Bot-Api-Secret-Token", "s3cret")
        .body(update)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::OK);
    let ev = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.sender_display_name, "alice");
    assert_eq!(ev.body_text, "hello from telegram");

    telegram.disconnect().await;
    shutdown.cancel();
}

#[tokio::test]
async fn bridge_relays_between_stand_ins_and_reports_health() {
    let telegram_api = common::spawn_telegram().await;
    telegram_api.queue_update(common::telegram_update(1, -100, 7, "alice", "hi discord"));
    let discord_api = common::spawn_discord(vec![common::discord_message(
        "d1", "u1", "bob", "hi telegram",
    )])
    .await;
    let port = free_port();

    let mut config = Config::default();
    config.telegram.bot_token = Some(GOOD_TOKEN.to_string());
    config.telegram.api_base = Some(telegram_api.base.clone());
    config.telegram.poll_timeout_secs = Some(0);
    config.discord.bot_token = Some(GOOD_TOKEN.to_string());
    config.discord.api_base = Some(discord_api.base.clone());
    config.routes.push(RouteConfig {
        telegram_chat_id: "-100".to_string(),
        discord_channel_id: "d1".to_string(),
        direction: RouteDirection::Both,
    });
    config.reconnect.initial_delay_ms = 10;
    config.server.enabled = true;
    config.server.bind = "127.0.0.1".to_string();
    config.server.port = port;

    let bridge_handle = tokio::spawn(bridge::runtime::run_bridge(config));

    let discord_ref = &discord_api;
    assert!(common::wait_until(|| !discord_ref.sent().is_empty()).await);
    assert_eq!(discord_api.sent()[0].0, "d1");
    assert_eq!(discord_api.sent()[0].1["content"].as_str(), Some("alice: hi discord"));

    let telegram_ref = &telegram_api;
    assert!(
        common::wait_until(|| telegram_ref
            .requests()
            .iter()
            .any(|(m, b)| m == "sendMessage" && b["text"] == "bob: hi telegram"))
        .await
    );
    let (_, body) = telegram_api
        .requests()
        .into_iter()
        .find(|(m, _)| m == "sendMessage")
        .unwrap();
    assert_eq!(body["chat_id"].as_str(), Some("-100"));

    let url = format!("http://127.0.0.1:{}/", port);
    let json: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(json["connections"]["telegram"].as_str(), Some("connected"));
    assert_eq!(json["connections"]["discord"].as_str(), Some("connected"));

    bridge_handle.abort();
}
