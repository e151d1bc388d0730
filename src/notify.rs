//! Operator notifications over the Telegram Bot API.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("telegram api returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Something that can deliver a short text to the operator. Sends are best
/// effort; callers log failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Delivers via the Bot API `sendMessage` endpoint.
pub struct TelegramNotifier {
    http: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            chat_id,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let resp = self
            .http
            .post(&url)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Api { status, body });
        }
        Ok(())
    }
}

/// Drops every message. Used for dry runs and when credentials are absent.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        tracing::debug!("Notification suppressed: {}", text);
        Ok(())
    }
}

/// Pick the notifier for this run.
pub fn build_notifier(cfg: &Config) -> Box<dyn Notifier> {
    if cfg.dry_run {
        tracing::info!("Dry run: notifications disabled");
        return Box::new(NoopNotifier);
    }
    match (&cfg.bot_token, &cfg.chat_id) {
        (Some(token), Some(chat)) => Box::new(TelegramNotifier::new(token.clone(), chat.clone())),
        _ => {
            tracing::warn!("TG_BOT_TOKEN/TG_CHAT_ID not set, notifications disabled");
            Box::new(NoopNotifier)
        }
    }
}

pub fn new_gift_message(title: &str) -> String {
    let label = if title.is_empty() { "(untitled)" } else { title };
    format!("🆕 New gift: {}", label)
}

pub fn bought_message(label: &str, price: &str) -> String {
    if price.is_empty() {
        format!("✅ Bought gift: {}", label)
    } else {
        format!("✅ Bought gift: {} ({})", label, price)
    }
}
