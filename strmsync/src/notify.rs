//! Best-effort outbound notifications through the Telegram bot API.

use tracing::{info, warn};

const MESSAGE_PREFIX: &str = "[strmsync]\n";

struct Telegram {
    api_key: String,
    chat_id: String,
    client: reqwest::Client,
}

/// Sends task lifecycle messages to the configured operator. A missing API
/// key or chat id disables the notifier without error.
pub struct Notifier {
    telegram: Option<Telegram>,
}

impl Notifier {
    pub fn new(api_key: &str, chat_id: &str) -> Notifier {
        if api_key.is_empty() || chat_id.is_empty() {
            info!("Telegram notifications disabled, no api key or chat id configured");
            return Notifier { telegram: None };
        }
        Notifier {
            telegram: Some(Telegram {
                api_key: api_key.to_owned(),
                chat_id: chat_id.to_owned(),
                client: reqwest::Client::new(),
            }),
        }
    }

    /// Failures are logged and swallowed: a notification must never fail a
    /// run.
    pub async fn send_message(&self, text: &str) {
        let Some(telegram) = &self.telegram else {
            return;
        };
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            telegram.api_key
        );
        let body = serde_json::json!({
            "chat_id": telegram.chat_id,
            "text": format!("{MESSAGE_PREFIX}{text}"),
        });
        match telegram.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!("Telegram API answered {}", response.status()),
            Err(e) => warn!("failed to send the Telegram notification: {e:#}"),
        }
    }
}
