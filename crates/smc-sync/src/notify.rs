use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use smc_core::{CollectorError, RunStats};
use tracing::{debug, error, info, warn};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Operational alerts. Delivery is best-effort: implementations log their own failures and
/// never report them to the caller.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_start(&self, service: &str);

    async fn notify_success(&self, service: &str, stats: &RunStats, duration_secs: u64);

    /// Sent instead of a success notification when the run completed with warnings.
    async fn notify_warning(&self, service: &str, stats: &RunStats, duration_secs: u64);

    async fn notify_error(&self, service: &str, error: &CollectorError, duration_secs: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_start(&self, service: &str) {
        info!(service, "collector started");
    }

    async fn notify_success(&self, service: &str, stats: &RunStats, duration_secs: u64) {
        info!(
            service,
            duration_secs,
            inserted = stats.inserted,
            updated = stats.updated,
            processed = stats.processed,
            "collector finished"
        );
    }

    async fn notify_warning(&self, service: &str, stats: &RunStats, duration_secs: u64) {
        warn!(
            service,
            duration_secs,
            warnings = ?stats.warnings,
            "collector finished with warnings"
        );
    }

    async fn notify_error(&self, service: &str, error: &CollectorError, duration_secs: u64) {
        error!(service, duration_secs, error = %error, "collector failed");
    }
}

#[derive(Debug)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
    pub api_base: String,
}

impl TelegramConfig {
    /// `None` unless both `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHAT_ID` are set.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|v| !v.trim().is_empty())?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok().filter(|v| !v.trim().is_empty())?;
        Some(Self {
            bot_token: SecretString::from(token),
            chat_id,
            api_base: TELEGRAM_API_BASE.to_string(),
        })
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Bot API sender. Without a config it only logs.
pub struct TelegramNotifier {
    client: reqwest::Client,
    config: Option<TelegramConfig>,
}

impl TelegramNotifier {
    pub fn new(client: reqwest::Client, config: Option<TelegramConfig>) -> Self {
        if config.is_none() {
            warn!("TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID not set; telegram notifications disabled");
        }
        Self { client, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    async fn send(&self, text: String) {
        let Some(config) = &self.config else {
            debug!(text = %text, "telegram disabled, dropping notification");
            return;
        };
        let url = format!(
            "{}/bot{}/sendMessage",
            config.api_base.trim_end_matches('/'),
            config.bot_token.expose_secret()
        );
        let body = json!({
            "chat_id": config.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => debug!("telegram notification delivered"),
            Ok(resp) => warn!(status = resp.status().as_u16(), "telegram rejected notification"),
            // the error text would carry the bot token inside the url
            Err(err) => warn!(error = %err.without_url(), "telegram notification failed"),
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn notify_start(&self, service: &str) {
        self.send(format!("▶️ <b>{}</b> started", escape_html(service)))
            .await;
    }

    async fn notify_success(&self, service: &str, stats: &RunStats, duration_secs: u64) {
        self.send(format!(
            "✅ <b>{}</b> finished in {duration_secs}s\ninserted: {}\nupdated: {}\nprocessed: {}",
            escape_html(service),
            stats.inserted,
            stats.updated,
            stats.processed
        ))
        .await;
    }

    async fn notify_warning(&self, service: &str, stats: &RunStats, duration_secs: u64) {
        let warnings = stats
            .warnings
            .iter()
            .map(|w| format!("• {}", escape_html(w)))
            .collect::<Vec<_>>()
            .join("\n");
        self.send(format!(
            "⚠️ <b>{}</b> finished in {duration_secs}s with {} warning(s)\ninserted: {}\nupdated: {}\n{warnings}",
            escape_html(service),
            stats.warnings.len(),
            stats.inserted,
            stats.updated
        ))
        .await;
    }

    async fn notify_error(&self, service: &str, error: &CollectorError, duration_secs: u64) {
        self.send(format!(
            "❌ <b>{}</b> failed after {duration_secs}s\n{}",
            escape_html(service),
            escape_html(&error.to_string())
        ))
        .await;
    }
}

/// Telegram when configured, plain logging otherwise.
pub fn notifier_from_env(client: reqwest::Client) -> Arc<dyn NotificationSink> {
    match TelegramConfig::from_env() {
        Some(config) => Arc::new(TelegramNotifier::new(client, Some(config))),
        None => {
            warn!("TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID not set; notifications go to the log only");
            Arc::new(LogNotifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> TelegramConfig {
        TelegramConfig {
            bot_token: SecretString::from("123:abc".to_string()),
            chat_id: "-100".into(),
            api_base: server.uri(),
        }
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(escape_html("a<b>&c"), "a&lt;b&gt;&amp;c");
    }

    #[tokio::test]
    async fn sends_html_message_to_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(json!({"chat_id": "-100", "parse_mode": "HTML"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;
        let notifier = TelegramNotifier::new(reqwest::Client::new(), Some(config(&server)));
        let stats = RunStats {
            inserted: 2,
            ..RunStats::default()
        };
        notifier.notify_success("topvisor", &stats, 3).await;
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let notifier = TelegramNotifier::new(reqwest::Client::new(), Some(config(&server)));
        notifier
            .notify_error("gsc", &CollectorError::Connectivity("down".into()), 1)
            .await;

        let disabled = TelegramNotifier::new(reqwest::Client::new(), None);
        assert!(!disabled.is_enabled());
        disabled.notify_start("gsc").await;
    }
}
