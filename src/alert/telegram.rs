use super::AlertSink;
use crate::config::AlertConfig;
use crate::error::BalancerError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

const API_BASE: &str = "https://api.telegram.org";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Telegram Bot API `sendMessage` with HTML formatting.
pub struct TelegramSink {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(bot_token: &str, chat_id: &str) -> Result<Self, BalancerError> {
        Self::with_base(API_BASE, bot_token, chat_id)
    }

    pub fn with_base(base: &str, bot_token: &str, chat_id: &str) -> Result<Self, BalancerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(BalancerError::Http)?;
        Ok(Self {
            client,
            url: format!("{}/bot{}/sendMessage", base.trim_end_matches('/'), bot_token),
            chat_id: chat_id.to_string(),
        })
    }

    /// `None` when alerts are disabled or incomplete.
    pub fn from_config(cfg: &AlertConfig) -> Result<Option<Self>, BalancerError> {
        if !cfg.enabled() {
            return Ok(None);
        }
        match (cfg.bot_token.as_deref(), cfg.chat_id.as_deref()) {
            (Some(token), Some(chat)) => Self::new(token, chat).map(Some),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    async fn send(&self, text: &str) -> Result<(), BalancerError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
                parse_mode: "HTML",
                disable_web_page_preview: true,
            })
            .send()
            .await
            .map_err(BalancerError::Http)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BalancerError::Alert(format!(
                "telegram sendMessage failed: {} - {}",
                status, body
            )));
        }
        Ok(())
    }
}
