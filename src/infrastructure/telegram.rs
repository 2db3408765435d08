//! Telegram notification channel with duplicate suppression.

use crate::domain::ports::Notifier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Identical text within this window is sent only once.
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

pub struct TelegramNotifier {
    client: Client,
    token: Option<String>,
    chat_id: Option<String>,
    recent: Mutex<HashMap<String, Instant>>,
}

impl TelegramNotifier {
    pub fn new(token: Option<String>, chat_id: Option<String>, timeout_secs: u64) -> Self {
        if token.is_none() || chat_id.is_none() {
            info!("TelegramNotifier: no token/chat configured, notifications disabled");
        }
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_else(|_| Client::new()),
            token,
            chat_id,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// True when this exact text already went out inside the dedup window.
    async fn is_duplicate(&self, text: &str) -> bool {
        let mut recent = self.recent.lock().await;
        let now = Instant::now();
        recent.retain(|_, sent_at| now.duration_since(*sent_at) < DEDUP_WINDOW);

        if recent.contains_key(text) {
            return true;
        }
        recent.insert(text.to_string(), now);
        false
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str, force: bool) -> Result<()> {
        let (Some(token), Some(chat_id)) = (&self.token, &self.chat_id) else {
            debug!("TelegramNotifier: dropped (not configured): {}", text);
            return Ok(());
        };

        // Duplicate suppression applies to forced sends too: force bypasses
        // quiet filtering, not idempotence.
        if self.is_duplicate(text).await {
            debug!("TelegramNotifier: duplicate within {}s suppressed", DEDUP_WINDOW.as_secs());
            return Ok(());
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .context("Failed to reach Telegram")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("TelegramNotifier: send failed ({}): {}", status, body);
            if force {
                anyhow::bail!("Telegram send failed: {}", status);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_notifier_is_a_no_op() {
        let notifier = TelegramNotifier::new(None, None, 10);
        notifier.send("hello", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_detection_window() {
        let notifier = TelegramNotifier::new(None, None, 10);
        assert!(!notifier.is_duplicate("alert").await);
        assert!(notifier.is_duplicate("alert").await);
        assert!(!notifier.is_duplicate("different alert").await);
    }
}
