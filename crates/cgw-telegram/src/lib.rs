//! Telegram adapter (teloxide).
//!
//! This crate implements the `cgw-core` chat network ports over the Telegram
//! Bot API: one bot token per clinic, long polling for inbound updates.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use teloxide::{prelude::*, ApiError, RequestError};
use tokio::time::sleep;

pub mod connector;

pub use connector::TelegramConnector;

use cgw_core::{
    domain::{ChatId, DeliveryId},
    errors::{ConnectError, TransportError},
    messaging::port::MessagingPort,
};

/// Telegram caps a single text message at 4096 characters.
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: &ChatId) -> Result<teloxide::types::ChatId, TransportError> {
        chat_id
            .as_str()
            .parse::<i64>()
            .map(teloxide::types::ChatId)
            .map_err(|_| TransportError(format!("invalid telegram chat id '{chat_id}'")))
    }

    fn map_err(e: RequestError) -> TransportError {
        TransportError(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T, TransportError>
    where
        Fut: std::future::IntoFuture<Output = Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    async fn send_text(&self, chat_id: &ChatId, body: &str) -> Result<DeliveryId, TransportError> {
        let chat = Self::tg_chat(chat_id)?;
        let text = truncate_message(body);
        let msg = self
            .with_retry(|| self.bot.send_message(chat, text.clone()))
            .await?;
        Ok(DeliveryId(msg.id.0.to_string()))
    }
}

/// Classify a Bot API failure seen while connecting or polling.
///
/// Telegram answers `401 Unauthorized` for a revoked token and `404 Not Found`
/// for one that is not a token at all; both are terminal for the credential.
pub fn classify_request_error(e: &RequestError) -> ConnectError {
    match e {
        RequestError::Api(ApiError::NotFound) => {
            ConnectError::Unauthorized("telegram rejected the bot token".to_string())
        }
        RequestError::Api(ApiError::Unknown(desc)) if desc.eq_ignore_ascii_case("not found") => {
            ConnectError::Unauthorized("telegram does not recognize the bot token".to_string())
        }
        other => ConnectError::Transient(format!("telegram error: {other}")),
    }
}

/// Credential shape check for Telegram bot tokens: `<bot id>:<secret>`.
pub fn check_bot_token(token: &str) -> Result<(), String> {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    let re = TOKEN_RE
        .get_or_init(|| Regex::new(r"^\d{1,20}:[A-Za-z0-9_-]{30,}$").expect("valid regex"));
    if re.is_match(token) {
        Ok(())
    } else {
        Err("not a telegram bot token".to_string())
    }
}

fn truncate_message(body: &str) -> String {
    match body.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((cut, _)) => body[..cut].to_string(),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_token_shape() {
        assert!(check_bot_token("123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw").is_ok());
        assert!(check_bot_token("123456789:short").is_err());
        assert!(check_bot_token("AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw").is_err());
        assert!(check_bot_token(" 123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw").is_err());
        assert!(check_bot_token("").is_err());
    }

    #[test]
    fn invalid_token_is_terminal() {
        let e = RequestError::Api(ApiError::NotFound);
        assert!(matches!(
            classify_request_error(&e),
            ConnectError::Unauthorized(_)
        ));

        let e = RequestError::Api(ApiError::Unknown("Not Found".to_string()));
        assert!(matches!(
            classify_request_error(&e),
            ConnectError::Unauthorized(_)
        ));
    }

    #[test]
    fn other_api_errors_are_retried() {
        let e = RequestError::Api(ApiError::BotBlocked);
        assert!(matches!(
            classify_request_error(&e),
            ConnectError::Transient(_)
        ));
    }

    #[test]
    fn chat_ids_must_be_numeric() {
        assert_eq!(
            TelegramMessenger::tg_chat(&ChatId::from("-100123")).unwrap(),
            teloxide::types::ChatId(-100123)
        );
        assert!(TelegramMessenger::tg_chat(&ChatId::from("chat77")).is_err());
    }

    #[test]
    fn long_messages_are_truncated_on_char_boundaries() {
        let body = "é".repeat(MAX_MESSAGE_LEN + 10);
        let out = truncate_message(&body);
        assert_eq!(out.chars().count(), MAX_MESSAGE_LEN);
        assert_eq!(truncate_message("hi"), "hi");
    }
}
