use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{AllowedUpdate, UpdateKind},
};
use tracing::{debug, info};

use cgw_core::{
    domain::{ChatId, Credential, InboundMessage, TenantId},
    errors::ConnectError,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    transport::{ChatConnector, ChatSession},
};

use crate::{classify_request_error, TelegramMessenger};

/// Slack on top of the long-poll timeout before the HTTP client gives up.
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// Opens one long-polling bot session per clinic token.
#[derive(Clone, Debug)]
pub struct TelegramConnector {
    poll_timeout: Duration,
    throttle: ThrottleConfig,
}

impl TelegramConnector {
    pub fn new(poll_timeout: Duration, throttle: ThrottleConfig) -> Self {
        Self {
            poll_timeout,
            throttle,
        }
    }

    fn bot(&self, credential: &Credential) -> Result<Bot, ConnectError> {
        let client = teloxide::net::default_reqwest_settings()
            .timeout(self.poll_timeout + CLIENT_TIMEOUT_SLACK)
            .build()
            .map_err(|e| ConnectError::Transient(format!("http client: {e}")))?;
        Ok(Bot::with_client(credential.expose(), client))
    }
}

#[async_trait]
impl ChatConnector for TelegramConnector {
    async fn connect(
        &self,
        tenant: &TenantId,
        credential: &Credential,
    ) -> Result<Box<dyn ChatSession>, ConnectError> {
        let bot = self.bot(credential)?;
        let me = bot
            .get_me()
            .await
            .map_err(|e| classify_request_error(&e))?;
        info!(%tenant, bot = %me.username(), "telegram bot connected");

        // Throttle outbound sends per bot; RetryAfter is still retried by the messenger.
        let raw: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
        let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(raw, self.throttle));

        Ok(Box::new(TelegramSession {
            tenant: tenant.clone(),
            bot,
            messenger,
            poll_timeout: self.poll_timeout,
            offset: 0,
            buffered: VecDeque::new(),
        }))
    }
}

struct TelegramSession {
    tenant: TenantId,
    bot: Bot,
    messenger: Arc<dyn MessagingPort>,
    poll_timeout: Duration,
    offset: i32,
    buffered: VecDeque<InboundMessage>,
}

impl TelegramSession {
    /// Pull one batch of updates, advancing the offset past everything seen.
    async fn poll(&mut self) -> Result<(), ConnectError> {
        let updates = self
            .bot
            .get_updates()
            .offset(self.offset)
            .timeout(self.poll_timeout.as_secs().min(u32::MAX as u64) as u32)
            .allowed_updates(vec![AllowedUpdate::Message])
            .await
            .map_err(|e| classify_request_error(&e))?;

        for update in updates {
            self.offset = self.offset.max(update.id + 1);
            if let Some(message) = text_message(update.kind) {
                self.buffered.push_back(message);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChatSession for TelegramSession {
    fn messenger(&self) -> Arc<dyn MessagingPort> {
        self.messenger.clone()
    }

    async fn next_message(&mut self) -> Option<Result<InboundMessage, ConnectError>> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Some(Ok(message));
            }
            if let Err(e) = self.poll().await {
                debug!(tenant = %self.tenant, "telegram polling stopped: {e}");
                return Some(Err(e));
            }
        }
    }
}

/// Text messages only; everything else (photos, joins, edits) is skipped.
fn text_message(kind: UpdateKind) -> Option<InboundMessage> {
    let UpdateKind::Message(msg) = kind else {
        return None;
    };
    let text = msg.text()?;
    Some(InboundMessage {
        chat_id: ChatId::new(msg.chat.id.0.to_string()),
        text: text.to_string(),
    })
}
