use async_trait::async_trait;

use crate::{
    domain::{ChatId, DeliveryId},
    errors::TransportError,
};

/// Outbound half of one live tenant connection.
///
/// Implementations are bound to exactly one tenant's credential; the
/// supervisor never hands one to another tenant.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_text(&self, chat_id: &ChatId, body: &str) -> Result<DeliveryId, TransportError>;
}
