//! Ports onto the external chat network.
//!
//! A connector turns a tenant credential into a session; a session yields
//! inbound messages until it drops and exposes a messenger for outbound sends.
//! Whether the network underneath polls or pushes is the adapter's business.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    domain::{Credential, InboundMessage, TenantId},
    errors::ConnectError,
    messaging::port::MessagingPort,
};

#[async_trait]
pub trait ChatConnector: Send + Sync {
    /// Open a session with `credential`. `Unauthorized` is terminal for this
    /// credential; `Transient` is retried by the supervisor.
    async fn connect(
        &self,
        tenant: &TenantId,
        credential: &Credential,
    ) -> Result<Box<dyn ChatSession>, ConnectError>;
}

#[async_trait]
pub trait ChatSession: Send {
    /// Outbound handle bound to this session's credential.
    fn messenger(&self) -> Arc<dyn MessagingPort>;

    /// Next inbound message. `None` or `Some(Err(_))` ends the session; the
    /// error decides between reconnecting and failing the tenant.
    ///
    /// Must be cancel-safe: the supervisor drops this future on shutdown.
    async fn next_message(&mut self) -> Option<Result<InboundMessage, ConnectError>>;
}
