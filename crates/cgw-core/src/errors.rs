use crate::domain::{PatientId, TenantId};

/// Top-level error type for startup and wiring.
///
/// Adapter crates map their specific errors into this type; the per-operation
/// error enums below carry the classification the HTTP surface and the
/// supervisor act on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the persistent record store collaborator.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store returned malformed data: {0}")]
    Decode(String),
}

/// Failure to establish (or keep) a tenant connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The network rejected the tenant credential. Terminal until it changes.
    #[error("credential rejected: {0}")]
    Unauthorized(String),

    /// Network, timeout or handshake failure worth retrying.
    #[error("connection failed: {0}")]
    Transient(String),
}

/// A send attempt failed at the network layer after a connection was up.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("tenant {0} has no active connection")]
    NoActiveConnection(TenantId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tenant {0} not found")]
    NotFound(TenantId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome classification for an outbound send request.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("patient {patient} has no linked chat in tenant {tenant}")]
    NotLinked { tenant: TenantId, patient: PatientId },

    #[error("patient {patient} does not belong to tenant {tenant}")]
    OwnershipMismatch { tenant: TenantId, patient: PatientId },

    #[error("tenant {0} has no active connection")]
    NoActiveConnection(TenantId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("send timed out")]
    Timeout,
}

impl From<SendError> for DispatchError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::NoActiveConnection(t) => Self::NoActiveConnection(t),
            SendError::Transport(t) => Self::Transport(t),
        }
    }
}
