use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(v: impl Into<String>) -> Self {
                Self(v.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(v: &str) -> Self {
                Self(v.to_string())
            }
        }
    };
}

string_id!(
    /// Clinic identifier (tenant).
    TenantId
);
string_id!(
    /// External chat identity on the chat network (Telegram chat id, as text).
    ChatId
);
string_id!(
    /// Patient identifier in the record store.
    PatientId
);
string_id!(
    /// Identifier the chat network assigned to a delivered message.
    DeliveryId
);

/// Opaque secret issued by the chat network for one tenant.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self(Arc::from(token.as_ref()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Durable association between a chat identity and a patient, scoped to a tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatLinkage {
    pub tenant_id: TenantId,
    pub chat_id: ChatId,
    pub patient_id: PatientId,
    pub linked_at: DateTime<Utc>,
}

/// One text event surfaced by a tenant connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRequest {
    pub tenant_id: TenantId,
    pub patient_id: PatientId,
    pub body: String,
}
