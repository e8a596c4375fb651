//! Ports onto the persistent record store collaborator.
//!
//! The store owns clinics, patients and chat linkages. This core reads tenant
//! credentials, checks patient ownership and reads/writes linkages; nothing else.

use async_trait::async_trait;

use crate::{
    domain::{ChatId, ChatLinkage, PatientId, TenantId},
    errors::StoreError,
};

pub mod memory;

/// One tenant row as read from the store. The token may be absent or garbage;
/// the registry decides what to do with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialRecord {
    pub tenant_id: TenantId,
    pub token: Option<String>,
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn load_credentials(&self) -> Result<Vec<CredentialRecord>, StoreError>;
}

#[async_trait]
pub trait PatientDirectory: Send + Sync {
    /// Whether `patient` exists and belongs to `tenant`.
    async fn patient_belongs_to(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> Result<bool, StoreError>;
}

/// Chat linkage persistence. Performs no cross-entity validation; ownership is
/// the caller's responsibility.
#[async_trait]
pub trait LinkageStore: Send + Sync {
    /// Write the linkage, replacing any prior row for `(tenant, chat)`.
    async fn upsert_linkage(
        &self,
        tenant: &TenantId,
        chat: &ChatId,
        patient: &PatientId,
    ) -> Result<ChatLinkage, StoreError>;

    /// Chat currently linked to `patient` within `tenant`. If the patient was
    /// linked from several chats, the most recent linkage wins.
    async fn resolve_chat_id(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> Result<Option<ChatId>, StoreError>;
}
