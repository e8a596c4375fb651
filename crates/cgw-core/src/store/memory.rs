//! In-process record store. Backs tests and local dry runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    domain::{ChatId, ChatLinkage, PatientId, TenantId},
    errors::StoreError,
    store::{CredentialRecord, CredentialSource, LinkageStore, PatientDirectory},
};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    credentials: Vec<CredentialRecord>,
    patients: HashSet<(TenantId, PatientId)>,
    // seq breaks ties between linkages written within the same clock tick
    linkages: HashMap<(TenantId, ChatId), (u64, ChatLinkage)>,
    seq: u64,
    fail_credentials: Option<String>,
    fail_directory: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (or insert) the credential row for `tenant`.
    pub async fn set_credential(&self, tenant: impl Into<TenantId>, token: Option<&str>) {
        let tenant = tenant.into();
        let mut st = self.inner.lock().await;
        st.credentials.retain(|r| r.tenant_id != tenant);
        st.credentials.push(CredentialRecord {
            tenant_id: tenant,
            token: token.map(str::to_string),
        });
    }

    pub async fn remove_credential(&self, tenant: &TenantId) {
        self.inner
            .lock()
            .await
            .credentials
            .retain(|r| &r.tenant_id != tenant);
    }

    pub async fn add_patient(&self, tenant: impl Into<TenantId>, patient: impl Into<PatientId>) {
        self.inner
            .lock()
            .await
            .patients
            .insert((tenant.into(), patient.into()));
    }

    /// Make the next credential loads fail with `reason` (`None` heals).
    pub async fn fail_credential_loads(&self, reason: Option<&str>) {
        self.inner.lock().await.fail_credentials = reason.map(str::to_string);
    }

    /// Make ownership lookups fail with `reason` (`None` heals).
    pub async fn fail_directory_lookups(&self, reason: Option<&str>) {
        self.inner.lock().await.fail_directory = reason.map(str::to_string);
    }

    pub async fn linkage_count(&self) -> usize {
        self.inner.lock().await.linkages.len()
    }
}

#[async_trait]
impl CredentialSource for MemoryStore {
    async fn load_credentials(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let st = self.inner.lock().await;
        if let Some(reason) = &st.fail_credentials {
            return Err(StoreError::Backend(reason.clone()));
        }
        Ok(st.credentials.clone())
    }
}

#[async_trait]
impl PatientDirectory for MemoryStore {
    async fn patient_belongs_to(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> Result<bool, StoreError> {
        let st = self.inner.lock().await;
        if let Some(reason) = &st.fail_directory {
            return Err(StoreError::Backend(reason.clone()));
        }
        Ok(st.patients.contains(&(tenant.clone(), patient.clone())))
    }
}

#[async_trait]
impl LinkageStore for MemoryStore {
    async fn upsert_linkage(
        &self,
        tenant: &TenantId,
        chat: &ChatId,
        patient: &PatientId,
    ) -> Result<ChatLinkage, StoreError> {
        let linkage = ChatLinkage {
            tenant_id: tenant.clone(),
            chat_id: chat.clone(),
            patient_id: patient.clone(),
            linked_at: Utc::now(),
        };
        let mut st = self.inner.lock().await;
        st.seq += 1;
        let seq = st.seq;
        st.linkages
            .insert((tenant.clone(), chat.clone()), (seq, linkage.clone()));
        Ok(linkage)
    }

    async fn resolve_chat_id(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> Result<Option<ChatId>, StoreError> {
        let st = self.inner.lock().await;
        Ok(st
            .linkages
            .values()
            .filter(|(_, l)| &l.tenant_id == tenant && &l.patient_id == patient)
            .max_by_key(|(seq, _)| *seq)
            .map(|(_, l)| l.chat_id.clone()))
    }
}
