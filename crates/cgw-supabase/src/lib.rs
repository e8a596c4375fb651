//! Supabase (PostgREST) record store adapter.
//!
//! Reads clinic bot tokens, checks patient ownership and reads/writes chat
//! linkages through the REST API using the service role key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use cgw_core::{
    config::StoreConfig,
    domain::{ChatId, ChatLinkage, PatientId, TenantId},
    errors::{Error, StoreError},
    store::{CredentialRecord, CredentialSource, LinkageStore, PatientDirectory},
    Result,
};

const LINK_CONFLICT_TARGET: &str = "clinic_id,chat_id";

#[derive(Clone, Debug)]
pub struct PostgrestStore {
    cfg: StoreConfig,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct LinkRow<'a> {
    clinic_id: &'a str,
    chat_id: &'a str,
    patient_id: &'a str,
    linked_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ChatRow {
    chat_id: Value,
}

impl PostgrestStore {
    pub fn new(cfg: StoreConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::External(format!("store http client: {e}")))?;
        Ok(Self { cfg, http })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.cfg.url)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.http
            .request(method, self.table_url(table))
            .header("apikey", &self.cfg.service_key)
            .bearer_auth(&self.cfg.service_key)
    }

    fn credentials_query(&self) -> Vec<(&'static str, String)> {
        vec![("select", format!("id,{}", self.cfg.clinic_token_column))]
    }

    fn ownership_query(&self, tenant: &TenantId, patient: &PatientId) -> Vec<(String, String)> {
        vec![
            ("select".to_string(), "id".to_string()),
            ("id".to_string(), format!("eq.{patient}")),
            (
                self.cfg.patient_clinic_column.clone(),
                format!("eq.{tenant}"),
            ),
            ("limit".to_string(), "1".to_string()),
        ]
    }

    fn resolve_query(tenant: &TenantId, patient: &PatientId) -> Vec<(&'static str, String)> {
        vec![
            ("select", "chat_id".to_string()),
            ("clinic_id", format!("eq.{tenant}")),
            ("patient_id", format!("eq.{patient}")),
            ("order", "linked_at.desc".to_string()),
            ("limit", "1".to_string()),
        ]
    }

    async fn fetch_rows(&self, req: RequestBuilder) -> std::result::Result<Vec<Value>, StoreError> {
        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::Backend(format!("store request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "store request failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        resp.json::<Vec<Value>>()
            .await
            .map_err(|e| StoreError::Decode(format!("store json error: {e}")))
    }
}

/// PostgREST returns ids as numbers or strings depending on the column type.
fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decode_credentials(
    rows: Vec<Value>,
    token_column: &str,
) -> std::result::Result<Vec<CredentialRecord>, StoreError> {
    rows.into_iter()
        .map(|row| {
            let tenant_id = row
                .get("id")
                .and_then(id_string)
                .ok_or_else(|| StoreError::Decode("clinic row without an id".to_string()))?;
            let token = row
                .get(token_column)
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(CredentialRecord {
                tenant_id: TenantId(tenant_id),
                token,
            })
        })
        .collect()
}

fn decode_chat(rows: Vec<Value>) -> std::result::Result<Option<ChatId>, StoreError> {
    let Some(row) = rows.into_iter().next() else {
        return Ok(None);
    };
    let row: ChatRow =
        serde_json::from_value(row).map_err(|e| StoreError::Decode(format!("link row: {e}")))?;
    id_string(&row.chat_id)
        .map(ChatId)
        .map(Some)
        .ok_or_else(|| StoreError::Decode("link row without a chat id".to_string()))
}

#[async_trait]
impl CredentialSource for PostgrestStore {
    async fn load_credentials(&self) -> std::result::Result<Vec<CredentialRecord>, StoreError> {
        let req = self
            .request(Method::GET, &self.cfg.clinics_table)
            .query(&self.credentials_query());
        let rows = self.fetch_rows(req).await?;
        debug!(rows = rows.len(), "loaded clinic credentials");
        decode_credentials(rows, &self.cfg.clinic_token_column)
    }
}

#[async_trait]
impl PatientDirectory for PostgrestStore {
    async fn patient_belongs_to(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> std::result::Result<bool, StoreError> {
        let req = self
            .request(Method::GET, &self.cfg.patients_table)
            .query(&self.ownership_query(tenant, patient));
        Ok(!self.fetch_rows(req).await?.is_empty())
    }
}

#[async_trait]
impl LinkageStore for PostgrestStore {
    async fn upsert_linkage(
        &self,
        tenant: &TenantId,
        chat: &ChatId,
        patient: &PatientId,
    ) -> std::result::Result<ChatLinkage, StoreError> {
        let linked_at = Utc::now();
        let row = LinkRow {
            clinic_id: tenant.as_str(),
            chat_id: chat.as_str(),
            patient_id: patient.as_str(),
            linked_at,
        };
        let req = self
            .request(Method::POST, &self.cfg.links_table)
            .query(&[("on_conflict", LINK_CONFLICT_TARGET)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row]);

        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::Backend(format!("store request error: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "linkage upsert failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        Ok(ChatLinkage {
            tenant_id: tenant.clone(),
            chat_id: chat.clone(),
            patient_id: patient.clone(),
            linked_at,
        })
    }

    async fn resolve_chat_id(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> std::result::Result<Option<ChatId>, StoreError> {
        let req = self
            .request(Method::GET, &self.cfg.links_table)
            .query(&Self::resolve_query(tenant, patient));
        decode_chat(self.fetch_rows(req).await?)
    }
}
