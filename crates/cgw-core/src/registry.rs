//! Tenant credentials and per-tenant connection state.
//!
//! The credential set is an immutable map swapped atomically on refresh, so
//! readers on the send path never wait on a refresh in flight. Each tenant's
//! status lives in a `watch` channel that survives refreshes; only the
//! supervisor writes to it.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    domain::{Credential, TenantId},
    errors::RegistryError,
    store::CredentialSource,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unconfigured,
    Connecting,
    Active,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl TenantStatus {
    fn unconfigured() -> Self {
        Self {
            state: ConnectionState::Unconfigured,
            last_error: None,
            changed_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TenantSnapshot {
    pub id: TenantId,
    pub credential: Option<Credential>,
    pub status: TenantStatus,
}

/// What changed between two refreshes. Vectors are sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshDiff {
    pub added: Vec<TenantId>,
    pub removed: Vec<TenantId>,
    /// Credential present before and after, but different.
    pub rotated: Vec<TenantId>,
}

impl RefreshDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.rotated.is_empty()
    }
}

/// Transport-specific credential shape check; `Err` carries the reason.
pub type CredentialCheck = fn(&str) -> Result<(), String>;

/// Rejects empty tokens and tokens with whitespace or control characters.
pub fn basic_credential_check(token: &str) -> Result<(), String> {
    if token.is_empty() {
        return Err("empty token".to_string());
    }
    if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("token contains whitespace or control characters".to_string());
    }
    Ok(())
}

#[derive(Clone)]
struct TenantSlot {
    credential: Option<Credential>,
    /// Why the stored credential was refused; such a tenant is held `Failed`.
    rejection: Option<String>,
    status: Arc<watch::Sender<TenantStatus>>,
}

pub struct TenantRegistry {
    source: Arc<dyn CredentialSource>,
    check: CredentialCheck,
    tenants: ArcSwap<HashMap<TenantId, TenantSlot>>,
    refresh_lock: Mutex<()>,
}

impl TenantRegistry {
    pub fn new(source: Arc<dyn CredentialSource>, check: CredentialCheck) -> Self {
        Self {
            source,
            check,
            tenants: ArcSwap::from_pointee(HashMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Re-read credentials from the store and publish a new snapshot.
    ///
    /// A store failure leaves the previous snapshot in place. Empty tokens
    /// count as no credential. A tenant whose credential fails the shape
    /// check is kept without a credential and marked `Failed` with the reason.
    pub async fn refresh(&self) -> Result<RefreshDiff, RegistryError> {
        let _serial = self.refresh_lock.lock().await;
        let records = self.source.load_credentials().await?;

        let mut desired: HashMap<TenantId, Credential> = HashMap::with_capacity(records.len());
        let mut rejected: HashMap<TenantId, String> = HashMap::new();
        for record in records {
            let tenant = record.tenant_id;
            if desired.contains_key(&tenant) || rejected.contains_key(&tenant) {
                warn!(%tenant, "duplicate tenant row; keeping the first credential");
                continue;
            }
            let token = record.token.as_deref().map(str::trim).unwrap_or_default();
            if token.is_empty() {
                debug!(%tenant, "tenant has no credential");
                continue;
            }
            if let Err(reason) = basic_credential_check(token).and_then(|_| (self.check)(token)) {
                warn!(%tenant, %reason, "malformed tenant credential");
                rejected.insert(tenant, format!("malformed credential: {reason}"));
                continue;
            }
            desired.insert(tenant, Credential::new(token));
        }

        let current = self.tenants.load_full();
        let mut next = HashMap::with_capacity(current.len().max(desired.len()));
        let mut diff = RefreshDiff::default();
        let mut cleared = Vec::new();

        for (id, slot) in current.iter() {
            let credential = desired.remove(id);
            let rejection = rejected.remove(id);
            match (&slot.credential, &credential) {
                (None, Some(_)) => diff.added.push(id.clone()),
                (Some(_), None) => diff.removed.push(id.clone()),
                (Some(old), Some(new)) if old != new => diff.rotated.push(id.clone()),
                _ => {}
            }
            if slot.rejection.is_some() && rejection.is_none() && credential.is_none() {
                cleared.push(id.clone());
            }
            next.insert(
                id.clone(),
                TenantSlot {
                    credential,
                    rejection,
                    status: slot.status.clone(),
                },
            );
        }
        for (id, credential) in desired {
            diff.added.push(id.clone());
            next.insert(id, TenantSlot::new(Some(credential), None));
        }
        for (id, reason) in rejected {
            next.insert(id, TenantSlot::new(None, Some(reason)));
        }

        diff.added.sort();
        diff.removed.sort();
        diff.rotated.sort();

        self.tenants.store(Arc::new(next));
        for (id, slot) in self.tenants.load().iter() {
            if let Some(reason) = &slot.rejection {
                self.transition(id, ConnectionState::Failed, Some(reason.clone()));
            }
        }
        for id in &cleared {
            self.transition(id, ConnectionState::Unconfigured, None);
        }
        if !diff.is_empty() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                rotated = diff.rotated.len(),
                "tenant credentials refreshed"
            );
        }
        Ok(diff)
    }

    pub fn get(&self, tenant: &TenantId) -> Result<TenantSnapshot, RegistryError> {
        let tenants = self.tenants.load();
        let slot = tenants
            .get(tenant)
            .ok_or_else(|| RegistryError::NotFound(tenant.clone()))?;
        let status = slot.status.borrow().clone();
        Ok(TenantSnapshot {
            id: tenant.clone(),
            credential: slot.credential.clone(),
            status,
        })
    }

    pub fn credential(&self, tenant: &TenantId) -> Option<Credential> {
        self.tenants.load().get(tenant)?.credential.clone()
    }

    pub fn state(&self, tenant: &TenantId) -> Option<ConnectionState> {
        Some(self.tenants.load().get(tenant)?.status.borrow().state)
    }

    /// Tenants that currently hold a usable credential, sorted.
    pub fn credentialed(&self) -> Vec<TenantId> {
        let mut ids: Vec<_> = self
            .tenants
            .load()
            .iter()
            .filter(|(_, slot)| slot.credential.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every tenant ever seen (including ones whose credential was removed), sorted.
    pub fn snapshot_all(&self) -> Vec<TenantSnapshot> {
        let tenants = self.tenants.load();
        let mut out: Vec<_> = tenants
            .iter()
            .map(|(id, slot)| TenantSnapshot {
                id: id.clone(),
                credential: slot.credential.clone(),
                status: slot.status.borrow().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn subscribe(&self, tenant: &TenantId) -> Option<watch::Receiver<TenantStatus>> {
        Some(self.tenants.load().get(tenant)?.status.subscribe())
    }

    /// Record a state change. Unknown tenants are ignored.
    pub(crate) fn transition(
        &self,
        tenant: &TenantId,
        state: ConnectionState,
        last_error: Option<String>,
    ) {
        let tenants = self.tenants.load();
        let Some(slot) = tenants.get(tenant) else {
            debug!(%tenant, ?state, "state change for unknown tenant ignored");
            return;
        };
        slot.status.send_if_modified(|status| {
            if status.state == state && status.last_error == last_error {
                return false;
            }
            debug!(%tenant, from = ?status.state, to = ?state, "tenant state change");
            *status = TenantStatus {
                state,
                last_error: last_error.clone(),
                changed_at: Utc::now(),
            };
            true
        });
    }

    /// Resting state for a tenant that has no running connection: `Failed`
    /// if its stored credential was refused, `Unconfigured` otherwise.
    pub(crate) fn settle(&self, tenant: &TenantId) {
        let rejection = self
            .tenants
            .load()
            .get(tenant)
            .and_then(|slot| slot.rejection.clone());
        match rejection {
            Some(reason) => self.transition(tenant, ConnectionState::Failed, Some(reason)),
            None => self.transition(tenant, ConnectionState::Unconfigured, None),
        }
    }
}

impl TenantSlot {
    fn new(credential: Option<Credential>, rejection: Option<String>) -> Self {
        let (status, _) = watch::channel(TenantStatus::unconfigured());
        Self {
            credential,
            rejection,
            status: Arc::new(status),
        }
    }
}
