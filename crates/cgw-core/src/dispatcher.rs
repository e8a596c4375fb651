use std::{sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::{
    domain::{DeliveryId, OutboundRequest, PatientId, TenantId},
    errors::DispatchError,
    store::{LinkageStore, PatientDirectory},
    supervisor::ConnectionSupervisor,
};

/// Routes a (tenant, patient, message) request to the patient's linked chat
/// over that tenant's own connection.
pub struct OutboundDispatcher {
    directory: Arc<dyn PatientDirectory>,
    linkages: Arc<dyn LinkageStore>,
    supervisor: Arc<ConnectionSupervisor>,
}

impl OutboundDispatcher {
    pub fn new(
        directory: Arc<dyn PatientDirectory>,
        linkages: Arc<dyn LinkageStore>,
        supervisor: Arc<ConnectionSupervisor>,
    ) -> Self {
        Self {
            directory,
            linkages,
            supervisor,
        }
    }

    /// Deliver `message` to the patient's chat. Failures are classified, never
    /// retried here.
    pub async fn send(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
        message: &str,
    ) -> Result<DeliveryId, DispatchError> {
        if !self.directory.patient_belongs_to(tenant, patient).await? {
            debug!(%tenant, %patient, "outbound send for a patient outside the tenant");
            return Err(DispatchError::OwnershipMismatch {
                tenant: tenant.clone(),
                patient: patient.clone(),
            });
        }

        let chat = self
            .linkages
            .resolve_chat_id(tenant, patient)
            .await?
            .ok_or_else(|| DispatchError::NotLinked {
                tenant: tenant.clone(),
                patient: patient.clone(),
            })?;

        let delivery = self.supervisor.send(tenant, &chat, message).await?;
        info!(%tenant, %patient, chat_id = %chat, delivery = %delivery, "message delivered");
        Ok(delivery)
    }

    /// `send` bounded by `limit`; expiry surfaces as `DispatchError::Timeout`.
    pub async fn send_within(
        &self,
        request: &OutboundRequest,
        limit: Duration,
    ) -> Result<DeliveryId, DispatchError> {
        tokio::time::timeout(
            limit,
            self.send(&request.tenant_id, &request.patient_id, &request.body),
        )
        .await
        .map_err(|_| DispatchError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::ChatId,
        registry::{basic_credential_check, ConnectionState, TenantRegistry},
        store::memory::MemoryStore,
        supervisor::SupervisorOptions,
        testing::{wait_for_state, ScriptedConnector},
    };

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<TenantRegistry>,
        connector: Arc<ScriptedConnector>,
        supervisor: Arc<ConnectionSupervisor>,
        dispatcher: OutboundDispatcher,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.set_credential("clinicA", Some("tok-a")).await;
        store.add_patient("clinicA", "P1").await;
        let registry = Arc::new(TenantRegistry::new(store.clone(), basic_credential_check));
        registry.refresh().await.unwrap();
        let connector = Arc::new(ScriptedConnector::new());
        let (supervisor, _feed) = ConnectionSupervisor::new(
            registry.clone(),
            connector.clone(),
            SupervisorOptions::default(),
        );
        let supervisor = Arc::new(supervisor);
        let dispatcher = OutboundDispatcher::new(store.clone(), store.clone(), supervisor.clone());
        Fixture {
            store,
            registry,
            connector,
            supervisor,
            dispatcher,
        }
    }

    fn clinic_a() -> TenantId {
        TenantId::from("clinicA")
    }

    #[tokio::test]
    async fn unlinked_patient_never_reaches_the_network() {
        let fx = fixture().await;
        fx.supervisor.activate(&clinic_a()).await;
        wait_for_state(&fx.registry, &clinic_a(), ConnectionState::Active).await;

        let err = fx
            .dispatcher
            .send(&clinic_a(), &"P1".into(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotLinked { .. }));
        assert!(fx.connector.sent().await.is_empty());
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn linked_patient_is_delivered_over_the_tenant_connection() {
        let fx = fixture().await;
        fx.supervisor.activate(&clinic_a()).await;
        wait_for_state(&fx.registry, &clinic_a(), ConnectionState::Active).await;
        fx.store
            .upsert_linkage(&clinic_a(), &"chat77".into(), &"P1".into())
            .await
            .unwrap();

        let id = fx
            .dispatcher
            .send(&clinic_a(), &"P1".into(), "hi")
            .await
            .unwrap();
        assert_eq!(id, DeliveryId::from("clinicA-1"));
        let sent = fx.connector.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, ChatId::from("chat77"));
        assert_eq!(sent[0].body, "hi");
        fx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn mismatched_tenant_is_rejected_before_lookup() {
        let fx = fixture().await;
        fx.store
            .upsert_linkage(&"clinicB".into(), &"chat1".into(), &"P1".into())
            .await
            .unwrap();

        let err = fx
            .dispatcher
            .send(&"clinicB".into(), &"P1".into(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::OwnershipMismatch { .. }));
        assert!(fx.connector.sent().await.is_empty());
    }

    #[tokio::test]
    async fn inactive_tenant_and_transport_failures_are_classified() {
        let fx = fixture().await;
        fx.store
            .upsert_linkage(&clinic_a(), &"chat77".into(), &"P1".into())
            .await
            .unwrap();

        let err = fx
            .dispatcher
            .send(&clinic_a(), &"P1".into(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoActiveConnection(_)));

        fx.supervisor.activate(&clinic_a()).await;
        wait_for_state(&fx.registry, &clinic_a(), ConnectionState::Active).await;
        fx.connector.fail_sends(&clinic_a(), true).await;
        let err = fx
            .dispatcher
            .send(&clinic_a(), &"P1".into(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
        fx.supervisor.shutdown().await;
    }

    struct StalledDirectory;

    #[async_trait::async_trait]
    impl PatientDirectory for StalledDirectory {
        async fn patient_belongs_to(
            &self,
            _tenant: &TenantId,
            _patient: &PatientId,
        ) -> Result<bool, crate::errors::StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn send_within_reports_timeout() {
        let fx = fixture().await;
        let dispatcher = OutboundDispatcher::new(
            Arc::new(StalledDirectory),
            fx.store.clone(),
            fx.supervisor.clone(),
        );
        let req = OutboundRequest {
            tenant_id: clinic_a(),
            patient_id: "P1".into(),
            body: "hi".to_string(),
        };
        let err = dispatcher
            .send_within(&req, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout));
    }
}
