//! Composition root: owns the registry, supervisor, router and dispatcher,
//! and their lifecycle.
//!
//! Initialised by `start` (after the first successful credential refresh) and
//! torn down by `shutdown`, which deactivates every tenant.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config,
    dispatcher::OutboundDispatcher,
    domain::{DeliveryId, OutboundRequest},
    errors::{DispatchError, RegistryError},
    inbound::InboundRouter,
    registry::{CredentialCheck, RefreshDiff, TenantRegistry, TenantSnapshot},
    store::{CredentialSource, LinkageStore, PatientDirectory},
    supervisor::{ConnectionSupervisor, SupervisorOptions, TenantInbox},
    transport::ChatConnector,
};

/// External collaborators the gateway is built from.
pub struct GatewayParts {
    pub credentials: Arc<dyn CredentialSource>,
    pub directory: Arc<dyn PatientDirectory>,
    pub linkages: Arc<dyn LinkageStore>,
    pub connector: Arc<dyn ChatConnector>,
    pub credential_check: CredentialCheck,
}

#[derive(Clone, Debug)]
pub struct GatewayOptions {
    pub supervisor: SupervisorOptions,
    pub refresh_interval: Duration,
    pub send_timeout: Duration,
    pub link_ack_message: String,
}

impl GatewayOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            supervisor: SupervisorOptions {
                backoff: cfg.reconnect,
                inbound_queue_capacity: cfg.inbound_queue_capacity,
            },
            refresh_interval: cfg.credential_refresh_interval,
            send_timeout: cfg.send_timeout,
            link_ack_message: cfg.link_ack_message.clone(),
        }
    }
}

pub struct Gateway {
    registry: Arc<TenantRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    dispatcher: Arc<OutboundDispatcher>,
    router: Arc<InboundRouter>,
    opts: GatewayOptions,
    feed: Mutex<Option<mpsc::UnboundedReceiver<TenantInbox>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconcile: Mutex<()>,
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(parts: GatewayParts, opts: GatewayOptions) -> Arc<Self> {
        let registry = Arc::new(TenantRegistry::new(
            parts.credentials,
            parts.credential_check,
        ));
        let (supervisor, feed) =
            ConnectionSupervisor::new(registry.clone(), parts.connector, opts.supervisor);
        let supervisor = Arc::new(supervisor);
        let dispatcher = Arc::new(OutboundDispatcher::new(
            parts.directory.clone(),
            parts.linkages.clone(),
            supervisor.clone(),
        ));
        let router = Arc::new(InboundRouter::new(
            parts.directory,
            parts.linkages,
            dispatcher.clone(),
            opts.link_ack_message.clone(),
        ));

        Arc::new(Self {
            registry,
            supervisor,
            dispatcher,
            router,
            opts,
            feed: Mutex::new(Some(feed)),
            tasks: Mutex::new(Vec::new()),
            reconcile: Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    /// Load credentials, connect every credentialed tenant, and start the
    /// inbound router and the periodic credential refresh.
    ///
    /// Fails if the first credential refresh fails; nothing is started then.
    pub async fn start(self: &Arc<Self>) -> Result<RefreshDiff, RegistryError> {
        let diff = self.refresh_tenants().await?;

        let mut tasks = self.tasks.lock().await;
        if let Some(feed) = self.feed.lock().await.take() {
            tasks.push(self.router.clone().spawn(feed, self.cancel.child_token()));
        }

        let gateway = self.clone();
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(gateway.opts.refresh_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick is immediate; start() already refreshed
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = gateway.refresh_tenants().await {
                            warn!("credential refresh failed: {e}");
                        }
                    }
                }
            }
        }));

        info!(
            tenants = self.registry.credentialed().len(),
            "gateway started"
        );
        Ok(diff)
    }

    /// Refresh credentials and reconcile connections: removed tenants are
    /// deactivated, rotated ones restarted, added ones activated.
    pub async fn refresh_tenants(&self) -> Result<RefreshDiff, RegistryError> {
        let _serial = self.reconcile.lock().await;
        let diff = self.registry.refresh().await?;

        for tenant in &diff.removed {
            self.supervisor.deactivate(tenant).await;
        }
        for tenant in &diff.rotated {
            info!(%tenant, "credential rotated; reconnecting");
            self.supervisor.deactivate(tenant).await;
            self.supervisor.activate(tenant).await;
        }
        for tenant in &diff.added {
            self.supervisor.activate(tenant).await;
        }
        Ok(diff)
    }

    /// Outbound send bounded by the configured send timeout.
    pub async fn send(&self, request: &OutboundRequest) -> Result<DeliveryId, DispatchError> {
        self.dispatcher
            .send_within(request, self.opts.send_timeout)
            .await
    }

    pub fn tenant_statuses(&self) -> Vec<TenantSnapshot> {
        self.registry.snapshot_all()
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// Stop refreshing, deactivate every tenant and wait for inbound workers
    /// to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.supervisor.shutdown().await;
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("gateway task ended abnormally: {e}");
            }
        }
        info!("gateway stopped");
    }
}
