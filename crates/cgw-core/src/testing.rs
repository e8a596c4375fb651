//! Scripted in-memory chat network for tests.
//!
//! Each `connect` consumes the next planned outcome for the tenant (accepting
//! when nothing is planned). Accepted sessions can be fed inbound messages or
//! dropped from the test; every outbound send is recorded.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, Mutex, Notify},
    time::Instant,
};

use crate::{
    domain::{ChatId, Credential, DeliveryId, InboundMessage, TenantId},
    errors::{ConnectError, TransportError},
    messaging::port::MessagingPort,
    registry::{ConnectionState, TenantRegistry},
    transport::{ChatConnector, ChatSession},
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectPlan {
    Accept,
    /// Credential rejected (terminal).
    Reject(String),
    /// Transient failure (retried).
    Fail(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub tenant_id: TenantId,
    pub chat_id: ChatId,
    pub body: String,
}

#[derive(Default)]
struct SentLog {
    messages: Mutex<Vec<SentMessage>>,
    seq: AtomicU64,
    notify: Notify,
}

type SessionFeed = mpsc::UnboundedSender<Result<InboundMessage, ConnectError>>;

#[derive(Default)]
pub struct ScriptedConnector {
    plans: Mutex<HashMap<TenantId, VecDeque<ConnectPlan>>>,
    attempts: Mutex<HashMap<TenantId, Vec<Instant>>>,
    feeds: Mutex<HashMap<TenantId, SessionFeed>>,
    failing_sends: Mutex<HashMap<TenantId, Arc<AtomicBool>>>,
    credentials: Mutex<HashMap<TenantId, Credential>>,
    sent: Arc<SentLog>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the tenant's next connect attempts.
    pub async fn plan(&self, tenant: &TenantId, plans: impl IntoIterator<Item = ConnectPlan>) {
        self.plans
            .lock()
            .await
            .entry(tenant.clone())
            .or_default()
            .extend(plans);
    }

    /// Deliver an inbound message on the tenant's current session.
    pub async fn inject(&self, tenant: &TenantId, chat: &str, text: &str) -> bool {
        let feeds = self.feeds.lock().await;
        let Some(feed) = feeds.get(tenant) else {
            return false;
        };
        feed.send(Ok(InboundMessage {
            chat_id: ChatId::from(chat),
            text: text.to_string(),
        }))
        .is_ok()
    }

    /// End the tenant's current session with `error`.
    pub async fn drop_connection(&self, tenant: &TenantId, error: ConnectError) {
        if let Some(feed) = self.feeds.lock().await.remove(tenant) {
            let _ = feed.send(Err(error));
        }
    }

    /// Make sends on the tenant's sessions fail with a transport error.
    pub async fn fail_sends(&self, tenant: &TenantId, failing: bool) {
        self.send_switch(tenant)
            .await
            .store(failing, Ordering::SeqCst);
    }

    pub async fn connect_count(&self, tenant: &TenantId) -> usize {
        self.attempts
            .lock()
            .await
            .get(tenant)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Time between consecutive connect attempts for the tenant.
    pub async fn connect_gaps(&self, tenant: &TenantId) -> Vec<Duration> {
        let attempts = self.attempts.lock().await;
        let Some(times) = attempts.get(tenant) else {
            return Vec::new();
        };
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Credential presented on the tenant's latest connect attempt.
    pub async fn last_credential(&self, tenant: &TenantId) -> Option<Credential> {
        self.credentials.lock().await.get(tenant).cloned()
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.messages.lock().await.clone()
    }

    /// Wait until at least `n` sends were recorded; returns them all.
    pub async fn wait_for_sent(&self, n: usize) -> Vec<SentMessage> {
        let wait = async {
            loop {
                let notified = self.sent.notify.notified();
                {
                    let sent = self.sent.messages.lock().await;
                    if sent.len() >= n {
                        return sent.clone();
                    }
                }
                notified.await;
            }
        };
        match tokio::time::timeout(WAIT_LIMIT, wait).await {
            Ok(sent) => sent,
            Err(_) => panic!("timed out waiting for {n} sends; got {:?}", self.sent().await),
        }
    }

    async fn send_switch(&self, tenant: &TenantId) -> Arc<AtomicBool> {
        self.failing_sends
            .lock()
            .await
            .entry(tenant.clone())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl ChatConnector for ScriptedConnector {
    async fn connect(
        &self,
        tenant: &TenantId,
        credential: &Credential,
    ) -> Result<Box<dyn ChatSession>, ConnectError> {
        self.attempts
            .lock()
            .await
            .entry(tenant.clone())
            .or_default()
            .push(Instant::now());
        self.credentials
            .lock()
            .await
            .insert(tenant.clone(), credential.clone());

        let plan = self
            .plans
            .lock()
            .await
            .get_mut(tenant)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ConnectPlan::Accept);

        match plan {
            ConnectPlan::Reject(reason) => Err(ConnectError::Unauthorized(reason)),
            ConnectPlan::Fail(reason) => Err(ConnectError::Transient(reason)),
            ConnectPlan::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.feeds.lock().await.insert(tenant.clone(), tx);
                let messenger = Arc::new(RecordingMessenger {
                    tenant: tenant.clone(),
                    log: self.sent.clone(),
                    failing: self.send_switch(tenant).await,
                });
                Ok(Box::new(ScriptedSession { rx, messenger }))
            }
        }
    }
}

struct ScriptedSession {
    rx: mpsc::UnboundedReceiver<Result<InboundMessage, ConnectError>>,
    messenger: Arc<RecordingMessenger>,
}

#[async_trait]
impl ChatSession for ScriptedSession {
    fn messenger(&self) -> Arc<dyn MessagingPort> {
        self.messenger.clone()
    }

    async fn next_message(&mut self) -> Option<Result<InboundMessage, ConnectError>> {
        self.rx.recv().await
    }
}

struct RecordingMessenger {
    tenant: TenantId,
    log: Arc<SentLog>,
    failing: Arc<AtomicBool>,
}

#[async_trait]
impl MessagingPort for RecordingMessenger {
    async fn send_text(&self, chat_id: &ChatId, body: &str) -> Result<DeliveryId, TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError("scripted send failure".to_string()));
        }
        self.log.messages.lock().await.push(SentMessage {
            tenant_id: self.tenant.clone(),
            chat_id: chat_id.clone(),
            body: body.to_string(),
        });
        let n = self.log.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.notify.notify_waiters();
        Ok(DeliveryId(format!("{}-{n}", self.tenant)))
    }
}

/// Wait (bounded) until the tenant reaches `state`.
pub async fn wait_for_state(registry: &TenantRegistry, tenant: &TenantId, state: ConnectionState) {
    let Some(mut rx) = registry.subscribe(tenant) else {
        panic!("tenant {tenant} is not registered");
    };
    let reached = tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|s| s.state == state)).await;
    match reached {
        Ok(Ok(_)) => {}
        _ => panic!(
            "tenant {tenant} did not reach {state:?}; current {:?}",
            registry.state(tenant)
        ),
    }
}
