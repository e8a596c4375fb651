//! Inbound command handling.
//!
//! The only command is the link directive `start <patientId>`, which is also
//! what a Telegram deep link (`t.me/<bot>?start=<patientId>`) produces as
//! `/start <patientId>`.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    dispatcher::OutboundDispatcher,
    domain::{ChatId, PatientId, TenantId},
    errors::StoreError,
    store::{LinkageStore, PatientDirectory},
    supervisor::TenantInbox,
};

const LINK_DIRECTIVE: &str = "start";
const MAX_PATIENT_ID_LEN: usize = 128;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Linkage written; acknowledgement requested.
    Linked { patient_id: PatientId },
    /// Link command for a patient outside the tenant. Nothing written, nothing sent.
    Discarded,
    /// Not a command we recognize.
    Ignored,
}

/// Parse `start <patientId>`, `/start <patientId>` or `/start@bot <patientId>`.
pub fn parse_link_command(text: &str) -> Option<PatientId> {
    let mut tokens = text.split_whitespace();
    let directive = tokens.next()?;
    let patient = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }

    let directive = directive.strip_prefix('/').unwrap_or(directive);
    let directive = match directive.split_once('@') {
        Some((name, bot)) if !bot.is_empty() => name,
        Some(_) => return None,
        None => directive,
    };
    if !directive.eq_ignore_ascii_case(LINK_DIRECTIVE) {
        return None;
    }
    if patient.chars().count() > MAX_PATIENT_ID_LEN {
        return None;
    }
    Some(PatientId::from(patient))
}

pub struct InboundRouter {
    directory: Arc<dyn PatientDirectory>,
    linkages: Arc<dyn LinkageStore>,
    dispatcher: Arc<OutboundDispatcher>,
    ack_message: String,
}

impl InboundRouter {
    pub fn new(
        directory: Arc<dyn PatientDirectory>,
        linkages: Arc<dyn LinkageStore>,
        dispatcher: Arc<OutboundDispatcher>,
        ack_message: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            linkages,
            dispatcher,
            ack_message: ack_message.into(),
        }
    }

    /// Handle one inbound event for `tenant`.
    ///
    /// The acknowledgement is sent on a detached task: this returns once the
    /// linkage is written, and a failed acknowledgement leaves it in place.
    pub async fn handle(
        &self,
        tenant: &TenantId,
        chat: &ChatId,
        raw_text: &str,
    ) -> Result<RouteOutcome, StoreError> {
        let Some(patient) = parse_link_command(raw_text) else {
            debug!(%tenant, chat_id = %chat, "ignoring unrecognized inbound text");
            return Ok(RouteOutcome::Ignored);
        };

        if !self.directory.patient_belongs_to(tenant, &patient).await? {
            debug!(%tenant, chat_id = %chat, "link command for a foreign patient discarded");
            return Ok(RouteOutcome::Discarded);
        }

        self.linkages.upsert_linkage(tenant, chat, &patient).await?;
        info!(%tenant, chat_id = %chat, %patient, "chat linked to patient");

        let dispatcher = self.dispatcher.clone();
        let ack = self.ack_message.clone();
        let (tenant_id, patient_id) = (tenant.clone(), patient.clone());
        tokio::spawn(async move {
            if let Err(e) = dispatcher.send(&tenant_id, &patient_id, &ack).await {
                warn!(tenant = %tenant_id, patient = %patient_id, "link acknowledgement failed: {e}");
            }
        });

        Ok(RouteOutcome::Linked {
            patient_id: patient,
        })
    }

    /// Consume the supervisor's inbox feed: one worker per tenant queue.
    pub fn spawn(
        self: Arc<Self>,
        feed: mpsc::UnboundedReceiver<TenantInbox>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run_feed(feed, cancel))
    }

    async fn run_feed(
        self: Arc<Self>,
        mut feed: mpsc::UnboundedReceiver<TenantInbox>,
        cancel: CancellationToken,
    ) {
        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                inbox = feed.recv() => match inbox {
                    Some(inbox) => {
                        workers.spawn(self.clone().run_queue(inbox));
                    }
                    None => break,
                },
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }

        // Queues close once their connections are gone; give buffered
        // messages a moment to drain.
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("inbound workers still busy at shutdown; aborting");
            workers.abort_all();
        }
    }

    async fn run_queue(self: Arc<Self>, mut inbox: TenantInbox) {
        let tenant = inbox.tenant_id.clone();
        debug!(%tenant, "inbound worker started");
        while let Some(message) = inbox.events.recv().await {
            if let Err(e) = self.handle(&tenant, &message.chat_id, &message.text).await {
                warn!(%tenant, chat_id = %message.chat_id, "inbound message failed: {e}");
            }
        }
        debug!(%tenant, "inbound worker stopped");
    }
}
