//! Engine event handling for one live session.
//!
//! Status-bearing events run under the instance lock and are dropped when
//! they belong to a session that has since been replaced or stopped.
//! Credential rotations are saved whatever the session state, including
//! rotations still queued when the session ends, unless the device was
//! unlinked.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchboard_core::address;
use switchboard_core::engine::{CredentialBlob, EngineEvent, ProtocolMessage};
use switchboard_core::errors::CloseReason;
use switchboard_core::events::RelayEvent;
use switchboard_core::ids::InstanceId;
use switchboard_core::status::InstanceStatus;
use switchboard_store::instances::InstanceUpdate;

use crate::error::OrchestratorError;
use crate::ingest::IngestOutcome;
use crate::orchestrator::{status_event, Inner};
use crate::scheduler::RetryTask;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
    /// The session ended with its credentials revoked.
    Unlinked,
}

impl Inner {
    pub(crate) async fn transition(
        self: &Arc<Self>,
        instance_id: &InstanceId,
        epoch: u64,
        cancel: &CancellationToken,
        event: EngineEvent,
    ) -> Flow {
        // Ingestion only touches contacts and messages; the event loop
        // already orders it per instance.
        let event = match event {
            EngineEvent::Message(msg) => {
                if !self.is_current(instance_id, epoch) {
                    return Flow::Exit;
                }
                self.on_message(instance_id, &msg);
                return Flow::Continue;
            }
            EngineEvent::CredentialsUpdated(blob) => return self.on_credentials(instance_id, &blob).await,
            other => other,
        };

        let lock = self.lock_for(instance_id);
        // stop, logout and shutdown wait for this loop while holding the lock
        let _guard = tokio::select! {
            guard = lock.lock() => guard,
            _ = cancel.cancelled() => return Flow::Exit,
        };
        if !self.is_current(instance_id, epoch) {
            debug!(instance_id = %instance_id, epoch, kind = event.kind(), "dropping event from superseded session");
            return Flow::Exit;
        }

        match event {
            EngineEvent::Pairing { code } => self.on_pairing(instance_id, code).await,
            EngineEvent::Open { linked_address } => self.on_open(instance_id, &linked_address).await,
            EngineEvent::Close { reason } => self.on_close(instance_id, reason).await,
            EngineEvent::Message(_) | EngineEvent::CredentialsUpdated(_) => Flow::Continue,
        }
    }

    /// The engine dropped its event stream without a close event.
    pub(crate) async fn stream_ended(
        self: &Arc<Self>,
        instance_id: &InstanceId,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Flow {
        debug!(instance_id = %instance_id, epoch, "engine event stream ended");
        let event = EngineEvent::Close {
            reason: CloseReason::ConnectionLost,
        };
        match self.transition(instance_id, epoch, cancel, event).await {
            Flow::Unlinked => Flow::Unlinked,
            _ => Flow::Exit,
        }
    }

    /// Save the newest credential rotation still queued when a session
    /// ends. Everything else left in the queue is discarded.
    pub(crate) async fn flush_credentials(&self, instance_id: &InstanceId, events: &mut mpsc::Receiver<EngineEvent>) {
        events.close();
        let mut latest = None;
        let mut discarded = 0usize;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::CredentialsUpdated(blob) => latest = Some(blob),
                _ => discarded += 1,
            }
        }
        if discarded > 0 {
            debug!(instance_id = %instance_id, discarded, "events queued after session end dropped");
        }
        if let Some(blob) = latest {
            self.on_credentials(instance_id, &blob).await;
        }
    }

    async fn on_pairing(&self, instance_id: &InstanceId, code: String) -> Flow {
        if self.sessions.get(instance_id).is_some_and(|s| s.connected) {
            warn!(instance_id = %instance_id, "pairing code on a linked session ignored");
            return Flow::Continue;
        }

        let cycle = {
            let mut cycles = self.pairing_cycles.entry(instance_id.clone()).or_insert(0);
            *cycles += 1;
            *cycles
        };

        let cap = self.config.pairing_cycle_cap;
        if cycle > cap {
            let err = OrchestratorError::PairingTimeout {
                instance_id: instance_id.clone(),
                cycles: cap,
            };
            warn!(instance_id = %instance_id, error = %err, "abandoning unpaired session");

            self.forget_reconnect_state(instance_id);
            if let Some((_, session)) = self.sessions.remove(instance_id) {
                session.cancel.cancel();
                session.handle.close().await;
            }
            self.commit(
                instance_id,
                &InstanceUpdate::status(InstanceStatus::Disconnected),
                status_event(instance_id, InstanceStatus::Disconnected, None, Some("pairing_timeout")),
            )
            .await;
            return Flow::Exit;
        }

        debug!(instance_id = %instance_id, cycle, "pairing code issued");
        self.commit(
            instance_id,
            &InstanceUpdate::status(InstanceStatus::QrPending).with_pairing_code(Some(code.clone())),
            RelayEvent::Pairing {
                instance_id: instance_id.clone(),
                code,
                cycle,
            },
        )
        .await;
        Flow::Continue
    }

    async fn on_open(&self, instance_id: &InstanceId, linked_address: &str) -> Flow {
        let phone = address::normalize(linked_address);
        let update = InstanceUpdate::status(InstanceStatus::Connected)
            .with_linked_phone_number(Some(phone.clone()))
            .with_last_connected_at(Utc::now());

        if self.persist(instance_id, &update).await.is_err() {
            error!(instance_id = %instance_id, "open transition not recorded");
            return Flow::Continue;
        }

        self.reconnect_attempts.remove(instance_id);
        self.pairing_cycles.remove(instance_id);
        if let Some(mut session) = self.sessions.get_mut(instance_id) {
            session.connected = true;
        }
        self.publish(status_event(instance_id, InstanceStatus::Connected, Some(phone), None));
        info!(instance_id = %instance_id, "session connected");
        Flow::Continue
    }

    async fn on_close(self: &Arc<Self>, instance_id: &InstanceId, reason: CloseReason) -> Flow {
        self.sessions.remove(instance_id);

        if !reason.is_terminal() {
            self.schedule_reconnect(instance_id, reason.as_str()).await;
            return Flow::Exit;
        }

        warn!(instance_id = %instance_id, reason = reason.as_str(), "terminal close, discarding credentials");
        self.forget_reconnect_state(instance_id);
        if let Err(e) = self
            .with_retry(instance_id, || self.instances.clear_credentials(instance_id))
            .await
        {
            error!(instance_id = %instance_id, error = %e, "stale credentials left in place");
        }
        self.commit(
            instance_id,
            &InstanceUpdate::status(InstanceStatus::Disconnected).with_linked_phone_number(None),
            status_event(instance_id, InstanceStatus::Disconnected, None, Some(reason.as_str())),
        )
        .await;
        Flow::Unlinked
    }

    async fn on_credentials(&self, instance_id: &InstanceId, blob: &CredentialBlob) -> Flow {
        match self
            .with_retry(instance_id, || self.instances.save_credentials(instance_id, blob))
            .await
        {
            Ok(()) => debug!(instance_id = %instance_id, "credentials rotated"),
            Err(e) => error!(instance_id = %instance_id, error = %e, "credential rotation lost"),
        }
        Flow::Continue
    }

    fn on_message(&self, instance_id: &InstanceId, msg: &ProtocolMessage) {
        match self.ingest.ingest(instance_id, msg) {
            Ok(IngestOutcome::Stored {
                contact_id,
                message_id,
            }) => self.publish(RelayEvent::MessageReceived {
                instance_id: instance_id.clone(),
                contact_id,
                message_id,
            }),
            Ok(IngestOutcome::Duplicate) => {
                debug!(instance_id = %instance_id, external_message_id = %msg.external_message_id, "duplicate delivery")
            }
            Ok(IngestOutcome::Skipped(reason)) => {
                debug!(instance_id = %instance_id, ?reason, "message not ingested")
            }
            Err(e) => error!(
                instance_id = %instance_id,
                external_message_id = %msg.external_message_id,
                error = %e,
                "dropping inbound message"
            ),
        }
    }

    /// Persist, then publish. Nothing is published when the write fails.
    async fn commit(&self, instance_id: &InstanceId, update: &InstanceUpdate, event: RelayEvent) -> bool {
        match self.persist(instance_id, update).await {
            Ok(()) => {
                self.publish(event);
                true
            }
            Err(_) => {
                error!(instance_id = %instance_id, event_type = event.event_type(), "transition not recorded");
                false
            }
        }
    }

    /// Count a recoverable failure and either queue a retry or give up.
    pub(crate) async fn schedule_reconnect(self: &Arc<Self>, instance_id: &InstanceId, cause: &str) {
        let attempt = {
            let mut attempts = self.reconnect_attempts.entry(instance_id.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        let policy = &self.config.reconnect;
        if attempt > policy.max_attempts {
            warn!(instance_id = %instance_id, attempts = policy.max_attempts, cause, "reconnect attempts exhausted");
            self.forget_reconnect_state(instance_id);
            self.commit(
                instance_id,
                &InstanceUpdate::status(InstanceStatus::Disconnected),
                status_event(instance_id, InstanceStatus::Disconnected, None, Some("reconnect_exhausted")),
            )
            .await;
            return;
        }

        let delay = policy.delay_for(attempt);
        let cancel = CancellationToken::new();
        if let Some(previous) = self.pending_retries.insert(instance_id.clone(), cancel.clone()) {
            previous.cancel();
        }
        info!(
            instance_id = %instance_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            cause,
            "reconnect scheduled"
        );
        let task = self.retry_task(instance_id.clone(), cancel.clone());
        self.scheduler.schedule(instance_id.clone(), delay, cancel, task);
    }

    fn retry_task(self: &Arc<Self>, instance_id: InstanceId, cancel: CancellationToken) -> RetryTask {
        let inner = Arc::clone(self);
        Box::pin(async move {
            let lock = inner.lock_for(&instance_id);
            let _guard = lock.lock().await;
            // stop, logout and delete cancel under the same lock
            if cancel.is_cancelled() {
                return;
            }
            inner.pending_retries.remove(&instance_id);

            match inner.start_locked(&instance_id).await {
                Ok(()) => debug!(instance_id = %instance_id, "reconnect attempt opened"),
                Err(OrchestratorError::Engine(e)) => {
                    warn!(instance_id = %instance_id, error = %e, "reconnect attempt failed");
                    inner.schedule_reconnect(&instance_id, e.error_kind()).await;
                }
                Err(e) => error!(instance_id = %instance_id, error = %e, "reconnect abandoned"),
            }
        })
    }
}
