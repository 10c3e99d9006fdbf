//! Connection orchestrator.
//!
//! Owns the table of live engine sessions keyed by instance id. Mutating
//! operations on one instance are serialized behind a per-instance async
//! lock; different instances proceed concurrently. Every state change is
//! written to the store first and published to subscribers second.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use switchboard_core::address;
use switchboard_core::engine::{EngineEvent, EngineSession, ProtocolEngine, SessionHandle};
use switchboard_core::events::RelayEvent;
use switchboard_core::ids::{ContactId, InstanceId, OwnerId};
use switchboard_core::status::{Direction, InstanceStatus};
use switchboard_store::contacts::{ContactRepo, ContactRow};
use switchboard_store::instances::{InstanceRepo, InstanceRow, InstanceUpdate};
use switchboard_store::messages::{AppendOutcome, MessageRepo, MessageRow, NewMessage};
use switchboard_store::stats::{OwnerStats, StatsRepo};
use switchboard_store::{Database, StoreError};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::ingest::IngestPipeline;
use crate::scheduler::{RetryScheduler, TokioScheduler};
use crate::tenant::TenantView;
use crate::transitions::Flow;

/// One live engine connection.
pub(crate) struct LiveSession {
    pub(crate) handle: Arc<dyn SessionHandle>,
    /// Distinguishes this connection from earlier ones of the same instance.
    pub(crate) epoch: u64,
    pub(crate) cancel: CancellationToken,
    /// Cancelled when the event loop has exited and saved any queued
    /// credential rotation.
    pub(crate) loop_done: CancellationToken,
    /// Set once the engine reported open and the transition was persisted.
    pub(crate) connected: bool,
}

pub(crate) struct Inner {
    pub(crate) engine: Arc<dyn ProtocolEngine>,
    pub(crate) instances: InstanceRepo,
    pub(crate) contacts: ContactRepo,
    pub(crate) messages: MessageRepo,
    pub(crate) stats: StatsRepo,
    pub(crate) ingest: IngestPipeline,
    pub(crate) events: broadcast::Sender<RelayEvent>,
    pub(crate) scheduler: Arc<dyn RetryScheduler>,
    pub(crate) config: OrchestratorConfig,
    pub(crate) sessions: DashMap<InstanceId, LiveSession>,
    pub(crate) reconnect_attempts: DashMap<InstanceId, u32>,
    pub(crate) pairing_cycles: DashMap<InstanceId, u32>,
    pub(crate) pending_retries: DashMap<InstanceId, CancellationToken>,
    locks: DashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>,
    next_epoch: AtomicU64,
}

/// Outcome of [`Orchestrator::restore`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub resumed: usize,
    pub reset: usize,
    pub failed: usize,
}

/// Cheap to clone; all clones share one session table.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn ProtocolEngine>, db: Database, config: OrchestratorConfig) -> Self {
        Self::with_scheduler(engine, db, config, Arc::new(TokioScheduler))
    }

    pub fn with_scheduler(
        engine: Arc<dyn ProtocolEngine>,
        db: Database,
        config: OrchestratorConfig,
        scheduler: Arc<dyn RetryScheduler>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                engine,
                instances: InstanceRepo::new(db.clone()),
                contacts: ContactRepo::new(db.clone()),
                messages: MessageRepo::new(db.clone()),
                stats: StatsRepo::new(db.clone()),
                ingest: IngestPipeline::new(db),
                events,
                scheduler,
                config,
                sessions: DashMap::new(),
                reconnect_attempts: DashMap::new(),
                pairing_cycles: DashMap::new(),
                pending_retries: DashMap::new(),
                locks: DashMap::new(),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to pairing, status and message events for all instances.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    pub fn engine_name(&self) -> &str {
        self.inner.engine.name()
    }

    /// View restricted to instances owned by `owner_id`.
    pub fn for_tenant(&self, owner_id: OwnerId) -> TenantView {
        TenantView::new(self.clone(), owner_id)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Open a session for the instance. Already live is success.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn start(&self, instance_id: &InstanceId) -> Result<(), OrchestratorError> {
        let lock = self.inner.lock_for(instance_id);
        let _guard = lock.lock().await;
        self.inner.start_locked(instance_id).await
    }

    /// Close the live session, keeping credentials. No-op when not live.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn stop(&self, instance_id: &InstanceId) -> Result<(), OrchestratorError> {
        let lock = self.inner.lock_for(instance_id);
        let _guard = lock.lock().await;
        self.inner.stop_locked(instance_id).await
    }

    /// Unlink the device: close the session and erase stored credentials.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn logout(&self, instance_id: &InstanceId) -> Result<(), OrchestratorError> {
        let lock = self.inner.lock_for(instance_id);
        let _guard = lock.lock().await;
        let inner = &self.inner;

        inner.instances.get(instance_id)?;
        inner.forget_reconnect_state(instance_id);

        if let Some((_, session)) = inner.sessions.remove(instance_id) {
            session.cancel.cancel();
            if let Err(e) = session.handle.logout().await {
                warn!(instance_id = %instance_id, error = %e, "engine logout failed, closing");
                session.handle.close().await;
            }
            // a rotation flushed by the loop must not outlive the erase below
            session.loop_done.cancelled().await;
        }

        let erased = inner
            .with_retry(instance_id, || inner.instances.clear_credentials(instance_id))
            .await?;
        inner
            .persist(
                instance_id,
                &InstanceUpdate::status(InstanceStatus::Disconnected).with_linked_phone_number(None),
            )
            .await?;
        inner.publish(status_event(instance_id, InstanceStatus::Disconnected, None, Some("logged_out")));

        info!(instance_id = %instance_id, erased, "instance logged out");
        Ok(())
    }

    /// Stop the instance if needed, then delete it with its contacts and messages.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn delete(&self, instance_id: &InstanceId) -> Result<(), OrchestratorError> {
        let lock = self.inner.lock_for(instance_id);
        {
            let _guard = lock.lock().await;
            self.inner.instances.get(instance_id)?;
            self.inner.stop_locked(instance_id).await?;
            self.inner.instances.delete(instance_id)?;
        }
        self.inner.locks.remove(instance_id);
        info!(instance_id = %instance_id, "instance deleted");
        Ok(())
    }

    /// Resume sessions that were live when the process last ran.
    ///
    /// Instances with credentials are started again; instances caught
    /// mid-pairing without credentials are reset to disconnected.
    pub async fn restore(&self) -> Result<RestoreSummary, OrchestratorError> {
        let mut summary = RestoreSummary::default();

        for row in self.inner.instances.list_resumable()? {
            if row.has_credentials {
                match self.start(&row.id).await {
                    Ok(()) => summary.resumed += 1,
                    Err(OrchestratorError::Engine(e)) => {
                        warn!(instance_id = %row.id, error = %e, "restore open failed, retrying later");
                        self.inner.schedule_reconnect(&row.id, e.error_kind()).await;
                        summary.failed += 1;
                    }
                    Err(e) => {
                        warn!(instance_id = %row.id, error = %e, "restore failed");
                        summary.failed += 1;
                    }
                }
            } else {
                let update = InstanceUpdate::status(InstanceStatus::Disconnected);
                match self.inner.persist(&row.id, &update).await {
                    Ok(()) => summary.reset += 1,
                    Err(e) => {
                        warn!(instance_id = %row.id, error = %e, "restore reset failed");
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            resumed = summary.resumed,
            reset = summary.reset,
            failed = summary.failed,
            "restore complete"
        );
        Ok(summary)
    }

    /// Close every live session and cancel pending retries.
    ///
    /// Persisted statuses are left alone so the next `restore` resumes them.
    pub async fn shutdown(&self) -> usize {
        for entry in self.inner.pending_retries.iter() {
            entry.value().cancel();
        }
        self.inner.pending_retries.clear();

        let mut closed = 0;
        for instance_id in self.list_live() {
            let lock = self.inner.lock_for(&instance_id);
            let _guard = lock.lock().await;
            if let Some((_, session)) = self.inner.sessions.remove(&instance_id) {
                session.cancel.cancel();
                session.handle.close().await;
                session.loop_done.cancelled().await;
                closed += 1;
            }
        }
        self.inner.reconnect_attempts.clear();
        self.inner.pairing_cycles.clear();

        info!(closed, "orchestrator shut down");
        closed
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Send to a known contact of a connected instance.
    #[instrument(skip(self, content), fields(instance_id = %instance_id, contact_id = %contact_id))]
    pub async fn send(
        &self,
        instance_id: &InstanceId,
        contact_id: &ContactId,
        content: &str,
    ) -> Result<MessageRow, OrchestratorError> {
        let handle = self.inner.connected_handle(instance_id)?;
        let contact = self
            .inner
            .contacts
            .get(instance_id, contact_id)
            .map_err(|e| match e {
                StoreError::NotFound(_) => OrchestratorError::UnknownContact(contact_id.to_string()),
                other => OrchestratorError::Storage(other),
            })?;

        let sent = handle
            .send(&contact.external_address, content)
            .await
            .map_err(OrchestratorError::Dispatch)?;
        self.inner
            .record_outbound(instance_id, &contact.id, &sent.external_message_id, content)
    }

    /// Send to a raw protocol address, creating the contact on first use.
    #[instrument(skip(self, content), fields(instance_id = %instance_id))]
    pub async fn send_to_address(
        &self,
        instance_id: &InstanceId,
        raw_address: &str,
        content: &str,
    ) -> Result<MessageRow, OrchestratorError> {
        let handle = self.inner.connected_handle(instance_id)?;
        let key = address::normalize(raw_address);
        if !address::is_direct(raw_address) || key.is_empty() {
            return Err(OrchestratorError::UnknownContact(format!(
                "{raw_address} is not a direct address"
            )));
        }

        let sent = handle
            .send(&key, content)
            .await
            .map_err(OrchestratorError::Dispatch)?;
        let contact = self.inner.contacts.upsert(instance_id, &key, None)?;
        self.inner
            .record_outbound(instance_id, &contact.id, &sent.external_message_id, content)
    }

    // ── Lookups ─────────────────────────────────────────────────────────

    pub fn is_live(&self, instance_id: &InstanceId) -> bool {
        self.inner.sessions.contains_key(instance_id)
    }

    pub fn list_live(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Persisted projection of the instance, without the credential blob.
    pub fn status(&self, instance_id: &InstanceId) -> Result<InstanceRow, OrchestratorError> {
        Ok(self.inner.instances.get(instance_id)?)
    }

    pub fn create_instance(&self, owner_id: &OwnerId, name: &str) -> Result<InstanceRow, OrchestratorError> {
        let row = self.inner.instances.create(owner_id, name)?;
        info!(instance_id = %row.id, owner_id = %owner_id, "instance created");
        Ok(row)
    }

    pub fn list_instances(&self, owner_id: &OwnerId) -> Result<Vec<InstanceRow>, OrchestratorError> {
        Ok(self.inner.instances.list_for_owner(owner_id)?)
    }

    pub fn list_contacts(&self, instance_id: &InstanceId) -> Result<Vec<ContactRow>, OrchestratorError> {
        Ok(self.inner.contacts.list(instance_id)?)
    }

    pub fn list_messages(
        &self,
        instance_id: &InstanceId,
        contact_id: Option<&ContactId>,
        limit: u32,
    ) -> Result<Vec<MessageRow>, OrchestratorError> {
        Ok(self.inner.messages.list(instance_id, contact_id, limit)?)
    }

    pub fn stats(&self, owner_id: &OwnerId) -> Result<OwnerStats, OrchestratorError> {
        Ok(self.inner.stats.for_owner(owner_id)?)
    }
}

impl Inner {
    pub(crate) fn lock_for(&self, instance_id: &InstanceId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(instance_id.clone()).or_default().clone()
    }

    /// True while `epoch` is still the live connection of the instance.
    pub(crate) fn is_current(&self, instance_id: &InstanceId, epoch: u64) -> bool {
        self.sessions
            .get(instance_id)
            .is_some_and(|s| s.epoch == epoch)
    }

    pub(crate) async fn start_locked(
        self: &Arc<Self>,
        instance_id: &InstanceId,
    ) -> Result<(), OrchestratorError> {
        if self.sessions.contains_key(instance_id) {
            debug!(instance_id = %instance_id, "already live");
            return Ok(());
        }

        self.instances.get(instance_id)?;
        let credentials = self.instances.load_credentials(instance_id)?;
        let resuming = credentials.is_some();

        let EngineSession { handle, events } = self
            .engine
            .open(instance_id, credentials)
            .await
            .map_err(OrchestratorError::Engine)?;

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let loop_done = CancellationToken::new();
        self.sessions.insert(
            instance_id.clone(),
            LiveSession {
                handle: handle.clone(),
                epoch,
                cancel: cancel.clone(),
                loop_done: loop_done.clone(),
                connected: false,
            },
        );

        let update = InstanceUpdate::status(InstanceStatus::QrPending).with_pairing_code(None);
        if let Err(e) = self.persist(instance_id, &update).await {
            self.sessions.remove(instance_id);
            handle.close().await;
            return Err(e.into());
        }
        self.publish(status_event(instance_id, InstanceStatus::QrPending, None, None));

        self.spawn_event_loop(instance_id.clone(), epoch, events, cancel, loop_done);
        info!(instance_id = %instance_id, epoch, resuming, "session started");
        Ok(())
    }

    pub(crate) async fn stop_locked(&self, instance_id: &InstanceId) -> Result<(), OrchestratorError> {
        let had_retry = self.forget_reconnect_state(instance_id);
        let session = self.sessions.remove(instance_id).map(|(_, s)| s);
        if session.is_none() && !had_retry {
            return Ok(());
        }

        if let Some(session) = session {
            session.cancel.cancel();
            session.handle.close().await;
            session.loop_done.cancelled().await;
        }

        self.persist(instance_id, &InstanceUpdate::status(InstanceStatus::Disconnected))
            .await?;
        self.publish(status_event(instance_id, InstanceStatus::Disconnected, None, Some("stopped")));
        info!(instance_id = %instance_id, "session stopped");
        Ok(())
    }

    /// Drop reconnect bookkeeping; returns whether a retry was pending.
    pub(crate) fn forget_reconnect_state(&self, instance_id: &InstanceId) -> bool {
        self.reconnect_attempts.remove(instance_id);
        self.pairing_cycles.remove(instance_id);
        match self.pending_retries.remove(instance_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        instance_id: InstanceId,
        epoch: u64,
        mut events: mpsc::Receiver<EngineEvent>,
        cancel: CancellationToken,
        loop_done: CancellationToken,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _done = loop_done.drop_guard();
            let flow = loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Flow::Exit,
                    event = events.recv() => event,
                };
                let flow = match event {
                    Some(event) => inner.transition(&instance_id, epoch, &cancel, event).await,
                    None => inner.stream_ended(&instance_id, epoch, &cancel).await,
                };
                if flow != Flow::Continue {
                    break flow;
                }
            };

            if flow == Flow::Unlinked {
                events.close();
            } else {
                inner.flush_credentials(&instance_id, &mut events).await;
            }
            debug!(instance_id = %instance_id, epoch, ?flow, "event loop finished");
        });
    }

    fn connected_handle(&self, instance_id: &InstanceId) -> Result<Arc<dyn SessionHandle>, OrchestratorError> {
        self.sessions
            .get(instance_id)
            .filter(|s| s.connected)
            .map(|s| s.handle.clone())
            .ok_or_else(|| OrchestratorError::NotConnected(instance_id.clone()))
    }

    fn record_outbound(
        &self,
        instance_id: &InstanceId,
        contact_id: &ContactId,
        external_message_id: &str,
        content: &str,
    ) -> Result<MessageRow, OrchestratorError> {
        let now = Utc::now();
        let outcome = self.messages.append(&NewMessage {
            instance_id,
            contact_id,
            direction: Direction::Outbound,
            external_message_id,
            content,
            created_at: now,
        })?;
        self.contacts.touch(instance_id, contact_id, now)?;

        match outcome {
            AppendOutcome::Inserted(row) => Ok(row),
            AppendOutcome::Duplicate => {
                warn!(
                    instance_id = %instance_id,
                    external_message_id,
                    "engine reused a recorded message id, returning the stored row"
                );
                Ok(self.messages.find_by_external_id(instance_id, external_message_id)?)
            }
        }
    }

    /// Write a status update, retrying transient store failures.
    pub(crate) async fn persist(
        &self,
        instance_id: &InstanceId,
        update: &InstanceUpdate,
    ) -> Result<(), StoreError> {
        self.with_retry(instance_id, || self.instances.update(instance_id, update))
            .await
    }

    pub(crate) async fn with_retry<T>(
        &self,
        instance_id: &InstanceId,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let attempts = self.config.persist_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_not_found() || attempt >= attempts => {
                    error!(instance_id = %instance_id, attempt, error = %e, "store write failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, attempt, error = %e, "store write failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.persist_retry_delay).await;
                }
            }
        }
    }

    pub(crate) fn publish(&self, event: RelayEvent) {
        let instance_id = event.instance_id().clone();
        let event_type = event.event_type();
        if self.events.send(event).is_err() {
            debug!(instance_id = %instance_id, event_type, "no fan-out subscribers");
        }
    }
}

pub(crate) fn status_event(
    instance_id: &InstanceId,
    status: InstanceStatus,
    linked_phone_number: Option<String>,
    reason: Option<&str>,
) -> RelayEvent {
    RelayEvent::Status {
        instance_id: instance_id.clone(),
        status,
        linked_phone_number,
        reason: reason.map(String::from),
    }
}
