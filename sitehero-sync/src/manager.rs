//! Sync orchestration.
//!
//! The [`SyncManager`] owns the local store, the mutation queue, the conflict
//! resolver and the bandwidth monitor. It is constructed once in the
//! composition root and shared behind an `Arc`.
//!
//! A drain repeatedly leases a batch sized for the current link, splits it
//! by table, sends each part with a timeout and a cancellation signal, and
//! settles every item according to the server's per-item outcome:
//! - applied: written back to the store idempotently, cursor advanced
//! - conflict: handed to the resolver, auto-applied or escalated
//! - rejected: parked as failed
//! - missing, timeout, 5xx, 429, transport error: retried with backoff
//! - auth expired: requeued without penalty, draining paused

use crate::bandwidth::BandwidthMonitor;
use crate::conflict::{ConflictResolver, ConflictStrategy, Resolution, Side};
use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::queue::{self, Clock, RequeueOutcome, SyncQueue, system_clock};
use crate::remote::{AppliedItem, BatchRequest, BatchResponse, RemoteService, ServerVersion};
use crate::status::{DrainState, SyncStatusSnapshot};
use serde_json::{Map, Value};
use sitehero_storage::{LocalStore, StorageQuotaManager, StorageResult, StoreTxn};
use sitehero_types::{
    Conflict, ConflictId, EntityId, MutationId, MutationStatus, Operation, PendingMutation,
    Record, SyncStatus, TableName, VersionSnapshot, merge_patch,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Commands accepted by the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Drain now.
    Trigger,
    Shutdown,
}

/// Handle for sending commands to a running sync loop.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    pub async fn trigger(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::Trigger)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::Shutdown)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// The user's pick when resolving a conflict by hand.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictChoice {
    KeepLocal,
    KeepServer,
    /// A hand-merged payload.
    Custom(Value),
}

/// How the items of one batch were settled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    /// Conflicts settled by the table's strategy without user input.
    pub auto_resolved: usize,
    /// Conflicts escalated to the user.
    pub conflicts: usize,
    pub rejected: usize,
    pub retried: usize,
}

impl BatchOutcome {
    fn absorb(&mut self, other: BatchOutcome) {
        self.applied += other.applied;
        self.auto_resolved += other.auto_resolved;
        self.conflicts += other.conflicts;
        self.rejected += other.rejected;
        self.retried += other.retried;
    }
}

/// Summary of one `drain()` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Batches sent (one per table per leased set).
    pub batches: usize,
    pub totals: BatchOutcome,
    /// Another drain was running; it will run again on our behalf.
    pub deferred: bool,
}

enum SendOutcome {
    Settled(BatchOutcome),
    /// Cancelled or auth expired. Nothing further should be sent.
    Halted,
}

enum ConflictHandling {
    AutoResolved,
    Escalated,
    Skipped,
}

/// Orchestrates queue draining against the remote service.
pub struct SyncManager {
    store: LocalStore,
    quota: Arc<StorageQuotaManager>,
    queue: SyncQueue,
    resolver: ConflictResolver,
    bandwidth: BandwidthMonitor,
    remote: Arc<dyn RemoteService>,
    config: SyncConfig,
    strategies: RwLock<HashMap<TableName, ConflictStrategy>>,
    paused: AtomicBool,
    draining: AtomicBool,
    rerun: AtomicBool,
    cancel_tx: watch::Sender<u64>,
    status_tx: watch::Sender<SyncStatusSnapshot>,
    wake: Notify,
}

impl SyncManager {
    pub fn new(config: SyncConfig, store: LocalStore, remote: Arc<dyn RemoteService>) -> SyncResult<Self> {
        Self::with_clock(config, store, remote, system_clock())
    }

    /// Like [`SyncManager::new`] with an explicit time source.
    pub fn with_clock(
        config: SyncConfig,
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        clock: Clock,
    ) -> SyncResult<Self> {
        config.validate()?;
        let queue = SyncQueue::new(store.clone(), &config).with_clock(clock);
        let quota = queue.quota().clone();
        let (cancel_tx, _) = watch::channel(0u64);
        let (status_tx, _) = watch::channel(SyncStatusSnapshot::default());
        let manager = Self {
            store,
            quota,
            queue,
            resolver: ConflictResolver::new(config.lww_skew_tolerance_ms),
            bandwidth: BandwidthMonitor::new(&config),
            remote,
            config,
            strategies: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            cancel_tx,
            status_tx,
            wake: Notify::new(),
        };
        manager.refresh_status();
        Ok(manager)
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn bandwidth(&self) -> &BandwidthMonitor {
        &self.bandwidth
    }

    pub fn quota(&self) -> &StorageQuotaManager {
        &self.quota
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ── Local writes ──

    /// Applies a local change optimistically and queues it for the server,
    /// in one transaction. Returns the id of the queued mutation.
    ///
    /// `payload` is the full entity for creates and the changed fields for
    /// updates; it is ignored for deletes. An update needs the entity in the
    /// local store (after eviction, load it again first) and fails with
    /// [`SyncError::NotFound`] otherwise.
    pub fn enqueue_mutation(
        &self,
        table: TableName,
        id: impl Into<EntityId>,
        op: Operation,
        payload: Option<Value>,
        priority: Option<i32>,
    ) -> SyncResult<MutationId> {
        let id = id.into();
        let payload = match op {
            Operation::Delete => None,
            Operation::Create | Operation::Update => Some(
                payload
                    .filter(Value::is_object)
                    .ok_or_else(|| SyncError::Validation(format!("{op} on {table}/{id} needs an object payload")))?,
            ),
        };
        let now = self.queue.now();

        let written = self.quota.write(|| {
            self.store.atomically(|txn| {
                let existing = txn.get(table, &id)?;
                if op == Operation::Update && existing.is_none() {
                    return Ok(None);
                }
                let record = optimistic_record(table, &id, op, payload.as_ref(), existing.as_ref(), now);
                txn.put(&record)?;
                let base_version = existing.as_ref().and_then(|r| r.server_version);
                let mut mutation = PendingMutation::new(table, id.clone(), op, payload.clone(), base_version, now);
                if let Some(priority) = priority {
                    mutation = mutation.with_priority(priority);
                }
                queue::enqueue_in(txn, mutation).map(Some)
            })
        });
        let mutation_id = match written {
            Ok(Some(id)) => id,
            // A patch alone is not the whole entity.
            Ok(None) => {
                return Err(SyncError::NotFound(format!(
                    "{table}/{id} is not stored locally, load it before updating"
                )));
            }
            Err(e) => {
                // Surfaces `storage_full` to status subscribers.
                self.refresh_status();
                return Err(e.into());
            }
        };

        debug!("queued {op} on {table}/{id} as {mutation_id}");
        self.refresh_status();
        self.wake.notify_one();
        Ok(mutation_id)
    }

    // ── Draining ──

    /// Sends everything currently eligible. A call made while another drain
    /// runs returns immediately and makes the running drain go round again.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        if self.draining.swap(true, Ordering::AcqRel) {
            self.rerun.store(true, Ordering::Release);
            debug!("drain already running, rerun requested");
            return Ok(DrainReport {
                deferred: true,
                ..DrainReport::default()
            });
        }

        self.refresh_status();
        let mut report = DrainReport::default();
        let result = loop {
            self.rerun.store(false, Ordering::Release);
            if let Err(e) = self.drain_pass(&mut report).await {
                break Err(e);
            }
            if self.rerun.swap(false, Ordering::AcqRel) {
                continue;
            }
            self.draining.store(false, Ordering::Release);
            // A rerun request that raced the release above.
            if self.rerun.load(Ordering::Acquire) && !self.draining.swap(true, Ordering::AcqRel) {
                continue;
            }
            break Ok(());
        };
        if result.is_err() {
            self.draining.store(false, Ordering::Release);
        }
        self.refresh_status();

        if report.batches > 0 {
            info!(
                "drain finished: {} batches, {} applied, {} conflicts, {} rejected, {} retried",
                report.batches,
                report.totals.applied,
                report.totals.conflicts,
                report.totals.rejected,
                report.totals.retried
            );
        }
        result.map(|()| report)
    }

    async fn drain_pass(&self, report: &mut DrainReport) -> SyncResult<()> {
        loop {
            if self.paused.load(Ordering::Acquire) {
                debug!("sync paused, not draining");
                return Ok(());
            }
            let quality = self.bandwidth.current_quality();
            let max = self.bandwidth.batch_size(quality);
            if max == 0 {
                debug!("offline, waiting for reconnect");
                return Ok(());
            }

            let batch = self.queue.dequeue_batch(max, None)?;
            if batch.is_empty() {
                return Ok(());
            }
            debug!("draining {} mutations on a {quality} link", batch.len());
            self.refresh_status();

            let mut groups = group_by_table(batch).into_iter();
            while let Some((table, mutations)) = groups.next() {
                report.batches += 1;
                match self.send_group(table, &mutations).await? {
                    SendOutcome::Settled(outcome) => report.totals.absorb(outcome),
                    SendOutcome::Halted => {
                        for (_, rest) in groups.by_ref() {
                            for m in rest {
                                self.queue.requeue_without_penalty(&m.id)?;
                            }
                        }
                        return Ok(());
                    }
                }
                self.refresh_status();
            }
        }
    }

    async fn send_group(&self, table: TableName, mutations: &[PendingMutation]) -> SyncResult<SendOutcome> {
        let request = BatchRequest::from_mutations(table, mutations);
        let bytes = request.encoded_len();
        let mut cancel_rx = self.cancel_tx.subscribe();
        let started = Instant::now();

        let result = tokio::select! {
            res = tokio::time::timeout(self.config.send_timeout(), self.remote.send_batch(&request)) => Some(res),
            _ = cancel_rx.changed() => None,
        };

        match result {
            None => {
                info!("send of {} {table} mutations cancelled", mutations.len());
                for m in mutations {
                    self.queue.requeue_without_penalty(&m.id)?;
                }
                Ok(SendOutcome::Halted)
            }
            Some(Err(_elapsed)) => {
                warn!("send of {} {table} mutations timed out", mutations.len());
                self.bandwidth.record_failure();
                Ok(SendOutcome::Settled(self.retry_all(mutations, "send timed out")?))
            }
            Some(Ok(Ok(response))) => {
                self.bandwidth.record_sample(started.elapsed(), bytes);
                Ok(SendOutcome::Settled(self.apply_response(table, mutations, &response)?))
            }
            Some(Ok(Err(RemoteError::AuthExpired))) => {
                warn!("session expired, pausing sync");
                for m in mutations {
                    self.queue.requeue_without_penalty(&m.id)?;
                }
                self.paused.store(true, Ordering::Release);
                Ok(SendOutcome::Halted)
            }
            Some(Ok(Err(RemoteError::Validation(reason)))) => {
                let mut outcome = BatchOutcome::default();
                for m in mutations {
                    if self.queue.mark_failed(&m.id, &reason)? {
                        outcome.rejected += 1;
                    }
                }
                Ok(SendOutcome::Settled(outcome))
            }
            Some(Ok(Err(e @ (RemoteError::Transient(_) | RemoteError::Timeout)))) => {
                warn!("send of {} {table} mutations failed: {e}", mutations.len());
                self.bandwidth.record_failure();
                Ok(SendOutcome::Settled(self.retry_all(mutations, &e.to_string())?))
            }
        }
    }

    fn retry_all(&self, mutations: &[PendingMutation], error: &str) -> SyncResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for m in mutations {
            match self.queue.requeue_transient(&m.id, error)? {
                RequeueOutcome::Retrying { .. } => outcome.retried += 1,
                RequeueOutcome::Failed => outcome.rejected += 1,
                RequeueOutcome::Skipped => {}
            }
        }
        Ok(outcome)
    }

    /// Settles a batch from the server's response. Safe to call again with
    /// the same response: already-settled items are skipped.
    pub fn apply_response(
        &self,
        table: TableName,
        mutations: &[PendingMutation],
        response: &BatchResponse,
    ) -> SyncResult<BatchOutcome> {
        let by_entity: HashMap<&EntityId, &PendingMutation> =
            mutations.iter().map(|m| (&m.entity_id, m)).collect();
        let mut answered: HashSet<&EntityId> = HashSet::new();
        let mut outcome = BatchOutcome::default();

        for item in &response.applied {
            let Some(m) = by_entity.get(&item.id) else {
                warn!("server applied {table}/{} which was not in the batch", item.id);
                continue;
            };
            answered.insert(&m.entity_id);
            if self.apply_confirmed(m, item)? {
                outcome.applied += 1;
            }
        }

        for item in &response.conflicts {
            let Some(m) = by_entity.get(&item.id) else {
                warn!("server reported conflict on {table}/{} which was not in the batch", item.id);
                continue;
            };
            answered.insert(&m.entity_id);
            match self.handle_conflict(m, &item.server_version)? {
                ConflictHandling::AutoResolved => outcome.auto_resolved += 1,
                ConflictHandling::Escalated => outcome.conflicts += 1,
                ConflictHandling::Skipped => {}
            }
        }

        for item in &response.rejected {
            let Some(m) = by_entity.get(&item.id) else {
                warn!("server rejected {table}/{} which was not in the batch", item.id);
                continue;
            };
            answered.insert(&m.entity_id);
            if self.queue.mark_failed(&m.id, &item.reason)? {
                outcome.rejected += 1;
            }
        }

        let unanswered: Vec<PendingMutation> = mutations
            .iter()
            .filter(|m| !answered.contains(&m.entity_id))
            .cloned()
            .collect();
        if !unanswered.is_empty() {
            debug!("{} {table} mutations missing from response", unanswered.len());
            outcome.absorb(self.retry_all(&unanswered, "not processed by server")?);
        }

        Ok(outcome)
    }

    /// Writes a server confirmation back to the store. Returns false if the
    /// mutation was already settled.
    fn apply_confirmed(&self, m: &PendingMutation, item: &AppliedItem) -> SyncResult<bool> {
        let now = self.queue.now();
        let applied = self.quota.write(|| {
            self.store.atomically(|txn| {
                let Some(current) = txn.get_mutation(&m.id)? else {
                    return Ok(false);
                };
                if current.status != MutationStatus::InFlight {
                    return Ok(false);
                }
                let version = item
                    .version
                    .unwrap_or_else(|| current.base_version.map_or(1, |v| v + 1));

                txn.delete_mutation(&current.id)?;
                let mut successors = txn.mutations_for_entity(current.table, &current.entity_id)?;
                for s in successors.iter_mut().filter(|s| s.status == MutationStatus::Pending) {
                    s.base_version = Some(version);
                    txn.put_mutation(s)?;
                }
                let has_successor = successors.iter().any(|s| s.status != MutationStatus::Failed);

                if let Some(mut record) = txn.get(current.table, &current.entity_id)? {
                    let stale = record.server_version.is_some_and(|v| v > version);
                    if current.operation == Operation::Delete {
                        if has_successor {
                            record.server_version = Some(version);
                            record.server_payload = None;
                            txn.put(&record)?;
                        } else {
                            txn.delete(current.table, &current.entity_id)?;
                        }
                    } else if !stale {
                        let base = record
                            .server_payload
                            .clone()
                            .unwrap_or_else(|| Value::Object(Map::new()));
                        let canonical = item.payload.clone().unwrap_or_else(|| {
                            current
                                .payload
                                .as_ref()
                                .map_or(base.clone(), |p| merge_patch(&base, p))
                        });
                        record.server_version = Some(version);
                        record.server_payload = Some(canonical.clone());
                        if has_successor {
                            record.sync_status = SyncStatus::Pending;
                        } else {
                            record.payload = canonical;
                            record.deleted = false;
                            record.sync_status = SyncStatus::Synced;
                        }
                        txn.put(&record)?;
                    } else if !has_successor {
                        queue::set_record_status(txn, current.table, &current.entity_id, SyncStatus::Synced)?;
                    }
                }

                txn.advance_cursor(current.table, version, now)?;
                Ok(true)
            })
        })?;
        if applied {
            debug!("{}/{} confirmed", m.table, m.entity_id);
        }
        Ok(applied)
    }

    fn handle_conflict(&self, m: &PendingMutation, server: &ServerVersion) -> SyncResult<ConflictHandling> {
        let Some(current) = self.queue.get(&m.id)? else {
            return Ok(ConflictHandling::Skipped);
        };
        if current.status != MutationStatus::InFlight {
            return Ok(ConflictHandling::Skipped);
        }

        let record = self.store.peek(current.table, &current.entity_id)?;
        let local = VersionSnapshot {
            payload: record.as_ref().filter(|r| !r.deleted).map(|r| r.payload.clone()),
            version: current.base_version,
            modified_at: record.as_ref().map_or(current.enqueued_at, |r| r.modified_at),
        };
        let server = VersionSnapshot {
            payload: server.payload.clone(),
            version: Some(server.version),
            modified_at: server.modified_at,
        };
        let base = record.as_ref().and_then(|r| r.server_payload.as_ref());
        let strategy = self.strategy_for(current.table);
        let resolution = self.resolver.resolve(&local, &server, base, &strategy);
        info!(
            "conflict on {}/{} under {}: {resolution:?}",
            current.table,
            current.entity_id,
            strategy.name()
        );

        let now = self.queue.now();
        let chosen = match resolution {
            Resolution::Keep(Side::Server) => server.payload.clone(),
            Resolution::Keep(Side::Local) => local.payload.clone(),
            Resolution::Merged(merged) => Some(merged),
            Resolution::Escalate { fields } => {
                let conflict = Conflict {
                    id: ConflictId::new(),
                    mutation_id: current.id,
                    table: current.table,
                    entity_id: current.entity_id.clone(),
                    local,
                    server,
                    strategy: strategy.name().to_string(),
                    fields,
                    created_at: now,
                };
                self.quota.write(|| {
                    self.store.atomically(|txn| {
                        txn.put_conflict(&conflict)?;
                        queue::mark_conflict_in(txn, &current.id)
                    })
                })?;
                warn!(
                    "conflict {} on {}/{} needs resolution",
                    conflict.id, conflict.table, conflict.entity_id
                );
                return Ok(ConflictHandling::Escalated);
            }
        };

        self.quota.write(|| {
            self.store
                .atomically(|txn| settle_in(txn, &current, chosen.clone(), &server, now, false))
        })?;
        Ok(ConflictHandling::AutoResolved)
    }

    // ── Conflicts ──

    pub fn list_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        Ok(self.store.list_conflicts()?)
    }

    /// Finalizes a conflict with the user's choice. Local edits queued after
    /// the conflict was raised are replayed on top of the choice. If the
    /// result differs from the server's version a follow-up update is queued.
    pub fn resolve_conflict(&self, id: &ConflictId, choice: ConflictChoice) -> SyncResult<()> {
        let conflict = self
            .store
            .get_conflict(id)?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {id}")))?;
        let chosen = match choice {
            ConflictChoice::KeepLocal => conflict.local.payload.clone(),
            ConflictChoice::KeepServer => conflict.server.payload.clone(),
            ConflictChoice::Custom(value) => Some(value),
        };
        let now = self.queue.now();

        let follow_up = self.quota.write(|| {
            self.store.atomically(|txn| {
                txn.delete_conflict(&conflict.id)?;
                let mutation = txn.get_mutation(&conflict.mutation_id)?.unwrap_or_else(|| {
                    PendingMutation::new(
                        conflict.table,
                        conflict.entity_id.clone(),
                        Operation::Update,
                        None,
                        conflict.server.version,
                        now,
                    )
                });
                settle_in(txn, &mutation, chosen.clone(), &conflict.server, now, true)
            })
        })?;

        info!(
            "conflict {id} on {}/{} resolved{}",
            conflict.table,
            conflict.entity_id,
            if follow_up { ", follow-up queued" } else { "" }
        );
        self.refresh_status();
        if follow_up {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Installs a strategy for one table, overriding the configured kind.
    pub fn set_strategy(&self, table: TableName, strategy: ConflictStrategy) {
        match self.strategies.write() {
            Ok(mut strategies) => {
                strategies.insert(table, strategy);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(table, strategy);
            }
        }
    }

    pub fn strategy_for(&self, table: TableName) -> ConflictStrategy {
        let installed = match self.strategies.read() {
            Ok(strategies) => strategies.get(&table).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&table).cloned(),
        };
        installed.unwrap_or_else(|| self.config.strategy_kind_for(table).into())
    }

    // ── Failed mutations ──

    pub fn list_failed(&self) -> SyncResult<Vec<PendingMutation>> {
        self.queue.list(Some(MutationStatus::Failed))
    }

    pub fn retry_failed(&self, id: &MutationId) -> SyncResult<bool> {
        let retried = self.queue.retry_failed(id)?;
        if retried {
            self.refresh_status();
            self.wake.notify_one();
        }
        Ok(retried)
    }

    pub fn discard_failed(&self, id: &MutationId) -> SyncResult<bool> {
        let discarded = self.queue.discard_failed(id)?;
        if discarded {
            self.refresh_status();
        }
        Ok(discarded)
    }

    // ── Connectivity, auth and cancellation ──

    /// Connectivity signal from the platform. Going offline aborts the
    /// current send; coming back online wakes the loop.
    pub fn set_online(&self, online: bool) {
        self.bandwidth.set_online(online);
        if online {
            self.wake.notify_one();
        } else {
            self.cancel();
        }
        self.refresh_status();
    }

    /// Stops sending until [`SyncManager::session_restored`] is called.
    pub fn pause_for_auth(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!("sync paused for re-authentication");
        }
        self.cancel();
        self.refresh_status();
    }

    pub fn session_restored(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("session restored, resuming sync");
        }
        self.refresh_status();
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Aborts the send in progress. Its mutations go back to the queue at
    /// their original priority with no backoff penalty.
    pub fn cancel(&self) {
        self.cancel_tx.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    // ── Status ──

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SyncStatusSnapshot {
        self.status_tx.borrow().clone()
    }

    fn refresh_status(&self) {
        match self.compute_status() {
            Ok(snapshot) => {
                self.status_tx.send_if_modified(|current| {
                    if *current != snapshot {
                        *current = snapshot;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => error!("failed to compute sync status: {e}"),
        }
    }

    fn compute_status(&self) -> SyncResult<SyncStatusSnapshot> {
        let paused = self.paused.load(Ordering::Acquire);
        let draining = self.draining.load(Ordering::Acquire);
        let is_online = self.bandwidth.is_online();
        let pending_count = self.queue.pending_count()?;
        let now = self.queue.now();

        let state = if paused {
            DrainState::Paused
        } else if draining {
            DrainState::Draining
        } else if !is_online {
            DrainState::Waiting
        } else if pending_count > 0
            && !self.queue.has_eligible()?
            && self.queue.next_attempt_at()?.is_some_and(|t| t > now)
        {
            DrainState::Backoff
        } else {
            DrainState::Idle
        };

        Ok(SyncStatusSnapshot {
            is_online,
            pending_count,
            is_syncing: draining && !paused,
            conflict_count: self.store.count_conflicts()?,
            failed_count: self.queue.failed_count()?,
            state,
            auth_required: paused,
            storage_full: self.quota.is_storage_full(),
        })
    }

    // ── Background loop ──

    /// Spawns the background loop on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(command_rx).await });
        SyncHandle { command_tx }
    }

    async fn run(self: Arc<Self>, mut command_rx: mpsc::Receiver<SyncCommand>) {
        info!("sync loop started");
        let mut quality_rx = self.bandwidth.subscribe();

        loop {
            if let Err(e) = self.drain().await {
                error!("drain failed: {e}");
            }
            let wait = self.next_wakeup();

            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(SyncCommand::Trigger) => debug!("drain triggered"),
                    Some(SyncCommand::Shutdown) => {
                        info!("sync loop stopping");
                        break;
                    }
                    None => {
                        info!("command channel closed, stopping sync loop");
                        break;
                    }
                },
                _ = self.wake.notified() => {}
                changed = quality_rx.changed() => {
                    if changed.is_ok() {
                        debug!("network quality now {}", *quality_rx.borrow());
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("sync loop stopped");
    }

    /// Time until the earliest backed-off mutation becomes eligible, capped
    /// at the idle poll interval.
    fn next_wakeup(&self) -> Duration {
        let idle = Duration::from_secs(self.config.idle_poll_secs);
        if self.is_paused() || !self.bandwidth.is_online() {
            return idle;
        }
        match self.queue.next_attempt_at() {
            Ok(Some(at)) => {
                let delta = at - self.queue.now();
                if delta > 0 {
                    idle.min(Duration::from_millis(delta as u64))
                } else {
                    idle
                }
            }
            Ok(None) => idle,
            Err(e) => {
                warn!("failed to read queue schedule: {e}");
                idle
            }
        }
    }
}

/// Splits a priority-ordered batch by table, keeping first-seen order.
fn group_by_table(batch: Vec<PendingMutation>) -> Vec<(TableName, Vec<PendingMutation>)> {
    let mut groups: Vec<(TableName, Vec<PendingMutation>)> = Vec::new();
    for m in batch {
        match groups.iter_mut().find(|(t, _)| *t == m.table) {
            Some((_, group)) => group.push(m),
            None => groups.push((m.table, vec![m])),
        }
    }
    groups
}

/// The record after applying a local change on top of `existing`.
fn optimistic_record(
    table: TableName,
    id: &EntityId,
    op: Operation,
    payload: Option<&Value>,
    existing: Option<&Record>,
    now: i64,
) -> Record {
    let mut record = existing.cloned().unwrap_or_else(|| Record {
        table,
        id: id.clone(),
        payload: Value::Object(Map::new()),
        local_revision: 0,
        server_version: None,
        server_payload: None,
        sync_status: SyncStatus::Pending,
        deleted: false,
        modified_at: now,
        last_accessed_at: now,
    });

    match (op, payload) {
        (Operation::Create, Some(p)) => {
            record.payload = p.clone();
            record.deleted = false;
        }
        (Operation::Update, Some(p)) => {
            if record.deleted {
                record.payload = Value::Object(Map::new());
            }
            record.payload = merge_patch(&record.payload, p);
            record.deleted = false;
        }
        (Operation::Delete, _) => record.deleted = true,
        (_, None) => {}
    }

    record.local_revision += 1;
    if record.sync_status != SyncStatus::Conflict {
        record.sync_status = SyncStatus::Pending;
    }
    record.modified_at = now;
    record.last_accessed_at = now;
    record
}

/// Settles a conflicted or contested mutation on `chosen`.
///
/// When `chosen` equals the server's payload the mutation is dropped and the
/// record takes the server state. Otherwise the record takes `chosen` and the
/// mutation becomes a full-payload follow-up based on the server's version.
/// With `replay_successors`, pending edits queued behind the mutation are
/// applied on top of `chosen` first. Returns true if a follow-up was queued.
fn settle_in(
    txn: &StoreTxn<'_>,
    mutation: &PendingMutation,
    chosen: Option<Value>,
    server: &VersionSnapshot,
    now: i64,
    replay_successors: bool,
) -> StorageResult<bool> {
    let (table, id) = (mutation.table, &mutation.entity_id);
    let successors: Vec<PendingMutation> = txn
        .mutations_for_entity(table, id)?
        .into_iter()
        .filter(|s| s.id != mutation.id && s.status == MutationStatus::Pending)
        .collect();

    let mut chosen = chosen;
    if replay_successors {
        for s in &successors {
            chosen = match (s.operation, &s.payload) {
                (Operation::Delete, _) => None,
                (_, Some(p)) => Some(merge_patch(chosen.as_ref().unwrap_or(&Value::Object(Map::new())), p)),
                (_, None) => chosen,
            };
        }
    }
    for s in &successors {
        txn.delete_mutation(&s.id)?;
    }

    let server_version = server.version.unwrap_or(0);
    let existing = txn.get(table, id)?;

    if chosen == server.payload {
        txn.delete_mutation(&mutation.id)?;
        match &server.payload {
            Some(p) => {
                let mut record = existing.unwrap_or_else(|| {
                    Record::from_server(table, id.clone(), p.clone(), server_version, server.modified_at)
                });
                record.payload = p.clone();
                record.server_payload = Some(p.clone());
                record.server_version = server.version;
                record.deleted = false;
                record.sync_status = SyncStatus::Synced;
                record.modified_at = server.modified_at;
                txn.put(&record)?;
            }
            None => {
                txn.delete(table, id)?;
            }
        }
        txn.advance_cursor(table, server_version, now)?;
        return Ok(false);
    }

    let mut record = existing.unwrap_or_else(|| Record {
        table,
        id: id.clone(),
        payload: Value::Object(Map::new()),
        local_revision: 0,
        server_version: None,
        server_payload: None,
        sync_status: SyncStatus::Pending,
        deleted: false,
        modified_at: now,
        last_accessed_at: now,
    });
    let (operation, base_version) = match &chosen {
        Some(v) => {
            record.payload = v.clone();
            record.deleted = false;
            if server.payload.is_some() {
                (Operation::Update, server.version)
            } else {
                (Operation::Create, None)
            }
        }
        None => {
            record.deleted = true;
            (Operation::Delete, server.version)
        }
    };
    record.server_version = server.version;
    record.server_payload = server.payload.clone();
    record.local_revision += 1;
    record.sync_status = SyncStatus::Pending;
    record.modified_at = now;
    txn.put(&record)?;

    let follow_up = PendingMutation {
        operation,
        payload: chosen,
        base_version,
        retry_count: 0,
        next_attempt_at: now,
        status: MutationStatus::Pending,
        last_error: None,
        ..mutation.clone()
    };
    txn.put_mutation(&follow_up)?;
    txn.advance_cursor(table, server_version, now)?;
    Ok(true)
}
