//! Durable, priority-ordered mutation queue.
//!
//! Mutations live in the `pending_mutations` table of the [`LocalStore`], so
//! the queue survives restarts. Ordering is `(priority desc, enqueued_at asc)`
//! with the time-ordered mutation id as the final tiebreak.
//!
//! Mutations for one entity go out strictly in enqueue order. Only the
//! entity's oldest mutation (its head) may be sent, and only while it is
//! pending: a head that is in flight, parked in conflict or failed holds back
//! everything queued behind it. A new mutation is coalesced into the newest
//! pending mutation of its entity.
//!
//! Every write goes through the queue's [`StorageQuotaManager`], so quota
//! failures get one eviction pass and all storage errors are reported.

use crate::backoff::BackoffSchedule;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use serde_json::Value;
use sitehero_storage::{LocalStore, StorageQuotaManager, StorageResult, StoreTxn};
use sitehero_types::{
    EntityId, MutationId, MutationStatus, Operation, PendingMutation, SyncStatus, TableName,
    merge_patch, now_millis,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of wall-clock time in milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The system clock.
pub fn system_clock() -> Clock {
    Arc::new(now_millis)
}

/// What happened to a mutation after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Back in the queue, not eligible before `next_attempt_at`.
    Retrying { retry_count: u32, next_attempt_at: i64 },
    /// Retry ceiling reached; parked as failed.
    Failed,
    /// The mutation was not in flight (already settled).
    Skipped,
}

/// Priority queue of pending mutations backed by the local store.
#[derive(Clone)]
pub struct SyncQueue {
    store: LocalStore,
    quota: Arc<StorageQuotaManager>,
    backoff: BackoffSchedule,
    max_transient_retries: u32,
    clock: Clock,
}

impl SyncQueue {
    pub fn new(store: LocalStore, config: &SyncConfig) -> Self {
        let quota = Arc::new(StorageQuotaManager::new(store.clone(), config.quota.clone()));
        Self {
            store,
            quota,
            backoff: BackoffSchedule::from_config(config),
            max_transient_retries: config.max_transient_retries,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> i64 {
        (self.clock)()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// The quota guard all queue writes go through.
    pub fn quota(&self) -> &Arc<StorageQuotaManager> {
        &self.quota
    }

    /// Runs `f` in one transaction behind the quota guard.
    fn write<T>(&self, f: impl Fn(&StoreTxn<'_>) -> StorageResult<T>) -> StorageResult<T> {
        self.quota.write(|| self.store.atomically(|txn| f(txn)))
    }

    // ── Enqueue ──

    /// Queues a mutation, coalescing it with the newest queued mutation for
    /// the same entity. Returns the id of the mutation that now carries the
    /// change (the earlier one when coalesced).
    pub fn enqueue(&self, mutation: PendingMutation) -> SyncResult<MutationId> {
        let id = self.write(|txn| enqueue_in(txn, mutation.clone()))?;
        Ok(id)
    }

    // ── Dequeue ──

    /// Leases up to `max` eligible mutations, highest priority first, and
    /// marks them in flight. Each must later be settled with `ack`,
    /// `requeue_transient`, `requeue_without_penalty`, `mark_conflict` or
    /// `mark_failed`.
    ///
    /// Selection and lease happen in one transaction; the returned rows are
    /// the ones stored at lease time.
    pub fn dequeue_batch(
        &self,
        max: usize,
        table_filter: Option<TableName>,
    ) -> SyncResult<Vec<PendingMutation>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();

        let leased = self.write(|txn| {
            let mut leased = Vec::new();
            for head in pending_heads(txn.list_mutations(None)?) {
                if leased.len() == max {
                    break;
                }
                if head.next_attempt_at > now || table_filter.is_some_and(|t| t != head.table) {
                    continue;
                }
                if !txn.lease_mutation(&head.id)? {
                    continue;
                }
                let Some(m) = txn.get_mutation(&head.id)? else {
                    continue;
                };
                set_record_status(txn, m.table, &m.entity_id, SyncStatus::Syncing)?;
                leased.push(m);
            }
            Ok(leased)
        })?;

        if !leased.is_empty() {
            debug!("leased {} mutations", leased.len());
        }
        Ok(leased)
    }

    // ── Settlement ──

    /// Removes a confirmed mutation. Returns false if it was already gone.
    pub fn ack(&self, id: &MutationId) -> SyncResult<bool> {
        Ok(self.write(|txn| txn.delete_mutation(id))?)
    }

    /// Returns an in-flight mutation to the queue after a transient failure,
    /// applying the backoff schedule. Past the retry ceiling it is marked
    /// failed instead.
    pub fn requeue_transient(&self, id: &MutationId, error: &str) -> SyncResult<RequeueOutcome> {
        let now = self.now();
        let outcome = self.write(|txn| {
            let Some(mut m) = txn.get_mutation(id)? else {
                return Ok(RequeueOutcome::Skipped);
            };
            if m.status != MutationStatus::InFlight {
                return Ok(RequeueOutcome::Skipped);
            }
            m.retry_count = m.retry_count.saturating_add(1);
            m.last_error = Some(error.to_string());

            if m.retry_count > self.max_transient_retries {
                m.status = MutationStatus::Failed;
                txn.put_mutation(&m)?;
                set_record_status(txn, m.table, &m.entity_id, SyncStatus::Failed)?;
                return Ok(RequeueOutcome::Failed);
            }

            let delay = self.backoff.delay_for(m.retry_count);
            m.status = MutationStatus::Pending;
            m.next_attempt_at = now + delay.as_millis() as i64;
            txn.put_mutation(&m)?;
            set_record_status(txn, m.table, &m.entity_id, SyncStatus::Pending)?;
            Ok(RequeueOutcome::Retrying {
                retry_count: m.retry_count,
                next_attempt_at: m.next_attempt_at,
            })
        })?;

        match outcome {
            RequeueOutcome::Retrying { retry_count, next_attempt_at } => {
                debug!("mutation {id} retry #{retry_count} at {next_attempt_at}: {error}");
            }
            RequeueOutcome::Failed => {
                warn!("mutation {id} gave up after {} retries: {error}", self.max_transient_retries);
            }
            RequeueOutcome::Skipped => {}
        }
        Ok(outcome)
    }

    /// Returns an in-flight mutation to the queue unchanged: same priority,
    /// no retry penalty, immediately eligible. Used on cancel and auth expiry.
    pub fn requeue_without_penalty(&self, id: &MutationId) -> SyncResult<bool> {
        let requeued = self.write(|txn| {
            let Some(mut m) = txn.get_mutation(id)? else {
                return Ok(false);
            };
            if m.status != MutationStatus::InFlight {
                return Ok(false);
            }
            m.status = MutationStatus::Pending;
            txn.put_mutation(&m)?;
            set_record_status(txn, m.table, &m.entity_id, SyncStatus::Pending)?;
            Ok(true)
        })?;
        Ok(requeued)
    }

    /// Parks a mutation until its conflict is resolved.
    pub fn mark_conflict(&self, id: &MutationId) -> SyncResult<bool> {
        let marked = self.write(|txn| mark_conflict_in(txn, id))?;
        Ok(marked)
    }

    /// Parks a permanently rejected in-flight mutation. It is never retried
    /// automatically.
    pub fn mark_failed(&self, id: &MutationId, reason: &str) -> SyncResult<bool> {
        let marked = self.write(|txn| {
            let Some(mut m) = txn.get_mutation(id)? else {
                return Ok(false);
            };
            if m.status != MutationStatus::InFlight {
                return Ok(false);
            }
            m.status = MutationStatus::Failed;
            m.last_error = Some(reason.to_string());
            txn.put_mutation(&m)?;
            set_record_status(txn, m.table, &m.entity_id, SyncStatus::Failed)?;
            Ok(true)
        })?;
        if marked {
            warn!("mutation {id} rejected: {reason}");
        }
        Ok(marked)
    }

    // ── Failed mutations ──

    /// Puts a failed mutation back into the queue with a fresh retry budget.
    pub fn retry_failed(&self, id: &MutationId) -> SyncResult<bool> {
        let now = self.now();
        let retried = self.write(|txn| {
            let Some(mut m) = txn.get_mutation(id)? else {
                return Ok(false);
            };
            if m.status != MutationStatus::Failed {
                return Ok(false);
            }
            m.status = MutationStatus::Pending;
            m.retry_count = 0;
            m.next_attempt_at = now;
            m.last_error = None;
            txn.put_mutation(&m)?;
            set_record_status(txn, m.table, &m.entity_id, SyncStatus::Pending)?;
            Ok(true)
        })?;
        Ok(retried)
    }

    /// Drops a failed mutation and rolls the local record back to the last
    /// server-confirmed state (or removes it if the server never had it).
    pub fn discard_failed(&self, id: &MutationId) -> SyncResult<bool> {
        let discarded = self.write(|txn| {
            let Some(m) = txn.get_mutation(id)? else {
                return Ok(false);
            };
            if m.status != MutationStatus::Failed {
                return Ok(false);
            }
            txn.delete_mutation(id)?;
            if !txn.mutations_for_entity(m.table, &m.entity_id)?.is_empty() {
                return Ok(true);
            }
            if let Some(mut record) = txn.get(m.table, &m.entity_id)? {
                match record.server_payload.take() {
                    Some(server) => {
                        record.payload = server.clone();
                        record.server_payload = Some(server);
                        record.deleted = false;
                        record.sync_status = SyncStatus::Synced;
                        txn.put(&record)?;
                    }
                    None => {
                        txn.delete(m.table, &m.entity_id)?;
                    }
                }
            }
            Ok(true)
        })?;
        Ok(discarded)
    }

    // ── Inspection ──

    /// Mutations not yet confirmed by the server (pending or in flight).
    pub fn pending_count(&self) -> SyncResult<u64> {
        Ok(self.store.count_mutations(MutationStatus::Pending)?
            + self.store.count_mutations(MutationStatus::InFlight)?)
    }

    pub fn failed_count(&self) -> SyncResult<u64> {
        Ok(self.store.count_mutations(MutationStatus::Failed)?)
    }

    pub fn list(&self, status: Option<MutationStatus>) -> SyncResult<Vec<PendingMutation>> {
        Ok(self.store.list_mutations(status)?)
    }

    pub fn get(&self, id: &MutationId) -> SyncResult<Option<PendingMutation>> {
        Ok(self.store.get_mutation(id)?)
    }

    /// Earliest `next_attempt_at` among mutations that are next in line for
    /// their entity.
    pub fn next_attempt_at(&self) -> SyncResult<Option<i64>> {
        Ok(pending_heads(self.store.list_mutations(None)?)
            .iter()
            .map(|m| m.next_attempt_at)
            .min())
    }

    /// True if some pending mutation can be sent right now.
    pub fn has_eligible(&self) -> SyncResult<bool> {
        let now = self.now();
        Ok(pending_heads(self.store.list_mutations(None)?)
            .iter()
            .any(|m| m.next_attempt_at <= now))
    }
}

/// Each entity's oldest mutation by `(enqueued_at, id)`, kept only when it
/// is pending. Input order (queue order) is preserved.
fn pending_heads(all: Vec<PendingMutation>) -> Vec<PendingMutation> {
    let mut heads: HashMap<(TableName, EntityId), (i64, MutationId)> = HashMap::new();
    for m in &all {
        let rank = (m.enqueued_at, m.id);
        heads
            .entry((m.table, m.entity_id.clone()))
            .and_modify(|head| *head = (*head).min(rank))
            .or_insert(rank);
    }
    all.into_iter()
        .filter(|m| m.status == MutationStatus::Pending)
        .filter(|m| heads.get(&(m.table, m.entity_id.clone())) == Some(&(m.enqueued_at, m.id)))
        .collect()
}

// ── Transactional helpers shared with the sync manager ──

/// Queues `incoming` inside an open transaction, applying the coalescing
/// rules. Expects the optimistic record write to have happened already in
/// the same transaction.
pub(crate) fn enqueue_in(txn: &StoreTxn<'_>, incoming: PendingMutation) -> StorageResult<MutationId> {
    let queued = txn
        .mutations_for_entity(incoming.table, &incoming.entity_id)?
        .into_iter()
        .rfind(|m| m.status == MutationStatus::Pending);

    let Some(prev) = queued else {
        txn.put_mutation(&incoming)?;
        return Ok(incoming.id);
    };

    let full_payload = || -> StorageResult<Option<Value>> {
        Ok(txn
            .get(incoming.table, &incoming.entity_id)?
            .filter(|r| !r.deleted)
            .map(|r| r.payload)
            .or_else(|| incoming.payload.clone()))
    };

    let (operation, payload) = match (prev.operation, incoming.operation) {
        (_, Operation::Delete) => (Operation::Delete, None),
        (Operation::Delete, _) => {
            let op = if prev.base_version.is_some() {
                Operation::Update
            } else {
                Operation::Create
            };
            (op, full_payload()?)
        }
        (Operation::Create, Operation::Create) => (Operation::Create, incoming.payload.clone()),
        (Operation::Create, Operation::Update) => {
            (Operation::Create, merge_payloads(prev.payload.as_ref(), incoming.payload.as_ref()))
        }
        (Operation::Update, _) => {
            (Operation::Update, merge_payloads(prev.payload.as_ref(), incoming.payload.as_ref()))
        }
    };

    let merged = PendingMutation {
        operation,
        payload,
        priority: prev.priority.max(incoming.priority),
        ..prev
    };
    debug!(
        "coalesced {} on {}/{} into queued mutation {}",
        incoming.operation, merged.table, merged.entity_id, merged.id
    );
    txn.put_mutation(&merged)?;
    Ok(merged.id)
}

pub(crate) fn mark_conflict_in(txn: &StoreTxn<'_>, id: &MutationId) -> StorageResult<bool> {
    let Some(mut m) = txn.get_mutation(id)? else {
        return Ok(false);
    };
    if m.status != MutationStatus::InFlight {
        return Ok(false);
    }
    m.status = MutationStatus::Conflict;
    txn.put_mutation(&m)?;
    set_record_status(txn, m.table, &m.entity_id, SyncStatus::Conflict)?;
    Ok(true)
}

/// Updates a record's sync status if the record exists and differs.
pub(crate) fn set_record_status(
    txn: &StoreTxn<'_>,
    table: TableName,
    id: &EntityId,
    status: SyncStatus,
) -> StorageResult<()> {
    if let Some(mut record) = txn.get(table, id)?
        && record.sync_status != status
    {
        record.sync_status = status;
        txn.put(&record)?;
    }
    Ok(())
}

fn merge_payloads(earlier: Option<&Value>, later: Option<&Value>) -> Option<Value> {
    match (earlier, later) {
        (Some(a), Some(b)) => Some(merge_patch(a, b)),
        (a, b) => b.or(a).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_payloads_keeps_later_fields() {
        let merged = merge_payloads(Some(&json!({"a": 1, "b": 1})), Some(&json!({"b": 2})));
        assert_eq!(merged, Some(json!({"a": 1, "b": 2})));
        assert_eq!(merge_payloads(None, Some(&json!({"a": 1}))), Some(json!({"a": 1})));
        assert_eq!(merge_payloads(Some(&json!({"a": 1})), None), Some(json!({"a": 1})));
    }
}
