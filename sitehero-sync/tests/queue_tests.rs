mod support;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{Value, json};
use sitehero_storage::LocalStore;
use sitehero_sync::{BandwidthMonitor, RequeueOutcome, SyncConfig, SyncQueue};
use sitehero_types::*;
use support::{ManualClock, MockRemote};

fn queue() -> (SyncQueue, ManualClock) {
    queue_with(SyncConfig::test())
}

fn queue_with(config: SyncConfig) -> (SyncQueue, ManualClock) {
    let clock = ManualClock::new(1_000_000);
    let store = LocalStore::open_in_memory().unwrap();
    (SyncQueue::new(store, &config).with_clock(clock.clock()), clock)
}

fn mutation(table: TableName, id: &str, op: Operation, payload: Option<Value>, at: i64) -> PendingMutation {
    PendingMutation::new(table, id.into(), op, payload, None, at)
}

// ── Ordering ─────────────────────────────────────────────────────

#[test]
fn higher_priority_table_dequeues_first() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Contacts, "c1", Operation::Create, Some(json!({"name": "Ana"})), clock.now()))
        .unwrap();
    q.enqueue(mutation(TableName::Projects, "p1", Operation::Create, Some(json!({"name": "Tower"})), clock.now() + 1))
        .unwrap();

    let batch = q.dequeue_batch(10, None).unwrap();
    let order: Vec<TableName> = batch.iter().map(|m| m.table).collect();
    assert_eq!(order, vec![TableName::Projects, TableName::Contacts]);
}

#[test]
fn same_priority_is_fifo() {
    let (q, clock) = queue();
    for (i, id) in ["t1", "t2", "t3"].iter().enumerate() {
        q.enqueue(mutation(TableName::Tasks, id, Operation::Create, Some(json!({})), clock.now() + i as i64))
            .unwrap();
    }
    let ids: Vec<String> = q
        .dequeue_batch(10, None)
        .unwrap()
        .into_iter()
        .map(|m| m.entity_id.0)
        .collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
}

#[test]
fn priority_override_wins_over_table_rank() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Projects, "p1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();
    q.enqueue(
        mutation(TableName::Contacts, "c1", Operation::Create, Some(json!({})), clock.now()).with_priority(500),
    )
    .unwrap();
    let first = q.dequeue_batch(1, None).unwrap();
    assert_eq!(first[0].entity_id.as_str(), "c1");
}

#[test]
fn batch_size_follows_link_quality() {
    let (q, clock) = queue();
    for i in 0..60 {
        q.enqueue(mutation(TableName::Tasks, &format!("t{i}"), Operation::Create, Some(json!({})), clock.now() + i))
            .unwrap();
    }
    let monitor = BandwidthMonitor::new(&SyncConfig::default());

    let poor = q.dequeue_batch(monitor.batch_size(NetworkQuality::Poor), None).unwrap();
    assert_eq!(poor.len(), 1);

    let excellent = q
        .dequeue_batch(monitor.batch_size(NetworkQuality::Excellent), None)
        .unwrap();
    assert_eq!(excellent.len(), 50);
}

#[test]
fn table_filter_limits_dequeue() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Projects, "p1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();
    q.enqueue(mutation(TableName::Contacts, "c1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();
    let batch = q.dequeue_batch(10, Some(TableName::Contacts)).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].table, TableName::Contacts);
}

#[test]
fn dequeue_marks_in_flight_and_leases_once() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();
    let batch = q.dequeue_batch(10, None).unwrap();
    assert_eq!(batch[0].status, MutationStatus::InFlight);
    assert!(q.dequeue_batch(10, None).unwrap().is_empty());
    // Still persisted until settled.
    assert_eq!(q.pending_count().unwrap(), 1);
    assert!(q.ack(&batch[0].id).unwrap());
    assert_eq!(q.pending_count().unwrap(), 0);
    assert!(!q.ack(&batch[0].id).unwrap());
}

// ── Coalescing ───────────────────────────────────────────────────

#[test]
fn update_on_queued_create_stays_create() {
    let (q, clock) = queue();
    let first = q
        .enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({"title": "Rebar", "done": false})), clock.now()))
        .unwrap();
    let second = q
        .enqueue(mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"done": true})), clock.now() + 50))
        .unwrap();
    assert_eq!(first, second);

    let all = q.list(None).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].operation, Operation::Create);
    assert_eq!(all[0].payload, Some(json!({"title": "Rebar", "done": true})));
    assert_eq!(all[0].enqueued_at, clock.now());
}

#[test]
fn updates_merge_and_keep_base_version() {
    let (q, clock) = queue();
    let mut first = mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"a": 1, "b": 1})), clock.now());
    first.base_version = Some(7);
    q.enqueue(first).unwrap();
    let mut second = mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"b": 2, "c": 3})), clock.now() + 5);
    second.base_version = Some(9);
    q.enqueue(second.with_priority(120)).unwrap();

    let all = q.list(None).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].operation, Operation::Update);
    assert_eq!(all[0].payload, Some(json!({"a": 1, "b": 2, "c": 3})));
    assert_eq!(all[0].base_version, Some(7));
    assert_eq!(all[0].priority, 120);
}

#[test]
fn delete_supersedes_queued_edits() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({"a": 1})), clock.now()))
        .unwrap();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"a": 2})), clock.now() + 1))
        .unwrap();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Delete, None, clock.now() + 2))
        .unwrap();

    let all = q.list(None).unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].is_tombstone());
    assert_eq!(all[0].payload, None);
}

#[test]
fn edit_after_tombstone_becomes_update_when_server_has_entity() {
    let (q, clock) = queue();
    let mut delete = mutation(TableName::Tasks, "t1", Operation::Delete, None, clock.now());
    delete.base_version = Some(3);
    q.enqueue(delete).unwrap();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({"title": "again"})), clock.now() + 1))
        .unwrap();

    let all = q.list(None).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].operation, Operation::Update);
    assert_eq!(all[0].payload, Some(json!({"title": "again"})));
    assert_eq!(all[0].base_version, Some(3));
}

#[test]
fn edit_after_tombstone_becomes_create_when_server_never_had_it() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Delete, None, clock.now()))
        .unwrap();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"x": 1})), clock.now() + 1))
        .unwrap();
    let all = q.list(None).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].operation, Operation::Create);
}

#[test]
fn mutation_behind_in_flight_waits_its_turn() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({"a": 1})), clock.now()))
        .unwrap();
    let leased = q.dequeue_batch(10, None).unwrap();

    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"a": 2})), clock.now() + 1))
        .unwrap();
    assert_eq!(q.list(None).unwrap().len(), 2);
    assert!(q.dequeue_batch(10, None).unwrap().is_empty());

    q.ack(&leased[0].id).unwrap();
    let next = q.dequeue_batch(10, None).unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].operation, Operation::Update);
}

#[test]
fn failed_mutation_blocks_later_edits() {
    let (q, clock) = queue();
    let create = q
        .enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();
    let leased = q.dequeue_batch(10, None).unwrap();
    q.mark_failed(&leased[0].id, "title required").unwrap();

    let update = q
        .enqueue(mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"title": "x"})), clock.now() + 1))
        .unwrap();
    assert_ne!(create, update);
    assert!(q.dequeue_batch(10, None).unwrap().is_empty());
    assert!(!q.has_eligible().unwrap());
    assert_eq!(q.next_attempt_at().unwrap(), None);

    // Edits made while blocked join the mutation already waiting.
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"crew": 2})), clock.now() + 2))
        .unwrap();
    assert_eq!(q.list(None).unwrap().len(), 2);

    assert!(q.retry_failed(&create).unwrap());
    let first = q.dequeue_batch(10, None).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, create);
    q.ack(&create).unwrap();

    let second = q.dequeue_batch(10, None).unwrap();
    assert_eq!(second[0].id, update);
    assert_eq!(second[0].payload, Some(json!({"title": "x", "crew": 2})));
}

#[test]
fn discarding_failed_head_releases_the_entity() {
    let (q, clock) = queue();
    let create = q
        .enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();
    let leased = q.dequeue_batch(10, None).unwrap();
    q.mark_failed(&leased[0].id, "title required").unwrap();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"title": "x"})), clock.now() + 1))
        .unwrap();

    assert!(q.discard_failed(&create).unwrap());
    assert_eq!(q.dequeue_batch(10, None).unwrap().len(), 1);
}

#[test]
fn concurrent_edits_survive_leasing() {
    const EDITS: i64 = 200;
    let (q, _clock) = queue();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"n": 0})), 0))
        .unwrap();

    std::thread::scope(|s| {
        let editor = q.clone();
        s.spawn(move || {
            for n in 1..=EDITS {
                editor
                    .enqueue(mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({"n": n})), n))
                    .unwrap();
            }
        });
        let sender = q.clone();
        s.spawn(move || {
            for _ in 0..EDITS {
                for m in sender.dequeue_batch(1, None).unwrap() {
                    assert!(sender.requeue_without_penalty(&m.id).unwrap());
                }
            }
        });
    });

    let queued = q.store().mutations_for_entity(TableName::Tasks, &"t1".into()).unwrap();
    assert!(queued.iter().all(|m| m.status == MutationStatus::Pending));
    let folded = queued
        .iter()
        .filter_map(|m| m.payload.as_ref())
        .fold(json!({}), |acc, p| merge_patch(&acc, p));
    assert_eq!(folded, json!({"n": EDITS}));
}

#[test]
fn queue_write_failures_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let q = SyncQueue::new(LocalStore::open(&path).unwrap(), &SyncConfig::test());
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({})), 0))
        .unwrap();
    assert_eq!(q.quota().error_count(), 0);

    // A second connection makes every mutation update fail.
    let other = rusqlite::Connection::open(&path).unwrap();
    other
        .execute_batch(
            "CREATE TRIGGER unplugged BEFORE UPDATE ON pending_mutations
             BEGIN SELECT RAISE(ABORT, 'disk unplugged'); END;",
        )
        .unwrap();

    assert!(q.dequeue_batch(10, None).is_err());
    assert_eq!(q.quota().error_count(), 1);
    assert!(q.quota().last_error().unwrap().contains("disk unplugged"));
    assert_eq!(q.list(None).unwrap()[0].status, MutationStatus::Pending);

    other.execute_batch("DROP TRIGGER unplugged;").unwrap();
    assert_eq!(q.dequeue_batch(10, None).unwrap().len(), 1);
    assert_eq!(q.quota().error_count(), 1);
}

// ── Retry ────────────────────────────────────────────────────────

#[test]
fn transient_failures_follow_backoff_schedule() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();

    let mut delays = Vec::new();
    for _ in 0..6 {
        let leased = q.dequeue_batch(1, None).unwrap();
        assert_eq!(leased.len(), 1, "mutation should be eligible again");
        let failed_at = clock.now();
        match q.requeue_transient(&leased[0].id, "503").unwrap() {
            RequeueOutcome::Retrying { next_attempt_at, .. } => {
                delays.push((next_attempt_at - failed_at) / 1_000);
                // Not eligible a second early.
                clock.advance_secs((next_attempt_at - failed_at) / 1_000 - 1);
                assert!(q.dequeue_batch(1, None).unwrap().is_empty());
                clock.advance_secs(1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(delays, vec![5, 15, 30, 60, 300, 300]);
}

#[test]
fn retry_ceiling_marks_failed() {
    let (q, clock) = queue_with(SyncConfig {
        max_transient_retries: 2,
        ..SyncConfig::test()
    });
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();

    let mut last = RequeueOutcome::Skipped;
    for _ in 0..3 {
        let leased = q.dequeue_batch(1, None).unwrap();
        last = q.requeue_transient(&leased[0].id, "timeout").unwrap();
        clock.advance_secs(600);
    }
    assert_eq!(last, RequeueOutcome::Failed);
    let failed = q.list(Some(MutationStatus::Failed)).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].last_error.as_deref(), Some("timeout"));

    assert!(q.retry_failed(&failed[0].id).unwrap());
    let retried = q.get(&failed[0].id).unwrap().unwrap();
    assert_eq!(retried.status, MutationStatus::Pending);
    assert_eq!(retried.retry_count, 0);
}

#[test]
fn requeue_without_penalty_keeps_priority_and_count() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Projects, "p1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();
    let leased = q.dequeue_batch(1, None).unwrap();
    assert!(q.requeue_without_penalty(&leased[0].id).unwrap());

    let again = q.dequeue_batch(1, None).unwrap();
    assert_eq!(again[0].id, leased[0].id);
    assert_eq!(again[0].retry_count, 0);
    assert_eq!(again[0].priority, TableName::Projects.priority());
}

#[test]
fn settling_twice_is_a_no_op() {
    let (q, clock) = queue();
    q.enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({})), clock.now()))
        .unwrap();
    let leased = q.dequeue_batch(1, None).unwrap();
    assert!(matches!(
        q.requeue_transient(&leased[0].id, "x").unwrap(),
        RequeueOutcome::Retrying { .. }
    ));
    assert_eq!(q.requeue_transient(&leased[0].id, "x").unwrap(), RequeueOutcome::Skipped);
    assert!(!q.mark_failed(&leased[0].id, "x").unwrap());
}

#[test]
fn in_flight_mutations_revert_to_pending_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let config = SyncConfig::test();

    {
        let store = LocalStore::open(&path).unwrap();
        let q = SyncQueue::new(store, &config);
        q.enqueue(mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({})), 0))
            .unwrap();
        assert_eq!(q.dequeue_batch(1, None).unwrap().len(), 1);
    }

    let store = LocalStore::open(&path).unwrap();
    let q = SyncQueue::new(store, &config);
    let pending = q.list(Some(MutationStatus::Pending)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 0);
    assert_eq!(q.dequeue_batch(1, None).unwrap().len(), 1);
}

// ── Coalescing property ──────────────────────────────────────────

#[derive(Debug, Clone)]
enum Edit {
    Update(String, i64),
    Delete,
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (prop::sample::select(vec!["title", "status", "crew", "notes"]), 0i64..100)
            .prop_map(|(f, v)| Edit::Update(f.to_string(), v)),
        1 => Just(Edit::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any run of edits made before a send leaves exactly one queued
    /// mutation carrying the latest local state; a trailing delete wins.
    #[test]
    fn coalesced_queue_reflects_latest_state(edits in prop::collection::vec(edit(), 1..12)) {
        let (manager, _clock) = support::manager(MockRemote::new());
        manager
            .enqueue_mutation(TableName::Tasks, "t1", Operation::Create, Some(json!({"title": "start"})), None)
            .unwrap();

        let mut model: Option<serde_json::Map<String, Value>> =
            Some(json!({"title": "start"}).as_object().cloned().unwrap());
        for e in &edits {
            match e {
                Edit::Update(field, v) => {
                    manager
                        .enqueue_mutation(TableName::Tasks, "t1", Operation::Update, Some(json!({ field.as_str(): v })), None)
                        .unwrap();
                    model.get_or_insert_with(Default::default).insert(field.clone(), json!(v));
                }
                Edit::Delete => {
                    manager.enqueue_mutation(TableName::Tasks, "t1", Operation::Delete, None, None).unwrap();
                    model = None;
                }
            }
        }

        let queued = manager.queue().list(None).unwrap();
        prop_assert_eq!(queued.len(), 1);
        match model {
            None => prop_assert_eq!(queued[0].operation, Operation::Delete),
            Some(fields) => {
                prop_assert_ne!(queued[0].operation, Operation::Delete);
                let expected = Value::Object(fields);
                prop_assert_eq!(queued[0].payload.as_ref(), Some(&expected));
                let record = manager.store().peek(TableName::Tasks, &"t1".into()).unwrap().unwrap();
                prop_assert_eq!(record.payload, expected);
            }
        }
    }
}
