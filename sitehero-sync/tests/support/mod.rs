//! Shared test helpers: a scripted in-process remote and a manual clock.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use sitehero_storage::LocalStore;
use sitehero_sync::{
    AppliedItem, BatchRequest, BatchResponse, Clock, RemoteError, RemoteService, SyncConfig,
    SyncManager,
};
use sitehero_types::{EntityId, Operation};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Wall clock the test moves by hand.
#[derive(Clone)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start)))
    }

    pub fn clock(&self) -> Clock {
        let inner = self.0.clone();
        Arc::new(move || inner.load(Ordering::SeqCst))
    }

    pub fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn advance_secs(&self, secs: i64) {
        self.0.fetch_add(secs * 1_000, Ordering::SeqCst);
    }
}

/// What the mock remote does with the next request.
pub enum Reply {
    Respond(Result<BatchResponse, RemoteError>),
    /// Apply everything, like a healthy server.
    AcceptAll,
    /// Never answer.
    Hang,
}

/// Remote service that records requests and answers from a script.
/// Once the script runs out it accepts everything.
#[derive(Default)]
pub struct MockRemote {
    requests: Mutex<Vec<BatchRequest>>,
    script: Mutex<VecDeque<Reply>>,
    versions: Mutex<HashMap<EntityId, u64>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<BatchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Seeds the server-side version counter for an entity.
    pub fn set_version(&self, id: &str, version: u64) {
        self.versions.lock().unwrap().insert(EntityId::from(id), version);
    }

    /// Applies every operation. Creates come back with a server-stamped
    /// canonical payload; updates and deletes with a bare version.
    fn accept_all(&self, request: &BatchRequest) -> BatchResponse {
        let mut versions = self.versions.lock().unwrap();
        let applied = request
            .operations
            .iter()
            .map(|op| {
                let version = versions.entry(op.id.clone()).or_insert(0);
                *version += 1;
                let payload = match op.op {
                    Operation::Create => op.payload.as_ref().map(canonical),
                    Operation::Update | Operation::Delete => None,
                };
                AppliedItem {
                    id: op.id.clone(),
                    version: Some(*version),
                    payload,
                }
            })
            .collect();
        BatchResponse {
            applied,
            ..BatchResponse::default()
        }
    }
}

/// What the mock server stores for a created payload.
pub fn canonical(payload: &Value) -> Value {
    let mut value = payload.clone();
    if let Some(fields) = value.as_object_mut() {
        fields.insert("server_stamped".into(), json!(true));
    }
    value
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn send_batch(&self, request: &BatchRequest) -> Result<BatchResponse, RemoteError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::AcceptAll);
        match reply {
            Reply::Respond(result) => result,
            Reply::AcceptAll => Ok(self.accept_all(request)),
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// A manager over an in-memory store, driven by a manual clock.
pub fn manager_with(remote: Arc<MockRemote>, config: SyncConfig) -> (Arc<SyncManager>, ManualClock) {
    let clock = ManualClock::new(1_000_000);
    let store = LocalStore::open_in_memory().unwrap();
    let manager = SyncManager::with_clock(config, store, remote, clock.clock()).unwrap();
    (Arc::new(manager), clock)
}

pub fn manager(remote: Arc<MockRemote>) -> (Arc<SyncManager>, ManualClock) {
    manager_with(remote, SyncConfig::test())
}
