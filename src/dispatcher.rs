// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-worker statement dispatcher.
//!
//! The dispatcher owns exactly one background worker. Callers submit
//! [`QueryRequest`]s without blocking; the worker executes them serially
//! against their providers and parks each completed [`QueryOutcome`] in a
//! result buffer. The consumer side calls [`drain`](Dispatcher::drain) —
//! always from the task that owns domain-object state — to take the buffer
//! and run the success/error callback of each outcome.
//!
//! Guarantees:
//! - requests execute in submission order (pure FIFO);
//! - outcomes are delivered exactly once, in completion order;
//! - the provider call is the only await and runs with no lock held, so a
//!   slow statement never blocks submission;
//! - cancelling an owner waits for at most the one in-flight call, and no
//!   outcome for a cancelled owner is delivered after cancellation returns.
//!
//! There is no per-statement timeout: a hung backend call stalls the whole
//! dispatcher.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::provider::{Provider, QueryResult};
use crate::query::Statement;
use crate::record::SerializedRecord;

/// Error message attached to outcomes whose provider was removed while the
/// request was still pending.
pub const GOING_AWAY: &str = "SQL interface is going away";

/// Tag identifying the logical owner of submitted requests; used for
/// filtered cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

impl OwnerId {
    /// Allocate a process-unique owner tag.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        OwnerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Consumer-side callback pair for one request's outcome.
///
/// Invoked from [`Dispatcher::drain`] on the draining task, never from the
/// worker.
pub trait QuerySink: Send + Sync {
    fn on_result(&self, result: QueryResult);
    fn on_error(&self, result: QueryResult);
}

/// What the worker should run for one request.
#[derive(Clone)]
pub enum Work {
    /// Execute one prepared statement.
    Execute(Statement),
    /// Reconcile schema for the record, then upsert it (runs on the worker
    /// so discovery, DDL and the write share the serialized connection).
    Persist {
        table: String,
        id: u64,
        record: SerializedRecord,
    },
}

impl Work {
    fn describe(&self) -> String {
        match self {
            Work::Execute(statement) => statement.text.clone(),
            Work::Persist { table, id, .. } => format!("persist {} id={}", table, id),
        }
    }
}

/// An asynchronous execution request.
pub struct QueryRequest {
    pub owner: OwnerId,
    pub provider: Arc<dyn Provider>,
    pub work: Work,
    pub sink: Option<Arc<dyn QuerySink>>,
}

impl QueryRequest {
    #[must_use]
    pub fn execute(owner: OwnerId, provider: Arc<dyn Provider>, statement: Statement) -> Self {
        Self {
            owner,
            provider,
            work: Work::Execute(statement),
            sink: None,
        }
    }

    #[must_use]
    pub fn persist(
        owner: OwnerId,
        provider: Arc<dyn Provider>,
        table: impl Into<String>,
        id: u64,
        record: SerializedRecord,
    ) -> Self {
        Self {
            owner,
            provider,
            work: Work::Persist {
                table: table.into(),
                id,
                record,
            },
            sink: None,
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn QuerySink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// A completed request: the original sink paired with its result.
struct QueryOutcome {
    sink: Arc<dyn QuerySink>,
    result: QueryResult,
}

struct Queued {
    seq: u64,
    request: QueryRequest,
}

#[derive(Clone)]
struct Executing {
    seq: u64,
    owner: OwnerId,
    provider: String,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Queued>,
    outcomes: Vec<QueryOutcome>,
    executing: Option<Executing>,
    stopping: bool,
    next_seq: u64,
}

struct Inner {
    state: Mutex<State>,
    /// Wakes the worker when requests arrive or shutdown begins.
    work: Notify,
    /// Wakes the consumer when outcomes are waiting.
    results: Notify,
    /// Bumped after every completed execution; cancellation and quiescence
    /// wait on it.
    completed: watch::Sender<u64>,
}

/// Owns the worker task and the FIFO/result-buffer pair.
pub struct Dispatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the worker. Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn() -> Arc<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            work: Notify::new(),
            results: Notify::new(),
            completed: watch::channel(0).0,
        });
        let handle = tokio::spawn(worker_loop(inner.clone()));
        Arc::new(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Append a request to the FIFO and wake the worker. Non-blocking.
    pub fn submit(&self, request: QueryRequest) -> Result<(), SyncError> {
        {
            let mut state = self.inner.state.lock();
            if state.stopping {
                return Err(SyncError::Cancelled(
                    "dispatcher is shutting down".to_string(),
                ));
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.queue.push_back(Queued { seq, request });
        }
        self.inner.work.notify_one();
        Ok(())
    }

    /// Remove every pending request tagged with `owner`.
    ///
    /// When a request of that owner is currently executing, waits for that
    /// single call to finish (its outcome is discarded), so no outcome for
    /// the owner can be delivered after this returns.
    pub async fn cancel_owner(&self, owner: OwnerId) {
        let mut rx = self.inner.completed.subscribe();
        {
            let mut state = self.inner.state.lock();
            let before = state.queue.len();
            state.queue.retain(|q| q.request.owner != owner);
            let removed = before - state.queue.len();
            if removed > 0 {
                debug!(%owner, removed, "cancelled pending requests");
            }
        }
        loop {
            {
                let state = self.inner.state.lock();
                let busy = state
                    .executing
                    .as_ref()
                    .is_some_and(|e| e.owner == owner);
                if !busy {
                    break;
                }
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Fail every pending request targeting the named provider with an
    /// explicit going-away error, and wait out any in-flight call on it.
    pub async fn remove_provider(&self, name: &str) {
        let mut rx = self.inner.completed.subscribe();
        let failed = {
            let mut state = self.inner.state.lock();
            let mut kept = VecDeque::with_capacity(state.queue.len());
            let mut failed = 0usize;
            let drained: VecDeque<_> = std::mem::take(&mut state.queue);
            for queued in drained {
                if queued.request.provider.name() == name {
                    failed += 1;
                    if let Some(sink) = queued.request.sink {
                        state.outcomes.push(QueryOutcome {
                            sink,
                            result: QueryResult::failure(
                                queued.request.work.describe(),
                                GOING_AWAY,
                            ),
                        });
                    }
                } else {
                    kept.push_back(queued);
                }
            }
            state.queue = kept;
            failed
        };
        if failed > 0 {
            warn!(provider = name, failed, "provider removed with pending requests");
            self.inner.results.notify_one();
        }
        loop {
            {
                let state = self.inner.state.lock();
                let busy = state
                    .executing
                    .as_ref()
                    .is_some_and(|e| e.provider == name);
                if !busy {
                    break;
                }
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Take the result buffer and run each outcome's callback.
    ///
    /// Must be called from the task that owns domain-object state; the
    /// worker never runs callbacks. Returns the number of outcomes
    /// delivered.
    pub fn drain(&self) -> usize {
        let outcomes = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.outcomes)
        };
        let count = outcomes.len();
        for outcome in outcomes {
            if outcome.result.is_ok() {
                outcome.sink.on_result(outcome.result);
            } else {
                outcome.sink.on_error(outcome.result);
            }
        }
        count
    }

    /// Resolves when outcomes are waiting to be drained.
    pub async fn results_ready(&self) {
        self.inner.results.notified().await;
    }

    /// Wait until the FIFO is empty and nothing is executing.
    pub async fn quiesce(&self) {
        let mut rx = self.inner.completed.subscribe();
        loop {
            {
                let state = self.inner.state.lock();
                if state.stopping || (state.queue.is_empty() && state.executing.is_none()) {
                    break;
                }
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// (pending requests, undrained outcomes)
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (state.queue.len(), state.outcomes.len())
    }

    /// Owner of the request currently executing, if any.
    #[must_use]
    pub fn in_flight(&self) -> Option<OwnerId> {
        self.inner.state.lock().executing.as_ref().map(|e| e.owner)
    }

    /// Stop intake, let in-flight work finish, join the worker.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopping = true;
        }
        self.inner.work.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("dispatcher worker joined");
    }
}

enum Step {
    Run {
        seq: u64,
        provider: Arc<dyn Provider>,
        work: Work,
    },
    Idle,
    Stop,
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        let step = {
            let mut state = inner.state.lock();
            if state.stopping {
                Step::Stop
            } else if let Some(front) = state.queue.front() {
                let seq = front.seq;
                let owner = front.request.owner;
                let provider = front.request.provider.clone();
                let work = front.request.work.clone();
                state.executing = Some(Executing {
                    seq,
                    owner,
                    provider: provider.name().to_string(),
                });
                Step::Run {
                    seq,
                    provider,
                    work,
                }
            } else {
                if !state.outcomes.is_empty() {
                    inner.results.notify_one();
                }
                Step::Idle
            }
        };

        match step {
            Step::Stop => break,
            Step::Idle => inner.work.notified().await,
            Step::Run {
                seq,
                provider,
                work,
            } => {
                // The only blocking step, entered with no lock held.
                let result = match &work {
                    Work::Execute(statement) => provider.execute(statement).await,
                    Work::Persist { table, id, record } => {
                        provider.persist(table, *id, record).await
                    }
                };

                if let Some(ref error) = result.error {
                    debug!(statement = %result.statement, error = %error, "statement failed");
                }

                let deliver = {
                    let mut state = inner.state.lock();
                    state.executing = None;
                    // Cancellation may have removed the front while the call
                    // was in flight; its outcome is discarded.
                    match state.queue.pop_front() {
                        Some(queued) if queued.seq == seq => {
                            if let Some(sink) = queued.request.sink {
                                state.outcomes.push(QueryOutcome { sink, result });
                                true
                            } else {
                                false
                            }
                        }
                        Some(other) => {
                            // The front now belongs to a later request.
                            state.queue.push_front(other);
                            debug!(seq, "dropping outcome of cancelled request");
                            false
                        }
                        None => {
                            debug!(seq, "dropping outcome of cancelled request");
                            false
                        }
                    }
                };

                if deliver {
                    inner.results.notify_one();
                }
                inner.completed.send_modify(|n| *n += 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{build_delete, Dialect};
    use crate::schema::SchemaCache;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct StubProvider {
        name: String,
        schema: SchemaCache,
        gate: Arc<Semaphore>,
        log: Mutex<Vec<String>>,
        fail: bool,
    }

    impl StubProvider {
        fn open(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                schema: SchemaCache::new(),
                gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
                log: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        /// Provider whose executions block until permits are released.
        fn gated(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                schema: SchemaCache::new(),
                gate: Arc::new(Semaphore::new(0)),
                log: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                schema: SchemaCache::new(),
                gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
                log: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn release(&self, permits: usize) {
            self.gate.add_permits(permits);
        }

        fn executed(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn connect(&self) -> Result<(), SyncError> {
            Ok(())
        }

        async fn check_connection(&self) -> bool {
            true
        }

        async fn execute(&self, statement: &Statement) -> QueryResult {
            self.gate.acquire().await.expect("gate open").forget();
            self.log.lock().push(statement.text.clone());
            if self.fail {
                QueryResult::failure(statement.text.clone(), "stub failure")
            } else {
                QueryResult::ok(statement.text.clone())
            }
        }

        async fn discover_columns(&self, _table: &str) -> Vec<String> {
            Vec::new()
        }

        fn schema(&self) -> &SchemaCache {
            &self.schema
        }

        fn time_expr(&self, unix: i64) -> String {
            unix.to_string()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        results: Mutex<Vec<QueryResult>>,
        errors: Mutex<Vec<QueryResult>>,
    }

    impl QuerySink for RecordingSink {
        fn on_result(&self, result: QueryResult) {
            self.results.lock().push(result);
        }

        fn on_error(&self, result: QueryResult) {
            self.errors.lock().push(result);
        }
    }

    fn delete_request(owner: OwnerId, provider: Arc<StubProvider>, id: u64) -> QueryRequest {
        QueryRequest::execute(
            owner,
            provider,
            build_delete(Dialect::Sqlite, "accounts", id),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_fifo_execution_order() {
        let dispatcher = Dispatcher::spawn();
        let provider = StubProvider::open("stub/main");
        let owner = OwnerId::next();

        for id in 1..=3 {
            dispatcher
                .submit(delete_request(owner, provider.clone(), id))
                .unwrap();
        }
        dispatcher.quiesce().await;

        let executed = provider.executed();
        assert_eq!(executed.len(), 3);
        assert!(executed[0].contains("= 1"));
        assert!(executed[1].contains("= 2"));
        assert!(executed[2].contains("= 3"));
    }

    #[tokio::test]
    async fn test_cancel_owner_keeps_other_owners_in_order() {
        let dispatcher = Dispatcher::spawn();
        let provider = StubProvider::gated("stub/main");
        let owner_a = OwnerId::next();
        let owner_b = OwnerId::next();
        let blocker = OwnerId::next();

        // A blocker request occupies the worker so that none of A's or B's
        // requests are executing when the cancel lands.
        dispatcher
            .submit(delete_request(blocker, provider.clone(), 100))
            .unwrap();
        wait_until(|| dispatcher.in_flight() == Some(blocker)).await;

        for id in 1..=3 {
            dispatcher
                .submit(delete_request(owner_a, provider.clone(), id))
                .unwrap();
        }
        for id in 10..=11 {
            dispatcher
                .submit(delete_request(owner_b, provider.clone(), id))
                .unwrap();
        }

        dispatcher.cancel_owner(owner_a).await;
        let (queued, _) = dispatcher.stats();
        assert_eq!(queued, 3); // blocker + B's two

        provider.release(Semaphore::MAX_PERMITS);
        dispatcher.quiesce().await;

        let executed = provider.executed();
        assert_eq!(executed.len(), 3);
        assert!(executed[0].contains("= 100"));
        assert!(executed[1].contains("= 10"));
        assert!(executed[2].contains("= 11"));
    }

    #[tokio::test]
    async fn test_cancel_owner_waits_for_in_flight_call() {
        let dispatcher = Dispatcher::spawn();
        let provider = StubProvider::gated("stub/main");
        let owner = OwnerId::next();
        let sink = Arc::new(RecordingSink::default());

        dispatcher
            .submit(delete_request(owner, provider.clone(), 1).with_sink(sink.clone()))
            .unwrap();
        wait_until(|| dispatcher.in_flight() == Some(owner)).await;

        let cancel = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.cancel_owner(owner).await })
        };
        // The in-flight call has not finished; cancellation must still be
        // blocked on it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cancel.is_finished());

        provider.release(1);
        cancel.await.unwrap();

        // The cancelled request's outcome was discarded.
        dispatcher.quiesce().await;
        assert_eq!(dispatcher.drain(), 0);
        assert!(sink.results.lock().is_empty());
        assert!(sink.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_outcomes_delivered_exactly_once() {
        let dispatcher = Dispatcher::spawn();
        let provider = StubProvider::open("stub/main");
        let owner = OwnerId::next();
        let sink = Arc::new(RecordingSink::default());

        dispatcher
            .submit(delete_request(owner, provider.clone(), 1).with_sink(sink.clone()))
            .unwrap();
        dispatcher.quiesce().await;

        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(sink.results.lock().len(), 1);
        assert_eq!(dispatcher.drain(), 0);
        assert_eq!(sink.results.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_results_routed_to_on_error() {
        let dispatcher = Dispatcher::spawn();
        let provider = StubProvider::failing("stub/main");
        let owner = OwnerId::next();
        let sink = Arc::new(RecordingSink::default());

        dispatcher
            .submit(delete_request(owner, provider, 1).with_sink(sink.clone()))
            .unwrap();
        dispatcher.quiesce().await;
        dispatcher.drain();

        assert!(sink.results.lock().is_empty());
        let errors = sink.errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.as_deref(), Some("stub failure"));
    }

    #[tokio::test]
    async fn test_remove_provider_fails_pending_requests() {
        let dispatcher = Dispatcher::spawn();
        let blocker_provider = StubProvider::gated("stub/blocker");
        let doomed_provider = StubProvider::open("stub/doomed");
        let owner = OwnerId::next();
        let sink = Arc::new(RecordingSink::default());

        dispatcher
            .submit(delete_request(owner, blocker_provider.clone(), 1))
            .unwrap();
        wait_until(|| dispatcher.in_flight().is_some()).await;
        dispatcher
            .submit(delete_request(owner, doomed_provider.clone(), 2).with_sink(sink.clone()))
            .unwrap();

        dispatcher.remove_provider("stub/doomed").await;
        dispatcher.drain();

        let errors = sink.errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.as_deref(), Some(GOING_AWAY));
        drop(errors);

        // The doomed request never reaches its provider.
        blocker_provider.release(Semaphore::MAX_PERMITS);
        dispatcher.quiesce().await;
        assert!(doomed_provider.executed().is_empty());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let dispatcher = Dispatcher::spawn();
        let provider = StubProvider::open("stub/main");

        dispatcher.shutdown().await;

        let err = dispatcher
            .submit(delete_request(OwnerId::next(), provider, 1))
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled(_)));
    }
}
