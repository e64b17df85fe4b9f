//! Drains the unanswered queue once connectivity returns.
//!
//! One worker task owns reconciliation. Triggers arrive from the
//! connectivity monitor; triggers that pile up while a batch runs are folded
//! into the next batch. A batch walks `list_pending()` in insertion order:
//!
//! - `Success`           → resolve + answer turn (one transaction), `QueryResolved`
//! - `ProviderError`     → attempts += 1; at the ceiling → failed + notice turn, `QueryFailed`
//! - `ConnectivityError` → stop the batch, leave this and later queries untouched
//!
//! A batch cancelled by shutdown commits nothing for the in-flight query.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::ai::{AiGateway, AnswerResult, LocalKnowledgeBase};
use crate::constants::COULD_NOT_ANSWER_TEXT;
use crate::models::QueuedQuery;
use crate::notifications::{CoreEvent, EventSink};
use crate::store::{Settlement, Store, StoreError};

/// Request to drain the queue. Carries no data; many triggers can collapse into one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileTrigger;

/// Why a batch stopped before reaching the end of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAbort {
    Connectivity,
    Storage,
}

/// What one batch did, in processing order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub resolved: Vec<i64>,
    pub failed: Vec<i64>,
    /// Provider errors below the ceiling; still pending.
    pub retried: Vec<i64>,
    pub aborted: Option<BatchAbort>,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.resolved.len() + self.failed.len() + self.retried.len()
    }
}

enum Step {
    Continue,
    Abort(BatchAbort),
}

pub struct ReconciliationWorker {
    store: Arc<Store>,
    gateway: Arc<dyn AiGateway>,
    knowledge: Option<Arc<LocalKnowledgeBase>>,
    events: EventSink,
    retry_ceiling: u32,
    timeout: Duration,
}

impl ReconciliationWorker {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn AiGateway>,
        events: EventSink,
        retry_ceiling: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            knowledge: None,
            events,
            retry_ceiling: retry_ceiling.max(1),
            timeout,
        }
    }

    /// Teach resolved answers to the local knowledge base.
    pub fn with_knowledge(mut self, knowledge: Arc<LocalKnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    /// Process every pending query once, oldest first.
    pub async fn run_batch(&self) -> BatchReport {
        let mut report = BatchReport::default();

        let pending = match self.store.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                self.storage_fault("list_pending", &e);
                report.aborted = Some(BatchAbort::Storage);
                return report;
            }
        };
        if pending.is_empty() {
            return report;
        }
        tracing::info!(count = pending.len(), "reconciling queued queries");

        for query in pending {
            if let Step::Abort(reason) = self.process(&query, &mut report).await {
                report.aborted = Some(reason);
                break;
            }
        }

        tracing::info!(
            resolved = report.resolved.len(),
            failed = report.failed.len(),
            retried = report.retried.len(),
            aborted = ?report.aborted,
            "reconciliation batch finished"
        );
        report
    }

    async fn process(&self, query: &QueuedQuery, report: &mut BatchReport) -> Step {
        match self.gateway.answer(&query.text, self.timeout).await {
            AnswerResult::Success(answer) => match self.store.resolve(query.id, &answer) {
                Ok(Settlement::Settled(_)) => {
                    if let Some(kb) = &self.knowledge {
                        if let Err(e) = kb.learn(&query.text, &answer) {
                            tracing::warn!(error = %e, "could not save learned answer");
                        }
                    }
                    self.events.emit(CoreEvent::QueryResolved {
                        id: query.id,
                        text: answer,
                    });
                    report.resolved.push(query.id);
                    Step::Continue
                }
                Ok(Settlement::AlreadySettled(status)) => {
                    tracing::debug!(id = query.id, %status, "query already settled, skipping");
                    Step::Continue
                }
                Err(e) => {
                    self.storage_fault("resolve", &e);
                    Step::Abort(BatchAbort::Storage)
                }
            },
            AnswerResult::ProviderError(reason) => {
                tracing::warn!(id = query.id, %reason, "provider could not answer queued query");
                let attempts = match self.store.record_attempt(query.id) {
                    Ok(attempts) => attempts,
                    Err(e) => {
                        self.storage_fault("record_attempt", &e);
                        return Step::Abort(BatchAbort::Storage);
                    }
                };
                if attempts < self.retry_ceiling {
                    report.retried.push(query.id);
                    return Step::Continue;
                }
                match self.store.mark_failed(query.id, COULD_NOT_ANSWER_TEXT) {
                    Ok(Settlement::Settled(_)) => {
                        self.events.emit(CoreEvent::QueryFailed { id: query.id });
                        report.failed.push(query.id);
                        Step::Continue
                    }
                    Ok(Settlement::AlreadySettled(_)) => Step::Continue,
                    Err(e) => {
                        self.storage_fault("mark_failed", &e);
                        Step::Abort(BatchAbort::Storage)
                    }
                }
            }
            AnswerResult::ConnectivityError => {
                tracing::info!(id = query.id, "lost connectivity mid-batch, stopping");
                Step::Abort(BatchAbort::Connectivity)
            }
        }
    }

    fn storage_fault(&self, operation: &'static str, error: &StoreError) {
        tracing::error!(operation, error = %error, "storage failure during reconciliation");
        self.events.storage_fault(operation, error);
    }

    /// Consume triggers until the channel closes or shutdown is signalled.
    pub async fn run(
        self,
        mut triggers: mpsc::UnboundedReceiver<ReconcileTrigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                    // Triggers that arrived meanwhile are covered by this batch
                    while triggers.try_recv().is_ok() {}
                    tokio::select! {
                        _ = self.run_batch() => {}
                        _ = shutdown.changed() => {
                            tracing::info!("shutdown during reconciliation, batch cancelled");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        tracing::debug!("reconciliation worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::ai::QaPair;
    use crate::models::{QueueStatus, Role, TurnSource};

    /// Replays scripted results; once exhausted, repeats `fallback`.
    struct ScriptedGateway {
        script: Mutex<VecDeque<AnswerResult>>,
        fallback: AnswerResult,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedGateway {
        fn new(script: Vec<AnswerResult>, fallback: AnswerResult) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AiGateway for ScriptedGateway {
        async fn answer(&self, text: &str, _timeout: Duration) -> AnswerResult {
            self.calls.lock().unwrap().push(text.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Answers every question by echoing it back.
    struct EchoGateway;

    #[async_trait]
    impl AiGateway for EchoGateway {
        async fn answer(&self, text: &str, _timeout: Duration) -> AnswerResult {
            AnswerResult::Success(format!("answer to {}", text))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    /// Never answers; used to hold a batch open.
    struct HangingGateway;

    #[async_trait]
    impl AiGateway for HangingGateway {
        async fn answer(&self, _text: &str, _timeout: Duration) -> AnswerResult {
            std::future::pending::<()>().await;
            AnswerResult::ConnectivityError
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("test.db")).unwrap());
        (dir, store)
    }

    fn worker(
        store: &Arc<Store>,
        gateway: Arc<dyn AiGateway>,
    ) -> (ReconciliationWorker, mpsc::UnboundedReceiver<CoreEvent>) {
        let (events, rx) = EventSink::channel();
        let worker =
            ReconciliationWorker::new(store.clone(), gateway, events, 3, Duration::from_secs(5));
        (worker, rx)
    }

    fn provider_error() -> AnswerResult {
        AnswerResult::ProviderError("500".to_string())
    }

    #[tokio::test]
    async fn resolves_in_fifo_order_exactly_once() {
        let (_dir, store) = setup();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let q = store
                .enqueue(&format!("question {}", i), t0 + ChronoDuration::minutes(i))
                .unwrap();
            ids.push(q.id);
        }
        let gateway = ScriptedGateway::new(
            Vec::new(),
            AnswerResult::Success("ok".to_string()),
        );
        let (worker, _rx) = worker(&store, gateway.clone());

        let report = worker.run_batch().await;
        assert_eq!(report.resolved, ids);
        assert_eq!(report.aborted, None);
        assert_eq!(
            gateway.calls(),
            (0..5).map(|i| format!("question {}", i)).collect::<Vec<_>>()
        );

        for (i, id) in ids.iter().enumerate() {
            let turns = store.turns_for_query(*id).unwrap();
            assert_eq!(turns.len(), 1);
            assert_eq!(turns[0].source, TurnSource::QueuedResolved);
            assert_eq!(turns[0].timestamp, t0 + ChronoDuration::minutes(i as i64));
        }

        // A second trigger has nothing left to do
        let again = worker.run_batch().await;
        assert_eq!(again.attempted(), 0);
        assert_eq!(gateway.calls().len(), 5);
    }

    #[tokio::test]
    async fn provider_errors_fail_after_exactly_ceiling_attempts() {
        let (_dir, store) = setup();
        let q = store.enqueue("why is my fan loud", Utc::now()).unwrap();
        let gateway = ScriptedGateway::new(Vec::new(), provider_error());
        let (worker, mut rx) = worker(&store, gateway.clone());

        for expected in 1..=2 {
            let report = worker.run_batch().await;
            assert_eq!(report.retried, vec![q.id]);
            let stored = store.get_query(q.id).unwrap().unwrap();
            assert_eq!(stored.status, QueueStatus::Pending);
            assert_eq!(stored.attempts, expected);
        }

        let report = worker.run_batch().await;
        assert_eq!(report.failed, vec![q.id]);
        let stored = store.get_query(q.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(stored.attempts, 3);

        let turns = store.turns_for_query(q.id).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, COULD_NOT_ANSWER_TEXT);
        assert_eq!(turns[0].role, Role::Assistant);
        assert_eq!(rx.try_recv().unwrap(), CoreEvent::QueryFailed { id: q.id });

        // Failed queries are not retried
        assert_eq!(worker.run_batch().await.attempted(), 0);
        assert_eq!(gateway.calls().len(), 3);
    }

    #[tokio::test]
    async fn connectivity_error_aborts_without_counting() {
        let (_dir, store) = setup();
        let a = store.enqueue("first", Utc::now()).unwrap();
        let b = store.enqueue("second", Utc::now()).unwrap();
        let c = store.enqueue("third", Utc::now()).unwrap();
        let gateway = ScriptedGateway::new(
            vec![
                AnswerResult::Success("answered".to_string()),
                AnswerResult::ConnectivityError,
            ],
            AnswerResult::Success("late".to_string()),
        );
        let (worker, _rx) = worker(&store, gateway.clone());

        let report = worker.run_batch().await;
        assert_eq!(report.resolved, vec![a.id]);
        assert_eq!(report.aborted, Some(BatchAbort::Connectivity));
        assert_eq!(gateway.calls(), vec!["first", "second"]);

        for id in [b.id, c.id] {
            let stored = store.get_query(id).unwrap().unwrap();
            assert_eq!(stored.status, QueueStatus::Pending);
            assert_eq!(stored.attempts, 0);
            assert!(store.turns_for_query(id).unwrap().is_empty());
        }

        // Next transition picks up where it stopped
        let report = worker.run_batch().await;
        assert_eq!(report.resolved, vec![b.id, c.id]);
    }

    #[tokio::test]
    async fn port_8080_question_resolves_after_reconnect() {
        let (_dir, store) = setup();
        let q = store.enqueue("is port 8080 open a risk?", Utc::now()).unwrap();
        assert_eq!(q.status, QueueStatus::Pending);
        assert_eq!(q.attempts, 0);

        let gateway = ScriptedGateway::new(
            vec![AnswerResult::Success(
                "Moderate risk, restrict externally".to_string(),
            )],
            provider_error(),
        );
        let (worker, mut rx) = worker(&store, gateway);
        worker.run_batch().await;

        let stored = store.get_query(q.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Resolved);
        let history = store.history(10).unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text, "Moderate risk, restrict externally");
        assert_eq!(
            rx.try_recv().unwrap(),
            CoreEvent::QueryResolved {
                id: q.id,
                text: "Moderate risk, restrict externally".to_string()
            }
        );
    }

    #[tokio::test]
    async fn mixed_outcomes_produce_one_turn_per_settled_query() {
        let (_dir, store) = setup();
        for i in 0..4 {
            store.enqueue(&format!("q{}", i), Utc::now()).unwrap();
        }
        let gateway = ScriptedGateway::new(
            vec![
                AnswerResult::Success("a0".to_string()),
                provider_error(),
                AnswerResult::Success("a2".to_string()),
                provider_error(),
            ],
            provider_error(),
        );
        let (worker, _rx) = worker(&store, gateway);
        let mut settled = 0;
        for _ in 0..3 {
            let report = worker.run_batch().await;
            settled += report.resolved.len() + report.failed.len();
        }
        assert_eq!(settled, 4);
        let turns = store.history(100).unwrap();
        assert_eq!(turns.len(), 4);
        assert!(store.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolved_answers_are_learned() {
        let (_dir, store) = setup();
        store.enqueue("is port 8080 open a risk", Utc::now()).unwrap();
        let kb = Arc::new(LocalKnowledgeBase::in_memory(Vec::<QaPair>::new()));
        let (worker, _rx) = worker(&store, Arc::new(EchoGateway));
        let worker = worker.with_knowledge(kb.clone());

        worker.run_batch().await;
        assert_eq!(
            kb.search("is port 8080 open a risk").as_deref(),
            Some("answer to is port 8080 open a risk")
        );
    }

    #[tokio::test]
    async fn run_collapses_duplicate_triggers() {
        let (_dir, store) = setup();
        for i in 0..3 {
            store.enqueue(&format!("q{}", i), Utc::now()).unwrap();
        }
        let gateway = ScriptedGateway::new(Vec::new(), AnswerResult::Success("ok".to_string()));
        let (worker, _rx) = worker(&store, gateway.clone());

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        for _ in 0..4 {
            trigger_tx.send(ReconcileTrigger).unwrap();
        }
        drop(trigger_tx);
        worker.run(trigger_rx, shutdown_rx).await;

        assert_eq!(gateway.calls().len(), 3);
        assert_eq!(store.history(10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn shutdown_cancels_batch_without_committing() {
        let (_dir, store) = setup();
        let q = store.enqueue("slow question", Utc::now()).unwrap();
        let (worker, _rx) = worker(&store, Arc::new(HangingGateway));

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(trigger_rx, shutdown_rx));
        trigger_tx.send(ReconcileTrigger).unwrap();
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let stored = store.get_query(q.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert!(store.turns_for_query(q.id).unwrap().is_empty());
    }

    /// Blocks every queue update through a second connection until the
    /// returned connection drops the trigger.
    fn freeze_queue(store: &Store) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(store.path()).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER freeze_queue BEFORE UPDATE ON queued_queries
             BEGIN SELECT RAISE(ABORT, 'queue is read-only'); END;",
        )
        .unwrap();
        conn
    }

    fn storage_faults(rx: &mut mpsc::UnboundedReceiver<CoreEvent>) -> Vec<&'static str> {
        let mut operations = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::StorageFault { operation, .. } = event {
                operations.push(operation);
            }
        }
        operations
    }

    #[tokio::test]
    async fn storage_failure_on_resolve_leaves_queue_untouched() {
        let (_dir, store) = setup();
        let a = store.enqueue("first", Utc::now()).unwrap();
        let b = store.enqueue("second", Utc::now()).unwrap();
        let (worker, mut rx) = worker(&store, Arc::new(EchoGateway));
        let conn = freeze_queue(&store);

        let report = worker.run_batch().await;
        assert_eq!(report.aborted, Some(BatchAbort::Storage));
        assert!(report.resolved.is_empty());
        assert_eq!(storage_faults(&mut rx), vec!["resolve"]);
        for id in [a.id, b.id] {
            let stored = store.get_query(id).unwrap().unwrap();
            assert_eq!(stored.status, QueueStatus::Pending);
            assert!(stored.answer.is_none());
            assert!(store.turns_for_query(id).unwrap().is_empty());
        }

        conn.execute_batch("DROP TRIGGER freeze_queue;").unwrap();
        let report = worker.run_batch().await;
        assert_eq!(report.resolved, vec![a.id, b.id]);
        assert_eq!(report.aborted, None);
    }

    #[tokio::test]
    async fn storage_failure_on_attempt_count_keeps_attempts() {
        let (_dir, store) = setup();
        let q = store.enqueue("why is my fan loud", Utc::now()).unwrap();
        let gateway = ScriptedGateway::new(Vec::new(), provider_error());
        let (worker, mut rx) = worker(&store, gateway);
        let _conn = freeze_queue(&store);

        let report = worker.run_batch().await;
        assert_eq!(report.aborted, Some(BatchAbort::Storage));
        assert!(report.retried.is_empty());
        assert_eq!(storage_faults(&mut rx), vec!["record_attempt"]);
        let stored = store.get_query(q.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.status, QueueStatus::Pending);
    }
}

