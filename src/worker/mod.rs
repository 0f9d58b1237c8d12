//! Automatic memory worker
//!
//! After each conversational turn the agent runtime hands its session to
//! [`AutoMemoryWorker::enqueue_job`]. The worker collects the messages the
//! session gained since the last extraction, asks the extractor whether it
//! is worth running, and if so schedules the extraction on a background
//! shard keyed by user. When the shard is full the job runs inline on the
//! caller's task instead.
//!
//! ```rust,ignore
//! let worker = AutoMemoryWorker::new(AutoMemoryConfig::with_extractor(extractor), operator);
//! worker.start().await;
//!
//! // after every turn
//! worker.enqueue_job(&request_token, session.clone()).await?;
//!
//! worker.stop().await;
//! ```

mod queue;
mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AutoMemoryConfig;
use crate::error::{Error, Result};
use crate::extractor::{ExtractionContext, MemoryExtractor, Operation};
use crate::memory::{MemoryEntry, MemoryKey, UserKey};
use crate::message::Message;
use crate::session::{read_last_extract_at, scan_delta_since, write_last_extract_at, Session};
use crate::tools::{self, EnabledTools};

use queue::JobQueueShardSet;
pub use state::{ExtractionState, ExtractionStateStore};

/// The memory store operations the worker drives.
///
/// `update_memory` must fail with an error for which
/// [`Error::is_memory_not_found`] holds when the ID does not exist.
#[async_trait]
pub trait MemoryOperator: Send + Sync {
    /// `limit == 0` reads everything
    async fn read_memories(&self, user_key: &UserKey, limit: usize) -> Result<Vec<MemoryEntry>>;

    async fn add_memory(&self, user_key: &UserKey, memory: &str, topics: &[String]) -> Result<()>;

    async fn update_memory(&self, key: &MemoryKey, memory: &str, topics: &[String]) -> Result<()>;

    async fn delete_memory(&self, key: &MemoryKey) -> Result<()>;

    async fn clear_memories(&self, user_key: &UserKey) -> Result<()>;
}

/// One unit of extraction work
struct MemoryJob {
    /// Caller's span at enqueue time; carries request values, not cancellation
    span: tracing::Span,
    user_key: UserKey,
    session: Arc<Session>,
    /// Newest event timestamp covered by `messages`
    latest: Option<DateTime<Utc>>,
    messages: Vec<Message>,
}

struct WorkerInner {
    extractor: Option<Arc<dyn MemoryExtractor>>,
    operator: Arc<dyn MemoryOperator>,
    enabled_tools: EnabledTools,
    job_timeout: Duration,
    states: ExtractionStateStore,
}

/// Background extraction of long-term memories from sessions.
///
/// Without an extractor the worker is inert: `start` does nothing and
/// `enqueue_job` returns immediately.
pub struct AutoMemoryWorker {
    inner: Arc<WorkerInner>,
    queues: JobQueueShardSet<MemoryJob>,
}

impl AutoMemoryWorker {
    pub fn new(config: AutoMemoryConfig, operator: Arc<dyn MemoryOperator>) -> Self {
        let shard_count = config.effective_shard_count();
        let queue_capacity = config.effective_queue_capacity();
        let job_timeout = config.effective_job_timeout();

        if let Some(extractor) = &config.extractor {
            extractor.set_enabled_tools(&config.enabled_tools);
        }

        Self {
            inner: Arc::new(WorkerInner {
                extractor: config.extractor,
                operator,
                enabled_tools: config.enabled_tools,
                job_timeout,
                states: ExtractionStateStore::new(),
            }),
            queues: JobQueueShardSet::new(shard_count, queue_capacity),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.extractor.is_some()
    }

    /// Spawn the shard consumers. Safe to call repeatedly.
    pub async fn start(&self) {
        if !self.is_enabled() {
            return;
        }
        let inner = self.inner.clone();
        let started = self
            .queues
            .start(move |job: MemoryJob| {
                let inner = inner.clone();
                async move { inner.process_job(job).await }
            })
            .await;
        if started {
            tracing::info!("auto_memory: worker started");
        }
    }

    /// Close the queues and wait for buffered jobs to finish.
    ///
    /// Jobs enqueued afterwards run inline until the next `start`.
    pub async fn stop(&self) {
        if self.queues.is_started().await {
            self.queues.stop().await;
            tracing::info!("auto_memory: worker stopped");
        }
    }

    pub async fn is_started(&self) -> bool {
        self.queues.is_started().await
    }

    /// Consumer tasks currently running
    pub async fn running_consumers(&self) -> usize {
        self.queues.running_consumers().await
    }

    /// Snapshot of a user's extraction state, if any turn was seen
    pub fn extraction_state(&self, user_key: &UserKey) -> Option<ExtractionState> {
        self.inner
            .states
            .get(user_key)
            .map(|state| state.lock().clone())
    }

    /// Feed the latest turn of `session` to the worker.
    ///
    /// `cancel` is the caller's request scope. It only decides whether work
    /// is accepted: once a job is queued or running inline it is not
    /// cancelled with the request. Errors surface only from the inline path.
    pub async fn enqueue_job(&self, cancel: &CancellationToken, session: Arc<Session>) -> Result<()> {
        let Some(extractor) = self.inner.extractor.as_ref() else {
            return Ok(());
        };

        let user_key = session.user_key();
        if !user_key.is_complete() {
            tracing::debug!(
                "auto_memory: skipping session {} with incomplete user key",
                session.id
            );
            return Ok(());
        }

        let Some(job) = self.collect_job(extractor.as_ref(), &user_key, session) else {
            return Ok(());
        };

        let job = match self.queues.try_enqueue(&user_key, job, cancel).await {
            Ok(()) => return Ok(()),
            Err(job) => job,
        };

        if cancel.is_cancelled() {
            tracing::debug!(
                "auto_memory: caller cancelled, leaving job for {} to the next turn",
                user_key
            );
            self.inner.requeue(job);
            return Ok(());
        }

        let span = job.span.clone();
        self.inner.run_job(job).instrument(span).await
    }

    /// Move the session's new messages into the user's pending buffer and,
    /// if the extractor agrees, take them out again as a job.
    fn collect_job(
        &self,
        extractor: &dyn MemoryExtractor,
        user_key: &UserKey,
        session: Arc<Session>,
    ) -> Option<MemoryJob> {
        let state = self.inner.states.get_or_create(user_key);
        let mut state = state.lock();

        let since = match (read_last_extract_at(&session), state.scanned_through(&session.id)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let delta = scan_delta_since(&session, since);
        if let Some(latest) = delta.latest {
            state.mark_scanned(&session.id, latest);
        }
        if delta.messages.is_empty() && state.pending_messages.is_empty() {
            return None;
        }

        state.pending_messages.extend(delta.messages);
        state.total_turns += 1;

        let ctx = ExtractionContext {
            user_key,
            messages: &state.pending_messages,
            last_extract_at: state.last_extract_at,
            total_turns: state.total_turns,
        };
        if !extractor.should_extract(&ctx) {
            tracing::debug!(
                "auto_memory: deferring extraction for {} ({} pending)",
                user_key,
                state.pending_messages.len()
            );
            return None;
        }

        let messages = std::mem::take(&mut state.pending_messages);
        state.mark_extracted(Utc::now());

        Some(MemoryJob {
            span: tracing::Span::current(),
            user_key: user_key.clone(),
            latest: state.scanned_through(&session.id),
            session,
            messages,
        })
    }
}

impl WorkerInner {
    async fn process_job(&self, job: MemoryJob) {
        let span = job.span.clone();
        let user_key = job.user_key.clone();
        if let Err(e) = self.run_job(job).instrument(span).await {
            tracing::warn!("auto_memory: job for {} failed: {}", user_key, e);
        }
    }

    /// Run one job under the job timeout. Success advances the session
    /// watermark; failure hands the messages back to the pending buffer so
    /// the next turn retries them.
    async fn run_job(&self, job: MemoryJob) -> Result<()> {
        let result = tokio::time::timeout(
            self.job_timeout,
            self.create_auto_memory(&job.user_key, &job.messages),
        )
        .await
        .unwrap_or(Err(Error::Timeout(self.job_timeout)));

        match result {
            Ok(()) => {
                if let Some(latest) = job.latest {
                    write_last_extract_at(&job.session, latest);
                }
                Ok(())
            }
            Err(e) => {
                self.requeue(job);
                Err(e)
            }
        }
    }

    /// Return a job's messages to the front of the user's pending buffer
    fn requeue(&self, job: MemoryJob) {
        if job.messages.is_empty() {
            return;
        }
        tracing::debug!(
            "auto_memory: returning {} messages to pending for {}",
            job.messages.len(),
            job.user_key
        );
        self.states
            .get_or_create(&job.user_key)
            .lock()
            .restore_pending(job.messages);
    }

    async fn create_auto_memory(&self, user_key: &UserKey, messages: &[Message]) -> Result<()> {
        let Some(extractor) = self.extractor.as_ref() else {
            return Ok(());
        };

        let existing = match self.operator.read_memories(user_key, 0).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(
                    "auto_memory: failed to read memories for {}, continuing without: {}",
                    user_key,
                    e
                );
                Vec::new()
            }
        };

        let ops = extractor
            .extract(messages, &existing)
            .await
            .map_err(|e| Error::extraction(e.to_string()))?;

        tracing::debug!(
            "auto_memory: {} operations for {} from {} messages",
            ops.len(),
            user_key,
            messages.len()
        );

        for op in &ops {
            self.execute_operation(user_key, op).await;
        }
        Ok(())
    }

    async fn execute_operation(&self, user_key: &UserKey, op: &Operation) {
        let Some(tool) = op.tool_name() else {
            tracing::warn!("auto_memory: unknown operation type {}, skipping", op.kind());
            return;
        };
        if !self.enabled_tools.is_enabled(tool) {
            tracing::debug!("auto_memory: {} disabled, skipping {} operation", tool, op.kind());
            return;
        }

        let result = match op {
            Operation::Add { memory, topics } => {
                self.operator.add_memory(user_key, memory, topics).await
            }
            Operation::Update {
                memory_id,
                memory,
                topics,
            } => {
                let key = user_key.memory(memory_id.as_str());
                match self.operator.update_memory(&key, memory, topics).await {
                    Err(e) if e.is_memory_not_found() => {
                        if self.enabled_tools.is_enabled(tools::ADD_TOOL) {
                            tracing::debug!(
                                "auto_memory: memory {} not found, adding instead",
                                memory_id
                            );
                            self.operator.add_memory(user_key, memory, topics).await
                        } else {
                            Err(e)
                        }
                    }
                    other => other,
                }
            }
            Operation::Delete { memory_id } => {
                self.operator
                    .delete_memory(&user_key.memory(memory_id.as_str()))
                    .await
            }
            Operation::Clear => self.operator.clear_memories(user_key).await,
            Operation::Unknown => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!(
                "auto_memory: {} operation failed for {}: {}",
                op.kind(),
                user_key,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Event, LAST_EXTRACT_AT_KEY};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct StubExtractor {
        ops: Mutex<Vec<Operation>>,
        fail: AtomicBool,
        panic_once: AtomicBool,
        seen: Mutex<Vec<Vec<Message>>>,
        pushed_tools: Mutex<Option<EnabledTools>>,
    }

    #[async_trait]
    impl MemoryExtractor for StubExtractor {
        async fn extract(&self, messages: &[Message], _existing: &[MemoryEntry]) -> Result<Vec<Operation>> {
            self.seen.lock().push(messages.to_vec());
            if self.panic_once.swap(false, Ordering::SeqCst) {
                panic!("extractor blew up");
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::model("boom"));
            }
            Ok(self.ops.lock().clone())
        }

        fn should_extract(&self, _ctx: &ExtractionContext<'_>) -> bool {
            true
        }

        fn set_prompt(&self, _prompt: &str) {}

        fn set_model(&self, _model: Arc<dyn crate::model::Model>) {}

        fn metadata(&self) -> HashMap<String, serde_json::Value> {
            HashMap::new()
        }

        fn set_enabled_tools(&self, enabled: &EnabledTools) {
            *self.pushed_tools.lock() = Some(enabled.clone());
        }
    }

    #[derive(Default)]
    struct RecordingOperator {
        calls: Mutex<Vec<String>>,
        fail_reads: AtomicBool,
    }

    #[async_trait]
    impl MemoryOperator for RecordingOperator {
        async fn read_memories(&self, _user_key: &UserKey, _limit: usize) -> Result<Vec<MemoryEntry>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Error::storage("read down"));
            }
            Ok(Vec::new())
        }

        async fn add_memory(&self, _user_key: &UserKey, memory: &str, _topics: &[String]) -> Result<()> {
            self.calls.lock().push(format!("add:{memory}"));
            Ok(())
        }

        async fn update_memory(&self, key: &MemoryKey, _memory: &str, _topics: &[String]) -> Result<()> {
            self.calls.lock().push(format!("update:{}", key.memory_id));
            Err(Error::not_found(key.memory_id.clone()))
        }

        async fn delete_memory(&self, key: &MemoryKey) -> Result<()> {
            self.calls.lock().push(format!("delete:{}", key.memory_id));
            Ok(())
        }

        async fn clear_memories(&self, _user_key: &UserKey) -> Result<()> {
            self.calls.lock().push("clear".to_string());
            Ok(())
        }
    }

    fn session_with_user_message(text: &str) -> Arc<Session> {
        let session = Arc::new(Session::new("app", "u1"));
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        session.append_event(Event::with_message("user", ts, Message::user(text)));
        session
    }

    fn worker(
        extractor: Arc<StubExtractor>,
        operator: Arc<RecordingOperator>,
        tools: EnabledTools,
    ) -> AutoMemoryWorker {
        let config = AutoMemoryConfig::with_extractor(extractor).enabled_tools(tools);
        AutoMemoryWorker::new(config, operator)
    }

    #[tokio::test]
    async fn without_extractor_nothing_happens() {
        let operator = Arc::new(RecordingOperator::default());
        let worker = AutoMemoryWorker::new(AutoMemoryConfig::default(), operator.clone());
        worker.start().await;
        assert!(!worker.is_started().await);

        let session = session_with_user_message("hi");
        worker
            .enqueue_job(&CancellationToken::new(), session.clone())
            .await
            .unwrap();
        assert!(worker.extraction_state(&session.user_key()).is_none());
        assert!(operator.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn incomplete_user_key_is_ignored() {
        let extractor = Arc::new(StubExtractor::default());
        let worker = worker(extractor.clone(), Arc::default(), EnabledTools::all());
        let session = Arc::new(Session::new("app", ""));
        session.append_event(Event::with_message("user", Utc::now(), Message::user("hi")));

        worker.enqueue_job(&CancellationToken::new(), session).await.unwrap();
        assert!(extractor.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn enabled_tools_reach_the_extractor() {
        let extractor = Arc::new(StubExtractor::default());
        let tools = EnabledTools::only([tools::ADD_TOOL]);
        let _worker = worker(extractor.clone(), Arc::default(), tools.clone());
        assert_eq!(extractor.pushed_tools.lock().clone(), Some(tools));
    }

    #[tokio::test]
    async fn disabled_operations_are_skipped() {
        let extractor = Arc::new(StubExtractor::default());
        *extractor.ops.lock() = vec![
            Operation::add("likes tea", Vec::new()),
            Operation::delete("m1"),
            Operation::Clear,
            Operation::Unknown,
        ];
        let operator = Arc::new(RecordingOperator::default());
        let worker = worker(
            extractor,
            operator.clone(),
            EnabledTools::only([tools::ADD_TOOL]),
        );

        // not started: runs inline
        worker
            .enqueue_job(&CancellationToken::new(), session_with_user_message("I like tea"))
            .await
            .unwrap();
        assert_eq!(*operator.calls.lock(), vec!["add:likes tea".to_string()]);
    }

    #[tokio::test]
    async fn update_not_found_without_add_is_skipped() {
        let extractor = Arc::new(StubExtractor::default());
        *extractor.ops.lock() = vec![Operation::update("X", "v2", Vec::new())];
        let operator = Arc::new(RecordingOperator::default());
        let worker = worker(
            extractor,
            operator.clone(),
            EnabledTools::only([tools::UPDATE_TOOL]),
        );

        worker
            .enqueue_job(&CancellationToken::new(), session_with_user_message("v2"))
            .await
            .unwrap();
        assert_eq!(*operator.calls.lock(), vec!["update:X".to_string()]);
    }

    #[tokio::test]
    async fn read_failure_still_extracts() {
        let extractor = Arc::new(StubExtractor::default());
        *extractor.ops.lock() = vec![Operation::add("fact", Vec::new())];
        let operator = Arc::new(RecordingOperator::default());
        operator.fail_reads.store(true, Ordering::SeqCst);
        let worker = worker(extractor, operator.clone(), EnabledTools::all());

        worker
            .enqueue_job(&CancellationToken::new(), session_with_user_message("fact"))
            .await
            .unwrap();
        assert_eq!(*operator.calls.lock(), vec!["add:fact".to_string()]);
    }

    #[tokio::test]
    async fn inline_failure_surfaces_and_keeps_watermark() {
        let extractor = Arc::new(StubExtractor::default());
        extractor.fail.store(true, Ordering::SeqCst);
        let worker = worker(extractor, Arc::default(), EnabledTools::all());
        let session = session_with_user_message("hello");

        let err = worker
            .enqueue_job(&CancellationToken::new(), session.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
        assert!(err.to_string().starts_with("auto_memory: extract failed"));
        assert!(session.get_state(LAST_EXTRACT_AT_KEY).is_none());
    }

    #[tokio::test]
    async fn failed_messages_are_retried_next_turn() {
        let extractor = Arc::new(StubExtractor::default());
        extractor.fail.store(true, Ordering::SeqCst);
        let operator = Arc::new(RecordingOperator::default());
        let worker = worker(extractor.clone(), operator.clone(), EnabledTools::all());
        *extractor.ops.lock() = vec![Operation::add("fact", Vec::new())];
        let session = session_with_user_message("I love coffee.");

        assert!(worker
            .enqueue_job(&CancellationToken::new(), session.clone())
            .await
            .is_err());
        let state = worker.extraction_state(&session.user_key()).unwrap();
        assert_eq!(state.pending_messages, vec![Message::user("I love coffee.")]);

        extractor.fail.store(false, Ordering::SeqCst);
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 5).unwrap();
        session.append_event(Event::with_message("user", ts, Message::user("second")));
        worker
            .enqueue_job(&CancellationToken::new(), session.clone())
            .await
            .unwrap();

        let seen = extractor.seen.lock().clone();
        assert_eq!(seen.len(), 2);
        let texts: Vec<&str> = seen[1].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["I love coffee.", "second"]);
        assert_eq!(*operator.calls.lock(), vec!["add:fact".to_string()]);
        assert_eq!(
            session.get_state(LAST_EXTRACT_AT_KEY),
            Some(b"2025-01-01T00:00:05Z".to_vec())
        );

        // nothing new and nothing pending: no further extraction
        worker
            .enqueue_job(&CancellationToken::new(), session.clone())
            .await
            .unwrap();
        assert_eq!(extractor.seen.lock().len(), 2);
        let state = worker.extraction_state(&session.user_key()).unwrap();
        assert_eq!(state.total_turns, 2);
        assert!(state.pending_messages.is_empty());
    }

    #[tokio::test]
    async fn background_job_advances_watermark() {
        let extractor = Arc::new(StubExtractor::default());
        *extractor.ops.lock() = vec![Operation::add("fact", Vec::new())];
        let operator = Arc::new(RecordingOperator::default());
        let worker = worker(extractor, operator.clone(), EnabledTools::all());
        worker.start().await;
        assert_eq!(worker.running_consumers().await, 1);

        let session = session_with_user_message("fact");
        worker
            .enqueue_job(&CancellationToken::new(), session.clone())
            .await
            .unwrap();
        worker.stop().await;

        assert_eq!(worker.running_consumers().await, 0);
        assert_eq!(*operator.calls.lock(), vec!["add:fact".to_string()]);
        assert_eq!(
            session.get_state(LAST_EXTRACT_AT_KEY),
            Some(b"2025-01-01T00:00:00Z".to_vec())
        );
    }

    #[tokio::test]
    async fn background_update_not_found_without_add_is_skipped() {
        let extractor = Arc::new(StubExtractor::default());
        *extractor.ops.lock() = vec![
            Operation::update("X", "v2", Vec::new()),
            Operation::delete("m1"),
        ];
        let operator = Arc::new(RecordingOperator::default());
        let worker = worker(
            extractor,
            operator.clone(),
            EnabledTools::only([tools::UPDATE_TOOL, tools::DELETE_TOOL]),
        );
        worker.start().await;

        let session = session_with_user_message("v2 now");
        worker
            .enqueue_job(&CancellationToken::new(), session.clone())
            .await
            .unwrap();
        worker.stop().await;

        // the failed update neither adds nor stops the rest of the batch
        assert_eq!(
            *operator.calls.lock(),
            vec!["update:X".to_string(), "delete:m1".to_string()]
        );
        assert!(session.get_state(LAST_EXTRACT_AT_KEY).is_some());
    }

    #[tokio::test]
    async fn consumer_survives_extractor_panic() {
        let extractor = Arc::new(StubExtractor::default());
        extractor.panic_once.store(true, Ordering::SeqCst);
        *extractor.ops.lock() = vec![Operation::add("fact", Vec::new())];
        let operator = Arc::new(RecordingOperator::default());
        let worker = worker(extractor.clone(), operator.clone(), EnabledTools::all());
        worker.start().await;

        let session = session_with_user_message("boom");
        worker
            .enqueue_job(&CancellationToken::new(), session.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.running_consumers().await, 1);
        assert!(session.get_state(LAST_EXTRACT_AT_KEY).is_none());

        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 9).unwrap();
        session.append_event(Event::with_message("user", ts, Message::user("fact")));
        worker
            .enqueue_job(&CancellationToken::new(), session.clone())
            .await
            .unwrap();
        worker.stop().await;

        assert_eq!(extractor.seen.lock().len(), 2);
        assert_eq!(*operator.calls.lock(), vec!["add:fact".to_string()]);
        assert_eq!(
            session.get_state(LAST_EXTRACT_AT_KEY),
            Some(b"2025-01-01T00:00:09Z".to_vec())
        );
    }
}
