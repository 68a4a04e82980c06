//! Pipeline consumer: the poll/process/retry loop.
//!
//! Each poll runs under the resource lock:
//!
//! 1. Read the state; a stopped pipeline is left alone
//! 2. Pop the head message
//! 3. Run the handler (errors and panics count as failures and are recorded)
//! 4. On success, reset the retry count and clear the failure record in one
//!    transaction
//! 5. On failure, put the message back at the head and bump the retry count,
//!    stopping the pipeline once `max_retries` is reached
//!
//! A failing message therefore blocks everything behind it until it succeeds
//! or an operator resumes the stopped pipeline.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ConsumerSettings;
use super::failure::PipelineFailure;
use super::handler::PipelineHandler;
use super::keys::{failure_key, messages_key, state_key};
use super::state::PipelineState;
use crate::error::PipelineResult;
use crate::lock::DistributedLock;
use crate::metrics::{MessageOutcome, MetricsCollector};
use crate::store::{PipelineStore, Transaction};

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another process held the lock for the whole wait window.
    LockNotAcquired,
    /// The pipeline is stopped.
    Stopped,
    /// No message was waiting.
    Empty,
    /// A message was handled successfully.
    Processed,
    /// The handler failed; the message is back at the head of the queue.
    Failed {
        /// State written after the failure.
        state: PipelineState,
    },
}

impl PollOutcome {
    /// Returns whether the poll consumed a message. Only then does the loop
    /// poll again without pausing.
    pub fn is_progress(&self) -> bool {
        matches!(self, Self::Processed)
    }
}

/// Consumes messages from one pipeline resource.
pub struct PipelineConsumer {
    settings: ConsumerSettings,
    handler: Arc<dyn PipelineHandler>,
    store: Arc<dyn PipelineStore>,
    lock: Arc<dyn DistributedLock>,
    metrics: MetricsCollector,
}

impl PipelineConsumer {
    /// Creates a consumer.
    pub fn new(
        settings: ConsumerSettings,
        handler: Arc<dyn PipelineHandler>,
        store: Arc<dyn PipelineStore>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            settings,
            handler,
            store,
            lock,
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the consumer settings.
    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Returns the resource name.
    pub fn resource(&self) -> &str {
        &self.settings.resource
    }

    /// Polls until `cancel` fires.
    ///
    /// Never fails: handler failures, lock contention and store errors are
    /// logged and followed by a pause of `pull_interval`. A successful poll is
    /// followed immediately by the next one.
    pub async fn run(&self, cancel: &CancellationToken) {
        info!(resource = %self.resource(), "Pipeline consumer started");

        while !cancel.is_cancelled() {
            let progress = match self.poll(cancel).await {
                Ok(outcome) => {
                    if !outcome.is_progress() {
                        debug!(resource = %self.resource(), outcome = ?outcome, "No progress");
                    }
                    outcome.is_progress()
                }
                Err(e) => {
                    error!(resource = %self.resource(), error = %e, "Pipeline poll failed");
                    false
                }
            };

            if !progress {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.pull_interval) => {}
                }
            }
        }

        info!(resource = %self.resource(), "Pipeline consumer stopped");
    }

    /// Runs one poll under the resource lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock service or the store fails. Handler
    /// failures are not errors; they are reported as [`PollOutcome::Failed`].
    pub async fn poll(&self, cancel: &CancellationToken) -> PipelineResult<PollOutcome> {
        let handle = self
            .lock
            .acquire(self.resource(), &self.settings.lock, cancel)
            .await?;

        if !handle.is_acquired() {
            self.metrics.record_lock_contention(self.resource(), "poll");
            return Ok(PollOutcome::LockNotAcquired);
        }

        let outcome = self.poll_locked(cancel).await;

        if let Err(e) = handle.release().await {
            warn!(resource = %self.resource(), error = %e, "Failed to release pipeline lock");
        }
        outcome
    }

    async fn poll_locked(&self, cancel: &CancellationToken) -> PipelineResult<PollOutcome> {
        let resource = self.resource();

        let raw_state = self.store.string_get(&state_key(resource)).await?;
        let (state, decode_error) = PipelineState::decode_lenient(raw_state.as_deref());
        if let Some(e) = decode_error {
            warn!(resource = %resource, error = %e, "Treating unreadable pipeline state as Active(0)");
        }
        if state.is_stopped() {
            return Ok(PollOutcome::Stopped);
        }

        let Some(message) = self.store.list_left_pop(&messages_key(resource)).await? else {
            return Ok(PollOutcome::Empty);
        };

        if self.handle_message(&message, cancel).await {
            self.handle_success().await?;
            return Ok(PollOutcome::Processed);
        }

        let state = self.handle_failure(&message, state).await?;
        Ok(PollOutcome::Failed { state })
    }

    /// Runs the handler inside a failure boundary. Returns whether it succeeded.
    async fn handle_message(&self, message: &str, cancel: &CancellationToken) -> bool {
        let started = Instant::now();
        let result = AssertUnwindSafe(self.handler.handle(message, cancel))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let (success, outcome, abnormal) = match result {
            Ok(Ok(success)) => {
                let outcome = if success {
                    MessageOutcome::Processed
                } else {
                    MessageOutcome::Failed
                };
                (success, outcome, None)
            }
            Ok(Err(e)) => (false, MessageOutcome::Failed, Some(format!("{:#}", e))),
            Err(panic) => (false, MessageOutcome::Panicked, Some(panic_message(&*panic))),
        };
        self.metrics.record_message(self.resource(), outcome, elapsed);

        if let Some(description) = abnormal {
            error!(
                resource = %self.resource(),
                message = %message,
                error = %description,
                "Pipeline handler terminated abnormally"
            );
            // Best effort; the requeue below must still happen
            if let Err(e) = self.store_failure(message, description).await {
                error!(
                    resource = %self.resource(),
                    error = %e,
                    "Failed to record pipeline failure"
                );
            }
        }

        success
    }

    async fn store_failure(&self, message: &str, description: String) -> PipelineResult<()> {
        let failure = PipelineFailure::new(description, message);
        self.store
            .string_set(&failure_key(self.resource()), &failure.to_json()?)
            .await?;
        Ok(())
    }

    async fn handle_success(&self) -> PipelineResult<()> {
        let resource = self.resource();
        let transaction = Transaction::new()
            .string_set(state_key(resource), PipelineState::Active(0).encode())
            .key_delete([failure_key(resource)]);
        self.store.execute(transaction).await?;
        Ok(())
    }

    /// Requeues the message at the head and writes the escalated state.
    async fn handle_failure(
        &self,
        message: &str,
        state: PipelineState,
    ) -> PipelineResult<PipelineState> {
        let resource = self.resource();
        warn!(resource = %resource, message = %message, "Pipeline message handling failed");

        self.store
            .list_left_push(&messages_key(resource), message)
            .await?;

        let next = state.next_after_failure(self.settings.max_retries);
        self.store
            .string_set(&state_key(resource), &next.encode())
            .await?;

        if next.is_stopped() {
            self.metrics.record_stop(resource);
            warn!(
                resource = %resource,
                max_retries = self.settings.max_retries,
                "Pipeline stopped after exhausting retries"
            );
        }

        Ok(next)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockSettings, MemoryLock};
    use crate::store::MemoryStore;
    use crate::error::{PipelineError, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Handler that replays a script of results and records what it saw.
    struct ScriptedHandler {
        script: Mutex<Vec<anyhow::Result<bool>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(script: Vec<anyhow::Result<bool>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl PipelineHandler for ScriptedHandler {
        async fn handle(&self, message: &str, _cancel: &CancellationToken) -> anyhow::Result<bool> {
            self.seen.lock().expect("lock poisoned").push(message.to_string());
            self.script
                .lock()
                .expect("lock poisoned")
                .pop()
                .unwrap_or(Ok(true))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl PipelineHandler for PanickingHandler {
        async fn handle(&self, _message: &str, _cancel: &CancellationToken) -> anyhow::Result<bool> {
            panic!("poison pill");
        }
    }

    /// Store wrapper that injects write failures on the failure slot and a
    /// number of failed state reads.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryStore,
        reject_failure_writes: bool,
        failing_reads: AtomicUsize,
    }

    impl FaultyStore {
        fn rejecting_failure_writes() -> Arc<Self> {
            Arc::new(Self {
                reject_failure_writes: true,
                ..Self::default()
            })
        }

        fn failing_reads(count: usize) -> Arc<Self> {
            Arc::new(Self {
                failing_reads: AtomicUsize::new(count),
                ..Self::default()
            })
        }

        fn unavailable(key: &str) -> StoreError {
            StoreError::ConnectionFailed(format!("store unavailable for '{}'", key))
        }
    }

    #[async_trait]
    impl PipelineStore for FaultyStore {
        async fn list_right_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
            self.inner.list_right_push(key, value).await
        }

        async fn list_left_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
            self.inner.list_left_push(key, value).await
        }

        async fn list_left_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.list_left_pop(key).await
        }

        async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
            self.inner.list_len(key).await
        }

        async fn list_range(
            &self,
            key: &str,
            start: isize,
            stop: isize,
        ) -> Result<Vec<String>, StoreError> {
            self.inner.list_range(key, start, stop).await
        }

        async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError> {
            let remaining = self
                .failing_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if remaining.is_ok() {
                return Err(Self::unavailable(key));
            }
            self.inner.string_get(key).await
        }

        async fn string_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            if self.reject_failure_writes && key.ends_with(":failure") {
                return Err(Self::unavailable(key));
            }
            self.inner.string_set(key, value).await
        }

        async fn key_delete(&self, keys: &[String]) -> Result<usize, StoreError> {
            self.inner.key_delete(keys).await
        }

        async fn execute(&self, transaction: Transaction) -> Result<Vec<String>, StoreError> {
            self.inner.execute(transaction).await
        }
    }

    fn quick_settings(max_retries: u32) -> ConsumerSettings {
        ConsumerSettings::new("test")
            .with_max_retries(max_retries)
            .with_pull_interval(Duration::from_millis(5))
            .with_lock(
                LockSettings::default()
                    .with_wait_time(Duration::from_millis(20))
                    .with_retry_time(Duration::from_millis(5)),
            )
    }

    fn consumer_with(
        handler: Arc<dyn PipelineHandler>,
        max_retries: u32,
    ) -> (PipelineConsumer, Arc<MemoryStore>, MemoryLock) {
        let store = Arc::new(MemoryStore::new());
        let lock = MemoryLock::new();
        let consumer = PipelineConsumer::new(
            quick_settings(max_retries),
            handler,
            store.clone(),
            Arc::new(lock.clone()),
        );
        (consumer, store, lock)
    }

    #[tokio::test]
    async fn test_poll_empty_queue() {
        let (consumer, _store, _lock) = consumer_with(ScriptedHandler::new(vec![]), 3);
        let outcome = consumer.poll(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Empty);
        assert!(!outcome.is_progress());
    }

    #[tokio::test]
    async fn test_poll_success_resets_state() {
        let handler = ScriptedHandler::new(vec![Ok(true)]);
        let (consumer, store, _lock) = consumer_with(handler.clone(), 3);
        store.list_right_push("test:messages", "m1").await.unwrap();
        store.string_set("test:state", "2").await.unwrap();
        store.string_set("test:failure", "{}").await.unwrap();

        let outcome = consumer.poll(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, PollOutcome::Processed);
        assert_eq!(handler.seen(), vec!["m1"]);
        assert_eq!(store.string_get("test:state").await.unwrap().as_deref(), Some("0"));
        assert!(!store.contains_key("test:failure").await);
        assert!(!store.contains_key("test:messages").await);
    }

    #[tokio::test]
    async fn test_poll_failure_requeues_at_head() {
        let handler = ScriptedHandler::new(vec![Ok(false)]);
        let (consumer, store, _lock) = consumer_with(handler, 3);
        for m in ["m1", "m2"] {
            store.list_right_push("test:messages", m).await.unwrap();
        }

        let outcome = consumer.poll(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Failed {
                state: PipelineState::Active(1)
            }
        );
        assert_eq!(
            store.list_range("test:messages", 0, -1).await.unwrap(),
            vec!["m1", "m2"]
        );
        assert_eq!(store.string_get("test:state").await.unwrap().as_deref(), Some("1"));
        // A plain `false` is not an abnormal termination
        assert!(!store.contains_key("test:failure").await);
    }

    #[tokio::test]
    async fn test_handler_error_records_failure() {
        let handler = ScriptedHandler::new(vec![Err(anyhow::anyhow!("database unavailable"))]);
        let (consumer, store, _lock) = consumer_with(handler, 3);
        store.list_right_push("test:messages", "m1").await.unwrap();

        consumer.poll(&CancellationToken::new()).await.unwrap();

        let raw = store.string_get("test:failure").await.unwrap().unwrap();
        let failure = PipelineFailure::from_json(&raw).unwrap();
        assert!(failure.exception.contains("database unavailable"));
        assert_eq!(failure.message, "m1");
        assert!(failure.occurred_at().is_some());
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let (consumer, store, lock) = consumer_with(Arc::new(PanickingHandler), 3);
        store.list_right_push("test:messages", "m1").await.unwrap();

        let outcome = consumer.poll(&CancellationToken::new()).await.unwrap();

        assert!(matches!(outcome, PollOutcome::Failed { .. }));
        let raw = store.string_get("test:failure").await.unwrap().unwrap();
        assert!(PipelineFailure::from_json(&raw)
            .unwrap()
            .exception
            .contains("poison pill"));
        assert_eq!(store.list_len("test:messages").await.unwrap(), 1);
        assert!(!lock.is_locked("test"));
    }

    #[tokio::test]
    async fn test_escalates_to_stopped() {
        let handler = ScriptedHandler::new(vec![Ok(false), Ok(false)]);
        let (consumer, store, _lock) = consumer_with(handler, 2);
        store.list_right_push("test:messages", "m1").await.unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(
            consumer.poll(&cancel).await.unwrap(),
            PollOutcome::Failed {
                state: PipelineState::Active(1)
            }
        );
        assert_eq!(
            consumer.poll(&cancel).await.unwrap(),
            PollOutcome::Failed {
                state: PipelineState::Stopped
            }
        );
        assert_eq!(
            store.string_get("test:state").await.unwrap().as_deref(),
            Some("STOPPED")
        );
        assert_eq!(consumer.poll(&cancel).await.unwrap(), PollOutcome::Stopped);
        assert_eq!(store.list_len("test:messages").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_state_counts_from_zero() {
        let handler = ScriptedHandler::new(vec![Ok(false)]);
        let (consumer, store, _lock) = consumer_with(handler, 5);
        store.list_right_push("test:messages", "m1").await.unwrap();
        store.string_set("test:state", "garbage").await.unwrap();

        let outcome = consumer.poll(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Failed {
                state: PipelineState::Active(1)
            }
        );
    }

    #[tokio::test]
    async fn test_poll_reports_lock_contention() {
        let (consumer, store, lock) = consumer_with(ScriptedHandler::new(vec![]), 3);
        store.list_right_push("test:messages", "m1").await.unwrap();

        let held = lock
            .acquire("test", &LockSettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(held.is_acquired());

        let outcome = consumer.poll(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::LockNotAcquired);
        assert_eq!(store.list_len("test:messages").await.unwrap(), 1);

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_cancelled() {
        let handler = ScriptedHandler::new(vec![Ok(true), Ok(false), Ok(true), Ok(true)]);
        let (consumer, store, _lock) = consumer_with(handler.clone(), 10);
        for m in ["m1", "m2", "m3"] {
            store.list_right_push("test:messages", m).await.unwrap();
        }

        let consumer = Arc::new(consumer);
        let cancel = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(&cancel).await })
        };

        for _ in 0..200 {
            if handler.seen().len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer should stop on cancellation")
            .unwrap();

        assert_eq!(handler.seen(), vec!["m1", "m2", "m2", "m3"]);
        assert_eq!(store.list_len("test:messages").await.unwrap(), 0);
        assert_eq!(store.string_get("test:state").await.unwrap().as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_requeues_when_failure_record_cannot_be_written() {
        let store = FaultyStore::rejecting_failure_writes();
        let lock = MemoryLock::new();
        let handler = ScriptedHandler::new(vec![Err(anyhow::anyhow!("boom"))]);
        let consumer = PipelineConsumer::new(
            quick_settings(3),
            handler,
            store.clone(),
            Arc::new(lock.clone()),
        );
        store.list_right_push("test:messages", "m1").await.unwrap();

        let outcome = consumer.poll(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Failed {
                state: PipelineState::Active(1)
            }
        );
        assert_eq!(
            store.list_range("test:messages", 0, -1).await.unwrap(),
            vec!["m1"]
        );
        assert_eq!(store.string_get("test:state").await.unwrap().as_deref(), Some("1"));
        assert!(!store.inner.contains_key("test:failure").await);
        assert!(!lock.is_locked("test"));
    }

    #[tokio::test]
    async fn test_poll_store_error_releases_lock() {
        let store = FaultyStore::failing_reads(1);
        let lock = MemoryLock::new();
        let handler = ScriptedHandler::new(vec![]);
        let consumer = PipelineConsumer::new(
            quick_settings(3),
            handler.clone(),
            store.clone(),
            Arc::new(lock.clone()),
        );
        store.list_right_push("test:messages", "m1").await.unwrap();
        let cancel = CancellationToken::new();

        let err = consumer.poll(&cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::ConnectionFailed(_))));
        assert!(!lock.is_locked("test"));
        assert_eq!(store.list_len("test:messages").await.unwrap(), 1);

        assert_eq!(consumer.poll(&cancel).await.unwrap(), PollOutcome::Processed);
        assert_eq!(handler.seen(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_run_survives_store_errors() {
        let store = FaultyStore::failing_reads(3);
        let lock = MemoryLock::new();
        let handler = ScriptedHandler::new(vec![]);
        let consumer = Arc::new(PipelineConsumer::new(
            quick_settings(3),
            handler.clone(),
            store.clone(),
            Arc::new(lock.clone()),
        ));
        store.list_right_push("test:messages", "m1").await.unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(&cancel).await })
        };

        for _ in 0..200 {
            if !handler.seen().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!task.is_finished(), "run should keep polling after errors");
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer should stop on cancellation")
            .unwrap();

        assert_eq!(handler.seen(), vec!["m1"]);
        assert_eq!(store.failing_reads.load(Ordering::SeqCst), 0);
        assert_eq!(store.list_len("test:messages").await.unwrap(), 0);
        assert!(!lock.is_locked("test"));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "handler panicked: boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "handler panicked: bang");

        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*boxed), "handler panicked");
    }
}
