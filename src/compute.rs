//! Typed task execution over the diffusion plane.
//!
//! Tasks arrive as `"task"`-typed information messages whose content is a
//! JSON [`ComputationTask`]. Each node runs a task at most once: the task
//! message id is tracked in `active` while an executor runs and in
//! `completed` afterwards, and any later delivery of the same id is
//! dropped. Task duplication across the cluster is expected; every
//! executing node emits its own result message with a node-specific id.
//!
//! Executor bodies run on spawned tasks outside the state lock, so a slow
//! executor never stalls dispatch or the receive loop feeding it.

use crate::diffusion::Diffusion;
use crate::params::{self, RuntimeParameters};
use crate::types::{
    now, result_message_id, ComputationResult, ComputationTask, InfoMessage, MessageId, NodeId,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Message type of emitted results.
pub const TYPE_RESULT: &str = "result";

/// Energy of result messages: low on purpose, for local propagation only.
const RESULT_ENERGY: f64 = 1.0;

/// Result message TTL, seconds.
const RESULT_TTL_SECS: u64 = 300;

/// Cadence of the completed-result eviction sweep, seconds.
const COMPLETED_SWEEP_SECS: u64 = 300;

// =============================================================================
// EXECUTORS
// =============================================================================

/// A compiled-in handler for one task type.
#[async_trait]
pub trait Executor: Send + Sync {
    fn task_type(&self) -> &str;

    fn can_handle(&self, task_type: &str) -> bool {
        task_type == self.task_type()
    }

    /// Run the task. Errors are logged and dropped; there is no retry and
    /// no negative result message.
    async fn execute(&self, task: &ComputationTask) -> Result<serde_json::Value, String>;
}

/// Whitespace word counter, the baseline registry entry.
///
/// Parameters: `case_sensitive` (bool, default false).
pub struct WordCountExecutor;

#[async_trait]
impl Executor for WordCountExecutor {
    fn task_type(&self) -> &str {
        "wordcount"
    }

    async fn execute(&self, task: &ComputationTask) -> Result<serde_json::Value, String> {
        let case_sensitive = task
            .parameters
            .get("case_sensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut word_counts: HashMap<String, u64> = HashMap::new();
        let mut total_words: u64 = 0;
        for word in task.data.split_whitespace() {
            let word = if case_sensitive {
                word.to_string()
            } else {
                word.to_lowercase()
            };
            *word_counts.entry(word).or_insert(0) += 1;
            total_words += 1;
        }

        Ok(serde_json::json!({
            "total_words": total_words,
            "unique_words": word_counts.len(),
            "word_counts": word_counts,
        }))
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Placeholder for a task an executor is currently running.
#[derive(Debug, Clone)]
struct ActiveTask {
    executed_by: NodeId,
    started_at: u64,
}

/// `active` and `completed` share one lock; executor bodies run outside it.
#[derive(Default)]
struct State {
    active: HashMap<MessageId, ActiveTask>,
    completed: HashMap<MessageId, ComputationResult>,
}

/// Computation statistics for the observation read model.
#[derive(Debug, Clone, Serialize)]
pub struct ComputationStats {
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub executors: Vec<String>,
}

pub struct Computation {
    node_id: NodeId,
    params: Arc<RuntimeParameters>,
    executors: Vec<Arc<dyn Executor>>,
    state: Mutex<State>,
    diffusion: RwLock<Option<Arc<Diffusion>>>,
    shutdown: watch::Receiver<bool>,
}

impl Computation {
    pub fn new(
        node_id: NodeId,
        params: Arc<RuntimeParameters>,
        executors: Vec<Arc<dyn Executor>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node_id,
            params,
            executors,
            state: Mutex::new(State::default()),
            diffusion: RwLock::new(None),
            shutdown,
        }
    }

    /// Wire the diffusion sink for result re-injection. Part of the node's
    /// two-phase construction.
    pub fn register_diffusion(&self, diffusion: Arc<Diffusion>) {
        *self.diffusion.write().expect("diffusion slot poisoned") = Some(diffusion);
    }

    /// Spawn the completed-result eviction task.
    pub fn start(self: &Arc<Self>) {
        let compute = Arc::clone(self);
        tokio::spawn(async move {
            compute.cleanup_loop().await;
        });
    }

    fn executor_for(&self, task_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .iter()
            .find(|e| e.can_handle(task_type))
            .cloned()
    }

    /// Run a task message, at most once per node.
    ///
    /// Order matters: membership check, parse, executor lookup, and only
    /// then the placeholder insert that claims the task id. Anything that
    /// fails before the claim is a silent drop, not an error.
    pub async fn dispatch(self: &Arc<Self>, msg: InfoMessage) {
        let task_id = msg.id.clone();

        {
            let state = self.state.lock().expect("compute lock poisoned");
            if let Some(active) = state.active.get(&task_id) {
                debug!(
                    task = %task_id,
                    executed_by = %active.executed_by,
                    started_at = active.started_at,
                    "task already active, dropping"
                );
                return;
            }
            if state.completed.contains_key(&task_id) {
                debug!(task = %task_id, "task already completed, dropping");
                return;
            }
        }

        let task: ComputationTask = match serde_json::from_str(&msg.content) {
            Ok(task) => task,
            Err(e) => {
                warn!(task = %task_id, error = %e, "unparseable task content");
                return;
            }
        };

        let Some(executor) = self.executor_for(&task.task_type) else {
            // not an error: this node simply cannot help with this type
            debug!(task = %task_id, task_type = %task.task_type, "no executor registered");
            return;
        };

        {
            let mut state = self.state.lock().expect("compute lock poisoned");
            if state.active.contains_key(&task_id) || state.completed.contains_key(&task_id) {
                return;
            }
            state.active.insert(
                task_id.clone(),
                ActiveTask {
                    executed_by: self.node_id.clone(),
                    started_at: now(),
                },
            );
        }

        let compute = Arc::clone(self);
        tokio::spawn(async move {
            compute.run(task_id, task, executor).await;
        });
    }

    async fn run(self: Arc<Self>, task_id: MessageId, task: ComputationTask, executor: Arc<dyn Executor>) {
        let started = Instant::now();
        match executor.execute(&task).await {
            Ok(value) => {
                let result = ComputationResult {
                    task_id: task_id.clone(),
                    task_type: task.task_type.clone(),
                    executed_by: self.node_id.clone(),
                    result: value,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    timestamp: now(),
                };
                {
                    let mut state = self.state.lock().expect("compute lock poisoned");
                    state.active.remove(&task_id);
                    state.completed.insert(task_id.clone(), result.clone());
                }
                info!(
                    task = %task_id,
                    task_type = %task.task_type,
                    elapsed_ms = result.execution_time_ms,
                    "task completed"
                );
                self.emit_result(result).await;
            }
            Err(e) => {
                warn!(task = %task_id, task_type = %task.task_type, error = %e, "executor failed");
                let mut state = self.state.lock().expect("compute lock poisoned");
                state.active.remove(&task_id);
            }
        }
    }

    /// Re-inject a result into the diffusion plane.
    ///
    /// Goes through the diffusion message handler rather than inject: the
    /// result id is derived from task id and node id, not from the content,
    /// so every executing node's result survives deduplication.
    async fn emit_result(&self, result: ComputationResult) {
        let diffusion = self.diffusion.read().expect("diffusion slot poisoned").clone();
        let Some(diffusion) = diffusion else {
            return;
        };

        let content = match serde_json::to_string(&result) {
            Ok(content) => content,
            Err(e) => {
                warn!(task = %result.task_id, error = %e, "result encode failed");
                return;
            }
        };

        let at = now();
        let mut metadata = HashMap::new();
        metadata.insert("task_id".to_string(), serde_json::json!(result.task_id));
        metadata.insert("task_type".to_string(), serde_json::json!(result.task_type));
        metadata.insert("executor".to_string(), serde_json::json!(self.node_id));

        let msg = InfoMessage {
            id: result_message_id(&result.task_id, &self.node_id),
            kind: TYPE_RESULT.to_string(),
            content,
            energy: RESULT_ENERGY,
            ttl: at + RESULT_TTL_SECS,
            hops: 0,
            source: self.node_id.clone(),
            path: vec![self.node_id.clone()],
            timestamp: at,
            metadata,
        };

        use crate::net::comm::InfoSink;
        diffusion.handle_info_message(msg, None).await;
    }

    // =========================================================================
    // RETENTION
    // =========================================================================

    async fn cleanup_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let interval = std::time::Duration::from_secs(COMPLETED_SWEEP_SECS);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    self.evict_completed();
                }
            }
        }
        debug!(node = %self.node_id, "compute cleanup loop stopped");
    }

    /// Drop completed results older than `result_retention_seconds`.
    fn evict_completed(&self) {
        let retention = self
            .params
            .get_i64(params::RESULT_RETENTION_SECONDS, 600)
            .max(0) as u64;
        let at = now();
        let mut state = self.state.lock().expect("compute lock poisoned");
        let before = state.completed.len();
        state
            .completed
            .retain(|_, result| at.saturating_sub(result.timestamp) < retention);
        let evicted = before - state.completed.len();
        if evicted > 0 {
            debug!(evicted, "completed results evicted");
        }
    }

    // =========================================================================
    // READ MODEL
    // =========================================================================

    pub fn stats(&self) -> ComputationStats {
        let state = self.state.lock().expect("compute lock poisoned");
        ComputationStats {
            active_tasks: state.active.len(),
            completed_tasks: state.completed.len(),
            executors: self
                .executors
                .iter()
                .map(|e| e.task_type().to_string())
                .collect(),
        }
    }

    pub fn completed(&self, task_id: &str) -> Option<ComputationResult> {
        self.state
            .lock()
            .expect("compute lock poisoned")
            .completed
            .get(task_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Executor that counts invocations, for at-most-once checks.
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for CountingExecutor {
        fn task_type(&self) -> &str {
            "count"
        }

        async fn execute(&self, _task: &ComputationTask) -> Result<serde_json::Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl Executor for FailingExecutor {
        fn task_type(&self) -> &str {
            "fail"
        }

        async fn execute(&self, _task: &ComputationTask) -> Result<serde_json::Value, String> {
            Err("broken".to_string())
        }
    }

    fn compute_with(executors: Vec<Arc<dyn Executor>>) -> (Arc<Computation>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let compute = Arc::new(Computation::new(
            "node_self".to_string(),
            Arc::new(RuntimeParameters::new()),
            executors,
            rx,
        ));
        (compute, tx)
    }

    fn task_message(task_type: &str, data: &str) -> InfoMessage {
        let content = serde_json::json!({"type": task_type, "data": data}).to_string();
        InfoMessage::new("task", content, 3.0, now() + 60, "node_remote".to_string())
    }

    async fn wait_for_completed(compute: &Computation, count: usize) {
        for _ in 0..100 {
            if compute.stats().completed_tasks >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never completed");
    }

    #[tokio::test]
    async fn test_wordcount_executor() {
        let executor = WordCountExecutor;
        let task = ComputationTask {
            task_type: "wordcount".to_string(),
            data: "the quick brown fox the".to_string(),
            parameters: HashMap::from([(
                "case_sensitive".to_string(),
                serde_json::json!(false),
            )]),
        };
        let value = executor.execute(&task).await.unwrap();
        assert_eq!(value["total_words"], 5);
        assert_eq!(value["unique_words"], 4);
        assert_eq!(value["word_counts"]["the"], 2);
        assert_eq!(value["word_counts"]["fox"], 1);
    }

    #[tokio::test]
    async fn test_wordcount_case_sensitivity() {
        let executor = WordCountExecutor;
        let mut task = ComputationTask {
            task_type: "wordcount".to_string(),
            data: "The the THE".to_string(),
            parameters: HashMap::new(),
        };

        // default folds case
        let value = executor.execute(&task).await.unwrap();
        assert_eq!(value["unique_words"], 1);
        assert_eq!(value["word_counts"]["the"], 3);

        task.parameters
            .insert("case_sensitive".to_string(), serde_json::json!(true));
        let value = executor.execute(&task).await.unwrap();
        assert_eq!(value["unique_words"], 3);
    }

    #[tokio::test]
    async fn test_dispatch_is_at_most_once_per_node() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        let (compute, _shutdown) = compute_with(vec![executor.clone()]);
        let msg = task_message("count", "x");

        for _ in 0..5 {
            compute.dispatch(msg.clone()).await;
        }
        wait_for_completed(&compute, 1).await;
        // give any extra (incorrect) executions a moment to show up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(compute.stats().active_tasks, 0);
        assert_eq!(compute.stats().completed_tasks, 1);
    }

    #[tokio::test]
    async fn test_dispatch_drops_unknown_task_type() {
        let (compute, _shutdown) = compute_with(vec![Arc::new(WordCountExecutor)]);
        compute.dispatch(task_message("fourier", "x")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = compute.stats();
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.completed_tasks, 0);
    }

    #[tokio::test]
    async fn test_dispatch_drops_unparseable_content() {
        let (compute, _shutdown) = compute_with(vec![Arc::new(WordCountExecutor)]);
        let msg = InfoMessage::new("task", "not json", 3.0, now() + 60, "node_r".to_string());
        compute.dispatch(msg).await;
        let stats = compute.stats();
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.completed_tasks, 0);
    }

    #[tokio::test]
    async fn test_failed_execution_leaves_no_result() {
        let (compute, _shutdown) = compute_with(vec![Arc::new(FailingExecutor)]);
        let msg = task_message("fail", "x");
        compute.dispatch(msg.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = compute.stats();
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.completed_tasks, 0);
    }

    #[tokio::test]
    async fn test_completed_results_evicted_after_retention() {
        let (compute, _shutdown) = compute_with(vec![Arc::new(WordCountExecutor)]);
        compute.dispatch(task_message("wordcount", "a b c")).await;
        wait_for_completed(&compute, 1).await;

        // still fresh: survives a sweep
        compute.evict_completed();
        assert_eq!(compute.stats().completed_tasks, 1);

        // age it past the retention window
        {
            let mut state = compute.state.lock().unwrap();
            for result in state.completed.values_mut() {
                result.timestamp = now() - 700;
            }
        }
        compute.evict_completed();
        assert_eq!(compute.stats().completed_tasks, 0);
    }

    #[tokio::test]
    async fn test_stats_lists_executors() {
        let (compute, _shutdown) = compute_with(vec![Arc::new(WordCountExecutor)]);
        assert_eq!(compute.stats().executors, vec!["wordcount"]);
    }
}
