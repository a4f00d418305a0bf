//! The mediator: futures table, dispatch, delegation, broadcast

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ensemble_core::{
    AgentDirectory, BusMessage, Capability, DelegationResult, EnsembleError, MessageKind,
    MessagePriority, Result, TaskContext, TaskResult,
};

use crate::stats::AgentStats;

const HISTORY_LIMIT: usize = 1000;
/// Grace added to the caller-side wait so a handler-side timeout can
/// produce its typed result first.
const RESPONSE_GRACE: Duration = Duration::from_millis(100);

pub const EVENT_MESSAGE_SENT: &str = "message_sent";
pub const EVENT_DELEGATION_COMPLETE: &str = "delegation_complete";

#[derive(Debug, Clone)]
pub enum MediatorEvent {
    MessageSent(Box<BusMessage>),
    DelegationComplete {
        message_id: Uuid,
        result: DelegationResult,
    },
}

type Subscriber = Arc<dyn Fn(&MediatorEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(usize);

/// In-process message bus. Each handler runs in its own task;
/// request/response correlation goes through a one-shot futures table
/// keyed by message id, with exactly-once completion.
pub struct Mediator {
    directory: RwLock<Option<Weak<dyn AgentDirectory>>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<TaskResult>>>,
    history: Mutex<VecDeque<BusMessage>>,
    stats: Mutex<HashMap<String, AgentStats>>,
    subscribers: Mutex<HashMap<String, Vec<(usize, Subscriber)>>>,
    next_subscription: AtomicUsize,
    shutting_down: AtomicBool,
    /// Fire-and-forget messages drain through one queue so ordering is
    /// preserved per (sender, receiver) pair.
    fire_tx: mpsc::UnboundedSender<BusMessage>,
}

impl Mediator {
    pub fn new() -> Arc<Self> {
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<BusMessage>();
        let mediator = Arc::new(Self {
            directory: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            fire_tx,
        });

        let weak = Arc::downgrade(&mediator);
        tokio::spawn(async move {
            while let Some(message) = fire_rx.recv().await {
                let Some(mediator) = weak.upgrade() else { break };
                if mediator.shutting_down.load(Ordering::SeqCst) {
                    continue;
                }
                let _ = mediator.process_message(&message).await;
            }
        });

        info!("mediator initialized");
        mediator
    }

    pub fn set_directory(&self, directory: Weak<dyn AgentDirectory>) {
        *self.directory.write() = Some(directory);
    }

    fn directory(&self) -> Option<Arc<dyn AgentDirectory>> {
        self.directory.read().as_ref()?.upgrade()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send one message. With `requires_response` the call resolves to
    /// exactly one of: the handler's result, a timeout error, or a
    /// cancellation error, and the futures-table slot is always released.
    /// Without it, dispatch is queued and `None` returns immediately.
    pub async fn send(self: &Arc<Self>, message: BusMessage) -> Result<Option<TaskResult>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EnsembleError::Internal("mediator is shut down".into()));
        }

        debug!(
            id = %short_id(&message.id),
            sender = %message.sender,
            receiver = %message.receiver,
            kind = ?message.kind,
            "sending message"
        );

        {
            let mut history = self.history.lock();
            history.push_back(message.clone());
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
        {
            let mut stats = self.stats.lock();
            stats.entry(message.sender.clone()).or_default().messages_sent += 1;
            stats
                .entry(message.receiver.clone())
                .or_default()
                .messages_received += 1;
        }

        self.notify(EVENT_MESSAGE_SENT, &MediatorEvent::MessageSent(Box::new(message.clone())));

        if !message.requires_response {
            self.fire_tx
                .send(message)
                .map_err(|_| EnsembleError::Internal("mediator dispatcher stopped".into()))?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel::<TaskResult>();
        self.pending.lock().insert(message.id, tx);

        let handler = Arc::clone(self);
        let handler_message = message.clone();
        tokio::spawn(async move {
            let result = handler.process_message(&handler_message).await;
            // Completion is single-shot: the slot is taken, not cloned.
            if let Some(tx) = handler.pending.lock().remove(&handler_message.id) {
                let _ = tx.send(result);
            }
        });

        match tokio::time::timeout(message.timeout + RESPONSE_GRACE, rx).await {
            Ok(Ok(result)) => Ok(Some(result)),
            Ok(Err(_)) => Err(EnsembleError::Internal("message cancelled".into())),
            Err(_) => {
                self.pending.lock().remove(&message.id);
                warn!(id = %short_id(&message.id), "message timed out");
                Err(EnsembleError::timeout("mediator", message.timeout))
            }
        }
    }

    async fn process_message(&self, message: &BusMessage) -> TaskResult {
        let started = Instant::now();

        let result = match message.kind {
            MessageKind::Delegation => self.handle_delegation(message).await,
            MessageKind::HelpRequest => self.handle_help_request(message).await,
            MessageKind::Request => self.handle_request(message).await,
            MessageKind::Broadcast => self.handle_broadcast(message).await,
            other => TaskResult::fail(format!("unhandled message kind: {:?}", other)),
        };

        let ok = result.success();
        self.stats
            .lock()
            .entry(message.receiver.clone())
            .or_default()
            .observe_response(started.elapsed().as_secs_f64(), ok);
        result
    }

    async fn handle_delegation(&self, message: &BusMessage) -> TaskResult {
        let Some(directory) = self.directory() else {
            return TaskResult::fail("agent registry not available");
        };
        if !directory.has_agent(&message.receiver) {
            return TaskResult::fail(format!("agent {} not found", message.receiver));
        }

        let subtask = message
            .content
            .get("subtask")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // The callee can detect reentrance through these stamps.
        let mut context = TaskContext::from(message.context.clone());
        context.stamp_delegation(&message.sender, &message.id.to_string());

        let execution = tokio::time::timeout(
            message.timeout,
            directory.execute(&message.receiver, &subtask, context),
        )
        .await;

        match execution {
            Ok(Ok(result)) => {
                {
                    let mut stats = self.stats.lock();
                    stats
                        .entry(message.sender.clone())
                        .or_default()
                        .delegations_made += 1;
                    stats
                        .entry(message.receiver.clone())
                        .or_default()
                        .delegations_received += 1;
                }
                let success = result.success();
                let mut response = TaskResult::new();
                response.insert("success", json!(success));
                response.insert("result", result.to_value());
                response.insert("delegated_to", json!(message.receiver));
                response
            }
            Ok(Err(err)) => {
                let mut response = TaskResult::fail(err.to_string());
                response.insert("delegated_to", json!(message.receiver));
                response
            }
            Err(_) => {
                let mut response = TaskResult::fail(format!(
                    "delegation to {} timed out",
                    message.receiver
                ));
                response.insert("delegated_to", json!(message.receiver));
                response
            }
        }
    }

    async fn handle_help_request(&self, message: &BusMessage) -> TaskResult {
        let Some(capability_str) = message.content.get("capability").and_then(Value::as_str)
        else {
            return TaskResult::fail("no capability specified");
        };
        let Ok(capability) = capability_str.parse::<Capability>() else {
            return TaskResult::fail(format!("unknown capability: {}", capability_str));
        };

        match self.find_agent_for_capability(capability, &[&message.sender]) {
            Some(helper) => TaskResult::ok()
                .with("helper_agent", json!(helper))
                .with("capability", json!(capability_str)),
            None => TaskResult::fail(format!(
                "no agent found with capability: {}",
                capability_str
            )),
        }
    }

    async fn handle_request(&self, message: &BusMessage) -> TaskResult {
        let Some(directory) = self.directory() else {
            return TaskResult::fail("agent registry not available");
        };
        if !directory.has_agent(&message.receiver) {
            return TaskResult::fail(format!("agent {} not found", message.receiver));
        }

        let task = message
            .content
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let context = TaskContext::from(message.context.clone());

        let execution = tokio::time::timeout(
            message.timeout,
            directory.execute(&message.receiver, &task, context),
        )
        .await;

        match execution {
            Ok(Ok(result)) => TaskResult::ok().with("result", result.to_value()),
            Ok(Err(err)) => TaskResult::fail(err.to_string()),
            Err(_) => TaskResult::fail(format!("request to {} timed out", message.receiver)),
        }
    }

    /// Fan the payload out to every other agent concurrently. One agent
    /// failing never aborts the fan-out: its error is captured in the
    /// per-agent results.
    async fn handle_broadcast(&self, message: &BusMessage) -> TaskResult {
        let Some(directory) = self.directory() else {
            return TaskResult::fail("agent registry not available");
        };

        let payload = Value::Object(message.content.clone());
        let mut join_set = JoinSet::new();

        for name in directory.agent_names() {
            if name == message.sender {
                continue;
            }
            let directory = Arc::clone(&directory);
            let payload = payload.clone();
            join_set.spawn(async move {
                let result = directory.deliver_broadcast(&name, &payload).await;
                (name, result)
            });
        }

        let mut results = Map::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(result))) => {
                    results.insert(name, result.to_value());
                }
                Ok((name, Err(err))) => {
                    results.insert(name, json!({ "error": err.to_string() }));
                }
                Err(err) => {
                    warn!(error = %err, "broadcast task panicked");
                }
            }
        }

        TaskResult::ok().with("results", Value::Object(results))
    }

    /// Delegate a subtask to a named agent and wait for the outcome.
    pub async fn delegate_subtask(
        self: &Arc<Self>,
        from: &str,
        to: &str,
        subtask: &str,
        context: Option<Map<String, Value>>,
        priority: MessagePriority,
        timeout: Duration,
    ) -> DelegationResult {
        let started = Instant::now();

        let message = BusMessage::new(from, to, MessageKind::Delegation)
            .with_priority(priority)
            .with_content("subtask", json!(subtask))
            .with_context(context.unwrap_or_default())
            .with_timeout(timeout);
        let message_id = message.id;

        let delegation = match self.send(message).await {
            Ok(Some(response)) => {
                let elapsed = started.elapsed().as_secs_f64();
                if response.success() {
                    let inner = response
                        .get("result")
                        .and_then(Value::as_object)
                        .cloned()
                        .map(TaskResult::from)
                        .unwrap_or_default();
                    DelegationResult::succeeded(to, inner, elapsed)
                } else {
                    DelegationResult::failed_for(
                        to,
                        response.error().unwrap_or("delegation failed"),
                        elapsed,
                    )
                }
            }
            Ok(None) => DelegationResult::failed_for(
                to,
                "delegation did not produce a response",
                started.elapsed().as_secs_f64(),
            ),
            Err(err) => {
                DelegationResult::failed_for(to, err.to_string(), started.elapsed().as_secs_f64())
            }
        };

        self.notify(
            EVENT_DELEGATION_COMPLETE,
            &MediatorEvent::DelegationComplete {
                message_id,
                result: delegation.clone(),
            },
        );
        delegation
    }

    /// Find an agent offering `capability` (excluding the requester) and
    /// delegate to it.
    pub async fn request_help(
        self: &Arc<Self>,
        from: &str,
        capability: Capability,
        task: &str,
        context: Option<Map<String, Value>>,
    ) -> DelegationResult {
        let Some(helper) = self.find_agent_for_capability(capability, &[from]) else {
            return DelegationResult::failed(format!(
                "no agent with capability {} found",
                capability
            ));
        };

        self.delegate_subtask(
            from,
            &helper,
            task,
            context,
            MessagePriority::Normal,
            Duration::from_secs(120),
        )
        .await
    }

    pub fn find_agent_for_capability(
        &self,
        capability: Capability,
        exclude: &[&str],
    ) -> Option<String> {
        self.directory()?.find_for_capability(capability, exclude)
    }

    pub async fn broadcast_to_all(
        self: &Arc<Self>,
        from: &str,
        content: Map<String, Value>,
    ) -> Result<TaskResult> {
        let mut message = BusMessage::new(from, ensemble_core::bus::BROADCAST_RECEIVER, MessageKind::Broadcast);
        message.content = content;
        match self.send(message).await? {
            Some(result) => Ok(result),
            None => Ok(TaskResult::ok()),
        }
    }

    // ---- events ----

    pub fn subscribe<F>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&MediatorEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, event: &str, id: SubscriptionId) {
        if let Some(subscribers) = self.subscribers.lock().get_mut(event) {
            subscribers.retain(|(sub_id, _)| *sub_id != id.0);
        }
    }

    fn notify(&self, event: &str, payload: &MediatorEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .get(event)
            .map(|subs| subs.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default();
        for subscriber in subscribers {
            // Subscriber panics are isolated from the bus.
            if let Err(err) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                subscriber(payload)
            })) {
                warn!(event, "subscriber panicked: {:?}", err);
            }
        }
    }

    // ---- read-only views ----

    pub fn get_stats(&self, agent: Option<&str>) -> HashMap<String, AgentStats> {
        let stats = self.stats.lock();
        match agent {
            Some(name) => stats
                .get(name)
                .map(|s| HashMap::from([(name.to_string(), s.clone())]))
                .unwrap_or_default(),
            None => stats.clone(),
        }
    }

    pub fn get_history(&self, limit: usize, agent_filter: Option<&str>) -> Vec<BusMessage> {
        let history = self.history.lock();
        let recent = history
            .iter()
            .skip(history.len().saturating_sub(limit))
            .cloned();
        match agent_filter {
            Some(agent) => recent.filter(|m| m.involves(agent)).collect(),
            None => recent.collect(),
        }
    }

    /// Cancel every pending future and refuse further sends.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (id, _tx) in drained {
            debug!(id = %short_id(&id), "cancelled pending message");
            // Dropping the sender wakes the receiver with a cancel error.
        }
        info!("mediator shut down");
    }
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ensemble_core::Capability;
    use std::sync::atomic::AtomicU64;

    /// Scripted directory: each agent either replies instantly or sleeps.
    struct TestDirectory {
        agents: Vec<(String, Vec<Capability>, AgentBehavior)>,
        broadcasts_seen: AtomicU64,
    }

    enum AgentBehavior {
        Reply(Value),
        Sleep(Duration),
        Fail(String),
    }

    impl TestDirectory {
        fn new(agents: Vec<(String, Vec<Capability>, AgentBehavior)>) -> Arc<Self> {
            Arc::new(Self {
                agents,
                broadcasts_seen: AtomicU64::new(0),
            })
        }

        fn wire(self: &Arc<Self>, mediator: &Arc<Mediator>) {
            // The weak handle shares the test's strong count.
            let dir: Arc<dyn AgentDirectory> = Arc::clone(self) as Arc<dyn AgentDirectory>;
            mediator.set_directory(Arc::downgrade(&dir));
        }
    }

    #[async_trait]
    impl AgentDirectory for TestDirectory {
        fn agent_names(&self) -> Vec<String> {
            self.agents.iter().map(|(n, _, _)| n.clone()).collect()
        }

        fn has_agent(&self, name: &str) -> bool {
            self.agents.iter().any(|(n, _, _)| n == name)
        }

        fn find_for_capability(&self, capability: Capability, exclude: &[&str]) -> Option<String> {
            self.agents
                .iter()
                .find(|(n, caps, _)| caps.contains(&capability) && !exclude.contains(&n.as_str()))
                .map(|(n, _, _)| n.clone())
        }

        async fn execute(
            &self,
            agent: &str,
            _task: &str,
            context: TaskContext,
        ) -> Result<TaskResult> {
            let (_, _, behavior) = self
                .agents
                .iter()
                .find(|(n, _, _)| n == agent)
                .ok_or_else(|| EnsembleError::Agent(format!("no agent {agent}")))?;
            match behavior {
                AgentBehavior::Reply(value) => {
                    let mut result = TaskResult::ok().with("report", value.clone());
                    if let Some(from) = context.delegated_from() {
                        result.insert("delegated_from", json!(from));
                    }
                    Ok(result)
                }
                AgentBehavior::Sleep(duration) => {
                    tokio::time::sleep(*duration).await;
                    Ok(TaskResult::ok())
                }
                AgentBehavior::Fail(message) => Err(EnsembleError::Agent(message.clone())),
            }
        }

        async fn deliver_broadcast(&self, agent: &str, _content: &Value) -> Result<TaskResult> {
            self.broadcasts_seen.fetch_add(1, Ordering::SeqCst);
            if agent == "broken" {
                return Err(EnsembleError::Agent("broadcast handler failed".into()));
            }
            Ok(TaskResult::ok().with("agent", json!(agent)))
        }
    }

    fn research_reply() -> (String, Vec<Capability>, AgentBehavior) {
        (
            "research".to_string(),
            vec![Capability::WebSearch, Capability::Research],
            AgentBehavior::Reply(json!("found the docs")),
        )
    }

    #[tokio::test]
    async fn delegation_succeeds_and_updates_stats() {
        let mediator = Mediator::new();
        let directory = TestDirectory::new(vec![research_reply()]);
        directory.wire(&mediator);

        let result = mediator
            .delegate_subtask(
                "code_writer",
                "research",
                "find docs for X",
                None,
                MessagePriority::Normal,
                Duration::from_secs(2),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.delegated_to.as_deref(), Some("research"));
        assert!(result.execution_time <= 2.0);
        let inner = result.result.unwrap();
        assert_eq!(inner.get_str("report"), Some("found the docs"));
        // delegation context was stamped for the callee
        assert_eq!(inner.get_str("delegated_from"), Some("code_writer"));

        let stats = mediator.get_stats(None);
        assert_eq!(stats["code_writer"].delegations_made, 1);
        assert_eq!(stats["research"].delegations_received, 1);
        assert_eq!(stats["code_writer"].messages_sent, 1);
        assert_eq!(stats["research"].messages_received, 1);
        assert_eq!(mediator.pending_count(), 0);
    }

    #[tokio::test]
    async fn delegation_timeout_fails_and_releases_the_slot() {
        let mediator = Mediator::new();
        let directory = TestDirectory::new(vec![(
            "research".to_string(),
            vec![Capability::Research],
            AgentBehavior::Sleep(Duration::from_secs(3)),
        )]);
        directory.wire(&mediator);

        let result = mediator
            .delegate_subtask(
                "code_writer",
                "research",
                "slow task",
                None,
                MessagePriority::Normal,
                Duration::from_millis(50),
            )
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        // the response future is gone from the table
        assert_eq!(mediator.pending_count(), 0);
        let stats = mediator.get_stats(Some("code_writer"));
        assert_eq!(stats["code_writer"].delegations_made, 0);
    }

    #[tokio::test]
    async fn delegating_to_unknown_agent_fails_cleanly() {
        let mediator = Mediator::new();
        let directory = TestDirectory::new(vec![research_reply()]);
        directory.wire(&mediator);

        let result = mediator
            .delegate_subtask(
                "code_writer",
                "nonexistent",
                "task",
                None,
                MessagePriority::Normal,
                Duration::from_secs(1),
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn agent_errors_become_failure_responses() {
        let mediator = Mediator::new();
        let directory = TestDirectory::new(vec![(
            "broken".to_string(),
            vec![Capability::Research],
            AgentBehavior::Fail("exploded".into()),
        )]);
        directory.wire(&mediator);

        let result = mediator
            .delegate_subtask(
                "a",
                "broken",
                "task",
                None,
                MessagePriority::Normal,
                Duration::from_secs(1),
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn request_help_routes_by_capability_excluding_requester() {
        let mediator = Mediator::new();
        let directory = TestDirectory::new(vec![
            (
                "code_writer".to_string(),
                vec![Capability::CodeGeneration],
                AgentBehavior::Reply(json!("code")),
            ),
            research_reply(),
        ]);
        directory.wire(&mediator);

        let result = mediator
            .request_help("code_writer", Capability::Research, "look this up", None)
            .await;
        assert!(result.success);
        assert_eq!(result.delegated_to.as_deref(), Some("research"));

        // nobody else offers code generation
        let none = mediator
            .request_help("code_writer", Capability::CodeGeneration, "write it", None)
            .await;
        assert!(!none.success);
        assert!(none.error.unwrap().contains("code_generation"));
    }

    #[tokio::test]
    async fn broadcast_collects_results_and_isolates_failures() {
        let mediator = Mediator::new();
        let directory = TestDirectory::new(vec![
            research_reply(),
            (
                "broken".to_string(),
                vec![Capability::Monitoring],
                AgentBehavior::Reply(json!("unused")),
            ),
            (
                "sender".to_string(),
                vec![Capability::Workflow],
                AgentBehavior::Reply(json!("unused")),
            ),
        ]);
        directory.wire(&mediator);

        let mut content = Map::new();
        content.insert("notice".into(), json!("config reloaded"));
        let result = mediator.broadcast_to_all("sender", content).await.unwrap();

        assert!(result.success());
        let results = result.get("results").unwrap().as_object().unwrap();
        // the sender is excluded, both others responded
        assert_eq!(results.len(), 2);
        assert_eq!(results["research"]["agent"], "research");
        assert!(results["broken"]["error"].as_str().unwrap().contains("failed"));
    }

    #[tokio::test]
    async fn subscribers_observe_sends_and_completions() {
        let mediator = Mediator::new();
        let directory = TestDirectory::new(vec![research_reply()]);
        directory.wire(&mediator);

        let sent = Arc::new(AtomicU64::new(0));
        let completed = Arc::new(AtomicU64::new(0));
        let sent_clone = Arc::clone(&sent);
        let completed_clone = Arc::clone(&completed);

        mediator.subscribe(EVENT_MESSAGE_SENT, move |_| {
            sent_clone.fetch_add(1, Ordering::SeqCst);
        });
        let sub = mediator.subscribe(EVENT_DELEGATION_COMPLETE, move |_| {
            completed_clone.fetch_add(1, Ordering::SeqCst);
        });

        mediator
            .delegate_subtask(
                "a",
                "research",
                "t",
                None,
                MessagePriority::Normal,
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        mediator.unsubscribe(EVENT_DELEGATION_COMPLETE, sub);
        mediator
            .delegate_subtask(
                "a",
                "research",
                "t",
                None,
                MessagePriority::Normal,
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn history_is_bounded_and_filterable() {
        let mediator = Mediator::new();
        let directory = TestDirectory::new(vec![research_reply()]);
        directory.wire(&mediator);

        for i in 0..5 {
            let sender = if i % 2 == 0 { "even" } else { "odd" };
            let message = BusMessage::new(sender, "research", MessageKind::Status).fire_and_forget();
            mediator.send(message).await.unwrap();
        }

        assert_eq!(mediator.get_history(100, None).len(), 5);
        assert_eq!(mediator.get_history(100, Some("even")).len(), 3);
        assert_eq!(mediator.get_history(2, None).len(), 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_futures() {
        let mediator = Mediator::new();
        let directory = TestDirectory::new(vec![(
            "slow".to_string(),
            vec![Capability::Research],
            AgentBehavior::Sleep(Duration::from_secs(10)),
        )]);
        directory.wire(&mediator);

        let sender = Arc::clone(&mediator);
        let in_flight = tokio::spawn(async move {
            let message = BusMessage::new("a", "slow", MessageKind::Delegation)
                .with_content("subtask", json!("t"))
                .with_timeout(Duration::from_secs(10));
            sender.send(message).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mediator.pending_count(), 1);
        mediator.shutdown();
        assert_eq!(mediator.pending_count(), 0);

        let outcome = in_flight.await.unwrap();
        assert!(matches!(outcome, Err(EnsembleError::Internal(_))));

        // further sends are refused
        let message = BusMessage::new("a", "slow", MessageKind::Status).fire_and_forget();
        assert!(mediator.send(message).await.is_err());
    }
}
