use crate::history::{self, Event, EventKind, ExecutionOutcome, ParentLink};
use crate::providers::HistoryStore;
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::{Action, OrchestrationContext, OrchestrationError, TurnInfo, WaitError, decode_json, encode_json};
use async_trait::async_trait;
use semver::Version;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod dispatch;
pub mod options;
pub mod registry;
pub mod replay;
pub mod status;
mod timers;

pub use options::RuntimeOptions;
pub use registry::{
    ActivityHandler, ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder,
    VersionPolicy,
};
pub use replay::{DefaultReplayEngine, ReplayEngine, TurnDecision, TurnResult};
pub use status::{Instance, InstanceStatus};

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-process host: replays instances, runs activities and timers, and persists
/// history through a `HistoryStore`.
///
/// Every change to an instance (replay pass, completion, raised event,
/// termination) happens under that instance's lock, so each execution has a single
/// writer at a time.
pub struct Runtime {
    pub(crate) store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    pub(crate) activities: Arc<ActivityRegistry>,
    engine: Arc<dyn ReplayEngine>,
    pub(crate) options: RuntimeOptions,
    pub(crate) activity_slots: Semaphore,
    wake_tx: mpsc::UnboundedSender<String>,
    instance_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // (instance, execution_id, event_id) of work already handed to a worker
    dispatched: std::sync::Mutex<HashSet<(String, u64, u64)>>,
    // storage failures whose terminal event could not be persisted either
    storage_failures: std::sync::Mutex<HashMap<(String, u64), OrchestrationError>>,
    status_changed: Notify,
    joins: Mutex<Vec<JoinHandle<()>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Runtime {
    /// Start a runtime over a fresh in-memory store.
    pub async fn start(activities: Arc<ActivityRegistry>, orchestrations: OrchestrationRegistry) -> Arc<Self> {
        Self::start_with_options_inner(None, activities, orchestrations, RuntimeOptions::default()).await
    }

    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options_inner(Some(store), activities, orchestrations, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        Self::start_with_options_inner(Some(store), activities, orchestrations, options).await
    }

    async fn start_with_options_inner(
        store: Option<Arc<dyn HistoryStore>>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        crate::logging::init_tracing(&options.log_filter);

        let store =
            store.unwrap_or_else(|| Arc::new(InMemoryHistoryStore::with_cap(options.history_cap)) as Arc<dyn HistoryStore>);
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<String>();
        let runtime = Arc::new(Self {
            store,
            orchestrations,
            activities,
            engine: Arc::new(DefaultReplayEngine::new()),
            activity_slots: Semaphore::new(options.max_concurrent_activities.max(1)),
            options,
            wake_tx,
            instance_locks: Mutex::new(HashMap::new()),
            dispatched: std::sync::Mutex::new(HashSet::new()),
            storage_failures: std::sync::Mutex::new(HashMap::new()),
            status_changed: Notify::new(),
            joins: Mutex::new(Vec::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });

        // wake loop: one replay pass per wake, each on its own task
        let weak = Arc::downgrade(&runtime);
        let handle = tokio::spawn(async move {
            while let Some(instance) = wake_rx.recv().await {
                let Some(rt) = weak.upgrade() else { break };
                tokio::spawn(async move { rt.run_instance(instance).await });
            }
        });
        runtime.joins.lock().await.push(handle);

        if runtime.options.resume_on_start {
            runtime.resume_in_flight().await;
        }
        runtime
    }

    /// Stop background work. In-flight activities are aborted; their results are
    /// recovered by the next runtime started over the same store.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for j in self.joins.lock().await.drain(..) {
            j.abort();
        }
        let tasks: Vec<_> = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for t in tasks {
            t.abort();
        }
        info!("runtime shut down");
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    pub(crate) fn spawn_tracked<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn wake(&self, instance: &str) {
        if self.wake_tx.send(instance.to_string()).is_err() {
            debug!(instance, "wake loop stopped; dropping wake");
        }
    }

    async fn instance_lock(&self, instance: &str) -> Arc<Mutex<()>> {
        self.instance_locks
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .clone()
    }

    /// Drop the map entry for `instance` once no other task holds its lock.
    async fn release_instance_lock(&self, instance: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.instance_locks.lock().await;
        // the map and `lock` are the only holders
        if locks.get(instance).is_some_and(|held| Arc::ptr_eq(held, &lock)) && Arc::strong_count(&lock) == 2 {
            locks.remove(instance);
        }
        // drop under the map lock so concurrent releases see exact counts
        drop(lock);
    }

    /// Returns false if this work item was already dispatched.
    fn mark_dispatched(&self, instance: &str, execution_id: u64, event_id: u64) -> bool {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((instance.to_string(), execution_id, event_id))
    }

    fn forget_dispatched(&self, instance: &str, execution_id: u64) {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(i, e, _)| !(i == instance && *e == execution_id));
    }

    async fn run_instance(self: Arc<Self>, instance: String) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        match self.process_pass(&instance).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(instance = %instance, error = %e, "replay pass raced with another writer")
            }
            Err(e @ OrchestrationError::Storage { .. }) => self.fail_on_storage_error(&instance, e).await,
            Err(e) => error!(instance = %instance, error = %e, "replay pass failed"),
        }
    }

    /// One replay pass over the latest execution, under the instance lock.
    async fn process_pass(self: &Arc<Self>, instance: &str) -> Result<(), OrchestrationError> {
        let lock = self.instance_lock(instance).await;
        let result = {
            let _guard = lock.lock().await;
            self.replay_latest(instance).await
        };
        self.release_instance_lock(instance, lock).await;
        result
    }

    async fn replay_latest(self: &Arc<Self>, instance: &str) -> Result<(), OrchestrationError> {
        let execution_id =
            self.store
                .latest_execution_id(instance)
                .await
                .ok_or_else(|| OrchestrationError::InstanceNotFound {
                    instance: instance.to_string(),
                })?;
        let history = self.store.read_execution(instance, execution_id).await?;
        if history.last().is_some_and(Event::is_terminal) {
            debug!(instance, execution_id, "execution closed; skipping pass");
            return Ok(());
        }
        let (name, version, input, parent) = match history::started(&history) {
            Some((n, v, i, p)) => (n.to_string(), v.to_string(), i.to_string(), p.cloned()),
            None => {
                return Err(OrchestrationError::Storage {
                    operation: "read".to_string(),
                    message: format!("execution {execution_id} of {instance} does not open with OrchestratorStarted"),
                });
            }
        };

        let Some(handler) = self.orchestrations.resolve_recorded(&name, &version) else {
            warn!(instance, name = %name, version = %version, "no handler registered for orchestration");
            let outcome = ExecutionOutcome::Failed {
                error: OrchestrationError::UnregisteredOrchestration { name },
                compensation: None,
            };
            return self
                .finish(instance, execution_id, &history, Vec::new(), outcome, parent)
                .await;
        };

        let info = TurnInfo {
            instance: instance.to_string(),
            execution_id,
            turn_index: history.len() as u64,
        };
        let turn = self.engine.replay(info, history.clone(), handler, input);
        debug!(
            instance,
            execution_id,
            new_events = turn.new_events.len(),
            logs = turn.logs.len(),
            "replay pass finished"
        );

        if let Some(status) = turn.custom_status {
            self.store.set_custom_status(instance, Some(status)).await?;
        }

        match turn.decision {
            TurnDecision::Suspended => {
                if !turn.new_events.is_empty() {
                    self.store.append(instance, execution_id, turn.new_events).await?;
                }
                self.dispatch_actions(instance, execution_id, turn.actions);
                self.status_changed.notify_waiters();
                Ok(())
            }
            TurnDecision::Completed { output } => {
                let outcome = ExecutionOutcome::Completed { output };
                self.finish(instance, execution_id, &history, turn.new_events, outcome, parent)
                    .await
            }
            TurnDecision::Failed { error, compensation } => {
                let outcome = ExecutionOutcome::Failed { error, compensation };
                self.finish(instance, execution_id, &history, turn.new_events, outcome, parent)
                    .await
            }
            TurnDecision::ContinueAsNew {
                input: next_input,
                version: next_version,
            } => {
                let target = next_version.unwrap_or(version);
                if let Err(e) = Version::parse(&target) {
                    let outcome = ExecutionOutcome::Failed {
                        error: OrchestrationError::application(format!("invalid continue-as-new version '{target}': {e}")),
                        compensation: None,
                    };
                    return self
                        .finish(instance, execution_id, &history, Vec::new(), outcome, parent)
                        .await;
                }
                let closing = Event::new(
                    history::next_event_id(&history),
                    now_ms(),
                    EventKind::ContinuedAsNew {
                        input: next_input.clone(),
                    },
                );
                let started = Event::new(
                    1,
                    now_ms(),
                    EventKind::OrchestratorStarted {
                        name,
                        version: target,
                        input: next_input,
                        parent,
                    },
                );
                let next = self
                    .store
                    .continue_as_new(instance, execution_id, closing, started)
                    .await?;
                self.forget_dispatched(instance, execution_id);
                info!(instance, execution_id, next_execution_id = next, "continued as new");
                self.status_changed.notify_waiters();
                self.wake(instance);
                Ok(())
            }
            TurnDecision::NonDeterministic { message } => {
                error!(instance, execution_id, error = %message, "nondeterministic replay; failing instance");
                let outcome = ExecutionOutcome::Failed {
                    error: OrchestrationError::NonDeterminism { message },
                    compensation: None,
                };
                // nothing from the diverged pass is persisted
                self.finish(instance, execution_id, &history, Vec::new(), outcome, parent)
                    .await
            }
        }
    }

    /// Append `events` plus the terminal event, then report to the parent.
    async fn finish(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        history: &[Event],
        mut events: Vec<Event>,
        outcome: ExecutionOutcome,
        parent: Option<ParentLink>,
    ) -> Result<(), OrchestrationError> {
        let next_id = events
            .last()
            .map(|e| e.event_id + 1)
            .unwrap_or_else(|| history::next_event_id(history));
        events.push(Event::new(
            next_id,
            now_ms(),
            EventKind::OrchestratorCompleted {
                outcome: outcome.clone(),
            },
        ));
        self.store.append(instance, execution_id, events).await?;
        self.forget_dispatched(instance, execution_id);

        match &outcome {
            ExecutionOutcome::Completed { .. } => info!(instance, execution_id, "orchestration completed"),
            ExecutionOutcome::Failed { error, compensation } => warn!(
                instance,
                execution_id,
                error = %error,
                compensated = compensation.is_some(),
                "orchestration failed"
            ),
            ExecutionOutcome::Terminated { reason } => info!(instance, execution_id, reason = %reason, "orchestration terminated"),
        }
        if let Some(parent) = parent {
            self.notify_parent(parent, &outcome);
        }
        self.status_changed.notify_waiters();
        Ok(())
    }

    fn dispatch_actions(self: &Arc<Self>, instance: &str, execution_id: u64, actions: Vec<Action>) {
        for action in actions {
            let event_id = match &action {
                Action::CallActivity { event_id, .. }
                | Action::CreateTimer { event_id, .. }
                | Action::WaitExternal { event_id, .. }
                | Action::StartSubOrchestration { event_id, .. } => *event_id,
                Action::ContinueAsNew { .. } => continue,
            };
            if !self.mark_dispatched(instance, execution_id, event_id) {
                debug!(instance, execution_id, event_id, "already dispatched");
                continue;
            }
            match action {
                Action::CallActivity {
                    event_id,
                    name,
                    input,
                    retry,
                } => dispatch::spawn_activity(self, instance.to_string(), execution_id, event_id, name, input, retry),
                Action::CreateTimer { event_id, fire_at_ms } => {
                    timers::schedule_timer(self, instance.to_string(), execution_id, event_id, fire_at_ms)
                }
                Action::WaitExternal { event_id, name } => {
                    debug!(instance, execution_id, event_id, name = %name, "waiting for external event")
                }
                Action::StartSubOrchestration {
                    event_id,
                    name,
                    version,
                    instance: child,
                    input,
                } => {
                    let parent = ParentLink {
                        instance: instance.to_string(),
                        execution_id,
                        source_event_id: event_id,
                    };
                    dispatch::spawn_sub_orchestration(self, parent, name, version, child, input)
                }
                Action::ContinueAsNew { .. } => {}
            }
        }
    }

    /// Append a completion to the latest execution and wake the instance.
    /// Returns false when the completion was dropped: stale execution, closed
    /// execution, or already recorded.
    pub(crate) async fn deliver(
        self: &Arc<Self>,
        instance: &str,
        execution_id: Option<u64>,
        kind: EventKind,
        timestamp_ms: u64,
    ) -> Result<bool, OrchestrationError> {
        let lock = self.instance_lock(instance).await;
        let recorded = {
            let _guard = lock.lock().await;
            self.append_completion(instance, execution_id, kind, timestamp_ms).await
        };
        self.release_instance_lock(instance, lock).await;
        match recorded {
            Ok(true) => {
                self.wake(instance);
                Ok(true)
            }
            Err(e @ OrchestrationError::Storage { .. }) => {
                self.fail_on_storage_error(instance, e.clone()).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn append_completion(
        &self,
        instance: &str,
        execution_id: Option<u64>,
        kind: EventKind,
        timestamp_ms: u64,
    ) -> Result<bool, OrchestrationError> {
        let latest = self
            .store
            .latest_execution_id(instance)
            .await
            .ok_or_else(|| OrchestrationError::InstanceNotFound {
                instance: instance.to_string(),
            })?;
        if let Some(exec) = execution_id
            && exec != latest
        {
            debug!(instance, execution_id = exec, latest, "dropping completion for an older execution");
            return Ok(false);
        }
        let history = self.store.read_execution(instance, latest).await?;
        if history.last().is_some_and(Event::is_terminal) {
            debug!(instance, execution_id = latest, "dropping completion for a closed execution");
            return Ok(false);
        }
        let event = Event::new(history::next_event_id(&history), timestamp_ms, kind);
        let label = event.kind_name();
        match self.store.append(instance, latest, vec![event]).await {
            Ok(()) => {
                debug!(instance, execution_id = latest, event = label, "recorded completion");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(instance, execution_id = latest, error = %e, "completion already recorded");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Storage errors are not retried: close the latest execution as failed. When
    /// even the terminal event cannot be written, keep the failure in memory so
    /// `get_status` still reports it.
    async fn fail_on_storage_error(self: &Arc<Self>, instance: &str, error: OrchestrationError) {
        error!(instance, error = %error, "storage error; failing instance");
        let lock = self.instance_lock(instance).await;
        let closed = {
            let _guard = lock.lock().await;
            self.close_failed(instance, &error).await
        };
        self.release_instance_lock(instance, lock).await;
        match closed {
            Ok(()) => {}
            Err((execution_id, e)) => {
                error!(instance, execution_id, error = %e, "could not record storage failure");
                self.storage_failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert((instance.to_string(), execution_id), error);
                self.forget_dispatched(instance, execution_id);
                self.status_changed.notify_waiters();
            }
        }
    }

    async fn close_failed(
        self: &Arc<Self>,
        instance: &str,
        error: &OrchestrationError,
    ) -> Result<(), (u64, OrchestrationError)> {
        let Some(execution_id) = self.store.latest_execution_id(instance).await else {
            return Ok(());
        };
        let history = self
            .store
            .read_execution(instance, execution_id)
            .await
            .map_err(|e| (execution_id, e.into()))?;
        if history.last().is_some_and(Event::is_terminal) {
            return Ok(());
        }
        let parent = history::started(&history).and_then(|(_, _, _, p)| p.cloned());
        let outcome = ExecutionOutcome::Failed {
            error: error.clone(),
            compensation: None,
        };
        // none of the failed pass's new events are kept
        self.finish(instance, execution_id, &history, Vec::new(), outcome, parent)
            .await
            .map_err(|e| (execution_id, e))
    }

    /// Failure recorded by `fail_on_storage_error` that never reached the store.
    pub(crate) fn unrecorded_failure(&self, instance: &str, execution_id: u64) -> Option<OrchestrationError> {
        self.storage_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(instance.to_string(), execution_id))
            .cloned()
    }

    fn notify_parent(self: &Arc<Self>, parent: ParentLink, outcome: &ExecutionOutcome) {
        let source_event_id = parent.source_event_id;
        let kind = match outcome {
            ExecutionOutcome::Completed { output } => EventKind::SubOrchestrationCompleted {
                source_event_id,
                result: output.clone(),
            },
            ExecutionOutcome::Failed { error, .. } => EventKind::SubOrchestrationFailed {
                source_event_id,
                error: error.to_string(),
            },
            ExecutionOutcome::Terminated { reason } => EventKind::SubOrchestrationFailed {
                source_event_id,
                error: format!("terminated: {reason}"),
            },
        };
        let rt = self.clone();
        self.spawn_tracked(async move {
            if let Err(e) = rt
                .deliver(&parent.instance, Some(parent.execution_id), kind, now_ms())
                .await
            {
                warn!(parent = %parent.instance, error = %e, "failed to report child outcome to parent");
            }
        });
    }

    /// If `child` already finished, report its outcome to `parent` again. Covers a
    /// crash between the child's terminal append and the parent's completion.
    pub(crate) async fn report_if_finished(self: &Arc<Self>, child: &str, parent: ParentLink) {
        let history = match self.store.read(child).await {
            Ok(h) => h,
            Err(e) => {
                warn!(child, error = %e, "failed to read child history");
                return;
            }
        };
        if let Some(Event {
            kind: EventKind::OrchestratorCompleted { outcome },
            ..
        }) = history.last()
        {
            self.notify_parent(parent, outcome);
        }
    }

    /// Re-dispatch outstanding work for every open execution in the store.
    async fn resume_in_flight(self: &Arc<Self>) {
        for instance in self.store.list_instances().await {
            let Some(execution_id) = self.store.latest_execution_id(&instance).await else {
                continue;
            };
            let history = match self.store.read_execution(&instance, execution_id).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(instance = %instance, error = %e, "skipping unreadable instance on resume");
                    continue;
                }
            };
            if history.is_empty() || history.last().is_some_and(Event::is_terminal) {
                continue;
            }
            let outstanding = outstanding_actions(&history);
            info!(instance = %instance, execution_id, outstanding = outstanding.len(), "resuming instance");
            self.dispatch_actions(&instance, execution_id, outstanding);
            self.wake(&instance);
        }
    }

    // ---------------- client-facing operations

    /// Create and start `instance`. Starting an existing instance is accepted and
    /// does nothing.
    pub async fn start_orchestration(
        self: &Arc<Self>,
        instance: &str,
        name: &str,
        input: impl Into<String>,
    ) -> Result<(), OrchestrationError> {
        self.start_internal(instance, name, None, input.into(), None).await
    }

    /// Start on an exact handler version.
    pub async fn start_orchestration_versioned(
        self: &Arc<Self>,
        instance: &str,
        name: &str,
        version: impl AsRef<str>,
        input: impl Into<String>,
    ) -> Result<(), OrchestrationError> {
        self.start_internal(instance, name, Some(version.as_ref()), input.into(), None)
            .await
    }

    pub async fn start_orchestration_typed<In: Serialize>(
        self: &Arc<Self>,
        instance: &str,
        name: &str,
        input: &In,
    ) -> Result<(), OrchestrationError> {
        let payload = encode_json(input).map_err(|e| OrchestrationError::application(format!("encode: {e}")))?;
        self.start_orchestration(instance, name, payload).await
    }

    /// Start under a fresh uuid v4 instance id and return it.
    pub async fn schedule_new_orchestration(
        self: &Arc<Self>,
        name: &str,
        input: impl Into<String>,
    ) -> Result<String, OrchestrationError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration(&instance, name, input).await?;
        Ok(instance)
    }

    pub(crate) async fn start_internal(
        self: &Arc<Self>,
        instance: &str,
        name: &str,
        version: Option<&str>,
        input: String,
        parent: Option<ParentLink>,
    ) -> Result<(), OrchestrationError> {
        let version = match version {
            Some(v) => {
                let parsed = Version::parse(v)
                    .map_err(|e| OrchestrationError::application(format!("invalid version '{v}': {e}")))?;
                if self.orchestrations.resolve_exact(name, &parsed).is_none() {
                    return Err(OrchestrationError::UnregisteredOrchestration {
                        name: format!("{name}@{parsed}"),
                    });
                }
                parsed
            }
            None => {
                self.orchestrations
                    .resolve_for_start(name)
                    .await
                    .ok_or_else(|| OrchestrationError::UnregisteredOrchestration { name: name.to_string() })?
                    .0
            }
        };
        let started = Event::new(
            1,
            now_ms(),
            EventKind::OrchestratorStarted {
                name: name.to_string(),
                version: version.to_string(),
                input,
                parent,
            },
        );
        match self.store.create_instance(instance, started).await {
            Ok(()) => info!(instance, name, version = %version, "orchestration started"),
            Err(e) if e.is_conflict() => debug!(instance, name, "instance exists; start deduplicated"),
            Err(e) => return Err(e.into()),
        }
        self.wake(instance);
        Ok(())
    }

    /// Deliver a named external event. Events raised before the orchestration
    /// subscribes are buffered in history.
    pub async fn raise_event(
        self: &Arc<Self>,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), OrchestrationError> {
        let name = name.into();
        let kind = EventKind::ExternalEventReceived {
            name: name.clone(),
            data: data.into(),
        };
        if self.deliver(instance, None, kind, now_ms()).await? {
            info!(instance, name = %name, "external event raised");
        } else {
            warn!(instance, name = %name, "instance finished; external event dropped");
        }
        Ok(())
    }

    /// Close the latest execution with a `Terminated` outcome. The next pass sees
    /// the terminal event before any orchestrator code runs.
    pub async fn terminate_instance(
        self: &Arc<Self>,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), OrchestrationError> {
        let reason = reason.into();
        let lock = self.instance_lock(instance).await;
        let result = {
            let _guard = lock.lock().await;
            self.terminate_latest(instance, reason).await
        };
        self.release_instance_lock(instance, lock).await;
        result
    }

    async fn terminate_latest(self: &Arc<Self>, instance: &str, reason: String) -> Result<(), OrchestrationError> {
        let execution_id =
            self.store
                .latest_execution_id(instance)
                .await
                .ok_or_else(|| OrchestrationError::InstanceNotFound {
                    instance: instance.to_string(),
                })?;
        let history = self.store.read_execution(instance, execution_id).await?;
        if history.last().is_some_and(Event::is_terminal) {
            debug!(instance, execution_id, "terminate ignored; execution already closed");
            return Ok(());
        }
        let parent = history::started(&history).and_then(|(_, _, _, p)| p.cloned());
        self.finish(
            instance,
            execution_id,
            &history,
            Vec::new(),
            ExecutionOutcome::Terminated { reason },
            parent,
        )
        .await
    }

    /// Wait until the latest execution reaches a terminal status.
    pub async fn wait_for_completion(&self, instance: &str, timeout: Duration) -> Result<Instance, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.status_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.get_status(instance).await {
                Ok(s) if s.status.is_terminal() => return Ok(s),
                Ok(_) | Err(OrchestrationError::InstanceNotFound { .. }) => {}
                Err(e) => return Err(WaitError::Other(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.options.status_poll_interval()) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// `Ok(Ok(output))` on completion, `Ok(Err(error))` on any other terminal status.
    pub async fn wait_for_completion_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        let status = self.wait_for_completion(instance, timeout).await?;
        match (status.status, status.output, status.error) {
            (InstanceStatus::Completed, Some(output), _) => decode_json::<Out>(&output)
                .map(Ok)
                .map_err(|e| WaitError::Other(format!("decode failed: {e}"))),
            (_, _, Some(error)) => Ok(Err(error.to_string())),
            (other, _, None) => Ok(Err(format!("instance ended as {other:?}"))),
        }
    }
}

/// Scheduling events of an open execution that have no completion yet.
fn outstanding_actions(history: &[Event]) -> Vec<Action> {
    let completed: HashSet<u64> = history.iter().filter_map(Event::source_event_id).collect();
    history
        .iter()
        .filter(|e| !completed.contains(&e.event_id))
        .filter_map(|e| match &e.kind {
            EventKind::TaskScheduled { name, input, retry } => Some(Action::CallActivity {
                event_id: e.event_id,
                name: name.clone(),
                input: input.clone(),
                retry: retry.clone(),
            }),
            EventKind::TimerCreated { fire_at_ms } => Some(Action::CreateTimer {
                event_id: e.event_id,
                fire_at_ms: *fire_at_ms,
            }),
            EventKind::SubOrchestrationScheduled {
                name,
                version,
                instance,
                input,
            } => Some(Action::StartSubOrchestration {
                event_id: e.event_id,
                name: name.clone(),
                version: version.clone(),
                instance: instance.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect()
}
