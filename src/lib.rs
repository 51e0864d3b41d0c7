//! Deterministic replay-driven orchestration core.
//!
//! Orchestrations are ordinary async functions that receive an
//! [`OrchestrationContext`]. Every durable call (activity, timer, external event,
//! sub-orchestration) is recorded as an append-only [`Event`]; after a restart the
//! orchestrator is re-run from the top against the recorded history and every call
//! that already happened resolves from history instead of being executed again.
//!
//! - Data model: [`Event`], [`EventKind`], [`Action`]
//! - Driver: [`run_turn`], [`run_turn_with`] and [`Executor`]
//! - In-process host: [`runtime::Runtime`] and [`Client`]
//! - Compensation: [`saga::Saga`]
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

pub mod client;
pub mod error;
pub mod futures;
pub mod history;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod saga;

pub use client::Client;
pub use error::{OrchestrationError, WaitError};
pub use futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use history::{Event, EventKind, ExecutionOutcome, ParentLink};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::{
    ActivityRegistry, Instance, InstanceStatus, OrchestrationHandler, OrchestrationRegistry,
    OrchestrationRegistryBuilder, Runtime, RuntimeOptions,
};
pub use saga::{Compensation, CompensationReport, Saga, SagaError, SagaStatus, UnwindPolicy};

use crate::_typed_codec::Codec;
use crate::futures::Request;
use crate::logging::LogLevel;
use serde::Serialize;
use serde::de::DeserializeOwned;

// Typed I/O helpers. Payloads stay strings on the wire and in history.
mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // A bare JSON string is stored as its raw content
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

pub(crate) fn encode_json<T: Serialize>(v: &T) -> Result<String, String> {
    _typed_codec::Json::encode(v)
}

pub(crate) fn decode_json<T: DeserializeOwned>(s: &str) -> Result<T, String> {
    _typed_codec::Json::decode(s)
}

/// Decisions produced by a replay pass. The host materializes them; the
/// matching scheduling events are already part of the pass's history.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CallActivity {
        event_id: u64,
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    CreateTimer {
        event_id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        event_id: u64,
        name: String,
    },
    StartSubOrchestration {
        event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    /// Terminal for the current execution.
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
}

/// Identity of the pass being replayed.
#[derive(Debug, Clone)]
pub struct TurnInfo {
    pub instance: String,
    pub execution_id: u64,
    pub turn_index: u64,
}

impl Default for TurnInfo {
    fn default() -> Self {
        Self {
            instance: "instance".to_string(),
            execution_id: 1,
            turn_index: 0,
        }
    }
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    execution_id: u64,
    version: String,
    turn_index: u64,

    history: Vec<Event>,
    baseline_len: usize,
    // event ids of scheduling events in history order; the cursor walks this list
    scheduling: Vec<u64>,
    baseline_scheduling: usize,
    cursor: usize,
    next_event_id: u64,

    now_ms: u64,
    actions: Vec<Action>,
    nondeterminism: Option<String>,
    compensation: Option<CompensationReport>,
    custom_status: Option<String>,
    log_buffer: Vec<(LogLevel, String)>,
}

impl CtxInner {
    fn new(history: Vec<Event>, info: TurnInfo) -> Self {
        let scheduling: Vec<u64> = history.iter().filter(|e| e.is_scheduling()).map(|e| e.event_id).collect();
        let version = history::started(&history)
            .map(|(_, v, _, _)| v.to_string())
            .unwrap_or_default();
        Self {
            instance: info.instance,
            execution_id: info.execution_id,
            version,
            turn_index: info.turn_index,
            now_ms: history.first().map(|e| e.timestamp_ms).unwrap_or(0),
            next_event_id: history::next_event_id(&history),
            baseline_len: history.len(),
            baseline_scheduling: scheduling.len(),
            scheduling,
            history,
            cursor: 0,
            actions: Vec::new(),
            nondeterminism: None,
            compensation: None,
            custom_status: None,
            log_buffer: Vec::new(),
        }
    }

    fn event(&self, id: u64) -> Option<&Event> {
        let idx = usize::try_from(id.checked_sub(1)?).ok()?;
        match self.history.get(idx) {
            Some(e) if e.event_id == id => Some(e),
            _ => self.history.iter().find(|e| e.event_id == id),
        }
    }

    fn is_replaying(&self) -> bool {
        self.cursor < self.baseline_scheduling
    }

    /// Bind a durable call to its scheduling event: the next recorded one if it
    /// matches, or a freshly appended one past the end of recorded history.
    fn claim(&mut self, request: &Request) -> Option<u64> {
        if self.nondeterminism.is_some() {
            return None;
        }
        if let Some(&id) = self.scheduling.get(self.cursor) {
            let recorded = match self.event(id) {
                Some(e) => e,
                None => {
                    self.nondeterminism = Some(format!("scheduling event {id} missing from history"));
                    return None;
                }
            };
            if let Err(msg) = request.matches(recorded) {
                self.nondeterminism = Some(msg);
                return None;
            }
            self.cursor += 1;
            return Some(id);
        }
        let id = self.next_event_id;
        self.next_event_id += 1;
        let child_instance = format!("{}::{}::sub::{id}", self.instance, self.execution_id);
        self.history
            .push(Event::new(id, self.now_ms, request.to_event_kind(&child_instance)));
        self.actions.push(request.to_action(id, &child_instance));
        self.scheduling.push(id);
        self.cursor += 1;
        Some(id)
    }

    /// Completion for a claimed call: (history position, timestamp, output).
    fn resolve(&self, id: u64, request: &Request) -> Option<(usize, u64, DurableOutput)> {
        if let Request::External { name } = request {
            let ordinal = self
                .history
                .iter()
                .filter(|e| e.event_id < id && matches!(&e.kind, EventKind::ExternalSubscribed { name: n } if n == name))
                .count();
            return self
                .history
                .iter()
                .enumerate()
                .filter_map(|(pos, e)| match &e.kind {
                    EventKind::ExternalEventReceived { name: n, data } if n == name => {
                        Some((pos, e.timestamp_ms, DurableOutput::External(data.clone())))
                    }
                    _ => None,
                })
                .nth(ordinal);
        }
        self.history.iter().enumerate().find_map(|(pos, e)| {
            if e.source_event_id() != Some(id) {
                return None;
            }
            let out = match &e.kind {
                EventKind::TaskCompleted { result, .. } => DurableOutput::Activity(Ok(result.clone())),
                EventKind::TaskFailed { error, .. } => DurableOutput::Activity(Err(error.clone())),
                EventKind::TimerFired { .. } => DurableOutput::Timer,
                EventKind::SubOrchestrationCompleted { result, .. } => {
                    DurableOutput::SubOrchestration(Ok(result.clone()))
                }
                EventKind::SubOrchestrationFailed { error, .. } => DurableOutput::SubOrchestration(Err(error.clone())),
                _ => return None,
            };
            Some((pos, e.timestamp_ms, out))
        })
    }

    fn observe(&mut self, timestamp_ms: u64) {
        self.now_ms = self.now_ms.max(timestamp_ms);
    }
}

/// Handle passed to orchestrator code. Cheap to clone; all clones share one pass.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Context over `history` with default identity.
    pub fn new(history: Vec<Event>) -> Self {
        Self::with_info(history, TurnInfo::default())
    }

    pub fn with_info(history: Vec<Event>, info: TurnInfo) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history, info))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.lock().execution_id
    }

    /// Version of the orchestration handler running this execution.
    pub fn version(&self) -> String {
        self.lock().version.clone()
    }

    /// Host-assigned pass counter, for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }

    /// True while the orchestrator is re-executing steps recorded before this pass.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    /// Deterministic logical time: the start timestamp, advanced to the timestamp
    /// of each completion as the orchestrator observes it.
    pub fn current_time_ms(&self) -> u64 {
        self.lock().now_ms
    }

    /// Publish progress for `get_status`. Last call in a pass wins.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.lock().custom_status = Some(status.into());
    }

    /// Replay-safe log line. Dropped while replaying.
    pub fn trace(&self, level: LogLevel, message: impl Into<String>) {
        let mut inner = self.lock();
        if inner.is_replaying() {
            return;
        }
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(instance = %inner.instance, turn_idx = inner.turn_index, "{message}"),
            LogLevel::Info => tracing::info!(instance = %inner.instance, turn_idx = inner.turn_index, "{message}"),
            LogLevel::Warn => tracing::warn!(instance = %inner.instance, turn_idx = inner.turn_index, "{message}"),
            LogLevel::Error => tracing::error!(instance = %inner.instance, turn_idx = inner.turn_index, "{message}"),
        }
        inner.log_buffer.push((level, message));
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(LogLevel::Info, message);
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(LogLevel::Warn, message);
    }
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace(LogLevel::Error, message);
    }
    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace(LogLevel::Debug, message);
    }

    pub(crate) fn record_compensation(&self, report: CompensationReport) {
        self.lock().compensation = Some(report);
    }

    fn future(&self, request: Request) -> DurableFuture {
        DurableFuture::new(self.clone(), request)
    }

    /// Schedule an activity. Retries follow the runtime's default policy.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.future(Request::Activity {
            name: name.into(),
            input: input.into(),
            retry: None,
        })
    }

    /// Schedule an activity with an explicit retry policy, recorded in history.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> DurableFuture {
        self.future(Request::Activity {
            name: name.into(),
            input: input.into(),
            retry: Some(policy),
        })
    }

    /// Serialize `input` as JSON; pair with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        self.schedule_activity(name, encode_or_empty(input))
    }

    /// Timer firing at an absolute logical time.
    pub fn create_timer(&self, fire_at_ms: u64) -> DurableFuture {
        self.future(Request::Timer { fire_at_ms })
    }

    /// Timer firing `delay` after the current logical time.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        let fire_at_ms = self
            .current_time_ms()
            .saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self.create_timer(fire_at_ms)
    }

    /// Wait for an external event raised by name.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        self.future(Request::External { name: name.into() })
    }

    /// Child orchestration with instance id `"{parent}::{execution_id}::sub::{event_id}"`.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_sub_orchestration_versioned(name, None, input)
    }

    /// Child pinned to `version`; `None` lets the registry policy choose.
    pub fn schedule_sub_orchestration_versioned(
        &self,
        name: impl Into<String>,
        version: Option<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        self.future(Request::SubOrchestration {
            name: name.into(),
            version,
            input: input.into(),
        })
    }

    pub fn schedule_sub_orchestration_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        self.schedule_sub_orchestration(name, encode_or_empty(input))
    }

    /// End this execution and start a fresh one with `input`.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        self.record_continue(input.into(), None);
    }

    pub fn continue_as_new_typed<In: Serialize>(&self, input: &In) {
        self.record_continue(encode_or_empty(input), None);
    }

    /// Continue on a specific handler version.
    pub fn continue_as_new_versioned(&self, version: impl Into<String>, input: impl Into<String>) {
        self.record_continue(input.into(), Some(version.into()));
    }

    fn record_continue(&self, input: String, version: Option<String>) {
        let mut inner = self.lock();
        if inner.actions.iter().any(|a| matches!(a, Action::ContinueAsNew { .. })) {
            return;
        }
        inner.actions.push(Action::ContinueAsNew { input, version });
    }

    /// Wait for every future; outputs come back in input order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    /// Wait for the first future to complete, judged by history position.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(self.clone(), futures)
    }

    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        self.select(vec![a, b])
    }

    /// Join activity or sub-orchestration futures and decode each result.
    pub async fn call_all_typed<Out: DeserializeOwned>(&self, futures: Vec<DurableFuture>) -> Vec<Result<Out, String>> {
        self.join(futures)
            .await
            .into_iter()
            .map(|out| match out {
                DurableOutput::Activity(r) | DurableOutput::SubOrchestration(r) => r.and_then(|s| decode_json(&s)),
                DurableOutput::External(s) => decode_json(&s),
                DurableOutput::Timer => decode_json("null"),
            })
            .collect()
    }
}

fn encode_or_empty<T: Serialize>(v: &T) -> String {
    encode_json(v).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to encode orchestration payload");
        String::new()
    })
}

/// Everything one replay pass produced.
#[derive(Debug)]
pub struct Turn<O> {
    /// Recorded history plus the scheduling events this pass appended.
    pub history: Vec<Event>,
    /// Only the events this pass appended.
    pub new_events: Vec<Event>,
    pub actions: Vec<Action>,
    pub logs: Vec<(LogLevel, String)>,
    pub output: Option<O>,
    pub nondeterminism: Option<String>,
    pub compensation: Option<CompensationReport>,
    pub custom_status: Option<String>,
}

impl<O> Turn<O> {
    pub fn is_complete(&self) -> bool {
        self.output.is_some()
    }

    pub fn continue_as_new(&self) -> Option<(&str, Option<&str>)> {
        self.actions.iter().find_map(|a| match a {
            Action::ContinueAsNew { input, version } => Some((input.as_str(), version.as_deref())),
            _ => None,
        })
    }
}

/// Replay the orchestrator once against `history`.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> Turn<O>
where
    F: Future<Output = O>,
{
    run_turn_with(TurnInfo::default(), history, orchestrator)
}

/// Same as `run_turn`, with the instance identity the context reports.
pub fn run_turn_with<O, F>(
    info: TurnInfo,
    history: Vec<Event>,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> Turn<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::with_info(history, info);
    let polled = {
        let mut fut = Box::pin(orchestrator(ctx.clone()));
        let waker = ::futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        fut.as_mut().poll(&mut cx)
    };
    let output = match polled {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };

    let mut inner = ctx.lock();
    if output.is_some() && inner.nondeterminism.is_none() && inner.cursor < inner.baseline_scheduling {
        let unclaimed = inner.baseline_scheduling - inner.cursor;
        let next = inner.scheduling[inner.cursor];
        let kind = inner.event(next).map(Event::kind_name).unwrap_or("unknown");
        inner.nondeterminism = Some(format!(
            "orchestration completed with {unclaimed} recorded scheduling event(s) not replayed, next is {kind} at event {next}"
        ));
    }
    let new_events = inner.history[inner.baseline_len..].to_vec();
    Turn {
        history: std::mem::take(&mut inner.history),
        new_events,
        actions: std::mem::take(&mut inner.actions),
        logs: std::mem::take(&mut inner.log_buffer),
        output,
        nondeterminism: inner.nondeterminism.take(),
        compensation: inner.compensation.take(),
        custom_status: inner.custom_status.take(),
    }
}

/// Single-threaded host for tests: alternate replay passes with a caller-supplied
/// step that turns actions into completion events.
pub struct Executor;

impl Executor {
    /// `execute_actions` must append at least one completion whenever the
    /// orchestrator is suspended, otherwise this loops forever.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let turn = run_turn(history, &orchestrator);
            history = turn.history;
            if let Some(out) = turn.output {
                return (history, out);
            }
            execute_actions(turn.actions, &mut history);
        }
    }
}
