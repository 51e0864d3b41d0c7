use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::history::{Event, EventKind};
use crate::retry::RetryPolicy;
use crate::{Action, OrchestrationContext, decode_json};

/// What a durable call asked for. Compared against the recorded scheduling event
/// on replay.
#[derive(Debug, Clone)]
pub(crate) enum Request {
    Activity {
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    Timer {
        fire_at_ms: u64,
    },
    External {
        name: String,
    },
    SubOrchestration {
        name: String,
        version: Option<String>,
        input: String,
    },
}

impl Request {
    fn label(&self) -> String {
        match self {
            Request::Activity { name, .. } => format!("TaskScheduled '{name}'"),
            Request::Timer { .. } => "TimerCreated".to_string(),
            Request::External { name } => format!("ExternalSubscribed '{name}'"),
            Request::SubOrchestration { name, .. } => format!("SubOrchestrationScheduled '{name}'"),
        }
    }

    /// Timers match by kind only; everything else by kind, name and input.
    pub(crate) fn matches(&self, recorded: &Event) -> Result<(), String> {
        let ok = match (self, &recorded.kind) {
            (Request::Activity { name, input, .. }, EventKind::TaskScheduled { name: n, input: i, .. }) => {
                name == n && input == i
            }
            (Request::Timer { .. }, EventKind::TimerCreated { .. }) => true,
            (Request::External { name }, EventKind::ExternalSubscribed { name: n }) => name == n,
            (
                Request::SubOrchestration { name, input, .. },
                EventKind::SubOrchestrationScheduled { name: n, input: i, .. },
            ) => name == n && input == i,
            _ => false,
        };
        if ok {
            return Ok(());
        }
        let recorded_label = match &recorded.kind {
            EventKind::TaskScheduled { name, .. } => format!("TaskScheduled '{name}'"),
            EventKind::ExternalSubscribed { name } => format!("ExternalSubscribed '{name}'"),
            EventKind::SubOrchestrationScheduled { name, .. } => format!("SubOrchestrationScheduled '{name}'"),
            _ => recorded.kind_name().to_string(),
        };
        Err(format!(
            "orchestrator scheduled {} but history has {recorded_label} at event {}",
            self.label(),
            recorded.event_id
        ))
    }

    pub(crate) fn to_event_kind(&self, child_instance: &str) -> EventKind {
        match self.clone() {
            Request::Activity { name, input, retry } => EventKind::TaskScheduled { name, input, retry },
            Request::Timer { fire_at_ms } => EventKind::TimerCreated { fire_at_ms },
            Request::External { name } => EventKind::ExternalSubscribed { name },
            Request::SubOrchestration { name, version, input } => EventKind::SubOrchestrationScheduled {
                name,
                version,
                instance: child_instance.to_string(),
                input,
            },
        }
    }

    pub(crate) fn to_action(&self, event_id: u64, child_instance: &str) -> Action {
        match self.clone() {
            Request::Activity { name, input, retry } => Action::CallActivity {
                event_id,
                name,
                input,
                retry,
            },
            Request::Timer { fire_at_ms } => Action::CreateTimer { event_id, fire_at_ms },
            Request::External { name } => Action::WaitExternal { event_id, name },
            Request::SubOrchestration { name, version, input } => Action::StartSubOrchestration {
                event_id,
                name,
                version,
                instance: child_instance.to_string(),
                input,
            },
        }
    }
}

/// Result of any durable call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

/// Future for one durable call. Scheduling happens on first poll, so a future that
/// is created but never awaited leaves no trace in history.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    request: Request,
    claimed: Option<u64>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, request: Request) -> Self {
        Self {
            ctx,
            request,
            claimed: None,
        }
    }

    /// Sequence number of the scheduling event, once polled.
    pub fn event_id(&self) -> Option<u64> {
        self.claimed
    }

    fn ensure_claimed(&mut self) -> Option<u64> {
        if self.claimed.is_none() {
            self.claimed = self.ctx.lock().claim(&self.request);
        }
        self.claimed
    }

    /// Position of this call's completion in history without consuming it.
    fn peek(&mut self) -> Option<(usize, u64, DurableOutput)> {
        let id = self.ensure_claimed()?;
        self.ctx.lock().resolve(id, &self.request)
    }

    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => panic!("into_activity used on non-activity future: {other:?}"),
        }
    }

    pub async fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_activity().await?;
        decode_json(&s)
    }

    pub async fn into_timer(self) {
        match self.await {
            DurableOutput::Timer => {}
            other => panic!("into_timer used on non-timer future: {other:?}"),
        }
    }

    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(data) => data,
            other => panic!("into_event used on non-external future: {other:?}"),
        }
    }

    pub async fn into_event_typed<T: serde::de::DeserializeOwned>(self) -> Result<T, String> {
        decode_json(&self.into_event().await)
    }

    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            other => panic!("into_sub_orchestration used on non-sub-orchestration future: {other:?}"),
        }
    }

    pub async fn into_sub_orchestration_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_sub_orchestration().await?;
        decode_json(&s)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.peek() {
            Some((_, ts, out)) => {
                this.ctx.lock().observe(ts);
                Poll::Ready(out)
            }
            None => Poll::Pending,
        }
    }
}

/// Output of `ctx.join`: every child's output in the order the children were given.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
    done: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        let done = children.iter().map(|_| None).collect();
        Self { children, done }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // poll every child so each one claims its scheduling event in input order
        for (child, slot) in this.children.iter_mut().zip(this.done.iter_mut()) {
            if slot.is_none()
                && let Poll::Ready(out) = Pin::new(child).poll(cx)
            {
                *slot = Some(out);
            }
        }
        if this.done.iter().all(Option::is_some) {
            Poll::Ready(this.done.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}

/// Output of `ctx.select`: `(winner_index, output)`. The winner is the child whose
/// completion appears first in history, which keeps races deterministic on replay.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut winner: Option<(usize, usize, u64, DurableOutput)> = None;
        for (idx, child) in this.children.iter_mut().enumerate() {
            if let Some((pos, ts, out)) = child.peek()
                && winner.as_ref().is_none_or(|(_, best, _, _)| pos < *best)
            {
                winner = Some((idx, pos, ts, out));
            }
        }
        match winner {
            Some((idx, _, ts, out)) => {
                this.ctx.lock().observe(ts);
                Poll::Ready((idx, out))
            }
            None => Poll::Pending,
        }
    }
}
