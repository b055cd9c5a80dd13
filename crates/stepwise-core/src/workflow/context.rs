//! Shared run context: state store, event routing, aggregation and ledger.
//!
//! A `Context` is bound to one `Workflow`'s step table and may be reused
//! across successive runs. Everything persistent (store, checkpoint ledger,
//! collect buffers, last result) survives between runs; step queues are
//! drained when a run terminates.
//!
//! `Context` is a cheap `Arc` handle. Step handlers receive a clone and may
//! read/write the store, route events, aggregate events and publish to the
//! run's event stream concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::checkpoint::{Checkpoint, CheckpointFilter, ContextState};
use stepwise_types::event::{Event, EventType};
use stepwise_types::stream::StreamEvent;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::checkpoint::{BrokerLog, CheckpointBroker, InMemoryBrokerLog};
use super::definition::{StepTable, Workflow};
use super::executor::{ExecutorError, RunSignal};
use super::queue::{EventQueue, QueueFactory, channel_queue_factory};
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised synchronously by context operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("key '{key}' not found in context")]
    NotFound { key: String },

    #[error("step {step} does not exist")]
    UnknownStep { step: String },

    #[error("step {step} does not accept event of type {event_type}")]
    TypeMismatch { step: String, event_type: EventType },

    /// No run on this context has produced a stop event yet.
    #[error("workflow result is not ready")]
    ResultNotReady,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ContextError {
    fn from(e: serde_json::Error) -> Self {
        ContextError::Serialization(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

/// Persistent state of a context, as produced by [`Context::to_json`].
///
/// Queues and the step table are not part of it: queues are empty between
/// runs and steps come from the workflow passed to [`Context::from_json`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerializedContext {
    #[serde(default)]
    pub store: ContextState,
    #[serde(default)]
    pub broker_log: Vec<Checkpoint>,
    #[serde(default)]
    pub collect_buffers: BTreeMap<String, Vec<Event>>,
    #[serde(default)]
    pub retval: Option<Value>,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// The run currently driven on a context.
struct ActiveRun {
    run_id: Uuid,
    signals: mpsc::UnboundedSender<RunSignal>,
}

struct ContextInner {
    workflow_name: String,
    steps: Arc<StepTable>,
    store: DashMap<String, Value>,
    queues: DashMap<String, Arc<dyn EventQueue>>,
    queue_factory: QueueFactory,
    broker: CheckpointBroker,
    collect_buffers: DashMap<String, HashMap<EventType, Event>>,
    retval: Mutex<Option<Value>>,
    bus: EventBus,
    active: Mutex<Option<ActiveRun>>,
}

/// Shared mutable state and routing substrate for one or more runs of a
/// workflow.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Context {
    /// Fresh context with in-memory queues and ledger.
    pub fn new(workflow: &Workflow) -> Self {
        ContextBuilder::new(workflow).build()
    }

    pub fn builder(workflow: &Workflow) -> ContextBuilder {
        ContextBuilder::new(workflow)
    }

    pub fn workflow_name(&self) -> &str {
        &self.inner.workflow_name
    }

    /// Id of the run currently driven on this context, if any.
    pub fn run_id(&self) -> Option<Uuid> {
        lock(&self.inner.active).as_ref().map(|run| run.run_id)
    }

    // -- state store -------------------------------------------------------

    pub fn get(&self, key: &str) -> Result<Value, ContextError> {
        self.inner
            .store
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| ContextError::NotFound {
                key: key.to_string(),
            })
    }

    /// Value for `key`, or `default` when absent.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Deserialize the value stored under `key`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        Ok(serde_json::from_value(self.get(key)?)?)
    }

    /// Insert or overwrite `key`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.store.insert(key.into(), value.into());
    }

    /// Legacy setter. `make_private` has no effect.
    #[deprecated(note = "`make_private` is ignored; use `Context::set`")]
    pub fn set_private(&self, key: impl Into<String>, value: impl Into<Value>, make_private: bool) {
        let key = key.into();
        tracing::warn!(
            key = key.as_str(),
            make_private,
            "`make_private` is deprecated and will be ignored"
        );
        self.set(key, value);
    }

    /// Legacy accessor for the whole store.
    #[deprecated(note = "use `Context::snapshot`")]
    pub fn data(&self) -> ContextState {
        tracing::warn!("`Context::data` is deprecated; use `snapshot` instead");
        self.snapshot()
    }

    /// Detached copy of the store, ordered by key.
    pub fn snapshot(&self) -> ContextState {
        self.inner
            .store
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    // -- routing -----------------------------------------------------------

    /// Route `event` to one step's queue, or to every step's queue when
    /// `target` is `None`.
    ///
    /// Broadcasting a stop event while a run is active resolves that run.
    pub fn send_event(&self, event: Event, target: Option<&str>) -> Result<(), ContextError> {
        let Some(target) = target else {
            if event.is_stop() {
                if let Some(signals) = lock(&self.inner.active).as_ref().map(|r| r.signals.clone()) {
                    // The driver may already be gone if the run just ended.
                    let _ = signals.send(RunSignal::Stop(event));
                    return Ok(());
                }
            }
            for name in self.inner.steps.names() {
                self.queue_for(name).push(event.clone());
            }
            return Ok(());
        };

        let step = self
            .inner
            .steps
            .get(target)
            .ok_or_else(|| ContextError::UnknownStep {
                step: target.to_string(),
            })?;
        if !step.config().accepts_type(event.event_type()) {
            return Err(ContextError::TypeMismatch {
                step: target.to_string(),
                event_type: event.event_type().clone(),
            });
        }
        self.queue_for(target).push(event);
        Ok(())
    }

    /// The queue of `step`, created on first use. `None` for unknown steps.
    pub fn queue(&self, step: &str) -> Option<Arc<dyn EventQueue>> {
        self.inner.steps.get(step).map(|_| self.queue_for(step))
    }

    pub(crate) fn queue_for(&self, step: &str) -> Arc<dyn EventQueue> {
        self.inner
            .queues
            .entry(step.to_string())
            .or_insert_with(|| (self.inner.queue_factory)(step))
            .value()
            .clone()
    }

    // -- aggregation -------------------------------------------------------

    /// Buffer `event` until one event of every `expected` type has arrived.
    ///
    /// The collection site is identified by the expected type list. Returns
    /// the buffered events ordered as `expected` once complete, and clears the
    /// site. A second event of an already-buffered type replaces the first.
    pub fn collect_events(&self, event: &Event, expected: &[EventType]) -> Option<Vec<Event>> {
        // JSON array of the type names, so distinct lists never share a key.
        let site = Value::Array(
            expected
                .iter()
                .map(|ty| Value::String(ty.as_str().to_string()))
                .collect(),
        )
        .to_string();
        self.collect_events_at(&site, event, expected)
    }

    /// [`collect_events`](Self::collect_events) with an explicit site key.
    pub fn collect_events_at(
        &self,
        site: &str,
        event: &Event,
        expected: &[EventType],
    ) -> Option<Vec<Event>> {
        if !expected.contains(event.event_type()) {
            tracing::warn!(
                site,
                event_type = %event.event_type(),
                "ignoring event of unexpected type in collect_events"
            );
            return None;
        }

        let mut buffer = self
            .inner
            .collect_buffers
            .entry(site.to_string())
            .or_default();
        buffer.insert(event.event_type().clone(), event.clone());

        if !expected.iter().all(|ty| buffer.contains_key(ty)) {
            return None;
        }
        let collected = expected
            .iter()
            .filter_map(|ty| buffer.get(ty).cloned())
            .collect();
        buffer.clear();
        Some(collected)
    }

    // -- results & checkpoints --------------------------------------------

    /// Payload of the most recent stop event on this context.
    pub fn get_result(&self) -> Result<Value, ContextError> {
        lock(&self.inner.retval)
            .clone()
            .ok_or(ContextError::ResultNotReady)
    }

    pub(crate) fn set_result(&self, value: Value) {
        *lock(&self.inner.retval) = Some(value);
    }

    pub fn broker(&self) -> &CheckpointBroker {
        &self.inner.broker
    }

    /// Record a checkpoint for the active run (nil run id outside a run),
    /// snapshotting the store.
    pub fn create_checkpoint(
        &self,
        last_completed_step: Option<&str>,
        input_event: Option<Event>,
        output_event: Event,
    ) -> Checkpoint {
        let run_id = self.run_id().unwrap_or(Uuid::nil());
        self.inner.broker.create_checkpoint(
            run_id,
            last_completed_step,
            input_event,
            output_event,
            self.snapshot(),
        )
    }

    pub fn filter_checkpoints(&self, filter: &CheckpointFilter) -> Vec<Checkpoint> {
        self.inner.broker.filter(filter)
    }

    /// The whole ledger in append order.
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.inner.broker.checkpoints()
    }

    // -- event stream ------------------------------------------------------

    /// Publish an application event to stream subscribers.
    pub fn write_event_to_stream(&self, event: Event) {
        let run_id = self.run_id().unwrap_or(Uuid::nil());
        self.inner.bus.publish(StreamEvent::Custom { run_id, event });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.bus.subscribe()
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    // -- serialization -----------------------------------------------------

    pub fn to_serialized(&self) -> SerializedContext {
        let collect_buffers = self
            .inner
            .collect_buffers
            .iter()
            .map(|entry| {
                let mut events: Vec<Event> = entry.value().values().cloned().collect();
                events.sort_by(|a, b| a.event_type().cmp(b.event_type()));
                (entry.key().clone(), events)
            })
            .collect();

        SerializedContext {
            store: self.snapshot(),
            broker_log: self.checkpoints(),
            collect_buffers,
            retval: lock(&self.inner.retval).clone(),
        }
    }

    pub fn to_json(&self) -> Result<Value, ContextError> {
        Ok(serde_json::to_value(self.to_serialized())?)
    }

    /// Rebuild a context for `workflow` from [`to_json`](Self::to_json) output.
    pub fn from_json(workflow: &Workflow, value: Value) -> Result<Self, ContextError> {
        let state: SerializedContext = serde_json::from_value(value)?;
        Ok(ContextBuilder::new(workflow).restore(state).build())
    }

    // -- run lifecycle -----------------------------------------------------

    pub(crate) fn belongs_to(&self, workflow: &Workflow) -> bool {
        Arc::ptr_eq(&self.inner.steps, workflow.table())
    }

    /// Replace the store with `state`.
    pub(crate) fn restore_store(&self, state: ContextState) {
        self.inner.store.clear();
        for (key, value) in state {
            self.inner.store.insert(key, value);
        }
    }

    /// Claim the context for a run.
    pub(crate) fn begin_run(
        &self,
        run_id: Uuid,
        signals: mpsc::UnboundedSender<RunSignal>,
    ) -> Result<(), ExecutorError> {
        let mut active = lock(&self.inner.active);
        if let Some(current) = active.as_ref() {
            return Err(ExecutorError::ContextBusy(current.run_id));
        }
        *active = Some(ActiveRun { run_id, signals });
        Ok(())
    }

    pub(crate) fn end_run(&self, run_id: Uuid) {
        let mut active = lock(&self.inner.active);
        if active.as_ref().is_some_and(|r| r.run_id == run_id) {
            *active = None;
        }
    }

    /// Drop every queued event, returning how many were discarded.
    pub(crate) fn clear_queues(&self) -> usize {
        self.inner
            .queues
            .iter()
            .map(|entry| entry.value().clear())
            .sum()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("workflow", &self.inner.workflow_name)
            .field("keys", &self.inner.store.len())
            .field("checkpoints", &self.inner.broker.len())
            .field("run_id", &self.run_id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ContextBuilder
// ---------------------------------------------------------------------------

/// Builds a [`Context`] with injectable queue and ledger backends.
pub struct ContextBuilder {
    workflow_name: String,
    steps: Arc<StepTable>,
    stream_capacity: usize,
    queue_factory: QueueFactory,
    broker_log: Option<Arc<dyn BrokerLog>>,
    restored: SerializedContext,
}

impl ContextBuilder {
    pub fn new(workflow: &Workflow) -> Self {
        Self {
            workflow_name: workflow.name().to_string(),
            steps: Arc::clone(workflow.table()),
            stream_capacity: workflow.config().stream_capacity,
            queue_factory: channel_queue_factory(),
            broker_log: None,
            restored: SerializedContext::default(),
        }
    }

    /// Use `factory` to create each step's queue.
    pub fn queue_factory(mut self, factory: QueueFactory) -> Self {
        self.queue_factory = factory;
        self
    }

    /// Append checkpoints to `log` instead of a fresh in-memory log.
    pub fn broker_log(mut self, log: Arc<dyn BrokerLog>) -> Self {
        self.broker_log = Some(log);
        self
    }

    /// Seed the store.
    pub fn with_state(mut self, state: ContextState) -> Self {
        self.restored.store = state;
        self
    }

    fn restore(mut self, state: SerializedContext) -> Self {
        self.restored = state;
        self
    }

    pub fn build(self) -> Context {
        let SerializedContext {
            store,
            broker_log,
            collect_buffers,
            retval,
        } = self.restored;

        let log = match self.broker_log {
            Some(log) => {
                for checkpoint in broker_log {
                    log.append(checkpoint);
                }
                log
            }
            None => Arc::new(InMemoryBrokerLog::from_entries(broker_log)) as Arc<dyn BrokerLog>,
        };

        let collect_buffers = collect_buffers
            .into_iter()
            .map(|(site, events)| {
                let buffer: HashMap<EventType, Event> = events
                    .into_iter()
                    .map(|ev| (ev.event_type().clone(), ev))
                    .collect();
                (site, buffer)
            })
            .collect();

        Context {
            inner: Arc::new(ContextInner {
                workflow_name: self.workflow_name,
                steps: self.steps,
                store: store.into_iter().collect(),
                queues: DashMap::new(),
                queue_factory: self.queue_factory,
                broker: CheckpointBroker::new(log),
                collect_buffers,
                retval: Mutex::new(retval),
                bus: EventBus::new(self.stream_capacity),
                active: Mutex::new(None),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::workflow::StepConfig;

    use crate::workflow::step::StepDescriptor;

    /// Records pushes per step; never yields events.
    #[derive(Default)]
    struct RecordingQueue {
        pushed: Mutex<Vec<Event>>,
    }

    impl EventQueue for RecordingQueue {
        fn push(&self, event: Event) {
            lock(&self.pushed).push(event);
        }

        fn pop(
            &self,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<Event>> + Send + '_>> {
            Box::pin(std::future::pending())
        }

        fn len(&self) -> usize {
            lock(&self.pushed).len()
        }

        fn clear(&self) -> usize {
            std::mem::take(&mut *lock(&self.pushed)).len()
        }
    }

    fn ty(name: &str) -> EventType {
        EventType::named(name)
    }

    fn noop(config: StepConfig) -> StepDescriptor {
        StepDescriptor::from_fn(config, |_ctx, _ev| async { Ok(None) })
    }

    fn dummy_workflow() -> Workflow {
        Workflow::builder("dummy")
            .step(noop(
                StepConfig::new("start_step")
                    .accepts(EventType::Start)
                    .produces(ty("one_test_event")),
            ))
            .step(noop(
                StepConfig::new("middle_step")
                    .accepts(ty("one_test_event"))
                    .produces(ty("last_event")),
            ))
            .step(noop(
                StepConfig::new("end_step")
                    .accepts(ty("last_event"))
                    .produces(EventType::Stop),
            ))
            .build()
            .unwrap()
    }

    fn recording_context(wf: &Workflow) -> (Context, Arc<DashMap<String, Arc<RecordingQueue>>>) {
        let queues: Arc<DashMap<String, Arc<RecordingQueue>>> = Arc::new(DashMap::new());
        let factory_queues = Arc::clone(&queues);
        let factory: QueueFactory = Arc::new(move |step: &str| {
            let q = Arc::new(RecordingQueue::default());
            factory_queues.insert(step.to_string(), Arc::clone(&q));
            q as Arc<dyn EventQueue>
        });
        (Context::builder(wf).queue_factory(factory).build(), queues)
    }

    #[test]
    fn get_and_set() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);

        assert_eq!(
            ctx.get("foo"),
            Err(ContextError::NotFound {
                key: "foo".to_string()
            })
        );
        assert_eq!(ctx.get_or("foo", json!(42)), json!(42));

        ctx.set("foo", json!("bar"));
        assert_eq!(ctx.get("foo").unwrap(), json!("bar"));
        ctx.set("foo", 7);
        assert_eq!(ctx.get_as::<i64>("foo").unwrap(), 7);
        assert!(matches!(
            ctx.get_as::<String>("foo"),
            Err(ContextError::Serialization(_))
        ));
    }

    /// Log sink shared between a scoped subscriber and the test body.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&lock(&self.0)).into_owned()
        }
    }

    #[test]
    #[allow(deprecated)]
    fn legacy_accessors_still_work() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        tracing::subscriber::with_default(subscriber, || {
            ctx.set_private("foo", json!(1), true);
            assert_eq!(ctx.get("foo").unwrap(), json!(1));
            assert_eq!(ctx.data().get("foo"), Some(&json!(1)));
        });

        let text = logs.text();
        assert!(text.contains("WARN"));
        assert!(text.contains("`make_private` is deprecated and will be ignored"));
        assert!(text.contains("`Context::data` is deprecated"));
    }

    #[test]
    fn send_event_to_unknown_step() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let err = ctx
            .send_event(Event::named("one_test_event", json!({})), Some("does_not_exist"))
            .unwrap_err();
        assert_eq!(err.to_string(), "step does_not_exist does not exist");
    }

    #[test]
    fn send_event_type_mismatch() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let err = ctx
            .send_event(Event::named("one_test_event", json!({})), Some("end_step"))
            .unwrap_err();
        assert_eq!(
            err,
            ContextError::TypeMismatch {
                step: "end_step".to_string(),
                event_type: ty("one_test_event"),
            }
        );
        assert!(err.to_string().contains("does not accept event of type one_test_event"));
    }

    #[test]
    fn send_event_broadcast_hits_every_queue_once() {
        let wf = dummy_workflow();
        let (ctx, queues) = recording_context(&wf);
        let ev = Event::named("one_test_event", json!({"n": 1}));

        ctx.send_event(ev.clone(), None).unwrap();

        assert_eq!(queues.len(), 3);
        for entry in queues.iter() {
            assert_eq!(*lock(&entry.value().pushed), vec![ev.clone()]);
        }
    }

    #[test]
    fn send_event_targeted_hits_one_queue() {
        let wf = dummy_workflow();
        let (ctx, queues) = recording_context(&wf);
        let ev = Event::named("one_test_event", json!({}));

        ctx.send_event(ev.clone(), Some("middle_step")).unwrap();

        assert_eq!(queues.len(), 1);
        let q = queues.get("middle_step").unwrap();
        assert_eq!(*lock(&q.pushed), vec![ev]);
        assert_eq!(ctx.queue("middle_step").unwrap().len(), 1);
        assert!(ctx.queue("nope").is_none());
    }

    #[test]
    fn collect_events_waits_for_all_types() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let expected = [ty("one"), ty("another")];
        let ev1 = Event::named("one", json!(1));
        let ev2 = Event::named("another", json!(2));

        assert_eq!(ctx.collect_events(&ev1, &expected), None);
        assert_eq!(ctx.collect_events(&ev2, &expected), Some(vec![ev1.clone(), ev2.clone()]));

        // Buffer was cleared by the successful collection.
        assert_eq!(ctx.collect_events(&ev2, &expected), None);
        assert_eq!(ctx.collect_events(&ev1, &expected), Some(vec![ev1, ev2]));
    }

    #[test]
    fn collect_events_order_follows_expected() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let expected = [ty("one"), ty("another")];
        let ev1 = Event::named("one", json!(1));
        let ev2 = Event::named("another", json!(2));

        assert_eq!(ctx.collect_events(&ev2, &expected), None);
        assert_eq!(ctx.collect_events(&ev1, &expected), Some(vec![ev1, ev2]));
    }

    #[test]
    fn collect_events_duplicate_is_last_write_wins() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let expected = [ty("one"), ty("another")];
        let first = Event::named("one", json!("first"));
        let second = Event::named("one", json!("second"));
        let other = Event::named("another", json!(null));

        assert_eq!(ctx.collect_events(&first, &expected), None);
        assert_eq!(ctx.collect_events(&second, &expected), None);
        assert_eq!(ctx.collect_events(&other, &expected), Some(vec![second, other]));
    }

    #[test]
    fn collect_events_ignores_unexpected_type() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let expected = [ty("one")];
        assert_eq!(ctx.collect_events(&Event::named("stray", json!(0)), &expected), None);
        let ev = Event::named("one", json!(0));
        assert_eq!(ctx.collect_events(&ev, &expected), Some(vec![ev]));
    }

    #[test]
    fn collect_sites_are_independent() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let expected = [ty("one"), ty("another")];
        let ev1 = Event::named("one", json!(1));
        let ev2 = Event::named("another", json!(2));

        assert_eq!(ctx.collect_events_at("a", &ev1, &expected), None);
        assert_eq!(ctx.collect_events_at("b", &ev2, &expected), None);
        assert_eq!(
            ctx.collect_events_at("a", &ev2, &expected),
            Some(vec![ev1, ev2])
        );
    }

    #[test]
    fn collect_sites_keyed_by_type_list_do_not_collide() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let pair = [ty("a"), ty("b")];
        let joined = [ty("a|b")];
        let a = Event::named("a", json!(1));
        let a_or_b = Event::named("a|b", json!(2));
        let b = Event::named("b", json!(3));

        assert_eq!(ctx.collect_events(&a, &pair), None);
        assert_eq!(ctx.collect_events(&a_or_b, &joined), Some(vec![a_or_b]));
        assert_eq!(ctx.collect_events(&b, &pair), Some(vec![a, b]));
    }

    #[test]
    fn get_result_before_any_run() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        assert_eq!(ctx.get_result(), Err(ContextError::ResultNotReady));
        ctx.set_result(json!("done"));
        assert_eq!(ctx.get_result().unwrap(), json!("done"));
    }

    #[test]
    fn manual_checkpoint_snapshots_store() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        ctx.set("n", 1);
        ctx.set("nested", json!({"list": [1, 2], "flag": true}));
        let snap = ctx.snapshot();
        let cp = ctx.create_checkpoint(
            Some("start_step"),
            Some(Event::start(json!({}))),
            Event::named("one_test_event", json!({})),
        );
        ctx.set("n", 2);

        assert_eq!(cp.ctx_state, snap);
        assert_ne!(cp.ctx_state, ctx.snapshot());
        assert_eq!(cp.run_id, Uuid::nil());
        let found = ctx.filter_checkpoints(
            &CheckpointFilter::new().last_completed_step("start_step"),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, cp.id);
    }

    #[test]
    fn injected_broker_log_receives_checkpoints() {
        let wf = dummy_workflow();
        let log = Arc::new(InMemoryBrokerLog::new());
        let ctx = Context::builder(&wf).broker_log(log.clone()).build();
        ctx.create_checkpoint(None, None, Event::start(json!({})));
        assert_eq!(log.len(), 1);
        assert_eq!(ctx.checkpoints().len(), 1);
    }

    #[test]
    fn json_roundtrip_preserves_persistent_state() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        ctx.set("answer", 42);
        ctx.create_checkpoint(None, None, Event::start(json!({})));
        ctx.collect_events(&Event::named("one", json!(1)), &[ty("one"), ty("another")]);
        ctx.set_result(json!("r"));

        let restored = Context::from_json(&wf, ctx.to_json().unwrap()).unwrap();

        assert_eq!(restored.get("answer").unwrap(), json!(42));
        assert_eq!(restored.checkpoints(), ctx.checkpoints());
        assert_eq!(restored.get_result().unwrap(), json!("r"));
        let completed =
            restored.collect_events(&Event::named("another", json!(2)), &[ty("one"), ty("another")]);
        assert_eq!(completed.map(|evs| evs.len()), Some(2));
    }

    #[test]
    fn from_json_rejects_garbage() {
        let wf = dummy_workflow();
        let err = Context::from_json(&wf, json!({"store": 5})).unwrap_err();
        assert!(matches!(err, ContextError::Serialization(_)));
    }

    #[tokio::test]
    async fn write_event_to_stream_reaches_subscribers() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let mut rx = ctx.subscribe();
        let ev = Event::named("progress", json!({"pct": 50}));

        ctx.write_event_to_stream(ev.clone());

        match rx.recv().await.unwrap() {
            StreamEvent::Custom { run_id, event } => {
                assert_eq!(run_id, Uuid::nil());
                assert_eq!(event, ev);
            }
            other => panic!("unexpected stream event: {other:?}"),
        }
    }

    #[test]
    fn second_run_claim_is_rejected() {
        let wf = dummy_workflow();
        let ctx = Context::new(&wf);
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = Uuid::now_v7();
        ctx.begin_run(first, tx.clone()).unwrap();
        assert_eq!(ctx.run_id(), Some(first));
        assert_eq!(
            ctx.begin_run(Uuid::now_v7(), tx.clone()),
            Err(ExecutorError::ContextBusy(first))
        );
        ctx.end_run(first);
        assert!(ctx.begin_run(Uuid::now_v7(), tx).is_ok());
    }
}
