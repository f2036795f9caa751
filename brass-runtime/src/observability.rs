//! Observability sinks
//!
//! Ready-made [`RuntimeHooks`] implementations:
//!
//! - **TracingHooks**: forwards events to `tracing`, filtered by level
//! - **EventBus**: buffered fan-out to subscribers, delivered on flush
//! - **Registry**: live view of fibers and scopes with a text dump
//! - **CompositeHooks**: one emit, several sinks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         RUNTIME                                  │
//! │        fiber.start / fiber.end / scope.close / log ...           │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ emit(event, ctx)
//!                        ┌────────┴────────┐
//!                        │ CompositeHooks  │
//!                        └────────┬────────┘
//!          ┌──────────────────────┼──────────────────────┐
//!          ▼                      ▼                      ▼
//!  ┌──────────────┐      ┌──────────────┐       ┌──────────────┐
//!  │ TracingHooks │      │   EventBus   │       │   Registry   │
//!  │  (tracing)   │      │ ring/subscr. │       │ fibers/scopes│
//!  └──────────────┘      └──────┬───────┘       └──────────────┘
//!                               │ flush(budget), loop idle
//!                               ▼
//!                         subscriber handlers
//! ```
//!
//! Sinks only observe. None of them can delay, reorder or fail a fiber.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::rc::Rc;
//! use brass_runtime::observability::{CompositeHooks, EventBus, Registry, TracingHooks};
//!
//! let bus = Rc::new(EventBus::new(256));
//! bus.subscribe(|record| println!("{} {}", record.seq, record.event.name()));
//! let registry = Rc::new(Registry::new(100));
//!
//! let hooks = CompositeHooks::new()
//!     .with(TracingHooks::new(LogLevel::Debug))
//!     .with_shared(bus.clone())
//!     .with_shared(registry.clone());
//! let rt = Runtime::builder(()).hooks(hooks).build();
//! // ... run programs ...
//! println!("{}", registry.dump());
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write as _};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::cause::ExitKind;
use crate::config::{EventConfig, LogConfig, LogLevel};
use crate::events::{EmitContext, RuntimeEvent, RuntimeHooks};
use crate::fiber::{FiberId, FiberStatus, RunState};
use crate::panic::catch_panic;
use crate::scope::ScopeId;

// ============================================================================
// TRACING
// ============================================================================

/// Logger sink: forwards events to the `tracing` macros.
///
/// Lifecycle events map to `debug` (start, end, scope open and close) or
/// `trace` (suspend, resume); abnormal fiber ends are raised to `warn`.
/// `log` events keep their own level. Anything below `level` is dropped.
#[derive(Debug, Clone, Copy)]
pub struct TracingHooks {
    level: LogLevel,
    lifecycle: bool,
}

impl Default for TracingHooks {
    fn default() -> Self {
        Self::new(LogLevel::default())
    }
}

impl TracingHooks {
    /// Forward events at `level` and above, lifecycle events included.
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            lifecycle: true,
        }
    }

    /// Build from the runtime's log settings.
    pub fn from_config(config: &LogConfig) -> Self {
        Self {
            level: config.level,
            lifecycle: config.lifecycle_events,
        }
    }

    /// Enable or disable lifecycle events; `log` events are always kept.
    pub fn lifecycle(mut self, enabled: bool) -> Self {
        self.lifecycle = enabled;
        self
    }

    fn level_of(event: &RuntimeEvent) -> LogLevel {
        match event {
            RuntimeEvent::FiberSuspend { .. } | RuntimeEvent::FiberResume { .. } => LogLevel::Trace,
            RuntimeEvent::FiberEnd {
                status: ExitKind::Failure | ExitKind::Defect,
                ..
            } => LogLevel::Warn,
            RuntimeEvent::Log { level, .. } => *level,
            _ => LogLevel::Debug,
        }
    }
}

macro_rules! forward {
    ($level:expr, $($rest:tt)+) => {
        match $level {
            LogLevel::Error => error!($($rest)+),
            LogLevel::Warn => warn!($($rest)+),
            LogLevel::Info => info!($($rest)+),
            LogLevel::Debug => debug!($($rest)+),
            LogLevel::Trace => trace!($($rest)+),
            LogLevel::Off => {}
        }
    };
}

impl RuntimeHooks for TracingHooks {
    fn emit(&self, event: &RuntimeEvent, ctx: &EmitContext) {
        let is_log = matches!(event, RuntimeEvent::Log { .. });
        if !is_log && !self.lifecycle {
            return;
        }
        let level = Self::level_of(event);
        if !self.level.allows(level) {
            return;
        }
        let fiber = ctx.fiber_id.map(|f| f.as_u64());
        let scope = ctx.scope_id.map(|s| s.as_u64());
        let trace_id = ctx.trace_id.map(|t| format!("{:032x}", t));
        let trace_id = trace_id.as_deref();
        match event {
            RuntimeEvent::Log {
                message, fields, ..
            } => {
                let fields = render_fields(fields);
                forward!(level, fiber, scope, trace_id, fields = %fields, "{}", message);
            }
            RuntimeEvent::FiberEnd {
                fiber: id,
                status,
                error,
            } => {
                let error = error.as_deref().unwrap_or("");
                forward!(level, fiber = id.as_u64(), scope, trace_id, status = %status, error, "fiber.end");
            }
            other => {
                forward!(level, fiber, scope, trace_id, event = ?other, "{}", other.name());
            }
        }
    }
}

fn render_fields(fields: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (k, v)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{}={}", k, v);
    }
    out
}

// ============================================================================
// EVENT BUS
// ============================================================================

/// One buffered event.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Bus-wide sequence number, starting at 1.
    pub seq: u64,
    /// Time since the bus was created.
    pub at: Duration,
    /// Wall-clock time of the emit.
    pub wall: SystemTime,
    /// The event.
    pub event: RuntimeEvent,
    /// Its correlation context.
    pub ctx: EmitContext,
}

/// Subscriber handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

type Handler = Box<dyn FnMut(&EventRecord) + Send>;

struct Subscriber {
    id: SubscriberId,
    ring: VecDeque<EventRecord>,
    capacity: usize,
    dropped: u64,
    overflowing: bool,
    handler: Option<Arc<Mutex<Handler>>>,
}

impl Subscriber {
    fn push(&mut self, record: EventRecord) {
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
            self.dropped += 1;
            if !self.overflowing {
                self.overflowing = true;
                warn!(
                    subscriber = self.id.0,
                    capacity = self.capacity,
                    "event subscriber is falling behind; dropping oldest records"
                );
            }
        }
        self.ring.push_back(record);
    }

    fn drain(&mut self, budget: usize) -> Vec<EventRecord> {
        let n = budget.min(self.ring.len());
        let drained: Vec<_> = self.ring.drain(..n).collect();
        if self.ring.is_empty() {
            self.overflowing = false;
        }
        drained
    }
}

struct Bus {
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

/// Buffered fan-out of runtime events.
///
/// Each subscriber owns a bounded ring. When a ring is full the oldest
/// record is dropped and counted. Handlers run during [`EventBus::flush`],
/// outside the bus lock, which the runtime drives whenever its run queue
/// goes idle. The bus is `Send + Sync`: wrap it in an `Arc` to drain
/// handler-less subscribers from a reporter thread.
pub struct EventBus {
    bus: Mutex<Bus>,
    seq: AtomicU64,
    epoch: Instant,
    default_capacity: usize,
    idle_budget: usize,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.bus.lock().subscribers.len())
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .field("default_capacity", &self.default_capacity)
            .finish()
    }
}

impl EventBus {
    /// Create a bus whose subscribers buffer `capacity` records each.
    pub fn new(capacity: usize) -> Self {
        Self {
            bus: Mutex::new(Bus {
                subscribers: Vec::new(),
                next_subscriber: 1,
            }),
            seq: AtomicU64::new(0),
            epoch: Instant::now(),
            default_capacity: capacity.max(1),
            idle_budget: usize::MAX,
        }
    }

    /// Build from the runtime's event settings.
    pub fn from_config(config: &EventConfig) -> Self {
        Self::new(config.subscriber_capacity)
    }

    /// Limit how many records one idle flush delivers.
    pub fn with_flush_budget(mut self, budget: usize) -> Self {
        self.idle_budget = budget.max(1);
        self
    }

    /// Subscribe with a handler called for each record during flush.
    pub fn subscribe<F>(&self, handler: F) -> SubscriberId
    where
        F: FnMut(&EventRecord) + Send + 'static,
    {
        self.add(self.default_capacity, Some(Arc::new(Mutex::new(Box::new(handler)))))
    }

    /// Subscribe with an explicit ring capacity.
    pub fn subscribe_with_capacity<F>(&self, capacity: usize, handler: F) -> SubscriberId
    where
        F: FnMut(&EventRecord) + Send + 'static,
    {
        self.add(capacity.max(1), Some(Arc::new(Mutex::new(Box::new(handler)))))
    }

    /// Subscribe without a handler; records are fetched with
    /// [`EventBus::drain`].
    pub fn subscribe_buffer(&self, capacity: usize) -> SubscriberId {
        self.add(capacity.max(1), None)
    }

    fn add(&self, capacity: usize, handler: Option<Arc<Mutex<Handler>>>) -> SubscriberId {
        let mut bus = self.bus.lock();
        let id = SubscriberId(bus.next_subscriber);
        bus.next_subscriber += 1;
        bus.subscribers.push(Subscriber {
            id,
            ring: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
            overflowing: false,
            handler,
        });
        id
    }

    /// Remove a subscriber and its buffered records.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut bus = self.bus.lock();
        let before = bus.subscribers.len();
        bus.subscribers.retain(|s| s.id != id);
        bus.subscribers.len() != before
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.bus.lock().subscribers.len()
    }

    /// Records dropped for `id` so far.
    pub fn dropped(&self, id: SubscriberId) -> Option<u64> {
        self.bus.lock().subscribers.iter().find(|s| s.id == id).map(|s| s.dropped)
    }

    /// Records waiting for `id`.
    pub fn pending(&self, id: SubscriberId) -> Option<usize> {
        self.bus.lock().subscribers.iter().find(|s| s.id == id).map(|s| s.ring.len())
    }

    /// Take every buffered record of `id`.
    pub fn drain(&self, id: SubscriberId) -> Vec<EventRecord> {
        let mut bus = self.bus.lock();
        match bus.subscribers.iter_mut().find(|s| s.id == id) {
            Some(sub) => sub.drain(usize::MAX),
            None => Vec::new(),
        }
    }

    /// Record one event for every subscriber.
    pub fn publish(&self, event: &RuntimeEvent, ctx: &EmitContext) {
        let record = EventRecord {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            at: self.epoch.elapsed(),
            wall: SystemTime::now(),
            event: event.clone(),
            ctx: *ctx,
        };
        let mut bus = self.bus.lock();
        if let Some((last, rest)) = bus.subscribers.split_last_mut() {
            for sub in rest {
                sub.push(record.clone());
            }
            last.push(record);
        }
    }

    /// Deliver up to `budget` buffered records to handlers. Returns how
    /// many were delivered. Subscribers without a handler keep their
    /// records.
    pub fn flush_budget(&self, budget: usize) -> usize {
        let batches: Vec<(SubscriberId, Arc<Mutex<Handler>>, Vec<EventRecord>)> = {
            let mut bus = self.bus.lock();
            let mut left = budget;
            let mut batches = Vec::new();
            for sub in bus.subscribers.iter_mut() {
                if left == 0 {
                    break;
                }
                let Some(handler) = sub.handler.clone() else { continue };
                let records = sub.drain(left);
                if records.is_empty() {
                    continue;
                }
                left -= records.len();
                batches.push((sub.id, handler, records));
            }
            batches
        };

        let mut delivered = 0;
        for (id, handler, records) in batches {
            let mut handler = handler.lock();
            for record in &records {
                delivered += 1;
                if let Err(defect) = catch_panic(|| (*handler)(record)) {
                    warn!(subscriber = id.0, seq = record.seq, error = %defect, "event handler panicked");
                }
            }
        }
        delivered
    }
}

impl RuntimeHooks for EventBus {
    fn emit(&self, event: &RuntimeEvent, ctx: &EmitContext) {
        self.publish(event, ctx);
    }

    fn flush(&self) {
        self.flush_budget(self.idle_budget);
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// What the registry knows about one fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberInfo {
    /// The fiber.
    pub id: FiberId,
    /// Diagnostic name.
    pub name: Option<String>,
    /// Forking fiber.
    pub parent: Option<FiberId>,
    /// Owning scope.
    pub scope: Option<ScopeId>,
    /// Trace id.
    pub trace_id: Option<u128>,
    /// Span id.
    pub span_id: Option<u64>,
    /// Last observed run state.
    pub run_state: RunState,
    /// Status.
    pub status: FiberStatus,
    /// Label of the async operation it is suspended on.
    pub awaiting: Option<&'static str>,
    /// Time of the last event about this fiber.
    pub last_activity: Instant,
    /// How it ended.
    pub end: Option<ExitKind>,
    /// Rendered cause of an abnormal end.
    pub error: Option<String>,
}

/// What the registry knows about one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeInfo {
    /// The scope.
    pub id: ScopeId,
    /// Parent scope.
    pub parent: Option<ScopeId>,
    /// Fiber that opened it.
    pub opened_by: Option<FiberId>,
    /// Close status, once closed.
    pub closed: Option<ExitKind>,
    /// When it was opened.
    pub opened_at: Instant,
}

struct RegistryState {
    fibers: BTreeMap<FiberId, FiberInfo>,
    finished: VecDeque<FiberInfo>,
    scopes: BTreeMap<ScopeId, ScopeInfo>,
    closed_scopes: VecDeque<ScopeInfo>,
    recent: VecDeque<String>,
}

/// Introspection sink tracking live fibers and scopes.
///
/// Finished fibers, closed scopes and rendered events are kept in bounded
/// rings of `history` entries each.
pub struct Registry {
    state: RwLock<RegistryState>,
    history: usize,
    seq: AtomicU64,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.read();
        f.debug_struct("Registry")
            .field("live_fibers", &st.fibers.len())
            .field("open_scopes", &st.scopes.len())
            .field("history", &self.history)
            .finish()
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, cap: usize) {
    if cap == 0 {
        return;
    }
    if ring.len() >= cap {
        ring.pop_front();
    }
    ring.push_back(item);
}

impl Registry {
    /// Create a registry keeping `history` finished entries and events.
    pub fn new(history: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                fibers: BTreeMap::new(),
                finished: VecDeque::new(),
                scopes: BTreeMap::new(),
                closed_scopes: VecDeque::new(),
                recent: VecDeque::new(),
            }),
            history,
            seq: AtomicU64::new(0),
        }
    }

    /// Build from the runtime's event settings.
    pub fn from_config(config: &EventConfig) -> Self {
        Self::new(config.recent_events)
    }

    /// A live or recently finished fiber.
    pub fn fiber(&self, id: FiberId) -> Option<FiberInfo> {
        let st = self.state.read();
        st.fibers
            .get(&id)
            .or_else(|| st.finished.iter().rev().find(|f| f.id == id))
            .cloned()
    }

    /// Fibers that have not ended, by id.
    pub fn live_fibers(&self) -> Vec<FiberInfo> {
        self.state.read().fibers.values().cloned().collect()
    }

    /// Recently finished fibers, oldest first.
    pub fn finished_fibers(&self) -> Vec<FiberInfo> {
        self.state.read().finished.iter().cloned().collect()
    }

    /// Open scopes, by id.
    pub fn open_scopes(&self) -> Vec<ScopeInfo> {
        self.state.read().scopes.values().cloned().collect()
    }

    /// Recently closed scopes, oldest first.
    pub fn closed_scopes(&self) -> Vec<ScopeInfo> {
        self.state.read().closed_scopes.iter().cloned().collect()
    }

    /// Rendered recent events, oldest first.
    pub fn recent_events(&self) -> Vec<String> {
        self.state.read().recent.iter().cloned().collect()
    }

    /// Human-readable snapshot of everything tracked.
    pub fn dump(&self) -> String {
        let st = self.state.read();
        let now = Instant::now();
        let mut out = String::new();
        let _ = writeln!(out, "== fibers ({} live) ==", st.fibers.len());
        for info in st.fibers.values() {
            let _ = writeln!(
                out,
                "{} {:<9} scope={} name={} awaiting={} idle={:?}",
                info.id,
                info.run_state.as_str(),
                info.scope.map_or_else(|| "-".to_string(), |s| s.to_string()),
                info.name.as_deref().unwrap_or("-"),
                info.awaiting.unwrap_or("-"),
                now.saturating_duration_since(info.last_activity),
            );
        }
        let _ = writeln!(out, "== scopes ({} open) ==", st.scopes.len());
        for info in st.scopes.values() {
            let _ = writeln!(
                out,
                "{} parent={}",
                info.id,
                info.parent.map_or_else(|| "-".to_string(), |s| s.to_string()),
            );
        }
        let _ = writeln!(out, "== finished ({}) ==", st.finished.len());
        for info in &st.finished {
            let _ = writeln!(
                out,
                "{} {}{}",
                info.id,
                info.end.map_or("?", |k| k.as_str()),
                info.error.as_ref().map(|e| format!(" error={}", e)).unwrap_or_default(),
            );
        }
        let _ = writeln!(out, "== recent events ({}) ==", st.recent.len());
        for line in &st.recent {
            let _ = writeln!(out, "{}", line);
        }
        out
    }

    fn record(&self, st: &mut RegistryState, event: &RuntimeEvent, ctx: &EmitContext) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let who = ctx
            .fiber_id
            .map_or_else(|| "-".to_string(), |f| f.to_string());
        let line = match event {
            RuntimeEvent::Log { level, message, fields } if fields.is_empty() => {
                format!("#{} {} log[{}] {}", seq, who, level, message)
            }
            RuntimeEvent::Log { level, message, fields } => {
                format!("#{} {} log[{}] {} {}", seq, who, level, message, render_fields(fields))
            }
            other => format!("#{} {} {}", seq, who, other.name()),
        };
        push_bounded(&mut st.recent, line, self.history);
    }
}

impl RuntimeHooks for Registry {
    fn emit(&self, event: &RuntimeEvent, ctx: &EmitContext) {
        let now = Instant::now();
        let mut st = self.state.write();
        self.record(&mut st, event, ctx);
        match event {
            RuntimeEvent::FiberStart {
                fiber,
                parent,
                scope,
                name,
            } => {
                st.fibers.insert(
                    *fiber,
                    FiberInfo {
                        id: *fiber,
                        name: name.clone(),
                        parent: *parent,
                        scope: *scope,
                        trace_id: ctx.trace_id,
                        span_id: ctx.span_id,
                        run_state: RunState::Queued,
                        status: FiberStatus::Running,
                        awaiting: None,
                        last_activity: now,
                        end: None,
                        error: None,
                    },
                );
            }
            RuntimeEvent::FiberSuspend { fiber, reason } => {
                if let Some(info) = st.fibers.get_mut(fiber) {
                    info.run_state = RunState::Suspended;
                    info.awaiting = *reason;
                    info.last_activity = now;
                }
            }
            RuntimeEvent::FiberResume { fiber } => {
                if let Some(info) = st.fibers.get_mut(fiber) {
                    info.run_state = RunState::Queued;
                    info.awaiting = None;
                    info.last_activity = now;
                }
            }
            RuntimeEvent::FiberEnd {
                fiber,
                status,
                error,
            } => {
                if let Some(mut info) = st.fibers.remove(fiber) {
                    info.run_state = RunState::Done;
                    info.status = match status {
                        ExitKind::Interrupted => FiberStatus::Interrupted,
                        _ => FiberStatus::Done,
                    };
                    info.awaiting = None;
                    info.last_activity = now;
                    info.end = Some(*status);
                    info.error = error.clone();
                    push_bounded(&mut st.finished, info, self.history);
                }
            }
            RuntimeEvent::ScopeOpen { scope, parent } => {
                st.scopes.insert(
                    *scope,
                    ScopeInfo {
                        id: *scope,
                        parent: *parent,
                        opened_by: ctx.fiber_id,
                        closed: None,
                        opened_at: now,
                    },
                );
            }
            RuntimeEvent::ScopeClose { scope, status } => {
                if let Some(mut info) = st.scopes.remove(scope) {
                    info.closed = Some(*status);
                    push_bounded(&mut st.closed_scopes, info, self.history);
                }
            }
            RuntimeEvent::Log { .. } => {}
        }
    }
}

// ============================================================================
// COMPOSITE
// ============================================================================

/// Fans each emit and flush out to several sinks, in insertion order. A
/// panicking sink is logged and skipped; the others still see the event.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Rc<dyn RuntimeHooks>>,
}

impl fmt::Debug for CompositeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeHooks")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl CompositeHooks {
    /// An empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, hooks: impl RuntimeHooks + 'static) -> Self {
        self.hooks.push(Rc::new(hooks));
        self
    }

    /// Add a sink that the caller keeps a handle to.
    pub fn with_shared(mut self, hooks: Rc<dyn RuntimeHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// True without sinks.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl RuntimeHooks for CompositeHooks {
    fn emit(&self, event: &RuntimeEvent, ctx: &EmitContext) {
        for hooks in &self.hooks {
            if let Err(defect) = catch_panic(|| hooks.emit(event, ctx)) {
                warn!(event = event.name(), error = %defect, "hook panicked");
            }
        }
    }

    fn flush(&self) {
        for hooks in &self.hooks {
            if let Err(defect) = catch_panic(|| hooks.flush()) {
                warn!(error = %defect, "hook flush panicked");
            }
        }
    }
}
