//! Lifecycle events and the hook interface.
//!
//! The runtime calls [`RuntimeHooks::emit`] at fixed points: fiber start,
//! suspend, resume and end, scope open and close, and explicit log calls.
//! Every call carries an [`EmitContext`] with the correlation ids of the
//! fiber that caused it. Hooks observe; they never influence scheduling or
//! outcomes. A hook that panics is logged and ignored.

use std::rc::Rc;
use std::sync::Arc;

use crate::cause::ExitKind;
use crate::config::LogLevel;
use crate::fiber::FiberId;
use crate::scope::ScopeId;

/// A runtime lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A fiber was created and queued for its first step.
    FiberStart {
        /// The new fiber.
        fiber: FiberId,
        /// The fiber that forked it.
        parent: Option<FiberId>,
        /// The scope it belongs to.
        scope: Option<ScopeId>,
        /// Diagnostic name.
        name: Option<String>,
    },
    /// A fiber reached its terminal state.
    FiberEnd {
        /// The fiber.
        fiber: FiberId,
        /// How it ended.
        status: ExitKind,
        /// Rendered cause for anything but success.
        error: Option<String>,
    },
    /// A fiber suspended at an async boundary.
    FiberSuspend {
        /// The fiber.
        fiber: FiberId,
        /// Label of the registration, if any.
        reason: Option<&'static str>,
    },
    /// A suspended fiber was re-queued.
    FiberResume {
        /// The fiber.
        fiber: FiberId,
    },
    /// A scope was opened.
    ScopeOpen {
        /// The scope.
        scope: ScopeId,
        /// Its parent, for sub-scopes.
        parent: Option<ScopeId>,
    },
    /// A scope finished closing.
    ScopeClose {
        /// The scope.
        scope: ScopeId,
        /// Flavor of the exit it was closed with.
        status: ExitKind,
    },
    /// An application log line.
    Log {
        /// Severity.
        level: LogLevel,
        /// Message text.
        message: String,
        /// Structured key/value fields.
        fields: Vec<(String, String)>,
    },
}

impl RuntimeEvent {
    /// Stable dotted name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::FiberStart { .. } => "fiber.start",
            RuntimeEvent::FiberEnd { .. } => "fiber.end",
            RuntimeEvent::FiberSuspend { .. } => "fiber.suspend",
            RuntimeEvent::FiberResume { .. } => "fiber.resume",
            RuntimeEvent::ScopeOpen { .. } => "scope.open",
            RuntimeEvent::ScopeClose { .. } => "scope.close",
            RuntimeEvent::Log { .. } => "log",
        }
    }

    /// The fiber this event is about, if any.
    pub fn fiber(&self) -> Option<FiberId> {
        match self {
            RuntimeEvent::FiberStart { fiber, .. }
            | RuntimeEvent::FiberEnd { fiber, .. }
            | RuntimeEvent::FiberSuspend { fiber, .. }
            | RuntimeEvent::FiberResume { fiber } => Some(*fiber),
            _ => None,
        }
    }
}

/// Correlation context passed with every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitContext {
    /// The fiber that caused the event.
    pub fiber_id: Option<FiberId>,
    /// Its scope.
    pub scope_id: Option<ScopeId>,
    /// Trace id of the fiber.
    pub trace_id: Option<u128>,
    /// Span id of the fiber.
    pub span_id: Option<u64>,
}

/// Receiver of runtime lifecycle events.
pub trait RuntimeHooks {
    /// Observe one event. Must not block.
    fn emit(&self, event: &RuntimeEvent, ctx: &EmitContext);

    /// Called by the runtime when the run queue is idle. Buffered sinks
    /// deliver here.
    fn flush(&self) {}
}

impl<T: RuntimeHooks + ?Sized> RuntimeHooks for Arc<T> {
    fn emit(&self, event: &RuntimeEvent, ctx: &EmitContext) {
        (**self).emit(event, ctx)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

impl<T: RuntimeHooks + ?Sized> RuntimeHooks for Rc<T> {
    fn emit(&self, event: &RuntimeEvent, ctx: &EmitContext) {
        (**self).emit(event, ctx)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

/// Hooks that ignore everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl RuntimeHooks for NoopHooks {
    fn emit(&self, _event: &RuntimeEvent, _ctx: &EmitContext) {}
}
