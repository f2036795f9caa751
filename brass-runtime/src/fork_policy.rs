//! Fork policy and correlation context.
//!
//! Every fiber gets a [`FiberMeta`] at creation: an optional name, its
//! parent fiber and scope, and a [`TraceContext`]. A child inherits the
//! parent's trace id, gets a fresh span id, and records the parent's span as
//! its parent span. The metadata is purely observational. It shows up in
//! hook events and registry dumps and never influences scheduling.
//!
//! # Example
//!
//! ```rust,ignore
//! use brass_runtime::fork_policy::{ForkPolicy, TraceContext};
//!
//! let incoming = TraceContext::from_traceparent(
//!     "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
//! ).unwrap();
//! let policy = ForkPolicy::new().with_root_context(incoming);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fiber::FiberId;
use crate::scheduler::CurrentFiber;
use crate::scope::ScopeId;

/// W3C-style trace context carried by each fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceContext {
    /// Trace ID (identifies the entire trace).
    pub trace_id: u128,
    /// Span ID (identifies this fiber).
    pub span_id: u64,
    /// Parent span ID, if any.
    pub parent_span_id: Option<u64>,
    /// Sampling decision.
    pub sampled: bool,
}

impl TraceContext {
    /// A root context with the given ids.
    pub fn new_root(trace_id: u128, span_id: u64) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
            sampled: true,
        }
    }

    /// A child of this context with a new span id.
    pub fn child_span(&self, span_id: u64) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id,
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
        }
    }

    /// Format as a W3C `traceparent` header.
    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id,
            self.span_id,
            if self.sampled { 1 } else { 0 }
        )
    }

    /// Parse a W3C `traceparent` header.
    pub fn from_traceparent(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        if parts.len() != 4 || parts[0] != "00" {
            return None;
        }
        if parts[1].len() != 32 || parts[2].len() != 16 || parts[3].len() != 2 {
            return None;
        }

        let trace_id = u128::from_str_radix(parts[1], 16).ok()?;
        let span_id = u64::from_str_radix(parts[2], 16).ok()?;
        let flags = u8::from_str_radix(parts[3], 16).ok()?;
        if trace_id == 0 || span_id == 0 {
            return None;
        }

        Some(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            sampled: flags & 1 != 0,
        })
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_traceparent())
    }
}

/// Source of trace and span ids.
pub trait IdGenerator {
    /// A new, non-zero trace id.
    fn trace_id(&mut self) -> u128;
    /// A new, non-zero span id.
    fn span_id(&mut self) -> u64;
}

/// xorshift64* generator. Deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct XorShiftIds {
    state: u64,
}

impl XorShiftIds {
    /// Generator with a fixed seed.
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    /// Generator seeded from the wall clock.
    pub fn from_time() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::new(nanos ^ u64::from(std::process::id()).rotate_left(32))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

impl IdGenerator for XorShiftIds {
    fn trace_id(&mut self) -> u128 {
        loop {
            let id = (u128::from(self.next()) << 64) | u128::from(self.next());
            if id != 0 {
                return id;
            }
        }
    }

    fn span_id(&mut self) -> u64 {
        loop {
            let id = self.next();
            if id != 0 {
                return id;
            }
        }
    }
}

/// Metadata attached to a fiber at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberMeta {
    /// Optional diagnostic name.
    pub name: Option<String>,
    /// The fiber that was running when this one was forked.
    pub parent: Option<FiberId>,
    /// Scope the fiber was forked into.
    pub scope: Option<ScopeId>,
    /// Correlation context.
    pub trace: TraceContext,
}

#[cfg(test)]
impl FiberMeta {
    pub(crate) fn root_for_tests() -> Self {
        Self {
            name: None,
            parent: None,
            scope: None,
            trace: TraceContext::new_root(1, 1),
        }
    }
}

type ChildNamer = Box<dyn Fn(Option<&str>) -> Option<String>>;

/// Decides the metadata of every new fiber.
pub struct ForkPolicy {
    ids: RefCell<Box<dyn IdGenerator>>,
    root: Option<TraceContext>,
    child_name: ChildNamer,
}

impl fmt::Debug for ForkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkPolicy")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Default for ForkPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkPolicy {
    /// Time-seeded ids, no root context, `"{parent}/child"` naming.
    pub fn new() -> Self {
        Self {
            ids: RefCell::new(Box::new(XorShiftIds::from_time())),
            root: None,
            child_name: Box::new(|parent| parent.map(|p| format!("{}/child", p))),
        }
    }

    /// Use a deterministic id generator.
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_ids(XorShiftIds::new(seed))
    }

    /// Use a custom id generator.
    pub fn with_ids(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = RefCell::new(Box::new(ids));
        self
    }

    /// Make root fibers children of an incoming trace.
    pub fn with_root_context(mut self, context: TraceContext) -> Self {
        self.root = Some(context);
        self
    }

    /// Replace the child naming function.
    pub fn with_child_name<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&str>) -> Option<String> + 'static,
    {
        self.child_name = Box::new(f);
        self
    }

    /// Compute the metadata of a fiber forked while `parent` is running.
    pub(crate) fn init_child(
        &self,
        parent: Option<&CurrentFiber>,
        scope: Option<ScopeId>,
        name: Option<String>,
    ) -> FiberMeta {
        let mut ids = self.ids.borrow_mut();
        let span = ids.span_id();
        let trace = match (parent, self.root) {
            (Some(p), _) => p.meta.trace.child_span(span),
            (None, Some(root)) => root.child_span(span),
            (None, None) => TraceContext::new_root(ids.trace_id(), span),
        };
        let name = name.or_else(|| (self.child_name)(parent.and_then(|p| p.meta.name.as_deref())));
        FiberMeta {
            name,
            parent: parent.map(|p| p.id),
            scope,
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn parent(name: Option<&str>) -> CurrentFiber {
        CurrentFiber {
            id: FiberId::new(1),
            meta: Rc::new(FiberMeta {
                name: name.map(str::to_string),
                parent: None,
                scope: None,
                trace: TraceContext::new_root(0xabc, 0x11),
            }),
        }
    }

    #[test]
    fn test_child_span_inherits_trace() {
        let root = TraceContext::new_root(5, 6);
        let child = root.child_span(7);
        assert_eq!(child.trace_id, 5);
        assert_eq!(child.span_id, 7);
        assert_eq!(child.parent_span_id, Some(6));
        assert!(child.sampled);
    }

    #[test]
    fn test_traceparent_roundtrip() {
        let ctx = TraceContext {
            trace_id: 0x0102030405060708090a0b0c0d0e0f10,
            span_id: 0x1112131415161718,
            parent_span_id: None,
            sampled: true,
        };
        let header = ctx.to_traceparent();
        assert_eq!(header, "00-0102030405060708090a0b0c0d0e0f10-1112131415161718-01");
        assert_eq!(TraceContext::from_traceparent(&header), Some(ctx));
    }

    #[test]
    fn test_traceparent_rejects_garbage() {
        assert!(TraceContext::from_traceparent("").is_none());
        assert!(TraceContext::from_traceparent("01-aa-bb-01").is_none());
        assert!(TraceContext::from_traceparent(
            "00-00000000000000000000000000000000-1112131415161718-01"
        )
        .is_none());
    }

    #[test]
    fn test_init_child_links_parent() {
        let policy = ForkPolicy::new().with_seed(42);
        let p = parent(Some("worker"));
        let meta = policy.init_child(Some(&p), None, None);
        assert_eq!(meta.parent, Some(FiberId::new(1)));
        assert_eq!(meta.trace.trace_id, 0xabc);
        assert_eq!(meta.trace.parent_span_id, Some(0x11));
        assert_ne!(meta.trace.span_id, 0x11);
        assert_eq!(meta.name.as_deref(), Some("worker/child"));
    }

    #[test]
    fn test_root_fiber_gets_fresh_trace() {
        let policy = ForkPolicy::new().with_seed(1);
        let a = policy.init_child(None, None, None);
        let b = policy.init_child(None, None, None);
        assert!(a.name.is_none());
        assert!(a.trace.parent_span_id.is_none());
        assert_ne!(a.trace.trace_id, b.trace.trace_id);
    }

    #[test]
    fn test_root_context_seed() {
        let seed = TraceContext::new_root(99, 3);
        let policy = ForkPolicy::new().with_seed(1).with_root_context(seed);
        let meta = policy.init_child(None, None, Some("main".into()));
        assert_eq!(meta.trace.trace_id, 99);
        assert_eq!(meta.trace.parent_span_id, Some(3));
        assert_eq!(meta.name.as_deref(), Some("main"));
    }

    #[test]
    fn test_seeded_ids_are_deterministic() {
        let mut a = XorShiftIds::new(7);
        let mut b = XorShiftIds::new(7);
        assert_eq!(a.span_id(), b.span_id());
        assert_eq!(a.trace_id(), b.trace_id());
    }

    #[test]
    fn test_custom_child_name() {
        let policy = ForkPolicy::new().with_child_name(|p| Some(format!("{}.sub", p.unwrap_or("root"))));
        let meta = policy.init_child(None, None, None);
        assert_eq!(meta.name.as_deref(), Some("root.sub"));
    }
}
