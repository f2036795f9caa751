//! Panic capture.
//!
//! User code runs inside the interpreter: thunks, continuations, async
//! registrations, finalizers and hooks. A panic in any of them must never
//! unwind through the scheduler, so every call site goes through
//! [`catch_panic`], which turns the panic payload into a [`Defect`]. The
//! interpreter then reports it as `Cause::Die`.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// An unexpected host-level failure: a panic, or an interpreter invariant
/// that did not hold.
///
/// Defects are bug signals, not domain conditions. They travel as
/// `Cause::Die` and bypass ordinary `fold` handlers.
#[derive(Debug, Clone)]
pub struct Defect {
    message: String,
    backtrace: Option<String>,
    thread_name: Option<String>,
}

impl Defect {
    /// Create a defect from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: None,
            thread_name: None,
        }
    }

    /// Build a defect from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let thread = std::thread::current();
        Self {
            message: payload_message(payload.as_ref()),
            backtrace: capture_backtrace(),
            thread_name: thread.name().map(str::to_string),
        }
    }

    /// The panic message or invariant description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The captured backtrace, when `RUST_BACKTRACE` enabled capture.
    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    /// Name of the thread the panic happened on, if it had one.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// Two defects describe the same failure when their messages agree; the
// backtrace is diagnostic only.
impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

impl Eq for Defect {}

/// Run `f`, converting a panic into a [`Defect`].
///
/// The closure is wrapped in `AssertUnwindSafe`: the interpreter discards
/// any state the closure could have left half-updated, because a panicking
/// step always terminates the computation it belonged to.
pub fn catch_panic<F, T>(f: F) -> Result<T, Defect>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

/// Extract a readable message from a panic payload.
pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Capture a backtrace if the environment enables it.
fn capture_backtrace() -> Option<String> {
    let bt = Backtrace::capture();
    match bt.status() {
        BacktraceStatus::Captured => Some(bt.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_panic_ok() {
        let result = catch_panic(|| 42);
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn test_catch_panic_str_payload() {
        let result: Result<(), Defect> = catch_panic(|| panic!("boom"));
        let defect = result.unwrap_err();
        assert_eq!(defect.message(), "boom");
    }

    #[test]
    fn test_catch_panic_string_payload() {
        let result: Result<(), Defect> = catch_panic(|| panic!("code {}", 7));
        assert_eq!(result.unwrap_err().message(), "code 7");
    }

    #[test]
    fn test_catch_panic_unknown_payload() {
        let result: Result<(), Defect> = catch_panic(|| std::panic::panic_any(13u8));
        assert_eq!(result.unwrap_err().message(), "unknown panic");
    }

    #[test]
    fn test_defect_equality_ignores_backtrace() {
        let mut a = Defect::new("x");
        a.backtrace = Some("frame".into());
        assert_eq!(a, Defect::new("x"));
        assert_ne!(a, Defect::new("y"));
    }

    #[test]
    fn test_defect_display() {
        assert_eq!(Defect::new("broken invariant").to_string(), "broken invariant");
    }
}
