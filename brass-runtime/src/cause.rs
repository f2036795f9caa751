//! Cause and Exit: what a fiber produced, or why it produced nothing.

use std::fmt;

use crate::panic::Defect;

/// Why an effect produced no value.
///
/// `Interrupt` is never folded into `Fail`. Ordinary error handlers only see
/// `Fail`; `Interrupt` and `Die` are visible to finalizers and joiners only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// A typed, recoverable domain failure.
    Fail(E),
    /// Cooperative cancellation.
    Interrupt,
    /// A defect: a panic or a broken runtime invariant.
    Die(Defect),
}

impl<E> Cause<E> {
    /// Shorthand for `Cause::Die(Defect::new(message))`.
    pub fn die(message: impl Into<String>) -> Self {
        Cause::Die(Defect::new(message))
    }

    /// True for a typed failure.
    pub fn is_fail(&self) -> bool {
        matches!(self, Cause::Fail(_))
    }

    /// True for an interruption.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Cause::Interrupt)
    }

    /// True for a defect.
    pub fn is_die(&self) -> bool {
        matches!(self, Cause::Die(_))
    }

    /// The typed failure, if this is one.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Cause::Fail(e) => Some(e),
            _ => None,
        }
    }

    /// Consume the cause, returning the typed failure if there is one.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Cause::Fail(e) => Some(e),
            _ => None,
        }
    }

    /// The defect, if this is one.
    pub fn defect(&self) -> Option<&Defect> {
        match self {
            Cause::Die(d) => Some(d),
            _ => None,
        }
    }

    /// Transform the typed failure.
    pub fn map<E2>(self, f: impl FnOnce(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Interrupt => Cause::Interrupt,
            Cause::Die(d) => Cause::Die(d),
        }
    }

    /// Drop the error payload, keeping the flavor.
    pub fn to_unit(&self) -> Cause<()> {
        match self {
            Cause::Fail(_) => Cause::Fail(()),
            Cause::Interrupt => Cause::Interrupt,
            Cause::Die(d) => Cause::Die(d.clone()),
        }
    }

    /// Classification of the cause.
    pub fn kind(&self) -> ExitKind {
        match self {
            Cause::Fail(_) => ExitKind::Failure,
            Cause::Interrupt => ExitKind::Interrupted,
            Cause::Die(_) => ExitKind::Defect,
        }
    }

    /// Short human-readable description that does not require `E: Debug`.
    pub(crate) fn describe(&self) -> String {
        match self {
            Cause::Fail(_) => "failed".to_string(),
            Cause::Interrupt => "interrupted".to_string(),
            Cause::Die(d) => format!("defect: {}", d),
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Fail(e) => write!(f, "fail: {:?}", e),
            Cause::Interrupt => f.write_str("interrupted"),
            Cause::Die(d) => write!(f, "die: {}", d),
        }
    }
}

/// The flavor of a terminal result, without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitKind {
    /// Completed with a value.
    Success,
    /// Completed with a typed failure.
    Failure,
    /// Completed by interruption.
    Interrupted,
    /// Completed by a defect.
    Defect,
}

impl ExitKind {
    /// Lowercase name used in events and dumps.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::Success => "success",
            ExitKind::Failure => "failure",
            ExitKind::Interrupted => "interrupted",
            ExitKind::Defect => "defect",
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a fiber. Written once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit<E, A> {
    /// The effect produced a value.
    Success(A),
    /// The effect produced no value.
    Failure(Cause<E>),
}

/// The exit a scope closes with. Scopes own fibers of many types, so the
/// payloads are erased; only the flavor (and a defect's message) remain.
pub type ScopeExit = Exit<(), ()>;

impl<E, A> Exit<E, A> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::Fail(error))
    }

    /// An interruption.
    pub fn interrupt() -> Self {
        Exit::Failure(Cause::Interrupt)
    }

    /// A defect.
    pub fn die(message: impl Into<String>) -> Self {
        Exit::Failure(Cause::die(message))
    }

    /// True when the exit holds a value.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True for any failure cause.
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// True when the exit is an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Failure(Cause::Interrupt))
    }

    /// The success value.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(c) => Some(c),
        }
    }

    /// Convert into a `Result`, keeping the full cause on the error side.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c) => Err(c),
        }
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(c) => Exit::Failure(c),
        }
    }

    /// Transform the typed failure.
    pub fn map_error<E2>(self, f: impl FnOnce(E) -> E2) -> Exit<E2, A> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(c) => Exit::Failure(c.map(f)),
        }
    }

    /// Classification of the exit.
    pub fn kind(&self) -> ExitKind {
        match self {
            Exit::Success(_) => ExitKind::Success,
            Exit::Failure(c) => c.kind(),
        }
    }

    /// Erase the payloads into the form scopes close with.
    pub fn to_scope_exit(&self) -> ScopeExit {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(c) => Exit::Failure(c.to_unit()),
        }
    }
}

impl<E, A> From<Result<A, E>> for Exit<E, A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_predicates() {
        let fail: Cause<&str> = Cause::Fail("e");
        assert!(fail.is_fail());
        assert!(!fail.is_interrupt());
        assert!(Cause::<()>::Interrupt.is_interrupt());
        assert!(Cause::<()>::die("x").is_die());
    }

    #[test]
    fn test_interrupt_never_maps_into_fail() {
        let cause: Cause<i32> = Cause::Interrupt;
        let mapped = cause.map(|n| n.to_string());
        assert_eq!(mapped, Cause::Interrupt);
        assert!(mapped.failure().is_none());
    }

    #[test]
    fn test_exit_into_result() {
        let ok: Exit<String, i32> = Exit::succeed(1);
        assert_eq!(ok.into_result(), Ok(1));
        let err: Exit<String, i32> = Exit::fail("bad".into());
        assert_eq!(err.into_result(), Err(Cause::Fail("bad".to_string())));
    }

    #[test]
    fn test_exit_kind() {
        assert_eq!(Exit::<(), ()>::succeed(()).kind(), ExitKind::Success);
        assert_eq!(Exit::<(), ()>::fail(()).kind(), ExitKind::Failure);
        assert_eq!(Exit::<(), ()>::interrupt().kind(), ExitKind::Interrupted);
        assert_eq!(Exit::<(), ()>::die("d").kind(), ExitKind::Defect);
    }

    #[test]
    fn test_to_scope_exit_keeps_flavor() {
        let exit: Exit<String, Vec<u8>> = Exit::die("broken");
        assert_eq!(exit.to_scope_exit(), ScopeExit::die("broken"));
        let exit: Exit<String, Vec<u8>> = Exit::fail("nope".into());
        assert_eq!(exit.to_scope_exit(), ScopeExit::fail(()));
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(Cause::Fail("x").to_string(), "fail: \"x\"");
        assert_eq!(Cause::<()>::Interrupt.to_string(), "interrupted");
        assert_eq!(Cause::<()>::die("oops").to_string(), "die: oops");
    }

    #[test]
    fn test_exit_from_result() {
        let exit: Exit<&str, u8> = Err("no").into();
        assert!(exit.is_failure());
        assert_eq!(exit.cause(), Some(&Cause::Fail("no")));
    }
}
