//! Continuation frames.
//!
//! Each fiber owns one [`ContinuationStack`]. `Sequence` and `Fold` push a
//! frame and descend into their first effect; a value or a failure pops
//! frames. The stack lives on the heap, so chains of any depth evaluate
//! without growing the host call stack. Frames are dropped as soon as they
//! are popped or discarded.

use crate::effect::Cont;

/// A pending step of the program.
pub(crate) enum Frame<R> {
    /// Continue with the produced value.
    Success(Cont<R>),
    /// Handle either a typed failure or a value.
    Fold {
        on_failure: Cont<R>,
        on_success: Cont<R>,
    },
}

/// Per-fiber stack of frames, most recent last.
pub(crate) struct ContinuationStack<R> {
    frames: Vec<Frame<R>>,
    high_water: usize,
}

impl<R> Default for ContinuationStack<R> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            high_water: 0,
        }
    }
}

impl<R> ContinuationStack<R> {
    pub(crate) fn push(&mut self, frame: Frame<R>) {
        self.frames.push(frame);
        if self.frames.len() > self.high_water {
            self.high_water = self.frames.len();
        }
    }

    /// Pop the continuation that receives a success value.
    pub(crate) fn pop_success(&mut self) -> Option<Cont<R>> {
        self.frames.pop().map(|frame| match frame {
            Frame::Success(k) => k,
            Frame::Fold { on_success, .. } => on_success,
        })
    }

    /// Discard frames until a fold frame is found and return its failure
    /// handler. `None` means the failure reaches the fiber boundary.
    pub(crate) fn unwind_to_handler(&mut self) -> Option<Cont<R>> {
        while let Some(frame) = self.frames.pop() {
            if let Frame::Fold { on_failure, .. } = frame {
                return Some(on_failure);
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Deepest the stack has been.
    pub(crate) fn high_water(&self) -> usize {
        self.high_water
    }
}

impl<R> Frame<R> {
    pub(crate) fn fold(on_failure: Cont<R>, on_success: Cont<R>) -> Self {
        Frame::Fold {
            on_failure,
            on_success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{AnyValue, Instr};

    fn cont(tag: u32) -> Cont<()> {
        Box::new(move |_v: AnyValue| Instr::Succeed(Box::new(tag)))
    }

    fn tag_of(next: Instr<()>) -> u32 {
        match next {
            Instr::Succeed(v) => *v.downcast::<u32>().unwrap(),
            _ => panic!("unexpected instruction"),
        }
    }

    #[test]
    fn test_pop_success_is_lifo() {
        let mut stack = ContinuationStack::default();
        stack.push(Frame::Success(cont(1)));
        stack.push(Frame::Success(cont(2)));
        assert_eq!(stack.len(), 2);
        let k = stack.pop_success().unwrap();
        assert_eq!(tag_of(k(Box::new(()))), 2);
        let k = stack.pop_success().unwrap();
        assert_eq!(tag_of(k(Box::new(()))), 1);
        assert!(stack.pop_success().is_none());
    }

    #[test]
    fn test_pop_success_uses_fold_success_branch() {
        let mut stack = ContinuationStack::default();
        stack.push(Frame::fold(cont(10), cont(20)));
        let k = stack.pop_success().unwrap();
        assert_eq!(tag_of(k(Box::new(()))), 20);
    }

    #[test]
    fn test_unwind_skips_success_frames() {
        let mut stack = ContinuationStack::default();
        stack.push(Frame::fold(cont(1), cont(2)));
        stack.push(Frame::Success(cont(3)));
        stack.push(Frame::Success(cont(4)));
        let handler = stack.unwind_to_handler().unwrap();
        assert_eq!(tag_of(handler(Box::new(()))), 1);
        assert!(stack.is_empty());
        assert!(stack.unwind_to_handler().is_none());
    }

    #[test]
    fn test_high_water_survives_pops() {
        let mut stack = ContinuationStack::default();
        for i in 0..5 {
            stack.push(Frame::Success(cont(i)));
        }
        stack.pop_success();
        assert_eq!(stack.high_water(), 5);
        while stack.pop_success().is_some() {}
        assert!(stack.is_empty());
        assert_eq!(stack.high_water(), 5);
    }
}
