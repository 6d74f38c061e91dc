// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful context switching, the primitive underneath a tasklet's "hard switch".
//!
//! A [`Fiber`] owns a private stack and can be resumed and suspended like a
//! stackful coroutine. `tasklet-runtime` uses this to implement the hard-switch
//! path of `TaskletRuntime::schedule` for tasklets whose current frame is not at
//! interpreter top level and therefore cannot unwind back to the dispatch loop.
//!
//! This crate is heavily based on [`corosensei`] by Amanieu d'Antras, by way of
//! k23's `fiber` crate. Only the host architectures we actually run the test
//! suite on (x86_64 and aarch64, both hosted) are implemented; the riscv and
//! windows backends were dropped since the cooperative runtime this supports
//! targets hosted platforms, not the k23 kernel itself (see DESIGN.md).
//!
//! [`corosensei`]: https://github.com/Amanieu/corosensei

#![cfg_attr(all(not(test), tasklet_fiber_no_std), no_std)]

mod arch;
pub mod stack;
mod utils;

use crate::stack::{FiberStack, StackPointer};
use crate::utils::EncodedValue;
use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::mem::{MaybeUninit, offset_of};
use core::ptr;

/// Value returned from resuming a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FiberResult<Yield, Return> {
    /// Value returned by a fiber suspending itself with a `Suspend`.
    Yield(Yield),
    /// Value returned by a fiber returning from its main function.
    Return(Return),
}

impl<Yield, Return> FiberResult<Yield, Return> {
    /// Returns the `Yield` value as an `Option<Yield>`.
    pub fn into_yield(self) -> Option<Yield> {
        match self {
            FiberResult::Yield(val) => Some(val),
            FiberResult::Return(_) => None,
        }
    }

    /// Returns the `Return` value as an `Option<Return>`.
    pub fn into_return(self) -> Option<Return> {
        match self {
            FiberResult::Yield(_) => None,
            FiberResult::Return(val) => Some(val),
        }
    }
}

/// A stackful, resumable execution context.
pub struct Fiber<Input, Yield, Return, S: FiberStack> {
    stack: S,
    /// Current stack pointer at which the fiber state is held. `None` once the
    /// fiber has completed.
    stack_ptr: Option<StackPointer>,
    /// Initial stack pointer, used to detect whether the fiber was ever resumed.
    initial_stack_ptr: StackPointer,
    _m1: PhantomData<fn(Input) -> FiberResult<Yield, Return>>,
    /// Fibers are not `Send`: a suspended fiber's stack holds live, thread-affine
    /// register state that can only be resumed from the thread that suspended it.
    _m2: PhantomData<*mut ()>,
}

impl<Input, Yield, Return, S: FiberStack> Fiber<Input, Yield, Return, S> {
    /// Creates a new fiber that will run `func` on `stack` once first resumed.
    pub fn with_stack<F>(stack: S, func: F) -> Self
    where
        F: FnOnce(Input, &Suspend<Input, Yield>) -> Return,
        F: 'static,
        Input: 'static,
        Yield: 'static,
        Return: 'static,
    {
        struct InitialObject<F> {
            func: MaybeUninit<F>,
        }

        unsafe extern "C-unwind" fn fiber_func<Input, Yield, Return, F>(
            input: EncodedValue,
            parent_link: &mut StackPointer,
            obj: *mut InitialObject<F>,
        ) -> !
        where
            F: FnOnce(Input, &Suspend<Input, Yield>) -> Return,
        {
            // Safety: `obj` was written by `init_stack` below and is read exactly
            // once, here, on first resume.
            unsafe {
                let suspend = &*(ptr::from_mut(parent_link).cast::<Suspend<Input, Yield>>());
                let obj = obj.as_ref().unwrap();
                let input: Input = utils::decode_val(input);

                let result = obj.func.assume_init_read()(input, suspend);

                let mut result = ManuallyDrop::new(result);
                arch::switch_and_reset(utils::encode_val(&mut result), suspend.stack_ptr.as_ptr());
            }
        }

        // Safety: `stack` is freshly allocated and not aliased.
        unsafe {
            let (stack_ptr, _init_obj) = arch::init_stack(
                &stack,
                fiber_func::<Input, Yield, Return, F>,
                InitialObject {
                    func: MaybeUninit::new(func),
                },
            );

            let _ = offset_of!(InitialObject<F>, func);

            Self {
                stack,
                stack_ptr: Some(stack_ptr),
                initial_stack_ptr: stack_ptr,
                _m1: PhantomData,
                _m2: PhantomData,
            }
        }
    }

    /// Resumes a suspended fiber, passing `input` through to the point it
    /// suspended at (or to its entry point, on first resume).
    ///
    /// # Panics
    ///
    /// Panics if the fiber has already completed.
    pub fn resume(&mut self, input: Input) -> FiberResult<Yield, Return> {
        let mut input = ManuallyDrop::new(input);

        let stack_ptr = self
            .stack_ptr
            .take()
            .expect("attempt to resume a completed fiber");

        // Safety: `stack_ptr` was produced by a prior suspend/init of this fiber.
        unsafe {
            let (result, stack_ptr) =
                arch::switch_and_link(utils::encode_val(&mut input), stack_ptr, self.stack.top());

            self.stack_ptr = stack_ptr;

            if stack_ptr.is_some() {
                FiberResult::Yield(utils::decode_val(result))
            } else {
                FiberResult::Return(utils::decode_val(result))
            }
        }
    }

    /// Returns whether this fiber has been resumed at least once.
    pub fn started(&self) -> bool {
        self.stack_ptr != Some(self.initial_stack_ptr)
    }

    /// Returns whether this fiber has finished executing.
    pub fn done(&self) -> bool {
        self.stack_ptr.is_none()
    }

    /// Reclaims the stack for reuse, consuming the fiber.
    ///
    /// # Panics
    ///
    /// Panics if the fiber has not finished executing: a suspended fiber's
    /// stack still holds live register state.
    pub fn into_stack(self) -> S {
        assert!(self.done(), "attempt to reclaim the stack of a fiber that has not finished");
        self.stack
    }
}

/// A handle passed into a running fiber's body, used to suspend it.
#[repr(transparent)]
pub struct Suspend<Input, Yield> {
    // Internally this is just the parent link on the stack, updated every time
    // `resume` is called.
    stack_ptr: Cell<StackPointer>,
    marker: PhantomData<fn(Yield) -> Input>,
}

impl<Input, Yield> Suspend<Input, Yield> {
    /// Suspends the calling fiber, returning `val` to the caller of `resume`.
    pub fn suspend(&self, val: Yield) -> Input {
        // Safety: `stack_ptr` holds the parent's context, maintained by the arch switch.
        unsafe {
            let mut val = ManuallyDrop::new(val);
            let result = arch::switch_yield(utils::encode_val(&mut val), self.stack_ptr.as_ptr());
            utils::decode_val(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Fiber;
    use crate::stack::DefaultFiberStack;

    #[test]
    fn resume_yield_return() {
        let stack = DefaultFiberStack::default();

        let mut fiber = Fiber::with_stack(stack, |input, suspend| {
            assert_eq!(input, 100);

            for i in 0..5 {
                let input = suspend.suspend(i);
                assert_eq!(input, 100 + i + 1);
            }
        });

        assert_eq!(fiber.resume(100).into_yield().unwrap(), 0);
        assert_eq!(fiber.resume(101).into_yield().unwrap(), 1);
        assert_eq!(fiber.resume(102).into_yield().unwrap(), 2);
        assert_eq!(fiber.resume(103).into_yield().unwrap(), 3);
        assert_eq!(fiber.resume(104).into_yield().unwrap(), 4);

        assert!(fiber.resume(105).into_return().is_some());
        assert!(fiber.done());
    }

    #[test]
    #[should_panic(expected = "attempt to resume a completed fiber")]
    fn resume_after_done_panics() {
        let stack = DefaultFiberStack::default();
        let mut fiber = Fiber::with_stack(stack, |_input: (), _suspend: &crate::Suspend<(), ()>| {});
        assert!(fiber.resume(()).into_return().is_some());
        fiber.resume(());
    }

    #[test]
    fn into_stack_reclaims_a_finished_fiber() {
        let stack = DefaultFiberStack::default();
        let mut fiber = Fiber::with_stack(stack, |_input: (), _suspend: &crate::Suspend<(), ()>| {});
        assert!(fiber.resume(()).into_return().is_some());
        let _stack = fiber.into_stack();
    }

    #[test]
    #[should_panic(expected = "attempt to reclaim the stack of a fiber that has not finished")]
    fn into_stack_panics_while_suspended() {
        let stack = DefaultFiberStack::default();
        let mut fiber = Fiber::with_stack(stack, |input, suspend| {
            suspend.suspend(input);
        });
        fiber.resume(());
        fiber.into_stack();
    }
}
