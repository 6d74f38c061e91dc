// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tasklet_fiber::Fiber;
use tasklet_fiber::stack::DefaultFiberStack;

/// Cost of a single hard switch into a fiber that immediately yields back,
/// and of resuming it to completion.
fn fiber_switch(c: &mut Criterion) {
    c.bench_function("fiber_switch", |b| {
        b.iter(|| {
            let stack = DefaultFiberStack::default();
            let mut fiber = Fiber::with_stack(stack, |input, suspend| suspend.suspend(input));
            let yielded = fiber.resume(black_box(0usize)).into_yield().unwrap();
            fiber.resume(yielded).into_return().unwrap()
        })
    });
}

/// Cost of allocating a fresh stack and running a fiber that returns without
/// ever suspending (the "C-frame" shape used for native callables).
fn fiber_call(c: &mut Criterion) {
    let mut stack = DefaultFiberStack::default();

    c.bench_function("fiber_call", |b| {
        b.iter(|| {
            let mut fiber =
                Fiber::<usize, (), usize, _>::with_stack(&mut stack, |input, _suspend| input);
            fiber.resume(black_box(0usize)).into_return().unwrap()
        })
    });
}

criterion_group!(benches, fiber_switch, fiber_call);
criterion_main!(benches);
