use coswitch::stack::DefaultStack;
use coswitch::Coroutine;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn coroutine_switch(c: &mut Criterion) {
    let mut identity = Coroutine::<usize, usize, ()>::new(|yielder, mut input| loop {
        input = yielder.suspend(input);
    });

    c.bench_function("coroutine_switch", |b| {
        b.iter(|| identity.resume(black_box(0usize)))
    });

    // The identity loop never finishes; deinit abandons it and releases the
    // stack without unwinding.
    identity.deinit();
}

fn coroutine_call(c: &mut Criterion) {
    // Don't count time spent allocating a stack.
    let mut stack = DefaultStack::default();

    c.bench_function("coroutine_call", move |b| {
        b.iter(|| {
            let mut identity =
                Coroutine::<usize, (), usize, _>::with_stack(&mut stack, |_yielder, input| input);
            identity.resume(black_box(0usize))
        })
    });
}

criterion_group!(benches, coroutine_switch, coroutine_call);
criterion_main!(benches);
