#![allow(unused)]
extern crate asyncscope;

use asyncscope::prelude::*;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

fn yield_now() -> Stmt {
    Stmt::await_(Expr::call("Task.Yield", vec![], TypeRef::yield_awaitable()))
}

/// A method with `awaits` sequential awaits, every other one inside a try/finally.
fn method(name: &str, ordinal: u32, awaits: usize) -> AsyncMethodDescriptor {
    let mut m = MethodBuilder::new(name, ReturnShape::TaskOf(TypeRef::Int32)).ordinal(ordinal);
    let total = m.local("total", TypeRef::Int32);
    m.push(Stmt::declare(total, Expr::int(0)));
    for i in 0..awaits {
        let step = Stmt::assign(total, Expr::add(Expr::local(total), Expr::int(i as i32)));
        if i % 2 == 0 {
            m.push(yield_now()).push(step);
        } else {
            m.push(Stmt::try_finally(vec![yield_now()], vec![step]));
        }
    }
    m.push(Stmt::Return(Some(Expr::local(total))));
    m.build()
}

/// Lowering cost as the number of suspension points grows
fn bench_lower(c: &mut Criterion) {
    let mut group = c.benchmark_group("lower");
    for awaits in [1usize, 8, 32, 128] {
        let descriptor = method("Bench", 0, awaits);
        group.throughput(Throughput::Elements(awaits as u64));
        group.bench_with_input(BenchmarkId::from_parameter(awaits), &descriptor, |b, d| {
            b.iter(|| {
                // A fresh lowerer per iteration so the machine cache never hits
                let lowerer = Lowerer::new(LoweringConfig::release());
                black_box(lowerer.lower(black_box(d)).unwrap())
            });
        });
    }
    group.finish();
}

/// Batch lowering through rayon
fn bench_lower_all(c: &mut Criterion) {
    let methods: Vec<_> = (0..64).map(|i| method("Batch", i, 16)).collect();

    let mut group = c.benchmark_group("lower_all");
    group.throughput(Throughput::Elements(methods.len() as u64));
    group.bench_function("64x16", |b| {
        b.iter(|| {
            let lowerer = Lowerer::new(LoweringConfig::release());
            black_box(lowerer.lower_all(black_box(&methods)).unwrap())
        });
    });
    group.finish();
}

/// Emulating a lowered machine to completion, suspensions included
fn bench_emulate(c: &mut Criterion) {
    let machine = Lowerer::new(LoweringConfig::release())
        .lower(&method("Run", 0, 32))
        .unwrap();

    c.bench_function("emulate_32_awaits", |b| {
        b.iter(|| {
            let runtime = Runtime::new(EmulationConfig::default());
            runtime.register_machine(machine.clone());
            let task = runtime.invoke("Run", &[]).unwrap();
            black_box(runtime.wait(&task).unwrap())
        });
    });
}

criterion_group!(benches, bench_lower, bench_lower_all, bench_emulate);
criterion_main!(benches);
