//! Lowering integration tests.
//!
//! These tests lower small async methods through the public API and run the resulting
//! state machines on the emulator:
//! 1. State numbering and the observed state sequence
//! 2. Methods without awaits
//! 3. Determinism and caching of the lowering
//! 4. Layout decisions (representation, hoisting, field reuse)
//! 5. Rejected methods

use std::sync::Arc;

use asyncscope::{prelude::*, Error, Result};

fn yield_now() -> Stmt {
    Stmt::await_(Expr::call("Task.Yield", vec![], TypeRef::yield_awaitable()))
}

fn write(text: &str) -> Stmt {
    Stmt::Expr(Expr::call(
        "Console.Write",
        vec![Expr::string(text)],
        TypeRef::Void,
    ))
}

fn run(machine: Arc<StateMachine>, args: &[Value]) -> Result<(Runtime, Outcome)> {
    let runtime = Runtime::new(EmulationConfig::default());
    let name = machine.name.clone();
    runtime.register_machine(machine);
    let task = runtime.invoke(&name, args)?;
    let outcome = runtime.wait(&task)?;
    Ok((runtime, outcome))
}

/// Three awaits in straight-line code: `a = await; b = await; c = await; return a+b+c`.
fn sequential() -> AsyncMethodDescriptor {
    let mut m = MethodBuilder::new("Sequential", ReturnShape::TaskOf(TypeRef::Int32));
    let total = m.local("total", TypeRef::Int32);
    m.push(Stmt::declare(total, Expr::int(0)));
    for (index, step) in [1, 10, 100].into_iter().enumerate() {
        m.push(write(&format!("s{index} ")));
        m.push(yield_now());
        m.push(Stmt::assign(
            total,
            Expr::add(Expr::local(total), Expr::int(step)),
        ));
    }
    m.push(Stmt::Return(Some(Expr::local(total))));
    m.build()
}

#[test]
fn test_sequential_awaits_visit_states_in_order() -> Result<()> {
    let machine = Lowerer::new(LoweringConfig::release()).lower(&sequential())?;
    let states: Vec<u32> = machine.suspension_points.iter().map(|p| p.state).collect();
    assert_eq!(states, vec![0, 1, 2]);

    let runtime = Runtime::new(EmulationConfig::default());
    runtime.register_machine(Arc::clone(&machine));
    let instance = runtime.start("Sequential", &[])?;
    let outcome = runtime.wait(&instance.task())?;

    assert!(matches!(outcome, Outcome::Return(Value::Int(111))));
    assert_eq!(runtime.output()?, "s0 s1 s2 ");
    assert_eq!(instance.state_trace()?, vec![-1, 0, -1, 1, -1, 2, -1, -2]);
    assert_eq!(instance.state()?, -2);

    let stats = runtime.stats();
    assert_eq!(stats.suspensions, 3);
    assert_eq!(stats.move_next_calls, 4);
    Ok(())
}

#[test]
fn test_completed_awaits_do_not_suspend() -> Result<()> {
    let mut m = MethodBuilder::new("Eager", ReturnShape::TaskOf(TypeRef::Int32));
    let a = m.local("a", TypeRef::Int32);
    m.push(Stmt::declare(
        a,
        Expr::await_(Expr::call(
            "Task.FromResult",
            vec![Expr::int(20)],
            TypeRef::task_of(TypeRef::Int32),
        )),
    ));
    m.push(Stmt::await_(Expr::call(
        "Task.CompletedTask",
        vec![],
        TypeRef::Task,
    )));
    m.push(Stmt::Return(Some(Expr::add(Expr::local(a), Expr::int(22)))));
    let machine = Lowerer::new(LoweringConfig::release()).lower(&m.build())?;
    assert_eq!(machine.state_count(), 2);

    let runtime = Runtime::new(EmulationConfig::default());
    runtime.register_machine(machine);
    let instance = runtime.start("Eager", &[])?;
    assert_eq!(instance.state_trace()?, vec![-1, -2]);
    assert!(matches!(
        runtime.wait(&instance.task())?,
        Outcome::Return(Value::Int(42))
    ));
    assert_eq!(runtime.stats().suspensions, 0);
    assert!(!instance.is_boxed());
    Ok(())
}

#[test]
fn test_zero_await_method_completes_synchronously() -> Result<()> {
    let mut m = MethodBuilder::new("Sync", ReturnShape::TaskOf(TypeRef::String));
    m.push(write("ran"));
    m.push(Stmt::Return(Some(Expr::string("done"))));
    let machine = Lowerer::new(LoweringConfig::release()).lower(&m.build())?;
    assert_eq!(machine.state_count(), 0);
    assert!(!machine.il_listing().contains("switch"));

    let runtime = Runtime::new(EmulationConfig::default());
    runtime.register_machine(machine);
    let instance = runtime.start("Sync", &[])?;

    // Completed before the scheduler ever runs.
    let Value::Task(task) = instance.task() else {
        panic!("Task<string> method must return a task");
    };
    assert!(task.is_completed()?);
    assert_eq!(instance.state_trace()?, vec![-1, -2]);
    assert_eq!(runtime.output()?, "ran");
    assert_eq!(runtime.stats().move_next_calls, 1);
    assert_eq!(runtime.stats().machine_allocations, 0);
    Ok(())
}

#[test]
fn test_lowering_is_deterministic() -> Result<()> {
    let method = sequential();
    let first = Lowerer::new(LoweringConfig::release()).lower(&method)?;
    let second = Lowerer::new(LoweringConfig::release()).lower(&method)?;
    assert_eq!(first.il_listing(), second.il_listing());
    assert_eq!(first.shape(), second.shape());
    assert_eq!(first.layout, second.layout);
    Ok(())
}

#[test]
fn test_parallel_lowering_matches_sequential() -> Result<()> {
    let methods: Vec<AsyncMethodDescriptor> = (0..8)
        .map(|ordinal| {
            let mut m = MethodBuilder::new(format!("M{ordinal}"), ReturnShape::Task)
                .ordinal(ordinal);
            for _ in 0..=ordinal {
                m.push(yield_now());
            }
            m.build()
        })
        .collect();

    let parallel = Lowerer::new(LoweringConfig::release()).lower_all(&methods)?;
    let sequential = Lowerer::new(LoweringConfig::release());
    for (method, machine) in methods.iter().zip(&parallel) {
        assert_eq!(machine.il_listing(), sequential.lower(method)?.il_listing());
        assert_eq!(machine.state_count(), method.ordinal as usize + 1);
    }
    Ok(())
}

#[test]
fn test_lowerer_caches_by_type_name() -> Result<()> {
    let lowerer = Lowerer::new(LoweringConfig::release());
    let method = sequential();
    let first = lowerer.lower(&method)?;
    let again = lowerer.lower(&method)?;
    assert!(Arc::ptr_eq(&first, &again));
    assert!(lowerer.cached(&first.type_name).is_some());
    assert_eq!(lowerer.events().count_kind(EventKind::MethodLowered), 1);
    Ok(())
}

#[test]
fn test_release_machine_is_boxed_once() -> Result<()> {
    let machine = Lowerer::new(LoweringConfig::release()).lower(&sequential())?;
    assert_eq!(machine.representation, Representation::Struct);

    let (runtime, _) = run(machine, &[])?;
    // Three suspensions, a single box.
    assert_eq!(runtime.stats().machine_allocations, 1);
    Ok(())
}

#[test]
fn test_debug_machine_is_a_class_hoisting_every_local() -> Result<()> {
    let mut m = MethodBuilder::new("Debug", ReturnShape::TaskOf(TypeRef::Int32));
    let temp = m.local("temp", TypeRef::Int32);
    let kept = m.local("kept", TypeRef::Int32);
    // `temp` is dead before the await.
    m.push(Stmt::declare(temp, Expr::int(1)));
    m.push(Stmt::declare(kept, Expr::add(Expr::local(temp), Expr::int(1))));
    m.push(yield_now());
    m.push(Stmt::Return(Some(Expr::local(kept))));
    let method = m.build();

    let release = Lowerer::new(LoweringConfig::release()).lower(&method)?;
    let debug = Lowerer::new(LoweringConfig::debug()).lower(&method)?;
    assert_eq!(release.layout.count_tag("hoisted"), 1);
    assert_eq!(debug.layout.count_tag("hoisted"), 2);
    assert_eq!(debug.representation, Representation::Class);

    let (runtime, outcome) = run(debug, &[])?;
    assert!(matches!(outcome, Outcome::Return(Value::Int(2))));
    // Allocated on creation, never boxed.
    assert_eq!(runtime.stats().machine_allocations, 1);
    Ok(())
}

#[test]
fn test_field_reuse_shares_disjoint_locals() -> Result<()> {
    let mut m = MethodBuilder::new("Blocks", ReturnShape::TaskOf(TypeRef::Int32));
    let sum = m.local("sum", TypeRef::Int32);
    let a = m.local("a", TypeRef::Int32);
    let b = m.local("b", TypeRef::Int32);
    m.push(Stmt::declare(sum, Expr::int(0)));
    for (local, value) in [(a, 5), (b, 7)] {
        m.push(Stmt::Block(Block::new(vec![
            Stmt::declare(local, Expr::int(value)),
            yield_now(),
            Stmt::assign(sum, Expr::add(Expr::local(sum), Expr::local(local))),
        ])));
    }
    m.push(Stmt::Return(Some(Expr::local(sum))));
    let method = m.build();

    let shared = Lowerer::new(LoweringConfig::release()).lower(&method)?;
    let separate =
        Lowerer::new(LoweringConfig::release().with_field_reuse(false)).lower(&method)?;
    assert_eq!(
        shared.layout.count_tag("hoisted") + 1,
        separate.layout.count_tag("hoisted")
    );
    // One awaiter slot per awaiter type regardless of the flag.
    assert_eq!(shared.layout.count_tag("awaiter"), 1);
    assert_eq!(separate.layout.count_tag("awaiter"), 1);

    for machine in [shared, separate] {
        let (_, outcome) = run(machine, &[])?;
        assert!(matches!(outcome, Outcome::Return(Value::Int(12))));
    }
    Ok(())
}

#[test]
fn test_edit_and_continue_keeps_fields_distinct() -> Result<()> {
    let mut m = MethodBuilder::new("Enc", ReturnShape::Task);
    let a = m.local("a", TypeRef::String);
    let b = m.local("b", TypeRef::String);
    for local in [a, b] {
        m.push(Stmt::Block(Block::new(vec![
            Stmt::declare(local, Expr::string("x")),
            yield_now(),
            Stmt::Expr(Expr::call(
                "Console.Write",
                vec![Expr::local(local)],
                TypeRef::Void,
            )),
        ])));
    }
    let machine = Lowerer::new(LoweringConfig::release().with_edit_and_continue(true))
        .lower(&m.build())?;
    assert_eq!(machine.representation, Representation::Class);
    assert!(machine.layout.find(FieldKind::Hoisted(a)).is_some());
    assert!(machine.layout.find(FieldKind::Hoisted(b)).is_some());
    Ok(())
}

#[test]
fn test_parameters_and_receiver_are_hoisted() -> Result<()> {
    let mut m = MethodBuilder::new("Twice", ReturnShape::TaskOf(TypeRef::Int32))
        .receiver(Receiver::Reference(TypeRef::class("Calculator")));
    let n = m.param("n", TypeRef::Int32);
    m.push(yield_now());
    m.push(Stmt::Expr(Expr::call(
        "Console.Write",
        vec![Expr::This],
        TypeRef::Void,
    )));
    m.push(Stmt::Return(Some(Expr::binary(
        BinaryOp::Mul,
        Expr::Param(n),
        Expr::int(2),
    ))));
    let machine = Lowerer::new(LoweringConfig::release()).lower(&m.build())?;
    assert_eq!(machine.layout.count_tag("parameter"), 1);
    assert_eq!(machine.layout.count_tag("this"), 1);

    let runtime = Runtime::new(EmulationConfig::default());
    runtime.register_machine(machine);
    assert!(matches!(
        runtime.invoke("Twice", &[Value::Int(21)]),
        Err(Error::InvalidProgram(_))
    ));
    let task = runtime.invoke("Twice", &[Value::string("calc"), Value::Int(21)])?;
    assert!(matches!(runtime.wait(&task)?, Outcome::Return(Value::Int(42))));
    assert_eq!(runtime.output()?, "calc");
    Ok(())
}

#[test]
fn test_state_limit() {
    let mut m = MethodBuilder::new("Many", ReturnShape::Task);
    for _ in 0..3 {
        m.push(yield_now());
    }
    let result = Lowerer::new(LoweringConfig::release().with_max_states(2)).lower(&m.build());
    assert!(matches!(result, Err(Error::StateLimit(2))));
}

#[test]
fn test_unknown_awaitable_is_rejected() {
    let mut m = MethodBuilder::new("Bad", ReturnShape::Task);
    m.push(Stmt::await_(Expr::int(1)));
    let result = Lowerer::new(LoweringConfig::release()).lower(&m.build());
    assert!(matches!(result, Err(Error::UnknownAwaitable(_))));
}

#[test]
fn test_async_methods_call_each_other() -> Result<()> {
    let mut inner = MethodBuilder::new("Inner", ReturnShape::TaskOf(TypeRef::Int32));
    let v = inner.param("v", TypeRef::Int32);
    inner.push(yield_now());
    inner.push(Stmt::Return(Some(Expr::add(Expr::Param(v), Expr::int(1)))));

    let mut outer = MethodBuilder::new("Outer", ReturnShape::TaskOf(TypeRef::Int32));
    let r = outer.local("r", TypeRef::Int32);
    outer.push(Stmt::declare(
        r,
        Expr::await_(Expr::call(
            "Inner",
            vec![Expr::int(1)],
            TypeRef::task_of(TypeRef::Int32),
        )),
    ));
    outer.push(Stmt::Return(Some(Expr::await_(Expr::call(
        "Inner",
        vec![Expr::local(r)],
        TypeRef::task_of(TypeRef::Int32),
    )))));

    let lowerer = Lowerer::new(LoweringConfig::release());
    let machines = lowerer.lower_all(&[inner.build(), outer.build()])?;
    let runtime = Runtime::new(EmulationConfig::default());
    for machine in machines {
        runtime.register_machine(machine);
    }
    let task = runtime.invoke("Outer", &[])?;
    assert!(matches!(runtime.wait(&task)?, Outcome::Return(Value::Int(3))));
    Ok(())
}
