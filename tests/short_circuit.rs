//! Evaluation order of expressions containing awaits.
//!
//! Awaits nested in expressions are hoisted to statement level by the lowering. These
//! tests check that operands keep their left-to-right order and that short-circuit
//! operators still skip the awaits they would have skipped.

use std::sync::Arc;

use asyncscope::{prelude::*, Result};

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

/// `async Task<int> Get(int v) { await Task.Yield(); Console.Write(v, " "); return v; }`
fn get() -> AsyncMethodDescriptor {
    let mut m = MethodBuilder::new("Get", ReturnShape::TaskOf(TypeRef::Int32));
    let v = m.param("v", TypeRef::Int32);
    m.push(yield_now());
    m.push(Stmt::Expr(Expr::call(
        "Console.Write",
        vec![Expr::Param(v), Expr::string(" ")],
        TypeRef::Void,
    )));
    m.push(Stmt::Return(Some(Expr::Param(v))));
    m.build()
}

/// `async Task<bool> Flag(int v) { await Task.Yield(); Console.Write("flag "); return v != 0; }`
fn flag() -> AsyncMethodDescriptor {
    let mut m = MethodBuilder::new("Flag", ReturnShape::TaskOf(TypeRef::Bool));
    let v = m.param("v", TypeRef::Int32);
    m.push(yield_now());
    m.push(write("flag "));
    m.push(Stmt::Return(Some(Expr::binary(
        BinaryOp::Ne,
        Expr::Param(v),
        Expr::int(0),
    ))));
    m.build()
}

fn await_get(v: i32) -> Expr {
    Expr::await_(Expr::call(
        "Get",
        vec![Expr::int(v)],
        TypeRef::task_of(TypeRef::Int32),
    ))
}

fn await_flag(v: i32) -> Expr {
    Expr::await_(Expr::call(
        "Flag",
        vec![Expr::int(v)],
        TypeRef::task_of(TypeRef::Bool),
    ))
}

fn if_else(cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt>) -> Stmt {
    Stmt::If {
        cond,
        then: Block::new(then),
        otherwise: Some(Block::new(otherwise)),
    }
}

fn run(method: AsyncMethodDescriptor) -> Result<(Outcome, String, Arc<StateMachine>)> {
    let lowerer = Lowerer::new(LoweringConfig::release());
    let runtime = Runtime::new(EmulationConfig::default());
    for machine in lowerer.lower_all(&[get(), flag()])? {
        runtime.register_machine(machine);
    }
    let machine = lowerer.lower(&method)?;
    runtime.register_machine(Arc::clone(&machine));
    let task = runtime.invoke(&method.name, &[])?;
    let outcome = runtime.wait(&task)?;
    Ok((outcome, runtime.output()?, machine))
}

#[test]
fn test_operands_are_evaluated_left_to_right() -> Result<()> {
    let mut m = MethodBuilder::new("Arith", ReturnShape::TaskOf(TypeRef::Int32));
    m.push(Stmt::Return(Some(Expr::add(
        await_get(1),
        Expr::binary(BinaryOp::Mul, await_get(2), await_get(3)),
    ))));
    let (outcome, output, machine) = run(m.build())?;

    assert!(matches!(outcome, Outcome::Return(Value::Int(7))));
    assert_eq!(output, "1 2 3 ");
    assert_eq!(machine.state_count(), 3);
    Ok(())
}

#[test]
fn test_and_also_skips_awaited_right_operand() -> Result<()> {
    let mut m = MethodBuilder::new("And", ReturnShape::Task);
    let f = m.local("f", TypeRef::Bool);
    m.push(Stmt::declare(f, Expr::Bool(false)));
    m.push(if_else(
        Expr::and_also(Expr::local(f), await_flag(1)),
        vec![write("yes")],
        vec![write("no")],
    ));
    m.push(Stmt::assign(f, Expr::Bool(true)));
    m.push(if_else(
        Expr::and_also(Expr::local(f), await_flag(1)),
        vec![write("yes")],
        vec![write("no")],
    ));
    let (_, output, _) = run(m.build())?;
    assert_eq!(output, "noflag yes");
    Ok(())
}

#[test]
fn test_or_else_skips_awaited_right_operand() -> Result<()> {
    let mut m = MethodBuilder::new("Or", ReturnShape::TaskOf(TypeRef::Bool));
    let t = m.local("t", TypeRef::Bool);
    m.push(Stmt::declare(t, Expr::Bool(true)));
    m.push(Stmt::Return(Some(Expr::or_else(
        Expr::local(t),
        await_flag(0),
    ))));
    let (outcome, output, _) = run(m.build())?;
    assert!(matches!(outcome, Outcome::Return(Value::Int(1))));
    assert_eq!(output, "");
    Ok(())
}

#[test]
fn test_conditional_awaits_only_the_taken_branch() -> Result<()> {
    let mut m = MethodBuilder::new("Pick", ReturnShape::TaskOf(TypeRef::Int32));
    let c = m.local("c", TypeRef::Bool);
    m.push(Stmt::declare(c, Expr::Bool(false)));
    m.push(Stmt::Return(Some(Expr::conditional(
        Expr::local(c),
        await_get(10),
        await_get(20),
    ))));
    let (outcome, output, machine) = run(m.build())?;
    assert!(matches!(outcome, Outcome::Return(Value::Int(20))));
    assert_eq!(output, "20 ");
    assert_eq!(machine.state_count(), 2);
    Ok(())
}

#[test]
fn test_call_arguments_before_an_await_are_spilled() -> Result<()> {
    let mut m = MethodBuilder::new("Concat", ReturnShape::Task);
    let n = m.local("n", TypeRef::Int32);
    m.push(Stmt::declare(n, Expr::int(4)));
    // `n * 10` is computed before the await, so it goes to a temporary.
    m.push(Stmt::Expr(Expr::call(
        "Console.Write",
        vec![
            Expr::binary(BinaryOp::Mul, Expr::local(n), Expr::int(10)),
            Expr::await_(Expr::call(
                "Get",
                vec![Expr::int(5)],
                TypeRef::task_of(TypeRef::Int32),
            )),
            Expr::string(";"),
        ],
        TypeRef::Void,
    )));
    let method = m.build();

    let lowerer = Lowerer::new(LoweringConfig::release());
    let machine = lowerer.lower(&method)?;
    assert_eq!(lowerer.events().count_kind(EventKind::AwaitSpilled), 1);
    assert_eq!(machine.state_count(), 1);

    let (_, output, _) = run(method)?;
    assert_eq!(output, "5 405;");
    Ok(())
}

#[test]
fn test_stable_operands_are_not_spilled() -> Result<()> {
    let mut m = MethodBuilder::new("Plain", ReturnShape::Task);
    let n = m.local("n", TypeRef::Int32);
    m.push(Stmt::declare(n, Expr::int(4)));
    m.push(Stmt::Expr(Expr::call(
        "Console.Write",
        vec![Expr::local(n), await_get(5)],
        TypeRef::Void,
    )));
    let method = m.build();

    let lowerer = Lowerer::new(LoweringConfig::release());
    lowerer.lower(&method)?;
    assert!(!lowerer.events().has(EventKind::AwaitSpilled));

    let (_, output, _) = run(method)?;
    assert_eq!(output, "5 45");
    Ok(())
}

#[test]
fn test_string_concatenation_across_await() -> Result<()> {
    let mut m = MethodBuilder::new("Text", ReturnShape::TaskOf(TypeRef::String));
    let prefix = m.local("prefix", TypeRef::String);
    m.push(Stmt::declare(prefix, Expr::string("n=")));
    m.push(Stmt::Return(Some(Expr::add(
        Expr::local(prefix),
        Expr::call(
            "Object.ToString",
            vec![await_get(9)],
            TypeRef::String,
        ),
    ))));
    let (outcome, _, _) = run(m.build())?;
    match outcome {
        Outcome::Return(Value::Str(text)) => assert_eq!(&*text, "n=9"),
        other => panic!("unexpected outcome {other:?}"),
    }
    Ok(())
}

#[test]
fn test_await_in_loop_condition() -> Result<()> {
    let mut m = MethodBuilder::new("Countdown", ReturnShape::TaskOf(TypeRef::Int32));
    let i = m.local("i", TypeRef::Int32);
    m.push(Stmt::declare(i, Expr::int(3)));
    m.push(Stmt::while_loop(
        Expr::binary(
            BinaryOp::Gt,
            Expr::await_(Expr::call(
                "Get",
                vec![Expr::local(i)],
                TypeRef::task_of(TypeRef::Int32),
            )),
            Expr::int(0),
        ),
        vec![Stmt::assign(
            i,
            Expr::binary(BinaryOp::Sub, Expr::local(i), Expr::int(1)),
        )],
    ));
    m.push(Stmt::Return(Some(Expr::local(i))));
    let (outcome, output, _) = run(m.build())?;
    assert!(matches!(outcome, Outcome::Return(Value::Int(0))));
    assert_eq!(output, "3 2 1 0 ");
    Ok(())
}
