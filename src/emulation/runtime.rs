//! The emulated async runtime: host functions, builders, machine instances and a
//! deterministic single-threaded scheduler with a virtual clock.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use dashmap::DashMap;

use crate::{
    assembly::FieldId,
    capabilities::{BuilderDescriptor, TASK_BUILDER, VOID_BUILDER},
    compiler::{FieldKind, Representation, StateMachine},
    config::EmulationConfig,
    emulation::{
        capability::{
            BuilderCapability, BuilderFactory, TaskMethodBuilder, VoidMethodBuilder,
            YieldAwaitable,
        },
        exception::{ExceptionObject, TypeHierarchy},
        interpreter::Interpreter,
        task::{Continuation, TaskObject, TaskStatus},
        value::{ExceptionRef, Outcome, TaskRef, Value},
    },
    syntax::{Receiver, TypeRef},
    Error, Result,
};

/// Shared reference to a running machine.
pub type MachineRef = Arc<MachineInstance>;

/// A host function callable from emulated code through `call`.
pub type HostFunction = Arc<dyn Fn(&Runtime, &[Value]) -> Result<Outcome> + Send + Sync>;

/// One invocation of a lowered async method.
pub struct MachineInstance {
    definition: Arc<StateMachine>,
    builder: Arc<dyn BuilderCapability>,
    fields: Mutex<Vec<Value>>,
    boxed: AtomicBool,
    state_trace: Mutex<Vec<i32>>,
}

impl fmt::Debug for MachineInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineInstance")
            .field("type_name", &self.definition.type_name)
            .finish_non_exhaustive()
    }
}

impl MachineInstance {
    fn new(
        definition: Arc<StateMachine>,
        builder: Arc<dyn BuilderCapability>,
        args: &[Value],
    ) -> Result<Self> {
        let has_receiver = !matches!(definition.receiver, Receiver::None);
        let expected = definition.parameters.len() + usize::from(has_receiver);
        if args.len() != expected {
            return Err(Error::InvalidProgram(format!(
                "{} expects {expected} arguments, got {}",
                definition.name,
                args.len()
            )));
        }
        let offset = usize::from(has_receiver);

        let fields = definition
            .layout
            .fields
            .iter()
            .map(|field| match field.kind {
                FieldKind::State => Value::Int(-1),
                FieldKind::This => args[0].clone(),
                FieldKind::Parameter(index) => args[offset + usize::from(index)].clone(),
                _ => Value::default_for(&field.ty),
            })
            .collect();

        Ok(Self {
            definition,
            builder,
            fields: Mutex::new(fields),
            boxed: AtomicBool::new(false),
            state_trace: Mutex::new(vec![-1]),
        })
    }

    /// Name of the machine type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.definition.type_name
    }

    /// The lowered method this instance runs.
    #[must_use]
    pub fn definition(&self) -> &Arc<StateMachine> {
        &self.definition
    }

    /// The builder of this invocation.
    #[must_use]
    pub fn builder(&self) -> &Arc<dyn BuilderCapability> {
        &self.builder
    }

    /// The value returned to the caller: the builder's task.
    #[must_use]
    pub fn task(&self) -> Value {
        self.builder.task()
    }

    /// Current value of the state field.
    ///
    /// # Errors
    ///
    /// Returns an error if the field lock is poisoned or the state is not an integer.
    pub fn state(&self) -> Result<i32> {
        self.field(self.definition.layout.state())?.as_int()
    }

    /// Every value stored into the state field, starting with the initial `-1`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the trace lock is poisoned.
    pub fn state_trace(&self) -> Result<Vec<i32>> {
        Ok(self.state_trace.lock()?.clone())
    }

    /// Returns true once a value-type machine has been boxed by its first suspension.
    #[must_use]
    pub fn is_boxed(&self) -> bool {
        self.boxed.load(Ordering::SeqCst)
    }

    /// Reads a field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProgram`] for an unknown field.
    pub fn field(&self, id: FieldId) -> Result<Value> {
        self.fields
            .lock()?
            .get(id.index())
            .cloned()
            .ok_or_else(|| {
                Error::InvalidProgram(format!("no field {} in {}", id.0, self.type_name()))
            })
    }

    pub(crate) fn set_field(&self, id: FieldId, value: Value) -> Result<()> {
        if id == self.definition.layout.state() {
            self.state_trace.lock()?.push(value.as_int()?);
        }
        let mut fields = self.fields.lock()?;
        let slot = fields
            .get_mut(id.index())
            .ok_or_else(|| {
                Error::InvalidProgram(format!(
                    "no field {} in {}",
                    id.0, self.definition.type_name
                ))
            })?;
        *slot = value;
        Ok(())
    }

    pub(crate) fn clear_field(&self, id: FieldId) -> Result<()> {
        let ty = self
            .definition
            .layout
            .get(id)
            .map_or(TypeRef::Object, |field| field.ty.clone());
        self.set_field(id, Value::default_for(&ty))
    }

    /// Marks the machine boxed; returns true the first time.
    fn box_once(&self) -> bool {
        !self.boxed.swap(true, Ordering::SeqCst)
    }
}

/// Counters collected while running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// `MoveNext` invocations, including the initial `Start`.
    pub move_next_calls: u64,
    /// Suspensions handed to a builder.
    pub suspensions: u64,
    /// Machine allocations: reference-type machines when created, value-type machines when
    /// first boxed.
    pub machine_allocations: u64,
    /// Instructions executed.
    pub instructions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    move_next_calls: AtomicU64,
    suspensions: AtomicU64,
    machine_allocations: AtomicU64,
    instructions: AtomicU64,
}

struct Timer {
    due: u64,
    sequence: u64,
    task: TaskRef,
}

/// The emulated runtime.
///
/// Lowered machines, builders and host functions are registered up front; invoking a
/// method runs it synchronously up to its first suspension, and [`Runtime::run_until_idle`]
/// drains the work queue, advancing the virtual clock to the next timer whenever the queue
/// is empty.
///
/// # Example
///
/// ```rust
/// use asyncscope::prelude::*;
///
/// let mut m = MethodBuilder::new("Main", ReturnShape::Task);
/// m.push(Stmt::await_(Expr::call("Task.Delay", vec![Expr::int(10)], TypeRef::Task)));
/// m.push(Stmt::Expr(Expr::call(
///     "Console.WriteLine",
///     vec![Expr::string("done")],
///     TypeRef::Void,
/// )));
///
/// let machine = Lowerer::new(LoweringConfig::release()).lower(&m.build())?;
/// let runtime = Runtime::new(EmulationConfig::default());
/// runtime.register_machine(machine);
/// let task = runtime.invoke("Main", &[])?;
/// assert!(runtime.wait(&task)?.value().is_some());
/// assert_eq!(runtime.output()?, "done\n");
/// assert_eq!(runtime.now(), 10);
/// # Ok::<(), asyncscope::Error>(())
/// ```
pub struct Runtime {
    config: EmulationConfig,
    hierarchy: RwLock<TypeHierarchy>,
    methods: DashMap<String, Arc<StateMachine>>,
    builders: DashMap<String, Arc<dyn BuilderFactory>>,
    hosts: DashMap<String, HostFunction>,
    queue: Mutex<VecDeque<Continuation>>,
    timers: Mutex<Vec<Timer>>,
    clock: AtomicU64,
    next_id: AtomicU64,
    output: Mutex<String>,
    unhandled: Mutex<Vec<ExceptionRef>>,
    counters: Counters,
}

impl Runtime {
    /// Creates a runtime with the framework builders and host functions.
    #[must_use]
    pub fn new(config: EmulationConfig) -> Self {
        let runtime = Self {
            config,
            hierarchy: RwLock::new(TypeHierarchy::new()),
            methods: DashMap::new(),
            builders: DashMap::new(),
            hosts: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            timers: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            output: Mutex::new(String::new()),
            unhandled: Mutex::new(Vec::new()),
            counters: Counters::default(),
        };
        runtime.install_host_functions();
        runtime
    }

    /// The emulation limits.
    #[must_use]
    pub fn config(&self) -> &EmulationConfig {
        &self.config
    }

    // ── Registration ────────────────────────────────────────────────

    /// Makes a lowered method callable by its source name.
    pub fn register_machine(&self, machine: Arc<StateMachine>) {
        self.methods.insert(machine.name.clone(), machine);
    }

    /// Installs a builder for the builder type `name`, taking precedence over the
    /// framework builders.
    pub fn register_builder(
        &self,
        name: impl Into<String>,
        factory: impl BuilderFactory + 'static,
    ) {
        self.builders.insert(name.into(), Arc::new(factory));
    }

    /// Installs or replaces a host function.
    pub fn register_host<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&Runtime, &[Value]) -> Result<Outcome> + Send + Sync + 'static,
    {
        self.hosts.insert(name.into(), Arc::new(function));
    }

    /// Declares an exception class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the hierarchy lock is poisoned.
    pub fn register_exception(&self, class: &str, parent: &str) -> Result<()> {
        self.hierarchy.write()?.register(class, parent);
        Ok(())
    }

    // ── Invocation ──────────────────────────────────────────────────

    /// Invokes a lowered method and returns its task (`null` for async void).
    ///
    /// `args` starts with the receiver for instance methods.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown methods, wrong arity, unknown builders, and any
    /// emulator error raised while running to the first suspension.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Value> {
        Ok(self.start(name, args)?.task())
    }

    /// Invokes a lowered method and returns the running instance.
    ///
    /// # Errors
    ///
    /// See [`Runtime::invoke`].
    pub fn start(&self, name: &str, args: &[Value]) -> Result<MachineRef> {
        let definition = self
            .methods
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::InvalidProgram(format!("unknown async method {name}")))?;
        let builder = self.create_builder(&definition.builder)?;
        let representation = definition.representation;
        let machine = Arc::new(MachineInstance::new(definition, builder, args)?);
        if representation == Representation::Class {
            self.counters.machine_allocations.fetch_add(1, Ordering::SeqCst);
        }
        let builder = Arc::clone(machine.builder());
        builder.start(self, &machine)?;
        Ok(machine)
    }

    /// Calls a host function or a lowered method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProgram`] for unknown functions; other errors come from the
    /// callee.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Outcome> {
        let host = self.hosts.get(name).map(|entry| Arc::clone(entry.value()));
        if let Some(host) = host {
            return host(self, args);
        }
        if self.methods.contains_key(name) {
            return Ok(Outcome::Return(self.invoke(name, args)?));
        }
        Err(Error::InvalidProgram(format!("unknown function {name}")))
    }

    /// Runs one `MoveNext` of `machine`.
    ///
    /// # Errors
    ///
    /// Returns emulator errors; user exceptions never escape a well-formed `MoveNext`.
    pub fn move_next(&self, machine: &MachineRef) -> Result<()> {
        self.counters.move_next_calls.fetch_add(1, Ordering::SeqCst);
        Interpreter::new(self, machine).run()
    }

    fn create_builder(&self, descriptor: &BuilderDescriptor) -> Result<Arc<dyn BuilderCapability>> {
        let factory = self
            .builders
            .get(&descriptor.name)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(factory) = factory {
            return Ok(factory.create(self));
        }
        if descriptor.name == VOID_BUILDER {
            return Ok(Arc::new(VoidMethodBuilder));
        }
        if descriptor.name.starts_with(TASK_BUILDER) {
            return Ok(Arc::new(TaskMethodBuilder::new(self)));
        }
        Err(Error::UnknownBuilder(descriptor.name.clone()))
    }

    pub(crate) fn note_suspension(&self, machine: &MachineInstance) {
        self.counters.suspensions.fetch_add(1, Ordering::SeqCst);
        if machine.definition.representation == Representation::Struct && machine.box_once() {
            self.counters.machine_allocations.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn note_instructions(&self, count: u64) {
        self.counters.instructions.fetch_add(count, Ordering::SeqCst);
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Appends `continuation` to the work queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the queue lock is poisoned.
    pub fn schedule(&self, continuation: Continuation) -> Result<()> {
        self.queue.lock()?.push_back(continuation);
        Ok(())
    }

    /// Runs queued work and due timers until nothing is left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionLimit`] after `max_scheduler_steps` work items, or the
    /// first error raised by a continuation.
    pub fn run_until_idle(&self) -> Result<()> {
        let mut steps = 0u64;
        loop {
            let next = self.queue.lock()?.pop_front();
            match next {
                Some(continuation) => {
                    steps += 1;
                    if steps > self.config.max_scheduler_steps {
                        return Err(Error::ExecutionLimit(self.config.max_scheduler_steps));
                    }
                    match continuation {
                        Continuation::Resume(machine) => self.move_next(&machine)?,
                        Continuation::Callback(callback) => callback(self)?,
                    }
                }
                None => {
                    if !self.fire_next_timer()? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Drives the runtime until idle and returns how `task` completed.
    ///
    /// `null` (the result of an async void method) counts as a completed void result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProgram`] if the task is still pending once the runtime is
    /// idle, and [`Error::TypeMismatch`] if `task` is not a task.
    pub fn wait(&self, task: &Value) -> Result<Outcome> {
        self.run_until_idle()?;
        match task {
            Value::Task(task) => task
                .outcome()?
                .ok_or_else(|| {
                    Error::InvalidProgram(format!("task {} never completed", task.id()))
                }),
            Value::Null => Ok(Outcome::Return(Value::Null)),
            other => Err(Error::TypeMismatch(format!(
                "wait expects a task, found {}",
                other.kind()
            ))),
        }
    }

    fn fire_next_timer(&self) -> Result<bool> {
        let timer = {
            let mut timers = self.timers.lock()?;
            let next = timers
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| (t.due, t.sequence))
                .map(|(index, _)| index);
            match next {
                Some(index) => timers.swap_remove(index),
                None => return Ok(false),
            }
        };
        self.clock.fetch_max(timer.due, Ordering::SeqCst);
        timer.task.complete(self, Value::Null)?;
        Ok(true)
    }

    /// Virtual time in milliseconds.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    fn task_with(&self, status: TaskStatus) -> TaskRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Arc::new(TaskObject::new(id, status))
    }

    /// A new pending task.
    #[must_use]
    pub fn pending_task(&self) -> TaskRef {
        self.task_with(TaskStatus::Pending)
    }

    /// A task already completed with `value`.
    #[must_use]
    pub fn completed_task(&self, value: Value) -> TaskRef {
        self.task_with(TaskStatus::Completed(value))
    }

    /// A task already faulted with `exception`.
    #[must_use]
    pub fn faulted_task(&self, exception: ExceptionRef) -> TaskRef {
        self.task_with(TaskStatus::Faulted(exception))
    }

    /// A task completing `milliseconds` from now on the virtual clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the timer lock is poisoned.
    pub fn delay(&self, milliseconds: i32) -> Result<TaskRef> {
        if milliseconds <= 0 {
            return Ok(self.completed_task(Value::Null));
        }
        let task = self.pending_task();
        let sequence = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.timers.lock()?.push(Timer {
            due: self.now() + milliseconds.unsigned_abs() as u64,
            sequence,
            task: Arc::clone(&task),
        });
        Ok(task)
    }

    // ── Observations ────────────────────────────────────────────────

    /// Everything written through `Console.Write` and `Console.WriteLine`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the output lock is poisoned.
    pub fn output(&self) -> Result<String> {
        Ok(self.output.lock()?.clone())
    }

    /// Appends text to the captured console output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the output lock is poisoned.
    pub fn write_output(&self, text: &str) -> Result<()> {
        self.output.lock()?.push_str(text);
        Ok(())
    }

    /// Exceptions raised by async void methods.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn unhandled(&self) -> Result<Vec<ExceptionRef>> {
        Ok(self.unhandled.lock()?.clone())
    }

    pub(crate) fn report_unhandled(&self, exception: ExceptionRef) -> Result<()> {
        self.unhandled.lock()?.push(exception);
        Ok(())
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            move_next_calls: self.counters.move_next_calls.load(Ordering::SeqCst),
            suspensions: self.counters.suspensions.load(Ordering::SeqCst),
            machine_allocations: self.counters.machine_allocations.load(Ordering::SeqCst),
            instructions: self.counters.instructions.load(Ordering::SeqCst),
        }
    }

    /// `isinst` semantics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the hierarchy lock is poisoned.
    pub fn is_instance(&self, value: &Value, ty: &TypeRef) -> Result<bool> {
        Ok(match (value, ty) {
            (Value::Null, _) => false,
            (_, TypeRef::Object) => true,
            (Value::Int(_), TypeRef::Int32 | TypeRef::Bool) => true,
            (Value::Str(_), TypeRef::String) => true,
            (Value::Exception(ex), TypeRef::Class(name)) => {
                self.hierarchy.read()?.is_subclass(&ex.class, name)
            }
            (Value::Task(_), TypeRef::Task | TypeRef::TaskOf(_)) => true,
            (Value::Awaitable(_), TypeRef::Named(_)) => true,
            (Value::Awaiter(_), TypeRef::Awaiter(_)) => true,
            _ => false,
        })
    }

    /// Creates an exception value of `class`.
    #[must_use]
    pub fn exception(&self, class: &str, message: impl Into<String>) -> Value {
        Value::Exception(Arc::new(ExceptionObject::new(class, message)))
    }

    // ── Host functions ──────────────────────────────────────────────

    fn install_host_functions(&self) {
        self.register_host("Console.WriteLine", |rt, args| {
            let line = args.iter().map(ToString::to_string).collect::<String>();
            rt.write_output(&line)?;
            rt.write_output("\n")?;
            Ok(Outcome::Return(Value::Null))
        });
        self.register_host("Console.Write", |rt, args| {
            let text = args.iter().map(ToString::to_string).collect::<String>();
            rt.write_output(&text)?;
            Ok(Outcome::Return(Value::Null))
        });
        self.register_host("Task.Yield", |_, _| {
            Ok(Outcome::Return(Value::Awaitable(Arc::new(YieldAwaitable))))
        });
        self.register_host("Task.Delay", |rt, args| {
            let milliseconds = arg(args, 0, "Task.Delay")?.as_int()?;
            Ok(Outcome::Return(Value::Task(rt.delay(milliseconds)?)))
        });
        self.register_host("Task.FromResult", |rt, args| {
            let value = arg(args, 0, "Task.FromResult")?.clone();
            Ok(Outcome::Return(Value::Task(rt.completed_task(value))))
        });
        self.register_host("Task.CompletedTask", |rt, _| {
            Ok(Outcome::Return(Value::Task(rt.completed_task(Value::Null))))
        });
        self.register_host("Task.FromException", |rt, args| {
            match arg(args, 0, "Task.FromException")? {
                Value::Exception(ex) => Ok(Outcome::Return(Value::Task(
                    rt.faulted_task(Arc::clone(ex)),
                ))),
                other => Err(Error::TypeMismatch(format!(
                    "Task.FromException expects an exception, found {}",
                    other.kind()
                ))),
            }
        });
        self.register_host("Exception.New", |rt, args| {
            let class = arg(args, 0, "Exception.New")?.to_string();
            let message = arg(args, 1, "Exception.New")?.to_string();
            Ok(Outcome::Return(rt.exception(&class, message)))
        });
        self.register_host("Exception.Message", |_, args| {
            match arg(args, 0, "Exception.Message")? {
                Value::Exception(ex) => Ok(Outcome::Return(Value::string(&ex.message))),
                other => Err(Error::TypeMismatch(format!(
                    "Exception.Message expects an exception, found {}",
                    other.kind()
                ))),
            }
        });
        self.register_host("Object.ToString", |_, args| {
            let value = arg(args, 0, "Object.ToString")?;
            Ok(Outcome::Return(Value::string(value.to_string())))
        });
        self.register_host("string.Concat", |_, args| {
            let text = args.iter().map(ToString::to_string).collect::<String>();
            Ok(Outcome::Return(Value::string(text)))
        });
    }
}

fn arg<'v>(args: &'v [Value], index: usize, function: &str) -> Result<&'v Value> {
    args.get(index).ok_or_else(|| {
        Error::InvalidProgram(format!("{function} expects at least {} arguments", index + 1))
    })
}
