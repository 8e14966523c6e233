//! Tasks and continuations.

use std::{fmt, sync::Mutex};

use crate::{
    emulation::{
        runtime::{MachineRef, Runtime},
        value::{ExceptionRef, Outcome, Value},
    },
    Result,
};

/// Work scheduled on the runtime queue.
pub enum Continuation {
    /// Resume a suspended state machine by calling its `MoveNext`.
    Resume(MachineRef),
    /// Run a host callback.
    Callback(Box<dyn FnOnce(&Runtime) -> Result<()> + Send>),
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Resume(machine) => write!(f, "Resume({})", machine.type_name()),
            Continuation::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Completion state of a task.
#[derive(Debug, Clone)]
pub enum TaskStatus {
    /// Not completed yet.
    Pending,
    /// Completed with a result ([`Value::Null`] for `Task`).
    Completed(Value),
    /// Completed with an exception.
    Faulted(ExceptionRef),
}

/// A task: a completion cell with continuations.
///
/// Continuations registered before completion are queued on the runtime when the task
/// completes; those registered afterwards are queued immediately. They never run inline.
pub struct TaskObject {
    id: u64,
    status: Mutex<TaskStatus>,
    continuations: Mutex<Vec<Continuation>>,
}

impl fmt::Debug for TaskObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskObject").field("id", &self.id).finish_non_exhaustive()
    }
}

impl TaskObject {
    pub(crate) fn new(id: u64, status: TaskStatus) -> Self {
        Self {
            id,
            status: Mutex::new(status),
            continuations: Mutex::new(Vec::new()),
        }
    }

    /// Identifier unique within the runtime that created the task.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the completion state.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if the status lock is poisoned.
    pub fn status(&self) -> Result<TaskStatus> {
        Ok(self.status.lock()?.clone())
    }

    /// Returns true once the task completed or faulted.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if the status lock is poisoned.
    pub fn is_completed(&self) -> Result<bool> {
        Ok(!matches!(*self.status.lock()?, TaskStatus::Pending))
    }

    /// The outcome of a completed task, `None` while pending.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if the status lock is poisoned.
    pub fn outcome(&self) -> Result<Option<Outcome>> {
        Ok(match &*self.status.lock()? {
            TaskStatus::Pending => None,
            TaskStatus::Completed(value) => Some(Outcome::Return(value.clone())),
            TaskStatus::Faulted(ex) => Some(Outcome::Throw(Value::Exception(ex.clone()))),
        })
    }

    /// Completes the task with `value`. Returns false if it already completed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if a lock is poisoned.
    pub fn complete(&self, runtime: &Runtime, value: Value) -> Result<bool> {
        self.transition(runtime, TaskStatus::Completed(value))
    }

    /// Faults the task with `exception`. Returns false if it already completed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if a lock is poisoned.
    pub fn fault(&self, runtime: &Runtime, exception: ExceptionRef) -> Result<bool> {
        self.transition(runtime, TaskStatus::Faulted(exception))
    }

    fn transition(&self, runtime: &Runtime, status: TaskStatus) -> Result<bool> {
        {
            let mut current = self.status.lock()?;
            if !matches!(*current, TaskStatus::Pending) {
                return Ok(false);
            }
            *current = status;
        }
        let continuations = std::mem::take(&mut *self.continuations.lock()?);
        for continuation in continuations {
            runtime.schedule(continuation)?;
        }
        Ok(true)
    }

    /// Registers `continuation` to run once the task completes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LockError`] if a lock is poisoned.
    pub fn on_completed(&self, runtime: &Runtime, continuation: Continuation) -> Result<()> {
        let status = self.status.lock()?;
        if matches!(*status, TaskStatus::Pending) {
            self.continuations.lock()?.push(continuation);
            return Ok(());
        }
        drop(status);
        runtime.schedule(continuation)
    }
}
