//! Builder and awaiter members, and the descriptors listing which ones a type provides.

use strum::{Display, EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::{syntax::TypeRef, Error, Result};

/// Members of an async method builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Display, IntoStaticStr)]
pub enum BuilderMember {
    /// Static factory creating the builder.
    Create,
    /// Starts the machine by running `MoveNext` once.
    Start,
    /// Completes the task with a result.
    SetResult,
    /// Faults the task.
    SetException,
    /// Schedules a continuation through `INotifyCompletion.OnCompleted`.
    AwaitOnCompleted,
    /// Schedules a continuation through `ICriticalNotifyCompletion.UnsafeOnCompleted`.
    AwaitUnsafeOnCompleted,
    /// The task returned by the kickoff method.
    Task,
}

impl BuilderMember {
    /// Returns true for members the lowering cannot do without.
    #[must_use]
    pub fn is_required(self) -> bool {
        matches!(
            self,
            BuilderMember::Create
                | BuilderMember::Start
                | BuilderMember::SetResult
                | BuilderMember::SetException
                | BuilderMember::AwaitUnsafeOnCompleted
        )
    }

    /// All required members.
    pub fn required() -> impl Iterator<Item = BuilderMember> {
        BuilderMember::iter().filter(|m| m.is_required())
    }
}

/// Members of the awaiter pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Display, IntoStaticStr)]
pub enum AwaiterMember {
    /// `GetAwaiter()` on the awaitable.
    GetAwaiter,
    /// `IsCompleted` on the awaiter.
    IsCompleted,
    /// `OnCompleted(Action)` on the awaiter.
    OnCompleted,
    /// `UnsafeOnCompleted(Action)` on the awaiter; optional.
    UnsafeOnCompleted,
    /// `GetResult()` on the awaiter.
    GetResult,
}

impl AwaiterMember {
    /// Returns true for members the awaiter pattern requires.
    #[must_use]
    pub fn is_required(self) -> bool {
        !matches!(self, AwaiterMember::UnsafeOnCompleted)
    }
}

/// Describes a method builder type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderDescriptor {
    /// Builder type name.
    pub name: String,
    /// Task-like type returned by the kickoff method.
    pub task: TypeRef,
    /// Type passed to `SetResult`, `Void` for none.
    pub result: TypeRef,
    /// Members the builder provides.
    pub members: Vec<BuilderMember>,
}

impl BuilderDescriptor {
    /// A builder providing every member.
    #[must_use]
    pub fn complete(name: impl Into<String>, task: TypeRef, result: TypeRef) -> Self {
        Self {
            name: name.into(),
            task,
            result,
            members: BuilderMember::iter().collect(),
        }
    }

    /// Replaces the member list.
    #[must_use]
    pub fn with_members(mut self, members: impl IntoIterator<Item = BuilderMember>) -> Self {
        self.members = members.into_iter().collect();
        self
    }

    /// Removes a member.
    #[must_use]
    pub fn without(mut self, member: BuilderMember) -> Self {
        self.members.retain(|m| *m != member);
        self
    }

    /// Returns true if the builder provides `member`.
    #[must_use]
    pub fn has(&self, member: BuilderMember) -> bool {
        self.members.contains(&member)
    }

    /// Checks that every required member is present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingBuilderMember`] naming the first missing member.
    pub fn validate(&self) -> Result<()> {
        match BuilderMember::required().find(|m| !self.has(*m)) {
            Some(member) => Err(Error::MissingBuilderMember {
                builder: self.name.clone(),
                member: member.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Describes an awaitable type and its awaiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwaitableDescriptor {
    /// The awaited type.
    pub awaitable: TypeRef,
    /// The awaiter type returned by `GetAwaiter`.
    pub awaiter: TypeRef,
    /// The type returned by `GetResult`.
    pub result: TypeRef,
    /// Members of the pattern that are present.
    pub members: Vec<AwaiterMember>,
}

impl AwaitableDescriptor {
    /// An awaitable providing the full pattern.
    #[must_use]
    pub fn complete(awaitable: TypeRef, awaiter: TypeRef, result: TypeRef) -> Self {
        Self {
            awaitable,
            awaiter,
            result,
            members: AwaiterMember::iter().collect(),
        }
    }

    /// Removes a member.
    #[must_use]
    pub fn without(mut self, member: AwaiterMember) -> Self {
        self.members.retain(|m| *m != member);
        self
    }

    /// Returns true if `member` is present.
    #[must_use]
    pub fn has(&self, member: AwaiterMember) -> bool {
        self.members.contains(&member)
    }

    /// Checks the awaiter pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingAwaiterMember`] naming the first missing member.
    pub fn validate(&self) -> Result<()> {
        match AwaiterMember::iter().find(|m| m.is_required() && !self.has(*m)) {
            Some(member) => Err(Error::MissingAwaiterMember {
                awaitable: self.awaitable.to_string(),
                member: member.to_string(),
            }),
            None => Ok(()),
        }
    }
}
