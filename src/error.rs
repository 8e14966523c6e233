use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! region_error {
    ($msg:expr) => {
        crate::Error::MalformedRegion {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::MalformedRegion {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into two groups: compile-time failures raised while lowering an async method
/// (missing builder members, invalid await placement, malformed exception regions) and
/// emulation failures raised when an emitted `MoveNext` body turns out to be invalid IL.
///
/// Exceptions thrown by the *emulated* program are not errors. They are runtime values that
/// travel through the exception-clause table and end up in the faulted task of the method.
///
/// # Error Categories
///
/// ## Capability Errors
/// - [`Error::MissingBuilderMember`] - Builder type lacks a required member
/// - [`Error::MissingAwaiterMember`] - Awaitable type does not follow the awaiter pattern
/// - [`Error::UnknownBuilder`] - No builder registered under the requested name
/// - [`Error::UnknownAwaitable`] - Awaited type is not awaitable
///
/// ## Lowering Errors
/// - [`Error::Malformed`] - Invalid source model (undefined label, stray `break`, ...)
/// - [`Error::MalformedRegion`] - Exception regions do not nest properly
/// - [`Error::AwaitInFilter`] - `await` inside an exception filter
/// - [`Error::AwaitOutsideAsync`] - `await` where no suspension point can be placed
/// - [`Error::StateLimit`] - Too many suspension points
///
/// ## Emulation Errors
/// - [`Error::TypeMismatch`] - Operand of an unexpected kind on the evaluation stack
/// - [`Error::StackUnderflow`] - Pop from an empty evaluation stack
/// - [`Error::InvalidProgram`] - Structurally invalid instruction stream
/// - [`Error::ExecutionLimit`] - Instruction or scheduler budget exhausted
/// - [`Error::LockError`] - Thread synchronization failure
///
/// # Examples
///
/// ```rust
/// use asyncscope::prelude::*;
///
/// let method = MethodBuilder::new("Run", ReturnShape::TaskLike {
///     task: TypeRef::named("MyTask"),
///     builder: "MissingBuilder".to_string(),
///     result: TypeRef::Void,
/// })
/// .build();
///
/// match Lowerer::new(LoweringConfig::release()).lower(&method) {
///     Err(Error::UnknownBuilder(name)) => assert_eq!(name, "MissingBuilder"),
///     other => panic!("unexpected: {other:?}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Capability errors
    /// The method builder of an async method lacks a member required by the lowering.
    ///
    /// A builder must provide `Create`, `Start`, `SetResult`, `SetException` and
    /// `AwaitUnsafeOnCompleted`. Lowering is abandoned entirely when one is missing.
    #[error("Builder '{builder}' is missing required member '{member}'")]
    MissingBuilderMember {
        /// Name of the builder type
        builder: String,
        /// Name of the missing member
        member: String,
    },

    /// An awaited type does not implement the awaiter pattern.
    #[error("Awaitable '{awaitable}' is missing member '{member}'")]
    MissingAwaiterMember {
        /// Name of the awaitable type
        awaitable: String,
        /// Name of the missing member
        member: String,
    },

    /// No builder is registered under this name.
    #[error("Unknown method builder '{0}'")]
    UnknownBuilder(String),

    /// The awaited type is not known to be awaitable.
    #[error("Type '{0}' is not awaitable")]
    UnknownAwaitable(String),

    // Lowering errors
    /// The source model is invalid.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Exception regions are not properly nested.
    ///
    /// Raised both for source-level region trees and for emitted clause tables that would
    /// violate the ECMA-335 nesting rules. This is always fatal for the method.
    #[error("Malformed region - {file}:{line}: {message}")]
    MalformedRegion {
        /// Description of the nesting violation
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An `await` expression appears inside an exception filter.
    #[error("Cannot await in the filter expression of a catch clause")]
    AwaitInFilter,

    /// An `await` appears where no suspension point can be placed.
    #[error("Cannot await outside of an async method body: {0}")]
    AwaitOutsideAsync(String),

    /// The method needs more suspension points than the configuration allows.
    #[error("Method requires more than {0} suspension states")]
    StateLimit(u32),

    // Emulation errors
    /// An operand of an unexpected kind was found.
    #[error("Type mismatch - {0}")]
    TypeMismatch(String),

    /// The evaluation stack was empty when a value was required.
    #[error("Evaluation stack underflow")]
    StackUnderflow,

    /// The instruction stream cannot be executed.
    #[error("Invalid program - {0}")]
    InvalidProgram(String),

    /// Execution ran past the configured budget.
    #[error("Execution limit of {0} steps exceeded")]
    ExecutionLimit(u64),

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically
    /// due to lock contention or poisoned locks in concurrent scenarios.
    #[error("Failed to lock target")]
    LockError,
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockError
    }
}
