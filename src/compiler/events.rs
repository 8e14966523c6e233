//! Unified event logging for the lowering pipeline.
//!
//! Every decision the passes take (a state number allocated, a local hoisted, a region
//! wrapped, a field shared) is recorded as an [`Event`]. Events can be inspected for
//! debugging or in tests, or safely ignored.
//!
//! # Architecture
//!
//! Passes call [`crate::compiler::LoweringContext::record`], which hands out an
//! [`EventBuilder`] already tagged with the method name. The builder pushes its
//! [`Event`] when dropped, so a bare `ctx.record(kind);` is a complete log call.
//! [`DerivedStats`] turns a log into totals.
//!
//! # Example
//!
//! ```rust
//! use asyncscope::compiler::{EventKind, EventLog};
//!
//! let log = EventLog::new();
//!
//! log.record(EventKind::StateAllocated)
//!     .method("GetValue")
//!     .location(0)
//!     .message("state 0 awaits Task<int32>");
//!
//! log.info("synthesize done");
//!
//! assert_eq!(log.count_kind(EventKind::StateAllocated), 1);
//! assert_eq!(log.summary(), "1 state allocated");
//! ```

use std::{collections::BTreeMap, fmt};

use strum::{Display, EnumIter, IntoEnumIterator};

/// Broad grouping of [`EventKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// A change made to the method or its layout.
    Transformation,
    /// Pass and method boundaries.
    Pipeline,
    /// Free-form info, warnings and errors.
    Diagnostic,
}

/// What a pass decided or did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
pub enum EventKind {
    /// A suspension point received its state number.
    #[strum(to_string = "state allocated")]
    StateAllocated,
    /// A local, parameter or `this` was moved into a state-machine field.
    #[strum(to_string = "variable hoisted")]
    VariableHoisted,
    /// An exception region containing awaits in a handler was rewritten.
    #[strum(to_string = "region wrapped")]
    RegionWrapped,
    /// A wrap slot (pending exception, pending branch, stash) was allocated.
    #[strum(to_string = "wrap slot allocated")]
    WrapSlotAllocated,
    /// An await was rewritten into the suspend/resume sequence.
    #[strum(to_string = "await rewritten")]
    AwaitRewritten,
    /// An operand evaluated before an await was spilled to a temporary.
    #[strum(to_string = "await operand spilled")]
    AwaitSpilled,
    /// A state dispatch was emitted at method or region entry.
    #[strum(to_string = "dispatch emitted")]
    DispatchEmitted,
    /// A field was merged into a slot shared with another field.
    #[strum(to_string = "field reused")]
    FieldReused,
    /// A clear of a reference slot or awaiter slot was emitted.
    #[strum(to_string = "slot cleared")]
    SlotCleared,
    /// The machine representation (struct or class) was chosen.
    #[strum(to_string = "representation selected")]
    RepresentationSelected,
    /// A lowering pass started.
    #[strum(to_string = "pass started")]
    PassStarted,
    /// A lowering pass completed.
    #[strum(to_string = "pass completed")]
    PassCompleted,
    /// A method was lowered completely.
    #[strum(to_string = "method lowered")]
    MethodLowered,
    /// Informational message.
    #[strum(to_string = "info")]
    Info,
    /// Something unexpected but recoverable.
    #[strum(to_string = "warning")]
    Warning,
    /// A pass failed.
    #[strum(to_string = "error")]
    Error,
}

impl EventKind {
    /// The category this kind belongs to.
    #[must_use]
    pub fn category(self) -> EventCategory {
        match self {
            Self::PassStarted | Self::PassCompleted | Self::MethodLowered => {
                EventCategory::Pipeline
            }
            Self::Info | Self::Warning | Self::Error => EventCategory::Diagnostic,
            Self::RepresentationSelected => EventCategory::Pipeline,
            _ => EventCategory::Transformation,
        }
    }
}

/// A single logged event.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Source name of the method being lowered.
    pub method: Option<String>,
    /// State number, region index, field index or instruction offset, depending on
    /// `kind`.
    pub location: Option<usize>,
    /// Human-readable description.
    pub message: String,
    /// Name of the pass that logged the event.
    pub pass: Option<&'static str>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(pass) = self.pass {
            write!(f, " {pass}")?;
        }
        if let Some(method) = &self.method {
            write!(f, " {method}")?;
            if let Some(location) = self.location {
                write!(f, "@{location}")?;
            }
        }
        write!(f, ": {}", self.message)
    }
}

/// Fluent event under construction, pushed to its log on drop.
///
/// Created by [`EventLog::record`].
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    event: Event,
    message: Option<String>,
}

impl EventBuilder<'_> {
    /// Names the method the event belongs to.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = Some(method.into());
        self
    }

    /// Sets the location within the method.
    pub fn location(mut self, location: usize) -> Self {
        self.event.location = Some(location);
        self
    }

    /// Replaces the default message, which is the kind's name.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attributes the event to a pass.
    pub fn pass(mut self, pass: &'static str) -> Self {
        self.event.pass = Some(pass);
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        let mut event = self.event.clone();
        event.message = self
            .message
            .take()
            .unwrap_or_else(|| event.kind.to_string());
        self.log.events.push(event);
    }
}

/// Append-only event log shared by the passes of one lowering, and merged into the
/// [`crate::compiler::Lowerer`]'s log afterwards.
///
/// Appending takes `&self`, so parallel lowerings can merge into one log.
#[derive(Debug)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            events: boxcar::Vec::new(),
        }
    }
}

impl EventLog {
    /// Creates an empty event log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no events have been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.count() == 0
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Starts an event of `kind`; it is logged when the builder is dropped.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder {
            log: self,
            event: Event {
                kind,
                method: None,
                location: None,
                message: String::new(),
                pass: None,
            },
            message: None,
        }
    }

    /// Logs an informational message.
    pub fn info(&self, message: impl Into<String>) {
        self.record(EventKind::Info).message(message);
    }

    /// Logs a warning.
    pub fn warn(&self, message: impl Into<String>) {
        self.record(EventKind::Warning).message(message);
    }

    /// Logs an error.
    pub fn error(&self, message: impl Into<String>) {
        self.record(EventKind::Error).message(message);
    }

    /// Appends copies of all events of `other`.
    pub fn merge_ref(&self, other: &EventLog) {
        for event in other.iter() {
            self.events.push(event.clone());
        }
    }

    /// All events in logging order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().map(|(_, event)| event)
    }

    /// Returns true if an event of `kind` was logged.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.iter().any(|e| e.kind == kind)
    }

    /// Number of events of `kind`.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.iter().filter(|e| e.kind == kind).count()
    }

    /// Events logged while lowering `method`.
    pub fn filter_method<'a>(&'a self, method: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.iter()
            .filter(move |e| e.method.as_deref() == Some(method))
    }

    /// Transformation events only.
    pub fn transformations(&self) -> impl Iterator<Item = &Event> + '_ {
        self.iter()
            .filter(|e| e.kind.category() == EventCategory::Transformation)
    }

    /// Info, warning and error events.
    pub fn diagnostics(&self) -> impl Iterator<Item = &Event> + '_ {
        self.iter()
            .filter(|e| e.kind.category() == EventCategory::Diagnostic)
    }

    /// Event counts per kind, in declaration order of [`EventKind`].
    #[must_use]
    pub fn count_by_kind(&self) -> BTreeMap<EventKind, usize> {
        let mut counts = BTreeMap::new();
        for event in self.iter() {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Sorted, deduplicated names of the methods that logged events.
    #[must_use]
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.iter().filter_map(|e| e.method.as_deref()).collect();
        methods.sort_unstable();
        methods.dedup();
        methods
    }

    /// One line counting each transformation kind, e.g.
    /// `2 state allocated, 1 variable hoisted`.
    #[must_use]
    pub fn summary(&self) -> String {
        let counts = self.count_by_kind();
        let parts: Vec<String> = EventKind::iter()
            .filter(|kind| kind.category() == EventCategory::Transformation)
            .filter_map(|kind| counts.get(&kind).map(|n| format!("{n} {kind}")))
            .collect();
        if parts.is_empty() {
            format!("{} events", self.len())
        } else {
            parts.join(", ")
        }
    }
}

/// Per-lowering totals derived from an [`EventLog`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedStats {
    /// Methods lowered.
    pub methods_lowered: usize,
    /// Suspension states allocated.
    pub states: usize,
    /// Variables hoisted into fields.
    pub hoisted: usize,
    /// Exception regions rewritten.
    pub regions_wrapped: usize,
    /// Wrap slots allocated.
    pub wrap_slots: usize,
    /// Await operands spilled.
    pub spills: usize,
    /// Fields merged into shared slots.
    pub fields_reused: usize,
    /// Slot clears emitted.
    pub slots_cleared: usize,
    /// Errors logged.
    pub errors: usize,
}

impl DerivedStats {
    /// Tallies `log`.
    #[must_use]
    pub fn from_log(log: &EventLog) -> Self {
        let mut stats = Self::default();
        for event in log.iter() {
            let slot = match event.kind {
                EventKind::MethodLowered => &mut stats.methods_lowered,
                EventKind::StateAllocated => &mut stats.states,
                EventKind::VariableHoisted => &mut stats.hoisted,
                EventKind::RegionWrapped => &mut stats.regions_wrapped,
                EventKind::WrapSlotAllocated => &mut stats.wrap_slots,
                EventKind::AwaitSpilled => &mut stats.spills,
                EventKind::FieldReused => &mut stats.fields_reused,
                EventKind::SlotCleared => &mut stats.slots_cleared,
                EventKind::Error => &mut stats.errors,
                _ => continue,
            };
            *slot += 1;
        }
        stats
    }
}

impl fmt::Display for DerivedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            (self.methods_lowered, "methods"),
            (self.states, "states"),
            (self.hoisted, "hoisted"),
            (self.spills, "spilled"),
            (self.regions_wrapped, "regions wrapped"),
            (self.fields_reused, "fields reused"),
            (self.errors, "errors"),
        ];
        let text: Vec<String> = parts
            .iter()
            .filter(|(n, _)| *n > 0)
            .map(|(n, label)| format!("{n} {label}"))
            .collect();
        if text.is_empty() {
            f.write_str("no transformations")
        } else {
            f.write_str(&text.join(", "))
        }
    }
}
