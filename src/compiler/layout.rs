//! Field layout of a synthesized state machine.
//!
//! The layout always starts with the state field and the builder field. Lowering appends the
//! receiver, referenced parameters, hoisted locals, spill temporaries, wrap slots and one
//! awaiter slot per suspension point; field reuse later folds fields with disjoint lifetimes
//! into shared slots.

use std::fmt;

use crate::{assembly::FieldId, syntax::LocalId, syntax::TypeRef};

/// Name of the state field.
pub const STATE_FIELD: &str = "<>1__state";
/// Name of the builder field.
pub const BUILDER_FIELD: &str = "<>t__builder";
/// Name of the hoisted receiver.
pub const THIS_FIELD: &str = "<>4__this";

/// Whether the machine is a value type or a reference type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Representation {
    /// Value type; boxed by the builder on first suspension.
    Struct,
    /// Reference type; allocated by the kickoff method.
    Class,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Representation::Struct => f.write_str("valuetype"),
            Representation::Class => f.write_str("class"),
        }
    }
}

/// What a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldKind {
    /// The resumption state: `-1` running, `-2` finished, `>= 0` suspended at that point.
    State,
    /// The method builder.
    Builder,
    /// The receiver of an instance method.
    This,
    /// A parameter, by index.
    Parameter(u16),
    /// A user local or spill temporary live across a suspension point.
    Hoisted(LocalId),
    /// Awaiter kept across a suspension.
    Awaiter,
    /// Pending exception, pending branch or stash of a rewritten exception region.
    Wrap(LocalId),
}

impl FieldKind {
    /// A name-independent tag used by shape comparisons.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            FieldKind::State => "state",
            FieldKind::Builder => "builder",
            FieldKind::This => "this",
            FieldKind::Parameter(_) => "parameter",
            FieldKind::Hoisted(_) => "hoisted",
            FieldKind::Awaiter => "awaiter",
            FieldKind::Wrap(_) => "wrap",
        }
    }
}

/// When a field holds a meaningful value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// For the whole life of the machine; never shared.
    Pinned,
    /// Only between a suspension and the matching resumption.
    Momentary,
    /// Between two positions of the pre-order numbering of the method body.
    Interval {
        /// First position.
        start: u32,
        /// Last position.
        end: u32,
    },
}

impl Lifetime {
    /// Returns true if two interval lifetimes overlap. Other lifetimes always conflict.
    #[must_use]
    pub fn overlaps(&self, other: &Lifetime) -> bool {
        match (self, other) {
            (
                Lifetime::Interval { start: a, end: b },
                Lifetime::Interval { start: c, end: d },
            ) => a <= d && c <= b,
            _ => true,
        }
    }

    /// Smallest lifetime covering both.
    #[must_use]
    pub fn union(&self, other: &Lifetime) -> Lifetime {
        match (self, other) {
            (
                Lifetime::Interval { start: a, end: b },
                Lifetime::Interval { start: c, end: d },
            ) => Lifetime::Interval {
                start: *a.min(c),
                end: *b.max(d),
            },
            (Lifetime::Momentary, Lifetime::Momentary) => Lifetime::Momentary,
            _ => Lifetime::Pinned,
        }
    }

    /// Returns true if `position` lies inside an interval lifetime.
    #[must_use]
    pub fn contains(&self, position: u32) -> bool {
        match self {
            Lifetime::Interval { start, end } => *start <= position && position <= *end,
            Lifetime::Pinned => true,
            Lifetime::Momentary => false,
        }
    }
}

/// A field of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name, e.g. `<x>5__1`.
    pub name: String,
    /// Field type.
    pub ty: TypeRef,
    /// What the field holds.
    pub kind: FieldKind,
    /// When it holds it.
    pub lifetime: Lifetime,
}

impl Field {
    /// Returns true if field reuse may merge this field with others.
    #[must_use]
    pub fn is_shareable(&self) -> bool {
        !matches!(
            self.kind,
            FieldKind::State | FieldKind::Builder | FieldKind::This | FieldKind::Parameter(_)
        ) && self.lifetime != Lifetime::Pinned
    }
}

/// The ordered field list of a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachineLayout {
    /// Name of the machine type, e.g. `<F>d__0`.
    pub type_name: String,
    /// Fields in declaration order.
    pub fields: Vec<Field>,
}

impl StateMachineLayout {
    /// Creates a layout holding the state and builder fields.
    #[must_use]
    pub fn new(type_name: impl Into<String>, builder: TypeRef) -> Self {
        Self {
            type_name: type_name.into(),
            fields: vec![
                Field {
                    name: STATE_FIELD.to_string(),
                    ty: TypeRef::Int32,
                    kind: FieldKind::State,
                    lifetime: Lifetime::Pinned,
                },
                Field {
                    name: BUILDER_FIELD.to_string(),
                    ty: builder,
                    kind: FieldKind::Builder,
                    lifetime: Lifetime::Pinned,
                },
            ],
        }
    }

    /// Machine type name for a method: `<{method}>d__{ordinal}`.
    #[must_use]
    pub fn type_name_for(method: &str, ordinal: u32) -> String {
        format!("<{method}>d__{ordinal}")
    }

    /// The state field.
    #[must_use]
    pub fn state(&self) -> FieldId {
        FieldId(0)
    }

    /// The builder field.
    #[must_use]
    pub fn builder(&self) -> FieldId {
        FieldId(1)
    }

    /// Appends a field.
    pub fn push(&mut self, field: Field) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(field);
        id
    }

    /// Looks up a field.
    #[must_use]
    pub fn get(&self, id: FieldId) -> Option<&Field> {
        self.fields.get(id.index())
    }

    /// Finds the first field of a kind.
    #[must_use]
    pub fn find(&self, kind: FieldKind) -> Option<FieldId> {
        self.fields
            .iter()
            .position(|f| f.kind == kind)
            .map(|i| FieldId(i as u32))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the layout has no fields, which never happens for a built layout.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of fields of a kind, ignoring the payload.
    #[must_use]
    pub fn count_tag(&self, tag: &str) -> usize {
        self.fields.iter().filter(|f| f.kind.tag() == tag).count()
    }
}

impl fmt::Display for StateMachineLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            writeln!(f, ".field public {} {}", field.ty, field.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_layout_has_state_and_builder() {
        let layout = StateMachineLayout::new("<F>d__0", TypeRef::named("B"));
        assert_eq!(layout.len(), 2);
        assert_eq!(layout.get(layout.state()).map(|f| f.name.as_str()), Some(STATE_FIELD));
        assert_eq!(layout.find(FieldKind::Builder), Some(FieldId(1)));
        assert_eq!(StateMachineLayout::type_name_for("F", 3), "<F>d__3");
    }

    #[test]
    fn test_lifetime_overlap() {
        let a = Lifetime::Interval { start: 1, end: 5 };
        let b = Lifetime::Interval { start: 6, end: 9 };
        let c = Lifetime::Interval { start: 5, end: 7 };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(Lifetime::Pinned.overlaps(&a));
        assert_eq!(a.union(&b), Lifetime::Interval { start: 1, end: 9 });
        assert!(a.contains(3));
        assert!(!Lifetime::Momentary.contains(3));
    }

    #[test]
    fn test_shareable() {
        let mut layout = StateMachineLayout::new("<F>d__0", TypeRef::named("B"));
        let hoisted = layout.push(Field {
            name: "<x>5__1".into(),
            ty: TypeRef::Int32,
            kind: FieldKind::Hoisted(LocalId(0)),
            lifetime: Lifetime::Interval { start: 0, end: 4 },
        });
        assert!(layout.get(hoisted).is_some_and(Field::is_shareable));
        assert!(!layout.fields[0].is_shareable());
        assert_eq!(layout.count_tag("hoisted"), 1);
    }
}
