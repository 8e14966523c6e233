//! Exception-region tree of an async method.
//!
//! Regions are kept in a flat arena indexed by [`RegionId`]; parents and children refer to
//! each other by index so the tree can be walked in either direction without reference
//! cycles. Region `i` is the `i`-th `try` statement of the source body in pre-order.

use std::fmt;

use crate::{syntax::LocalId, syntax::TypeRef, Result};

/// Index of a region in a [`RegionTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl RegionId {
    /// Index into the arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handler attached to a protected block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    /// `catch (T)`
    Catch(TypeRef),
    /// `catch (T) when (...)`
    Filter(TypeRef),
    /// `finally`
    Finally,
}

/// Ways control reaches a protected block of a rewritten method.
///
/// A block containing suspension points is entered normally on first execution and through
/// the state dispatch on every resumption; a moved catch handler is entered by testing the
/// caught-index slot after the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionPhase {
    /// Falling into the block from the preceding statement.
    NormalEntry,
    /// Jumping to the block entry from the state dispatch.
    ResumeEntry,
    /// Running a catch handler moved out of the block.
    CaughtWrap,
    /// The nested dispatch at the block entry.
    Dispatch,
}

impl RegionPhase {
    /// Phases a region passes through given whether it protects suspension points and
    /// whether a handler was moved out of it.
    #[must_use]
    pub fn for_region(region: &ExceptionRegion) -> Vec<RegionPhase> {
        let mut phases = vec![RegionPhase::NormalEntry];
        if region.try_has_await {
            phases.push(RegionPhase::ResumeEntry);
            phases.push(RegionPhase::Dispatch);
        }
        if region.wrapped && region.handlers.iter().any(|h| h != &HandlerKind::Finally) {
            phases.push(RegionPhase::CaughtWrap);
        }
        phases
    }
}

/// One source `try` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRegion {
    /// Own index.
    pub id: RegionId,
    /// Enclosing region, if any.
    pub parent: Option<RegionId>,
    /// Directly nested regions, in source order.
    pub children: Vec<RegionId>,
    /// Handlers, catches first.
    pub handlers: Vec<HandlerKind>,
    /// The protected block contains a suspension point.
    pub try_has_await: bool,
    /// A handler contains a suspension point.
    pub handler_has_await: bool,
    /// Slots synthesized for the rewrite of this region.
    pub wrap_slots: Vec<LocalId>,
    /// The region was rewritten because a handler awaits.
    pub wrapped: bool,
}

impl ExceptionRegion {
    /// Returns true if the region has a finally handler.
    #[must_use]
    pub fn has_finally(&self) -> bool {
        self.handlers.contains(&HandlerKind::Finally)
    }
}

/// Arena of exception regions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionTree {
    regions: Vec<ExceptionRegion>,
}

impl RegionTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a region under `parent` and returns its id.
    pub fn add(&mut self, parent: Option<RegionId>, handlers: Vec<HandlerKind>) -> RegionId {
        let id = RegionId(self.regions.len() as u32);
        self.regions.push(ExceptionRegion {
            id,
            parent,
            children: Vec::new(),
            handlers,
            try_has_await: false,
            handler_has_await: false,
            wrap_slots: Vec::new(),
            wrapped: false,
        });
        if let Some(parent) = parent {
            if let Some(p) = self.regions.get_mut(parent.index()) {
                p.children.push(id);
            }
        }
        id
    }

    /// Looks up a region.
    #[must_use]
    pub fn get(&self, id: RegionId) -> Option<&ExceptionRegion> {
        self.regions.get(id.index())
    }

    /// Looks up a region mutably.
    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut ExceptionRegion> {
        self.regions.get_mut(id.index())
    }

    /// All regions in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = &ExceptionRegion> {
        self.regions.iter()
    }

    /// Regions without a parent.
    pub fn roots(&self) -> impl Iterator<Item = &ExceptionRegion> {
        self.regions.iter().filter(|r| r.parent.is_none())
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns true if the method has no `try` statements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Nesting depth of a region, roots at depth 0.
    #[must_use]
    pub fn depth(&self, id: RegionId) -> usize {
        let mut depth = 0;
        let mut current = self.get(id).and_then(|r| r.parent);
        while let Some(parent) = current {
            depth += 1;
            current = self.get(parent).and_then(|r| r.parent);
        }
        depth
    }

    /// Number of regions that were rewritten.
    #[must_use]
    pub fn wrapped_count(&self) -> usize {
        self.regions.iter().filter(|r| r.wrapped).count()
    }

    /// Checks that the arena forms a well-formed tree.
    ///
    /// Every region needs at least one handler, parents precede their children in the
    /// pre-order numbering and the parent/children links agree.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedRegion`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        for region in &self.regions {
            if region.handlers.is_empty() {
                return Err(region_error!(
                    "Region {} has neither catch nor finally handlers",
                    region.id.0
                ));
            }
            let finallies = region
                .handlers
                .iter()
                .filter(|h| **h == HandlerKind::Finally)
                .count();
            let trailing = region.handlers.last() == Some(&HandlerKind::Finally);
            if finallies > 1 || (finallies == 1 && !trailing) {
                return Err(region_error!(
                    "Region {} has a misplaced finally handler",
                    region.id.0
                ));
            }
            if let Some(parent) = region.parent {
                if parent >= region.id {
                    return Err(region_error!(
                        "Region {} has parent {} that does not precede it",
                        region.id.0,
                        parent.0
                    ));
                }
                let linked = self
                    .get(parent)
                    .is_some_and(|p| p.children.contains(&region.id));
                if !linked {
                    return Err(region_error!(
                        "Region {} is not a child of its parent {}",
                        region.id.0,
                        parent.0
                    ));
                }
            }
            for child in &region.children {
                if self.get(*child).and_then(|c| c.parent) != Some(region.id) {
                    return Err(region_error!(
                        "Region {} lists {} as a child, which names another parent",
                        region.id.0,
                        child.0
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for RegionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for region in &self.regions {
            let indent = "  ".repeat(self.depth(region.id));
            write!(f, "{indent}region {}:", region.id.0)?;
            for handler in &region.handlers {
                match handler {
                    HandlerKind::Catch(ty) => write!(f, " catch {ty}")?,
                    HandlerKind::Filter(ty) => write!(f, " filter {ty}")?,
                    HandlerKind::Finally => f.write_str(" finally")?,
                }
            }
            if region.try_has_await {
                f.write_str(" [await in try]")?;
            }
            if region.handler_has_await {
                f.write_str(" [await in handler]")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
