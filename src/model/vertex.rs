//! Vertex module for time tree representation.

use crate::model::tree::NodeIndex;
use std::ops::Deref;

/// During construction, Internal and Tip vertices might not have parent set yet.
const NO_PARENT_SET: NodeIndex = usize::MAX;

// =#========================================================================#=
// VERTEX
// =#========================================================================#=
/// Represents a vertex (node) in a time tree.
///
/// A vertex can be either:
/// - **Root**: Has two children, no parent
/// - **Internal**: Has a parent and two children, no label
/// - **Tip**: Has a parent and a taxon label, no children
///
/// Every vertex carries a [Height], its time before the present.
/// The length of the branch above a non-root vertex is the height
/// difference to its parent (before any rate multiplier is applied).
///
/// # Invariants
/// - `index` is index in arena
/// - `height` is non-negative and finite (enforced by [Height])
/// - Internal vertices and tips have `parent` set to the index of their parent;
///   `NO_PARENT_SET = usize::MAX` only during construction
#[derive(PartialEq, Debug, Clone)]
pub enum Vertex {
    /// Root vertex of the tree (has no parent, has two children)
    Root {
        /// Index of this vertex in the tree arena
        index: NodeIndex,
        /// Indices of the two child vertices
        children: (NodeIndex, NodeIndex),
        /// Time before present
        height: Height,
    },
    /// Internal vertex (has parent and two children, no label)
    Internal {
        /// Index of this vertex in the tree arena
        index: NodeIndex,
        /// Index of the parent vertex
        parent: NodeIndex,
        /// Indices of the two child vertices
        children: (NodeIndex, NodeIndex),
        /// Time before present
        height: Height,
    },
    /// Tip vertex (has parent and label, no children)
    Tip {
        /// Index of this vertex in the tree arena
        index: NodeIndex,
        /// Index of the parent vertex
        parent: NodeIndex,
        /// Time before present (sampling time)
        height: Height,
        /// Taxon label, used to look up observed data
        label: String,
    },
}

impl Vertex {
    /// Creates a new root vertex.
    ///
    /// # Arguments
    /// * `index` - The unique index of this vertex in the tree (arena)
    /// * `children` - Tuple of child indices
    /// * `height` - Height of the root
    pub fn new_root(index: NodeIndex, children: (NodeIndex, NodeIndex), height: Height) -> Self {
        Vertex::Root { index, children, height }
    }

    /// Creates a new internal (non-tip, non-root) vertex.
    ///
    /// # Arguments
    /// * `index` - The unique index of this vertex in the tree (arena)
    /// * `children` - Tuple of child indices
    /// * `height` - Height of this vertex
    pub fn new_internal(index: NodeIndex, children: (NodeIndex, NodeIndex), height: Height) -> Self {
        Vertex::Internal { index, parent: NO_PARENT_SET, children, height }
    }

    /// Creates a new tip vertex.
    ///
    /// # Arguments
    /// * `index` - The unique index of this vertex in the tree (arena)
    /// * `height` - Sampling height of this tip
    /// * `label` - Taxon label
    pub fn new_tip(index: NodeIndex, height: Height, label: String) -> Self {
        Vertex::Tip { index, parent: NO_PARENT_SET, height, label }
    }

    /// Returns the index of this vertex.
    pub fn index(&self) -> NodeIndex {
        match self {
            Vertex::Root { index, .. } => *index,
            Vertex::Internal { index, .. } => *index,
            Vertex::Tip { index, .. } => *index,
        }
    }

    /// Returns the height of this vertex.
    pub fn height(&self) -> Height {
        match self {
            Vertex::Root { height, .. } | Vertex::Internal { height, .. } | Vertex::Tip { height, .. } => *height,
        }
    }

    /// Sets the height of this vertex.
    pub fn set_height(&mut self, new_height: Height) {
        match self {
            Vertex::Root { height, .. } | Vertex::Internal { height, .. } | Vertex::Tip { height, .. } => {
                *height = new_height
            }
        }
    }

    /// Returns the taxon label if this is a tip, else `None`.
    pub fn label(&self) -> Option<&str> {
        match self {
            Vertex::Tip { label, .. } => Some(label.as_str()),
            _ => None,
        }
    }

    /// Returns `true` if this vertex is a tip.
    pub fn is_tip(&self) -> bool {
        matches!(self, Vertex::Tip { .. })
    }

    /// Returns `true` if this vertex is an internal vertex (not the root).
    pub fn is_internal(&self) -> bool {
        matches!(self, Vertex::Internal { .. })
    }

    /// Returns `true` if this vertex is the root.
    pub fn is_root(&self) -> bool {
        matches!(self, Vertex::Root { .. })
    }

    /// Returns the children if this is the root or an internal vertex, else `None`.
    pub fn children(&self) -> Option<(NodeIndex, NodeIndex)> {
        match self {
            Vertex::Root { children, .. } | Vertex::Internal { children, .. } => Some(*children),
            Vertex::Tip { .. } => None,
        }
    }

    /// Sets new parent for non-root vertex.
    ///
    /// # Panics
    /// Panics if called on root.
    pub fn set_parent(&mut self, parent: NodeIndex) {
        match self {
            Vertex::Root { .. } => panic!("Cannot set parent on root vertex"),
            Vertex::Internal { parent: p, .. } | Vertex::Tip { parent: p, .. } => *p = parent,
        }
    }

    /// Returns the index of parent if this a non-root vertex, else `None`.
    ///
    /// Note that parent might not be set yet during construction.
    pub fn parent(&self) -> Option<NodeIndex> {
        match self {
            Vertex::Internal { parent, .. } | Vertex::Tip { parent, .. } => {
                if *parent == NO_PARENT_SET {
                    None
                } else {
                    Some(*parent)
                }
            }
            Vertex::Root { .. } => None,
        }
    }

    /// Returns `true` if this vertex has a parent set.
    pub fn has_parent(&self) -> bool {
        self.parent().is_some()
    }
}

// =#========================================================================#=
// HEIGHT
// =#========================================================================#=
/// Height of a vertex (time before present), enforced non-negative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Height(f64);

impl Height {
    /// Creates a new height.
    ///
    /// # Panics
    /// Panics if `height` is negative or not finite.
    pub fn new(height: f64) -> Self {
        assert!(height >= 0.0, "Height must be non-negative, got {}", height);
        assert!(height.is_finite(), "Height must be finite, got {}", height);
        Height(height)
    }

    /// Creates a new height, or `None` if `height` is negative or not finite.
    pub fn try_new(height: f64) -> Option<Self> {
        (height >= 0.0 && height.is_finite()).then_some(Height(height))
    }
}

impl Deref for Height {
    type Target = f64;
    fn deref(&self) -> &f64 {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_unset_during_construction() {
        let tip = Vertex::new_tip(0, Height::new(0.0), "A".to_string());
        assert_eq!(tip.parent(), None);
        assert!(!tip.has_parent());

        let mut internal = Vertex::new_internal(2, (0, 1), Height::new(1.0));
        internal.set_parent(4);
        assert_eq!(internal.parent(), Some(4));
    }

    #[test]
    fn test_tip_has_no_children() {
        let tip = Vertex::new_tip(0, Height::new(0.0), "A".to_string());
        assert_eq!(tip.children(), None);
        assert_eq!(tip.label(), Some("A"));
    }

    #[test]
    #[should_panic]
    fn test_negative_height() {
        let _ = Height::new(-1.0);
    }

    #[test]
    fn test_try_new_rejects_nan() {
        assert!(Height::try_new(f64::NAN).is_none());
        assert_eq!(*Height::try_new(2.5).unwrap(), 2.5);
    }
}
