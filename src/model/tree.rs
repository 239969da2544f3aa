//! Provides the time tree representation read by the likelihood engine.
//!
//! * [TimeTree] - binary rooted tree using the arena pattern, vertices carry heights
//! * [NodeIndex] - type used to index vertices in the tree
//! * [PostOrderIter], [PreOrderIter], [AncestorIter] - stack based traversals

use crate::model::vertex::{Height, Vertex};

/// Index of a vertex in a tree (arena).
pub type NodeIndex = usize;

/// *During construction only*, index for unset root.
const NO_ROOT_SET_INDEX: NodeIndex = usize::MAX;

// =$========================================================================$=
// TREE
// =$========================================================================$=
/// A binary rooted time tree represented using the arena pattern on [Vertex].
///
/// Vertices are stored in a contiguous vector and referenced by [NodeIndex].
///
/// # Structure
/// - All vertices (root, internal, and tips) are stored in the arena.
/// - A valid tree numbers its tips `0..num_tips`; the likelihood engine relies
///   on this to address tip buffers by node index.
///   [TimeTreeBuilder](crate::model::TimeTreeBuilder) guarantees this ordering.
/// - Heights decrease from the root toward the tips. This is checked by
///   [`TimeTree::heights_consistent()`] but not enforced on mutation, since
///   proposals may temporarily break it; evaluation rejects such states.
///
/// # Construction
/// Specify the number of tips, then add vertices bottom-up:
/// tips first, then internal vertices, then the root.
#[derive(Debug, Clone)]
pub struct TimeTree {
    /// Number of tips this tree was created for
    num_tips_init: usize,

    /// Vertices of this tree (arena pattern)
    vertices: Vec<Vertex>,

    /// Index of the root of this tree
    root_index: NodeIndex,
}

// ============================================================================
// New, Getters / Accessors, etc. (pub)
// ============================================================================
impl TimeTree {
    /// Creates a new tree with capacity for a binary tree with `num_tips` tips.
    ///
    /// # Arguments
    /// `num_tips` - number of tips of the new binary tree; must be at least two
    pub fn new(num_tips: usize) -> Self {
        assert!(num_tips > 1, "A time tree needs at least two tips");
        TimeTree {
            num_tips_init: num_tips,
            root_index: NO_ROOT_SET_INDEX,
            vertices: Vec::with_capacity(2 * num_tips - 1),
        }
    }

    /// Adds a root to the tree, assigning a unique index, which gets returned.
    pub fn add_root(&mut self, children: (NodeIndex, NodeIndex), height: Height) -> NodeIndex {
        let index = self.vertices.len();
        self.vertices.push(Vertex::new_root(index, children, height));

        self.root_index = index;
        self[children.0].set_parent(index);
        self[children.1].set_parent(index);

        index
    }

    /// Adds an internal vertex to the tree, assigning a unique index, which gets returned.
    pub fn add_internal(&mut self, children: (NodeIndex, NodeIndex), height: Height) -> NodeIndex {
        let index = self.vertices.len();
        self.vertices.push(Vertex::new_internal(index, children, height));

        self[children.0].set_parent(index);
        self[children.1].set_parent(index);

        index
    }

    /// Adds a tip to the tree, assigning a unique index, which gets returned.
    pub fn add_tip(&mut self, height: Height, label: String) -> NodeIndex {
        let index = self.vertices.len();
        self.vertices.push(Vertex::new_tip(index, height, label));
        index
    }

    /// Returns whether root of tree has been set.
    pub fn is_root_set(&self) -> bool {
        self.root_index != NO_ROOT_SET_INDEX
    }

    /// Returns a reference to the root vertex.
    ///
    /// # Panics
    /// Panics if the root hasn't been set yet.
    pub fn root(&self) -> &Vertex {
        &self[self.root_index]
    }

    /// Returns the index of the root.
    pub fn root_index(&self) -> NodeIndex {
        self.root_index
    }

    /// Returns a reference to the vertex at the given index.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn vertex(&self, index: NodeIndex) -> &Vertex {
        &self[index]
    }

    /// Returns the number of tips this tree was initialized to hold.
    pub fn num_tips_init(&self) -> usize {
        self.num_tips_init
    }

    /// Returns the number of tips in this tree.
    pub fn num_tips(&self) -> usize {
        self.vertices.iter().filter(|&v| v.is_tip()).count()
    }

    /// Returns the number of internal vertices (excluding the root) in this tree.
    pub fn num_internal(&self) -> usize {
        self.vertices.iter().filter(|&v| v.is_internal()).count()
    }

    /// Returns the number of vertices in this tree.
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Returns the height of the vertex at `index`.
    pub fn height(&self, index: NodeIndex) -> f64 {
        *self[index].height()
    }

    /// Sets the height of the vertex at `index`.
    ///
    /// No ordering against parent or children is checked here.
    pub fn set_height(&mut self, index: NodeIndex, height: Height) {
        self[index].set_height(height);
    }

    /// Returns the parent index of the vertex at `index`, `None` for the root.
    pub fn parent(&self, index: NodeIndex) -> Option<NodeIndex> {
        self[index].parent()
    }

    /// Returns the children of the vertex at `index`, `None` for tips.
    pub fn children(&self, index: NodeIndex) -> Option<(NodeIndex, NodeIndex)> {
        self[index].children()
    }

    /// Returns the other child of the parent of `index`, `None` for the root.
    pub fn sibling(&self, index: NodeIndex) -> Option<NodeIndex> {
        let (left, right) = self.children(self.parent(index)?)?;
        Some(if left == index { right } else { left })
    }

    /// Returns the time spanned by the branch above `index`
    /// (parent height minus own height), `None` for the root.
    ///
    /// Negative if heights are inconsistent.
    pub fn branch_time(&self, index: NodeIndex) -> Option<f64> {
        let parent = self.parent(index)?;
        Some(self.height(parent) - self.height(index))
    }

    /// Returns the index of the tip with the given label, if any.
    pub fn tip_index(&self, label: &str) -> Option<NodeIndex> {
        self.vertices.iter().find(|v| v.label() == Some(label)).map(|v| v.index())
    }

    /// Returns the sum of all branch times in the tree.
    pub fn total_branch_time(&self) -> f64 {
        (0..self.num_vertices()).filter_map(|i| self.branch_time(i)).sum()
    }

    /// Checks that no vertex is higher than its parent,
    /// that is, all branch times are non-negative.
    pub fn heights_consistent(&self) -> bool {
        (0..self.num_vertices()).all(|i| self.branch_time(i).is_none_or(|t| t >= 0.0))
    }

    /// Validates the tree structure and all index references.
    ///
    /// Checks:
    /// - Root index is valid and points to a Root vertex
    /// - All vertex indices match their position in the arena
    /// - All child indices are valid and point back to correct parent
    /// - Non-root vertices have a parent which includes them as a child
    /// - Tips occupy indices `0..num_tips` and have non-empty labels
    /// - For n tips, there are 2n-1 vertices
    pub fn is_valid(&self) -> bool {
        if self.root_index >= self.vertices.len() || !self.vertices[self.root_index].is_root() {
            return false;
        }

        let num_tips = self.num_tips();
        let mut found_root = false;

        for (index, vertex) in self.vertices.iter().enumerate() {
            if vertex.index() != index {
                return false;
            }

            if vertex.is_root() {
                if found_root {
                    return false;
                }
                found_root = true;
            }

            if vertex.is_tip() != (index < num_tips) {
                return false;
            }

            if let Some((left, right)) = vertex.children() {
                if left >= self.vertices.len() || right >= self.vertices.len() || left == right {
                    return false;
                }
                if self.vertices[left].parent() != Some(index) || self.vertices[right].parent() != Some(index) {
                    return false;
                }
            }

            if !vertex.is_root() {
                match vertex.parent() {
                    None => return false,
                    Some(parent) => {
                        if parent >= self.vertices.len() {
                            return false;
                        }
                        match self.vertices[parent].children() {
                            Some((left, right)) if left == index || right == index => {}
                            _ => return false,
                        }
                    }
                }
            }

            if vertex.label().is_some_and(|l| l.is_empty()) {
                return false;
            }
        }

        num_tips == self.vertices.len().div_ceil(2)
    }
}

impl std::ops::Index<NodeIndex> for TimeTree {
    type Output = Vertex;

    fn index(&self, index: NodeIndex) -> &Self::Output {
        &self.vertices[index]
    }
}

impl std::ops::IndexMut<NodeIndex> for TimeTree {
    fn index_mut(&mut self, index: NodeIndex) -> &mut Self::Output {
        &mut self.vertices[index]
    }
}

// =$========================================================================$=
// ITERATORS
// =$========================================================================$=
impl TimeTree {
    /// Returns an iterator over the whole tree in post-order (children before parents).
    pub fn post_order_iter(&self) -> PostOrderIter<'_> {
        PostOrderIter::new(self, self.is_root_set().then_some(self.root_index))
    }

    /// Returns an iterator over the subtree below (and including) `start`
    /// in post-order. The last vertex returned is `start` itself.
    pub fn post_order_iter_from(&self, start: NodeIndex) -> PostOrderIter<'_> {
        PostOrderIter::new(self, Some(start))
    }

    /// Returns an iterator over the tree in pre-order (parents before children).
    pub fn pre_order_iter(&self) -> PreOrderIter<'_> {
        PreOrderIter::new(self)
    }

    /// Returns an iterator over the proper ancestors of `index`,
    /// starting with its parent and ending with the root.
    pub fn ancestors(&self, index: NodeIndex) -> AncestorIter<'_> {
        AncestorIter { tree: self, current: self.parent(index) }
    }
}

/// Iterator for post-order traversal (children before parents).
///
/// Uses an explicit stack, so depth is not limited by the call stack
/// (caterpillar trees with many tips are fine).
pub struct PostOrderIter<'a> {
    tree: &'a TimeTree,
    stack: Vec<(NodeIndex, bool)>, // (index, children_visited)
}

impl<'a> PostOrderIter<'a> {
    fn new(tree: &'a TimeTree, start: Option<NodeIndex>) -> Self {
        let mut stack = Vec::new();
        if let Some(start) = start {
            stack.push((start, false));
        }
        PostOrderIter { tree, stack }
    }
}

impl<'a> Iterator for PostOrderIter<'a> {
    type Item = &'a Vertex;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((index, children_visited)) = self.stack.pop() {
            let vertex = &self.tree[index];

            if children_visited || vertex.is_tip() {
                return Some(vertex);
            }

            self.stack.push((index, true));

            // Push children (right first, so left is processed first)
            if let Some((left, right)) = vertex.children() {
                self.stack.push((right, false));
                self.stack.push((left, false));
            }
        }
        None
    }
}

/// Iterator for pre-order traversal (parents before children).
pub struct PreOrderIter<'a> {
    tree: &'a TimeTree,
    stack: Vec<NodeIndex>,
}

impl<'a> PreOrderIter<'a> {
    fn new(tree: &'a TimeTree) -> Self {
        let mut stack = Vec::new();
        if tree.is_root_set() {
            stack.push(tree.root_index);
        }
        PreOrderIter { tree, stack }
    }
}

impl<'a> Iterator for PreOrderIter<'a> {
    type Item = &'a Vertex;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.stack.pop()?;
        let vertex = &self.tree[index];

        if let Some((left, right)) = vertex.children() {
            self.stack.push(right);
            self.stack.push(left);
        }

        Some(vertex)
    }
}

/// Iterator walking from a vertex's parent up to the root.
pub struct AncestorIter<'a> {
    tree: &'a TimeTree,
    current: Option<NodeIndex>,
}

impl Iterator for AncestorIter<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.current?;
        self.current = self.tree.parent(index);
        Some(index)
    }
}
