//! Bottom-up construction of [TimeTree]s from branch lengths.
//!
//! Text formats such as Newick describe a tree by branch lengths and list
//! vertices in whatever order they appear, while the likelihood engine wants
//! heights and tips numbered first. [TimeTreeBuilder] bridges the two: it
//! collects vertices with their branch lengths in any order, then
//! [`finish_tree`](TimeTreeBuilder::finish_tree) converts lengths into heights
//! and renumbers vertices (tips `0..n` in insertion order, internal vertices in
//! post-order, root last).
//!
//! # Builder lifecycle
//! ```text
//! Empty ──→ add_tip/add_internal ──→ add_root ──→ finish_tree() ──→ TimeTree
//! ```
//!
//! # Example
//! ```
//! use treelik::model::TimeTreeBuilder;
//!
//! let mut builder = TimeTreeBuilder::new();
//! let a = builder.add_tip(1.0, "A");
//! let b = builder.add_tip(2.0, "B");
//! let c = builder.add_tip(1.5, "C");
//! let ab = builder.add_internal((a, b), 0.5);
//! builder.add_root((ab, c));
//! let tree = builder.finish_tree().unwrap();
//!
//! assert_eq!(tree.num_tips(), 3);
//! assert_eq!(tree.height(tree.root_index()), 2.5);
//! ```

use crate::error::LikelihoodError;
use crate::model::tree::{NodeIndex, TimeTree};
use crate::model::vertex::Height;

/// Index of a vertex while still under construction in a [TimeTreeBuilder].
pub type BuilderIndex = usize;

#[derive(Debug, Clone)]
enum ProtoVertex {
    Tip { label: String, branch_length: f64 },
    Internal { children: (BuilderIndex, BuilderIndex), branch_length: f64 },
    Root { children: (BuilderIndex, BuilderIndex) },
}

// =#========================================================================#=
// TIME TREE BUILDER
// =#========================================================================#=
/// Collects vertices with branch lengths and produces a [TimeTree].
#[derive(Debug, Clone, Default)]
pub struct TimeTreeBuilder {
    vertices: Vec<ProtoVertex>,
    root: Option<BuilderIndex>,
}

impl TimeTreeBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tip with the length of the branch to its parent.
    pub fn add_tip<S: Into<String>>(&mut self, branch_length: f64, label: S) -> BuilderIndex {
        self.vertices.push(ProtoVertex::Tip { label: label.into(), branch_length });
        self.vertices.len() - 1
    }

    /// Adds an internal vertex joining two previously added vertices.
    pub fn add_internal(&mut self, children: (BuilderIndex, BuilderIndex), branch_length: f64) -> BuilderIndex {
        self.vertices.push(ProtoVertex::Internal { children, branch_length });
        self.vertices.len() - 1
    }

    /// Adds the root joining two previously added vertices.
    pub fn add_root(&mut self, children: (BuilderIndex, BuilderIndex)) -> BuilderIndex {
        self.vertices.push(ProtoVertex::Root { children });
        let index = self.vertices.len() - 1;
        self.root = Some(index);
        index
    }

    /// Returns the number of tips added so far.
    pub fn num_tips(&self) -> usize {
        self.vertices.iter().filter(|v| matches!(v, ProtoVertex::Tip { .. })).count()
    }

    /// Finalizes construction and returns the resulting tree, leaving the builder empty.
    ///
    /// # Errors
    /// Returns `InvalidTree` if no root was added, a branch length is negative
    /// or not finite, a child index is unknown or used twice, or fewer than two
    /// tips were added.
    pub fn finish_tree(&mut self) -> Result<TimeTree, LikelihoodError> {
        let vertices = std::mem::take(&mut self.vertices);
        let root = self.root.take().ok_or_else(|| LikelihoodError::invalid_tree("no root added"))?;

        let num_tips = vertices.iter().filter(|v| matches!(v, ProtoVertex::Tip { .. })).count();
        if num_tips < 2 {
            return Err(LikelihoodError::invalid_tree(format!("need at least two tips, got {num_tips}")));
        }

        // Depth (distance from root) of every proto vertex, walking top-down.
        let mut depth = vec![f64::NAN; vertices.len()];
        let mut seen = vec![false; vertices.len()];
        let mut post_order = Vec::with_capacity(vertices.len());
        let mut stack = vec![(root, false)];
        depth[root] = 0.0;
        seen[root] = true;

        while let Some((index, children_visited)) = stack.pop() {
            let children = match &vertices[index] {
                ProtoVertex::Tip { .. } => None,
                ProtoVertex::Internal { children, .. } | ProtoVertex::Root { children } => Some(*children),
            };
            match children {
                Some((left, right)) if !children_visited => {
                    stack.push((index, true));
                    for child in [right, left] {
                        if child >= vertices.len() || seen[child] {
                            return Err(LikelihoodError::invalid_tree(format!("child {child} unknown or reused")));
                        }
                        let branch_length = match &vertices[child] {
                            ProtoVertex::Tip { branch_length, .. } | ProtoVertex::Internal { branch_length, .. } => {
                                *branch_length
                            }
                            ProtoVertex::Root { .. } => {
                                return Err(LikelihoodError::invalid_tree("root used as a child"));
                            }
                        };
                        if !(branch_length >= 0.0 && branch_length.is_finite()) {
                            return Err(LikelihoodError::invalid_tree(format!(
                                "branch length must be non-negative and finite, got {branch_length}"
                            )));
                        }
                        seen[child] = true;
                        depth[child] = depth[index] + branch_length;
                        stack.push((child, false));
                    }
                }
                _ => post_order.push(index),
            }
        }

        if post_order.len() != vertices.len() {
            return Err(LikelihoodError::invalid_tree("vertices not connected to the root"));
        }

        let root_height = depth.iter().cloned().fold(0.0, f64::max);
        let height = |index: BuilderIndex| Height::new((root_height - depth[index]).max(0.0));

        // Renumbering: tips in insertion order first, then internal vertices in post-order.
        let mut new_index: Vec<NodeIndex> = vec![usize::MAX; vertices.len()];
        let mut tree = TimeTree::new(num_tips);
        for (index, vertex) in vertices.iter().enumerate() {
            if let ProtoVertex::Tip { label, .. } = vertex {
                new_index[index] = tree.add_tip(height(index), label.clone());
            }
        }
        for &index in &post_order {
            match &vertices[index] {
                ProtoVertex::Tip { .. } => {}
                ProtoVertex::Internal { children, .. } => {
                    let children = (new_index[children.0], new_index[children.1]);
                    new_index[index] = tree.add_internal(children, height(index));
                }
                ProtoVertex::Root { children } => {
                    let children = (new_index[children.0], new_index[children.1]);
                    new_index[index] = tree.add_root(children, height(index));
                }
            }
        }

        Ok(tree)
    }
}
