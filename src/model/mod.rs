//! Data model for binary rooted time trees.
//!
//! # Tree representation
//! Trees are represented by [TimeTree], which uses the arena pattern to store
//! [Vertex] nodes. Each vertex is either a `Root`, `Internal`, or `Tip`,
//! referenced by [NodeIndex], and carries a [Height] (time before present).
//! Branch lengths seen by the likelihood engine are derived: rate multiplier
//! times the height difference between a vertex and its parent.
//!
//! The likelihood engine only reads trees. Callers mutate heights between
//! evaluations (e.g. when a sampler proposes a new state) and report what they
//! changed through [Change](crate::likelihood::Change).
//!
//! # Building trees
//! - [TimeTree] directly: add tips first, then internal vertices, then the root.
//! - [TimeTreeBuilder]: add vertices with branch lengths in any order; heights
//!   and the tips-first numbering are derived when finishing.
//! - [newick](crate::newick): parse a Newick string via the builder.

pub mod tree;
pub mod tree_builder;
pub mod vertex;

pub use tree::NodeIndex;
pub use tree::TimeTree;
pub use tree_builder::TimeTreeBuilder;
pub use vertex::Height;
pub use vertex::Vertex;
