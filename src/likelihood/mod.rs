//! Incremental tree likelihood evaluation and branch differentials.
//!
//! # Overview
//! A [TreeLikelihood] owns a [ComputeBackend](crate::backend::ComputeBackend)
//! and caches one partial per internal node and one transition matrix per
//! branch in backend buffers. Every evaluation call receives the list of
//! [Change]s made to the tree or the branch models since the previous call;
//! only the matrices of changed branches and the partials on paths from
//! changed branches or tips to the root are recomputed.
//!
//! Each cached entity has two physical slots ([BufferIndex]). A recomputed
//! value goes to the slot not currently in use, so the previous value stays
//! available and [`TreeLikelihood::restore_state`] can revert a rejected
//! proposal without any recomputation.
//!
//! After an evaluation, [`TreeLikelihood::compute_differentials`] runs a
//! preorder pass over the cached postorder partials and returns the gradient
//! and Hessian diagonal of the log-likelihood with respect to a branch
//! parameter, as described by a [DifferentialHook].
//!
//! # Example
//! ```
//! use treelik::backend::CpuBackend;
//! use treelik::data::PatternList;
//! use treelik::likelihood::{Change, TreeLikelihoodBuilder};
//! use treelik::model::Height;
//! use treelik::newick::parse_str;
//! use treelik::substitution::{BranchAssignment, SymmetricModel};
//!
//! let mut tree = parse_str("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
//! let patterns = PatternList::from_sequences(
//!     "ACGT",
//!     &[("A", "ACGT"), ("B", "ACGA"), ("C", "ACTT"), ("D", "CCTT")],
//! ).unwrap();
//! let branches = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
//!
//! let mut likelihood = TreeLikelihoodBuilder::new(&patterns, &tree)
//!     .build::<CpuBackend>()
//!     .unwrap();
//! let before = likelihood.evaluate(&tree, &branches, &[]).unwrap();
//!
//! tree.set_height(4, Height::new(0.5));
//! let after = likelihood.evaluate(&tree, &branches, &[Change::NodeHeight(4)]).unwrap();
//! assert_ne!(before, after);
//! assert_eq!(likelihood.update_flags(), &[false, false, false, false, true, false, true]);
//! ```

pub mod buffer_index;
pub mod engine;
pub mod preorder;
pub mod traversal;

pub use buffer_index::BufferIndex;
pub use engine::{EvaluationStatistics, TreeLikelihood, TreeLikelihoodBuilder};
pub use preorder::{BranchLengthDifferential, BranchRateDifferential, DerivativeOrder, DifferentialHook};
pub use traversal::SlotLayout;

use crate::model::NodeIndex;

/// A change to the tree, the branch models or the data since the previous evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Height of a node changed; affects its own branch and the branches of its children.
    NodeHeight(NodeIndex),
    /// Rate multiplier of the branch above a node changed.
    BranchRate(NodeIndex),
    /// Model instance assigned to the branch above a node changed.
    BranchModel(NodeIndex),
    /// Parameters of the model with this index changed; affects all branches using it.
    SubstitutionModel(usize),
    /// Observed states of a tip changed.
    TipStates {
        /// Tip node
        tip: NodeIndex,
        /// New state per pattern
        states: Vec<usize>,
    },
    /// Anything may have changed.
    Everything,
}
