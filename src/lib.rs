//! Treelik is a library for incremental phylogenetic tree likelihood
//! evaluation with exact branch gradients.
//!
//! This crate evaluates the likelihood of aligned sequence data under a
//! continuous-time Markov model of substitution along a rooted binary time
//! tree, and computes first and second derivatives of the log-likelihood
//! with respect to branch parameters.
//! Core functionality provided:
//! - Likelihood engine: [TreeLikelihood] caches partials and transition
//!   matrices in double buffers and, given the list of [Change]s since the
//!   previous call, recomputes only what those changes affect.
//! - Store/restore: cached buffers can be kept and reverted, as needed by an
//!   MCMC sampler rejecting a proposal.
//! - Differentials: a preorder pass reuses the cached partials to compute the
//!   gradient and Hessian diagonal for every branch at once.
//! - Compute backend: all arithmetic goes through the
//!   [ComputeBackend](crate::backend::ComputeBackend) trait, with
//!   [CpuBackend] as reference implementation.
//! - Substitution models: equal-rates and gain/loss models, per-branch
//!   model assignment, branch rates and rate categories.
//!   See [crate::substitution].
//! - Inputs: time trees built directly, via a builder, or from Newick strings,
//!   and observed states per taxon. See [crate::model], [crate::newick] and
//!   [crate::data].
//!
//! Limitations:
//! - Only binary trees, fixed topology
//! - Only Markov substitution processes
//!
//! # Usage
//! Build an engine once per tree shape with
//! [TreeLikelihoodBuilder], then call [`TreeLikelihood::evaluate`] after every
//! parameter change, reporting what changed.
//!
//! ```
//! use treelik::{Change, CpuBackend, TreeLikelihoodBuilder, parse_newick_str};
//! use treelik::data::PatternList;
//! use treelik::likelihood::{BranchLengthDifferential, DerivativeOrder};
//! use treelik::substitution::{BranchAssignment, SymmetricModel};
//!
//! let tree = parse_newick_str("((A:0.1,B:0.2):0.3,C:0.5);").unwrap();
//! let patterns = PatternList::from_sequences("ACGT", &[("A", "ACGT"), ("B", "ACGG"), ("C", "TCGA")]).unwrap();
//! let mut branches = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
//!
//! let mut likelihood = TreeLikelihoodBuilder::new(&patterns, &tree).build::<CpuBackend>().unwrap();
//! let log_likelihood = likelihood.evaluate(&tree, &branches, &[]).unwrap();
//! assert!(log_likelihood < 0.0);
//!
//! likelihood.compute_differentials(&tree, &branches, &BranchLengthDifferential, DerivativeOrder::First).unwrap();
//! assert_eq!(likelihood.gradient().unwrap().len(), 4);
//!
//! // Changing the model invalidates the gradient
//! branches.dispatch_mut().model_mut(0).unwrap().set_rate(2.0);
//! likelihood.evaluate(&tree, &branches, &[Change::SubstitutionModel(0)]).unwrap();
//! assert!(likelihood.gradient().is_err());
//! ```

pub mod backend;
pub mod data;
pub mod error;
pub mod likelihood;
pub mod model;
pub mod newick;
pub mod substitution;

pub use backend::CpuBackend;
pub use error::{LikelihoodError, LikelihoodErrorType};
pub use likelihood::{Change, TreeLikelihood, TreeLikelihoodBuilder};

use crate::model::TimeTree;

// ============================================================================
// Quick Newick API
// ============================================================================
/// Parses a Newick string into a [TimeTree].
///
/// See [`newick::parse_str`] for full documentation of this convenience function.
pub fn parse_newick_str<S: AsRef<str>>(newick: S) -> Result<TimeTree, LikelihoodError> {
    newick::parse_str(newick)
}
