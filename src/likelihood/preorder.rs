//! Preorder pass computing gradient and Hessian diagonal of the log-likelihood.
//!
//! With `post_v` the postorder partial of node `v` and `pre_v` its preorder
//! partial (likelihood of everything outside the subtree of `v`, given the
//! state at `v`), the site likelihood is `Σ_c w_c pre_v · post_v` on every
//! branch. Replacing the transition matrix of the branch above `v` by its
//! derivative `P·D` gives the derivative of the site likelihood, so
//! `Σ_c w_c pre_v · (D post_v)` divided by the site likelihood is the
//! per-pattern derivative of the log-likelihood.

use crate::backend::{ComputeBackend, Operation};
use crate::error::LikelihoodError;
use crate::likelihood::TreeLikelihood;
use crate::likelihood::engine::WEIGHT_SLOT;
use crate::model::{NodeIndex, TimeTree};
use crate::substitution::{BranchAssignment, SubstitutionModel};
use log::debug;
use ndarray::Array2;

// =#========================================================================#=
// DIFFERENTIAL HOOKS
// =#========================================================================#=
/// Differential form `D` of a branch parameter: `dP/dθ = P·D` for the
/// transition matrix `P` of the branch.
///
/// The engine multiplies `D` by the rate `r_c` of each category (and the
/// second order form by `r_c²`).
pub trait DifferentialHook<M: SubstitutionModel> {
    /// First-order form of the branch above `node`.
    fn first_order(
        &self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        node: NodeIndex,
    ) -> Result<Array2<f64>, LikelihoodError>;

    /// Second-order form, `d²P/dθ² = P·D₂`; defaults to `D·D`.
    fn second_order(
        &self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        node: NodeIndex,
    ) -> Result<Array2<f64>, LikelihoodError> {
        let d = self.first_order(tree, branches, node)?;
        Ok(d.dot(&d))
    }
}

/// Derivative with respect to the branch length: `D = Q`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchLengthDifferential;

impl<M: SubstitutionModel> DifferentialHook<M> for BranchLengthDifferential {
    fn first_order(
        &self,
        _tree: &TimeTree,
        branches: &BranchAssignment<M>,
        node: NodeIndex,
    ) -> Result<Array2<f64>, LikelihoodError> {
        Ok(branches.model_for(node)?.generator())
    }
}

/// Derivative with respect to the rate multiplier of the branch:
/// `D = (parent height - height) · Q`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchRateDifferential;

impl<M: SubstitutionModel> DifferentialHook<M> for BranchRateDifferential {
    fn first_order(
        &self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        node: NodeIndex,
    ) -> Result<Array2<f64>, LikelihoodError> {
        let time = tree
            .branch_time(node)
            .ok_or_else(|| LikelihoodError::invalid_tree(format!("node {node} has no branch")))?;
        Ok(branches.model_for(node)?.generator() * time)
    }
}

/// Which derivatives to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivativeOrder {
    /// Gradient only
    First,
    /// Gradient and Hessian diagonal
    FirstAndSecond,
}

/// Results of one preorder pass.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Differentials {
    generation: u64,
    nodes: Vec<NodeIndex>,
    gradient: Vec<f64>,
    hessian: Option<Vec<f64>>,
}

// =#========================================================================#=
// PREORDER PASS
// =#========================================================================#=
impl<B: ComputeBackend> TreeLikelihood<B> {
    /// Computes the gradient (and optionally Hessian diagonal) of the
    /// log-likelihood with respect to the parameter `hook` describes, for
    /// every non-root branch.
    ///
    /// Pending changes are evaluated first. Results are read through
    /// [`gradient`](Self::gradient) and [`hessian_diagonal`](Self::hessian_diagonal)
    /// until the next change is processed.
    pub fn compute_differentials<M, H>(
        &mut self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        hook: &H,
        order: DerivativeOrder,
    ) -> Result<(), LikelihoodError>
    where
        M: SubstitutionModel,
        H: DifferentialHook<M> + ?Sized,
    {
        self.evaluate(tree, branches, &[])?;
        self.differentials = None;

        let root = tree.root_index();
        let nodes: Vec<NodeIndex> = (0..tree.num_vertices()).filter(|&n| n != root).collect();
        let second_order = order == DerivativeOrder::FirstAndSecond;

        // Root preorder partial: root frequencies in every pattern and category
        let frequencies = branches.root_frequencies(tree)?;
        let seed: Vec<f64> = (0..self.pattern_count * self.site_rates.category_count())
            .flat_map(|_| frequencies.iter().copied())
            .collect();
        self.backend.set_partials(self.layout.pre_partial(root), &seed)?;

        let operations: Vec<Operation> = tree
            .pre_order_iter()
            .filter_map(|vertex| {
                let node = vertex.index();
                let parent = tree.parent(node)?;
                let sibling = tree.sibling(node)?;
                Some(Operation {
                    dest_partial: self.layout.pre_partial(node),
                    dest_scale_write: None,
                    dest_scale_read: None,
                    src_partial_1: self.layout.pre_partial(parent),
                    src_matrix_1: self.indices.matrices.current(node),
                    src_partial_2: self.indices.partials.current(sibling),
                    src_matrix_2: self.indices.matrices.current(sibling),
                })
            })
            .collect();
        self.backend
            .update_pre_partials(&operations, self.scaling)
            .map_err(|e| e.with_context("propagating preorder partials"))?;

        let rates = self.site_rates.rates().to_vec();
        for &node in &nodes {
            let first = hook.first_order(tree, branches, node)?;
            self.backend.set_transition_matrix(self.layout.first_differential(node), &per_category(&first, &rates, 1))?;
            if second_order {
                let second = hook.second_order(tree, branches, node)?;
                self.backend
                    .set_transition_matrix(self.layout.second_differential(node), &per_category(&second, &rates, 2))?;
            }
        }

        let post: Vec<usize> = nodes.iter().map(|&n| self.indices.partials.current(n)).collect();
        let pre: Vec<usize> = nodes.iter().map(|&n| self.layout.pre_partial(n)).collect();
        let first_slots: Vec<usize> = nodes.iter().map(|&n| self.layout.first_differential(n)).collect();
        let first = self
            .backend
            .calculate_edge_differentials(&post, &pre, &first_slots, WEIGHT_SLOT, second_order)
            .map_err(|e| e.with_context("contracting first-order differentials"))?;

        let hessian = if second_order {
            let second_slots: Vec<usize> = nodes.iter().map(|&n| self.layout.second_differential(n)).collect();
            let raw = self
                .backend
                .calculate_edge_differentials(&post, &pre, &second_slots, WEIGHT_SLOT, false)
                .map_err(|e| e.with_context("contracting second-order differentials"))?;
            let squared = first
                .squared
                .ok_or_else(|| LikelihoodError::compute_backend("backend returned no squared first-order terms"))?;
            Some(raw.first.iter().zip(&squared).map(|(r, s)| r - s).collect())
        } else {
            None
        };

        self.statistics.preorder_operations += operations.len() as u64;
        debug!(
            "Computed {:?} differentials of {} branches with {} preorder operations",
            order,
            nodes.len(),
            operations.len()
        );
        self.differentials = Some(Differentials { generation: self.generation, nodes, gradient: first.first, hessian });
        Ok(())
    }

    /// Returns the gradient, indexed like [`differential_nodes`](Self::differential_nodes).
    ///
    /// # Errors
    /// Returns `StaleCache` if no differentials were computed since the last change.
    pub fn gradient(&self) -> Result<&[f64], LikelihoodError> {
        Ok(&self.current_differentials()?.gradient)
    }

    /// Returns the Hessian diagonal, indexed like [`differential_nodes`](Self::differential_nodes).
    ///
    /// # Errors
    /// Returns `StaleCache` if no second-order differentials were computed since the last change.
    pub fn hessian_diagonal(&self) -> Result<&[f64], LikelihoodError> {
        self.current_differentials()?
            .hessian
            .as_deref()
            .ok_or_else(|| LikelihoodError::stale_cache().with_context("reading a Hessian computed with first order only"))
    }

    /// Returns the nodes whose branches the differentials refer to: every
    /// non-root node in increasing order. Empty before the first computation.
    pub fn differential_nodes(&self) -> &[NodeIndex] {
        self.differentials.as_ref().map(|d| d.nodes.as_slice()).unwrap_or(&[])
    }

    fn current_differentials(&self) -> Result<&Differentials, LikelihoodError> {
        match &self.differentials {
            Some(d) if d.generation == self.generation => Ok(d),
            _ => Err(LikelihoodError::stale_cache()),
        }
    }
}

/// `D` scaled by `r_c^power` for every category, flattened as (category, from, to).
fn per_category(d: &Array2<f64>, rates: &[f64], power: i32) -> Vec<f64> {
    rates
        .iter()
        .flat_map(|rate| {
            let factor = rate.powi(power);
            d.iter().map(move |x| x * factor)
        })
        .collect()
}
