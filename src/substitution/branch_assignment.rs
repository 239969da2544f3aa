//! Association of every branch with a substitution model and a rate multiplier.
//!
//! A branch is identified by its child node. [ModelDispatch] decides which
//! model instance applies on a branch, [BranchRates] scales the branch time
//! (parent height minus child height) into a branch length.

use crate::error::LikelihoodError;
use crate::model::{NodeIndex, TimeTree};
use crate::substitution::SubstitutionModel;
use std::fmt;

/// Function mapping a branch (child node) to the index of its model.
pub type AssignFn = Box<dyn Fn(NodeIndex) -> usize>;

// =#========================================================================#=
// MODEL DISPATCH
// =#========================================================================#=
/// Which substitution model applies on which branch.
pub enum ModelDispatch<M> {
    /// One model on every branch.
    Homogeneous(M),
    /// Several models; `assign` maps each branch to an index into `models`.
    Indexed {
        /// Model instances
        models: Vec<M>,
        /// Index function from node to model
        assign: AssignFn,
    },
}

impl<M> ModelDispatch<M> {
    /// One model on every branch.
    pub fn homogeneous(model: M) -> Self {
        ModelDispatch::Homogeneous(model)
    }

    /// Several models with an index function from node to model.
    pub fn indexed<F>(models: Vec<M>, assign: F) -> Self
    where
        F: Fn(NodeIndex) -> usize + 'static,
    {
        ModelDispatch::Indexed { models, assign: Box::new(assign) }
    }

    /// Several models with an explicit per-node table of model indices.
    ///
    /// # Errors
    /// Returns `InvalidData` if the table names a model that does not exist.
    pub fn from_table(models: Vec<M>, table: Vec<usize>) -> Result<Self, LikelihoodError> {
        if let Some(bad) = table.iter().find(|&&k| k >= models.len()) {
            return Err(LikelihoodError::invalid_data(format!(
                "model index {bad} out of range for {} models",
                models.len()
            )));
        }
        Ok(Self::indexed(models, move |node| table.get(node).copied().unwrap_or(0)))
    }

    /// Returns the number of model instances.
    pub fn model_count(&self) -> usize {
        match self {
            ModelDispatch::Homogeneous(_) => 1,
            ModelDispatch::Indexed { models, .. } => models.len(),
        }
    }

    /// Returns the index of the model on the branch above `node`.
    pub fn model_index(&self, node: NodeIndex) -> usize {
        match self {
            ModelDispatch::Homogeneous(_) => 0,
            ModelDispatch::Indexed { assign, .. } => assign(node),
        }
    }

    /// Returns the model with index `k`, if any.
    pub fn model(&self, k: usize) -> Option<&M> {
        match self {
            ModelDispatch::Homogeneous(model) => (k == 0).then_some(model),
            ModelDispatch::Indexed { models, .. } => models.get(k),
        }
    }

    /// Returns a mutable reference to the model with index `k`, if any.
    pub fn model_mut(&mut self, k: usize) -> Option<&mut M> {
        match self {
            ModelDispatch::Homogeneous(model) => (k == 0).then_some(model),
            ModelDispatch::Indexed { models, .. } => models.get_mut(k),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for ModelDispatch<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelDispatch::Homogeneous(model) => f.debug_tuple("Homogeneous").field(model).finish(),
            ModelDispatch::Indexed { models, .. } => {
                f.debug_struct("Indexed").field("models", models).finish_non_exhaustive()
            }
        }
    }
}

// =#========================================================================#=
// BRANCH RATES
// =#========================================================================#=
/// Rate multipliers turning branch times into branch lengths.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchRates {
    /// Same rate on every branch (strict clock).
    Strict(f64),
    /// One rate per node, indexed by node; the root entry is unused.
    PerBranch(Vec<f64>),
}

impl BranchRates {
    /// Returns the rate multiplier on the branch above `node`.
    ///
    /// # Errors
    /// Returns `InvalidData` if per-branch rates have no entry for `node`.
    pub fn rate(&self, node: NodeIndex) -> Result<f64, LikelihoodError> {
        match self {
            BranchRates::Strict(rate) => Ok(*rate),
            BranchRates::PerBranch(rates) => rates.get(node).copied().ok_or_else(|| missing_rate(node, rates.len())),
        }
    }

    /// Sets the rate multiplier on the branch above `node`.
    ///
    /// A strict clock is turned into per-branch rates on first use, sized for
    /// `node_count` nodes.
    ///
    /// # Errors
    /// Returns `InvalidData` if per-branch rates have no entry for `node`;
    /// the rates are left unchanged.
    pub fn set_rate(&mut self, node: NodeIndex, rate: f64, node_count: usize) -> Result<(), LikelihoodError> {
        if let BranchRates::Strict(strict) = *self {
            if node >= node_count {
                return Err(missing_rate(node, node_count));
            }
            *self = BranchRates::PerBranch(vec![strict; node_count]);
        }
        if let BranchRates::PerBranch(rates) = self {
            let len = rates.len();
            *rates.get_mut(node).ok_or_else(|| missing_rate(node, len))? = rate;
        }
        Ok(())
    }
}

fn missing_rate(node: NodeIndex, len: usize) -> LikelihoodError {
    LikelihoodError::invalid_data(format!("no branch rate for node {node}, rates cover {len} nodes"))
}

// =#========================================================================#=
// BRANCH ASSIGNMENT
// =#========================================================================#=
/// Substitution model and rate multiplier of every branch.
///
/// Several branches may share one model instance. The model applying at the
/// root (model of the root node's index) provides the root frequencies.
#[derive(Debug)]
pub struct BranchAssignment<M> {
    dispatch: ModelDispatch<M>,
    rates: BranchRates,
}

impl<M: SubstitutionModel> BranchAssignment<M> {
    /// Creates an assignment from a dispatch and branch rates.
    pub fn new(dispatch: ModelDispatch<M>, rates: BranchRates) -> Self {
        Self { dispatch, rates }
    }

    /// One model on every branch, strict clock with rate one.
    pub fn homogeneous(model: M) -> Self {
        Self::new(ModelDispatch::homogeneous(model), BranchRates::Strict(1.0))
    }

    /// Returns the dispatch.
    pub fn dispatch(&self) -> &ModelDispatch<M> {
        &self.dispatch
    }

    /// Returns the dispatch mutably, e.g. to change model parameters.
    pub fn dispatch_mut(&mut self) -> &mut ModelDispatch<M> {
        &mut self.dispatch
    }

    /// Returns the branch rates.
    pub fn rates(&self) -> &BranchRates {
        &self.rates
    }

    /// Returns the branch rates mutably.
    pub fn rates_mut(&mut self) -> &mut BranchRates {
        &mut self.rates
    }

    /// Returns the model on the branch above `node`.
    ///
    /// # Errors
    /// Returns `Configuration` if the index function names a missing model.
    pub fn model_for(&self, node: NodeIndex) -> Result<&M, LikelihoodError> {
        let k = self.dispatch.model_index(node);
        self.dispatch.model(k).ok_or_else(|| {
            LikelihoodError::configuration(format!("branch above node {node} assigned to missing model {k}"))
        })
    }

    /// Returns the branch length above `node`: rate times branch time.
    ///
    /// # Errors
    /// Returns `InvalidBranchLength` if the length is negative or not finite,
    /// and `InvalidTree` for the root.
    pub fn branch_length(&self, tree: &TimeTree, node: NodeIndex) -> Result<f64, LikelihoodError> {
        let time = tree
            .branch_time(node)
            .ok_or_else(|| LikelihoodError::invalid_tree(format!("node {node} has no branch")))?;
        let length = self.rates.rate(node)? * time;
        if !length.is_finite() || length < 0.0 {
            return Err(LikelihoodError::invalid_branch_length(node, length));
        }
        Ok(length)
    }

    /// Returns the state frequencies at the root.
    pub fn root_frequencies(&self, tree: &TimeTree) -> Result<&[f64], LikelihoodError> {
        self.model_for(tree.root_index()).map(|m| m.frequencies())
    }

    /// Returns the nodes whose branch uses model `k`, in increasing node order.
    pub fn branches_of_model(&self, tree: &TimeTree, k: usize) -> Vec<NodeIndex> {
        (0..tree.num_vertices())
            .filter(|&n| tree.parent(n).is_some() && self.dispatch.model_index(n) == k)
            .collect()
    }
}
