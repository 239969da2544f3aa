//! Substitution models and the assignment of models to branches.
//!
//! A [SubstitutionModel] describes a continuous-time Markov chain over
//! `state_count` states through its generator `Q` and equilibrium
//! frequencies. The compute backend asks it for transition matrices
//! `P(t) = exp(Qt)` and their derivatives in `t`.
//!
//! # Provided models
//! - [SymmetricModel] - n states, all substitutions at equal rate
//! - [GainLossModel] - two states with separate gain and loss rates
//!
//! Which model and rate multiplier applies on each branch is decided by a
//! [BranchAssignment]. Across-site rate heterogeneity is described by
//! [SiteRates].

pub mod branch_assignment;
pub mod gain_loss;
pub mod site_rates;
pub mod symmetric;

pub use branch_assignment::{BranchAssignment, BranchRates, ModelDispatch};
pub use gain_loss::GainLossModel;
pub use site_rates::SiteRates;
pub use symmetric::SymmetricModel;

use ndarray::Array2;

// =#========================================================================#=
// SUBSTITUTION MODEL
// =#========================================================================#=
/// Continuous-time Markov model of character substitution.
pub trait SubstitutionModel {
    /// Number of states of the chain.
    fn state_count(&self) -> usize;

    /// Equilibrium state frequencies, used at the root.
    fn frequencies(&self) -> &[f64];

    /// Generator matrix `Q`, rows summing to zero.
    fn generator(&self) -> Array2<f64>;

    /// Transition probabilities `P(t) = exp(Qt)`, indexed `[from, to]`.
    fn transition_matrix(&self, distance: f64) -> Array2<f64>;

    /// First and second derivative of `P(t)` with respect to `t`,
    /// that is `Q·P(t)` and `Q·Q·P(t)`.
    fn transition_derivatives(&self, distance: f64) -> (Array2<f64>, Array2<f64>) {
        let q = self.generator();
        let first = q.dot(&self.transition_matrix(distance));
        let second = q.dot(&first);
        (first, second)
    }
}

impl<M: SubstitutionModel + ?Sized> SubstitutionModel for Box<M> {
    fn state_count(&self) -> usize {
        (**self).state_count()
    }

    fn frequencies(&self) -> &[f64] {
        (**self).frequencies()
    }

    fn generator(&self) -> Array2<f64> {
        (**self).generator()
    }

    fn transition_matrix(&self, distance: f64) -> Array2<f64> {
        (**self).transition_matrix(distance)
    }

    fn transition_derivatives(&self, distance: f64) -> (Array2<f64>, Array2<f64>) {
        (**self).transition_derivatives(distance)
    }
}
