//! Compute backend contract for likelihood arithmetic.
//!
//! The likelihood engine never touches partial or matrix data itself. It
//! refers to backend-owned buffers by slot index and asks a [ComputeBackend]
//! to fill and contract them:
//!
//! * **Partials** - arrays over (pattern × category × state), one per slot.
//!   Tip slots may instead hold compact state vectors.
//! * **Transition matrices** - arrays over (category × state × state), filled
//!   from a substitution model and branch lengths, or set directly.
//! * **Scale buffers** - per-pattern log scale factors written by rescaled
//!   partial updates and accumulated into a cumulative slot.
//! * **Weight/frequency slots** - category weights and state frequencies used
//!   by the final contractions.
//!
//! [CpuBackend] is the reference implementation.

pub mod cpu;

pub use cpu::CpuBackend;

use crate::error::LikelihoodError;
use crate::substitution::SubstitutionModel;
use std::fmt;
use std::ops::BitOr;

// =#========================================================================#=
// FLAGS
// =#========================================================================#=
/// Set of capability flags, used both as preferences and as requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceFlags(u64);

impl ResourceFlags {
    /// No flags.
    pub const NONE: ResourceFlags = ResourceFlags(0);
    /// Double precision arithmetic.
    pub const PRECISION_DOUBLE: ResourceFlags = ResourceFlags(1 << 0);
    /// Single precision arithmetic.
    pub const PRECISION_SINGLE: ResourceFlags = ResourceFlags(1 << 1);
    /// Blocking calls.
    pub const COMPUTATION_SYNCH: ResourceFlags = ResourceFlags(1 << 2);
    /// Non-blocking calls.
    pub const COMPUTATION_ASYNCH: ResourceFlags = ResourceFlags(1 << 3);
    /// Rescaling requested by the caller per operation.
    pub const SCALING_MANUAL: ResourceFlags = ResourceFlags(1 << 4);
    /// Rescaling decided by the backend.
    pub const SCALING_AUTO: ResourceFlags = ResourceFlags(1 << 5);
    /// Runs on the host CPU.
    pub const PROCESSOR_CPU: ResourceFlags = ResourceFlags(1 << 6);
    /// Runs on a GPU.
    pub const PROCESSOR_GPU: ResourceFlags = ResourceFlags(1 << 7);
    /// Single-threaded.
    pub const THREADING_NONE: ResourceFlags = ResourceFlags(1 << 8);
    /// Multi-threaded.
    pub const THREADING_THREADS: ResourceFlags = ResourceFlags(1 << 9);

    /// Returns the raw bits.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Returns whether every flag of `other` is set in `self`.
    pub fn contains(self, other: ResourceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the flags of `self` not set in `other`.
    pub fn difference(self, other: ResourceFlags) -> ResourceFlags {
        ResourceFlags(self.0 & !other.0)
    }

    /// Returns whether no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ResourceFlags {
    type Output = ResourceFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ResourceFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for ResourceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ResourceFlags, &str); 10] = [
            (ResourceFlags::PRECISION_DOUBLE, "PRECISION_DOUBLE"),
            (ResourceFlags::PRECISION_SINGLE, "PRECISION_SINGLE"),
            (ResourceFlags::COMPUTATION_SYNCH, "COMPUTATION_SYNCH"),
            (ResourceFlags::COMPUTATION_ASYNCH, "COMPUTATION_ASYNCH"),
            (ResourceFlags::SCALING_MANUAL, "SCALING_MANUAL"),
            (ResourceFlags::SCALING_AUTO, "SCALING_AUTO"),
            (ResourceFlags::PROCESSOR_CPU, "PROCESSOR_CPU"),
            (ResourceFlags::PROCESSOR_GPU, "PROCESSOR_GPU"),
            (ResourceFlags::THREADING_NONE, "THREADING_NONE"),
            (ResourceFlags::THREADING_THREADS, "THREADING_THREADS"),
        ];
        let names: Vec<&str> = NAMES.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, n)| *n).collect();
        if names.is_empty() { write!(f, "NONE") } else { write!(f, "{}", names.join(" | ")) }
    }
}

/// Whether partial updates rescale their output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    /// Partials are stored as computed.
    #[default]
    Never,
    /// Every recomputed partial is divided, per pattern, by its largest entry;
    /// the log of that factor goes to the operation's scale slot.
    Always,
}

// =#========================================================================#=
// CONFIGURATION
// =#========================================================================#=
/// Sizes and flags a backend instance is created with.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Number of tips (compact tip slots are `0..tip_count`)
    pub tip_count: usize,
    /// Number of partial slots
    pub partial_buffer_count: usize,
    /// Number of slots that may hold compact tip states
    pub compact_buffer_count: usize,
    /// Number of states
    pub state_count: usize,
    /// Number of site patterns
    pub pattern_count: usize,
    /// Number of category weight and state frequency slots
    pub eigen_buffer_count: usize,
    /// Number of transition matrix slots
    pub matrix_buffer_count: usize,
    /// Number of rate categories
    pub category_count: usize,
    /// Number of scale buffers
    pub scale_buffer_count: usize,
    /// Resources (devices) to choose from; empty means any
    pub resources: Vec<usize>,
    /// Flags the backend should honour if it can
    pub preference_flags: ResourceFlags,
    /// Flags the backend must honour
    pub requirement_flags: ResourceFlags,
}

impl BackendConfig {
    /// Creates a configuration with no buffers and no flags.
    pub fn new(tip_count: usize, state_count: usize, pattern_count: usize, category_count: usize) -> Self {
        Self {
            tip_count,
            partial_buffer_count: 0,
            compact_buffer_count: tip_count,
            state_count,
            pattern_count,
            eigen_buffer_count: 1,
            matrix_buffer_count: 0,
            category_count,
            scale_buffer_count: 0,
            resources: Vec::new(),
            preference_flags: ResourceFlags::NONE,
            requirement_flags: ResourceFlags::NONE,
        }
    }

    /// Sets the number of partial, matrix and scale slots.
    pub fn with_buffers(mut self, partials: usize, matrices: usize, scales: usize) -> Self {
        self.partial_buffer_count = partials;
        self.matrix_buffer_count = matrices;
        self.scale_buffer_count = scales;
        self
    }

    /// Sets the resources to choose from.
    pub fn with_resources(mut self, resources: Vec<usize>) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the preference flags.
    pub fn with_preference_flags(mut self, flags: ResourceFlags) -> Self {
        self.preference_flags = flags;
        self
    }

    /// Sets the requirement flags.
    pub fn with_requirement_flags(mut self, flags: ResourceFlags) -> Self {
        self.requirement_flags = flags;
        self
    }
}

// =#========================================================================#=
// OPERATIONS & RESULTS
// =#========================================================================#=
/// One partial update: `dest = (mat1 · src1) ∘ (mat2 · src2)` for postorder
/// operations, and the corresponding backward form for preorder operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    /// Partial slot written
    pub dest_partial: usize,
    /// Scale slot receiving this operation's log scale factors
    pub dest_scale_write: Option<usize>,
    /// Scale slot holding factors previously written for `dest_partial`
    pub dest_scale_read: Option<usize>,
    /// First source partial (or tip) slot
    pub src_partial_1: usize,
    /// Matrix applied to the first source
    pub src_matrix_1: usize,
    /// Second source partial (or tip) slot
    pub src_partial_2: usize,
    /// Matrix applied to the second source
    pub src_matrix_2: usize,
}

/// Result of an edge log-likelihood contraction, one entry per edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeLogLikelihoods {
    /// Log-likelihood per edge, summed over weighted patterns
    pub log_likelihoods: Vec<f64>,
    /// First derivative of the log-likelihood per edge, if requested
    pub first: Option<Vec<f64>>,
    /// Second derivative of the log-likelihood per edge, if requested
    pub second: Option<Vec<f64>>,
}

/// Result of an edge differential contraction, one entry per edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDifferentials {
    /// Weighted sum over patterns of `numerator / site likelihood`
    pub first: Vec<f64>,
    /// Weighted sum over patterns of `(numerator / site likelihood)²`, if requested
    pub squared: Option<Vec<f64>>,
}

// =#========================================================================#=
// COMPUTE BACKEND
// =#========================================================================#=
/// Backend owning all numeric buffers and performing likelihood arithmetic.
///
/// All methods are blocking. Slot indices outside the configured ranges and
/// shape mismatches are reported as `ComputeBackend` errors.
pub trait ComputeBackend: Sized {
    /// Creates a backend instance.
    ///
    /// # Errors
    /// Returns `Configuration` if no resource satisfies the requirement flags
    /// or a listed resource does not exist.
    fn configure(config: &BackendConfig) -> Result<Self, LikelihoodError>;

    /// Returns the flags the created instance actually runs with.
    fn flags(&self) -> ResourceFlags;

    /// Sets the rate multiplier of every category.
    fn set_category_rates(&mut self, rates: &[f64]) -> Result<(), LikelihoodError>;

    /// Sets category weights in weight slot `slot`.
    fn set_category_weights(&mut self, slot: usize, weights: &[f64]) -> Result<(), LikelihoodError>;

    /// Sets state frequencies in frequency slot `slot`.
    fn set_state_frequencies(&mut self, slot: usize, frequencies: &[f64]) -> Result<(), LikelihoodError>;

    /// Sets the weight of every pattern.
    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), LikelihoodError>;

    /// Sets compact states of tip `tip`, one per pattern, in `0..=state_count`;
    /// `state_count` marks an ambiguous observation.
    fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<(), LikelihoodError>;

    /// Sets the partial in `slot`, flattened in (pattern, category, state) order.
    fn set_partials(&mut self, slot: usize, partials: &[f64]) -> Result<(), LikelihoodError>;

    /// Returns the partial in `slot`, flattened in (pattern, category, state)
    /// order; compact tip states are expanded.
    fn get_partials(&self, slot: usize) -> Result<Vec<f64>, LikelihoodError>;

    /// Sets the matrix in `slot`, flattened in (category, from, to) order.
    fn set_transition_matrix(&mut self, slot: usize, matrix: &[f64]) -> Result<(), LikelihoodError>;

    /// Fills `matrix_slots[i]` with the transition matrix of `model` over
    /// `branch_lengths[i]` scaled by each category rate, and optionally its
    /// first and second derivatives with respect to the branch length.
    ///
    /// # Errors
    /// Returns `InvalidBranchLength` on a negative or non-finite length.
    fn update_transition_matrices(
        &mut self,
        model: &dyn SubstitutionModel,
        matrix_slots: &[usize],
        first_derivative_slots: Option<&[usize]>,
        second_derivative_slots: Option<&[usize]>,
        branch_lengths: &[f64],
    ) -> Result<(), LikelihoodError>;

    /// Executes postorder operations in the given order.
    fn update_partials(&mut self, operations: &[Operation], scaling: ScalingMode) -> Result<(), LikelihoodError>;

    /// Executes preorder operations in the given order: `src_partial_1` is the
    /// parent's preorder partial, `src_matrix_1` the destination's own branch
    /// matrix, `src_partial_2`/`src_matrix_2` the sibling's postorder partial
    /// and branch matrix.
    fn update_pre_partials(&mut self, operations: &[Operation], scaling: ScalingMode)
    -> Result<(), LikelihoodError>;

    /// Sets all factors in scale slot `slot` to zero.
    fn reset_scale_factors(&mut self, slot: usize) -> Result<(), LikelihoodError>;

    /// Adds the factors of `slots` to scale slot `cumulative`.
    fn accumulate_scale_factors(&mut self, slots: &[usize], cumulative: usize) -> Result<(), LikelihoodError>;

    /// Contracts the root partial with category weights and state
    /// frequencies into the weighted sum of per-pattern log-likelihoods.
    fn calculate_root_log_likelihoods(
        &mut self,
        root_slot: usize,
        weight_slot: usize,
        frequency_slot: usize,
        cumulative_scale: Option<usize>,
    ) -> Result<f64, LikelihoodError>;

    /// Contracts each edge `parent -- matrix -- child` into a log-likelihood,
    /// and optionally its first and second derivatives using derivative
    /// matrices in place of the transition matrix.
    #[allow(clippy::too_many_arguments)]
    fn calculate_edge_log_likelihoods(
        &mut self,
        parents: &[usize],
        children: &[usize],
        matrices: &[usize],
        first_derivative_matrices: Option<&[usize]>,
        second_derivative_matrices: Option<&[usize]>,
        weight_slot: usize,
        frequency_slot: usize,
        cumulative_scale: Option<usize>,
    ) -> Result<EdgeLogLikelihoods, LikelihoodError>;

    /// Contracts, per edge, the postorder partial `post[i]` and preorder
    /// partial `pre[i]` through differential matrix `differentials[i]`:
    /// per pattern, `Σ_c w_c pre·(D_c post) / Σ_c w_c pre·post`.
    ///
    /// Per-pattern scaling of either partial cancels in the ratio.
    fn calculate_edge_differentials(
        &mut self,
        post: &[usize],
        pre: &[usize],
        differentials: &[usize],
        weight_slot: usize,
        want_squared: bool,
    ) -> Result<EdgeDifferentials, LikelihoodError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = ResourceFlags::PROCESSOR_CPU | ResourceFlags::PRECISION_DOUBLE;
        assert!(flags.contains(ResourceFlags::PROCESSOR_CPU));
        assert!(!flags.contains(ResourceFlags::PROCESSOR_GPU | ResourceFlags::PROCESSOR_CPU));
        assert_eq!(flags.difference(ResourceFlags::PROCESSOR_CPU), ResourceFlags::PRECISION_DOUBLE);
        assert_eq!(flags.to_string(), "PRECISION_DOUBLE | PROCESSOR_CPU");
        assert_eq!(ResourceFlags::NONE.to_string(), "NONE");
    }
}
