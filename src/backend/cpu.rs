//! Reference compute backend on the host CPU, built on `ndarray` buffers.

use crate::backend::{
    BackendConfig, ComputeBackend, EdgeDifferentials, EdgeLogLikelihoods, Operation, ResourceFlags, ScalingMode,
};
use crate::error::LikelihoodError;
use crate::substitution::SubstitutionModel;
use log::{debug, info};
use ndarray::{Array1, Array2, Array3, ArrayView2, s};
use std::borrow::Cow;

/// Everything the CPU backend can do.
const SUPPORTED_FLAGS: ResourceFlags = ResourceFlags(
    ResourceFlags::PROCESSOR_CPU.0
        | ResourceFlags::PRECISION_DOUBLE.0
        | ResourceFlags::COMPUTATION_SYNCH.0
        | ResourceFlags::SCALING_MANUAL.0
        | ResourceFlags::THREADING_NONE.0,
);

/// The only resource (device) this backend offers.
const CPU_RESOURCE: usize = 0;

// =#========================================================================#=
// CPU BACKEND
// =#========================================================================#=
/// Single-threaded, double precision implementation of [ComputeBackend].
///
/// Partials are stored as (pattern, category, state) arrays, matrices as
/// (category, from, to) arrays. Tip slots holding compact states are expanded
/// on the fly.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    config: BackendConfig,
    category_rates: Vec<f64>,
    category_weights: Vec<Vec<f64>>,
    frequencies: Vec<Vec<f64>>,
    pattern_weights: Vec<f64>,
    tip_states: Vec<Option<Vec<usize>>>,
    partials: Vec<Array3<f64>>,
    matrices: Vec<Array3<f64>>,
    scale_factors: Vec<Vec<f64>>,
}

impl CpuBackend {
    fn dims(&self) -> (usize, usize, usize) {
        (self.config.pattern_count, self.config.category_count, self.config.state_count)
    }

    /// Compact states of the tip in `slot`, if the slot holds any.
    fn compact_states(&self, slot: usize) -> Option<&[usize]> {
        self.tip_states.get(slot).and_then(|s| s.as_deref())
    }

    /// The partial in `slot`, expanding compact tip states.
    fn expanded(&self, slot: usize) -> Result<Cow<'_, Array3<f64>>, LikelihoodError> {
        check_slot("partial", slot, self.partials.len())?;
        Ok(match self.compact_states(slot) {
            None => Cow::Borrowed(&self.partials[slot]),
            Some(states) => {
                let (p, c, n) = self.dims();
                Cow::Owned(Array3::from_shape_fn((p, c, n), |(pattern, _, s)| {
                    let state = states[pattern];
                    if state == n || state == s { 1.0 } else { 0.0 }
                }))
            }
        })
    }

    /// `out[p, c, s] = Σ_j M[c, s, j] · child[p, c, j]`
    fn contribution(&self, child: usize, matrix: usize) -> Result<Array3<f64>, LikelihoodError> {
        check_slot("matrix", matrix, self.matrices.len())?;
        check_slot("partial", child, self.partials.len())?;
        let (p, c, n) = self.dims();
        let m = &self.matrices[matrix];

        if let Some(states) = self.compact_states(child) {
            return Ok(Array3::from_shape_fn((p, c, n), |(pattern, category, s)| {
                let state = states[pattern];
                if state == n { m.slice(s![category, s, ..]).sum() } else { m[[category, s, state]] }
            }));
        }

        let partial = &self.partials[child];
        let mut out = Array3::zeros((p, c, n));
        for pattern in 0..p {
            for category in 0..c {
                let row = m.slice(s![category, .., ..]).dot(&partial.slice(s![pattern, category, ..]));
                out.slice_mut(s![pattern, category, ..]).assign(&row);
            }
        }
        Ok(out)
    }

    /// Divides each pattern by its largest entry and returns the log factors.
    fn rescale(partial: &mut Array3<f64>) -> Vec<f64> {
        let mut factors = Vec::with_capacity(partial.shape()[0]);
        for mut pattern in partial.outer_iter_mut() {
            let max = pattern.iter().cloned().fold(0.0, f64::max);
            if max > 0.0 {
                pattern.mapv_inplace(|x| x / max);
                factors.push(max.ln());
            } else {
                factors.push(0.0);
            }
        }
        factors
    }

    fn store_partial(
        &mut self,
        dest: usize,
        mut partial: Array3<f64>,
        operation: &Operation,
        scaling: ScalingMode,
    ) -> Result<(), LikelihoodError> {
        if scaling == ScalingMode::Always {
            let factors = Self::rescale(&mut partial);
            if let Some(scale) = operation.dest_scale_write {
                check_slot("scale", scale, self.scale_factors.len())?;
                self.scale_factors[scale] = factors;
            }
        }
        if let Some(states) = self.tip_states.get_mut(dest) {
            *states = None;
        }
        self.partials[dest] = partial;
        Ok(())
    }

    fn weights(&self, slot: usize) -> Result<&[f64], LikelihoodError> {
        check_slot("category weight", slot, self.category_weights.len())?;
        Ok(&self.category_weights[slot])
    }

    fn state_frequencies(&self, slot: usize) -> Result<&[f64], LikelihoodError> {
        check_slot("state frequency", slot, self.frequencies.len())?;
        Ok(&self.frequencies[slot])
    }

    fn cumulative(&self, slot: Option<usize>) -> Result<Option<&[f64]>, LikelihoodError> {
        match slot {
            None => Ok(None),
            Some(slot) => {
                check_slot("scale", slot, self.scale_factors.len())?;
                Ok(Some(&self.scale_factors[slot]))
            }
        }
    }

    /// Per-pattern `Σ_c w_c Σ_s π_s a[p, c, s] b[p, c, s]`.
    fn site_sums(a: &Array3<f64>, b: &Array3<f64>, weights: &[f64], frequencies: Option<&[f64]>) -> Array1<f64> {
        let (p, c, n) = a.dim();
        Array1::from_shape_fn(p, |pattern| {
            let mut sum = 0.0;
            for category in 0..c {
                let mut inner = 0.0;
                for s in 0..n {
                    let pi = frequencies.map_or(1.0, |f| f[s]);
                    inner += pi * a[[pattern, category, s]] * b[[pattern, category, s]];
                }
                sum += weights[category] * inner;
            }
            sum
        })
    }

    fn write_matrix(&mut self, slot: usize, category: usize, matrix: ArrayView2<f64>) {
        self.matrices[slot].slice_mut(s![category, .., ..]).assign(&matrix);
    }
}

impl ComputeBackend for CpuBackend {
    fn configure(config: &BackendConfig) -> Result<Self, LikelihoodError> {
        if let Some(bad) = config.resources.iter().find(|&&r| r != CPU_RESOURCE) {
            return Err(LikelihoodError::configuration(format!("unknown resource {bad}, only CPU resource 0 exists")));
        }
        let missing = config.requirement_flags.difference(SUPPORTED_FLAGS);
        if !missing.is_empty() {
            return Err(LikelihoodError::configuration(format!("no resource supports required flags {missing}")));
        }
        if config.state_count < 2 || config.pattern_count == 0 || config.category_count == 0 {
            return Err(LikelihoodError::configuration(format!(
                "need at least 2 states, 1 pattern and 1 category, got {}, {} and {}",
                config.state_count, config.pattern_count, config.category_count
            )));
        }
        if config.compact_buffer_count > config.partial_buffer_count || config.eigen_buffer_count == 0 {
            return Err(LikelihoodError::configuration("inconsistent buffer counts"));
        }

        let unsupported = config.preference_flags.difference(SUPPORTED_FLAGS);
        if !unsupported.is_empty() {
            debug!("CPU backend ignores preferred flags {unsupported}");
        }
        info!(
            "Configured CPU backend (resource {CPU_RESOURCE}, flags {SUPPORTED_FLAGS}): {} partials, {} matrices, \
             {} scale buffers, {} patterns x {} categories x {} states",
            config.partial_buffer_count,
            config.matrix_buffer_count,
            config.scale_buffer_count,
            config.pattern_count,
            config.category_count,
            config.state_count
        );

        let (p, c, n) = (config.pattern_count, config.category_count, config.state_count);
        Ok(Self {
            config: config.clone(),
            category_rates: vec![1.0; c],
            category_weights: vec![vec![1.0 / c as f64; c]; config.eigen_buffer_count],
            frequencies: vec![vec![1.0 / n as f64; n]; config.eigen_buffer_count],
            pattern_weights: vec![1.0; p],
            tip_states: vec![None; config.compact_buffer_count],
            partials: vec![Array3::zeros((p, c, n)); config.partial_buffer_count],
            matrices: vec![Array3::zeros((c, n, n)); config.matrix_buffer_count],
            scale_factors: vec![vec![0.0; p]; config.scale_buffer_count],
        })
    }

    fn flags(&self) -> ResourceFlags {
        SUPPORTED_FLAGS
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<(), LikelihoodError> {
        check_len("category rates", rates.len(), self.config.category_count)?;
        self.category_rates = rates.to_vec();
        Ok(())
    }

    fn set_category_weights(&mut self, slot: usize, weights: &[f64]) -> Result<(), LikelihoodError> {
        check_slot("category weight", slot, self.category_weights.len())?;
        check_len("category weights", weights.len(), self.config.category_count)?;
        self.category_weights[slot] = weights.to_vec();
        Ok(())
    }

    fn set_state_frequencies(&mut self, slot: usize, frequencies: &[f64]) -> Result<(), LikelihoodError> {
        check_slot("state frequency", slot, self.frequencies.len())?;
        check_len("state frequencies", frequencies.len(), self.config.state_count)?;
        self.frequencies[slot] = frequencies.to_vec();
        Ok(())
    }

    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), LikelihoodError> {
        check_len("pattern weights", weights.len(), self.config.pattern_count)?;
        self.pattern_weights = weights.to_vec();
        Ok(())
    }

    fn set_tip_states(&mut self, tip: usize, states: &[usize]) -> Result<(), LikelihoodError> {
        check_slot("compact tip", tip, self.tip_states.len())?;
        check_len("tip states", states.len(), self.config.pattern_count)?;
        if let Some(bad) = states.iter().find(|&&s| s > self.config.state_count) {
            return Err(LikelihoodError::compute_backend(format!("tip state {bad} out of range")));
        }
        self.tip_states[tip] = Some(states.to_vec());
        Ok(())
    }

    fn set_partials(&mut self, slot: usize, partials: &[f64]) -> Result<(), LikelihoodError> {
        check_slot("partial", slot, self.partials.len())?;
        let array = Array3::from_shape_vec(self.dims(), partials.to_vec())
            .map_err(|e| LikelihoodError::compute_backend(format!("partials of wrong shape: {e}")))?;
        if let Some(states) = self.tip_states.get_mut(slot) {
            *states = None;
        }
        self.partials[slot] = array;
        Ok(())
    }

    fn get_partials(&self, slot: usize) -> Result<Vec<f64>, LikelihoodError> {
        Ok(self.expanded(slot)?.iter().copied().collect())
    }

    fn set_transition_matrix(&mut self, slot: usize, matrix: &[f64]) -> Result<(), LikelihoodError> {
        check_slot("matrix", slot, self.matrices.len())?;
        let (_, c, n) = self.dims();
        self.matrices[slot] = Array3::from_shape_vec((c, n, n), matrix.to_vec())
            .map_err(|e| LikelihoodError::compute_backend(format!("matrix of wrong shape: {e}")))?;
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        model: &dyn SubstitutionModel,
        matrix_slots: &[usize],
        first_derivative_slots: Option<&[usize]>,
        second_derivative_slots: Option<&[usize]>,
        branch_lengths: &[f64],
    ) -> Result<(), LikelihoodError> {
        let count = matrix_slots.len();
        check_len("branch lengths", branch_lengths.len(), count)?;
        for slots in [first_derivative_slots, second_derivative_slots].into_iter().flatten() {
            check_len("derivative matrix slots", slots.len(), count)?;
        }
        let n = self.config.state_count;
        if model.state_count() != n {
            return Err(LikelihoodError::compute_backend(format!(
                "model has {} states, backend {n}",
                model.state_count()
            )));
        }

        for (i, (&slot, &length)) in matrix_slots.iter().zip(branch_lengths).enumerate() {
            if !length.is_finite() || length < 0.0 {
                return Err(LikelihoodError::invalid_branch_length(i, length)
                    .with_context(format!("updating matrix slot {slot} (entry {i} of batch)")));
            }
            check_slot("matrix", slot, self.matrices.len())?;
            let first = first_derivative_slots.map(|s| s[i]);
            let second = second_derivative_slots.map(|s| s[i]);
            for d in [first, second].into_iter().flatten() {
                check_slot("matrix", d, self.matrices.len())?;
            }

            for category in 0..self.config.category_count {
                let rate = self.category_rates[category];
                let distance = rate * length;
                let p: Array2<f64> = model.transition_matrix(distance);
                if p.dim() != (n, n) {
                    return Err(LikelihoodError::compute_backend("model returned matrix of wrong shape"));
                }
                self.write_matrix(slot, category, p.view());

                if first.is_some() || second.is_some() {
                    let (d1, d2) = model.transition_derivatives(distance);
                    if let Some(d) = first {
                        self.write_matrix(d, category, (d1 * rate).view());
                    }
                    if let Some(d) = second {
                        self.write_matrix(d, category, (d2 * (rate * rate)).view());
                    }
                }
            }
        }
        Ok(())
    }

    fn update_partials(&mut self, operations: &[Operation], scaling: ScalingMode) -> Result<(), LikelihoodError> {
        for op in operations {
            check_slot("partial", op.dest_partial, self.partials.len())?;
            let left = self.contribution(op.src_partial_1, op.src_matrix_1)?;
            let right = self.contribution(op.src_partial_2, op.src_matrix_2)?;
            self.store_partial(op.dest_partial, left * right, op, scaling)?;
        }
        Ok(())
    }

    fn update_pre_partials(
        &mut self,
        operations: &[Operation],
        scaling: ScalingMode,
    ) -> Result<(), LikelihoodError> {
        let (p, c, n) = self.dims();
        for op in operations {
            check_slot("partial", op.dest_partial, self.partials.len())?;
            check_slot("matrix", op.src_matrix_1, self.matrices.len())?;
            let sibling = self.contribution(op.src_partial_2, op.src_matrix_2)?;
            let above = self.expanded(op.src_partial_1)?.into_owned() * sibling;

            let m = &self.matrices[op.src_matrix_1];
            let mut out = Array3::zeros((p, c, n));
            for pattern in 0..p {
                for category in 0..c {
                    let row = m.slice(s![category, .., ..]).t().dot(&above.slice(s![pattern, category, ..]));
                    out.slice_mut(s![pattern, category, ..]).assign(&row);
                }
            }
            self.store_partial(op.dest_partial, out, op, scaling)?;
        }
        Ok(())
    }

    fn reset_scale_factors(&mut self, slot: usize) -> Result<(), LikelihoodError> {
        check_slot("scale", slot, self.scale_factors.len())?;
        self.scale_factors[slot].iter_mut().for_each(|x| *x = 0.0);
        Ok(())
    }

    fn accumulate_scale_factors(&mut self, slots: &[usize], cumulative: usize) -> Result<(), LikelihoodError> {
        check_slot("scale", cumulative, self.scale_factors.len())?;
        for &slot in slots {
            check_slot("scale", slot, self.scale_factors.len())?;
            for pattern in 0..self.config.pattern_count {
                let factor = self.scale_factors[slot][pattern];
                self.scale_factors[cumulative][pattern] += factor;
            }
        }
        Ok(())
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        root_slot: usize,
        weight_slot: usize,
        frequency_slot: usize,
        cumulative_scale: Option<usize>,
    ) -> Result<f64, LikelihoodError> {
        let root = self.expanded(root_slot)?;
        let ones = Array3::ones(root.dim());
        let sites = Self::site_sums(
            &root,
            &ones,
            self.weights(weight_slot)?,
            Some(self.state_frequencies(frequency_slot)?),
        );
        let scales = self.cumulative(cumulative_scale)?;
        let log_likelihood = weighted_log_sum(&sites, &self.pattern_weights, scales);
        if !log_likelihood.is_finite() {
            return Err(LikelihoodError::compute_backend(format!(
                "root log-likelihood is not finite ({log_likelihood})"
            )));
        }
        Ok(log_likelihood)
    }

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
    ) -> Result<EdgeLogLikelihoods, LikelihoodError> {
        let count = parents.len();
        check_len("edge children", children.len(), count)?;
        check_len("edge matrices", matrices.len(), count)?;
        for slots in [first_derivative_matrices, second_derivative_matrices].into_iter().flatten() {
            check_len("edge derivative matrices", slots.len(), count)?;
        }
        let weights = self.weights(weight_slot)?;
        let frequencies = self.state_frequencies(frequency_slot)?;
        let scales = self.cumulative(cumulative_scale)?;

        let mut result = EdgeLogLikelihoods {
            log_likelihoods: Vec::with_capacity(count),
            first: first_derivative_matrices.map(|_| Vec::with_capacity(count)),
            second: second_derivative_matrices.map(|_| Vec::with_capacity(count)),
        };

        for i in 0..count {
            let parent = self.expanded(parents[i])?;
            let sites = Self::site_sums(
                &parent,
                &self.contribution(children[i], matrices[i])?,
                weights,
                Some(frequencies),
            );
            let log_likelihood = weighted_log_sum(&sites, &self.pattern_weights, scales);
            if !log_likelihood.is_finite() {
                return Err(LikelihoodError::compute_backend(format!(
                    "edge log-likelihood is not finite ({log_likelihood})"
                )));
            }
            result.log_likelihoods.push(log_likelihood);

            let first_ratios = match first_derivative_matrices {
                Some(d1) => {
                    let d = Self::site_sums(&parent, &self.contribution(children[i], d1[i])?, weights, Some(frequencies));
                    Some(&d / &sites)
                }
                None => None,
            };
            if let (Some(ratios), Some(out)) = (&first_ratios, result.first.as_mut()) {
                out.push(ratios.iter().zip(&self.pattern_weights).map(|(r, w)| r * w).sum());
            }
            if let (Some(d2), Some(out)) = (second_derivative_matrices, result.second.as_mut()) {
                let d = Self::site_sums(&parent, &self.contribution(children[i], d2[i])?, weights, Some(frequencies));
                let mut second = &d / &sites;
                if let Some(ratios) = &first_ratios {
                    second -= &(ratios * ratios);
                }
                out.push(second.iter().zip(&self.pattern_weights).map(|(x, w)| x * w).sum());
            }
        }
        Ok(result)
    }

    fn calculate_edge_differentials(
        &mut self,
        post: &[usize],
        pre: &[usize],
        differentials: &[usize],
        weight_slot: usize,
        want_squared: bool,
    ) -> Result<EdgeDifferentials, LikelihoodError> {
        let count = post.len();
        check_len("edge preorder partials", pre.len(), count)?;
        check_len("edge differential matrices", differentials.len(), count)?;
        let weights = self.weights(weight_slot)?;

        let mut first = Vec::with_capacity(count);
        let mut squared = want_squared.then(|| Vec::with_capacity(count));
        for i in 0..count {
            let above = self.expanded(pre[i])?;
            let below = self.expanded(post[i])?;
            let denominator = Self::site_sums(&above, &below, weights, None);
            let numerator = Self::site_sums(&above, &self.contribution(post[i], differentials[i])?, weights, None);
            let ratios = &numerator / &denominator;
            if ratios.iter().any(|r| !r.is_finite()) {
                return Err(LikelihoodError::compute_backend(format!("edge differential {i} is not finite")));
            }

            first.push(ratios.iter().zip(&self.pattern_weights).map(|(r, w)| r * w).sum());
            if let Some(squared) = squared.as_mut() {
                squared.push(ratios.iter().zip(&self.pattern_weights).map(|(r, w)| r * r * w).sum());
            }
        }
        Ok(EdgeDifferentials { first, squared })
    }
}

/// `Σ_p w_p (ln site_p + scale_p)`
fn weighted_log_sum(sites: &Array1<f64>, pattern_weights: &[f64], scales: Option<&[f64]>) -> f64 {
    sites
        .iter()
        .enumerate()
        .map(|(p, site)| pattern_weights[p] * (site.ln() + scales.map_or(0.0, |s| s[p])))
        .sum()
}

fn check_slot(kind: &str, slot: usize, count: usize) -> Result<(), LikelihoodError> {
    if slot >= count {
        return Err(LikelihoodError::compute_backend(format!("{kind} slot {slot} out of range 0..{count}")));
    }
    Ok(())
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<(), LikelihoodError> {
    if got != expected {
        return Err(LikelihoodError::compute_backend(format!("expected {expected} {what}, got {got}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LikelihoodErrorType;
    use crate::substitution::SymmetricModel;
    use approx::assert_abs_diff_eq;

    /// Cherry (A:t, B:t) with tips in slots 0, 1 and root in slot 2.
    fn cherry_backend(patterns: usize) -> CpuBackend {
        let config = BackendConfig::new(2, 2, patterns, 1).with_buffers(3, 2, 2);
        CpuBackend::configure(&config).unwrap()
    }

    fn cherry_op(scale: Option<usize>) -> Operation {
        Operation {
            dest_partial: 2,
            dest_scale_write: scale,
            dest_scale_read: None,
            src_partial_1: 0,
            src_matrix_1: 0,
            src_partial_2: 1,
            src_matrix_2: 1,
        }
    }

    #[test]
    fn test_configure_rejects_unknown_resource() {
        let config = BackendConfig::new(2, 2, 1, 1).with_buffers(3, 2, 0).with_resources(vec![1]);
        let err = CpuBackend::configure(&config).unwrap_err();
        assert!(matches!(err.kind(), LikelihoodErrorType::Configuration(_)));
    }

    #[test]
    fn test_configure_rejects_gpu_requirement() {
        let config = BackendConfig::new(2, 2, 1, 1)
            .with_buffers(3, 2, 0)
            .with_requirement_flags(ResourceFlags::PROCESSOR_GPU);
        assert!(CpuBackend::configure(&config).is_err());

        let config = config.with_requirement_flags(ResourceFlags::PROCESSOR_CPU | ResourceFlags::SCALING_MANUAL);
        let backend = CpuBackend::configure(&config).unwrap();
        assert!(backend.flags().contains(ResourceFlags::PRECISION_DOUBLE));
    }

    #[test]
    fn test_cherry_likelihood() {
        let mut backend = cherry_backend(1);
        let model = SymmetricModel::new(2, 1.0);
        backend.update_transition_matrices(&model, &[0, 1], None, None, &[0.5, 0.5]).unwrap();
        backend.set_tip_states(0, &[0]).unwrap();
        backend.set_tip_states(1, &[1]).unwrap();
        backend.update_partials(&[cherry_op(None)], ScalingMode::Never).unwrap();
        let log_likelihood = backend.calculate_root_log_likelihoods(2, 0, 0, None).unwrap();

        let p = model.transition_matrix(0.5);
        let expected = 0.5 * p[[0, 0]] * p[[0, 1]] + 0.5 * p[[1, 0]] * p[[1, 1]];
        assert_abs_diff_eq!(log_likelihood, expected.ln(), epsilon = 1e-12);
        assert_eq!(backend.get_partials(1).unwrap(), vec![0.0, 1.0]);
        let root = backend.get_partials(2).unwrap();
        assert_abs_diff_eq!(root[0], p[[0, 0]] * p[[0, 1]], epsilon = 1e-12);
    }

    #[test]
    fn test_scaled_matches_unscaled() {
        let mut backend = cherry_backend(3);
        let model = SymmetricModel::new(2, 1.0);
        backend.update_transition_matrices(&model, &[0, 1], None, None, &[0.3, 1.7]).unwrap();
        backend.set_tip_states(0, &[0, 1, 2]).unwrap();
        backend.set_tip_states(1, &[1, 1, 0]).unwrap();

        backend.update_partials(&[cherry_op(None)], ScalingMode::Never).unwrap();
        let unscaled = backend.calculate_root_log_likelihoods(2, 0, 0, None).unwrap();

        backend.update_partials(&[cherry_op(Some(0))], ScalingMode::Always).unwrap();
        backend.reset_scale_factors(1).unwrap();
        backend.accumulate_scale_factors(&[0], 1).unwrap();
        let scaled = backend.calculate_root_log_likelihoods(2, 0, 0, Some(1)).unwrap();

        assert_abs_diff_eq!(scaled, unscaled, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_branch_length() {
        let mut backend = cherry_backend(1);
        let model = SymmetricModel::new(2, 1.0);
        let err = backend.update_transition_matrices(&model, &[0, 1], None, None, &[0.5, -0.1]).unwrap_err();
        assert!(matches!(err.kind(), LikelihoodErrorType::InvalidBranchLength { .. }));
    }

    #[test]
    fn test_bad_slots() {
        let mut backend = cherry_backend(1);
        assert!(backend.set_tip_states(2, &[0]).is_err());
        assert!(backend.set_tip_states(0, &[3]).is_err());
        assert!(backend.set_partials(0, &[1.0]).is_err());
        let mut op = cherry_op(None);
        op.src_matrix_2 = 7;
        let err = backend.update_partials(&[op], ScalingMode::Never).unwrap_err();
        assert!(matches!(err.kind(), LikelihoodErrorType::ComputeBackend(_)));
    }

    #[test]
    fn test_edge_differential_of_tip() {
        // Root preorder partial in slot 3, preorder partial of tip A in slot 4, Q in matrix slot 2
        let config = BackendConfig::new(2, 2, 1, 1).with_buffers(5, 3, 0);
        let mut backend = CpuBackend::configure(&config).unwrap();
        let model = SymmetricModel::new(2, 1.0);
        backend.update_transition_matrices(&model, &[0, 1], None, None, &[0.5, 0.5]).unwrap();
        let q = model.generator();
        backend.set_transition_matrix(2, q.as_slice().unwrap()).unwrap();
        backend.set_tip_states(0, &[0]).unwrap();
        backend.set_tip_states(1, &[1]).unwrap();
        backend.set_partials(3, &[0.5, 0.5]).unwrap();
        let pre = Operation { dest_partial: 4, src_partial_1: 3, src_matrix_1: 0, ..cherry_op(None) };
        backend.update_pre_partials(&[pre], ScalingMode::Never).unwrap();
        let diff = backend.calculate_edge_differentials(&[0], &[4], &[2], 0, true).unwrap();

        let p = model.transition_matrix(0.5);
        let (dp, _) = model.transition_derivatives(0.5);
        let site = 0.5 * p[[0, 0]] * p[[0, 1]] + 0.5 * p[[1, 0]] * p[[1, 1]];
        let d_site = 0.5 * dp[[0, 0]] * p[[0, 1]] + 0.5 * dp[[1, 0]] * p[[1, 1]];
        assert_abs_diff_eq!(diff.first[0], d_site / site, epsilon = 1e-12);
        assert_abs_diff_eq!(diff.squared.unwrap()[0], (d_site / site).powi(2), epsilon = 1e-12);
    }
}
