use crate::substitution::SubstitutionModel;
use ndarray::Array2;

/// Equal-rates model over `n` states (Jukes-Cantor for `n = 4`, Mk in general).
///
/// Every state is left at total rate `mu`, each of the other `n - 1` states
/// being equally likely as destination. Frequencies are uniform.
/// With `e = exp(-n mu t / (n - 1))`:
/// * `P_ii(t) = 1/n + (n - 1)/n * e`
/// * `P_ij(t) = 1/n - e/n`
#[derive(Debug, Clone, PartialEq)]
pub struct SymmetricModel {
    states: usize,
    rate: f64,
    frequencies: Vec<f64>,
}

impl SymmetricModel {
    /// Creates a model over `states` states with total substitution rate `rate`.
    ///
    /// # Panics
    /// Panics if `states < 2` or `rate` is negative or not finite.
    pub fn new(states: usize, rate: f64) -> Self {
        assert!(states > 1, "Need at least two states, got {}", states);
        assert!(rate.is_finite() && rate >= 0.0, "Rate must be non-negative, got {}", rate);
        Self { states, rate, frequencies: vec![1.0 / states as f64; states] }
    }

    /// Jukes-Cantor model for nucleotides, normalised to one expected substitution per unit time.
    pub fn jukes_cantor() -> Self {
        Self::new(4, 1.0)
    }

    /// Returns the substitution rate.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Sets the substitution rate.
    ///
    /// Evaluations that follow must report a
    /// [Change::SubstitutionModel](crate::likelihood::Change::SubstitutionModel).
    pub fn set_rate(&mut self, rate: f64) {
        assert!(rate.is_finite() && rate >= 0.0, "Rate must be non-negative, got {}", rate);
        self.rate = rate;
    }
}

impl SubstitutionModel for SymmetricModel {
    fn state_count(&self) -> usize {
        self.states
    }

    fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn generator(&self) -> Array2<f64> {
        let n = self.states;
        let off = self.rate / (n - 1) as f64;
        Array2::from_shape_fn((n, n), |(i, j)| if i == j { -self.rate } else { off })
    }

    fn transition_matrix(&self, distance: f64) -> Array2<f64> {
        let n = self.states as f64;
        let e = (-n * self.rate * distance / (n - 1.0)).exp();
        let same = 1.0 / n + (n - 1.0) / n * e;
        let other = 1.0 / n - e / n;
        Array2::from_shape_fn((self.states, self.states), |(i, j)| if i == j { same } else { other })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_rows_sum_to_one() {
        let model = SymmetricModel::new(4, 1.3);
        let p = model.transition_matrix(0.7);
        for row in p.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(model.transition_matrix(0.0)[[2, 2]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let model = SymmetricModel::new(3, 0.8);
        let t = 0.4;
        let h = 1e-6;
        let (first, _) = model.transition_derivatives(t);
        let numeric = (model.transition_matrix(t + h) - model.transition_matrix(t - h)) / (2.0 * h);
        for (a, b) in first.iter().zip(numeric.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_generator_rows_sum_to_zero() {
        let q = SymmetricModel::new(5, 2.0).generator();
        for row in q.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-12);
        }
        assert_eq!(q[[0, 0]], -2.0);
    }
}
