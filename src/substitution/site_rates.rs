use crate::error::LikelihoodError;

/// Tolerance on the sum of category weights.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-8;

/// Across-site rate heterogeneity as a discrete mixture: each category has a
/// rate multiplier `r_c` applied to every branch length and a weight `w_c`.
///
/// Weights are expected to sum to one.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteRates {
    rates: Vec<f64>,
    weights: Vec<f64>,
}

impl SiteRates {
    /// A single category with rate and weight one.
    pub fn single() -> Self {
        Self { rates: vec![1.0], weights: vec![1.0] }
    }

    /// Creates site rates from category rates and weights.
    ///
    /// # Errors
    /// Returns `InvalidData` if the vectors are empty or differ in length,
    /// a rate or weight is negative, or the weights do not sum to one.
    pub fn new(rates: Vec<f64>, weights: Vec<f64>) -> Result<Self, LikelihoodError> {
        if rates.is_empty() || rates.len() != weights.len() {
            return Err(LikelihoodError::invalid_data(format!(
                "need matching non-empty category rates and weights, got {} and {}",
                rates.len(),
                weights.len()
            )));
        }
        if rates.iter().chain(weights.iter()).any(|x| !(x.is_finite() && *x >= 0.0)) {
            return Err(LikelihoodError::invalid_data("category rates and weights must be non-negative"));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(LikelihoodError::invalid_data(format!("category weights sum to {sum}, not 1")));
        }
        Ok(Self { rates, weights })
    }

    /// Creates site rates with equally weighted categories.
    pub fn equal_weights(rates: Vec<f64>) -> Result<Self, LikelihoodError> {
        let weights = vec![1.0 / rates.len().max(1) as f64; rates.len()];
        Self::new(rates, weights)
    }

    /// Returns the number of rate categories.
    pub fn category_count(&self) -> usize {
        self.rates.len()
    }

    /// Returns the category rates.
    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    /// Returns the category weights.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl Default for SiteRates {
    fn default() -> Self {
        Self::single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(SiteRates::new(vec![0.5, 1.5], vec![0.5, 0.5]).is_ok());
        assert!(SiteRates::new(vec![0.5, 1.5], vec![0.5]).is_err());
        assert!(SiteRates::new(vec![0.5, 1.5], vec![0.6, 0.6]).is_err());
        assert!(SiteRates::new(vec![-1.0], vec![1.0]).is_err());
        assert!(SiteRates::equal_weights(vec![]).is_err());
    }

    #[test]
    fn test_equal_weights() {
        let rates = SiteRates::equal_weights(vec![0.2, 0.8, 2.0]).unwrap();
        assert_eq!(rates.category_count(), 3);
        assert_eq!(rates.weights()[1], 1.0 / 3.0);
    }
}
