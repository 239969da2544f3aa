use crate::substitution::SubstitutionModel;
use ndarray::{Array2, array};

/// Rates at which gain and loss are considered absent.
const NO_EVOLUTION_THRESHOLD: f64 = 1e-10;

/// Two-state model of trait gain (0 to 1, rate `gain`) and loss (1 to 0, rate `loss`).
///
/// `Q = [[-gain, gain], [loss, -loss]]`, with closed-form transition matrix
/// and equilibrium frequencies `[loss, gain] / (gain + loss)`.
#[derive(Debug, Clone, PartialEq)]
pub struct GainLossModel {
    gain: f64,
    loss: f64,
    frequencies: Vec<f64>,
}

impl GainLossModel {
    /// Creates a model with the given gain and loss rates.
    ///
    /// # Panics
    /// Panics if a rate is negative or not finite.
    pub fn new(gain: f64, loss: f64) -> Self {
        let mut model = Self { gain: 0.0, loss: 0.0, frequencies: vec![0.5, 0.5] };
        model.set_rates(gain, loss);
        model
    }

    /// Returns the gain rate.
    pub fn gain(&self) -> f64 {
        self.gain
    }

    /// Returns the loss rate.
    pub fn loss(&self) -> f64 {
        self.loss
    }

    /// Sets both rates and updates the equilibrium frequencies.
    pub fn set_rates(&mut self, gain: f64, loss: f64) {
        assert!(gain.is_finite() && gain >= 0.0, "Gain rate must be non-negative, got {}", gain);
        assert!(loss.is_finite() && loss >= 0.0, "Loss rate must be non-negative, got {}", loss);
        self.gain = gain;
        self.loss = loss;

        let total = gain + loss;
        self.frequencies = if total < NO_EVOLUTION_THRESHOLD {
            vec![0.5, 0.5]
        } else {
            vec![loss / total, gain / total]
        };
    }
}

impl SubstitutionModel for GainLossModel {
    fn state_count(&self) -> usize {
        2
    }

    fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn generator(&self) -> Array2<f64> {
        array![[-self.gain, self.gain], [self.loss, -self.loss]]
    }

    fn transition_matrix(&self, distance: f64) -> Array2<f64> {
        let total = self.gain + self.loss;
        if total < NO_EVOLUTION_THRESHOLD {
            return Array2::eye(2);
        }

        let e = (-total * distance).exp();
        array![
            [(self.loss + self.gain * e) / total, (self.gain - self.gain * e) / total],
            [(self.loss - self.loss * e) / total, (self.gain + self.loss * e) / total]
        ]
    }
}
