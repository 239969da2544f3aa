//! Observed character states per taxon and site pattern.

use crate::error::LikelihoodError;
use std::collections::HashMap;

/// Characters read as fully ambiguous (gap / unknown) by [`PatternList::from_sequences`],
/// unless they are part of the alphabet.
const AMBIGUOUS_CHARACTERS: &[u8] = b"-?.NnXx";

// =#========================================================================#=
// PATTERN LIST
// =#========================================================================#=
/// Observed states of every taxon at every site pattern, plus pattern weights.
///
/// States are integers in `0..state_count`; the value `state_count` itself
/// marks an ambiguous observation (gap or unknown), which is compatible with
/// every state. Taxa are looked up by label, matching tip labels of a
/// [TimeTree](crate::model::TimeTree).
///
/// # Example
/// ```
/// use treelik::data::PatternList;
///
/// let patterns = PatternList::from_sequences("ACGT", &[("A", "AAC-"), ("B", "AAGT")]).unwrap();
/// assert_eq!(patterns.pattern_count(), 4);
/// assert_eq!(patterns.states_of("A").unwrap(), &[0, 0, 1, 4]);
///
/// let compressed = patterns.compress();
/// assert_eq!(compressed.pattern_count(), 3);
/// assert_eq!(compressed.pattern_weights(), &[2.0, 1.0, 1.0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PatternList {
    state_count: usize,
    pattern_count: usize,
    /// Labels of taxa, in insertion order
    labels: Vec<String>,
    /// Map from label to taxon index
    index: HashMap<String, usize>,
    /// Observed states, one vector of length `pattern_count` per taxon
    states: Vec<Vec<usize>>,
    /// Weight (multiplicity) of each pattern
    weights: Vec<f64>,
}

impl PatternList {
    /// Creates an empty pattern list for `pattern_count` patterns over `state_count` states,
    /// with all pattern weights set to one.
    ///
    /// # Panics
    /// Panics if `state_count < 2` or `pattern_count == 0`.
    pub fn new(state_count: usize, pattern_count: usize) -> Self {
        assert!(state_count > 1, "Need at least two states, got {}", state_count);
        assert!(pattern_count > 0, "Need at least one pattern");
        Self {
            state_count,
            pattern_count,
            labels: Vec::new(),
            index: HashMap::new(),
            states: Vec::new(),
            weights: vec![1.0; pattern_count],
        }
    }

    /// Reads aligned sequences over `alphabet` (case-insensitive).
    ///
    /// Characters in [AMBIGUOUS_CHARACTERS] that are not part of the alphabet
    /// are read as ambiguous.
    ///
    /// # Errors
    /// Returns `InvalidData` if sequences differ in length, are empty, contain
    /// unknown characters, or a label repeats.
    pub fn from_sequences(alphabet: &str, sequences: &[(&str, &str)]) -> Result<Self, LikelihoodError> {
        let alphabet = alphabet.as_bytes();
        let pattern_count = sequences.first().map(|(_, s)| s.len()).unwrap_or(0);
        if pattern_count == 0 || alphabet.len() < 2 {
            return Err(LikelihoodError::invalid_data("need at least one site and two states"));
        }

        let mut patterns = PatternList::new(alphabet.len(), pattern_count);
        for (label, sequence) in sequences {
            let states = sequence
                .bytes()
                .map(|c| {
                    if let Some(state) = alphabet.iter().position(|a| a.eq_ignore_ascii_case(&c)) {
                        Ok(state)
                    } else if AMBIGUOUS_CHARACTERS.contains(&c) {
                        Ok(alphabet.len())
                    } else {
                        Err(LikelihoodError::invalid_data(format!(
                            "character {:?} of taxon {label} not in alphabet",
                            c as char
                        )))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            patterns.add_taxon(*label, states)?;
        }
        Ok(patterns)
    }

    /// Replaces the pattern weights.
    ///
    /// # Errors
    /// Returns `InvalidData` if the length does not match or a weight is negative.
    pub fn with_pattern_weights(mut self, weights: Vec<f64>) -> Result<Self, LikelihoodError> {
        if weights.len() != self.pattern_count || weights.iter().any(|w| !(*w >= 0.0)) {
            return Err(LikelihoodError::invalid_data(format!(
                "expected {} non-negative pattern weights",
                self.pattern_count
            )));
        }
        self.weights = weights;
        Ok(self)
    }

    /// Adds a taxon with its observed states and returns its index.
    ///
    /// # Errors
    /// Returns `InvalidData` if the label already exists, the number of states
    /// differs from the pattern count, or a state exceeds `state_count`.
    pub fn add_taxon<S: Into<String>>(&mut self, label: S, states: Vec<usize>) -> Result<usize, LikelihoodError> {
        let label = label.into();
        if self.index.contains_key(&label) {
            return Err(LikelihoodError::invalid_data(format!("duplicate taxon {label}")));
        }
        self.check_states(&states)?;

        let index = self.labels.len();
        self.index.insert(label.clone(), index);
        self.labels.push(label);
        self.states.push(states);
        Ok(index)
    }

    /// Replaces the observed states of the taxon with the given label.
    pub fn set_states(&mut self, label: &str, states: Vec<usize>) -> Result<(), LikelihoodError> {
        self.check_states(&states)?;
        let index = self
            .taxon_index(label)
            .ok_or_else(|| LikelihoodError::invalid_data(format!("unknown taxon {label}")))?;
        self.states[index] = states;
        Ok(())
    }

    /// Merges identical site patterns, summing their weights.
    ///
    /// The first occurrence of a pattern determines its position.
    pub fn compress(&self) -> PatternList {
        let mut seen: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut columns: Vec<Vec<usize>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();

        for site in 0..self.pattern_count {
            let column: Vec<usize> = self.states.iter().map(|s| s[site]).collect();
            match seen.get(&column) {
                Some(&k) => weights[k] += self.weights[site],
                None => {
                    seen.insert(column.clone(), columns.len());
                    columns.push(column);
                    weights.push(self.weights[site]);
                }
            }
        }

        let states = (0..self.labels.len())
            .map(|taxon| columns.iter().map(|column| column[taxon]).collect())
            .collect();

        PatternList {
            state_count: self.state_count,
            pattern_count: columns.len(),
            labels: self.labels.clone(),
            index: self.index.clone(),
            states,
            weights,
        }
    }

    /// Returns the number of states (also the ambiguous-state sentinel).
    pub fn state_count(&self) -> usize {
        self.state_count
    }

    /// Returns the number of patterns.
    pub fn pattern_count(&self) -> usize {
        self.pattern_count
    }

    /// Returns the number of taxa.
    pub fn num_taxa(&self) -> usize {
        self.labels.len()
    }

    /// Returns the pattern weights.
    pub fn pattern_weights(&self) -> &[f64] {
        &self.weights
    }

    /// Returns the index of the taxon with the given label.
    pub fn taxon_index(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    /// Returns the label of the taxon at `index`.
    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(|s| s.as_str())
    }

    /// Returns the states of the taxon at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn states(&self, index: usize) -> &[usize] {
        &self.states[index]
    }

    /// Returns the states of the taxon with the given label.
    pub fn states_of(&self, label: &str) -> Option<&[usize]> {
        self.taxon_index(label).map(|i| self.states(i))
    }

    fn check_states(&self, states: &[usize]) -> Result<(), LikelihoodError> {
        if states.len() != self.pattern_count {
            return Err(LikelihoodError::invalid_data(format!(
                "expected {} states, got {}",
                self.pattern_count,
                states.len()
            )));
        }
        if let Some(bad) = states.iter().find(|&&s| s > self.state_count) {
            return Err(LikelihoodError::invalid_data(format!(
                "state {bad} out of range 0..={}",
                self.state_count
            )));
        }
        Ok(())
    }
}
