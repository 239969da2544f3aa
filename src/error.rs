//! Error types for tree likelihood evaluation.
//!
//! This module provides [LikelihoodError] and [LikelihoodErrorType] for
//! representing and reporting errors that occur while configuring a compute
//! backend, evaluating likelihoods, computing branch differentials, or
//! building the inputs (trees, patterns) these operations consume.
//!
//! All errors are fatal to the call that raised them; nothing in this crate
//! retries.

use crate::model::NodeIndex;
use std::error::Error;
use std::fmt;

// =#========================================================================#=
// LIKELIHOOD ERROR TYPE
// =#========================================================================#=
/// Kinds of errors raised by this crate.
#[derive(PartialEq, Debug, Clone)]
pub enum LikelihoodErrorType {
    /// Backend cannot satisfy the requested resources or flags.
    Configuration(String),
    /// Negative (or non-finite) branch length from a malformed tree state.
    InvalidBranchLength {
        /// Child node of the offending branch
        node: NodeIndex,
        /// The computed length
        length: f64,
    },
    /// A backend call failed.
    ComputeBackend(String),
    /// Branch differentials read after the model changed.
    StaleCache,
    /// Tree structure unusable for evaluation.
    InvalidTree(String),
    /// Malformed Newick string.
    InvalidNewick {
        /// Byte position of the error in the input
        position: usize,
        /// Description
        msg: String,
    },
    /// Observed data inconsistent with the tree or the model.
    InvalidData(String),
}

// =#========================================================================#=
// LIKELIHOOD ERROR
// =#========================================================================#=
/// Error with an optional description of what was being done when it occurred.
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodError {
    kind: LikelihoodErrorType,
    context: String,
}

impl LikelihoodError {
    /// Create a LikelihoodError from an error type, without context
    pub fn new(kind: LikelihoodErrorType) -> Self {
        Self { kind, context: String::new() }
    }

    /// Convenience constructor for Configuration
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::new(LikelihoodErrorType::Configuration(msg.into()))
    }

    /// Convenience constructor for InvalidBranchLength
    pub fn invalid_branch_length(node: NodeIndex, length: f64) -> Self {
        Self::new(LikelihoodErrorType::InvalidBranchLength { node, length })
    }

    /// Convenience constructor for ComputeBackend
    pub fn compute_backend<S: Into<String>>(msg: S) -> Self {
        Self::new(LikelihoodErrorType::ComputeBackend(msg.into()))
    }

    /// Convenience constructor for StaleCache
    pub fn stale_cache() -> Self {
        Self::new(LikelihoodErrorType::StaleCache)
    }

    /// Convenience constructor for InvalidTree
    pub fn invalid_tree<S: Into<String>>(msg: S) -> Self {
        Self::new(LikelihoodErrorType::InvalidTree(msg.into()))
    }

    /// Convenience constructor for InvalidNewick
    pub fn invalid_newick<S: Into<String>>(position: usize, msg: S) -> Self {
        Self::new(LikelihoodErrorType::InvalidNewick { position, msg: msg.into() })
    }

    /// Convenience constructor for InvalidData
    pub fn invalid_data<S: Into<String>>(msg: S) -> Self {
        Self::new(LikelihoodErrorType::InvalidData(msg.into()))
    }

    /// Attaches a description of the operation that failed.
    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = context.into();
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &LikelihoodErrorType {
        &self.kind
    }

    /// Get the context, empty if none was attached
    pub fn context(&self) -> &str {
        &self.context
    }
}

impl fmt::Display for LikelihoodError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            LikelihoodErrorType::Configuration(msg) => write!(f, "Backend configuration failed - {msg}")?,
            LikelihoodErrorType::InvalidBranchLength { node, length } => {
                write!(f, "Invalid branch length {length} above node {node}")?
            }
            LikelihoodErrorType::ComputeBackend(msg) => write!(f, "Compute backend error - {msg}")?,
            LikelihoodErrorType::StaleCache => {
                write!(f, "Branch differentials are stale, recompute them after changing the model")?
            }
            LikelihoodErrorType::InvalidTree(msg) => write!(f, "Invalid tree - {msg}")?,
            LikelihoodErrorType::InvalidNewick { position, msg } => {
                write!(f, "Invalid newick string: {msg} at position {position}")?
            }
            LikelihoodErrorType::InvalidData(msg) => write!(f, "Invalid data - {msg}")?,
        }

        if !self.context.is_empty() {
            write!(f, "\n  while {}", self.context)?;
        }

        Ok(())
    }
}

impl Error for LikelihoodError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_context() {
        let err = LikelihoodError::invalid_branch_length(3, -0.5).with_context("evaluating branch 3");
        let text = err.to_string();
        assert!(text.contains("-0.5"));
        assert!(text.contains("above node 3"));
        assert!(text.contains("while evaluating branch 3"));
    }

    #[test]
    fn test_kind() {
        let err = LikelihoodError::stale_cache();
        assert_eq!(err.kind(), &LikelihoodErrorType::StaleCache);
        assert!(err.context().is_empty());
    }
}
