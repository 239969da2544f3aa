//! Observed sequence data.
//!
//! [PatternList] stores the observed state of every taxon at every site
//! pattern. The likelihood engine reads the states of each tip by the tip's
//! label and hands them to the compute backend as compact state vectors.

pub mod patterns;

pub use patterns::PatternList;
