//! Newick reader for binary time trees.
//!
//! Turns a Newick string with branch lengths into a [TimeTree], deriving
//! vertex heights from the branch lengths: the root gets the largest
//! root-to-tip distance as height, every other vertex its distance below that.
//! Tips need not be contemporaneous.
//!
//! # Quick API
//! * [`parse_str`] - parses a single tree
//!
//! See [NewickReader] for the accepted grammar.

pub mod reader;

pub use reader::NewickReader;

use crate::error::LikelihoodError;
use crate::model::TimeTree;

/// Parses a single Newick string into a [TimeTree].
///
/// # Example
/// ```
/// use treelik::newick::parse_str;
///
/// let tree = parse_str("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
/// assert_eq!(tree.num_tips(), 4);
/// assert_eq!(tree.height(tree.root_index()), 2.0);
/// ```
pub fn parse_str<S: AsRef<str>>(newick: S) -> Result<TimeTree, LikelihoodError> {
    NewickReader::new(newick.as_ref()).read_tree()
}
