//! Byte-level reader turning a Newick string into a [TimeTree].

use crate::error::LikelihoodError;
use crate::model::tree_builder::{BuilderIndex, TimeTreeBuilder};
use crate::model::TimeTree;

/// Newick label delimiters: parentheses, comma, colon, semicolon, whitespace, comment start
const NEWICK_LABEL_DELIMITERS: &[u8] = b"()[,:; \n\t\r";

// =#========================================================================#=
// NEWICK READER
// =#========================================================================#=
/// Reader for a single binary Newick tree with branch lengths.
///
/// # Format
/// * `tree ::= vertex ';'`
/// * `vertex ::= leaf | internal_vertex`
/// * `internal_vertex ::= '(' vertex ',' vertex ')' [label] [branch_length]`
/// * `leaf ::= label branch_length`
/// * `branch_length ::= ':' number`
///
/// Furthermore:
/// * Whitespace and `[...]` comments can occur between elements
/// * Labels may be single-quoted, with `''` as an escaped quote
/// * Labels of internal vertices (e.g. support values) are skipped
/// * A branch length on the root is allowed and ignored
///
/// Every non-root vertex needs a branch length, since heights are derived
/// from them.
pub struct NewickReader<'a> {
    input: &'a [u8],
    position: usize,
    builder: TimeTreeBuilder,
}

impl<'a> NewickReader<'a> {
    /// Creates a reader positioned at the start of `input`.
    pub fn new(input: &'a str) -> Self {
        Self { input: input.as_bytes(), position: 0, builder: TimeTreeBuilder::new() }
    }

    /// Returns the current byte position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Reads one tree terminated by `;`.
    pub fn read_tree(&mut self) -> Result<TimeTree, LikelihoodError> {
        self.skip_comment_and_whitespace()?;
        let children = self.read_children()?;
        self.skip_label()?;

        // Root may have a branch length, which is meaningless for heights
        self.skip_comment_and_whitespace()?;
        if self.peek() == Some(b':') {
            self.read_branch_length()?;
        }

        self.skip_comment_and_whitespace()?;
        if !self.consume_if(b';') {
            return Err(self.error(format!("Expected ';' at end of tree but found {:?}", self.peek_char())));
        }

        self.builder.add_root(children);
        self.builder
            .finish_tree()
            .map_err(|e| e.with_context(format!("building tree read up to position {}", self.position)))
    }

    // ------------------------------------------------------------------------
    // Grammar
    // ------------------------------------------------------------------------
    fn read_vertex(&mut self) -> Result<BuilderIndex, LikelihoodError> {
        self.skip_comment_and_whitespace()?;
        if self.peek() == Some(b'(') {
            let children = self.read_children()?;
            self.skip_label()?;
            let branch_length = self.read_required_branch_length()?;
            Ok(self.builder.add_internal(children, branch_length))
        } else {
            let label = self.read_label()?;
            if label.is_empty() {
                return Err(self.error("Expected a leaf label".to_string()));
            }
            let branch_length = self.read_required_branch_length()?;
            Ok(self.builder.add_tip(branch_length, label))
        }
    }

    fn read_children(&mut self) -> Result<(BuilderIndex, BuilderIndex), LikelihoodError> {
        if !self.consume_if(b'(') {
            return Err(self.error(format!("Expected '(' before children but found {:?}", self.peek_char())));
        }
        let left = self.read_vertex()?;

        self.skip_comment_and_whitespace()?;
        if !self.consume_if(b',') {
            return Err(self.error(format!("Expected ',' between children but found {:?}", self.peek_char())));
        }
        let right = self.read_vertex()?;

        self.skip_comment_and_whitespace()?;
        if !self.consume_if(b')') {
            return Err(self.error(format!(
                "Expected ')' after two children but found {:?} (only binary trees are supported)",
                self.peek_char()
            )));
        }

        Ok((left, right))
    }

    fn read_required_branch_length(&mut self) -> Result<f64, LikelihoodError> {
        self.skip_comment_and_whitespace()?;
        if self.peek() != Some(b':') {
            return Err(self.error("Missing branch length".to_string()));
        }
        self.read_branch_length()
    }

    /// Reads `:number`, supporting scientific notation (e.g. `1.5e-10`).
    fn read_branch_length(&mut self) -> Result<f64, LikelihoodError> {
        self.consume_if(b':');
        self.skip_comment_and_whitespace()?;

        let start = self.position;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || b == b'.' || b == b'-' || b == b'+' || b == b'e' || b == b'E' {
                self.position += 1;
            } else {
                break;
            }
        }

        let text = String::from_utf8_lossy(&self.input[start..self.position]);
        text.parse::<f64>()
            .map_err(|_| self.error(format!("Invalid branch length: {text:?}")))
    }

    // ------------------------------------------------------------------------
    // Bytes
    // ------------------------------------------------------------------------
    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn peek_char(&self) -> Option<char> {
        self.peek().map(|b| b as char)
    }

    fn consume_if(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn skip_comment_and_whitespace(&mut self) -> Result<(), LikelihoodError> {
        loop {
            while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
                self.position += 1;
            }
            if self.peek() != Some(b'[') {
                return Ok(());
            }
            let start = self.position;
            match self.input[start..].iter().position(|&b| b == b']') {
                Some(offset) => self.position = start + offset + 1,
                None => {
                    return Err(LikelihoodError::invalid_newick(start, "Unclosed comment"));
                }
            }
        }
    }

    /// Reads a quoted or unquoted label; empty if none present.
    fn read_label(&mut self) -> Result<String, LikelihoodError> {
        if self.consume_if(b'\'') {
            let mut label = Vec::new();
            loop {
                match self.peek() {
                    None => return Err(self.error("Unclosed quoted label".to_string())),
                    Some(b'\'') => {
                        self.position += 1;
                        if self.consume_if(b'\'') {
                            label.push(b'\'');
                        } else {
                            break;
                        }
                    }
                    Some(b) => {
                        label.push(b);
                        self.position += 1;
                    }
                }
            }
            return Ok(String::from_utf8_lossy(&label).into_owned());
        }

        let start = self.position;
        while self.peek().is_some_and(|b| !NEWICK_LABEL_DELIMITERS.contains(&b)) {
            self.position += 1;
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.position]).into_owned())
    }

    fn skip_label(&mut self) -> Result<(), LikelihoodError> {
        self.skip_comment_and_whitespace()?;
        self.read_label().map(|_| ())
    }

    fn error(&self, msg: String) -> LikelihoodError {
        LikelihoodError::invalid_newick(self.position, msg)
    }
}
