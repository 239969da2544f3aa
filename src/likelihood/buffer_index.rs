//! Double-buffered mapping from entity identifiers to physical slots.

/// Maps identifiers `0..max` to physical slots with two slots per identifier,
/// except identifiers below `fixed_count`, which own a single slot.
///
/// Identifier `id >= fixed_count` lives either in slot `id` or in slot
/// `id + (max - fixed_count)`, depending on its parity bit. [`flip`](Self::flip)
/// moves an identifier to its other slot, so the previous value survives
/// until the next flip.
///
/// Writers go through [`write_slot`](Self::write_slot), which flips an
/// identifier only on its first write since the last
/// [`store_state`](Self::store_state). The stored slot therefore survives any
/// number of writes until [`restore_state`](Self::restore_state).
///
/// # Example
/// ```
/// use treelik::likelihood::BufferIndex;
///
/// let mut index = BufferIndex::new(5, 2);
/// assert_eq!(index.buffer_count(), 8);
/// assert_eq!(index.current(1), 1);
/// assert_eq!(index.flip(3), 6);
/// assert_eq!(index.flip(3), 3);
///
/// index.store_state();
/// assert_eq!(index.write_slot(3), 6);
/// assert_eq!(index.write_slot(3), 6);
/// index.restore_state();
/// assert_eq!(index.current(3), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferIndex {
    fixed_count: usize,
    offset: usize,
    parity: Vec<bool>,
    stored: Vec<bool>,
    /// Written (and so flipped away from the stored slot) since the last store or restore
    written: Vec<bool>,
}

/// Parities and write marks captured by [`BufferIndex::checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    parity: Vec<bool>,
    written: Vec<bool>,
}

impl BufferIndex {
    /// Creates a table for identifiers `0..max`, the first `fixed_count` single-buffered.
    ///
    /// # Panics
    /// Panics if `fixed_count > max`.
    pub fn new(max: usize, fixed_count: usize) -> Self {
        assert!(fixed_count <= max, "fixed count {} exceeds maximum {}", fixed_count, max);
        Self {
            fixed_count,
            offset: max - fixed_count,
            parity: vec![false; max],
            stored: vec![false; max],
            written: vec![false; max],
        }
    }

    /// Returns the number of physical slots the table addresses.
    pub fn buffer_count(&self) -> usize {
        self.parity.len() + self.offset
    }

    /// Returns the slot `id` currently lives in.
    pub fn current(&self, id: usize) -> usize {
        if id < self.fixed_count || !self.parity[id] { id } else { id + self.offset }
    }

    /// Moves `id` to its other slot and returns that slot.
    ///
    /// Identity for single-buffered identifiers.
    pub fn flip(&mut self, id: usize) -> usize {
        if id >= self.fixed_count {
            self.parity[id] = !self.parity[id];
        }
        self.current(id)
    }

    /// Returns the slot a new value of `id` must be written to.
    ///
    /// Flips `id` on its first write since the last store or restore and
    /// returns the current slot on later writes, so the stored slot is never
    /// overwritten.
    pub fn write_slot(&mut self, id: usize) -> usize {
        if id < self.fixed_count || self.written[id] {
            return self.current(id);
        }
        self.written[id] = true;
        self.flip(id)
    }

    /// Remembers the current parities for [`restore_state`](Self::restore_state).
    pub fn store_state(&mut self) {
        self.stored.copy_from_slice(&self.parity);
        self.written.fill(false);
    }

    /// Returns to the parities of the last [`store_state`](Self::store_state).
    pub fn restore_state(&mut self) {
        self.parity.copy_from_slice(&self.stored);
        self.written.fill(false);
    }

    /// Captures the current parities and write marks, independent of the stored state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint { parity: self.parity.clone(), written: self.written.clone() }
    }

    /// Returns to the parities and write marks of `checkpoint`.
    pub fn rollback(&mut self, checkpoint: &Checkpoint) {
        self.parity.copy_from_slice(&checkpoint.parity);
        self.written.copy_from_slice(&checkpoint.written);
    }
}
