//! Slot layout and postorder planning.
//!
//! Planning walks the subtree below a start node, decides per node what must
//! be refreshed, flips buffer indices accordingly and collects the backend
//! work into a [PostorderPlan]. Nothing is sent to the backend here.

use crate::backend::{Operation, ScalingMode};
use crate::error::LikelihoodError;
use crate::likelihood::buffer_index::{BufferIndex, Checkpoint};
use crate::model::{NodeIndex, TimeTree};
use crate::substitution::{BranchAssignment, SubstitutionModel};
use log::trace;

// =#========================================================================#=
// SLOT LAYOUT
// =#========================================================================#=
/// Where every buffer of a tree with `tip_count` tips and `node_count` nodes lives.
///
/// * Partials: tips `0..T` (compact states), internal nodes double-buffered up
///   to `2N - T`, then one preorder partial per node, then one all-ones partial.
/// * Matrices: `2N` double-buffered branch matrices, three scratch slots for
///   single-branch derivatives, then first- and second-order differential
///   matrices per node.
/// * Scale buffers: double-buffered per internal node, then one cumulative buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    tip_count: usize,
    node_count: usize,
}

impl SlotLayout {
    /// Creates the layout for a tree.
    pub fn new(tip_count: usize, node_count: usize) -> Self {
        Self { tip_count, node_count }
    }

    /// Returns the number of tips.
    pub fn tip_count(&self) -> usize {
        self.tip_count
    }

    /// Returns the number of nodes.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Fresh index table for postorder partials.
    pub fn partial_index(&self) -> BufferIndex {
        BufferIndex::new(self.node_count, self.tip_count)
    }

    /// Fresh index table for branch matrices.
    pub fn matrix_index(&self) -> BufferIndex {
        BufferIndex::new(self.node_count, 0)
    }

    /// Fresh index table for scale buffers, addressed by `node - tip_count`.
    pub fn scale_index(&self) -> BufferIndex {
        BufferIndex::new(self.node_count - self.tip_count, 0)
    }

    fn postorder_partial_count(&self) -> usize {
        2 * self.node_count - self.tip_count
    }

    /// Preorder partial of `node`.
    pub fn pre_partial(&self, node: NodeIndex) -> usize {
        self.postorder_partial_count() + node
    }

    /// All-ones partial standing in for the parent end of a single branch.
    pub fn unit_partial(&self) -> usize {
        self.postorder_partial_count() + self.node_count
    }

    /// Total number of partial slots.
    pub fn partial_buffer_count(&self) -> usize {
        self.unit_partial() + 1
    }

    /// Scratch slots for a single branch's matrix and its first and second derivative.
    pub fn derivative_scratch(&self) -> (usize, usize, usize) {
        let base = 2 * self.node_count;
        (base, base + 1, base + 2)
    }

    /// First-order differential matrix of the branch above `node`.
    pub fn first_differential(&self, node: NodeIndex) -> usize {
        2 * self.node_count + 3 + node
    }

    /// Second-order differential matrix of the branch above `node`.
    pub fn second_differential(&self, node: NodeIndex) -> usize {
        3 * self.node_count + 3 + node
    }

    /// Total number of matrix slots.
    pub fn matrix_buffer_count(&self) -> usize {
        4 * self.node_count + 3
    }

    /// Cumulative scale buffer.
    pub fn cumulative_scale(&self) -> usize {
        2 * (self.node_count - self.tip_count)
    }

    /// Total number of scale buffers.
    pub fn scale_buffer_count(&self) -> usize {
        self.cumulative_scale() + 1
    }
}

// =#========================================================================#=
// CACHE STATE
// =#========================================================================#=
/// What is pending per node between evaluations.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CacheState {
    /// Branch matrix must be recomputed
    pub branch_dirty: Vec<bool>,
    /// Tip states must be uploaded
    pub tip_dirty: Vec<bool>,
    /// Node's contribution changed and its parent has not absorbed it yet
    pub upward_dirty: Vec<bool>,
}

impl CacheState {
    /// Everything pending, as for a fresh engine.
    pub fn all_dirty(tip_count: usize, node_count: usize) -> Self {
        Self {
            branch_dirty: vec![true; node_count],
            tip_dirty: vec![true; tip_count],
            upward_dirty: vec![false; node_count],
        }
    }

    /// Marks every branch and tip as pending.
    pub fn mark_all(&mut self) {
        self.branch_dirty.iter_mut().for_each(|d| *d = true);
        self.tip_dirty.iter_mut().for_each(|d| *d = true);
    }
}

// =#========================================================================#=
// POSTORDER PLAN
// =#========================================================================#=
/// One transition matrix to refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MatrixUpdate {
    pub node: NodeIndex,
    pub model: usize,
    pub slot: usize,
    pub length: f64,
}

/// Backend work of one traversal.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PostorderPlan {
    pub matrix_updates: Vec<MatrixUpdate>,
    pub tip_uploads: Vec<NodeIndex>,
    pub operations: Vec<Operation>,
    /// Internal nodes whose partial is recomputed
    pub recomputed: Vec<NodeIndex>,
    /// Current scale slots of every internal node in the subtree
    pub scale_slots: Vec<usize>,
}

/// Buffer index tables of an engine.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Indices {
    pub partials: BufferIndex,
    pub matrices: BufferIndex,
    pub scales: BufferIndex,
}

/// Parities of all three tables, captured before a traversal.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndicesCheckpoint {
    partials: Checkpoint,
    matrices: Checkpoint,
    scales: Checkpoint,
}

impl Indices {
    pub fn for_layout(layout: &SlotLayout) -> Self {
        Self { partials: layout.partial_index(), matrices: layout.matrix_index(), scales: layout.scale_index() }
    }

    pub fn checkpoint(&self) -> IndicesCheckpoint {
        IndicesCheckpoint {
            partials: self.partials.checkpoint(),
            matrices: self.matrices.checkpoint(),
            scales: self.scales.checkpoint(),
        }
    }

    pub fn rollback(&mut self, checkpoint: &IndicesCheckpoint) {
        self.partials.rollback(&checkpoint.partials);
        self.matrices.rollback(&checkpoint.matrices);
        self.scales.rollback(&checkpoint.scales);
    }

    pub fn store_state(&mut self) {
        self.partials.store_state();
        self.matrices.store_state();
        self.scales.store_state();
    }

    pub fn restore_state(&mut self) {
        self.partials.restore_state();
        self.matrices.restore_state();
        self.scales.restore_state();
    }
}

/// Plans the postorder traversal of the subtree below `start`.
///
/// Flips buffer indices and clears the pending flags of visited nodes in
/// `cache`; the caller rolls both back if executing the plan fails.
pub(crate) fn plan_postorder<M: SubstitutionModel>(
    tree: &TimeTree,
    branches: &BranchAssignment<M>,
    start: NodeIndex,
    cache: &mut CacheState,
    indices: &mut Indices,
    scaling: ScalingMode,
) -> Result<PostorderPlan, LikelihoodError> {
    let tip_count = cache.tip_dirty.len();
    let root = tree.root_index();
    let mut plan = PostorderPlan::default();

    for vertex in tree.post_order_iter_from(start) {
        let node = vertex.index();
        let mut changed = false;

        if node != root && cache.branch_dirty[node] {
            let length = branches.branch_length(tree, node)?;
            let slot = indices.matrices.write_slot(node);
            plan.matrix_updates.push(MatrixUpdate { node, model: branches.dispatch().model_index(node), slot, length });
            cache.branch_dirty[node] = false;
            changed = true;
            trace!("Node {node}: branch length {length}, matrix slot {slot}");
        }

        if let Some((left, right)) = vertex.children() {
            if cache.upward_dirty[left] || cache.upward_dirty[right] {
                let dest_partial = indices.partials.write_slot(node);
                let dest_scale_write = match scaling {
                    ScalingMode::Always => Some(indices.scales.write_slot(node - tip_count)),
                    ScalingMode::Never => None,
                };
                plan.operations.push(Operation {
                    dest_partial,
                    dest_scale_write,
                    dest_scale_read: None,
                    src_partial_1: indices.partials.current(left),
                    src_matrix_1: indices.matrices.current(left),
                    src_partial_2: indices.partials.current(right),
                    src_matrix_2: indices.matrices.current(right),
                });
                plan.recomputed.push(node);
                cache.upward_dirty[left] = false;
                cache.upward_dirty[right] = false;
                changed = true;
                trace!("Node {node}: recomputing partial into slot {dest_partial}");
            } else {
                trace!("Node {node}: partial in slot {} still valid", indices.partials.current(node));
            }
            plan.scale_slots.push(indices.scales.current(node - tip_count));
        } else if cache.tip_dirty[node] {
            plan.tip_uploads.push(node);
            cache.tip_dirty[node] = false;
            changed = true;
            trace!("Tip {node}: uploading states");
        }

        cache.upward_dirty[node] |= changed;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newick::parse_str;
    use crate::substitution::SymmetricModel;

    fn setup() -> (TimeTree, BranchAssignment<SymmetricModel>, SlotLayout, Indices) {
        let tree = parse_str("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
        let branches = BranchAssignment::homogeneous(SymmetricModel::new(4, 1.0));
        let layout = SlotLayout::new(4, 7);
        let indices = Indices::for_layout(&layout);
        (tree, branches, layout, indices)
    }

    #[test]
    fn test_layout_counts() {
        let layout = SlotLayout::new(4, 7);
        assert_eq!(layout.partial_index().buffer_count(), 10);
        assert_eq!(layout.pre_partial(0), 10);
        assert_eq!(layout.unit_partial(), 17);
        assert_eq!(layout.partial_buffer_count(), 18);
        assert_eq!(layout.matrix_index().buffer_count(), 14);
        assert_eq!(layout.second_differential(6), layout.matrix_buffer_count() - 1);
        assert_eq!(layout.scale_index().buffer_count(), layout.cumulative_scale());
    }

    #[test]
    fn test_first_plan_recomputes_everything() {
        let (tree, branches, _, mut indices) = setup();
        let mut cache = CacheState::all_dirty(4, 7);
        let plan = plan_postorder(&tree, &branches, 6, &mut cache, &mut indices, ScalingMode::Never).unwrap();
        assert_eq!(plan.matrix_updates.len(), 6);
        assert_eq!(plan.tip_uploads, vec![0, 1, 2, 3]);
        assert_eq!(plan.recomputed, vec![4, 5, 6]);
        assert!(cache.branch_dirty[..6].iter().all(|d| !d));
    }

    #[test]
    fn test_plan_after_single_branch_change() {
        let (tree, branches, _, mut indices) = setup();
        let mut cache = CacheState::all_dirty(4, 7);
        plan_postorder(&tree, &branches, 6, &mut cache, &mut indices, ScalingMode::Never).unwrap();
        cache.upward_dirty[6] = false;

        cache.branch_dirty[2] = true;
        let plan = plan_postorder(&tree, &branches, 6, &mut cache, &mut indices, ScalingMode::Always).unwrap();
        assert_eq!(plan.matrix_updates.len(), 1);
        assert_eq!(plan.recomputed, vec![5, 6]);
        assert!(plan.operations.iter().all(|op| op.dest_scale_write.is_some()));
        assert_eq!(plan.scale_slots.len(), 3);
    }
}
