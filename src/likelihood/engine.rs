//! Postorder likelihood engine with change-driven caching.

use crate::backend::{BackendConfig, ComputeBackend, ResourceFlags, ScalingMode};
use crate::data::PatternList;
use crate::error::LikelihoodError;
use crate::likelihood::Change;
use crate::likelihood::preorder::Differentials;
use crate::likelihood::traversal::{CacheState, Indices, PostorderPlan, SlotLayout, plan_postorder};
use crate::model::{NodeIndex, TimeTree};
use crate::substitution::{BranchAssignment, BranchRates, SiteRates, SubstitutionModel};
use log::{debug, info, trace};
use std::collections::BTreeMap;

/// Backend slot holding the category weights.
pub(super) const WEIGHT_SLOT: usize = 0;
/// Backend slot holding the root state frequencies.
pub(super) const FREQUENCY_SLOT: usize = 0;

// =#========================================================================#=
// STATISTICS
// =#========================================================================#=
/// Counters of the work an engine has issued to its backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationStatistics {
    /// Successful evaluation calls (whole tree or single branch)
    pub evaluations: u64,
    /// Postorder partial operations
    pub partial_operations: u64,
    /// Branch transition matrices computed
    pub matrix_updates: u64,
    /// Tip state vectors uploaded
    pub tip_uploads: u64,
    /// Preorder partial operations
    pub preorder_operations: u64,
}

// =#========================================================================#=
// BUILDER
// =#========================================================================#=
/// Builder for [TreeLikelihood].
///
/// The tree passed here fixes the shape (tip and node count, tip labels) the
/// engine is sized for; heights may change freely between evaluations.
///
/// # Example
/// ```
/// use treelik::backend::{CpuBackend, ScalingMode};
/// use treelik::data::PatternList;
/// use treelik::likelihood::TreeLikelihoodBuilder;
/// use treelik::newick::parse_str;
/// use treelik::substitution::SiteRates;
///
/// let tree = parse_str("((A:1,B:1):1,C:2);").unwrap();
/// let patterns = PatternList::from_sequences("01", &[("A", "0110"), ("B", "0100"), ("C", "1101")]).unwrap();
/// let likelihood = TreeLikelihoodBuilder::new(&patterns, &tree)
///     .with_site_rates(SiteRates::equal_weights(vec![0.5, 1.5]).unwrap())
///     .with_scaling(ScalingMode::Always)
///     .build::<CpuBackend>()
///     .unwrap();
/// assert_eq!(likelihood.update_flags().len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct TreeLikelihoodBuilder<'a> {
    patterns: &'a PatternList,
    tree: &'a TimeTree,
    site_rates: SiteRates,
    scaling: ScalingMode,
    resources: Vec<usize>,
    preference_flags: ResourceFlags,
    requirement_flags: ResourceFlags,
}

impl<'a> TreeLikelihoodBuilder<'a> {
    /// Creates a builder with one rate category, no scaling and no flags.
    pub fn new(patterns: &'a PatternList, tree: &'a TimeTree) -> Self {
        Self {
            patterns,
            tree,
            site_rates: SiteRates::single(),
            scaling: ScalingMode::Never,
            resources: Vec::new(),
            preference_flags: ResourceFlags::NONE,
            requirement_flags: ResourceFlags::NONE,
        }
    }

    /// Sets the across-site rate categories.
    pub fn with_site_rates(mut self, site_rates: SiteRates) -> Self {
        self.site_rates = site_rates;
        self
    }

    /// Sets whether recomputed partials are rescaled.
    pub fn with_scaling(mut self, scaling: ScalingMode) -> Self {
        self.scaling = scaling;
        self
    }

    /// Sets the backend resources to choose from.
    pub fn with_resources(mut self, resources: Vec<usize>) -> Self {
        self.resources = resources;
        self
    }

    /// Sets flags the backend should honour if it can.
    pub fn with_preference_flags(mut self, flags: ResourceFlags) -> Self {
        self.preference_flags = flags;
        self
    }

    /// Sets flags the backend must honour.
    pub fn with_requirement_flags(mut self, flags: ResourceFlags) -> Self {
        self.requirement_flags = flags;
        self
    }

    /// Returns the slot layout for the tree.
    pub fn layout(&self) -> SlotLayout {
        SlotLayout::new(self.tree.num_tips(), self.tree.num_vertices())
    }

    /// Returns the backend configuration the engine will request.
    ///
    /// Rescaling adds [`ResourceFlags::SCALING_MANUAL`] to the requirements.
    pub fn backend_config(&self) -> BackendConfig {
        let layout = self.layout();
        let mut requirements = self.requirement_flags;
        if self.scaling == ScalingMode::Always {
            requirements = requirements | ResourceFlags::SCALING_MANUAL;
        }
        BackendConfig::new(
            layout.tip_count(),
            self.patterns.state_count(),
            self.patterns.pattern_count(),
            self.site_rates.category_count(),
        )
        .with_buffers(layout.partial_buffer_count(), layout.matrix_buffer_count(), layout.scale_buffer_count())
        .with_resources(self.resources.clone())
        .with_preference_flags(self.preference_flags)
        .with_requirement_flags(requirements)
    }

    /// Configures the backend and creates the engine.
    ///
    /// # Errors
    /// * `InvalidTree` if the tree is not a valid binary tree with tips first
    /// * `InvalidData` if a tip label has no data
    /// * `Configuration` if the backend cannot be configured
    /// * `ComputeBackend` if uploading the initial data fails
    pub fn build<B: ComputeBackend>(self) -> Result<TreeLikelihood<B>, LikelihoodError> {
        if !self.tree.is_valid() {
            return Err(LikelihoodError::invalid_tree("tree is not a valid binary tree with tips numbered first"));
        }
        let layout = self.layout();

        let tip_states = (0..layout.tip_count())
            .map(|tip| {
                let label = self.tree.vertex(tip).label().unwrap_or_default();
                self.patterns
                    .states_of(label)
                    .map(|states| states.to_vec())
                    .ok_or_else(|| LikelihoodError::invalid_data(format!("no data for tip {label}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let config = self.backend_config();
        let mut backend = B::configure(&config)?;
        backend.set_category_rates(self.site_rates.rates())?;
        backend.set_category_weights(WEIGHT_SLOT, self.site_rates.weights())?;
        backend.set_pattern_weights(self.patterns.pattern_weights())?;
        let unit_size = config.pattern_count * config.category_count * config.state_count;
        backend.set_partials(layout.unit_partial(), &vec![1.0; unit_size])?;

        info!(
            "Created tree likelihood for {} tips, {} patterns, {} categories, scaling {:?}",
            layout.tip_count(),
            config.pattern_count,
            config.category_count,
            self.scaling
        );

        Ok(TreeLikelihood {
            backend,
            layout,
            indices: Indices::for_layout(&layout),
            cache: CacheState::all_dirty(layout.tip_count(), layout.node_count()),
            stored: None,
            tip_states,
            site_rates: self.site_rates,
            scaling: self.scaling,
            pattern_count: config.pattern_count,
            state_count: config.state_count,
            update_flags: vec![false; layout.node_count()],
            statistics: EvaluationStatistics::default(),
            generation: 0,
            differentials: None,
        })
    }
}

// =#========================================================================#=
// TREE LIKELIHOOD
// =#========================================================================#=
/// Pending flags and tip data at the time of [`TreeLikelihood::store_state`].
#[derive(Debug, Clone)]
struct StoredState {
    cache: CacheState,
    tip_states: Vec<Vec<usize>>,
}

/// Incremental likelihood engine for one tree shape, owning its backend.
///
/// Every evaluation receives the tree and branch assignment by reference,
/// together with the changes made since the previous call. Changes outside
/// the subtree a call traverses stay pending for later calls.
#[derive(Debug)]
pub struct TreeLikelihood<B: ComputeBackend> {
    pub(super) backend: B,
    pub(super) layout: SlotLayout,
    pub(super) indices: Indices,
    cache: CacheState,
    stored: Option<StoredState>,
    tip_states: Vec<Vec<usize>>,
    pub(super) site_rates: SiteRates,
    pub(super) scaling: ScalingMode,
    pub(super) pattern_count: usize,
    pub(super) state_count: usize,
    update_flags: Vec<bool>,
    pub(super) statistics: EvaluationStatistics,
    pub(super) generation: u64,
    pub(super) differentials: Option<Differentials>,
}

impl<B: ComputeBackend> TreeLikelihood<B> {
    /// Evaluates the log-likelihood of the whole tree.
    ///
    /// # Errors
    /// * `InvalidBranchLength` if a changed branch has a negative length
    /// * `ComputeBackend` if a backend call fails
    ///
    /// On error, buffer indices are rolled back and the changes stay pending.
    pub fn evaluate<M: SubstitutionModel>(
        &mut self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        changes: &[Change],
    ) -> Result<f64, LikelihoodError> {
        self.apply_changes(tree, branches, changes)?;
        let root = tree.root_index();

        let (plan, log_likelihood) = self.with_rollback(|engine| {
            let plan = engine.run_postorder(tree, branches, root)?;
            engine.backend.set_state_frequencies(FREQUENCY_SLOT, branches.root_frequencies(tree)?)?;
            let cumulative = engine.accumulate_scale_factors(&plan)?;
            let log_likelihood = engine
                .backend
                .calculate_root_log_likelihoods(engine.indices.partials.current(root), WEIGHT_SLOT, FREQUENCY_SLOT, cumulative)
                .map_err(|e| e.with_context("contracting the root partial"))?;
            engine.cache.upward_dirty[root] = false;
            Ok((plan, log_likelihood))
        })?;

        self.finish(root, &plan);
        Ok(log_likelihood)
    }

    /// Evaluates the log-likelihood of the data below the branch above `node`,
    /// with the parent end of the branch distributed as the root frequencies.
    ///
    /// Only the subtree below `node` is traversed.
    pub fn evaluate_branch<M: SubstitutionModel>(
        &mut self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        node: NodeIndex,
        changes: &[Change],
    ) -> Result<f64, LikelihoodError> {
        self.evaluate_edge(tree, branches, node, changes, false).map(|(log_likelihood, _)| log_likelihood)
    }

    /// Like [`evaluate_branch`](Self::evaluate_branch), additionally returning the
    /// first and second derivative with respect to the branch length,
    /// as `(logL, d logL / dt, d² logL / dt²)`.
    pub fn branch_log_likelihood_derivatives<M: SubstitutionModel>(
        &mut self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        node: NodeIndex,
        changes: &[Change],
    ) -> Result<(f64, f64, f64), LikelihoodError> {
        let (log_likelihood, derivatives) = self.evaluate_edge(tree, branches, node, changes, true)?;
        let (first, second) = derivatives
            .ok_or_else(|| LikelihoodError::compute_backend("backend returned no branch derivatives"))?;
        Ok((log_likelihood, first, second))
    }

    /// Returns, per node, whether its partial was recomputed by the last evaluation.
    ///
    /// Tips are always `false`.
    pub fn update_flags(&self) -> &[bool] {
        &self.update_flags
    }

    /// Returns the work counters.
    pub fn statistics(&self) -> EvaluationStatistics {
        self.statistics
    }

    /// Returns the model generation; advances whenever a change is processed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the slot layout.
    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Returns the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the backend slot currently holding the postorder partial of `node`.
    pub fn current_partial_slot(&self, node: NodeIndex) -> usize {
        self.indices.partials.current(node)
    }

    /// Returns the site rates.
    pub fn site_rates(&self) -> &SiteRates {
        &self.site_rates
    }

    /// Returns the current states of tip `tip`.
    pub fn tip_states(&self, tip: NodeIndex) -> Option<&[usize]> {
        self.tip_states.get(tip).map(|s| s.as_slice())
    }

    /// Remembers the current cached buffers, e.g. before an MCMC proposal.
    pub fn store_state(&mut self) {
        self.indices.store_state();
        self.stored = Some(StoredState { cache: self.cache.clone(), tip_states: self.tip_states.clone() });
        debug!("Stored likelihood state at generation {}", self.generation);
    }

    /// Returns to the buffers of the last [`store_state`](Self::store_state),
    /// e.g. after a rejected proposal. The caller restores tree and models.
    ///
    /// # Errors
    /// * `Configuration` if no state was stored
    /// * `ComputeBackend` if re-uploading restored tip states fails
    pub fn restore_state(&mut self) -> Result<(), LikelihoodError> {
        let stored = self
            .stored
            .clone()
            .ok_or_else(|| LikelihoodError::configuration("restore_state called without a stored state"))?;

        for (tip, states) in stored.tip_states.iter().enumerate() {
            if *states != self.tip_states[tip] {
                self.backend.set_tip_states(tip, states)?;
            }
        }

        self.indices.restore_state();
        self.cache = stored.cache;
        self.tip_states = stored.tip_states;
        self.update_flags.iter_mut().for_each(|f| *f = false);
        self.generation += 1;
        debug!("Restored likelihood state, now at generation {}", self.generation);
        Ok(())
    }

    /// Replaces the site rates; all branch matrices are recomputed on the next evaluation.
    ///
    /// # Errors
    /// Returns `Configuration` if the number of categories differs from the
    /// one the backend was sized for.
    pub fn set_site_rates(&mut self, site_rates: SiteRates) -> Result<(), LikelihoodError> {
        if site_rates.category_count() != self.site_rates.category_count() {
            return Err(LikelihoodError::configuration(format!(
                "backend is sized for {} rate categories, got {}",
                self.site_rates.category_count(),
                site_rates.category_count()
            )));
        }
        self.backend.set_category_rates(site_rates.rates())?;
        self.backend.set_category_weights(WEIGHT_SLOT, site_rates.weights())?;
        self.site_rates = site_rates;
        self.cache.branch_dirty.iter_mut().for_each(|d| *d = true);
        self.generation += 1;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------
    fn evaluate_edge<M: SubstitutionModel>(
        &mut self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        node: NodeIndex,
        changes: &[Change],
        derivatives: bool,
    ) -> Result<(f64, Option<(f64, f64)>), LikelihoodError> {
        self.apply_changes(tree, branches, changes)?;
        self.check_node(node)?;
        if node == tree.root_index() {
            return Err(LikelihoodError::invalid_tree(format!("root {node} has no branch")));
        }

        let (plan, edge) = self.with_rollback(|engine| {
            let plan = engine.run_postorder(tree, branches, node)?;
            engine.backend.set_state_frequencies(FREQUENCY_SLOT, branches.root_frequencies(tree)?)?;

            let (scratch, first, second) = engine.layout.derivative_scratch();
            if derivatives {
                let length = branches.branch_length(tree, node)?;
                engine.backend.update_transition_matrices(
                    branches.model_for(node)?,
                    &[scratch],
                    Some(&[first][..]),
                    Some(&[second][..]),
                    &[length],
                )?;
            }

            let cumulative = engine.accumulate_scale_factors(&plan)?;
            let edge = engine
                .backend
                .calculate_edge_log_likelihoods(
                    &[engine.layout.unit_partial()],
                    &[engine.indices.partials.current(node)],
                    &[engine.indices.matrices.current(node)],
                    derivatives.then_some(&[first][..]),
                    derivatives.then_some(&[second][..]),
                    WEIGHT_SLOT,
                    FREQUENCY_SLOT,
                    cumulative,
                )
                .map_err(|e| e.with_context(format!("contracting the branch above node {node}")))?;
            Ok((plan, edge))
        })?;

        self.finish(node, &plan);
        let log_likelihood = edge.log_likelihoods.first().copied().unwrap_or(f64::NAN);
        let derivatives = match (edge.first, edge.second) {
            (Some(first), Some(second)) => first.first().copied().zip(second.first().copied()),
            _ => None,
        };
        Ok((log_likelihood, derivatives))
    }

    /// Folds a change list into the pending flags.
    ///
    /// The whole list is validated first; on error nothing is applied.
    fn apply_changes<M: SubstitutionModel>(
        &mut self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        changes: &[Change],
    ) -> Result<(), LikelihoodError> {
        if tree.num_vertices() != self.layout.node_count() || tree.num_tips() != self.layout.tip_count() {
            return Err(LikelihoodError::invalid_tree(format!(
                "engine is sized for {} nodes and {} tips",
                self.layout.node_count(),
                self.layout.tip_count()
            )));
        }
        if let BranchRates::PerBranch(rates) = branches.rates() {
            if rates.len() < self.layout.node_count() {
                return Err(LikelihoodError::invalid_data(format!(
                    "{} branch rates for {} nodes",
                    rates.len(),
                    self.layout.node_count()
                )));
            }
        }
        for change in changes {
            self.check_change(branches, change)?;
        }
        if changes.is_empty() {
            return Ok(());
        }
        self.generation += 1;

        let root = tree.root_index();
        for change in changes {
            trace!("Applying {change:?}");
            match change {
                Change::NodeHeight(node) => {
                    self.cache.branch_dirty[*node] |= *node != root;
                    if let Some((left, right)) = tree.children(*node) {
                        self.cache.branch_dirty[left] = true;
                        self.cache.branch_dirty[right] = true;
                    }
                }
                Change::BranchRate(node) | Change::BranchModel(node) => {
                    self.cache.branch_dirty[*node] |= *node != root;
                }
                Change::SubstitutionModel(k) => {
                    for node in branches.branches_of_model(tree, *k) {
                        self.cache.branch_dirty[node] = true;
                    }
                }
                Change::TipStates { tip, states } => {
                    self.tip_states[*tip] = states.clone();
                    self.cache.tip_dirty[*tip] = true;
                }
                Change::Everything => self.cache.mark_all(),
            }
        }
        Ok(())
    }

    fn check_change<M: SubstitutionModel>(
        &self,
        branches: &BranchAssignment<M>,
        change: &Change,
    ) -> Result<(), LikelihoodError> {
        match change {
            Change::NodeHeight(node) | Change::BranchRate(node) | Change::BranchModel(node) => self.check_node(*node),
            Change::SubstitutionModel(k) if *k >= branches.dispatch().model_count() => {
                Err(LikelihoodError::invalid_data(format!("no substitution model with index {k}")))
            }
            Change::TipStates { tip, states } => self.check_tip_states(*tip, states),
            Change::SubstitutionModel(_) | Change::Everything => Ok(()),
        }
    }

    /// Runs `f`; on error rolls back buffer indices and pending flags.
    fn with_rollback<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, LikelihoodError>,
    ) -> Result<T, LikelihoodError> {
        let checkpoint = self.indices.checkpoint();
        let cache = self.cache.clone();
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("Evaluation failed, rolling back buffer indices: {e}");
                self.indices.rollback(&checkpoint);
                self.cache = cache;
                Err(e)
            }
        }
    }

    /// Plans the traversal below `start` and issues its backend work.
    fn run_postorder<M: SubstitutionModel>(
        &mut self,
        tree: &TimeTree,
        branches: &BranchAssignment<M>,
        start: NodeIndex,
    ) -> Result<PostorderPlan, LikelihoodError> {
        let plan = plan_postorder(tree, branches, start, &mut self.cache, &mut self.indices, self.scaling)?;

        let mut batches: BTreeMap<usize, (Vec<usize>, Vec<f64>)> = BTreeMap::new();
        for update in &plan.matrix_updates {
            let (slots, lengths) = batches.entry(update.model).or_default();
            slots.push(update.slot);
            lengths.push(update.length);
        }
        for (k, (slots, lengths)) in &batches {
            let model = branches.dispatch().model(*k).ok_or_else(|| {
                LikelihoodError::configuration(format!("branches assigned to missing model {k}"))
            })?;
            self.backend
                .update_transition_matrices(model, slots, None, None, lengths)
                .map_err(|e| e.with_context(format!("updating {} matrices of model {k}", slots.len())))?;
        }

        for &tip in &plan.tip_uploads {
            self.backend.set_tip_states(tip, &self.tip_states[tip])?;
        }

        if !plan.operations.is_empty() {
            self.backend
                .update_partials(&plan.operations, self.scaling)
                .map_err(|e| e.with_context(format!("issuing {} partial operations", plan.operations.len())))?;
        }
        Ok(plan)
    }

    /// Sums the scale factors of the traversed subtree, if rescaling.
    fn accumulate_scale_factors(&mut self, plan: &PostorderPlan) -> Result<Option<usize>, LikelihoodError> {
        if self.scaling == ScalingMode::Never {
            return Ok(None);
        }
        let cumulative = self.layout.cumulative_scale();
        self.backend.reset_scale_factors(cumulative)?;
        self.backend.accumulate_scale_factors(&plan.scale_slots, cumulative)?;
        Ok(Some(cumulative))
    }

    /// Records flags and counters of a successful traversal.
    fn finish(&mut self, start: NodeIndex, plan: &PostorderPlan) {
        self.update_flags.iter_mut().for_each(|f| *f = false);
        for &node in &plan.recomputed {
            self.update_flags[node] = true;
        }

        self.statistics.evaluations += 1;
        self.statistics.partial_operations += plan.operations.len() as u64;
        self.statistics.matrix_updates += plan.matrix_updates.len() as u64;
        self.statistics.tip_uploads += plan.tip_uploads.len() as u64;

        debug!(
            "Evaluated from node {start}: {} matrices (branches {:?}), {} tips, {} partial operations",
            plan.matrix_updates.len(),
            plan.matrix_updates.iter().map(|u| u.node).collect::<Vec<_>>(),
            plan.tip_uploads.len(),
            plan.operations.len()
        );
    }

    fn check_node(&self, node: NodeIndex) -> Result<(), LikelihoodError> {
        if node >= self.layout.node_count() {
            return Err(LikelihoodError::invalid_tree(format!(
                "node {node} out of range 0..{}",
                self.layout.node_count()
            )));
        }
        Ok(())
    }

    fn check_tip_states(&self, tip: NodeIndex, states: &[usize]) -> Result<(), LikelihoodError> {
        if tip >= self.layout.tip_count() {
            return Err(LikelihoodError::invalid_data(format!("node {tip} is not a tip")));
        }
        if states.len() != self.pattern_count {
            return Err(LikelihoodError::invalid_data(format!(
                "expected {} states for tip {tip}, got {}",
                self.pattern_count,
                states.len()
            )));
        }
        if let Some(bad) = states.iter().find(|&&s| s > self.state_count) {
            return Err(LikelihoodError::invalid_data(format!("state {bad} of tip {tip} out of range")));
        }
        Ok(())
    }
}
