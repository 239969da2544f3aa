use approx::assert_abs_diff_eq;
use treelik::backend::{CpuBackend, ResourceFlags, ScalingMode};
use treelik::data::PatternList;
use treelik::likelihood::{BranchLengthDifferential, DerivativeOrder};
use treelik::model::{Height, NodeIndex, TimeTree, TimeTreeBuilder};
use treelik::newick::parse_str;
use treelik::substitution::{
    BranchAssignment, BranchRates, GainLossModel, ModelDispatch, SiteRates, SubstitutionModel, SymmetricModel,
};
use treelik::{Change, LikelihoodErrorType, TreeLikelihood, TreeLikelihoodBuilder};

// --- HELPERS ---
fn four_tips() -> (TimeTree, PatternList) {
    let tree = parse_str("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
    let patterns = PatternList::from_sequences(
        "ACGT",
        &[("A", "ACGTAC"), ("B", "ACGAAC"), ("C", "TCGTGN"), ("D", "TCCT-C")],
    )
    .unwrap();
    (tree, patterns)
}

fn five_tips() -> (TimeTree, PatternList) {
    let tree = parse_str("(((A:0.2,B:0.3):0.4,C:0.6):0.3,(D:0.5,E:0.1):0.7);").unwrap();
    let patterns = PatternList::from_sequences(
        "ACGT",
        &[
            ("A", "ACGTACGTAA"),
            ("B", "ACGTTCGAAC"),
            ("C", "ACCTACG-AG"),
            ("D", "TCGAACNTGA"),
            ("E", "TCGAAGGTCA"),
        ],
    )
    .unwrap();
    (tree, patterns)
}

/// Caterpillar tree with `n` tips, each cherry joined with branch length 0.1.
fn caterpillar(n: usize) -> (TimeTree, PatternList) {
    let mut builder = TimeTreeBuilder::new();
    let mut current = builder.add_tip(0.1, "t0");
    for i in 1..n - 1 {
        let tip = builder.add_tip(0.1 * i as f64, format!("t{i}"));
        current = builder.add_internal((current, tip), 0.1);
    }
    let last = builder.add_tip(0.1 * (n - 1) as f64, format!("t{}", n - 1));
    builder.add_root((current, last));
    let tree = builder.finish_tree().unwrap();

    let mut patterns = PatternList::new(4, 20);
    for i in 0..n {
        let states = (0..20).map(|p| (p * 7 + i * 3 + p * i) % 4).collect();
        patterns.add_taxon(format!("t{i}"), states).unwrap();
    }
    (tree, patterns)
}

fn mixed_branches() -> BranchAssignment<SymmetricModel> {
    let models = vec![SymmetricModel::new(4, 1.0), SymmetricModel::new(4, 2.5)];
    let dispatch = ModelDispatch::indexed(models, |node| if node == 3 || node == 4 || node == 7 { 1 } else { 0 });
    let rates = BranchRates::PerBranch(vec![1.0, 0.8, 1.3, 0.6, 1.1, 0.9, 1.2, 0.7, 1.0]);
    BranchAssignment::new(dispatch, rates)
}

fn build(patterns: &PatternList, tree: &TimeTree) -> TreeLikelihood<CpuBackend> {
    TreeLikelihoodBuilder::new(patterns, tree).build::<CpuBackend>().unwrap()
}

/// Felsenstein pruning by direct recursion, without any caching.
fn reference_log_likelihood<M: SubstitutionModel>(
    tree: &TimeTree,
    patterns: &PatternList,
    branches: &BranchAssignment<M>,
    site_rates: &SiteRates,
) -> f64 {
    let frequencies = branches.root_frequencies(tree).unwrap();
    let mut total = 0.0;
    for p in 0..patterns.pattern_count() {
        let mut site = 0.0;
        for (&rate, &weight) in site_rates.rates().iter().zip(site_rates.weights()) {
            let partial = prune(tree, tree.root_index(), p, rate, patterns, branches);
            site += weight * frequencies.iter().zip(&partial).map(|(f, x)| f * x).sum::<f64>();
        }
        total += patterns.pattern_weights()[p] * site.ln();
    }
    total
}

fn prune<M: SubstitutionModel>(
    tree: &TimeTree,
    node: NodeIndex,
    pattern: usize,
    rate: f64,
    patterns: &PatternList,
    branches: &BranchAssignment<M>,
) -> Vec<f64> {
    let n = patterns.state_count();
    match tree.children(node) {
        None => {
            let state = patterns.states_of(tree.vertex(node).label().unwrap()).unwrap()[pattern];
            (0..n).map(|s| if state == n || state == s { 1.0 } else { 0.0 }).collect()
        }
        Some((left, right)) => {
            let mut out = vec![1.0; n];
            for child in [left, right] {
                let below = prune(tree, child, pattern, rate, patterns, branches);
                let length = branches.branch_length(tree, child).unwrap();
                let p = branches.model_for(child).unwrap().transition_matrix(rate * length);
                for (s, x) in out.iter_mut().enumerate() {
                    *x *= (0..n).map(|j| p[[s, j]] * below[j]).sum::<f64>();
                }
            }
            out
        }
    }
}

// --- TESTS AGAINST DIRECT PRUNING ---
#[test]
fn test_matches_direct_pruning() {
    let (tree, patterns) = five_tips();
    let branches = mixed_branches();
    let site_rates = SiteRates::new(vec![0.3, 1.7], vec![0.4, 0.6]).unwrap();

    let mut likelihood = TreeLikelihoodBuilder::new(&patterns, &tree)
        .with_site_rates(site_rates.clone())
        .build::<CpuBackend>()
        .unwrap();
    let log_likelihood = likelihood.evaluate(&tree, &branches, &[]).unwrap();

    let expected = reference_log_likelihood(&tree, &patterns, &branches, &site_rates);
    assert_abs_diff_eq!(log_likelihood, expected, epsilon = 1e-10);
}

#[test]
fn test_matches_direct_pruning_gain_loss() {
    let tree = parse_str("((A:0.5,B:1.5):0.5,(C:1,D:1):1);").unwrap();
    let patterns =
        PatternList::from_sequences("01", &[("A", "0110?"), ("B", "01001"), ("C", "11010"), ("D", "1-011")]).unwrap();
    let branches = BranchAssignment::homogeneous(GainLossModel::new(0.3, 0.9));

    let mut likelihood = build(&patterns, &tree);
    let log_likelihood = likelihood.evaluate(&tree, &branches, &[]).unwrap();

    let expected = reference_log_likelihood(&tree, &patterns, &branches, &SiteRates::single());
    assert_abs_diff_eq!(log_likelihood, expected, epsilon = 1e-10);
}

#[test]
fn test_pattern_weights_match_repeated_columns() {
    let (tree, _) = four_tips();
    let full =
        PatternList::from_sequences("ACGT", &[("A", "AACG"), ("B", "AACG"), ("C", "TTCG"), ("D", "TTCA")]).unwrap();
    let compressed = full.compress();
    assert_eq!(compressed.pattern_count(), 3);
    let branches = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());

    let expected = build(&full, &tree).evaluate(&tree, &branches, &[]).unwrap();
    let weighted = build(&compressed, &tree).evaluate(&tree, &branches, &[]).unwrap();
    assert_abs_diff_eq!(weighted, expected, epsilon = 1e-10);
}

#[test]
fn test_deterministic() {
    let (tree, patterns) = five_tips();
    let branches = mixed_branches();

    let first = build(&patterns, &tree).evaluate(&tree, &branches, &[]).unwrap();
    let second = build(&patterns, &tree).evaluate(&tree, &branches, &[]).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
}

// --- TESTS SINGLE BRANCH ---
#[test]
fn test_tip_branch_closed_form_symmetric() {
    let (tree, patterns) = four_tips();
    let model = SymmetricModel::new(4, 1.0);
    let p = model.transition_matrix(1.0);
    let branches = BranchAssignment::homogeneous(model);

    let mut likelihood = build(&patterns, &tree);
    let tip_a = likelihood.evaluate_branch(&tree, &branches, 0, &[]).unwrap();
    let expected: f64 = patterns
        .states_of("A")
        .unwrap()
        .iter()
        .map(|&a| (0..4).map(|s| 0.25 * p[[s, a]]).sum::<f64>().ln())
        .sum();
    assert_abs_diff_eq!(tip_a, expected, epsilon = 1e-12);
}

#[test]
fn test_tip_branch_closed_form() {
    let tree = parse_str("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
    let patterns = PatternList::from_sequences("01", &[("A", "1"), ("B", "0"), ("C", "0"), ("D", "1")]).unwrap();
    let model = GainLossModel::new(0.4, 1.1);
    let p = model.transition_matrix(1.0);
    let pi = model.frequencies().to_vec();
    let branches = BranchAssignment::homogeneous(model);

    let mut likelihood = build(&patterns, &tree);
    let tip_a = likelihood.evaluate_branch(&tree, &branches, 0, &[]).unwrap();
    let expected = (pi[0] * p[[0, 1]] + pi[1] * p[[1, 1]]).ln();
    assert_abs_diff_eq!(tip_a, expected, epsilon = 1e-12);

    // Cherry (A, B) below node 4
    let cherry = likelihood.evaluate_branch(&tree, &branches, 4, &[]).unwrap();
    let below: Vec<f64> = (0..2).map(|j| p[[j, 1]] * p[[j, 0]]).collect();
    let expected: f64 = (0..2).map(|s| pi[s] * (0..2).map(|j| p[[s, j]] * below[j]).sum::<f64>()).sum();
    assert_abs_diff_eq!(cherry, expected.ln(), epsilon = 1e-12);
}

#[test]
fn test_branch_derivatives_match_finite_differences() {
    let (tree, patterns) = four_tips();
    let mut branches = BranchAssignment::new(
        ModelDispatch::homogeneous(SymmetricModel::new(4, 0.7)),
        BranchRates::PerBranch(vec![0.4; 7]),
    );
    let mut likelihood = build(&patterns, &tree);

    // Every branch spans one time unit, so the rate equals the branch length
    for node in [0, 4] {
        let (log_likelihood, first, second) =
            likelihood.branch_log_likelihood_derivatives(&tree, &branches, node, &[]).unwrap();

        let mut at = |rate: f64| {
            branches.rates_mut().set_rate(node, rate, 7).unwrap();
            likelihood.evaluate_branch(&tree, &branches, node, &[Change::BranchRate(node)]).unwrap()
        };
        let h = 1e-4;
        let plus = at(0.4 + h);
        let minus = at(0.4 - h);
        let center = at(0.4);

        assert_abs_diff_eq!(center, log_likelihood, epsilon = 1e-12);
        assert_abs_diff_eq!(first, (plus - minus) / (2.0 * h), epsilon = 1e-6);
        assert_abs_diff_eq!(second, (plus - 2.0 * center + minus) / (h * h), epsilon = 1e-3);
    }
}

// --- TESTS CHANGE TRACKING ---
#[test]
fn test_tip_change_recomputes_ancestors_only() {
    let (tree, mut patterns) = four_tips();
    let branches = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
    let mut likelihood = build(&patterns, &tree);
    likelihood.evaluate(&tree, &branches, &[]).unwrap();

    let tip_c = tree.tip_index("C").unwrap();
    let states = vec![0, 0, 0, 0, 0, 4];
    let changed = likelihood
        .evaluate(&tree, &branches, &[Change::TipStates { tip: tip_c, states: states.clone() }])
        .unwrap();

    let mut expected_flags = vec![false; tree.num_vertices()];
    for ancestor in tree.ancestors(tip_c) {
        expected_flags[ancestor] = true;
    }
    assert_eq!(likelihood.update_flags(), expected_flags.as_slice());
    assert_eq!(likelihood.update_flags(), &[false, false, false, false, false, true, true]);
    assert_eq!(likelihood.tip_states(tip_c), Some(states.as_slice()));

    patterns.set_states("C", states).unwrap();
    let fresh = build(&patterns, &tree).evaluate(&tree, &branches, &[]).unwrap();
    assert_abs_diff_eq!(changed, fresh, epsilon = 1e-12);
}

#[test]
fn test_incremental_matches_fresh_engine() {
    let (mut tree, patterns) = five_tips();
    let mut branches = mixed_branches();
    let site_rates = SiteRates::equal_weights(vec![0.5, 1.5]).unwrap();
    let mut likelihood = TreeLikelihoodBuilder::new(&patterns, &tree)
        .with_site_rates(site_rates.clone())
        .build::<CpuBackend>()
        .unwrap();
    likelihood.evaluate(&tree, &branches, &[]).unwrap();

    let ab = tree.parent(tree.tip_index("A").unwrap()).unwrap();
    let de = tree.parent(tree.tip_index("D").unwrap()).unwrap();

    tree.set_height(ab, Height::new(0.6));
    let height_changed = likelihood.evaluate(&tree, &branches, &[Change::NodeHeight(ab)]).unwrap();
    assert!(likelihood.update_flags()[ab]);
    assert!(!likelihood.update_flags()[de]);
    assert_abs_diff_eq!(
        height_changed,
        reference_log_likelihood(&tree, &patterns, &branches, &site_rates),
        epsilon = 1e-10
    );

    branches.rates_mut().set_rate(de, 2.0, tree.num_vertices()).unwrap();
    branches.dispatch_mut().model_mut(1).unwrap().set_rate(0.3);
    let changes = [Change::BranchRate(de), Change::SubstitutionModel(1)];
    let model_changed = likelihood.evaluate(&tree, &branches, &changes).unwrap();
    assert_abs_diff_eq!(
        model_changed,
        reference_log_likelihood(&tree, &patterns, &branches, &site_rates),
        epsilon = 1e-10
    );

    let mut fresh = TreeLikelihoodBuilder::new(&patterns, &tree)
        .with_site_rates(site_rates)
        .build::<CpuBackend>()
        .unwrap();
    assert_abs_diff_eq!(model_changed, fresh.evaluate(&tree, &branches, &[]).unwrap(), epsilon = 1e-12);
}

#[test]
fn test_unreported_change_is_not_seen() {
    let (mut tree, patterns) = four_tips();
    let branches = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
    let mut likelihood = build(&patterns, &tree);
    let before = likelihood.evaluate(&tree, &branches, &[]).unwrap();

    tree.set_height(4, Height::new(0.2));
    let unreported = likelihood.evaluate(&tree, &branches, &[]).unwrap();
    assert_eq!(before.to_bits(), unreported.to_bits());

    let everything = likelihood.evaluate(&tree, &branches, &[Change::Everything]).unwrap();
    let fresh = build(&patterns, &tree).evaluate(&tree, &branches, &[]).unwrap();
    assert_abs_diff_eq!(everything, fresh, epsilon = 1e-12);
    assert!(likelihood.update_flags()[4..].iter().all(|&f| f));
}

// --- TESTS STORE & RESTORE ---
#[test]
fn test_restore_returns_stored_value() {
    let (mut tree, patterns) = five_tips();
    let branches = mixed_branches();
    let mut likelihood = build(&patterns, &tree);
    let stored = likelihood.evaluate(&tree, &branches, &[]).unwrap();
    likelihood.store_state();

    let ab = tree.parent(tree.tip_index("A").unwrap()).unwrap();
    let old_height = tree.height(ab);
    tree.set_height(ab, Height::new(0.75));
    let tip = tree.tip_index("E").unwrap();
    let changes = [Change::NodeHeight(ab), Change::TipStates { tip, states: vec![4; 10] }];
    let proposed = likelihood.evaluate(&tree, &branches, &changes).unwrap();
    assert!((proposed - stored).abs() > 1e-6);

    // Reject the proposal
    tree.set_height(ab, Height::new(old_height));
    likelihood.restore_state().unwrap();
    let operations = likelihood.statistics().partial_operations;
    let restored = likelihood.evaluate(&tree, &branches, &[]).unwrap();

    assert_eq!(restored.to_bits(), stored.to_bits());
    assert_eq!(likelihood.statistics().partial_operations, operations);
    assert_eq!(likelihood.tip_states(tip), patterns.states_of("E"));
}

#[test]
fn test_restore_after_repeated_evaluations() {
    let (mut tree, patterns) = five_tips();
    let branches = mixed_branches();
    let mut likelihood = build(&patterns, &tree);
    let stored = likelihood.evaluate(&tree, &branches, &[]).unwrap();
    likelihood.store_state();

    // Several evaluations of the same proposal before it is rejected
    let ab = tree.parent(tree.tip_index("A").unwrap()).unwrap();
    let old_height = tree.height(ab);
    let mut proposed = Vec::new();
    for height in [0.55, 0.4, 0.65] {
        tree.set_height(ab, Height::new(height));
        proposed.push(likelihood.evaluate(&tree, &branches, &[Change::NodeHeight(ab)]).unwrap());
    }
    likelihood.evaluate_branch(&tree, &branches, ab, &[]).unwrap();
    assert!(proposed.iter().all(|p| (p - stored).abs() > 1e-6));

    tree.set_height(ab, Height::new(old_height));
    likelihood.restore_state().unwrap();
    let restored = likelihood.evaluate(&tree, &branches, &[]).unwrap();
    assert_eq!(restored.to_bits(), stored.to_bits());

    // A second round after the restore
    likelihood.store_state();
    for height in [0.6, 0.35] {
        tree.set_height(ab, Height::new(height));
        likelihood.evaluate(&tree, &branches, &[Change::NodeHeight(ab)]).unwrap();
    }
    tree.set_height(ab, Height::new(old_height));
    likelihood.restore_state().unwrap();
    assert_eq!(likelihood.evaluate(&tree, &branches, &[]).unwrap().to_bits(), stored.to_bits());
}

#[test]
fn test_restore_without_store() {
    let (tree, patterns) = four_tips();
    let branches = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
    let mut likelihood = build(&patterns, &tree);
    likelihood.evaluate(&tree, &branches, &[]).unwrap();

    let err = likelihood.restore_state().unwrap_err();
    assert!(matches!(err.kind(), LikelihoodErrorType::Configuration(_)));
}

// --- TESTS ERRORS ---
#[test]
fn test_negative_branch_length_keeps_changes_pending() {
    let (mut tree, patterns) = four_tips();
    let branches = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
    let mut likelihood = build(&patterns, &tree);
    likelihood.evaluate(&tree, &branches, &[]).unwrap();

    // Node 4 above the root
    tree.set_height(4, Height::new(3.0));
    let err = likelihood.evaluate(&tree, &branches, &[Change::NodeHeight(4)]).unwrap_err();
    match err.kind() {
        LikelihoodErrorType::InvalidBranchLength { node, length } => {
            assert_eq!(*node, 4);
            assert_abs_diff_eq!(*length, -1.0, epsilon = 1e-12);
        }
        other => panic!("unexpected error {other:?}"),
    }

    // Fixing the height without reporting it again still applies the pending change
    tree.set_height(4, Height::new(0.5));
    let repaired = likelihood.evaluate(&tree, &branches, &[]).unwrap();
    let fresh = build(&patterns, &tree).evaluate(&tree, &branches, &[]).unwrap();
    assert_abs_diff_eq!(repaired, fresh, epsilon = 1e-12);
}

#[test]
fn test_short_branch_rates() {
    let (tree, patterns) = four_tips();
    let mut likelihood = build(&patterns, &tree);

    let short = BranchAssignment::new(
        ModelDispatch::homogeneous(SymmetricModel::jukes_cantor()),
        BranchRates::PerBranch(vec![1.0; 3]),
    );
    let err = likelihood.evaluate(&tree, &short, &[]).unwrap_err();
    assert!(matches!(err.kind(), LikelihoodErrorType::InvalidData(_)));
    let err = likelihood.evaluate_branch(&tree, &short, 0, &[]).unwrap_err();
    assert!(matches!(err.kind(), LikelihoodErrorType::InvalidData(_)));

    let full = BranchAssignment::new(
        ModelDispatch::homogeneous(SymmetricModel::jukes_cantor()),
        BranchRates::PerBranch(vec![1.0; 7]),
    );
    let strict = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
    let log_likelihood = likelihood.evaluate(&tree, &full, &[]).unwrap();
    let fresh = build(&patterns, &tree).evaluate(&tree, &strict, &[]).unwrap();
    assert_eq!(log_likelihood.to_bits(), fresh.to_bits());
}

#[test]
fn test_invalid_change_list_applies_nothing() {
    let (tree, patterns) = four_tips();
    let branches = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
    let mut likelihood = build(&patterns, &tree);
    let before = likelihood.evaluate(&tree, &branches, &[]).unwrap();
    likelihood
        .compute_differentials(&tree, &branches, &BranchLengthDifferential, DerivativeOrder::First)
        .unwrap();
    let gradient = likelihood.gradient().unwrap().to_vec();

    let changes = [Change::TipStates { tip: 0, states: vec![3; 6] }, Change::NodeHeight(4), Change::BranchRate(99)];
    let err = likelihood.evaluate(&tree, &branches, &changes).unwrap_err();
    assert!(matches!(err.kind(), LikelihoodErrorType::InvalidTree(_)));

    // Neither the tip states nor the differentials were touched
    assert_eq!(likelihood.tip_states(0), patterns.states_of("A"));
    assert_eq!(likelihood.gradient().unwrap(), &gradient[..]);
    let operations = likelihood.statistics().partial_operations;
    let after = likelihood.evaluate(&tree, &branches, &[]).unwrap();
    assert_eq!(after.to_bits(), before.to_bits());
    assert_eq!(likelihood.statistics().partial_operations, operations);
}

#[test]
fn test_backend_failure_rolls_back() {
    let (tree, patterns) = four_tips();
    let wrong = BranchAssignment::homogeneous(SymmetricModel::new(2, 1.0));
    let right = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
    let mut likelihood = build(&patterns, &tree);

    let err = likelihood.evaluate(&tree, &wrong, &[]).unwrap_err();
    assert!(matches!(err.kind(), LikelihoodErrorType::ComputeBackend(_)));
    assert_eq!(likelihood.statistics().evaluations, 0);

    let recovered = likelihood.evaluate(&tree, &right, &[]).unwrap();
    let fresh = build(&patterns, &tree).evaluate(&tree, &right, &[]).unwrap();
    assert_eq!(recovered.to_bits(), fresh.to_bits());
}

#[test]
fn test_configuration_errors() {
    let (tree, patterns) = four_tips();
    let missing_resource = TreeLikelihoodBuilder::new(&patterns, &tree).with_resources(vec![3]).build::<CpuBackend>();
    assert!(matches!(missing_resource.unwrap_err().kind(), LikelihoodErrorType::Configuration(_)));

    let gpu = TreeLikelihoodBuilder::new(&patterns, &tree)
        .with_requirement_flags(ResourceFlags::PROCESSOR_GPU)
        .build::<CpuBackend>();
    assert!(matches!(gpu.unwrap_err().kind(), LikelihoodErrorType::Configuration(_)));

    let preferred = TreeLikelihoodBuilder::new(&patterns, &tree)
        .with_preference_flags(ResourceFlags::PROCESSOR_GPU)
        .build::<CpuBackend>();
    assert!(preferred.is_ok());
}

// --- TESTS SCALING ---
#[test]
fn test_scaled_matches_unscaled() {
    let (mut tree, patterns) = caterpillar(40);
    let branches = BranchAssignment::homogeneous(SymmetricModel::jukes_cantor());
    let mut unscaled = build(&patterns, &tree);
    let mut scaled = TreeLikelihoodBuilder::new(&patterns, &tree)
        .with_scaling(ScalingMode::Always)
        .build::<CpuBackend>()
        .unwrap();

    let expected = unscaled.evaluate(&tree, &branches, &[]).unwrap();
    assert_abs_diff_eq!(scaled.evaluate(&tree, &branches, &[]).unwrap(), expected, epsilon = 1e-8);

    // Incremental update reuses scale factors of untouched nodes
    let node = tree.parent(tree.tip_index("t3").unwrap()).unwrap();
    let height = tree.height(node);
    tree.set_height(node, Height::new(height - 0.05));
    let changes = [Change::NodeHeight(node)];
    let expected = unscaled.evaluate(&tree, &branches, &changes).unwrap();
    assert_abs_diff_eq!(scaled.evaluate(&tree, &branches, &changes).unwrap(), expected, epsilon = 1e-8);
}
