//! Derivative machinery on a sixteen-taxon random tree: analytic edge
//! derivatives against central finite differences, pre-order gradients, and
//! the cross-product trace identity (expected substitutions equal total
//! tree length under a unit-rate model).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use felsite::core::operation::{Operation, OP_NONE};
use felsite::model::jukes_cantor_eigensystem;
use felsite::{Flags, Instance, InstanceSizes};

const TAXA: usize = 16;
const STATES: usize = 4;
const PATTERNS: usize = 50;
const NODES: usize = 2 * TAXA - 1; // 31, root = 30
const ROOT: usize = NODES - 1;
const MIRROR: usize = 2 * NODES - 1; // post + pre = 61
const DIFF_SLOT: usize = 31;
const D1_SLOT: usize = 32;
const D2_SLOT: usize = 33;

struct Fixture {
    ops: Vec<Operation>,
    edges: Vec<f64>,
    tip_data: Vec<Vec<u32>>,
}

impl Fixture {
    fn new() -> Fixture {
        let mut rng = StdRng::seed_from_u64(1616);
        let tip_data: Vec<Vec<u32>> = (0..TAXA)
            .map(|_| {
                (0..PATTERNS)
                    .map(|_| rng.gen_range(0..STATES) as u32)
                    .collect()
            })
            .collect();
        let mut edges: Vec<f64> = (0..NODES).map(|_| rng.gen_range(0.05..0.4)).collect();

        // Random pairing topology.
        let mut live: Vec<usize> = (0..TAXA).collect();
        let mut ops = Vec::new();
        let mut next = TAXA;
        while live.len() > 1 {
            let a = live.swap_remove(rng.gen_range(0..live.len()));
            let b = live.swap_remove(rng.gen_range(0..live.len()));
            ops.push(Operation::from([
                next as i32,
                OP_NONE,
                OP_NONE,
                a as i32,
                a as i32,
                b as i32,
                b as i32,
            ]));
            live.push(next);
            next += 1;
        }
        // Collapse the root's first-child edge so that child's partials act
        // as the parent side of the remaining edge in edge reductions. The
        // parent side must be an internal buffer, so a tip lands second.
        let last = ops.last_mut().unwrap();
        if (last.child1_partials as usize) < TAXA {
            std::mem::swap(&mut last.child1_partials, &mut last.child2_partials);
            std::mem::swap(&mut last.child1_matrix, &mut last.child2_matrix);
        }
        edges[last.child1_partials as usize] = 0.0;
        Fixture {
            ops,
            edges,
            tip_data,
        }
    }

    fn parent_side(&self) -> usize {
        self.ops.last().unwrap().child1_partials as usize
    }

    fn child_side(&self) -> usize {
        self.ops.last().unwrap().child2_partials as usize
    }

    fn instance(&self) -> Instance {
        let sizes = InstanceSizes {
            tip_count: TAXA,
            partials_count: 2 * NODES - TAXA, // room for pre-order mirrors
            compact_count: TAXA,
            state_count: STATES,
            pattern_count: PATTERNS,
            eigen_count: 1,
            matrix_count: 40,
            category_count: 1,
            scale_count: 0,
        };
        let mut instance = Instance::create(sizes, Flags::NONE, Flags::NONE, None).unwrap();
        for (tip, data) in self.tip_data.iter().enumerate() {
            instance.set_tip_states(tip, data).unwrap();
        }
        let (evec, ivec, eval) = jukes_cantor_eigensystem(STATES);
        instance.set_eigen_decomposition(0, &evec, &ivec, &eval).unwrap();
        instance.set_category_rates(&[1.0]).unwrap();
        instance.set_category_weights(0, &[1.0]).unwrap();
        instance.set_state_frequencies(0, &[0.25; STATES]).unwrap();
        instance.set_pattern_weights(&[1.0; PATTERNS]).unwrap();
        instance
    }

    /// Root log-likelihood with an optional edge-length override.
    fn log_likelihood(&self, override_edge: Option<(usize, f64)>) -> f64 {
        let mut instance = self.instance();
        let mut edges = self.edges.clone();
        if let Some((node, b)) = override_edge {
            edges[node] = b;
        }
        let nodes: Vec<usize> = (0..ROOT).collect();
        instance
            .update_transition_matrices(0, &nodes, None, None, &edges[..ROOT])
            .unwrap();
        instance.update_partials(&self.ops, OP_NONE).unwrap();
        instance
            .calculate_root_log_likelihoods(&[ROOT as i32], &[0], &[0], &[OP_NONE])
            .unwrap()
    }

    /// Fully evaluated instance with post- and pre-order partials and the
    /// scaled-Q differential matrix installed.
    fn evaluated(&self) -> Instance {
        let mut instance = self.instance();
        let nodes: Vec<usize> = (0..ROOT).collect();
        instance
            .update_transition_matrices(0, &nodes, None, None, &self.edges[..ROOT])
            .unwrap();
        instance.update_partials(&self.ops, OP_NONE).unwrap();
        instance
            .calculate_root_log_likelihoods(&[ROOT as i32], &[0], &[0], &[OP_NONE])
            .unwrap();

        // Root prior into the root's mirror buffer, then walk downward.
        let prior = vec![0.25; PATTERNS * STATES];
        instance.set_partials(MIRROR - ROOT, &prior).unwrap();
        let mut pre_ops = Vec::new();
        for op in self.ops.iter().rev() {
            let parent = op.destination as usize;
            let c1 = op.child1_partials as usize;
            let c2 = op.child2_partials as usize;
            pre_ops.push(Operation::from([
                (MIRROR - c1) as i32,
                OP_NONE,
                OP_NONE,
                (MIRROR - parent) as i32,
                c1 as i32,
                c2 as i32,
                c2 as i32,
            ]));
            pre_ops.push(Operation::from([
                (MIRROR - c2) as i32,
                OP_NONE,
                OP_NONE,
                (MIRROR - parent) as i32,
                c2 as i32,
                c1 as i32,
                c1 as i32,
            ]));
        }
        instance.update_pre_partials(&pre_ops, OP_NONE).unwrap();

        // Unit-rate Jukes-Cantor generator as the differential matrix.
        let mut q = vec![0.0; STATES * STATES];
        for i in 0..STATES {
            for j in 0..STATES {
                q[i * STATES + j] = if i == j {
                    -1.0
                } else {
                    1.0 / (STATES as f64 - 1.0)
                };
            }
        }
        instance.set_differential_matrix(DIFF_SLOT, &q).unwrap();
        instance
    }
}

#[test]
fn edge_reduction_matches_root_reduction() {
    let fixture = Fixture::new();
    let root_logl = fixture.log_likelihood(None);

    let mut instance = fixture.evaluated();
    let child = fixture.child_side();
    let edge = instance
        .calculate_edge_log_likelihoods(
            fixture.parent_side(),
            child,
            child,
            None,
            None,
            0,
            0,
            OP_NONE,
        )
        .unwrap();
    assert!(
        (edge.log_likelihood - root_logl).abs() < 1e-10,
        "{} vs {}",
        edge.log_likelihood,
        root_logl
    );
}

#[test]
fn edge_derivatives_match_finite_differences() {
    let fixture = Fixture::new();
    let child = fixture.child_side();
    let b = fixture.edges[child];
    let h = 1e-5;

    let mut instance = fixture.evaluated();
    let nodes = [child];
    let d1_slots = [D1_SLOT];
    let d2_slots = [D2_SLOT];
    instance
        .update_transition_matrices(0, &nodes, Some(&d1_slots), Some(&d2_slots), &[b])
        .unwrap();
    let edge = instance
        .calculate_edge_log_likelihoods(
            fixture.parent_side(),
            child,
            child,
            Some(D1_SLOT),
            Some(D2_SLOT),
            0,
            0,
            OP_NONE,
        )
        .unwrap();

    let f0 = fixture.log_likelihood(None);
    let hi = fixture.log_likelihood(Some((child, b + h)));
    let lo = fixture.log_likelihood(Some((child, b - h)));
    let d1_fd = (hi - lo) / (2.0 * h);
    let d2_fd = (hi - 2.0 * f0 + lo) / (h * h);

    let d1 = edge.first.unwrap();
    let d2 = edge.second.unwrap();
    assert!(
        (d1 - d1_fd).abs() < 1e-5 * (1.0 + d1.abs()),
        "d1 {} vs fd {}",
        d1,
        d1_fd
    );
    assert!(
        (d2 - d2_fd).abs() < 1e-3 * (1.0 + d2.abs()),
        "d2 {} vs fd {}",
        d2,
        d2_fd
    );
}

#[test]
fn pre_order_gradients_match_finite_differences() {
    let fixture = Fixture::new();
    let mut instance = fixture.evaluated();

    let posts: Vec<usize> = (0..ROOT).collect();
    let pres: Vec<usize> = posts.iter().map(|&n| MIRROR - n).collect();
    let diffs = vec![DIFF_SLOT; posts.len()];
    let mut per_site = vec![0.0; posts.len() * PATTERNS];
    let mut sums = vec![0.0; posts.len()];
    instance
        .calculate_edge_derivatives(&posts, &pres, &diffs, 0, &mut per_site, &mut sums)
        .unwrap();

    let h = 1e-5;
    for &node in &[0usize, 3, 17, 25] {
        if node == fixture.parent_side() {
            continue;
        }
        let b = fixture.edges[node];
        let hi = fixture.log_likelihood(Some((node, b + h)));
        let lo = fixture.log_likelihood(Some((node, b - h)));
        let fd = (hi - lo) / (2.0 * h);
        assert!(
            (sums[node] - fd).abs() < 1e-5 * (1.0 + fd.abs()),
            "node {}: gradient {} vs fd {}",
            node,
            sums[node],
            fd
        );
    }
}

#[test]
fn cross_product_trace_counts_expected_substitutions() {
    let fixture = Fixture::new();
    let mut instance = fixture.evaluated();

    let posts: Vec<usize> = (0..ROOT).collect();
    let pres: Vec<usize> = posts.iter().map(|&n| MIRROR - n).collect();
    let lengths: Vec<f64> = posts.iter().map(|&n| fixture.edges[n]).collect();

    let mut cross = vec![0.0; STATES * STATES];
    instance
        .calculate_cross_product_derivatives(&posts, &pres, 0, 0, &lengths, &mut cross)
        .unwrap();

    // With one unit-rate category, each edge contributes t_e per site to
    // the trace, so the total is K times the tree length.
    let trace: f64 = (0..STATES).map(|i| cross[i * STATES + i]).sum();
    let tree_length: f64 = lengths.iter().sum();
    let expected = PATTERNS as f64 * tree_length;
    assert!(
        (trace - expected).abs() < 1e-4 * expected,
        "trace {} vs {}",
        trace,
        expected
    );
}
