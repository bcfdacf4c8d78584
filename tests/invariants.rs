//! Cross-cutting invariants: stochastic matrix rows, zero-edge identities,
//! post-order reorder invariance, transfer round trips, ambiguity handling,
//! and the uniform-likelihood identity evaluation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use felsite::core::operation::{Operation, OP_NONE};
use felsite::model::jukes_cantor_eigensystem;
use felsite::{Flags, Instance, InstanceSizes};

fn jc_instance(states: usize, patterns: usize, categories: usize, tips: usize) -> Instance {
    let sizes = InstanceSizes {
        tip_count: tips,
        partials_count: tips.max(2),
        compact_count: tips,
        state_count: states,
        pattern_count: patterns,
        eigen_count: 1,
        matrix_count: 2 * tips,
        category_count: categories,
        scale_count: 2,
    };
    let mut instance = Instance::create(sizes, Flags::NONE, Flags::NONE, None).unwrap();
    let (evec, ivec, eval) = jukes_cantor_eigensystem(states);
    instance.set_eigen_decomposition(0, &evec, &ivec, &eval).unwrap();
    let rates: Vec<f64> = (0..categories)
        .map(|i| 2.0 * (i as f64 + 0.5) / categories as f64)
        .collect();
    instance.set_category_rates(&rates).unwrap();
    instance
        .set_category_weights(0, &vec![1.0 / categories as f64; categories])
        .unwrap();
    instance
        .set_state_frequencies(0, &vec![1.0 / states as f64; states])
        .unwrap();
    instance.set_pattern_weights(&vec![1.0; patterns]).unwrap();
    instance
}

#[test]
fn rows_sum_to_one_across_state_counts() {
    for states in [2usize, 4, 60] {
        let mut instance = jc_instance(states, 3, 3, 2);
        instance
            .update_transition_matrices(0, &[0, 1], None, None, &[0.37, 1.42])
            .unwrap();
        let mut matrix = vec![0.0; 3 * states * states];
        for slot in 0..2 {
            instance.get_transition_matrix(slot, &mut matrix).unwrap();
            for block in matrix.chunks_exact(states * states) {
                for i in 0..states {
                    let sum: f64 = (0..states).map(|j| block[i * states + j]).sum();
                    assert!(
                        (sum - 1.0).abs() < 1e-10,
                        "S={} row {} sums to {}",
                        states,
                        i,
                        sum
                    );
                }
            }
        }
    }
}

#[test]
fn zero_edge_produces_identity() {
    let states = 4;
    let mut instance = jc_instance(states, 2, 2, 2);
    instance
        .update_transition_matrices(0, &[0], None, None, &[0.0])
        .unwrap();
    let mut matrix = vec![0.0; 2 * states * states];
    instance.get_transition_matrix(0, &mut matrix).unwrap();
    for block in matrix.chunks_exact(states * states) {
        for i in 0..states {
            for j in 0..states {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((block[i * states + j] - expected).abs() < 1e-14);
            }
        }
    }
}

#[test]
fn identity_evaluation_is_minus_k_log_s() {
    for states in [2usize, 4, 5] {
        let patterns = 7;
        let mut rng = StdRng::seed_from_u64(7);
        let mut instance = jc_instance(states, patterns, 2, 3);
        // Zero-length branches collapse the tree to a point, so every tip
        // must carry the same column for the site likelihood to be 1/S.
        let data: Vec<u32> = (0..patterns)
            .map(|_| rng.gen_range(0..states) as u32)
            .collect();
        for tip in 0..3 {
            instance.set_tip_states(tip, &data).unwrap();
        }
        instance
            .update_transition_matrices(0, &[0, 1, 2, 3], None, None, &[0.0; 4])
            .unwrap();
        let ops = [
            Operation::from([3, OP_NONE, OP_NONE, 0, 0, 1, 1]),
            Operation::from([4, OP_NONE, OP_NONE, 3, 3, 2, 2]),
        ];
        instance.update_partials(&ops, OP_NONE).unwrap();
        let logl = instance
            .calculate_root_log_likelihoods(&[4], &[0], &[0], &[OP_NONE])
            .unwrap();
        let expected = -(patterns as f64) * (states as f64).ln();
        assert!(
            (logl - expected).abs() < 1e-10,
            "S={}: {} vs {}",
            states,
            logl,
            expected
        );
    }
}

#[test]
fn post_order_reorderings_agree() {
    // Four tips, two cherries: the cherry updates commute.
    let states = 4;
    let patterns = 11;
    let mut rng = StdRng::seed_from_u64(99);
    let data: Vec<Vec<u32>> = (0..4)
        .map(|_| {
            (0..patterns)
                .map(|_| rng.gen_range(0..states) as u32)
                .collect()
        })
        .collect();

    let mut run = |order_flip: bool| -> f64 {
        let mut instance = jc_instance(states, patterns, 2, 4);
        for (tip, states_vec) in data.iter().enumerate() {
            instance.set_tip_states(tip, states_vec).unwrap();
        }
        instance
            .update_transition_matrices(
                0,
                &[0, 1, 2, 3, 4, 5],
                None,
                None,
                &[0.1, 0.2, 0.3, 0.4, 0.25, 0.35],
            )
            .unwrap();
        let cherry_a = Operation::from([4, OP_NONE, OP_NONE, 0, 0, 1, 1]);
        let cherry_b = Operation::from([5, OP_NONE, OP_NONE, 2, 2, 3, 3]);
        let root = Operation::from([6, OP_NONE, OP_NONE, 4, 4, 5, 5]);
        let ops = if order_flip {
            [cherry_b, cherry_a, root]
        } else {
            [cherry_a, cherry_b, root]
        };
        instance.update_partials(&ops, OP_NONE).unwrap();
        instance
            .calculate_root_log_likelihoods(&[6], &[0], &[0], &[OP_NONE])
            .unwrap()
    };

    let a = run(false);
    let b = run(true);
    assert!((a - b).abs() < 1e-12, "{} vs {}", a, b);
}

#[test]
fn partials_round_trip_with_and_without_scaling() {
    let states = 4;
    let patterns = 5;
    let categories = 2;
    let mut instance = jc_instance(states, patterns, categories, 2);
    let values: Vec<f64> = (0..categories * patterns * states)
        .map(|i| (i as f64 + 1.0) * 0.01)
        .collect();
    instance.set_partials(3, &values).unwrap();

    let mut out = vec![0.0; values.len()];
    instance.get_partials(3, OP_NONE, &mut out).unwrap();
    assert_eq!(out, values);

    // With a scale buffer the stored divisors are multiplied back in; the
    // default buffers hold the raw identity so results are unchanged only
    // after a reset.
    instance.reset_scale_factors(0).unwrap();
    instance.get_partials(3, 0, &mut out).unwrap();
    for (a, b) in out.iter().zip(&values) {
        assert!((a - b).abs() < 1e-15);
    }
}

#[test]
fn ambiguous_tip_equals_uniform_partial() {
    let states = 4;
    let patterns = 6;
    let mut rng = StdRng::seed_from_u64(3);
    // Tip 1 data includes the ambiguity code at two sites.
    let tip0: Vec<u32> = (0..patterns)
        .map(|_| rng.gen_range(0..states) as u32)
        .collect();
    let mut tip1: Vec<u32> = (0..patterns)
        .map(|_| rng.gen_range(0..states) as u32)
        .collect();
    tip1[1] = states as u32;
    tip1[4] = states as u32;

    let eval_with = |compact: bool| -> f64 {
        let sizes = InstanceSizes {
            tip_count: 2,
            partials_count: 2,
            compact_count: if compact { 2 } else { 0 },
            state_count: states,
            pattern_count: patterns,
            eigen_count: 1,
            matrix_count: 4,
            category_count: 1,
            scale_count: 0,
        };
        let mut instance = Instance::create(sizes, Flags::NONE, Flags::NONE, None).unwrap();
        let (evec, ivec, eval) = jukes_cantor_eigensystem(states);
        instance.set_eigen_decomposition(0, &evec, &ivec, &eval).unwrap();
        instance.set_category_rates(&[1.0]).unwrap();
        instance.set_category_weights(0, &[1.0]).unwrap();
        instance
            .set_state_frequencies(0, &vec![0.25; states])
            .unwrap();
        instance.set_pattern_weights(&vec![1.0; patterns]).unwrap();

        if compact {
            instance.set_tip_states(0, &tip0).unwrap();
            instance.set_tip_states(1, &tip1).unwrap();
        } else {
            let expand = |data: &[u32]| -> Vec<f64> {
                let mut p = vec![0.0; data.len() * states];
                for (k, &st) in data.iter().enumerate() {
                    if st as usize >= states {
                        p[k * states..(k + 1) * states].fill(1.0);
                    } else {
                        p[k * states + st as usize] = 1.0;
                    }
                }
                p
            };
            instance.set_tip_partials(0, &expand(&tip0)).unwrap();
            instance.set_tip_partials(1, &expand(&tip1)).unwrap();
        }

        instance
            .update_transition_matrices(0, &[0, 1], None, None, &[0.3, 0.9])
            .unwrap();
        let ops = [Operation::from([2, OP_NONE, OP_NONE, 0, 0, 1, 1])];
        instance.update_partials(&ops, OP_NONE).unwrap();
        instance
            .calculate_root_log_likelihoods(&[2], &[0], &[0], &[OP_NONE])
            .unwrap()
    };

    let a = eval_with(true);
    let b = eval_with(false);
    assert!((a - b).abs() < 1e-12, "{} vs {}", a, b);
}

#[test]
fn set_transition_matrix_is_verbatim() {
    let states = 4;
    let mut instance = jc_instance(states, 2, 2, 2);
    let matrix: Vec<f64> = (0..2 * states * states).map(|i| i as f64 * 0.125).collect();
    instance.set_transition_matrix(0, &matrix, 1.0).unwrap();
    let mut out = vec![0.0; matrix.len()];
    instance.get_transition_matrix(0, &mut out).unwrap();
    assert_eq!(out, matrix);
}
