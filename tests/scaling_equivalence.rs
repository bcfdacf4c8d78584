//! Rescaling disciplines against the unscaled computation: a deep balanced
//! Jukes-Cantor tree underflows without scaling and recovers the analytic
//! log-likelihood under every discipline; shallow trees agree across all
//! disciplines and both scaler representations.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use felsite::core::operation::{Operation, OP_NONE};
use felsite::model::jukes_cantor_eigensystem;
use felsite::{Flags, Instance, InstanceSizes};

const STATES: usize = 4;
const BRANCH: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Discipline {
    None,
    Manual,
    Auto,
    Dynamic,
    Always,
}

struct Harness {
    instance: Instance,
    ops: Vec<Operation>,
    root: i32,
    cumulative: i32,
}

fn build(tips: usize, patterns: usize, discipline: Discipline, log_scalers: bool) -> Harness {
    let internals = tips - 1;
    let sizes = InstanceSizes {
        tip_count: tips,
        partials_count: internals,
        compact_count: tips,
        state_count: STATES,
        pattern_count: patterns,
        eigen_count: 1,
        matrix_count: 2 * tips - 2,
        category_count: 1,
        scale_count: internals + 1,
    };
    let mut requirement = if log_scalers {
        Flags::SCALERS_LOG
    } else {
        Flags::SCALERS_RAW
    };
    requirement |= match discipline {
        Discipline::None => Flags::NONE,
        Discipline::Manual => Flags::SCALING_MANUAL,
        Discipline::Auto => Flags::SCALING_AUTO,
        Discipline::Dynamic => Flags::SCALING_DYNAMIC,
        Discipline::Always => Flags::SCALING_ALWAYS,
    };
    let mut instance = Instance::create(sizes, Flags::NONE, requirement, None).unwrap();

    let mut rng = StdRng::seed_from_u64(2024);
    for tip in 0..tips {
        let data: Vec<u32> = (0..patterns)
            .map(|_| rng.gen_range(0..STATES) as u32)
            .collect();
        instance.set_tip_states(tip, &data).unwrap();
    }
    let (evec, ivec, eval) = jukes_cantor_eigensystem(STATES);
    instance.set_eigen_decomposition(0, &evec, &ivec, &eval).unwrap();
    instance.set_category_rates(&[1.0]).unwrap();
    instance.set_category_weights(0, &[1.0]).unwrap();
    instance.set_state_frequencies(0, &[0.25; STATES]).unwrap();
    instance.set_pattern_weights(&vec![1.0; patterns]).unwrap();

    let node_indices: Vec<usize> = (0..2 * tips - 2).collect();
    let edges = vec![BRANCH; node_indices.len()];
    instance
        .update_transition_matrices(0, &node_indices, None, None, &edges)
        .unwrap();

    // Balanced pairing: internal buffer tips+i joins buffers 2i and 2i+1.
    let manual_like = matches!(discipline, Discipline::Manual | Discipline::Dynamic);
    let ops: Vec<Operation> = (0..internals)
        .map(|i| {
            Operation::from([
                (tips + i) as i32,
                if manual_like { i as i32 } else { OP_NONE },
                if discipline == Discipline::Dynamic {
                    i as i32
                } else {
                    OP_NONE
                },
                (2 * i) as i32,
                (2 * i) as i32,
                (2 * i + 1) as i32,
                (2 * i + 1) as i32,
            ])
        })
        .collect();
    let root = (2 * tips - 2) as i32;
    let cumulative = if manual_like { internals as i32 } else { OP_NONE };

    Harness {
        instance,
        ops,
        root,
        cumulative,
    }
}

fn evaluate(h: &mut Harness) -> felsite::Result<f64> {
    if h.cumulative != OP_NONE {
        h.instance.reset_scale_factors(h.cumulative as usize)?;
    }
    h.instance.update_partials(&h.ops, h.cumulative)?;
    h.instance
        .calculate_root_log_likelihoods(&[h.root], &[0], &[0], &[h.cumulative])
}

#[test]
fn shallow_tree_disciplines_agree() {
    let tips = 64;
    let patterns = 40;
    let reference = evaluate(&mut build(tips, patterns, Discipline::None, true)).unwrap();
    assert!(reference.is_finite());

    for discipline in [
        Discipline::Manual,
        Discipline::Auto,
        Discipline::Dynamic,
        Discipline::Always,
    ] {
        let logl = evaluate(&mut build(tips, patterns, discipline, true)).unwrap();
        assert!(
            (logl - reference).abs() < 1e-6 * reference.abs(),
            "discipline disagrees: {} vs {}",
            logl,
            reference
        );
    }
}

#[test]
fn raw_and_log_scalers_agree() {
    let tips = 64;
    let patterns = 24;
    let log_l = evaluate(&mut build(tips, patterns, Discipline::Manual, true)).unwrap();
    let raw_l = evaluate(&mut build(tips, patterns, Discipline::Manual, false)).unwrap();
    assert!(
        (log_l - raw_l).abs() < 1e-8 * log_l.abs(),
        "{} vs {}",
        log_l,
        raw_l
    );
}

#[test]
fn deep_tree_underflows_without_scaling() {
    let tips = 1024;
    let patterns = 20;
    let err = evaluate(&mut build(tips, patterns, Discipline::None, true)).unwrap_err();
    assert_eq!(err.code(), -8);
}

#[test]
fn deep_tree_recovers_analytic_value_with_scaling() {
    let tips = 1024usize;
    let patterns = 20;
    // At branch length 10 every transition row is essentially stationary,
    // so each site's likelihood is 0.25 per tip: logL = K * T * ln(1/4) up
    // to O(e^{-4t/3}) corrections.
    let expected = patterns as f64 * tips as f64 * 0.25f64.ln();

    let mut results = Vec::new();
    for discipline in [Discipline::Manual, Discipline::Auto, Discipline::Always] {
        let logl = evaluate(&mut build(tips, patterns, discipline, true)).unwrap();
        assert!(logl.is_finite());
        assert!(
            (logl - expected).abs() < 1e-4 * expected.abs(),
            "{:?}: {} vs analytic {}",
            discipline,
            logl,
            expected
        );
        results.push(logl);
    }
    for pair in results.windows(2) {
        assert!((pair[0] - pair[1]).abs() < 1e-6 * pair[0].abs());
    }
}

#[test]
fn dynamic_discipline_carries_factors_between_evaluations() {
    let tips = 128;
    let patterns = 16;
    let mut h = build(tips, patterns, Discipline::Dynamic, true);
    h.instance.set_rescale_frequency(2);
    // First evaluation rescales, second carries the stored factors.
    let first = evaluate(&mut h).unwrap();
    let second = evaluate(&mut h).unwrap();
    assert!(
        (first - second).abs() < 1e-9 * first.abs(),
        "{} vs {}",
        first,
        second
    );
}

#[test]
fn auto_threshold_matches_under_both_representations() {
    // The auto trigger is pinned to 2^-50 regardless of representation, so
    // raw and log runs rescale identically and agree tightly.
    let tips = 256;
    let patterns = 12;
    let log_l = evaluate(&mut build(tips, patterns, Discipline::Auto, true)).unwrap();
    let raw_l = evaluate(&mut build(tips, patterns, Discipline::Auto, false)).unwrap();
    assert!(
        (log_l - raw_l).abs() < 1e-9 * log_l.abs(),
        "{} vs {}",
        log_l,
        raw_l
    );
}
