//! Three-tip HKY85 gradient walkthrough.
//!
//! Evaluates the classic three-taxon nucleotide(+gap) example: root
//! log-likelihood, pre-order partials, per-edge gradients against the
//! differential matrices, and the cross-product accumulator. The reference
//! root log-likelihood is -18.04619478977292.

use felsite::core::operation::{Operation, OP_NONE};
use felsite::{Flags, Instance, InstanceSizes};

const STATES: usize = 5;
const PATTERNS: usize = 4;
const CATEGORIES: usize = 2;

fn states_of(sequence: &str) -> Vec<u32> {
    sequence
        .chars()
        .map(|c| match c {
            'A' => 0,
            'C' => 1,
            'G' => 2,
            'T' => 3,
            _ => STATES as u32,
        })
        .collect()
}

fn main() {
    println!("Available resources:");
    for (i, r) in felsite::registry::resources().iter().enumerate() {
        println!("\tResource {}: {} ({})", i, r.name, r.description);
    }
    println!();

    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("hmcgrad failed: {} (code {})", e, e.code());
            std::process::exit(1);
        }
    }
}

fn run() -> felsite::Result<()> {
    let sizes = InstanceSizes {
        tip_count: 3,
        partials_count: 10,
        compact_count: 3,
        state_count: STATES,
        pattern_count: PATTERNS,
        eigen_count: 1,
        matrix_count: 12,
        category_count: CATEGORIES,
        scale_count: 0,
    };
    let mut instance = Instance::create(
        sizes,
        Flags::PROCESSOR_CPU | Flags::SCALERS_RAW,
        Flags::EIGEN_REAL | Flags::PREORDER_TRANSPOSE_AUTO,
        None,
    )?;
    let details = instance.details();
    println!("Using resource {}: {}", details.resource_number, details.resource_name);
    println!("\tImpl : {}\n", details.impl_name);

    instance.set_tip_states(0, &states_of("GAGT"))?;
    instance.set_tip_states(1, &states_of("GAGG"))?;
    instance.set_tip_states(2, &states_of("AAAT"))?;

    let rates = [0.14251623900062188, 1.857483760999378];
    instance.set_category_rates(&rates)?;
    instance.set_category_weights(0, &[0.5, 0.5])?;
    let freqs = [0.1, 0.3, 0.2, 0.4, 0.0];
    instance.set_state_frequencies(0, &freqs)?;
    instance.set_pattern_weights(&[1.0; PATTERNS])?;

    // HKY85 eigensystem over four nucleotides plus an absorbing gap state.
    let evec = [
        0.9819805, 0.040022305, 0.04454354, -0.5, 0.0, //
        -0.1091089, -0.002488732, 0.81606029, -0.5, 0.0, //
        -0.1091089, -0.896939683, -0.11849713, -0.5, 0.0, //
        -0.1091089, 0.440330814, -0.56393254, -0.5, 0.0, //
        0.0, 0.0, 0.0, 0.0, 1.0,
    ];
    let ivec = [
        0.9165151, -0.3533241, -0.1573578, -0.4058332, 0.0, //
        0.0, 0.2702596, -0.8372848, 0.5670252, 0.0, //
        0.0, 0.8113638, -0.2686725, -0.5426913, 0.0, //
        -0.2, -0.6, -0.4, -0.8, 0.0, //
        0.0, 0.0, 0.0, 0.0, 1.0,
    ];
    let eval = [
        -1.42857105618099456,
        -1.42857095607719153,
        -1.42857087221423851,
        0.0,
        0.0,
    ];
    instance.set_eigen_decomposition(0, &evec, &ivec, &eval)?;

    let node_indices = [0usize, 1, 2, 3];
    let edge_lengths = [0.6, 0.6, 1.3, 0.7];
    instance.update_transition_matrices(0, &node_indices, None, None, &edge_lengths)?;

    // Differential matrices: Q scaled by the category rate, Q² by its square.
    #[rustfmt::skip]
    let q: [f64; 25] = [
        -1.285714,  0.4285712,  0.2857142,  0.5714284, 0.0,
         0.142857, -0.9999997,  0.2857143,  0.5714284, 0.0,
         0.142857,  0.4285714, -1.1428568,  0.5714284, 0.0,
         0.142857,  0.4285713,  0.2857142, -0.8571426, 0.0,
         0.0, 0.0, 0.0, 0.0, 0.0,
    ];
    #[rustfmt::skip]
    let q2: [f64; 25] = [
         1.8367333, -0.6122443, -0.4081629, -0.8163261, 0.0,
        -0.2040814,  1.4285705, -0.4081632, -0.8163259, 0.0,
        -0.2040814, -0.6122447,  1.6326522, -0.8163261, 0.0,
        -0.2040814, -0.6122446, -0.4081630,  1.2244890, 0.0,
         0.0, 0.0, 0.0, 0.0, 0.0,
    ];
    let mut scaled_q = vec![0.0f64; 25 * CATEGORIES];
    let mut scaled_q2 = vec![0.0f64; 25 * CATEGORIES];
    for (r, &rate) in rates.iter().enumerate() {
        for e in 0..25 {
            scaled_q[r * 25 + e] = q[e] * rate;
            scaled_q2[r * 25 + e] = q2[e] * rate * rate;
        }
    }
    instance.set_differential_matrix(4, &scaled_q)?;
    instance.set_differential_matrix(5, &scaled_q2)?;

    let mut matrix = vec![0.0f64; CATEGORIES * 25];
    instance.get_transition_matrix(0, &mut matrix)?;
    println!("Matrix for node 0:");
    for r in 0..CATEGORIES {
        println!("  rate category {}:", r + 1);
        for i in 0..STATES {
            let row: Vec<String> = (0..STATES)
                .map(|j| format!("{:.6}", matrix[r * 25 + i * STATES + j]))
                .collect();
            println!("    {}", row.join(", "));
        }
    }
    println!();

    let operations = [
        Operation::from([3, OP_NONE, OP_NONE, 0, 0, 1, 1]),
        Operation::from([4, OP_NONE, OP_NONE, 2, 2, 3, 3]),
    ];
    instance.update_partials(&operations, OP_NONE)?;

    let root_index = 4;
    let log_likelihood =
        instance.calculate_root_log_likelihoods(&[root_index], &[0], &[0], &[OP_NONE])?;

    let mut site_logs = vec![0.0f64; PATTERNS];
    instance.get_site_log_likelihoods(&mut site_logs)?;
    print!("site-log-like:");
    for s in &site_logs {
        print!(" {:.6}", s);
    }
    println!();
    println!("logL = {:.5} (R = -18.04619478977292)\n", log_likelihood);

    // Pre-order pass: the root's pre-order partner carries the stationary
    // frequencies, then propagation walks root to tips. Buffer pairing
    // follows post + pre = 2*(2 internal + 3 tips) - 1 = 9.
    let root_pre_index = 5;
    let mut root_prior = vec![0.0f64; CATEGORIES * PATTERNS * STATES];
    for slot in root_prior.chunks_exact_mut(STATES) {
        slot.copy_from_slice(&freqs);
    }
    instance.set_partials(root_pre_index, &root_prior)?;

    let pre_operations = [
        Operation::from([6, OP_NONE, OP_NONE, 5, 3, 2, 2]),
        Operation::from([7, OP_NONE, OP_NONE, 5, 2, 3, 3]),
        Operation::from([8, OP_NONE, OP_NONE, 6, 1, 0, 0]),
        Operation::from([9, OP_NONE, OP_NONE, 6, 0, 1, 1]),
    ];
    instance.update_pre_partials(&pre_operations, OP_NONE)?;

    let mut pre_partials = vec![0.0f64; CATEGORIES * PATTERNS * STATES];
    for i in 0..5usize {
        let pre_buffer = 5 + i;
        instance.get_partials(pre_buffer, OP_NONE, &mut pre_partials)?;
        println!("Pre-order partials for node {}:", 4 - i);
        for r in 0..CATEGORIES {
            println!("  rate category {}:", r + 1);
            for k in 0..PATTERNS {
                let row: Vec<String> = (0..STATES)
                    .map(|j| format!("{:.6}", pre_partials[r * PATTERNS * STATES + k * STATES + j]))
                    .collect();
                println!("    {}", row.join(", "));
            }
        }
    }
    println!();

    let post_buffers = [1usize, 0, 2, 3];
    let pre_buffers = [8usize, 9, 7, 6];
    let diff_matrices = [4usize, 4, 4, 4];
    let mut gradients = vec![0.0f64; 4 * PATTERNS];
    let mut sums = vec![0.0f64; 4];
    instance.calculate_edge_derivatives(
        &post_buffers,
        &pre_buffers,
        &diff_matrices,
        0,
        &mut gradients,
        &mut sums,
    )?;

    println!("Per-site gradients:");
    for (edge, &node) in post_buffers.iter().enumerate() {
        let row: Vec<String> = (0..PATTERNS)
            .map(|k| format!("{:.6}", gradients[edge * PATTERNS + k]))
            .collect();
        println!("  node {}: {}  (sum {:.6})", node, row.join(", "), sums[edge]);
    }
    println!();

    let mut cross = vec![0.0f64; STATES * STATES];
    let gradient_edge_lengths = [0.6, 0.6, 1.3, 0.7];
    instance.calculate_cross_product_derivatives(
        &post_buffers,
        &pre_buffers,
        0,
        0,
        &gradient_edge_lengths,
        &mut cross,
    )?;
    println!("Cross-product accumulator:");
    for i in 0..STATES {
        let row: Vec<String> = (0..STATES)
            .map(|j| format!("{:.6}", cross[i * STATES + j]))
            .collect();
        println!("  {}", row.join(", "));
    }
    Ok(())
}
