//! Synthetic benchmark and correctness driver.
//!
//! Generates a random bifurcating tree over random sequences under the
//! S-state Jukes-Cantor model, evaluates the root log-likelihood repeatedly,
//! and reports timing per resource configuration.
//!
//! Usage: synthbench [--states=4] [--taxa=16] [--sites=1000] [--rates=4]
//!                   [--reps=10] [--rsrc=N] [--manualscale] [--autoscale]
//!                   [--dynamicscale] [--doubleprecision] [--disablevector]
//!                   [--enablethreads] [--partitions=N] [--calcderivs]
//!                   [--resourcelist] [--benchlist] [--json]

use std::env;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use felsite::core::operation::{Operation, PartitionOperation, OP_NONE};
use felsite::model::jukes_cantor_eigensystem;
use felsite::registry;
use felsite::{Flags, Instance, InstanceSizes};

struct Config {
    states: usize,
    taxa: usize,
    sites: usize,
    rates: usize,
    reps: usize,
    rsrc: Option<usize>,
    manual_scale: bool,
    auto_scale: bool,
    dynamic_scale: bool,
    disable_vector: bool,
    enable_threads: bool,
    partitions: usize,
    calc_derivs: bool,
    resource_list: bool,
    bench_list: bool,
    json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            states: 4,
            taxa: 16,
            sites: 1000,
            rates: 4,
            reps: 10,
            rsrc: None,
            manual_scale: false,
            auto_scale: false,
            dynamic_scale: false,
            disable_vector: false,
            enable_threads: false,
            partitions: 1,
            calc_derivs: false,
            resource_list: false,
            bench_list: false,
            json: false,
        }
    }
}

fn parse_args() -> Option<Config> {
    let mut cfg = Config::default();
    for arg in env::args().skip(1) {
        let numeric = |prefix: &str| -> Option<usize> {
            arg.strip_prefix(prefix).and_then(|v| v.parse().ok())
        };
        if let Some(v) = numeric("--states=") {
            cfg.states = v;
        } else if let Some(v) = numeric("--taxa=") {
            cfg.taxa = v;
        } else if let Some(v) = numeric("--sites=") {
            cfg.sites = v;
        } else if let Some(v) = numeric("--rates=") {
            cfg.rates = v;
        } else if let Some(v) = numeric("--reps=") {
            cfg.reps = v;
        } else if let Some(v) = numeric("--rsrc=") {
            cfg.rsrc = Some(v);
        } else if let Some(v) = numeric("--partitions=") {
            cfg.partitions = v;
        } else {
            match arg.as_str() {
                "--manualscale" => cfg.manual_scale = true,
                "--autoscale" => cfg.auto_scale = true,
                "--dynamicscale" => cfg.dynamic_scale = true,
                "--doubleprecision" => {} // double is the only precision
                "--disablevector" => cfg.disable_vector = true,
                "--enablethreads" => cfg.enable_threads = true,
                "--calcderivs" => cfg.calc_derivs = true,
                "--resourcelist" => cfg.resource_list = true,
                "--benchlist" => cfg.bench_list = true,
                "--json" => cfg.json = true,
                _ => {
                    eprintln!("unknown argument: {}", arg);
                    return None;
                }
            }
        }
    }
    Some(cfg)
}

/// Random bifurcating topology: repeatedly join two random live buffers.
/// Returns post-order operations and the root buffer index.
fn random_tree(rng: &mut StdRng, taxa: usize) -> (Vec<Operation>, i32) {
    let mut live: Vec<usize> = (0..taxa).collect();
    let mut ops = Vec::with_capacity(taxa - 1);
    let mut next = taxa;
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
    (ops, (next - 1) as i32)
}

fn print_flags(flags: Flags) {
    println!("\tFlags: {}", flags);
}

fn main() {
    let Some(cfg) = parse_args() else {
        std::process::exit(2);
    };

    if cfg.resource_list || cfg.bench_list {
        println!("Available resources:");
        for (i, r) in registry::resources().iter().enumerate() {
            println!("\tResource {}:\n\t\tName : {}", i, r.name);
            println!("\t\tDesc : {}", r.description);
            print_flags(r.support_flags);
        }
        if cfg.bench_list {
            println!("\nBenchmarks (lower is better):");
            let benched = registry::benchmarked_resource_list();
            if cfg.json {
                println!("{}", serde_json::to_string_pretty(&benched).unwrap());
            } else {
                for b in benched {
                    println!(
                        "\t{} ({}): {:.3} ms, {:.2}x vs CPU",
                        b.name, b.impl_name, b.elapsed_ms, b.speedup_vs_cpu
                    );
                }
            }
        }
        return;
    }

    match run(&cfg) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("synthbench failed: {} (code {})", e, e.code());
            std::process::exit(1);
        }
    }
}

fn run(cfg: &Config) -> felsite::Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let taxa = cfg.taxa.max(2);
    let internals = taxa - 1;
    let scale_buffers = if cfg.manual_scale || cfg.dynamic_scale {
        internals + 1
    } else {
        0
    };

    let sizes = InstanceSizes {
        tip_count: taxa,
        partials_count: internals,
        compact_count: taxa,
        state_count: cfg.states,
        pattern_count: cfg.sites,
        eigen_count: 1,
        matrix_count: 3 * (2 * taxa - 2), // probabilities + first + second derivatives
        category_count: cfg.rates,
        scale_count: scale_buffers,
    };

    let mut preference = Flags::PRECISION_DOUBLE;
    if cfg.enable_threads {
        preference |= Flags::THREADING_CPP;
    }
    let mut requirement = Flags::SCALERS_LOG;
    if cfg.disable_vector {
        requirement |= Flags::VECTOR_NONE;
    }
    if cfg.manual_scale {
        requirement |= Flags::SCALING_MANUAL;
    }
    if cfg.auto_scale {
        requirement |= Flags::SCALING_AUTO;
    }
    if cfg.dynamic_scale {
        requirement |= Flags::SCALING_DYNAMIC;
    }

    let mut instance = Instance::create(sizes, preference, requirement, cfg.rsrc)?;
    let details = instance.details().clone();
    println!("Using resource {}: {}", details.resource_number, details.resource_name);
    println!("\tImpl : {}", details.impl_name);
    print_flags(details.flags);

    if cfg.enable_threads {
        instance.set_thread_count(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )?;
    }

    // Random compact tip sequences.
    for tip in 0..taxa {
        let states: Vec<u32> = (0..cfg.sites)
            .map(|_| rng.gen_range(0..cfg.states) as u32)
            .collect();
        instance.set_tip_states(tip, &states)?;
    }

    // Discrete-gamma-like rate spread with uniform weights around mean 1.
    let rates: Vec<f64> = (0..cfg.rates)
        .map(|i| 2.0 * (i as f64 + 0.5) / cfg.rates as f64)
        .collect();
    instance.set_category_rates(&rates)?;
    instance.set_category_weights(0, &vec![1.0 / cfg.rates as f64; cfg.rates])?;
    instance.set_state_frequencies(0, &vec![1.0 / cfg.states as f64; cfg.states])?;
    instance.set_pattern_weights(&vec![1.0; cfg.sites])?;

    let (evec, ivec, eval) = jukes_cantor_eigensystem(cfg.states);
    instance.set_eigen_decomposition(0, &evec, &ivec, &eval)?;

    let (mut ops, root) = random_tree(&mut rng, taxa);
    if cfg.manual_scale || cfg.dynamic_scale {
        for (i, op) in ops.iter_mut().enumerate() {
            op.write_scale = i as i32;
            if cfg.dynamic_scale {
                op.read_scale = i as i32;
            }
        }
    }
    let cumulative = if cfg.manual_scale || cfg.dynamic_scale {
        internals as i32
    } else {
        OP_NONE
    };

    let edge_count = 2 * taxa - 2;
    let node_indices: Vec<usize> = (0..edge_count).collect();
    let d1_indices: Vec<usize> = (edge_count..2 * edge_count).collect();
    let d2_indices: Vec<usize> = (2 * edge_count..3 * edge_count).collect();
    let edge_lengths: Vec<f64> = (0..edge_count).map(|_| rng.gen_range(0.01..0.5)).collect();

    if cfg.partitions > 1 {
        let assignments: Vec<i32> = (0..cfg.sites)
            .map(|_| rng.gen_range(0..cfg.partitions) as i32)
            .collect();
        instance.set_pattern_partitions(cfg.partitions, &assignments)?;
    }

    let mut log_likelihood = 0.0;
    let start = Instant::now();
    for _rep in 0..cfg.reps {
        if cfg.calc_derivs {
            instance.update_transition_matrices(
                0,
                &node_indices,
                Some(&d1_indices),
                Some(&d2_indices),
                &edge_lengths,
            )?;
        } else {
            instance.update_transition_matrices(0, &node_indices, None, None, &edge_lengths)?;
        }

        if cumulative != OP_NONE {
            instance.reset_scale_factors(cumulative as usize)?;
        }

        if cfg.partitions > 1 {
            let pops: Vec<PartitionOperation> = ops
                .iter()
                .flat_map(|op| {
                    (0..cfg.partitions).map(|p| PartitionOperation {
                        op: *op,
                        partition: p as i32,
                        cumulative_scale: OP_NONE,
                    })
                })
                .collect();
            instance.update_partials_by_partition(&pops)?;
            let roots = vec![root; cfg.partitions];
            let zeros = vec![0i32; cfg.partitions];
            let cums = vec![cumulative; cfg.partitions];
            let mut per_partition = vec![0.0; cfg.partitions];
            log_likelihood = instance.calculate_root_log_likelihoods_by_partition(
                &roots,
                &zeros,
                &zeros,
                &cums,
                &mut per_partition,
            )?;
        } else {
            instance.update_partials(&ops, cumulative)?;
            log_likelihood =
                instance.calculate_root_log_likelihoods(&[root], &[0], &[0], &[cumulative])?;
        }

        if cfg.calc_derivs {
            // Derivatives along the root's first child edge.
            let child = ops.last().map(|op| op.child1_partials as usize).unwrap();
            let d = instance.calculate_edge_log_likelihoods(
                root as usize,
                child,
                child,
                Some(edge_count + child),
                Some(2 * edge_count + child),
                0,
                0,
                OP_NONE,
            )?;
            if _rep == 0 {
                println!(
                    "edge logL = {:.6}, d1 = {:.6}, d2 = {:.6}",
                    d.log_likelihood,
                    d.first.unwrap_or(f64::NAN),
                    d.second.unwrap_or(f64::NAN)
                );
            }
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    if cfg.json {
        let report = serde_json::json!({
            "states": cfg.states,
            "taxa": cfg.taxa,
            "sites": cfg.sites,
            "rates": cfg.rates,
            "reps": cfg.reps,
            "resource": details.resource_name,
            "logL": log_likelihood,
            "seconds": elapsed,
            "evals_per_second": cfg.reps as f64 / elapsed,
        });
        println!("{}", serde_json::to_string_pretty(&report).unwrap());
    } else {
        println!("logL = {:.6}", log_likelihood);
        println!(
            "{} evaluations in {:.3} s ({:.1} evals/s)",
            cfg.reps,
            elapsed,
            cfg.reps as f64 / elapsed
        );
    }
    Ok(())
}
