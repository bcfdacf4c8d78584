//! Handle-based surface with integer statuses.
//!
//! A process-wide table maps `i32` handles to instances; every entry point
//! validates the handle, forwards to the instance, and folds the typed error
//! into its stable negative code. Zero (or the non-negative handle/value)
//! means success. Buffer contents cross the boundary by copy only.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::core::error::{Error, Result};
use crate::core::flags::Flags;
use crate::core::operation::{Operation, PartitionOperation};
use crate::core::sizes::InstanceSizes;
use crate::instance::{Instance, InstanceDetails};
use crate::registry::{self, Resource};

pub const OK: i32 = 0;

fn table() -> &'static Mutex<HashMap<i32, Instance>> {
    static TABLE: OnceLock<Mutex<HashMap<i32, Instance>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => OK,
        Err(e) => e.code(),
    }
}

/// Run `f` against a live instance; a dead handle reports the
/// uninitialized-instance code.
pub fn with_instance<T>(handle: i32, f: impl FnOnce(&mut Instance) -> Result<T>) -> Result<T> {
    let mut table = table().lock().map_err(|_| Error::General)?;
    let instance = table
        .get_mut(&handle)
        .ok_or(Error::UninitializedInstance)?;
    f(instance)
}

/// Enumerate the available resources.
pub fn resource_list() -> &'static [Resource] {
    registry::resources()
}

/// Create an instance and return its handle (negative = error code).
/// `details_out`, when supplied, receives the resolved instance record.
pub fn create_instance(
    sizes: InstanceSizes,
    preference_flags: Flags,
    requirement_flags: Flags,
    pinned_resource: Option<usize>,
    details_out: Option<&mut InstanceDetails>,
) -> i32 {
    let instance = match Instance::create(sizes, preference_flags, requirement_flags, pinned_resource)
    {
        Ok(i) => i,
        Err(e) => return e.code(),
    };
    if let Some(out) = details_out {
        *out = instance.details().clone();
    }
    let mut table = match table().lock() {
        Ok(t) => t,
        Err(_) => return Error::General.code(),
    };
    let handle = (0..).find(|h| !table.contains_key(h)).unwrap_or(0);
    table.insert(handle, instance);
    handle
}

/// Tear the instance down, releasing every buffer it owns.
pub fn finalize_instance(handle: i32) -> i32 {
    let mut table = match table().lock() {
        Ok(t) => t,
        Err(_) => return Error::General.code(),
    };
    match table.remove(&handle) {
        Some(_) => OK,
        None => Error::UninitializedInstance.code(),
    }
}

pub fn set_thread_count(handle: i32, threads: usize) -> i32 {
    status(with_instance(handle, |i| i.set_thread_count(threads)))
}

pub fn set_tip_states(handle: i32, tip_index: usize, states: &[u32]) -> i32 {
    status(with_instance(handle, |i| i.set_tip_states(tip_index, states)))
}

pub fn set_tip_partials(handle: i32, tip_index: usize, partials: &[f64]) -> i32 {
    status(with_instance(handle, |i| {
        i.set_tip_partials(tip_index, partials)
    }))
}

pub fn set_partials(handle: i32, buffer_index: usize, partials: &[f64]) -> i32 {
    status(with_instance(handle, |i| {
        i.set_partials(buffer_index, partials)
    }))
}

pub fn get_partials(handle: i32, buffer_index: usize, scale_index: i32, out: &mut [f64]) -> i32 {
    status(with_instance(handle, |i| {
        i.get_partials(buffer_index, scale_index, out)
    }))
}

pub fn set_eigen_decomposition(
    handle: i32,
    eigen_index: usize,
    eigenvectors: &[f64],
    inverse_eigenvectors: &[f64],
    eigenvalues: &[f64],
) -> i32 {
    status(with_instance(handle, |i| {
        i.set_eigen_decomposition(eigen_index, eigenvectors, inverse_eigenvectors, eigenvalues)
    }))
}

pub fn set_category_rates(handle: i32, rates: &[f64]) -> i32 {
    status(with_instance(handle, |i| i.set_category_rates(rates)))
}

pub fn set_category_weights(handle: i32, index: usize, weights: &[f64]) -> i32 {
    status(with_instance(handle, |i| {
        i.set_category_weights(index, weights)
    }))
}

pub fn set_state_frequencies(handle: i32, index: usize, frequencies: &[f64]) -> i32 {
    status(with_instance(handle, |i| {
        i.set_state_frequencies(index, frequencies)
    }))
}

pub fn set_pattern_weights(handle: i32, weights: &[f64]) -> i32 {
    status(with_instance(handle, |i| i.set_pattern_weights(weights)))
}

pub fn set_pattern_partitions(handle: i32, partition_count: usize, assignments: &[i32]) -> i32 {
    status(with_instance(handle, |i| {
        i.set_pattern_partitions(partition_count, assignments)
    }))
}

pub fn set_transition_matrix(
    handle: i32,
    matrix_index: usize,
    matrix: &[f64],
    pad_value: f64,
) -> i32 {
    status(with_instance(handle, |i| {
        i.set_transition_matrix(matrix_index, matrix, pad_value)
    }))
}

pub fn get_transition_matrix(handle: i32, matrix_index: usize, out: &mut [f64]) -> i32 {
    status(with_instance(handle, |i| {
        i.get_transition_matrix(matrix_index, out)
    }))
}

pub fn update_transition_matrices(
    handle: i32,
    eigen_index: usize,
    probability_indices: &[usize],
    first_derivative_indices: Option<&[usize]>,
    second_derivative_indices: Option<&[usize]>,
    edge_lengths: &[f64],
) -> i32 {
    status(with_instance(handle, |i| {
        i.update_transition_matrices(
            eigen_index,
            probability_indices,
            first_derivative_indices,
            second_derivative_indices,
            edge_lengths,
        )
    }))
}

pub fn update_partials(handle: i32, operations: &[Operation], cumulative_scale_index: i32) -> i32 {
    status(with_instance(handle, |i| {
        i.update_partials(operations, cumulative_scale_index)
    }))
}

pub fn update_partials_by_partition(handle: i32, operations: &[PartitionOperation]) -> i32 {
    status(with_instance(handle, |i| {
        i.update_partials_by_partition(operations)
    }))
}

pub fn update_pre_partials(
    handle: i32,
    operations: &[Operation],
    cumulative_scale_index: i32,
) -> i32 {
    status(with_instance(handle, |i| {
        i.update_pre_partials(operations, cumulative_scale_index)
    }))
}

pub fn accumulate_scale_factors(
    handle: i32,
    scale_indices: &[usize],
    cumulative_scale_index: usize,
) -> i32 {
    status(with_instance(handle, |i| {
        i.accumulate_scale_factors(scale_indices, cumulative_scale_index)
    }))
}

pub fn reset_scale_factors(handle: i32, cumulative_scale_index: usize) -> i32 {
    status(with_instance(handle, |i| {
        i.reset_scale_factors(cumulative_scale_index)
    }))
}

pub fn calculate_root_log_likelihoods(
    handle: i32,
    root_indices: &[i32],
    category_weights_indices: &[i32],
    state_frequencies_indices: &[i32],
    cumulative_scale_indices: &[i32],
    out_log_likelihood: &mut f64,
) -> i32 {
    status(with_instance(handle, |i| {
        *out_log_likelihood = i.calculate_root_log_likelihoods(
            root_indices,
            category_weights_indices,
            state_frequencies_indices,
            cumulative_scale_indices,
        )?;
        Ok(())
    }))
}

pub fn get_site_log_likelihoods(handle: i32, out: &mut [f64]) -> i32 {
    status(with_instance(handle, |i| i.get_site_log_likelihoods(out)))
}

pub fn set_category_rates_with_index(handle: i32, index: usize, rates: &[f64]) -> i32 {
    status(with_instance(handle, |i| {
        i.set_category_rates_with_index(index, rates)
    }))
}

pub fn set_differential_matrix(handle: i32, matrix_index: usize, matrix: &[f64]) -> i32 {
    status(with_instance(handle, |i| {
        i.set_differential_matrix(matrix_index, matrix)
    }))
}

pub fn transpose_transition_matrices(
    handle: i32,
    source_indices: &[usize],
    destination_indices: &[usize],
) -> i32 {
    status(with_instance(handle, |i| {
        i.transpose_transition_matrices(source_indices, destination_indices)
    }))
}

pub fn remove_scale_factors(
    handle: i32,
    scale_indices: &[usize],
    cumulative_scale_index: usize,
) -> i32 {
    status(with_instance(handle, |i| {
        i.remove_scale_factors(scale_indices, cumulative_scale_index)
    }))
}

pub fn accumulate_scale_factors_by_partition(
    handle: i32,
    scale_indices: &[usize],
    cumulative_scale_index: usize,
    partition: usize,
) -> i32 {
    status(with_instance(handle, |i| {
        i.accumulate_scale_factors_by_partition(scale_indices, cumulative_scale_index, partition)
    }))
}

pub fn reset_scale_factors_by_partition(
    handle: i32,
    cumulative_scale_index: usize,
    partition: usize,
) -> i32 {
    status(with_instance(handle, |i| {
        i.reset_scale_factors_by_partition(cumulative_scale_index, partition)
    }))
}

pub fn get_scale_factors(handle: i32, scale_index: usize, out: &mut [f64]) -> i32 {
    status(with_instance(handle, |i| i.get_scale_factors(scale_index, out)))
}

pub fn set_rescale_frequency(handle: i32, frequency: u64) -> i32 {
    status(with_instance(handle, |i| {
        i.set_rescale_frequency(frequency);
        Ok(())
    }))
}

pub fn calculate_root_log_likelihoods_by_partition(
    handle: i32,
    root_indices: &[i32],
    category_weights_indices: &[i32],
    state_frequencies_indices: &[i32],
    cumulative_scale_indices: &[i32],
    out_partition_log_likelihoods: &mut [f64],
    out_log_likelihood: &mut f64,
) -> i32 {
    status(with_instance(handle, |i| {
        *out_log_likelihood = i.calculate_root_log_likelihoods_by_partition(
            root_indices,
            category_weights_indices,
            state_frequencies_indices,
            cumulative_scale_indices,
            out_partition_log_likelihoods,
        )?;
        Ok(())
    }))
}

#[allow(clippy::too_many_arguments)]
pub fn calculate_edge_log_likelihoods(
    handle: i32,
    parent_index: usize,
    child_index: usize,
    matrix_index: usize,
    first_derivative_index: Option<usize>,
    second_derivative_index: Option<usize>,
    category_weights_index: usize,
    state_frequencies_index: usize,
    cumulative_scale_index: i32,
    out_log_likelihood: &mut f64,
    out_first_derivative: Option<&mut f64>,
    out_second_derivative: Option<&mut f64>,
) -> i32 {
    status(with_instance(handle, |i| {
        let reduction = i.calculate_edge_log_likelihoods(
            parent_index,
            child_index,
            matrix_index,
            first_derivative_index,
            second_derivative_index,
            category_weights_index,
            state_frequencies_index,
            cumulative_scale_index,
        )?;
        *out_log_likelihood = reduction.log_likelihood;
        if let (Some(out), Some(d1)) = (out_first_derivative, reduction.first) {
            *out = d1;
        }
        if let (Some(out), Some(d2)) = (out_second_derivative, reduction.second) {
            *out = d2;
        }
        Ok(())
    }))
}

pub fn calculate_edge_derivatives(
    handle: i32,
    post_buffer_indices: &[usize],
    pre_buffer_indices: &[usize],
    derivative_matrix_indices: &[usize],
    category_weights_index: usize,
    out_first: &mut [f64],
    out_sums: &mut [f64],
) -> i32 {
    status(with_instance(handle, |i| {
        i.calculate_edge_derivatives(
            post_buffer_indices,
            pre_buffer_indices,
            derivative_matrix_indices,
            category_weights_index,
            out_first,
            out_sums,
        )
    }))
}

#[allow(clippy::too_many_arguments)]
pub fn calculate_cross_product_derivatives(
    handle: i32,
    post_buffer_indices: &[usize],
    pre_buffer_indices: &[usize],
    category_rates_index: usize,
    category_weights_index: usize,
    edge_lengths: &[f64],
    out: &mut [f64],
) -> i32 {
    status(with_instance(handle, |i| {
        i.calculate_cross_product_derivatives(
            post_buffer_indices,
            pre_buffer_indices,
            category_rates_index,
            category_weights_index,
            edge_lengths,
            out,
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operation::OP_NONE;

    fn sizes() -> InstanceSizes {
        InstanceSizes {
            tip_count: 2,
            partials_count: 1,
            compact_count: 2,
            state_count: 2,
            pattern_count: 2,
            eigen_count: 1,
            matrix_count: 2,
            category_count: 1,
            scale_count: 1,
        }
    }

    #[test]
    fn handle_lifecycle_and_statuses() {
        let handle = create_instance(sizes(), Flags::NONE, Flags::NONE, None, None);
        assert!(handle >= 0);

        assert_eq!(set_tip_states(handle, 0, &[0, 1]), OK);
        assert_eq!(set_tip_states(handle, 0, &[0, 9]), -5);
        assert_eq!(set_tip_states(handle, 5, &[0, 1]), -5);
        // Wrong length.
        assert_eq!(set_pattern_weights(handle, &[1.0]), -9);

        assert_eq!(finalize_instance(handle), OK);
        assert_eq!(finalize_instance(handle), -4);
        assert_eq!(set_tip_states(handle, 0, &[0, 1]), -4);
    }

    #[test]
    fn end_to_end_identity_likelihood() {
        let mut details = InstanceDetails {
            resource_number: 0,
            resource_name: String::new(),
            impl_name: String::new(),
            impl_description: String::new(),
            flags: Flags::NONE,
        };
        let handle = create_instance(
            sizes(),
            Flags::NONE,
            Flags::NONE,
            None,
            Some(&mut details),
        );
        assert!(handle >= 0);
        assert!(!details.resource_name.is_empty());

        assert_eq!(set_tip_states(handle, 0, &[0, 1]), OK);
        assert_eq!(set_tip_states(handle, 1, &[0, 1]), OK);
        // Identity matrices on both edges: zero-length branches.
        let evec = [1.0, 1.0, 1.0, -1.0];
        let ivec = [0.5, 0.5, 0.5, -0.5];
        let eval = [0.0, -2.0];
        assert_eq!(set_eigen_decomposition(handle, 0, &evec, &ivec, &eval), OK);
        assert_eq!(
            update_transition_matrices(handle, 0, &[0, 1], None, None, &[0.0, 0.0]),
            OK
        );
        let ops = [Operation::from([2, OP_NONE, OP_NONE, 0, 0, 1, 1])];
        assert_eq!(update_partials(handle, &ops, OP_NONE), OK);

        let mut logl = 0.0;
        assert_eq!(
            calculate_root_log_likelihoods(handle, &[2], &[0], &[0], &[OP_NONE], &mut logl),
            OK
        );
        // Two patterns, uniform default frequencies over two states.
        assert!((logl - 2.0 * 0.5f64.ln()).abs() < 1e-12);
        assert_eq!(finalize_instance(handle), OK);
    }
}
