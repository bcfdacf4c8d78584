//! Flat owning stores for every buffer kind an instance addresses.
//!
//! All cross-references between buffers are integer handles validated at the
//! call boundary; slot access is O(1) slice indexing into one contiguous
//! allocation per slot.

use crate::core::error::{check_index, check_len, Error, Result};
use crate::core::sizes::InstanceSizes;

/// A child of a partials update: either a partials slab or compact states.
/// A state value of `state_count` (or above) marks the ambiguous
/// "all states" observation.
pub enum ChildSource<'a> {
    Partials(&'a [f64]),
    States(&'a [u32]),
}

/// Borrowed pieces of one partials-update operation.
pub struct OperationView<'a> {
    pub dest: &'a mut [f64],
    pub child1: ChildSource<'a>,
    pub matrix1: &'a [f64],
    pub child2: ChildSource<'a>,
    pub matrix2: &'a [f64],
}

pub struct BufferStore {
    sizes: InstanceSizes,
    /// Compact tip states, slots `0..compact_count`, each of length K.
    tip_states: Vec<Option<Vec<u32>>>,
    /// Partials slabs for slots `compact_count..tip_count + partials_count`;
    /// compact slots keep an empty slab and reject partials access.
    partials: Vec<Vec<f64>>,
    /// Transition-probability (and differential) matrix slots, [R, S, S].
    matrices: Vec<Vec<f64>>,
    /// Scale-factor vectors of length K.
    scales: Vec<Vec<f64>>,
    /// Category rate multipliers, one slot per eigen index.
    category_rates: Vec<Vec<f64>>,
    /// Category weights, one slot per eigen index.
    category_weights: Vec<Vec<f64>>,
    /// Stationary frequencies, one slot per eigen index.
    state_frequencies: Vec<Vec<f64>>,
    pattern_weights: Vec<f64>,
    /// Partition id per pattern, plus partition count; unset means a single
    /// partition spanning all patterns.
    pattern_partitions: Option<Vec<usize>>,
    partition_count: usize,
    /// Per-pattern site log-likelihoods of the most recent root reduction.
    site_log_likelihoods: Vec<f64>,
}

impl BufferStore {
    pub fn new(sizes: InstanceSizes) -> Result<Self> {
        sizes.validate()?;
        let buffer_count = sizes.buffer_count();
        let plen = sizes.partials_len();
        let mut partials = Vec::with_capacity(buffer_count);
        for index in 0..buffer_count {
            if index < sizes.compact_count {
                partials.push(Vec::new());
            } else {
                partials.push(vec![0.0; plen]);
            }
        }
        Ok(BufferStore {
            sizes,
            tip_states: vec![None; sizes.compact_count],
            partials,
            matrices: vec![vec![0.0; sizes.matrix_len()]; sizes.matrix_count],
            scales: vec![vec![0.0; sizes.pattern_count]; sizes.scale_count],
            category_rates: vec![vec![1.0; sizes.category_count]; sizes.eigen_count.max(1)],
            category_weights: vec![
                vec![1.0 / sizes.category_count as f64; sizes.category_count];
                sizes.eigen_count.max(1)
            ],
            state_frequencies: vec![
                vec![1.0 / sizes.state_count as f64; sizes.state_count];
                sizes.eigen_count.max(1)
            ],
            pattern_weights: vec![1.0; sizes.pattern_count],
            pattern_partitions: None,
            partition_count: 1,
            site_log_likelihoods: vec![0.0; sizes.pattern_count],
        })
    }

    pub fn sizes(&self) -> &InstanceSizes {
        &self.sizes
    }

    // ---- tips ----

    pub fn set_tip_states(&mut self, tip_index: usize, states: &[u32]) -> Result<()> {
        check_index("tip state buffer", tip_index, self.sizes.compact_count)?;
        check_len("tip states", states.len(), self.sizes.pattern_count)?;
        let s = self.sizes.state_count as u32;
        if let Some(&bad) = states.iter().find(|&&v| v > s) {
            return Err(Error::bad_index(
                "tip state value",
                bad as i64,
                s as usize + 1,
            ));
        }
        self.tip_states[tip_index] = Some(states.to_vec());
        Ok(())
    }

    pub fn tip_states(&self, tip_index: usize) -> Result<&[u32]> {
        check_index("tip state buffer", tip_index, self.sizes.compact_count)?;
        self.tip_states[tip_index]
            .as_deref()
            .ok_or(Error::bad_index(
                "tip state buffer",
                tip_index as i64,
                self.sizes.compact_count,
            ))
    }

    pub fn set_tip_partials(&mut self, tip_index: usize, partials: &[f64]) -> Result<()> {
        check_index("tip partials buffer", tip_index, self.sizes.tip_count)?;
        if tip_index < self.sizes.compact_count {
            return Err(Error::Unsupported(
                "setting partials on a compact tip buffer",
            ));
        }
        self.write_partials(tip_index, partials)
    }

    // ---- partials ----

    pub fn set_partials(&mut self, buffer_index: usize, partials: &[f64]) -> Result<()> {
        self.check_partials_index(buffer_index)?;
        self.write_partials(buffer_index, partials)
    }

    fn write_partials(&mut self, buffer_index: usize, partials: &[f64]) -> Result<()> {
        // Accept either a full [R,K,S] tensor or a single-category [K,S]
        // slab replicated across categories, as the classic surface does.
        let full = self.sizes.partials_len();
        let single = self.sizes.category_stride();
        if partials.len() == full {
            self.partials[buffer_index].copy_from_slice(partials);
        } else if partials.len() == single {
            for category in 0..self.sizes.category_count {
                self.partials[buffer_index][category * single..(category + 1) * single]
                    .copy_from_slice(partials);
            }
        } else {
            return Err(Error::SizeMismatch {
                kind: "partials",
                expected: full,
                actual: partials.len(),
            });
        }
        Ok(())
    }

    pub fn partials(&self, buffer_index: usize) -> Result<&[f64]> {
        self.check_partials_index(buffer_index)?;
        Ok(&self.partials[buffer_index])
    }

    pub fn partials_mut(&mut self, buffer_index: usize) -> Result<&mut [f64]> {
        self.check_partials_index(buffer_index)?;
        Ok(&mut self.partials[buffer_index])
    }

    /// Split-borrow used by the partials kernels: the destination slab
    /// mutably, each child as either a partials slab or a compact tip-state
    /// vector, and the two matrix slots. The destination must differ from
    /// both children (numbered buffers never alias).
    pub fn operation_views(
        &mut self,
        dest: usize,
        child1: usize,
        matrix1: usize,
        child2: usize,
        matrix2: usize,
    ) -> Result<OperationView<'_>> {
        self.check_partials_index(dest)?;
        check_index("matrix buffer", matrix1, self.sizes.matrix_count)?;
        check_index("matrix buffer", matrix2, self.sizes.matrix_count)?;
        for child in [child1, child2] {
            check_index("partials buffer", child, self.sizes.buffer_count())?;
            if child == dest {
                return Err(Error::bad_index(
                    "destination aliases a child buffer",
                    dest as i64,
                    self.sizes.buffer_count(),
                ));
            }
        }
        let compact = self.sizes.compact_count;
        let BufferStore {
            partials,
            tip_states,
            matrices,
            ..
        } = self;

        // All partials access goes through one base pointer: the destination
        // slot is distinct from both children (checked above), so handing
        // out one mutable and two shared element views is sound.
        let partials_ptr = partials.as_mut_ptr();
        let view_child = |index: usize| {
            if index < compact {
                tip_states[index]
                    .as_deref()
                    .map(ChildSource::States)
                    .ok_or(Error::bad_index(
                        "tip state buffer (unset)",
                        index as i64,
                        compact,
                    ))
            } else {
                Ok(ChildSource::Partials(unsafe {
                    (*partials_ptr.add(index)).as_slice()
                }))
            }
        };

        let c1 = view_child(child1)?;
        let c2 = view_child(child2)?;
        Ok(OperationView {
            dest: unsafe { (*partials_ptr.add(dest)).as_mut_slice() },
            child1: c1,
            matrix1: &matrices[matrix1],
            child2: c2,
            matrix2: &matrices[matrix2],
        })
    }

    fn check_partials_index(&self, buffer_index: usize) -> Result<()> {
        check_index("partials buffer", buffer_index, self.sizes.buffer_count())?;
        if buffer_index < self.sizes.compact_count {
            return Err(Error::bad_index(
                "partials buffer (compact tip slot)",
                buffer_index as i64,
                self.sizes.buffer_count(),
            ));
        }
        Ok(())
    }

    /// True when the buffer holds compact tip states rather than partials.
    pub fn is_compact(&self, buffer_index: usize) -> bool {
        buffer_index < self.sizes.compact_count
    }

    // ---- matrices ----

    pub fn set_matrix(&mut self, matrix_index: usize, matrix: &[f64]) -> Result<()> {
        check_index("matrix buffer", matrix_index, self.sizes.matrix_count)?;
        check_len("transition matrix", matrix.len(), self.sizes.matrix_len())?;
        self.matrices[matrix_index].copy_from_slice(matrix);
        Ok(())
    }

    pub fn matrix(&self, matrix_index: usize) -> Result<&[f64]> {
        check_index("matrix buffer", matrix_index, self.sizes.matrix_count)?;
        Ok(&self.matrices[matrix_index])
    }

    pub fn matrix_mut(&mut self, matrix_index: usize) -> Result<&mut [f64]> {
        check_index("matrix buffer", matrix_index, self.sizes.matrix_count)?;
        Ok(&mut self.matrices[matrix_index])
    }

    /// Two distinct matrix slots, source and destination, for transposition.
    pub fn matrix_pair_mut(&mut self, src: usize, dst: usize) -> Result<(&[f64], &mut [f64])> {
        check_index("matrix buffer", src, self.sizes.matrix_count)?;
        check_index("matrix buffer", dst, self.sizes.matrix_count)?;
        if src == dst {
            return Err(Error::bad_index(
                "transpose destination aliases source",
                dst as i64,
                self.sizes.matrix_count,
            ));
        }
        let ptr = self.matrices.as_mut_ptr();
        unsafe {
            let s = &*ptr.add(src);
            let d = &mut *ptr.add(dst);
            Ok((s.as_slice(), d.as_mut_slice()))
        }
    }

    // ---- scale buffers ----

    pub fn scale(&self, scale_index: usize) -> Result<&[f64]> {
        check_index("scale buffer", scale_index, self.sizes.scale_count)?;
        Ok(&self.scales[scale_index])
    }

    pub fn scale_mut(&mut self, scale_index: usize) -> Result<&mut [f64]> {
        check_index("scale buffer", scale_index, self.sizes.scale_count)?;
        Ok(&mut self.scales[scale_index])
    }

    /// Destination partials plus the factor buffer it rescales into, and
    /// optionally a distinct cumulative buffer.
    pub fn rescale_views(
        &mut self,
        dest: usize,
        factors: usize,
        cumulative: Option<usize>,
    ) -> Result<(&mut [f64], &mut [f64], Option<&mut [f64]>)> {
        self.check_partials_index(dest)?;
        check_index("scale buffer", factors, self.sizes.scale_count)?;
        if let Some(cum) = cumulative {
            check_index("scale buffer", cum, self.sizes.scale_count)?;
            if cum == factors {
                return Err(Error::bad_index(
                    "cumulative scale aliases the write buffer",
                    cum as i64,
                    self.sizes.scale_count,
                ));
            }
        }
        let scales_ptr = self.scales.as_mut_ptr();
        // Distinct slots of distinct fields; indices validated above.
        unsafe {
            let d = &mut *(self.partials[dest].as_mut_slice() as *mut [f64]);
            let f = (*scales_ptr.add(factors)).as_mut_slice();
            let c = cumulative.map(|i| (*scales_ptr.add(i)).as_mut_slice());
            Ok((d, f, c))
        }
    }

    /// Destination partials plus a previously written factor buffer to
    /// carry, and optionally the cumulative buffer the carried factors
    /// still contribute to.
    pub fn carry_views(
        &mut self,
        dest: usize,
        factors: usize,
        cumulative: Option<usize>,
    ) -> Result<(&mut [f64], &[f64], Option<&mut [f64]>)> {
        self.check_partials_index(dest)?;
        check_index("scale buffer", factors, self.sizes.scale_count)?;
        if let Some(cum) = cumulative {
            check_index("scale buffer", cum, self.sizes.scale_count)?;
            if cum == factors {
                return Err(Error::bad_index(
                    "cumulative scale aliases the carried buffer",
                    cum as i64,
                    self.sizes.scale_count,
                ));
            }
        }
        let scales_ptr = self.scales.as_mut_ptr();
        unsafe {
            let f = (*scales_ptr.add(factors)).as_slice();
            let c = cumulative.map(|i| (*scales_ptr.add(i)).as_mut_slice());
            Ok((&mut self.partials[dest], f, c))
        }
    }

    /// A factor buffer read-only next to a distinct cumulative buffer.
    pub fn scale_pair(&mut self, factors: usize, cumulative: usize) -> Result<(&[f64], &mut [f64])> {
        check_index("scale buffer", factors, self.sizes.scale_count)?;
        check_index("scale buffer", cumulative, self.sizes.scale_count)?;
        if factors == cumulative {
            return Err(Error::bad_index(
                "cumulative scale aliases the factor buffer",
                cumulative as i64,
                self.sizes.scale_count,
            ));
        }
        let ptr = self.scales.as_mut_ptr();
        unsafe {
            let f = (*ptr.add(factors)).as_slice();
            let c = (*ptr.add(cumulative)).as_mut_slice();
            Ok((f, c))
        }
    }

    // ---- category parameters ----

    pub fn set_category_rates(&mut self, eigen_index: usize, rates: &[f64]) -> Result<()> {
        check_index("category rates slot", eigen_index, self.category_rates.len())?;
        check_len("category rates", rates.len(), self.sizes.category_count)?;
        self.category_rates[eigen_index].copy_from_slice(rates);
        Ok(())
    }

    pub fn category_rates(&self, eigen_index: usize) -> Result<&[f64]> {
        check_index("category rates slot", eigen_index, self.category_rates.len())?;
        Ok(&self.category_rates[eigen_index])
    }

    pub fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<()> {
        check_index("category weights slot", index, self.category_weights.len())?;
        check_len("category weights", weights.len(), self.sizes.category_count)?;
        self.category_weights[index].copy_from_slice(weights);
        Ok(())
    }

    pub fn category_weights(&self, index: usize) -> Result<&[f64]> {
        check_index("category weights slot", index, self.category_weights.len())?;
        Ok(&self.category_weights[index])
    }

    pub fn set_state_frequencies(&mut self, index: usize, freqs: &[f64]) -> Result<()> {
        check_index("state frequencies slot", index, self.state_frequencies.len())?;
        check_len("state frequencies", freqs.len(), self.sizes.state_count)?;
        self.state_frequencies[index].copy_from_slice(freqs);
        Ok(())
    }

    pub fn state_frequencies(&self, index: usize) -> Result<&[f64]> {
        check_index("state frequencies slot", index, self.state_frequencies.len())?;
        Ok(&self.state_frequencies[index])
    }

    pub fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        check_len("pattern weights", weights.len(), self.sizes.pattern_count)?;
        self.pattern_weights.copy_from_slice(weights);
        Ok(())
    }

    pub fn pattern_weights(&self) -> &[f64] {
        &self.pattern_weights
    }

    // ---- partitions ----

    pub fn set_pattern_partitions(
        &mut self,
        partition_count: usize,
        assignments: &[i32],
    ) -> Result<()> {
        check_len("pattern partitions", assignments.len(), self.sizes.pattern_count)?;
        if partition_count == 0 {
            return Err(Error::bad_index("partition count", 0, 1));
        }
        let mut mapped = Vec::with_capacity(assignments.len());
        for &p in assignments {
            if p < 0 || p as usize >= partition_count {
                return Err(Error::bad_index("pattern partition", p as i64, partition_count));
            }
            mapped.push(p as usize);
        }
        self.pattern_partitions = Some(mapped);
        self.partition_count = partition_count;
        Ok(())
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Patterns belonging to a partition; all patterns when unpartitioned.
    pub fn partition_patterns(&self, partition: usize) -> Result<Vec<usize>> {
        check_index("partition", partition, self.partition_count)?;
        match &self.pattern_partitions {
            None => Ok((0..self.sizes.pattern_count).collect()),
            Some(assign) => Ok(assign
                .iter()
                .enumerate()
                .filter(|(_, &p)| p == partition)
                .map(|(k, _)| k)
                .collect()),
        }
    }

    // ---- retained site reductions ----

    pub fn site_log_likelihoods(&self) -> &[f64] {
        &self.site_log_likelihoods
    }

    pub fn site_log_likelihoods_mut(&mut self) -> &mut [f64] {
        &mut self.site_log_likelihoods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> InstanceSizes {
        InstanceSizes {
            tip_count: 4,
            partials_count: 4,
            compact_count: 2,
            state_count: 4,
            pattern_count: 3,
            eigen_count: 1,
            matrix_count: 6,
            category_count: 2,
            scale_count: 3,
        }
    }

    #[test]
    fn tip_state_validation() {
        let mut store = BufferStore::new(sizes()).unwrap();
        store.set_tip_states(0, &[0, 3, 4]).unwrap(); // 4 = ambiguous
        assert!(store.set_tip_states(0, &[0, 5, 1]).is_err());
        assert!(store.set_tip_states(2, &[0, 0, 0]).is_err()); // not compact
        assert_eq!(store.tip_states(0).unwrap(), &[0, 3, 4]);
        assert!(store.tip_states(1).is_err()); // never set
    }

    #[test]
    fn partials_round_trip() {
        let mut store = BufferStore::new(sizes()).unwrap();
        let full: Vec<f64> = (0..24).map(|i| i as f64).collect();
        store.set_partials(4, &full).unwrap();
        assert_eq!(store.partials(4).unwrap(), full.as_slice());

        // Single-category input replicates across categories.
        let single: Vec<f64> = (0..12).map(|i| i as f64).collect();
        store.set_partials(5, &single).unwrap();
        let got = store.partials(5).unwrap();
        assert_eq!(&got[..12], single.as_slice());
        assert_eq!(&got[12..], single.as_slice());

        // Compact slots reject partials access.
        assert!(store.set_partials(1, &full).is_err());
        assert!(store.partials(0).is_err());
    }

    #[test]
    fn split_borrows_reject_aliasing() {
        let mut store = BufferStore::new(sizes()).unwrap();
        store.set_tip_states(0, &[0, 1, 2]).unwrap();
        assert!(store.operation_views(4, 4, 0, 5, 1).is_err());
        assert!(store.operation_views(4, 5, 0, 6, 1).is_ok());
        // Compact child resolves to its state vector.
        let view = store.operation_views(4, 0, 0, 5, 1).unwrap();
        match view.child1 {
            ChildSource::States(s) => assert_eq!(s, &[0, 1, 2]),
            ChildSource::Partials(_) => panic!("expected states"),
        }
        // Unset compact tip is an error.
        assert!(store.operation_views(4, 1, 0, 5, 1).is_err());
        assert!(store.matrix_pair_mut(2, 2).is_err());
    }

    #[test]
    fn partition_bookkeeping() {
        let mut store = BufferStore::new(sizes()).unwrap();
        assert_eq!(store.partition_patterns(0).unwrap(), vec![0, 1, 2]);
        store.set_pattern_partitions(2, &[0, 1, 0]).unwrap();
        assert_eq!(store.partition_patterns(0).unwrap(), vec![0, 2]);
        assert_eq!(store.partition_patterns(1).unwrap(), vec![1]);
        assert!(store.set_pattern_partitions(2, &[0, 2, 0]).is_err());
    }
}
