use serde::{Deserialize, Serialize};

use super::error::{Error, Result};

/// Sizing parameters fixed at instance creation.
///
/// Addressing convention: buffers `0..compact_count` are compact tip-state
/// buffers; `compact_count..tip_count` are tip partials; the remaining
/// `partials_count` buffers belong to internal nodes. Matrix, eigen and scale
/// indices address their own flat stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSizes {
    pub tip_count: usize,
    pub partials_count: usize,
    pub compact_count: usize,
    pub state_count: usize,
    pub pattern_count: usize,
    pub eigen_count: usize,
    pub matrix_count: usize,
    pub category_count: usize,
    pub scale_count: usize,
}

impl InstanceSizes {
    pub fn validate(&self) -> Result<()> {
        if self.state_count < 2 {
            return Err(Error::bad_index("state_count", self.state_count as i64, 2));
        }
        if self.compact_count > self.tip_count {
            return Err(Error::bad_index(
                "compact_count",
                self.compact_count as i64,
                self.tip_count + 1,
            ));
        }
        if self.pattern_count == 0 || self.category_count == 0 {
            return Err(Error::General);
        }
        Ok(())
    }

    /// Total number of addressable partials/tip buffers.
    pub fn buffer_count(&self) -> usize {
        self.tip_count + self.partials_count
    }

    /// Length of one partials buffer: [category, pattern, state] row-major.
    pub fn partials_len(&self) -> usize {
        self.category_count * self.pattern_count * self.state_count
    }

    /// Length of one stacked transition-matrix slot: [category, row, col].
    pub fn matrix_len(&self) -> usize {
        self.category_count * self.state_count * self.state_count
    }

    /// Stride between rate categories inside a partials buffer.
    pub fn category_stride(&self) -> usize {
        self.pattern_count * self.state_count
    }

    /// Stride between rate categories inside a matrix slot.
    pub fn matrix_stride(&self) -> usize {
        self.state_count * self.state_count
    }
}

/// Reverse-index convention tying post-order and pre-order buffers.
///
/// For a tree with `internal_nodes` partials-bearing nodes and `tip_nodes`
/// tips, every node satisfies `post + pre = 2 * (internal_nodes + tip_nodes)
/// - 1`, so the two root partials occupy adjacent buffer slots. The reduction
/// kernel checks the constant is uniform across an edge list rather than
/// trusting the caller.
pub fn pre_order_mirror(internal_nodes: usize, tip_nodes: usize, post_index: usize) -> usize {
    2 * (internal_nodes + tip_nodes) - 1 - post_index
}
