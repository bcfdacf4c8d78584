//! # Core Types
//!
//! The shared vocabulary of the library, independent of any compute backend.
//!
//! - **[`sizes`]:** Instance sizing fixed at creation, with the derived strides.
//! - **[`flags`]:** The capability/configuration bitset.
//! - **[`operation`]:** Partials-update operation tuples.
//! - **[`error`]:** The stable error taxonomy.

pub mod error;
pub mod flags;
pub mod operation;
pub mod sizes;

pub use error::{Error, Result};
pub use flags::Flags;
pub use operation::{Operation, PartitionOperation, OP_NONE};
pub use sizes::{pre_order_mirror, InstanceSizes};
