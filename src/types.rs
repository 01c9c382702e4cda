//! Common types.

use thiserror::Error;

/// Errors of the distribution algorithms.
#[derive(Debug, Error)]
pub enum DistributeError {
    /// A point set violates the attribute length invariant.
    #[error("invalid point set: {0}")]
    InvalidPointSet(String),
    /// Two point sets that need to be combined have different attribute arrays.
    #[error("attribute mismatch: {0}")]
    AttributeMismatch(String),
    /// A point set could not be marshalled or unmarshalled.
    #[error("marshalling failed: {0}")]
    Marshal(#[from] bincode::Error),
    /// The point locator could not be built.
    #[error("point locator: {0}")]
    Locator(String),
    /// A message or collective operation failed.
    #[error("communication failed: {0}")]
    Communication(String),
    /// A receive did not complete within the configured timeout.
    #[error("timed out waiting for rank {source_rank} (tag {tag})")]
    Timeout {
        /// Rank the message was expected from.
        source_rank: usize,
        /// Tag of the expected message.
        tag: i32,
    },
}

/// Result type of the crate.
pub type Result<T> = std::result::Result<T, DistributeError>;

/// Reduction operators of collective operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Elementwise minimum.
    Min,
    /// Elementwise maximum.
    Max,
    /// Elementwise sum.
    Sum,
}

impl ReduceOp {
    /// Combine `other` into `acc` elementwise.
    pub fn fold_f64(self, acc: &mut [f64], other: &[f64]) {
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = match self {
                ReduceOp::Min => f64::min(*a, b),
                ReduceOp::Max => f64::max(*a, b),
                ReduceOp::Sum => *a + b,
            };
        }
    }

    /// Combine `other` into `acc` elementwise.
    pub fn fold_u64(self, acc: &mut [u64], other: &[u64]) {
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = match self {
                ReduceOp::Min => (*a).min(b),
                ReduceOp::Max => (*a).max(b),
                ReduceOp::Sum => *a + b,
            };
        }
    }
}
