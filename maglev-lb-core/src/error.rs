//! Construction-time failures.
//!
//! All errors in this crate surface while building or installing a lookup
//! table. The per-packet path has no recoverable error conditions: its
//! preconditions are the caller's responsibility.

use thiserror::Error;

/// Why a lookup table could not be built.
///
/// Surfaced to the control plane, which retries or alerts. No partial state
/// is left behind: a failed build publishes nothing and any previously
/// installed table remains in force.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// The backend set was empty.
    #[error("backend set is empty")]
    EmptyBackendSet,

    /// The backend count would collide with the unfilled-slot sentinel.
    #[error("{0} backends exceeds the maximum of 65534")]
    TooManyBackends(usize),

    /// More backends than slots; at least one backend would own no slot.
    #[error("{backends} backends cannot share {slots} table slots")]
    BackendSetExceedsTable { backends: usize, slots: u32 },

    /// The configured table size is not prime, which would break the
    /// permutation property of the per-backend slot walk.
    #[error("table size {0} is not prime")]
    NonPrimeTableSize(u32),
}
