//! Error types for the `gpr` memory runtime.
//!
//! Allocation failure is never reported here: the heap aborts the process
//! instead. These variants cover the misuse that can be detected cheaply and
//! reported without touching any state.

use std::fmt;

/// Recoverable errors of the memory runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `Arena::rewind` was given an address that no node of the arena holds.
    PositionOutOfArena {
        /// The rejected address.
        addr: usize,
    },

    /// A map capacity whose slot table would not fit in memory.
    InvalidCapacity {
        /// The requested capacity.
        capacity: usize,
    },

    /// An element does not match the map's configured element size.
    ElementSizeMismatch {
        /// Configured element size (`0` for pointer-valued maps).
        expected: usize,
        /// Size of the element that was passed in.
        actual: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PositionOutOfArena { addr } => {
                write!(f, "Position {addr:#x} is not inside any arena node")
            }
            Error::InvalidCapacity { capacity } => {
                write!(f, "Invalid map capacity: {capacity}")
            }
            Error::ElementSizeMismatch { expected, actual } => {
                write!(
                    f,
                    "Element size mismatch: map stores {expected} byte elements, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for memory runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", Error::PositionOutOfArena { addr: 0x10 }),
            "Position 0x10 is not inside any arena node"
        );
        assert_eq!(
            format!(
                "{}",
                Error::ElementSizeMismatch {
                    expected: 8,
                    actual: 4
                }
            ),
            "Element size mismatch: map stores 8 byte elements, got 4"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(
            Error::InvalidCapacity { capacity: 3 },
            Error::InvalidCapacity { capacity: 3 }
        );
        assert_ne!(
            Error::InvalidCapacity { capacity: 3 },
            Error::PositionOutOfArena { addr: 3 }
        );
    }
}
