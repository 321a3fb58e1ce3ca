//! Construction errors for shared-memory layouts.

use std::fmt;
use std::io;

/// A shared-memory structure could not be built over the given storage.
///
/// These are configuration bugs: the worker that hits one cannot start.
/// Runtime exhaustion never produces a `LayoutError`.
#[derive(Debug)]
pub enum LayoutError {
    /// A capacity that must be zero or a power of two is not.
    NotPowerOfTwo { what: &'static str, value: usize },
    /// The region is not exactly the size the layout needs.
    LengthMismatch { expected: usize, actual: usize },
    /// A stored layout version differs from the one this build understands.
    VersionMismatch { expected: i32, found: i32 },
    /// A capacity is too small to hold even one entry.
    Undersized {
        what: &'static str,
        capacity: usize,
        minimum: usize,
    },
    /// A capacity is larger than the layout's length fields can describe.
    Oversized {
        what: &'static str,
        capacity: usize,
        maximum: usize,
    },
    /// A fixed-capacity table has no room for another entry.
    CapacityExceeded { what: &'static str, capacity: usize },
    /// A writer was requested over a read-only mapping.
    ReadOnly,
    /// A stored header holds values no writer could have produced.
    Corrupt(&'static str),
    /// The backing file could not be created, opened or mapped.
    Io(io::Error),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::NotPowerOfTwo { what, value } => {
                write!(f, "{what} must be zero or a power of two, got {value}")
            }
            LayoutError::LengthMismatch { expected, actual } => {
                write!(f, "region length mismatch: expected {expected}, got {actual}")
            }
            LayoutError::VersionMismatch { expected, found } => {
                write!(f, "layout version mismatch: expected {expected}, found {found}")
            }
            LayoutError::Undersized {
                what,
                capacity,
                minimum,
            } => write!(f, "{what} capacity {capacity} is below the minimum {minimum}"),
            LayoutError::Oversized {
                what,
                capacity,
                maximum,
            } => write!(f, "{what} capacity {capacity} exceeds the maximum {maximum}"),
            LayoutError::CapacityExceeded { what, capacity } => {
                write!(f, "{what} is full (capacity {capacity})")
            }
            LayoutError::ReadOnly => write!(f, "region is mapped read-only"),
            LayoutError::Corrupt(msg) => write!(f, "corrupt layout: {msg}"),
            LayoutError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for LayoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LayoutError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LayoutError {
    fn from(e: io::Error) -> Self {
        LayoutError::Io(e)
    }
}

/// Fails with [`LayoutError::NotPowerOfTwo`] unless `value` is zero or a power of two.
pub(crate) fn check_power_of_two(what: &'static str, value: usize) -> Result<(), LayoutError> {
    if crate::is_zero_or_power_of_two(value) {
        Ok(())
    } else {
        Err(LayoutError::NotPowerOfTwo { what, value })
    }
}

/// Fails with [`LayoutError::LengthMismatch`] unless `actual == expected`.
pub(crate) fn check_length(expected: usize, actual: usize) -> Result<(), LayoutError> {
    if expected == actual {
        Ok(())
    } else {
        Err(LayoutError::LengthMismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_value() {
        let err = LayoutError::NotPowerOfTwo {
            what: "slot_capacity",
            value: 48,
        };
        assert_eq!(
            err.to_string(),
            "slot_capacity must be zero or a power of two, got 48"
        );
    }

    #[test]
    fn io_errors_keep_their_source() {
        use std::error::Error;

        let err: LayoutError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.source().is_some());
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn power_of_two_check_accepts_zero() {
        assert!(check_power_of_two("x", 0).is_ok());
        assert!(check_power_of_two("x", 1).is_ok());
        assert!(check_power_of_two("x", 4096).is_ok());
        assert!(check_power_of_two("x", 3).is_err());
        assert!(check_power_of_two("x", 4095).is_err());
    }
}
