// Tracing macros for gateway-shm
//
// These macros forward to the tracing crate.

// -----------------------------------------------------------------------------
// trace! - Hot paths: slot acquire/release, ring claims, budget claims
// -----------------------------------------------------------------------------

#![allow(unused_macro_rules)]

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// -----------------------------------------------------------------------------
// debug! - Layout construction, spy resynchronization
// -----------------------------------------------------------------------------

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// -----------------------------------------------------------------------------
// warn! - Recovered shared-memory state left behind by another producer
// -----------------------------------------------------------------------------

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
