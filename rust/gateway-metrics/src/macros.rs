// Tracing macros for gateway-metrics
//
// These macros forward to the tracing crate.

// -----------------------------------------------------------------------------
// trace! - Label allocation and lookups
// -----------------------------------------------------------------------------

#![allow(unused_macro_rules)]

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// -----------------------------------------------------------------------------
// debug! - Layout creation and attachment
// -----------------------------------------------------------------------------

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
