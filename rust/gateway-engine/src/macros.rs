// Tracing macros for gateway-engine
//
// These macros forward to the tracing crate.

// -----------------------------------------------------------------------------
// debug! - Per-worker layout creation and attachment
// -----------------------------------------------------------------------------

#![allow(unused_macro_rules)]

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// -----------------------------------------------------------------------------
// info! - Engine lifecycle
// -----------------------------------------------------------------------------

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
