//! No-op stand-ins for the `log` macros when the `log` feature is disabled.

#![cfg(not(feature = "log"))]

macro_rules! debug {
    ($($arg:tt)*) => {};
}

macro_rules! warn {
    ($($arg:tt)*) => {};
}

macro_rules! trace {
    ($($arg:tt)*) => {};
}
