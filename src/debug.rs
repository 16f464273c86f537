//! Logging macros used throughout the core. These wrap the `log` crate the same way a thin
//! wrapper normally would, but add the `_debug_assert` family used to flag violations of the
//! host/plugin trust boundary (§4.2) without tearing down a run over a single misbehaving
//! kernel.
//!
//! The logger itself is configured once in [`crate::util::init_logging`] and respects the
//! standard `RUST_LOG` environment variable.

/// Write an informational line to the log.
#[macro_export]
macro_rules! cortex_log {
    ($($args:tt)*) => (
        $crate::log::info!($($args)*)
    );
}
pub use cortex_log;

/// Write an error line to the log. Used for surfaced, non-fatal errors (§7).
#[macro_export]
macro_rules! cortex_error {
    ($($args:tt)*) => (
        $crate::log::error!($($args)*)
    );
}
pub use cortex_error;

/// Write a warning line to the log. Used for graceful degradation (§4.6, §4.7).
#[macro_export]
macro_rules! cortex_warn {
    ($($args:tt)*) => (
        $crate::log::warn!($($args)*)
    );
}
pub use cortex_warn;

/// A `debug_assert!()` analogue that logs instead of panicking. The plugin ABI is a trust
/// boundary (§4.2, §9): a kernel that violates its contract must be observable, not fatal to the
/// host process.
#[macro_export]
macro_rules! cortex_debug_assert {
    ($cond:expr $(,)?) => (
        if cfg!(debug_assertions) && !$cond {
            $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($cond)));
        }
    );
    ($cond:expr, $format:expr $(, $($args:tt)*)?) => (
        if cfg!(debug_assertions) && !$cond {
            $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($cond), ", ", $format), $($($args)*)?);
        }
    );
}
pub use cortex_debug_assert;
