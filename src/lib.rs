//! CORTEX core: a deterministic real-time benchmarking harness that measures per-window latency,
//! jitter, and deadline compliance of signal-processing kernels loaded as dynamic plugins.
//!
//! The crate is organized around four tightly coupled subsystems plus the orchestration and
//! ambient code that makes them runnable end to end:
//!
//! - [`abi`] / [`loader`] — the frozen host/plugin ABI and dynamic library binding.
//! - [`replayer`] — monotonic, paced dataset streaming.
//! - [`scheduler`] — windowing, dispatch, deadlines, warm-up.
//! - [`telemetry`] — per-window timing capture and NDJSON/CSV serialization.
//! - [`load_controller`] / [`rt_policy`] — background load generation and scheduling policy.
//! - [`config`] / [`orchestrator`] — run configuration and lifecycle sequencing.

// Re-exported so the `cortex_log!`/`cortex_error!`/... macros in `debug.rs` can refer to
// `$crate::log::...` regardless of which crate they're invoked from.
pub use log;

pub mod abi;
pub mod clock;
pub mod config;
pub mod debug;
pub mod error;
pub mod load_controller;
pub mod loader;
pub mod orchestrator;
pub mod replayer;
pub mod rt_policy;
pub mod scheduler;
pub mod telemetry;
pub mod util;

pub use error::{CortexError, CortexResult};
