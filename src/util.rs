//! Small helpers shared across modules that don't warrant their own file.

use crate::cortex_log;

/// Initialize the global logger from `RUST_LOG`, defaulting to `info` (§9, ambient stack). Safe
/// to call more than once; subsequent calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Spawn a named thread, logging if the spawn itself fails rather than panicking — thread
/// creation is a resource failure (§7), not a bug, and the caller decides how to react.
pub fn spawn_named<F>(name: &str, f: F) -> std::io::Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let handle = std::thread::Builder::new().name(name.to_string()).spawn(f)?;
    cortex_log!("spawned thread '{name}'");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_named_runs_the_closure() {
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag_clone = flag.clone();
        let handle = spawn_named("test-thread", move || {
            flag_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .unwrap();
        handle.join().unwrap();
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
