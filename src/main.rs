//! CLI entry point. Exposes the three verbs visible to the core (§6): `run`, `calibrate`, and a
//! `validate` stub that defers to the oracle-comparison collaborator outside this crate's scope.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use cortex_core::abi::{PluginConfig, SampleDtype, ABI_VERSION};
use cortex_core::config::RunConfig;
use cortex_core::loader::LoadedPlugin;
use cortex_core::orchestrator::{Orchestrator, ShutdownFlag};
use cortex_core::{cortex_error, cortex_log};

#[derive(Parser)]
#[command(name = "cortex", version, about = "Deterministic real-time benchmarking harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root directory containing plugin libraries, resolved against each `spec_uri` (§4.1).
    #[arg(long, global = true, env = "CORTEX_PRIMITIVES_ROOT", default_value = ".")]
    primitives_root: PathBuf,

    /// Increase log verbosity (stacks with `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one configuration end to end.
    Run {
        /// Path to a YAML run configuration (§6).
        config: PathBuf,
    },
    /// Execute only the calibration path of a single plugin.
    Calibrate {
        #[arg(long)]
        kernel: String,
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        windows: u32,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 160)]
        window_length_samples: u32,
        #[arg(long, default_value_t = 80)]
        hop_samples: u32,
        #[arg(long, default_value_t = 1)]
        channels: u32,
        #[arg(long, default_value_t = 16_000.0)]
        sample_rate_hz: f64,
        #[arg(long, default_value = "float32")]
        dtype: String,
    },
    /// Run oracle comparison against a reference implementation (external collaborator, §6).
    Validate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cortex_core::util::init_logging();

    let result = match cli.command {
        Command::Run { config } => run_command(&cli.primitives_root, &config),
        Command::Calibrate {
            kernel,
            dataset,
            windows,
            output,
            window_length_samples,
            hop_samples,
            channels,
            sample_rate_hz,
            dtype,
        } => calibrate_command(
            &cli.primitives_root,
            &kernel,
            &dataset,
            windows,
            &output,
            window_length_samples,
            hop_samples,
            channels,
            sample_rate_hz,
            &dtype,
        ),
        Command::Validate => {
            cortex_error!("validate is an external collaborator outside this core's scope");
            Err(anyhow::anyhow!(
                "validate is not implemented by cortex-core; run the oracle-comparison tool \
                 separately"
            ))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cortex: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_command(primitives_root: &PathBuf, config_path: &PathBuf) -> anyhow::Result<()> {
    let yaml = std::fs::read_to_string(config_path)?;
    let mut config = RunConfig::load(&yaml, primitives_root)?;
    config.apply_env_overrides();

    let shutdown = ShutdownFlag::new();
    install_sigterm_handler(shutdown.clone());

    let orchestrator = Orchestrator::new(config, primitives_root.clone(), shutdown);
    let outcome = orchestrator.run()?;

    for plugin in &outcome.plugin_outcomes {
        match &plugin.telemetry_path {
            Some(path) => cortex_log!("plugin '{}' succeeded -> {:?}", plugin.plugin_name, path),
            None => cortex_log!("plugin '{}' failed", plugin.plugin_name),
        }
    }

    // Exit codes (§7, §6): non-zero only if every plugin failed (resource failures already
    // propagate as an `Err` from `orchestrator.run()` above and are handled by `main`'s match).
    if outcome.all_failed() {
        anyhow::bail!("every plugin failed; see diagnostics above");
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn calibrate_command(
    primitives_root: &PathBuf,
    kernel: &str,
    dataset: &PathBuf,
    windows: u32,
    output: &PathBuf,
    window_length_samples: u32,
    hop_samples: u32,
    channels: u32,
    sample_rate_hz: f64,
    dtype: &str,
) -> anyhow::Result<()> {
    let dtype = SampleDtype::parse(dtype)
        .ok_or_else(|| anyhow::anyhow!("unknown dtype '{dtype}'"))?;

    let library_path = cortex_core::loader::resolve_library_path(primitives_root, kernel)?;
    let loaded = LoadedPlugin::load(kernel, &library_path)?;

    let training_bytes = std::fs::read(dataset)?;
    let training_data: Vec<f32> = training_bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect();

    let config = PluginConfig {
        abi_version: ABI_VERSION,
        struct_size: std::mem::size_of::<PluginConfig>() as u32,
        sample_rate_hz,
        window_length_samples,
        hop_samples,
        channels,
        dtype,
        allow_in_place: false,
        kernel_params_ptr: std::ptr::null(),
        kernel_params_len: 0,
        calibration_state_ptr: std::ptr::null(),
        calibration_state_len: 0,
    };

    let state = loaded
        .calibrate(&config, &training_data, windows)
        .ok_or_else(|| anyhow::anyhow!("calibration failed for plugin '{kernel}'"))?;

    let calibration = cortex_core::abi::CalibrationState {
        state_version: 1,
        payload: state,
    };
    std::fs::write(output, calibration.to_bytes())?;
    cortex_log!("wrote calibration state to {output:?}");
    Ok(())
}

#[cfg(unix)]
fn install_sigterm_handler(shutdown: ShutdownFlag) {
    use nix::sys::signal::{self, SigHandler, Signal};

    // The signal handler itself cannot safely close over `shutdown`, so a process-wide static is
    // used and polled by a dedicated thread instead of doing work inside the handler (§5:
    // cancellation is observed cooperatively between chunks, never inside one).
    static REQUESTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

    extern "C" fn handle_sigterm(_: i32) {
        REQUESTED.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    unsafe {
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_sigterm));
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(handle_sigterm));
    }

    let _ = cortex_core::util::spawn_named("cortex-signal-watch", move || loop {
        if REQUESTED.load(std::sync::atomic::Ordering::SeqCst) {
            shutdown.signal();
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });
}

#[cfg(not(unix))]
fn install_sigterm_handler(_shutdown: ShutdownFlag) {}
