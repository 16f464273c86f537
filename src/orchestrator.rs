//! Run lifecycle sequencing: per-kernel warm-up, repeats, teardown, and telemetry write-out
//! (§4.9, §5, §7).
//!
//! One [`Orchestrator::run`] call drives every `ready` plugin in a [`RunConfig`] sequentially.
//! Per plugin: construct a scheduler with the shared telemetry buffer attached, load and register
//! the plugin, start the background load generator, feed a warm-up prefix, then the measured
//! repeats, destroy the scheduler (tearing down the plugin) before unloading its library, and
//! finally carve out that plugin's telemetry segment to its own output file. A load failure skips
//! that plugin and continues with the rest (§7); the run only exits non-zero if every plugin
//! failed or a resource failure occurred.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::clock::{MonotonicClock, SystemClock};
use crate::config::{RunConfig, ValidatedPlugin};
use crate::error::{CortexError, CortexResult};
use crate::load_controller;
use crate::loader::LoadedPlugin;
use crate::replayer::Replayer;
use crate::rt_policy;
use crate::scheduler::Scheduler;
use crate::telemetry::{self, Format, RunMetadata, TelemetryBuffer};
use crate::{cortex_error, cortex_log, cortex_warn};

/// Outcome of running a single plugin's measured segment (§7).
pub struct PluginOutcome {
    pub plugin_name: String,
    pub succeeded: bool,
    pub telemetry_path: Option<PathBuf>,
}

/// Aggregate result of a full run across every `ready` plugin (§7, "partial success is a
/// supported outcome").
pub struct RunOutcome {
    pub run_id: String,
    pub plugin_outcomes: Vec<PluginOutcome>,
}

impl RunOutcome {
    /// Exit-code policy from §7: non-zero only if every plugin failed, or a resource failure was
    /// recorded (tracked separately via [`Orchestrator::run`]'s early return).
    pub fn all_failed(&self) -> bool {
        !self.plugin_outcomes.is_empty() && self.plugin_outcomes.iter().all(|o| !o.succeeded)
    }
}

/// Cooperative shutdown signal observed between chunks and at the outer duration-loop boundary
/// (§5, "Cancellation semantics"). A single atomic word, acquire/release ordering.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_signalled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Orchestrator {
    config: RunConfig,
    primitives_root: PathBuf,
    clock: Arc<dyn MonotonicClock>,
    shutdown: ShutdownFlag,
}

impl Orchestrator {
    pub fn new(config: RunConfig, primitives_root: PathBuf, shutdown: ShutdownFlag) -> Self {
        Self {
            config,
            primitives_root,
            clock: Arc::new(SystemClock::new()),
            shutdown,
        }
    }

    /// Execute every `ready` plugin in `self.config` sequentially and write out per-plugin
    /// telemetry segments (§4.9).
    pub fn run(&self) -> CortexResult<RunOutcome> {
        let run_id = Uuid::new_v4().to_string();
        std::fs::create_dir_all(&self.config.output_directory)?;

        rt_policy::apply_scheduling_class(self.config.scheduler_class, self.config.priority);
        rt_policy::apply_cpu_affinity(&self.config.cpu_affinity);

        let metadata = RunMetadata::collect(run_id.clone());
        let mut telemetry = TelemetryBuffer::new();
        let mut outcomes = Vec::with_capacity(self.config.plugins.len());

        for plugin in &self.config.plugins {
            if self.shutdown.is_signalled() {
                cortex_log!("shutdown observed before plugin '{}' started", plugin.name);
                break;
            }

            let segment_start = telemetry.next_index();
            match self.run_one_plugin(plugin, &run_id, telemetry) {
                Ok((next_telemetry, resource_failed)) => {
                    telemetry = next_telemetry;
                    if resource_failed {
                        return Err(CortexError::ResourceFailure(format!(
                            "resource failure while running plugin '{}'",
                            plugin.name
                        )));
                    }
                    let segment_end = telemetry.next_index();
                    let path = self.write_plugin_segment(
                        plugin,
                        &metadata,
                        &telemetry,
                        segment_start,
                        segment_end,
                    )?;
                    outcomes.push(PluginOutcome {
                        plugin_name: plugin.name.clone(),
                        succeeded: true,
                        telemetry_path: Some(path),
                    });
                }
                Err(err) => {
                    cortex_error!("plugin '{}' failed: {err}", plugin.name);
                    outcomes.push(PluginOutcome {
                        plugin_name: plugin.name.clone(),
                        succeeded: false,
                        telemetry_path: None,
                    });
                }
            }
        }

        Ok(RunOutcome {
            run_id,
            plugin_outcomes: outcomes,
        })
    }

    /// Run one plugin's full measured lifecycle, returning the telemetry buffer (with this
    /// plugin's records appended) so it can carry over to the next plugin (§5, "shared across
    /// sequential scheduler instances").
    fn run_one_plugin(
        &self,
        plugin: &ValidatedPlugin,
        run_id: &str,
        telemetry: TelemetryBuffer,
    ) -> CortexResult<(TelemetryBuffer, bool)> {
        let library_path = crate::loader::resolve_library_path(&self.primitives_root, &plugin.spec_uri)?;
        let loaded = LoadedPlugin::load(&plugin.name, &library_path)?;

        let params_bytes = plugin.params.as_bytes();
        let calibration_bytes = plugin.calibration_state.as_ref().map(|s| s.to_bytes());
        let plugin_config = crate::abi::PluginConfig {
            abi_version: crate::abi::ABI_VERSION,
            struct_size: std::mem::size_of::<crate::abi::PluginConfig>() as u32,
            sample_rate_hz: self.config.sample_rate_hz,
            window_length_samples: plugin.window_length_samples,
            hop_samples: plugin.hop_samples,
            channels: plugin.channels,
            dtype: plugin.dtype,
            allow_in_place: plugin.allow_in_place,
            kernel_params_ptr: params_bytes.as_ptr(),
            kernel_params_len: params_bytes.len(),
            calibration_state_ptr: calibration_bytes
                .as_ref()
                .map(|b| b.as_ptr())
                .unwrap_or(std::ptr::null()),
            calibration_state_len: calibration_bytes.as_ref().map(|b| b.len()).unwrap_or(0),
        };

        let handle = loaded.initialize(&plugin.name, &plugin_config)?;

        let scheduler_config = self.config.scheduler_config(plugin);
        let mut scheduler = Scheduler::new(scheduler_config, self.clock.clone(), run_id, telemetry)
            .map_err(|err| {
                cortex_error!("scheduler construction failed for '{}': {err}", plugin.name);
                err
            })?;
        scheduler.register(handle);

        // An `Err` here means the load-generator singleton is already held by someone else; that
        // is not this plugin's fault, so the run continues without background load rather than
        // aborting (§7 reserves hard failure for configuration, load, resource, and calibration
        // errors of the plugin itself).
        let load_handle = match load_controller::start("cortex-load-generator", self.config.load_profile) {
            Ok(handle) => Some(handle),
            Err(err) => {
                cortex_warn!("background load generator unavailable: {err}");
                None
            }
        };

        let resource_failed = (|| -> CortexResult<()> {
            let replayer_config = self.config.replayer_config(plugin.hop_samples);
            let mut replayer = Replayer::create(replayer_config, self.clock.clone())?;

            // Warm-up: feed at the configured hop rate until the scheduler's internal warm-up
            // counter (set from `warmup_seconds` at construction) reaches zero. We drive this
            // through the same feed path as measured repeats since warm-up and measurement share
            // one continuous windowing buffer (§4.9).
            self.run_duration(&mut replayer, &mut scheduler, self.config.warmup_seconds)?;

            for repeat in 0..self.config.repeats {
                if self.shutdown.is_signalled() {
                    cortex_log!("shutdown observed before repeat {repeat} of '{}'", plugin.name);
                    break;
                }
                scheduler.begin_repeat(repeat);
                self.run_duration(&mut replayer, &mut scheduler, self.config.duration_seconds)?;
            }

            replayer.stop();
            scheduler.flush();
            Ok(())
        })()
        .is_err();

        if let Some(handle) = load_handle {
            load_controller::stop(handle);
        }

        let telemetry = scheduler.into_telemetry();
        Ok((telemetry, resource_failed))
    }

    /// Feed samples into `scheduler` for `duration_seconds`, pacing via a real [`Replayer`]
    /// started and stopped for this span. The scheduler's dispatch (and thus its internal state,
    /// including the warm-up countdown) is driven entirely by the replayer's callback.
    fn run_duration(
        &self,
        replayer: &mut Replayer,
        scheduler: &mut Scheduler,
        duration_seconds: f64,
    ) -> CortexResult<()> {
        if duration_seconds <= 0.0 {
            return Ok(());
        }

        // `Scheduler` itself is `Send`, but handing a `&mut` across the `ChunkSink: Send`
        // boundary needs a raw pointer since borrows can't cross it. §5 guarantees only one
        // thread (the pacing thread, while it's running) touches scheduler state at a time, and
        // `stop()` below joins that thread before this function returns, so the alias is never
        // live concurrently with anything else observing `scheduler`.
        struct SchedulerPtr(*mut Scheduler);
        unsafe impl Send for SchedulerPtr {}
        let scheduler_ptr = SchedulerPtr(scheduler);

        replayer.start(move |chunk: &[f32]| unsafe {
            (*scheduler_ptr.0).feed_samples(chunk);
        })?;

        std::thread::sleep(Duration::from_secs_f64(duration_seconds));
        replayer.stop();
        Ok(())
    }

    fn write_plugin_segment(
        &self,
        plugin: &ValidatedPlugin,
        metadata: &RunMetadata,
        telemetry: &TelemetryBuffer,
        start: usize,
        end: usize,
    ) -> CortexResult<PathBuf> {
        let format: Format = self.config.output_format;
        let file_name = format!("{}.{}", plugin.name, format.extension());
        let path = self.config.output_directory.join(file_name);
        telemetry::write_range(&path, format, metadata, telemetry, start, end)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_flag_round_trips() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_signalled());
        flag.signal();
        assert!(flag.is_signalled());
    }

    #[test]
    fn run_outcome_all_failed_requires_at_least_one_plugin() {
        let outcome = RunOutcome {
            run_id: "run".into(),
            plugin_outcomes: vec![],
        };
        assert!(!outcome.all_failed());
    }

    #[test]
    fn run_outcome_all_failed_true_when_every_plugin_failed() {
        let outcome = RunOutcome {
            run_id: "run".into(),
            plugin_outcomes: vec![
                PluginOutcome {
                    plugin_name: "a".into(),
                    succeeded: false,
                    telemetry_path: None,
                },
                PluginOutcome {
                    plugin_name: "b".into(),
                    succeeded: false,
                    telemetry_path: None,
                },
            ],
        };
        assert!(outcome.all_failed());
    }

    #[test]
    fn run_outcome_all_failed_false_with_a_partial_success() {
        let outcome = RunOutcome {
            run_id: "run".into(),
            plugin_outcomes: vec![
                PluginOutcome {
                    plugin_name: "a".into(),
                    succeeded: true,
                    telemetry_path: Some(PathBuf::from("a.ndjson")),
                },
                PluginOutcome {
                    plugin_name: "b".into(),
                    succeeded: false,
                    telemetry_path: None,
                },
            ],
        };
        assert!(!outcome.all_failed());
    }
}
