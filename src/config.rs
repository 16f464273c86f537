//! YAML-shaped run configuration: parsing, validation, and binding into the component configs
//! the rest of the core consumes (§4.8, §6).
//!
//! Parsing itself is nominally an external collaborator's job (§1, "OUT OF SCOPE"), but the core
//! still needs a concrete, validated in-memory form to drive a run end to end, so this module
//! owns both: a raw `serde`-deserialized tree mirroring the table in §6, and a validation pass
//! that turns it into an immutable [`RunConfig`]. Only the `ready` plugin entries are parsed
//! strictly (`deny_unknown_fields`); everything else tolerates and ignores unrecognised keys,
//! matching the teacher's own "informational sections are lenient, behavioral sections are
//! strict" posture in `wrapper/standalone/config.rs`.

use std::path::PathBuf;

use serde::Deserialize;

use crate::abi::{CalibrationState, SampleDtype};
use crate::error::{CortexError, CortexResult};
use crate::load_controller::LoadProfile;
use crate::replayer::ReplayerConfig;
use crate::rt_policy::SchedulingClass;
use crate::scheduler::SchedulerConfig;
use crate::telemetry::Format;
use crate::{cortex_log, cortex_warn};

#[derive(Debug, Deserialize)]
struct RawConfig {
    system: Option<SystemSection>,
    dataset: DatasetSection,
    realtime: RealtimeSection,
    benchmark: BenchmarkSection,
    output: OutputSection,
    plugins: Vec<serde_yaml::Value>,
}

#[derive(Debug, Deserialize, Default)]
struct SystemSection {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DatasetSection {
    path: PathBuf,
    sample_rate_hz: f64,
    channels: u32,
    format: String,
}

#[derive(Debug, Deserialize, Default)]
struct RealtimeSection {
    #[serde(default = "default_scheduler")]
    scheduler: String,
    priority: Option<i32>,
    #[serde(default)]
    cpu_affinity: Vec<usize>,
    deadline_ms: Option<f64>,
    deadline: Option<DeadlineParams>,
}

fn default_scheduler() -> String {
    "other".to_string()
}

#[derive(Debug, Deserialize)]
struct DeadlineParams {
    runtime_us: u64,
    period_us: u64,
    deadline_us: u64,
}

#[derive(Debug, Deserialize)]
struct BenchmarkSection {
    #[serde(default)]
    metrics: Vec<String>,
    parameters: BenchmarkParameters,
    #[serde(default = "default_load_profile")]
    load_profile: String,
}

fn default_load_profile() -> String {
    "idle".to_string()
}

#[derive(Debug, Deserialize)]
struct BenchmarkParameters {
    duration_seconds: f64,
    repeats: u32,
    #[serde(default)]
    warmup_seconds: f64,
}

#[derive(Debug, Deserialize)]
struct OutputSection {
    directory: PathBuf,
    format: String,
}

/// Strict schema for a `ready` plugin entry; unknown keys are a configuration error (§6).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictPluginSection {
    name: String,
    status: String,
    spec_uri: String,
    runtime: RuntimeSection,
    #[serde(default)]
    params: Option<String>,
    #[serde(default)]
    calibration_state: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeSection {
    window_length_samples: u32,
    hop_samples: u32,
    channels: u32,
    dtype: String,
    #[serde(default)]
    allow_in_place: bool,
}

/// Only used to read `status` out of an otherwise-untrusted plugin entry before deciding whether
/// to parse it strictly.
#[derive(Debug, Deserialize)]
struct StatusProbe {
    #[serde(default)]
    status: Option<String>,
}

/// One validated, ready-to-run plugin entry (§3, §4.8).
#[derive(Debug, Clone)]
pub struct ValidatedPlugin {
    pub name: String,
    pub spec_uri: String,
    pub window_length_samples: u32,
    pub hop_samples: u32,
    pub channels: u32,
    pub dtype: SampleDtype,
    pub allow_in_place: bool,
    /// Flat `key=value` text blob passed to the plugin verbatim (§9, Open Question resolution).
    pub params: String,
    pub calibration_state: Option<CalibrationState>,
}

/// The fully validated, owned run configuration (§3). Every string the core needs past
/// validation is owned here rather than borrowed (§9: "the configuration type should own its
/// strings").
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub name: String,
    pub dataset_path: PathBuf,
    pub sample_rate_hz: f64,
    pub channels: u32,
    pub scheduler_class: SchedulingClass,
    pub priority: i32,
    pub cpu_affinity: Vec<usize>,
    pub deadline_ms: Option<f64>,
    pub duration_seconds: f64,
    pub repeats: u32,
    pub warmup_seconds: f64,
    pub load_profile: LoadProfile,
    pub output_directory: PathBuf,
    pub output_format: Format,
    pub plugins: Vec<ValidatedPlugin>,
}

impl RunConfig {
    /// Parse and validate a YAML document into a [`RunConfig`], rooted at `primitives_root` for
    /// resolving plugin `spec_uri` entries (§4.1).
    pub fn load(yaml: &str, primitives_root: &std::path::Path) -> CortexResult<Self> {
        let raw: RawConfig = serde_yaml::from_str(yaml)
            .map_err(|err| CortexError::Configuration(format!("invalid config YAML: {err}")))?;
        Self::from_raw(raw, primitives_root)
    }

    fn from_raw(raw: RawConfig, primitives_root: &std::path::Path) -> CortexResult<Self> {
        if raw.dataset.format != "raw" {
            return Err(CortexError::Configuration(format!(
                "unsupported dataset format '{}': only 'raw' is accepted",
                raw.dataset.format
            )));
        }
        if raw.dataset.sample_rate_hz <= 0.0 {
            return Err(CortexError::Configuration(
                "dataset.sample_rate_hz must be > 0".into(),
            ));
        }
        if raw.dataset.channels == 0 {
            return Err(CortexError::Configuration(
                "dataset.channels must be > 0".into(),
            ));
        }

        let scheduler_class = SchedulingClass::parse(&raw.realtime.scheduler).ok_or_else(|| {
            CortexError::Configuration(format!(
                "unknown realtime.scheduler '{}'",
                raw.realtime.scheduler
            ))
        })?;
        if scheduler_class == SchedulingClass::Deadline && raw.realtime.deadline.is_none() {
            return Err(CortexError::Configuration(
                "realtime.deadline.{runtime_us,period_us,deadline_us} are required when \
                 scheduler=deadline"
                    .into(),
            ));
        }

        if raw.benchmark.parameters.repeats < 1 {
            return Err(CortexError::Configuration(
                "benchmark.parameters.repeats must be >= 1".into(),
            ));
        }
        if raw.benchmark.parameters.duration_seconds <= 0.0 {
            return Err(CortexError::Configuration(
                "benchmark.parameters.duration_seconds must be > 0".into(),
            ));
        }

        let load_profile = LoadProfile::parse(&raw.benchmark.load_profile).ok_or_else(|| {
            CortexError::Configuration(format!(
                "unknown benchmark.load_profile '{}'",
                raw.benchmark.load_profile
            ))
        })?;
        let output_format = Format::parse(&raw.output.format).ok_or_else(|| {
            CortexError::Configuration(format!("unknown output.format '{}'", raw.output.format))
        })?;

        if let Some(deadline_ms) = raw.realtime.deadline_ms {
            // deadline_ms is logging-only and never authoritative; a per-plugin mismatch against
            // the derived H/Fs deadline is checked below once each plugin's hop is known.
            cortex_log!("configured realtime.deadline_ms={deadline_ms} (logging-only)");
        }

        let mut plugins = Vec::with_capacity(raw.plugins.len());
        for entry in raw.plugins {
            let probe: StatusProbe = serde_yaml::from_value(entry.clone()).map_err(|err| {
                CortexError::Configuration(format!("malformed plugin entry: {err}"))
            })?;
            let is_ready = probe.status.as_deref() == Some("ready");
            if !is_ready {
                continue;
            }

            let strict: StrictPluginSection = serde_yaml::from_value(entry).map_err(|err| {
                CortexError::Configuration(format!(
                    "plugin entry with status=ready has an invalid or unrecognised field: {err}"
                ))
            })?;

            let dtype = SampleDtype::parse(&strict.runtime.dtype).ok_or_else(|| {
                CortexError::Configuration(format!(
                    "plugin '{}': unknown dtype '{}'",
                    strict.name, strict.runtime.dtype
                ))
            })?;

            if strict.runtime.hop_samples == 0
                || strict.runtime.hop_samples > strict.runtime.window_length_samples
            {
                return Err(CortexError::Configuration(format!(
                    "plugin '{}': requires 0 < hop_samples <= window_length_samples",
                    strict.name
                )));
            }
            if strict.runtime.channels != raw.dataset.channels {
                return Err(CortexError::Configuration(format!(
                    "plugin '{}': runtime.channels ({}) must match dataset.channels ({})",
                    strict.name, strict.runtime.channels, raw.dataset.channels
                )));
            }

            if let Some(implied_deadline_ms) = raw.realtime.deadline_ms {
                let derived_ms =
                    1000.0 * strict.runtime.hop_samples as f64 / raw.dataset.sample_rate_hz;
                if (implied_deadline_ms - derived_ms).abs() > 1e-6 {
                    cortex_warn!(
                        "plugin '{}': realtime.deadline_ms ({implied_deadline_ms}) does not match \
                         the derived deadline H/Fs ({derived_ms}); the derived value is \
                         authoritative (§9)",
                        strict.name
                    );
                }
            }

            crate::loader::resolve_library_path(primitives_root, &strict.spec_uri)?;

            let calibration_state = match &strict.calibration_state {
                Some(path) => {
                    let bytes = std::fs::read(path).map_err(|err| {
                        CortexError::InvalidCalibrationState {
                            path: path.clone(),
                            reason: format!("could not read file: {err}"),
                        }
                    })?;
                    Some(CalibrationState::from_bytes(&bytes).map_err(|err| match err {
                        CortexError::InvalidCalibrationState { reason, .. } => {
                            CortexError::InvalidCalibrationState {
                                path: path.clone(),
                                reason,
                            }
                        }
                        other => other,
                    })?)
                }
                None => None,
            };

            plugins.push(ValidatedPlugin {
                name: strict.name,
                spec_uri: strict.spec_uri,
                window_length_samples: strict.runtime.window_length_samples,
                hop_samples: strict.runtime.hop_samples,
                channels: strict.runtime.channels,
                dtype,
                allow_in_place: strict.runtime.allow_in_place,
                params: strict.params.unwrap_or_default(),
                calibration_state,
            });
        }

        if plugins.is_empty() {
            return Err(CortexError::Configuration(
                "no plugin entries with status=ready".into(),
            ));
        }

        Ok(Self {
            name: raw
                .system
                .and_then(|s| s.name)
                .unwrap_or_else(|| "unnamed-run".to_string()),
            dataset_path: raw.dataset.path,
            sample_rate_hz: raw.dataset.sample_rate_hz,
            channels: raw.dataset.channels,
            scheduler_class,
            priority: raw.realtime.priority.unwrap_or(0),
            cpu_affinity: raw.realtime.cpu_affinity,
            deadline_ms: raw.realtime.deadline_ms,
            duration_seconds: raw.benchmark.parameters.duration_seconds,
            repeats: raw.benchmark.parameters.repeats,
            warmup_seconds: raw.benchmark.parameters.warmup_seconds,
            load_profile,
            output_directory: raw.output.directory,
            output_format,
            plugins,
        })
    }

    /// Apply the `CORTEX_*_OVERRIDE` environment variables (§6). Ignored if unset, empty, or
    /// non-positive.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = positive_env_f64("CORTEX_DURATION_OVERRIDE") {
            cortex_log!("CORTEX_DURATION_OVERRIDE applied: duration_seconds={value}");
            self.duration_seconds = value;
        }
        if let Some(value) = positive_env_u32("CORTEX_REPEATS_OVERRIDE") {
            cortex_log!("CORTEX_REPEATS_OVERRIDE applied: repeats={value}");
            self.repeats = value;
        }
        if let Some(value) = positive_env_f64("CORTEX_WARMUP_OVERRIDE") {
            cortex_log!("CORTEX_WARMUP_OVERRIDE applied: warmup_seconds={value}");
            self.warmup_seconds = value;
        }
    }

    pub fn replayer_config(&self, hop_samples: u32) -> ReplayerConfig {
        ReplayerConfig {
            dataset_path: self.dataset_path.clone(),
            sample_rate_hz: self.sample_rate_hz,
            channels: self.channels,
            hop_samples,
        }
    }

    pub fn scheduler_config(&self, plugin: &ValidatedPlugin) -> SchedulerConfig {
        SchedulerConfig {
            window_length_samples: plugin.window_length_samples,
            hop_samples: plugin.hop_samples,
            channels: plugin.channels,
            sample_rate_hz: self.sample_rate_hz,
            dtype: plugin.dtype,
            warmup_seconds: self.warmup_seconds,
        }
    }
}

fn positive_env_f64(key: &str) -> Option<f64> {
    let raw = std::env::var(key).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    raw.parse::<f64>().ok().filter(|value| *value > 0.0)
}

fn positive_env_u32(key: &str) -> Option<u32> {
    let raw = std::env::var(key).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    raw.parse::<u32>().ok().filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
system:
  name: smoke-test
dataset:
  path: dataset.raw
  sample_rate_hz: 160.0
  channels: 64
  format: raw
realtime:
  scheduler: other
benchmark:
  parameters:
    duration_seconds: 1.0
    repeats: 1
    warmup_seconds: 0.0
  load_profile: idle
output:
  directory: out
  format: ndjson
plugins:
  - name: noop
    status: ready
    spec_uri: noop/noop@float32
    runtime:
      window_length_samples: 160
      hop_samples: 80
      channels: 64
      dtype: float32
"#;

    #[test]
    fn parses_minimal_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::load(MINIMAL_YAML, dir.path()).unwrap();
        assert_eq!(config.plugins.len(), 1);
        assert_eq!(config.plugins[0].name, "noop");
        assert_eq!(config.repeats, 1);
    }

    #[test]
    fn non_ready_plugins_are_skipped_and_tolerate_unknown_keys() {
        let combined = format!(
            "{}\n  - name: disabled\n    status: draft\n    totally_unknown_key: 123\n",
            MINIMAL_YAML.trim_end()
        );
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::load(&combined, dir.path()).unwrap();
        assert_eq!(config.plugins.len(), 1);
    }

    #[test]
    fn rejects_unknown_keys_in_ready_plugin_section() {
        let yaml = MINIMAL_YAML.replace("status: ready", "status: ready\n    bogus_field: 1");
        let dir = tempfile::tempdir().unwrap();
        assert!(RunConfig::load(&yaml, dir.path()).is_err());
    }

    #[test]
    fn rejects_hop_greater_than_window() {
        let yaml = MINIMAL_YAML.replace("hop_samples: 80", "hop_samples: 9999");
        let dir = tempfile::tempdir().unwrap();
        assert!(RunConfig::load(&yaml, dir.path()).is_err());
    }

    #[test]
    fn rejects_deadline_scheduler_without_deadline_params() {
        let yaml = MINIMAL_YAML.replace("scheduler: other", "scheduler: deadline");
        let dir = tempfile::tempdir().unwrap();
        assert!(RunConfig::load(&yaml, dir.path()).is_err());
    }

    #[test]
    fn rejects_non_raw_dataset_format() {
        let yaml = MINIMAL_YAML.replace("format: raw", "format: wav");
        let dir = tempfile::tempdir().unwrap();
        assert!(RunConfig::load(&yaml, dir.path()).is_err());
    }

    #[test]
    fn env_overrides_are_ignored_when_non_positive_or_empty() {
        std::env::set_var("CORTEX_REPEATS_OVERRIDE", "0");
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig::load(MINIMAL_YAML, dir.path()).unwrap();
        let before = config.repeats;
        config.apply_env_overrides();
        assert_eq!(config.repeats, before);
        std::env::remove_var("CORTEX_REPEATS_OVERRIDE");
    }
}
