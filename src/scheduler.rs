//! Windowing scheduler: buffer management, window dispatch, deadline assignment, and warm-up
//! handling (§4.4).
//!
//! The scheduler has no explicit lifecycle state machine by design (§4.4, "State-machine-free
//! design by construction"): its three externally visible states (created, running, destroyed)
//! fall out of which methods have been called, not a stored enum. `feed_samples` accepts
//! variable-size bursts and dispatches every time the shift buffer fills to `W × C`, then shifts
//! left by `H × C` to preserve the `(W − H) × C` overlap (§3).

use std::sync::Arc;

use crate::abi::SampleDtype;
use crate::clock::MonotonicClock;
use crate::error::{CortexError, CortexResult};
use crate::loader::PluginHandle;
use crate::telemetry::{TelemetryBuffer, WindowRecord};
use crate::{cortex_debug_assert, cortex_error};

/// Static shape and pacing parameters for one scheduler instance (§3, §4.8).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub window_length_samples: u32,
    pub hop_samples: u32,
    pub channels: u32,
    pub sample_rate_hz: f64,
    pub dtype: SampleDtype,
    pub warmup_seconds: f64,
}

impl SchedulerConfig {
    fn validate(&self) -> CortexResult<()> {
        if self.hop_samples == 0 || self.hop_samples > self.window_length_samples {
            return Err(CortexError::Configuration(format!(
                "invalid hop/window: 0 < H ({}) <= W ({}) is required",
                self.hop_samples, self.window_length_samples
            )));
        }
        if self.channels == 0 {
            return Err(CortexError::Configuration("channels must be > 0".into()));
        }
        if self.sample_rate_hz <= 0.0 {
            return Err(CortexError::Configuration(
                "sample_rate_hz must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn window_samples_total(&self) -> usize {
        self.window_length_samples as usize * self.channels as usize
    }

    fn hop_samples_total(&self) -> usize {
        self.hop_samples as usize * self.channels as usize
    }
}

struct RegisteredPlugin {
    handle: PluginHandle,
    output_buffer: Vec<f32>,
}

/// A registered kernel plus the telemetry and buffer state the scheduler maintains around it.
pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn MonotonicClock>,
    run_id: String,

    shift_buffer: Vec<f32>,
    fill: usize,

    warmup_windows_remaining: u64,
    window_counter: u64,
    current_repeat: u32,

    plugins: Vec<RegisteredPlugin>,
    telemetry: TelemetryBuffer,
}

impl Scheduler {
    /// Construct a scheduler with an attached telemetry buffer and run-id (§4.9, step 1).
    /// `telemetry` may already contain records from a previous plugin's segment in the same run;
    /// the buffer is shared sequentially across scheduler instances, never concurrently (§5).
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn MonotonicClock>,
        run_id: impl Into<String>,
        telemetry: TelemetryBuffer,
    ) -> CortexResult<Self> {
        config.validate()?;
        let capacity = config.window_samples_total();
        let warmup_windows_remaining = ((config.warmup_seconds * config.sample_rate_hz)
            / config.hop_samples as f64)
            .ceil() as u64;

        Ok(Self {
            shift_buffer: vec![0.0; capacity],
            fill: 0,
            warmup_windows_remaining,
            window_counter: 0,
            current_repeat: 0,
            plugins: Vec::new(),
            telemetry,
            config,
            clock,
            run_id: run_id.into(),
        })
    }

    /// Register a plugin. Triggers no ABI calls itself — `handle` must already be initialized
    /// (the orchestrator calls `LoadedPlugin::initialize` before registering, §4.9 step 2).
    /// Allocates the plugin's output buffer using the dimension policy from §4.4: zero in either
    /// dimension of the init result means "inherit the scheduler's own `(W, C)`".
    pub fn register(&mut self, handle: PluginHandle) {
        let output_w = if handle.output_window_length_samples() == 0 {
            self.config.window_length_samples
        } else {
            handle.output_window_length_samples()
        };
        let output_c = if handle.output_channels() == 0 {
            self.config.channels
        } else {
            handle.output_channels()
        };

        let output_buffer = vec![0.0f32; output_w as usize * output_c as usize];
        self.plugins.push(RegisteredPlugin {
            handle,
            output_buffer,
        });
    }

    /// Mark the start of a new repeat. Window indices restart at 0 for the new repeat's records
    /// while the underlying windowing buffer's overlap state carries over unchanged (§4.9, S3).
    pub fn begin_repeat(&mut self, repeat: u32) {
        self.current_repeat = repeat;
        self.window_counter = 0;
    }

    /// Feed a variable-size burst of interleaved samples (`count` total floats, §4.4). Dispatches
    /// every time the shift buffer reaches `W × C` samples. Never silently drops samples under
    /// the `H <= W` invariant; if a burst would overflow the buffer anyway it is logged and
    /// truncated rather than panicking, since a misconfigured feed size must not crash a run.
    pub fn feed_samples(&mut self, samples: &[f32]) {
        let mut offset = 0;
        let capacity = self.shift_buffer.len();

        while offset < samples.len() {
            let available = capacity - self.fill;
            if available == 0 {
                cortex_error!(
                    "scheduler buffer overflow: dispatch did not free capacity; truncating feed"
                );
                break;
            }

            let take = available.min(samples.len() - offset);
            self.shift_buffer[self.fill..self.fill + take]
                .copy_from_slice(&samples[offset..offset + take]);
            self.fill += take;
            offset += take;

            if self.fill == capacity {
                self.dispatch_current_window();
            }
        }
    }

    /// Process any remaining full window and discard any partial one (§4.4). Idempotent: once
    /// the buffer holds fewer than `W × C` samples there is nothing left to dispatch.
    pub fn flush(&mut self) {
        while self.fill == self.shift_buffer.len() {
            self.dispatch_current_window();
        }
    }

    fn dispatch_current_window(&mut self) {
        let release_ns = self.clock.now_ns();
        let deadline_period_ns =
            ((self.config.hop_samples as f64 / self.config.sample_rate_hz) * 1e9) as u64;
        let deadline_ns = release_ns + deadline_period_ns;
        let record_this_window = self.warmup_windows_remaining == 0;
        let window_index = self.window_counter;

        for plugin in &mut self.plugins {
            let start_ns = self.clock.now_ns();
            // SAFETY: `shift_buffer` holds exactly `W * C` samples and `output_buffer` was sized
            // from the plugin's own init result, so both slices match what the plugin was told
            // to expect (§4.2).
            unsafe {
                plugin
                    .handle
                    .process(&self.shift_buffer, &mut plugin.output_buffer);
            }
            let end_ns = self.clock.now_ns();

            cortex_debug_assert!(
                start_ns >= release_ns,
                "window start preceded its release timestamp"
            );
            cortex_debug_assert!(end_ns >= start_ns, "window end preceded its start timestamp");

            if record_this_window {
                let deadline_missed = end_ns > deadline_ns;
                self.telemetry.push(WindowRecord {
                    plugin_name: plugin.handle.name().to_string(),
                    repeat: self.current_repeat,
                    window_index,
                    release_ns,
                    deadline_ns,
                    start_ns,
                    end_ns,
                    deadline_missed,
                    window_length_samples: self.config.window_length_samples,
                    hop_samples: self.config.hop_samples,
                    channels: self.config.channels,
                    sample_rate_hz: self.config.sample_rate_hz,
                    dtype: self.config.dtype.as_str(),
                    run_id: self.run_id.clone(),
                });
            }
        }

        if self.warmup_windows_remaining > 0 {
            self.warmup_windows_remaining -= 1;
        }
        self.window_counter += 1;

        let hop = self.config.hop_samples_total();
        let overlap = self.shift_buffer.len() - hop;
        self.shift_buffer.copy_within(hop.., 0);
        self.fill = overlap;
    }

    pub fn window_counter(&self) -> u64 {
        self.window_counter
    }

    pub fn telemetry(&self) -> &TelemetryBuffer {
        &self.telemetry
    }

    /// Tear down every registered plugin (dropping a [`PluginHandle`] calls `teardown`, §4.1) and
    /// hand back the telemetry buffer so the orchestrator can carry it into the next scheduler
    /// instance or write it out (§4.9, step 6).
    pub fn into_telemetry(self) -> TelemetryBuffer {
        self.telemetry
    }
}

/// The number of windows a scheduler would dispatch for `n` fed samples (in units of sample
/// frames, i.e. not multiplied by channel count), used by §8's quantified invariant and exercised
/// directly in tests without needing a real plugin.
pub fn expected_window_count(n: u64, window_length: u64, hop: u64) -> u64 {
    if n < window_length {
        0
    } else {
        (n - window_length) / hop + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use proptest::prelude::*;

    fn base_config() -> SchedulerConfig {
        SchedulerConfig {
            window_length_samples: 4,
            hop_samples: 2,
            channels: 1,
            sample_rate_hz: 1_000.0,
            dtype: SampleDtype::Float32,
            warmup_seconds: 0.0,
        }
    }

    #[test]
    fn rejects_hop_greater_than_window() {
        let mut config = base_config();
        config.hop_samples = 8;
        let clock = Arc::new(FakeClock::new());
        assert!(Scheduler::new(config, clock, "run", TelemetryBuffer::new()).is_err());
    }

    #[test]
    fn empty_feed_does_not_change_state() {
        let config = base_config();
        let clock = Arc::new(FakeClock::new());
        let mut scheduler = Scheduler::new(config, clock, "run", TelemetryBuffer::new()).unwrap();
        scheduler.feed_samples(&[]);
        assert_eq!(scheduler.window_counter(), 0);
        assert_eq!(scheduler.fill, 0);
    }

    #[test]
    fn window_count_matches_quantified_invariant_without_any_plugin() {
        // No plugins registered: dispatch still happens (it just does nothing per plugin), so
        // the window counter alone exercises the §8 invariant over buffer mechanics.
        for n in [0u64, 1, 3, 4, 5, 7, 8, 100] {
            let config = base_config();
            let clock = Arc::new(FakeClock::new());
            let mut scheduler =
                Scheduler::new(config.clone(), clock, "run", TelemetryBuffer::new()).unwrap();
            let samples = vec![0.0f32; n as usize];
            scheduler.feed_samples(&samples);
            let expected = expected_window_count(
                n,
                config.window_length_samples as u64,
                config.hop_samples as u64,
            );
            assert_eq!(
                scheduler.window_counter(),
                expected,
                "n={n} window_length={} hop={}",
                config.window_length_samples,
                config.hop_samples
            );
        }
    }

    #[test]
    fn h_equals_w_has_no_overlap() {
        let mut config = base_config();
        config.hop_samples = config.window_length_samples;
        let clock = Arc::new(FakeClock::new());
        let mut scheduler = Scheduler::new(config, clock, "run", TelemetryBuffer::new()).unwrap();
        scheduler.feed_samples(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(scheduler.window_counter(), 1);
        assert_eq!(scheduler.fill, 0);
    }

    #[test]
    fn h_equals_one_shifts_by_a_single_sample() {
        let mut config = base_config();
        config.hop_samples = 1;
        let clock = Arc::new(FakeClock::new());
        let mut scheduler = Scheduler::new(config, clock, "run", TelemetryBuffer::new()).unwrap();
        scheduler.feed_samples(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(scheduler.window_counter(), 1);
        assert_eq!(scheduler.fill, 3); // W - H = 3 samples retained
    }

    #[test]
    fn warmup_windows_are_not_recorded() {
        let mut config = base_config();
        config.warmup_seconds = 0.002; // 2 windows at hop=2, sample_rate=1000 -> 1ms per hop
        let clock = Arc::new(FakeClock::new());
        let mut scheduler = Scheduler::new(config, clock, "run", TelemetryBuffer::new()).unwrap();

        // Build a trivial identity plugin via a fake handle is not practical without a real
        // library, so exercise warm-up counting directly through repeated dispatch with zero
        // plugins registered, then check no telemetry got recorded despite windows dispatching.
        scheduler.feed_samples(&[0.0; 4]);
        scheduler.feed_samples(&[0.0; 2]);
        scheduler.feed_samples(&[0.0; 2]);
        assert_eq!(scheduler.telemetry().len(), 0);
        assert!(scheduler.window_counter() >= 2);
    }

    #[test]
    fn flush_is_idempotent_with_no_partial_window_pending() {
        let config = base_config();
        let clock = Arc::new(FakeClock::new());
        let mut scheduler = Scheduler::new(config, clock, "run", TelemetryBuffer::new()).unwrap();
        scheduler.feed_samples(&[1.0, 2.0, 3.0]); // partial window, no dispatch yet
        scheduler.flush();
        scheduler.flush();
        assert_eq!(scheduler.window_counter(), 0);
    }

    #[test]
    fn begin_repeat_resets_window_index_but_keeps_buffer_state() {
        let config = base_config();
        let clock = Arc::new(FakeClock::new());
        let mut scheduler = Scheduler::new(config, clock, "run", TelemetryBuffer::new()).unwrap();
        scheduler.feed_samples(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(scheduler.window_counter(), 1);
        scheduler.begin_repeat(1);
        assert_eq!(scheduler.window_counter(), 0);
    }

    proptest! {
        // §8's quantified invariant, fed through arbitrary chunkings of N samples: the window
        // count depends only on N, W, and H, never on how the feed was split into bursts.
        #[test]
        fn window_count_is_chunking_independent(
            window_length in 1u32..32,
            hop in 1u32..32,
            n in 0u32..200,
            chunk_sizes in proptest::collection::vec(1usize..17, 0..40),
        ) {
            prop_assume!(hop <= window_length);
            let config = SchedulerConfig {
                window_length_samples: window_length,
                hop_samples: hop,
                channels: 1,
                sample_rate_hz: 1_000.0,
                dtype: SampleDtype::Float32,
                warmup_seconds: 0.0,
            };
            let clock = Arc::new(FakeClock::new());
            let mut scheduler =
                Scheduler::new(config, clock, "run", TelemetryBuffer::new()).unwrap();

            let samples = vec![0.0f32; n as usize];
            let mut offset = 0usize;
            let mut sizes = chunk_sizes.into_iter().cycle();
            while offset < samples.len() {
                let take = sizes.next().unwrap_or(1).min(samples.len() - offset);
                let take = take.max(1).min(samples.len() - offset);
                scheduler.feed_samples(&samples[offset..offset + take]);
                offset += take;
            }

            let expected = expected_window_count(n as u64, window_length as u64, hop as u64);
            prop_assert_eq!(scheduler.window_counter(), expected);
        }
    }
}
