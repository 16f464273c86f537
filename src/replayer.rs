//! Monotonic, paced streaming of hop-sized chunks from a binary dataset file (§4.3).
//!
//! The replayer owns a single pacing thread. Each tick reads one `H × C` chunk and invokes the
//! caller's callback on that thread; deadlines are computed from an absolute schedule
//! (`next_emit_time += H / sample_rate_hz`) so a slow callback does not cause drift to
//! accumulate (§4.3, "best-effort pacer"). On end-of-file the replayer rewinds for endless
//! replay rather than stopping or dropping chunks.
//!
//! The thread lifecycle (spawn on `start`, join on `stop`) mirrors the teacher's
//! `event_loop::background_thread` worker: a dedicated thread reachable only through channel-free
//! atomics here, since pacing must not block on a queue.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::MonotonicClock;
use crate::error::{CortexError, CortexResult};
use crate::{cortex_error, cortex_log};

/// A callback invoked on the pacing thread for every emitted chunk. Must not block and must not
/// retain `chunk` past the call — the buffer backing it is reused on the next tick (§4.3).
pub trait ChunkSink: Send + 'static {
    fn on_chunk(&mut self, chunk: &[f32]);
}

impl<F: FnMut(&[f32]) + Send + 'static> ChunkSink for F {
    fn on_chunk(&mut self, chunk: &[f32]) {
        self(chunk)
    }
}

/// Configuration for one replayer instance. String fields are owned (§9: the configuration type
/// owns its strings rather than borrowing them, unlike the ABI-facing [`crate::abi::PluginConfig`]
/// which is allowed to borrow because its lifetime is scoped to a single call).
#[derive(Debug, Clone)]
pub struct ReplayerConfig {
    pub dataset_path: PathBuf,
    pub sample_rate_hz: f64,
    pub channels: u32,
    pub hop_samples: u32,
}

/// Streams hop-sized chunks from `dataset_path` at `sample_rate_hz`, rewinding at EOF.
pub struct Replayer {
    config: ReplayerConfig,
    clock: Arc<dyn MonotonicClock>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Replayer {
    /// Validate the dataset file exists and is readable, and that the chunk-size computation
    /// cannot overflow (§4.3, "Failure modes"). Does not start the pacing thread.
    pub fn create(config: ReplayerConfig, clock: Arc<dyn MonotonicClock>) -> CortexResult<Self> {
        let metadata = std::fs::metadata(&config.dataset_path).map_err(|err| {
            CortexError::ResourceFailure(format!(
                "dataset {:?} not accessible: {err}",
                config.dataset_path
            ))
        })?;

        let chunk_samples = (config.hop_samples as u64)
            .checked_mul(config.channels as u64)
            .ok_or_else(|| {
                CortexError::Configuration("hop_samples * channels overflows u64".into())
            })?;
        let chunk_bytes = chunk_samples
            .checked_mul(std::mem::size_of::<f32>() as u64)
            .ok_or_else(|| CortexError::Configuration("chunk size calculation overflows".into()))?;

        if chunk_bytes == 0 {
            return Err(CortexError::Configuration(
                "replayer chunk size is zero".into(),
            ));
        }
        if metadata.len() < chunk_bytes {
            return Err(CortexError::Configuration(format!(
                "dataset {:?} ({} bytes) is smaller than one hop chunk ({chunk_bytes} bytes)",
                config.dataset_path,
                metadata.len()
            )));
        }

        Ok(Self {
            config,
            clock,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    /// Start the pacing thread, invoking `sink` for every emitted chunk until [`Self::stop`] is
    /// called.
    pub fn start(&mut self, mut sink: impl ChunkSink) -> CortexResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CortexError::ResourceFailure(
                "replayer is already running".into(),
            ));
        }

        let config = self.config.clone();
        let running = self.running.clone();
        let clock = self.clock.clone();

        let handle = thread::Builder::new()
            .name("cortex-replayer".into())
            .spawn(move || pacing_loop(config, clock, running, move |chunk| sink.on_chunk(chunk)))
            .map_err(|err| CortexError::ResourceFailure(format!("thread spawn failed: {err}")))?;

        self.thread = Some(handle);
        Ok(())
    }

    /// Stop the pacing thread and join it. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                cortex_error!("replayer pacing thread panicked");
            }
        }
    }
}

impl Drop for Replayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pacing_loop(
    config: ReplayerConfig,
    clock: Arc<dyn MonotonicClock>,
    running: Arc<AtomicBool>,
    mut on_chunk: impl FnMut(&[f32]),
) {
    let chunk_samples = config.hop_samples as usize * config.channels as usize;
    let mut chunk = vec![0.0f32; chunk_samples];
    let tick_ns = ((config.hop_samples as f64 / config.sample_rate_hz) * 1e9) as u64;

    let mut file = match File::open(&config.dataset_path) {
        Ok(file) => file,
        Err(err) => {
            cortex_error!("replayer could not open {:?}: {err}", config.dataset_path);
            return;
        }
    };

    let mut next_emit_ns = clock.now_ns();
    while running.load(Ordering::SeqCst) {
        match read_chunk(&mut file, &mut chunk) {
            Ok(true) => {}
            Ok(false) => {
                // EOF: rewind for endless replay (§4.3).
                if let Err(err) = file.seek(SeekFrom::Start(0)) {
                    cortex_error!("replayer failed to rewind dataset: {err}");
                    return;
                }
                match read_chunk(&mut file, &mut chunk) {
                    Ok(true) => {}
                    _ => {
                        cortex_error!("dataset too short to rewind into a full chunk");
                        return;
                    }
                }
            }
            Err(err) => {
                cortex_error!("replayer read error: {err}");
                return;
            }
        }

        on_chunk(&chunk);

        // Advance the absolute schedule unconditionally so a slow tick does not shift future
        // deadlines (§4.3: "no drift accumulation while the scheduler can keep up").
        next_emit_ns += tick_ns;
        let now_ns = clock.now_ns();
        if next_emit_ns > now_ns {
            thread::sleep(Duration::from_nanos(next_emit_ns - now_ns));
        }
        // If we're behind schedule, proceed immediately; the scheduler will observe any
        // resulting deadline misses rather than the replayer trying to catch up by skipping
        // chunks (§4.3).
    }
}

fn read_chunk(file: &mut File, buf: &mut [f32]) -> io::Result<bool> {
    let byte_len = std::mem::size_of_val(buf);
    let mut bytes = vec![0u8; byte_len];
    let mut filled = 0;
    while filled < byte_len {
        match file.read(&mut bytes[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    if filled < byte_len {
        // Covers both a clean EOF (filled == 0) and a partial trailing read on a dataset whose
        // byte length isn't an exact multiple of the chunk size: either way there's no full chunk
        // left at the current offset, so the caller rewinds to the start and re-reads rather than
        // treating this as a fatal error (§4.3, §8: "replayer rewinds" on EOF).
        return Ok(false);
    }
    for (i, sample) in buf.iter_mut().enumerate() {
        let start = i * 4;
        *sample = f32::from_le_bytes(bytes[start..start + 4].try_into().unwrap());
    }
    Ok(true)
}

/// Write a raw little-endian `f32` dataset file. Used by tests and by offline dataset
/// preparation tooling outside the core's scope (§1); kept here because the replayer is the only
/// consumer of the format within this crate.
pub fn write_raw_dataset(path: &Path, samples: &[f32]) -> io::Result<()> {
    use std::io::Write;
    let mut file = File::create(path)?;
    for sample in samples {
        file.write_all(&sample.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::Mutex;

    fn make_dataset(dir: &tempfile::TempDir, samples: &[f32]) -> PathBuf {
        let path = dir.path().join("dataset.raw");
        write_raw_dataset(&path, samples).unwrap();
        path
    }

    #[test]
    fn rejects_dataset_shorter_than_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_dataset(&dir, &[0.0; 4]);
        let config = ReplayerConfig {
            dataset_path: path,
            sample_rate_hz: 160.0,
            channels: 2,
            hop_samples: 80,
        };
        let clock = Arc::new(FakeClock::new());
        assert!(Replayer::create(config, clock).is_err());
    }

    #[test]
    fn rejects_missing_dataset() {
        let config = ReplayerConfig {
            dataset_path: PathBuf::from("/does/not/exist.raw"),
            sample_rate_hz: 160.0,
            channels: 1,
            hop_samples: 80,
        };
        let clock = Arc::new(FakeClock::new());
        assert!(Replayer::create(config, clock).is_err());
    }

    #[test]
    fn rewinds_at_eof_without_duplicating_into_overrun() {
        let dir = tempfile::tempdir().unwrap();
        // Exactly one chunk of data: every subsequent read should rewind.
        let samples: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let path = make_dataset(&dir, &samples);
        let config = ReplayerConfig {
            dataset_path: path,
            sample_rate_hz: 1_000_000.0,
            channels: 1,
            hop_samples: 8,
        };
        let clock = Arc::new(FakeClock::new());
        let mut replayer = Replayer::create(config, clock.clone()).unwrap();

        let received: Arc<Mutex<Vec<Vec<f32>>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        replayer
            .start(move |chunk: &[f32]| {
                received_clone.lock().unwrap().push(chunk.to_vec());
            })
            .unwrap();

        // Let it tick a handful of times; tick period is tiny (8us) so this settles quickly.
        thread::sleep(Duration::from_millis(20));
        replayer.stop();

        let received = received.lock().unwrap();
        assert!(received.len() >= 2, "expected multiple rewinds to occur");
        for chunk in received.iter() {
            assert_eq!(chunk, &samples);
        }
    }
}
