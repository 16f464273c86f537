//! Low-overhead per-window timing capture and its on-disk projections (§4.5).
//!
//! The in-loop cost of recording one window is bounded to a single append plus a handful of
//! integer stores. [`TelemetryBuffer`] never shrinks and never drops a record short of an
//! allocation failure, which is treated as fatal to the run (§3).
//!
//! NDJSON and CSV are two projections of one record stream (§9): [`Format`] is a variant over the
//! tag, not two parallel writer implementations.

use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::CortexResult;

/// One dispatched window's timing, recorded after warm-up completes (§3).
///
/// Invariants upheld by the scheduler that produces these: `start_ns >= release_ns`,
/// `end_ns >= start_ns`, `deadline_missed == (end_ns > deadline_ns)`.
#[derive(Debug, Clone, Serialize)]
pub struct WindowRecord {
    pub plugin_name: String,
    pub repeat: u32,
    pub window_index: u64,
    pub release_ns: u64,
    pub deadline_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub deadline_missed: bool,
    pub window_length_samples: u32,
    pub hop_samples: u32,
    pub channels: u32,
    pub sample_rate_hz: f64,
    pub dtype: &'static str,
    pub run_id: String,
}

impl WindowRecord {
    pub fn latency_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Metadata captured once per run, written as the first NDJSON line / informational CSV header
/// (§4.5, §6).
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub hostname: String,
    pub os: &'static str,
    pub arch: &'static str,
    pub cpu_model: String,
    pub cpu_count: usize,
    pub timebase_source: &'static str,
    pub timebase_frequency_hz: u64,
}

impl RunMetadata {
    pub fn collect(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            hostname: hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            cpu_model: detect_cpu_model(),
            cpu_count: num_cpus::get(),
            timebase_source: "monotonic",
            // std::time::Instant has no fixed tick rate to report; nanosecond resolution is the
            // contract regardless of the platform's underlying timer frequency.
            timebase_frequency_hz: 1_000_000_000,
        }
    }
}

/// Best-effort CPU model string (§4.5, §6). Reads the `model name` field out of
/// `/proc/cpuinfo` on Linux; falls back to `"unknown"` everywhere else or on any parse failure.
#[cfg(target_os = "linux")]
fn detect_cpu_model() -> String {
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|contents| {
            contents.lines().find_map(|line| {
                line.split_once(':').and_then(|(key, value)| {
                    (key.trim() == "model name").then(|| value.trim().to_string())
                })
            })
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(not(target_os = "linux"))]
fn detect_cpu_model() -> String {
    "unknown".to_string()
}

/// Append-only sequence of [`WindowRecord`] with doubling capacity (§3, §4.5). Never shrinks.
#[derive(Default)]
pub struct TelemetryBuffer {
    records: Vec<WindowRecord>,
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Append one record, doubling capacity on overflow (§4.5). Capacity is amortized and never
    /// released.
    pub fn push(&mut self, record: WindowRecord) {
        if self.records.len() == self.records.capacity() {
            let new_capacity = (self.records.capacity() * 2).max(64);
            self.records.reserve(new_capacity - self.records.len());
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn as_slice(&self) -> &[WindowRecord] {
        &self.records
    }

    /// The index one past the last record currently in the buffer. Used by the orchestrator to
    /// carve out a per-plugin segment `[start, end)` when multiple plugins share one buffer
    /// across sequential runs (§4.5, "Filtering").
    pub fn next_index(&self) -> usize {
        self.records.len()
    }
}

/// On-disk telemetry serialization format (§4.5, §9: one writer, a variant over format tags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ndjson,
    Csv,
}

impl Format {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ndjson" => Some(Self::Ndjson),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Ndjson => "ndjson",
            Self::Csv => "csv",
        }
    }
}

const CSV_HEADER: &str = "plugin_name,repeat,window_index,release_ns,deadline_ns,start_ns,end_ns,\
latency_ns,deadline_missed,window_length_samples,hop_samples,channels,sample_rate_hz,dtype,run_id";

/// Write the `[start, end)` range of `buffer` to `path` in `format`, with `metadata` written
/// first (§4.5, "Filtering"). Field ordering is fixed regardless of format (§4.5).
pub fn write_range(
    path: &Path,
    format: Format,
    metadata: &RunMetadata,
    buffer: &TelemetryBuffer,
    start: usize,
    end: usize,
) -> CortexResult<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = io::BufWriter::new(file);
    let records = &buffer.as_slice()[start..end];

    match format {
        Format::Ndjson => write_ndjson(&mut writer, metadata, records)?,
        Format::Csv => write_csv(&mut writer, metadata, records)?,
    }

    writer.flush()?;
    Ok(())
}

fn write_ndjson<W: Write>(
    writer: &mut W,
    metadata: &RunMetadata,
    records: &[WindowRecord],
) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, metadata)?;
    writer.write_all(b"\n")?;
    for record in records {
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

fn write_csv<W: Write>(
    writer: &mut W,
    metadata: &RunMetadata,
    records: &[WindowRecord],
) -> io::Result<()> {
    writeln!(
        writer,
        "# run_id={},hostname={},os={},arch={},cpu_model={},cpu_count={},timebase_source={},timebase_frequency_hz={}",
        metadata.run_id,
        metadata.hostname,
        metadata.os,
        metadata.arch,
        metadata.cpu_model,
        metadata.cpu_count,
        metadata.timebase_source,
        metadata.timebase_frequency_hz,
    )?;
    writeln!(writer, "{CSV_HEADER}")?;
    for record in records {
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            record.plugin_name,
            record.repeat,
            record.window_index,
            record.release_ns,
            record.deadline_ns,
            record.start_ns,
            record.end_ns,
            record.latency_ns(),
            record.deadline_missed as u8,
            record.window_length_samples,
            record.hop_samples,
            record.channels,
            record.sample_rate_hz,
            record.dtype,
            record.run_id,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(window_index: u64) -> WindowRecord {
        WindowRecord {
            plugin_name: "noop".into(),
            repeat: 0,
            window_index,
            release_ns: 1_000,
            deadline_ns: 2_000,
            start_ns: 1_100,
            end_ns: 1_900,
            deadline_missed: false,
            window_length_samples: 160,
            hop_samples: 80,
            channels: 64,
            sample_rate_hz: 160.0,
            dtype: "float32",
            run_id: "run-1".into(),
        }
    }

    #[test]
    fn buffer_never_drops_pushed_records() {
        let mut buffer = TelemetryBuffer::new();
        for i in 0..500 {
            buffer.push(sample_record(i));
        }
        assert_eq!(buffer.len(), 500);
    }

    #[test]
    fn deadline_missed_matches_end_vs_deadline() {
        let mut record = sample_record(0);
        record.end_ns = record.deadline_ns + 1;
        record.deadline_missed = record.end_ns > record.deadline_ns;
        assert!(record.deadline_missed);
    }

    #[test]
    fn ndjson_and_csv_write_the_same_record_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = TelemetryBuffer::new();
        for i in 0..10 {
            buffer.push(sample_record(i));
        }
        let metadata = RunMetadata::collect("run-1");

        let ndjson_path = dir.path().join("out.ndjson");
        write_range(&ndjson_path, Format::Ndjson, &metadata, &buffer, 0, buffer.len()).unwrap();
        let ndjson_lines = std::fs::read_to_string(&ndjson_path).unwrap();
        // One metadata line + 10 record lines.
        assert_eq!(ndjson_lines.lines().count(), 11);

        let csv_path = dir.path().join("out.csv");
        write_range(&csv_path, Format::Csv, &metadata, &buffer, 0, buffer.len()).unwrap();
        let csv_lines = std::fs::read_to_string(&csv_path).unwrap();
        // One comment metadata line + one header line + 10 record lines.
        assert_eq!(csv_lines.lines().count(), 12);
    }

    #[test]
    fn filtering_writes_only_the_requested_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = TelemetryBuffer::new();
        for i in 0..6 {
            buffer.push(sample_record(i));
        }
        let metadata = RunMetadata::collect("run-1");
        let path = dir.path().join("segment.ndjson");
        write_range(&path, Format::Ndjson, &metadata, &buffer, 2, 4).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3); // metadata + 2 records
    }
}
