//! JSONL run-log writer (spec.md §6 "Persisted run log (JSONL, v2)"). The
//! SQLite-backed run store (`crate::run_store`) is the source of truth; this
//! is a thin projection of a run and its samples onto the JSONL contract
//! some external tooling still expects, grounded in the teacher's batched
//! `BufWriter` flush idiom (`utils/export.rs`) but one JSON object per line
//! instead of a CSV row.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::run_store::TopPeak;

const LOG_SCHEMA_VERSION: &str = "v2";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunLogRecord {
    RunMetadata(RunMetadataRecord),
    Sample(SampleLogRecord),
    RunEnd(RunEndRecord),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadataRecord {
    pub schema_version: &'static str,
    pub run_id: Uuid,
    pub start_time_utc: DateTime<Utc>,
    pub end_time_utc: Option<DateTime<Utc>>,
    pub sensor_model: String,
    pub raw_sample_rate_hz: u32,
    pub feature_interval_s: f64,
    pub fft_window_size_samples: usize,
    pub fft_window_type: String,
    pub peak_picker_method: String,
    pub accel_scale_g_per_lsb: f64,
    pub units: String,
    pub amplitude_definitions: String,
    pub tire_circumference_m: Option<f64>,
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleLogRecord {
    pub t_s: f64,
    pub speed_kmh: f64,
    pub accel_x_g: f64,
    pub accel_y_g: f64,
    pub accel_z_g: f64,
    pub dominant_freq_hz: Option<f64>,
    pub vibration_strength_db: Option<f64>,
    pub strength_bucket: Option<String>,
    pub top_peaks: Vec<TopPeak>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEndRecord {
    pub run_id: Uuid,
    pub end_time_utc: DateTime<Utc>,
    pub sample_count: i64,
}

/// Appends one record per line, flushing after every write so a crash mid-run
/// loses at most the in-flight record (same no-buffered-data-loss posture as
/// the teacher's CSV export, which flushes per summary write).
pub struct RunLogWriter {
    out: BufWriter<File>,
}

impl RunLogWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self { out: BufWriter::new(file) })
    }

    fn write_record(&mut self, record: &RunLogRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    pub fn write_metadata(&mut self, metadata: RunMetadataRecord) -> io::Result<()> {
        self.write_record(&RunLogRecord::RunMetadata(metadata))
    }

    pub fn write_sample(&mut self, sample: SampleLogRecord) -> io::Result<()> {
        self.write_record(&RunLogRecord::Sample(sample))
    }

    pub fn write_run_end(&mut self, end: RunEndRecord) -> io::Result<()> {
        self.write_record(&RunLogRecord::RunEnd(end))
    }
}

pub fn schema_version() -> &'static str {
    LOG_SCHEMA_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use tempfile::NamedTempFile;

    #[test]
    fn writes_one_json_object_per_line_in_order() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = RunLogWriter::create(tmp.path()).unwrap();
        let run_id = Uuid::new_v4();
        let start = Utc::now();

        writer
            .write_metadata(RunMetadataRecord {
                schema_version: LOG_SCHEMA_VERSION,
                run_id,
                start_time_utc: start,
                end_time_utc: None,
                sensor_model: "vibe-node-v2".to_string(),
                raw_sample_rate_hz: 800,
                feature_interval_s: 0.25,
                fft_window_size_samples: 2048,
                fft_window_type: "hann".to_string(),
                peak_picker_method: "local_maxima_v1".to_string(),
                accel_scale_g_per_lsb: 1.0 / 16384.0,
                units: "g".to_string(),
                amplitude_definitions: "rms".to_string(),
                tire_circumference_m: Some(2.0),
                firmware_version: Some("1.2.3".to_string()),
            })
            .unwrap();

        writer
            .write_sample(SampleLogRecord {
                t_s: 0.0,
                speed_kmh: 50.0,
                accel_x_g: 0.01,
                accel_y_g: 0.02,
                accel_z_g: 0.98,
                dominant_freq_hz: Some(25.0),
                vibration_strength_db: Some(18.0),
                strength_bucket: Some("l3".to_string()),
                top_peaks: vec![TopPeak { hz: 25.0, amp: 0.04, vibration_strength_db: 18.0, strength_bucket: Some("l3".to_string()) }],
            })
            .unwrap();

        writer.write_run_end(RunEndRecord { run_id, end_time_utc: Utc::now(), sample_count: 1 }).unwrap();

        let reader = BufReader::new(File::open(tmp.path()).unwrap());
        let lines: Vec<String> = reader.lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["type"], "run_metadata");
        assert_eq!(first["sensor_model"], "vibe-node-v2");

        let second: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(second["type"], "sample");
        assert_eq!(second["t_s"], 0.0);

        let third: serde_json::Value = serde_json::from_str(&lines[2]).unwrap();
        assert_eq!(third["type"], "run_end");
        assert_eq!(third["sample_count"], 1);
    }
}
