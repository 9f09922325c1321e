//! Integration coverage for the file-backed run store: the WAL/foreign_keys
//! pragmas, schema migration, and the create/append/finalize/analyze
//! lifecycle, all against a real SQLite file rather than the in-memory
//! constructor `run_store`'s own unit tests use.

use chrono::Utc;
use tempfile::NamedTempFile;
use vibe_core::run_store::{RunMetadata, RunStatus, RunStore, RunStoreError, SampleRecord, TopPeak};

fn sample_fixture(t_s: f64) -> SampleRecord {
    SampleRecord {
        record_type: "sample".to_string(),
        schema_version: 2,
        timestamp_utc: Utc::now(),
        t_s,
        client_id: "aa:bb:cc:dd:ee:ff".to_string(),
        client_name: Some("FL".to_string()),
        location: Some("front_left".to_string()),
        sample_rate_hz: Some(800.0),
        speed_kmh: Some(50.0),
        gps_speed_kmh: None,
        speed_source: Some("wheel".to_string()),
        engine_rpm: None,
        engine_rpm_source: None,
        gear: None,
        final_drive_ratio: Some(3.7),
        accel_x_g: 0.01,
        accel_y_g: 0.02,
        accel_z_g: 0.98,
        dominant_freq_hz: Some(25.0),
        dominant_axis: Some("x".to_string()),
        vibration_strength_db: Some(18.0),
        strength_bucket: Some("l3".to_string()),
        strength_peak_amp_g: Some(0.04),
        strength_floor_amp_g: Some(0.002),
        frames_dropped_total: Some(0),
        queue_overflow_drops: Some(0),
        top_peaks: vec![TopPeak { hz: 25.0, amp: 0.04, vibration_strength_db: 18.0, strength_bucket: Some("l3".to_string()) }],
        top_peaks_x: vec![],
        top_peaks_y: vec![],
        top_peaks_z: vec![],
        extra_json: None,
    }
}

#[test]
fn file_backed_store_runs_the_full_lifecycle_under_wal() {
    let tmp = NamedTempFile::new().unwrap();
    let store = RunStore::open(tmp.path()).unwrap();

    let run_id = store.create_run(RunMetadata { car_profile: Some("sedan".to_string()), ..RunMetadata::default() }).unwrap();

    let frames: Vec<SampleRecord> = (0..600).map(|i| sample_fixture(i as f64 * 0.01)).collect();
    store.append_samples(run_id, &frames).unwrap();

    store.finalize(run_id, Utc::now(), None).unwrap();
    store.store_analysis(run_id, &serde_json::json!({"findings": []})).unwrap();

    let run = store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.sample_count, 600);
    assert!(run.analysis.is_some());

    let rows: Vec<SampleRecord> = store.iter_samples(run_id, 128).collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(rows.len(), 600);
    assert_eq!(rows[0].client_name.as_deref(), Some("FL"));

    store.delete_run(run_id).unwrap();
    assert!(store.get_run(run_id).unwrap().is_none());
}

#[test]
fn reopening_the_same_file_preserves_runs_across_connections() {
    let tmp = NamedTempFile::new().unwrap();

    let run_id = {
        let store = RunStore::open(tmp.path()).unwrap();
        let run_id = store.create_run(RunMetadata::default()).unwrap();
        store.append_samples(run_id, &[sample_fixture(0.0)]).unwrap();
        store.finalize(run_id, Utc::now(), None).unwrap();
        run_id
    };

    // A fresh connection to the same file, as main.rs would open on restart,
    // still sees the run and its samples under the WAL journal.
    let store = RunStore::open(tmp.path()).unwrap();
    let run = store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Analyzing);
    assert_eq!(run.sample_count, 1);
}

#[test]
fn create_run_fails_while_another_run_is_recording() {
    let tmp = NamedTempFile::new().unwrap();
    let store = RunStore::open(tmp.path()).unwrap();
    store.create_run(RunMetadata::default()).unwrap();

    let err = store.create_run(RunMetadata::default());
    assert!(matches!(err, Err(RunStoreError::RunActive)));
}

#[test]
fn opening_a_legacy_v4_database_file_migrates_samples_forward() {
    let tmp = NamedTempFile::new().unwrap();
    {
        // Minimal pre-migration schema: a v4 samples table with none of the
        // typed columns `samples_v2` adds, plus the schema_meta row that
        // tells RunStore::migrate() where to start from.
        let conn = rusqlite::Connection::open(tmp.path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             INSERT INTO schema_meta (key, value) VALUES ('version', '4');
             CREATE TABLE runs (
                 run_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 start_time_utc TEXT NOT NULL,
                 end_time_utc TEXT,
                 metadata_json TEXT NOT NULL,
                 analysis_json TEXT,
                 error_message TEXT,
                 sample_count INTEGER NOT NULL DEFAULT 0,
                 created_at TEXT NOT NULL,
                 analysis_version INTEGER,
                 analysis_started_at TEXT,
                 analysis_completed_at TEXT
             );
             CREATE TABLE samples (id INTEGER PRIMARY KEY, run_id TEXT NOT NULL, t_s REAL NOT NULL);",
        )
        .unwrap();
    }

    // Opening through RunStore runs the migration in place; the store must
    // come up on the current schema with samples_v2 usable immediately.
    let store = RunStore::open(tmp.path()).unwrap();
    let run_id = store.create_run(RunMetadata::default()).unwrap();
    store.append_samples(run_id, &[sample_fixture(0.0)]).unwrap();

    let run = store.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.sample_count, 1);
}
