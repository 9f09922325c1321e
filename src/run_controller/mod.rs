//! Run controller (spec.md §4.11): owns the recording state machine and
//! decides when to start/stop a run from sensor activity, handing post-stop
//! analysis to a background thread so it never blocks the event loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::codec::ClientId;
use crate::config::SharedConfig;
use crate::ingest::ACCEL_SCALE_G_PER_LSB;
use crate::run_log::{RunEndRecord, RunLogWriter, RunMetadataRecord, SampleLogRecord};
use crate::run_store::{RunMetadata, RunStore, RunStoreError};

#[derive(Debug, Error)]
pub enum RunControllerError {
    #[error("a run is already recording")]
    AlreadyRecording,
    #[error(transparent)]
    Store(#[from] RunStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Recording,
    Analyzing,
    Complete,
    Error,
}

/// Produces the `findings` artifact for a finished run. Diagnostic analysis
/// proper (order matching, report generation) is outside this crate's
/// scope; the default implementation emits a minimal summary so the run
/// reaches `complete` with a non-null `analysis_json`.
pub type AnalysisFn = dyn Fn(Uuid, &RunStore) -> serde_json::Value + Send + Sync;

fn default_analysis(run_id: Uuid, store: &RunStore) -> serde_json::Value {
    let sample_count = store.get_run(run_id).ok().flatten().map(|r| r.sample_count).unwrap_or(0);
    serde_json::json!({ "sample_count": sample_count, "findings": [] })
}

struct Inner {
    state: RunState,
    current_run: Option<Uuid>,
    last_frame_totals: HashMap<ClientId, u64>,
    last_activity_at: Option<Instant>,
    analysis_handle: Option<JoinHandle<()>>,
}

/// Owns the `idle -> recording -> analyzing -> (complete|error) -> idle`
/// state machine described in spec.md §4.11.
pub struct RunController {
    store: Arc<RunStore>,
    inner: Mutex<Inner>,
    config: SharedConfig,
    silence_timeout_s: f64,
    analysis_fn: Arc<AnalysisFn>,
}

impl RunController {
    pub fn new(store: Arc<RunStore>, config: SharedConfig, silence_timeout_s: f64) -> Self {
        Self::with_analysis_fn(store, config, silence_timeout_s, Arc::new(default_analysis))
    }

    pub fn with_analysis_fn(store: Arc<RunStore>, config: SharedConfig, silence_timeout_s: f64, analysis_fn: Arc<AnalysisFn>) -> Self {
        Self {
            store,
            inner: Mutex::new(Inner {
                state: RunState::Idle,
                current_run: None,
                last_frame_totals: HashMap::new(),
                last_activity_at: None,
                analysis_handle: None,
            }),
            config,
            silence_timeout_s,
            analysis_fn,
        }
    }

    pub fn state(&self) -> RunState {
        self.inner.lock().state
    }

    pub fn current_run(&self) -> Option<Uuid> {
        self.inner.lock().current_run
    }

    /// Manual start. Refuses with `AlreadyRecording` if a run is active.
    pub fn start(&self, metadata: RunMetadata) -> Result<Uuid, RunControllerError> {
        let mut inner = self.inner.lock();
        if inner.state == RunState::Recording {
            return Err(RunControllerError::AlreadyRecording);
        }
        let run_id = self.store.create_run(metadata)?;
        inner.state = RunState::Recording;
        inner.current_run = Some(run_id);
        inner.last_activity_at = Some(Instant::now());
        info!("run {run_id} started");
        Ok(run_id)
    }

    /// Manual/auto stop. Idempotent: calling it while idle is a no-op.
    /// Finalizes the active run and spawns the background analysis thread.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state != RunState::Recording {
            return;
        }
        let Some(run_id) = inner.current_run else {
            inner.state = RunState::Idle;
            return;
        };
        match self.store.finalize(run_id, Utc::now(), None) {
            Ok(()) => inner.state = RunState::Analyzing,
            Err(e) => {
                let _ = self.store.finalize(run_id, Utc::now(), Some(e.to_string()));
                inner.state = RunState::Error;
                inner.current_run = None;
                error!("run {run_id} failed to finalize: {e}");
                return;
            }
        }
        self.spawn_analysis(&mut inner, run_id);
    }

    fn spawn_analysis(&self, inner: &mut Inner, run_id: Uuid) {
        let store = self.store.clone();
        let analysis_fn = self.analysis_fn.clone();
        let config = self.config.clone();
        let handle = std::thread::spawn(move || {
            let findings = analysis_fn(run_id, &store);
            if let Err(e) = store.store_analysis(run_id, &findings) {
                let _ = store.finalize(run_id, Utc::now(), Some(e.to_string()));
                error!("run {run_id} analysis failed: {e}");
                return;
            }
            info!("run {run_id} analysis complete");
            write_run_log(&store, &config, run_id);
        });
        inner.analysis_handle = Some(handle);
        inner.current_run = None;
    }

    /// Called once per processor tick with each active sensor's current
    /// cumulative `frames_total`. Drives auto-start on activity and
    /// auto-stop on silence. `auto_start` gates whether idle activity opens
    /// a new run (some deployments prefer manual-only recording).
    pub fn observe_tick(&self, frame_totals: &HashMap<ClientId, u64>, now: Instant, auto_start: bool) {
        let mut inner = self.inner.lock();

        // Poll the background analysis thread to completion so `state()`
        // reflects reality without blocking the caller.
        if inner.state == RunState::Analyzing {
            if let Some(h) = &inner.analysis_handle {
                if h.is_finished() {
                    let handle = inner.analysis_handle.take().unwrap();
                    let _ = handle.join();
                    inner.state = RunState::Idle;
                }
            }
        }

        let activity = frame_totals.iter().any(|(id, &total)| inner.last_frame_totals.get(id).map(|&prev| total > prev).unwrap_or(total > 0));
        inner.last_frame_totals = frame_totals.clone();

        match inner.state {
            RunState::Idle => {
                if activity && auto_start {
                    drop(inner);
                    match self.start(RunMetadata::default()) {
                        Ok(run_id) => info!("auto-started run {run_id}"),
                        Err(e) => warn!("auto-start failed: {e}"),
                    }
                    return;
                }
            }
            RunState::Recording => {
                if activity {
                    inner.last_activity_at = Some(now);
                } else if let Some(last) = inner.last_activity_at {
                    let silent_for = now.saturating_duration_since(last).as_secs_f64();
                    if silent_for >= self.silence_timeout_s {
                        let run_id = inner.current_run;
                        drop(inner);
                        if run_id.is_some() {
                            info!("auto-stopping run {run_id:?} after {silent_for:.1}s of silence");
                            self.stop();
                        }
                        return;
                    }
                } else {
                    inner.last_activity_at = Some(now);
                }
            }
            _ => {}
        }
    }

}

/// Projects a completed run onto the JSONL log contract external tooling
/// still expects. Best-effort: a failure here doesn't roll back the
/// SQLite-side `complete` status, it just stays unlogged and is reported.
fn write_run_log(store: &RunStore, config: &SharedConfig, run_id: Uuid) {
    let run = match store.get_run(run_id) {
        Ok(Some(run)) => run,
        Ok(None) => {
            warn!("run {run_id} vanished before its log could be written");
            return;
        }
        Err(e) => {
            warn!("run {run_id} log export failed to read run metadata: {e}");
            return;
        }
    };

    let path = format!("run_{run_id}.jsonl");
    let mut writer = match RunLogWriter::create(&path) {
        Ok(w) => w,
        Err(e) => {
            warn!("run {run_id} log file {path} failed to open: {e}");
            return;
        }
    };

    let metadata = RunMetadataRecord {
        schema_version: crate::run_log::schema_version(),
        run_id,
        start_time_utc: run.start_time_utc,
        end_time_utc: run.end_time_utc,
        sensor_model: "vibe-node-v2".to_string(),
        raw_sample_rate_hz: config.sample_rate_hz,
        feature_interval_s: 1.0 / config.fft_update_hz.max(0.1),
        fft_window_size_samples: config.fft_n,
        fft_window_type: "hann".to_string(),
        peak_picker_method: "local_maxima_v1".to_string(),
        accel_scale_g_per_lsb: ACCEL_SCALE_G_PER_LSB as f64,
        units: "g".to_string(),
        amplitude_definitions: "rms".to_string(),
        tire_circumference_m: Some(config.vehicle.tire_circumference_m),
        firmware_version: None,
    };
    if let Err(e) = writer.write_metadata(metadata) {
        warn!("run {run_id} log metadata write failed: {e}");
        return;
    }

    for sample in store.iter_samples(run_id, crate::run_store::BATCH_SIZE) {
        match sample {
            Ok(s) => {
                let record = SampleLogRecord {
                    t_s: s.t_s,
                    speed_kmh: s.speed_kmh.unwrap_or(0.0),
                    accel_x_g: s.accel_x_g,
                    accel_y_g: s.accel_y_g,
                    accel_z_g: s.accel_z_g,
                    dominant_freq_hz: s.dominant_freq_hz,
                    vibration_strength_db: s.vibration_strength_db,
                    strength_bucket: s.strength_bucket,
                    top_peaks: s.top_peaks,
                };
                if let Err(e) = writer.write_sample(record) {
                    warn!("run {run_id} log sample write failed: {e}");
                }
            }
            Err(e) => warn!("run {run_id} sample read failed during log export: {e}"),
        }
    }

    let end_time_utc = run.end_time_utc.unwrap_or_else(Utc::now);
    if let Err(e) = writer.write_run_end(RunEndRecord { run_id, end_time_utc, sample_count: run.sample_count }) {
        warn!("run {run_id} log run_end write failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::run_store::RunStatus;
    use std::time::Duration;

    fn cid(n: u8) -> ClientId {
        ClientId([0, 0, 0, 0, 0, n])
    }

    #[test]
    fn manual_start_fails_when_already_recording() {
        let store = Arc::new(RunStore::open_in_memory().unwrap());
        let controller = RunController::new(store, ProcessingConfig::shared(), 30.0);
        controller.start(RunMetadata::default()).unwrap();
        let err = controller.start(RunMetadata::default());
        assert!(matches!(err, Err(RunControllerError::AlreadyRecording)));
    }

    #[test]
    fn stop_while_idle_is_a_no_op() {
        let store = Arc::new(RunStore::open_in_memory().unwrap());
        let controller = RunController::new(store, ProcessingConfig::shared(), 30.0);
        controller.stop();
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[test]
    fn stop_finalizes_and_runs_analysis_to_complete() {
        let store = Arc::new(RunStore::open_in_memory().unwrap());
        let controller = RunController::new(store.clone(), ProcessingConfig::shared(), 30.0);
        let run_id = controller.start(RunMetadata::default()).unwrap();
        controller.stop();
        assert_eq!(controller.state(), RunState::Analyzing);

        // Background analysis thread runs asynchronously; wait briefly.
        for _ in 0..50 {
            let run = store.get_run(run_id).unwrap().unwrap();
            if run.status == RunStatus::Complete {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Complete);
        assert!(run.analysis.is_some());
    }

    #[test]
    fn auto_start_on_activity_then_auto_stop_on_silence() {
        let store = Arc::new(RunStore::open_in_memory().unwrap());
        let controller = RunController::new(store, ProcessingConfig::shared(), 0.05);
        let mut totals = HashMap::new();
        totals.insert(cid(1), 1u64);
        let t0 = Instant::now();
        controller.observe_tick(&totals, t0, true);
        assert_eq!(controller.state(), RunState::Recording);

        // No new frames and enough elapsed time should auto-stop.
        std::thread::sleep(Duration::from_millis(80));
        controller.observe_tick(&totals, Instant::now(), true);
        assert_eq!(controller.state(), RunState::Analyzing);
    }

    #[test]
    fn no_auto_start_when_disabled() {
        let store = Arc::new(RunStore::open_in_memory().unwrap());
        let controller = RunController::new(store, ProcessingConfig::shared(), 30.0);
        let mut totals = HashMap::new();
        totals.insert(cid(1), 1u64);
        controller.observe_tick(&totals, Instant::now(), false);
        assert_eq!(controller.state(), RunState::Idle);
    }
}
