//! Signal processor: the heart of the system (spec.md §4.7).
//!
//! Per sensor per tick, runs a three-phase computation: phase 1 takes a
//! brief-locked snapshot of the ring (see [`crate::ring_buffer`]), phase 2
//! computes unlocked (windowed FFT, peak picking, canonical strength dB,
//! severity band, order classification), phase 3 writes the result back to
//! a per-sensor slot. `compute_all` dispatches phase 2 per sensor to the
//! worker pool (`component_a/processor.rs`'s filter/anomaly/transmit
//! three-stage shape, generalized from one shared pipeline to one pipeline
//! per sensor run in parallel).

pub mod fft;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::ClientId;
use crate::config::{ProcessingConfig, SharedConfig, VehicleOrderModel};
use crate::ring_buffer::{RingStore, SnapshotBundle};
use crate::worker_pool::WorkerPool;
use fft::{axis_spectrum, WindowCache};

/// One axis's picked peak: `(hz, amp)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub hz: f64,
    pub amp_g: f32,
}

/// Canonical order-classification key (GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKey {
    Wheel1,
    Wheel2,
    Shaft1,
    Eng1,
    Eng2,
    ShaftEng1,
    Road,
    Other,
}

impl ClassKey {
    /// The event-matrix source bucket this classification rolls up to
    /// (spec.md §4.8: `{engine, driveshaft, wheel, other}`).
    pub fn source_key(self) -> SourceKey {
        match self {
            ClassKey::Wheel1 | ClassKey::Wheel2 => SourceKey::Wheel,
            ClassKey::Shaft1 => SourceKey::Driveshaft,
            ClassKey::Eng1 | ClassKey::Eng2 => SourceKey::Engine,
            ClassKey::ShaftEng1 => SourceKey::Engine,
            ClassKey::Road | ClassKey::Other => SourceKey::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Engine,
    Driveshaft,
    Wheel,
    Other,
}

/// Canonical vibration-strength computation, result of spec.md §4.7 step 6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrengthMetrics {
    pub vibration_strength_db: f64,
    pub peak_band_rms_amp_g: f64,
    pub floor_amp_g: f64,
}

/// Everything computed for one sensor in one tick.
#[derive(Debug, Clone)]
pub struct SensorMetrics {
    pub sensor_id: ClientId,
    pub freq_axis: Vec<f64>,
    pub combined_spectrum_amp_g: Vec<f32>,
    pub peaks_per_axis: [Vec<Peak>; 3],
    pub peaks_combined: Vec<Peak>,
    pub dominant_hz: f64,
    pub dominant_axis: Option<usize>,
    pub strength: StrengthMetrics,
    pub severity: Option<&'static str>,
    pub class_key: ClassKey,
}

/// Live effective-speed input to order classification (spec.md §4.7 step 8).
/// The façade/GPS daemon supplies this; the core only consumes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedInput {
    pub speed_mps: f64,
}

/// Local maxima with `v[i] > v[i±1] > v[i±2]`, sorted by amplitude
/// descending, pruned to keep peaks at least `min_separation_hz` apart,
/// truncated to `top_k`.
pub fn pick_peaks(spectrum: &[f32], bin_hz: f64, min_separation_hz: f64, top_k: usize) -> Vec<Peak> {
    let n = spectrum.len();
    if n < 5 {
        return Vec::new();
    }
    let mut candidates: Vec<(usize, f32)> = Vec::new();
    for i in 2..n - 2 {
        let v = spectrum[i];
        if v > spectrum[i - 1] && spectrum[i - 1] > spectrum[i - 2] && v > spectrum[i + 1] && spectrum[i + 1] > spectrum[i + 2] {
            candidates.push((i, v));
        }
    }
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<Peak> = Vec::new();
    for (bin, amp) in candidates {
        let hz = bin as f64 * bin_hz;
        if kept.iter().any(|p| (p.hz - hz).abs() < min_separation_hz) {
            continue;
        }
        kept.push(Peak { hz, amp_g: amp });
        if kept.len() >= top_k {
            break;
        }
    }
    kept
}

/// Combined-axis RMS spectrum: `sqrt((x^2 + y^2 + z^2) / 3)` per bin.
pub fn combine_axes(x: &[f32], y: &[f32], z: &[f32]) -> Vec<f32> {
    x.iter()
        .zip(y.iter())
        .zip(z.iter())
        .map(|((&xv, &yv), &zv)| (((xv * xv + yv * yv + zv * zv) / 3.0) as f64).sqrt() as f32)
        .collect()
}

/// Median of amplitudes excluding the bins occupied by `excluded_bins`
/// (GLOSSARY "Noise floor").
fn median_excluding(spectrum: &[f32], excluded_bins: &[usize]) -> f64 {
    let mut vals: Vec<f64> = spectrum
        .iter()
        .enumerate()
        .filter(|(i, _)| !excluded_bins.contains(i))
        .map(|(_, &v)| v as f64)
        .collect();
    if vals.is_empty() {
        return 0.0;
    }
    vals.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = vals.len() / 2;
    if vals.len() % 2 == 0 {
        (vals[mid - 1] + vals[mid]) / 2.0
    } else {
        vals[mid]
    }
}

/// Canonical strength computation (spec.md §4.7 step 6). `dominant_bin` is
/// the bin of the dominant combined peak; `peak_bins` are all retained
/// combined-peak bins (excluded from the floor).
pub fn compute_strength(
    spectrum: &[f32],
    bin_hz: f64,
    dominant_bin: Option<usize>,
    peak_bins: &[usize],
    bandwidth_hz: f64,
    eps_min: f64,
    eps_floor_ratio: f64,
) -> StrengthMetrics {
    if spectrum.is_empty() || dominant_bin.is_none() {
        return StrengthMetrics { vibration_strength_db: 0.0, peak_band_rms_amp_g: 0.0, floor_amp_g: 0.0 };
    }
    let dominant_bin = dominant_bin.unwrap();
    let bandwidth_bins = ((bandwidth_hz / bin_hz).round() as usize).max(0);
    let lo = dominant_bin.saturating_sub(bandwidth_bins);
    let hi = (dominant_bin + bandwidth_bins + 1).min(spectrum.len());
    let window = &spectrum[lo..hi];
    let peak_band_rms_amp = if window.is_empty() {
        0.0
    } else {
        (window.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / window.len() as f64).sqrt()
    };

    let floor_amp = median_excluding(spectrum, peak_bins);

    let peak_band_rms_amp = peak_band_rms_amp.max(0.0);
    let floor_amp = floor_amp.max(0.0);
    let eps = eps_min.max(floor_amp * eps_floor_ratio);

    let db = 20.0 * ((peak_band_rms_amp + eps) / (floor_amp + eps)).log10();
    StrengthMetrics { vibration_strength_db: db.max(0.0), peak_band_rms_amp_g: peak_band_rms_amp, floor_amp_g: floor_amp }
}

/// Order classification (spec.md §4.7 step 8, GLOSSARY "Order"). Predicted
/// frequencies combine per-order uncertainty in quadrature; assigns the
/// classification key whose band contains `dominant_hz`, tie-broken by
/// smallest relative error.
pub fn classify_order(dominant_hz: f64, vehicle: &VehicleOrderModel, speed: SpeedInput) -> ClassKey {
    if dominant_hz <= 0.0 {
        return ClassKey::Other;
    }
    // Relative uncertainty budget per order; fixed process-wide fractions
    // (no sensor directly reports these, so a conservative flat estimate
    // is used, matching the teacher's fixed-tolerance anomaly thresholds).
    const SIGMA_WHEEL: f64 = 0.05;
    const SIGMA_DRIVE: f64 = 0.06;
    const SIGMA_ENGINE: f64 = 0.08;

    if vehicle.tire_circumference_m <= 0.0 || speed.speed_mps <= 0.0 {
        return fallback(dominant_hz);
    }

    let wheel_hz = speed.speed_mps / vehicle.tire_circumference_m;
    let drive_hz = wheel_hz * vehicle.final_drive_ratio;
    let engine_hz = drive_hz * vehicle.current_gear_ratio;

    let candidates: [(ClassKey, f64, f64); 5] = [
        (ClassKey::Wheel1, wheel_hz, SIGMA_WHEEL),
        (ClassKey::Wheel2, wheel_hz * 2.0, quad(SIGMA_WHEEL, SIGMA_WHEEL)),
        (ClassKey::Shaft1, drive_hz, quad(SIGMA_WHEEL, SIGMA_DRIVE)),
        (ClassKey::Eng1, engine_hz, quad(SIGMA_WHEEL, quad(SIGMA_DRIVE, SIGMA_ENGINE))),
        (ClassKey::Eng2, engine_hz * 2.0, quad(SIGMA_WHEEL, quad(SIGMA_DRIVE, SIGMA_ENGINE))),
    ];

    // shaft/engine overlap check: if the driveshaft and engine-1x bands
    // overlap within max(0.03, sigma_ds + sigma_eng) relative, treat as
    // ambiguous and emit shaft_eng1.
    let sigma_ds = quad(SIGMA_WHEEL, SIGMA_DRIVE);
    let sigma_eng = quad(SIGMA_WHEEL, quad(SIGMA_DRIVE, SIGMA_ENGINE));
    let overlap_tol = (sigma_ds + sigma_eng).max(0.03);
    if drive_hz > 0.0 && (drive_hz - engine_hz).abs() / drive_hz <= overlap_tol {
        let tol_hz = drive_hz * overlap_tol;
        if (dominant_hz - drive_hz).abs() <= tol_hz.max(drive_hz * sigma_ds) {
            return ClassKey::ShaftEng1;
        }
    }

    let mut best: Option<(ClassKey, f64)> = None;
    for (key, predicted_hz, sigma) in candidates {
        if predicted_hz <= 0.0 {
            continue;
        }
        let tol_hz = predicted_hz * sigma;
        let rel_err = (dominant_hz - predicted_hz).abs() / predicted_hz;
        if (dominant_hz - predicted_hz).abs() <= tol_hz {
            match best {
                Some((_, best_err)) if best_err <= rel_err => {}
                _ => best = Some((key, rel_err)),
            }
        }
    }
    best.map(|(k, _)| k).unwrap_or_else(|| fallback(dominant_hz))
}

fn quad(a: f64, b: f64) -> f64 {
    (a * a + b * b).sqrt()
}

fn fallback(dominant_hz: f64) -> ClassKey {
    if (3.0..=12.0).contains(&dominant_hz) {
        ClassKey::Road
    } else {
        ClassKey::Other
    }
}

/// Dominant combined peak's bin index, by amplitude.
fn dominant_bin_of(spectrum: &[f32]) -> Option<usize> {
    spectrum
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

/// Phase 2: the unlocked compute for one sensor, given its snapshot.
pub fn compute_sensor_metrics(
    sensor_id: ClientId,
    snapshot: &SnapshotBundle,
    window: &WindowCache,
    cfg: &ProcessingConfig,
    speed: SpeedInput,
) -> SensorMetrics {
    let fft_n = window.len();
    let bin_hz = snapshot.sample_rate_hz as f64 / fft_n as f64;
    let w = window.get();

    let sx = axis_spectrum(&snapshot.x, fft_n, w);
    let sy = axis_spectrum(&snapshot.y, fft_n, w);
    let sz = axis_spectrum(&snapshot.z, fft_n, w);

    let peaks_x = pick_peaks(&sx, bin_hz, cfg.peak_min_separation_hz, cfg.peaks_per_axis);
    let peaks_y = pick_peaks(&sy, bin_hz, cfg.peak_min_separation_hz, cfg.peaks_per_axis);
    let peaks_z = pick_peaks(&sz, bin_hz, cfg.peak_min_separation_hz, cfg.peaks_per_axis);

    let combined = combine_axes(&sx, &sy, &sz);
    let peaks_combined = pick_peaks(&combined, bin_hz, cfg.peak_min_separation_hz, cfg.peaks_combined);
    let peak_bins: Vec<usize> = peaks_combined.iter().map(|p| (p.hz / bin_hz).round() as usize).collect();

    let dominant_bin = dominant_bin_of(&combined);
    let dominant_hz = dominant_bin.map(|b| b as f64 * bin_hz).unwrap_or(0.0);
    let dominant_axis = [&peaks_x, &peaks_y, &peaks_z]
        .iter()
        .enumerate()
        .filter_map(|(axis, peaks)| peaks.first().map(|p| (axis, p.amp_g)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(axis, _)| axis);

    let strength = compute_strength(
        &combined,
        bin_hz,
        dominant_bin,
        &peak_bins,
        cfg.peak_bandwidth_hz,
        cfg.strength_epsilon_min_g,
        cfg.strength_epsilon_floor_ratio,
    );

    let severity = cfg.strength_bands.bucket(strength.vibration_strength_db, strength.peak_band_rms_amp_g).map(|b| b.key);
    let class_key = classify_order(dominant_hz, &cfg.vehicle, speed);

    let freq_axis: Vec<f64> = (0..combined.len()).map(|k| k as f64 * bin_hz).collect();

    SensorMetrics {
        sensor_id,
        freq_axis,
        combined_spectrum_amp_g: combined,
        peaks_per_axis: [peaks_x, peaks_y, peaks_z],
        peaks_combined,
        dominant_hz,
        dominant_axis,
        strength,
        severity,
        class_key,
    }
}

/// Per-sensor result slot, written by phase 3. Overwritten (not merged) on
/// every tick — ingest may interleave between phase 2 and phase 3 of the
/// same tick (spec.md §5).
pub struct ResultSlots {
    slots: Mutex<HashMap<ClientId, SensorMetrics>>,
}

impl ResultSlots {
    pub fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    fn store(&self, metrics: SensorMetrics) {
        let mut g = self.slots.lock();
        g.insert(metrics.sensor_id, metrics);
    }

    pub fn get(&self, id: ClientId) -> Option<SensorMetrics> {
        self.slots.lock().get(&id).cloned()
    }

    pub fn snapshot_all(&self) -> Vec<SensorMetrics> {
        self.slots.lock().values().cloned().collect()
    }
}

impl Default for ResultSlots {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the ring store, worker pool, and per-sensor result slots; drives
/// `compute_all` once per scheduler tick.
pub struct SignalProcessor {
    pub rings: Arc<RingStore>,
    pool: WorkerPool<Option<SensorMetrics>>,
    window: WindowCache,
    config: SharedConfig,
    pub results: Arc<ResultSlots>,
}

impl SignalProcessor {
    pub fn new(config: SharedConfig, rings: Arc<RingStore>) -> Self {
        let pool = WorkerPool::new(config.worker_pool_size, config.worker_pool_size.max(1) * 4);
        let window = WindowCache::new(config.fft_n);
        Self { rings, pool, window, config, results: Arc::new(ResultSlots::new()) }
    }

    /// `compute_all(active_sensors)`: dispatches phase-1/2/3 to the worker
    /// pool and gathers results, keyed by sensor id (ordering across
    /// sensors is irrelevant per spec.md §4.7 determinism note). Falls back
    /// to sequential execution for this tick on `PoolSaturated`.
    pub fn compute_all(&self, active_sensors: &[ClientId], speed: SpeedInput) -> usize {
        let fft_n = self.config.fft_n;
        let jobs: Vec<(ClientId, Option<SnapshotBundle>)> =
            active_sensors.iter().map(|&id| (id, self.rings.snapshot(id, fft_n))).collect();

        let window = self.window.clone();
        let cfg = self.config.clone();
        let speed_c = speed;

        let compute_one = move |(id, snap): (ClientId, Option<SnapshotBundle>)| -> Option<SensorMetrics> {
            snap.map(|s| compute_sensor_metrics(id, &s, &window, &cfg, speed_c))
        };

        match self.pool.map_unordered(jobs, compute_one) {
            Ok(results) => {
                let mut computed = 0;
                for r in results.into_iter().flatten().flatten() {
                    self.results.store(r);
                    computed += 1;
                }
                computed
            }
            Err(_) => {
                // PoolSaturated: sequential fallback for this tick (spec.md §4.6/§7).
                let mut computed = 0;
                for &id in active_sensors {
                    if let Some(snap) = self.rings.snapshot(id, fft_n) {
                        let m = compute_sensor_metrics(id, &snap, &self.window, &self.config, speed);
                        self.results.store(m);
                        computed += 1;
                    }
                }
                computed
            }
        }
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn shutdown(self) {
        self.pool.shutdown();
    }
}
