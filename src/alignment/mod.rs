//! Time alignment (spec.md §4.9): per-sensor window intersection, overlap
//! ratio, and sync status across the set of sensors active in a tick.

use crate::codec::ClientId;
use crate::ring_buffer::SnapshotBundle;
use std::time::Instant;

/// Gates multi-sensor grouping; `ALIGNMENT_REPORT_RATIO` is intentionally
/// the same float (`overlap_ratio`, reported as-is) — see DESIGN.md's
/// resolution of the "two alignment thresholds" open question. Callers
/// needing a stricter reporting cutoff can threshold `overlap_ratio`
/// themselves; `aligned` always means "≥ this gate".
pub const ALIGNMENT_GATE_RATIO: f64 = 0.5;

/// One sensor's analysis window for this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorWindow {
    pub sensor_id: ClientId,
    pub start_s: f64,
    pub end_s: f64,
    pub synced: bool,
}

/// Computes `(start_s, end_s, synced)` for one sensor (spec.md §4.9).
/// `clock_origin` anchors the fallback path's monotonic-to-seconds
/// conversion consistently across sensors (all windows must share the same
/// origin to be comparable); `now` is the time the snapshot was taken and
/// `sample_count` is the number of samples actually present in the ring.
pub fn sensor_window(clock_origin: Instant, now: Instant, sensor_id: ClientId, snapshot: &SnapshotBundle, sample_count: usize) -> SensorWindow {
    let sample_rate = (snapshot.sample_rate_hz as f64).max(1.0);
    if snapshot.last_t0_us > 0 {
        let end_s = snapshot.last_t0_us as f64 / 1_000_000.0 + snapshot.samples_since_t0 as f64 / sample_rate;
        let start_s = end_s - sample_count as f64 / sample_rate;
        SensorWindow { sensor_id, start_s, end_s, synced: true }
    } else {
        let end_s = now.saturating_duration_since(clock_origin).as_secs_f64();
        let start_s = end_s - sample_count as f64 / sample_rate;
        SensorWindow { sensor_id, start_s, end_s, synced: false }
    }
}

/// Intersection/overlap summary across a set of sensor windows.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentInfo {
    pub shared_window: Option<(f64, f64)>,
    pub overlap_ratio: f64,
    pub aligned: bool,
    pub clock_synced: bool,
    pub sensor_count: usize,
    pub sensors_excluded: Vec<ClientId>,
}

fn overlap_len(a: &SensorWindow, b: &SensorWindow) -> f64 {
    let s = a.start_s.max(b.start_s);
    let e = a.end_s.min(b.end_s);
    (e - s).max(0.0)
}

/// Computes alignment across `windows`. A single sensor is trivially
/// aligned. Sensors with no overlap with the rest are iteratively peeled
/// off into `sensors_excluded` (by lowest total pairwise overlap) until the
/// remaining set intersects, or only one sensor is left.
pub fn align(windows: &[SensorWindow]) -> AlignmentInfo {
    let sensor_count = windows.len();
    if windows.is_empty() {
        return AlignmentInfo { shared_window: None, overlap_ratio: 1.0, aligned: true, clock_synced: true, sensor_count: 0, sensors_excluded: vec![] };
    }
    if windows.len() == 1 {
        let w = windows[0];
        return AlignmentInfo {
            shared_window: Some((w.start_s, w.end_s)),
            overlap_ratio: 1.0,
            aligned: true,
            clock_synced: w.synced,
            sensor_count: 1,
            sensors_excluded: vec![],
        };
    }

    let mut included: Vec<SensorWindow> = windows.to_vec();
    let mut sensors_excluded = Vec::new();

    loop {
        if included.len() <= 1 {
            break;
        }
        let max_start = included.iter().fold(f64::MIN, |m, w| m.max(w.start_s));
        let min_end = included.iter().fold(f64::MAX, |m, w| m.min(w.end_s));
        if max_start <= min_end {
            break;
        }
        let mut scores = vec![0.0f64; included.len()];
        for i in 0..included.len() {
            for j in 0..included.len() {
                if i != j {
                    scores[i] += overlap_len(&included[i], &included[j]);
                }
            }
        }
        let worst_idx = scores.iter().enumerate().min_by(|a, b| a.1.partial_cmp(b.1).unwrap()).map(|(i, _)| i).unwrap();
        sensors_excluded.push(included[worst_idx].sensor_id);
        included.remove(worst_idx);
    }

    let max_start = included.iter().fold(f64::MIN, |m, w| m.max(w.start_s));
    let min_end = included.iter().fold(f64::MAX, |m, w| m.min(w.end_s));
    let min_start = included.iter().fold(f64::MAX, |m, w| m.min(w.start_s));
    let max_end = included.iter().fold(f64::MIN, |m, w| m.max(w.end_s));

    let intersection_len = (min_end - max_start).max(0.0);
    let union_len = (max_end - min_start).max(1e-9);
    let overlap_ratio = (intersection_len / union_len).clamp(0.0, 1.0);
    let aligned = overlap_ratio >= ALIGNMENT_GATE_RATIO;
    let clock_synced = included.iter().all(|w| w.synced);
    let shared_window = if intersection_len > 0.0 { Some((max_start, min_end)) } else { None };

    AlignmentInfo { shared_window, overlap_ratio, aligned, clock_synced, sensor_count, sensors_excluded }
}
