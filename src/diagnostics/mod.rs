//! Live diagnostics (spec.md §4.8): consumes per-tick processor output and
//! maintains the event matrix, per-(sensor,source) severity hysteresis, and
//! multi-sensor grouping. Generalizes the teacher's anomaly+threshold
//! feedback idiom (`component_a/processor.rs`'s dynamic-threshold loop) from
//! a single shared threshold to a per-(sensor,source) hysteresis tracker.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::codec::ClientId;
use crate::config::ProcessingConfig;
use crate::processor::{ClassKey, SensorMetrics, SourceKey};
use crate::registry::LocationCode;

pub const PERSISTENCE_TICKS: u32 = 3;
pub const DECAY_TICKS: u32 = 5;
pub const HYSTERESIS_DB: f64 = 2.0;

/// One accumulated event-matrix cell, keyed by `(source_key, severity_key)`.
#[derive(Debug, Clone, Default)]
pub struct MatrixCell {
    pub count: u64,
    pub seconds_accumulated: f64,
    pub contributors: HashMap<String, u64>,
}

/// `(source_key, severity_key) -> cell`, accumulated over the active run.
#[derive(Debug, Default, Clone)]
pub struct EventMatrix {
    cells: HashMap<(SourceKey, &'static str), MatrixCell>,
}

impl EventMatrix {
    fn record(&mut self, source: SourceKey, severity: &'static str, dt_s: f64, contributor: &str) {
        let cell = self.cells.entry((source, severity)).or_default();
        cell.count += 1;
        cell.seconds_accumulated += dt_s;
        *cell.contributors.entry(contributor.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, source: SourceKey, severity: &'static str) -> Option<&MatrixCell> {
        self.cells.get(&(source, severity))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(SourceKey, &'static str), &MatrixCell)> {
        self.cells.iter()
    }
}

/// Reflects "whether it is a multi-sensor grouping" plus how many sensors
/// corroborated the detection — the higher the count, the higher the
/// reporting confidence (spec.md §3 "Diagnostic event").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceTier {
    Single,
    Grouped(u8),
}

/// A detection: spec.md §3 "Diagnostic event" verbatim.
#[derive(Debug, Clone)]
pub struct DiagnosticEvent {
    pub timestamp: Instant,
    pub sensor_ids: Vec<ClientId>,
    pub sensor_labels: Vec<String>,
    pub center_hz: f64,
    pub peak_amp_g: f64,
    pub floor_amp_g: f64,
    pub class_key: ClassKey,
    pub severity: &'static str,
    pub confidence_tier: ConfidenceTier,
    pub is_group: bool,
}

/// Per-(sensor, source) hysteresis: promote into a band requires
/// `PERSISTENCE_TICKS` consecutive ticks at/above its `min_db`; demote out
/// of a confirmed band requires `DECAY_TICKS` consecutive ticks below
/// `min_db - HYSTERESIS_DB` (spec.md §4.8).
#[derive(Debug, Default, Clone)]
struct Hysteresis {
    confirmed: Option<&'static str>,
    pending: Option<&'static str>,
    promote_ticks: u32,
    below_ticks: u32,
}

impl Hysteresis {
    fn update(&mut self, raw_band: Option<&'static str>, raw_db: f64, cfg: &ProcessingConfig) -> Option<&'static str> {
        match self.confirmed {
            None => {
                if raw_band.is_some() && raw_band == self.pending {
                    self.promote_ticks += 1;
                } else {
                    self.pending = raw_band;
                    self.promote_ticks = if raw_band.is_some() { 1 } else { 0 };
                }
                if raw_band.is_some() && self.promote_ticks >= PERSISTENCE_TICKS {
                    self.confirmed = raw_band;
                    self.pending = None;
                    self.promote_ticks = 0;
                }
            }
            Some(confirmed_key) => {
                let confirmed_min_db =
                    cfg.strength_bands.bands().iter().find(|b| b.key == confirmed_key).map(|b| b.min_db).unwrap_or(0.0);
                if raw_db < confirmed_min_db - HYSTERESIS_DB {
                    self.below_ticks += 1;
                    if self.below_ticks >= DECAY_TICKS {
                        self.confirmed = None;
                        self.below_ticks = 0;
                        self.pending = None;
                        self.promote_ticks = 0;
                    }
                } else {
                    self.below_ticks = 0;
                    match raw_band {
                        Some(rb) if rb != confirmed_key => {
                            if self.pending == Some(rb) {
                                self.promote_ticks += 1;
                            } else {
                                self.pending = Some(rb);
                                self.promote_ticks = 1;
                            }
                            if self.promote_ticks >= PERSISTENCE_TICKS {
                                self.confirmed = Some(rb);
                                self.pending = None;
                                self.promote_ticks = 0;
                            }
                        }
                        _ => {
                            self.pending = None;
                            self.promote_ticks = 0;
                        }
                    }
                }
            }
        }
        self.confirmed
    }
}

/// One ungrouped candidate still eligible for multi-sensor grouping within
/// `multi_sync_window_ms`.
#[derive(Debug, Clone)]
struct Candidate {
    at: Instant,
    sensor_id: ClientId,
    label: String,
    class_key: ClassKey,
    hz: f64,
    peak_amp_g: f64,
    floor_amp_g: f64,
    severity: &'static str,
}

/// Bounded ring: drops the oldest entry once at capacity.
#[derive(Debug, Clone)]
pub struct EventRing {
    cap: usize,
    events: VecDeque<DiagnosticEvent>,
}

impl EventRing {
    fn new(cap: usize) -> Self {
        Self { cap, events: VecDeque::with_capacity(cap) }
    }

    fn push(&mut self, e: DiagnosticEvent) {
        if self.events.len() >= self.cap {
            self.events.pop_front();
        }
        self.events.push_back(e);
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiagnosticEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Owns the event matrix, per-(sensor,source) hysteresis state, bounded
/// event rings, and the multi-sensor grouping buffer.
pub struct LiveDiagnostics {
    hysteresis: HashMap<(ClientId, SourceKey), Hysteresis>,
    matrix: EventMatrix,
    per_sensor_rings: HashMap<ClientId, EventRing>,
    global_ring: EventRing,
    pending_group: Vec<Candidate>,
    levels_by_source: HashMap<SourceKey, f64>,
    levels_by_location: HashMap<LocationCode, f64>,
    sequence: u64,
}

impl LiveDiagnostics {
    pub fn new() -> Self {
        Self {
            hysteresis: HashMap::new(),
            matrix: EventMatrix::default(),
            per_sensor_rings: HashMap::new(),
            global_ring: EventRing::new(500),
            pending_group: Vec::new(),
            levels_by_source: HashMap::new(),
            levels_by_location: HashMap::new(),
            sequence: 0,
        }
    }

    pub fn matrix(&self) -> &EventMatrix {
        &self.matrix
    }

    pub fn global_events(&self) -> &EventRing {
        &self.global_ring
    }

    pub fn sensor_events(&self, id: ClientId) -> Option<&EventRing> {
        self.per_sensor_rings.get(&id)
    }

    pub fn levels_by_source(&self) -> &HashMap<SourceKey, f64> {
        &self.levels_by_source
    }

    pub fn levels_by_location(&self) -> &HashMap<LocationCode, f64> {
        &self.levels_by_location
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Consumes one tick of per-sensor metrics, updates hysteresis/matrix,
    /// performs multi-sensor grouping, and returns the events emitted this
    /// tick (already recorded into the rings/matrix).
    pub fn ingest_tick(
        &mut self,
        now: Instant,
        dt_s: f64,
        metrics: &[SensorMetrics],
        names: &HashMap<ClientId, String>,
        locations: &HashMap<ClientId, LocationCode>,
        cfg: &ProcessingConfig,
    ) -> Vec<DiagnosticEvent> {
        self.sequence += 1;
        self.levels_by_source.clear();
        self.levels_by_location.clear();

        let mut fresh_candidates = Vec::new();
        for m in metrics {
            let source = m.class_key.source_key();
            let key = (m.sensor_id, source);
            let tracker = self.hysteresis.entry(key).or_default();
            let confirmed = tracker.update(m.severity, m.strength.vibration_strength_db, cfg);

            let level = self.levels_by_source.entry(source).or_insert(f64::MIN);
            *level = level.max(m.strength.vibration_strength_db);
            if let Some(loc) = locations.get(&m.sensor_id) {
                let lvl = self.levels_by_location.entry(*loc).or_insert(f64::MIN);
                *lvl = lvl.max(m.strength.vibration_strength_db);
            }

            if let Some(severity) = confirmed {
                let label = names.get(&m.sensor_id).cloned().unwrap_or_else(|| m.sensor_id.to_string());
                fresh_candidates.push(Candidate {
                    at: now,
                    sensor_id: m.sensor_id,
                    label,
                    class_key: m.class_key,
                    hz: m.dominant_hz,
                    peak_amp_g: m.strength.peak_band_rms_amp_g,
                    floor_amp_g: m.strength.floor_amp_g,
                    severity,
                });
            }
        }

        self.pending_group.retain(|c| now.saturating_duration_since(c.at) <= Duration::from_millis(cfg.multi_sync_window_ms));
        self.pending_group.extend(fresh_candidates);

        // Work on an owned snapshot so the clustering pass never borrows
        // `self` — keeps `self.matrix`/`self.push_event` free to mutate
        // inline as clusters resolve.
        let pending: Vec<Candidate> = self.pending_group.clone();
        let mut emitted = Vec::new();
        let mut consumed = vec![false; pending.len()];

        for i in 0..pending.len() {
            if consumed[i] {
                continue;
            }
            let mut cluster = vec![i];
            for j in (i + 1)..pending.len() {
                if consumed[j] {
                    continue;
                }
                let a = &pending[i];
                let b = &pending[j];
                if a.class_key == b.class_key
                    && (a.hz - b.hz).abs() <= cfg.multi_freq_bin_hz
                    && now.saturating_duration_since(b.at) <= Duration::from_millis(cfg.multi_sync_window_ms)
                {
                    cluster.push(j);
                }
            }

            let distinct_sensors: std::collections::HashSet<ClientId> = cluster.iter().map(|&k| pending[k].sensor_id).collect();

            if distinct_sensors.len() >= 2 {
                for &k in &cluster {
                    consumed[k] = true;
                }
                let members: Vec<&Candidate> = cluster.iter().map(|&k| &pending[k]).collect();
                let mean_hz = members.iter().map(|c| c.hz).sum::<f64>() / members.len() as f64;
                let mean_peak = members.iter().map(|c| c.peak_amp_g).sum::<f64>() / members.len() as f64;
                let mean_floor = members.iter().map(|c| c.floor_amp_g).sum::<f64>() / members.len() as f64;
                let class_key = members[0].class_key;
                let n = members.len();
                // +2dB (cfg-configurable) bonus for n>=2 sensors, reflecting
                // higher confidence of synchronous multi-sensor detection.
                let bonus_db = cfg.multi_sensor_bonus_db;
                let eps = cfg.strength_epsilon_min_g.max(mean_floor * cfg.strength_epsilon_floor_ratio);
                let base_db = 20.0 * ((mean_peak + eps) / (mean_floor + eps)).log10();
                let boosted_db = (base_db.max(0.0) + bonus_db).max(0.0);
                let severity = cfg.strength_bands.bucket(boosted_db, mean_peak).map(|b| b.key).unwrap_or(members[0].severity);

                let sensor_ids: Vec<ClientId> = members.iter().map(|c| c.sensor_id).collect();
                let sensor_labels: Vec<String> = members.iter().map(|c| c.label.clone()).collect();
                let event = DiagnosticEvent {
                    timestamp: now,
                    sensor_ids: sensor_ids.clone(),
                    sensor_labels,
                    center_hz: mean_hz,
                    peak_amp_g: mean_peak,
                    floor_amp_g: mean_floor,
                    class_key,
                    severity,
                    confidence_tier: ConfidenceTier::Grouped(n as u8),
                    is_group: true,
                };
                self.matrix.record(class_key.source_key(), severity, dt_s, "group");
                self.push_event(event.clone(), &sensor_ids);
                emitted.push(event);
            }
        }

        // Remaining un-clustered candidates only age out once they've sat
        // past the full grouping window without finding a partner — a
        // candidate born this tick still gets the rest of the window to
        // cluster with a sensor that confirms on a later tick.
        let mut still_pending = Vec::new();
        for (i, c) in pending.iter().enumerate() {
            if consumed[i] {
                continue;
            }
            let age = now.saturating_duration_since(c.at);
            if age >= Duration::from_millis(cfg.multi_sync_window_ms) {
                let event = DiagnosticEvent {
                    timestamp: c.at,
                    sensor_ids: vec![c.sensor_id],
                    sensor_labels: vec![c.label.clone()],
                    center_hz: c.hz,
                    peak_amp_g: c.peak_amp_g,
                    floor_amp_g: c.floor_amp_g,
                    class_key: c.class_key,
                    severity: c.severity,
                    confidence_tier: ConfidenceTier::Single,
                    is_group: false,
                };
                self.matrix.record(c.class_key.source_key(), c.severity, dt_s, &c.label);
                self.push_event(event.clone(), &[c.sensor_id]);
                emitted.push(event);
            } else {
                still_pending.push(c.clone());
            }
        }
        self.pending_group = still_pending;

        emitted
    }

    fn push_event(&mut self, event: DiagnosticEvent, sensor_ids: &[ClientId]) {
        self.global_ring.push(event.clone());
        for &id in sensor_ids {
            self.per_sensor_rings.entry(id).or_insert_with(|| EventRing::new(80)).push(event.clone());
        }
    }
}

impl Default for LiveDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Peak, StrengthMetrics};

    fn metrics_for(id: ClientId, db: f64, hz: f64, class_key: ClassKey, severity: Option<&'static str>) -> SensorMetrics {
        SensorMetrics {
            sensor_id: id,
            freq_axis: vec![],
            combined_spectrum_amp_g: vec![],
            peaks_per_axis: [Vec::<Peak>::new(), Vec::<Peak>::new(), Vec::<Peak>::new()],
            peaks_combined: vec![],
            dominant_hz: hz,
            dominant_axis: None,
            strength: StrengthMetrics { vibration_strength_db: db, peak_band_rms_amp_g: 0.05, floor_amp_g: 0.01 },
            severity,
            class_key,
        }
    }

    fn cid(n: u8) -> ClientId {
        ClientId([0, 0, 0, 0, 0, n])
    }

    #[test]
    fn single_sensor_never_emits_grouped_event() {
        let cfg = ProcessingConfig::default();
        let mut diag = LiveDiagnostics::new();
        let names = HashMap::new();
        let locations = HashMap::new();
        let now = Instant::now();
        for tick in 0..5 {
            let m = metrics_for(cid(1), 20.0, 12.2, ClassKey::Wheel1, Some("l3"));
            let t = now + Duration::from_millis(250 * tick);
            let _ = diag.ingest_tick(t, 0.25, &[m], &names, &locations, &cfg);
        }
        let events: Vec<_> = diag.global_events().iter().collect();
        assert!(events.iter().all(|e| !e.is_group));
    }

    #[test]
    fn hysteresis_requires_persistence_ticks_to_promote() {
        let cfg = ProcessingConfig::default();
        let mut diag = LiveDiagnostics::new();
        let names = HashMap::new();
        let locations = HashMap::new();
        let now = Instant::now();
        // Only two ticks above threshold: should not yet confirm (needs 3).
        for tick in 0..2 {
            let m = metrics_for(cid(1), 20.0, 12.2, ClassKey::Wheel1, Some("l3"));
            let t = now + Duration::from_millis(250 * tick);
            let emitted = diag.ingest_tick(t, 0.25, &[m], &names, &locations, &cfg);
            assert!(emitted.is_empty(), "should not confirm before persistence_ticks");
        }
        let m = metrics_for(cid(1), 20.0, 12.2, ClassKey::Wheel1, Some("l3"));
        let emitted = diag.ingest_tick(now + Duration::from_millis(750), 0.25, &[m], &names, &locations, &cfg);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].severity, "l3");
    }

    #[test]
    fn two_sensors_sync_produce_grouped_event_with_bonus() {
        let cfg = ProcessingConfig::default();
        let mut diag = LiveDiagnostics::new();
        let mut names = HashMap::new();
        names.insert(cid(1), "A".to_string());
        names.insert(cid(2), "B".to_string());
        let locations = HashMap::new();
        let now = Instant::now();

        // Drive both sensors through persistence_ticks at the same band so
        // hysteresis confirms them on the same tick.
        let mut last_emitted = Vec::new();
        for tick in 0..3u64 {
            let m1 = metrics_for(cid(1), 20.0, 12.2, ClassKey::Wheel1, Some("l3"));
            let m2 = metrics_for(cid(2), 20.0, 12.3, ClassKey::Wheel1, Some("l3"));
            let t = now + Duration::from_millis(250 * tick);
            last_emitted = diag.ingest_tick(t, 0.25, &[m1, m2], &names, &locations, &cfg);
        }
        assert_eq!(last_emitted.len(), 1);
        assert!(last_emitted[0].is_group);
        assert_eq!(last_emitted[0].confidence_tier, ConfidenceTier::Grouped(2));
        assert_eq!(last_emitted[0].sensor_labels.len(), 2);
    }

    #[test]
    fn sensors_confirming_on_different_ticks_still_group_within_sync_window() {
        let cfg = ProcessingConfig::default();
        let mut diag = LiveDiagnostics::new();
        let mut names = HashMap::new();
        names.insert(cid(1), "A".to_string());
        names.insert(cid(2), "B".to_string());
        let locations = HashMap::new();
        let now = Instant::now();

        // Both sensors already have confirmed hysteresis state (persistence
        // already established on a prior run) so each ingest_tick call
        // confirms immediately instead of needing its own 3-tick ramp.
        diag.hysteresis.insert((cid(1), SourceKey::Wheel), Hysteresis { confirmed: Some("l3"), ..Hysteresis::default() });
        diag.hysteresis.insert((cid(2), SourceKey::Wheel), Hysteresis { confirmed: Some("l3"), ..Hysteresis::default() });

        // Sensor A is seen alone on this tick; it must not be finalized as
        // a single-sensor event while still inside the grouping window.
        let m_a = metrics_for(cid(1), 20.0, 12.2, ClassKey::Wheel1, Some("l3"));
        let emitted_a = diag.ingest_tick(now, 0.25, &[m_a], &names, &locations, &cfg);
        assert!(emitted_a.is_empty(), "lone candidate must wait out the sync window, not finalize on its own tick");

        // One tick later, well inside multi_sync_window_ms (650ms), sensor B
        // is seen alone and should cluster with A's still-pending candidate.
        let t_b = now + Duration::from_millis(250);
        let m_b = metrics_for(cid(2), 20.0, 12.3, ClassKey::Wheel1, Some("l3"));
        let emitted_b = diag.ingest_tick(t_b, 0.25, &[m_b], &names, &locations, &cfg);

        assert_eq!(emitted_b.len(), 1, "A and B should cluster into one grouped event across ticks");
        assert!(emitted_b[0].is_group);
        assert_eq!(emitted_b[0].confidence_tier, ConfidenceTier::Grouped(2));
        assert_eq!(emitted_b[0].sensor_labels.len(), 2);
    }

    #[test]
    fn demote_requires_decay_ticks_below_threshold_minus_hysteresis() {
        let cfg = ProcessingConfig::default();
        let mut diag = LiveDiagnostics::new();
        let names = HashMap::new();
        let locations = HashMap::new();
        let now = Instant::now();
        // Confirm l3 (min_db=12.0) with persistence ticks.
        for tick in 0..3u64 {
            let m = metrics_for(cid(1), 20.0, 12.2, ClassKey::Wheel1, Some("l3"));
            let t = now + Duration::from_millis(250 * tick);
            let _ = diag.ingest_tick(t, 0.25, &[m], &names, &locations, &cfg);
        }
        let key = (cid(1), SourceKey::Wheel);
        assert_eq!(diag.hysteresis.get(&key).unwrap().confirmed, Some("l3"));

        // Drop below l3.min_db - HYSTERESIS_DB (=10.0) for fewer than DECAY_TICKS: still confirmed.
        for tick in 3..6u64 {
            let m = metrics_for(cid(1), 5.0, 12.2, ClassKey::Wheel1, Some("l1"));
            let t = now + Duration::from_millis(250 * tick);
            let _ = diag.ingest_tick(t, 0.25, &[m], &names, &locations, &cfg);
        }
        assert_eq!(diag.hysteresis.get(&key).unwrap().confirmed, Some("l3"));

        // Two more ticks reach DECAY_TICKS=5 total: now demoted.
        for tick in 6..8u64 {
            let m = metrics_for(cid(1), 5.0, 12.2, ClassKey::Wheel1, Some("l1"));
            let t = now + Duration::from_millis(250 * tick);
            let _ = diag.ingest_tick(t, 0.25, &[m], &names, &locations, &cfg);
        }
        assert_eq!(diag.hysteresis.get(&key).unwrap().confirmed, None);
    }
}
