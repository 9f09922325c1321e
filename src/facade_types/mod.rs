//! Output-contract types for the HTTP/WebSocket façade (spec.md §6, SPEC_FULL
//! §+B). The façade itself is an external collaborator; this module builds
//! the `serde::Serialize` shapes it would emit every tick, so the contract
//! lives next to the data it is built from instead of being reinvented at
//! the façade boundary.

use std::collections::HashMap;

use serde::Serialize;

use crate::alignment::AlignmentInfo;
use crate::config::StrengthBand;
use crate::diagnostics::{ConfidenceTier, DiagnosticEvent, EventMatrix};
use crate::processor::{ClassKey, Peak, SensorMetrics, SourceKey};
use crate::registry::{LocationCode, RegistryRow};

/// `/api/health.status`: one of `{ok, degraded, error}` (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeStats {
    pub total_ingested_samples: u64,
    pub total_compute_calls: u64,
    pub last_compute_duration_s: f64,
}

/// `GET /api/health` shape.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub processing_failures: u64,
    pub intake_stats: IntakeStats,
}

/// `GET /api/clients` row shape.
#[derive(Debug, Clone, Serialize)]
pub struct ClientRow {
    pub id: String,
    pub name: String,
    pub mac_address: String,
    pub location_code: Option<String>,
    pub connected: bool,
    pub last_seen_age_ms: u64,
    pub dropped_frames: u64,
    pub frames_total: u64,
}

impl From<&RegistryRow> for ClientRow {
    fn from(row: &RegistryRow) -> Self {
        Self {
            id: row.id.to_string(),
            name: row.name.clone(),
            mac_address: row.id.to_string(),
            location_code: row.location.map(location_code_str),
            connected: row.connected,
            last_seen_age_ms: row.last_seen_age_ms,
            dropped_frames: row.dropped_frames,
            frames_total: row.frames_total,
        }
    }
}

fn location_code_str(loc: LocationCode) -> String {
    match loc {
        LocationCode::FrontLeft => "front_left",
        LocationCode::FrontRight => "front_right",
        LocationCode::RearLeft => "rear_left",
        LocationCode::RearRight => "rear_right",
        LocationCode::Trunk => "trunk",
        LocationCode::Engine => "engine",
        LocationCode::Cabin => "cabin",
        LocationCode::Unknown => "unknown",
    }
    .to_string()
}

fn class_key_str(k: ClassKey) -> &'static str {
    match k {
        ClassKey::Wheel1 => "wheel1",
        ClassKey::Wheel2 => "wheel2",
        ClassKey::Shaft1 => "shaft1",
        ClassKey::Eng1 => "eng1",
        ClassKey::Eng2 => "eng2",
        ClassKey::ShaftEng1 => "shaft_eng1",
        ClassKey::Road => "road",
        ClassKey::Other => "other",
    }
}

fn source_key_str(k: SourceKey) -> &'static str {
    match k {
        SourceKey::Engine => "engine",
        SourceKey::Driveshaft => "driveshaft",
        SourceKey::Wheel => "wheel",
        SourceKey::Other => "other",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TopPeakView {
    pub hz: f64,
    pub amp: f32,
}

impl From<&Peak> for TopPeakView {
    fn from(p: &Peak) -> Self {
        Self { hz: p.hz, amp: p.amp_g }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrengthMetricsView {
    pub vibration_strength_db: f64,
    pub strength_bucket: Option<String>,
    pub top_peaks: Vec<TopPeakView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSpectrumView {
    pub freq: Vec<f64>,
    pub combined_spectrum_amp_g: Vec<f32>,
    pub strength_metrics: StrengthMetricsView,
}

impl From<&SensorMetrics> for ClientSpectrumView {
    fn from(m: &SensorMetrics) -> Self {
        Self {
            freq: m.freq_axis.clone(),
            combined_spectrum_amp_g: m.combined_spectrum_amp_g.clone(),
            strength_metrics: StrengthMetricsView {
                vibration_strength_db: m.strength.vibration_strength_db,
                strength_bucket: m.severity.map(str::to_string),
                top_peaks: m.peaks_combined.iter().map(TopPeakView::from).collect(),
            },
        }
    }
}

/// `spectra` tick payload: keyed by client id, present only on "heavy" ticks.
#[derive(Debug, Clone, Serialize)]
pub struct WsSpectraPayload {
    pub clients: HashMap<String, ClientSpectrumView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrengthBandView {
    pub key: String,
    pub min_db: f64,
    pub min_amp_g: f64,
}

impl From<&StrengthBand> for StrengthBandView {
    fn from(b: &StrengthBand) -> Self {
        Self { key: b.key.to_string(), min_db: b.min_db, min_amp_g: b.min_amp_g }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatrixEntryView {
    pub source: String,
    pub severity: String,
    pub count: u64,
    pub seconds_accumulated: f64,
    pub contributors: HashMap<String, u64>,
}

/// Flattens [`EventMatrix`]'s `(source, severity) -> cell` map into the
/// tick payload's `matrix` array.
pub fn matrix_view(matrix: &EventMatrix) -> Vec<MatrixEntryView> {
    matrix
        .iter()
        .map(|((source, severity), cell)| MatrixEntryView {
            source: source_key_str(*source).to_string(),
            severity: severity.to_string(),
            count: cell.count,
            seconds_accumulated: cell.seconds_accumulated,
            contributors: cell.contributors.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEventView {
    pub sensor_ids: Vec<String>,
    pub sensor_labels: Vec<String>,
    pub center_hz: f64,
    pub peak_amp_g: f64,
    pub floor_amp_g: f64,
    pub class_key: String,
    pub severity: String,
    pub confidence: String,
    pub is_group: bool,
}

impl From<&DiagnosticEvent> for DiagnosticEventView {
    fn from(e: &DiagnosticEvent) -> Self {
        Self {
            sensor_ids: e.sensor_ids.iter().map(|id| id.to_string()).collect(),
            sensor_labels: e.sensor_labels.clone(),
            center_hz: e.center_hz,
            peak_amp_g: e.peak_amp_g,
            floor_amp_g: e.floor_amp_g,
            class_key: class_key_str(e.class_key).to_string(),
            severity: e.severity.to_string(),
            confidence: match e.confidence_tier {
                ConfidenceTier::Single => "single".to_string(),
                ConfidenceTier::Grouped(n) => format!("grouped({n})"),
            },
            is_group: e.is_group,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelsView {
    pub by_source: HashMap<String, f64>,
    pub by_location: HashMap<String, f64>,
}

/// `diagnostics.alignment?` shape.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentView {
    pub overlap_ratio: f64,
    pub aligned: bool,
    pub shared_window_s: Option<(f64, f64)>,
    pub sensor_count: usize,
    pub clock_synced: bool,
}

impl From<&AlignmentInfo> for AlignmentView {
    fn from(a: &AlignmentInfo) -> Self {
        Self { overlap_ratio: a.overlap_ratio, aligned: a.aligned, shared_window_s: a.shared_window, sensor_count: a.sensor_count, clock_synced: a.clock_synced }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WsDiagnosticsPayload {
    pub strength_bands: Vec<StrengthBandView>,
    pub matrix: Vec<MatrixEntryView>,
    pub events: Vec<DiagnosticEventView>,
    pub levels: LevelsView,
    pub diagnostics_sequence: u64,
    pub alignment: Option<AlignmentView>,
}

/// Full `/ws` tick payload (spec.md §6). `spectra` is `None` on "light"
/// ticks per the `push_hz` ratio the façade enforces.
#[derive(Debug, Clone, Serialize)]
pub struct WsTickPayload {
    pub server_time: f64,
    pub speed_mps: f64,
    pub clients: Vec<ClientRow>,
    pub selected_client_id: Option<String>,
    pub spectra: Option<WsSpectraPayload>,
    pub diagnostics: WsDiagnosticsPayload,
}
