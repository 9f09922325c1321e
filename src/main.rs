//! Vibration telemetry core entry point.
//!
//! Wires together the UDP ingest pipeline, the control plane, the
//! fixed-rate processor/diagnostics scheduler, and the run controller.
//! One event-loop thread drives the scheduler tick; ingest runs on its own
//! receive/consume thread pair; FFT compute runs on a bounded worker pool;
//! post-run analysis runs on its own background thread. See
//! `CONCURRENCY & RESOURCE MODEL` in the design notes for the full picture.
//!
//! The HTTP/WebSocket façade and YAML config loader are external
//! collaborators (out of scope for this binary); this entry point logs a
//! health summary on the same cadence a façade would poll `/api/health`.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use vibe_core::alignment::{self, SensorWindow};
use vibe_core::codec::ClientId;
use vibe_core::config::ProcessingConfig;
use vibe_core::control::ControlPlane;
use vibe_core::diagnostics::LiveDiagnostics;
use vibe_core::facade_types::{self, ClientRow, HealthSnapshot, HealthStatus, IntakeStats};
use vibe_core::ingest;
use vibe_core::processor::{SignalProcessor, SpeedInput};
use vibe_core::registry::Registry;
use vibe_core::ring_buffer::RingStore;
use vibe_core::run_controller::RunController;
use vibe_core::run_store::RunStore;

const DATA_PORT: u16 = 9000;
const CONTROL_PORT: u16 = 9001;
const DEFAULT_DB_PATH: &str = "vibe_core.sqlite3";

fn main() {
    env_logger::init();

    let config = ProcessingConfig::shared();
    let db_path = std::env::var("VIBE_CORE_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    let run_store = match RunStore::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("fatal: run store at {db_path} failed to open: {e}");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(Registry::new());
    let rings = Arc::new(RingStore::new(config.sample_rate_hz, config.waveform_seconds));
    let processor = SignalProcessor::new(config.clone(), rings.clone());
    let mut diagnostics = LiveDiagnostics::new();
    let run_controller = Arc::new(RunController::new(run_store.clone(), config.clone(), config.silence_timeout_s));

    let data_socket = match UdpSocket::bind(("0.0.0.0", DATA_PORT)) {
        Ok(s) => s,
        Err(e) => {
            error!("fatal: failed to bind data socket on port {DATA_PORT}: {e}");
            std::process::exit(1);
        }
    };
    let control_plane = match ControlPlane::bind(&format!("0.0.0.0:{CONTROL_PORT}")) {
        Ok(cp) => Arc::new(cp),
        Err(e) => {
            error!("fatal: failed to bind control socket on port {CONTROL_PORT}: {e}");
            std::process::exit(1);
        }
    };
    let ack_socket: Arc<UdpSocket> = match control_plane.try_clone_socket() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("fatal: failed to clone control socket: {e}");
            std::process::exit(1);
        }
    };
    let ack_recv_socket = match control_plane.try_clone_socket() {
        Ok(s) => s,
        Err(e) => {
            error!("fatal: failed to clone control socket for ACK receive: {e}");
            std::process::exit(1);
        }
    };

    let mut ingest_handles = ingest::spawn(data_socket, ack_socket, registry.clone(), rings.clone(), config.data_queue_maxsize);

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let ack_receiver = vibe_core::control::spawn_ack_receive_loop(ack_recv_socket, control_plane.clone(), running.clone());

    let sync_broadcaster = {
        let registry = registry.clone();
        let control_plane = control_plane.clone();
        let running = running.clone();
        let control_addresses = ingest_handles.control_addresses.clone();
        vibe_core::control::spawn_sync_clock_broadcaster(
            control_plane,
            registry,
            Duration::from_secs_f64(config.sync_clock_interval_s),
            running,
            move |id| control_addresses.get(&id).map(|addr| (addr.ip(), addr.port())),
        )
    };

    info!("vibe_core listening: data=0.0.0.0:{DATA_PORT} control=0.0.0.0:{CONTROL_PORT} db={db_path}");

    let tick_period = Duration::from_secs_f64(1.0 / config.fft_update_hz.max(0.1));
    let clock_origin = Instant::now();
    let mut last_tick = Instant::now();
    let mut processing_failures: u64 = 0u64;
    let mut total_compute_calls: u64 = 0;
    let mut last_compute_duration_s = 0.0f64;

    while running.load(Ordering::Relaxed) {
        let tick_start = Instant::now();
        let dt_s = tick_start.saturating_duration_since(last_tick).as_secs_f64();
        last_tick = tick_start;

        let active_sensors = registry.active_ids();
        let computed = processor.compute_all(&active_sensors, SpeedInput { speed_mps: 0.0 });
        total_compute_calls += 1;
        last_compute_duration_s = tick_start.elapsed().as_secs_f64();
        if computed < active_sensors.len() {
            processing_failures += (active_sensors.len() - computed) as u64;
        }

        let metrics = processor.results.snapshot_all();
        let (names, locations) = sensor_labels(&registry, &active_sensors);
        let events = diagnostics.ingest_tick(tick_start, dt_s, &metrics, &names, &locations, processor.config());
        for event in &events {
            let view = facade_types::DiagnosticEventView::from(event);
            info!("diagnostic event: {} {} @ {:.1}Hz ({})", view.class_key, view.severity, view.center_hz, view.confidence);
        }

        let windows: Vec<SensorWindow> = active_sensors
            .iter()
            .filter_map(|&id| rings.snapshot(id, processor.config().fft_n).map(|snap| {
                let count = rings.sample_count(id);
                alignment::sensor_window(clock_origin, tick_start, id, &snap, count)
            }))
            .collect();
        let alignment_info = alignment::align(&windows);
        let alignment_view = facade_types::AlignmentView::from(&alignment_info);
        debug!(
            "alignment: overlap_ratio={:.2} aligned={} sensors={} clock_synced={}",
            alignment_view.overlap_ratio, alignment_view.aligned, alignment_view.sensor_count, alignment_view.clock_synced
        );

        let mut frame_totals: HashMap<ClientId, u64> = HashMap::new();
        for row in registry.snapshot() {
            frame_totals.insert(row.id, row.frames_total);
        }
        run_controller.observe_tick(&frame_totals, tick_start, true);

        if total_compute_calls % (config.fft_update_hz.max(1.0) as u64 * 10).max(1) == 0 {
            let snapshot = health_snapshot(processing_failures, &ingest_handles, total_compute_calls, last_compute_duration_s);
            info!("health: {snapshot:?}");
            let clients: Vec<ClientRow> = registry.snapshot().iter().map(ClientRow::from).collect();
            info!("clients: {} connected", clients.iter().filter(|c| c.connected).count());
        }

        let elapsed = tick_start.elapsed();
        if elapsed < tick_period {
            std::thread::sleep(tick_period - elapsed);
        } else {
            warn!("processor tick overran its {tick_period:?} budget by {:?}", elapsed - tick_period);
        }
    }

    info!("shutting down");
    ingest_handles.shutdown();
    let _ = sync_broadcaster.join();
    let _ = ack_receiver.join();
    processor.shutdown();
}

fn sensor_labels(registry: &Registry, active: &[ClientId]) -> (HashMap<ClientId, String>, HashMap<ClientId, vibe_core::registry::LocationCode>) {
    let mut names = HashMap::new();
    let mut locations = HashMap::new();
    for &id in active {
        if let Some(rec) = registry.get(id) {
            names.insert(id, rec.identity.name.clone());
            if let Some(loc) = rec.identity.location {
                locations.insert(id, loc);
            }
        }
    }
    (names, locations)
}

fn health_snapshot(processing_failures: u64, ingest_handles: &ingest::IngestHandles, total_compute_calls: u64, last_compute_duration_s: f64) -> HealthSnapshot {
    let status = if ingest_handles.counters.queue_drops.load(Ordering::Relaxed) > 0 || processing_failures > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    };
    HealthSnapshot {
        status,
        processing_failures,
        intake_stats: IntakeStats {
            total_ingested_samples: ingest_handles.counters.samples_ingested.load(Ordering::Relaxed),
            total_compute_calls,
            last_compute_duration_s,
        },
    }
}

/// A full OS signal handler (SIGINT/SIGTERM) is out of scope for this core;
/// `running` stays `true` until something else clears it (e.g. a future
/// façade-driven shutdown command).
fn ctrlc_handler(_running: Arc<AtomicBool>) {}
