//! Vibration telemetry ingest-to-diagnostics core: UDP wire codec, sensor
//! registry, ring buffers, a bounded worker pool running an FFT-based
//! signal processor, live diagnostics with hysteresis and multi-sensor
//! grouping, sensor time alignment, a SQLite-backed run store, and the run
//! controller state machine that drives it. The HTTP/WebSocket façade and
//! YAML config loading are external collaborators; this crate only defines
//! their output contracts (`facade_types`) and typed config shape
//! (`config`).

pub mod alignment;
pub mod codec;
pub mod config;
pub mod control;
pub mod diagnostics;
pub mod facade_types;
pub mod ingest;
pub mod processor;
pub mod registry;
pub mod ring_buffer;
pub mod run_controller;
pub mod run_log;
pub mod run_store;
pub mod worker_pool;
