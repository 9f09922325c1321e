//! Registry: tracks connected sensors, identities, drift/jitter, liveness.
//!
//! A single read-write guarded map (spec.md §5). Reads dominate (snapshot
//! for the façade, lookups on every DATA frame) and never contend with
//! signal-processor compute, which owns its own per-ring locks instead.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::codec::ClientId;

/// Closed taxonomy of car-body positions (SPEC_FULL §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationCode {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
    Trunk,
    Engine,
    Cabin,
    Unknown,
}

/// Sensor liveness is `now - last_seen < T_DEAD`.
pub const T_DEAD: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("location already in use by another active sensor")]
    LocationTaken,
    #[error("unknown sensor id")]
    UnknownSensor,
}

/// One sensor's identity, as created by HELLO and updatable later.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: ClientId,
    pub name: String,
    pub location: Option<LocationCode>,
    pub firmware_version: String,
    pub declared_sample_rate_hz: u16,
    pub control_port: u16,
}

/// Per-sensor registry record: identity plus rolling counters and liveness.
#[derive(Debug, Clone)]
pub struct RegistryRecord {
    pub identity: Identity,
    pub last_seen: Instant,
    pub frames_total: u64,
    pub dropped_frames: u64,
    pub server_queue_drops: u32,
    pub queue_overflow_drops: u32,
    pub clock_offset_us: Option<i64>,
    pub identified: bool,
    last_seq: Option<u32>,
    jitter_ewma_us: f64,
    last_arrival: Option<Instant>,
}

impl RegistryRecord {
    fn new(identity: Identity, now: Instant) -> Self {
        Self {
            identity,
            last_seen: now,
            frames_total: 0,
            dropped_frames: 0,
            server_queue_drops: 0,
            queue_overflow_drops: 0,
            clock_offset_us: None,
            identified: false,
            last_seq: None,
            jitter_ewma_us: 0.0,
            last_arrival: None,
        }
    }

    /// `now - last_seen < T_DEAD`.
    pub fn is_alive(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) < T_DEAD
    }

    pub fn last_seen_age_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.last_seen).as_millis() as u64
    }

    pub fn jitter_ewma_us(&self) -> f64 {
        self.jitter_ewma_us
    }
}

/// Flattened view returned by [`Registry::snapshot`] — what the façade
/// would expose at `/api/clients`.
#[derive(Debug, Clone)]
pub struct RegistryRow {
    pub id: ClientId,
    pub name: String,
    pub location: Option<LocationCode>,
    pub connected: bool,
    pub last_seen_age_ms: u64,
    pub dropped_frames: u64,
    pub frames_total: u64,
}

const JITTER_EWMA_ALPHA: f64 = 0.2;

/// Exposes `on_hello`, `on_data`, `rename`, `set_location`, `remove`,
/// `snapshot`, `mark_identified` per spec.md §4.2.
pub struct Registry {
    records: RwLock<HashMap<ClientId, RegistryRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { records: RwLock::new(HashMap::new()) }
    }

    /// Creates the identity on first HELLO, updates it on later HELLOs.
    pub fn on_hello(
        &self,
        id: ClientId,
        name: String,
        firmware_version: String,
        declared_sample_rate_hz: u16,
        control_port: u16,
        queue_overflow_drops: u32,
        arrived_at: Instant,
    ) {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(&id) {
            Some(rec) => {
                rec.identity.name = name;
                rec.identity.firmware_version = firmware_version;
                rec.identity.declared_sample_rate_hz = declared_sample_rate_hz;
                rec.identity.control_port = control_port;
                rec.queue_overflow_drops = queue_overflow_drops;
                rec.last_seen = arrived_at;
            }
            None => {
                let identity = Identity {
                    id,
                    name,
                    location: None,
                    firmware_version,
                    declared_sample_rate_hz,
                    control_port,
                };
                let mut rec = RegistryRecord::new(identity, arrived_at);
                rec.queue_overflow_drops = queue_overflow_drops;
                map.insert(id, rec);
            }
        }
    }

    /// Updates liveness/counters on a DATA frame. Auto-creates a minimal
    /// entry if the sensor is unknown (spec.md §4.3 ingest failure
    /// semantics); returns whether the entry was newly created so the
    /// caller can log the "unknown sensor auto-created" warning once.
    pub fn on_data(&self, id: ClientId, seq: u32, arrived_at: Instant) -> bool {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        let created = !map.contains_key(&id);
        let rec = map.entry(id).or_insert_with(|| {
            RegistryRecord::new(
                Identity { id, name: format!("unknown-{id}"), location: None, firmware_version: String::new(), declared_sample_rate_hz: 0, control_port: 0 },
                arrived_at,
            )
        });

        rec.frames_total += 1;
        if let Some(prev_seq) = rec.last_seq {
            let gap = seq.wrapping_sub(prev_seq).wrapping_sub(1);
            if seq > prev_seq {
                rec.dropped_frames += gap as u64;
            }
        }
        rec.last_seq = Some(seq);

        if let Some(prev) = rec.last_arrival {
            let dt_us = arrived_at.saturating_duration_since(prev).as_micros() as f64;
            rec.jitter_ewma_us = JITTER_EWMA_ALPHA * dt_us + (1.0 - JITTER_EWMA_ALPHA) * rec.jitter_ewma_us;
        }
        rec.last_arrival = Some(arrived_at);
        rec.last_seen = arrived_at;
        created
    }

    /// Idempotent rename.
    pub fn rename(&self, id: ClientId, name: String) -> Result<(), RegistryError> {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        let rec = map.get_mut(&id).ok_or(RegistryError::UnknownSensor)?;
        rec.identity.name = name;
        Ok(())
    }

    /// Fails with `LocationTaken` if another active sensor already holds
    /// `code`. Calling twice with the same args is a no-op that still
    /// succeeds (idempotent per spec.md §8).
    pub fn set_location(&self, id: ClientId, code: LocationCode) -> Result<(), RegistryError> {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        if !map.contains_key(&id) {
            return Err(RegistryError::UnknownSensor);
        }
        let taken_by_other = map.iter().any(|(other_id, rec)| *other_id != id && rec.identity.location == Some(code));
        if taken_by_other {
            return Err(RegistryError::LocationTaken);
        }
        map.get_mut(&id).unwrap().identity.location = Some(code);
        Ok(())
    }

    pub fn remove(&self, id: ClientId) -> Option<RegistryRecord> {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&id)
    }

    pub fn mark_identified(&self, id: ClientId) {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(rec) = map.get_mut(&id) {
            rec.identified = true;
        }
    }

    pub fn set_clock_offset(&self, id: ClientId, offset_us: i64) {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(rec) = map.get_mut(&id) {
            rec.clock_offset_us = Some(offset_us);
        }
    }

    pub fn snapshot(&self) -> Vec<RegistryRow> {
        let now = Instant::now();
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        map.values()
            .map(|rec| RegistryRow {
                id: rec.identity.id,
                name: rec.identity.name.clone(),
                location: rec.identity.location,
                connected: rec.is_alive(now),
                last_seen_age_ms: rec.last_seen_age_ms(now),
                dropped_frames: rec.dropped_frames,
                frames_total: rec.frames_total,
            })
            .collect()
    }

    /// All currently-alive sensor ids, used by the processor to decide
    /// which rings to snapshot each tick.
    pub fn active_ids(&self) -> Vec<ClientId> {
        let now = Instant::now();
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|r| r.is_alive(now)).map(|r| r.identity.id).collect()
    }

    pub fn get(&self, id: ClientId) -> Option<RegistryRecord> {
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        map.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
