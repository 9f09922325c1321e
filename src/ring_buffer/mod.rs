//! Per-sensor circular sample store with timing metadata.
//!
//! Exclusively owned by the processor; ingest and compute coordinate via a
//! per-ring `parking_lot::Mutex` held only for the snapshot (phase 1) and
//! store (phase 3) — never across the unlocked FFT compute in between
//! (spec.md §4.5, §5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::codec::ClientId;

/// One axis's circular float buffer: fixed capacity, saturating count,
/// mod-capacity write index, circular overwrite once full.
#[derive(Debug, Clone)]
struct AxisRing {
    data: Vec<f32>,
    write_idx: usize,
    len: usize,
}

impl AxisRing {
    fn new(capacity: usize) -> Self {
        Self { data: vec![0.0; capacity], write_idx: 0, len: 0 }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn push(&mut self, v: f32) {
        let cap = self.capacity();
        self.data[self.write_idx] = v;
        self.write_idx = (self.write_idx + 1) % cap;
        self.len = (self.len + 1).min(cap);
    }

    /// Copies out the last `n` samples (or all available, if fewer),
    /// oldest first.
    fn latest(&self, n: usize) -> Vec<f32> {
        let take = n.min(self.len);
        let cap = self.capacity();
        let mut out = Vec::with_capacity(take);
        // write_idx points one past the most recently written sample.
        let start = (self.write_idx + cap - take) % cap;
        for i in 0..take {
            out.push(self.data[(start + i) % cap]);
        }
        out
    }

    fn reset(&mut self) {
        self.write_idx = 0;
        self.len = 0;
    }
}

/// Per-sensor ring: one `AxisRing` per axis plus timing metadata.
pub struct RingBuffer {
    x: AxisRing,
    y: AxisRing,
    z: AxisRing,
    sample_rate_hz: u32,
    first_ingest_mono: Option<Instant>,
    last_t0_us: u64,
    samples_since_t0: u64,
}

/// Owned, lock-free copy of a sensor's sample window plus timing triple,
/// produced by [`RingStore::snapshot`] and analyzed without holding the
/// ring's lock (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct SnapshotBundle {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,
    pub sample_rate_hz: u32,
    pub first_ingest_mono: Option<Instant>,
    pub last_t0_us: u64,
    pub samples_since_t0: u64,
}

impl RingBuffer {
    fn new(sample_rate_hz: u32, waveform_seconds: f64) -> Self {
        let capacity = ((sample_rate_hz as f64) * waveform_seconds).round().max(1.0) as usize;
        Self {
            x: AxisRing::new(capacity),
            y: AxisRing::new(capacity),
            z: AxisRing::new(capacity),
            sample_rate_hz,
            first_ingest_mono: None,
            last_t0_us: 0,
            samples_since_t0: 0,
        }
    }

    fn ingest(&mut self, xyz: &[(f32, f32, f32)], t0_us_server_time: u64) {
        if self.first_ingest_mono.is_none() {
            self.first_ingest_mono = Some(Instant::now());
        }
        for &(x, y, z) in xyz {
            self.x.push(x);
            self.y.push(y);
            self.z.push(z);
        }
        // last_t0_us and samples_since_t0 are updated atomically with the
        // append since both live behind the same lock as the axis data.
        self.last_t0_us = t0_us_server_time;
        self.samples_since_t0 = xyz.len() as u64;
    }

    fn snapshot(&self, fft_n: usize) -> SnapshotBundle {
        SnapshotBundle {
            x: self.x.latest(fft_n),
            y: self.y.latest(fft_n),
            z: self.z.latest(fft_n),
            sample_rate_hz: self.sample_rate_hz,
            first_ingest_mono: self.first_ingest_mono,
            last_t0_us: self.last_t0_us,
            samples_since_t0: self.samples_since_t0,
        }
    }

    fn reset(&mut self) {
        self.x.reset();
        self.y.reset();
        self.z.reset();
        self.first_ingest_mono = None;
        self.last_t0_us = 0;
        self.samples_since_t0 = 0;
    }

    pub fn sample_count(&self) -> usize {
        self.x.len
    }
}

/// Owns every sensor's ring, keyed by id. No back-pointer to the registry —
/// both sides look each other up by id (DESIGN.md, "Cyclic references").
pub struct RingStore {
    rings: Mutex<HashMap<ClientId, Arc<Mutex<RingBuffer>>>>,
    sample_rate_hz: u32,
    waveform_seconds: f64,
}

impl RingStore {
    pub fn new(sample_rate_hz: u32, waveform_seconds: f64) -> Self {
        Self { rings: Mutex::new(HashMap::new()), sample_rate_hz, waveform_seconds }
    }

    fn ring_for(&self, id: ClientId) -> Arc<Mutex<RingBuffer>> {
        let mut map = self.rings.lock();
        map.entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(RingBuffer::new(self.sample_rate_hz, self.waveform_seconds))))
            .clone()
    }

    /// `ingest(sensor_id, xyz_samples, t0_us_server_time)`. Brief lock held
    /// only for the append.
    pub fn ingest(&self, id: ClientId, xyz_samples: &[(f32, f32, f32)], t0_us_server_time: u64) {
        let ring = self.ring_for(id);
        let mut guard = ring.lock();
        guard.ingest(xyz_samples, t0_us_server_time);
    }

    /// `snapshot(sensor_id) -> SnapshotBundle`. The bundle is owned by the
    /// caller and analyzed unlocked.
    pub fn snapshot(&self, id: ClientId, fft_n: usize) -> Option<SnapshotBundle> {
        let ring = {
            let map = self.rings.lock();
            map.get(&id).cloned()
        }?;
        let guard = ring.lock();
        Some(guard.snapshot(fft_n))
    }

    pub fn sample_count(&self, id: ClientId) -> usize {
        let map = self.rings.lock();
        map.get(&id).map(|r| r.lock().sample_count()).unwrap_or(0)
    }

    /// Deliberate flush, or on sensor removal: zeroes all timing metadata.
    pub fn reset(&self, id: ClientId) {
        let map = self.rings.lock();
        if let Some(ring) = map.get(&id) {
            ring.lock().reset();
        }
    }

    pub fn remove(&self, id: ClientId) {
        let mut map = self.rings.lock();
        map.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid() -> ClientId {
        ClientId([0, 0, 0, 0, 0, 1])
    }

    #[test]
    fn sample_count_never_exceeds_capacity() {
        let store = RingStore::new(10, 1.0); // capacity 10
        let samples: Vec<(f32, f32, f32)> = (0..25).map(|i| (i as f32, 0.0, 0.0)).collect();
        store.ingest(cid(), &samples, 1000);
        assert_eq!(store.sample_count(cid()), 10);
    }

    #[test]
    fn ring_contains_last_min_s_c_samples_in_order() {
        let store = RingStore::new(5, 1.0); // capacity 5
        let samples: Vec<(f32, f32, f32)> = (0..8).map(|i| (i as f32, 0.0, 0.0)).collect();
        store.ingest(cid(), &samples, 500);
        let snap = store.snapshot(cid(), 5).unwrap();
        assert_eq!(snap.x, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn timing_triple_updates_atomically_with_append() {
        let store = RingStore::new(10, 1.0);
        store.ingest(cid(), &[(1.0, 0.0, 0.0), (2.0, 0.0, 0.0)], 42);
        let snap = store.snapshot(cid(), 10).unwrap();
        assert_eq!(snap.last_t0_us, 42);
        assert_eq!(snap.samples_since_t0, 2);
    }

    #[test]
    fn reset_zeroes_timing_metadata() {
        let store = RingStore::new(10, 1.0);
        store.ingest(cid(), &[(1.0, 0.0, 0.0)], 42);
        store.reset(cid());
        let snap = store.snapshot(cid(), 10).unwrap();
        assert_eq!(snap.last_t0_us, 0);
        assert_eq!(snap.samples_since_t0, 0);
        assert!(snap.x.is_empty());
    }

    #[test]
    fn snapshot_of_unknown_sensor_is_none() {
        let store = RingStore::new(10, 1.0);
        assert!(store.snapshot(cid(), 10).is_none());
    }
}
