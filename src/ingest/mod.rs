//! UDP ingest (spec.md §4.3): non-blocking datagram receive, a bounded
//! queue of parsed frames with drop-newest backpressure, and a consumer
//! thread that updates the registry, ring buffers, and acknowledges DATA
//! frames. Receiver and consumer are each a dedicated `std::thread` joined
//! by a `crossbeam::channel::bounded` queue, the same producer/consumer
//! shape as the teacher's sensor-to-processor channel (`main.rs`).

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::DashMap;
use log::{debug, warn};
use thiserror::Error;

use crate::codec::{self, ClientId, CodecError, Frame};
use crate::registry::Registry;
use crate::ring_buffer::RingStore;

/// Accelerometer LSB-to-g scale for raw `i16` samples off the wire. A fixed
/// process-wide constant (real hardware would report this in HELLO; out of
/// scope here since sensor calibration data isn't part of the wire format).
pub const ACCEL_SCALE_G_PER_LSB: f32 = 1.0 / 16_384.0;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);
const RECV_BUF_SIZE: usize = 2048;
const POLL_BACKOFF: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("parse error: {0}")]
    Parse(#[from] CodecError),
    #[error("queue full, frame dropped")]
    QueueFull,
}

/// Counters surfaced through `/api/health` (spec.md §7: recoverable errors
/// never abort the event loop, only bump a counter).
#[derive(Debug, Default)]
pub struct IngestCounters {
    pub queue_drops: AtomicU64,
    pub parse_errors: AtomicU64,
    pub unknown_sensor_frames: AtomicU64,
    pub samples_ingested: AtomicU64,
    per_sensor_drops: DashMap<ClientId, u64>,
}

impl IngestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn per_sensor_drops(&self, id: ClientId) -> u64 {
        self.per_sensor_drops.get(&id).map(|v| *v).unwrap_or(0)
    }

    fn bump_sensor_drop(&self, id: ClientId) {
        *self.per_sensor_drops.entry(id).or_insert(0) += 1;
    }
}

/// Guards a log line to at most once per `RATE_LIMIT_WINDOW` (spec.md §4.3:
/// "a warning emitted with a rate limit of one per 10s").
struct RateLimiter {
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self { last: Mutex::new(None) }
    }

    fn allow(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < RATE_LIMIT_WINDOW => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

struct QueuedFrame {
    frame: Frame,
    from: SocketAddr,
}

/// Owns the receive/consume thread pair and the shared counters/address map
/// they populate. Dropping this (after calling [`IngestHandles::shutdown`])
/// joins both threads.
pub struct IngestHandles {
    pub counters: Arc<IngestCounters>,
    pub control_addresses: Arc<DashMap<ClientId, SocketAddr>>,
    shutdown: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl IngestHandles {
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.receiver.take() {
            let _ = h.join();
        }
        if let Some(h) = self.consumer.take() {
            let _ = h.join();
        }
    }
}

impl Drop for IngestHandles {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns the receiver and consumer threads (spec.md §4.3/§5). `data_socket`
/// must already be bound; it is set non-blocking here. `control_socket` is
/// used only to send DATA_ACK frames back to each sensor's reported control
/// port.
pub fn spawn(
    data_socket: UdpSocket,
    control_socket: Arc<UdpSocket>,
    registry: Arc<Registry>,
    rings: Arc<RingStore>,
    queue_capacity: usize,
) -> IngestHandles {
    data_socket.set_nonblocking(true).expect("data socket supports non-blocking mode");

    let (tx, rx): (Sender<QueuedFrame>, Receiver<QueuedFrame>) = bounded(queue_capacity);
    let counters = Arc::new(IngestCounters::new());
    let control_addresses: Arc<DashMap<ClientId, SocketAddr>> = Arc::new(DashMap::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let receiver = {
        let counters = counters.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || receive_loop(data_socket, tx, counters, shutdown))
    };

    let consumer = {
        let counters = counters.clone();
        let control_addresses = control_addresses.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || consume_loop(rx, registry, rings, control_socket, counters, control_addresses, shutdown))
    };

    IngestHandles { counters, control_addresses, shutdown, receiver: Some(receiver), consumer: Some(consumer) }
}

fn receive_loop(socket: UdpSocket, tx: Sender<QueuedFrame>, counters: Arc<IngestCounters>, shutdown: Arc<AtomicBool>) {
    let limiter = RateLimiter::new();
    let mut buf = [0u8; RECV_BUF_SIZE];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => match codec::parse(&buf[..n]) {
                Ok(frame) => {
                    let client_id = frame.client_id();
                    match tx.try_send(QueuedFrame { frame, from }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            counters.queue_drops.fetch_add(1, Ordering::Relaxed);
                            counters.bump_sensor_drop(client_id);
                            if limiter.allow(Instant::now()) {
                                warn!("ingest queue full, dropping newest datagram from {client_id}");
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
                Err(e) => {
                    counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("dropping unparseable datagram from {from}: {e}");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_BACKOFF);
            }
            Err(e) => {
                debug!("ingest recv error: {e}");
                std::thread::sleep(POLL_BACKOFF);
            }
        }
    }
}

fn consume_loop(
    rx: Receiver<QueuedFrame>,
    registry: Arc<Registry>,
    rings: Arc<RingStore>,
    control_socket: Arc<UdpSocket>,
    counters: Arc<IngestCounters>,
    control_addresses: Arc<DashMap<ClientId, SocketAddr>>,
    shutdown: Arc<AtomicBool>,
) {
    let unknown_limiter = RateLimiter::new();
    while !shutdown.load(Ordering::Relaxed) {
        let item = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let now = Instant::now();
        match item.frame {
            Frame::Hello { client_id, control_port, sample_rate_hz, name, firmware, queue_overflow_drops } => {
                registry.on_hello(client_id, name, firmware, sample_rate_hz, control_port, queue_overflow_drops, now);
                control_addresses.insert(client_id, SocketAddr::new(item.from.ip(), control_port));
            }
            Frame::Data { client_id, seq, t0_us, sample_count, xyz } => {
                let created = registry.on_data(client_id, seq, now);
                if created {
                    counters.unknown_sensor_frames.fetch_add(1, Ordering::Relaxed);
                    if unknown_limiter.allow(now) {
                        warn!("DATA from unknown sensor {client_id}, auto-created a minimal registry entry");
                    }
                }

                let samples: Vec<(f32, f32, f32)> = xyz
                    .chunks_exact(3)
                    .map(|c| (c[0] as f32 * ACCEL_SCALE_G_PER_LSB, c[1] as f32 * ACCEL_SCALE_G_PER_LSB, c[2] as f32 * ACCEL_SCALE_G_PER_LSB))
                    .collect();
                debug_assert_eq!(samples.len(), sample_count);
                counters.samples_ingested.fetch_add(samples.len() as u64, Ordering::Relaxed);

                let clock_offset_us = registry.get(client_id).and_then(|r| r.clock_offset_us);
                let t0_server_us = match clock_offset_us {
                    Some(offset) => (t0_us as i64 + offset).max(0) as u64,
                    None => t0_us,
                };
                rings.ingest(client_id, &samples, t0_server_us);

                if let Some(addr) = control_addresses.get(&client_id) {
                    if let Ok(bytes) = codec::encode(&Frame::DataAck { client_id, seq_echo: seq }) {
                        let _ = control_socket.send_to(&bytes, *addr);
                    }
                }
            }
            other => {
                debug!("ignoring unexpected frame from {} on the data socket", other.client_id());
            }
        }
    }
}
