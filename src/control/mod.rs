//! Control plane: sends CMD frames to sensors' reported control ports and
//! correlates ACKs. Two commands: `identify` (fire-and-forget, UI-ack with a
//! 1.5s timeout) and `sync_clock` (broadcast every ~5s, no retry beyond the
//! next periodic broadcast).

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::debug;
use thiserror::Error;

use crate::codec::{self, ClientId, CmdBody, Frame};

const ACK_RECV_TIMEOUT: Duration = Duration::from_millis(200);

pub const ACK_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    #[error("command timed out waiting for ACK")]
    Timeout,
    #[error("underlying socket error")]
    SocketError,
}

/// State machine for a pending CMD: `sent -> (ack | timeout)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingState {
    Sent,
    Acked(u8),
}

struct Pending {
    state: PendingState,
    sent_at: Instant,
}

/// Sends CMD frames and correlates ACKs via a `cmd_seq -> Pending` table,
/// mirroring the teacher's DashMap-based atomics idiom (`sync_manager.rs`).
pub struct ControlPlane {
    socket: UdpSocket,
    pending: DashMap<u32, Pending>,
    next_seq: AtomicU32,
}

impl ControlPlane {
    pub fn bind(local_addr: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(local_addr)?;
        Ok(Self { socket, pending: DashMap::new(), next_seq: AtomicU32::new(1) })
    }

    fn alloc_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Fire-and-forget identify; returns the `cmd_seq` the caller should
    /// later pass to [`ControlPlane::await_ack`] for UI confirmation.
    pub fn send_identify(&self, client: ClientId, addr: (std::net::IpAddr, u16), duration_ms: u16) -> Result<u32, ControlError> {
        let cmd_seq = self.alloc_seq();
        let frame = Frame::Cmd { client_id: client, cmd_seq, body: CmdBody::Identify { duration_ms } };
        self.send(&frame, addr)?;
        self.pending.insert(cmd_seq, Pending { state: PendingState::Sent, sent_at: Instant::now() });
        Ok(cmd_seq)
    }

    /// Broadcasts sync_clock to one sensor; no implicit retry beyond the
    /// caller's own periodic schedule (spec.md §4.4).
    pub fn send_sync_clock(&self, client: ClientId, addr: (std::net::IpAddr, u16), server_time_us: u64) -> Result<u32, ControlError> {
        let cmd_seq = self.alloc_seq();
        let frame = Frame::Cmd { client_id: client, cmd_seq, body: CmdBody::SyncClock { server_time_us } };
        self.send(&frame, addr)?;
        self.pending.insert(cmd_seq, Pending { state: PendingState::Sent, sent_at: Instant::now() });
        Ok(cmd_seq)
    }

    fn send(&self, frame: &Frame, addr: (std::net::IpAddr, u16)) -> Result<(), ControlError> {
        let bytes = codec::encode(frame).map_err(|_| ControlError::SocketError)?;
        self.socket.send_to(&bytes, addr).map_err(|_| ControlError::SocketError)?;
        Ok(())
    }

    /// Called from the ingest path when an ACK frame arrives.
    pub fn on_ack(&self, cmd_seq: u32, status: u8) {
        if let Some(mut entry) = self.pending.get_mut(&cmd_seq) {
            entry.state = PendingState::Acked(status);
        }
    }

    /// Blocks (bounded by [`ACK_TIMEOUT`]) waiting for the ACK to land,
    /// polling at a short interval — used by the UI-confirmation path for
    /// `identify`.
    pub fn await_ack(&self, cmd_seq: u32) -> Result<u8, ControlError> {
        let deadline = Instant::now() + ACK_TIMEOUT;
        loop {
            if let Some(entry) = self.pending.get(&cmd_seq) {
                if let PendingState::Acked(status) = entry.state {
                    drop(entry);
                    self.pending.remove(&cmd_seq);
                    return Ok(status);
                }
            } else {
                return Err(ControlError::Timeout);
            }
            if Instant::now() >= deadline {
                self.pending.remove(&cmd_seq);
                return Err(ControlError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Sweeps pending entries past their deadline, resolving them as
    /// timed out. Intended to run periodically from a background thread
    /// so `await_ack` callers aren't the only ones who can reap entries.
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<u32> = self
            .pending
            .iter()
            .filter(|e| matches!(e.state, PendingState::Sent) && now.saturating_duration_since(e.sent_at) > ACK_TIMEOUT)
            .map(|e| *e.key())
            .collect();
        for seq in &stale {
            self.pending.remove(seq);
        }
        stale.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// A second handle to the same bound socket, so the ingest consumer can
    /// send DATA_ACK frames from the server's control port without a
    /// separate bind.
    pub fn try_clone_socket(&self) -> std::io::Result<UdpSocket> {
        self.socket.try_clone()
    }
}

/// Spawns a background thread that reads ACK frames off the control socket
/// and resolves them against `control`'s pending table. This is the only
/// receiver on the control port — without it `await_ack` always times out,
/// since `send_identify`/`send_sync_clock` never get a reply routed back to
/// them.
pub fn spawn_ack_receive_loop(socket: UdpSocket, control: Arc<ControlPlane>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    socket.set_read_timeout(Some(ACK_RECV_TIMEOUT)).expect("control socket supports read timeouts");
    std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        while running.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => match codec::parse(&buf[..n]) {
                    Ok(Frame::Ack { cmd_seq, status, .. }) => control.on_ack(cmd_seq, status),
                    Ok(other) => debug!("ignoring unexpected frame from {} on control socket ({from})", other.client_id()),
                    Err(e) => debug!("dropping unparseable control-socket datagram from {from}: {e}"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => debug!("control socket recv error: {e}"),
            }
        }
    })
}

/// Spawns a background thread that broadcasts `sync_clock` to every active
/// sensor on the given interval, until `running` is cleared.
pub fn spawn_sync_clock_broadcaster(
    control: Arc<ControlPlane>,
    registry: Arc<crate::registry::Registry>,
    interval: Duration,
    running: Arc<std::sync::atomic::AtomicBool>,
    control_port_of: impl Fn(ClientId) -> Option<(std::net::IpAddr, u16)> + Send + 'static,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while running.load(Ordering::Relaxed) {
            std::thread::sleep(interval);
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let now_us = Instant::now().elapsed().as_micros() as u64;
            for id in registry.active_ids() {
                if let Some(addr) = control_port_of(id) {
                    let _ = control.send_sync_clock(id, addr, now_us);
                }
            }
            control.expire_stale();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_times_out_without_ack() {
        let cp = ControlPlane::bind("127.0.0.1:0").unwrap();
        // Directly register a pending entry as send_identify would, but
        // point at a harmless loopback port so the test has no real sensor
        // to reply.
        let seq = cp.alloc_seq();
        cp.pending.insert(seq, Pending { state: PendingState::Sent, sent_at: Instant::now() - Duration::from_secs(2) });
        assert_eq!(cp.await_ack(seq), Err(ControlError::Timeout));
    }

    #[test]
    fn ack_resolves_pending_command() {
        let cp = ControlPlane::bind("127.0.0.1:0").unwrap();
        let seq = cp.alloc_seq();
        cp.pending.insert(seq, Pending { state: PendingState::Sent, sent_at: Instant::now() });
        cp.on_ack(seq, 0);
        assert_eq!(cp.await_ack(seq), Ok(0));
    }

    #[test]
    fn expire_stale_removes_only_timed_out_entries() {
        let cp = ControlPlane::bind("127.0.0.1:0").unwrap();
        let fresh = cp.alloc_seq();
        cp.pending.insert(fresh, Pending { state: PendingState::Sent, sent_at: Instant::now() });
        let stale = cp.alloc_seq();
        cp.pending.insert(stale, Pending { state: PendingState::Sent, sent_at: Instant::now() - Duration::from_secs(3) });
        let removed = cp.expire_stale();
        assert_eq!(removed, 1);
        assert_eq!(cp.pending_count(), 1);
    }
}
