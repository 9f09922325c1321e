use std::fmt;

/// Stable 6-byte sensor id (hardware MAC), used as the key everywhere a
/// sensor needs to be addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub [u8; 6]);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

/// A CMD frame's body, discriminated by `cmd_id` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum CmdBody {
    Identify { duration_ms: u16 },
    SyncClock { server_time_us: u64 },
}

/// A fully decoded wire frame (spec.md §4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello {
        client_id: ClientId,
        control_port: u16,
        sample_rate_hz: u16,
        name: String,
        firmware: String,
        queue_overflow_drops: u32,
    },
    Data {
        client_id: ClientId,
        seq: u32,
        t0_us: u64,
        sample_count: usize,
        /// Interleaved XYZ triples, length `sample_count * 3`.
        xyz: Vec<i16>,
    },
    Cmd {
        client_id: ClientId,
        cmd_seq: u32,
        body: CmdBody,
    },
    Ack {
        client_id: ClientId,
        cmd_seq: u32,
        status: u8,
    },
    DataAck {
        client_id: ClientId,
        seq_echo: u32,
    },
}

impl Frame {
    pub fn client_id(&self) -> ClientId {
        match self {
            Frame::Hello { client_id, .. }
            | Frame::Data { client_id, .. }
            | Frame::Cmd { client_id, .. }
            | Frame::Ack { client_id, .. }
            | Frame::DataAck { client_id, .. } => *client_id,
        }
    }
}
