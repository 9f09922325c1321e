//! Wire codec: frame/parse HELLO, DATA, CMD, ACK, SYNC_CLOCK(CMD subtype),
//! DATA_ACK packets exchanged with sensor nodes over UDP.
//!
//! All multi-byte fields are little-endian. Every frame shares a 2-byte
//! header `(u8 type, u8 version)` followed by a 6-byte client id. Errors are
//! all recoverable: the caller drops the datagram and bumps a counter, it
//! never panics on attacker- or bug-supplied bytes.

mod error;
mod frame;

pub use error::CodecError;
pub use frame::{ClientId, CmdBody, Frame};

pub const PROTOCOL_VERSION: u8 = 1;
const HEADER_LEN: usize = 2 + 6;
const MAX_NAME_LEN: usize = 255;
const MAX_SAMPLE_COUNT: usize = 512;

const TYPE_HELLO: u8 = 1;
const TYPE_DATA: u8 = 2;
const TYPE_CMD: u8 = 3;
const TYPE_ACK: u8 = 4;
const TYPE_DATA_ACK: u8 = 5;

const CMD_IDENTIFY: u8 = 1;
const CMD_SYNC_CLOCK: u8 = 2;

/// Parses a single datagram into a [`Frame`]. Never panics; every malformed
/// input maps to a [`CodecError`] variant.
pub fn parse(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::ShortBuffer);
    }
    let msg_type = bytes[0];
    let version = bytes[1];
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let mut client_id = [0u8; 6];
    client_id.copy_from_slice(&bytes[2..8]);
    let client_id = ClientId(client_id);
    let body = &bytes[HEADER_LEN..];

    match msg_type {
        TYPE_HELLO => parse_hello(client_id, body),
        TYPE_DATA => parse_data(client_id, body),
        TYPE_CMD => parse_cmd(client_id, body),
        TYPE_ACK => parse_ack(client_id, body),
        TYPE_DATA_ACK => parse_data_ack(client_id, body),
        other => Err(CodecError::UnknownType(other)),
    }
}

fn take_u8(b: &[u8], at: &mut usize) -> Result<u8, CodecError> {
    let v = *b.get(*at).ok_or(CodecError::ShortBuffer)?;
    *at += 1;
    Ok(v)
}

fn take_u16(b: &[u8], at: &mut usize) -> Result<u16, CodecError> {
    let slice = b.get(*at..*at + 2).ok_or(CodecError::ShortBuffer)?;
    *at += 2;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn take_u32(b: &[u8], at: &mut usize) -> Result<u32, CodecError> {
    let slice = b.get(*at..*at + 4).ok_or(CodecError::ShortBuffer)?;
    *at += 4;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn take_u64(b: &[u8], at: &mut usize) -> Result<u64, CodecError> {
    let slice = b.get(*at..*at + 8).ok_or(CodecError::ShortBuffer)?;
    *at += 8;
    Ok(u64::from_le_bytes(slice.try_into().unwrap()))
}

fn take_str(b: &[u8], at: &mut usize, len: usize) -> Result<String, CodecError> {
    if len > MAX_NAME_LEN {
        return Err(CodecError::PayloadTooLong);
    }
    let slice = b.get(*at..*at + len).ok_or(CodecError::ShortBuffer)?;
    *at += len;
    Ok(String::from_utf8_lossy(slice).into_owned())
}

fn parse_hello(client_id: ClientId, b: &[u8]) -> Result<Frame, CodecError> {
    let mut at = 0;
    let control_port = take_u16(b, &mut at)?;
    let sample_rate_hz = take_u16(b, &mut at)?;
    let name_len = take_u8(b, &mut at)? as usize;
    let name = take_str(b, &mut at, name_len)?;
    let fw_len = take_u8(b, &mut at)? as usize;
    let firmware = take_str(b, &mut at, fw_len)?;
    let queue_overflow_drops = take_u32(b, &mut at)?;
    if at != b.len() {
        return Err(CodecError::LengthMismatch);
    }
    Ok(Frame::Hello { client_id, control_port, sample_rate_hz, name, firmware, queue_overflow_drops })
}

fn parse_data(client_id: ClientId, b: &[u8]) -> Result<Frame, CodecError> {
    let mut at = 0;
    let seq = take_u32(b, &mut at)?;
    let t0_us = take_u64(b, &mut at)?;
    let sample_count = take_u16(b, &mut at)? as usize;
    if sample_count == 0 || sample_count > MAX_SAMPLE_COUNT {
        return Err(CodecError::PayloadTooLong);
    }
    let needed = sample_count * 3 * 2;
    let slice = b.get(at..at + needed).ok_or(CodecError::ShortBuffer)?;
    at += needed;
    if at != b.len() {
        return Err(CodecError::LengthMismatch);
    }
    let mut xyz = Vec::with_capacity(sample_count * 3);
    for chunk in slice.chunks_exact(2) {
        xyz.push(i16::from_le_bytes([chunk[0], chunk[1]]));
    }
    Ok(Frame::Data { client_id, seq, t0_us, sample_count, xyz })
}

fn parse_cmd(client_id: ClientId, b: &[u8]) -> Result<Frame, CodecError> {
    let mut at = 0;
    let cmd_id = take_u8(b, &mut at)?;
    let cmd_seq = take_u32(b, &mut at)?;
    let body = match cmd_id {
        CMD_IDENTIFY => {
            let duration_ms = take_u16(b, &mut at)?;
            CmdBody::Identify { duration_ms }
        }
        CMD_SYNC_CLOCK => {
            let server_time_us = take_u64(b, &mut at)?;
            CmdBody::SyncClock { server_time_us }
        }
        other => return Err(CodecError::UnknownType(other)),
    };
    if at != b.len() {
        return Err(CodecError::LengthMismatch);
    }
    Ok(Frame::Cmd { client_id, cmd_seq, body })
}

fn parse_ack(client_id: ClientId, b: &[u8]) -> Result<Frame, CodecError> {
    let mut at = 0;
    let cmd_seq = take_u32(b, &mut at)?;
    let status = take_u8(b, &mut at)?;
    if at != b.len() {
        return Err(CodecError::LengthMismatch);
    }
    Ok(Frame::Ack { client_id, cmd_seq, status })
}

fn parse_data_ack(client_id: ClientId, b: &[u8]) -> Result<Frame, CodecError> {
    let mut at = 0;
    let seq_echo = take_u32(b, &mut at)?;
    if at != b.len() {
        return Err(CodecError::LengthMismatch);
    }
    Ok(Frame::DataAck { client_id, seq_echo })
}

/// Encodes a [`Frame`] back to its wire form. Inverse of [`parse`] for all
/// valid frames (round-trip invariant, spec.md §8).
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(64);
    match frame {
        Frame::Hello { client_id, control_port, sample_rate_hz, name, firmware, queue_overflow_drops } => {
            if name.len() > MAX_NAME_LEN || firmware.len() > MAX_NAME_LEN {
                return Err(CodecError::PayloadTooLong);
            }
            out.push(TYPE_HELLO);
            out.push(PROTOCOL_VERSION);
            out.extend_from_slice(&client_id.0);
            out.extend_from_slice(&control_port.to_le_bytes());
            out.extend_from_slice(&sample_rate_hz.to_le_bytes());
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
            out.push(firmware.len() as u8);
            out.extend_from_slice(firmware.as_bytes());
            out.extend_from_slice(&queue_overflow_drops.to_le_bytes());
        }
        Frame::Data { client_id, seq, t0_us, sample_count, xyz } => {
            if *sample_count == 0 || *sample_count > MAX_SAMPLE_COUNT || xyz.len() != sample_count * 3 {
                return Err(CodecError::PayloadTooLong);
            }
            out.push(TYPE_DATA);
            out.push(PROTOCOL_VERSION);
            out.extend_from_slice(&client_id.0);
            out.extend_from_slice(&seq.to_le_bytes());
            out.extend_from_slice(&t0_us.to_le_bytes());
            out.extend_from_slice(&(*sample_count as u16).to_le_bytes());
            for v in xyz {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Frame::Cmd { client_id, cmd_seq, body } => {
            out.push(TYPE_CMD);
            out.push(PROTOCOL_VERSION);
            out.extend_from_slice(&client_id.0);
            match body {
                CmdBody::Identify { duration_ms } => {
                    out.push(CMD_IDENTIFY);
                    out.extend_from_slice(&cmd_seq.to_le_bytes());
                    out.extend_from_slice(&duration_ms.to_le_bytes());
                }
                CmdBody::SyncClock { server_time_us } => {
                    out.push(CMD_SYNC_CLOCK);
                    out.extend_from_slice(&cmd_seq.to_le_bytes());
                    out.extend_from_slice(&server_time_us.to_le_bytes());
                }
            }
        }
        Frame::Ack { client_id, cmd_seq, status } => {
            out.push(TYPE_ACK);
            out.push(PROTOCOL_VERSION);
            out.extend_from_slice(&client_id.0);
            out.extend_from_slice(&cmd_seq.to_le_bytes());
            out.push(*status);
        }
        Frame::DataAck { client_id, seq_echo } => {
            out.push(TYPE_DATA_ACK);
            out.push(PROTOCOL_VERSION);
            out.extend_from_slice(&client_id.0);
            out.extend_from_slice(&seq_echo.to_le_bytes());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid() -> ClientId {
        ClientId([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
    }

    #[test]
    fn hello_round_trips() {
        let f = Frame::Hello {
            client_id: cid(),
            control_port: 9001,
            sample_rate_hz: 800,
            name: "FL".into(),
            firmware: "1.2.3".into(),
            queue_overflow_drops: 0,
        };
        let bytes = encode(&f).unwrap();
        let back = parse(&bytes).unwrap();
        assert_eq!(f, back);
        assert_eq!(encode(&back).unwrap(), bytes);
    }

    #[test]
    fn data_round_trips() {
        let f = Frame::Data { client_id: cid(), seq: 1, t0_us: 0, sample_count: 1, xyz: vec![1000, 0, 0] };
        let bytes = encode(&f).unwrap();
        assert_eq!(parse(&bytes).unwrap(), f);
    }

    #[test]
    fn cmd_identify_round_trips() {
        let f = Frame::Cmd { client_id: cid(), cmd_seq: 42, body: CmdBody::Identify { duration_ms: 500 } };
        let bytes = encode(&f).unwrap();
        assert_eq!(parse(&bytes).unwrap(), f);
    }

    #[test]
    fn cmd_sync_clock_round_trips() {
        let f = Frame::Cmd { client_id: cid(), cmd_seq: 7, body: CmdBody::SyncClock { server_time_us: 123_456 } };
        let bytes = encode(&f).unwrap();
        assert_eq!(parse(&bytes).unwrap(), f);
    }

    #[test]
    fn ack_round_trips() {
        let f = Frame::Ack { client_id: cid(), cmd_seq: 9, status: 0 };
        let bytes = encode(&f).unwrap();
        assert_eq!(parse(&bytes).unwrap(), f);
    }

    #[test]
    fn data_ack_round_trips() {
        let f = Frame::DataAck { client_id: cid(), seq_echo: 55 };
        let bytes = encode(&f).unwrap();
        assert_eq!(parse(&bytes).unwrap(), f);
    }

    #[test]
    fn short_buffer_is_recoverable_error() {
        assert!(matches!(parse(&[1, 1, 0, 0]), Err(CodecError::ShortBuffer)));
    }

    #[test]
    fn unknown_type_is_recoverable_error() {
        let mut bytes = vec![99, PROTOCOL_VERSION];
        bytes.extend_from_slice(&cid().0);
        assert!(matches!(parse(&bytes), Err(CodecError::UnknownType(99))));
    }

    #[test]
    fn unsupported_version_is_recoverable_error() {
        let mut bytes = vec![TYPE_HELLO, 7];
        bytes.extend_from_slice(&cid().0);
        assert!(matches!(parse(&bytes), Err(CodecError::UnsupportedVersion(7))));
    }

    #[test]
    fn data_ack_length_mismatch_is_recoverable_error() {
        let mut bytes = vec![TYPE_DATA_ACK, PROTOCOL_VERSION];
        bytes.extend_from_slice(&cid().0);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(0xFF); // trailing garbage byte
        assert!(matches!(parse(&bytes), Err(CodecError::LengthMismatch)));
    }

    #[test]
    fn data_sample_count_zero_is_rejected() {
        let f = Frame::Data { client_id: cid(), seq: 1, t0_us: 0, sample_count: 0, xyz: vec![] };
        assert!(matches!(encode(&f), Err(CodecError::PayloadTooLong)));
    }

    #[test]
    fn hello_name_over_255_bytes_is_rejected() {
        let f = Frame::Hello {
            client_id: cid(),
            control_port: 1,
            sample_rate_hz: 1,
            name: "x".repeat(256),
            firmware: "1".into(),
            queue_overflow_drops: 0,
        };
        assert!(matches!(encode(&f), Err(CodecError::PayloadTooLong)));
    }
}
