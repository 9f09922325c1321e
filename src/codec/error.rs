use thiserror::Error;

/// All codec failures are recoverable: the caller drops the datagram and
/// bumps a counter (spec.md §4.1).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short to contain a valid frame")]
    ShortBuffer,
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("declared length does not match buffer length")]
    LengthMismatch,
    #[error("payload exceeds the maximum allowed length")]
    PayloadTooLong,
}
