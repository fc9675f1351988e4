use std::io;

/// Errors surfaced by the wire codec (§4.1, §7 taxonomy items 1 and 4).
///
/// Handlers above the codec match on this directly to decide whether a
/// closed connection is routine (exit the per-connection loop quietly) or
/// worth logging as a protocol violation.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// The peer closed its end cleanly (a zero-byte read). Not an error
    /// condition from the agent's point of view.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// `header.length` exceeded the maximum envelope size before any
    /// payload bytes were read.
    #[error("frame length {0} exceeds maximum envelope size")]
    FrameTooLarge(u32),

    /// The header named a `type` outside the known variant range.
    #[error("unknown message type: {0}")]
    UnknownType(u32),

    /// A fixed-size field (name/arg/error string) didn't fit the wire
    /// layout's capacity.
    #[error("field too long for wire layout: {0}")]
    FieldTooLong(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}
