//! Binary wire format for hot-restart messages.
//!
//! One message per datagram: a one-byte tag followed by the fields for
//! that variant. Multi-byte integers are little-endian; strings are
//! u16-length-prefixed UTF-8. Descriptors never appear in the payload —
//! they ride alongside as ancillary data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Cap on encoded string fields. Listener addresses and version strings
/// are short; anything bigger is a corrupt or hostile datagram.
const MAX_STRING_LEN: usize = 4096;

/// Decode failures. The serving side drops the datagram and logs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated message: need {0}")]
    Truncated(&'static str),

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("string field too long ({0} bytes)")]
    StringTooLong(usize),

    #[error("string field is not valid utf-8")]
    BadString,
}

fn safe_get_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Truncated("1 byte"));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16_le(buf: &mut &[u8]) -> Result<u16, CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Truncated("2 bytes"));
    }
    Ok(buf.get_u16_le())
}

fn safe_get_u64_le(buf: &mut &[u8]) -> Result<u64, CodecError> {
    if buf.len() < 8 {
        return Err(CodecError::Truncated("8 bytes"));
    }
    Ok(buf.get_u64_le())
}

fn put_string(buf: &mut BytesMut, value: &str) {
    debug_assert!(value.len() <= MAX_STRING_LEN);
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn safe_get_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    let len = safe_get_u16_le(buf)? as usize;
    if len > MAX_STRING_LEN {
        return Err(CodecError::StringTooLong(len));
    }
    if buf.len() < len {
        return Err(CodecError::Truncated("string body"));
    }
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw).map_err(|_| CodecError::BadString)
}

// Message tags. Requests are even, their replies odd.
const TAG_SHUTDOWN_ADMIN: u8 = 0;
const TAG_SHUTDOWN_ADMIN_REPLY: u8 = 1;
const TAG_DUPLICATE_SOCKET: u8 = 2;
const TAG_DUPLICATE_SOCKET_REPLY: u8 = 3;
const TAG_STATS: u8 = 4;
const TAG_STATS_REPLY: u8 = 5;
const TAG_DRAIN_LISTENERS: u8 = 6;
const TAG_DRAIN_LISTENERS_REPLY: u8 = 7;
const TAG_TERMINATE: u8 = 8;
const TAG_VERSION: u8 = 10;
const TAG_VERSION_REPLY: u8 = 11;

/// A hot-restart datagram, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartMessage {
    /// Child → parent: close your admin listener; I am about to open mine.
    ShutdownAdmin,
    /// Parent → child: done; carry my original start time forward so
    /// uptime stays monotonic across restarts.
    ShutdownAdminReply { original_start_time: u64 },

    /// Child → parent: send me your listen socket for `address`
    /// (e.g. `tcp://127.0.0.1:10000`).
    DuplicateSocket { address: String },
    /// Parent → child: `ok` means the descriptor rides in the ancillary
    /// data of this datagram.
    DuplicateSocketReply { ok: bool },

    /// Child → parent: report your stats for aggregation.
    Stats,
    StatsReply {
        memory_allocated: u64,
        num_connections: u64,
    },

    /// Child → parent: my workers are accepting; stop listening and start
    /// draining your connections.
    DrainListeners,
    DrainListenersReply,

    /// Child → parent: exit now. No reply — the parent is going away.
    Terminate,

    /// Either direction: hot-restart protocol version probe.
    Version,
    VersionReply { version: String },
}

impl RestartMessage {
    /// Encodes into a single-datagram payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Self::ShutdownAdmin => buf.put_u8(TAG_SHUTDOWN_ADMIN),
            Self::ShutdownAdminReply {
                original_start_time,
            } => {
                buf.put_u8(TAG_SHUTDOWN_ADMIN_REPLY);
                buf.put_u64_le(*original_start_time);
            }
            Self::DuplicateSocket { address } => {
                buf.put_u8(TAG_DUPLICATE_SOCKET);
                put_string(&mut buf, address);
            }
            Self::DuplicateSocketReply { ok } => {
                buf.put_u8(TAG_DUPLICATE_SOCKET_REPLY);
                buf.put_u8(u8::from(*ok));
            }
            Self::Stats => buf.put_u8(TAG_STATS),
            Self::StatsReply {
                memory_allocated,
                num_connections,
            } => {
                buf.put_u8(TAG_STATS_REPLY);
                buf.put_u64_le(*memory_allocated);
                buf.put_u64_le(*num_connections);
            }
            Self::DrainListeners => buf.put_u8(TAG_DRAIN_LISTENERS),
            Self::DrainListenersReply => buf.put_u8(TAG_DRAIN_LISTENERS_REPLY),
            Self::Terminate => buf.put_u8(TAG_TERMINATE),
            Self::Version => buf.put_u8(TAG_VERSION),
            Self::VersionReply { version } => {
                buf.put_u8(TAG_VERSION_REPLY);
                put_string(&mut buf, version);
            }
        }
        buf.freeze()
    }

    /// Decodes one datagram. Trailing bytes are rejected as corruption.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut buf = payload;
        let tag = safe_get_u8(&mut buf)?;
        let message = match tag {
            TAG_SHUTDOWN_ADMIN => Self::ShutdownAdmin,
            TAG_SHUTDOWN_ADMIN_REPLY => Self::ShutdownAdminReply {
                original_start_time: safe_get_u64_le(&mut buf)?,
            },
            TAG_DUPLICATE_SOCKET => Self::DuplicateSocket {
                address: safe_get_string(&mut buf)?,
            },
            TAG_DUPLICATE_SOCKET_REPLY => Self::DuplicateSocketReply {
                ok: safe_get_u8(&mut buf)? != 0,
            },
            TAG_STATS => Self::Stats,
            TAG_STATS_REPLY => Self::StatsReply {
                memory_allocated: safe_get_u64_le(&mut buf)?,
                num_connections: safe_get_u64_le(&mut buf)?,
            },
            TAG_DRAIN_LISTENERS => Self::DrainListeners,
            TAG_DRAIN_LISTENERS_REPLY => Self::DrainListenersReply,
            TAG_TERMINATE => Self::Terminate,
            TAG_VERSION => Self::Version,
            TAG_VERSION_REPLY => Self::VersionReply {
                version: safe_get_string(&mut buf)?,
            },
            other => return Err(CodecError::UnknownTag(other)),
        };
        if !buf.is_empty() {
            return Err(CodecError::Truncated("trailing bytes"));
        }
        Ok(message)
    }
}
