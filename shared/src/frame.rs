//! Logical frame model for the UniRoute control channel.
//!
//! A control channel carries a totally ordered sequence of frames in each
//! direction. HTTP envelopes correlate on a request id, stream traffic on a
//! session id; heartbeats and channel control frames have no correlation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorKind};

/// Maximum reassembled logical frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol version carried in OPEN.
pub const PROTOCOL_VERSION: u8 = 1;

/// Tunnel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
    Tls,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Udp => "udp",
        }
    }

    /// Stream protocols lease a public port; HTTP routes by hostname.
    pub fn is_stream(self) -> bool {
        !matches!(self, Protocol::Http)
    }

    pub(crate) fn wire(self) -> u8 {
        match self {
            Protocol::Http => 0,
            Protocol::Tcp => 1,
            Protocol::Tls => 2,
            Protocol::Udp => 3,
        }
    }

    pub(crate) fn from_wire(b: u8) -> Option<Self> {
        Some(match b {
            0 => Protocol::Http,
            1 => Protocol::Tcp,
            2 => Protocol::Tls,
            3 => Protocol::Udp,
            _ => return None,
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            "tls" => Ok(Protocol::Tls),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::invalid(format!("unknown protocol '{other}'"))),
        }
    }
}

/// Header list as carried on the wire. Order-preserving; names are not
/// required to be unique.
pub type Headers = Vec<(String, String)>;

/// Client → edge, first frame after the websocket upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open {
    pub version: u8,
    /// Tunnel id issued during the upgrade negotiation.
    pub tunnel_id: String,
    /// Local target as advertised by the client, e.g. "127.0.0.1:3000".
    pub local_target: String,
}

/// Edge → client, acknowledges the attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAck {
    pub tunnel_id: String,
    pub subdomain: String,
    pub public_url: String,
    /// Leased public port, stream protocols only.
    pub port: Option<u16>,
}

/// Edge → client channel-level close, used for attach tie-breaking and
/// orderly drain. The receiver should stop sending and disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shutdown {
    pub reason: String,
}

/// Edge → client HTTP request envelope. Large bodies split across wire
/// frames via the continuation bit; the codec reassembles before decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Req {
    pub request_id: String,
    pub method: String,
    /// Path including query string.
    pub path: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Client → edge response head; precedes any RESP_BODY for the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespHead {
    pub request_id: String,
    pub status: u16,
    pub headers: Headers,
}

/// Client → edge response body chunk; `last` closes the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespBody {
    pub request_id: String,
    pub chunk: Bytes,
    pub last: bool,
}

/// Edge → client, announces an accepted stream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpen {
    pub session_id: String,
    pub tunnel_id: String,
    /// Public peer address, informational.
    pub peer_addr: String,
}

/// Bidirectional raw bytes for a stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData {
    pub session_id: String,
    pub data: Bytes,
}

/// Bidirectional stream teardown; an error kind marks abnormal close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamClose {
    pub session_id: String,
    pub error: Option<ErrorKind>,
}

/// Either direction: failure for a request id or session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrFrame {
    pub correlation_id: String,
    pub kind: ErrorKind,
    pub message: Option<String>,
}

/// A logical control-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open(Open),
    OpenAck(OpenAck),
    Shutdown(Shutdown),
    Req(Req),
    RespHead(RespHead),
    RespBody(RespBody),
    StreamOpen(StreamOpen),
    StreamData(StreamData),
    StreamClose(StreamClose),
    Ping(u64),
    Pong(u64),
    Err(ErrFrame),
}

/// Wire type ids. The high bit of the type byte is the continuation flag
/// and must stay clear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 0x01,
    OpenAck = 0x02,
    Shutdown = 0x03,
    Req = 0x10,
    RespHead = 0x11,
    RespBody = 0x12,
    StreamOpen = 0x20,
    StreamData = 0x21,
    StreamClose = 0x22,
    Ping = 0x30,
    Pong = 0x31,
    Err = 0x40,
}

impl FrameType {
    pub fn from_wire(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => FrameType::Open,
            0x02 => FrameType::OpenAck,
            0x03 => FrameType::Shutdown,
            0x10 => FrameType::Req,
            0x11 => FrameType::RespHead,
            0x12 => FrameType::RespBody,
            0x20 => FrameType::StreamOpen,
            0x21 => FrameType::StreamData,
            0x22 => FrameType::StreamClose,
            0x30 => FrameType::Ping,
            0x31 => FrameType::Pong,
            0x40 => FrameType::Err,
            _ => return None,
        })
    }
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Open(_) => FrameType::Open,
            Frame::OpenAck(_) => FrameType::OpenAck,
            Frame::Shutdown(_) => FrameType::Shutdown,
            Frame::Req(_) => FrameType::Req,
            Frame::RespHead(_) => FrameType::RespHead,
            Frame::RespBody(_) => FrameType::RespBody,
            Frame::StreamOpen(_) => FrameType::StreamOpen,
            Frame::StreamData(_) => FrameType::StreamData,
            Frame::StreamClose(_) => FrameType::StreamClose,
            Frame::Ping(_) => FrameType::Ping,
            Frame::Pong(_) => FrameType::Pong,
            Frame::Err(_) => FrameType::Err,
        }
    }

    /// Shorthand for an `ERR` frame.
    pub fn error(correlation_id: impl Into<String>, err: &Error) -> Self {
        Frame::Err(ErrFrame {
            correlation_id: correlation_id.into(),
            kind: err.kind(),
            message: Some(err.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("http".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("quic".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_stream_protocols_need_ports() {
        assert!(!Protocol::Http.is_stream());
        assert!(Protocol::Tcp.is_stream());
        assert!(Protocol::Tls.is_stream());
        assert!(Protocol::Udp.is_stream());
    }

    #[test]
    fn test_frame_type_codes_clear_continuation_bit() {
        for ty in [
            FrameType::Open,
            FrameType::OpenAck,
            FrameType::Shutdown,
            FrameType::Req,
            FrameType::RespHead,
            FrameType::RespBody,
            FrameType::StreamOpen,
            FrameType::StreamData,
            FrameType::StreamClose,
            FrameType::Ping,
            FrameType::Pong,
            FrameType::Err,
        ] {
            assert_eq!(ty as u8 & 0x80, 0);
            assert_eq!(FrameType::from_wire(ty as u8), Some(ty));
        }
    }
}
