//! Error types for the UniRoute tunnel fabric.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fabric-wide error. Every variant maps onto a wire-level [`ErrorKind`]
/// so errors can cross the control channel inside `ERR` frames.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("authentication failed")]
    AuthFailed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("subdomain taken: {0}")]
    SubdomainTaken(String),

    #[error("custom domain conflict: {0}")]
    CustomDomainConflict(String),

    #[error("tunnel not found")]
    TunnelNotFound,

    #[error("tunnel inactive")]
    TunnelInactive,

    #[error("tunnel disconnected")]
    TunnelDisconnected,

    #[error("duplicate correlation id: {0}")]
    Duplicate(String),

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("refused")]
    Refused,

    #[error("capacity exceeded")]
    Capacity,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Wire-level kind for `ERR` frames.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AuthFailed => ErrorKind::AuthFailed,
            Error::InvalidArgument(_) | Error::Protocol(_) => ErrorKind::InvalidArgument,
            Error::SubdomainTaken(_) => ErrorKind::SubdomainTaken,
            Error::CustomDomainConflict(_) => ErrorKind::CustomDomainConflict,
            Error::TunnelNotFound => ErrorKind::TunnelNotFound,
            Error::TunnelInactive => ErrorKind::TunnelInactive,
            Error::TunnelDisconnected => ErrorKind::TunnelDisconnected,
            Error::Duplicate(_) => ErrorKind::Duplicate,
            Error::Timeout => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Refused => ErrorKind::Refused,
            Error::Capacity => ErrorKind::Capacity,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Rebuild an error from a received `ERR` frame.
    pub fn from_wire(kind: ErrorKind, message: Option<String>) -> Self {
        let msg = message.unwrap_or_default();
        match kind {
            ErrorKind::AuthFailed => Error::AuthFailed,
            ErrorKind::InvalidArgument => Error::InvalidArgument(msg),
            ErrorKind::SubdomainTaken => Error::SubdomainTaken(msg),
            ErrorKind::CustomDomainConflict => Error::CustomDomainConflict(msg),
            ErrorKind::TunnelNotFound => Error::TunnelNotFound,
            ErrorKind::TunnelInactive => Error::TunnelInactive,
            ErrorKind::TunnelDisconnected => Error::TunnelDisconnected,
            ErrorKind::Duplicate => Error::Duplicate(msg),
            ErrorKind::Timeout => Error::Timeout,
            ErrorKind::Cancelled => Error::Cancelled,
            ErrorKind::Refused => Error::Refused,
            ErrorKind::Capacity => Error::Capacity,
            ErrorKind::Internal => Error::Internal(msg),
        }
    }
}

/// Closed set of error kinds that travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    AuthFailed = 1,
    InvalidArgument = 2,
    SubdomainTaken = 3,
    CustomDomainConflict = 4,
    TunnelNotFound = 5,
    TunnelInactive = 6,
    TunnelDisconnected = 7,
    Duplicate = 8,
    Timeout = 9,
    Cancelled = 10,
    Refused = 11,
    Capacity = 12,
    Internal = 13,
}

impl ErrorKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ErrorKind::AuthFailed,
            2 => ErrorKind::InvalidArgument,
            3 => ErrorKind::SubdomainTaken,
            4 => ErrorKind::CustomDomainConflict,
            5 => ErrorKind::TunnelNotFound,
            6 => ErrorKind::TunnelInactive,
            7 => ErrorKind::TunnelDisconnected,
            8 => ErrorKind::Duplicate,
            9 => ErrorKind::Timeout,
            10 => ErrorKind::Cancelled,
            11 => ErrorKind::Refused,
            12 => ErrorKind::Capacity,
            13 => ErrorKind::Internal,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_round_trip() {
        for code in 1..=13u8 {
            let kind = ErrorKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(99), None);
    }

    #[test]
    fn test_error_to_wire_and_back() {
        let err = Error::SubdomainTaken("myapp".into());
        assert_eq!(err.kind(), ErrorKind::SubdomainTaken);
        let back = Error::from_wire(err.kind(), Some("myapp".into()));
        assert!(matches!(back, Error::SubdomainTaken(s) if s == "myapp"));
    }

    #[test]
    fn test_protocol_maps_to_invalid_argument() {
        assert_eq!(
            Error::protocol("bad frame").kind(),
            ErrorKind::InvalidArgument
        );
    }
}
