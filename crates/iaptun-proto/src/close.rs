//! WebSocket close codes used by the relay

use std::fmt;

/// Close status sent by the relay when it terminates a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    ErrorUnknown,
    SidUnknown,
    SidInUse,
    FailedToConnectToBackend,
    ReauthenticationRequired,
    BadAck,
    InvalidAck,
    InvalidWebSocketOpcode,
    InvalidTag,
    DestinationWriteFailed,
    DestinationReadFailed,
    InvalidData,
    NotAuthorized,
    LookupFailed,
    LookupFailedReconnect,
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => CloseCode::Normal,
            4000 => CloseCode::ErrorUnknown,
            4001 => CloseCode::SidUnknown,
            4002 => CloseCode::SidInUse,
            4003 => CloseCode::FailedToConnectToBackend,
            4004 => CloseCode::ReauthenticationRequired,
            4005 => CloseCode::BadAck,
            4006 => CloseCode::InvalidAck,
            4007 => CloseCode::InvalidWebSocketOpcode,
            4008 => CloseCode::InvalidTag,
            4009 => CloseCode::DestinationWriteFailed,
            4010 => CloseCode::DestinationReadFailed,
            4013 => CloseCode::InvalidData,
            4033 => CloseCode::NotAuthorized,
            4047 => CloseCode::LookupFailed,
            4051 => CloseCode::LookupFailedReconnect,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::ErrorUnknown => 4000,
            CloseCode::SidUnknown => 4001,
            CloseCode::SidInUse => 4002,
            CloseCode::FailedToConnectToBackend => 4003,
            CloseCode::ReauthenticationRequired => 4004,
            CloseCode::BadAck => 4005,
            CloseCode::InvalidAck => 4006,
            CloseCode::InvalidWebSocketOpcode => 4007,
            CloseCode::InvalidTag => 4008,
            CloseCode::DestinationWriteFailed => 4009,
            CloseCode::DestinationReadFailed => 4010,
            CloseCode::InvalidData => 4013,
            CloseCode::NotAuthorized => 4033,
            CloseCode::LookupFailed => 4047,
            CloseCode::LookupFailedReconnect => 4051,
            CloseCode::Other(value) => value,
        }
    }
}

impl CloseCode {
    /// True if the connection ended because one side hung up, not because of a fault.
    ///
    /// The relay reports DESTINATION_READ_FAILED / DESTINATION_WRITE_FAILED when
    /// the backend closed its socket.
    pub fn is_normal(&self) -> bool {
        matches!(
            self,
            CloseCode::Normal | CloseCode::DestinationReadFailed | CloseCode::DestinationWriteFailed
        )
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, CloseCode::NotAuthorized)
    }

    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, CloseCode::LookupFailed | CloseCode::LookupFailedReconnect)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseCode::Normal => "NORMAL",
            CloseCode::ErrorUnknown => "ERROR_UNKNOWN",
            CloseCode::SidUnknown => "SID_UNKNOWN",
            CloseCode::SidInUse => "SID_IN_USE",
            CloseCode::FailedToConnectToBackend => "FAILED_TO_CONNECT_TO_BACKEND",
            CloseCode::ReauthenticationRequired => "REAUTHENTICATION_REQUIRED",
            CloseCode::BadAck => "BAD_ACK",
            CloseCode::InvalidAck => "INVALID_ACK",
            CloseCode::InvalidWebSocketOpcode => "INVALID_WEBSOCKET_OPCODE",
            CloseCode::InvalidTag => "INVALID_TAG",
            CloseCode::DestinationWriteFailed => "DESTINATION_WRITE_FAILED",
            CloseCode::DestinationReadFailed => "DESTINATION_READ_FAILED",
            CloseCode::InvalidData => "INVALID_DATA",
            CloseCode::NotAuthorized => "NOT_AUTHORIZED",
            CloseCode::LookupFailed => "LOOKUP_FAILED",
            CloseCode::LookupFailedReconnect => "LOOKUP_FAILED_RECONNECT",
            CloseCode::Other(value) => return write!(f, "{}", value),
        };
        write!(f, "{} ({})", name, u16::from(*self))
    }
}
