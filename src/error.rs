//! Error types for iSCSI initiator operations

use thiserror::Error;

/// iSCSI initiator errors
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Buffer overflow: need {needed} bytes, {available} available")]
    BufferOverflow { needed: usize, available: usize },

    #[error("Version mismatch: target supports {max}, active {active}")]
    VersionMismatch { max: u8, active: u8 },

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl IscsiError {
    /// True when the peer closed the connection underneath us.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            IscsiError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// True for read/write timeouts, including those surfaced as I/O errors.
    pub fn is_timeout(&self) -> bool {
        match self {
            IscsiError::Timeout(_) => true,
            IscsiError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Result type for iSCSI initiator operations
pub type IscsiResult<T> = Result<T, IscsiError>;

/// Render a Login Response status class/detail pair (RFC 3720 Section 10.13.5)
/// as an operator-facing message.
pub fn decode_login_status(status_class: u8, status_detail: u8) -> String {
    match (status_class, status_detail) {
        (0x00, 0x00) => "Login success".to_string(),

        (0x01, 0x01) => "Target moved temporarily: retry the login at the portal given \
             in TargetAddress"
            .to_string(),
        (0x01, 0x02) => "Target moved permanently: update the node configuration with \
             the portal given in TargetAddress"
            .to_string(),

        (0x02, 0x00) => "Initiator error: the target refused the login request"
            .to_string(),
        (0x02, 0x01) => "Authentication failed: verify the CHAP username and password \
             configured for this node"
            .to_string(),
        (0x02, 0x02) => "Authorization failure: the initiator name is not allowed to \
             access this target, check the target ACL"
            .to_string(),
        (0x02, 0x03) => "Target not found: the TargetName does not exist at this portal, \
             run discovery again"
            .to_string(),
        (0x02, 0x04) => "Target removed: the target is no longer available at any portal"
            .to_string(),
        (0x02, 0x05) => "Unsupported version: the target does not support iSCSI \
             version 0"
            .to_string(),
        (0x02, 0x06) => "Too many connections: the session cannot accept another \
             connection"
            .to_string(),
        (0x02, 0x07) => "Missing parameter: a required login key was not sent".to_string(),
        (0x02, 0x08) => "Cannot include in session: this connection cannot join the \
             session (portal group or TSIH mismatch)"
            .to_string(),
        (0x02, 0x09) => "Session type not supported by the target".to_string(),
        (0x02, 0x0A) => "Session does not exist: the TSIH used for this connection is \
             not known to the target"
            .to_string(),
        (0x02, 0x0B) => "Invalid request during login".to_string(),

        (0x03, 0x00) => "Target error: the target hit an internal error, retry later"
            .to_string(),
        (0x03, 0x01) => "Service unavailable: the target is temporarily unable to \
             accept logins, retry later"
            .to_string(),
        (0x03, 0x02) => "Out of resources: the target cannot allocate a session, \
             retry later"
            .to_string(),

        _ => format!(
            "Unknown login status class 0x{:02x} detail 0x{:02x} (unrecognized by RFC 3720)",
            status_class, status_detail
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_closed_classification() {
        let eof = IscsiError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "closed",
        ));
        assert!(eof.is_peer_closed());
        assert!(!eof.is_timeout());

        let timeout = IscsiError::Timeout("login".into());
        assert!(timeout.is_timeout());
        assert!(!timeout.is_peer_closed());
    }

    #[test]
    fn test_buffer_overflow_message() {
        let err = IscsiError::BufferOverflow {
            needed: 20,
            available: 4,
        };
        assert_eq!(err.to_string(), "Buffer overflow: need 20 bytes, 4 available");
    }
}
