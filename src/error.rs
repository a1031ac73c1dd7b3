//! Error types for the SSU transport

use thiserror::Error;

/// Main error type for the SSU transport
#[derive(Error, Debug)]
pub enum SsuError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Shared secret has no non-zero byte in its first 33 bytes
    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encryption failed: buffer is not block aligned")]
    Encryption,

    #[error("Decryption failed: buffer is not block aligned")]
    Decryption,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("DH computation failed: peer public value out of range")]
    DiffieHellman,
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Invalid payload type: {payload_type}")]
    InvalidPayloadType { payload_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    #[error("Unsupported address size: {size}")]
    UnsupportedAddressFamily { size: usize },

    #[error("Peer {peer} advertises introducers but lists none")]
    UnroutableAddress { peer: String },

    #[error("Peer has no published address")]
    NoAddress,

    #[error("Datagram of {size} bytes exceeds MTU {mtu}")]
    PayloadTooLarge { size: usize, mtu: usize },

    #[error("No active session")]
    NoSession,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Server is no longer running")]
    ServerStopped,
}

impl SsuError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in config. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            Self::Network(NetworkError::BindFailed { addr, reason }) => {
                format!(
                    "Could not bind UDP socket on {} ({}).\n  \
                    Check that ListenPort is free.",
                    addr, reason
                )
            }

            Self::Protocol(ProtocolError::MacVerificationFailed) => {
                "MAC verification failed. The peer's intro key may be incorrect.".to_string()
            }

            _ => format!("{}", self),
        }
    }

    /// Whether this error ends the session it occurred on.
    ///
    /// Format problems only drop the datagram; authentication, key
    /// derivation and signature failures tear the session down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(ProtocolError::InvalidMessageLength { .. }) => false,
            Self::Protocol(ProtocolError::InvalidPayloadType { .. }) => false,
            Self::Protocol(ProtocolError::UnsupportedAddressFamily { .. }) => false,
            Self::Protocol(ProtocolError::PayloadTooLarge { .. }) => false,
            Self::Crypto(CryptoError::Decryption) => false,

            Self::Protocol(ProtocolError::MacVerificationFailed) => true,
            Self::Protocol(ProtocolError::SignatureVerificationFailed) => true,
            Self::Protocol(ProtocolError::HandshakeFailed { .. }) => true,
            Self::Crypto(_) => true,

            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Crypto(_) => 5,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for SSU operations
pub type Result<T> = std::result::Result<T, SsuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_errors_are_not_fatal() {
        let err = SsuError::from(ProtocolError::InvalidMessageLength {
            expected: 37,
            got: 12,
        });
        assert!(!err.is_fatal());

        let err = SsuError::from(ProtocolError::UnsupportedAddressFamily { size: 7 });
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_authentication_errors_are_fatal() {
        assert!(SsuError::from(ProtocolError::MacVerificationFailed).is_fatal());
        assert!(SsuError::from(CryptoError::KeyDerivation).is_fatal());
        assert!(SsuError::from(ProtocolError::SignatureVerificationFailed).is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        let err = SsuError::from(ConfigError::MissingField {
            field: "IntroKey".to_string(),
        });
        assert_eq!(err.exit_code(), 1);
        assert!(err.user_message().contains("IntroKey"));
    }
}
