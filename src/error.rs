//! Error types and result definitions for the tuyalink crate.
//! Mirrors the protocol's failure taxonomy: framing, integrity, crypto,
//! negotiation and connection-liveness errors.

use thiserror::Error;

/// All errors surfaced by the protocol codec and the connection driver.
#[derive(Error, Debug, Clone)]
pub enum TuyaError {
    /// Standard IO error (network, timeout, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Malformed frame: bad magic, bad declared length, truncated trailer
    #[error("Framing error: {0}")]
    Framing(String),

    /// CRC32 check failed for a received 55AA frame
    #[error("CRC mismatch")]
    CrcMismatch,

    /// HMAC-SHA256 trailer verification failed (v3.4)
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// AES-GCM tag verification failed (v3.5)
    #[error("AEAD authentication failed")]
    AuthenticationFailed,

    /// PKCS#7 padding validation failed after ECB decryption
    #[error("Invalid padding")]
    InvalidPadding,

    /// Cipher key is not 16 bytes
    #[error("Invalid key length")]
    InvalidKeyLength,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Session-key negotiation: device HMAC did not match our nonce
    #[error("Negotiation HMAC mismatch")]
    NegotiationMismatch,

    /// Session-key negotiation failed for a non-cryptographic reason
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Heartbeat supervision declared the connection dead
    #[error("Connection dead (missed heartbeats or reader idle)")]
    ConnectionDead,

    /// Request timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// Device is currently unreachable or disconnected
    #[error("Device offline")]
    Offline,
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    /// True for checksum/HMAC/AEAD failures and the crypto errors that
    /// propagate as integrity failures. These drop the offending frame but
    /// are never fatal to the connection by themselves.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            TuyaError::CrcMismatch
                | TuyaError::HmacMismatch
                | TuyaError::AuthenticationFailed
                | TuyaError::InvalidPadding
                | TuyaError::InvalidKeyLength
        )
    }

    /// True for errors recoverable by waiting for more bytes or skipping
    /// a single malformed frame.
    pub fn is_framing(&self) -> bool {
        matches!(self, TuyaError::Framing(_))
    }

    /// True only for the condition that requires transport teardown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TuyaError::ConnectionDead)
    }
}
