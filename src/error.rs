//! Error types for the link/circuit/stream engine
//!
//! This module provides the error taxonomy with:
//! - Detailed error variants for each failure class
//! - Error classification (fatal vs retryable)
//! - Error codes for programmatic handling

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Transport errors (1xx)
    TransportFailed = 100,
    LinkClosed = 101,
    Timeout = 102,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    UnknownCommand = 201,
    DigestMismatch = 202,
    Unrecognized = 203,
    PayloadTooLarge = 204,

    // Circuit errors (3xx)
    CircuitDestroyed = 300,
    CircuitClosed = 301,

    // Handshake errors (4xx)
    KeyConfirmation = 400,
    HandshakeFailed = 401,

    // Stream errors (5xx)
    StreamNotOpen = 500,
    StreamClosed = 501,
    StreamOpenFailed = 502,

    // Selection errors (6xx)
    NoEligibleRelay = 600,

    // Configuration errors (8xx)
    ConfigError = 800,

    // Internal errors (9xx)
    ResourceExhausted = 900,
}

/// Main error type for the engine
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Transport Errors =====
    #[error("I/O error on link: {0}")]
    Io(String),

    #[error("Link closed")]
    LinkClosed,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    // ===== Protocol Errors =====
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown {kind} command: {value}")]
    UnknownCommand { kind: &'static str, value: u8 },

    #[error("Relay cell not recognized (non-zero recognized field)")]
    Unrecognized,

    #[error("Digest mismatch in relay cell")]
    DigestMismatch,

    #[error("Relay payload of {0} bytes exceeds the maximum")]
    PayloadTooLarge(usize),

    // ===== Circuit Errors =====
    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Circuit closed")]
    CircuitClosed,

    // ===== Handshake Errors =====
    #[error("Key confirmation hash mismatch")]
    KeyConfirmation,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Stream Errors =====
    #[error("Stream is not open")]
    StreamNotOpen,

    #[error("Stream closed after {written} bytes were written")]
    StreamClosed { written: usize },

    #[error("Stream open failed: {0}")]
    StreamOpenFailed(String),

    // ===== Selection Errors =====
    #[error("No eligible relay for {0} position")]
    NoEligibleRelay(&'static str),

    // ===== Configuration Errors =====
    #[error("Parse error: {0}")]
    Parse(String),

    // ===== Internal Errors =====
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            // Transport
            TorError::Io(_) => ErrorCode::TransportFailed,
            TorError::LinkClosed => ErrorCode::LinkClosed,
            TorError::Timeout(_) => ErrorCode::Timeout,

            // Protocol
            TorError::Protocol(_) => ErrorCode::ProtocolViolation,
            TorError::UnknownCommand { .. } => ErrorCode::UnknownCommand,
            TorError::Unrecognized => ErrorCode::Unrecognized,
            TorError::DigestMismatch => ErrorCode::DigestMismatch,
            TorError::PayloadTooLarge(_) => ErrorCode::PayloadTooLarge,

            // Circuit
            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::CircuitClosed => ErrorCode::CircuitClosed,

            // Handshake
            TorError::KeyConfirmation => ErrorCode::KeyConfirmation,
            TorError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,

            // Stream
            TorError::StreamNotOpen => ErrorCode::StreamNotOpen,
            TorError::StreamClosed { .. } => ErrorCode::StreamClosed,
            TorError::StreamOpenFailed(_) => ErrorCode::StreamOpenFailed,

            // Selection
            TorError::NoEligibleRelay(_) => ErrorCode::NoEligibleRelay,

            // Config
            TorError::Parse(_) => ErrorCode::ConfigError,

            // Internal
            TorError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        }
    }

    /// Whether this error is fatal to the owning circuit or link
    ///
    /// The keystream and rolling digest cannot be rewound, so after one of
    /// these the circuit (or the whole link, for transport faults) must be
    /// torn down and rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::Io(_)
                | TorError::LinkClosed
                | TorError::Protocol(_)
                | TorError::UnknownCommand { .. }
                | TorError::Unrecognized
                | TorError::DigestMismatch
                | TorError::CircuitDestroyed { .. }
                | TorError::KeyConfirmation
                | TorError::HandshakeFailed(_)
        )
    }

    /// Whether the caller may retry on a fresh stream or circuit
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::Io(_)
                | TorError::LinkClosed
                | TorError::Timeout(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::CircuitClosed
                | TorError::HandshakeFailed(_)
                | TorError::KeyConfirmation
                | TorError::StreamNotOpen
                | TorError::StreamClosed { .. }
                | TorError::StreamOpenFailed(_)
        )
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = crate::protocol::DestroyReason::from(reason)
            .name()
            .to_string();

        TorError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        TorError::Io(err.to_string())
    }
}
