// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed hub errors with WebSocket close-code mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of hub failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    Conflict,
    NotFound,
    Closed,
    Internal,
}

impl ErrorKind {
    /// WebSocket close code used when this error terminates a handshake.
    ///
    /// Malformed input closes with `1003` (unsupported data), a duplicate
    /// active client closes with `1013` (try again later), everything else
    /// maps to `1011` (internal error).
    pub fn close_code(&self) -> u16 {
        match self {
            Self::InvalidArgument => 1003,
            Self::Conflict => 1013,
            Self::Unauthenticated
            | Self::PermissionDenied
            | Self::NotFound
            | Self::Closed
            | Self::Internal => 1011,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Conflict => "CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::Closed => "CLOSED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hub error: a kind plus the human-readable message sent back to clients.
///
/// `Display` renders the message alone so it can be embedded verbatim in the
/// `{"error": ..., "success": false}` frame.
#[derive(Debug, Clone)]
pub struct HubError {
    kind: ErrorKind,
    message: String,
}

impl HubError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn close_code(&self) -> u16 {
        self.kind.close_code()
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HubError {}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}
