// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::{fmt, io};

use thiserror::Error;

use crate::{frame::FunctionCode, slave::Slave};

/// Malformed frames and inputs that are rejected before or after hitting the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("short response: got {actual} bytes, expected at least {expected}")]
    ShortResponse { expected: usize, actual: usize },

    #[error("response from slave {response} when expecting {request}")]
    SlaveMismatch { request: Slave, response: Slave },

    #[error("got {actual} register data bytes when expecting {expected}")]
    ByteCountMismatch { expected: usize, actual: usize },

    #[error("empty request")]
    EmptyRequest,

    #[error("invalid hex input: {0}")]
    InvalidHex(String),
}

/// The terminal outcome of a failed transaction or command.
#[derive(Debug, Error)]
pub enum Error {
    /// No (or less than a minimal) response arrived within the quiet-gap timeout.
    #[error("timed out")]
    Timeout,

    #[error("crc check failed")]
    BadCrc,

    /// The response to a read echoed an unexpected function code.
    #[error("unexpected function code {0} in read response")]
    ReadErrorResponse(FunctionCode),

    /// The response to a write echoed an unexpected function code or register count.
    #[error("unexpected write response")]
    WriteErrorResponse,

    /// The PSU is blacklisted until its cool-down elapses.
    #[error("psu in timeout mode")]
    PsuTimeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("already configured")]
    AlreadyConfigured,

    #[error("unconfigured")]
    Unconfigured,

    #[error("no free psu slot")]
    TableFull,

    /// The sample history of a PSU could not be sized or allocated.
    #[error("sample history too large")]
    HistoryTooLarge,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    Transport(#[from] io::Error),
}

impl Error {
    /// The code reported to socket clients for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout => ErrorCode::Timeout,
            Self::BadCrc => ErrorCode::BadCrc,
            Self::ReadErrorResponse(_) => ErrorCode::ReadErrorResponse,
            Self::WriteErrorResponse => ErrorCode::WriteErrorResponse,
            Self::PsuTimeout => ErrorCode::PsuTimeout,
            Self::Protocol(_)
            | Self::AlreadyConfigured
            | Self::Unconfigured
            | Self::TableFull
            | Self::HistoryTooLarge
            | Self::InvalidCommand(_)
            | Self::Transport(_) => ErrorCode::Generic,
        }
    }

    /// Transient bus errors that are worth another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::BadCrc)
    }
}

/// Numeric error codes as transmitted in raw Modbus command responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Generic = 1,
    ReadErrorResponse = 2,
    WriteErrorResponse = 3,
    Timeout = 4,
    BadCrc = 5,
    PsuTimeout = 6,
}

impl ErrorCode {
    #[must_use]
    pub const fn new(value: u16) -> Option<Self> {
        let code = match value {
            1 => Self::Generic,
            2 => Self::ReadErrorResponse,
            3 => Self::WriteErrorResponse,
            4 => Self::Timeout,
            5 => Self::BadCrc,
            6 => Self::PsuTimeout,
            _ => return None,
        };
        Some(code)
    }

    #[must_use]
    pub const fn value(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Timeout => "timed out",
            Self::BadCrc => "crc check failed",
            Self::ReadErrorResponse => "unexpected read response",
            Self::WriteErrorResponse => "unexpected write response",
            Self::PsuTimeout => "psu in timeout mode",
            Self::Generic => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value(), self.description())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
