// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Commands accepted on the local command socket.

use std::fmt;

use super::{Address, Quantity};

/// Numeric tag in front of every command body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandType {
    RawModbus = 1,
    SetConfig = 2,
    DumpDataJson = 3,
    PauseMonitoring = 4,
    StartMonitoring = 5,
    DumpStatus = 6,
    ForceScan = 7,
    DumpDataInfo = 8,
}

impl CommandType {
    #[must_use]
    pub const fn new(value: u16) -> Option<Self> {
        let command_type = match value {
            1 => Self::RawModbus,
            2 => Self::SetConfig,
            3 => Self::DumpDataJson,
            4 => Self::PauseMonitoring,
            5 => Self::StartMonitoring,
            6 => Self::DumpStatus,
            7 => Self::ForceScan,
            8 => Self::DumpDataInfo,
            _ => return None,
        };
        Some(command_type)
    }

    #[must_use]
    pub const fn value(self) -> u16 {
        self as u16
    }
}

/// Bit flags of a [`MonitorInterval`].
///
/// The low bits control recording, the high nibble selects how
/// `DUMP_DATA_INFO` renders the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorFlags(pub u32);

/// How a monitored register range is rendered for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Hex,
    Ascii,
    /// Signed fixed point with the given number of fractional bits.
    FixedPoint(u8),
    Decimal,
    /// Decoded bit by bit against a table of status descriptions.
    StatusTable,
}

impl MonitorFlags {
    /// Only record a sample when it differs from the previous one.
    pub const ONLY_CHANGES: u32 = 0x0001;

    const FORMAT_MASK: u32 = 0xF000;
    const FORMAT_ASCII: u32 = 0x8000;
    const FORMAT_FIXED_POINT: u32 = 0x4000;
    const FORMAT_DECIMAL: u32 = 0x2000;
    const FORMAT_TABLE: u32 = 0x1000;

    #[must_use]
    pub const fn only_changes(self) -> bool {
        self.0 & Self::ONLY_CHANGES != 0
    }

    #[must_use]
    pub const fn format(self) -> ValueFormat {
        match self.0 & Self::FORMAT_MASK {
            Self::FORMAT_ASCII => ValueFormat::Ascii,
            Self::FORMAT_FIXED_POINT => ValueFormat::FixedPoint(((self.0 >> 8) & 0x0F) as u8),
            Self::FORMAT_DECIMAL => ValueFormat::Decimal,
            Self::FORMAT_TABLE => ValueFormat::StatusTable,
            _ => ValueFormat::Hex,
        }
    }
}

impl fmt::Display for MonitorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// A contiguous register range that is polled on every PSU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorInterval {
    pub begin: Address,
    pub len: Quantity,
    /// Number of samples kept in the history ring.
    pub keep: u32,
    pub flags: MonitorFlags,
}

impl MonitorInterval {
    #[must_use]
    pub const fn new(begin: Address, len: Quantity, keep: u32, flags: u32) -> Self {
        Self {
            begin,
            len,
            keep,
            flags: MonitorFlags(flags),
        }
    }
}

/// The register ranges configured once per process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MonitoringConfig {
    pub intervals: Vec<MonitorInterval>,
}

/// A Modbus request forwarded verbatim to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawModbus {
    /// Expected response length including CRC, `0` for "up to the maximum".
    pub expected_response_len: u16,
    /// Overrides the daemon's transaction timeout when non-zero.
    pub custom_timeout_ms: u16,
    /// Request without CRC; `data[0]` is the slave address.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RawModbus(RawModbus),
    SetConfig(MonitoringConfig),
    DumpDataJson,
    DumpDataInfo,
    PauseMonitoring,
    StartMonitoring,
    DumpStatus,
    ForceScan,
}

impl Command {
    #[must_use]
    pub const fn command_type(&self) -> CommandType {
        match self {
            Self::RawModbus(_) => CommandType::RawModbus,
            Self::SetConfig(_) => CommandType::SetConfig,
            Self::DumpDataJson => CommandType::DumpDataJson,
            Self::DumpDataInfo => CommandType::DumpDataInfo,
            Self::PauseMonitoring => CommandType::PauseMonitoring,
            Self::StartMonitoring => CommandType::StartMonitoring,
            Self::DumpStatus => CommandType::DumpStatus,
            Self::ForceScan => CommandType::ForceScan,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_formats() {
        assert_eq!(MonitorFlags(0x8000).format(), ValueFormat::Ascii);
        assert_eq!(MonitorFlags(0x4601).format(), ValueFormat::FixedPoint(6));
        assert_eq!(MonitorFlags(0x2000).format(), ValueFormat::Decimal);
        assert_eq!(MonitorFlags(0x1001).format(), ValueFormat::StatusTable);
        assert_eq!(MonitorFlags(0x0001).format(), ValueFormat::Hex);
        assert!(MonitorFlags(0x1001).only_changes());
        assert!(!MonitorFlags(0x8000).only_changes());
    }

    #[test]
    fn command_type_tags() {
        for value in 1..=8 {
            assert_eq!(CommandType::new(value).unwrap().value(), value);
        }
        assert_eq!(CommandType::new(0), None);
        assert_eq!(CommandType::new(9), None);
        assert_eq!(Command::ForceScan.command_type(), CommandType::ForceScan);
    }
}
