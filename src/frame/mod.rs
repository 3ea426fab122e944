// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod command;

use std::{
    borrow::Cow,
    fmt::{self, Display},
};

/// A Modbus function code.
///
/// Only the register functions used to talk to PSUs are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// 03 (0x03) Read Holding Registers
    ReadHoldingRegisters,

    /// 06 (0x06) Write Single Register
    WriteSingleRegister,

    /// 16 (0x10) Write Multiple Registers
    WriteMultipleRegisters,

    /// Any other function code, e.g. carried by raw pass-through commands.
    Custom(u8),
}

impl FunctionCode {
    /// Create a new [`FunctionCode`] with `value`.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        match value {
            0x03 => Self::ReadHoldingRegisters,
            0x06 => Self::WriteSingleRegister,
            0x10 => Self::WriteMultipleRegisters,
            code => Self::Custom(code),
        }
    }

    /// Gets the [`u8`] value of the current [`FunctionCode`].
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::ReadHoldingRegisters => 0x03,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleRegisters => 0x10,
            Self::Custom(code) => code,
        }
    }
}

impl Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:0>2X}", self.value())
    }
}

/// A Modbus protocol register address, 0-based.
pub type Address = u16;

/// Modbus uses 16 bit for its data items.
///
/// Transmitted using a big-endian representation.
pub type Word = u16;

/// Number of items to process.
pub type Quantity = u16;

/// Largest register count a single read may request.
pub const MAX_READ_QUANTITY: Quantity = 125;

/// A request to a PSU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    /// A request to read multiple holding registers.
    /// The first parameter is the address of the first holding register to read.
    /// The second parameter is the number of holding registers to read.
    ReadHoldingRegisters(Address, Quantity),

    /// A request to write a single register.
    /// The first parameter is the address of the register to write.
    /// The second parameter is the value to write to the register.
    WriteSingleRegister(Address, Word),

    /// A request to write to multiple registers.
    /// The first parameter is the address of the first register to write.
    /// The second parameter is the vector of values to write to the registers.
    WriteMultipleRegisters(Address, Cow<'a, [Word]>),
}

impl Request<'_> {
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadHoldingRegisters(_, _) => FunctionCode::ReadHoldingRegisters,
            Self::WriteSingleRegister(_, _) => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleRegisters(_, _) => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Length of a well-formed response ADU including its CRC.
    #[must_use]
    pub fn expected_response_len(&self) -> usize {
        match self {
            // slave + function + byte count + data + crc
            Self::ReadHoldingRegisters(_, quantity) => 5 + 2 * usize::from(*quantity),
            // slave + function + address + value/quantity + crc
            Self::WriteSingleRegister(_, _) | Self::WriteMultipleRegisters(_, _) => 8,
        }
    }
}

/// Baud rates a PSU can be switched to.
///
/// The register value is the enum index used by the PSU firmware; value `0`
/// means "unsupported" and is treated as the default rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BaudRate {
    #[default]
    B19200,
    B38400,
    B57600,
    B115200,
}

impl BaudRate {
    #[must_use]
    pub const fn from_bps(bps: u32) -> Option<Self> {
        match bps {
            19_200 => Some(Self::B19200),
            38_400 => Some(Self::B38400),
            57_600 => Some(Self::B57600),
            115_200 => Some(Self::B115200),
            _ => None,
        }
    }

    #[must_use]
    pub const fn bps(self) -> u32 {
        match self {
            Self::B19200 => 19_200,
            Self::B38400 => 38_400,
            Self::B57600 => 57_600,
            Self::B115200 => 115_200,
        }
    }

    /// Looks up the rate encoded in the low byte of the baud register.
    #[must_use]
    pub const fn from_register_value(value: Word) -> Option<Self> {
        match value & 0xFF {
            0 | 1 => Some(Self::B19200),
            2 => Some(Self::B38400),
            3 => Some(Self::B57600),
            4 => Some(Self::B115200),
            _ => None,
        }
    }

    #[must_use]
    pub const fn register_value(self) -> Word {
        match self {
            Self::B19200 => 1,
            Self::B38400 => 2,
            Self::B57600 => 3,
            Self::B115200 => 4,
        }
    }

    #[must_use]
    pub fn is_default(self) -> bool {
        self == Self::default()
    }
}

impl Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bps().fmt(f)
    }
}
