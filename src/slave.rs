// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slave addresses and the rack addressing schemes that derive them.

use std::fmt;

use crate::frame::Address;

pub type SlaveId = u8;

/// A single byte for addressing Modbus slave devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slave(pub SlaveId);

impl From<SlaveId> for Slave {
    fn from(from: SlaveId) -> Self {
        Slave(from)
    }
}

impl From<Slave> for SlaveId {
    fn from(from: Slave) -> Self {
        from.0
    }
}

impl fmt::Display for Slave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:0>2X}", self.0)
    }
}

/// Physical position of a PSU in the rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PsuLocation {
    pub rack: u8,
    pub shelf: u8,
    pub psu: u8,
}

impl PsuLocation {
    #[must_use]
    pub const fn new(rack: u8, shelf: u8, psu: u8) -> Self {
        Self { rack, shelf, psu }
    }
}

impl fmt::Display for PsuLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rack {} shelf {} psu {}", self.rack, self.shelf, self.psu)
    }
}

const BASE_ADDRESS: SlaveId = 0xA0;

/// The two supported rack layouts, selected once from the configured rack version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressingScheme {
    /// Legacy layout: `0xA0 | rack << 3 | shelf << 2 | psu`.
    #[default]
    V2,

    /// Three rack layout: `0xA0 + rack * 0x10 + shelf * 0x08 + psu`.
    V3,
}

impl AddressingScheme {
    #[must_use]
    pub const fn from_version(version: u8) -> Option<Self> {
        match version {
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    #[must_use]
    pub const fn racks(self) -> u8 {
        3
    }

    #[must_use]
    pub const fn shelves(self) -> u8 {
        2
    }

    #[must_use]
    pub const fn psus_per_shelf(self) -> u8 {
        match self {
            Self::V2 => 3,
            Self::V3 => 4,
        }
    }

    /// Register polled during discovery.
    #[must_use]
    pub const fn status_register(self) -> Address {
        0x68
    }

    /// Register holding the baud rate enum value in its low byte.
    #[must_use]
    pub const fn baudrate_register(self) -> Address {
        0xA3
    }

    /// First of the two registers that hold the UNIX time, high word first.
    #[must_use]
    pub const fn timestamp_register(self) -> Address {
        0x012A
    }

    fn contains(self, location: PsuLocation) -> bool {
        location.rack < self.racks()
            && location.shelf < self.shelves()
            && location.psu < self.psus_per_shelf()
    }

    #[must_use]
    pub fn encode(self, location: PsuLocation) -> Option<Slave> {
        if !self.contains(location) {
            return None;
        }
        let PsuLocation { rack, shelf, psu } = location;
        let addr = match self {
            Self::V2 => BASE_ADDRESS | (rack & 0x3) << 3 | (shelf & 0x1) << 2 | (psu & 0x3),
            Self::V3 => BASE_ADDRESS + rack * 0x10 + shelf * 0x08 + psu,
        };
        Some(Slave(addr))
    }

    #[must_use]
    pub fn decode(self, slave: Slave) -> Option<PsuLocation> {
        let offset = slave.0.checked_sub(BASE_ADDRESS)?;
        let location = match self {
            Self::V2 => PsuLocation::new((offset >> 3) & 0x3, (offset >> 2) & 0x1, offset & 0x3),
            Self::V3 => PsuLocation::new(offset >> 4, (offset >> 3) & 0x1, offset & 0x7),
        };
        // Reject addresses that alias into unused bits of the layout.
        (self.contains(location) && self.encode(location) == Some(slave)).then_some(location)
    }
}

/// Addressing scheme plus the rack swap quirk of one hardware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Addressing {
    pub scheme: AddressingScheme,
    pub swap_racks: bool,
}

impl Addressing {
    #[must_use]
    pub const fn new(scheme: AddressingScheme, swap_racks: bool) -> Self {
        Self { scheme, swap_racks }
    }

    fn swap(self, mut location: PsuLocation) -> PsuLocation {
        if self.swap_racks {
            location.rack = match location.rack {
                0 => 1,
                1 => 0,
                rack => rack,
            };
        }
        location
    }

    #[must_use]
    pub fn encode(self, location: PsuLocation) -> Option<Slave> {
        self.scheme.encode(self.swap(location))
    }

    #[must_use]
    pub fn decode(self, slave: Slave) -> Option<PsuLocation> {
        self.scheme.decode(slave).map(|location| self.swap(location))
    }

    /// Number of distinct locations in the layout.
    #[must_use]
    pub fn capacity(self) -> usize {
        let s = self.scheme;
        usize::from(s.racks()) * usize::from(s.shelves()) * usize::from(s.psus_per_shelf())
    }

    /// Dense index of a location, used by the ignore bitmap.
    #[must_use]
    pub fn index(self, location: PsuLocation) -> usize {
        let s = self.scheme;
        (usize::from(location.rack) * usize::from(s.shelves()) + usize::from(location.shelf))
            * usize::from(s.psus_per_shelf())
            + usize::from(location.psu)
    }

    /// Every location of the layout in rack, shelf, psu order.
    pub fn locations(self) -> impl Iterator<Item = PsuLocation> {
        let s = self.scheme;
        (0..s.racks()).flat_map(move |rack| {
            (0..s.shelves()).flat_map(move |shelf| {
                (0..s.psus_per_shelf()).map(move |psu| PsuLocation::new(rack, shelf, psu))
            })
        })
    }
}
