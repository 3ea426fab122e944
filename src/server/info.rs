// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human readable rendering of the stored register samples.

use std::io::{self, Write};

use crate::{
    frame::{command::ValueFormat, Address},
    psu::{PsuRecord, Reading},
};

/// Name of a well known PSU register.
#[must_use]
pub fn register_description(register: Address) -> Option<&'static str> {
    let description = match register {
        0x00 => "MFG_MODEL",
        0x10 => "MFG_DATE",
        0x20 => "FB part#",
        0x30 => "HW Revision",
        0x38 => "FW Revision",
        0x40 => "MFR_SERIAL",
        0x60 => "Workorder #",
        0x68 => "PSU Status register",
        0x69 => "Battery Status register",
        0x6A => "Reserved",
        0x80 => "Input Voltage AC",
        0x82 => "Input Current AC",
        0x84 => "Battery Voltage",
        0x86 => "Battery Current output",
        0x88 => "Battery Current Input",
        0x8A => "Output Voltage (main converter)",
        0x8C => "Output Current (main converter)",
        0x8E => "IT load Voltage Output",
        0x90 => "IT load Current Output",
        0x92 => "Bulk Cap Voltage",
        0x94 => "Input Power",
        0x96 => "Output Power",
        0x98 => "RPM fan0",
        0x9A => "RPM fan1",
        0x9C => "Set fan speed",
        0x9E => "Temp0",
        0xA0 => "Temp1",
        0x81..=0x9F if register % 2 == 1 => "Reserved",
        0xD0 => "General Alarm",
        0xD1 => "PFC Alarm",
        0xD2 => "LLC Alarm",
        0xD3 => "Current Feed Alarm",
        0xD4 => "Auxiliary Alarm",
        0xD5 => "Battery Charger Alarm",
        0xD6 => "Reserved",
        0xD7 => "Temperature Alarm",
        0xD8 => "Fan Alarm",
        _ => return None,
    };
    Some(description)
}

/// Bit descriptions of the status and alarm registers, most significant first.
#[must_use]
pub fn status_bits(register: Address) -> Option<&'static [(u8, &'static str)]> {
    let bits: &'static [(u8, &'static str)] = match register {
        0x68 => &[
            (8, "SoH Dicharge"),
            (7, "SoH Requested"),
            (6, "Battery Alarm Set for BBU Fail or BBU voltage =< 26 VDC"),
            (5, "Fan Alarm"),
            (4, "Temp Alarm   Alarm set at shutdown temp"),
            (3, "Current Feed (Boost Converter) Fail"),
            (2, "Battery Charger Fail"),
            (1, "Aux 54V Converter Fail"),
            (0, "Main Converter Fail"),
        ],
        0x69 => &[
            (2, "End of Life"),
            (1, "Low Voltage  BBU Voltage =< 33.8"),
            (0, "BBU Fail"),
        ],
        0xD0 => &[
            (7, "Com"),
            (6, "Fan"),
            (5, "Temp"),
            (4, "BC"),
            (3, "Auxiliary"),
            (2, "CF"),
            (1, "LLC"),
            (0, "PFC"),
        ],
        0xD1 => &[
            (11, "LLC Enabled"),
            (10, "Input Relay on"),
            (9, "!(Bulk_OK)"),
            (8, "AC_OK"),
            (3, "LLC Enabled"),
            (1, "OVP (AC input over voltage protection asserted)"),
            (0, "UVP (AC input under voltage protection asserted)"),
        ],
        0xD2 => &[
            (10, "Oring Fail"),
            (9, "2ndary DSP Failure"),
            (8, "DC/DC failure"),
            (2, "OCP (Output Over Current protection asserted)"),
            (1, "OVP (Output Over Voltage protection asserted)"),
            (0, "UVP (Output Under Voltage protection asserted)"),
        ],
        0xD3 => &[
            (8, "CF (Failure Failure with CF)"),
            (4, "OPP (Over Power Protection [more than 4200W input to CF])"),
            (3, "Battery_UVP"),
            (2, "Battery_OVP"),
            (1, "Bulk_UVP"),
            (0, "Bulk_OVP"),
        ],
        0xD4 => &[
            (8, "Aux alarm (Failure with auxiliary converter)"),
            (2, "OCP (Over Current Protection asserted)"),
            (1, "OVP (Output Over Voltage protection asserted)"),
            (0, "UVP (Output Under Voltage Protection asserted)"),
        ],
        0xD5 => &[
            (8, "Charger alarm (Charger failure)"),
            (2, "Timeout alarm (Charger ON for more than 5hrs)"),
            (1, "UVP (Output Under Voltage Protection asserted)"),
            (0, "OVP (Output Overvoltage Protection asserted)"),
        ],
        0xD7 => &[
            (7, "PFC temp alarm"),
            (6, "LLC temp alarm"),
            (5, "CF temp alarm"),
            (4, "Aux temp alarm"),
            (3, "Sync Rectifier temp alarm"),
            (2, "Oring temp alarm"),
            (1, "Inlet temp alarm"),
            (0, "Outlet temp alarm"),
        ],
        0xD8 => &[(0, "Fan alarm (Fan failure)")],
        0xD9 => &[(0, "Internal Communication alarm (Internal Communication fail)")],
        _ => return None,
    };
    Some(bits)
}

fn unsigned_value(data: &[u8]) -> u64 {
    data.iter()
        .fold(0u64, |acc, &byte| acc.wrapping_shl(8) | u64::from(byte))
}

/// Big-endian two's complement value scaled down by `2^fraction_bits`.
fn fixed_point(data: &[u8], fraction_bits: u8) -> f64 {
    let mut value = data.iter().fold(0f64, |acc, &byte| acc * 256.0 + f64::from(byte));
    if data.first().is_some_and(|msb| msb & 0x80 != 0) {
        let bits = i32::try_from(8 * data.len()).unwrap_or(i32::MAX);
        value -= 2f64.powi(bits);
    }
    value / 2f64.powi(i32::from(fraction_bits))
}

fn write_reading<W: Write>(
    out: &mut W,
    register: Address,
    format: ValueFormat,
    reading: &Reading<'_>,
) -> io::Result<()> {
    match format {
        ValueFormat::Ascii => {
            let text: String = reading.data.iter().map(|&b| char::from(b)).collect();
            write!(out, "{text}  ")
        }
        ValueFormat::FixedPoint(bits) => write!(out, "{:.2}  ", fixed_point(reading.data, bits)),
        #[allow(clippy::cast_possible_wrap)]
        ValueFormat::Decimal => write!(out, "{}  ", unsigned_value(reading.data) as i64),
        ValueFormat::StatusTable => {
            let value = unsigned_value(reading.data);
            writeln!(out, "{value:04x}")?;
            let Some(bits) = status_bits(register) else {
                return writeln!(out, "Didn't implement parser yet.");
            };
            for &(bit, description) in bits {
                let set = (value >> bit) & 1;
                let mark = if set == 1 { '+' } else { ' ' };
                writeln!(out, "       {mark} [{set}] {description}")?;
            }
            Ok(())
        }
        ValueFormat::Hex => {
            for byte in reading.data {
                write!(out, "{byte:02x}")?;
            }
            write!(out, "  ")
        }
    }
}

/// Writes the info block of one PSU.
pub fn write_psu_info<W: Write>(out: &mut W, psu: &PsuRecord) -> io::Result<()> {
    writeln!(out, "PSU Addr {:02x}", psu.slave().0)?;
    for range in psu.ranges() {
        let interval = range.interval();
        let format = interval.flags.format();
        match register_description(interval.begin) {
            Some(description) => write!(out, "  <0x{:04X}> {description:<32} : ", interval.begin)?,
            None => write!(out, "  <0x{:04X}>{:34}: ", interval.begin, "")?,
        }
        for reading in range.readings() {
            write_reading(out, interval.begin, format, &reading)?;
        }
        if format != ValueFormat::StatusTable {
            writeln!(out)?;
        }
    }
    writeln!(out)
}
