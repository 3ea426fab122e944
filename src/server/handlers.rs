// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{io::Write, time::Duration};

use serde::Serialize;

use super::info::write_psu_info;
use crate::{
    codec::{
        command::{write_raw_error, write_raw_response, MAX_RAW_RESPONSE_LEN},
        encode_hex,
    },
    error::{ProtocolError, Result},
    frame::command::{Command, RawModbus},
    rackmon::{unix_now, Rackmon},
    slave::Slave,
};

#[derive(Debug, Serialize)]
struct PsuData {
    addr: u8,
    crc_fails: u32,
    timeouts: u32,
    now: u64,
    ranges: Vec<RangeData>,
}

#[derive(Debug, Serialize)]
struct RangeData {
    begin: u16,
    readings: Vec<ReadingData>,
}

#[derive(Debug, Serialize)]
struct ReadingData {
    time: u32,
    data: String,
}

impl Rackmon {
    /// Runs one decoded command and writes its response to `out`.
    pub fn handle_command<W: Write>(&self, command: &Command, out: &mut W) -> Result<()> {
        log::debug!("processing command {:?}", command.command_type());
        match command {
            Command::RawModbus(raw) => self.raw_modbus(raw, out),
            Command::SetConfig(config) => self.configure(config.clone()),
            Command::DumpDataJson => self.dump_data_json(out),
            Command::DumpDataInfo => self.dump_data_info(out),
            Command::PauseMonitoring => {
                let was_paused = self.set_paused(true);
                out.write_all(&[u8::from(was_paused)])?;
                Ok(())
            }
            Command::StartMonitoring => {
                let was_started = !self.set_paused(false);
                out.write_all(&[u8::from(was_started)])?;
                Ok(())
            }
            Command::DumpStatus => self.dump_status(out),
            Command::ForceScan => self.trigger_scan(out),
        }
    }

    fn raw_modbus<W: Write>(&self, raw: &RawModbus, out: &mut W) -> Result<()> {
        let slave = Slave(*raw.data.first().ok_or(ProtocolError::EmptyRequest)?);
        let expected_len = match raw.expected_response_len {
            0 => MAX_RAW_RESPONSE_LEN,
            len => usize::from(len),
        };
        let timeout = match raw.custom_timeout_ms {
            0 => self.settings().timeout,
            ms => Duration::from_millis(ms.into()),
        };
        let result = self
            .check_psu_baudrate(slave)
            .and_then(|baud| self.modbus_command(&raw.data, expected_len, timeout, baud));
        match result {
            Ok(response) => write_raw_response(out, &response)?,
            Err(err) => {
                log::debug!("raw modbus command to {slave} failed: {err}");
                write_raw_error(out, err.code())?;
            }
        }
        Ok(())
    }

    fn dump_data_json<W: Write>(&self, out: &mut W) -> Result<()> {
        let now = unix_now();
        let state = self.lock_state();
        if state.config.is_none() {
            out.write_all(b"[]")?;
            return Ok(());
        }
        let psus: Vec<PsuData> = state
            .psus
            .iter()
            .map(|psu| PsuData {
                addr: psu.slave().0,
                crc_fails: psu.crc_errors,
                timeouts: psu.timeout_errors,
                now,
                ranges: psu
                    .ranges()
                    .iter()
                    .map(|range| RangeData {
                        begin: range.interval().begin,
                        readings: range
                            .readings()
                            .map(|reading| ReadingData {
                                time: reading.timestamp,
                                data: encode_hex(reading.data),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        drop(state);
        serde_json::to_writer(&mut *out, &psus).map_err(std::io::Error::from)?;
        Ok(())
    }

    fn dump_data_info<W: Write>(&self, out: &mut W) -> Result<()> {
        let state = self.lock_state();
        if state.config.is_none() {
            out.write_all(b"Unconfigured\n")?;
            return Ok(());
        }
        for psu in state.psus.iter() {
            write_psu_info(out, psu)?;
        }
        Ok(())
    }

    fn dump_status<W: Write>(&self, out: &mut W) -> Result<()> {
        let now = unix_now();
        let state = self.lock_state();
        if state.config.is_none() {
            out.write_all(b"Unconfigured\n")?;
            return Ok(());
        }
        writeln!(out, "Monitored PSUs:")?;
        for psu in state.psus.iter() {
            write!(
                out,
                "PSU addr {:02x} - crc errors: {}, timeouts: {}, baud rate: {}",
                psu.slave().0,
                psu.crc_errors,
                psu.timeout_errors,
                psu.baudrate()
            )?;
            if let Some(remaining) = psu.timeout_remaining(now) {
                write!(out, " (in timeout mode for the next {remaining} seconds)")?;
            }
            writeln!(out)?;
        }
        write!(out, "Active on last scan: ")?;
        for slave in &state.active {
            write!(out, "{:02x} ", slave.0)?;
        }
        writeln!(out)?;
        writeln!(
            out,
            "Next scan in {} seconds.",
            state.next_scan.saturating_sub(now)
        )?;
        Ok(())
    }

    fn trigger_scan<W: Write>(&self, out: &mut W) -> Result<()> {
        if self.force_scan().is_ok() {
            out.write_all(b"Triggering PSU scan...\n")?;
        } else {
            out.write_all(b"Unconfigured\n")?;
        }
        Ok(())
    }
}
