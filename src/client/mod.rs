// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command executor: single Modbus transactions with retries and the
//! per PSU circuit breaker.

use std::{thread, time::Duration};

use bytes::Bytes;

use crate::{
    codec::rtu::{
        decode_read_holding_registers, decode_write_multiple_registers,
        decode_write_single_register, encode_request,
    },
    error::{Error, ProtocolError, Result},
    frame::{Address, BaudRate, Quantity, Request, Word},
    rackmon::{unix_now, Rackmon},
    slave::Slave,
    transport::Transaction,
};

/// Attempts per transaction for PSUs that are known or never probed.
pub const MAX_RETRIES: usize = 3;

/// Timeout used while switching baud rates.
pub const BAUDRATE_CMD_TIMEOUT: Duration = Duration::from_micros(500_000);

/// Options of a single executor call.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// Response length including CRC.
    pub expected_len: usize,
    pub timeout: Duration,
    pub baud: BaudRate,
    /// Discovery traffic is left out of the port statistics.
    pub scanning: bool,
}

impl Rackmon {
    /// Runs one raw transaction against the slave in `request[0]`.
    ///
    /// Returns the complete response, CRC included.
    pub fn modbus_command(
        &self,
        request: &[u8],
        expected_len: usize,
        timeout: Duration,
        baud: BaudRate,
    ) -> Result<Bytes> {
        self.execute(
            request,
            CallOptions {
                expected_len,
                timeout,
                baud,
                scanning: false,
            },
        )
    }

    pub(crate) fn execute(&self, request: &[u8], opts: CallOptions) -> Result<Bytes> {
        let slave = Slave(*request.first().ok_or(ProtocolError::EmptyRequest)?);
        let port = self.port_for(slave)?;

        let (attempts, delay) = {
            let mut state = self.lock_state();
            let probed = state.probed.contains(&slave);
            let attempts = match state.psus.get_mut(slave) {
                Some(psu) => {
                    psu.check_comms(unix_now())?;
                    MAX_RETRIES
                }
                None if !probed => MAX_RETRIES,
                None => 1,
            };
            (attempts, state.min_delay)
        };

        let tx = Transaction {
            request,
            expected_len: opts.expected_len,
            timeout: opts.timeout,
            baud: opts.baud,
            tally: !opts.scanning,
        };
        let mut result = Err(Error::Timeout);
        for attempt in 1..=attempts {
            result = port.execute(&tx);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            match &result {
                Ok(_) => break,
                Err(err) => {
                    log::debug!("{slave}: attempt {attempt}/{attempts} failed: {err}");
                    self.tally_failure(slave, err);
                    if !err.is_transient() {
                        break;
                    }
                }
            }
        }

        if let Some(psu) = self.lock_state().psus.get_mut(slave) {
            psu.update_comms(unix_now(), result.is_ok());
        }
        result
    }

    fn tally_failure(&self, slave: Slave, err: &Error) {
        let mut state = self.lock_state();
        let Some(psu) = state.psus.get_mut(slave) else {
            return;
        };
        match err {
            Error::Timeout => psu.timeout_errors += 1,
            Error::BadCrc => psu.crc_errors += 1,
            _ => {}
        }
    }

    /// Reads `quantity` holding registers, returning their bytes in wire order.
    pub fn read_holding_registers(
        &self,
        slave: Slave,
        address: Address,
        quantity: Quantity,
        baud: BaudRate,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.read_registers(slave, address, quantity, baud, timeout, false)
    }

    pub(crate) fn read_registers(
        &self,
        slave: Slave,
        address: Address,
        quantity: Quantity,
        baud: BaudRate,
        timeout: Duration,
        scanning: bool,
    ) -> Result<Bytes> {
        let request = Request::ReadHoldingRegisters(address, quantity);
        let adu = encode_request(slave, &request);
        let response = self.execute(
            &adu,
            CallOptions {
                expected_len: request.expected_response_len(),
                timeout,
                baud,
                scanning,
            },
        )?;
        decode_read_holding_registers(slave, quantity, &response)
    }

    /// Writes one register and returns the value echoed by the PSU.
    pub fn write_single_register(
        &self,
        slave: Slave,
        address: Address,
        value: Word,
        baud: BaudRate,
        timeout: Duration,
    ) -> Result<Word> {
        let request = Request::WriteSingleRegister(address, value);
        let adu = encode_request(slave, &request);
        let response = self.modbus_command(&adu, request.expected_response_len(), timeout, baud)?;
        decode_write_single_register(slave, address, &response)
    }

    pub fn write_multiple_registers(
        &self,
        slave: Slave,
        address: Address,
        values: &[Word],
        baud: BaudRate,
        timeout: Duration,
    ) -> Result<()> {
        let quantity = Quantity::try_from(values.len())
            .map_err(|_| Error::InvalidCommand(format!("too many registers: {}", values.len())))?;
        let request = Request::WriteMultipleRegisters(address, values.into());
        let adu = encode_request(slave, &request);
        let response = self.modbus_command(&adu, request.expected_response_len(), timeout, baud)?;
        decode_write_multiple_registers(slave, address, quantity, &response)
    }

    /// Brings the PSU to the desired baud rate if the whole fleet supports it.
    ///
    /// Returns the baud rate to talk to the PSU with.
    pub fn check_psu_baudrate(&self, slave: Slave) -> Result<BaudRate> {
        let desired = self.settings().desired_baudrate;
        let current = {
            let state = self.lock_state();
            let Some(psu) = state.psus.get(slave) else {
                return Ok(BaudRate::default());
            };
            if psu.baudrate() == desired {
                return Ok(desired);
            }
            if !state.psus.iter().all(|psu| psu.supports_baudrate) {
                return Ok(psu.baudrate());
            }
            psu.baudrate()
        };
        self.change_baudrate(slave, current, desired)
    }

    fn change_baudrate(&self, slave: Slave, current: BaudRate, desired: BaudRate) -> Result<BaudRate> {
        let register = self.settings().addressing.scheme.baudrate_register();
        let echoed = self
            .write_single_register(
                slave,
                register,
                desired.register_value(),
                current,
                BAUDRATE_CMD_TIMEOUT,
            )
            .map_err(|err| {
                log::warn!("{slave}: failed to change baud rate from {current} to {desired}: {err}");
                err
            })?;
        let Some(baud) = BaudRate::from_register_value(echoed) else {
            log::warn!("{slave}: echoed unknown baud rate value {echoed:#06x}");
            return Err(Error::WriteErrorResponse);
        };
        if let Some(psu) = self.lock_state().psus.get_mut(slave) {
            psu.baudrate = baud;
        }
        log::info!("{slave}: baud rate changed from {current} to {baud}");
        Ok(baud)
    }

    /// Switches every PSU that runs at a non-default baud rate back to the default.
    ///
    /// Returns `false` if any PSU could not be restored.
    pub fn restore_default_baudrates(&self) -> bool {
        let targets: Vec<(Slave, BaudRate)> = self
            .lock_state()
            .psus
            .iter()
            .filter(|psu| !psu.baudrate().is_default())
            .map(|psu| (psu.slave(), psu.baudrate()))
            .collect();
        let mut restored = true;
        for (slave, current) in targets {
            if let Err(err) = self.change_baudrate(slave, current, BaudRate::default()) {
                log::warn!("{slave}: baud rate left at {current}: {err}");
                restored = false;
            }
        }
        restored
    }
}
