// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Background scanner and poller.
//!
//! Every iteration rescans the bus when the scan is due, allocates records
//! for new PSUs, pulls the configured register ranges of every record and
//! pushes the current time to the PSUs once an hour.

use std::{
    io::{self, Write as _},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use byteorder::{BigEndian, ByteOrder as _};

use crate::{
    error::Error,
    frame::{command::MonitorInterval, BaudRate},
    psu::MAX_TRACKED_PSUS,
    rackmon::{unix_now, Rackmon},
    slave::Slave,
};

/// Seconds between two discovery scans.
pub const SCAN_INTERVAL: u64 = 120;

/// Seconds between two timestamp pushes.
pub const TIMESTAMP_INTERVAL: u64 = 3600;

/// Pause between the reads of two PSUs.
pub const PSU_DELAY: Duration = Duration::from_secs(3);

/// Upper bound of a single poller sleep.
pub const MAX_IDLE: Duration = Duration::from_secs(3);

impl Rackmon {
    /// Starts the poller thread. It runs until a shutdown is requested.
    pub fn spawn_monitor(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let rackmon = Arc::clone(self);
        thread::Builder::new()
            .name("rackmon-poller".into())
            .spawn(move || rackmon.run_monitor())
    }

    fn run_monitor(&self) {
        log::debug!("poller started");
        loop {
            if self.shutdown().is_requested() {
                break;
            }
            let idle = self.poll_once();
            if self.shutdown().wait(idle) {
                break;
            }
        }
        log::debug!("poller stopped");
    }

    /// Runs one poller iteration and returns how long to sleep afterwards.
    pub fn poll_once(&self) -> Duration {
        let next_scan = {
            let state = self.lock_state();
            if state.config.is_none() || state.paused {
                return MAX_IDLE;
            }
            state.next_scan
        };

        if unix_now() >= next_scan {
            self.scan_active_psus();
            self.allocate_monitoring_data();
            self.lock_state().next_scan = unix_now() + SCAN_INTERVAL;
        }

        self.fetch_monitored_data();

        let push_due = {
            let state = self.lock_state();
            unix_now() >= state.next_timestamp_push || state.active != state.timestamped
        };
        if push_due && !self.is_paused() {
            self.push_timestamps();
        }

        let next_scan = self.lock_state().next_scan;
        Duration::from_secs(next_scan.saturating_sub(unix_now())).min(MAX_IDLE)
    }

    /// Probes every location that is not ignored and stores the responders.
    pub fn scan_active_psus(&self) {
        let settings = self.settings();
        let addressing = settings.addressing;
        let status_register = addressing.scheme.status_register();
        let mut probed = Vec::new();
        let mut found = Vec::new();

        for location in addressing.locations() {
            if settings.ignored.contains(location, addressing) {
                continue;
            }
            if self.shutdown().is_requested() {
                return;
            }
            let Some(slave) = addressing.encode(location) else {
                continue;
            };
            probed.push(slave);
            let baud = match self.check_psu_baudrate(slave) {
                Ok(baud) => baud,
                Err(err) => {
                    log::warn!("{slave}: unable to check baud rate: {err}");
                    continue;
                }
            };
            if self
                .read_registers(slave, status_register, 1, baud, settings.timeout, true)
                .is_err()
            {
                continue;
            }
            if found.len() >= MAX_TRACKED_PSUS {
                log::warn!("too many PSUs detected, {slave} ignored");
                continue;
            }
            log::debug!("{slave} answered the scan");
            found.push(slave);
        }
        found.sort_unstable();

        let mut state = self.lock_state();
        state.active = found;
        state.probed.extend(probed);
    }

    /// Allocates a record for every active PSU that has none yet.
    pub fn allocate_monitoring_data(&self) {
        let now = unix_now();
        let mut state = self.lock_state();
        let intervals = state
            .config
            .as_ref()
            .map(|config| config.intervals.clone())
            .unwrap_or_default();
        let active = state.active.clone();
        for slave in active {
            match state.psus.ensure_allocated(slave, &intervals, now) {
                Ok(true) => log::info!("Detected PSU at address {slave}"),
                Ok(false) => {}
                Err(err) => log::warn!("{slave} is not tracked: {err}"),
            }
        }
        state.psus.sort_by_address();
    }

    /// Reads every configured interval of every tracked PSU.
    pub fn fetch_monitored_data(&self) {
        let (slaves, intervals) = {
            let state = self.lock_state();
            let Some(config) = state.config.as_ref() else {
                return;
            };
            let slaves: Vec<Slave> = state.psus.iter().map(|psu| psu.slave()).collect();
            (slaves, config.intervals.clone())
        };

        for (n, slave) in slaves.into_iter().enumerate() {
            if n > 0 && self.shutdown().wait(PSU_DELAY) {
                return;
            }
            if self.is_paused() || self.shutdown().is_requested() {
                return;
            }
            let baud = match self.check_psu_baudrate(slave) {
                Ok(baud) => baud,
                Err(err) => {
                    log::warn!("{slave}: unable to check baud rate: {err}");
                    continue;
                }
            };
            for (index, interval) in intervals.iter().enumerate() {
                self.fetch_interval(slave, index, interval, baud);
            }
        }
    }

    fn fetch_interval(&self, slave: Slave, index: usize, interval: &MonitorInterval, baud: BaudRate) {
        let registers = match self.read_holding_registers(
            slave,
            interval.begin,
            interval.len,
            baud,
            self.settings().timeout,
        ) {
            Ok(registers) => registers,
            Err(
                Error::ReadErrorResponse(_)
                | Error::WriteErrorResponse
                | Error::Protocol(_)
                | Error::PsuTimeout,
            ) => return,
            Err(err) => {
                log::info!(
                    "{slave}: error reading {} registers at {:#06x}: {err}",
                    interval.len,
                    interval.begin
                );
                return;
            }
        };
        let timestamp = u32::try_from(unix_now()).unwrap_or(u32::MAX);
        let only_changes = interval.flags.only_changes();

        {
            let mut state = self.lock_state();
            let Some(psu) = state.psus.get_mut(slave) else {
                return;
            };
            if only_changes
                && psu
                    .ranges()
                    .get(index)
                    .is_some_and(|range| range.is_unchanged(&registers))
            {
                return;
            }
            if interval.begin == self.settings().addressing.scheme.baudrate_register() {
                if let Some(&value) = registers.get(1) {
                    psu.supports_baudrate = value != 0;
                    if let Some(rate) = BaudRate::from_register_value(value.into()) {
                        psu.baudrate = rate;
                    }
                }
            }
            if let Some(range) = psu.range_mut(index) {
                range.record(timestamp, &registers);
            }
        }

        if only_changes && registers.len() >= 2 {
            let value = BigEndian::read_u16(&registers);
            self.write_status_log(|out| {
                writeln!(
                    out,
                    "{}: Change to status register {:02x} on address {:02x}. New value: {value:02x}",
                    chrono::Local::now().format("%b %e %T"),
                    interval.begin,
                    slave.0,
                )
            });
        }
    }

    /// Writes the current UNIX time to the timestamp registers of every tracked PSU.
    pub fn push_timestamps(&self) {
        let now = unix_now();
        let time = u32::try_from(now).unwrap_or(u32::MAX);
        let words = [(time >> 16) as u16, time as u16];
        let register = self.settings().addressing.scheme.timestamp_register();
        let targets: Vec<(Slave, BaudRate)> = self
            .lock_state()
            .psus
            .iter()
            .map(|psu| (psu.slave(), psu.baudrate()))
            .collect();

        for (slave, baud) in targets {
            if let Err(err) =
                self.write_multiple_registers(slave, register, &words, baud, self.settings().timeout)
            {
                log::debug!("{slave}: failed to push timestamp: {err}");
            }
        }

        let mut state = self.lock_state();
        state.timestamped = state.active.clone();
        state.next_timestamp_push = now + TIMESTAMP_INTERVAL;
    }
}
