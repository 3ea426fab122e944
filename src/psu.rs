// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per PSU link health and register history.

use byteorder::{BigEndian, ByteOrder as _};

use crate::{
    error::{Error, Result},
    frame::{command::MonitorInterval, BaudRate},
    slave::Slave,
};

/// Number of PSUs that can be tracked at the same time.
pub const MAX_TRACKED_PSUS: usize = 24;

/// Consecutive failed transactions tolerated before a PSU enters timeout mode.
pub const ALLOWABLE_CONSECUTIVE_FAILURES: u32 = 10;

/// Seconds without communication after which a PSU's link state is reset.
pub const NON_COMMUNICATION_TIMEOUT: u64 = 630;

/// Upper bound of the sample history of one PSU, summed over all intervals.
pub const MAX_HISTORY_BYTES: usize = 256 * 1024;

const TIMESTAMP_SIZE: usize = 4;

/// Bytes of history one PSU needs for `intervals`, `None` on overflow.
#[must_use]
pub fn history_bytes(intervals: &[MonitorInterval]) -> Option<usize> {
    intervals.iter().try_fold(0usize, |total, interval| {
        total.checked_add(RegisterRangeHistory::size_of(interval)?)
    })
}

/// One sample of a [`RegisterRangeHistory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading<'a> {
    pub timestamp: u32,
    /// Register values in wire order.
    pub data: &'a [u8],
}

/// Circular log of samples of one monitored register range.
///
/// Each slot holds a 4 byte timestamp followed by the register bytes; a zero
/// timestamp marks a slot that was never written.
#[derive(Debug, Clone)]
pub struct RegisterRangeHistory {
    interval: MonitorInterval,
    buf: Vec<u8>,
    pos: usize,
}

impl RegisterRangeHistory {
    pub fn new(interval: MonitorInterval) -> Result<Self> {
        let size = Self::size_of(&interval).ok_or(Error::HistoryTooLarge)?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| Error::HistoryTooLarge)?;
        buf.resize(size, 0);
        Ok(Self {
            interval,
            buf,
            pos: 0,
        })
    }

    fn pitch_of(interval: &MonitorInterval) -> usize {
        TIMESTAMP_SIZE + 2 * usize::from(interval.len)
    }

    fn size_of(interval: &MonitorInterval) -> Option<usize> {
        let keep = usize::try_from(interval.keep).ok()?;
        Self::pitch_of(interval).checked_mul(keep)
    }

    #[must_use]
    pub fn interval(&self) -> &MonitorInterval {
        &self.interval
    }

    /// Size of one sample in bytes.
    #[must_use]
    pub fn pitch(&self) -> usize {
        Self::pitch_of(&self.interval)
    }

    /// Byte offset of the next write.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Appends a sample, overwriting the oldest one once full.
    ///
    /// `registers` is truncated or zero padded to the interval length.
    pub fn record(&mut self, timestamp: u32, registers: &[u8]) {
        if self.buf.is_empty() {
            return;
        }
        let pitch = self.pitch();
        let slot = &mut self.buf[self.pos..self.pos + pitch];
        let (ts, data) = slot.split_at_mut(TIMESTAMP_SIZE);
        BigEndian::write_u32(ts, timestamp);
        let n = registers.len().min(data.len());
        data[..n].copy_from_slice(&registers[..n]);
        data[n..].fill(0);
        self.pos = (self.pos + pitch) % self.buf.len();
    }

    fn slot(&self, offset: usize) -> Reading<'_> {
        let slot = &self.buf[offset..offset + self.pitch()];
        Reading {
            timestamp: BigEndian::read_u32(&slot[..TIMESTAMP_SIZE]),
            data: &slot[TIMESTAMP_SIZE..],
        }
    }

    /// The most recently recorded sample.
    #[must_use]
    pub fn latest(&self) -> Option<Reading<'_>> {
        if self.buf.is_empty() {
            return None;
        }
        let offset = self.pos.checked_sub(self.pitch()).unwrap_or(self.buf.len() - self.pitch());
        let reading = self.slot(offset);
        (reading.timestamp != 0).then_some(reading)
    }

    /// Whether `registers` equals the latest sample.
    #[must_use]
    pub fn is_unchanged(&self, registers: &[u8]) -> bool {
        self.latest().is_some_and(|latest| latest.data == registers)
    }

    /// Samples in storage order, up to the first slot that was never written.
    pub fn readings(&self) -> impl Iterator<Item = Reading<'_>> + '_ {
        let pitch = self.pitch();
        (0..self.buf.len() / pitch.max(1))
            .map(move |i| self.slot(i * pitch))
            .take_while(|reading| reading.timestamp != 0)
    }
}

/// Read-only view of a PSU's link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsuStats {
    pub slave: Slave,
    pub baudrate: BaudRate,
    pub supports_baudrate: bool,
    pub crc_errors: u32,
    pub timeout_errors: u32,
    pub consecutive_failures: u32,
    pub last_comms: u64,
    pub timeout_mode: bool,
}

/// A discovered PSU.
#[derive(Debug, Clone)]
pub struct PsuRecord {
    slave: Slave,
    pub(crate) baudrate: BaudRate,
    pub(crate) supports_baudrate: bool,
    pub(crate) crc_errors: u32,
    pub(crate) timeout_errors: u32,
    consecutive_failures: u32,
    last_comms: u64,
    timeout_mode: bool,
    ranges: Vec<RegisterRangeHistory>,
}

impl PsuRecord {
    /// Fails if the history of `intervals` exceeds [`MAX_HISTORY_BYTES`].
    pub fn new(slave: Slave, intervals: &[MonitorInterval], now: u64) -> Result<Self> {
        if !matches!(history_bytes(intervals), Some(total) if total <= MAX_HISTORY_BYTES) {
            return Err(Error::HistoryTooLarge);
        }
        let ranges = intervals
            .iter()
            .copied()
            .map(RegisterRangeHistory::new)
            .collect::<Result<_>>()?;
        Ok(Self {
            slave,
            baudrate: BaudRate::default(),
            supports_baudrate: false,
            crc_errors: 0,
            timeout_errors: 0,
            consecutive_failures: 0,
            last_comms: now,
            timeout_mode: false,
            ranges,
        })
    }

    #[must_use]
    pub fn slave(&self) -> Slave {
        self.slave
    }

    #[must_use]
    pub fn baudrate(&self) -> BaudRate {
        self.baudrate
    }

    #[must_use]
    pub fn ranges(&self) -> &[RegisterRangeHistory] {
        &self.ranges
    }

    pub(crate) fn range_mut(&mut self, index: usize) -> Option<&mut RegisterRangeHistory> {
        self.ranges.get_mut(index)
    }

    #[must_use]
    pub fn stats(&self) -> PsuStats {
        PsuStats {
            slave: self.slave,
            baudrate: self.baudrate,
            supports_baudrate: self.supports_baudrate,
            crc_errors: self.crc_errors,
            timeout_errors: self.timeout_errors,
            consecutive_failures: self.consecutive_failures,
            last_comms: self.last_comms,
            timeout_mode: self.timeout_mode,
        }
    }

    /// Seconds left until a PSU in timeout mode is retried.
    #[must_use]
    pub fn timeout_remaining(&self, now: u64) -> Option<u64> {
        self.timeout_mode
            .then(|| (self.last_comms + NON_COMMUNICATION_TIMEOUT).saturating_sub(now))
    }

    /// Circuit breaker consulted before every transaction.
    pub fn check_comms(&mut self, now: u64) -> Result<()> {
        if now > self.last_comms + NON_COMMUNICATION_TIMEOUT {
            if self.timeout_mode {
                log::info!("psu {} leaves timeout mode", self.slave);
            }
            self.baudrate = BaudRate::default();
            self.consecutive_failures = 0;
            self.timeout_mode = false;
        }
        if self.timeout_mode {
            return Err(Error::PsuTimeout);
        }
        if self.consecutive_failures > ALLOWABLE_CONSECUTIVE_FAILURES {
            log::info!(
                "psu {} failed {} times in a row, entering timeout mode",
                self.slave,
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
            self.baudrate = BaudRate::default();
            self.timeout_mode = true;
            self.last_comms = now;
            return Err(Error::PsuTimeout);
        }
        Ok(())
    }

    pub fn update_comms(&mut self, now: u64, success: bool) {
        self.last_comms = now;
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }
}

/// Fixed capacity registry of discovered PSUs.
///
/// Slots are never freed; [`PsuTable::sort_by_address`] keeps the occupied
/// ones in front in ascending address order.
#[derive(Debug, Clone)]
pub struct PsuTable {
    slots: Vec<Option<PsuRecord>>,
}

impl Default for PsuTable {
    fn default() -> Self {
        Self::with_capacity(MAX_TRACKED_PSUS)
    }
}

impl PsuTable {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Slot holding `slave`, else the first empty one.
    #[must_use]
    pub fn find_or_free_slot(&self, slave: Slave) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|psu| psu.slave == slave))
            .or_else(|| self.slots.iter().position(Option::is_none))
    }

    /// Allocates a record for `slave` unless one exists.
    ///
    /// Returns `true` if a record was created.
    pub fn ensure_allocated(
        &mut self,
        slave: Slave,
        intervals: &[MonitorInterval],
        now: u64,
    ) -> Result<bool> {
        let index = self.find_or_free_slot(slave).ok_or(Error::TableFull)?;
        let slot = &mut self.slots[index];
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(PsuRecord::new(slave, intervals, now)?);
        Ok(true)
    }

    pub fn sort_by_address(&mut self) {
        self.slots.sort_by_key(|slot| match slot {
            Some(psu) => (false, psu.slave),
            None => (true, Slave(0)),
        });
    }

    #[must_use]
    pub fn get(&self, slave: Slave) -> Option<&PsuRecord> {
        self.iter().find(|psu| psu.slave == slave)
    }

    pub fn get_mut(&mut self, slave: Slave) -> Option<&mut PsuRecord> {
        self.iter_mut().find(|psu| psu.slave == slave)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PsuRecord> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PsuRecord> {
        self.slots.iter_mut().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(len: u16, keep: u32) -> MonitorInterval {
        MonitorInterval::new(0x80, len, keep, 0)
    }

    #[test]
    fn history_wraps_and_keeps_latest_samples() {
        // Given
        let mut history = RegisterRangeHistory::new(interval(1, 3)).unwrap();
        assert_eq!(history.pitch(), 6);

        // When
        for ts in 1..=5u32 {
            history.record(ts, &[0, ts as u8]);
            assert!(history.position() < history.pitch() * 3);
        }

        // Then
        let mut timestamps: Vec<u32> = history.readings().map(|r| r.timestamp).collect();
        timestamps.sort_unstable();
        assert_eq!(timestamps, vec![3, 4, 5]);
        assert_eq!(history.position(), 2 * history.pitch());
        let latest = history.latest().unwrap();
        assert_eq!(latest.timestamp, 5);
        assert_eq!(latest.data, &[0, 5]);
    }

    #[test]
    fn readings_stop_at_first_unwritten_slot() {
        let mut history = RegisterRangeHistory::new(interval(2, 4)).unwrap();
        assert!(history.latest().is_none());
        assert_eq!(history.readings().count(), 0);
        history.record(100, &[1, 2, 3, 4]);
        history.record(101, &[1, 2, 3, 5]);
        let readings: Vec<_> = history.readings().collect();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].data, &[1, 2, 3, 4]);
        assert!(history.is_unchanged(&[1, 2, 3, 5]));
        assert!(!history.is_unchanged(&[1, 2, 3, 4]));
    }

    #[test]
    fn position_wraps_exactly_at_capacity() {
        let mut history = RegisterRangeHistory::new(interval(1, 2)).unwrap();
        history.record(1, &[0, 1]);
        history.record(2, &[0, 2]);
        assert_eq!(history.position(), 0);
        assert_eq!(history.latest().unwrap().timestamp, 2);
    }

    #[test]
    fn enter_timeout_mode_after_too_many_failures() {
        // Given
        let mut psu = PsuRecord::new(Slave(0xA0), &[], 1000).unwrap();
        psu.baudrate = BaudRate::B115200;
        for _ in 0..=ALLOWABLE_CONSECUTIVE_FAILURES {
            assert!(psu.check_comms(1000).is_ok());
            psu.update_comms(1000, false);
        }

        // When
        let result = psu.check_comms(1001);

        // Then
        assert!(matches!(result, Err(Error::PsuTimeout)));
        let stats = psu.stats();
        assert!(stats.timeout_mode);
        assert_eq!(stats.baudrate, BaudRate::B19200);
        assert_eq!(psu.timeout_remaining(1001), Some(NON_COMMUNICATION_TIMEOUT));
        assert!(matches!(psu.check_comms(1100), Err(Error::PsuTimeout)));
    }

    #[test]
    fn leave_timeout_mode_after_cool_down() {
        let mut psu = PsuRecord::new(Slave(0xA0), &[], 0).unwrap();
        for _ in 0..=ALLOWABLE_CONSECUTIVE_FAILURES {
            psu.update_comms(0, false);
        }
        assert!(psu.check_comms(0).is_err());

        assert!(psu.check_comms(NON_COMMUNICATION_TIMEOUT + 1).is_ok());
        assert!(!psu.stats().timeout_mode);
        assert_eq!(psu.stats().consecutive_failures, 0);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut psu = PsuRecord::new(Slave(0xA0), &[], 0).unwrap();
        psu.update_comms(1, false);
        psu.update_comms(2, false);
        psu.update_comms(3, true);
        assert_eq!(psu.stats().consecutive_failures, 0);
        assert_eq!(psu.stats().last_comms, 3);
    }

    #[test]
    fn table_allocates_once_per_address() {
        let mut table = PsuTable::with_capacity(2);
        let intervals = [interval(1, 1)];
        assert!(table.ensure_allocated(Slave(0xA4), &intervals, 0).unwrap());
        assert!(!table.ensure_allocated(Slave(0xA4), &intervals, 0).unwrap());
        assert!(table.ensure_allocated(Slave(0xA1), &intervals, 0).unwrap());
        assert!(matches!(
            table.ensure_allocated(Slave(0xA2), &intervals, 0),
            Err(Error::TableFull)
        ));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(Slave(0xA4)).unwrap().ranges().len(), 1);
    }

    #[test]
    fn oversized_history_is_not_allocated() {
        // Given
        let mut table = PsuTable::with_capacity(2);
        let huge = [MonitorInterval::new(0x80, 125, u32::MAX, 0)];
        let over_budget = [interval(125, 1000), interval(125, 100)];

        // When
        let huge_result = table.ensure_allocated(Slave(0xA0), &huge, 0);
        let over_budget_result = table.ensure_allocated(Slave(0xA1), &over_budget, 0);

        // Then
        assert!(matches!(huge_result, Err(Error::HistoryTooLarge)));
        assert!(matches!(over_budget_result, Err(Error::HistoryTooLarge)));
        assert!(table.is_empty());
        assert!(table.ensure_allocated(Slave(0xA0), &[interval(125, 1)], 0).unwrap());
    }

    #[test]
    fn history_bytes_sums_all_intervals() {
        assert_eq!(history_bytes(&[]), Some(0));
        assert_eq!(history_bytes(&[interval(1, 3), interval(2, 1)]), Some(6 * 3 + 8));
        assert_eq!(
            history_bytes(&[interval(125, 1032)]),
            Some(254 * 1032),
            "largest single interval within budget"
        );
        assert!(history_bytes(&[interval(125, 1033)]).unwrap() > MAX_HISTORY_BYTES);
    }

    #[test]
    fn sort_pushes_empty_slots_to_the_end() {
        let mut table = PsuTable::with_capacity(4);
        table.slots[1] = Some(PsuRecord::new(Slave(0xB0), &[], 0).unwrap());
        table.slots[3] = Some(PsuRecord::new(Slave(0xA2), &[], 0).unwrap());

        table.sort_by_address();

        let order: Vec<_> = table.iter().map(PsuRecord::slave).collect();
        assert_eq!(order, vec![Slave(0xA2), Slave(0xB0)]);
        assert!(table.slots[2].is_none() && table.slots[3].is_none());
        assert_eq!(table.find_or_free_slot(Slave(0xA7)), Some(2));
        assert_eq!(table.find_or_free_slot(Slave(0xB0)), Some(1));
    }
}
