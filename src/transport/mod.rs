// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serial ports and the transaction framing on top of them.

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};

use crate::{
    codec::{append_crc, check_crc, hex_dump, rtu::MIN_RESPONSE_LEN},
    error::{Error, Result},
    frame::BaudRate,
};

#[cfg(target_os = "linux")]
pub mod rs485;

/// A physical half-duplex line.
///
/// Implementations own the line discipline: switch to `baud`, send the
/// framed request, wait until it has left the wire, then read until
/// `max_len` bytes arrived or the line stayed quiet for `timeout`.
pub trait SerialLine: Send + fmt::Debug {
    fn exchange(
        &mut self,
        frame: &[u8],
        max_len: usize,
        timeout: Duration,
        baud: BaudRate,
    ) -> io::Result<Vec<u8>>;
}

/// One Modbus transaction as handed to a [`Port`].
#[derive(Debug, Clone, Copy)]
pub struct Transaction<'a> {
    /// Request ADU without CRC.
    pub request: &'a [u8],
    /// Response length including CRC.
    pub expected_len: usize,
    pub timeout: Duration,
    pub baud: BaudRate,
    /// Whether the outcome counts towards the port statistics.
    pub tally: bool,
}

/// Diagnostic counters of a port.
#[derive(Debug, Default)]
pub struct PortStats {
    successes: AtomicU64,
    crc_failures: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    pub successes: u64,
    pub crc_failures: u64,
    pub timeouts: u64,
}

impl PortStatsSnapshot {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.successes + self.crc_failures + self.timeouts
    }
}

impl PortStats {
    #[must_use]
    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            successes: self.successes.load(Ordering::Relaxed),
            crc_failures: self.crc_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

const STATS_LOG_INTERVAL: u64 = 1000;

/// A serial port shared by the poller and the command server.
///
/// The line mutex serializes transactions on the wire.
#[derive(Debug)]
pub struct Port {
    name: String,
    line: Mutex<Box<dyn SerialLine>>,
    stats: PortStats,
}

impl Port {
    pub fn new(name: impl Into<String>, line: impl SerialLine + 'static) -> Self {
        Self {
            name: name.into(),
            line: Mutex::new(Box::new(line)),
            stats: PortStats::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stats(&self) -> PortStatsSnapshot {
        self.stats.snapshot()
    }

    /// Sends one request and returns the CRC checked response, CRC included.
    pub fn execute(&self, tx: &Transaction<'_>) -> Result<Bytes> {
        let mut frame = BytesMut::with_capacity(tx.request.len() + 2);
        frame.extend_from_slice(tx.request);
        append_crc(&mut frame);

        let mut line = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        let started = Instant::now();
        let response = line.exchange(&frame, tx.expected_len, tx.timeout, tx.baud)?;
        drop(line);
        let elapsed = started.elapsed();

        if response.len() < MIN_RESPONSE_LEN {
            log::debug!(
                "{}: timeout after {elapsed:?} for [{}], got {} bytes",
                self.name,
                hex_dump(&frame),
                response.len()
            );
            if tx.tally {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            return Err(Error::Timeout);
        }
        if !check_crc(&response) {
            log::debug!(
                "{}: bad crc for [{}]: [{}]",
                self.name,
                hex_dump(&frame),
                hex_dump(&response)
            );
            if tx.tally {
                self.stats.crc_failures.fetch_add(1, Ordering::Relaxed);
            }
            return Err(Error::BadCrc);
        }
        log::debug!(
            "{}: [{}] -> [{}] in {elapsed:?}",
            self.name,
            hex_dump(&frame),
            hex_dump(&response)
        );
        if tx.tally {
            let successes = self.stats.successes.fetch_add(1, Ordering::Relaxed) + 1;
            if successes % STATS_LOG_INTERVAL == 0 {
                self.log_stats();
            }
        }
        Ok(Bytes::from(response))
    }

    #[allow(clippy::cast_precision_loss)]
    fn log_stats(&self) {
        let stats = self.stats();
        let total = stats.total() as f64;
        log::info!(
            "{}: {} transactions, {:.2}% success, {:.2}% crc errors, {:.2}% timeouts",
            self.name,
            stats.total(),
            100.0 * stats.successes as f64 / total,
            100.0 * stats.crc_failures as f64 / total,
            100.0 * stats.timeouts as f64 / total,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Default)]
    struct Replay {
        responses: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl SerialLine for Replay {
        fn exchange(
            &mut self,
            frame: &[u8],
            _max_len: usize,
            _timeout: Duration,
            _baud: BaudRate,
        ) -> io::Result<Vec<u8>> {
            self.sent.push(frame.to_vec());
            Ok(self.responses.pop_front().unwrap_or_default())
        }
    }

    fn tx(request: &[u8]) -> Transaction<'_> {
        Transaction {
            request,
            expected_len: 7,
            timeout: Duration::from_millis(10),
            baud: BaudRate::default(),
            tally: true,
        }
    }

    #[test]
    fn short_response_is_a_timeout() {
        // Given
        let line = Replay {
            responses: vec![vec![0x10, 0x03, 0x02]].into(),
            ..Default::default()
        };
        let port = Port::new("test", line);

        // When
        let result = port.execute(&tx(&[0x10, 0x03, 0x00, 0x00, 0x00, 0x01]));

        // Then
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(port.stats().timeouts, 1);
    }

    #[test]
    fn corrupted_response_fails_crc() {
        let line = Replay {
            responses: vec![vec![0x10, 0x03, 0x02, 0x00, 0x01, 0x00, 0x00]].into(),
            ..Default::default()
        };
        let port = Port::new("test", line);
        let result = port.execute(&tx(&[0x10, 0x03, 0x00, 0x00, 0x00, 0x01]));
        assert!(matches!(result, Err(Error::BadCrc)));
        assert_eq!(port.stats().crc_failures, 1);
    }

    #[test]
    fn valid_response_keeps_crc() {
        let mut rsp = BytesMut::from(&[0x10, 0x03, 0x02, 0x00, 0x01][..]);
        append_crc(&mut rsp);
        let line = Replay {
            responses: vec![rsp.to_vec()].into(),
            ..Default::default()
        };
        let port = Port::new("test", line);
        let mut request = tx(&[0x10, 0x03, 0x00, 0x00, 0x00, 0x01]);
        request.tally = false;

        let response = port.execute(&request).unwrap();

        assert_eq!(&response[..], &rsp[..]);
        assert_eq!(port.stats(), PortStatsSnapshot::default());
    }
}
