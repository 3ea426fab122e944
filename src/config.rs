// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Daemon settings read once from the environment at startup.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{
    frame::BaudRate,
    slave::{Addressing, AddressingScheme, PsuLocation, Slave},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_micros(300_000);
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/rackmond.sock";
pub const DEFAULT_PID_FILE: &str = "/var/run/rackmond.pid";
pub const DEFAULT_STATUS_LOG: &str = "/var/log/psu-status.log";
const DEFAULT_TTY: &str = "/dev/ttyUSB0";
const DEFAULT_TTYS: &str = "/dev/ttyUSB0,/dev/ttyUSB1,/dev/ttyUSB2";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid number {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("RACKMOND_RACK_VERSION: unsupported rack version {0:?}")]
    InvalidRackVersion(String),

    #[error("RACKMOND_IGNORE_PSUS: invalid psu address {0:?}")]
    InvalidIgnoreEntry(String),

    #[error("no serial device configured")]
    NoDevice,
}

/// PSU locations that are never scanned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnoreList {
    bits: u64,
}

impl IgnoreList {
    /// Parses a comma separated list of hex slave addresses.
    pub fn parse(list: &str, addressing: Addressing) -> Result<Self, ConfigError> {
        let mut ignored = Self::default();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let digits = entry
                .strip_prefix("0x")
                .or_else(|| entry.strip_prefix("0X"))
                .unwrap_or(entry);
            let location = u8::from_str_radix(digits, 16)
                .ok()
                .and_then(|addr| addressing.decode(Slave(addr)))
                .ok_or_else(|| ConfigError::InvalidIgnoreEntry(entry.to_owned()))?;
            ignored.insert(location, addressing);
        }
        Ok(ignored)
    }

    pub fn insert(&mut self, location: PsuLocation, addressing: Addressing) {
        self.bits |= 1 << addressing.index(location);
    }

    #[must_use]
    pub fn contains(&self, location: PsuLocation, addressing: Addressing) -> bool {
        self.bits & (1 << addressing.index(location)) != 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Quiet gap that ends a response read.
    pub timeout: Duration,
    /// Pause after every transaction attempt.
    pub min_delay: Duration,
    pub addressing: Addressing,
    /// One serial device per rack instead of a shared bus.
    pub multi_port: bool,
    pub desired_baudrate: BaudRate,
    pub ignored: IgnoreList,
    pub ttys: Vec<PathBuf>,
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub status_log: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            min_delay: Duration::ZERO,
            addressing: Addressing::default(),
            multi_port: false,
            desired_baudrate: BaudRate::default(),
            ignored: IgnoreList::default(),
            ttys: vec![PathBuf::from(DEFAULT_TTY)],
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            status_log: Some(PathBuf::from(DEFAULT_STATUS_LOG)),
            verbose: false,
        }
    }
}

fn micros(var: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_micros)
                .map_err(|_| ConfigError::InvalidNumber { var, value })
        })
        .transpose()
}

fn paths(list: &str) -> Vec<PathBuf> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(timeout) = micros("RACKMOND_TIMEOUT", lookup("RACKMOND_TIMEOUT"))? {
            settings.timeout = timeout;
        }
        if let Some(delay) = micros("RACKMOND_MIN_DELAY", lookup("RACKMOND_MIN_DELAY"))? {
            settings.min_delay = delay;
        }
        if let Some(version) = lookup("RACKMOND_RACK_VERSION") {
            settings.addressing.scheme = version
                .trim()
                .parse::<u8>()
                .ok()
                .and_then(AddressingScheme::from_version)
                .ok_or(ConfigError::InvalidRackVersion(version))?;
        }
        settings.addressing.swap_racks = lookup("RACKMOND_SWAP_ADDR").is_some();
        settings.multi_port = lookup("RACKMOND_MULTI_PORT").is_some();
        settings.verbose = lookup("RACKMOND_VERBOSE").is_some();
        if let Some(baud) = lookup("RACKMOND_DESIRED_BAUDRATE") {
            match baud.trim().parse::<u32>().ok().and_then(BaudRate::from_bps) {
                Some(baud) => settings.desired_baudrate = baud,
                None => log::warn!(
                    "unsupported baud rate {baud:?}, using {}",
                    BaudRate::default()
                ),
            }
        }
        if let Some(list) = lookup("RACKMOND_IGNORE_PSUS") {
            settings.ignored = IgnoreList::parse(&list, settings.addressing)?;
        }
        settings.ttys = if settings.multi_port {
            paths(&lookup("RACKMOND_TTYS").unwrap_or_else(|| DEFAULT_TTYS.to_owned()))
        } else {
            paths(&lookup("RACKMOND_TTY").unwrap_or_else(|| DEFAULT_TTY.to_owned()))
        };
        if settings.ttys.is_empty() {
            return Err(ConfigError::NoDevice);
        }
        if let Some(path) = lookup("RACKMOND_SOCKET") {
            settings.socket_path = path.into();
        }
        if let Some(path) = lookup("RACKMOND_PID_FILE") {
            settings.pid_file = path.into();
        }
        if let Some(path) = lookup("RACKMOND_STATUS_LOG") {
            settings.status_log = (!path.is_empty()).then(|| path.into());
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.timeout, Duration::from_millis(300));
        assert_eq!(settings.min_delay, Duration::ZERO);
        assert_eq!(settings.addressing.scheme, AddressingScheme::V2);
        assert!(!settings.multi_port);
        assert_eq!(settings.desired_baudrate, BaudRate::B19200);
        assert_eq!(settings.ttys, vec![PathBuf::from("/dev/ttyUSB0")]);
        assert!(settings.ignored.is_empty());
    }

    #[test]
    fn overrides() {
        // Given
        let vars = [
            ("RACKMOND_TIMEOUT", "150000"),
            ("RACKMOND_MIN_DELAY", "500"),
            ("RACKMOND_RACK_VERSION", "3"),
            ("RACKMOND_MULTI_PORT", "1"),
            ("RACKMOND_DESIRED_BAUDRATE", "57600"),
            ("RACKMOND_IGNORE_PSUS", "a0, 0xB9"),
            ("RACKMOND_STATUS_LOG", ""),
        ];

        // When
        let settings = settings(&vars).unwrap();

        // Then
        assert_eq!(settings.timeout, Duration::from_millis(150));
        assert_eq!(settings.min_delay, Duration::from_micros(500));
        assert_eq!(settings.addressing.scheme, AddressingScheme::V3);
        assert!(settings.multi_port);
        assert_eq!(settings.ttys.len(), 3);
        assert_eq!(settings.desired_baudrate, BaudRate::B57600);
        assert!(settings
            .ignored
            .contains(PsuLocation::new(0, 0, 0), settings.addressing));
        assert!(settings
            .ignored
            .contains(PsuLocation::new(1, 1, 1), settings.addressing));
        assert!(!settings
            .ignored
            .contains(PsuLocation::new(0, 0, 1), settings.addressing));
        assert_eq!(settings.status_log, None);
    }

    #[test]
    fn unsupported_baud_rate_falls_back_to_default() {
        let settings = settings(&[("RACKMOND_DESIRED_BAUDRATE", "9600")]).unwrap();
        assert_eq!(settings.desired_baudrate, BaudRate::default());
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            settings(&[("RACKMOND_TIMEOUT", "fast")]),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            settings(&[("RACKMOND_RACK_VERSION", "4")]),
            Err(ConfigError::InvalidRackVersion(_))
        ));
        assert!(matches!(
            settings(&[("RACKMOND_IGNORE_PSUS", "a3")]),
            Err(ConfigError::InvalidIgnoreEntry(_))
        ));
        assert!(matches!(
            settings(&[("RACKMOND_TTY", " ")]),
            Err(ConfigError::NoDevice)
        ));
    }
}
