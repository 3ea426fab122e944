// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The daemon context shared by the poller and the command server.

use std::{
    collections::HashSet,
    fmt, io,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    config::Settings,
    error::{Error, Result},
    frame::command::MonitoringConfig,
    psu::{PsuStats, PsuTable},
    slave::Slave,
    transport::Port,
};

/// Seconds since the UNIX epoch, `0` if the clock is before it.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Process wide stop request that sleeping threads can wait on.
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: Mutex<bool>,
    cvar: Condvar,
}

impl Shutdown {
    pub fn request(&self) {
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cvar.notify_all();
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `timeout` unless a stop is requested first.
    ///
    /// Returns `true` if a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.requested.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cvar
            .wait_timeout_while(guard, timeout, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Mutable state behind the global lock.
#[derive(Debug)]
pub(crate) struct State {
    pub(crate) config: Option<MonitoringConfig>,
    /// Addresses that answered the last scan, ascending.
    pub(crate) active: Vec<Slave>,
    pub(crate) psus: PsuTable,
    pub(crate) paused: bool,
    pub(crate) min_delay: Duration,
    pub(crate) next_scan: u64,
    pub(crate) next_timestamp_push: u64,
    /// PSUs that received the last timestamp push.
    pub(crate) timestamped: Vec<Slave>,
    /// Addresses covered by at least one completed scan.
    pub(crate) probed: HashSet<Slave>,
}

pub struct Rackmon {
    settings: Settings,
    state: Mutex<State>,
    ports: Vec<Port>,
    shutdown: Shutdown,
    status_log: Mutex<Option<Box<dyn io::Write + Send>>>,
}

impl fmt::Debug for Rackmon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rackmon")
            .field("settings", &self.settings)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl Rackmon {
    /// Creates an unconfigured daemon context over `ports`.
    ///
    /// In multi-port mode `ports[rack]` serves the PSUs of that rack.
    #[must_use]
    pub fn new(settings: Settings, ports: Vec<Port>) -> Self {
        let state = State {
            config: None,
            active: Vec::new(),
            psus: PsuTable::default(),
            paused: false,
            min_delay: settings.min_delay,
            next_scan: 0,
            next_timestamp_push: 0,
            timestamped: Vec::new(),
            probed: HashSet::new(),
        };
        Self {
            settings,
            state: Mutex::new(state),
            ports,
            shutdown: Shutdown::default(),
            status_log: Mutex::new(None),
        }
    }

    /// Appends status register changes to `log`.
    #[must_use]
    pub fn with_status_log(self, log: impl io::Write + Send + 'static) -> Self {
        *self.status_log.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(log));
        self
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    #[must_use]
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_status_log<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn io::Write) -> io::Result<()>,
    {
        let mut sink = self.status_log.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = sink.as_mut() {
            if let Err(err) = f(sink.as_mut()).and_then(|()| sink.flush()) {
                log::warn!("failed to write status log: {err}");
            }
        }
    }

    /// The port a slave is wired to.
    pub fn port_for(&self, slave: Slave) -> Result<&Port> {
        let index = if self.settings.multi_port {
            self.settings
                .addressing
                .decode(slave)
                .map_or(0, |location| usize::from(location.rack))
        } else {
            0
        };
        self.ports
            .get(index)
            .or_else(|| self.ports.first())
            .ok_or_else(|| Error::Transport(io::Error::new(io::ErrorKind::NotFound, "no serial port")))
    }

    /// Installs the monitoring configuration; only the first call succeeds.
    pub fn configure(&self, config: MonitoringConfig) -> Result<()> {
        let mut state = self.lock_state();
        if state.config.is_some() {
            return Err(Error::AlreadyConfigured);
        }
        log::info!("got configuration with {} intervals", config.intervals.len());
        state.config = Some(config);
        state.next_scan = unix_now();
        Ok(())
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.lock_state().config.is_some()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock_state().paused
    }

    /// Sets the paused flag and returns its previous value.
    pub fn set_paused(&self, paused: bool) -> bool {
        std::mem::replace(&mut self.lock_state().paused, paused)
    }

    pub fn set_min_delay(&self, delay: Duration) {
        self.lock_state().min_delay = delay;
    }

    /// Schedules a scan on the next poller iteration.
    pub fn force_scan(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.config.is_none() {
            return Err(Error::Unconfigured);
        }
        state.next_scan = unix_now();
        Ok(())
    }

    #[must_use]
    pub fn active_psus(&self) -> Vec<Slave> {
        self.lock_state().active.clone()
    }

    #[must_use]
    pub fn psu_stats(&self, slave: Slave) -> Option<PsuStats> {
        self.lock_state().psus.get(slave).map(|psu| psu.stats())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn shutdown_wakes_waiting_threads() {
        // Given
        let shutdown = Arc::new(Shutdown::default());
        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                let started = Instant::now();
                let requested = shutdown.wait(Duration::from_secs(30));
                (requested, started.elapsed())
            })
        };

        // When
        thread::sleep(Duration::from_millis(20));
        shutdown.request();

        // Then
        let (requested, elapsed) = waiter.join().unwrap();
        assert!(requested);
        assert!(elapsed < Duration::from_secs(30));
        assert!(shutdown.is_requested());
    }

    #[test]
    fn wait_times_out_without_request() {
        let shutdown = Shutdown::default();
        assert!(!shutdown.wait(Duration::from_millis(5)));
    }

    #[test]
    fn configure_only_once() {
        let rackmon = Rackmon::new(Settings::default(), Vec::new());
        assert!(!rackmon.is_configured());
        assert!(matches!(rackmon.force_scan(), Err(Error::Unconfigured)));

        rackmon.configure(MonitoringConfig::default()).unwrap();
        assert!(matches!(
            rackmon.configure(MonitoringConfig::default()),
            Err(Error::AlreadyConfigured)
        ));
        assert!(rackmon.force_scan().is_ok());
    }

    #[test]
    fn pause_returns_previous_state() {
        let rackmon = Rackmon::new(Settings::default(), Vec::new());
        assert!(!rackmon.set_paused(true));
        assert!(rackmon.set_paused(true));
        assert!(rackmon.is_paused());
        assert!(rackmon.set_paused(false));
    }

    #[test]
    fn missing_port_is_an_error() {
        let rackmon = Rackmon::new(Settings::default(), Vec::new());
        assert!(matches!(
            rackmon.port_for(Slave(0xA0)),
            Err(Error::Transport(_))
        ));
    }
}
