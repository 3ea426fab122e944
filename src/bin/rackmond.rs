// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rack monitor daemon
//!
//! Configured through `RACKMOND_*` environment variables, see
//! [`rackmond::config::Settings::from_env`].

use std::{
    fs::{File, OpenOptions},
    io::Write as _,
    os::fd::AsRawFd as _,
    path::Path,
    process::ExitCode,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{bail, Context as _};
use tokio::signal::unix::{signal, SignalKind};

use rackmond::{
    config::Settings, server::Server, transport::rs485::Rs485Line, transport::Port, Rackmon,
};

const EXIT_DELAY: Duration = Duration::from_millis(500);

fn init_logging() {
    let level = if std::env::var_os("RACKMOND_VERBOSE").is_some() {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Takes an exclusive lock on the pid file and writes our pid into it.
///
/// The lock is held as long as the returned file is open.
fn lock_pid_file(path: &Path) -> anyhow::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open pid file {}", path.display()))?;
    // SAFETY: the fd belongs to `file`, which is alive for the call.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
        bail!("another rackmond instance holds {}", path.display());
    }
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

fn open_ports(settings: &Settings) -> anyhow::Result<Vec<Port>> {
    settings
        .ttys
        .iter()
        .map(|tty| {
            let line = Rs485Line::open(tty)
                .with_context(|| format!("failed to open {}", tty.display()))?;
            Ok(Port::new(tty.display().to_string(), line))
        })
        .collect()
}

/// Requests a shutdown on SIGTERM or SIGINT.
fn spawn_signal_watcher(rackmon: Arc<Rackmon>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    thread::Builder::new()
        .name("rackmon-signals".into())
        .spawn(move || {
            let result = runtime.block_on(async {
                let mut terminate = signal(SignalKind::terminate())?;
                let mut interrupt = signal(SignalKind::interrupt())?;
                tokio::select! {
                    _ = terminate.recv() => log::info!("received SIGTERM"),
                    _ = interrupt.recv() => log::info!("received SIGINT"),
                }
                std::io::Result::Ok(())
            });
            if let Err(err) = result {
                log::error!("signal handling failed: {err}");
            }
            rackmon.shutdown().request();
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

fn main() -> anyhow::Result<ExitCode> {
    init_logging();

    // SAFETY: ignoring SIGPIPE only changes the disposition, no handler runs.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let settings = Settings::from_env().context("invalid configuration")?;
    log::debug!("{settings:?}");
    let _pid_file = lock_pid_file(&settings.pid_file)?;

    let ports = open_ports(&settings)?;
    let status_log = settings
        .status_log
        .as_deref()
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open status log {}", path.display()))
        })
        .transpose()?;
    let server = Server::bind(&settings.socket_path).with_context(|| {
        format!("failed to bind {}", settings.socket_path.display())
    })?;

    let mut rackmon = Rackmon::new(settings, ports);
    if let Some(status_log) = status_log {
        rackmon = rackmon.with_status_log(status_log);
    }
    let rackmon = Arc::new(rackmon);

    spawn_signal_watcher(Arc::clone(&rackmon))?;
    let poller = rackmon
        .spawn_monitor()
        .context("failed to spawn poller")?;

    if let Err(err) = server.serve(&rackmon) {
        log::error!("command server failed: {err}");
        rackmon.shutdown().request();
    }

    log::info!("shutting down");
    rackmon.set_paused(true);
    rackmon.set_min_delay(EXIT_DELAY);
    let restored = rackmon.restore_default_baudrates();
    rackmon.shutdown().request();
    if poller.join().is_err() {
        log::error!("poller thread panicked");
    }
    drop(server);

    if restored {
        Ok(ExitCode::SUCCESS)
    } else {
        log::error!("failed to restore the default baud rate on every PSU");
        Ok(ExitCode::FAILURE)
    }
}
