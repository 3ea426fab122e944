// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command server on a local UNIX socket.
//!
//! Connections are served one after the other on the calling thread. Every
//! request is a native endian `u16` body length followed by the command body;
//! the response is whatever the handler writes before the socket is closed.

mod handlers;
pub mod info;

use std::{
    fs,
    io::{self, BufWriter, Read, Write},
    os::{
        fd::{AsRawFd as _, RawFd},
        unix::net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    time::Duration,
};

use socket2::{Domain, SockAddr, Socket, Type};

use crate::{
    codec::command::{check_body_len, decode_command},
    rackmon::{Rackmon, Shutdown},
};

/// Interval at which blocked reads re-check the shutdown flag.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const LISTEN_BACKLOG: i32 = 20;
const WRITE_BUFFER_SIZE: usize = 128 * 1024;

/// Waits until `fd` is readable, `false` on timeout.
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: one valid pollfd for the duration of the call.
    let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    match ready {
        -1 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
        0 => Ok(false),
        _ => Ok(true),
    }
}

/// Fills `buf` from the stream, giving up once a shutdown is requested.
///
/// Returns `false` if the peer closed the connection or a shutdown interrupted
/// the read.
fn recv_exact(stream: &mut UnixStream, buf: &mut [u8], shutdown: &Shutdown) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        if shutdown.is_requested() {
            return Ok(false);
        }
        if !wait_readable(stream.as_raw_fd(), POLL_INTERVAL)? {
            log::trace!("connection idle");
            continue;
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

/// A bound command socket; the socket file is removed on drop.
#[derive(Debug)]
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
}

impl Server {
    /// Binds the command socket, replacing a stale socket file.
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("removed stale socket {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&SockAddr::unix(&path)?)?;
        socket.listen(LISTEN_BACKLOG)?;
        log::info!("listening on {}", path.display());
        Ok(Self {
            listener: socket.into(),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts and serves connections until a shutdown is requested.
    pub fn serve(&self, rackmon: &Rackmon) -> io::Result<()> {
        while !rackmon.shutdown().is_requested() {
            if !wait_readable(self.listener.as_raw_fd(), POLL_INTERVAL)? {
                continue;
            }
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if let Err(err) = handle_connection(stream, rackmon) {
                log::warn!("connection failed: {err}");
            }
        }
        log::debug!("command server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::debug!("failed to remove {}: {err}", self.path.display());
        }
    }
}

/// Reads one request from `stream`, runs it and writes the response.
pub fn handle_connection(mut stream: UnixStream, rackmon: &Rackmon) -> io::Result<()> {
    let shutdown = rackmon.shutdown();
    let mut header = [0u8; 2];
    if !recv_exact(&mut stream, &mut header, shutdown)? {
        return Ok(());
    }
    let body_len = match check_body_len(u16::from_ne_bytes(header)) {
        Ok(len) => len,
        Err(err) => {
            log::warn!("rejected request: {err}");
            return Ok(());
        }
    };
    let mut body = vec![0; body_len];
    if !recv_exact(&mut stream, &mut body, shutdown)? {
        return Ok(());
    }

    let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, &stream);
    let result = decode_command(&body).and_then(|command| rackmon.handle_command(&command, &mut out));
    if let Err(err) = result {
        log::warn!("command failed: {err}");
        writeln!(out, "error: {err}")?;
    }
    out.flush()
}
