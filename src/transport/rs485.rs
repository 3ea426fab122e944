// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RS485 serial line on Linux.
//!
//! The receiver is disabled while transmitting and only re-enabled once the
//! UART reports its shift register empty. The write and the drain run at
//! real-time priority so the direction flip isn't delayed by preemption.

use std::{
    io,
    os::fd::{AsRawFd as _, RawFd},
    path::Path,
    time::{Duration, Instant},
};

use serialport::{DataBits, FlowControl, Parity, StopBits, TTYPort};

use super::SerialLine;
use crate::frame::BaudRate;

// <linux/serial.h> and <asm-generic/ioctls.h>
const TIOCSERGETLSR: libc::c_ulong = 0x5459;
const TIOCSER_TEMT: libc::c_int = 0x01;
const TIOCSRS485: libc::c_ulong = 0x542F;
const SER_RS485_ENABLED: u32 = 1 << 0;
const SER_RS485_RTS_AFTER_SEND: u32 = 1 << 2;
const SER_RS485_RX_DURING_TX: u32 = 1 << 4;

#[repr(C)]
#[derive(Debug, Default)]
struct SerialRs485 {
    flags: u32,
    delay_rts_before_send: u32,
    delay_rts_after_send: u32,
    padding: [u32; 5],
}

const REALTIME_PRIORITY: libc::c_int = 50;

/// Upper bound for the transmit drain of one frame.
const DRAIN_DEADLINE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 16;

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// An opened RS485 tty.
#[derive(Debug)]
pub struct Rs485Line {
    port: TTYPort,
}

impl Rs485Line {
    /// Opens `path` and switches the driver into RS485 mode.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_string_lossy();
        let port = serialport::new(&*path, BaudRate::default().bps())
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native()?;
        let line = Self { port };
        line.enable_rs485()?;
        log::info!("opened rs485 line {path}");
        Ok(line)
    }

    fn fd(&self) -> RawFd {
        self.port.as_raw_fd()
    }

    fn enable_rs485(&self) -> io::Result<()> {
        let conf = SerialRs485 {
            flags: SER_RS485_ENABLED | SER_RS485_RTS_AFTER_SEND | SER_RS485_RX_DURING_TX,
            ..Default::default()
        };
        // SAFETY: the fd is open for the lifetime of `self` and `conf` matches
        // the kernel's `struct serial_rs485`.
        check(unsafe { libc::ioctl(self.fd(), TIOCSRS485 as _, &conf as *const SerialRs485) })?;
        Ok(())
    }

    fn apply(&self, tio: &libc::termios) -> io::Result<()> {
        // SAFETY: valid fd and fully initialized termios.
        check(unsafe { libc::tcsetattr(self.fd(), libc::TCSANOW, tio) })?;
        Ok(())
    }

    /// Busy-waits until the last byte has left the UART.
    ///
    /// Sleeping here would add scheduler latency before the receiver is
    /// switched back on, so the loop spins on the line status register.
    fn drain(&self) -> io::Result<usize> {
        let started = Instant::now();
        let mut loops = 0;
        loop {
            let mut lsr: libc::c_int = 0;
            // SAFETY: TIOCSERGETLSR writes a single int.
            check(unsafe { libc::ioctl(self.fd(), TIOCSERGETLSR as _, &mut lsr as *mut libc::c_int) })?;
            if lsr & TIOCSER_TEMT != 0 {
                return Ok(loops);
            }
            loops += 1;
            if started.elapsed() > DRAIN_DEADLINE {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "transmitter never became empty",
                ));
            }
        }
    }

    fn write_all(&self, mut frame: &[u8]) -> io::Result<()> {
        while !frame.is_empty() {
            // SAFETY: the pointer and length describe a live slice.
            let ret = unsafe { libc::write(self.fd(), frame.as_ptr().cast(), frame.len()) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) {
                    continue;
                }
                return Err(err);
            }
            frame = &frame[ret.unsigned_abs()..];
        }
        Ok(())
    }

    /// Reads until `max_len` bytes or a quiet gap of `timeout`.
    fn read_wait(&self, max_len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(max_len);
        let timeout_ms = libc::c_int::try_from(timeout.as_millis().max(1)).unwrap_or(libc::c_int::MAX);
        let mut chunk = [0u8; READ_CHUNK];
        while buf.len() < max_len {
            let mut pfd = libc::pollfd {
                fd: self.fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: one valid pollfd.
            let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ready == 0 {
                break;
            }
            let want = READ_CHUNK.min(max_len - buf.len());
            // SAFETY: `chunk` has room for `want` bytes.
            let ret = unsafe { libc::read(self.fd(), chunk.as_mut_ptr().cast(), want) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) {
                    continue;
                }
                return Err(err);
            }
            if ret == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..ret.unsigned_abs()]);
        }
        Ok(buf)
    }
}

fn speed(baud: BaudRate) -> libc::speed_t {
    match baud {
        BaudRate::B19200 => libc::B19200,
        BaudRate::B38400 => libc::B38400,
        BaudRate::B57600 => libc::B57600,
        BaudRate::B115200 => libc::B115200,
    }
}

/// Even parity, 8 data bits, parity checking, receiver off.
fn transmit_termios(baud: BaudRate) -> io::Result<libc::termios> {
    // SAFETY: termios is plain old data, all-zero is a valid starting point.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: `tio` is a valid termios.
    check(unsafe { libc::cfsetspeed(&mut tio, speed(baud)) })?;
    tio.c_cflag |= libc::PARENB | libc::CLOCAL | libc::CS8;
    tio.c_iflag |= libc::INPCK;
    tio.c_cc[libc::VMIN] = 1;
    tio.c_cc[libc::VTIME] = 0;
    Ok(tio)
}

/// Runs the current thread under `SCHED_FIFO` until dropped.
struct RealtimePriority {
    raised: bool,
}

impl RealtimePriority {
    fn raise() -> Self {
        let raised = set_scheduler(libc::SCHED_FIFO, REALTIME_PRIORITY);
        Self { raised }
    }
}

impl Drop for RealtimePriority {
    fn drop(&mut self) {
        if self.raised {
            set_scheduler(libc::SCHED_OTHER, 0);
        }
    }
}

fn set_scheduler(policy: libc::c_int, priority: libc::c_int) -> bool {
    // SAFETY: sched_param is plain old data.
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;
    // SAFETY: `param` outlives the call and pthread_self() is always valid.
    let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
    if ret != 0 {
        log::debug!(
            "pthread_setschedparam({policy}, {priority}) failed: {}",
            io::Error::from_raw_os_error(ret)
        );
    }
    ret == 0
}

impl SerialLine for Rs485Line {
    fn exchange(
        &mut self,
        frame: &[u8],
        max_len: usize,
        timeout: Duration,
        baud: BaudRate,
    ) -> io::Result<Vec<u8>> {
        let mut tio = transmit_termios(baud)?;
        self.apply(&tio)?;

        let loops = {
            let _priority = RealtimePriority::raise();
            self.write_all(frame)?;
            self.drain()?
        };
        tio.c_cflag |= libc::CREAD;
        self.apply(&tio)?;
        log::trace!("transmitter drained after {loops} polls");

        self.read_wait(max_len, timeout)
    }
}
