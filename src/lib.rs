// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Polling [Modbus](https://en.wikipedia.org/wiki/Modbus) RTU master for
//! rack power supplies on a shared RS485 bus.
//!
//! The daemon discovers the PSUs of up to three racks, keeps a ring buffer of
//! samples for every configured register range and serves those samples as
//! well as raw Modbus pass-through to local clients on a UNIX socket.
//!
//! All shared state lives in one [`Rackmon`] context: the poller thread
//! started by [`Rackmon::spawn_monitor`] and the command [`server::Server`]
//! both operate on it.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rackmond::{prelude::*, server::Server, transport::rs485::Rs485Line};
//!
//! # fn main() -> std::io::Result<()> {
//! let settings = Settings::default();
//! let line = Rs485Line::open("/dev/ttyUSB0")?;
//! let rackmon = Arc::new(Rackmon::new(settings, vec![Port::new("/dev/ttyUSB0", line)]));
//! let poller = rackmon.spawn_monitor()?;
//! Server::bind("/var/run/rackmond.sock")?.serve(&rackmon)?;
//! # poller.join().ok();
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]

pub mod prelude;

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod ipc;
pub mod monitor;
pub mod psu;
pub mod rackmon;
pub mod server;
pub mod slave;
pub mod transport;

pub use self::{
    error::{Error, ErrorCode, ProtocolError, Result},
    rackmon::Rackmon,
    slave::{Slave, SlaveId},
};
