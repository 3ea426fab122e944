// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types

///////////////////////////////////////////////////////////////////
/// Types
///////////////////////////////////////////////////////////////////
pub use crate::{
    config::Settings,
    frame::{
        command::{Command, MonitorInterval, MonitoringConfig},
        BaudRate,
    },
    rackmon::Rackmon,
    slave::{Addressing, AddressingScheme, PsuLocation, Slave, SlaveId},
    transport::Port,
};

///////////////////////////////////////////////////////////////////
/// Traits
///////////////////////////////////////////////////////////////////
pub use crate::transport::SerialLine;
