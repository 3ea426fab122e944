// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client side of the command socket.

use std::{
    io::{self, Read as _, Write as _},
    os::unix::net::UnixStream,
    path::Path,
};

use crate::{codec::command::encode_request, frame::command::Command};

/// Sends `command` to the daemon listening on `path` and returns the raw response.
pub fn send_command(path: impl AsRef<Path>, command: &Command) -> io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(path)?;
    stream.write_all(&encode_request(command))?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    Ok(response)
}
