// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command socket framing.
//!
//! Clients run on the same host, so every integer uses the native byte order.

use std::io::{self, Cursor, Read as _, Write};

use byteorder::{NativeEndian, ReadBytesExt as _};
use bytes::{BufMut as _, BytesMut};

use super::u16_len;
use crate::{
    error::{Error, ErrorCode, Result},
    frame::{
        command::{Command, CommandType, MonitorInterval, MonitoringConfig, RawModbus},
        MAX_READ_QUANTITY,
    },
    psu::{history_bytes, MAX_HISTORY_BYTES},
};

/// Largest accepted command body.
pub const MAX_BODY_LEN: usize = 1024;

/// Response capacity of a raw Modbus command that doesn't name one.
pub const MAX_RAW_RESPONSE_LEN: usize = 1024;

const INTERVAL_SIZE: usize = 2 + 2 + 4 + 4;

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidCommand(msg.into())
}

fn truncated(_: io::Error) -> Error {
    invalid("truncated command body")
}

/// Validates the length prefix of a request.
pub fn check_body_len(len: u16) -> Result<usize> {
    let len = usize::from(len);
    if len == 0 || len > MAX_BODY_LEN {
        return Err(invalid(format!("bad body length {len}")));
    }
    Ok(len)
}

pub fn decode_command(body: &[u8]) -> Result<Command> {
    let mut rdr = Cursor::new(body);
    let tag = rdr.read_u16::<NativeEndian>().map_err(truncated)?;
    let command_type =
        CommandType::new(tag).ok_or_else(|| invalid(format!("unknown command type {tag}")))?;
    let command = match command_type {
        CommandType::RawModbus => {
            let len = rdr.read_u16::<NativeEndian>().map_err(truncated)?;
            let expected_response_len = rdr.read_u16::<NativeEndian>().map_err(truncated)?;
            let custom_timeout_ms = rdr.read_u16::<NativeEndian>().map_err(truncated)?;
            if len == 0 {
                return Err(invalid("empty raw modbus request"));
            }
            let mut data = vec![0; usize::from(len)];
            rdr.read_exact(&mut data).map_err(truncated)?;
            Command::RawModbus(RawModbus {
                expected_response_len,
                custom_timeout_ms,
                data,
            })
        }
        CommandType::SetConfig => {
            let count = usize::from(rdr.read_u16::<NativeEndian>().map_err(truncated)?);
            let remaining = body.len().saturating_sub(4);
            if count * INTERVAL_SIZE > remaining {
                return Err(invalid(format!("{count} intervals don't fit the body")));
            }
            let mut intervals = Vec::with_capacity(count);
            for _ in 0..count {
                let begin = rdr.read_u16::<NativeEndian>().map_err(truncated)?;
                let len = rdr.read_u16::<NativeEndian>().map_err(truncated)?;
                let keep = rdr.read_u32::<NativeEndian>().map_err(truncated)?;
                let flags = rdr.read_u32::<NativeEndian>().map_err(truncated)?;
                let interval = MonitorInterval::new(begin, len, keep, flags);
                check_interval(&interval)?;
                intervals.push(interval);
            }
            check_history_budget(&intervals)?;
            Command::SetConfig(MonitoringConfig { intervals })
        }
        CommandType::DumpDataJson => Command::DumpDataJson,
        CommandType::DumpDataInfo => Command::DumpDataInfo,
        CommandType::PauseMonitoring => Command::PauseMonitoring,
        CommandType::StartMonitoring => Command::StartMonitoring,
        CommandType::DumpStatus => Command::DumpStatus,
        CommandType::ForceScan => Command::ForceScan,
    };
    Ok(command)
}

fn check_interval(interval: &MonitorInterval) -> Result<()> {
    if interval.len == 0 || interval.len > MAX_READ_QUANTITY {
        return Err(invalid(format!(
            "register count {} at 0x{:04X} out of range",
            interval.len, interval.begin
        )));
    }
    if interval.keep == 0 {
        return Err(invalid(format!(
            "interval at 0x{:04X} keeps no samples",
            interval.begin
        )));
    }
    Ok(())
}

fn check_history_budget(intervals: &[MonitorInterval]) -> Result<()> {
    match history_bytes(intervals) {
        Some(total) if total <= MAX_HISTORY_BYTES => Ok(()),
        _ => Err(invalid(format!(
            "sample history exceeds {MAX_HISTORY_BYTES} bytes per psu"
        ))),
    }
}

/// Serializes a command body.
#[must_use]
pub fn encode_command(command: &Command) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u16_ne(command.command_type().value());
    match command {
        Command::RawModbus(raw) => {
            buf.put_u16_ne(u16_len(raw.data.len()));
            buf.put_u16_ne(raw.expected_response_len);
            buf.put_u16_ne(raw.custom_timeout_ms);
            buf.put_slice(&raw.data);
        }
        Command::SetConfig(config) => {
            buf.put_u16_ne(u16_len(config.intervals.len()));
            for interval in &config.intervals {
                buf.put_u16_ne(interval.begin);
                buf.put_u16_ne(interval.len);
                buf.put_u32_ne(interval.keep);
                buf.put_u32_ne(interval.flags.0);
            }
        }
        Command::DumpDataJson
        | Command::DumpDataInfo
        | Command::PauseMonitoring
        | Command::StartMonitoring
        | Command::DumpStatus
        | Command::ForceScan => {}
    }
    buf
}

/// Serializes a command body behind its length prefix.
#[must_use]
pub fn encode_request(command: &Command) -> BytesMut {
    let body = encode_command(command);
    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u16_ne(u16_len(body.len()));
    buf.put_slice(&body);
    buf
}

/// Writes a successful raw Modbus response.
pub fn write_raw_response<W: Write>(out: &mut W, response: &[u8]) -> io::Result<()> {
    out.write_all(&u16_len(response.len()).to_ne_bytes())?;
    out.write_all(response)
}

/// Writes a failed raw Modbus response: a zero length followed by the code.
pub fn write_raw_error<W: Write>(out: &mut W, code: ErrorCode) -> io::Result<()> {
    out.write_all(&0u16.to_ne_bytes())?;
    out.write_all(&code.value().to_ne_bytes())
}

/// Outcome of a raw Modbus command as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResponse {
    Data(Vec<u8>),
    /// The daemon reported an error; unknown codes are kept verbatim.
    Error(u16),
}

impl RawResponse {
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Error(code) => ErrorCode::new(*code),
            Self::Data(_) => None,
        }
    }
}

pub fn decode_raw_response(response: &[u8]) -> Result<RawResponse> {
    let mut rdr = Cursor::new(response);
    let len = usize::from(rdr.read_u16::<NativeEndian>().map_err(truncated)?);
    if len == 0 {
        let code = rdr.read_u16::<NativeEndian>().map_err(truncated)?;
        return Ok(RawResponse::Error(code));
    }
    let mut data = vec![0; len];
    rdr.read_exact(&mut data).map_err(truncated)?;
    Ok(RawResponse::Data(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_raw_modbus() {
        // Given
        let command = Command::RawModbus(RawModbus {
            expected_response_len: 7,
            custom_timeout_ms: 100,
            data: vec![0xA4, 0x03, 0x00, 0x68, 0x00, 0x01],
        });
        let body = encode_command(&command);

        // When
        let decoded = decode_command(&body).unwrap();

        // Then
        assert_eq!(decoded, command);
        assert_eq!(body.len(), 8 + 6);
    }

    #[test]
    fn decode_set_config() {
        let command = Command::SetConfig(MonitoringConfig {
            intervals: vec![
                MonitorInterval::new(0x00, 8, 1, 0x8000),
                MonitorInterval::new(0x68, 1, 10, 0x1001),
            ],
        });
        let body = encode_command(&command);
        assert_eq!(body.len(), 4 + 2 * INTERVAL_SIZE);
        assert_eq!(decode_command(&body).unwrap(), command);
    }

    #[test]
    fn reject_out_of_range_intervals() {
        for interval in [
            MonitorInterval::new(0x00, 0, 1, 0),
            MonitorInterval::new(0x00, 126, 1, 0),
            MonitorInterval::new(0x00, 1, 0, 0),
        ] {
            let body = encode_command(&Command::SetConfig(MonitoringConfig {
                intervals: vec![interval],
            }));
            assert!(matches!(
                decode_command(&body),
                Err(Error::InvalidCommand(_))
            ));
        }
    }

    #[test]
    fn reject_history_beyond_budget() {
        // Given
        let set_config =
            |intervals| encode_command(&Command::SetConfig(MonitoringConfig { intervals }));
        let huge_keep = set_config(vec![MonitorInterval::new(0x80, 125, u32::MAX, 0)]);
        let split = set_config(vec![
            MonitorInterval::new(0x00, 125, 600, 0),
            MonitorInterval::new(0x80, 125, 600, 0),
        ]);
        let fits = set_config(vec![MonitorInterval::new(0x80, 125, 1032, 0)]);

        // When
        let huge_keep = decode_command(&huge_keep);
        let split = decode_command(&split);
        let fits = decode_command(&fits);

        // Then
        assert!(matches!(huge_keep, Err(Error::InvalidCommand(_))));
        assert!(matches!(split, Err(Error::InvalidCommand(_))));
        assert!(fits.is_ok());
    }

    #[test]
    fn reject_truncated_and_unknown_bodies() {
        assert!(decode_command(&[]).is_err());
        assert!(decode_command(&99u16.to_ne_bytes()).is_err());

        let mut body = encode_command(&Command::SetConfig(MonitoringConfig {
            intervals: vec![MonitorInterval::new(0x68, 1, 1, 0)],
        }));
        body.truncate(body.len() - 1);
        assert!(decode_command(&body).is_err());

        let mut body = encode_command(&Command::RawModbus(RawModbus {
            expected_response_len: 0,
            custom_timeout_ms: 0,
            data: vec![0xA4, 0x03],
        }));
        body.truncate(body.len() - 1);
        assert!(decode_command(&body).is_err());
    }

    #[test]
    fn body_length_limits() {
        assert!(check_body_len(0).is_err());
        assert_eq!(check_body_len(2).unwrap(), 2);
        assert_eq!(check_body_len(1024).unwrap(), 1024);
        assert!(check_body_len(1025).is_err());
    }

    #[test]
    fn request_has_length_prefix() {
        let buf = encode_request(&Command::DumpStatus);
        assert_eq!(&buf[..2], &2u16.to_ne_bytes());
        assert_eq!(&buf[2..], &6u16.to_ne_bytes());
    }

    #[test]
    fn raw_response_framing() {
        let mut out = Vec::new();
        write_raw_error(&mut out, ErrorCode::PsuTimeout).unwrap();
        assert_eq!(decode_raw_response(&out).unwrap(), RawResponse::Error(6));
        assert_eq!(
            RawResponse::Error(6).error_code(),
            Some(ErrorCode::PsuTimeout)
        );

        let mut out = Vec::new();
        write_raw_response(&mut out, &[0xA4, 0x03]).unwrap();
        assert_eq!(
            decode_raw_response(&out).unwrap(),
            RawResponse::Data(vec![0xA4, 0x03])
        );
    }
}
