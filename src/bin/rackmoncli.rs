// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command line client of the rack monitor daemon

use std::{
    io::{self, Write as _},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};

use rackmond::{
    codec::{
        command::{decode_raw_response, RawResponse, MAX_BODY_LEN},
        decode_hex, encode_hex,
    },
    config::DEFAULT_SOCKET_PATH,
    frame::command::{Command, MonitorInterval, MonitoringConfig, RawModbus},
    ipc::send_command,
};

/// Tag, length, expected length and timeout in front of the raw request bytes.
const RAW_HEADER_LEN: usize = 8;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Command socket of the daemon
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Send a raw Modbus request, given as hex without CRC
    Raw {
        request: String,
        /// Expected response length including CRC, 0 reads up to 1024 bytes
        #[arg(short = 'x', long, default_value_t = 0)]
        expected: u16,
        /// Response timeout in milliseconds, 0 uses the daemon default
        #[arg(short, long, default_value_t = 0)]
        timeout: u16,
    },
    /// Print the link state of every PSU
    Status,
    /// Dump the recorded samples as JSON
    Data,
    /// Dump the recorded samples in human readable form
    Info,
    /// Pause monitoring
    Pause,
    /// Resume monitoring
    Resume,
    /// Trigger a PSU scan
    Scan,
    /// Configure the monitored register ranges, once per daemon lifetime
    Configure {
        /// Ranges as `begin:len:keep[:flags]`, numbers in decimal or 0x hex
        #[arg(required = true)]
        intervals: Vec<String>,
    },
}

fn parse_number(text: &str) -> anyhow::Result<u32> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid number {text:?}"))
}

fn parse_interval(text: &str) -> anyhow::Result<MonitorInterval> {
    let fields = text
        .split(':')
        .map(parse_number)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let (begin, len, keep, flags) = match fields[..] {
        [begin, len, keep] => (begin, len, keep, 0),
        [begin, len, keep, flags] => (begin, len, keep, flags),
        _ => bail!("expected begin:len:keep[:flags], got {text:?}"),
    };
    Ok(MonitorInterval::new(
        u16::try_from(begin).context("begin out of range")?,
        u16::try_from(len).context("len out of range")?,
        keep,
        flags,
    ))
}

fn command(action: &Action) -> anyhow::Result<Command> {
    let command = match action {
        Action::Raw {
            request,
            expected,
            timeout,
        } => {
            let data = decode_hex(request)?;
            if data.is_empty() {
                bail!("empty request");
            }
            if data.len() + RAW_HEADER_LEN > MAX_BODY_LEN {
                bail!(
                    "request of {} bytes exceeds the limit of {} bytes",
                    data.len(),
                    MAX_BODY_LEN - RAW_HEADER_LEN
                );
            }
            Command::RawModbus(RawModbus {
                expected_response_len: *expected,
                custom_timeout_ms: *timeout,
                data,
            })
        }
        Action::Status => Command::DumpStatus,
        Action::Data => Command::DumpDataJson,
        Action::Info => Command::DumpDataInfo,
        Action::Pause => Command::PauseMonitoring,
        Action::Resume => Command::StartMonitoring,
        Action::Scan => Command::ForceScan,
        Action::Configure { intervals } => Command::SetConfig(MonitoringConfig {
            intervals: intervals
                .iter()
                .map(|text| parse_interval(text))
                .collect::<anyhow::Result<_>>()?,
        }),
    };
    Ok(command)
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"),
    );
    let args = Args::parse();
    let command = command(&args.action)?;
    let response = send_command(&args.socket, &command)
        .with_context(|| format!("failed to talk to {}", args.socket.display()))?;

    let mut stdout = io::stdout().lock();
    match &command {
        Command::RawModbus(_) => match decode_raw_response(&response)? {
            RawResponse::Data(data) => writeln!(stdout, "{}", encode_hex(&data))?,
            RawResponse::Error(code) => {
                match rackmond::ErrorCode::new(code) {
                    Some(code) => eprintln!("modbus error: {code}"),
                    None => eprintln!("modbus error: {code}"),
                }
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::PauseMonitoring | Command::StartMonitoring => {
            let Some(&previous) = response.first() else {
                bail!("empty response");
            };
            let state = match (&command, previous != 0) {
                (Command::PauseMonitoring, true) => "Monitoring was already paused",
                (Command::PauseMonitoring, false) => "Monitoring paused",
                (_, true) => "Monitoring was already running",
                (_, false) => "Monitoring resumed",
            };
            writeln!(stdout, "{state}")?;
        }
        _ => {
            stdout.write_all(&response)?;
            if response.starts_with(b"error:") {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(request: String) -> Action {
        Action::Raw {
            request,
            expected: 0,
            timeout: 0,
        }
    }

    #[test]
    fn raw_request_must_fit_a_command_body() {
        // Given
        let largest = "a0".repeat(MAX_BODY_LEN - RAW_HEADER_LEN);
        let oversized = "a0".repeat(MAX_BODY_LEN - RAW_HEADER_LEN + 1);
        let huge = "a0".repeat(usize::from(u16::MAX) + 1);

        // When
        let largest = command(&raw(largest));
        let oversized = command(&raw(oversized));
        let huge = command(&raw(huge));

        // Then
        let Command::RawModbus(accepted) = largest.unwrap() else {
            panic!("not a raw command");
        };
        assert_eq!(accepted.data.len(), MAX_BODY_LEN - RAW_HEADER_LEN);
        assert!(oversized.unwrap_err().to_string().contains("exceeds the limit"));
        assert!(huge.is_err());
    }

    #[test]
    fn configure_parses_intervals() {
        let action = Action::Configure {
            intervals: vec!["0x68:1:32:0x1001".to_owned(), "128:8:4".to_owned()],
        };
        let Command::SetConfig(config) = command(&action).unwrap() else {
            panic!("not a config command");
        };
        assert_eq!(
            config.intervals,
            vec![
                MonitorInterval::new(0x68, 1, 32, 0x1001),
                MonitorInterval::new(0x80, 8, 4, 0),
            ]
        );
        assert!(parse_interval("0x68:1").is_err());
    }
}
