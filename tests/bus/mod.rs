// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Simulated RS485 bus with PSUs that answer from a register map.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::BytesMut;
use rackmond::{
    codec::{append_crc, check_crc},
    config::Settings,
    frame::BaudRate,
    transport::{Port, SerialLine},
    Rackmon,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    /// Request without CRC.
    pub request: Vec<u8>,
    pub baud: BaudRate,
}

#[derive(Default)]
struct BusState {
    psus: HashMap<u8, HashMap<u16, u16>>,
    /// Canned responses that take precedence over the simulation.
    queue: VecDeque<Vec<u8>>,
    sent: Vec<Sent>,
    /// Every transaction times out while set.
    dead: bool,
}

#[derive(Clone, Default)]
pub struct Bus {
    state: Arc<Mutex<BusState>>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus").finish_non_exhaustive()
    }
}

/// Status log sink that can be inspected after the fact.
#[derive(Debug, Clone, Default)]
pub struct SharedLog(Arc<Mutex<Vec<u8>>>);

impl SharedLog {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for SharedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Appends the CRC to `payload`.
pub fn with_crc(payload: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::from(payload);
    append_crc(&mut frame);
    frame.to_vec()
}

/// A read holding registers response carrying `values`.
pub fn read_response(slave: u8, values: &[u16]) -> Vec<u8> {
    let mut payload = vec![slave, 0x03, (values.len() * 2) as u8];
    for value in values {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    with_crc(&payload)
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a PSU whose registers all read as `0` until set.
    pub fn add_psu(&self, slave: u8) {
        self.state.lock().unwrap().psus.entry(slave).or_default();
    }

    pub fn set_register(&self, slave: u8, register: u16, value: u16) {
        self.state
            .lock()
            .unwrap()
            .psus
            .entry(slave)
            .or_default()
            .insert(register, value);
    }

    pub fn register(&self, slave: u8, register: u16) -> Option<u16> {
        self.state
            .lock()
            .unwrap()
            .psus
            .get(&slave)
            .and_then(|regs| regs.get(&register).copied())
    }

    pub fn enqueue(&self, response: Vec<u8>) {
        self.state.lock().unwrap().queue.push_back(response);
    }

    pub fn set_dead(&self, dead: bool) {
        self.state.lock().unwrap().dead = dead;
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_to(&self, slave: u8) -> usize {
        self.sent().iter().filter(|s| s.request[0] == slave).count()
    }

    pub fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    pub fn line(&self) -> BusLine {
        BusLine { bus: self.clone() }
    }

    /// An unconfigured daemon context talking to this bus.
    pub fn rackmon(&self, settings: Settings) -> Arc<Rackmon> {
        Arc::new(Rackmon::new(settings, vec![Port::new("sim", self.line())]))
    }

    pub fn rackmon_with_log(&self, settings: Settings, log: SharedLog) -> Arc<Rackmon> {
        Arc::new(Rackmon::new(settings, vec![Port::new("sim", self.line())]).with_status_log(log))
    }
}

fn respond(psus: &mut HashMap<u8, HashMap<u16, u16>>, request: &[u8]) -> Vec<u8> {
    let Some(regs) = psus.get_mut(&request[0]) else {
        return Vec::new();
    };
    let word = |i: usize| u16::from_be_bytes([request[i], request[i + 1]]);
    match request[1] {
        0x03 => {
            let (start, count) = (word(2), word(4));
            let values: Vec<u16> = (start..start + count)
                .map(|reg| regs.get(&reg).copied().unwrap_or(0))
                .collect();
            read_response(request[0], &values)
        }
        0x06 => {
            regs.insert(word(2), word(4));
            with_crc(&request[..6])
        }
        0x10 => {
            let (start, count) = (word(2), word(4));
            for i in 0..count {
                regs.insert(start + i, word(7 + 2 * usize::from(i)));
            }
            with_crc(&request[..6])
        }
        function => with_crc(&[request[0], function | 0x80, 0x01]),
    }
}

#[derive(Debug)]
pub struct BusLine {
    bus: Bus,
}

impl SerialLine for BusLine {
    fn exchange(
        &mut self,
        frame: &[u8],
        max_len: usize,
        _timeout: Duration,
        baud: BaudRate,
    ) -> io::Result<Vec<u8>> {
        let mut state = self.bus.state.lock().unwrap();
        assert!(check_crc(frame), "request sent with a bad crc");
        let request = frame[..frame.len() - 2].to_vec();
        state.sent.push(Sent {
            request: request.clone(),
            baud,
        });
        if let Some(mut response) = state.queue.pop_front() {
            response.truncate(max_len);
            return Ok(response);
        }
        if state.dead {
            return Ok(Vec::new());
        }
        let mut response = respond(&mut state.psus, &request);
        response.truncate(max_len);
        Ok(response)
    }
}
