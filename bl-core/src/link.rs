// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command link: channel multiplexing, framing reads and reply emission.
//!
//! Until the first valid command completes, both physical ports are
//! polled and the one that delivered the most recent byte is remembered.
//! [`Link::pin`] then locks the session to that port; all replies go
//! there. Writing while unpinned is a no-op, which keeps error replies to
//! line noise from being broadcast.

use bl_protocol::{Status, EOC, INSYNC};

use crate::hal::{Io, Port};
use crate::timer::{Ticker, TimerId};

pub struct Link<'t, IO: Io> {
    io: IO,
    ticker: &'t Ticker,
    active: Option<Port>,
    last_source: Option<Port>,
}

impl<'t, IO: Io> Link<'t, IO> {
    pub fn new(io: IO, ticker: &'t Ticker) -> Self {
        Self {
            io,
            ticker,
            active: None,
            last_source: None,
        }
    }

    /// Single multiplexed poll. Unpinned sessions poll both ports, USB
    /// first; pinned sessions poll only their port.
    fn poll_byte(&mut self) -> Option<u8> {
        let ports: &[Port] = match self.active {
            Some(ref p) => core::slice::from_ref(p),
            None => &[Port::Usb, Port::Usart],
        };

        for &port in ports {
            if let Some(byte) = self.io.poll(port) {
                self.last_source = Some(port);
                return Some(byte);
            }
        }

        None
    }

    /// Read one byte, giving up after `timeout_ms`. A zero timeout polls
    /// once without waiting.
    pub fn read_byte(&mut self, timeout_ms: u32) -> Option<u8> {
        self.ticker.start(TimerId::CommandRead, timeout_ms);

        loop {
            if let Some(byte) = self.poll_byte() {
                return Some(byte);
            }

            if self.ticker.expired(TimerId::CommandRead) {
                return None;
            }

            self.io.idle();
        }
    }

    /// Read a little-endian word. Each byte gets the full `timeout_ms`
    /// budget again; the leniency is part of the wire contract.
    pub fn read_word_le(&mut self, timeout_ms: u32) -> Option<u32> {
        let mut bytes = [0u8; 4];

        for byte in bytes.iter_mut() {
            *byte = self.read_byte(timeout_ms)?;
        }

        Some(u32::from_le_bytes(bytes))
    }

    /// Consume the end-of-command sentinel.
    pub fn expect_eoc(&mut self, timeout_ms: u32) -> bool {
        self.read_byte(timeout_ms) == Some(EOC)
    }

    /// Pin the session to the port that delivered the current command.
    /// Idempotent; called before the first response bytes go out.
    pub fn pin(&mut self) {
        if self.active.is_none() {
            self.active = self.last_source;
        }
    }

    /// Write raw reply bytes to the pinned port. No-op while unpinned.
    pub fn write(&mut self, data: &[u8]) {
        if let Some(port) = self.active {
            self.io.write(port, data);
        }
    }

    /// Emit the two-byte status trailer.
    pub fn send_status(&mut self, status: Status) {
        self.write(&[INSYNC, status as u8]);
    }

    /// Busy-wait for `ms` milliseconds.
    pub fn delay(&mut self, ms: u32) {
        self.ticker.start(TimerId::Delay, ms);

        while !self.ticker.expired(TimerId::Delay) {
            self.io.idle();
        }
    }

    /// One spin of the idle loop.
    pub fn idle(&mut self) {
        self.io.idle();
    }

    pub fn into_io(self) -> IO {
        self.io
    }
}
