// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command dispatcher.
//!
//! One command at a time: read the opcode byte, parse arguments under the
//! per-field timeouts, run the handler, map its tagged result onto the
//! wire. Unknown opcode bytes are dropped without a reply so line noise at
//! session start cannot elicit traffic on an unclaimed port.

#[cfg(feature = "encryption")]
use bl_protocol::PROG_MULTI_MAX;
use bl_protocol::{DeviceInfo, Opcode, Status, PROTOCOL_VERSION};
use heapless::Vec;

#[cfg(feature = "encryption")]
use crate::cipher::{CbcStream, ImageHeader, BLOCK_SIZE, HEADER_BYTES};
use crate::hal::{Board, Flash, Io, Leds};
#[cfg(feature = "encryption")]
use crate::key::{self, KeyState};
use crate::link::Link;
use crate::program::{self, Programmer, BOOT_DELAY_MAX};
use crate::timer::{LedMode, Ticker, TimerId};

// Per-field timeouts, milliseconds. Part of the wire contract.
const EOC_SHORT_MS: u32 = 2;
const EOC_PAYLOAD_MS: u32 = 200;
const EOC_BOOT_MS: u32 = 1000;
const DEVICE_ARG_MS: u32 = 1000;
const SHORT_ARG_MS: u32 = 100;
const LENGTH_MS: u32 = 50;
const PAYLOAD_BYTE_MS: u32 = 1000;

/// Pause between the final `BOOT` reply and returning, so the host can
/// collect it before the port goes away.
const BOOT_GRACE_MS: u32 = 100;

/// Word-aligned staging buffer for one payload.
const PAYLOAD_MAX: usize = 256;

/// Longest ASCII MCU description we will relay.
const DES_MAX: usize = 44;

/// Largest data reply: the description plus its length word.
const REPLY_MAX: usize = DES_MAX + 4;

/// Why the engine returned to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Exit {
    /// The session wait elapsed with no valid command; try the app.
    Timeout,
    /// A `BOOT` command finalised the upload.
    Boot,
}

/// Handler outcome, mapped onto the wire by the main loop.
enum CmdResult {
    Ok,
    Invalid,
    Failed,
    BadKey,
    BadSilicon,
    /// Consume silently, exactly like an unknown opcode.
    Ignored,
}

pub struct Bootloader<'t, IO: Io, F: Flash, B: Board, L: Leds> {
    link: Link<'t, IO>,
    ticker: &'t Ticker,
    flash: F,
    board: B,
    leds: L,
    prog: Programmer,
    reply: Vec<u8, REPLY_MAX>,
    payload: [u8; PAYLOAD_MAX],
    session_armed: bool,
    boot_pending: bool,
    #[cfg(feature = "encryption")]
    ciphertext: [u8; PAYLOAD_MAX],
    #[cfg(feature = "encryption")]
    stream: CbcStream,
    #[cfg(feature = "encryption")]
    header: ImageHeader,
    #[cfg(feature = "encryption")]
    key_state: KeyState,
}

impl<'t, IO: Io, F: Flash, B: Board, L: Leds> Bootloader<'t, IO, F, B, L> {
    pub fn new(io: IO, flash: F, board: B, leds: L, ticker: &'t Ticker) -> Self {
        let fw_size = board.info().fw_size;

        Self {
            link: Link::new(io, ticker),
            ticker,
            flash,
            board,
            leds,
            prog: Programmer::new(fw_size),
            reply: Vec::new(),
            payload: [0; PAYLOAD_MAX],
            session_armed: false,
            boot_pending: false,
            #[cfg(feature = "encryption")]
            ciphertext: [0; PAYLOAD_MAX],
            #[cfg(feature = "encryption")]
            stream: CbcStream::new(),
            #[cfg(feature = "encryption")]
            header: ImageHeader::EMPTY,
            #[cfg(feature = "encryption")]
            key_state: KeyState::Invalid,
        }
    }

    /// Run the update session. With a non-zero `timeout_ms` the engine
    /// gives up after that long without a valid command; the first
    /// command answered `OK` disables the timeout for the rest of the
    /// session. `Invalid` and `Failed` replies do not — they may be
    /// nothing but line noise.
    pub fn run(&mut self, timeout_ms: u32) -> Exit {
        self.boot_pending = false;
        self.session_armed = timeout_ms > 0;

        if self.session_armed {
            self.ticker.start(TimerId::SessionWait, timeout_ms);
        }

        self.ticker.set_led_mode(LedMode::Blink, &mut self.leds);

        #[cfg(feature = "encryption")]
        {
            self.key_state = key::validate(&self.flash);
        }

        info!("update mode, session timeout {=u32} ms", timeout_ms);

        loop {
            self.leds.activity(false);

            let byte = loop {
                if self.session_armed && self.ticker.expired(TimerId::SessionWait) {
                    info!("no valid command, leaving update mode");
                    return Exit::Timeout;
                }

                if let Some(byte) = self.link.read_byte(0) {
                    break byte;
                }

                self.link.idle();
            };

            self.leds.activity(true);

            // noise between commands is dropped without a reply
            let Some(opcode) = Opcode::from_byte(byte) else {
                continue;
            };

            self.reply.clear();

            match self.dispatch(opcode) {
                CmdResult::Ok => {
                    // claim the port that delivered the command before
                    // the first response byte, and stop counting down:
                    // we are talking to a real host now
                    self.link.pin();
                    self.session_armed = false;

                    if !self.reply.is_empty() {
                        self.link.write(&self.reply);
                    }

                    self.link.send_status(Status::Ok);

                    if self.boot_pending {
                        info!("booting application");
                        self.link.delay(BOOT_GRACE_MS);
                        return Exit::Boot;
                    }
                }
                CmdResult::Invalid => self.link.send_status(Status::Invalid),
                CmdResult::Failed => self.link.send_status(Status::Failed),
                CmdResult::BadKey => self.link.send_status(Status::BadKey),
                CmdResult::BadSilicon => self.link.send_status(Status::BadSilicon),
                CmdResult::Ignored => {}
            }
        }
    }

    /// Tear the engine apart again, handing the peripherals back for the
    /// jump to the application.
    pub fn into_parts(self) -> (IO, F, B, L) {
        (self.link.into_io(), self.flash, self.board, self.leds)
    }

    fn dispatch(&mut self, opcode: Opcode) -> CmdResult {
        match opcode {
            Opcode::GetSync => self.cmd_get_sync(),
            Opcode::GetDevice => self.cmd_get_device(),
            Opcode::ChipErase => self.cmd_chip_erase(),
            Opcode::ProgMulti => self.cmd_prog_multi(),
            Opcode::GetCrc => self.cmd_get_crc(),
            Opcode::GetOtp => self.cmd_get_otp(),
            Opcode::GetSn => self.cmd_get_sn(),
            Opcode::GetChip => self.cmd_get_chip(),
            Opcode::GetChipDes => self.cmd_get_chip_des(),
            Opcode::SetDelay => self.cmd_set_delay(),
            Opcode::Boot => self.cmd_boot(),
            // DEBUG carries no EOC; the trailing 0x20 a host may still
            // send is dropped as noise
            Opcode::Debug => CmdResult::Ok,
            #[cfg(feature = "encryption")]
            Opcode::SetIv => self.cmd_set_iv(),
            #[cfg(feature = "encryption")]
            Opcode::ProgMultiEncrypted => self.cmd_prog_multi_encrypted(),
            #[cfg(feature = "encryption")]
            Opcode::CheckCrc => self.cmd_check_crc(),
            Opcode::CheckKey => self.cmd_check_key(),
            // without the encrypted pipeline these bytes are as unknown
            // as any other noise
            #[cfg(not(feature = "encryption"))]
            Opcode::SetIv | Opcode::ProgMultiEncrypted | Opcode::CheckCrc => CmdResult::Ignored,
        }
    }

    fn push_reply(&mut self, bytes: &[u8]) {
        let fits = self.reply.extend_from_slice(bytes).is_ok();
        debug_assert!(fits, "reply buffer sized too small");
    }

    /// Read `len` payload bytes into the staging buffer.
    fn read_payload(&mut self, len: usize) -> bool {
        for slot in self.payload[..len].iter_mut() {
            match self.link.read_byte(PAYLOAD_BYTE_MS) {
                Some(byte) => *slot = byte,
                None => return false,
            }
        }

        true
    }

    fn cmd_get_sync(&mut self) -> CmdResult {
        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        CmdResult::Ok
    }

    fn cmd_get_device(&mut self) -> CmdResult {
        let Some(arg) = self.link.read_byte(DEVICE_ARG_MS) else {
            return CmdResult::Invalid;
        };

        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        let Some(what) = DeviceInfo::from_byte(arg) else {
            return CmdResult::Invalid;
        };

        match what {
            DeviceInfo::BlRev => self.push_reply(&PROTOCOL_VERSION.to_le_bytes()),
            DeviceInfo::BoardId => {
                let id = self.board.info().board_id;
                self.push_reply(&id.to_le_bytes());
            }
            DeviceInfo::BoardRev => {
                let rev = self.board.info().board_rev;
                self.push_reply(&rev.to_le_bytes());
            }
            DeviceInfo::FwSize => {
                let size = self.board.info().fw_size;
                self.push_reply(&size.to_le_bytes());
            }
            DeviceInfo::VecArea => {
                for vector in 7..=10u32 {
                    let word = self.flash.read_word(vector * 4);
                    self.push_reply(&word.to_le_bytes());
                }
            }
        }

        CmdResult::Ok
    }

    fn cmd_chip_erase(&mut self) -> CmdResult {
        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        if !self.board.silicon_ok() {
            return CmdResult::BadSilicon;
        }

        debug!("erasing program area");

        // solid while erasing, dark while verifying, so the LED does not
        // freeze mid-blink
        self.ticker.set_led_mode(LedMode::On, &mut self.leds);
        self.prog.erase_sectors(&mut self.flash);

        self.ticker.set_led_mode(LedMode::Off, &mut self.leds);
        let verified = self.prog.verify_erase(&self.flash);

        self.ticker.set_led_mode(LedMode::Blink, &mut self.leds);

        match verified {
            Ok(()) => CmdResult::Ok,
            Err(_) => CmdResult::Failed,
        }
    }

    fn cmd_prog_multi(&mut self) -> CmdResult {
        let Some(len) = self.link.read_byte(LENGTH_MS) else {
            return CmdResult::Invalid;
        };
        let len = len as usize;

        if len == 0 || len % 4 != 0 {
            return CmdResult::Invalid;
        }

        if !self.prog.fits(len as u32) {
            return CmdResult::Invalid;
        }

        if !self.read_payload(len) {
            return CmdResult::Invalid;
        }

        if !self.link.expect_eoc(EOC_PAYLOAD_MS) {
            return CmdResult::Invalid;
        }

        if self.prog.cursor() == 0 {
            if !self.board.silicon_ok() {
                return CmdResult::BadSilicon;
            }

            // a cleartext download is allowed, but it costs the key:
            // this unit can never again prove it runs vendor firmware
            #[cfg(feature = "encryption")]
            {
                key::zero(&mut self.flash);
                self.key_state = KeyState::Invalid;
            }
        }

        let mut words = [0u32; PAYLOAD_MAX / 4];
        let count = words_from_le(&self.payload[..len], &mut words);

        match self.prog.append(&mut self.flash, &mut words[..count]) {
            Ok(()) => CmdResult::Ok,
            Err(_) => CmdResult::Failed,
        }
    }

    fn cmd_get_crc(&mut self) -> CmdResult {
        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        let sum = self.prog.checksum(&self.flash, self.board.info().fw_size);
        self.push_reply(&sum.to_le_bytes());
        CmdResult::Ok
    }

    fn cmd_get_otp(&mut self) -> CmdResult {
        let Some(offset) = self.link.read_word_le(SHORT_ARG_MS) else {
            return CmdResult::Invalid;
        };

        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        let word = self.flash.read_otp(offset);
        self.push_reply(&word.to_le_bytes());
        CmdResult::Ok
    }

    fn cmd_get_sn(&mut self) -> CmdResult {
        let Some(offset) = self.link.read_word_le(SHORT_ARG_MS) else {
            return CmdResult::Invalid;
        };

        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        let word = self.flash.read_udid(offset);
        self.push_reply(&word.to_le_bytes());
        CmdResult::Ok
    }

    fn cmd_get_chip(&mut self) -> CmdResult {
        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        let id = self.board.mcu_id();
        self.push_reply(&id.to_le_bytes());
        CmdResult::Ok
    }

    fn cmd_get_chip_des(&mut self) -> CmdResult {
        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        let mut desc = [0u8; DES_MAX];
        let len = self.board.mcu_desc(&mut desc).min(DES_MAX);

        self.push_reply(&(len as u32).to_le_bytes());
        self.push_reply(&desc[..len]);
        CmdResult::Ok
    }

    fn cmd_set_delay(&mut self) -> CmdResult {
        // boards without the signature region never learned this opcode
        let Some(offset) = self.board.boot_delay_offset() else {
            return CmdResult::Ignored;
        };

        let Some(seconds) = self.link.read_byte(SHORT_ARG_MS) else {
            return CmdResult::Invalid;
        };

        if seconds > BOOT_DELAY_MAX {
            return CmdResult::Invalid;
        }

        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        match program::set_boot_delay(&mut self.flash, offset, seconds) {
            Ok(()) => CmdResult::Ok,
            Err(_) => CmdResult::Failed,
        }
    }

    fn cmd_boot(&mut self) -> CmdResult {
        if !self.link.expect_eoc(EOC_BOOT_MS) {
            return CmdResult::Invalid;
        }

        match self.prog.finalize(&mut self.flash) {
            Ok(()) => {
                self.boot_pending = true;
                CmdResult::Ok
            }
            Err(_) => CmdResult::Failed,
        }
    }

    #[cfg(feature = "encryption")]
    fn cmd_set_iv(&mut self) -> CmdResult {
        let mut iv = [0u8; BLOCK_SIZE];

        for slot in iv.iter_mut() {
            match self.link.read_byte(PAYLOAD_BYTE_MS) {
                Some(byte) => *slot = byte,
                None => return CmdResult::Invalid,
            }
        }

        if !self.link.expect_eoc(EOC_PAYLOAD_MS) {
            return CmdResult::Invalid;
        }

        self.stream.set_iv(iv);
        CmdResult::Ok
    }

    #[cfg(feature = "encryption")]
    fn cmd_prog_multi_encrypted(&mut self) -> CmdResult {
        let Some(len) = self.link.read_byte(LENGTH_MS) else {
            return CmdResult::Invalid;
        };
        let len = len as usize;

        if len == 0 || len % 4 != 0 {
            return CmdResult::Invalid;
        }

        if !self.prog.fits(len as u32) {
            return CmdResult::Invalid;
        }

        for slot in self.ciphertext[..len].iter_mut() {
            match self.link.read_byte(PAYLOAD_BYTE_MS) {
                Some(byte) => *slot = byte,
                None => return CmdResult::Invalid,
            }
        }

        if !self.link.expect_eoc(EOC_PAYLOAD_MS) {
            return CmdResult::Invalid;
        }

        // the whole frame is consumed before the key gate, so the host
        // always gets an answer to a well-formed command
        if self.key_state != KeyState::Valid {
            return CmdResult::BadKey;
        }

        // the strict upper bound is wire behaviour; hosts have never been
        // able to send a 252-byte encrypted payload
        if len % BLOCK_SIZE != 0 || len >= PROG_MULTI_MAX {
            return CmdResult::Invalid;
        }

        let cipher_key = key::read(&self.flash);
        if self
            .stream
            .decrypt(&cipher_key, &self.ciphertext[..len], &mut self.payload[..len])
            .is_err()
        {
            return CmdResult::Invalid;
        }

        let mut start = 0;

        if self.prog.cursor() == 0 {
            if !self.board.silicon_ok() {
                return CmdResult::BadSilicon;
            }

            self.header = ImageHeader::parse(&self.payload[..HEADER_BYTES]);
            debug!(
                "encrypted image: {=u32} bytes, crc {=u32:#x}",
                self.header.length,
                self.header.crc
            );

            // header words are not flash content
            start = HEADER_BYTES;
        }

        if self.header.length > self.board.info().fw_size {
            // garbage header: decryption has gone wrong, give up early
            return CmdResult::Failed;
        }

        let mut words = [0u32; PAYLOAD_MAX / 4];
        let count = words_from_le(&self.payload[start..len], &mut words);

        match self.prog.append(&mut self.flash, &mut words[..count]) {
            Ok(()) => CmdResult::Ok,
            Err(_) => CmdResult::Failed,
        }
    }

    #[cfg(feature = "encryption")]
    fn cmd_check_crc(&mut self) -> CmdResult {
        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        if self.header.length > self.board.info().fw_size {
            return CmdResult::Failed;
        }

        let sum = self.prog.checksum(&self.flash, self.header.length);

        if sum != self.header.crc {
            warning!("image crc mismatch: {=u32:#x} != {=u32:#x}", sum, self.header.crc);
            return CmdResult::Failed;
        }

        CmdResult::Ok
    }

    fn cmd_check_key(&mut self) -> CmdResult {
        if !self.link.expect_eoc(EOC_SHORT_MS) {
            return CmdResult::Invalid;
        }

        #[cfg(feature = "encryption")]
        if self.key_state == KeyState::Valid {
            return CmdResult::Ok;
        }

        CmdResult::BadKey
    }
}

/// Reassemble little-endian words from a payload; returns the word count.
fn words_from_le(bytes: &[u8], words: &mut [u32]) -> usize {
    let mut count = 0;

    for chunk in bytes.chunks_exact(4) {
        words[count] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        count += 1;
    }

    count
}
