// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Contracts the board-support layer must satisfy.
//!
//! The protocol engine never touches hardware directly; everything below
//! the byte stream and above the flash controller registers comes in
//! through these traits.

/// Identity of the two physical command links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Port {
    Usb,
    Usart,
}

/// Byte-level access to the physical links.
pub trait Io {
    /// Non-blocking read of the next byte queued on `port`.
    fn poll(&mut self, port: Port) -> Option<u8>;

    /// Write `data` to `port`, blocking until it is accepted.
    fn write(&mut self, port: Port, data: &[u8]);

    /// Called while the mainline busy-waits on a timer. Hardware
    /// implementations typically do nothing (the tick runs from the
    /// systick interrupt); test harnesses drive the millisecond tick
    /// from here.
    fn idle(&mut self) {}
}

/// Static board identity served by `GET_DEVICE`.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BoardInfo {
    pub board_id: u32,
    pub board_rev: u32,
    /// Size of the flashable application region in bytes. Must be a
    /// multiple of four.
    pub fw_size: u32,
    /// Absolute base address of the application region, used to validate
    /// the application entry point.
    pub app_load_address: u32,
}

/// Word-granular access to the application flash region.
///
/// All offsets are byte offsets relative to the base of the application
/// region and must be word-aligned. Erase turns every bit of a sector to
/// one; writes can only clear bits.
pub trait Flash {
    /// Unlock the controller for erase and programming.
    fn unlock(&mut self);

    /// Size in bytes of sector `index`, or 0 past the last sector.
    fn sector_size(&self, index: usize) -> u32;

    /// Erase sector `index`.
    fn erase_sector(&mut self, index: usize);

    /// Read the word at `offset`.
    fn read_word(&self, offset: u32) -> u32;

    /// Program the word at `offset`. The caller verifies by reading
    /// back; implementations do not need to report failure.
    fn write_word(&mut self, offset: u32, value: u32);

    /// Read a word from the one-time-programmable area at byte `offset`.
    fn read_otp(&self, offset: u32) -> u32;

    /// Read a word from the unique-device-ID area at byte `offset`.
    fn read_udid(&self, offset: u32) -> u32;

    /// Read word `index` of the flash-resident cipher key.
    #[cfg(feature = "encryption")]
    fn key_word(&self, index: usize) -> u32;

    /// Clear word `index` of the flash-resident cipher key to zero.
    /// Zeroing only ever clears bits, so it cannot fail on NOR flash.
    #[cfg(feature = "encryption")]
    fn zero_key_word(&mut self, index: usize);
}

/// Board identity and board-specific gates.
pub trait Board {
    fn info(&self) -> &BoardInfo;

    /// MCU ID code (IDCODE register).
    fn mcu_id(&self) -> u32;

    /// Write the ASCII MCU description into `buf`; returns the number of
    /// bytes written.
    fn mcu_desc(&self, buf: &mut [u8]) -> usize;

    /// Errata gate. Boards with affected silicon revisions return
    /// `false` and refuse erase and offset-0 programming.
    fn silicon_ok(&self) -> bool {
        true
    }

    /// Byte offset of the boot-delay signature within the application
    /// region, or `None` if the board does not support `SET_DELAY`.
    fn boot_delay_offset(&self) -> Option<u32> {
        None
    }
}

/// Bootloader and activity LEDs.
pub trait Leds {
    fn bootloader(&mut self, on: bool);
    fn toggle_bootloader(&mut self);
    fn activity(&mut self, on: bool);
}
