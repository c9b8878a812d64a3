// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Flash programming pipeline.
//!
//! Writes are strictly append-only at word granularity. The program
//! cursor starts at `fw_size` so nothing can be written before a
//! successful erase resets it to zero, and the word destined for offset 0
//! is held back in RAM until `BOOT` finalises the upload — an interrupted
//! upload therefore leaves an image the boot path refuses to start.

use crate::crc32::crc32;
use crate::hal::{BoardInfo, Flash};

/// Value of an erased flash word, doubling as the "nothing deferred"
/// sentinel for the held-back first word.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Boot-delay signature words, written by the installed application.
pub const BOOT_DELAY_SIGNATURE1: u32 = 0x92C2_ECEA;
pub const BOOT_DELAY_SIGNATURE2: u32 = 0xC505_7D5D;

/// Upper bound on the boot delay, seconds.
pub const BOOT_DELAY_MAX: u8 = 30;

/// Flash-side failure: a programmed or erased word read back wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VerifyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DelayError {
    /// The signature words are not present in flash.
    MissingSignature,
    /// The patched word read back wrong.
    Verify,
}

pub struct Programmer {
    cursor: u32,
    first_word: u32,
    fw_size: u32,
}

impl Programmer {
    pub fn new(fw_size: u32) -> Self {
        Self {
            // force an erase before the first append is accepted
            cursor: fw_size,
            first_word: ERASED_WORD,
            fw_size,
        }
    }

    /// Byte offset of the next word to be written.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Whether `extra` more payload bytes fit in the region.
    pub fn fits(&self, extra: u32) -> bool {
        self.cursor + extra <= self.fw_size
    }

    /// Erase every sector up to the zero-sized terminator.
    pub fn erase_sectors<F: Flash>(&self, flash: &mut F) {
        flash.unlock();

        let mut sector = 0;
        while flash.sector_size(sector) != 0 {
            flash.erase_sector(sector);
            sector += 1;
        }
    }

    /// Check that the whole region reads erased; on success the cursor
    /// returns to zero and any deferred first word is discarded. A failed
    /// verify leaves the cursor untouched.
    pub fn verify_erase<F: Flash>(&mut self, flash: &F) -> Result<(), VerifyError> {
        for offset in (0..self.fw_size).step_by(4) {
            if flash.read_word(offset) != ERASED_WORD {
                warning!("erase verify failed at {=u32:#x}", offset);
                return Err(VerifyError);
            }
        }

        self.cursor = 0;
        self.first_word = ERASED_WORD;
        Ok(())
    }

    /// Program `words` at the cursor with immediate read-back, advancing
    /// word by word. When the cursor is at zero the first word is stashed
    /// and `ERASED_WORD` goes to flash in its place until [`Self::finalize`].
    ///
    /// The caller has bounds-checked the payload against the region.
    pub fn append<F: Flash>(&mut self, flash: &mut F, words: &mut [u32]) -> Result<(), VerifyError> {
        debug_assert!(self.fits(words.len() as u32 * 4));

        if self.cursor == 0 && !words.is_empty() {
            self.first_word = words[0];
            words[0] = ERASED_WORD;
        }

        for &word in words.iter() {
            flash.write_word(self.cursor, word);

            if flash.read_word(self.cursor) != word {
                warning!("read-back mismatch at {=u32:#x}", self.cursor);
                return Err(VerifyError);
            }

            self.cursor += 4;
        }

        Ok(())
    }

    /// Commit the deferred first word. Only the boot path calls this.
    pub fn finalize<F: Flash>(&mut self, flash: &mut F) -> Result<(), VerifyError> {
        if self.first_word != ERASED_WORD {
            flash.write_word(0, self.first_word);

            if flash.read_word(0) != self.first_word {
                return Err(VerifyError);
            }

            self.first_word = ERASED_WORD;
        }

        Ok(())
    }

    /// CRC32 over flash bytes `[0, length)`, whole words at a time,
    /// substituting the deferred first word for offset 0 while one is
    /// pending.
    pub fn checksum<F: Flash>(&self, flash: &F, length: u32) -> u32 {
        let mut state = 0;

        for offset in (0..length).step_by(4) {
            let word = if offset == 0 && self.first_word != ERASED_WORD {
                self.first_word
            } else {
                flash.read_word(offset)
            };

            state = crc32(&word.to_le_bytes(), state);
        }

        state
    }
}

/// Patch the low byte of the first boot-delay signature word with the
/// requested delay. Both signature words must already be present.
pub fn set_boot_delay<F: Flash>(flash: &mut F, offset: u32, seconds: u8) -> Result<(), DelayError> {
    let sig1 = flash.read_word(offset);
    let sig2 = flash.read_word(offset + 4);

    if sig1 != BOOT_DELAY_SIGNATURE1 || sig2 != BOOT_DELAY_SIGNATURE2 {
        return Err(DelayError::MissingSignature);
    }

    let value = (BOOT_DELAY_SIGNATURE1 & 0xFFFF_FF00) | seconds as u32;
    flash.write_word(offset, value);

    if flash.read_word(offset) != value {
        return Err(DelayError::Verify);
    }

    Ok(())
}

/// Application vector-table words extracted before a jump attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppVectors {
    pub stack_pointer: u32,
    pub entry_point: u32,
}

/// Read and validate the installed application's vectors. `None` means
/// there is nothing safe to jump to: word 0 is still erased (upload never
/// finalised) or the entry point falls outside the application region.
pub fn app_vectors<F: Flash>(flash: &F, info: &BoardInfo) -> Option<AppVectors> {
    let stack_pointer = flash.read_word(0);
    if stack_pointer == ERASED_WORD {
        return None;
    }

    let entry_point = flash.read_word(4);
    if entry_point < info.app_load_address
        || entry_point >= info.app_load_address + info.fw_size
    {
        return None;
    }

    Some(AppVectors {
        stack_pointer,
        entry_point,
    })
}
