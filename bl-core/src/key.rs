// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Lifecycle of the flash-resident cipher key.
//!
//! The key is valid while any of its bits survive. Zeroing clears each
//! still-programmed word — NOR flash can always clear bits — and is
//! irreversible; a zeroed key permanently disables the encrypted upload
//! path.

use crate::hal::Flash;

pub const KEY_WORDS: usize = 4;
pub const KEY_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyState {
    Valid,
    Invalid,
}

/// Scan the stored key. Valid iff any word is non-zero.
pub fn validate<F: Flash>(flash: &F) -> KeyState {
    for index in 0..KEY_WORDS {
        if flash.key_word(index) != 0 {
            return KeyState::Valid;
        }
    }

    KeyState::Invalid
}

/// Clear every still-programmed word of the key. Idempotent.
pub fn zero<F: Flash>(flash: &mut F) {
    for index in 0..KEY_WORDS {
        if flash.key_word(index) != 0 {
            flash.zero_key_word(index);
        }
    }
}

/// Assemble the key bytes in flash word order, little-endian.
pub fn read<F: Flash>(flash: &F) -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];

    for index in 0..KEY_WORDS {
        let word = flash.key_word(index).to_le_bytes();
        key[index * 4..index * 4 + 4].copy_from_slice(&word);
    }

    key
}
