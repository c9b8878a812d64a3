// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Serial flash-update protocol, shared by the bootloader core and the host
//! tools.
//!
//! Command frames travel host to device as
//!
//! ```text
//! <opcode> [<command data>] <EOC>
//! ```
//!
//! and replies travel device to host as
//!
//! ```text
//! [<reply data>] <INSYNC> <status>
//! ```
//!
//! Multi-byte integers are little-endian on the wire. Every reply is
//! terminated by the [`INSYNC`] sentinel followed by a [`Status`] byte;
//! data-bearing replies put their payload before the sentinel.

#![no_std]

/// Protocol revision reported by `GET_DEVICE`/`BlRev`.
pub const PROTOCOL_VERSION: u32 = 7;

/// Sentinel prefixing every status byte in a reply.
pub const INSYNC: u8 = 0x12;

/// End-of-command sentinel terminating every host-to-device frame.
pub const EOC: u8 = 0x20;

/// Maximum `PROG_MULTI` payload size. The length field is a single byte
/// and the payload must be a multiple of four bytes.
pub const PROG_MULTI_MAX: usize = 255;

/// Reply status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Status {
    /// Command understood and executed.
    Ok = 0x10,
    /// Command understood but its effect failed (flash read-back, CRC
    /// mismatch, erase verify).
    Failed = 0x11,
    /// Malformed frame or bad argument.
    Invalid = 0x13,
    /// Board revision is affected by a silicon erratum.
    BadSilicon = 0x14,
    /// Encrypted operation attempted with a zeroed key.
    BadKey = 0x15,
}

impl Status {
    /// Decode a status byte received from the device.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x10 => Self::Ok,
            0x11 => Self::Failed,
            0x13 => Self::Invalid,
            0x14 => Self::BadSilicon,
            0x15 => Self::BadKey,
            _ => return None,
        })
    }
}

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Opcode {
    /// NOP for re-establishing sync.
    GetSync = 0x21,
    /// Query device identity, see [`DeviceInfo`].
    GetDevice = 0x22,
    /// Erase the program area and reset the program address.
    ChipErase = 0x23,
    /// Write bytes at the program address and advance it.
    ProgMulti = 0x27,
    /// CRC32 over the whole flashable area.
    GetCrc = 0x29,
    /// Read a word from the one-time-programmable area.
    GetOtp = 0x2A,
    /// Read a word from the unique-device-ID area.
    GetSn = 0x2B,
    /// Read the MCU ID code.
    GetChip = 0x2C,
    /// Arm the minimum-boot-delay signature.
    SetDelay = 0x2D,
    /// Read the MCU description in ASCII.
    GetChipDes = 0x2E,
    /// Finalise programming and boot the application.
    Boot = 0x30,
    /// Reserved for ad-hoc debugging.
    Debug = 0x31,
    /// Load the initialisation vector for encrypted programming.
    SetIv = 0x36,
    /// Like `ProgMulti`, but AES-128-CBC encrypted.
    ProgMultiEncrypted = 0x37,
    /// Compare the flashed CRC against the one announced in the
    /// encryption header.
    CheckCrc = 0x38,
    /// Report whether the cipher key is still valid.
    CheckKey = 0x39,
}

impl Opcode {
    /// Decode a command byte. Unknown bytes are line noise and must be
    /// dropped without a reply.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x21 => Self::GetSync,
            0x22 => Self::GetDevice,
            0x23 => Self::ChipErase,
            0x27 => Self::ProgMulti,
            0x29 => Self::GetCrc,
            0x2A => Self::GetOtp,
            0x2B => Self::GetSn,
            0x2C => Self::GetChip,
            0x2D => Self::SetDelay,
            0x2E => Self::GetChipDes,
            0x30 => Self::Boot,
            0x31 => Self::Debug,
            0x36 => Self::SetIv,
            0x37 => Self::ProgMultiEncrypted,
            0x38 => Self::CheckCrc,
            0x39 => Self::CheckKey,
            _ => return None,
        })
    }
}

/// `GET_DEVICE` sub-arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeviceInfo {
    /// Protocol revision, `u32`.
    BlRev = 1,
    /// Board type, `u32`.
    BoardId = 2,
    /// Board revision, `u32`.
    BoardRev = 3,
    /// Size of the flashable area, `u32`.
    FwSize = 4,
    /// Contents of reserved vector-table words 7..=10, 16 bytes.
    VecArea = 5,
}

impl DeviceInfo {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::BlRev,
            2 => Self::BoardId,
            3 => Self::BoardRev,
            4 => Self::FwSize,
            5 => Self::VecArea,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for byte in 0..=0xFFu8 {
            if let Some(op) = Opcode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_byte(0x21), Some(Opcode::GetSync));
        assert_eq!(Opcode::from_byte(EOC), None);
        assert_eq!(Opcode::from_byte(INSYNC), None);
    }

    #[test]
    fn status_round_trip() {
        for byte in 0..=0xFFu8 {
            if let Some(status) = Status::from_byte(byte) {
                assert_eq!(status as u8, byte);
            }
        }
        assert_eq!(Status::from_byte(0x10), Some(Status::Ok));
        assert_eq!(Status::from_byte(0x12), None);
    }

    #[test]
    fn device_info_round_trip() {
        for byte in 0..=0xFFu8 {
            if let Some(arg) = DeviceInfo::from_byte(byte) {
                assert_eq!(arg as u8, byte);
            }
        }
        assert_eq!(DeviceInfo::from_byte(0), None);
        assert_eq!(DeviceInfo::from_byte(6), None);
    }
}
