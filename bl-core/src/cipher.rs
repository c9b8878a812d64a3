// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! AES-128-CBC decryption of the upload stream.
//!
//! Payloads arrive in 16-byte groups. The IV starts at zero, is loaded by
//! `SET_IV` and, per standard CBC decrypt chaining, is replaced after
//! every payload by that payload's last ciphertext block, so the stream
//! may be split across commands at any 16-byte boundary.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};

use crate::key::KEY_BYTES;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const BLOCK_SIZE: usize = 16;

/// The first four words of the first encrypted payload describe the
/// image; programming starts at the following word.
pub const HEADER_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CipherError {
    /// Input not a whole number of blocks, or output buffer too small.
    Length,
}

/// CBC chaining state carried across payloads.
pub struct CbcStream {
    iv: [u8; BLOCK_SIZE],
}

impl CbcStream {
    pub const fn new() -> Self {
        Self {
            iv: [0; BLOCK_SIZE],
        }
    }

    pub fn set_iv(&mut self, iv: [u8; BLOCK_SIZE]) {
        self.iv = iv;
    }

    /// Decrypt `ciphertext` into `plaintext` and advance the IV.
    pub fn decrypt(
        &mut self,
        key: &[u8; KEY_BYTES],
        ciphertext: &[u8],
        plaintext: &mut [u8],
    ) -> Result<(), CipherError> {
        if ciphertext.is_empty()
            || ciphertext.len() % BLOCK_SIZE != 0
            || plaintext.len() < ciphertext.len()
        {
            return Err(CipherError::Length);
        }

        Aes128CbcDec::new(key.into(), (&self.iv).into())
            .decrypt_padded_b2b_mut::<NoPadding>(ciphertext, plaintext)
            .map_err(|_| CipherError::Length)?;

        self.iv
            .copy_from_slice(&ciphertext[ciphertext.len() - BLOCK_SIZE..]);

        Ok(())
    }
}

impl Default for CbcStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Image description sent in the cleartext header words of the first
/// encrypted payload: total bytes to flash and the CRC over them.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageHeader {
    pub length: u32,
    pub crc: u32,
}

impl ImageHeader {
    /// State before any encrypted payload arrived.
    pub const EMPTY: Self = Self { length: 0, crc: 0 };

    /// Extract the header from the first decrypted block. Words two and
    /// three are reserved.
    pub fn parse(plaintext: &[u8]) -> Self {
        Self {
            length: u32::from_le_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]),
            crc: u32::from_le_bytes([plaintext[4], plaintext[5], plaintext[6], plaintext[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    fn encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; plaintext.len()];
        Aes128CbcEnc::new(key.into(), iv.into())
            .encrypt_padded_b2b_mut::<NoPadding>(plaintext, &mut out)
            .unwrap();
        out
    }

    const KEY: [u8; 16] = [
        0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B,
        0x0C,
    ];

    #[test]
    fn round_trip_single_payload() {
        let iv = [0x42u8; 16];
        let plaintext: Vec<u8> = (0u8..64).collect();
        let ciphertext = encrypt(&KEY, &iv, &plaintext);

        let mut stream = CbcStream::new();
        stream.set_iv(iv);

        let mut out = vec![0u8; ciphertext.len()];
        stream.decrypt(&KEY, &ciphertext, &mut out).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn chaining_across_split_payloads() {
        let iv = [0x11u8; 16];
        let plaintext: Vec<u8> = (0u8..96).map(|b| b.wrapping_mul(7)).collect();
        let ciphertext = encrypt(&KEY, &iv, &plaintext);

        let mut stream = CbcStream::new();
        stream.set_iv(iv);

        // the host may split the stream at any block boundary
        let mut out = Vec::new();
        for chunk in ciphertext.chunks(32) {
            let mut part = vec![0u8; chunk.len()];
            stream.decrypt(&KEY, chunk, &mut part).unwrap();
            out.extend_from_slice(&part);
        }

        assert_eq!(out, plaintext);
    }

    #[test]
    fn rejects_partial_blocks() {
        let mut stream = CbcStream::new();
        let mut out = [0u8; 32];

        assert_eq!(
            stream.decrypt(&KEY, &[0u8; 20], &mut out),
            Err(CipherError::Length)
        );
        assert_eq!(stream.decrypt(&KEY, &[], &mut out), Err(CipherError::Length));
    }

    #[test]
    fn header_layout() {
        let mut block = [0u8; 16];
        block[..4].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        block[4..8].copy_from_slice(&0xCAFE_F00Du32.to_le_bytes());

        let header = ImageHeader::parse(&block);
        assert_eq!(header.length, 0x0001_0000);
        assert_eq!(header.crc, 0xCAFE_F00D);
    }
}
