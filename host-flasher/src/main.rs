// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host-side upload tool for the serial bootloader.
//!
//! Speaks the `bl-protocol` frame format over a serial port: probe the
//! board, erase, program an image in `PROG_MULTI` chunks, verify the CRC
//! the same way the device computes it, and boot.

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use serialport::SerialPort;

use bl_core::crc32::crc32;
use bl_protocol::{DeviceInfo, Opcode, Status, EOC, INSYNC, PROTOCOL_VERSION};

/// Largest payload a `PROG_MULTI` frame can carry, in whole words.
const CHUNK_SIZE: usize = 252;

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// A full-chip erase on a large part takes a while.
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(about = "Firmware upload tool for the serial bootloader")]
struct Args {
    /// Serial port the bootloader is attached to.
    #[clap(short, long)]
    port: String,

    /// Baud rate.
    #[clap(long, default_value_t = 115_200)]
    baud: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Probe the board and print its identity.
    Info,
    /// Erase the program area.
    Erase,
    /// Erase, program and verify an image.
    Flash {
        /// The firmware image.
        image: PathBuf,
        /// Leave the board in the bootloader instead of booting.
        #[clap(long)]
        no_boot: bool,
    },
    /// Finalise programming and boot the application.
    Boot,
    /// Arm the minimum-boot-delay signature, in seconds.
    SetDelay { seconds: u8 },
}

enum Error {
    Serial(serialport::Error),
    Io(std::io::Error),
    /// The device replied, but not with `OK`.
    Nak(Status),
    /// The reply did not carry the sync sentinel where one was due.
    OutOfSync,
    /// Device and host disagree about the flashed image.
    CrcMismatch { device: u32, host: u32 },
    ImageTooBig { image: usize, fw_size: u32 },
    ProtocolMismatch { device: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Serial(e) => write!(f, "serial port: {e}"),
            Error::Io(e) => write!(f, "i/o: {e}"),
            Error::Nak(status) => write!(f, "device answered {status:?}"),
            Error::OutOfSync => write!(f, "lost sync with the device"),
            Error::CrcMismatch { device, host } => {
                write!(f, "CRC mismatch: device {device:#010x}, host {host:#010x}")
            }
            Error::ImageTooBig { image, fw_size } => {
                write!(f, "image is {image} bytes but the board fits {fw_size}")
            }
            Error::ProtocolMismatch { device } => {
                write!(
                    f,
                    "device speaks protocol revision {device}, expected {PROTOCOL_VERSION}"
                )
            }
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Serial(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// One bootloader session over an open port.
struct Device {
    port: Box<dyn SerialPort>,
}

impl Device {
    fn open(path: &str, baud: u32) -> Result<Self, Error> {
        let port = serialport::new(path, baud).timeout(REPLY_TIMEOUT).open()?;
        Ok(Self { port })
    }

    /// Send one command frame.
    fn send(&mut self, opcode: Opcode, body: &[u8]) -> Result<(), Error> {
        let mut frame = vec![opcode as u8];
        frame.extend_from_slice(body);
        frame.push(EOC);
        self.port.write_all(&frame)?;
        Ok(())
    }

    /// Read the `INSYNC`/status trailer.
    fn read_status(&mut self) -> Result<(), Error> {
        let mut trailer = [0u8; 2];
        self.port.read_exact(&mut trailer)?;

        if trailer[0] != INSYNC {
            return Err(Error::OutOfSync);
        }

        match Status::from_byte(trailer[1]) {
            Some(Status::Ok) => Ok(()),
            Some(status) => Err(Error::Nak(status)),
            None => Err(Error::OutOfSync),
        }
    }

    /// Read `len` reply data bytes, then the trailer.
    fn read_reply(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut data = vec![0u8; len];
        self.port.read_exact(&mut data)?;
        self.read_status()?;
        Ok(data)
    }

    fn read_reply_word(&mut self) -> Result<u32, Error> {
        let data = self.read_reply(4)?;
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.send(Opcode::GetSync, &[])?;
        self.read_status()
    }

    fn get_device(&mut self, what: DeviceInfo) -> Result<u32, Error> {
        self.send(Opcode::GetDevice, &[what as u8])?;
        self.read_reply_word()
    }

    fn erase(&mut self) -> Result<(), Error> {
        self.port.set_timeout(ERASE_TIMEOUT)?;
        self.send(Opcode::ChipErase, &[])?;
        let result = self.read_status();
        self.port.set_timeout(REPLY_TIMEOUT)?;
        result
    }

    fn prog_multi(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let mut body = vec![chunk.len() as u8];
        body.extend_from_slice(chunk);
        self.send(Opcode::ProgMulti, &body)?;
        self.read_status()
    }

    fn get_crc(&mut self) -> Result<u32, Error> {
        self.send(Opcode::GetCrc, &[])?;
        self.read_reply_word()
    }

    fn get_sn(&mut self, offset: u32) -> Result<u32, Error> {
        self.send(Opcode::GetSn, &offset.to_le_bytes())?;
        self.read_reply_word()
    }

    fn get_chip(&mut self) -> Result<u32, Error> {
        self.send(Opcode::GetChip, &[])?;
        self.read_reply_word()
    }

    fn get_chip_des(&mut self) -> Result<String, Error> {
        self.send(Opcode::GetChipDes, &[])?;

        let mut len = [0u8; 4];
        self.port.read_exact(&mut len)?;
        let data = self.read_reply(u32::from_le_bytes(len) as usize)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    fn set_delay(&mut self, seconds: u8) -> Result<(), Error> {
        self.send(Opcode::SetDelay, &[seconds])?;
        self.read_status()
    }

    fn boot(&mut self) -> Result<(), Error> {
        self.send(Opcode::Boot, &[])?;
        self.read_status()
    }

    /// Probe the device and check it speaks our protocol revision.
    fn probe(&mut self) -> Result<(), Error> {
        self.sync()?;

        let revision = self.get_device(DeviceInfo::BlRev)?;
        if revision != PROTOCOL_VERSION {
            return Err(Error::ProtocolMismatch { device: revision });
        }

        Ok(())
    }
}

fn cmd_info(dev: &mut Device) -> Result<(), Error> {
    dev.probe()?;

    let board_id = dev.get_device(DeviceInfo::BoardId)?;
    let board_rev = dev.get_device(DeviceInfo::BoardRev)?;
    let fw_size = dev.get_device(DeviceInfo::FwSize)?;
    let chip = dev.get_chip()?;
    let desc = dev.get_chip_des()?;

    println!("board id:   {board_id}");
    println!("board rev:  {board_rev}");
    println!("fw size:    {fw_size} bytes");
    println!("mcu:        {desc} ({chip:#010x})");

    print!("serial:    ");
    for offset in [0u32, 4, 8] {
        print!(" {:08x}", dev.get_sn(offset)?);
    }
    println!();

    Ok(())
}

fn cmd_flash(dev: &mut Device, path: &PathBuf, no_boot: bool) -> Result<(), Error> {
    let image = std::fs::read(path)?;

    dev.probe()?;
    let fw_size = dev.get_device(DeviceInfo::FwSize)?;

    if image.len() as u32 > fw_size {
        return Err(Error::ImageTooBig {
            image: image.len(),
            fw_size,
        });
    }

    println!("erasing...");
    dev.erase()?;

    println!("programming {} bytes...", image.len());
    let mut sent = 0;
    for chunk in image.chunks(CHUNK_SIZE) {
        // frames carry whole words; pad the image tail
        if chunk.len() % 4 == 0 {
            dev.prog_multi(chunk)?;
        } else {
            let mut padded = chunk.to_vec();
            padded.resize(chunk.len().next_multiple_of(4), 0xFF);
            dev.prog_multi(&padded)?;
        }

        sent += chunk.len();
        print!("\r{:3} %", sent * 100 / image.len());
        std::io::stdout().flush()?;
    }
    println!();

    // the device sums the whole region; pad with the erased pattern
    let device_crc = dev.get_crc()?;
    let mut host_crc = crc32(&image, 0);
    host_crc = crc32(&vec![0xFF; fw_size as usize - image.len()], host_crc);

    if device_crc != host_crc {
        return Err(Error::CrcMismatch {
            device: device_crc,
            host: host_crc,
        });
    }

    if no_boot {
        println!("{} flashed and verified, staying in bootloader", "ok:".bold().green());
    } else {
        dev.boot()?;
        println!("{} flashed, verified and booted", "ok:".bold().green());
    }

    Ok(())
}

fn run(args: Args) -> Result<(), Error> {
    let mut dev = Device::open(&args.port, args.baud)?;

    match args.command {
        Command::Info => cmd_info(&mut dev),
        Command::Erase => {
            dev.probe()?;
            dev.erase()?;
            println!("{} erased", "ok:".bold().green());
            Ok(())
        }
        Command::Flash { image, no_boot } => cmd_flash(&mut dev, &image, no_boot),
        Command::Boot => {
            dev.probe()?;
            dev.boot()?;
            println!("{} booting", "ok:".bold().green());
            Ok(())
        }
        Command::SetDelay { seconds } => {
            dev.probe()?;
            dev.set_delay(seconds)?;
            println!("{} boot delay set to {seconds} s", "ok:".bold().green());
            Ok(())
        }
    }
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".bold().red());
            std::process::ExitCode::FAILURE
        }
    }
}
