// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Countdown timers driven by the 1 kHz system tick.
//!
//! The mainline arms a slot and spins on it; the tick interrupt
//! decrements every non-zero slot and runs the LED blink cadence. Slots
//! are word-sized atomics, so no further locking is needed between the
//! tick and the mainline.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::hal::Leds;

/// Blink half-period of the bootloader LED.
const BLINK_MS: u32 = 50;

pub const NTIMERS: usize = 4;

/// Slot roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerId {
    Led = 0,
    CommandRead = 1,
    Delay = 2,
    SessionWait = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedMode {
    Off = 0,
    On = 1,
    Blink = 2,
}

pub struct Ticker {
    slots: [AtomicU32; NTIMERS],
    led_mode: AtomicU8,
}

impl Ticker {
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicU32::new(0) }; NTIMERS],
            led_mode: AtomicU8::new(LedMode::Off as u8),
        }
    }

    /// Arm `id` to expire in `ms` milliseconds.
    pub fn start(&self, id: TimerId, ms: u32) {
        self.slots[id as usize].store(ms, Ordering::Relaxed);
    }

    pub fn expired(&self, id: TimerId) -> bool {
        self.slots[id as usize].load(Ordering::Relaxed) == 0
    }

    pub fn led_mode(&self) -> LedMode {
        match self.led_mode.load(Ordering::Relaxed) {
            1 => LedMode::On,
            2 => LedMode::Blink,
            _ => LedMode::Off,
        }
    }

    /// Change the bootloader LED mode. `Blink` zeroes the LED slot so
    /// the next tick toggles immediately.
    pub fn set_led_mode<L: Leds>(&self, mode: LedMode, leds: &mut L) {
        self.led_mode.store(mode as u8, Ordering::Relaxed);

        match mode {
            LedMode::Off => leds.bootloader(false),
            LedMode::On => leds.bootloader(true),
            LedMode::Blink => self.start(TimerId::Led, 0),
        }
    }

    /// 1 ms tick. Called from the systick interrupt; `leds` is the
    /// interrupt context's handle on the bootloader LED.
    pub fn tick<L: Leds>(&self, leds: &mut L) {
        for slot in &self.slots {
            let v = slot.load(Ordering::Relaxed);
            if v > 0 {
                slot.store(v - 1, Ordering::Relaxed);
            }
        }

        if self.led_mode() == LedMode::Blink && self.expired(TimerId::Led) {
            leds.toggle_bootloader();
            self.start(TimerId::Led, BLINK_MS);
        }
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct LedLog {
        toggles: u32,
        bootloader: bool,
    }

    impl Leds for LedLog {
        fn bootloader(&mut self, on: bool) {
            self.bootloader = on;
        }

        fn toggle_bootloader(&mut self) {
            self.bootloader = !self.bootloader;
            self.toggles += 1;
        }

        fn activity(&mut self, _on: bool) {}
    }

    #[test]
    fn counts_down_to_expiry() {
        let t = Ticker::new();
        let mut leds = LedLog::default();

        t.start(TimerId::CommandRead, 3);
        assert!(!t.expired(TimerId::CommandRead));
        t.tick(&mut leds);
        t.tick(&mut leds);
        assert!(!t.expired(TimerId::CommandRead));
        t.tick(&mut leds);
        assert!(t.expired(TimerId::CommandRead));

        // an expired slot stays expired
        t.tick(&mut leds);
        assert!(t.expired(TimerId::CommandRead));
    }

    #[test]
    fn zero_timeout_is_expired_immediately() {
        let t = Ticker::new();
        t.start(TimerId::CommandRead, 0);
        assert!(t.expired(TimerId::CommandRead));
    }

    #[test]
    fn blink_cadence() {
        let t = Ticker::new();
        let mut leds = LedLog::default();

        t.set_led_mode(LedMode::Blink, &mut leds);
        t.tick(&mut leds);
        assert_eq!(leds.toggles, 1);

        // no further toggle until the reload elapses
        for _ in 0..BLINK_MS - 1 {
            t.tick(&mut leds);
        }
        assert_eq!(leds.toggles, 1);
        t.tick(&mut leds);
        assert_eq!(leds.toggles, 2);
    }

    #[test]
    fn solid_modes_do_not_toggle() {
        let t = Ticker::new();
        let mut leds = LedLog::default();

        t.set_led_mode(LedMode::On, &mut leds);
        assert!(leds.bootloader);
        for _ in 0..200 {
            t.tick(&mut leds);
        }
        assert_eq!(leds.toggles, 0);
        assert!(leds.bootloader);

        t.set_led_mode(LedMode::Off, &mut leds);
        assert!(!leds.bootloader);
    }
}
