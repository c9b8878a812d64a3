// SPDX-FileCopyrightText: 2025 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Interrupt-to-mainline receive ring.
//!
//! Single producer (the physical-layer interrupt handler), single
//! consumer (the mainline). One slot is sacrificed to distinguish full
//! from empty; a push against a full ring drops the byte.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

const CAPACITY: usize = 256;

pub struct RxQueue {
    head: AtomicUsize,
    tail: AtomicUsize,
    buf: UnsafeCell<[u8; CAPACITY]>,
}

impl RxQueue {
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            buf: UnsafeCell::new([0; CAPACITY]),
        }
    }

    #[inline]
    fn next(idx: usize) -> usize {
        (idx + 1) % CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Producer side. Drops the byte when the ring is full.
    pub fn push(&self, byte: u8) {
        let head = self.head.load(Ordering::Relaxed);
        let next = Self::next(head);

        if next != self.tail.load(Ordering::Acquire) {
            // SAFETY: only the producer writes slots between tail and head
            unsafe { (*self.buf.get())[head] = byte };
            self.head.store(next, Ordering::Release);
        }
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);

        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: the producer published this slot with the head store
        let byte = unsafe { (*self.buf.get())[tail] };
        self.tail.store(Self::next(tail), Ordering::Release);
        Some(byte)
    }
}

impl Default for RxQueue {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: SPSC only — one producer context, one consumer context.
unsafe impl Sync for RxQueue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = RxQueue::new();
        assert!(q.is_empty());
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn overflow_drops_silently() {
        let q = RxQueue::new();
        for i in 0..300usize {
            q.push(i as u8);
        }
        // one slot is kept free, the rest survived in order
        for i in 0..(CAPACITY - 1) {
            assert_eq!(q.pop(), Some(i as u8));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn wraps_around() {
        let q = RxQueue::new();
        for round in 0..5u16 {
            for i in 0..200u16 {
                q.push((round ^ i) as u8);
            }
            for i in 0..200u16 {
                assert_eq!(q.pop(), Some((round ^ i) as u8));
            }
        }
        assert!(q.is_empty());
    }
}
