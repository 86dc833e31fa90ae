//! Packed atomic timer state.
//!
//! Each timer carries its flags and its current list position (wheel number
//! plus slot index) in a single 32-bit word so that a deleter can observe a
//! coherent `(flags, wheel, idx)` triple in one atomic load; the triple can
//! never tear.
//!
//! Encoding:
//!
//! ```text
//!   31     24     16       0
//!   | flags | wheel | index |
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

const FLAGS_MASK: u32 = 0xff;
const WHEEL_MASK: u32 = 0xff;
const IDX_MASK: u32 = 0xffff;
const FLAGS_SHIFT: u32 = 24;
const WHEEL_SHIFT: u32 = 16;

/// Flags, wheel number and wheel index packed into one atomic word.
///
/// All mutators are read-modify-write loops over the whole word; flag
/// changes keep the wheel/index lanes intact and vice versa.
#[derive(Default)]
pub(crate) struct PackedInfo {
    bits: AtomicU32,
}

impl PackedInfo {
    pub(crate) const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    fn update(&self, f: impl Fn(u32) -> u32) {
        let mut cur = self.bits.load(Ordering::SeqCst);
        loop {
            match self.bits.compare_exchange_weak(
                cur,
                f(cur),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Sets the flag bits in `mask`.
    pub(crate) fn set_flags(&self, mask: u8) {
        let f = u32::from(mask) << FLAGS_SHIFT;
        self.update(|cur| cur | f);
    }

    /// Clears the flag bits in `mask`.
    pub(crate) fn reset_flags(&self, mask: u8) {
        let f = u32::from(mask) << FLAGS_SHIFT;
        self.update(|cur| cur & !f);
    }

    /// Clears the flag bits in `reset_mask`, then sets the bits in
    /// `set_mask`, as one atomic update.
    pub(crate) fn chg_flags(&self, set_mask: u8, reset_mask: u8) {
        let set = u32::from(set_mask) << FLAGS_SHIFT;
        let reset = u32::from(reset_mask) << FLAGS_SHIFT;
        self.update(|cur| (cur & !reset) | set);
    }

    /// Replaces the whole flags lane.
    #[allow(dead_code)]
    pub(crate) fn assign_flags(&self, flags: u8) {
        let v = u32::from(flags) << FLAGS_SHIFT;
        let lane = FLAGS_MASK << FLAGS_SHIFT;
        self.update(|cur| (cur & !lane) | v);
    }

    /// Replaces the wheel/index lanes, leaving the flags intact.
    pub(crate) fn set_wheel(&self, wheel: u8, idx: u16) {
        let v = u32::from(wheel) << WHEEL_SHIFT | u32::from(idx);
        let lanes = WHEEL_MASK << WHEEL_SHIFT | IDX_MASK;
        self.update(|cur| (cur & !lanes) | v);
    }

    /// Stores a complete `(flags, wheel, idx)` triple.
    pub(crate) fn set_all(&self, flags: u8, wheel: u8, idx: u16) {
        let v = u32::from(flags) << FLAGS_SHIFT | u32::from(wheel) << WHEEL_SHIFT | u32::from(idx);
        self.bits.store(v, Ordering::SeqCst);
    }

    pub(crate) fn flags(&self) -> u8 {
        self.get_all().0
    }

    pub(crate) fn wheel_pos(&self) -> (u8, u16) {
        let (_, w, idx) = self.get_all();
        (w, idx)
    }

    /// Reads the coherent `(flags, wheel, idx)` triple.
    pub(crate) fn get_all(&self) -> (u8, u8, u16) {
        let cur = self.bits.load(Ordering::SeqCst);
        let f = (cur >> FLAGS_SHIFT) & FLAGS_MASK;
        let w = (cur >> WHEEL_SHIFT) & WHEEL_MASK;
        let idx = cur & IDX_MASK;
        (f as u8, w as u8, idx as u16)
    }
}

impl fmt::Debug for PackedInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (flags, w, idx) = self.get_all();
        write!(f, "{flags:02x}:{w:02x}:{idx}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanes_cover_the_word() {
        let full = (FLAGS_MASK << FLAGS_SHIFT) | (WHEEL_MASK << WHEEL_SHIFT) | IDX_MASK;
        assert_eq!(full, u32::MAX);
    }

    #[test]
    fn flags_do_not_disturb_wheel() {
        let x = PackedInfo::new();
        x.set_wheel(7, 1234);
        x.assign_flags(0xa5);
        x.reset_flags(0x05);
        x.set_flags(0x10);
        assert_eq!(x.flags(), 0xa5 & !0x05 | 0x10);
        assert_eq!(x.wheel_pos(), (7, 1234));
    }

    #[test]
    fn wheel_does_not_disturb_flags() {
        let x = PackedInfo::new();
        x.assign_flags(0x42);
        x.set_wheel(255, 65535);
        x.set_wheel(3, 9);
        assert_eq!(x.flags(), 0x42);
        assert_eq!(x.wheel_pos(), (3, 9));
    }

    #[test]
    fn chg_flags_resets_then_sets() {
        let x = PackedInfo::new();
        x.set_all(0b1111, 200, 1);
        x.chg_flags(0b0001, 0b1011);
        assert_eq!(x.flags(), 0b0101);
        assert_eq!(x.wheel_pos(), (200, 1));
    }

    /// Mixed flag/wheel updates from two threads must never corrupt the
    /// other lane.
    #[test]
    fn concurrent_lane_updates_do_not_tear() {
        use std::sync::Arc;

        for _ in 0..200 {
            let x = Arc::new(PackedInfo::new());
            let a = {
                let x = Arc::clone(&x);
                std::thread::spawn(move || {
                    x.assign_flags(0x80);
                    x.reset_flags(0x0f);
                    x.set_flags(0x21);
                })
            };
            let b = {
                let x = Arc::clone(&x);
                std::thread::spawn(move || {
                    x.set_wheel(13, 4242);
                })
            };
            a.join().unwrap();
            b.join().unwrap();
            assert_eq!(x.flags(), 0x80 | 0x21);
            assert_eq!(x.wheel_pos(), (13, 4242));
        }
    }
}
