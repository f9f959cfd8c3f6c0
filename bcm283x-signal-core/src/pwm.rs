// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PWM controller: the two-channel pulse-width modulator, driven here in
//! its FIFO mode so the DMA engine can feed it a precomputed duty-cycle
//! or bit-bang sequence without CPU involvement.

use crate::pmem::PhysMemView;

const CTL: usize = 0x00;
const STA: usize = 0x04;
const DMAC: usize = 0x08;
const RNG1: usize = 0x10;
const DAT1: usize = 0x14;
const FIF1: usize = 0x18;
const RNG2: usize = 0x20;
const DAT2: usize = 0x24;

const CTL_PWEN1: u32 = 1 << 0;
const CTL_MODE1: u32 = 1 << 1;
const CTL_RPTL1: u32 = 1 << 2;
const CTL_USEF1: u32 = 1 << 5;
const CTL_POLA1: u32 = 1 << 4;
const CTL_MSEN1: u32 = 1 << 7;
const CTL_CLRF1: u32 = 1 << 6;

const STA_BERR: u32 = 1 << 8;

const DMAC_ENAB: u32 = 1 << 31;

/// Which of the controller's two channels to address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Channel {
    One,
    Two,
}

/// Owns the mapped PWM register block.
pub struct PwmController {
    view: PhysMemView,
}

impl PwmController {
    pub fn new(view: PhysMemView) -> PwmController {
        PwmController { view }
    }

    /// Sets the period, in clock ticks, for `channel`.
    pub fn set_range(&self, channel: Channel, range: u32) {
        let reg = match channel {
            Channel::One => RNG1,
            Channel::Two => RNG2,
        };
        self.view.write32(reg, range);
    }

    /// Writes a fixed duty-cycle value directly (M/S mode, CPU-driven).
    pub fn set_data(&self, channel: Channel, data: u32) {
        let reg = match channel {
            Channel::One => DAT1,
            Channel::Two => DAT2,
        };
        self.view.write32(reg, data);
    }

    /// Enables `channel` in M/S (mark-space) mode at a fixed duty cycle,
    /// with no FIFO or DMA involvement.
    pub fn enable_fixed_duty(&self, channel: Channel, polarity_high: bool) {
        let (pwen, mode, msen, pola, rptl, usef) = match channel {
            Channel::One => (CTL_PWEN1, CTL_MODE1, CTL_MSEN1, CTL_POLA1, CTL_RPTL1, CTL_USEF1),
            Channel::Two => (CTL_PWEN1 << 8, CTL_MODE1 << 8, CTL_MSEN1 << 8, CTL_POLA1 << 8, CTL_RPTL1 << 8, CTL_USEF1 << 8),
        };
        let mut ctl = self.view.read32(CTL);
        ctl &= !(mode | rptl | usef);
        ctl |= pwen | msen;
        if polarity_high {
            ctl |= pola;
        } else {
            ctl &= !pola;
        }
        self.view.write32(CTL, ctl);
    }

    /// Enables `channel` in FIFO-serialised mode, for DMA-fed streaming.
    /// `repeat_last` keeps replaying the last FIFO word once it empties,
    /// which is how the self-looping PWM clock trick keeps a steady
    /// pacing tone running without re-arming DMA.
    pub fn enable_fifo(&self, channel: Channel, repeat_last: bool) {
        let (pwen, mode, msen, usef, rptl) = match channel {
            Channel::One => (CTL_PWEN1, CTL_MODE1, CTL_MSEN1, CTL_USEF1, CTL_RPTL1),
            Channel::Two => (CTL_PWEN1 << 8, CTL_MODE1 << 8, CTL_MSEN1 << 8, CTL_USEF1 << 8, CTL_RPTL1 << 8),
        };
        let mut ctl = self.view.read32(CTL);
        ctl &= !msen;
        ctl |= pwen | mode | usef;
        if repeat_last {
            ctl |= rptl;
        } else {
            ctl &= !rptl;
        }
        self.view.write32(CTL, ctl);
    }

    pub fn disable(&self, channel: Channel) {
        let pwen = match channel {
            Channel::One => CTL_PWEN1,
            Channel::Two => CTL_PWEN1 << 8,
        };
        let ctl = self.view.read32(CTL);
        self.view.write32(CTL, ctl & !pwen);
    }

    /// Clears the FIFO (shared by both channels).
    pub fn clear_fifo(&self) {
        let ctl = self.view.read32(CTL);
        self.view.write32(CTL, ctl | CTL_CLRF1);
    }

    pub fn push_fifo(&self, word: u32) {
        self.view.write32(FIF1, word);
    }

    /// Enables the PWM's DMA request line with the given panic/dreq
    /// thresholds (in FIFO words).
    pub fn enable_dreq(&self, panic_threshold: u8, dreq_threshold: u8) {
        let value = DMAC_ENAB | ((panic_threshold as u32) << 8) | dreq_threshold as u32;
        self.view.write32(DMAC, value);
    }

    pub fn disable_dreq(&self) {
        self.view.write32(DMAC, 0);
    }

    /// True if the bus-error sticky flag is set; a FIFO underrun or
    /// similar fault during DMA-fed playback.
    pub fn bus_error(&self) -> bool {
        self.view.read32(STA) & STA_BERR != 0
    }

    /// Clears the bus-error sticky flag (write-one-to-clear).
    pub fn clear_bus_error(&self) {
        self.view.write32(STA, STA_BERR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PwmController {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        PwmController::new(PhysMemView::map(&file, 0, 64).unwrap())
    }

    #[test]
    fn fixed_duty_sets_pwen_and_msen_without_usef() {
        let p = controller();
        p.enable_fixed_duty(Channel::One, true);
        let ctl = p.view.read32(CTL);
        assert_ne!(ctl & CTL_PWEN1, 0);
        assert_ne!(ctl & CTL_MSEN1, 0);
        assert_eq!(ctl & CTL_USEF1, 0);
    }

    #[test]
    fn fifo_mode_sets_usef_and_mode() {
        let p = controller();
        p.enable_fifo(Channel::Two, true);
        let ctl = p.view.read32(CTL);
        assert_ne!(ctl & (CTL_USEF1 << 8), 0);
        assert_ne!(ctl & (CTL_MODE1 << 8), 0);
        assert_ne!(ctl & (CTL_RPTL1 << 8), 0);
    }

    #[test]
    fn bus_error_clears_by_writing_one() {
        let p = controller();
        p.view.write32(STA, STA_BERR);
        assert!(p.bus_error());
        p.clear_bus_error();
        assert!(!p.bus_error());
    }

    #[test]
    fn dreq_enable_packs_thresholds() {
        let p = controller();
        p.enable_dreq(15, 7);
        let value = p.view.read32(DMAC);
        assert_eq!(value & DMAC_ENAB, DMAC_ENAB);
        assert_eq!((value >> 8) & 0xFF, 15);
        assert_eq!(value & 0xFF, 7);
    }
}
