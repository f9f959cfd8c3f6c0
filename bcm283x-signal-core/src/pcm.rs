// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCM controller: used here purely as a second DMA-paced FIFO (its
//! audio framing is left disabled), giving the engine a DREQ source that
//! is independent of the PWM peripheral when both are needed at once.

use crate::pmem::PhysMemView;

const CS: usize = 0x00;
/// FIFO register offset, exposed so DMA control blocks can target it as
/// an I/O destination without the caller reaching into `PcmController`'s
/// internals.
pub const FIFO: usize = 0x04;
const DREQ: usize = 0x18;
const INTEN: usize = 0x10;

const CS_EN: u32 = 1 << 0;
const CS_RXON: u32 = 1 << 1;
const CS_TXON: u32 = 1 << 2;
const CS_TXCLR: u32 = 1 << 3;
const CS_RXCLR: u32 = 1 << 4;
const CS_TXERR: u32 = 1 << 18;
const CS_RXERR: u32 = 1 << 19;

/// Owns the mapped PCM register block.
pub struct PcmController {
    view: PhysMemView,
}

impl PcmController {
    pub fn new(view: PhysMemView) -> PcmController {
        PcmController { view }
    }

    /// Enables the peripheral clock and the transmit path, disabling the
    /// receive path. DMA-fed streaming never needs the RX side.
    pub fn enable_tx(&self) {
        let cs = self.view.read32(CS);
        self.view.write32(CS, (cs | CS_EN | CS_TXON) & !CS_RXON);
    }

    pub fn disable(&self) {
        self.view.write32(CS, 0);
    }

    /// Resets the TX and RX FIFOs (write-one-to-clear, self-clearing).
    pub fn reset_fifos(&self) {
        let cs = self.view.read32(CS);
        self.view.write32(CS, cs | CS_TXCLR | CS_RXCLR);
    }

    pub fn push_fifo(&self, word: u32) {
        self.view.write32(FIFO, word);
    }

    /// Sets the TX DMA request and panic thresholds, in FIFO words.
    pub fn set_dreq_thresholds(&self, tx_panic: u8, tx_dreq: u8) {
        let value = (self.view.read32(DREQ) & 0xFFFF_0000)
            | ((tx_panic as u32) << 8)
            | tx_dreq as u32;
        self.view.write32(DREQ, value);
    }

    /// Enables the TX DMA request line.
    pub fn enable_tx_dma(&self) {
        self.view.write32(INTEN, self.view.read32(INTEN));
        let cs = self.view.read32(CS);
        self.view.write32(CS, cs | (1 << 9)); // DMAEN
    }

    pub fn tx_error(&self) -> bool {
        self.view.read32(CS) & CS_TXERR != 0
    }

    pub fn rx_error(&self) -> bool {
        self.view.read32(CS) & CS_RXERR != 0
    }

    /// Clears the TX/RX error sticky bits (write-one-to-clear).
    pub fn clear_errors(&self) {
        let cs = self.view.read32(CS);
        self.view.write32(CS, cs | CS_TXERR | CS_RXERR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PcmController {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        PcmController::new(PhysMemView::map(&file, 0, 64).unwrap())
    }

    #[test]
    fn enable_tx_sets_en_and_txon_clears_rxon() {
        let p = controller();
        p.view.write32(CS, CS_RXON);
        p.enable_tx();
        let cs = p.view.read32(CS);
        assert_ne!(cs & CS_EN, 0);
        assert_ne!(cs & CS_TXON, 0);
        assert_eq!(cs & CS_RXON, 0);
    }

    #[test]
    fn errors_clear_by_writing_one() {
        let p = controller();
        p.view.write32(CS, CS_TXERR | CS_RXERR);
        assert!(p.tx_error());
        assert!(p.rx_error());
        p.clear_errors();
        assert!(!p.tx_error());
        assert!(!p.rx_error());
    }

    #[test]
    fn dreq_thresholds_pack_into_low_bits() {
        let p = controller();
        p.set_dreq_thresholds(32, 16);
        let value = p.view.read32(DREQ);
        assert_eq!((value >> 8) & 0xFF, 32);
        assert_eq!(value & 0xFF, 16);
    }
}
