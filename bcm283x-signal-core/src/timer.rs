// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free-running system timer: a 1MHz, 64-bit monotonic counter shared by
//! the whole SoC, used to time DMA completion waits without relying on
//! the kernel's notion of wall-clock time.

use crate::pmem::PhysMemView;

const CLO: usize = 0x04;
const CHI: usize = 0x08;

/// Owns the mapped system timer register block.
pub struct SystemTimer {
    view: PhysMemView,
}

impl SystemTimer {
    pub fn new(view: PhysMemView) -> SystemTimer {
        SystemTimer { view }
    }

    /// Reads the 64-bit counter, retrying if the high word changed between
    /// the two 32-bit reads (the classic rollover race).
    pub fn ticks(&self) -> u64 {
        loop {
            let hi1 = self.view.read32(CHI);
            let lo = self.view.read32(CLO);
            let hi2 = self.view.read32(CHI);
            if hi1 == hi2 {
                return ((hi1 as u64) << 32) | lo as u64;
            }
        }
    }

    pub fn micros(&self) -> u64 {
        self.ticks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_low_and_high_words() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let view = PhysMemView::map(&file, 0, 16).unwrap();
        view.write32(CLO, 0xFFFF_FFFE);
        view.write32(CHI, 7);
        let timer = SystemTimer::new(view);
        assert_eq!(timer.ticks(), (7u64 << 32) | 0xFFFF_FFFE);
    }
}
