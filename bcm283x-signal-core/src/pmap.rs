// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Peripheral map (PMAP): resolves the SoC's peripheral base address from
//! the device tree, and maps each of the register blocks this crate needs.

use std::fs;
use std::path::Path;

use bcm283x_signal_api::{Error, Result};

/// Offset of the GPIO register block from the peripheral base.
pub const GPIO_OFFSET: u64 = 0x0020_0000;
/// Offset of DMA channels 0..=14's block from the peripheral base.
pub const DMA_OFFSET: u64 = 0x0000_7000;
/// Offset of DMA channel 15's (separate, "DMA15") block.
pub const DMA15_OFFSET: u64 = 0x00E0_5000;
/// Offset of the PCM register block.
pub const PCM_OFFSET: u64 = 0x0020_3000;
/// Offset of the PWM register block.
pub const PWM_OFFSET: u64 = 0x0020_C000;
/// Offset of the clock manager register block.
pub const CLOCK_OFFSET: u64 = 0x0010_1000;
/// Offset of the free-running system timer.
pub const SYSTIMER_OFFSET: u64 = 0x0000_3000;
/// Offset of the pad control register block.
pub const PADS_OFFSET: u64 = 0x0010_0000;

/// Per-channel byte stride within the DMA0..14 register block.
pub const DMA_CHANNEL_STRIDE: u64 = 0x100;

/// Style used to program the pull-up/pull-down resistors, which differs
/// between the legacy (150-cycle dance) and BCM2711 (direct two-bit
/// register) families.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PullStyle {
    Legacy,
    Bcm2711,
}

/// The concrete BCM283x variant detected on this host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Soc {
    Bcm2835,
    Bcm2836Or2837,
    Bcm2711,
}

impl Soc {
    pub const fn peripheral_base(self) -> u64 {
        match self {
            Soc::Bcm2835 => 0x2000_0000,
            Soc::Bcm2836Or2837 => 0x3F00_0000,
            Soc::Bcm2711 => 0xFE00_0000,
        }
    }

    /// The OR-mask that turns a DRAM physical address into its uncached
    /// bus alias.
    pub const fn dram_bus_mask(self) -> u32 {
        match self {
            Soc::Bcm2835 => 0x4000_0000,
            Soc::Bcm2836Or2837 | Soc::Bcm2711 => 0xC000_0000,
        }
    }

    pub const fn pull_style(self) -> PullStyle {
        match self {
            Soc::Bcm2835 | Soc::Bcm2836Or2837 => PullStyle::Legacy,
            Soc::Bcm2711 => PullStyle::Bcm2711,
        }
    }

    /// Identify the SoC from the kernel's `/proc/device-tree/compatible`
    /// NUL-separated string list (or an equivalent file, for testing).
    pub fn probe(compatible_path: &Path) -> Result<Soc> {
        let raw = fs::read(compatible_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotPresent
            } else {
                Error::io("read device-tree compatible", e)
            }
        })?;
        Soc::from_compatible_bytes(&raw).ok_or(Error::NotPresent)
    }

    fn from_compatible_bytes(raw: &[u8]) -> Option<Soc> {
        let strings = raw
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s));
        // Ordered most-specific first: a bcm2711 board also lists
        // "brcm,bcm2835"-style ancestors in some device trees.
        let mut found = None;
        for s in strings {
            if s.contains("bcm2711") {
                return Some(Soc::Bcm2711);
            }
            if s.contains("bcm2837") || s.contains("bcm2836") {
                found = found.or(Some(Soc::Bcm2836Or2837));
            }
            if s.contains("bcm2835") || s.contains("bcm2708") || s.contains("bcm2709") {
                found = found.or(Some(Soc::Bcm2836Or2837)).or(found);
                if s.contains("bcm2835") || s.contains("bcm2708") {
                    found = Some(Soc::Bcm2835);
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_compatible(strings: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for s in strings {
            file.write_all(s.as_bytes()).unwrap();
            file.write_all(&[0]).unwrap();
        }
        file
    }

    #[test]
    fn probes_bcm2711() {
        let f = write_compatible(&["raspberrypi,4-model-b", "brcm,bcm2711"]);
        assert_eq!(Soc::probe(f.path()).unwrap(), Soc::Bcm2711);
    }

    #[test]
    fn probes_bcm2837() {
        let f = write_compatible(&["raspberrypi,3-model-b", "brcm,bcm2837"]);
        assert_eq!(Soc::probe(f.path()).unwrap(), Soc::Bcm2836Or2837);
    }

    #[test]
    fn probes_bcm2835() {
        let f = write_compatible(&["raspberrypi,model-zero", "brcm,bcm2835"]);
        assert_eq!(Soc::probe(f.path()).unwrap(), Soc::Bcm2835);
    }

    #[test]
    fn unknown_platform_is_not_present() {
        let f = write_compatible(&["some,other-board"]);
        assert!(matches!(Soc::probe(f.path()), Err(Error::NotPresent)));
    }

    #[test]
    fn missing_file_is_not_present() {
        assert!(matches!(
            Soc::probe(Path::new("/nonexistent/compatible")),
            Err(Error::NotPresent)
        ));
    }

    #[test]
    fn pull_styles_and_masks_match_datasheet() {
        assert_eq!(Soc::Bcm2835.pull_style(), PullStyle::Legacy);
        assert_eq!(Soc::Bcm2836Or2837.pull_style(), PullStyle::Legacy);
        assert_eq!(Soc::Bcm2711.pull_style(), PullStyle::Bcm2711);
        assert_eq!(Soc::Bcm2835.dram_bus_mask(), 0x4000_0000);
        assert_eq!(Soc::Bcm2711.dram_bus_mask(), 0xC000_0000);
    }
}
