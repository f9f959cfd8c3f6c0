// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GPIO controller: function select, level read/write, pull resistors,
//! and pad drive strength over the GPIO register block.

use bcm283x_signal_api::{
    DriveStrength, Error, Function, Level, PadGroup, PinNumber, Pull, Result, SlewLimit,
};

use crate::clock::spin_reading;
use crate::pmap::PullStyle;
use crate::pmem::PhysMemView;

const GPFSEL0: usize = 0x00;
const GPSET0: usize = 0x1C;
const GPCLR0: usize = 0x28;
const GPLEV0: usize = 0x34;
const GPEDS0: usize = 0x40;
const GPPUD: usize = 0x94; // legacy-only
const GPPUDCLK0: usize = 0x98; // legacy-only
const GPPUPPDN0: usize = 0xE4; // BCM2711-only, first of 4 registers

const PADS_GROUP0: usize = 0x2C;
const PADS_GROUP1: usize = 0x30;
const PADS_GROUP2: usize = 0x34;

/// Protection password required in the top byte of every pad-control write.
const PADS_PASSWD: u32 = 0x5A << 24;
const PADS_HYSTERESIS: u32 = 1 << 3;
const PADS_SLEW_NOT_LIMITED: u32 = 1 << 4;

fn fsel_register(pin: PinNumber) -> (usize, u32) {
    let reg = pin as usize / 10;
    let shift = (pin as u32 % 10) * 3;
    (GPFSEL0 + reg * 4, shift)
}

fn bank_register(base: usize, pin: PinNumber) -> (usize, u32) {
    let bank = pin / 32;
    let bit = pin as u32 % 32;
    (base + bank as usize * 4, bit)
}

impl PadGroup {
    fn register_offset(self) -> usize {
        match self {
            PadGroup::Group0 => PADS_GROUP0,
            PadGroup::Group1 => PADS_GROUP1,
            PadGroup::Group2 => PADS_GROUP2,
        }
    }
}

/// Owns the mapped GPIO and pad-control register blocks.
pub struct GpioController {
    gpio: PhysMemView,
    pads: PhysMemView,
    pull_style: PullStyle,
}

impl GpioController {
    pub fn new(gpio: PhysMemView, pads: PhysMemView, pull_style: PullStyle) -> GpioController {
        GpioController {
            gpio,
            pads,
            pull_style,
        }
    }

    fn check_pin(pin: PinNumber) -> Result<()> {
        if pin > bcm283x_signal_api::MAX_PIN {
            return Err(Error::InvalidArgument {
                reason: "pin number out of range",
            });
        }
        Ok(())
    }

    pub fn set_function(&self, pin: PinNumber, function: Function) -> Result<()> {
        Self::check_pin(pin)?;
        let (reg, shift) = fsel_register(pin);
        let mut value = self.gpio.read32(reg);
        value &= !(0b111 << shift);
        value |= function.fsel_bits() << shift;
        self.gpio.write32(reg, value);
        Ok(())
    }

    pub fn function(&self, pin: PinNumber) -> Result<Function> {
        Self::check_pin(pin)?;
        let (reg, shift) = fsel_register(pin);
        Ok(Function::from_fsel_bits(self.gpio.read32(reg) >> shift))
    }

    pub fn read(&self, pin: PinNumber) -> Result<Level> {
        Self::check_pin(pin)?;
        let (reg, bit) = bank_register(GPLEV0, pin);
        Ok(Level::from_bit(self.gpio.read32(reg) & (1 << bit) != 0))
    }

    pub fn write(&self, pin: PinNumber, level: Level) -> Result<()> {
        Self::check_pin(pin)?;
        let base = if level.is_high() { GPSET0 } else { GPCLR0 };
        let (reg, bit) = bank_register(base, pin);
        self.gpio.write32(reg, 1 << bit);
        Ok(())
    }

    /// Clears the sticky event-detect-status bit for `pin`, acknowledging a
    /// previously latched edge.
    pub fn clear_event_detect(&self, pin: PinNumber) -> Result<()> {
        Self::check_pin(pin)?;
        let (reg, bit) = bank_register(GPEDS0, pin);
        self.gpio.write32(reg, 1 << bit);
        Ok(())
    }

    /// Programs the pull resistor for `pin`, using whichever dance this
    /// SoC family requires.
    pub fn set_pull(&self, pin: PinNumber, pull: Pull) -> Result<()> {
        Self::check_pin(pin)?;
        match self.pull_style {
            PullStyle::Legacy => self.set_pull_legacy(pin, pull),
            PullStyle::Bcm2711 => self.set_pull_bcm2711(pin, pull),
        }
        Ok(())
    }

    /// The BCM2835/2836/2837 sequence: write the desired pull to `GPPUD`,
    /// wait 150 cycles, clock it into the target pin's `GPPUDCLK`, wait
    /// another 150 cycles, then clear both registers. The spin delays are
    /// the datasheet's own figure, not a tunable.
    fn set_pull_legacy(&self, pin: PinNumber, pull: Pull) {
        self.gpio.write32(GPPUD, pull.legacy_bits());
        spin_reading(&self.gpio, GPPUD, 150);

        let (clk_reg, bit) = bank_register(GPPUDCLK0, pin);
        self.gpio.write32(clk_reg, 1 << bit);
        spin_reading(&self.gpio, clk_reg, 150);

        self.gpio.write32(GPPUD, 0);
        self.gpio.write32(clk_reg, 0);
    }

    /// The BCM2711 sequence: a direct two-bit field per pin in `GPPUPPDN0`
    /// through `GPPUPPDN3`, no clocking dance required.
    fn set_pull_bcm2711(&self, pin: PinNumber, pull: Pull) {
        let reg = GPPUPPDN0 + (pin as usize / 16) * 4;
        let shift = (pin as u32 % 16) * 2;
        let mut value = self.gpio.read32(reg);
        value &= !(0b11 << shift);
        value |= pull.bcm2711_bits() << shift;
        self.gpio.write32(reg, value);
    }

    /// Programs drive strength, slew-rate limiting, and input hysteresis
    /// for a whole pad group at once (§4.6 `pad_set`); every pin in the
    /// group shares these settings. Every write carries the `0x5A`
    /// protection password in its top byte.
    pub fn pad_set(
        &self,
        group: PadGroup,
        drive: DriveStrength,
        slew_limit: SlewLimit,
        hysteresis: bool,
    ) {
        let mut value = PADS_PASSWD | drive.field_bits();
        if hysteresis {
            value |= PADS_HYSTERESIS;
        }
        if slew_limit == SlewLimit::NotLimited {
            value |= PADS_SLEW_NOT_LIMITED;
        }
        self.pads.write32(group.register_offset(), value);
    }

    /// Sets drive strength/slew/hysteresis for pins 0..=27 (pad group 0).
    pub fn setup_0_to_27(&self, drive: DriveStrength, slew_limit: SlewLimit, hysteresis: bool) {
        self.pad_set(PadGroup::Group0, drive, slew_limit, hysteresis)
    }

    /// Sets drive strength/slew/hysteresis for pins 28..=45 (pad group 1).
    pub fn setup_28_to_45(&self, drive: DriveStrength, slew_limit: SlewLimit, hysteresis: bool) {
        self.pad_set(PadGroup::Group1, drive, slew_limit, hysteresis)
    }

    /// Bulk level read of pins 0..=31.
    pub fn read_0_to_31(&self) -> u32 {
        self.gpio.read32(GPLEV0)
    }

    /// Bulk level read of pins 32..=46 (bits 0..=14 of the result).
    pub fn read_32_to_46(&self) -> u32 {
        self.gpio.read32(GPLEV0 + 4) & 0x7FFF
    }

    pub fn set_0_to_31(&self, mask: u32) {
        self.gpio.write32(GPSET0, mask);
    }

    pub fn clear_0_to_31(&self, mask: u32) {
        self.gpio.write32(GPCLR0, mask);
    }

    pub fn set_32_to_46(&self, mask: u32) {
        self.gpio.write32(GPSET0 + 4, mask & 0x7FFF);
    }

    pub fn clear_32_to_46(&self, mask: u32) {
        self.gpio.write32(GPCLR0 + 4, mask & 0x7FFF);
    }

    /// Returns a pin to a quiescent state: input, floating.
    pub fn halt(&self, pin: PinNumber) -> Result<()> {
        self.set_function(pin, Function::Input)?;
        self.set_pull(pin, Pull::Float)
    }

    /// Reports `pin`'s current mode as a human-readable capability name:
    /// `"in"`/`"out"` for the plain modes, or the datasheet's name for
    /// whichever alternate function is currently selected (§4.6 "Function
    /// mapping").
    pub fn capability_name(&self, pin: PinNumber) -> Result<&'static str> {
        let function = self.function(pin)?;
        Ok(match function {
            Function::Input => "in",
            Function::Output => "out",
            _ => ALT_FUNCTION_NAMES[pin as usize][alt_table_index(function)],
        })
    }
}

/// Index into a pin's `ALT_FUNCTION_NAMES` row for the currently selected
/// alternate function. Panics are impossible here since the only callers
/// pass a `Function` that is not `Input`/`Output`.
const fn alt_table_index(function: Function) -> usize {
    match function {
        Function::Alt0 => 0,
        Function::Alt1 => 1,
        Function::Alt2 => 2,
        Function::Alt3 => 3,
        Function::Alt4 => 4,
        Function::Alt5 => 5,
        Function::Input | Function::Output => 0,
    }
}

/// The datasheet's per-pin alternate-function name table (ALT0..ALT5),
/// reproduced from the BCM2835 ARM Peripherals datasheet's GPIO alternate
/// function assignment table. Pins 46..53 carry no alternate function on
/// any board this crate targets and are marked `"reserved"` throughout.
#[rustfmt::skip]
const ALT_FUNCTION_NAMES: [[&str; 6]; bcm283x_signal_api::PIN_COUNT] = [
    //          ALT0              ALT1        ALT2         ALT3             ALT4         ALT5
    /*  0 */ ["sda0",          "sa5",      "pclk",      "reserved",      "reserved",  "reserved"],
    /*  1 */ ["scl0",          "sa4",      "fs1",       "reserved",      "reserved",  "reserved"],
    /*  2 */ ["sda1",          "sa3",      "lan_run",   "reserved",      "reserved",  "reserved"],
    /*  3 */ ["scl1",          "sa2",      "reserved",  "reserved",      "reserved",  "reserved"],
    /*  4 */ ["gpclk0",        "sa1",      "reserved",  "reserved",      "arm_tdi",   "reserved"],
    /*  5 */ ["gpclk1",        "sa0",      "reserved",  "reserved",      "arm_tdo",   "reserved"],
    /*  6 */ ["gpclk2",        "soe_n",    "reserved",  "reserved",      "arm_rtck",  "reserved"],
    /*  7 */ ["spi0_ce1_n",    "swe_n",    "reserved",  "reserved",      "reserved",  "reserved"],
    /*  8 */ ["spi0_ce0_n",    "sd0",      "reserved",  "reserved",      "reserved",  "reserved"],
    /*  9 */ ["spi0_miso",     "sd1",      "reserved",  "reserved",      "reserved",  "reserved"],
    /* 10 */ ["spi0_mosi",     "sd2",      "reserved",  "reserved",      "reserved",  "reserved"],
    /* 11 */ ["spi0_sclk",     "sd3",      "reserved",  "reserved",      "reserved",  "reserved"],
    /* 12 */ ["pwm0",          "sd4",      "reserved",  "reserved",      "arm_tms",   "reserved"],
    /* 13 */ ["pwm1",          "sd5",      "reserved",  "reserved",      "arm_tck",   "reserved"],
    /* 14 */ ["txd0",          "sd6",      "reserved",  "reserved",      "reserved",  "txd1"],
    /* 15 */ ["rxd0",          "sd7",      "reserved",  "reserved",      "reserved",  "rxd1"],
    /* 16 */ ["reserved",      "sd8",      "cts0",      "spi1_ce2_n",    "reserved",  "cts1"],
    /* 17 */ ["reserved",      "sd9",      "rts0",      "spi1_ce1_n",    "reserved",  "rts1"],
    /* 18 */ ["pcm_clk",       "sd10",     "reserved",  "spi1_ce0_n",    "reserved",  "pwm0"],
    /* 19 */ ["pcm_fs",        "sd11",     "reserved",  "spi1_miso",     "reserved",  "pwm1"],
    /* 20 */ ["pcm_din",       "sd12",     "reserved",  "spi1_mosi",     "reserved",  "gpclk0"],
    /* 21 */ ["pcm_dout",      "sd13",     "reserved",  "spi1_sclk",     "reserved",  "gpclk1"],
    /* 22 */ ["reserved",      "sd14",     "sd1_clk",   "arm_trst",      "reserved",  "reserved"],
    /* 23 */ ["reserved",      "sd15",     "sd1_cmd",   "arm_rtck",      "reserved",  "reserved"],
    /* 24 */ ["reserved",      "sd16",     "sd1_dat0",  "arm_tdo",       "reserved",  "reserved"],
    /* 25 */ ["reserved",      "sd17",     "sd1_dat1",  "arm_tck",       "reserved",  "reserved"],
    /* 26 */ ["reserved",      "reserved", "sd1_dat2",  "arm_tdi",       "reserved",  "reserved"],
    /* 27 */ ["reserved",      "reserved", "sd1_dat3",  "arm_tms",       "reserved",  "reserved"],
    /* 28 */ ["sda0",          "sa5",      "pcm_clk",   "reserved",      "reserved",  "reserved"],
    /* 29 */ ["scl0",          "sa4",      "pcm_fs",    "reserved",      "reserved",  "reserved"],
    /* 30 */ ["reserved",      "sa3",      "pcm_din",   "cts0",          "reserved",  "cts1"],
    /* 31 */ ["reserved",      "sa2",      "pcm_dout",  "rts0",          "reserved",  "rts1"],
    /* 32 */ ["gpclk0",        "sa1",      "reserved",  "txd0",          "reserved",  "txd1"],
    /* 33 */ ["reserved",      "sa0",      "reserved",  "rxd0",          "reserved",  "rxd1"],
    /* 34 */ ["gpclk0",        "soe_n",    "reserved",  "reserved",      "reserved",  "reserved"],
    /* 35 */ ["spi0_ce1_n",    "swe_n",    "reserved",  "reserved",      "reserved",  "reserved"],
    /* 36 */ ["spi0_ce0_n",    "sd0",      "txd0",      "reserved",      "reserved",  "reserved"],
    /* 37 */ ["spi0_miso",     "sd1",      "rxd0",      "reserved",      "reserved",  "reserved"],
    /* 38 */ ["spi0_mosi",     "sd2",      "rts0",      "reserved",      "reserved",  "reserved"],
    /* 39 */ ["spi0_sclk",     "sd3",      "cts0",      "reserved",      "reserved",  "reserved"],
    /* 40 */ ["pwm0",          "sd4",      "reserved",  "spi2_miso",     "txd1",      "reserved"],
    /* 41 */ ["pwm1",          "sd5",      "reserved",  "spi2_mosi",     "rxd1",      "reserved"],
    /* 42 */ ["gpclk1",        "sd6",      "reserved",  "spi2_sclk",     "rts1",      "reserved"],
    /* 43 */ ["gpclk2",        "sd7",      "reserved",  "spi2_ce0_n",    "cts1",      "reserved"],
    /* 44 */ ["gpclk1",        "sda0",     "sda1",      "spi2_ce1_n",    "reserved",  "reserved"],
    /* 45 */ ["pwm1",          "scl0",     "scl1",      "spi2_ce2_n",    "reserved",  "reserved"],
    /* 46 */ ["reserved",      "reserved", "reserved",  "reserved",      "reserved",  "reserved"],
    /* 47 */ ["reserved",      "reserved", "reserved",  "reserved",      "reserved",  "reserved"],
    /* 48 */ ["reserved",      "reserved", "reserved",  "reserved",      "reserved",  "reserved"],
    /* 49 */ ["reserved",      "reserved", "reserved",  "reserved",      "reserved",  "reserved"],
    /* 50 */ ["reserved",      "reserved", "reserved",  "reserved",      "reserved",  "reserved"],
    /* 51 */ ["reserved",      "reserved", "reserved",  "reserved",      "reserved",  "reserved"],
    /* 52 */ ["reserved",      "reserved", "reserved",  "reserved",      "reserved",  "reserved"],
    /* 53 */ ["reserved",      "reserved", "reserved",  "reserved",      "reserved",  "reserved"],
];

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(pull_style: PullStyle) -> GpioController {
        let file = tempfile::tempfile().unwrap();
        file.set_len(8192).unwrap();
        let gpio = PhysMemView::map(&file, 0, 4096).unwrap();
        let pads = PhysMemView::map(&file, 4096, 64).unwrap();
        GpioController::new(gpio, pads, pull_style)
    }

    #[test]
    fn set_and_read_function() {
        let c = controller(PullStyle::Legacy);
        c.set_function(17, Function::Alt0).unwrap();
        assert_eq!(c.function(17).unwrap(), Function::Alt0);
        c.set_function(17, Function::Output).unwrap();
        assert_eq!(c.function(17).unwrap(), Function::Output);
    }

    #[test]
    fn write_and_read_level() {
        let c = controller(PullStyle::Legacy);
        c.write(4, Level::High).unwrap();
        assert_eq!(c.read(4).unwrap(), Level::High);
        assert_eq!(c.read_0_to_31() & (1 << 4), 1 << 4);
        c.write(4, Level::Low).unwrap();
        assert_eq!(c.read(4).unwrap(), Level::Low);
    }

    #[test]
    fn bank_31_48_split_uses_second_register() {
        let c = controller(PullStyle::Legacy);
        c.write(40, Level::High).unwrap();
        assert_eq!(c.read(40).unwrap(), Level::High);
        assert_ne!(c.read_32_to_46() & (1 << (40 - 32)), 0);
    }

    #[test]
    fn legacy_pull_dance_leaves_registers_clear() {
        let c = controller(PullStyle::Legacy);
        c.set_pull(10, Pull::Up).unwrap();
        assert_eq!(c.gpio.read32(GPPUD), 0);
        assert_eq!(c.gpio.read32(GPPUDCLK0), 0);
    }

    #[test]
    fn bcm2711_pull_is_direct_two_bit_field() {
        let c = controller(PullStyle::Bcm2711);
        c.set_pull(3, Pull::Down).unwrap();
        let value = c.gpio.read32(GPPUPPDN0);
        assert_eq!((value >> 6) & 0b11, Pull::Down.bcm2711_bits());
    }

    #[test]
    fn invalid_pin_is_rejected() {
        let c = controller(PullStyle::Legacy);
        assert!(c.set_function(60, Function::Output).is_err());
    }

    #[test]
    fn drive_strength_written_to_correct_group() {
        let c = controller(PullStyle::Legacy);
        c.pad_set(
            PadGroup::Group1,
            DriveStrength::from_ma(8).unwrap(),
            SlewLimit::Limited,
            false,
        );
        let value = c.pads.read32(PADS_GROUP1);
        assert_eq!(value & 0b111, DriveStrength::from_ma(8).unwrap().field_bits());
        assert_eq!(value >> 24, 0x5A);
    }

    #[test]
    fn pad_set_encodes_slew_and_hysteresis_bits() {
        let c = controller(PullStyle::Legacy);
        c.setup_0_to_27(DriveStrength::from_ma(2).unwrap(), SlewLimit::NotLimited, true);
        let value = c.pads.read32(PADS_GROUP0);
        assert_ne!(value & PADS_HYSTERESIS, 0);
        assert_ne!(value & PADS_SLEW_NOT_LIMITED, 0);
    }

    #[test]
    fn capability_name_reports_alt_function() {
        let c = controller(PullStyle::Legacy);
        assert_eq!(c.capability_name(4).unwrap(), "in");
        c.set_function(4, Function::Output).unwrap();
        assert_eq!(c.capability_name(4).unwrap(), "out");
        c.set_function(4, Function::Alt0).unwrap();
        assert_eq!(c.capability_name(4).unwrap(), "gpclk0");
    }
}
