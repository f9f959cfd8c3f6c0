// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared vocabulary for the BCM283x GPIO + DMA signal subsystem.
//!
//! This crate holds the types a caller needs to describe *what* it wants
//! (a pin, a function, a stream of bits) without linking the register-level
//! driver in `bcm283x-signal-core`. It mirrors the way the teacher keeps a
//! `-api` crate per hardware driver so that the wire vocabulary is reusable
//! independent of the implementation; there is no IPC boundary here, so the
//! split exists purely to separate "what a stream is" from "how it gets
//! rasterised into DMA control blocks".

use core::fmt;

pub mod stream;
pub use stream::{BitOrder, BitStream, EdgeStream, Program, Stream};

/// Logical GPIO pin number, 0..=53 on BCM283x.
pub type PinNumber = u8;

/// Highest valid pin number on the BCM283x family.
pub const MAX_PIN: PinNumber = 53;

/// Number of pins in the family.
pub const PIN_COUNT: usize = MAX_PIN as usize + 1;

/// Per-pin alternate function selector, matching the three-bit FSEL encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Function {
    Input,
    Output,
    Alt0,
    Alt1,
    Alt2,
    Alt3,
    Alt4,
    Alt5,
}

impl Function {
    /// The three-bit value written into the pin's FSEL slot.
    pub const fn fsel_bits(self) -> u32 {
        match self {
            Function::Input => 0b000,
            Function::Output => 0b001,
            Function::Alt0 => 0b100,
            Function::Alt1 => 0b101,
            Function::Alt2 => 0b110,
            Function::Alt3 => 0b111,
            Function::Alt4 => 0b011,
            Function::Alt5 => 0b010,
        }
    }

    /// Recover a `Function` from a three-bit FSEL value.
    pub const fn from_fsel_bits(bits: u32) -> Function {
        match bits & 0b111 {
            0b000 => Function::Input,
            0b001 => Function::Output,
            0b100 => Function::Alt0,
            0b101 => Function::Alt1,
            0b110 => Function::Alt2,
            0b111 => Function::Alt3,
            0b011 => Function::Alt4,
            _ => Function::Alt5,
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Function::Input => "in",
            Function::Output => "out",
            Function::Alt0 => "alt0",
            Function::Alt1 => "alt1",
            Function::Alt2 => "alt2",
            Function::Alt3 => "alt3",
            Function::Alt4 => "alt4",
            Function::Alt5 => "alt5",
        };
        f.write_str(s)
    }
}

/// Pull-resistor configuration for an input pin.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pull {
    Float,
    Up,
    Down,
}

impl Pull {
    /// Value written into the legacy PUD-enable register, or the BCM2711
    /// two-bit pull register slot.
    pub const fn legacy_bits(self) -> u32 {
        match self {
            Pull::Float => 0b00,
            Pull::Up => 0b10,
            Pull::Down => 0b01,
        }
    }

    /// Value written into a BCM2711 `GPPUPPDN` two-bit slot (00=Float,
    /// 01=Up, 10=Down -- note this differs from the legacy encoding above).
    pub const fn bcm2711_bits(self) -> u32 {
        match self {
            Pull::Float => 0b00,
            Pull::Up => 0b01,
            Pull::Down => 0b10,
        }
    }
}

/// Logical signal level.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub const fn from_bit(bit: bool) -> Level {
        if bit {
            Level::High
        } else {
            Level::Low
        }
    }

    pub const fn is_high(self) -> bool {
        matches!(self, Level::High)
    }
}

/// Edge-detection mode requested of the external edge-watcher collaborator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

/// One of the three pad-control groups (drive strength / slew / hysteresis
/// are set per group, not per pin).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PadGroup {
    /// Pins 0..27.
    Group0,
    /// Pins 28..45.
    Group1,
    /// Pins 46..53.
    Group2,
}

impl PadGroup {
    pub const fn containing(pin: PinNumber) -> Option<PadGroup> {
        match pin {
            0..=27 => Some(PadGroup::Group0),
            28..=45 => Some(PadGroup::Group1),
            46..=53 => Some(PadGroup::Group2),
            _ => None,
        }
    }
}

/// Slew-rate limiting mode for a pad group's output driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlewLimit {
    Limited,
    NotLimited,
}

/// Drive strength for a pad group, in milliamps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DriveStrength(u8);

impl DriveStrength {
    /// Construct from a datasheet-legal value in {2,4,6,8,10,12,14,16} mA.
    pub const fn from_ma(ma: u8) -> Option<DriveStrength> {
        match ma {
            2 | 4 | 6 | 8 | 10 | 12 | 14 | 16 => Some(DriveStrength(ma)),
            _ => None,
        }
    }

    /// The three-bit field value for the pad control register.
    pub const fn field_bits(self) -> u32 {
        (self.0 as u32 / 2) - 1
    }
}

/// The clock sources available to the general-purpose and PCM/PWM clocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockSource {
    Ground,
    Oscillator19_2MHz,
    PllA,
    PllC,
    PllD500MHz,
    Hdmi216MHz,
}

impl ClockSource {
    /// Nominal source frequency in Hz, or `None` for a source this driver
    /// does not model a concrete rate for (ground, PLLA -- both excluded
    /// from the candidate search in `clkmgr::solve`).
    pub const fn nominal_hz(self) -> Option<u32> {
        match self {
            ClockSource::Ground => None,
            ClockSource::Oscillator19_2MHz => Some(19_200_000),
            ClockSource::PllA => None,
            ClockSource::PllC => Some(1_000_000_000),
            ClockSource::PllD500MHz => Some(500_000_000),
            ClockSource::Hdmi216MHz => Some(216_000_000),
        }
    }

    /// The 4-bit SRC field of the clock control register.
    pub const fn src_bits(self) -> u32 {
        match self {
            ClockSource::Ground => 0,
            ClockSource::Oscillator19_2MHz => 1,
            ClockSource::PllA => 4,
            ClockSource::PllC => 5,
            ClockSource::PllD500MHz => 6,
            ClockSource::Hdmi216MHz => 7,
        }
    }
}

/// MASH noise-shaping mode for a fractional clock divisor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mash {
    Integer = 0,
    Stage1 = 1,
    Stage2 = 2,
    Stage3 = 3,
}

/// A solved clock configuration: which source, what divisor, and how
/// many DREQ "wait cycles" the consumer must additionally divide by.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClockSolution {
    pub source: ClockSource,
    pub divi: u16,
    pub divf: u16,
    pub wait_cycles: u32,
    /// The frequency this solution actually produces, in Hz.
    pub actual_hz: u32,
    /// True if `actual_hz` only approximates the request (the oversampled
    /// fallback of step 4 in the clock-manager algorithm).
    pub oversampled: bool,
}

/// Duty cycle for a DMA-PWM session, expressed as ticks-high out of the
/// implied 200kHz-tick period, or as a named convenience fraction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Duty {
    Fraction { numerator: u32, denominator: u32 },
}

impl Duty {
    pub const HALF: Duty = Duty::Fraction {
        numerator: 1,
        denominator: 2,
    };

    pub const fn ticks_high(self, period_ticks: u32) -> u32 {
        match self {
            Duty::Fraction {
                numerator,
                denominator,
            } => {
                // Integer rounding; exact for the common halves/quarters the
                // caller is expected to pass.
                (period_ticks as u64 * numerator as u64 / denominator as u64) as u32
            }
        }
    }
}

/// Trait implemented by the external edge-watcher collaborator (typically a
/// sysfs-GPIO backend). The core never implements this itself: in-process
/// latching of the CPU-visible event-detect-status bits does not wake a
/// sleeping thread, so a real wakeup source must come from outside.
pub trait EdgeWatcher {
    type Error;

    fn subscribe(&mut self, pin: PinNumber, edge: Edge) -> Result<(), Self::Error>;
    fn unsubscribe(&mut self, pin: PinNumber) -> Result<(), Self::Error>;
    fn wait_for_edge(
        &mut self,
        pin: PinNumber,
        timeout: core::time::Duration,
    ) -> Result<bool, Self::Error>;
}

/// A dyn-safe sliver of [`EdgeWatcher`] carrying only `unsubscribe`, so that
/// `Pin::halt` can reach the collaborator without being made generic over
/// `EdgeWatcher::Error` itself. Errors from `unsubscribe` are logged rather
/// than propagated: halt is meant to be infallible best-effort teardown.
pub trait EdgeUnsubscribe {
    fn unsubscribe(&mut self, pin: PinNumber);
}

impl<W: EdgeWatcher> EdgeUnsubscribe for W {
    fn unsubscribe(&mut self, pin: PinNumber) {
        if EdgeWatcher::unsubscribe(self, pin).is_err() {
            log::warn!("edge watcher unsubscribe failed for pin {pin} during halt");
        }
    }
}

/// Every fallible operation in this subsystem returns one of these. Modeled
/// by hand, in the style of the teacher's `GpioError`/`RccError` enums,
/// rather than via a derive-macro error crate (the teacher pulls in none).
#[derive(Debug)]
pub enum Error {
    /// Not running on a BCM283x: the platform probe in PMAP did not
    /// recognise any known `compatible` string.
    NotPresent,
    /// The GPIO-mem device and `/dev/mem` were both inaccessible.
    PermissionDenied { path: &'static str },
    /// A DMA or clock operation was requested before `Driver::init`
    /// finished mapping the relevant register block.
    NotInitialised { component: &'static str },
    /// A frequency, duty cycle, or stream description was out of range.
    InvalidArgument { reason: &'static str },
    /// No free DMA channel, or a clock source stayed BUSY after
    /// reprogramming.
    Busy { what: &'static str },
    /// The DMA engine reported READ_ERROR, FIFO_ERROR, or
    /// READ_LAST_NOT_SET_ERROR while waiting on a channel.
    HardwareFault { channel: u8, flags: u32 },
    /// The GPU mailbox replied with an unexpected marker or length.
    MailboxFault { detail: &'static str },
    /// An edge subscription was requested for a pin the edge-watcher
    /// collaborator does not export.
    EdgeNotAvailable { pin: PinNumber },
    /// Wrapper around an I/O failure (opening `/dev/mem`, `/dev/vcio`,
    /// `/proc/self/pagemap`, ...). Carries just the formatted message,
    /// since `std::io::Error` does not implement `Clone`/`Copy` and this
    /// enum is otherwise kept cheap to construct from `const` data.
    Io { context: &'static str, message: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotPresent => write!(f, "not running on a BCM283x SoC"),
            Error::PermissionDenied { path } => {
                write!(f, "permission denied opening {path}; run as root or fix permissions")
            }
            Error::NotInitialised { component } => {
                write!(f, "{component} used before driver initialisation mapped its registers")
            }
            Error::InvalidArgument { reason } => write!(f, "invalid argument: {reason}"),
            Error::Busy { what } => write!(f, "{what} busy"),
            Error::HardwareFault { channel, flags } => {
                write!(f, "DMA channel {channel} hardware fault, CS={flags:#010x}")
            }
            Error::MailboxFault { detail } => write!(f, "videocore mailbox fault: {detail}"),
            Error::EdgeNotAvailable { pin } => {
                write!(f, "pin {pin} is not exported by the edge watcher")
            }
            Error::Io { context, message } => write!(f, "{context}: {message}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn io(context: &'static str, err: impl fmt::Display) -> Error {
        Error::Io {
            context,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_fsel_bits_round_trip() {
        for f in [
            Function::Input,
            Function::Output,
            Function::Alt0,
            Function::Alt1,
            Function::Alt2,
            Function::Alt3,
            Function::Alt4,
            Function::Alt5,
        ] {
            assert_eq!(Function::from_fsel_bits(f.fsel_bits()), f);
        }
    }

    #[test]
    fn drive_strength_rejects_non_datasheet_values() {
        assert!(DriveStrength::from_ma(3).is_none());
        assert_eq!(DriveStrength::from_ma(2).unwrap().field_bits(), 0);
        assert_eq!(DriveStrength::from_ma(16).unwrap().field_bits(), 7);
    }

    #[test]
    fn pad_group_containing_covers_every_pin() {
        assert_eq!(PadGroup::containing(0), Some(PadGroup::Group0));
        assert_eq!(PadGroup::containing(27), Some(PadGroup::Group0));
        assert_eq!(PadGroup::containing(28), Some(PadGroup::Group1));
        assert_eq!(PadGroup::containing(45), Some(PadGroup::Group1));
        assert_eq!(PadGroup::containing(46), Some(PadGroup::Group2));
        assert_eq!(PadGroup::containing(53), Some(PadGroup::Group2));
    }

    #[test]
    fn duty_half_rounds_to_period_midpoint() {
        assert_eq!(Duty::HALF.ticks_high(40_000), 20_000);
        assert_eq!(
            Duty::Fraction {
                numerator: 1,
                denominator: 4
            }
            .ticks_high(40_000),
            10_000
        );
    }

    #[test]
    fn clock_source_nominal_hz_excludes_unmodeled_sources() {
        assert_eq!(ClockSource::Ground.nominal_hz(), None);
        assert_eq!(ClockSource::PllA.nominal_hz(), None);
        assert_eq!(ClockSource::Oscillator19_2MHz.nominal_hz(), Some(19_200_000));
    }

    #[test]
    fn error_display_carries_context() {
        let err = Error::HardwareFault {
            channel: 4,
            flags: 0x101,
        };
        assert_eq!(err.to_string(), "DMA channel 4 hardware fault, CS=0x00000101");
    }

    #[test]
    fn edge_unsubscribe_blanket_impl_logs_but_does_not_panic() {
        struct AlwaysFails;
        impl EdgeWatcher for AlwaysFails {
            type Error = ();
            fn subscribe(&mut self, _pin: PinNumber, _edge: Edge) -> core::result::Result<(), ()> {
                Ok(())
            }
            fn unsubscribe(&mut self, _pin: PinNumber) -> core::result::Result<(), ()> {
                Err(())
            }
            fn wait_for_edge(
                &mut self,
                _pin: PinNumber,
                _timeout: core::time::Duration,
            ) -> core::result::Result<bool, ()> {
                Ok(false)
            }
        }
        let mut watcher = AlwaysFails;
        EdgeUnsubscribe::unsubscribe(&mut watcher, 4);
    }
}
