// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clock manager (CLKMGR): programs the general-purpose clocks and the
//! PCM/PWM clock source, including the safe "clear enable, wait busy,
//! reprogram, re-enable" sequence the datasheet requires.

use std::time::Duration;

use bcm283x_signal_api::{ClockSolution, ClockSource, Mash, Result};

use crate::pmem::PhysMemView;

/// Byte offsets, from the clock manager's base, of each clock's
/// (control, divisor) register pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Clock {
    Gp0,
    Gp1,
    Gp2,
    Pcm,
    Pwm,
}

impl Clock {
    const fn ctl_offset(self) -> usize {
        match self {
            Clock::Gp0 => 0x70,
            Clock::Gp1 => 0x78,
            Clock::Gp2 => 0x80,
            Clock::Pcm => 0x98,
            Clock::Pwm => 0xA0,
        }
    }

    const fn div_offset(self) -> usize {
        self.ctl_offset() + 4
    }
}

const PASSWORD: u32 = 0x5A << 24;
const CTL_ENAB: u32 = 1 << 4;
const CTL_KILL: u32 = 1 << 5;
const CTL_BUSY: u32 = 1 << 7;
const CTL_MASH_SHIFT: u32 = 9;
const CTL_SRC_MASK: u32 = 0xF;

/// Candidate clock sources in priority order, §4.4 step 1. `PllA` is never
/// tried: its frequency is board/config dependent and not modeled here.
const CANDIDATE_SOURCES: &[ClockSource] = &[
    ClockSource::Oscillator19_2MHz,
    ClockSource::PllD500MHz,
    ClockSource::PllC,
    ClockSource::Hdmi216MHz,
];

/// Maximum integer divisor, DIVI being a 12-bit field.
const MAX_DIVI: u32 = 4095;

fn ctl_bits(source: ClockSource, mash: Mash, enabled: bool, kill: bool) -> u32 {
    PASSWORD
        | source.src_bits()
        | ((mash as u32) << CTL_MASH_SHIFT)
        | if enabled { CTL_ENAB } else { 0 }
        | if kill { CTL_KILL } else { 0 }
}

fn div_bits(divi: u16, divf: u16) -> u32 {
    PASSWORD | ((divi as u32) << 12) | (divf as u32 & 0xFFF)
}

/// Finds the best exact divisor for `target_hz` out of `source_hz`, or --
/// failing that -- the lowest-frequency exact combination this source can
/// produce within `max_wait`, per §4.4 steps 2-4.
///
/// Returns `(divi, wait_cycles, actual_hz, oversampled)`.
fn solve_source(source_hz: u32, target_hz: u64, max_wait: u32) -> Option<(u16, u32, u32, bool)> {
    let mut best_floor: Option<(u16, u32, u32)> = None; // (divi, wait, actual) maximizing divi*wait

    for wait in 1..=max_wait.max(1) {
        // Exact match for this wait, if one exists: DIVI is uniquely
        // determined (no inner search needed).
        let denom = target_hz as u64 * wait as u64;
        if denom != 0 && source_hz as u64 % denom == 0 {
            let divi = source_hz as u64 / denom;
            if divi >= 1 && divi <= MAX_DIVI as u64 {
                return Some((divi as u16, wait, target_hz as u32, false));
            }
        }

        // Track the largest exact divisor*wait for the oversample floor,
        // scanning divi from the top down so the first hit is the best
        // for this wait.
        for divi in (1..=MAX_DIVI).rev() {
            let d = divi as u64 * wait as u64;
            if d == 0 || source_hz as u64 % d != 0 {
                continue;
            }
            let actual = (source_hz as u64 / d) as u32;
            let better = match best_floor {
                None => true,
                Some((_, _, prev_actual)) => actual < prev_actual,
            };
            if better {
                best_floor = Some((divi as u16, wait, actual));
            }
            break; // first (largest) divi for this wait is its best
        }
    }

    best_floor.map(|(divi, wait, actual)| (divi, wait, actual, true))
}

/// Picks `(source, divi, divf, wait_cycles, actual_hz, oversampled)` for
/// `target_hz`, trying sources in priority order and returning on the
/// first exact match or the first "below this source's minimum"
/// oversample fallback.
pub fn solve(target_hz: u32, max_wait: u32, allow_overclock: bool) -> Result<ClockSolution> {
    if target_hz == 0 || target_hz > 25_000_000 {
        return Err(bcm283x_signal_api::Error::InvalidArgument {
            reason: "clock frequency must be in (0, 25MHz]",
        });
    }

    for &source in CANDIDATE_SOURCES {
        if source == ClockSource::PllC && !allow_overclock {
            continue;
        }
        let Some(source_hz) = source.nominal_hz() else {
            continue;
        };

        let floor_hz = source_hz / (MAX_DIVI * max_wait.max(1)).max(1);
        if (target_hz as u64) < floor_hz as u64 {
            // Below this source's reach: return its best (lowest) exact
            // frequency immediately, per §4.4 step 4.
            if let Some((divi, wait, actual, _)) = solve_source(source_hz, 1, max_wait) {
                // A target of "1" lets solve_source's floor-tracking loop
                // run to completion and hand back the minimum it found.
                log::warn!(
                    "clock target {target_hz}Hz below {source:?}'s reach; oversampling to {actual}Hz"
                );
                return Ok(ClockSolution {
                    source,
                    divi,
                    divf: 0,
                    wait_cycles: wait,
                    actual_hz: actual,
                    oversampled: true,
                });
            }
            continue;
        }

        if let Some((divi, wait, actual, oversampled)) =
            solve_source(source_hz, target_hz as u64, max_wait)
        {
            if !oversampled {
                return Ok(ClockSolution {
                    source,
                    divi,
                    divf: 0,
                    wait_cycles: wait,
                    actual_hz: actual,
                    oversampled: false,
                });
            }
        }
    }

    Err(bcm283x_signal_api::Error::InvalidArgument {
        reason: "no clock source/divisor combination reaches the requested frequency",
    })
}

/// Spins for approximately `cycles` peripheral-register reads. Used for
/// the legacy pull dance (§4.6) and as the inter-write delay the datasheet
/// requires during clock reprogramming; reads a live register so the
/// compiler cannot elide the loop.
pub fn spin_reading(view: &PhysMemView, offset: usize, cycles: u32) {
    let mut sink: u32 = 0;
    for _ in 0..cycles {
        sink ^= view.read32(offset);
    }
    std::hint::black_box(sink);
}

/// Owns the clock manager's mapped register block.
pub struct ClockManager {
    view: PhysMemView,
}

impl ClockManager {
    pub fn new(view: PhysMemView) -> ClockManager {
        ClockManager { view }
    }

    fn busy(&self, clock: Clock) -> bool {
        self.view.read32(clock.ctl_offset()) & CTL_BUSY != 0
    }

    /// Programs `clock` per the solved `(source, divi, divf, mash)`,
    /// following the datasheet's safe sequence: clear ENAB, poll BUSY,
    /// write the new divisor, set ENAB. Must not be called while the
    /// clock is already running at a different source without first
    /// halting it (source must not change while busy).
    pub fn reprogram(&self, clock: Clock, source: ClockSource, divi: u16, divf: u16, mash: Mash) {
        // Clear ENAB (source/divisor unchanged while busy is an
        // invariant, not something we can race past).
        self.view
            .write32(clock.ctl_offset(), PASSWORD | self.view.read32(clock.ctl_offset()) & !CTL_ENAB);
        spin_reading(&self.view, clock.ctl_offset(), 150);

        while self.busy(clock) {
            spin_reading(&self.view, clock.ctl_offset(), 150);
        }

        self.view.write32(clock.div_offset(), div_bits(divi, divf));
        spin_reading(&self.view, clock.ctl_offset(), 150);

        self.view
            .write32(clock.ctl_offset(), ctl_bits(source, mash, true, false));
    }

    /// Clears ENAB (and, if `kill` is set, forces the clock generator off
    /// immediately rather than waiting for the current cycle to finish).
    pub fn halt(&self, clock: Clock, kill: bool) {
        self.view
            .write32(clock.ctl_offset(), ctl_bits(ClockSource::Ground, Mash::Integer, false, kill));
        spin_reading(&self.view, clock.ctl_offset(), 150);
        while self.busy(clock) {
            spin_reading(&self.view, clock.ctl_offset(), 150);
        }
    }

    /// Solves and programs `clock` for `target_hz`, returning the
    /// solution actually applied.
    pub fn set(
        &self,
        clock: Clock,
        target_hz: u32,
        max_wait: u32,
        allow_overclock: bool,
    ) -> Result<ClockSolution> {
        let solution = solve(target_hz, max_wait, allow_overclock)?;
        self.reprogram(
            clock,
            solution.source,
            solution.divi,
            solution.divf,
            Mash::Integer,
        );
        Ok(solution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_solve_at_150hz() {
        let solution = solve(150, 32, false).unwrap();
        assert_eq!(solution.source, ClockSource::Oscillator19_2MHz);
        assert_eq!(solution.divi, 4000);
        assert_eq!(solution.divf, 0);
        assert_eq!(solution.wait_cycles, 32);
        assert_eq!(solution.actual_hz, 150);
        assert!(!solution.oversampled);
    }

    #[test]
    fn oversample_floor_at_1hz_matches_150hz_floor() {
        let solution = solve(1, 32, false).unwrap();
        assert_eq!(solution.source, ClockSource::Oscillator19_2MHz);
        assert_eq!(solution.divi, 4000);
        assert_eq!(solution.divf, 0);
        assert_eq!(solution.wait_cycles, 32);
        assert_eq!(solution.actual_hz, 150);
        assert!(solution.oversampled);
    }

    #[test]
    fn frequency_out_of_range_is_rejected() {
        assert!(solve(0, 32, false).is_err());
        assert!(solve(30_000_000, 32, false).is_err());
    }

    #[test]
    fn clock_solution_tolerance_invariant_holds() {
        for target in [150u32, 1000, 19200, 48000] {
            let solution = solve(target, 32, false).unwrap();
            let predicted = solution.source.nominal_hz().unwrap() as f64 * 4096.0
                / ((solution.divi as f64 * 4096.0 + solution.divf as f64)
                    * solution.wait_cycles as f64);
            let rel_err = (predicted - target as f64).abs() / target as f64;
            assert!(
                rel_err <= 0.10 || solution.actual_hz == target,
                "target {target}: predicted {predicted}, rel_err {rel_err}"
            );
        }
    }

    #[test]
    fn reprogram_sets_password_and_divisor_fields() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let view = PhysMemView::map(&file, 0, 256).unwrap();
        let mgr = ClockManager::new(view);

        mgr.reprogram(Clock::Pwm, ClockSource::Oscillator19_2MHz, 4000, 0, Mash::Integer);

        let ctl = mgr.view.read32(Clock::Pwm.ctl_offset());
        let div = mgr.view.read32(Clock::Pwm.div_offset());
        assert_eq!(ctl & 0xFF00_0000, PASSWORD);
        assert_eq!(ctl & CTL_ENAB, CTL_ENAB);
        assert_eq!(ctl & CTL_SRC_MASK, ClockSource::Oscillator19_2MHz.src_bits());
        assert_eq!(div & 0xFF00_0000, PASSWORD);
        assert_eq!((div >> 12) & 0xFFF, 4000);
        assert_eq!(div & 0xFFF, 0);
    }

    #[test]
    fn halt_clears_enable() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let view = PhysMemView::map(&file, 0, 256).unwrap();
        let mgr = ClockManager::new(view);
        mgr.reprogram(Clock::Gp0, ClockSource::Oscillator19_2MHz, 100, 0, Mash::Integer);
        mgr.halt(Clock::Gp0, false);
        let ctl = mgr.view.read32(Clock::Gp0.ctl_offset());
        assert_eq!(ctl & CTL_ENAB, 0);
    }
}
