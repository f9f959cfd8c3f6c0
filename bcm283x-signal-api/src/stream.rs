// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `Stream` data model: what a caller asks the DMA engine to play out
//! or sample in, independent of how it gets rasterised into control blocks.

use crate::{Error, Level, Result};
use std::time::Duration;

/// Bit order within a `BitStream`'s packed byte buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitOrder {
    Lsb,
    Msb,
}

/// A densely packed bit vector played out (or sampled into) at a fixed
/// frequency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitStream {
    bits: Vec<u8>,
    freq_hz: u32,
    order: BitOrder,
}

impl BitStream {
    /// Builds a `BitStream` from packed bytes. `bits` must be non-empty and
    /// `freq_hz` must be positive; the "bit count is a multiple of 8"
    /// invariant holds automatically since bits are supplied byte-packed.
    pub fn new(bits: Vec<u8>, freq_hz: u32, order: BitOrder) -> Result<BitStream> {
        if bits.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "bit stream must not be empty",
            });
        }
        if freq_hz == 0 {
            return Err(Error::InvalidArgument {
                reason: "bit stream frequency must be positive",
            });
        }
        Ok(BitStream {
            bits,
            freq_hz,
            order,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn freq_hz(&self) -> u32 {
        self.freq_hz
    }

    pub fn order(&self) -> BitOrder {
        self.order
    }

    pub fn nbits(&self) -> usize {
        self.bits.len() * 8
    }

    /// The bit at `index`, honoring this stream's bit order.
    pub fn bit(&self, index: usize) -> bool {
        let byte = self.bits[index / 8];
        let shift = match self.order {
            BitOrder::Lsb => index % 8,
            BitOrder::Msb => 7 - (index % 8),
        };
        (byte >> shift) & 1 != 0
    }

    pub fn iter_bits(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.nbits()).map(move |i| self.bit(i))
    }

    /// `duration(b) = len(b.bits) * 8 / freq(b)`.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.nbits() as f64 / self.freq_hz as f64)
    }
}

/// A sequence of alternating-level run lengths, counted in samples at a
/// fixed base resolution frequency. `start_level` is the level of the first
/// run; subsequent runs alternate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeStream {
    start_level: Level,
    run_samples: Vec<u32>,
    freq_hz: u32,
}

impl EdgeStream {
    pub fn new(
        start_level: Level,
        run_samples: Vec<u32>,
        freq_hz: u32,
    ) -> Result<EdgeStream> {
        if run_samples.is_empty() || run_samples.iter().any(|&n| n == 0) {
            return Err(Error::InvalidArgument {
                reason: "edge stream runs must be non-empty and non-zero length",
            });
        }
        if freq_hz == 0 {
            return Err(Error::InvalidArgument {
                reason: "edge stream frequency must be positive",
            });
        }
        Ok(EdgeStream {
            start_level,
            run_samples,
            freq_hz,
        })
    }

    pub fn start_level(&self) -> Level {
        self.start_level
    }

    pub fn runs(&self) -> &[u32] {
        &self.run_samples
    }

    pub fn freq_hz(&self) -> u32 {
        self.freq_hz
    }

    /// The level and sample-count for each run, alternating.
    pub fn levels(&self) -> impl Iterator<Item = (Level, u32)> + '_ {
        let mut level = self.start_level;
        self.run_samples.iter().map(move |&n| {
            let this = level;
            level = match level {
                Level::Low => Level::High,
                Level::High => Level::Low,
            };
            (this, n)
        })
    }

    pub fn total_samples(&self) -> u64 {
        self.run_samples.iter().map(|&n| n as u64).sum()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_samples() as f64 / self.freq_hz as f64)
    }
}

/// A list of sub-streams played in sequence, optionally looped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    children: Vec<Stream>,
    /// `-1` means loop forever; must otherwise be `> 0`.
    loops: i32,
}

impl Program {
    pub fn new(children: Vec<Stream>, loops: i32) -> Result<Program> {
        if children.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "program must contain at least one stream",
            });
        }
        if loops == 0 {
            return Err(Error::InvalidArgument {
                reason: "program loop count must be -1 (infinite) or positive",
            });
        }
        let densest = children
            .iter()
            .filter_map(Stream::sample_freq_hz)
            .max()
            .unwrap_or(0);
        if densest > 0 {
            let effective = children
                .iter()
                .filter_map(Stream::sample_freq_hz)
                .min()
                .unwrap_or(densest);
            if (effective as u64) * 2 < densest as u64 {
                return Err(Error::InvalidArgument {
                    reason: "program sampling rate is below the Nyquist rate of its densest child",
                });
            }
        }
        Ok(Program { children, loops })
    }

    pub fn children(&self) -> &[Stream] {
        &self.children
    }

    pub fn loops(&self) -> i32 {
        self.loops
    }

    pub fn is_infinite(&self) -> bool {
        self.loops < 0
    }

    fn one_pass_duration(&self) -> Duration {
        self.children
            .iter()
            .filter_map(Stream::duration)
            .sum()
    }

    /// `duration(p) = n * sum(duration(child))` for finite `n`; `None` for
    /// an infinite program.
    pub fn duration(&self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(self.one_pass_duration() * self.loops as u32)
        }
    }
}

/// The polymorphic stream type consumed by the DMA engine's streaming
/// operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stream {
    Bits(BitStream),
    Edge(EdgeStream),
    Program(Box<Program>),
}

impl Stream {
    /// `None` for a `Program` that loops forever.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Stream::Bits(b) => Some(b.duration()),
            Stream::Edge(e) => Some(e.duration()),
            Stream::Program(p) => p.duration(),
        }
    }

    fn sample_freq_hz(&self) -> Option<u32> {
        match self {
            Stream::Bits(b) => Some(b.freq_hz()),
            Stream::Edge(e) => Some(e.freq_hz()),
            Stream::Program(p) => {
                p.children.iter().filter_map(Stream::sample_freq_hz).max()
            }
        }
    }
}

impl From<BitStream> for Stream {
    fn from(b: BitStream) -> Self {
        Stream::Bits(b)
    }
}

impl From<EdgeStream> for Stream {
    fn from(e: EdgeStream) -> Self {
        Stream::Edge(e)
    }
}

impl From<Program> for Stream {
    fn from(p: Program) -> Self {
        Stream::Program(Box::new(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_stream_duration_matches_nbits_over_freq() {
        let b = BitStream::new(vec![0xAA, 0x55], 100, BitOrder::Lsb).unwrap();
        assert_eq!(b.duration(), Duration::from_secs_f64(16.0 / 100.0));
    }

    #[test]
    fn bit_stream_rejects_empty() {
        assert!(BitStream::new(vec![], 100, BitOrder::Lsb).is_err());
    }

    #[test]
    fn bit_order_lsb_vs_msb() {
        let lsb = BitStream::new(vec![0b0000_0001], 1, BitOrder::Lsb).unwrap();
        let msb = BitStream::new(vec![0b0000_0001], 1, BitOrder::Msb).unwrap();
        assert!(lsb.bit(0));
        assert!(!lsb.bit(7));
        assert!(!msb.bit(0));
        assert!(msb.bit(7));
    }

    #[test]
    fn program_duration_multiplies_by_loop_count() {
        let a = BitStream::new(vec![0xFF], 8, BitOrder::Lsb).unwrap(); // 1s
        let b = BitStream::new(vec![0xFF, 0xFF], 8, BitOrder::Lsb).unwrap(); // 2s
        let program = Program::new(vec![a.into(), b.into()], 3).unwrap();
        assert_eq!(
            program.duration().unwrap(),
            Duration::from_secs(1) * 3 + Duration::from_secs(2) * 3
        );
    }

    #[test]
    fn infinite_program_has_no_duration() {
        let a = BitStream::new(vec![0xFF], 8, BitOrder::Lsb).unwrap();
        let program = Program::new(vec![a.into()], -1).unwrap();
        assert!(program.duration().is_none());
    }

    #[test]
    fn program_rejects_undersampled_child() {
        let slow = BitStream::new(vec![0xFF], 10, BitOrder::Lsb).unwrap();
        let fast = BitStream::new(vec![0xFF], 1_000, BitOrder::Lsb).unwrap();
        assert!(Program::new(vec![slow.into(), fast.into()], 1).is_err());
    }

    #[test]
    fn edge_stream_levels_alternate_from_start() {
        let e = EdgeStream::new(Level::Low, vec![3, 5, 2], 10).unwrap();
        let levels: Vec<_> = e.levels().collect();
        assert_eq!(
            levels,
            vec![(Level::Low, 3), (Level::High, 5), (Level::Low, 2)]
        );
        assert_eq!(e.total_samples(), 10);
        assert_eq!(e.duration(), Duration::from_secs(1));
    }
}
