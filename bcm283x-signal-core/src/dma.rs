// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DMA engine: control-block construction, channel allocation, and the
//! pure rasterisation routines that turn a [`bcm283x_signal_api::Stream`]
//! into the word buffers or control-block chains the hardware consumes.
//!
//! Channel 15 is deliberately never allocated: the source this subsystem
//! is modeled on suggests but never enables it, and nothing here should
//! silently reach for it.

use zerocopy::{FromBytes, Immutable, IntoBytes};

use bcm283x_signal_api::{BitOrder, BitStream, Error, EdgeStream, Level, Result};

use crate::pmem::PhysMemView;

/// Byte length of a control block; also its required alignment.
pub const CONTROL_BLOCK_LEN: usize = 32;

/// Maximum transfer length, in bytes, a "lite" channel can move in one
/// control block.
pub const LITE_MAX_TRANSFER_LEN: u32 = 65_535;

/// Number of general-purpose channels this engine will ever hand out.
/// Channel 15 exists in hardware but is excluded by design (see module
/// docs).
const CHANNEL_COUNT: u8 = 15;
/// First "lite", reduced-bandwidth channel.
const FIRST_LITE_CHANNEL: u8 = 7;

/// Global enable register, offset from the DMA block's base rather than
/// any per-channel stride; bit `n` gates channel `n`'s register block.
const REG_ENABLE: usize = 0xFF0;

const DREQ_PWM: u32 = 5;
const DREQ_PCM_TX: u32 = 2;

const CS_ACTIVE: u32 = 1 << 0;
const CS_DREQ: u32 = 1 << 3;
const CS_ERROR: u32 = 1 << 8;
const CS_PRIORITY_SHIFT: u32 = 12;
const CS_PANIC_PRIORITY_SHIFT: u32 = 16;
const CS_WAIT_FOR_OUTSTANDING_WRITES: u32 = 1 << 28;
const CS_RESET: u32 = 1 << 31;

const TI_WAIT_RESP: u32 = 1 << 3;
const TI_DEST_INC: u32 = 1 << 4;
const TI_DEST_DREQ: u32 = 1 << 6;
const TI_DEST_IGNORE: u32 = 1 << 7;
const TI_SRC_INC: u32 = 1 << 8;
const TI_SRC_DREQ: u32 = 1 << 10;
const TI_SRC_IGNORE: u32 = 1 << 11;
const TI_PERMAP_SHIFT: u32 = 16;
const TI_WAITS_SHIFT: u32 = 21;
const TI_NO_WIDE_BURSTS: u32 = 1 << 26;

const REG_CS: usize = 0x00;
const REG_CONBLK_AD: usize = 0x04;
const REG_DEBUG: usize = 0x20;

/// Which DREQ peripheral paces a control block, or `Fire` for an
/// unpaced, free-running transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dreq {
    Fire,
    Pwm,
    PcmTx,
}

impl Dreq {
    const fn permap(self) -> u32 {
        match self {
            Dreq::Fire => 0,
            Dreq::Pwm => DREQ_PWM,
            Dreq::PcmTx => DREQ_PCM_TX,
        }
    }
}

/// The 32-byte hardware descriptor, laid out exactly as the DMA engine
/// reads it. `IntoBytes`/`FromBytes` let this be written into a DMA
/// buffer's plain memory without a manual word-by-word pack -- the same
/// role `zerocopy` plays for a wire-format packet header.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct ControlBlock {
    pub transfer_info: u32,
    pub source_addr: u32,
    pub dest_addr: u32,
    pub transfer_len: u32,
    pub stride: u32,
    pub next_cb: u32,
    reserved: [u32; 2],
}

impl ControlBlock {
    pub fn encode(&self) -> [u32; 8] {
        let bytes = self.as_bytes();
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_ne_bytes(chunk.try_into().unwrap());
        }
        words
    }
}

/// Parameters for one control block, validated by [`build`] against the
/// invariants in the control-block data model: at most one side is a
/// peripheral address, a peripheral address must be non-zero, and
/// "ignore source" only makes sense on an unpaced transfer.
#[derive(Copy, Clone, Debug)]
pub struct ControlBlockSpec {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_io: bool,
    pub dst_io: bool,
    pub src_ignore: bool,
    pub transfer_len: u32,
    pub dreq: Dreq,
    pub wait_cycles: u8,
    pub next_cb: u32,
    pub wait_resp: bool,
}

pub fn build(spec: ControlBlockSpec) -> Result<ControlBlock> {
    if spec.src_io && spec.dst_io {
        return Err(Error::InvalidArgument {
            reason: "at most one of source/destination may be a peripheral address",
        });
    }
    if spec.src_io && spec.src_addr == 0 {
        return Err(Error::InvalidArgument {
            reason: "using src as I/O requires a non-zero src address",
        });
    }
    if spec.dst_io && spec.dst_addr == 0 {
        return Err(Error::InvalidArgument {
            reason: "using dst as I/O requires a non-zero dst address",
        });
    }
    if spec.src_ignore && spec.dreq != Dreq::Fire {
        return Err(Error::InvalidArgument {
            reason: "srcIgnore without dreq=Fire is nonsensical",
        });
    }
    if spec.dreq == Dreq::Fire && spec.wait_cycles != 0 {
        return Err(Error::InvalidArgument {
            reason: "wait_cycles must be 0 when dreq is Fire",
        });
    }
    if spec.wait_cycles > 31 {
        return Err(Error::InvalidArgument {
            reason: "wait_cycles must fit in the 5-bit WAITS field",
        });
    }

    let mut ti = TI_NO_WIDE_BURSTS;
    if spec.wait_resp {
        ti |= TI_WAIT_RESP;
    }
    if !spec.dst_io {
        ti |= TI_DEST_INC;
    }
    if !spec.src_io {
        ti |= TI_SRC_INC;
    }
    if spec.src_ignore {
        ti |= TI_SRC_IGNORE;
    }
    if spec.dreq != Dreq::Fire {
        ti |= (spec.dreq.permap()) << TI_PERMAP_SHIFT;
        if spec.src_io {
            ti |= TI_SRC_DREQ;
        }
        if spec.dst_io {
            ti |= TI_DEST_DREQ;
        }
    } else if spec.dst_io {
        ti |= TI_DEST_IGNORE; // fire-and-forget write with nothing to read back
    }
    ti |= (spec.wait_cycles as u32) << TI_WAITS_SHIFT;

    Ok(ControlBlock {
        transfer_info: ti,
        source_addr: spec.src_addr,
        dest_addr: spec.dst_addr,
        transfer_len: spec.transfer_len,
        stride: 0,
        next_cb: spec.next_cb,
        reserved: [0; 2],
    })
}

/// Owns the mapped register block for DMA channels 0..14.
pub struct DmaChannels {
    view: PhysMemView,
}

impl DmaChannels {
    pub fn new(view: PhysMemView) -> DmaChannels {
        DmaChannels { view }
    }

    fn channel_offset(channel: u8) -> usize {
        channel as usize * 0x100
    }

    /// True for channels 7..14, the bandwidth-limited "lite" channels.
    pub fn is_lite(channel: u8) -> bool {
        (FIRST_LITE_CHANNEL..CHANNEL_COUNT).contains(&channel)
    }

    /// The global DMA enable register, read back as a smoke check that
    /// every general-purpose channel this engine relies on (0..14) is
    /// actually present on this SoC.
    pub fn enable_register(&self) -> u32 {
        self.view.read32(REG_ENABLE)
    }

    fn cs(&self, channel: u8) -> u32 {
        self.view.read32(Self::channel_offset(channel) + REG_CS)
    }

    /// A channel is free if its control-status is zero (ignoring the
    /// sticky DREQ bit) and it has no control block in flight.
    fn is_free(&self, channel: u8) -> bool {
        let cs = self.cs(channel);
        (cs & !CS_DREQ) == 0
            && self
                .view
                .read32(Self::channel_offset(channel) + REG_CONBLK_AD)
                == 0
    }

    /// Scans for a free channel, skipping any in `exclude`. If
    /// `lite_ok` is false, only full-bandwidth channels (0..6) are
    /// considered.
    pub fn alloc_free_channel(&self, lite_ok: bool, exclude: &[u8]) -> Result<u8> {
        for channel in 0..CHANNEL_COUNT {
            if exclude.contains(&channel) {
                continue;
            }
            if !lite_ok && Self::is_lite(channel) {
                continue;
            }
            if self.is_free(channel) {
                return Ok(channel);
            }
        }
        Err(Error::Busy {
            what: "DMA channel",
        })
    }

    /// Resets `channel`: sets the RESET bit and zeroes the control-block
    /// pointer.
    pub fn reset(&self, channel: u8) {
        self.view
            .write32(Self::channel_offset(channel) + REG_CS, CS_RESET);
        self.view
            .write32(Self::channel_offset(channel) + REG_CONBLK_AD, 0);
    }

    /// Points `channel` at `first_cb_bus_addr` and starts it.
    pub fn start(&self, channel: u8, first_cb_bus_addr: u32) {
        self.view
            .write32(Self::channel_offset(channel) + REG_CONBLK_AD, first_cb_bus_addr);
        let cs = CS_ACTIVE
            | (8 << CS_PRIORITY_SHIFT)
            | (8 << CS_PANIC_PRIORITY_SHIFT)
            | CS_WAIT_FOR_OUTSTANDING_WRITES;
        self.view.write32(Self::channel_offset(channel) + REG_CS, cs);
    }

    /// Busy-polls `channel` until ACTIVE clears or a hardware fault bit
    /// latches in the per-channel debug register.
    pub fn wait(&self, channel: u8) -> Result<()> {
        loop {
            let cs = self.cs(channel);
            if cs & CS_ERROR != 0 {
                let flags = self
                    .view
                    .read32(Self::channel_offset(channel) + REG_DEBUG);
                return Err(Error::HardwareFault { channel, flags });
            }
            if cs & CS_ACTIVE == 0 {
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }
}

/// Rounds `requested_hz` down to a divisor of `base_hz` (the PWM-DMA
/// pacing rate). Fails if the resulting rate differs from the request by
/// more than 10%.
pub fn oversample_divisor(requested_hz: u32, base_hz: u32) -> Result<u32> {
    if requested_hz == 0 || requested_hz > base_hz {
        return Err(Error::InvalidArgument {
            reason: "stream frequency must be positive and at most the pacing base rate",
        });
    }
    let divisor = (base_hz / requested_hz).max(1);
    let actual = base_hz / divisor;
    let rel_err = (actual as f64 - requested_hz as f64).abs() / requested_hz as f64;
    if rel_err > 0.10 {
        return Err(Error::InvalidArgument {
            reason: "stream frequency cannot be reached within 10% at the pacing base rate",
        });
    }
    Ok(divisor)
}

/// Rasterises a [`BitStream`] into per-sample `set[]`/`clear[]` word
/// buffers for the two-channel bit-bang technique: `set[i] = mask` where
/// bit `i` is 1, `clear[i] = mask` where it is 0.
pub fn bitstream_set_clear_words(stream: &BitStream, mask: u32) -> (Vec<u32>, Vec<u32>) {
    let n = stream.nbits();
    let mut set = vec![0u32; n];
    let mut clear = vec![0u32; n];
    for (i, bit) in stream.iter_bits().enumerate() {
        if bit {
            set[i] = mask;
        } else {
            clear[i] = mask;
        }
    }
    (set, clear)
}

/// Rasterises an [`EdgeStream`] into specs for a chain of set/clear
/// control blocks, one per homogeneous run, splitting any run whose byte
/// length would exceed `max_transfer_len`. Each spec still needs its
/// `src_addr`/`next_cb` bus addresses filled in by the caller once the
/// backing buffer's bus address is known.
pub struct EdgeRun {
    pub level: Level,
    pub samples: u32,
}

pub fn edge_stream_runs(stream: &EdgeStream, max_transfer_len: u32) -> Vec<EdgeRun> {
    let max_samples = max_transfer_len / 4;
    let mut runs = Vec::new();
    for (level, samples) in stream.levels() {
        let mut remaining = samples;
        while remaining > 0 {
            let chunk = remaining.min(max_samples);
            runs.push(EdgeRun {
                level,
                samples: chunk,
            });
            remaining -= chunk;
        }
    }
    runs
}

/// Packs a [`BitStream`] into DMA-ready big-endian 32-bit words for PCM
/// TX, 32 bits (in the stream's own bit order) per word, zero-padded in
/// the final word if `nbits()` is not a multiple of 32.
pub fn pcm_words_from_bitstream(stream: &BitStream) -> Vec<u32> {
    let nbits = stream.nbits();
    let nwords = nbits.div_ceil(32);
    let mut words = vec![0u32; nwords];
    for (i, bit) in stream.iter_bits().enumerate() {
        if bit {
            let word = i / 32;
            let shift = match stream.order() {
                BitOrder::Msb => 31 - (i % 32),
                BitOrder::Lsb => i % 32,
            };
            words[word] |= 1 << shift;
        }
    }
    words
}

/// Extracts the bit at `bit_index` from every sample word, packing the
/// results LSB-first into a byte buffer -- the inverse rasterisation used
/// by the GPIO-read-to-bitstream operation.
pub fn unpack_read_samples(words: &[u32], bit_index: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; words.len().div_ceil(8)];
    for (i, &word) in words.iter().enumerate() {
        if word & (1 << bit_index) != 0 {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcm283x_signal_api::BitOrder;

    #[test]
    fn control_block_rejects_dual_io() {
        let spec = ControlBlockSpec {
            src_addr: 1,
            dst_addr: 1,
            src_io: true,
            dst_io: true,
            src_ignore: false,
            transfer_len: 4,
            dreq: Dreq::Fire,
            wait_cycles: 0,
            next_cb: 0,
            wait_resp: false,
        };
        assert!(build(spec).is_err());
    }

    #[test]
    fn control_block_rejects_zero_dst_addr_marked_io() {
        let spec = ControlBlockSpec {
            src_addr: 1,
            dst_addr: 0,
            src_io: false,
            dst_io: true,
            src_ignore: false,
            transfer_len: 4,
            dreq: Dreq::Fire,
            wait_cycles: 0,
            next_cb: 0,
            wait_resp: false,
        };
        assert!(build(spec).is_err());
    }

    #[test]
    fn control_block_rejects_src_ignore_without_fire() {
        let spec = ControlBlockSpec {
            src_addr: 1,
            dst_addr: 1,
            src_io: false,
            dst_io: false,
            src_ignore: true,
            transfer_len: 4,
            dreq: Dreq::Pwm,
            wait_cycles: 0,
            next_cb: 0,
            wait_resp: false,
        };
        assert!(build(spec).is_err());
    }

    #[test]
    fn control_block_encodes_permap_and_waits() {
        let spec = ControlBlockSpec {
            src_addr: 0x1000,
            dst_addr: 0x7E20_C018,
            src_io: false,
            dst_io: true,
            src_ignore: false,
            transfer_len: 400,
            dreq: Dreq::Pwm,
            wait_cycles: 3,
            next_cb: 0,
            wait_resp: true,
        };
        let cb = build(spec).unwrap();
        assert_eq!((cb.transfer_info >> TI_PERMAP_SHIFT) & 0x1F, DREQ_PWM);
        assert_eq!((cb.transfer_info >> TI_WAITS_SHIFT) & 0x1F, 3);
        assert_ne!(cb.transfer_info & TI_DEST_DREQ, 0);
        assert_ne!(cb.transfer_info & TI_WAIT_RESP, 0);
        assert_eq!(cb.encode().len(), 8);
    }

    #[test]
    fn bitstream_scenario_matches_spec_example() {
        let stream = BitStream::new(vec![0x01, 0x40], 1, BitOrder::Lsb).unwrap();
        let (set, clear) = bitstream_set_clear_words(&stream, 0b10);
        let mut expected_set = vec![0u32; 16];
        expected_set[0] = 2;
        expected_set[14] = 2;
        assert_eq!(set, expected_set);
        assert_eq!(
            clear,
            vec![0, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 0, 2]
        );
    }

    #[test]
    fn edge_runs_split_at_max_transfer_len() {
        let stream =
            EdgeStream::new(Level::Low, vec![200_000], 1_000_000).unwrap();
        let runs = edge_stream_runs(&stream, LITE_MAX_TRANSFER_LEN);
        let total: u32 = runs.iter().map(|r| r.samples).sum();
        assert_eq!(total, 200_000);
        assert!(runs.iter().all(|r| r.samples * 4 <= LITE_MAX_TRANSFER_LEN));
        assert!(runs.len() > 1);
    }

    #[test]
    fn oversample_rounds_down_within_tolerance() {
        let divisor = oversample_divisor(180_000, 200_000).unwrap();
        assert_eq!(divisor, 1);
        assert!(oversample_divisor(10_000, 200_000).is_ok());
        assert!(oversample_divisor(1, 200_000).is_err());
    }

    #[test]
    fn pcm_words_pack_msb_first() {
        let stream = BitStream::new(vec![0b1000_0000], 1, BitOrder::Msb).unwrap();
        let words = pcm_words_from_bitstream(&stream);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0] >> 31, 1);
    }

    #[test]
    fn unpack_read_samples_round_trips_a_known_pattern() {
        let words = vec![0b10u32, 0, 0b10, 0, 0, 0, 0, 0];
        let bytes = unpack_read_samples(&words, 1);
        assert_eq!(bytes, vec![0b0000_0101]);
    }
}
