// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-mapped GPIO and DMA-driven signal engine for BCM283x-family
//! processors.
//!
//! [`Driver::init`] probes the platform, maps every register block this
//! crate needs, opens the videocore mailbox, and runs a DMA memcpy smoke
//! test. The resulting [`Driver`] owns all of that state for the life of
//! the process; [`Pin`] handles borrow it to perform per-pin operations.

pub mod buffer;
pub mod clock;
pub mod dma;
pub mod gpio;
pub mod pcm;
pub mod pmap;
pub mod pmem;
pub mod pwm;
pub mod timer;
pub mod vcalloc;

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bcm283x_signal_api::{
    BitStream, DriveStrength, Duty, Edge, EdgeUnsubscribe, EdgeWatcher, Error, Function, Level,
    PadGroup, PinNumber, Pull, Result, SlewLimit, Stream,
};

use buffer::DmaBuffer;
use clock::{Clock, ClockManager};
use dma::{ControlBlockSpec, DmaChannels, Dreq};
use gpio::GpioController;
use pcm::PcmController;
use pmap::{DMA_CHANNEL_STRIDE, DMA_OFFSET, GPIO_OFFSET, PADS_OFFSET, PCM_OFFSET, PWM_OFFSET};
use pmap::{CLOCK_OFFSET, SYSTIMER_OFFSET};
use pmem::PhysMemView;
use pwm::PwmController;
use timer::SystemTimer;
use vcalloc::{IoctlMailbox, VcAllocator};

pub use pmap::Soc;

/// Default base PWM-DMA pacing rate used by the duty-cycle and two-channel
/// bit-bang operations.
const PWM_DMA_BASE_HZ: u32 = 200_000;

/// The GPU memcpy smoke test moves this many bytes through each of two
/// videocore buffers.
const SMOKE_TEST_BUFFER_LEN: usize = 16 * 1024;

/// How this process reaches the GPIO/DMA register blocks: which memory
/// device to mmap, which mailbox device to use, and whether to permit
/// the overclocking-only PLLC clock source.
pub struct Config {
    pub mem_device: PathBuf,
    pub mailbox_device: PathBuf,
    pub pagemap_path: PathBuf,
    pub device_tree_compatible: PathBuf,
    pub allow_overclock_plls: bool,
    pub run_dma_smoke_test: bool,
}

impl Default for Config {
    /// Resolves the real system devices: `/dev/gpiomem`-style mem access
    /// is not modeled as a fallback here since DMA needs full `/dev/mem`
    /// access regardless; callers needing the gpiomem-only path should
    /// use the GPIO controller directly without `Driver::init`'s DMA
    /// smoke test.
    fn default() -> Config {
        Config {
            mem_device: PathBuf::from("/dev/mem"),
            mailbox_device: PathBuf::from("/dev/vcio"),
            pagemap_path: PathBuf::from("/proc/self/pagemap"),
            device_tree_compatible: PathBuf::from("/proc/device-tree/compatible"),
            allow_overclock_plls: false,
            run_dma_smoke_test: true,
        }
    }
}

/// Per-pin bookkeeping the driver keeps to enforce the "exactly one
/// owner" invariant and to release resources on halt.
#[derive(Default)]
struct PinState {
    dma_channel: Option<u8>,
    second_dma_channel: Option<u8>,
    edge_subscribed: bool,
    /// Buffers kept alive for the duration of a streaming session. Drained
    /// (and dropped, releasing their videocore handles) by `halt`.
    buffers: Vec<DmaBuffer<IoctlMailbox>>,
}

/// Owns every mapped register block, the videocore mailbox, and the
/// per-pin session bookkeeping for the lifetime of the process. Pin
/// handles borrow a `Driver` rather than each holding their own copy of
/// this state, mirroring the source's single process-wide driver object.
pub struct Driver {
    soc: Soc,
    mem_device: File,
    dram_bus_mask: u32,
    gpio: GpioController,
    pwm: PwmController,
    pcm: PcmController,
    clock: ClockManager,
    dma: DmaChannels,
    timer: SystemTimer,
    mailbox: Arc<Mutex<VcAllocator<IoctlMailbox>>>,
    pin_state: Mutex<Vec<PinState>>,
}

impl Driver {
    /// Probes the platform, maps every register block, opens the
    /// mailbox, and (unless disabled) runs the DMA memcpy smoke test.
    pub fn init(config: Config) -> Result<Driver> {
        let soc = Soc::probe(&config.device_tree_compatible)?;
        let base = soc.peripheral_base();

        let mem_device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.mem_device)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    Error::PermissionDenied {
                        path: "/dev/mem",
                    }
                } else {
                    Error::io("open mem device", e)
                }
            })?;

        let gpio_view = PhysMemView::map(&mem_device, base + GPIO_OFFSET, 0x1000)?;
        let pads_view = PhysMemView::map(&mem_device, base + PADS_OFFSET, 0x100)?;
        let pwm_view = PhysMemView::map(&mem_device, base + PWM_OFFSET, 0x100)?;
        let pcm_view = PhysMemView::map(&mem_device, base + PCM_OFFSET, 0x100)?;
        let clock_view = PhysMemView::map(&mem_device, base + CLOCK_OFFSET, 0x1000)?;
        let dma_view = PhysMemView::map(
            &mem_device,
            base + DMA_OFFSET,
            DMA_CHANNEL_STRIDE as usize * 15,
        )?;
        let timer_view = PhysMemView::map(&mem_device, base + SYSTIMER_OFFSET, 0x20)?;

        let mailbox = Arc::new(Mutex::new(VcAllocator::open(&config.mailbox_device)?));

        let driver = Driver {
            soc,
            dram_bus_mask: soc.dram_bus_mask(),
            gpio: GpioController::new(gpio_view, pads_view, soc.pull_style()),
            pwm: PwmController::new(pwm_view),
            pcm: PcmController::new(pcm_view),
            clock: ClockManager::new(clock_view),
            dma: DmaChannels::new(dma_view),
            timer: SystemTimer::new(timer_view),
            mailbox,
            pin_state: Mutex::new((0..bcm283x_signal_api::PIN_COUNT).map(|_| PinState::default()).collect()),
            mem_device,
        };

        if config.run_dma_smoke_test {
            driver.dma_smoke_test()?;
        }

        log::info!("driver initialised for {soc:?}");
        Ok(driver)
    }

    fn alloc_buffer(&self, size: usize) -> Result<DmaBuffer<IoctlMailbox>> {
        DmaBuffer::allocate(self.mailbox.clone(), &self.mem_device, self.dram_bus_mask, size)
    }

    /// Starts the PWM serialiser as a pure DREQ pacer (§4.5, §4.7 op 2):
    /// one dummy word primed into the FIFO, `RPTL` set so the PWM keeps
    /// replaying it and emitting DREQ pulses at `PWM_DMA_BASE_HZ` forever
    /// without the FIFO ever needing to be re-fed. Every DMA-paced
    /// `Dreq::Pwm` transfer in this crate rides on the same pacer rather
    /// than each programming its own RANGE, since they all pace off the
    /// same fixed base rate and only differ in how many pulses their own
    /// control block's `transfer_len` spans.
    fn start_pwm_pacer(&self) {
        self.pwm.clear_bus_error();
        self.pwm.clear_fifo();
        self.pwm.push_fifo(0);
        self.pwm.set_range(pwm::Channel::One, 1);
        self.pwm.enable_fifo(pwm::Channel::One, true);
        self.pwm.enable_dreq(15, 7);
    }

    /// Converts a physical DRAM address into its uncached bus alias.
    fn dram_bus_addr(&self, phys_or_bus: u32) -> u32 {
        phys_or_bus | self.dram_bus_mask
    }

    /// Allocates two 16KiB videocore buffers, DMAs the middle of one into
    /// the middle of the other (skipping the first and last byte), and
    /// verifies both guard bytes were untouched and the body matches.
    /// Uses fire-and-forget pacing rather than PWM, so user code's PWM
    /// clock is never perturbed before it runs anything itself.
    fn dma_smoke_test(&self) -> Result<()> {
        let src = self.alloc_buffer(SMOKE_TEST_BUFFER_LEN)?;
        let dst = self.alloc_buffer(SMOKE_TEST_BUFFER_LEN)?;

        for i in 0..SMOKE_TEST_BUFFER_LEN / 4 {
            src.write32(i * 4, 0xA5A5_0000 | i as u32);
        }
        for i in 0..SMOKE_TEST_BUFFER_LEN / 4 {
            dst.write32(i * 4, 0);
        }

        let body_len = (SMOKE_TEST_BUFFER_LEN - 2) as u32;
        let cb = dma::build(ControlBlockSpec {
            src_addr: src.bus_addr_at(1)?,
            dst_addr: dst.bus_addr_at(1)?,
            src_io: false,
            dst_io: false,
            src_ignore: false,
            transfer_len: body_len,
            dreq: Dreq::Fire,
            wait_cycles: 0,
            next_cb: 0,
            wait_resp: true,
        })?;

        let cb_buf = self.alloc_buffer(dma::CONTROL_BLOCK_LEN)?;
        for (i, word) in cb.encode().into_iter().enumerate() {
            cb_buf.write32(i * 4, word);
        }

        let channel = self.dma.alloc_free_channel(false, &[])?;
        self.dma.reset(channel);
        self.dma.start(channel, cb_buf.bus_addr());
        self.dma.wait(channel)?;
        self.dma.reset(channel);

        let guard_untouched = dst.read32(0) == 0 && {
            let last_word_index = (SMOKE_TEST_BUFFER_LEN / 4) - 1;
            let last_byte_shift = 24; // last byte of the last little-endian word
            (dst.read32(last_word_index * 4) >> last_byte_shift) & 0xFF == 0
        };
        if !guard_untouched {
            return Err(Error::HardwareFault {
                channel,
                flags: 0,
            });
        }

        for i in 1..SMOKE_TEST_BUFFER_LEN / 4 {
            if src.read32(i * 4) != dst.read32(i * 4) {
                return Err(Error::HardwareFault {
                    channel,
                    flags: 0,
                });
            }
        }

        let enable = self.dma.enable_register();
        if enable & 0x7FFF != 0x7FFF {
            return Err(Error::HardwareFault {
                channel,
                flags: enable,
            });
        }

        log::info!("DMA smoke test passed on channel {channel}");
        Ok(())
    }

    pub fn soc(&self) -> Soc {
        self.soc
    }

    /// Current 1MHz monotonic tick count.
    pub fn ticks(&self) -> u64 {
        self.timer.ticks()
    }

    /// Bulk level read of pins 0..=31.
    pub fn read_0_to_31(&self) -> u32 {
        self.gpio.read_0_to_31()
    }

    pub fn read_32_to_46(&self) -> u32 {
        self.gpio.read_32_to_46()
    }

    pub fn set_0_to_31(&self, mask: u32) {
        self.gpio.set_0_to_31(mask)
    }

    pub fn clear_0_to_31(&self, mask: u32) {
        self.gpio.clear_0_to_31(mask)
    }

    pub fn set_32_to_46(&self, mask: u32) {
        self.gpio.set_32_to_46(mask)
    }

    pub fn clear_32_to_46(&self, mask: u32) {
        self.gpio.clear_32_to_46(mask)
    }

    /// Sets drive strength/slew/hysteresis for pins 0..=27 (pad group 0).
    pub fn setup_0_to_27(&self, drive: DriveStrength, slew_limit: SlewLimit, hysteresis: bool) {
        self.gpio.setup_0_to_27(drive, slew_limit, hysteresis)
    }

    /// Sets drive strength/slew/hysteresis for pins 28..=45 (pad group 1).
    pub fn setup_28_to_45(&self, drive: DriveStrength, slew_limit: SlewLimit, hysteresis: bool) {
        self.gpio.setup_28_to_45(drive, slew_limit, hysteresis)
    }

    /// Programs drive strength/slew/hysteresis for an arbitrary pad group.
    pub fn pad_set(&self, group: PadGroup, drive: DriveStrength, slew_limit: SlewLimit, hysteresis: bool) {
        self.gpio.pad_set(group, drive, slew_limit, hysteresis)
    }

    /// Borrows pin `number` for per-pin operations.
    pub fn pin(&self, number: PinNumber) -> Result<Pin<'_>> {
        if number > bcm283x_signal_api::MAX_PIN {
            return Err(Error::InvalidArgument {
                reason: "pin number out of range",
            });
        }
        Ok(Pin {
            driver: self,
            number,
        })
    }
}

/// A single GPIO pin, borrowed from a [`Driver`]. Operations that start a
/// DMA/clock session record the resources they used in the driver's pin
/// state so `halt` can release them in order.
pub struct Pin<'a> {
    driver: &'a Driver,
    number: PinNumber,
}

impl<'a> Pin<'a> {
    pub fn number(&self) -> PinNumber {
        self.number
    }

    pub fn read(&self) -> Result<Level> {
        self.driver.gpio.read(self.number)
    }

    pub fn write(&self, level: Level) -> Result<()> {
        self.driver.gpio.write(self.number, level)
    }

    pub fn set_function(&self, function: Function) -> Result<()> {
        self.driver.gpio.set_function(self.number, function)
    }

    pub fn set_pull(&self, pull: Pull) -> Result<()> {
        self.driver.gpio.set_pull(self.number, pull)
    }

    /// Subscribes `watcher` to edge events on this pin. The core never
    /// implements edge detection itself (see [`bcm283x_signal_api::EdgeWatcher`]);
    /// this only forwards the request and records that a subscription is
    /// active so `halt` can tear it down.
    pub fn set_edge<W: EdgeWatcher>(&self, watcher: &mut W, edge: Edge) -> Result<()> {
        if self.driver.gpio.function(self.number)? != Function::Input {
            return Err(Error::InvalidArgument {
                reason: "edge subscription requires the pin to be in input mode",
            });
        }
        watcher
            .subscribe(self.number, edge)
            .map_err(|_| Error::EdgeNotAvailable { pin: self.number })?;
        self.driver.pin_state.lock().expect("pin state mutex poisoned")[self.number as usize]
            .edge_subscribed = true;
        Ok(())
    }

    /// Drives this pin with a fixed duty cycle via the DMA-PWM technique
    /// (§4.7 op 1): two chained control blocks, one setting and one
    /// clearing this pin's bit, paced at the PWM DREQ rate.
    pub fn pwm(&self, duty: Duty, period_hz: u32) -> Result<()> {
        self.driver.gpio.set_function(self.number, Function::Output)?;

        let divisor = dma::oversample_divisor(period_hz, PWM_DMA_BASE_HZ)?;
        let period_ticks = divisor;
        let duty_ticks = duty.ticks_high(period_ticks);

        let solution = self
            .driver
            .clock
            .set(Clock::Pwm, PWM_DMA_BASE_HZ, 1, false)?;
        log::debug!("pwm pacing clock solved: {solution:?}");

        let bank = self.number / 32;
        let bit = self.number as u32 % 32;
        let mask = 1u32 << bit;
        let set_reg = self.driver.gpio_peripheral_addr(gpio_set_offset(bank));
        let clear_reg = self.driver.gpio_peripheral_addr(gpio_clear_offset(bank));

        let mask_buf = self.driver.alloc_buffer(4)?;
        mask_buf.write32(0, mask);

        let cb_buf = self.driver.alloc_buffer(dma::CONTROL_BLOCK_LEN * 2)?;
        let set_cb_addr = cb_buf.bus_addr();
        let clear_cb_addr = cb_buf.bus_addr_at(dma::CONTROL_BLOCK_LEN)?;

        let set_cb = dma::build(ControlBlockSpec {
            src_addr: mask_buf.bus_addr(),
            dst_addr: set_reg,
            src_io: false,
            dst_io: true,
            src_ignore: false,
            transfer_len: duty_ticks * 4,
            dreq: Dreq::Pwm,
            wait_cycles: 0,
            next_cb: clear_cb_addr,
            wait_resp: true,
        })?;
        let clear_cb = dma::build(ControlBlockSpec {
            src_addr: mask_buf.bus_addr(),
            dst_addr: clear_reg,
            src_io: false,
            dst_io: true,
            src_ignore: false,
            transfer_len: (period_ticks - duty_ticks) * 4,
            dreq: Dreq::Pwm,
            wait_cycles: 0,
            next_cb: set_cb_addr,
            wait_resp: true,
        })?;

        for (i, word) in set_cb.encode().into_iter().enumerate() {
            cb_buf.write32(i * 4, word);
        }
        for (i, word) in clear_cb.encode().into_iter().enumerate() {
            cb_buf.write32(dma::CONTROL_BLOCK_LEN + i * 4, word);
        }

        self.driver.start_pwm_pacer();

        let lite_ok = duty_ticks * 4 <= dma::LITE_MAX_TRANSFER_LEN
            && (period_ticks - duty_ticks) * 4 <= dma::LITE_MAX_TRANSFER_LEN;
        let channel = self.driver.dma.alloc_free_channel(lite_ok, &[])?;
        self.driver.dma.reset(channel);
        self.driver.dma.start(channel, set_cb_addr);

        let mut guard = self.driver.pin_state.lock().expect("pin state mutex poisoned");
        let state = &mut guard[self.number as usize];
        state.dma_channel = Some(channel);
        state.buffers.push(mask_buf);
        state.buffers.push(cb_buf);
        Ok(())
    }

    /// Plays `stream` out on this pin via the most appropriate rasterisation:
    /// an edge-run chain for an [`bcm283x_signal_api::EdgeStream`], two-channel
    /// bit-bang set/clear buffers for a [`bcm283x_signal_api::BitStream`], or
    /// per-child dispatch for a [`bcm283x_signal_api::Program`].
    pub fn stream_out(&self, stream: &Stream) -> Result<()> {
        match stream {
            Stream::Edge(edge) => self.stream_out_edge(edge),
            Stream::Bits(bits) => self.stream_out_bits(bits),
            Stream::Program(program) => {
                for child in program.children() {
                    self.stream_out(child)?;
                    self.driver.dma.wait(
                        self.driver.pin_state.lock().expect("pin state mutex poisoned")
                            [self.number as usize]
                            .dma_channel
                            .ok_or(Error::NotInitialised {
                                component: "dma channel",
                            })?,
                    )?;
                }
                Ok(())
            }
        }
    }

    fn stream_out_edge(&self, stream: &bcm283x_signal_api::EdgeStream) -> Result<()> {
        self.driver.gpio.set_function(self.number, Function::Output)?;
        let runs = dma::edge_stream_runs(stream, dma::LITE_MAX_TRANSFER_LEN);
        let bank = self.number / 32;
        let bit = self.number as u32 % 32;
        let mask = 1u32 << bit;
        let mask_buf = self.driver.alloc_buffer(4)?;
        mask_buf.write32(0, mask);

        let cb_buf = self
            .driver
            .alloc_buffer(dma::CONTROL_BLOCK_LEN * runs.len())?;
        let base_addr = cb_buf.bus_addr();

        for (i, run) in runs.iter().enumerate() {
            let reg = match run.level {
                Level::High => gpio_set_offset(bank),
                Level::Low => gpio_clear_offset(bank),
            };
            let next = if i + 1 < runs.len() {
                base_addr + ((i + 1) * dma::CONTROL_BLOCK_LEN) as u32
            } else {
                0
            };
            let cb = dma::build(ControlBlockSpec {
                src_addr: mask_buf.bus_addr(),
                dst_addr: self.driver.gpio_peripheral_addr(reg),
                src_io: false,
                dst_io: true,
                src_ignore: false,
                transfer_len: run.samples * 4,
                dreq: Dreq::Fire,
                wait_cycles: 0,
                next_cb: next,
                wait_resp: true,
            })?;
            for (w, word) in cb.encode().into_iter().enumerate() {
                cb_buf.write32(i * dma::CONTROL_BLOCK_LEN + w * 4, word);
            }
        }

        let channel = self.driver.dma.alloc_free_channel(true, &[])?;
        self.driver.dma.reset(channel);
        self.driver.dma.start(channel, base_addr);
        let mut guard = self.driver.pin_state.lock().expect("pin state mutex poisoned");
        let state = &mut guard[self.number as usize];
        state.dma_channel = Some(channel);
        state.buffers.push(mask_buf);
        state.buffers.push(cb_buf);
        Ok(())
    }

    /// Two-channel bit-bang: one channel writes the `set[]` word buffer
    /// into GPSET, the other writes `clear[]` into GPCLR, both paced by
    /// the same oversampled PWM DREQ rate. The channels are not
    /// hardware-synchronised; a small startup jitter is inherent.
    fn stream_out_bits(&self, stream: &bcm283x_signal_api::BitStream) -> Result<()> {
        self.driver.gpio.set_function(self.number, Function::Output)?;
        let bank = self.number / 32;
        let bit = self.number as u32 % 32;
        let mask = 1u32 << bit;
        let (set_words, clear_words) = dma::bitstream_set_clear_words(stream, mask);

        dma::oversample_divisor(stream.freq_hz(), PWM_DMA_BASE_HZ)?;
        self.driver.clock.set(Clock::Pwm, PWM_DMA_BASE_HZ, 1, false)?;

        let set_buf = self.driver.alloc_buffer(set_words.len() * 4)?;
        let clear_buf = self.driver.alloc_buffer(clear_words.len() * 4)?;
        for (i, &w) in set_words.iter().enumerate() {
            set_buf.write32(i * 4, w);
        }
        for (i, &w) in clear_words.iter().enumerate() {
            clear_buf.write32(i * 4, w);
        }

        let set_cb = dma::build(ControlBlockSpec {
            src_addr: set_buf.bus_addr(),
            dst_addr: self.driver.gpio_peripheral_addr(gpio_set_offset(bank)),
            src_io: false,
            dst_io: true,
            src_ignore: false,
            transfer_len: (set_words.len() * 4) as u32,
            dreq: Dreq::Pwm,
            wait_cycles: 0,
            next_cb: 0,
            wait_resp: true,
        })?;
        let clear_cb = dma::build(ControlBlockSpec {
            src_addr: clear_buf.bus_addr(),
            dst_addr: self.driver.gpio_peripheral_addr(gpio_clear_offset(bank)),
            src_io: false,
            dst_io: true,
            src_ignore: false,
            transfer_len: (clear_words.len() * 4) as u32,
            dreq: Dreq::Pwm,
            wait_cycles: 0,
            next_cb: 0,
            wait_resp: true,
        })?;

        let set_cb_buf = self.driver.alloc_buffer(dma::CONTROL_BLOCK_LEN)?;
        let clear_cb_buf = self.driver.alloc_buffer(dma::CONTROL_BLOCK_LEN)?;
        for (i, word) in set_cb.encode().into_iter().enumerate() {
            set_cb_buf.write32(i * 4, word);
        }
        for (i, word) in clear_cb.encode().into_iter().enumerate() {
            clear_cb_buf.write32(i * 4, word);
        }

        self.driver.start_pwm_pacer();
        let channel_a = self.driver.dma.alloc_free_channel(true, &[])?;
        let channel_b = self.driver.dma.alloc_free_channel(true, &[channel_a])?;
        self.driver.dma.reset(channel_a);
        self.driver.dma.reset(channel_b);
        self.driver.dma.start(channel_a, set_cb_buf.bus_addr());
        self.driver.dma.start(channel_b, clear_cb_buf.bus_addr());

        let mut guard = self.driver.pin_state.lock().expect("pin state mutex poisoned");
        let state = &mut guard[self.number as usize];
        state.dma_channel = Some(channel_a);
        state.second_dma_channel = Some(channel_b);
        state.buffers.extend([set_buf, clear_buf, set_cb_buf, clear_cb_buf]);
        Ok(())
    }

    /// Samples this pin into a bit stream at `freq_hz`, for `nbits` bits,
    /// via a single DMA control block reading the GPIO level register at
    /// the PWM DREQ rate (§4.7 op 5).
    pub fn stream_in(&self, pull: Pull, freq_hz: u32, nbits: usize) -> Result<Vec<u8>> {
        self.driver.gpio.set_function(self.number, Function::Input)?;
        self.driver.gpio.set_pull(self.number, pull)?;
        dma::oversample_divisor(freq_hz, PWM_DMA_BASE_HZ)?;
        self.driver.clock.set(Clock::Pwm, PWM_DMA_BASE_HZ, 1, false)?;

        let bank = self.number / 32;
        let level_reg = self.driver.gpio_peripheral_addr(gpio_level_offset(bank));
        let samples_buf = self.driver.alloc_buffer(nbits * 4)?;

        let cb = dma::build(ControlBlockSpec {
            src_addr: level_reg,
            dst_addr: samples_buf.bus_addr(),
            src_io: true,
            dst_io: false,
            src_ignore: false,
            transfer_len: (nbits * 4) as u32,
            dreq: Dreq::Pwm,
            wait_cycles: 0,
            next_cb: 0,
            wait_resp: true,
        })?;
        let cb_buf = self.driver.alloc_buffer(dma::CONTROL_BLOCK_LEN)?;
        for (i, word) in cb.encode().into_iter().enumerate() {
            cb_buf.write32(i * 4, word);
        }

        self.driver.start_pwm_pacer();
        let channel = self.driver.dma.alloc_free_channel(true, &[])?;
        self.driver.dma.reset(channel);
        self.driver.dma.start(channel, cb_buf.bus_addr());
        self.driver.dma.wait(channel)?;
        self.driver.dma.reset(channel);
        self.driver.clock.halt(Clock::Pwm, false);
        self.driver.pwm.disable_dreq();

        let bit = self.number as u32 % 32;
        let mut words = vec![0u32; nbits];
        for (i, word) in words.iter_mut().enumerate() {
            *word = samples_buf.read32(i * 4);
        }
        Ok(dma::unpack_read_samples(&words, bit))
    }

    /// Plays `stream` out via the PCM peripheral's TX FIFO (§4.7 op 4),
    /// the alternative to the two-channel bit-bang technique for whichever
    /// pin is wired to PCM_DOUT on this board. After the DMA finishes,
    /// polls the PCM TX-error flag as a fence before reporting success.
    pub fn stream_out_pcm(&self, stream: &BitStream) -> Result<()> {
        let alt = pcm_dout_alt(self.number).ok_or(Error::InvalidArgument {
            reason: "pin has no PCM_DOUT alternate function",
        })?;
        self.driver.gpio.set_function(self.number, alt)?;

        self.driver.clock.set(Clock::Pcm, stream.freq_hz(), 1, false)?;
        self.driver.pcm.disable();
        self.driver.pcm.reset_fifos();
        self.driver.pcm.set_dreq_thresholds(0x10, 0x30);
        self.driver.pcm.enable_tx();
        self.driver.pcm.enable_tx_dma();

        let words = dma::pcm_words_from_bitstream(stream);
        let words_buf = self.driver.alloc_buffer(words.len() * 4)?;
        for (i, &w) in words.iter().enumerate() {
            words_buf.write32(i * 4, w);
        }

        let cb = dma::build(ControlBlockSpec {
            src_addr: words_buf.bus_addr(),
            dst_addr: self.driver.pcm_peripheral_addr(pcm::FIFO),
            src_io: false,
            dst_io: true,
            src_ignore: false,
            transfer_len: (words.len() * 4) as u32,
            dreq: Dreq::PcmTx,
            wait_cycles: 0,
            next_cb: 0,
            wait_resp: true,
        })?;
        let cb_buf = self.driver.alloc_buffer(dma::CONTROL_BLOCK_LEN)?;
        for (i, word) in cb.encode().into_iter().enumerate() {
            cb_buf.write32(i * 4, word);
        }

        let channel = self.driver.dma.alloc_free_channel(true, &[])?;
        self.driver.dma.reset(channel);
        self.driver.dma.start(channel, cb_buf.bus_addr());
        self.driver.dma.wait(channel)?;
        self.driver.dma.reset(channel);

        let tx_error = self.driver.pcm.tx_error();
        self.driver.pcm.clear_errors();
        self.driver.pcm.disable();
        self.driver.clock.halt(Clock::Pcm, false);
        if tx_error {
            return Err(Error::HardwareFault {
                channel,
                flags: 0,
            });
        }
        Ok(())
    }

    /// Returns this pin to input/floating and releases any DMA channel,
    /// clock, or edge subscription it holds. A no-op if called again.
    pub fn halt(&self) -> Result<()> {
        self.halt_opt(None)
    }

    /// Like [`Pin::halt`], but also unsubscribes `watcher` if this pin had
    /// an active edge subscription.
    pub fn halt_with_edge_watcher(&self, watcher: &mut dyn EdgeUnsubscribe) -> Result<()> {
        self.halt_opt(Some(watcher))
    }

    fn halt_opt(&self, watcher: Option<&mut dyn EdgeUnsubscribe>) -> Result<()> {
        let (channel_a, channel_b, buffers, edge_subscribed) = {
            let mut guard = self.driver.pin_state.lock().expect("pin state mutex poisoned");
            let state = &mut guard[self.number as usize];
            (
                state.dma_channel.take(),
                state.second_dma_channel.take(),
                std::mem::take(&mut state.buffers),
                std::mem::take(&mut state.edge_subscribed),
            )
        };
        if let Some(channel) = channel_a {
            self.driver.dma.reset(channel);
        }
        if let Some(channel) = channel_b {
            self.driver.dma.reset(channel);
        }
        if channel_a.is_some() || channel_b.is_some() {
            self.driver.clock.halt(Clock::Pwm, false);
        }
        // Dropping `buffers` here unlocks/releases them with the mailbox
        // only after the DMA channels that referenced them are stopped.
        drop(buffers);
        if edge_subscribed {
            if let Some(watcher) = watcher {
                watcher.unsubscribe(self.number);
            }
        }
        self.driver.gpio.halt(self.number)
    }
}

fn gpio_set_offset(bank: PinNumber) -> usize {
    0x1C + bank as usize * 4
}

fn gpio_clear_offset(bank: PinNumber) -> usize {
    0x28 + bank as usize * 4
}

fn gpio_level_offset(bank: PinNumber) -> usize {
    0x34 + bank as usize * 4
}

impl Driver {
    /// The bus address (0x7E……, per the GLOSSARY) a DMA control block
    /// must use to reach a GPIO register at `byte_offset` from the GPIO
    /// block's base.
    fn gpio_peripheral_addr(&self, byte_offset: usize) -> u32 {
        const BUS_PERIPHERAL_BASE: u32 = 0x7E00_0000;
        BUS_PERIPHERAL_BASE + GPIO_OFFSET as u32 + byte_offset as u32
    }

    /// The bus address a DMA control block must use to reach a PCM
    /// register at `byte_offset` from the PCM block's base.
    fn pcm_peripheral_addr(&self, byte_offset: usize) -> u32 {
        const BUS_PERIPHERAL_BASE: u32 = 0x7E00_0000;
        BUS_PERIPHERAL_BASE + PCM_OFFSET as u32 + byte_offset as u32
    }
}

/// Pins carrying the PCM_DOUT alternate function, the only pins
/// [`Pin::stream_out_pcm`] can drive.
fn pcm_dout_alt(pin: PinNumber) -> Option<Function> {
    match pin {
        21 => Some(Function::Alt0),
        31 => Some(Function::Alt2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_register_offsets_step_by_four_per_bank() {
        assert_eq!(gpio_set_offset(0), 0x1C);
        assert_eq!(gpio_set_offset(1), 0x20);
        assert_eq!(gpio_clear_offset(0), 0x28);
        assert_eq!(gpio_level_offset(0), 0x34);
    }

    #[test]
    fn only_pcm_dout_pins_accept_the_pcm_stream() {
        assert_eq!(pcm_dout_alt(21), Some(Function::Alt0));
        assert_eq!(pcm_dout_alt(31), Some(Function::Alt2));
        assert_eq!(pcm_dout_alt(20), None);
        assert_eq!(pcm_dout_alt(18), None);
    }
}
