// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DMA buffer (§3.4): a virtual/physical pair obtained from VCALLOC,
//! automatically released on `Drop`. Ownership is exclusive to whichever
//! component allocated it -- there is no reference counting of the
//! underlying videocore handle.

use std::fs::File;
use std::sync::{Arc, Mutex};

use bcm283x_signal_api::{Error, Result};

use crate::pmem::PhysMemView;
use crate::vcalloc::{AllocFlags, Handle, MailboxTransport, VcAllocator};

const PAGE_SIZE: u32 = 4096;

/// A contiguous, uncached DMA-able buffer: a writable mapping into this
/// process plus the bus address the DMA engine should use to reach it.
pub struct DmaBuffer<T: MailboxTransport> {
    mailbox: Arc<Mutex<VcAllocator<T>>>,
    handle: Handle,
    /// Uncached bus address (the `dram_bus_mask`-OR'd alias) as returned by
    /// `Lock`.
    bus_addr: u32,
    view: PhysMemView,
}

impl<T: MailboxTransport> DmaBuffer<T> {
    /// Allocates, locks, and maps `size` bytes (rounded up to a 4KiB page).
    ///
    /// `dram_bus_mask` strips back off to obtain the real physical address
    /// that `/dev/mem` understands, since the mailbox's `Lock` reply is
    /// already the uncached bus alias.
    pub fn allocate(
        mailbox: Arc<Mutex<VcAllocator<T>>>,
        mem_device: &File,
        dram_bus_mask: u32,
        size: usize,
    ) -> Result<DmaBuffer<T>> {
        let rounded = round_up_page(size);
        let (handle, bus_addr) = {
            let mut guard = mailbox.lock().expect("videocore mailbox mutex poisoned");
            let handle = guard.allocate(rounded as u32, PAGE_SIZE, AllocFlags::DIRECT | AllocFlags::ZERO)?;
            let bus_addr = match guard.lock(handle) {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = guard.release(handle);
                    return Err(e);
                }
            };
            (handle, bus_addr)
        };

        let phys_addr = (bus_addr & !dram_bus_mask) as u64;
        let view = match PhysMemView::map(mem_device, phys_addr, rounded) {
            Ok(v) => v,
            Err(e) => {
                let mut guard = mailbox.lock().expect("videocore mailbox mutex poisoned");
                let _ = guard.unlock(handle);
                let _ = guard.release(handle);
                return Err(e);
            }
        };

        log::debug!(
            "allocated {rounded}-byte DMA buffer, bus={bus_addr:#010x} phys={phys_addr:#010x}"
        );

        Ok(DmaBuffer {
            mailbox,
            handle,
            bus_addr,
            view,
        })
    }

    pub fn bus_addr(&self) -> u32 {
        self.bus_addr
    }

    pub fn len(&self) -> usize {
        self.view.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view.len() == 0
    }

    pub fn read32(&self, offset: usize) -> u32 {
        self.view.read32(offset)
    }

    pub fn write32(&self, offset: usize, value: u32) {
        self.view.write32(offset, value)
    }

    /// Bus address the DMA engine should put in a control block targeting
    /// byte offset `offset` within this buffer.
    pub fn bus_addr_at(&self, offset: usize) -> Result<u32> {
        if offset >= self.len() {
            return Err(Error::InvalidArgument {
                reason: "offset outside DMA buffer",
            });
        }
        Ok(self.bus_addr + offset as u32)
    }
}

impl<T: MailboxTransport> Drop for DmaBuffer<T> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.mailbox.lock() {
            if let Err(e) = guard.unlock(self.handle) {
                log::warn!("failed to unlock videocore buffer: {e}");
            }
            if let Err(e) = guard.release(self.handle) {
                log::warn!("failed to release videocore buffer: {e}");
            }
        }
    }
}

const fn round_up_page(n: usize) -> usize {
    (n + PAGE_SIZE as usize - 1) & !(PAGE_SIZE as usize - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcalloc::MailboxTransport;

    struct FakeFirmware {
        next_handle: u32,
        base_bus_addr: u32,
    }

    impl MailboxTransport for FakeFirmware {
        fn call(&mut self, buf: &mut [u32]) -> Result<()> {
            buf[1] = 0x8000_0000;
            let tag = buf[2];
            if tag == crate::vcalloc::Tag::AllocateMemory.code() {
                buf[5] = self.next_handle;
            } else if tag == crate::vcalloc::Tag::LockMemory.code() {
                buf[5] = self.base_bus_addr;
            } else {
                buf[5] = 0;
            }
            Ok(())
        }
    }

    #[test]
    fn allocate_rounds_up_to_a_page_and_maps() {
        let mailbox = Arc::new(Mutex::new(VcAllocator::with_transport(FakeFirmware {
            next_handle: 9,
            base_bus_addr: 0xC000_1000,
        })));
        let mem_file = tempfile::tempfile().unwrap();
        mem_file.set_len(64 * 1024).unwrap();

        let buf = DmaBuffer::allocate(mailbox, &mem_file, 0xC000_0000, 100).unwrap();
        assert_eq!(buf.len(), PAGE_SIZE as usize);
        assert_eq!(buf.bus_addr(), 0xC000_1000);
        buf.write32(4, 42);
        assert_eq!(buf.read32(4), 42);
        assert_eq!(buf.bus_addr_at(4).unwrap(), 0xC000_1004);
    }
}
