// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Videocore allocator (VCALLOC): obtains contiguous, uncached physical
//! DRAM pages from the GPU firmware through the mailbox property
//! interface (`/dev/vcio`).
//!
//! The wire format and the `MailboxTransport` seam below are grounded in
//! the same request/response shape as a classic MMIO mailbox (request
//! marker, tag, input/output lengths, payload, end tag) -- only the
//! transport differs: an `ioctl` round-trip on a character device instead
//! of polling `STATUS`/`READ`/`WRITE` registers.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use bcm283x_signal_api::{Error, Result};

/// `_IOWR('d', 0, sizeof(char *))`, the mailbox property-interface ioctl
/// used by `/dev/vcio`.
pub const MAILBOX_IOCTL: libc::c_ulong = 0xC004_6400;

const REQUEST_MARKER: u32 = 0;
const RESPONSE_SUCCESS: u32 = 0x8000_0000;
const RESPONSE_LENGTH_FLAG: u32 = 0x8000_0000;

/// Mailbox property tags used by the allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tag {
    AllocateMemory,
    LockMemory,
    UnlockMemory,
    ReleaseMemory,
    FirmwareRevision,
}

impl Tag {
    const fn code(self) -> u32 {
        match self {
            Tag::AllocateMemory => 0x0003_000c,
            Tag::LockMemory => 0x0003_000d,
            Tag::UnlockMemory => 0x0003_000e,
            Tag::ReleaseMemory => 0x0003_000f,
            Tag::FirmwareRevision => 0x0000_0001,
        }
    }
}

bitflags::bitflags! {
    /// Memory allocation flags for the `AllocateMemory` tag.
    pub struct AllocFlags: u32 {
        const DIRECT = 1 << 2;
        const COHERENT = 1 << 3;
        const ZERO = 1 << 4;
    }
}

/// Transport used to exchange one property-interface request/response.
/// Splitting this out from `VcAllocator` mirrors the teacher-adjacent
/// `MailboxOps` pattern of a `call()` default built from `write()` +
/// `read()`, letting unit tests substitute a fake firmware without a real
/// `/dev/vcio`.
pub trait MailboxTransport {
    /// Exchanges `buf` (a property-interface message, already packed) for
    /// the firmware's reply, overwriting `buf` in place.
    fn call(&mut self, buf: &mut [u32]) -> Result<()>;
}

/// The real transport: `/dev/vcio` via `ioctl`.
pub struct IoctlMailbox {
    file: File,
}

impl IoctlMailbox {
    pub fn open(path: &Path) -> Result<IoctlMailbox> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::PermissionDenied { path: "/dev/vcio" }
            } else {
                Error::io("open /dev/vcio", e)
            }
        })?;
        Ok(IoctlMailbox { file })
    }
}

impl MailboxTransport for IoctlMailbox {
    fn call(&mut self, buf: &mut [u32]) -> Result<()> {
        // SAFETY: `buf` is a valid, correctly-sized property-interface
        // message; the firmware writes its reply back into the same
        // buffer, which is why `buf` is `&mut`.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                MAILBOX_IOCTL,
                buf.as_mut_ptr() as *mut libc::c_void,
            )
        };
        if rc < 0 {
            return Err(Error::io("mailbox ioctl", std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Packs a single-tag property-interface request. Layout: total length,
/// request marker, tag code, input length, output length, payload words
/// (padded to `input_len.max(output_len)`), terminated with the `End` tag
/// (0) and padded to a 16-byte boundary.
fn pack_message(tag: Tag, input: &[u32], output_words: usize) -> Vec<u32> {
    let value_words = input.len().max(output_words);
    // header (2) + tag code (1) + req/resp len (2) + value buffer + end tag (1)
    let mut msg = Vec::with_capacity(6 + value_words);
    msg.push(0); // total size placeholder, patched below
    msg.push(REQUEST_MARKER);
    msg.push(tag.code());
    msg.push((input.len() * 4) as u32);
    msg.push((output_words * 4) as u32);
    for i in 0..value_words {
        msg.push(input.get(i).copied().unwrap_or(0));
    }
    msg.push(0); // End tag

    // Pad to a 16-byte (4-word) boundary, per the mailbox alignment rule.
    while (msg.len() * 4) % 16 != 0 {
        msg.push(0);
    }
    msg[0] = (msg.len() * 4) as u32;
    msg
}

fn verify_reply(msg: &[u32]) -> Result<()> {
    let code = msg.get(1).copied().unwrap_or(0);
    if code & RESPONSE_SUCCESS == 0 {
        return Err(Error::MailboxFault {
            detail: "reply marker missing success bit",
        });
    }
    Ok(())
}

/// An allocation handle returned by the firmware; opaque to callers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Handle(u32);

/// Thin client over a `MailboxTransport` implementing the allocate/lock/
/// unlock/release sequence VCALLOC needs.
pub struct VcAllocator<T: MailboxTransport> {
    transport: T,
}

impl VcAllocator<IoctlMailbox> {
    /// Opens `/dev/vcio` and issues a firmware-version handshake as a
    /// smoke test, per §4.2.
    pub fn open(path: &Path) -> Result<VcAllocator<IoctlMailbox>> {
        let mut allocator = VcAllocator {
            transport: IoctlMailbox::open(path)?,
        };
        let _version = allocator.firmware_revision()?;
        log::info!("videocore mailbox opened, firmware revision {_version}");
        Ok(allocator)
    }
}

impl<T: MailboxTransport> VcAllocator<T> {
    pub fn with_transport(transport: T) -> VcAllocator<T> {
        VcAllocator { transport }
    }

    fn exchange(&mut self, tag: Tag, input: &[u32], output_words: usize) -> Result<Vec<u32>> {
        let mut msg = pack_message(tag, input, output_words);
        self.transport.call(&mut msg)?;
        verify_reply(&msg)?;
        Ok(msg)
    }

    /// Issues the `FirmwareRevision` handshake used as an open-time smoke
    /// test. Tolerates any non-zero version value.
    pub fn firmware_revision(&mut self) -> Result<u32> {
        let msg = self.exchange(Tag::FirmwareRevision, &[0], 1)?;
        if msg.len() < 6 {
            return Err(Error::MailboxFault {
                detail: "firmware revision reply too short",
            });
        }
        Ok(msg[5])
    }

    /// Requests `size` bytes of contiguous physical memory, aligned to
    /// `alignment`, with the given allocation `flags`.
    pub fn allocate(&mut self, size: u32, alignment: u32, flags: AllocFlags) -> Result<Handle> {
        let msg = self.exchange(
            Tag::AllocateMemory,
            &[size, alignment, flags.bits()],
            1,
        )?;
        let handle = *msg.get(5).ok_or(Error::MailboxFault {
            detail: "allocate-memory reply too short",
        })?;
        if handle == 0 {
            return Err(Error::MailboxFault {
                detail: "allocation rejected by firmware (handle 0)",
            });
        }
        Ok(Handle(handle))
    }

    /// Locks `handle`, returning the uncached bus address of the buffer.
    pub fn lock(&mut self, handle: Handle) -> Result<u32> {
        let msg = self.exchange(Tag::LockMemory, &[handle.0], 1)?;
        msg.get(5).copied().ok_or(Error::MailboxFault {
            detail: "lock-memory reply too short",
        })
    }

    pub fn unlock(&mut self, handle: Handle) -> Result<()> {
        self.exchange(Tag::UnlockMemory, &[handle.0], 1)?;
        Ok(())
    }

    pub fn release(&mut self, handle: Handle) -> Result<()> {
        self.exchange(Tag::ReleaseMemory, &[handle.0], 1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake firmware that always reports success and echoes back
    /// deterministic values, used to test the packing/parsing logic
    /// without a real `/dev/vcio`.
    struct FakeFirmware {
        handle_to_return: u32,
        bus_addr_to_return: u32,
        version_to_return: u32,
    }

    impl MailboxTransport for FakeFirmware {
        fn call(&mut self, buf: &mut [u32]) -> Result<()> {
            let tag = buf[2];
            buf[1] = RESPONSE_SUCCESS;
            let value = if tag == Tag::AllocateMemory.code() {
                self.handle_to_return
            } else if tag == Tag::LockMemory.code() {
                self.bus_addr_to_return
            } else if tag == Tag::FirmwareRevision.code() {
                self.version_to_return
            } else {
                0
            };
            buf[3] |= RESPONSE_LENGTH_FLAG;
            buf[5] = value;
            Ok(())
        }
    }

    struct RejectingFirmware;
    impl MailboxTransport for RejectingFirmware {
        fn call(&mut self, buf: &mut [u32]) -> Result<()> {
            buf[1] = RESPONSE_SUCCESS;
            buf[5] = 0; // handle 0 == rejected
            Ok(())
        }
    }

    struct GarbledFirmware;
    impl MailboxTransport for GarbledFirmware {
        fn call(&mut self, buf: &mut [u32]) -> Result<()> {
            buf[1] = 0; // no success bit
            Ok(())
        }
    }

    #[test]
    fn pack_message_is_16_byte_aligned_and_self_describing() {
        let msg = pack_message(Tag::AllocateMemory, &[4096, 4096, 0], 1);
        assert_eq!(msg[0] as usize, msg.len() * 4);
        assert_eq!((msg.len() * 4) % 16, 0);
        assert_eq!(msg[1], REQUEST_MARKER);
        assert_eq!(msg[2], Tag::AllocateMemory.code());
        assert_eq!(*msg.last().unwrap(), 0);
    }

    #[test]
    fn allocate_lock_round_trip() {
        let mut alloc = VcAllocator::with_transport(FakeFirmware {
            handle_to_return: 7,
            bus_addr_to_return: 0xC000_1000,
            version_to_return: 0,
        });
        let handle = alloc.allocate(16384, 4096, AllocFlags::DIRECT).unwrap();
        assert_eq!(handle, Handle(7));
        let bus_addr = alloc.lock(handle).unwrap();
        assert_eq!(bus_addr, 0xC000_1000);
        alloc.unlock(handle).unwrap();
        alloc.release(handle).unwrap();
    }

    #[test]
    fn zero_handle_is_a_mailbox_fault() {
        let mut alloc = VcAllocator::with_transport(RejectingFirmware);
        assert!(matches!(
            alloc.allocate(16384, 4096, AllocFlags::DIRECT),
            Err(Error::MailboxFault { .. })
        ));
    }

    #[test]
    fn missing_success_bit_is_a_mailbox_fault() {
        let mut alloc = VcAllocator::with_transport(GarbledFirmware);
        assert!(matches!(
            alloc.firmware_revision(),
            Err(Error::MailboxFault { .. })
        ));
    }

    #[test]
    fn firmware_revision_tolerates_any_nonzero_value() {
        let mut alloc = VcAllocator::with_transport(FakeFirmware {
            handle_to_return: 0,
            bus_addr_to_return: 0,
            version_to_return: 123_456,
        });
        assert_eq!(alloc.firmware_revision().unwrap(), 123_456);
    }
}
