// memory.rs - Guest memory arena
//
// A single allocation addressed as base + guest_address. Guest-visible
// multibyte values are big-endian regardless of host byte order; the typed
// accessors here do the swapping for host-side readers and writers.

use std::alloc::{self, Layout};

use crate::{Error, Result};

/// Guest address space. The base is 64-byte aligned so cache-line-sized
/// guest structures keep their alignment in host space.
pub struct GuestMemory {
    base: *mut u8,
    size: u32,
}

// The arena is plain bytes behind a raw pointer; synchronization of guest
// accesses is the guest program's problem, as on hardware.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    pub fn new(size: u32) -> Result<GuestMemory> {
        let layout = Layout::from_size_align(size as usize, 64)
            .map_err(|_| Error::MemorySize { size })?;
        // Zero-filled, like freshly mapped pages.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(Error::MemorySize { size });
        }
        Ok(GuestMemory { base, size })
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn check(&self, address: u32, len: u32) -> Result<()> {
        if address.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(Error::MemoryRange { address, len });
        }
        Ok(())
    }

    pub fn read_u32(&self, address: u32) -> Result<u32> {
        self.check(address, 4)?;
        let mut bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add(address as usize),
                bytes.as_mut_ptr(),
                4,
            );
        }
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn write_u32(&self, address: u32, value: u32) -> Result<()> {
        self.check(address, 4)?;
        let bytes = value.to_be_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.add(address as usize),
                4,
            );
        }
        Ok(())
    }

    pub fn read_u64(&self, address: u32) -> Result<u64> {
        self.check(address, 8)?;
        let mut bytes = [0u8; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add(address as usize),
                bytes.as_mut_ptr(),
                8,
            );
        }
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn write_u64(&self, address: u32, value: u64) -> Result<()> {
        self.check(address, 8)?;
        let bytes = value.to_be_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.add(address as usize),
                8,
            );
        }
        Ok(())
    }

    pub fn write_bytes(&self, address: u32, data: &[u8]) -> Result<()> {
        self.check(address, data.len() as u32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.add(address as usize),
                data.len(),
            );
        }
        Ok(())
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        // Layout validated in new().
        let layout = Layout::from_size_align(self.size as usize, 64).unwrap();
        unsafe { alloc::dealloc(self.base, layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_is_cache_line_aligned() {
        let m = GuestMemory::new(0x1_0000).unwrap();
        assert_eq!(m.base_ptr() as usize % 64, 0);
    }

    #[test]
    fn values_stored_big_endian() {
        let m = GuestMemory::new(0x1000).unwrap();
        m.write_u32(0x100, 0x1234_5678).unwrap();
        let raw = unsafe {
            std::slice::from_raw_parts(m.base_ptr().add(0x100), 4)
        };
        assert_eq!(raw, &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(m.read_u32(0x100).unwrap(), 0x1234_5678);
    }

    #[test]
    fn out_of_range_access_rejected() {
        let m = GuestMemory::new(0x1000).unwrap();
        assert!(m.read_u32(0x0FFE).is_err());
        assert!(m.write_u32(0xFFFF_FFFE, 0).is_err());
    }

    #[test]
    fn zero_filled_on_allocation() {
        let m = GuestMemory::new(0x1000).unwrap();
        assert_eq!(m.read_u64(0).unwrap(), 0);
    }
}
