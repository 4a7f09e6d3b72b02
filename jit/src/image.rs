// image.rs - ELF image loading
//
// Parses a PowerPC ELF, copies its loadable segments into guest memory,
// and reports the entry point and executable code range.

use goblin::elf::program_header::{PF_X, PT_LOAD};
use goblin::elf::Elf;
use log::{debug, info};

use crate::memory::GuestMemory;
use crate::{Error, Result};

const EM_PPC: u16 = 20;
const EM_PPC64: u16 = 21;

/// What module preparation needs to know about a loaded image.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub entry: u32,
    pub code_low: u32,
    pub code_high: u32,
}

/// Parse `data` and load it into guest memory.
pub fn load(memory: &GuestMemory, data: &[u8]) -> Result<LoadedImage> {
    let elf = Elf::parse(data)?;

    if elf.header.e_machine != EM_PPC && elf.header.e_machine != EM_PPC64 {
        return Err(Error::UnsupportedImage(format!(
            "machine type {} is not PowerPC",
            elf.header.e_machine
        )));
    }

    let mut code_low = u32::MAX;
    let mut code_high = 0u32;
    let mut loaded = 0usize;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD {
            continue;
        }
        let vaddr = ph.p_vaddr as u32;
        let offset = ph.p_offset as usize;
        let filesz = ph.p_filesz as usize;
        let segment = offset
            .checked_add(filesz)
            .and_then(|seg_end| data.get(offset..seg_end))
            .ok_or_else(|| Error::UnsupportedImage("segment outside file".into()))?;
        memory.write_bytes(vaddr, segment)?;
        loaded += 1;
        debug!(
            "segment at {:08X} ({} file bytes, {} in memory)",
            vaddr, filesz, ph.p_memsz
        );

        if ph.p_flags & PF_X != 0 {
            let end = vaddr
                .checked_add(ph.p_memsz as u32)
                .ok_or_else(|| Error::UnsupportedImage("segment wraps address space".into()))?;
            code_low = code_low.min(vaddr);
            // Keep the range word-granular.
            code_high = code_high.max((end + 3) & !3);
        }
    }

    if loaded == 0 || code_low >= code_high {
        return Err(Error::UnsupportedImage(
            "no executable PT_LOAD segments".into(),
        ));
    }

    let entry = elf.header.e_entry as u32;
    info!(
        "image loaded: entry {:08X}, code [{:08X}, {:08X})",
        entry, code_low, code_high
    );
    Ok(LoadedImage {
        entry,
        code_low,
        code_high,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_elf() {
        let memory = GuestMemory::new(0x1000).unwrap();
        assert!(load(&memory, &[0u8; 16]).is_err());
    }

    #[test]
    fn rejects_segment_range_overflow() {
        // ELF64 PPC64 header with one PT_LOAD whose offset + filesz wraps.
        let mut data = vec![0u8; 64 + 56];
        data[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        data[4] = 2; // 64-bit
        data[5] = 1; // little-endian
        data[6] = 1; // version
        data[16] = 2; // ET_EXEC
        data[18] = 21; // EM_PPC64
        data[20] = 1; // e_version
        data[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        data[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        data[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        let ph = 64;
        data[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        data[ph + 4..ph + 8].copy_from_slice(&1u32.to_le_bytes()); // PF_X
        data[ph + 8..ph + 16].copy_from_slice(&(u64::MAX - 1).to_le_bytes()); // p_offset
        data[ph + 16..ph + 24].copy_from_slice(&0x1000u64.to_le_bytes()); // p_vaddr
        data[ph + 32..ph + 40].copy_from_slice(&4u64.to_le_bytes()); // p_filesz
        data[ph + 40..ph + 48].copy_from_slice(&4u64.to_le_bytes()); // p_memsz

        let memory = GuestMemory::new(0x10_000).unwrap();
        let err = load(&memory, &data);
        assert!(matches!(err, Err(Error::UnsupportedImage(_)) | Err(Error::Image(_))));
    }

    #[test]
    fn rejects_wrong_machine() {
        // Minimal ELF64 header claiming x86-64.
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        data[4] = 2; // 64-bit
        data[5] = 1; // little-endian
        data[6] = 1; // version
        data[16] = 2; // ET_EXEC
        data[18] = 62; // EM_X86_64
        data[20] = 1; // e_version
        let memory = GuestMemory::new(0x1000).unwrap();
        let err = load(&memory, &data);
        assert!(matches!(err, Err(Error::UnsupportedImage(_)) | Err(Error::Image(_))));
    }
}
