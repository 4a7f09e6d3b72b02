// state.rs - Guest register state
//
// The memory-resident PowerPC register file that generated code reads and
// writes through its state pointer argument.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem::offset_of;

use crate::runtime::RETURN_ADDRESS_SENTINEL;

/// One guest hardware thread's register file.
///
/// Layout is fixed: generated code addresses fields by byte offset from the
/// state pointer. Condition-register fields are stored one byte per field
/// with the architectural LT flag in bit 0 (the reverse of the manual's
/// msb-first numbering; see [`crate::instr::cr_nibble_from_docs`]).
#[repr(C, align(64))]
pub struct PpcState {
    /// Current instruction address.
    pub cia: u32,
    /// Next instruction address.
    pub nia: u32,
    /// Fixed-point exception register.
    pub xer: u64,
    /// Link register.
    pub lr: u64,
    /// Count register.
    pub ctr: u64,
    /// General-purpose registers.
    pub r: [u64; 32],
    /// Vector registers (storage only; no vector translation).
    pub v: [[u8; 16]; 128],
    /// Floating-point registers (storage only).
    pub f: [f64; 32],
    /// Condition register fields cr0..cr7, one byte each.
    pub cr: [u8; 8],
    /// Floating-point status and control register.
    pub fpscr: u32,
    /// Guest memory base in host address space.
    pub membase: *mut u8,
    /// Owning [`crate::Processor`], for runtime-support callbacks.
    pub processor: *const c_void,
}

impl PpcState {
    pub fn new() -> PpcState {
        PpcState {
            cia: 0,
            nia: 0,
            xer: 0,
            lr: RETURN_ADDRESS_SENTINEL,
            ctr: 0,
            r: [0; 32],
            v: [[0; 16]; 128],
            f: [0.0; 32],
            cr: [0; 8],
            fpscr: 0,
            membase: std::ptr::null_mut(),
            processor: std::ptr::null(),
        }
    }

    /// cr field as a 4-bit nibble (LT in bit 0).
    pub fn cr_field(&self, n: usize) -> u8 {
        self.cr[n] & 0xF
    }

    pub fn set_cr_field(&mut self, n: usize, value: u8) {
        self.cr[n] = value & 0xF;
    }
}

impl Default for PpcState {
    fn default() -> Self {
        PpcState::new()
    }
}

/// Byte offsets of state fields, for codegen.
pub(crate) mod offsets {
    use super::PpcState;
    use std::mem::offset_of;

    pub const XER: i32 = offset_of!(PpcState, xer) as i32;
    pub const LR: i32 = offset_of!(PpcState, lr) as i32;
    pub const CTR: i32 = offset_of!(PpcState, ctr) as i32;
    pub const R: i32 = offset_of!(PpcState, r) as i32;
    pub const CR: i32 = offset_of!(PpcState, cr) as i32;

    pub const fn gpr(n: usize) -> i32 {
        R + (n * 8) as i32
    }

    pub const fn cr_field(n: usize) -> i32 {
        CR + n as i32
    }
}

/// A guest thread: heap-allocated register state bound to its processor.
///
/// The lifetime ties the thread to a borrow of the processor so the
/// back-pointer stored for runtime callbacks cannot dangle.
pub struct ThreadState<'p> {
    state: Box<PpcState>,
    _processor: PhantomData<&'p crate::Processor>,
}

impl<'p> ThreadState<'p> {
    pub(crate) fn new(
        processor: &'p crate::Processor,
        membase: *mut u8,
    ) -> ThreadState<'p> {
        let mut state = Box::new(PpcState::new());
        state.membase = membase;
        state.processor = processor as *const crate::Processor as *const c_void;
        ThreadState {
            state,
            _processor: PhantomData,
        }
    }

    pub fn state(&self) -> &PpcState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut PpcState {
        &mut self.state
    }
}

// Assert the layout assumptions baked into generated code.
const _: () = {
    assert!(offset_of!(PpcState, cia) == 0);
    assert!(offset_of!(PpcState, nia) == 4);
    assert!(offset_of!(PpcState, xer) == 8);
    assert!(offset_of!(PpcState, lr) == 16);
    assert!(offset_of!(PpcState, ctr) == 24);
    assert!(offset_of!(PpcState, r) == 32);
    assert!(std::mem::align_of::<PpcState>() == 64);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr_field_masks_to_nibble() {
        let mut s = PpcState::new();
        s.set_cr_field(0, 0xFF);
        assert_eq!(s.cr_field(0), 0xF);
        s.set_cr_field(7, 0b0101);
        assert_eq!(s.cr_field(7), 0b0101);
    }

    #[test]
    fn lr_starts_at_return_sentinel() {
        let s = PpcState::new();
        assert_eq!(s.lr, RETURN_ADDRESS_SENTINEL);
    }

    #[test]
    fn gpr_offsets_are_contiguous() {
        assert_eq!(offsets::gpr(0), 32);
        assert_eq!(offsets::gpr(1), 40);
        assert_eq!(offsets::gpr(31), 32 + 31 * 8);
    }
}
