// runtime.rs - Runtime support for generated code
//
// The host-side symbols linked into every module (trap handler, indirect
// dispatch), the sentinels shared between generated and host code, and
// the export resolver that backs import variables.

use std::collections::HashMap;

use log::{error, warn};

use crate::processor::Processor;
use crate::state::PpcState;

/// Initial LR value for a fresh thread and the value generated code
/// compares returns against at the outermost frame.
pub const RETURN_ADDRESS_SENTINEL: u64 = 0xBEBE_BEBE;

/// `execute_with_arg` result when no module owns the target address.
pub const NO_MODULE_SENTINEL: u64 = 0xDEAD_BABE;

/// Value written (big-endian) into unresolved import variable slots.
pub const UNRESOLVED_IMPORT_SENTINEL: u32 = 0xDEAD_BEEF;

/// Host-provided values for a module's imports.
#[derive(Default)]
pub struct ExportResolver {
    variables: HashMap<String, u32>,
}

impl ExportResolver {
    pub fn new() -> ExportResolver {
        ExportResolver::default()
    }

    pub fn register_variable(&mut self, name: &str, value: u32) {
        self.variables.insert(name.to_string(), value);
    }

    /// None means the import is known but unimplemented; the module writes
    /// the sentinel instead.
    pub fn variable(&self, name: &str) -> Option<u32> {
        self.variables.get(name).copied()
    }
}

/// Signature of the host-entry trampoline generated per module. Guest
/// functions use the tail calling convention and cannot be entered from
/// host code directly.
pub(crate) type HostEntryFn = unsafe extern "C" fn(*mut PpcState, u64, *const u8);

unsafe fn processor_of<'a>(state: *mut PpcState) -> Option<&'a Processor> {
    let p = (*state).processor as *const Processor;
    p.as_ref()
}

/// Trap handler: generated code calls here when an active TO condition
/// holds. Records the fault and returns so execution resumes after the
/// trap instruction.
pub(crate) extern "C" fn ppc_trap(state: *mut PpcState, address: u32) {
    warn!("guest trap at {address:08X}");
    // Generated code only ever passes the live thread state.
    if let Some(processor) = unsafe { processor_of(state) } {
        processor.record_trap(address);
    }
}

/// Indirect-dispatch fallback: resolve a branch target the emitted fast
/// paths could not, translating on demand, and run it.
pub(crate) extern "C" fn ppc_call_indirect(state: *mut PpcState, target: u64, lr: u64) {
    let Some(processor) = (unsafe { processor_of(state) }) else {
        error!("indirect dispatch with no processor attached");
        return;
    };
    if let Err(e) = processor.dispatch_indirect(state, target as u32, lr) {
        // Nothing to unwind into; the guest wandered off the map.
        error!("indirect dispatch to {target:08X} failed: {e}");
    }
}
