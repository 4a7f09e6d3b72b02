// ppc2native - PowerPC to native-code dynamic binary translator
//
// This library translates PowerPC machine code function by function into
// native code and runs it against a memory-resident guest register file.
//
// # Architecture
//
// The translator works in several phases:
//
// 1. **Image Loading** (`image.rs`): Load a PowerPC ELF into guest memory
// 2. **Discovery** (`sdb.rs`): Find functions and basic blocks, classify
//    each block's outgoing edge
// 3. **Decoding** (`instr.rs`): Match instruction words against the
//    catalog of translatable encodings
// 4. **Translation** (`function_generator.rs` + `emit_*.rs`): Emit native
//    IR per function through Cranelift
// 5. **Execution** (`module.rs`, `processor.rs`): JIT-finalize, populate
//    the dispatch table, and run
//
// # Memory Model
//
// Guest memory is one 64-byte-aligned host allocation addressed as
// base + guest_address, holding big-endian values. Each guest thread owns
// a `PpcState` register file; generated functions take (state pointer,
// return address) and use the tail calling convention so guest tail calls
// do not grow the native stack.
//
// # Indirect Branches
//
// Branches through LR/CTR first try the return fast path or the enclosing
// function's own blocks, then a per-module dispatch table of translated
// entry points, and finally the `ppc_call_indirect` runtime thunk, which
// translates the target on demand.

use std::path::PathBuf;

use thiserror::Error as ThisError;

pub mod function_generator;
pub mod image;
pub mod instr;
pub mod memory;
pub mod module;
pub mod processor;
pub mod runtime;
pub mod sdb;
pub mod state;

mod emit_alu;
mod emit_control;
mod emit_memory;
mod registers;

pub use memory::GuestMemory;
pub use module::ExecModule;
pub use processor::{Processor, TrapRecord};
pub use runtime::{
    ExportResolver, NO_MODULE_SENTINEL, RETURN_ADDRESS_SENTINEL, UNRESOLVED_IMPORT_SENTINEL,
};
pub use state::{PpcState, ThreadState};

/// Backend optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    #[default]
    None,
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    pub(crate) fn as_flag(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Translation options, threaded from the front end into module
/// preparation.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub opt_level: OptLevel,
    /// Log generated IR per function.
    pub dump_ir: bool,
    /// Cross-check discovery against an existing symbol map.
    pub load_map: Option<PathBuf>,
    /// Write the discovered symbol map.
    pub dump_map: Option<PathBuf>,
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image parse error: {0}")]
    Image(#[from] goblin::error::Error),
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),
    #[error("backend error: {0}")]
    Backend(#[from] cranelift_module::ModuleError),
    #[error("backend settings error: {0}")]
    Settings(#[from] cranelift_codegen::settings::SetError),
    #[error("native target unavailable: {0}")]
    Isa(String),
    #[error("catalog entry {name} conflicts with {other}")]
    CatalogConflict {
        name: &'static str,
        other: &'static str,
    },
    #[error("guest memory size {size:#X} invalid")]
    MemorySize { size: u32 },
    #[error("guest memory access at {address:08X} (+{len}) out of range")]
    MemoryRange { address: u32, len: u32 },
    #[error("unknown instruction {code:08X} at {address:08X}")]
    Untranslatable { address: u32, code: u32 },
    #[error("instruction {name} at {address:08X} not implemented")]
    Unimplemented { address: u32, name: &'static str },
    #[error("malformed control flow at {address:08X}: {reason}")]
    MalformedControlFlow { address: u32, reason: &'static str },
    #[error("no function at {address:08X}")]
    NoFunction { address: u32 },
    #[error("no module owns address {address:08X}")]
    NoOwningModule { address: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
