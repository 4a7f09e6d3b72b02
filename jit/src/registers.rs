// registers.rs - Guest register access cache
//
// Lazily materializes guest registers from the memory-resident state into
// IR values, tracks modification, and writes dirty values back on demand.
// Straight-line code touches each register's memory slot at most once per
// direction.

use cranelift_codegen::ir::{types, MemFlags, Value};
use cranelift_codegen::ir::InstBuilder;
use cranelift_frontend::FunctionBuilder;

use crate::state::offsets;

/// Per-register cache state.
#[derive(Debug, Clone, Copy, Default)]
enum Slot {
    /// Not loaded; a read materializes it from state memory.
    #[default]
    Unmaterialized,
    /// Loaded and unmodified; safe to drop without writing back.
    Clean(Value),
    /// Modified; must be spilled before control leaves the block.
    Dirty(Value),
}

impl Slot {
    fn value(self) -> Option<Value> {
        match self {
            Slot::Unmaterialized => None,
            Slot::Clean(v) | Slot::Dirty(v) => Some(v),
        }
    }
}

/// The cache proper, reset at every guest-block boundary.
#[derive(Default)]
pub struct RegisterCache {
    gpr: [Slot; 32],
    lr: Slot,
    ctr: Slot,
    xer: Slot,
    cr: [Slot; 8],
}

fn state_flags() -> MemFlags {
    // The state pointer is always valid and its fields naturally aligned.
    MemFlags::trusted()
}

impl RegisterCache {
    pub fn new() -> RegisterCache {
        RegisterCache::default()
    }

    fn load_u64(b: &mut FunctionBuilder, state: Value, offset: i32) -> Value {
        b.ins().load(types::I64, state_flags(), state, offset)
    }

    fn store_u64(b: &mut FunctionBuilder, state: Value, offset: i32, v: Value) {
        b.ins().store(state_flags(), v, state, offset);
    }

    pub fn gpr(&mut self, b: &mut FunctionBuilder, state: Value, n: usize) -> Value {
        if let Some(v) = self.gpr[n].value() {
            return v;
        }
        let v = Self::load_u64(b, state, offsets::gpr(n));
        self.gpr[n] = Slot::Clean(v);
        v
    }

    pub fn set_gpr(&mut self, n: usize, v: Value) {
        self.gpr[n] = Slot::Dirty(v);
    }

    pub fn lr(&mut self, b: &mut FunctionBuilder, state: Value) -> Value {
        if let Some(v) = self.lr.value() {
            return v;
        }
        let v = Self::load_u64(b, state, offsets::LR);
        self.lr = Slot::Clean(v);
        v
    }

    pub fn set_lr(&mut self, v: Value) {
        self.lr = Slot::Dirty(v);
    }

    pub fn ctr(&mut self, b: &mut FunctionBuilder, state: Value) -> Value {
        if let Some(v) = self.ctr.value() {
            return v;
        }
        let v = Self::load_u64(b, state, offsets::CTR);
        self.ctr = Slot::Clean(v);
        v
    }

    pub fn set_ctr(&mut self, v: Value) {
        self.ctr = Slot::Dirty(v);
    }

    pub fn xer(&mut self, b: &mut FunctionBuilder, state: Value) -> Value {
        if let Some(v) = self.xer.value() {
            return v;
        }
        let v = Self::load_u64(b, state, offsets::XER);
        self.xer = Slot::Clean(v);
        v
    }

    pub fn set_xer(&mut self, v: Value) {
        self.xer = Slot::Dirty(v);
    }

    /// A cr field as an I8 nibble (LT in bit 0).
    pub fn cr_field(&mut self, b: &mut FunctionBuilder, state: Value, n: usize) -> Value {
        if let Some(v) = self.cr[n].value() {
            return v;
        }
        let v = b
            .ins()
            .load(types::I8, state_flags(), state, offsets::cr_field(n));
        self.cr[n] = Slot::Clean(v);
        v
    }

    pub fn set_cr_field(&mut self, n: usize, v: Value) {
        self.cr[n] = Slot::Dirty(v);
    }

    /// Write every dirty register back to state memory. Cached values stay
    /// usable (now clean).
    pub fn spill_all(&mut self, b: &mut FunctionBuilder, state: Value) {
        for n in 0..32 {
            if let Slot::Dirty(v) = self.gpr[n] {
                Self::store_u64(b, state, offsets::gpr(n), v);
                self.gpr[n] = Slot::Clean(v);
            }
        }
        if let Slot::Dirty(v) = self.lr {
            Self::store_u64(b, state, offsets::LR, v);
            self.lr = Slot::Clean(v);
        }
        if let Slot::Dirty(v) = self.ctr {
            Self::store_u64(b, state, offsets::CTR, v);
            self.ctr = Slot::Clean(v);
        }
        if let Slot::Dirty(v) = self.xer {
            Self::store_u64(b, state, offsets::XER, v);
            self.xer = Slot::Clean(v);
        }
        for n in 0..8 {
            if let Slot::Dirty(v) = self.cr[n] {
                b.ins()
                    .store(state_flags(), v, state, offsets::cr_field(n));
                self.cr[n] = Slot::Clean(v);
            }
        }
    }

    /// Forget everything. Reads after this re-materialize from memory,
    /// picking up whatever a call or runtime thunk wrote. Dirty values are
    /// dropped, so spill first if they matter.
    pub fn invalidate(&mut self) {
        *self = RegisterCache::default();
    }
}
