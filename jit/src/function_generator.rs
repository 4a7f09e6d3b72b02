// function_generator.rs - Per-function translation driver
//
// Walks one discovered function's blocks, decodes each word through the
// catalog, and dispatches to the emitters. Owns the guest-block to native-
// block map, the shared return block, and the register cache.

use std::collections::{BTreeMap, HashMap};

use cranelift_codegen::ir::{types, AbiParam, Block, FuncRef, SigRef, Signature, Type, Value};
use cranelift_codegen::ir::InstBuilder;
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::FunctionBuilder;
use cranelift_jit::JITModule;
use cranelift_module::{DataId, FuncId, Module};

use crate::instr::catalog;
use crate::memory::GuestMemory;
use crate::registers::RegisterCache;
use crate::sdb::{FunctionBlock, FunctionSymbol};
use crate::{Error, Result};

/// Runtime-support declarations shared by every generated function.
pub(crate) struct RuntimeSupport {
    pub trap: FuncId,
    pub call_indirect: FuncId,
    pub membase: DataId,
    pub dispatch_table: DataId,
}

/// The signature every guest function is generated with: (state pointer,
/// return address). Tail convention so resolved tail calls reuse the
/// caller's frame.
pub(crate) fn guest_signature(ptr_type: Type) -> Signature {
    let mut sig = Signature::new(CallConv::Tail);
    sig.params.push(AbiParam::new(ptr_type));
    sig.params.push(AbiParam::new(types::I64));
    sig
}

/// Signature of the `ppc_trap` runtime thunk.
pub(crate) fn trap_signature(ptr_type: Type, call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(ptr_type));
    sig.params.push(AbiParam::new(types::I32));
    sig
}

/// Signature of the `ppc_call_indirect` runtime thunk.
pub(crate) fn call_indirect_signature(ptr_type: Type, call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(ptr_type));
    sig.params.push(AbiParam::new(types::I64));
    sig.params.push(AbiParam::new(types::I64));
    sig
}

pub struct FunctionGenerator<'a> {
    pub(crate) builder: FunctionBuilder<'a>,
    module: &'a mut JITModule,
    memory: &'a GuestMemory,
    symbol: &'a FunctionSymbol,
    func_ids: &'a HashMap<u32, FuncId>,
    support: &'a RuntimeSupport,
    code_low: u32,
    code_high: u32,
    ptr_type: Type,
    state_ptr: Value,
    return_address: Value,
    membase: Value,
    dispatch_table: Value,
    blocks: BTreeMap<u32, Block>,
    return_block: Block,
    pub(crate) regs: RegisterCache,
    current_start: u32,
    terminated: bool,
    func_refs: HashMap<u32, FuncRef>,
    trap_ref: Option<FuncRef>,
    call_indirect_ref: Option<FuncRef>,
    tail_sig: Option<SigRef>,
}

impl<'a> FunctionGenerator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mut builder: FunctionBuilder<'a>,
        module: &'a mut JITModule,
        memory: &'a GuestMemory,
        symbol: &'a FunctionSymbol,
        func_ids: &'a HashMap<u32, FuncId>,
        support: &'a RuntimeSupport,
        code_low: u32,
        code_high: u32,
    ) -> FunctionGenerator<'a> {
        let ptr_type = module.target_config().pointer_type();

        // Entry block: receive (state, return address), materialize the
        // injected globals, then fall into the first guest block.
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let state_ptr = builder.block_params(entry)[0];
        let return_address = builder.block_params(entry)[1];

        let membase_gv = module.declare_data_in_func(support.membase, builder.func);
        let membase = builder.ins().symbol_value(ptr_type, membase_gv);
        let table_gv = module.declare_data_in_func(support.dispatch_table, builder.func);
        let dispatch_table = builder.ins().symbol_value(ptr_type, table_gv);

        let mut blocks = BTreeMap::new();
        for &start in symbol.blocks.keys() {
            blocks.insert(start, builder.create_block());
        }
        let return_block = builder.create_block();

        FunctionGenerator {
            builder,
            module,
            memory,
            symbol,
            func_ids,
            support,
            code_low,
            code_high,
            ptr_type,
            state_ptr,
            return_address,
            membase,
            dispatch_table,
            blocks,
            return_block,
            regs: RegisterCache::new(),
            current_start: symbol.start,
            terminated: false,
            func_refs: HashMap::new(),
            trap_ref: None,
            call_indirect_ref: None,
            tail_sig: None,
        }
    }

    /// Translate every block and finish the native function.
    pub(crate) fn generate(mut self) -> Result<()> {
        let symbol = self.symbol;
        let first = *self.blocks.get(&symbol.start).ok_or(Error::MalformedControlFlow {
            address: symbol.start,
            reason: "function has no blocks",
        })?;
        self.builder.ins().jump(first, &[]);

        for fn_block in symbol.blocks.values() {
            self.translate_block(fn_block)?;
        }

        // The designated exit. Everything entering here has already been
        // written back to state memory.
        self.builder.switch_to_block(self.return_block);
        self.builder.ins().return_(&[]);

        self.builder.seal_all_blocks();
        self.builder.finalize();
        Ok(())
    }

    fn translate_block(&mut self, fn_block: &FunctionBlock) -> Result<()> {
        let native = self.blocks[&fn_block.start];
        self.builder.switch_to_block(native);
        // Native blocks are join points; nothing cached survives into one.
        self.regs.invalidate();
        self.current_start = fn_block.start;
        self.terminated = false;

        for address in (fn_block.start..fn_block.end).step_by(4) {
            let code = self.memory.read_u32(address)?;
            let ty = catalog()
                .lookup(code)
                .ok_or(Error::Untranslatable { address, code })?;
            let i = ty.decode(address, code);
            (ty.emit)(self, &i)?;
            if self.terminated && address + 4 < fn_block.end {
                return Err(Error::MalformedControlFlow {
                    address: address + 4,
                    reason: "code after block terminator",
                });
            }
        }

        if !self.terminated {
            // Fall through to the adjacent block. A block that falls off
            // the end of its function was misdiscovered.
            let next = self
                .blocks
                .get(&fn_block.end)
                .copied()
                .ok_or(Error::MalformedControlFlow {
                    address: fn_block.end,
                    reason: "block falls off function end",
                })?;
            self.spill();
            self.builder.ins().jump(next, &[]);
        }
        Ok(())
    }

    // -- emitter surface -----------------------------------------------

    pub(crate) fn ptr_type(&self) -> Type {
        self.ptr_type
    }

    pub(crate) fn state_ptr(&self) -> Value {
        self.state_ptr
    }

    /// The return-address argument this invocation was entered with.
    pub(crate) fn incoming_return_address(&self) -> Value {
        self.return_address
    }

    pub(crate) fn membase(&self) -> Value {
        self.membase
    }

    pub(crate) fn dispatch_table(&self) -> Value {
        self.dispatch_table
    }

    pub(crate) fn code_range(&self) -> (u32, u32) {
        (self.code_low, self.code_high)
    }

    /// The guest block currently being translated.
    pub(crate) fn fn_block(&self) -> &FunctionBlock {
        &self.symbol.blocks[&self.current_start]
    }

    pub(crate) fn native_block(&self, address: u32) -> Option<Block> {
        self.blocks.get(&address).copied()
    }

    /// Native block following the current one in address order.
    pub(crate) fn next_native_block(&self) -> Option<Block> {
        self.blocks.get(&self.fn_block().end).copied()
    }

    pub(crate) fn return_block(&self) -> Block {
        self.return_block
    }

    /// Guest blocks of the enclosing function, for likely-local indirect
    /// branch resolution.
    pub(crate) fn local_blocks(&self) -> Vec<(u32, Block)> {
        self.blocks.iter().map(|(&a, &b)| (a, b)).collect()
    }

    /// Record that the current guest block emitted its terminator.
    pub(crate) fn mark_terminated(&mut self) {
        self.terminated = true;
    }

    pub(crate) fn spill(&mut self) {
        let state = self.state_ptr;
        self.regs.spill_all(&mut self.builder, state);
    }

    pub(crate) fn gpr(&mut self, n: u32) -> Value {
        let state = self.state_ptr;
        self.regs.gpr(&mut self.builder, state, n as usize)
    }

    pub(crate) fn set_gpr(&mut self, n: u32, v: Value) {
        self.regs.set_gpr(n as usize, v);
    }

    pub(crate) fn lr(&mut self) -> Value {
        let state = self.state_ptr;
        self.regs.lr(&mut self.builder, state)
    }

    pub(crate) fn set_lr(&mut self, v: Value) {
        self.regs.set_lr(v);
    }

    pub(crate) fn ctr(&mut self) -> Value {
        let state = self.state_ptr;
        self.regs.ctr(&mut self.builder, state)
    }

    pub(crate) fn set_ctr(&mut self, v: Value) {
        self.regs.set_ctr(v);
    }

    pub(crate) fn xer(&mut self) -> Value {
        let state = self.state_ptr;
        self.regs.xer(&mut self.builder, state)
    }

    pub(crate) fn set_xer(&mut self, v: Value) {
        self.regs.set_xer(v);
    }

    pub(crate) fn cr_field(&mut self, n: u32) -> Value {
        let state = self.state_ptr;
        self.regs.cr_field(&mut self.builder, state, n as usize)
    }

    pub(crate) fn set_cr_field(&mut self, n: u32, v: Value) {
        self.regs.set_cr_field(n as usize, v);
    }

    /// Reference to another generated guest function.
    pub(crate) fn func_ref(&mut self, address: u32) -> Result<FuncRef> {
        if let Some(&r) = self.func_refs.get(&address) {
            return Ok(r);
        }
        let id = *self
            .func_ids
            .get(&address)
            .ok_or(Error::NoFunction { address })?;
        let r = self.module.declare_func_in_func(id, self.builder.func);
        self.func_refs.insert(address, r);
        Ok(r)
    }

    pub(crate) fn trap_ref(&mut self) -> FuncRef {
        if let Some(r) = self.trap_ref {
            return r;
        }
        let r = self
            .module
            .declare_func_in_func(self.support.trap, self.builder.func);
        self.trap_ref = Some(r);
        r
    }

    pub(crate) fn call_indirect_ref(&mut self) -> FuncRef {
        if let Some(r) = self.call_indirect_ref {
            return r;
        }
        let r = self
            .module
            .declare_func_in_func(self.support.call_indirect, self.builder.func);
        self.call_indirect_ref = Some(r);
        r
    }

    /// Imported guest signature, for indirect calls through the dispatch
    /// table.
    pub(crate) fn tail_sig(&mut self) -> SigRef {
        if let Some(s) = self.tail_sig {
            return s;
        }
        let s = self.builder.import_signature(guest_signature(self.ptr_type));
        self.tail_sig = Some(s);
        s
    }
}
