// module.rs - Executable module: the translation pipeline and dispatch
//
// Owns one code range end to end: discovery, native-function generation,
// runtime-symbol injection, the dispatch table, import resolution, and
// execution entry.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cranelift_codegen::ir::{AbiParam, Signature, Type};
use cranelift_codegen::ir::InstBuilder;
use cranelift_codegen::isa::{CallConv, OwnedTargetIsa};
use cranelift_codegen::{self as codegen, ir::types};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};
use log::{debug, info, warn};

use crate::function_generator::{
    call_indirect_signature, guest_signature, trap_signature, FunctionGenerator, RuntimeSupport,
};
use crate::image;
use crate::memory::GuestMemory;
use crate::runtime::{
    self, ExportResolver, HostEntryFn, RETURN_ADDRESS_SENTINEL, UNRESOLVED_IMPORT_SENTINEL,
};
use crate::sdb::SymbolDatabase;
use crate::state::PpcState;
use crate::{Error, Options, Result};

/// Append-only table mapping guest word addresses to translated entry
/// points. Generated code indexes it directly through the injected
/// `guest_dispatch_table` symbol.
struct DispatchTable {
    slots: Box<[AtomicUsize]>,
    low: u32,
}

impl DispatchTable {
    fn new(low: u32, high: u32) -> DispatchTable {
        let count = ((high - low) / 4) as usize;
        DispatchTable {
            slots: (0..count).map(|_| AtomicUsize::new(0)).collect(),
            low,
        }
    }

    fn base_ptr(&self) -> *const u8 {
        self.slots.as_ptr() as *const u8
    }

    fn get(&self, address: u32) -> Option<*const u8> {
        let slot = &self.slots[((address - self.low) / 4) as usize];
        match slot.load(Ordering::Acquire) {
            0 => None,
            p => Some(p as *const u8),
        }
    }

    fn set(&self, address: u32, ptr: *const u8) {
        self.slots[((address - self.low) / 4) as usize].store(ptr as usize, Ordering::Release);
    }
}

struct ModuleInner {
    /// Always `Some` while the module is alive; taken on drop so the
    /// executable mappings can be released.
    jit: Option<JITModule>,
    ctx: codegen::Context,
    fbc: FunctionBuilderContext,
    sdb: SymbolDatabase,
    func_ids: HashMap<u32, FuncId>,
    support: RuntimeSupport,
    dump_ir: bool,
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        if let Some(jit) = self.jit.take() {
            // Every pointer into the mappings (dispatch table slots, the
            // host-entry trampoline) is owned by the enclosing ExecModule
            // and dies with it.
            unsafe { jit.free_memory() };
        }
    }
}

/// One prepared guest module.
pub struct ExecModule {
    name: String,
    memory: Arc<GuestMemory>,
    code_low: u32,
    code_high: u32,
    entry: Option<u32>,
    table: DispatchTable,
    host_entry: HostEntryFn,
    inner: Mutex<ModuleInner>,
}

impl ExecModule {
    /// Prepare from an ELF image: load it into guest memory, then treat
    /// its executable segments as the code range.
    pub fn prepare_from_image(
        name: &str,
        memory: Arc<GuestMemory>,
        resolver: &ExportResolver,
        options: &Options,
        isa: OwnedTargetIsa,
        data: &[u8],
    ) -> Result<ExecModule> {
        let loaded = image::load(&memory, data)?;
        let mut sdb = SymbolDatabase::new_raw(memory.clone(), loaded.code_low, loaded.code_high);
        sdb.declare_function(loaded.entry);
        let mut module = Self::prepare_with_database(name, memory, resolver, options, isa, sdb)?;
        module.entry = Some(loaded.entry);
        Ok(module)
    }

    /// Prepare a raw code range already resident in guest memory.
    pub fn prepare_from_raw_range(
        name: &str,
        memory: Arc<GuestMemory>,
        resolver: &ExportResolver,
        options: &Options,
        isa: OwnedTargetIsa,
        start: u32,
        end: u32,
    ) -> Result<ExecModule> {
        let sdb = SymbolDatabase::new_raw(memory.clone(), start, end);
        Self::prepare_with_database(name, memory, resolver, options, isa, sdb)
    }

    /// Prepare from a caller-built symbol database (pre-declared variables
    /// or extra function seeds).
    pub fn prepare_with_database(
        name: &str,
        memory: Arc<GuestMemory>,
        resolver: &ExportResolver,
        options: &Options,
        isa: OwnedTargetIsa,
        mut sdb: SymbolDatabase,
    ) -> Result<ExecModule> {
        let (code_low, code_high) = sdb.code_range();

        info!("{name}: analyzing [{code_low:08X}, {code_high:08X})");
        sdb.analyze()?;
        if let Some(path) = &options.load_map {
            sdb.read_map(path)?;
        }
        if let Some(path) = &options.dump_map {
            sdb.write_map(path)?;
        }

        let table = DispatchTable::new(code_low, code_high);

        // Inject runtime symbols before any code references them.
        let mut jb = JITBuilder::with_isa(isa, default_libcall_names());
        jb.symbol("guest_membase", memory.base_ptr() as *const u8);
        jb.symbol("guest_dispatch_table", table.base_ptr());
        jb.symbol("ppc_trap", runtime::ppc_trap as *const u8);
        jb.symbol("ppc_call_indirect", runtime::ppc_call_indirect as *const u8);
        let mut jit = JITModule::new(jb);
        let ptr_type = jit.target_config().pointer_type();
        let host_conv = jit.isa().default_call_conv();

        let membase_id = jit.declare_data("guest_membase", Linkage::Import, false, false)?;
        let table_id = jit.declare_data("guest_dispatch_table", Linkage::Import, false, false)?;
        let trap_id = jit.declare_function(
            "ppc_trap",
            Linkage::Import,
            &trap_signature(ptr_type, host_conv),
        )?;
        let indirect_id = jit.declare_function(
            "ppc_call_indirect",
            Linkage::Import,
            &call_indirect_signature(ptr_type, host_conv),
        )?;
        let support = RuntimeSupport {
            trap: trap_id,
            call_indirect: indirect_id,
            membase: membase_id,
            dispatch_table: table_id,
        };

        let mut ctx = jit.make_context();
        let mut fbc = FunctionBuilderContext::new();
        let mut func_ids = HashMap::new();

        // Declare every function first so cross-references resolve, then
        // define them.
        let guest_sig = guest_signature(ptr_type);
        let addresses: Vec<u32> = sdb.functions().map(|f| f.start).collect();
        for f in sdb.functions() {
            let id = jit.declare_function(&f.name, Linkage::Local, &guest_sig)?;
            func_ids.insert(f.start, id);
        }
        info!("{name}: translating {} functions", addresses.len());
        for &address in &addresses {
            define_guest_function(
                &mut jit,
                &mut ctx,
                &mut fbc,
                &sdb,
                &memory,
                &func_ids,
                &support,
                code_low,
                code_high,
                address,
                options.dump_ir,
            )?;
        }

        let entry_id = define_host_entry(&mut jit, &mut ctx, &mut fbc, ptr_type, host_conv)?;

        jit.finalize_definitions()?;

        for (&address, &id) in &func_ids {
            table.set(address, jit.get_finalized_function(id));
        }
        // Fn-pointer shapes are fixed by the signatures declared above.
        let host_entry: HostEntryFn =
            unsafe { mem::transmute(jit.get_finalized_function(entry_id)) };

        // Import variables: implemented value or the sentinel.
        for var in sdb.variables() {
            match resolver.variable(&var.name) {
                Some(value) => memory.write_u32(var.address, value)?,
                None => {
                    warn!(
                        "{name}: import variable {} at {:08X} unimplemented",
                        var.name, var.address
                    );
                    memory.write_u32(var.address, UNRESOLVED_IMPORT_SENTINEL)?;
                }
            }
        }

        info!("{name}: module ready");
        Ok(ExecModule {
            name: name.to_string(),
            memory,
            code_low,
            code_high,
            entry: None,
            table,
            host_entry,
            inner: Mutex::new(ModuleInner {
                jit: Some(jit),
                ctx,
                fbc,
                sdb,
                func_ids,
                support,
                dump_ir: options.dump_ir,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code_range(&self) -> (u32, u32) {
        (self.code_low, self.code_high)
    }

    /// Image entry point, when the module came from an ELF.
    pub fn entry(&self) -> Option<u32> {
        self.entry
    }

    pub fn owns(&self, address: u32) -> bool {
        address >= self.code_low && address < self.code_high
    }

    /// Run the function at `address` on the given thread state. Returns
    /// when guest control flow reaches the outermost return.
    pub fn execute(&self, address: u32, state: &mut PpcState) -> Result<()> {
        state.lr = RETURN_ADDRESS_SENTINEL;
        let entry = self.ensure_function(address)?;
        unsafe { (self.host_entry)(state, RETURN_ADDRESS_SENTINEL, entry) };
        Ok(())
    }

    /// Dispatch path used by the runtime thunk: enter `address` with the
    /// caller's return address.
    pub(crate) fn call_at(&self, address: u32, state: *mut PpcState, lr: u64) -> Result<()> {
        let entry = self.ensure_function(address)?;
        unsafe { (self.host_entry)(state, lr, entry) };
        Ok(())
    }

    /// Translated entry point for `address`, translating on demand. The
    /// module lock is released before the pointer is called so re-entrant
    /// dispatch from guest code can translate further functions.
    fn ensure_function(&self, address: u32) -> Result<*const u8> {
        if !self.owns(address) {
            return Err(Error::NoFunction { address });
        }
        if let Some(p) = self.table.get(address) {
            return Ok(p);
        }

        let mut guard = self.inner.lock().expect("module lock poisoned");
        // Raced with another translator.
        if let Some(p) = self.table.get(address) {
            return Ok(p);
        }
        let inner = &mut *guard;

        debug!("{}: translating {address:08X} on demand", self.name);
        if inner.sdb.function_at(address).is_none() {
            inner.sdb.analyze_function(address)?;
        }
        let jit = inner.jit.as_mut().expect("module backend freed");
        let ptr_type = jit.target_config().pointer_type();
        let name = inner
            .sdb
            .function_at(address)
            .map(|f| f.name.clone())
            .ok_or(Error::NoFunction { address })?;
        let id = jit.declare_function(&name, Linkage::Local, &guest_signature(ptr_type))?;
        inner.func_ids.insert(address, id);
        define_guest_function(
            jit,
            &mut inner.ctx,
            &mut inner.fbc,
            &inner.sdb,
            &self.memory,
            &inner.func_ids,
            &inner.support,
            self.code_low,
            self.code_high,
            address,
            inner.dump_ir,
        )?;
        jit.finalize_definitions()?;
        let ptr = jit.get_finalized_function(id);
        self.table.set(address, ptr);
        Ok(ptr)
    }

    /// Log the module's symbol inventory.
    pub fn dump(&self) {
        let inner = self.inner.lock().expect("module lock poisoned");
        for f in inner.sdb.functions() {
            info!(
                "{}: {} [{:08X}, {:08X}) {} blocks",
                self.name,
                f.name,
                f.start,
                f.end,
                f.blocks.len()
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn define_guest_function(
    jit: &mut JITModule,
    ctx: &mut codegen::Context,
    fbc: &mut FunctionBuilderContext,
    sdb: &SymbolDatabase,
    memory: &GuestMemory,
    func_ids: &HashMap<u32, FuncId>,
    support: &RuntimeSupport,
    code_low: u32,
    code_high: u32,
    address: u32,
    dump_ir: bool,
) -> Result<()> {
    let symbol = sdb
        .function_at(address)
        .ok_or(Error::NoFunction { address })?;
    let id = *func_ids
        .get(&address)
        .ok_or(Error::NoFunction { address })?;

    ctx.func.signature = guest_signature(jit.target_config().pointer_type());
    let builder = FunctionBuilder::new(&mut ctx.func, fbc);
    let generator = FunctionGenerator::new(
        builder, jit, memory, symbol, func_ids, support, code_low, code_high,
    );
    generator.generate()?;

    if dump_ir {
        debug!("{}:\n{}", symbol.name, ctx.func.display());
    }

    jit.define_function(id, ctx)?;
    jit.clear_context(ctx);
    Ok(())
}

/// The host-callable trampoline into tail-convention guest code.
fn define_host_entry(
    jit: &mut JITModule,
    ctx: &mut codegen::Context,
    fbc: &mut FunctionBuilderContext,
    ptr_type: Type,
    host_conv: CallConv,
) -> Result<FuncId> {
    let mut sig = Signature::new(host_conv);
    sig.params.push(AbiParam::new(ptr_type)); // state
    sig.params.push(AbiParam::new(types::I64)); // return address
    sig.params.push(AbiParam::new(ptr_type)); // guest entry point
    let id = jit.declare_function("host_entry", Linkage::Local, &sig)?;

    ctx.func.signature = sig;
    let mut builder = FunctionBuilder::new(&mut ctx.func, fbc);
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let state = builder.block_params(entry)[0];
    let lr = builder.block_params(entry)[1];
    let callee = builder.block_params(entry)[2];
    let callee_sig = builder.import_signature(guest_signature(ptr_type));
    builder.ins().call_indirect(callee_sig, callee, &[state, lr]);
    builder.ins().return_(&[]);
    builder.seal_all_blocks();
    builder.finalize();

    jit.define_function(id, ctx)?;
    jit.clear_context(ctx);
    Ok(id)
}
