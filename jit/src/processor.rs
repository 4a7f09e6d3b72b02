// processor.rs - The execution front door
//
// Builds the native target once, owns the loaded modules in load order,
// hands out guest threads, and routes execution and runtime callbacks to
// the owning module.

use std::sync::{Arc, Mutex};

use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use log::error;

use crate::memory::GuestMemory;
use crate::module::ExecModule;
use crate::runtime::{ExportResolver, NO_MODULE_SENTINEL};
use crate::sdb::SymbolDatabase;
use crate::state::{PpcState, ThreadState};
use crate::{Error, Options, Result};

/// One recorded guest trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapRecord {
    pub address: u32,
}

pub struct Processor {
    memory: Arc<GuestMemory>,
    options: Options,
    isa: OwnedTargetIsa,
    modules: Vec<ExecModule>,
    traps: Mutex<Vec<TrapRecord>>,
}

impl Processor {
    pub fn new(memory: Arc<GuestMemory>, options: Options) -> Result<Processor> {
        // Touch the catalog now so a conflicting registration fails setup
        // rather than the first translation.
        let _ = crate::instr::catalog();

        let mut flags = settings::builder();
        flags.set("opt_level", options.opt_level.as_flag())?;
        flags.set("is_pic", "false")?;
        // The tail calling convention generated code uses requires frame
        // pointers in the current x64 backend.
        flags.set("preserve_frame_pointers", "true")?;
        let isa = cranelift_native::builder()
            .map_err(|e| Error::Isa(e.to_string()))?
            .finish(settings::Flags::new(flags))
            .map_err(|e| Error::Isa(e.to_string()))?;

        Ok(Processor {
            memory,
            options,
            isa,
            modules: Vec::new(),
            traps: Mutex::new(Vec::new()),
        })
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    /// Load a PowerPC ELF image and prepare it for execution; returns its
    /// entry point.
    pub fn load_image(&mut self, name: &str, data: &[u8], resolver: &ExportResolver) -> Result<u32> {
        let module = ExecModule::prepare_from_image(
            name,
            self.memory.clone(),
            resolver,
            &self.options,
            self.isa.clone(),
            data,
        )?;
        let entry = module.entry().unwrap_or(0);
        self.modules.push(module);
        Ok(entry)
    }

    /// Copy a headerless code blob to `start` and prepare that range.
    pub fn load_raw_binary(
        &mut self,
        name: &str,
        start: u32,
        data: &[u8],
        resolver: &ExportResolver,
    ) -> Result<()> {
        self.memory.write_bytes(start, data)?;
        let end = start + data.len() as u32;
        let module = ExecModule::prepare_from_raw_range(
            name,
            self.memory.clone(),
            resolver,
            &self.options,
            self.isa.clone(),
            start,
            end,
        )?;
        self.modules.push(module);
        Ok(())
    }

    /// Prepare a module from a caller-built symbol database (code already
    /// resident in guest memory).
    pub fn load_database(
        &mut self,
        name: &str,
        sdb: SymbolDatabase,
        resolver: &ExportResolver,
    ) -> Result<()> {
        let module = ExecModule::prepare_with_database(
            name,
            self.memory.clone(),
            resolver,
            &self.options,
            self.isa.clone(),
            sdb,
        )?;
        self.modules.push(module);
        Ok(())
    }

    pub fn modules(&self) -> &[ExecModule] {
        &self.modules
    }

    /// Allocate a guest thread bound to this processor.
    pub fn alloc_thread(&self) -> ThreadState<'_> {
        ThreadState::new(self, self.memory.base_ptr())
    }

    /// Run guest code at `address` to completion; returns r3, the PowerPC
    /// return-value register.
    pub fn execute(&self, thread: &mut ThreadState<'_>, address: u32) -> Result<u64> {
        let module = self
            .modules
            .iter()
            .find(|m| m.owns(address))
            .ok_or(Error::NoOwningModule { address })?;
        module.execute(address, thread.state_mut())?;
        Ok(thread.state().r[3])
    }

    /// Convenience wrapper: r3 in, r3 out, with the no-module sentinel on
    /// failure.
    pub fn execute_with_arg(
        &self,
        thread: &mut ThreadState<'_>,
        address: u32,
        arg0: u64,
    ) -> u64 {
        thread.state_mut().r[3] = arg0;
        match self.execute(thread, address) {
            Ok(v) => v,
            Err(e) => {
                error!("execute {address:08X} failed: {e}");
                NO_MODULE_SENTINEL
            }
        }
    }

    /// Indirect dispatch from generated code.
    pub(crate) fn dispatch_indirect(
        &self,
        state: *mut PpcState,
        address: u32,
        lr: u64,
    ) -> Result<()> {
        let module = self
            .modules
            .iter()
            .find(|m| m.owns(address))
            .ok_or(Error::NoOwningModule { address })?;
        module.call_at(address, state, lr)
    }

    pub(crate) fn record_trap(&self, address: u32) {
        self.traps
            .lock()
            .expect("trap log poisoned")
            .push(TrapRecord { address });
    }

    /// Drain the recorded guest traps.
    pub fn take_traps(&self) -> Vec<TrapRecord> {
        std::mem::take(&mut *self.traps.lock().expect("trap log poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_builds_native_isa() {
        let memory = Arc::new(GuestMemory::new(0x1_0000).unwrap());
        let p = Processor::new(memory, Options::default()).unwrap();
        assert!(p.modules().is_empty());
    }

    #[test]
    fn execute_without_modules_reports_no_owner() {
        let memory = Arc::new(GuestMemory::new(0x1_0000).unwrap());
        let p = Processor::new(memory, Options::default()).unwrap();
        let mut thread = p.alloc_thread();
        assert!(matches!(
            p.execute(&mut thread, 0x1000),
            Err(Error::NoOwningModule { address: 0x1000 })
        ));
        assert_eq!(
            p.execute_with_arg(&mut thread, 0x1000, 7),
            NO_MODULE_SENTINEL
        );
    }
}
