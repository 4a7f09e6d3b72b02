// sdb.rs - Symbol database
//
// Discovers functions, basic blocks, and variables in a guest code range,
// and carries the outgoing-edge classification the translator consumes.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::instr::{catalog, exts16, exts26, InstrData, Operands};
use crate::memory::GuestMemory;
use crate::{Error, Result};

/// Where control goes when a basic block ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingEdge {
    /// No known successor; translating such a block is an error.
    None,
    /// Another block of the same function.
    Block(u32),
    /// A function entry (direct call or cross-function tail branch).
    Function(u32),
    /// Wherever the link register points.
    LinkRegister,
    /// Wherever the count register points.
    CountRegister,
}

/// A basic block: [start, end) plus its outgoing edge.
#[derive(Debug, Clone)]
pub struct FunctionBlock {
    pub start: u32,
    pub end: u32,
    pub outgoing: OutgoingEdge,
}

/// A discovered function: contiguous span of blocks.
#[derive(Debug, Clone)]
pub struct FunctionSymbol {
    pub start: u32,
    pub end: u32,
    pub name: String,
    /// Blocks by start address.
    pub blocks: BTreeMap<u32, FunctionBlock>,
}

/// A discovered (or declared) data symbol, typically an import slot.
#[derive(Debug, Clone)]
pub struct VariableSymbol {
    pub address: u32,
    pub name: String,
}

/// Symbol database over one module's code range.
pub struct SymbolDatabase {
    memory: Arc<GuestMemory>,
    code_low: u32,
    code_high: u32,
    entry_seeds: BTreeSet<u32>,
    functions: BTreeMap<u32, FunctionSymbol>,
    variables: BTreeMap<u32, VariableSymbol>,
}

/// Static target of a direct (I- or B-form) branch.
pub(crate) fn direct_branch_target(i: &InstrData) -> Option<u32> {
    match i.ops {
        Operands::I { li, aa, .. } => {
            let disp = exts26(li << 2);
            Some(if aa {
                disp as u32
            } else {
                i.address.wrapping_add(disp as u32)
            })
        }
        Operands::B { bd, aa, .. } => {
            let disp = exts16(bd << 2);
            Some(if aa {
                disp as u32
            } else {
                i.address.wrapping_add(disp as u32)
            })
        }
        _ => None,
    }
}

fn links(i: &InstrData) -> bool {
    match i.ops {
        Operands::I { lk, .. } | Operands::B { lk, .. } | Operands::Xl { lk, .. } => lk,
        _ => false,
    }
}

impl SymbolDatabase {
    /// Database over a raw code range (no image metadata).
    pub fn new_raw(memory: Arc<GuestMemory>, code_low: u32, code_high: u32) -> SymbolDatabase {
        SymbolDatabase {
            memory,
            code_low,
            code_high,
            entry_seeds: BTreeSet::new(),
            functions: BTreeMap::new(),
            variables: BTreeMap::new(),
        }
    }

    /// Seed a known function entry (image entry point, exported symbol)
    /// ahead of analysis.
    pub fn declare_function(&mut self, address: u32) {
        if self.contains(address) {
            self.entry_seeds.insert(address);
        }
    }

    pub fn code_range(&self) -> (u32, u32) {
        (self.code_low, self.code_high)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionSymbol> {
        self.functions.values()
    }

    pub fn function_at(&self, address: u32) -> Option<&FunctionSymbol> {
        self.functions.get(&address)
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariableSymbol> {
        self.variables.values()
    }

    /// Declare a data symbol (import slot) for later resolution.
    pub fn declare_variable(&mut self, address: u32, name: &str) {
        self.variables.insert(
            address,
            VariableSymbol {
                address,
                name: name.to_string(),
            },
        );
    }

    fn decode_at(&self, address: u32) -> Option<InstrData> {
        let code = self.memory.read_u32(address).ok()?;
        catalog().lookup(code).map(|ty| ty.decode(address, code))
    }

    /// Scan the code range and populate the function list.
    ///
    /// Phase 1 seeds function entries (range start plus every
    /// link-register branch target). Phase 2 iterates spans to a fixpoint,
    /// promoting cross-span tail-branch targets to entries. Phase 3 builds
    /// each function's blocks.
    pub fn analyze(&mut self) -> Result<()> {
        let mut entries: BTreeSet<u32> = self.entry_seeds.clone();
        entries.insert(self.code_low);

        // Phase 1: call targets are function entries.
        for address in (self.code_low..self.code_high).step_by(4) {
            if let Some(i) = self.decode_at(address) {
                if i.ty.kind.is_branch() && links(&i) {
                    if let Some(target) = direct_branch_target(&i) {
                        if self.contains(target) {
                            entries.insert(target);
                        }
                    }
                }
            }
        }

        // Phase 2: tail branches that leave their span target functions
        // too. Promoting a target changes the spans, so iterate.
        for _ in 0..8 {
            let spans = self.spans(&entries);
            let mut changed = false;
            for &(start, end) in &spans {
                for address in (start..end).step_by(4) {
                    let Some(i) = self.decode_at(address) else {
                        continue;
                    };
                    if !i.ty.kind.is_branch() || links(&i) {
                        continue;
                    }
                    if let Some(target) = direct_branch_target(&i) {
                        let local = target >= start && target < end;
                        if !local && self.contains(target) && entries.insert(target) {
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }

        // Phase 3: block construction per span.
        self.functions.clear();
        for (start, end) in self.spans(&entries) {
            let func = self.build_function(start, end)?;
            self.functions.insert(start, func);
        }

        debug!(
            "discovered {} functions in [{:08X}, {:08X})",
            self.functions.len(),
            self.code_low,
            self.code_high
        );
        Ok(())
    }

    /// Discover one more function after the initial analysis, for
    /// on-demand translation of an address nothing referenced statically.
    pub fn analyze_function(&mut self, address: u32) -> Result<&FunctionSymbol> {
        if self.functions.contains_key(&address) {
            return Ok(&self.functions[&address]);
        }
        if !self.contains(address) || address % 4 != 0 {
            return Err(Error::NoFunction { address });
        }
        let end = self
            .functions
            .range(address + 1..)
            .next()
            .map(|(&start, _)| start)
            .unwrap_or(self.code_high);
        let func = self.build_function(address, end)?;
        self.functions.insert(address, func);
        Ok(&self.functions[&address])
    }

    fn contains(&self, address: u32) -> bool {
        address >= self.code_low && address < self.code_high
    }

    /// Function spans implied by a sorted entry set: each entry runs to
    /// the next entry or the end of the range.
    fn spans(&self, entries: &BTreeSet<u32>) -> Vec<(u32, u32)> {
        let sorted: Vec<u32> = entries.iter().copied().collect();
        sorted
            .iter()
            .enumerate()
            .map(|(n, &start)| {
                let end = sorted.get(n + 1).copied().unwrap_or(self.code_high);
                (start, end)
            })
            .collect()
    }

    fn build_function(&self, start: u32, end: u32) -> Result<FunctionSymbol> {
        if start >= end {
            return Err(Error::NoFunction { address: start });
        }

        // Block boundaries: function entry, every in-span branch target,
        // and the word after every branch.
        let mut boundaries = BTreeSet::new();
        boundaries.insert(start);
        for address in (start..end).step_by(4) {
            let Some(i) = self.decode_at(address) else {
                continue;
            };
            if !i.ty.kind.is_branch() {
                continue;
            }
            if address + 4 < end {
                boundaries.insert(address + 4);
            }
            if let Some(target) = direct_branch_target(&i) {
                if target >= start && target < end {
                    boundaries.insert(target);
                }
            }
        }

        let bounds: Vec<u32> = boundaries.iter().copied().collect();
        let mut blocks = BTreeMap::new();
        for (n, &block_start) in bounds.iter().enumerate() {
            let block_end = bounds.get(n + 1).copied().unwrap_or(end);
            let outgoing = self.classify_edge(block_end - 4, start, end);
            blocks.insert(
                block_start,
                FunctionBlock {
                    start: block_start,
                    end: block_end,
                    outgoing,
                },
            );
        }

        Ok(FunctionSymbol {
            start,
            end,
            name: format!("sub_{start:08X}"),
            blocks,
        })
    }

    /// Classify the outgoing edge of a block from its last instruction.
    fn classify_edge(&self, last: u32, fn_start: u32, fn_end: u32) -> OutgoingEdge {
        let fallthrough = |next: u32| {
            if next < fn_end {
                OutgoingEdge::Block(next)
            } else {
                OutgoingEdge::None
            }
        };
        let Some(i) = self.decode_at(last) else {
            return fallthrough(last + 4);
        };
        if !i.ty.kind.is_branch() {
            return fallthrough(last + 4);
        }
        match i.ops {
            Operands::I { .. } | Operands::B { .. } => match direct_branch_target(&i) {
                Some(target) if target >= fn_start && target < fn_end => {
                    OutgoingEdge::Block(target)
                }
                Some(target) => OutgoingEdge::Function(target),
                None => OutgoingEdge::None,
            },
            Operands::Xl { .. } => {
                // Extended opcode 16 returns through LR, 528 through CTR.
                match (i.code >> 1) & 0x3FF {
                    16 => OutgoingEdge::LinkRegister,
                    528 => OutgoingEdge::CountRegister,
                    _ => OutgoingEdge::None,
                }
            }
            _ => OutgoingEdge::None,
        }
    }

    /// Write the symbol map: one `ADDRESS name` line per symbol.
    pub fn write_map(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        for variable in self.variables.values() {
            writeln!(file, "{:08X} {}", variable.address, variable.name)?;
        }
        for func in self.functions.values() {
            writeln!(file, "{:08X} {}", func.start, func.name)?;
        }
        Ok(())
    }

    /// Cross-check against a previously written map, adopting its names
    /// and warning about entries the analysis did not find.
    pub fn read_map(&mut self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let mut parts = line.splitn(2, ' ');
            let (Some(addr), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(address) = u32::from_str_radix(addr, 16) else {
                continue;
            };
            if let Some(func) = self.functions.get_mut(&address) {
                if func.name != name {
                    debug!("map: renaming {:08X} {} -> {}", address, func.name, name);
                    func.name = name.to_string();
                }
            } else if let Some(var) = self.variables.get_mut(&address) {
                var.name = name.to_string();
            } else {
                warn!("map: no symbol found at {address:08X} for {name}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(words: &[u32]) -> Arc<GuestMemory> {
        let memory = Arc::new(GuestMemory::new(0x1_0000).unwrap());
        for (n, &word) in words.iter().enumerate() {
            memory.write_u32(0x1000 + n as u32 * 4, word).unwrap();
        }
        memory
    }

    fn analyzed(words: &[u32]) -> SymbolDatabase {
        let memory = load(words);
        let high = 0x1000 + words.len() as u32 * 4;
        let mut sdb = SymbolDatabase::new_raw(memory, 0x1000, high);
        sdb.analyze().unwrap();
        sdb
    }

    #[test]
    fn single_function_single_block() {
        let sdb = analyzed(&[
            0x3863_0001, // addi r3,r3,1
            0x4E80_0020, // blr
        ]);
        let func = sdb.function_at(0x1000).unwrap();
        assert_eq!(func.end, 0x1008);
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(
            func.blocks[&0x1000].outgoing,
            OutgoingEdge::LinkRegister
        );
    }

    #[test]
    fn call_target_becomes_function() {
        let sdb = analyzed(&[
            0x4800_0009, // bl +8 (0x1008)
            0x4E80_0020, // blr
            0x3863_0001, // 0x1008: addi r3,r3,1
            0x4E80_0020, // blr
        ]);
        assert_eq!(sdb.functions().count(), 2);
        let caller = sdb.function_at(0x1000).unwrap();
        assert_eq!(caller.end, 0x1008);
        assert_eq!(
            caller.blocks[&0x1000].outgoing,
            OutgoingEdge::Function(0x1008)
        );
        // The call falls through into a second block.
        assert_eq!(caller.blocks.len(), 2);
        assert!(sdb.function_at(0x1008).is_some());
    }

    #[test]
    fn conditional_branch_splits_blocks() {
        let sdb = analyzed(&[
            0x2C03_0000, // cmpwi r3,0
            0x4182_0008, // beq +8 (0x100C)
            0x3863_0001, // addi r3,r3,1
            0x4E80_0020, // 0x100C: blr
        ]);
        let func = sdb.function_at(0x1000).unwrap();
        assert_eq!(func.blocks.len(), 3);
        assert_eq!(
            func.blocks[&0x1000].outgoing,
            OutgoingEdge::Block(0x100C)
        );
        assert_eq!(func.blocks[&0x1008].outgoing, OutgoingEdge::Block(0x100C));
        assert_eq!(func.blocks[&0x100C].outgoing, OutgoingEdge::LinkRegister);
    }

    #[test]
    fn cross_span_tail_branch_promotes_target() {
        let sdb = analyzed(&[
            0x4800_000D, // 0x1000: bl +12 -> 0x100C
            0x3863_0001, // 0x1004: addi r3,r3,1
            0x4E80_0020, // 0x1008: blr
            0x4BFF_FFF8, // 0x100C: b -8 -> 0x1004
        ]);
        // 0x1004 sits inside the first span but is tail-branched to from
        // the second, so it gets promoted to a function entry.
        assert!(sdb.function_at(0x1004).is_some());
        assert_eq!(sdb.function_at(0x1000).unwrap().end, 0x1004);
    }

    #[test]
    fn bctr_classified_as_count_register() {
        let sdb = analyzed(&[
            0x4E80_0420, // bctr
        ]);
        let func = sdb.function_at(0x1000).unwrap();
        assert_eq!(
            func.blocks[&0x1000].outgoing,
            OutgoingEdge::CountRegister
        );
    }

    #[test]
    fn on_demand_function_discovery() {
        let mut sdb = analyzed(&[
            0x4E80_0020, // 0x1000: blr
            0x3863_0001, // 0x1004: addi r3,r3,1 (unreferenced)
            0x4E80_0020, // 0x1008: blr
        ]);
        assert!(sdb.function_at(0x1004).is_none());
        let func = sdb.analyze_function(0x1004).unwrap();
        assert_eq!(func.start, 0x1004);
        assert_eq!(func.end, 0x100C);
        assert!(sdb.analyze_function(0x2000).is_err());
    }

    #[test]
    fn map_round_trip_applies_names() {
        let mut sdb = analyzed(&[0x4E80_0020]);
        let path = std::env::temp_dir().join(format!("ppc2native-map-{}", std::process::id()));
        sdb.write_map(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("00001000 sub_00001000"));

        std::fs::write(&path, "00001000 main\n").unwrap();
        sdb.read_map(&path).unwrap();
        assert_eq!(sdb.function_at(0x1000).unwrap().name, "main");
        std::fs::remove_file(&path).ok();
    }
}
