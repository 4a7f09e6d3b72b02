// emit_control.rs - Control-flow instruction emitters
//
// Branches (direct, conditional, LR/CTR-indirect), traps, and the
// condition/special-purpose register moves. Branch targets come from the
// symbol database's outgoing-edge classification; the emitters decide how
// control is transferred, not where.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, Value};

use crate::function_generator::FunctionGenerator;
use crate::instr::{
    doc_bit, exts16, Catalog, InstrData, InstrFormat, InstrKind, InstrType, Operands,
};
use crate::sdb::OutgoingEdge;
use crate::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum IndirectReg {
    LinkRegister,
    CountRegister,
}

/// Functions with at most this many blocks get the local compare chain on
/// CTR branches before falling back to generic dispatch.
const LIKELY_LOCAL_BLOCK_LIMIT: usize = 32;

/// Transfer control along the current block's outgoing edge.
///
/// `indirect_target` carries the LR/CTR value read before any link-update
/// clobbered it; edges that do not need it ignore it.
fn emit_branch_to(
    g: &mut FunctionGenerator,
    cia: u32,
    lk: bool,
    indirect_target: Option<Value>,
) -> Result<()> {
    match g.fn_block().outgoing {
        OutgoingEdge::Block(target) => {
            let native = g.native_block(target).ok_or(Error::MalformedControlFlow {
                address: cia,
                reason: "local branch target is not a block",
            })?;
            g.spill();
            g.builder.ins().jump(native, &[]);
        }
        OutgoingEdge::Function(target) => {
            g.spill();
            let callee = g.func_ref(target)?;
            let state = g.state_ptr();
            match (lk, g.next_native_block()) {
                (true, Some(next)) => {
                    let ret = g
                        .builder
                        .ins()
                        .iconst(types::I64, cia.wrapping_add(4) as i64);
                    g.builder.ins().call(callee, &[state, ret]);
                    g.regs.invalidate();
                    g.builder.ins().jump(next, &[]);
                }
                _ => {
                    // Tail position: thread our own return address through
                    // so the callee returns directly to our caller.
                    let ret = g.incoming_return_address();
                    g.builder.ins().return_call(callee, &[state, ret]);
                }
            }
        }
        OutgoingEdge::LinkRegister => {
            emit_indirect_branch(g, cia, lk, IndirectReg::LinkRegister, indirect_target)?;
        }
        OutgoingEdge::CountRegister => {
            emit_indirect_branch(g, cia, lk, IndirectReg::CountRegister, indirect_target)?;
        }
        OutgoingEdge::None => {
            return Err(Error::MalformedControlFlow {
                address: cia,
                reason: "branch with no outgoing edge",
            });
        }
    }
    Ok(())
}

/// Branch through LR or CTR.
fn emit_indirect_branch(
    g: &mut FunctionGenerator,
    cia: u32,
    lk: bool,
    reg: IndirectReg,
    target: Option<Value>,
) -> Result<()> {
    let target = match (target, reg) {
        (Some(v), _) => v,
        (None, IndirectReg::LinkRegister) => g.lr(),
        (None, IndirectReg::CountRegister) => g.ctr(),
    };
    g.spill();

    if !lk && reg == IndirectReg::LinkRegister {
        // Return fast path: LR still holds the address we were entered
        // with, so this is a plain return.
        let incoming = g.incoming_return_address();
        let hit = g.builder.ins().icmp(IntCC::Equal, target, incoming);
        let miss = g.builder.create_block();
        let ret = g.return_block();
        g.builder.ins().brif(hit, ret, &[], miss, &[]);
        g.builder.switch_to_block(miss);
    }

    // CTR without link is the jump-table idiom and usually stays inside
    // the function.
    let likely_local = !lk && reg == IndirectReg::CountRegister;
    emit_indirection(g, cia, target, lk, likely_local)
}

/// Generic indirection: local compare chain (optionally), then dispatch
/// table, then the runtime thunk.
fn emit_indirection(
    g: &mut FunctionGenerator,
    cia: u32,
    target: Value,
    lk: bool,
    likely_local: bool,
) -> Result<()> {
    if likely_local {
        let locals = g.local_blocks();
        if locals.len() <= LIKELY_LOCAL_BLOCK_LIMIT {
            for (address, block) in locals {
                let hit = g.builder.ins().icmp_imm(IntCC::Equal, target, address as i64);
                let cont = g.builder.create_block();
                g.builder.ins().brif(hit, block, &[], cont, &[]);
                g.builder.switch_to_block(cont);
            }
        }
    }

    let ptr_type = g.ptr_type();
    let (low, high) = g.code_range();
    let state = g.state_ptr();
    let ret = if lk {
        g.builder
            .ins()
            .iconst(types::I64, cia.wrapping_add(4) as i64)
    } else {
        g.incoming_return_address()
    };
    let next = g.next_native_block();
    let is_tail = !lk || next.is_none();

    let in_lo = g.builder.ins().icmp_imm(IntCC::UnsignedGreaterThanOrEqual, target, low as i64);
    let in_hi = g.builder.ins().icmp_imm(IntCC::UnsignedLessThan, target, high as i64);
    let in_range = g.builder.ins().band(in_lo, in_hi);
    let lookup = g.builder.create_block();
    let resident = g.builder.create_block();
    let thunk = g.builder.create_block();
    g.builder.ins().brif(in_range, lookup, &[], thunk, &[]);

    // In-range: consult the dispatch table.
    g.builder.switch_to_block(lookup);
    let table = g.dispatch_table();
    let base = g.builder.ins().iconst(types::I64, low as i64);
    let index = g.builder.ins().isub(target, base);
    let index = g.builder.ins().ushr_imm(index, 2);
    let offset = g
        .builder
        .ins()
        .imul_imm(index, ptr_type.bytes() as i64);
    let slot = g.builder.ins().iadd(table, offset);
    let entry = g
        .builder
        .ins()
        .load(ptr_type, cranelift_codegen::ir::MemFlags::trusted(), slot, 0);
    let present = g.builder.ins().icmp_imm(IntCC::NotEqual, entry, 0);
    g.builder.ins().brif(present, resident, &[], thunk, &[]);

    // Already translated: call it directly.
    g.builder.switch_to_block(resident);
    let sig = g.tail_sig();
    match (is_tail, next) {
        (false, Some(next)) => {
            g.builder.ins().call_indirect(sig, entry, &[state, ret]);
            g.regs.invalidate();
            g.builder.ins().jump(next, &[]);
        }
        _ => {
            g.builder.ins().return_call_indirect(sig, entry, &[state, ret]);
        }
    }

    // Out of range or not yet translated: let the runtime resolve it.
    g.builder.switch_to_block(thunk);
    let thunk_ref = g.call_indirect_ref();
    g.builder.ins().call(thunk_ref, &[state, target, ret]);
    match (is_tail, next) {
        (false, Some(next)) => {
            g.regs.invalidate();
            g.builder.ins().jump(next, &[]);
        }
        _ => {
            g.builder.ins().return_(&[]);
        }
    }
    Ok(())
}

/// Decrement-and-test-CTR predicate, if BO asks for one.
fn ctr_predicate(g: &mut FunctionGenerator, bo: u32) -> Option<Value> {
    if doc_bit(bo, 5, 2) {
        return None;
    }
    let ctr = g.ctr();
    let ctr = g.builder.ins().iadd_imm(ctr, -1);
    g.set_ctr(ctr);
    let cc = if doc_bit(bo, 5, 3) {
        IntCC::Equal
    } else {
        IntCC::NotEqual
    };
    Some(g.builder.ins().icmp_imm(cc, ctr, 0))
}

/// Condition-register predicate, if BO asks for one. BI numbers CR bits
/// msb-first across the eight fields.
fn cond_predicate(g: &mut FunctionGenerator, bo: u32, bi: u32) -> Option<Value> {
    if doc_bit(bo, 5, 0) {
        return None;
    }
    let field = g.cr_field(bi >> 2);
    let bit = g.builder.ins().band_imm(field, 1i64 << (bi & 3));
    let cc = if doc_bit(bo, 5, 1) {
        IntCC::NotEqual
    } else {
        IntCC::Equal
    };
    Some(g.builder.ins().icmp_imm(cc, bit, 0))
}

/// Split on a predicate (if any), then take the outgoing edge.
fn emit_conditional_branch_to(
    g: &mut FunctionGenerator,
    cia: u32,
    lk: bool,
    ok: Option<Value>,
    indirect_target: Option<Value>,
) -> Result<()> {
    match ok {
        Some(ok) => {
            let next = g.next_native_block().ok_or(Error::MalformedControlFlow {
                address: cia,
                reason: "conditional branch at function end",
            })?;
            let taken = g.builder.create_block();
            g.spill();
            g.builder.ins().brif(ok, taken, &[], next, &[]);
            g.builder.switch_to_block(taken);
            emit_branch_to(g, cia, lk, indirect_target)
        }
        None => emit_branch_to(g, cia, lk, indirect_target),
    }
}

fn emit_bx(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::I { lk, .. } = i.ops else {
        unreachable!("bx operand format");
    };
    if lk {
        let ret = g
            .builder
            .ins()
            .iconst(types::I64, i.address.wrapping_add(4) as i64);
        g.set_lr(ret);
    }
    emit_branch_to(g, i.address, lk, None)?;
    g.mark_terminated();
    Ok(())
}

fn emit_bcx(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::B { bo, bi, lk, .. } = i.ops else {
        unreachable!("bcx operand format");
    };
    // LR updates whether or not the branch is taken.
    if lk {
        let ret = g
            .builder
            .ins()
            .iconst(types::I64, i.address.wrapping_add(4) as i64);
        g.set_lr(ret);
    }
    let ctr_ok = ctr_predicate(g, bo);
    let cond_ok = cond_predicate(g, bo, bi);
    let ok = match (ctr_ok, cond_ok) {
        (Some(c), Some(d)) => Some(g.builder.ins().band(c, d)),
        (Some(c), None) => Some(c),
        (None, Some(d)) => Some(d),
        (None, None) => None,
    };
    emit_conditional_branch_to(g, i.address, lk, ok, None)?;
    g.mark_terminated();
    Ok(())
}

fn emit_bcctrx(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::Xl { bo, bi, lk, .. } = i.ops else {
        unreachable!("bcctrx operand format");
    };
    let target = g.ctr();
    if lk {
        let ret = g
            .builder
            .ins()
            .iconst(types::I64, i.address.wrapping_add(4) as i64);
        g.set_lr(ret);
    }
    // CTR is the target here, so BO carries no CTR predicate.
    let ok = cond_predicate(g, bo, bi);
    emit_conditional_branch_to(g, i.address, lk, ok, Some(target))?;
    g.mark_terminated();
    Ok(())
}

fn emit_bclrx(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::Xl { bo, bi, lk, .. } = i.ops else {
        unreachable!("bclrx operand format");
    };
    // The branch goes to LR as it was before the link update.
    let target = g.lr();
    if lk {
        let ret = g
            .builder
            .ins()
            .iconst(types::I64, i.address.wrapping_add(4) as i64);
        g.set_lr(ret);
    }
    let ctr_ok = ctr_predicate(g, bo);
    let cond_ok = cond_predicate(g, bo, bi);
    let ok = match (ctr_ok, cond_ok) {
        (Some(c), Some(d)) => Some(g.builder.ins().band(c, d)),
        (Some(c), None) => Some(c),
        (None, Some(d)) => Some(d),
        (None, None) => None,
    };
    emit_conditional_branch_to(g, i.address, lk, ok, Some(target))?;
    g.mark_terminated();
    Ok(())
}

/// Shared trap emitter: compare chain over the active TO conditions
/// funneling into one handler call, then resume.
fn emit_trap(g: &mut FunctionGenerator, i: &InstrData, to: u32, a: Value, b: Value) -> Result<()> {
    if to == 0 {
        return Ok(());
    }
    // TO bits in manual order: lt, gt, eq, ltu, gtu.
    const CONDS: [IntCC; 5] = [
        IntCC::SignedLessThan,
        IntCC::SignedGreaterThan,
        IntCC::Equal,
        IntCC::UnsignedLessThan,
        IntCC::UnsignedGreaterThan,
    ];
    let active: Vec<IntCC> = (0..5)
        .filter(|&n| doc_bit(to, 5, n))
        .map(|n| CONDS[n as usize])
        .collect();

    g.spill();
    let trap = g.builder.create_block();
    let after = g.builder.create_block();
    let last = active.len() - 1;
    for (n, &cc) in active.iter().enumerate() {
        let hit = g.builder.ins().icmp(cc, a, b);
        if n == last {
            g.builder.ins().brif(hit, trap, &[], after, &[]);
        } else {
            let cont = g.builder.create_block();
            g.builder.ins().brif(hit, trap, &[], cont, &[]);
            g.builder.switch_to_block(cont);
        }
    }

    g.builder.switch_to_block(trap);
    let handler = g.trap_ref();
    let state = g.state_ptr();
    let addr = g.builder.ins().iconst(types::I32, i.address as i64);
    g.builder.ins().call(handler, &[state, addr]);
    g.builder.ins().jump(after, &[]);

    // The handler may have rewritten state, so nothing cached survives.
    g.builder.switch_to_block(after);
    g.regs.invalidate();
    Ok(())
}

fn emit_tw(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::X { rt: to, ra, rb, .. } = i.ops else {
        unreachable!("tw operand format");
    };
    let a = g.gpr(ra);
    let a = g.builder.ins().ireduce(types::I32, a);
    let b = g.gpr(rb);
    let b = g.builder.ins().ireduce(types::I32, b);
    emit_trap(g, i, to, a, b)
}

fn emit_twi(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::D { rt: to, ra, imm } = i.ops else {
        unreachable!("twi operand format");
    };
    let a = g.gpr(ra);
    let a = g.builder.ins().ireduce(types::I32, a);
    let b = g.builder.ins().iconst(types::I32, exts16(imm) as i64);
    emit_trap(g, i, to, a, b)
}

fn emit_td(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::X { rt: to, ra, rb, .. } = i.ops else {
        unreachable!("td operand format");
    };
    let a = g.gpr(ra);
    let b = g.gpr(rb);
    emit_trap(g, i, to, a, b)
}

fn emit_tdi(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::D { rt: to, ra, imm } = i.ops else {
        unreachable!("tdi operand format");
    };
    let a = g.gpr(ra);
    let b = g.builder.ins().iconst(types::I64, exts16(imm) as i64);
    emit_trap(g, i, to, a, b)
}

/// Decode the split SPR number: the two 5-bit halves are stored swapped.
fn spr_number(spr: u32) -> u32 {
    ((spr & 0x1F) << 5) | ((spr >> 5) & 0x1F)
}

fn emit_mfspr(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::Xfx { rt, spr } = i.ops else {
        unreachable!("mfspr operand format");
    };
    let v = match spr_number(spr) {
        1 => g.xer(),
        8 => g.lr(),
        9 => g.ctr(),
        _ => {
            return Err(Error::Unimplemented {
                address: i.address,
                name: i.ty.name,
            })
        }
    };
    g.set_gpr(rt, v);
    Ok(())
}

fn emit_mtspr(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::Xfx { rt, spr } = i.ops else {
        unreachable!("mtspr operand format");
    };
    let v = g.gpr(rt);
    match spr_number(spr) {
        1 => g.set_xer(v),
        8 => g.set_lr(v),
        9 => g.set_ctr(v),
        _ => {
            return Err(Error::Unimplemented {
                address: i.address,
                name: i.ty.name,
            })
        }
    }
    Ok(())
}

/// Catalog entries that are recognized but not yet translated.
fn emit_unimplemented(_g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    Err(Error::Unimplemented {
        address: i.address,
        name: i.ty.name,
    })
}

pub(crate) fn register(c: &mut Catalog) -> Result<()> {
    use InstrFormat::*;
    use InstrKind::*;

    let entries = [
        InstrType { name: "bx", pattern: 0x4800_0000, format: I, kind: BranchAlways, emit: emit_bx },
        InstrType { name: "bcx", pattern: 0x4000_0000, format: B, kind: BranchCond, emit: emit_bcx },
        InstrType { name: "bcctrx", pattern: 0x4C00_0420, format: Xl, kind: BranchCond, emit: emit_bcctrx },
        InstrType { name: "bclrx", pattern: 0x4C00_0020, format: Xl, kind: BranchCond, emit: emit_bclrx },
        InstrType { name: "sc", pattern: 0x4400_0002, format: Sc, kind: Syscall, emit: emit_unimplemented },
        InstrType { name: "tdi", pattern: 0x0800_0000, format: D, kind: General, emit: emit_tdi },
        InstrType { name: "twi", pattern: 0x0C00_0000, format: D, kind: General, emit: emit_twi },
        InstrType { name: "td", pattern: 0x7C00_0088, format: X, kind: General, emit: emit_td },
        InstrType { name: "tw", pattern: 0x7C00_0008, format: X, kind: General, emit: emit_tw },
        InstrType { name: "mfspr", pattern: 0x7C00_02A6, format: Xfx, kind: General, emit: emit_mfspr },
        InstrType { name: "mtspr", pattern: 0x7C00_03A6, format: Xfx, kind: General, emit: emit_mtspr },
        InstrType { name: "mftb", pattern: 0x7C00_02E6, format: Xfx, kind: General, emit: emit_unimplemented },
        InstrType { name: "mfcr", pattern: 0x7C00_0026, format: X, kind: General, emit: emit_unimplemented },
        InstrType { name: "mtcrf", pattern: 0x7C00_0120, format: Xfx, kind: General, emit: emit_unimplemented },
        InstrType { name: "mcrf", pattern: 0x4C00_0000, format: Xl, kind: General, emit: emit_unimplemented },
        InstrType { name: "crand", pattern: 0x4C00_0202, format: Xl, kind: General, emit: emit_unimplemented },
        InstrType { name: "crandc", pattern: 0x4C00_0102, format: Xl, kind: General, emit: emit_unimplemented },
        InstrType { name: "creqv", pattern: 0x4C00_0242, format: Xl, kind: General, emit: emit_unimplemented },
        InstrType { name: "crnand", pattern: 0x4C00_01C2, format: Xl, kind: General, emit: emit_unimplemented },
        InstrType { name: "crnor", pattern: 0x4C00_0042, format: Xl, kind: General, emit: emit_unimplemented },
        InstrType { name: "cror", pattern: 0x4C00_0382, format: Xl, kind: General, emit: emit_unimplemented },
        InstrType { name: "crorc", pattern: 0x4C00_0342, format: Xl, kind: General, emit: emit_unimplemented },
        InstrType { name: "crxor", pattern: 0x4C00_0182, format: Xl, kind: General, emit: emit_unimplemented },
    ];
    for entry in entries {
        c.register(entry)?;
    }
    Ok(())
}
