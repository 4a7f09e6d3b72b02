// emit_memory.rs - Load/store instruction emitters
//
// Guest memory is addressed as membase + (32-bit effective address) and
// holds big-endian values; every multibyte access byte-swaps between
// guest and host order around the native load or store.

use cranelift_codegen::ir::{types, InstBuilder, MemFlags, Value};

use crate::function_generator::FunctionGenerator;
use crate::instr::{exts16, Catalog, InstrData, InstrFormat, InstrKind, InstrType, Operands};
use crate::Result;

fn guest_flags() -> MemFlags {
    MemFlags::trusted()
}

/// membase + ((rA|0) + disp), with the effective address truncated to the
/// 32-bit guest address space.
fn effective_address(g: &mut FunctionGenerator, ra: u32, disp: i32) -> Value {
    let ea = if ra == 0 {
        g.builder.ins().iconst(types::I64, disp as i64)
    } else {
        let base = g.gpr(ra);
        g.builder.ins().iadd_imm(base, disp as i64)
    };
    let ea = g.builder.ins().band_imm(ea, 0xFFFF_FFFF);
    let membase = g.membase();
    g.builder.ins().iadd(membase, ea)
}

fn emit_lwz(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::D { rt, ra, imm } = i.ops else {
        unreachable!("lwz operand format");
    };
    let addr = effective_address(g, ra, exts16(imm));
    let v = g.builder.ins().load(types::I32, guest_flags(), addr, 0);
    let v = g.builder.ins().bswap(v);
    let v = g.builder.ins().uextend(types::I64, v);
    g.set_gpr(rt, v);
    Ok(())
}

fn emit_stw(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::D { rt, ra, imm } = i.ops else {
        unreachable!("stw operand format");
    };
    let addr = effective_address(g, ra, exts16(imm));
    let v = g.gpr(rt);
    let v = g.builder.ins().ireduce(types::I32, v);
    let v = g.builder.ins().bswap(v);
    g.builder.ins().store(guest_flags(), v, addr, 0);
    Ok(())
}

fn emit_ld(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::Ds { rt, ra, ds } = i.ops else {
        unreachable!("ld operand format");
    };
    let addr = effective_address(g, ra, exts16(ds << 2));
    let v = g.builder.ins().load(types::I64, guest_flags(), addr, 0);
    let v = g.builder.ins().bswap(v);
    g.set_gpr(rt, v);
    Ok(())
}

fn emit_std(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::Ds { rt, ra, ds } = i.ops else {
        unreachable!("std operand format");
    };
    let addr = effective_address(g, ra, exts16(ds << 2));
    let v = g.gpr(rt);
    let v = g.builder.ins().bswap(v);
    g.builder.ins().store(guest_flags(), v, addr, 0);
    Ok(())
}

pub(crate) fn register(c: &mut Catalog) -> Result<()> {
    use InstrFormat::*;
    use InstrKind::General;

    let entries = [
        InstrType { name: "lwz", pattern: 0x8000_0000, format: D, kind: General, emit: emit_lwz },
        InstrType { name: "stw", pattern: 0x9000_0000, format: D, kind: General, emit: emit_stw },
        InstrType { name: "ld", pattern: 0xE800_0000, format: Ds, kind: General, emit: emit_ld },
        InstrType { name: "std", pattern: 0xF800_0000, format: Ds, kind: General, emit: emit_std },
    ];
    for entry in entries {
        c.register(entry)?;
    }
    Ok(())
}
