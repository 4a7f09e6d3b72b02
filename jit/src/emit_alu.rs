// emit_alu.rs - Integer instruction emitters

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, Value};

use crate::function_generator::FunctionGenerator;
use crate::instr::{exts16, Catalog, InstrData, InstrFormat, InstrKind, InstrType, Operands};
use crate::{Error, Result};

/// Pack a comparison into a cr nibble (LT bit 0, GT bit 1, EQ bit 2, SO
/// bit 3 mirroring XER[SO]).
fn cr_nibble_from_compare(
    g: &mut FunctionGenerator,
    a: Value,
    b: Value,
    signed: bool,
) -> Value {
    let (lt_cc, gt_cc) = if signed {
        (IntCC::SignedLessThan, IntCC::SignedGreaterThan)
    } else {
        (IntCC::UnsignedLessThan, IntCC::UnsignedGreaterThan)
    };
    let lt = g.builder.ins().icmp(lt_cc, a, b);
    let gt = g.builder.ins().icmp(gt_cc, a, b);
    let eq = g.builder.ins().icmp(IntCC::Equal, a, b);
    let xer = g.xer();
    let so_bit = g.builder.ins().band_imm(xer, 0x8000_0000);
    let so = g.builder.ins().icmp_imm(IntCC::NotEqual, so_bit, 0);

    let gt = g.builder.ins().ishl_imm(gt, 1);
    let eq = g.builder.ins().ishl_imm(eq, 2);
    let so = g.builder.ins().ishl_imm(so, 3);
    let n = g.builder.ins().bor(lt, gt);
    let n = g.builder.ins().bor(n, eq);
    g.builder.ins().bor(n, so)
}

/// Record-form update: cr0 from a signed compare of the result with zero.
fn update_cr0(g: &mut FunctionGenerator, value: Value) {
    let zero = g.builder.ins().iconst(types::I64, 0);
    let nibble = cr_nibble_from_compare(g, value, zero, true);
    g.set_cr_field(0, nibble);
}

fn emit_addi(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::D { rt, ra, imm } = i.ops else {
        unreachable!("addi operand format");
    };
    let si = exts16(imm) as i64;
    let v = if ra == 0 {
        g.builder.ins().iconst(types::I64, si)
    } else {
        let a = g.gpr(ra);
        g.builder.ins().iadd_imm(a, si)
    };
    g.set_gpr(rt, v);
    Ok(())
}

fn emit_addis(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::D { rt, ra, imm } = i.ops else {
        unreachable!("addis operand format");
    };
    let si = (exts16(imm) as i64) << 16;
    let v = if ra == 0 {
        g.builder.ins().iconst(types::I64, si)
    } else {
        let a = g.gpr(ra);
        g.builder.ins().iadd_imm(a, si)
    };
    g.set_gpr(rt, v);
    Ok(())
}

fn emit_add(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::Xo { rt, ra, rb, oe, rc } = i.ops else {
        unreachable!("add operand format");
    };
    if oe {
        // XER[OV] is not tracked.
        return Err(Error::Unimplemented {
            address: i.address,
            name: i.ty.name,
        });
    }
    let a = g.gpr(ra);
    let b = g.gpr(rb);
    let v = g.builder.ins().iadd(a, b);
    g.set_gpr(rt, v);
    if rc {
        update_cr0(g, v);
    }
    Ok(())
}

fn emit_subf(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::Xo { rt, ra, rb, oe, rc } = i.ops else {
        unreachable!("subf operand format");
    };
    if oe {
        return Err(Error::Unimplemented {
            address: i.address,
            name: i.ty.name,
        });
    }
    let a = g.gpr(ra);
    let b = g.gpr(rb);
    let v = g.builder.ins().isub(b, a);
    g.set_gpr(rt, v);
    if rc {
        update_cr0(g, v);
    }
    Ok(())
}

// The X-form logicals write rA from rS (the rt slot); operand order is the
// reverse of the arithmetic forms.

fn emit_and(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::X { rt: rs, ra, rb, rc } = i.ops else {
        unreachable!("and operand format");
    };
    let s = g.gpr(rs);
    let b = g.gpr(rb);
    let v = g.builder.ins().band(s, b);
    g.set_gpr(ra, v);
    if rc {
        update_cr0(g, v);
    }
    Ok(())
}

fn emit_or(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::X { rt: rs, ra, rb, rc } = i.ops else {
        unreachable!("or operand format");
    };
    let s = g.gpr(rs);
    let b = g.gpr(rb);
    let v = g.builder.ins().bor(s, b);
    g.set_gpr(ra, v);
    if rc {
        update_cr0(g, v);
    }
    Ok(())
}

fn emit_xor(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::X { rt: rs, ra, rb, rc } = i.ops else {
        unreachable!("xor operand format");
    };
    let s = g.gpr(rs);
    let b = g.gpr(rb);
    let v = g.builder.ins().bxor(s, b);
    g.set_gpr(ra, v);
    if rc {
        update_cr0(g, v);
    }
    Ok(())
}

fn emit_ori(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::D { rt: rs, ra, imm } = i.ops else {
        unreachable!("ori operand format");
    };
    let s = g.gpr(rs);
    let v = g.builder.ins().bor_imm(s, imm as i64);
    g.set_gpr(ra, v);
    Ok(())
}

fn emit_oris(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    let Operands::D { rt: rs, ra, imm } = i.ops else {
        unreachable!("oris operand format");
    };
    let s = g.gpr(rs);
    let v = g.builder.ins().bor_imm(s, (imm as i64) << 16);
    g.set_gpr(ra, v);
    Ok(())
}

fn emit_cmpi(g: &mut FunctionGenerator, i: &InstrData) -> Result<()> {
    // The rt slot packs crfD and the width bit.
    let Operands::D { rt, ra, imm } = i.ops else {
        unreachable!("cmpi operand format");
    };
    let crf = rt >> 2;
    let full_width = rt & 1 != 0;
    let si = exts16(imm) as i64;
    let a = g.gpr(ra);
    let nibble = if full_width {
        let b = g.builder.ins().iconst(types::I64, si);
        cr_nibble_from_compare(g, a, b, true)
    } else {
        let a = g.builder.ins().ireduce(types::I32, a);
        let b = g.builder.ins().iconst(types::I32, si);
        cr_nibble_from_compare(g, a, b, true)
    };
    g.set_cr_field(crf, nibble);
    Ok(())
}

pub(crate) fn register(c: &mut Catalog) -> Result<()> {
    use InstrFormat::*;
    use InstrKind::General;

    let entries = [
        InstrType { name: "cmpi", pattern: 0x2C00_0000, format: D, kind: General, emit: emit_cmpi },
        InstrType { name: "addi", pattern: 0x3800_0000, format: D, kind: General, emit: emit_addi },
        InstrType { name: "addis", pattern: 0x3C00_0000, format: D, kind: General, emit: emit_addis },
        InstrType { name: "ori", pattern: 0x6000_0000, format: D, kind: General, emit: emit_ori },
        InstrType { name: "oris", pattern: 0x6400_0000, format: D, kind: General, emit: emit_oris },
        InstrType { name: "subf", pattern: 0x7C00_0050, format: Xo, kind: General, emit: emit_subf },
        InstrType { name: "and", pattern: 0x7C00_0038, format: X, kind: General, emit: emit_and },
        InstrType { name: "add", pattern: 0x7C00_0214, format: Xo, kind: General, emit: emit_add },
        InstrType { name: "or", pattern: 0x7C00_0378, format: X, kind: General, emit: emit_or },
        InstrType { name: "xor", pattern: 0x7C00_0278, format: X, kind: General, emit: emit_xor },
    ];
    for entry in entries {
        c.register(entry)?;
    }
    Ok(())
}
