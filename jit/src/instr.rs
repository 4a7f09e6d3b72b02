// instr.rs - PowerPC instruction formats, decoding, and the translation catalog
//
// Decodes PowerPC (64-bit, big-endian) instruction words into structured form
// and maps them to their translation routines.

use std::fmt;
use std::sync::LazyLock;

use crate::function_generator::FunctionGenerator;
use crate::{Error, Result};

/// Sign-extend a 16-bit field.
#[inline]
pub fn exts16(v: u32) -> i32 {
    v as u16 as i16 as i32
}

/// Sign-extend a 26-bit field (the shifted LI displacement of I-form
/// branches).
#[inline]
pub fn exts26(v: u32) -> i32 {
    if v & 0x0200_0000 != 0 {
        (v | 0xFC00_0000) as i32
    } else {
        v as i32
    }
}

/// Read bit `index` of an instruction field using the numbering the
/// architecture manual uses (bit 0 is the most significant bit of the
/// field), while `field` holds the bits in machine order (bit 0 least
/// significant).
///
/// The BO, BI, and TO fields are documented msb-first but decoded
/// lsb-first, so every predicate test on them goes through here. Keeping
/// the reindexing in one pure function keeps the reversal out of the
/// emitters.
#[inline]
pub fn doc_bit(field: u32, width: u32, index: u32) -> bool {
    debug_assert!(index < width);
    field & (1 << (width - 1 - index)) != 0
}

/// Build a condition-register nibble from manual-ordered (LT, GT, EQ, SO)
/// flags. Storage order puts LT at bit 0, so a predicate on documented CR
/// bit `b` tests stored bit `b & 3` of the field's byte.
#[inline]
pub fn cr_nibble_from_docs(lt: bool, gt: bool, eq: bool, so: bool) -> u8 {
    (lt as u8) | (gt as u8) << 1 | (eq as u8) << 2 | (so as u8) << 3
}

/// Instruction encoding formats (the subset this core translates).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrFormat {
    I,
    B,
    Sc,
    D,
    Ds,
    X,
    Xl,
    Xfx,
    Xo,
}

impl InstrFormat {
    /// The significant-bit mask for entries of this format. I/B/D compare
    /// the primary opcode only; the extended formats also compare their
    /// extended-opcode bits.
    pub fn mask(self) -> u32 {
        match self {
            InstrFormat::I | InstrFormat::B | InstrFormat::D => 0xFC00_0000,
            InstrFormat::Sc => 0xFC00_0002,
            InstrFormat::Ds => 0xFC00_0003,
            InstrFormat::X | InstrFormat::Xl | InstrFormat::Xfx => 0xFC00_07FE,
            InstrFormat::Xo => 0xFC00_03FE,
        }
    }
}

/// Coarse classification used by discovery and block building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrKind {
    General,
    BranchAlways,
    BranchCond,
    Syscall,
}

impl InstrKind {
    pub fn is_branch(self) -> bool {
        matches!(self, InstrKind::BranchAlways | InstrKind::BranchCond)
    }
}

/// Decoded operand fields, tagged by format.
///
/// Fields hold the raw machine-order values; sign extension and bit
/// reindexing happen at use sites via [`exts16`], [`exts26`], and
/// [`doc_bit`].
#[derive(Debug, Clone, Copy)]
pub enum Operands {
    I { li: u32, aa: bool, lk: bool },
    B { bo: u32, bi: u32, bd: u32, aa: bool, lk: bool },
    Sc,
    D { rt: u32, ra: u32, imm: u32 },
    Ds { rt: u32, ra: u32, ds: u32 },
    X { rt: u32, ra: u32, rb: u32, rc: bool },
    Xl { bo: u32, bi: u32, bb: u32, lk: bool },
    Xfx { rt: u32, spr: u32 },
    Xo { rt: u32, ra: u32, rb: u32, oe: bool, rc: bool },
}

/// A decoded instruction: raw word, guest address, catalog entry, operands.
#[derive(Clone, Copy)]
pub struct InstrData {
    pub address: u32,
    pub code: u32,
    pub ty: &'static InstrType,
    pub ops: Operands,
}

impl fmt::Debug for InstrData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X} {:08X} {} {:?}",
            self.address, self.code, self.ty.name, self.ops
        )
    }
}

/// The translation routine attached to a catalog entry.
pub type EmitFn = fn(&mut FunctionGenerator<'_>, &InstrData) -> Result<()>;

/// One catalog entry: match pattern, significant-bit mask, classification,
/// and the routine that emits native IR for it.
pub struct InstrType {
    pub name: &'static str,
    pub pattern: u32,
    pub format: InstrFormat,
    pub kind: InstrKind,
    pub emit: EmitFn,
}

impl InstrType {
    pub fn mask(&self) -> u32 {
        self.format.mask()
    }

    /// Decode a matching word into operands.
    pub fn decode(&'static self, address: u32, code: u32) -> InstrData {
        let ops = match self.format {
            InstrFormat::I => Operands::I {
                li: (code >> 2) & 0x00FF_FFFF,
                aa: code & 0x2 != 0,
                lk: code & 0x1 != 0,
            },
            InstrFormat::B => Operands::B {
                bo: (code >> 21) & 0x1F,
                bi: (code >> 16) & 0x1F,
                bd: (code >> 2) & 0x3FFF,
                aa: code & 0x2 != 0,
                lk: code & 0x1 != 0,
            },
            InstrFormat::Sc => Operands::Sc,
            InstrFormat::D => Operands::D {
                rt: (code >> 21) & 0x1F,
                ra: (code >> 16) & 0x1F,
                imm: code & 0xFFFF,
            },
            InstrFormat::Ds => Operands::Ds {
                rt: (code >> 21) & 0x1F,
                ra: (code >> 16) & 0x1F,
                ds: (code >> 2) & 0x3FFF,
            },
            InstrFormat::X => Operands::X {
                rt: (code >> 21) & 0x1F,
                ra: (code >> 16) & 0x1F,
                rb: (code >> 11) & 0x1F,
                rc: code & 0x1 != 0,
            },
            InstrFormat::Xl => Operands::Xl {
                bo: (code >> 21) & 0x1F,
                bi: (code >> 16) & 0x1F,
                bb: (code >> 11) & 0x1F,
                lk: code & 0x1 != 0,
            },
            InstrFormat::Xfx => Operands::Xfx {
                rt: (code >> 21) & 0x1F,
                spr: (code >> 11) & 0x3FF,
            },
            InstrFormat::Xo => Operands::Xo {
                rt: (code >> 21) & 0x1F,
                ra: (code >> 16) & 0x1F,
                rb: (code >> 11) & 0x1F,
                oe: code & 0x400 != 0,
                rc: code & 0x1 != 0,
            },
        };
        InstrData {
            address,
            code,
            ty: self,
            ops,
        }
    }
}

/// The instruction catalog: entries bucketed by primary opcode (the top
/// six bits), matched by `(word & mask) == pattern` within a bucket.
pub struct Catalog {
    buckets: [Vec<InstrType>; 64],
}

impl Catalog {
    fn new() -> Catalog {
        Catalog {
            buckets: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Register an entry. Registration fails if an existing entry could
    /// match the same word: two entries conflict when their patterns agree
    /// on every bit both masks consider significant.
    pub fn register(&mut self, ty: InstrType) -> Result<()> {
        let bucket = &mut self.buckets[(ty.pattern >> 26) as usize];
        for existing in bucket.iter() {
            let common = existing.mask() & ty.mask();
            if (existing.pattern ^ ty.pattern) & common == 0 {
                return Err(Error::CatalogConflict {
                    name: ty.name,
                    other: existing.name,
                });
            }
        }
        bucket.push(ty);
        Ok(())
    }

    /// Find the entry matching an instruction word, if any.
    pub fn lookup(&self, code: u32) -> Option<&InstrType> {
        self.buckets[(code >> 26) as usize]
            .iter()
            .find(|ty| code & ty.mask() == ty.pattern)
    }
}

static CATALOG: LazyLock<Catalog> = LazyLock::new(|| {
    let mut catalog = Catalog::new();
    let result = crate::emit_control::register(&mut catalog)
        .and_then(|_| crate::emit_alu::register(&mut catalog))
        .and_then(|_| crate::emit_memory::register(&mut catalog));
    if let Err(e) = result {
        // A conflicting registration is a build defect, not a runtime
        // condition anyone can handle.
        panic!("instruction catalog registration failed: {e}");
    }
    catalog
});

/// The process-wide catalog, built on first use.
pub fn catalog() -> &'static Catalog {
    &CATALOG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exts_helpers() {
        assert_eq!(exts16(0x7FFF), 0x7FFF);
        assert_eq!(exts16(0x8000), -0x8000);
        assert_eq!(exts16(0xFFFC), -4);
        assert_eq!(exts26(0x01FF_FFFC), 0x01FF_FFFC);
        assert_eq!(exts26(0x03FF_FFFC), -4);
    }

    #[test]
    fn doc_bit_reverses_field_order() {
        // BO = 0b10100 encoded; manual bit 0 is the msb.
        let bo = 0b10100;
        assert!(doc_bit(bo, 5, 0));
        assert!(!doc_bit(bo, 5, 1));
        assert!(doc_bit(bo, 5, 2));
        assert!(!doc_bit(bo, 5, 3));
        assert!(!doc_bit(bo, 5, 4));
    }

    #[test]
    fn cr_nibble_storage_order() {
        // LT lands in bit 0, SO in bit 3.
        assert_eq!(cr_nibble_from_docs(true, false, false, false), 0b0001);
        assert_eq!(cr_nibble_from_docs(false, false, true, false), 0b0100);
        assert_eq!(cr_nibble_from_docs(false, true, false, true), 0b1010);
    }

    #[test]
    fn lookup_known_encodings() {
        let c = catalog();
        assert_eq!(c.lookup(0x3863_0001).map(|t| t.name), Some("addi")); // addi r3,r3,1
        assert_eq!(c.lookup(0x4E80_0020).map(|t| t.name), Some("bclrx")); // blr
        assert_eq!(c.lookup(0x4800_0010).map(|t| t.name), Some("bx")); // b +16
        assert_eq!(c.lookup(0x7C63_2214).map(|t| t.name), Some("add")); // add r3,r3,r4
        assert_eq!(c.lookup(0x7C08_02A6).map(|t| t.name), Some("mfspr")); // mflr r0
        assert_eq!(c.lookup(0x6000_0000).map(|t| t.name), Some("ori")); // nop
        assert!(c.lookup(0xFFFF_FFFF).is_none());
    }

    #[test]
    fn conflicting_registration_rejected() {
        let mut c = Catalog::new();
        c.register(InstrType {
            name: "first",
            pattern: 0x4800_0000,
            format: InstrFormat::I,
            kind: InstrKind::BranchAlways,
            emit: |_, _| Ok(()),
        })
        .unwrap();
        let dup = c.register(InstrType {
            name: "second",
            pattern: 0x4800_0000,
            format: InstrFormat::I,
            kind: InstrKind::BranchAlways,
            emit: |_, _| Ok(()),
        });
        assert!(matches!(dup, Err(Error::CatalogConflict { .. })));
    }

    #[test]
    fn x_and_xo_share_a_bucket_without_conflict() {
        // tw (X, extended opcode 4) and add (XO, extended opcode 266) both
        // live under primary opcode 31.
        let c = catalog();
        assert_eq!(c.lookup(0x7C83_2008).map(|t| t.name), Some("tw"));
        assert_eq!(c.lookup(0x7C83_2214).map(|t| t.name), Some("add"));
    }

    #[test]
    fn decode_b_form() {
        let c = catalog();
        let ty = c.lookup(0x4182_0008).unwrap(); // beq +8
        let i = ty.decode(0x1000, 0x4182_0008);
        match i.ops {
            Operands::B { bo, bi, bd, aa, lk } => {
                assert_eq!(bo, 12);
                assert_eq!(bi, 2);
                assert_eq!(bd, 2);
                assert!(!aa);
                assert!(!lk);
            }
            other => panic!("wrong operands: {other:?}"),
        }
    }
}
