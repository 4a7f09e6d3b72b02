// execution.rs - End-to-end translation and execution tests
//
// Each test assembles a small PowerPC routine into guest memory, prepares
// a module, and runs it on a guest thread.

use std::sync::Arc;

use ppc2native::{
    ExportResolver, GuestMemory, Options, Processor, RETURN_ADDRESS_SENTINEL,
    UNRESOLVED_IMPORT_SENTINEL,
};

const BASE: u32 = 0x1000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// -- encoders ----------------------------------------------------------

const BLR: u32 = 0x4E80_0020;
const BCTR: u32 = 0x4E80_0420;

fn addi(rt: u32, ra: u32, si: i16) -> u32 {
    0x3800_0000 | rt << 21 | ra << 16 | si as u16 as u32
}

fn b(disp: i32) -> u32 {
    0x4800_0000 | (disp as u32 & 0x03FF_FFFC)
}

fn bl(disp: i32) -> u32 {
    b(disp) | 1
}

fn bc(bo: u32, bi: u32, disp: i32) -> u32 {
    0x4000_0000 | bo << 21 | bi << 16 | (disp as u32 & 0xFFFC)
}

fn bcl(bo: u32, bi: u32, disp: i32) -> u32 {
    bc(bo, bi, disp) | 1
}

fn cmpwi(ra: u32, si: i16) -> u32 {
    0x2C00_0000 | ra << 16 | si as u16 as u32
}

fn mflr(rt: u32) -> u32 {
    0x7C00_02A6 | rt << 21 | 0x8_0000
}

fn mtlr(rs: u32) -> u32 {
    0x7C00_03A6 | rs << 21 | 0x8_0000
}

fn mtctr(rs: u32) -> u32 {
    0x7C00_03A6 | rs << 21 | 0x9_0000
}

fn mr(ra: u32, rs: u32) -> u32 {
    0x7C00_0378 | rs << 21 | ra << 16 | rs << 11
}

fn tw(to: u32, ra: u32, rb: u32) -> u32 {
    0x7C00_0008 | to << 21 | ra << 16 | rb << 11
}

fn lwz(rt: u32, ra: u32, d: i16) -> u32 {
    0x8000_0000 | rt << 21 | ra << 16 | d as u16 as u32
}

fn stw(rt: u32, ra: u32, d: i16) -> u32 {
    0x9000_0000 | rt << 21 | ra << 16 | d as u16 as u32
}

// -- harness -----------------------------------------------------------

fn prepared(words: &[u32]) -> Processor {
    init_logging();
    let memory = Arc::new(GuestMemory::new(0x10_0000).unwrap());
    let mut p = Processor::new(memory, Options::default()).unwrap();
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    p.load_raw_binary("test", BASE, &bytes, &ExportResolver::new())
        .unwrap();
    p
}

// -- tests -------------------------------------------------------------

#[test]
fn addi_blr_returns_through_r3() {
    let p = prepared(&[
        addi(3, 3, 1), // addi r3,r3,1
        BLR,
    ]);
    let mut t = p.alloc_thread();
    assert_eq!(p.execute_with_arg(&mut t, BASE, 41), 42);
}

#[test]
fn cr_fields_store_lt_in_bit_zero() {
    let p = prepared(&[cmpwi(3, 5), BLR]);
    let mut t = p.alloc_thread();

    p.execute_with_arg(&mut t, BASE, 5);
    assert_eq!(t.state().cr[0], 0b0100); // EQ

    p.execute_with_arg(&mut t, BASE, 3);
    assert_eq!(t.state().cr[0], 0b0001); // LT

    p.execute_with_arg(&mut t, BASE, 9);
    assert_eq!(t.state().cr[0], 0b0010); // GT
}

#[test]
fn branch_always_ignores_predicates() {
    // bc 20,0 branches over the addi unconditionally.
    let p = prepared(&[
        bc(20, 0, 8),
        addi(3, 3, 100),
        BLR,
    ]);
    let mut t = p.alloc_thread();
    assert_eq!(p.execute_with_arg(&mut t, BASE, 1), 1);
}

#[test]
fn bdnz_decrements_ctr_before_testing() {
    // mtctr r4; loop: addi r3,r3,1; bdnz loop; blr
    let p = prepared(&[
        mtctr(4),
        addi(3, 3, 1),
        bc(16, 0, -4),
        BLR,
    ]);
    let mut t = p.alloc_thread();
    t.state_mut().r[4] = 5;
    assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 5);

    // CTR=1 decrements to zero on the first test: exactly one pass.
    t.state_mut().r[4] = 1;
    assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 1);
}

#[test]
fn beq_follows_the_condition_register() {
    // returns 42 when r3 == 0, r3 otherwise
    let p = prepared(&[
        cmpwi(3, 0),
        bc(12, 2, 8),
        BLR,
        addi(3, 0, 42),
        BLR,
    ]);
    let mut t = p.alloc_thread();
    assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 42);
    assert_eq!(p.execute_with_arg(&mut t, BASE, 7), 7);
}

#[test]
fn branch_selectors_address_each_cr_bit() {
    // BI 0..3 select cr0's LT, GT, EQ, SO; each lives in the matching
    // storage bit of the field's byte.
    for bit in 0..4u32 {
        let p = prepared(&[
            bc(12, bit, 8),
            BLR,
            addi(3, 0, 1),
            BLR,
        ]);
        let mut t = p.alloc_thread();

        t.state_mut().cr[0] = 1 << bit;
        assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 1, "selector {bit}");

        t.state_mut().cr[0] = !(1u8 << bit) & 0xF;
        assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 0, "selector {bit}");
    }
}

#[test]
fn combined_ctr_and_condition_predicate() {
    // bc 8,2: decrement CTR, branch while CTR != 0 and cr0[EQ] set.
    let p = prepared(&[
        mtctr(5),
        cmpwi(4, 0),
        addi(3, 3, 1),
        bc(8, 2, -4),
        BLR,
    ]);
    let mut t = p.alloc_thread();

    t.state_mut().r[5] = 3;
    t.state_mut().r[4] = 0; // EQ holds: loop runs CTR times
    assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 3);

    t.state_mut().r[5] = 3;
    t.state_mut().r[4] = 1; // EQ clear: loop exits after one pass
    assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 1);
}

#[test]
fn link_register_written_even_when_branch_not_taken() {
    // bcl updates LR before the predicate is evaluated, so mflr observes
    // the link address on the fallthrough path too.
    let p = prepared(&[
        cmpwi(3, 0),    // BASE
        mflr(6),        // BASE+0x04: save the caller's LR
        bcl(12, 2, 16), // BASE+0x08 -> BASE+0x18; LR := BASE+0x0C
        mflr(3),        // BASE+0x0C
        mtlr(6),        // BASE+0x10
        BLR,            // BASE+0x14
        BLR,            // BASE+0x18: conditional call target
    ]);
    let mut t = p.alloc_thread();
    // Not taken: LR was still written.
    assert_eq!(p.execute_with_arg(&mut t, BASE, 5), (BASE + 0x0C) as u64);
    // Taken: the callee returns to BASE+0x0C and mflr sees the same value.
    assert_eq!(p.execute_with_arg(&mut t, BASE, 0), (BASE + 0x0C) as u64);
}

#[test]
fn call_and_return_round_trip() {
    // main: mflr r6; bl f; mtlr r6; blr    f: addi r3,r3,1; blr
    let p = prepared(&[
        mflr(6),       // BASE
        bl(12),        // BASE+0x4 -> f at BASE+0x10
        mtlr(6),       // BASE+0x8
        BLR,           // BASE+0xC
        addi(3, 3, 1), // BASE+0x10: f
        BLR,
    ]);
    let mut t = p.alloc_thread();
    assert_eq!(p.execute_with_arg(&mut t, BASE, 1), 2);
}

#[test]
fn lr_mismatch_falls_back_to_dispatch() {
    // A loads LR from r4 (pointing at B) and "returns": the fast path
    // misses and dispatch carries control into B instead.
    let p = prepared(&[
        BLR,           // BASE
        bl(12),        // BASE+0x04 -> A (seeds the entry)
        bl(16),        // BASE+0x08 -> B (seeds the entry)
        BLR,           // BASE+0x0C
        mtlr(4),       // BASE+0x10: A
        BLR,           // BASE+0x14
        addi(3, 3, 7), // BASE+0x18: B
        mtlr(5),       // BASE+0x1C
        BLR,           // BASE+0x20
    ]);
    let mut t = p.alloc_thread();
    t.state_mut().r[4] = (BASE + 0x18) as u64;
    t.state_mut().r[5] = RETURN_ADDRESS_SENTINEL;
    assert_eq!(p.execute_with_arg(&mut t, BASE + 0x10, 1), 8);
}

#[test]
fn deep_tail_call_chain_does_not_grow_the_stack() {
    // f and g bounce r3 down to zero with cross-function tail branches.
    // 10,000 alternations complete only if tail calls reuse the frame.
    let p = prepared(&[
        bl(12),         // BASE: seed f
        bl(28),         // BASE+0x04: seed g
        BLR,            // BASE+0x08
        cmpwi(3, 0),    // BASE+0x0C: f
        bc(12, 2, 12),  // BASE+0x10 -> BASE+0x1C
        addi(3, 3, -1), // BASE+0x14
        b(8),           // BASE+0x18 -> g (tail)
        BLR,            // BASE+0x1C
        cmpwi(3, 0),    // BASE+0x20: g
        bc(12, 2, 12),  // BASE+0x24 -> BASE+0x30
        addi(3, 3, -1), // BASE+0x28
        b(-32),         // BASE+0x2C -> f (tail)
        BLR,            // BASE+0x30
    ]);
    let mut t = p.alloc_thread();
    assert_eq!(p.execute_with_arg(&mut t, BASE + 0x0C, 10_000), 0);
}

#[test]
fn trap_conditions_notify_and_resume() {
    // tweq r3,r4
    let p = prepared(&[tw(4, 3, 4), BLR]);
    let mut t = p.alloc_thread();

    t.state_mut().r[4] = 5;
    assert_eq!(p.execute_with_arg(&mut t, BASE, 5), 5);
    let traps = p.take_traps();
    assert_eq!(traps.len(), 1);
    assert_eq!(traps[0].address, BASE);

    t.state_mut().r[4] = 5;
    assert_eq!(p.execute_with_arg(&mut t, BASE, 6), 6);
    assert!(p.take_traps().is_empty());
}

#[test]
fn trap_mask_zero_never_fires() {
    // tw 0,... has no active conditions and is a no-op.
    let p = prepared(&[tw(0, 3, 4), BLR]);
    let mut t = p.alloc_thread();
    t.state_mut().r[4] = 5;
    assert_eq!(p.execute_with_arg(&mut t, BASE, 5), 5);
    assert!(p.take_traps().is_empty());
}

#[test]
fn unconditional_trap_fires_every_time() {
    // tw 31,... traps on any relation.
    let p = prepared(&[tw(31, 3, 4), BLR]);
    let mut t = p.alloc_thread();
    p.execute_with_arg(&mut t, BASE, 0);
    p.execute_with_arg(&mut t, BASE, 1);
    assert_eq!(p.take_traps().len(), 2);
}

#[test]
fn ctr_branch_reaches_local_blocks() {
    // mtctr r4; bctr with r4 selecting one of two local blocks.
    let p = prepared(&[
        mtctr(4),       // BASE
        BCTR,           // BASE+0x04
        addi(3, 0, 11), // BASE+0x08
        BLR,
        addi(3, 0, 22), // BASE+0x10
        BLR,
    ]);
    let mut t = p.alloc_thread();

    t.state_mut().r[4] = (BASE + 0x08) as u64;
    assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 11);

    t.state_mut().r[4] = (BASE + 0x10) as u64;
    assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 22);
}

#[test]
fn on_demand_translation_through_dispatch_thunk() {
    // LR points into the middle of the range at code no analysis pass
    // referenced; the runtime thunk translates it on demand.
    let p = prepared(&[
        mtlr(4),       // BASE
        BLR,           // BASE+0x04
        mtlr(5),       // BASE+0x08: unreferenced
        addi(3, 3, 5), // BASE+0x0C
        BLR,           // BASE+0x10
    ]);
    let mut t = p.alloc_thread();
    t.state_mut().r[4] = (BASE + 0x08) as u64;
    t.state_mut().r[5] = RETURN_ADDRESS_SENTINEL;
    assert_eq!(p.execute_with_arg(&mut t, BASE, 1), 6);
}

#[test]
fn guest_memory_loads_and_stores_are_big_endian() {
    let p = prepared(&[
        lwz(4, 0, 0x2000),
        addi(4, 4, 1),
        stw(4, 0, 0x2004),
        mr(3, 4),
        BLR,
    ]);
    p.memory().write_u32(0x2000, 0x1122_3344).unwrap();
    let mut t = p.alloc_thread();
    assert_eq!(p.execute_with_arg(&mut t, BASE, 0), 0x1122_3345);
    assert_eq!(p.memory().read_u32(0x2004).unwrap(), 0x1122_3345);
}

#[test]
fn unresolved_import_variables_get_the_sentinel() {
    init_logging();
    let memory = Arc::new(GuestMemory::new(0x10_0000).unwrap());
    for (n, word) in [addi(3, 3, 1), BLR].into_iter().enumerate() {
        memory.write_u32(BASE + n as u32 * 4, word).unwrap();
    }

    let mut sdb = ppc2native::sdb::SymbolDatabase::new_raw(memory.clone(), BASE, BASE + 8);
    sdb.declare_variable(0x3000, "KernelVersion");
    sdb.declare_variable(0x3004, "ExLoadedImageName");

    let mut resolver = ExportResolver::new();
    resolver.register_variable("KernelVersion", 0x0200_0000);

    let mut p = Processor::new(memory.clone(), Options::default()).unwrap();
    p.load_database("test", sdb, &resolver).unwrap();

    assert_eq!(memory.read_u32(0x3000).unwrap(), 0x0200_0000);
    assert_eq!(memory.read_u32(0x3004).unwrap(), UNRESOLVED_IMPORT_SENTINEL);
    // Sentinel is stored guest-order (big-endian).
    let raw = unsafe { std::slice::from_raw_parts(memory.base_ptr().add(0x3004), 4) };
    assert_eq!(raw, &[0xDE, 0xAD, 0xBE, 0xEF]);

    let mut t = p.alloc_thread();
    assert_eq!(p.execute_with_arg(&mut t, BASE, 1), 2);
}
