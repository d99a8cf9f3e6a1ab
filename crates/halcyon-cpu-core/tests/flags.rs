//! Lazy-flag engine behaviour, checked through real instruction sequences
//! and property-tested against direct reference formulas.

mod testkit;

use halcyon_cpu_core::state::*;
use proptest::prelude::*;
use testkit::*;

#[test]
fn reset_reads_back_architectural_eflags() {
    let mut cpu = cpu_with_ram(0x1000);
    cpu.reset();
    assert_eq!(cpu.get_eflags(), 2, "no stale lazy scratch after reset");
}

#[test]
fn add_overflow_sets_expected_flags() {
    let mut cpu = cpu_with_ram(0x10000);
    enter_flat_protected(&mut cpu, 0x1000);
    // add eax, ebx; pushfd; hlt
    load(&mut cpu, 0x1000, &[0x01, 0xD8, 0x9C, 0xF4]);
    cpu.reg32[EAX] = 0x7FFF_FFFF;
    cpu.reg32[EBX] = 1;
    cpu.reg32[ESP] = 0x8000;
    run_until_hlt(&mut cpu, 16);

    assert_eq!(cpu.reg32[EAX], 0x8000_0000);
    let pushed = read_mem32(&cpu, 0x7FFC);
    assert_eq!(pushed & EFLAGS_ZF, 0);
    assert_ne!(pushed & EFLAGS_SF, 0);
    assert_ne!(pushed & EFLAGS_OF, 0);
    assert_eq!(pushed & EFLAGS_CF, 0);
    assert_ne!(pushed & EFLAGS_AF, 0);
    assert_ne!(pushed & EFLAGS_PF, 0);
}

#[test]
fn inc_preserves_carry() {
    let mut cpu = cpu_with_ram(0x10000);
    enter_flat_protected(&mut cpu, 0x1000);
    // stc; inc eax; pushfd; hlt
    load(&mut cpu, 0x1000, &[0xF9, 0x40, 0x9C, 0xF4]);
    cpu.reg32[ESP] = 0x8000;
    run_until_hlt(&mut cpu, 16);
    let pushed = read_mem32(&cpu, 0x7FFC);
    assert_ne!(pushed & EFLAGS_CF, 0, "INC must not clobber CF");
    assert_eq!(cpu.reg32[EAX], 1);
}

#[test]
fn sub_borrow_chain() {
    let mut cpu = cpu_with_ram(0x10000);
    enter_flat_protected(&mut cpu, 0x1000);
    // sub eax, ebx; sbb ecx, edx; hlt
    load(&mut cpu, 0x1000, &[0x29, 0xD8, 0x19, 0xD1, 0xF4]);
    cpu.reg32[EAX] = 0;
    cpu.reg32[EBX] = 1;
    cpu.reg32[ECX] = 5;
    cpu.reg32[EDX] = 2;
    run_until_hlt(&mut cpu, 16);
    assert_eq!(cpu.reg32[EAX], 0xFFFF_FFFF);
    assert_eq!(cpu.reg32[ECX], 2); // 5 - 2 - borrow
}

/// Reference flags for a 32-bit ADD, straight from the architecture.
fn reference_add_flags(a: u32, b: u32) -> (bool, bool, bool, bool, bool, bool) {
    let r = a.wrapping_add(b);
    let cf = (a as u64 + b as u64) > u32::MAX as u64;
    let zf = r == 0;
    let sf = r >> 31 != 0;
    let of = ((a ^ r) & (b ^ r)) >> 31 != 0;
    let af = ((a ^ b ^ r) >> 4) & 1 != 0;
    let pf = (r as u8).count_ones() % 2 == 0;
    (of, sf, zf, af, pf, cf)
}

fn reference_sub_flags(a: u32, b: u32) -> (bool, bool, bool, bool, bool, bool) {
    let r = a.wrapping_sub(b);
    let cf = b > a;
    let zf = r == 0;
    let sf = r >> 31 != 0;
    let of = ((a ^ b) & (a ^ r)) >> 31 != 0;
    let af = ((a ^ b ^ r) >> 4) & 1 != 0;
    let pf = (r as u8).count_ones() % 2 == 0;
    (of, sf, zf, af, pf, cf)
}

fn flags_of(cpu: &halcyon_cpu_core::Cpu) -> (bool, bool, bool, bool, bool, bool) {
    (
        cpu.get_of(),
        cpu.get_sf(),
        cpu.get_zf(),
        cpu.get_af(),
        cpu.get_pf(),
        cpu.get_cf(),
    )
}

proptest! {
    #[test]
    fn lazy_add_matches_reference(a in any::<u32>(), b in any::<u32>()) {
        let mut cpu = cpu_with_ram(0x10000);
        enter_flat_protected(&mut cpu, 0x1000);
        load(&mut cpu, 0x1000, &[0x01, 0xD8, 0xF4]); // add eax, ebx; hlt
        cpu.reg32[EAX] = a;
        cpu.reg32[EBX] = b;
        run_until_hlt(&mut cpu, 8);
        prop_assert_eq!(cpu.reg32[EAX], a.wrapping_add(b));
        prop_assert_eq!(flags_of(&cpu), reference_add_flags(a, b));
    }

    #[test]
    fn lazy_sub_matches_reference(a in any::<u32>(), b in any::<u32>()) {
        let mut cpu = cpu_with_ram(0x10000);
        enter_flat_protected(&mut cpu, 0x1000);
        load(&mut cpu, 0x1000, &[0x29, 0xD8, 0xF4]); // sub eax, ebx; hlt
        cpu.reg32[EAX] = a;
        cpu.reg32[EBX] = b;
        run_until_hlt(&mut cpu, 8);
        prop_assert_eq!(cpu.reg32[EAX], a.wrapping_sub(b));
        prop_assert_eq!(flags_of(&cpu), reference_sub_flags(a, b));
    }

    #[test]
    fn eflags_write_reads_back(bits in any::<u32>()) {
        let mut cpu = cpu_with_ram(0x1000);
        let wanted = (bits & ARITH_FLAG_MASK) | 2;
        cpu.set_eflags(wanted);
        prop_assert_eq!(cpu.get_eflags() & ARITH_FLAG_MASK, wanted & ARITH_FLAG_MASK);
    }
}
