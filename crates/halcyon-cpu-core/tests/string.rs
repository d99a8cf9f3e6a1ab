//! String-instruction semantics, REP forms included.

mod testkit;

use halcyon_cpu_core::state::*;
use testkit::*;

/// REP MOVSB with DF=1 in 16-bit addressing copies backwards and leaves
/// SI/DI one step past the first byte.
#[test]
fn rep_movsb_backwards() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_real(&mut cpu, 0x500);
    // Source bytes 01..05, the last one at DS:SI.
    load(&mut cpu, 0x2000, &[0x01, 0x02, 0x03, 0x04, 0x05]);

    // std; rep movsb; hlt
    load(&mut cpu, 0x500, &[0xFD, 0xF3, 0xA4, 0xF4]);
    cpu.write_reg16(ECX, 5);
    cpu.write_reg16(ESI, 0x2004);
    cpu.write_reg16(EDI, 0x3004);
    run_until_hlt(&mut cpu, 32);

    assert_eq!(&cpu.mem[0x3000..0x3005], &[0x01, 0x02, 0x03, 0x04, 0x05]);
    assert_eq!(cpu.read_reg16(ECX), 0);
    assert_eq!(cpu.read_reg16(ESI), 0x1FFF);
    assert_eq!(cpu.read_reg16(EDI), 0x2FFF);
}

#[test]
fn rep_stosd_fills_forward() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_flat_protected(&mut cpu, 0x500);
    // cld; rep stosd; hlt
    load(&mut cpu, 0x500, &[0xFC, 0xF3, 0xAB, 0xF4]);
    cpu.reg32[EAX] = 0xCAFE_BABE;
    cpu.reg32[ECX] = 4;
    cpu.reg32[EDI] = 0x8000;
    run_until_hlt(&mut cpu, 32);
    for n in 0..4 {
        assert_eq!(read_mem32(&cpu, 0x8000 + n * 4), 0xCAFE_BABE);
    }
    assert_eq!(cpu.reg32[ECX], 0);
    assert_eq!(cpu.reg32[EDI], 0x8010);
}

#[test]
fn repne_scasb_stops_on_match() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_flat_protected(&mut cpu, 0x500);
    load(&mut cpu, 0x8000, b"haystack!\0");
    // cld; repne scasb; hlt: find the '!'.
    load(&mut cpu, 0x500, &[0xFC, 0xF2, 0xAE, 0xF4]);
    cpu.write_reg8(EAX, b'!');
    cpu.reg32[ECX] = 32;
    cpu.reg32[EDI] = 0x8000;
    run_until_hlt(&mut cpu, 64);
    assert_eq!(cpu.reg32[EDI], 0x8009, "EDI one past the match");
    assert_eq!(cpu.reg32[ECX], 32 - 9);
    assert!(cpu.get_zf());
}

#[test]
fn repe_cmpsb_finds_difference() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_flat_protected(&mut cpu, 0x500);
    load(&mut cpu, 0x8000, b"abcdX");
    load(&mut cpu, 0x9000, b"abcdY");
    // cld; repe cmpsb; hlt
    load(&mut cpu, 0x500, &[0xFC, 0xF3, 0xA6, 0xF4]);
    cpu.reg32[ECX] = 8;
    cpu.reg32[ESI] = 0x8000;
    cpu.reg32[EDI] = 0x9000;
    run_until_hlt(&mut cpu, 64);
    assert_eq!(cpu.reg32[ESI], 0x8005);
    assert!(!cpu.get_zf());
    assert!(cpu.get_cf(), "X < Y leaves CF set");
}

#[test]
fn lodsw_with_segment_override() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_real(&mut cpu, 0x500);
    cpu.seg[ES] = 0x800;
    cpu.seg_base[ES] = 0x8000;
    load(&mut cpu, 0x8000 + 0x10, &[0x34, 0x12]);
    // es: lodsw; hlt (operand size 16 in real mode)
    load(&mut cpu, 0x500, &[0x26, 0xAD, 0xF4]);
    cpu.write_reg16(ESI, 0x10);
    run_until_hlt(&mut cpu, 8);
    assert_eq!(cpu.read_reg16(EAX), 0x1234);
    assert_eq!(cpu.read_reg16(ESI), 0x12);
}
