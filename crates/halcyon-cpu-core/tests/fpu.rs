//! x87 behaviour through real instruction streams.

mod testkit;

use halcyon_cpu_core::state::*;
use testkit::*;

fn f64_at(cpu: &halcyon_cpu_core::Cpu, addr: u32) -> f64 {
    let a = addr as usize;
    f64::from_bits(u64::from_le_bytes(cpu.mem[a..a + 8].try_into().unwrap()))
}

fn put_f64(cpu: &mut halcyon_cpu_core::Cpu, addr: u32, v: f64) {
    let a = addr as usize;
    cpu.mem[a..a + 8].copy_from_slice(&v.to_bits().to_le_bytes());
}

#[test]
fn fld_fadd_fstp_roundtrip() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    put_f64(&mut cpu, 0x8000, 1.5);
    put_f64(&mut cpu, 0x8008, 2.25);
    // fld qword [0x8000]; fadd qword [0x8008]; fstp qword [0x8010]; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0xDD, 0x05, 0x00, 0x80, 0x00, 0x00, // fld
            0xDC, 0x05, 0x08, 0x80, 0x00, 0x00, // fadd
            0xDD, 0x1D, 0x10, 0x80, 0x00, 0x00, // fstp
            0xF4,
        ],
    );
    run_until_hlt(&mut cpu, 16);
    assert_eq!(f64_at(&cpu, 0x8010), 3.75);
    // Stack is empty again.
    assert_eq!(cpu.fpu.tag_word, 0xFFFF);
}

#[test]
fn fild_fist_integer_path() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    write_mem32(&mut cpu, 0x8000, (-42i32) as u32);
    // fild dword [0x8000]; fistp dword [0x8004]; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0xDB, 0x05, 0x00, 0x80, 0x00, 0x00, //
            0xDB, 0x1D, 0x04, 0x80, 0x00, 0x00, //
            0xF4,
        ],
    );
    run_until_hlt(&mut cpu, 16);
    assert_eq!(read_mem32(&cpu, 0x8004) as i32, -42);
}

#[test]
fn fdiv_by_zero_masked_gives_infinity() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    put_f64(&mut cpu, 0x8000, 1.0);
    put_f64(&mut cpu, 0x8008, 0.0);
    // fld; fdiv qword [0x8008]; fstp; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0xDD, 0x05, 0x00, 0x80, 0x00, 0x00, //
            0xDC, 0x35, 0x08, 0x80, 0x00, 0x00, //
            0xDD, 0x1D, 0x10, 0x80, 0x00, 0x00, //
            0xF4,
        ],
    );
    run_until_hlt(&mut cpu, 16);
    assert!(f64_at(&cpu, 0x8010).is_infinite());
    assert_ne!(cpu.fpu.status_word & 0x04, 0, "ZE sticky bit set");
    assert_eq!(cpu.fpu.status_word & 0x80, 0, "masked: no summary bit");
}

#[test]
fn unmasked_exception_defers_to_next_fpu_op() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    cpu.cr[0] |= CR0_NE;
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 16, 0x08, 0x2000, 0x8E);
    load(&mut cpu, 0x2000, &[0xF4]); // #MF handler

    put_f64(&mut cpu, 0x8000, 1.0);
    put_f64(&mut cpu, 0x8008, 0.0);
    // fldcw (unmask only ZE); fld; fdiv; fwait raises #MF
    write_mem32(&mut cpu, 0x9000, 0x037B & !0x04); // CW with ZM clear
    load(
        &mut cpu,
        0x1000,
        &[
            0xD9, 0x2D, 0x00, 0x90, 0x00, 0x00, // fldcw [0x9000]
            0xDD, 0x05, 0x00, 0x80, 0x00, 0x00, // fld
            0xDC, 0x35, 0x08, 0x80, 0x00, 0x00, // fdiv (raises unmasked ZE)
            0x9B, // fwait delivers #MF
            0xF4,
        ],
    );
    cpu.reg32[ESP] = 0x7000;
    run_until_hlt(&mut cpu, 32);
    assert_eq!(cpu.virt_eip(), 0x2001, "reached the #MF handler");
    assert_ne!(cpu.fpu.status_word & 0x80, 0, "summary bit latched");
}

#[test]
fn fnstsw_reports_top_of_stack() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    // fld1; fld1; fnstsw ax; hlt
    load(&mut cpu, 0x1000, &[0xD9, 0xE8, 0xD9, 0xE8, 0xDF, 0xE0, 0xF4]);
    run_until_hlt(&mut cpu, 16);
    assert_eq!(cpu.read_reg16(EAX) >> 11 & 7, 6, "FTOP after two pushes");
}

#[test]
fn fcom_sets_condition_codes() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    put_f64(&mut cpu, 0x8000, 2.0);
    put_f64(&mut cpu, 0x8008, 3.0);
    // fld [0x8000]; fcom qword [0x8008]; fnstsw ax; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0xDD, 0x05, 0x00, 0x80, 0x00, 0x00, //
            0xDC, 0x15, 0x08, 0x80, 0x00, 0x00, //
            0xDF, 0xE0, //
            0xF4,
        ],
    );
    run_until_hlt(&mut cpu, 16);
    let sw = cpu.read_reg16(EAX);
    assert_ne!(sw & (1 << 8), 0, "C0 set: ST0 < operand");
    assert_eq!(sw & (1 << 14), 0, "C3 clear");
}

#[test]
fn fxsave_fxrstor_roundtrip_is_exact() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_flat_protected(&mut cpu, 0x1000);
    cpu.cr[4] |= CR4_OSFXSR;
    put_f64(&mut cpu, 0x8000, core::f64::consts::PI);
    // fld qword; fxsave [0x9000]; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0xDD, 0x05, 0x00, 0x80, 0x00, 0x00, //
            0x0F, 0xAE, 0x05, 0x00, 0x90, 0x00, 0x00, // fxsave [0x9000]
            0xF4,
        ],
    );
    cpu.xmm32[4] = 0xDEAD_BEEF; // xmm1 low dword
    run_until_hlt(&mut cpu, 16);

    let saved_st0 = cpu.fpu.get_st(0);
    let saved_sw = cpu.fpu.get_status_word();

    // Scramble, then restore.
    cpu.clear_halt();
    cpu.fpu.set_st(0, halcyon_softfloat::Float80::ZERO);
    cpu.xmm32[4] = 0;
    cpu.mxcsr = 0x1F80;
    enter_flat_protected(&mut cpu, 0x2000);
    load(&mut cpu, 0x2000, &[0x0F, 0xAE, 0x0D, 0x00, 0x90, 0x00, 0x00, 0xF4]);
    run_until_hlt(&mut cpu, 16);

    assert_eq!(cpu.fpu.get_st(0), saved_st0);
    assert_eq!(cpu.fpu.get_status_word(), saved_sw);
    assert_eq!(cpu.xmm32[4], 0xDEAD_BEEF);
}

#[test]
fn fsqrt_and_constants() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    put_f64(&mut cpu, 0x8000, 9.0);
    // fld qword; fsqrt; fstp qword [0x8008]; fldpi; fstp qword [0x8010]; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0xDD, 0x05, 0x00, 0x80, 0x00, 0x00, //
            0xD9, 0xFA, //
            0xDD, 0x1D, 0x08, 0x80, 0x00, 0x00, //
            0xD9, 0xEB, //
            0xDD, 0x1D, 0x10, 0x80, 0x00, 0x00, //
            0xF4,
        ],
    );
    run_until_hlt(&mut cpu, 32);
    assert_eq!(f64_at(&cpu, 0x8008), 3.0);
    assert!((f64_at(&cpu, 0x8010) - core::f64::consts::PI).abs() < 1e-15);
}

#[test]
fn em_bit_raises_nm() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    cpu.cr[0] |= CR0_EM;
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 7, 0x08, 0x2000, 0x8E);
    load(&mut cpu, 0x2000, &[0xF4]);
    load(&mut cpu, 0x1000, &[0xD9, 0xE8, 0xF4]); // fld1
    cpu.reg32[ESP] = 0x7000;
    run_until_hlt(&mut cpu, 16);
    assert_eq!(cpu.virt_eip(), 0x2001, "#NM handler entered");
}
