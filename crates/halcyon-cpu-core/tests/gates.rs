//! Far transfers through descriptors: call gates with parameter copy,
//! far returns, and task switches.

mod testkit;

use halcyon_cpu_core::state::*;
use testkit::*;

/// Ring 3 calls through a call gate with a two-dword parameter copy into
/// ring 0, landing on the TSS-supplied stack.
#[test]
fn call_gate_copies_parameters_across_rings() {
    let mut cpu = cpu_with_ram(0x80_0000);
    enter_flat_protected(&mut cpu, 0x1000);
    build_flat_gdt(&mut cpu, 0x3000);
    // Entry 1 (selector 0x08) becomes the call gate; move ring-0 code to
    // entry 2 (0x10) and keep ring-0 data at entry 6 (0x30).
    write_descriptor(&mut cpu, 0x3000, 1, make_gate(0x10, 0x40_0000, 0xEC, 2));
    write_descriptor(&mut cpu, 0x3000, 2, make_descriptor(0, 0xFFFFF, 0x9B, 0xC));
    write_descriptor(&mut cpu, 0x3000, 6, make_descriptor(0, 0xFFFFF, 0x93, 0xC));

    // TSS: ring-0 stack = 0x30:0x20000.
    write_descriptor(&mut cpu, 0x3000, 5, make_descriptor(0x5000, 0x67, 0x89, 0));
    write_mem32(&mut cpu, 0x5004, 0x2_0000); // ESP0
    write_mem32(&mut cpu, 0x5008, 0x30); // SS0
    cpu.seg[SEG_TR] = 0x28;
    cpu.seg_base[SEG_TR] = 0x5000;
    cpu.seg_limit[SEG_TR] = 0x67;
    cpu.seg_access[SEG_TR] = 0x89;

    // Ring 3 caller with the two parameters on its stack.
    cpu.seg[CS] = 0x1B;
    cpu.seg_access[CS] = 0xFB | (0xC << 12);
    cpu.seg[SS] = 0x23;
    cpu.seg_access[SS] = 0xF3 | (0xC << 12);
    cpu.cpl = 3;
    cpu.update_cpl_shifts();
    // Caller pushed 0xAAAA then 0xBBBB: the later push sits at the lower
    // address.
    cpu.reg32[ESP] = 0xFFF0;
    write_mem32(&mut cpu, 0xFFF0, 0xBBBB);
    write_mem32(&mut cpu, 0xFFF4, 0xAAAA);

    // Target code: hlt (privileged, and we arrive at ring 0).
    load(&mut cpu, 0x40_0000, &[0xF4]);
    // Caller: call far 0x08:0 (the offset is ignored for call gates).
    load(
        &mut cpu,
        0x1000,
        &[0x9A, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00],
    );
    jump_to(&mut cpu, 0x1000);
    run_until_hlt(&mut cpu, 8);

    assert_eq!(cpu.cpl, 0);
    assert_eq!(cpu.seg[CS], 0x10);
    assert_eq!(cpu.seg[SS] & !3, 0x30);
    // New stack, top down: old SS, old ESP, params, old CS, return EIP.
    assert_eq!(read_mem32(&cpu, 0x2_0000 - 4), 0x23);
    assert_eq!(read_mem32(&cpu, 0x2_0000 - 8), 0xFFF0);
    assert_eq!(read_mem32(&cpu, 0x2_0000 - 12), 0xAAAA);
    assert_eq!(read_mem32(&cpu, 0x2_0000 - 16), 0xBBBB);
    assert_eq!(read_mem32(&cpu, 0x2_0000 - 20), 0x1B);
    assert_eq!(read_mem32(&cpu, 0x2_0000 - 24), 0x1007);
    assert_eq!(cpu.reg32[ESP], 0x2_0000 - 24);
}

#[test]
fn far_call_and_retf_same_ring() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.reg32[ESP] = 0x8000;

    // call far 0x08:0x2000 ... target: retf; then hlt back home.
    load(
        &mut cpu,
        0x1000,
        &[0x9A, 0x00, 0x20, 0x00, 0x00, 0x08, 0x00, 0xF4],
    );
    load(&mut cpu, 0x2000, &[0xCB]);
    jump_to(&mut cpu, 0x1000);
    run_until_hlt(&mut cpu, 16);

    assert_eq!(cpu.virt_eip(), 0x1008);
    assert_eq!(cpu.reg32[ESP], 0x8000, "stack balanced after retf");
}

#[test]
fn jmpf_real_mode_sets_base() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_real(&mut cpu, 0x500);
    // jmp far 0x2000:0x0010
    load(&mut cpu, 0x500, &[0xEA, 0x10, 0x00, 0x00, 0x20]);
    load(&mut cpu, 0x2_0010, &[0xF4]);
    cpu.run(8);
    assert_eq!(cpu.seg[CS], 0x2000);
    assert_eq!(cpu.seg_base[CS], 0x2_0000);
    assert_eq!(cpu.virt_eip(), 0x11);
}

/// Full 32-bit task switch through a TSS descriptor: registers and
/// segments come from the incoming image, the outgoing image is written
/// back, and the back-link/busy bits behave per kind.
#[test]
fn task_switch_via_call_loads_incoming_state() {
    let mut cpu = cpu_with_ram(0x80_0000);
    enter_flat_protected(&mut cpu, 0x1000);
    build_flat_gdt(&mut cpu, 0x3000);

    // Current TSS (selector 0x28) and target TSS (selector 0x2D... entry 6).
    write_descriptor(&mut cpu, 0x3000, 5, make_descriptor(0x5000, 0x67, 0x89, 0));
    write_descriptor(&mut cpu, 0x3000, 6, make_descriptor(0x6000, 0x67, 0x89, 0));
    cpu.seg[SEG_TR] = 0x28;
    cpu.seg_base[SEG_TR] = 0x5000;
    cpu.seg_limit[SEG_TR] = 0x67;
    cpu.seg_access[SEG_TR] = 0x8B;

    // Incoming image at 0x6000: EIP 0x2000, flat segments, EAX marker.
    write_mem32(&mut cpu, 0x6000 + 0x20, 0x2000); // EIP
    write_mem32(&mut cpu, 0x6000 + 0x24, 0x2); // EFLAGS
    write_mem32(&mut cpu, 0x6000 + 0x28, 0x1234_5678); // EAX
    write_mem32(&mut cpu, 0x6000 + 0x38, 0x9000); // ESP
    write_mem32(&mut cpu, 0x6000 + 0x48, 0x10); // ES
    write_mem32(&mut cpu, 0x6000 + 0x4C, 0x08); // CS
    write_mem32(&mut cpu, 0x6000 + 0x50, 0x10); // SS
    write_mem32(&mut cpu, 0x6000 + 0x54, 0x10); // DS
    write_mem32(&mut cpu, 0x6000 + 0x58, 0); // FS
    write_mem32(&mut cpu, 0x6000 + 0x5C, 0); // GS
    write_mem32(&mut cpu, 0x6000 + 0x60, 0); // LDT

    load(&mut cpu, 0x2000, &[0xF4]);
    // call far 0x30:0, where selector 0x30 is the target TSS.
    load(&mut cpu, 0x1000, &[0x9A, 0x00, 0x00, 0x00, 0x00, 0x30, 0x00]);
    cpu.reg32[ESP] = 0x8000;
    cpu.reg32[EAX] = 0xAAAA_AAAA;
    jump_to(&mut cpu, 0x1000);
    run_until_hlt(&mut cpu, 8);

    assert_eq!(cpu.seg[SEG_TR], 0x30);
    assert_eq!(cpu.reg32[EAX], 0x1234_5678);
    assert_eq!(cpu.virt_eip(), 0x2001);
    assert_ne!(cpu.eflags & EFLAGS_NT, 0, "CALL-style switch sets NT");
    assert_ne!(cpu.cr[0] & CR0_TS, 0);
    // The outgoing EAX was written back to the old TSS image.
    assert_eq!(read_mem32(&cpu, 0x5000 + 0x28), 0xAAAA_AAAA);
    // Back link in the new TSS names the old task.
    assert_eq!(read_mem16(&cpu, 0x6000), 0x28);
    // Old EIP written back points past the far call.
    assert_eq!(read_mem32(&cpu, 0x5000 + 0x20), 0x1007);
}
