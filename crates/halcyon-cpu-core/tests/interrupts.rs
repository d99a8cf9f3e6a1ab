//! Interrupt delivery and IRET across privilege and mode changes.

mod testkit;

use halcyon_cpu_core::state::*;
use halcyon_cpu_core::IntKind;
use testkit::*;

#[test]
fn int_real_mode_uses_ivt_and_pushes_frame() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_real(&mut cpu, 0x500);

    // IVT[0x10] = 2222:1111
    write_mem32(&mut cpu, 0x10 * 4, 0x2222_1111);
    cpu.seg[SS] = 0x2000;
    cpu.seg_base[SS] = 0x2000 << 4;
    cpu.reg32[ESP] = 0xFFFE;
    cpu.set_eflags(0x202);

    cpu.interrupt(0x10, None, IntKind::Software, 0x5678).unwrap();

    assert_eq!(cpu.seg[CS], 0x2222);
    assert_eq!(cpu.virt_eip(), 0x1111);
    assert_eq!(cpu.reg32[ESP] as u16, 0xFFF8);
    assert_eq!(cpu.eflags & EFLAGS_IF, 0);

    let stack = (0x2000u32 << 4) + 0xFFF8;
    assert_eq!(read_mem16(&cpu, stack), 0x5678); // IP
    assert_eq!(read_mem16(&cpu, stack + 2), 0x0000); // CS
    assert_eq!(read_mem16(&cpu, stack + 4), 0x0202); // FLAGS
}

#[test]
fn int_protected_same_ring_pushes_eflags_cs_eip() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 0x80, 0x08, 0x2000, 0x8E);
    cpu.reg32[ESP] = 0x1000;
    cpu.set_eflags(0x202);

    cpu.interrupt(0x80, None, IntKind::Software, 0x1234).unwrap();

    assert_eq!(cpu.virt_eip(), 0x2000);
    assert_eq!(cpu.reg32[ESP], 0x0FF4);
    assert_eq!(cpu.eflags & EFLAGS_IF, 0, "interrupt gate clears IF");
    assert_eq!(read_mem32(&cpu, 0x0FF4), 0x1234); // EIP
    assert_eq!(read_mem32(&cpu, 0x0FF8), 0x08); // CS
    assert_eq!(read_mem32(&cpu, 0x0FFC), 0x202); // EFLAGS
}

#[test]
fn trap_gate_leaves_if_alone() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 0x80, 0x08, 0x2000, 0x8F); // trap gate
    cpu.reg32[ESP] = 0x1000;
    cpu.set_eflags(0x202);

    cpu.interrupt(0x80, None, IntKind::Software, 0x1234).unwrap();
    assert_ne!(cpu.eflags & EFLAGS_IF, 0);
}

/// Ring 3 to ring 0 through an interrupt gate, with the stack switched from
/// the TSS, then IRET back out.
#[test]
fn ring_change_interrupt_and_iret_roundtrip() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_flat_protected(&mut cpu, 0x1000);
    build_flat_gdt(&mut cpu, 0x3000);
    // 32-bit TSS at 0x5000 with ring-0 stack 0x10:0x9000.
    write_descriptor(
        &mut cpu,
        0x3000,
        5,
        make_descriptor(0x5000, 0x67, 0x89, 0x0),
    );
    write_mem32(&mut cpu, 0x5004, 0x9000); // ESP0
    write_mem32(&mut cpu, 0x5008, 0x10); // SS0
    cpu.seg[SEG_TR] = 0x28;
    cpu.seg_base[SEG_TR] = 0x5000;
    cpu.seg_limit[SEG_TR] = 0x67;
    cpu.seg_access[SEG_TR] = 0x89;

    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 0x80, 0x08, 0x2000, 0xEE); // DPL 3

    // Drop to ring 3.
    cpu.seg[CS] = 0x1B;
    cpu.seg_access[CS] = 0xFB | ((0xC_u32) << 12);
    cpu.seg[SS] = 0x23;
    cpu.seg_access[SS] = 0xF3 | ((0xC_u32) << 12);
    cpu.cpl = 3;
    cpu.update_cpl_shifts();
    cpu.reg32[ESP] = 0x7000;
    cpu.set_eflags(0x202);

    cpu.interrupt(0x80, None, IntKind::Software, 0x1234).unwrap();

    assert_eq!(cpu.cpl, 0);
    assert_eq!(cpu.seg[CS] & !3, 0x08);
    assert_eq!(cpu.seg[SS] & !3, 0x10);
    assert_eq!(cpu.reg32[ESP], 0x9000 - 20);
    // New stack from the top: SS, ESP, EFLAGS, CS, EIP.
    assert_eq!(read_mem32(&cpu, 0x9000 - 4), 0x23);
    assert_eq!(read_mem32(&cpu, 0x9000 - 8), 0x7000);
    assert_eq!(read_mem32(&cpu, 0x9000 - 12), 0x202);
    assert_eq!(read_mem32(&cpu, 0x9000 - 16), 0x1B);
    assert_eq!(read_mem32(&cpu, 0x9000 - 20), 0x1234);

    // And back.
    cpu.iret(0, true).unwrap();
    assert_eq!(cpu.cpl, 3);
    assert_eq!(cpu.seg[CS], 0x1B);
    assert_eq!(cpu.seg[SS], 0x23);
    assert_eq!(cpu.reg32[ESP], 0x7000);
    assert_eq!(cpu.virt_eip(), 0x1234);
    assert_ne!(cpu.eflags & EFLAGS_IF, 0);
}

/// IRET32 from ring 0 with VM set in the on-stack EFLAGS enters V8086
/// with the segment quartet reloaded real-style.
#[test]
fn iret_from_ring0_to_v8086() {
    let mut cpu = cpu_with_ram(0x40000);
    enter_flat_protected(&mut cpu, 0x1000);
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.reg32[ESP] = 0x8000 - 36;
    // Stack image: EIP, CS, EFLAGS(VM), ESP, SS, ES, DS, FS, GS.
    let base = 0x8000 - 36;
    for (n, v) in [
        0x0100u32, // EIP
        0x2345,    // CS
        0x0202 | EFLAGS_VM,
        0xFF00, // ESP
        0x3000, // SS
        0x4000, // ES
        0x5000, // DS
        0x6000, // FS
        0x7000, // GS
    ]
    .iter()
    .enumerate()
    {
        write_mem32(&mut cpu, base + n as u32 * 4, *v);
    }

    cpu.iret(0, true).unwrap();

    assert_ne!(cpu.eflags & EFLAGS_VM, 0);
    assert_eq!(cpu.cpl, 3);
    assert_eq!(cpu.seg[CS], 0x2345);
    assert_eq!(cpu.seg_base[CS], 0x2345 << 4);
    assert_eq!(cpu.seg_limit[CS], 0xFFFF);
    assert_eq!(cpu.seg[DS], 0x5000);
    assert_eq!(cpu.seg_base[GS], 0x7000 << 4);
    assert_eq!(cpu.reg32[ESP], 0xFF00);
    assert_eq!(cpu.virt_eip(), 0x0100);
}

#[test]
fn hardware_interrupt_wakes_halted_cpu() {
    struct IrqDevices {
        vector: u8,
    }
    impl halcyon_cpu_core::Devices for IrqDevices {
        fn io_read8(&mut self, _p: u32) -> u8 {
            0xFF
        }
        fn io_read16(&mut self, _p: u32) -> u16 {
            0xFFFF
        }
        fn io_read32(&mut self, _p: u32) -> u32 {
            !0
        }
        fn io_write8(&mut self, _p: u32, _d: u8) {}
        fn io_write16(&mut self, _p: u32, _d: u16) {}
        fn io_write32(&mut self, _p: u32, _d: u32) {}
        fn mmio_read(&mut self, _p: u32, _s: halcyon_cpu_core::MmioSize) -> u32 {
            !0
        }
        fn mmio_write(&mut self, _p: u32, _d: u32, _s: halcyon_cpu_core::MmioSize) {}
        fn pic_get_interrupt(&mut self) -> u8 {
            self.vector
        }
        fn pic_raise_irq(&mut self, _irq: u8) {}
        fn pic_lower_irq(&mut self, _irq: u8) {}
        fn apic_is_enabled(&self) -> bool {
            false
        }
    }

    let mut cpu = halcyon_cpu_core::Cpu::new(Box::new(IrqDevices { vector: 0x20 }));
    cpu.init_mem(0x20000);
    cpu.reset();
    enter_flat_protected(&mut cpu, 0x1000);
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 0x20, 0x08, 0x2000, 0x8E);
    // Handler: hlt again (so the test can observe delivery happened).
    load(&mut cpu, 0x2000, &[0xF4]);
    // sti; hlt
    load(&mut cpu, 0x1000, &[0xFB, 0xF4]);
    cpu.reg32[ESP] = 0x8000;

    cpu.run(16);
    assert_eq!(cpu.exit_reason(), halcyon_cpu_core::ExitReason::Hlt);

    // Latch the line; the next slice must deliver and enter the handler.
    cpu.raise_intr_line();
    cpu.run(16);
    assert_eq!(cpu.virt_eip(), 0x2001, "handler ran to its HLT");
    assert_eq!(read_mem32(&cpu, 0x8000 - 12), 0x1002, "return EIP after HLT");
}
