//! Shared helpers for the integration tests: canned CPUs, descriptor-table
//! builders, and code loading.

#![allow(dead_code)]

use halcyon_cpu_core::devices::NullDevices;
use halcyon_cpu_core::state::*;
use halcyon_cpu_core::Cpu;

pub fn cpu_with_ram(size: u32) -> Cpu {
    let mut cpu = Cpu::new(Box::new(NullDevices));
    cpu.init_mem(size);
    cpu.reset();
    cpu
}

/// Point execution at a linear address under the current CS.
pub fn jump_to(cpu: &mut Cpu, addr: u32) {
    cpu.phys_eip = addr.wrapping_sub(cpu.seg_base[CS]);
    cpu.eip_phys_bias = 0;
    // Poison the page-base so the next fetch re-derives through the TLB.
    cpu.last_phys_eip = cpu.phys_eip.wrapping_add(0x1000);
}

/// Drop straight into real mode at `addr` with all segment bases zero.
pub fn enter_real(cpu: &mut Cpu, addr: u32) {
    for s in 0..6 {
        cpu.seg[s] = 0;
        cpu.seg_base[s] = 0;
        cpu.seg_limit[s] = 0xFFFF;
    }
    cpu.esp_mask = 0xFFFF;
    cpu.state_hash = STATE_CODE16 | STATE_ADDR16;
    jump_to(cpu, addr);
}

/// Synthesise a flat 32-bit protected-mode environment: CS=0x08, data
/// segments 0x10, ring 0, no paging.
pub fn enter_flat_protected(cpu: &mut Cpu, eip: u32) {
    cpu.cr[0] |= CR0_PE;
    cpu.seg[CS] = 0x08;
    cpu.seg_base[CS] = 0;
    cpu.seg_limit[CS] = !0;
    cpu.seg_access[CS] = ACCESS_S | ACCESS_EX | ACCESS_RW | ACCESS_P | ACCESS_G | ACCESS_B;
    for s in [ES, SS, DS, FS, GS] {
        cpu.seg[s] = 0x10;
        cpu.seg_base[s] = 0;
        cpu.seg_limit[s] = !0;
        cpu.seg_access[s] = ACCESS_S | ACCESS_RW | ACCESS_P | ACCESS_G | ACCESS_B;
    }
    cpu.cpl = 0;
    cpu.update_cpl_shifts();
    cpu.esp_mask = !0;
    cpu.state_hash = 0;
    jump_to(cpu, eip);
}

pub fn load(cpu: &mut Cpu, addr: u32, bytes: &[u8]) {
    cpu.load_rom(addr, bytes).expect("code fits in RAM");
}

pub fn read_mem32(cpu: &Cpu, addr: u32) -> u32 {
    let a = addr as usize;
    u32::from_le_bytes(cpu.mem[a..a + 4].try_into().unwrap())
}

pub fn read_mem16(cpu: &Cpu, addr: u32) -> u16 {
    let a = addr as usize;
    u16::from_le_bytes(cpu.mem[a..a + 2].try_into().unwrap())
}

pub fn write_mem32(cpu: &mut Cpu, addr: u32, v: u32) {
    let a = addr as usize;
    cpu.mem[a..a + 4].copy_from_slice(&v.to_le_bytes());
}

/// An 8-byte GDT/LDT descriptor from its architectural fields. `access` is
/// the type/DPL/P byte; `flags` the G/B nibble.
pub fn make_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> [u32; 2] {
    let lo = (limit & 0xFFFF) | (base << 16);
    let hi = (base >> 16 & 0xFF)
        | ((access as u32) << 8)
        | (limit & 0xF_0000)
        | ((flags as u32) << 20)
        | (base & 0xFF00_0000);
    [lo, hi]
}

pub fn write_descriptor(cpu: &mut Cpu, table_base: u32, index: u32, desc: [u32; 2]) {
    write_mem32(cpu, table_base + index * 8, desc[0]);
    write_mem32(cpu, table_base + index * 8 + 4, desc[1]);
}

/// A call/interrupt/trap gate descriptor.
pub fn make_gate(selector: u16, offset: u32, type_attr: u8, param_count: u8) -> [u32; 2] {
    let lo = (offset & 0xFFFF) | (selector as u32) << 16;
    let hi = (param_count as u32 & 0x1F) | ((type_attr as u32) << 8) | (offset & 0xFFFF_0000);
    [lo, hi]
}

pub fn write_idt_gate32(
    cpu: &mut Cpu,
    idt_base: u32,
    vector: u32,
    selector: u16,
    offset: u32,
    type_attr: u8,
) {
    let gate = make_gate(selector, offset, type_attr, 0);
    write_mem32(cpu, idt_base + vector * 8, gate[0]);
    write_mem32(cpu, idt_base + vector * 8 + 4, gate[1]);
}

/// Standard flat GDT at `base`: null, ring-0 code (0x08), ring-0 data
/// (0x10), ring-3 code (0x1B), ring-3 data (0x23).
pub fn build_flat_gdt(cpu: &mut Cpu, base: u32) {
    write_descriptor(cpu, base, 0, [0, 0]);
    write_descriptor(cpu, base, 1, make_descriptor(0, 0xFFFFF, 0x9B, 0xC));
    write_descriptor(cpu, base, 2, make_descriptor(0, 0xFFFFF, 0x93, 0xC));
    write_descriptor(cpu, base, 3, make_descriptor(0, 0xFFFFF, 0xFB, 0xC));
    write_descriptor(cpu, base, 4, make_descriptor(0, 0xFFFFF, 0xF3, 0xC));
    cpu.seg_base[SEG_GDTR] = base;
    cpu.seg_limit[SEG_GDTR] = 8 * 16 - 1;
}

/// Run until HLT (or the budget runs out, which fails the test).
pub fn run_until_hlt(cpu: &mut Cpu, budget: i32) {
    cpu.run(budget);
    assert_eq!(
        cpu.exit_reason(),
        halcyon_cpu_core::ExitReason::Hlt,
        "guest did not reach HLT; eip={:08x}",
        cpu.virt_eip()
    );
}
