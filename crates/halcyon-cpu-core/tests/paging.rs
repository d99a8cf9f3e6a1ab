//! Paging and TLB behaviour: walks, permission faults, accessed/dirty
//! bits, flush policies, and the NX taint on instruction fetch.

mod testkit;

use halcyon_cpu_core::state::*;
use testkit::*;

const PTE_P: u32 = 1;
const PTE_RW: u32 = 2;
const PTE_US: u32 = 4;
const PTE_A: u32 = 0x20;
const PTE_D: u32 = 0x40;

/// One page directory at 0x1000, one page table at 0x2000, mapping the
/// first 4 MiB identity.
fn setup_identity_paging(cpu: &mut halcyon_cpu_core::Cpu, flags: u32) {
    write_mem32(cpu, 0x1000, 0x2000 | flags);
    for n in 0..1024u32 {
        write_mem32(cpu, 0x2000 + n * 4, (n << 12) | flags);
    }
    cpu.cr[3] = 0x1000;
    cpu.set_cr(0, cpu.cr[0] | CR0_PG | CR0_PE);
}

#[test]
fn identity_mapping_reads_through() {
    let mut cpu = cpu_with_ram(0x40_0000);
    enter_flat_protected(&mut cpu, 0x5000);
    setup_identity_paging(&mut cpu, PTE_P | PTE_RW | PTE_US);
    // mov eax, [0x9000]; hlt
    load(&mut cpu, 0x5000, &[0xA1, 0x00, 0x90, 0x00, 0x00, 0xF4]);
    write_mem32(&mut cpu, 0x9000, 0xDEAD_BEEF);
    run_until_hlt(&mut cpu, 8);
    assert_eq!(cpu.reg32[EAX], 0xDEAD_BEEF);
}

#[test]
fn translate_twice_reuses_tlb_entry() {
    let mut cpu = cpu_with_ram(0x40_0000);
    enter_flat_protected(&mut cpu, 0x5000);
    setup_identity_paging(&mut cpu, PTE_P | PTE_RW | PTE_US);
    load(&mut cpu, 0x5000, &[0xF4]);
    run_until_hlt(&mut cpu, 4);

    write_mem32(&mut cpu, 0x9000, 0x1234_5678);
    assert_eq!(cpu.read32(0x9000, TLB_SYSTEM_READ).unwrap(), 0x1234_5678);
    // Clobbering the PTE must not be observed until a flush: the second
    // access rides the cached translation.
    write_mem32(&mut cpu, 0x2000 + 9 * 4, 0);
    assert_eq!(cpu.read32(0x9000, TLB_SYSTEM_READ).unwrap(), 0x1234_5678);
}

#[test]
fn cr3_write_forces_refetch_of_pde() {
    let mut cpu = cpu_with_ram(0x40_0000);
    enter_flat_protected(&mut cpu, 0x5000);
    setup_identity_paging(&mut cpu, PTE_P | PTE_RW | PTE_US);
    load(&mut cpu, 0x5000, &[0xF4]);
    run_until_hlt(&mut cpu, 4);

    write_mem32(&mut cpu, 0x9000, 0xAAAA_0001);
    write_mem32(&mut cpu, 0x20000, 0xBBBB_0002);
    assert_eq!(cpu.read32(0x9000, TLB_SYSTEM_READ).unwrap(), 0xAAAA_0001);
    // Remap page 9 to physical 0x20000, then reload CR3.
    write_mem32(&mut cpu, 0x2000 + 9 * 4, 0x20000 | PTE_P | PTE_RW | PTE_US);
    cpu.set_cr(3, 0x1000);
    assert_eq!(
        cpu.read32(0x9000, TLB_SYSTEM_READ).unwrap(),
        0xBBBB_0002,
        "post-CR3 access must walk the tables again"
    );
}

#[test]
fn user_write_to_supervisor_page_faults_with_error_code() {
    let mut cpu = cpu_with_ram(0x40_0000);
    enter_flat_protected(&mut cpu, 0x5000);
    setup_identity_paging(&mut cpu, PTE_P | PTE_RW); // no user bit
    build_flat_gdt(&mut cpu, 0x3000);
    // A #PF handler that just halts.
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 14, 0x08, 0x6000, 0x8E);
    load(&mut cpu, 0x6000, &[0xF4]);
    cpu.reg32[ESP] = 0x8000;

    // User-kind write via the access layer.
    let r = cpu.write32(0x9000, 1, TLB_USER_WRITE);
    assert!(r.is_err(), "user write must fault");
    assert_eq!(cpu.cr[2], 0x9000);
    // Error code on top of the handler frame: present | write | user.
    assert_eq!(read_mem32(&cpu, cpu.reg32[ESP]), 0b111);
}

#[test]
fn accessed_and_dirty_bits_are_written_back() {
    let mut cpu = cpu_with_ram(0x40_0000);
    enter_flat_protected(&mut cpu, 0x5000);
    setup_identity_paging(&mut cpu, PTE_P | PTE_RW | PTE_US);
    load(&mut cpu, 0x5000, &[0xF4]);
    run_until_hlt(&mut cpu, 4);

    cpu.write32(0x9000, 5, TLB_SYSTEM_WRITE).unwrap();
    let pde = read_mem32(&cpu, 0x1000);
    let pte = read_mem32(&cpu, 0x2000 + 9 * 4);
    assert_ne!(pde & PTE_A, 0);
    assert_ne!(pte & PTE_A, 0);
    assert_ne!(pte & PTE_D, 0);
}

#[test]
fn wp_gates_supervisor_writes_to_readonly_pages() {
    let mut cpu = cpu_with_ram(0x40_0000);
    enter_flat_protected(&mut cpu, 0x5000);
    setup_identity_paging(&mut cpu, PTE_P | PTE_US); // read-only
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 14, 0x08, 0x6000, 0x8E);
    load(&mut cpu, 0x6000, &[0xF4]);

    // Without WP a supervisor write sails through.
    assert!(cpu.write32(0x9000, 1, TLB_SYSTEM_WRITE).is_ok());

    cpu.mmu_tlb_flush();
    cpu.set_cr(0, cpu.cr[0] | CR0_WP);
    assert!(cpu.write32(0xA000, 1, TLB_SYSTEM_WRITE).is_err());
}

#[test]
fn split_access_faults_on_second_page() {
    let mut cpu = cpu_with_ram(0x40_0000);
    enter_flat_protected(&mut cpu, 0x5000);
    setup_identity_paging(&mut cpu, PTE_P | PTE_RW | PTE_US);
    // Page 0xA is absent.
    write_mem32(&mut cpu, 0x2000 + 0xA * 4, 0);
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 14, 0x08, 0x6000, 0x8E);
    load(&mut cpu, 0x6000, &[0xF4]);

    cpu.reg32[ESP] = 0x8000;
    let r = cpu.read32(0x9FFE, TLB_SYSTEM_READ);
    assert!(r.is_err(), "straddling read must fault on the absent page");
    assert_eq!(cpu.cr[2], 0xA000, "CR2 reports the faulting half");
}

#[test]
fn nx_taint_faults_instruction_fetch() {
    let mut cpu = cpu_with_ram(0x40_0000);
    enter_flat_protected(&mut cpu, 0x5000);
    setup_identity_paging(&mut cpu, PTE_P | PTE_RW | PTE_US);
    build_flat_gdt(&mut cpu, 0x3000);
    cpu.seg_base[SEG_IDTR] = 0x4000;
    cpu.seg_limit[SEG_IDTR] = 0x7FF;
    write_idt_gate32(&mut cpu, 0x4000, 14, 0x08, 0x6000, 0x8E);
    // Handler records EAX then halts.
    load(&mut cpu, 0x6000, &[0xF4]);
    // Code at 0x9000 would be a NOP sled.
    load(&mut cpu, 0x9000, &[0x90, 0xF4]);

    cpu.reg32[ESP] = 0x8000;
    // Prime the mapping, then taint it non-executable.
    cpu.mmu_translate(0x9000, TLB_SYSTEM_READ).unwrap();
    cpu.tlb_set_nx(0x9000);

    jump_to(&mut cpu, 0x9000);
    cpu.run(8);
    // The fetch must have faulted into the handler with CR2 = 0x9000 and
    // the present+fetch error code.
    assert_eq!(cpu.cr[2], 0x9000);
    assert_eq!(cpu.exit_reason(), halcyon_cpu_core::ExitReason::Hlt);
    let err = read_mem32(&cpu, cpu.reg32[ESP]);
    assert_eq!(err & 1, 1, "page was present");
    assert_ne!(err & 0x10, 0, "instruction-fetch bit set");
}

#[test]
fn a20_masking_wraps_high_addresses() {
    let mut cpu = cpu_with_ram(0x20_0000);
    enter_real(&mut cpu, 0x500);
    cpu.set_a20(false);
    write_mem32(&mut cpu, 0x0_0500, 0x1111_2222);
    // With A20 off, 0x10_0500 aliases 0x0_0500.
    let v = cpu.read32(0x10_0500, TLB_SYSTEM_READ).unwrap();
    assert_eq!(v, 0x1111_2222);
    cpu.set_a20(true);
    write_mem32(&mut cpu, 0x10_0500, 0x3333_4444);
    let v = cpu.read32(0x10_0500, TLB_SYSTEM_READ).unwrap();
    assert_eq!(v, 0x3333_4444);
}
