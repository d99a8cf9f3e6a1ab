//! Snapshot round-trips: a restored CPU must continue exactly where the
//! original would have.

mod testkit;

use halcyon_cpu_core::devices::NullDevices;
use halcyon_cpu_core::state::*;
use halcyon_cpu_core::Cpu;
use testkit::*;

#[test]
fn snapshot_roundtrip_produces_identical_execution() {
    let mut cpu = cpu_with_ram(0x20000);
    enter_flat_protected(&mut cpu, 0x1000);
    // Phase 1 seeds state; phase 2 (after the snapshot point) consumes it.
    //   mov eax, 7; add eax, eax; hlt   ...then later:  inc eax; hlt
    load(
        &mut cpu,
        0x1000,
        &[0xB8, 0x07, 0x00, 0x00, 0x00, 0x01, 0xC0, 0xF4, 0x40, 0xF4],
    );
    cpu.reg32[ESP] = 0x8000;
    run_until_hlt(&mut cpu, 16);
    assert_eq!(cpu.reg32[EAX], 14);

    let snap = cpu.save_state();

    // Continue on the original.
    cpu.clear_halt();
    cpu.run(16);
    let final_eax = cpu.reg32[EAX];
    let final_flags = cpu.get_eflags();

    // Restore into a fresh CPU and continue identically.
    let mut other = Cpu::new(Box::new(NullDevices));
    other.init_mem(0x20000);
    other.reset();
    other.restore_state(&snap).unwrap();
    assert_eq!(other.reg32[EAX], 14);
    other.clear_halt();
    other.run(16);
    assert_eq!(other.reg32[EAX], final_eax);
    assert_eq!(other.get_eflags(), final_flags);
    assert_eq!(other.virt_eip(), cpu.virt_eip());
}

#[test]
fn snapshot_serializes_through_serde() {
    let mut cpu = cpu_with_ram(0x4000);
    enter_flat_protected(&mut cpu, 0x1000);
    load(&mut cpu, 0x1000, &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xF4]);
    run_until_hlt(&mut cpu, 8);

    let snap = cpu.save_state();
    let json = serde_json::to_string(&snap).unwrap();
    let back: halcyon_cpu_core::CpuSnapshot = serde_json::from_str(&json).unwrap();

    let mut other = Cpu::new(Box::new(NullDevices));
    other.init_mem(0x4000);
    other.reset();
    other.restore_state(&back).unwrap();
    assert_eq!(other.reg32[EAX], 42);
    assert_eq!(other.mem, cpu.mem);
}

#[test]
fn restore_rejects_inconsistent_images() {
    let mut cpu = cpu_with_ram(0x4000);
    let mut snap = cpu.save_state();
    snap.ram.truncate(16);
    assert!(cpu.restore_state(&snap).is_err());
}
