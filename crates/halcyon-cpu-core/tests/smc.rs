//! Self-modifying-code coherence and trace-cache observability.

mod testkit;

use halcyon_cpu_core::state::*;
use testkit::*;

#[test]
fn decode_cache_hits_on_reexecution() {
    let mut cpu = cpu_with_ram(0x10000);
    enter_flat_protected(&mut cpu, 0x1000);
    load(&mut cpu, 0x1000, &[0x90, 0x90, 0xF4]); // nop; nop; hlt
    run_until_hlt(&mut cpu, 8);
    let first = cpu.decode_cache_stats();
    assert_eq!(first.hits, 0);
    assert!(first.misses >= 1);

    cpu.clear_halt();
    jump_to(&mut cpu, 0x1000);
    run_until_hlt(&mut cpu, 8);
    let second = cpu.decode_cache_stats();
    assert!(second.hits > first.hits, "second pass must reuse the trace");
    assert_eq!(second.misses, first.misses);
}

/// Patching a byte inside a decoded trace forces a re-decode at the next
/// execution.
#[test]
fn write_into_trace_invalidates_it() {
    let mut cpu = cpu_with_ram(0x10000);
    enter_flat_protected(&mut cpu, 0x1000);
    // mov eax, 1; hlt  (at 0x1000; imm byte at 0x1001)
    load(&mut cpu, 0x1000, &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xF4]);
    run_until_hlt(&mut cpu, 8);
    assert_eq!(cpu.reg32[EAX], 1);
    assert!(cpu.smc_has_code(0x1000));

    // Patch the immediate through an ordinary guest store.
    cpu.clear_halt();
    enter_flat_protected(&mut cpu, 0x2000);
    // mov byte [0x1001], 2; hlt
    load(&mut cpu, 0x2000, &[0xC6, 0x05, 0x01, 0x10, 0x00, 0x00, 0x02, 0xF4]);
    run_until_hlt(&mut cpu, 8);

    cpu.clear_halt();
    jump_to(&mut cpu, 0x1000);
    run_until_hlt(&mut cpu, 8);
    assert_eq!(cpu.reg32[EAX], 2, "patched immediate must be decoded");
}

#[test]
fn self_patching_trace_requests_restart() {
    let mut cpu = cpu_with_ram(0x10000);
    enter_flat_protected(&mut cpu, 0x1000);
    // The trace patches its own later bytes: the pre-patch target of the
    // store is another `mov eax, imm`.
    // mov byte [0x100B], 7; mov eax, 0; hlt
    load(
        &mut cpu,
        0x1000,
        &[
            0xC6, 0x05, 0x0B, 0x10, 0x00, 0x00, 0x07, // mov byte [0x100B], 7
            0xB8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0 (imm low at 0x1008.. wait)
            0xF4,
        ],
    );
    // The store rewrites the low immediate byte of the mov at 0x1007,
    // whose imm32 starts at 0x1008; byte 0x100B is its high byte.
    run_until_hlt(&mut cpu, 16);
    assert_eq!(
        cpu.reg32[EAX], 0x0700_0000,
        "restarted trace must see the patched byte"
    );
}

#[test]
fn dma_write_drops_page_traces() {
    let mut cpu = cpu_with_ram(0x10000);
    enter_flat_protected(&mut cpu, 0x1000);
    load(&mut cpu, 0x1000, &[0xB8, 0x05, 0x00, 0x00, 0x00, 0xF4]);
    run_until_hlt(&mut cpu, 8);
    assert!(cpu.smc_page_has_code(0x1000));

    cpu.write_mem_bytes(0x1001, &[0x09, 0x00, 0x00, 0x00]);
    assert!(!cpu.smc_page_has_code(0x1000));

    cpu.clear_halt();
    jump_to(&mut cpu, 0x1000);
    run_until_hlt(&mut cpu, 8);
    assert_eq!(cpu.reg32[EAX], 9);
}
