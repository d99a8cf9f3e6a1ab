//! Fast-path memory access throughput: TLB-hit reads and the slow-path
//! walk on a cold entry.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use halcyon_cpu_core::devices::NullDevices;
use halcyon_cpu_core::state::TLB_SYSTEM_READ;
use halcyon_cpu_core::Cpu;

fn bench_tlb(c: &mut Criterion) {
    let mut cpu = Cpu::new(Box::new(NullDevices));
    cpu.init_mem(0x40_0000);
    cpu.reset();

    // Prime one page.
    cpu.read32(0x8000, TLB_SYSTEM_READ).unwrap();

    c.bench_function("tlb_hit_read32", |b| {
        b.iter(|| {
            let v = cpu.read32(black_box(0x8000), TLB_SYSTEM_READ).unwrap();
            black_box(v)
        })
    });

    c.bench_function("tlb_cold_walk", |b| {
        b.iter(|| {
            cpu.mmu_tlb_invalidate(0x10000);
            let v = cpu.read32(black_box(0x10000), TLB_SYSTEM_READ).unwrap();
            black_box(v)
        })
    });
}

criterion_group!(benches, bench_tlb);
criterion_main!(benches);
