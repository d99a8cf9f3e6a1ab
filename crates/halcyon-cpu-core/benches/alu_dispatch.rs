//! Dispatch-loop throughput over a simple ALU kernel.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use halcyon_cpu_core::devices::NullDevices;
use halcyon_cpu_core::state::{CR0_PE, ACCESS_B, ACCESS_G, ACCESS_P, ACCESS_RW, ACCESS_S, CS, ACCESS_EX};
use halcyon_cpu_core::Cpu;

fn flat_cpu() -> Cpu {
    let mut cpu = Cpu::new(Box::new(NullDevices));
    cpu.init_mem(0x40_0000);
    cpu.reset();
    cpu.cr[0] |= CR0_PE;
    cpu.seg[CS] = 0x08;
    cpu.seg_base[CS] = 0;
    cpu.seg_limit[CS] = !0;
    cpu.seg_access[CS] = ACCESS_S | ACCESS_EX | ACCESS_RW | ACCESS_P | ACCESS_G | ACCESS_B;
    cpu.state_hash = 0;
    cpu.esp_mask = !0;
    cpu
}

fn bench_alu(c: &mut Criterion) {
    let mut cpu = flat_cpu();
    // 16 copies of (add eax, ebx; xor eax, 1), then jmp back to the top.
    let mut code = Vec::new();
    for _ in 0..16 {
        code.extend_from_slice(&[0x01, 0xD8, 0x83, 0xF0, 0x01]);
    }
    let body = code.len() as i32;
    code.push(0xE9);
    code.extend_from_slice(&(-(body + 5)).to_le_bytes());
    cpu.load_rom(0x1000, &code).unwrap();

    c.bench_function("alu_kernel_1k_insns", |b| {
        b.iter(|| {
            cpu.phys_eip = 0x1000;
            cpu.eip_phys_bias = 0;
            cpu.last_phys_eip = cpu.phys_eip + 0x1000;
            cpu.run(black_box(1024));
            black_box(cpu.reg32[0])
        })
    });
}

criterion_group!(benches, bench_alu);
criterion_main!(benches);
