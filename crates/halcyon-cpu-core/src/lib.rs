//! Halcyon's IA-32 core: a trace-cached interpreter with a software
//! MMU/TLB, full protected-mode control-transfer machinery, lazy condition
//! codes, and an 80-bit x87 unit.
//!
//! The embedder supplies the outside world through [`devices::Devices`],
//! sizes guest RAM with [`Cpu::init_mem`], loads firmware with
//! [`Cpu::load_rom`], and drives execution in slices with [`Cpu::run`].

pub mod access;
pub mod decoder;
pub mod devices;
mod dispatch;
pub mod flags;
pub mod fpu;
pub mod mmu;
mod ops;
pub mod seg;
pub mod smc;
pub mod snapshot;
pub mod state;
pub mod trace;

pub use devices::{Devices, MmioSize, NullDevices};
pub use snapshot::CpuSnapshot;
pub use state::{Cpu, Exception, ExitReason, IntKind};
pub use trace::TraceCacheStats;

use state::*;

/// Host-facing errors (guest exceptions never surface here).
#[derive(Debug, thiserror::Error)]
pub enum CpuError {
    #[error("ROM image at {addr:#x}+{len:#x} exceeds guest RAM")]
    RomOutOfBounds { addr: u32, len: usize },
    #[error("snapshot fields are inconsistent")]
    MalformedSnapshot,
}

impl Cpu {
    /// Bring the CPU to the architectural power-on state. RAM contents are
    /// preserved; every cache is dropped.
    pub fn reset(&mut self) {
        for r in 0..8 {
            self.reg32[r] = 0;
        }
        self.reg32[EZR] = 0;
        self.reg32[ETMP] = !0;

        self.cr = [0; 8];
        self.cr[0] = 0x6000_0010;
        self.dr = [0; 8];
        self.dr[6] = 0xFFFF_0FF0;
        self.dr[7] = 0x400;

        for s in 0..6 {
            self.seg_load_real(s, 0);
        }
        // The reset CS alias: selector F000 with the ROM mapped high.
        self.seg_load_real(CS, 0xF000);
        self.seg_base[CS] = 0xFFFF_0000;
        for s in [SEG_TR, SEG_GDTR, SEG_LDTR, SEG_IDTR] {
            self.seg[s] = 0;
            self.seg_base[s] = 0;
            self.seg_limit[s] = if s == SEG_GDTR || s == SEG_IDTR {
                0xFFFF
            } else {
                0
            };
            self.seg_access[s] = 0;
        }

        self.phys_eip = 0;
        self.eip_phys_bias = 0;
        self.last_phys_eip = 0x1000; // force re-derivation
        self.set_virt_eip(0xFFF0);

        self.cpl = 0;
        self.update_cpl_shifts();

        self.lop1 = 0;
        self.lop2 = 0;
        // Establish the lazy scratch through the flags writer so every
        // arithmetic bit reads back as the reset value demands.
        self.eflags = 2;
        self.set_eflags(2);

        self.page_attribute_tables = 0x0007_0406_0007_0406;
        self.apic_base = if self.devices.apic_is_enabled() {
            0xFEE0_0900 // boot-strap processor
        } else {
            0
        };

        self.mxcsr = 0x1F80;
        self.fpu = fpu::FpuState::new();

        self.intr_line_state = false;
        self.interrupts_blocked = false;
        self.exit_reason = ExitReason::Normal;
        self.current_exception = -1;

        for t in self.tlb_tags.iter_mut() {
            *t = 0xFF;
        }
        for a in self.tlb_attrs.iter_mut() {
            *a = 0xFF;
        }
        for b in self.tlb_bias.iter_mut() {
            *b = 0;
        }
        self.tlb_entry_indexes.clear();
        self.trace_flush();
        for w in self.smc_has_code.iter_mut() {
            *w = 0;
        }
    }

    /// CPUID bit 9 / MSR 0x1B visibility.
    pub fn apic_connected(&self) -> bool {
        self.devices.apic_is_enabled() && self.apic_base & 0x100 != 0
    }

    pub fn interrupts_masked(&self) -> bool {
        self.eflags & EFLAGS_IF == 0
    }

    pub fn exit_reason(&self) -> ExitReason {
        self.exit_reason
    }

    /// Leave the halted state without an interrupt (reset button, debugger).
    pub fn clear_halt(&mut self) {
        self.exit_reason = ExitReason::Normal;
    }

    pub fn decode_cache_stats(&self) -> TraceCacheStats {
        self.trace_stats
    }
}
