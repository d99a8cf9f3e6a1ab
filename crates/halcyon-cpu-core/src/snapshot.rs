//! State snapshots: every architectural field plus the RAM image. The
//! caches (TLB, trace cache, SMC bitmap) are rebuilt on restore, never
//! serialised.

use serde::{Deserialize, Serialize};

use crate::state::*;
use crate::Cpu;

#[derive(Clone, Serialize, Deserialize)]
pub struct FpuSnapshot {
    pub st: [(u16, u64); 8],
    pub ftop: u32,
    pub control_word: u16,
    pub status_word: u16,
    pub tag_word: u16,
    pub fpu_eip: u32,
    pub fpu_data_ptr: u32,
    pub fpu_cs: u16,
    pub fpu_data_seg: u16,
    pub fpu_opcode: u16,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub reg32: [u32; 16],
    pub xmm32: Vec<u32>,
    pub mxcsr: u32,
    pub esp_mask: u32,
    pub memory_size: u32,
    pub eflags: u32,
    pub laux: u32,
    pub lop1: u32,
    pub lop2: u32,
    pub lr: u32,
    pub phys_eip: u32,
    pub last_phys_eip: u32,
    pub eip_phys_bias: u32,
    pub state_hash: u32,
    pub cycles: u64,
    pub cycle_frame_end: u64,
    pub cycles_to_run: i32,
    pub refill_counter: i32,
    pub hlt_counter: i32,
    pub cycle_offset: i32,
    pub cr: [u32; 8],
    pub dr: [u32; 8],
    pub cpl: u32,
    pub seg: [u16; 16],
    pub seg_base: [u32; 16],
    pub seg_limit: [u32; 16],
    pub seg_access: [u32; 16],
    pub seg_valid: [u32; 16],
    pub mtrr_fixed: Vec<u64>,
    pub mtrr_variable: Vec<u64>,
    pub mtrr_deftype: u64,
    pub page_attribute_tables: u64,
    pub a20_mask: u32,
    pub apic_base: u64,
    pub tsc_fudge: u64,
    pub read_result: u32,
    pub intr_line_state: bool,
    pub interrupts_blocked: bool,
    pub ia32_efer: u64,
    pub sysenter: [u32; 3],
    pub fpu: FpuSnapshot,
    pub ram: Vec<u8>,
}

impl Cpu {
    pub fn save_state(&self) -> CpuSnapshot {
        let mut st = [(0u16, 0u64); 8];
        for (n, f) in self.fpu.st.iter().enumerate() {
            st[n] = (f.sign_exp, f.sig);
        }
        CpuSnapshot {
            reg32: self.reg32,
            xmm32: self.xmm32.to_vec(),
            mxcsr: self.mxcsr,
            esp_mask: self.esp_mask,
            memory_size: self.memory_size,
            eflags: self.eflags,
            laux: self.laux,
            lop1: self.lop1,
            lop2: self.lop2,
            lr: self.lr,
            phys_eip: self.phys_eip,
            last_phys_eip: self.last_phys_eip,
            eip_phys_bias: self.eip_phys_bias,
            state_hash: self.state_hash,
            cycles: self.cycles,
            cycle_frame_end: self.cycle_frame_end,
            cycles_to_run: self.cycles_to_run,
            refill_counter: self.refill_counter,
            hlt_counter: self.hlt_counter,
            cycle_offset: self.cycle_offset,
            cr: self.cr,
            dr: self.dr,
            cpl: self.cpl,
            seg: self.seg,
            seg_base: self.seg_base,
            seg_limit: self.seg_limit,
            seg_access: self.seg_access,
            seg_valid: self.seg_valid,
            mtrr_fixed: self.mtrr_fixed.to_vec(),
            mtrr_variable: self.mtrr_variable.to_vec(),
            mtrr_deftype: self.mtrr_deftype,
            page_attribute_tables: self.page_attribute_tables,
            a20_mask: self.a20_mask,
            apic_base: self.apic_base,
            tsc_fudge: self.tsc_fudge,
            read_result: self.read_result,
            intr_line_state: self.intr_line_state,
            interrupts_blocked: self.interrupts_blocked,
            ia32_efer: self.ia32_efer,
            sysenter: self.sysenter,
            fpu: FpuSnapshot {
                st,
                ftop: self.fpu.ftop,
                control_word: self.fpu.control_word,
                status_word: self.fpu.status_word,
                tag_word: self.fpu.tag_word,
                fpu_eip: self.fpu.fpu_eip,
                fpu_data_ptr: self.fpu.fpu_data_ptr,
                fpu_cs: self.fpu.fpu_cs,
                fpu_data_seg: self.fpu.fpu_data_seg,
                fpu_opcode: self.fpu.fpu_opcode,
            },
            ram: self.mem.clone(),
        }
    }

    /// Restore every architectural field, then rebuild the derived state:
    /// caches emptied, CPL shifts and rounding control recomputed.
    pub fn restore_state(&mut self, snap: &CpuSnapshot) -> Result<(), crate::CpuError> {
        if snap.xmm32.len() != 32 || snap.mtrr_fixed.len() != 32 || snap.mtrr_variable.len() != 16
        {
            return Err(crate::CpuError::MalformedSnapshot);
        }
        if snap.ram.len() != snap.memory_size as usize {
            return Err(crate::CpuError::MalformedSnapshot);
        }
        self.reg32 = snap.reg32;
        self.xmm32.copy_from_slice(&snap.xmm32);
        self.mxcsr = snap.mxcsr;
        self.esp_mask = snap.esp_mask;
        self.eflags = snap.eflags;
        self.laux = snap.laux;
        self.lop1 = snap.lop1;
        self.lop2 = snap.lop2;
        self.lr = snap.lr;
        self.phys_eip = snap.phys_eip;
        self.last_phys_eip = snap.last_phys_eip;
        self.eip_phys_bias = snap.eip_phys_bias;
        self.state_hash = snap.state_hash;
        self.cycles = snap.cycles;
        self.cycle_frame_end = snap.cycle_frame_end;
        self.cycles_to_run = snap.cycles_to_run;
        self.refill_counter = snap.refill_counter;
        self.hlt_counter = snap.hlt_counter;
        self.cycle_offset = snap.cycle_offset;
        self.cr = snap.cr;
        self.dr = snap.dr;
        self.cpl = snap.cpl;
        self.seg = snap.seg;
        self.seg_base = snap.seg_base;
        self.seg_limit = snap.seg_limit;
        self.seg_access = snap.seg_access;
        self.seg_valid = snap.seg_valid;
        self.mtrr_fixed.copy_from_slice(&snap.mtrr_fixed);
        self.mtrr_variable.copy_from_slice(&snap.mtrr_variable);
        self.mtrr_deftype = snap.mtrr_deftype;
        self.page_attribute_tables = snap.page_attribute_tables;
        self.a20_mask = snap.a20_mask;
        self.apic_base = snap.apic_base;
        self.tsc_fudge = snap.tsc_fudge;
        self.read_result = snap.read_result;
        self.intr_line_state = snap.intr_line_state;
        self.interrupts_blocked = snap.interrupts_blocked;
        self.ia32_efer = snap.ia32_efer;
        self.sysenter = snap.sysenter;
        for (n, (se, sig)) in snap.fpu.st.iter().enumerate() {
            self.fpu.st[n] = halcyon_softfloat::Float80 {
                sign_exp: *se,
                sig: *sig,
            };
        }
        self.fpu.ftop = snap.fpu.ftop;
        self.fpu.set_control_word(snap.fpu.control_word);
        self.fpu.status_word = snap.fpu.status_word;
        self.fpu.tag_word = snap.fpu.tag_word;
        self.fpu.fpu_eip = snap.fpu.fpu_eip;
        self.fpu.fpu_data_ptr = snap.fpu.fpu_data_ptr;
        self.fpu.fpu_cs = snap.fpu.fpu_cs;
        self.fpu.fpu_data_seg = snap.fpu.fpu_data_seg;
        self.fpu.fpu_opcode = snap.fpu.fpu_opcode;

        self.memory_size = snap.memory_size;
        self.mem = snap.ram.clone();
        self.smc_has_code = vec![0u32; ((snap.memory_size + 4095) >> 12) as usize];

        // Derived state is rebuilt, never trusted from the image.
        self.trace_flush();
        self.mmu_tlb_flush();
        self.update_cpl_shifts();
        Ok(())
    }
}
