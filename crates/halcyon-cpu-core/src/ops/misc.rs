//! System and miscellaneous instructions: CPUID, MSRs, flags image moves,
//! descriptor-table loads, control/debug register moves, protection probes.

use crate::decoder::{i_op, i_reg, i_rm, DecodedInsn};
use crate::ops::{ea, ea_virt, HandlerResult, Next};
use crate::seg::SegDesc;
use crate::state::*;
use crate::Cpu;

impl Cpu {
    /// Shared CR write-back with the TLB side effects each register implies.
    pub fn set_cr(&mut self, cr: usize, v: u32) {
        let diff = v ^ self.cr[cr];
        self.cr[cr] = v;
        match cr {
            0 => {
                if diff & CR0_PG != 0 {
                    self.mmu_tlb_flush();
                }
            }
            3 => {
                self.cr[3] &= !0xFFF;
                if self.cr[4] & CR4_PGE != 0 {
                    self.mmu_tlb_flush_nonglobal();
                } else {
                    self.mmu_tlb_flush();
                }
            }
            4 => {
                if diff & CR4_PSE != 0 {
                    self.mmu_tlb_flush();
                }
            }
            _ => {}
        }
    }

    pub(crate) fn set_dr(&mut self, id: usize, v: u32) {
        if self.dr[id] == v {
            return;
        }
        match id {
            6 => self.dr[6] = (self.dr[6] & 0xFFFF_0FF0) | (v & 0xE00F),
            7 => self.dr[7] = (v & 0xFFFF_2FFF) | 0x400,
            _ => self.dr[id] = v,
        }
    }

    /// STI/MOV SS window: let exactly one more instruction run before the
    /// outer loop samples the interrupt lines again.
    pub(crate) fn interrupt_guard(&mut self) {
        self.cycles = self.get_cycles();
        if self.cycles_to_run != 1 {
            self.refill_counter = self.cycles_to_run - 2;
            self.cycles_to_run = 2;
            self.cycle_offset = 2;
        } else {
            self.cycles_to_run = 1;
            self.cycle_offset = 1;
            self.refill_counter = 0;
            self.interrupts_blocked = true;
        }
    }
}

pub(crate) fn op_cpuid(cpu: &mut Cpu) -> HandlerResult {
    let leaf = cpu.reg32[EAX];
    log::debug!("CPUID leaf {leaf:08x}");
    match leaf {
        0 => {
            cpu.reg32[EAX] = 2;
            cpu.reg32[EBX] = 0x756E_6547; // "GenuineIntel"
            cpu.reg32[EDX] = 0x4965_6E69;
            cpu.reg32[ECX] = 0x6C65_746E;
        }
        1 => {
            cpu.reg32[EAX] = 0x0000_06A0;
            cpu.reg32[EBX] = 0x0001_0000;
            cpu.reg32[ECX] = 0;
            cpu.reg32[EDX] = 0x1842_C1BF | (cpu.apic_connected() as u32) << 9;
        }
        2 => {
            cpu.reg32[EAX] = 0x0041_0601;
            cpu.reg32[EBX] = 0;
            cpu.reg32[ECX] = 0;
            cpu.reg32[EDX] = 0;
        }
        0x8000_0000 => {
            cpu.reg32[EAX] = 0x8000_0008;
            cpu.reg32[EBX] = 0;
            cpu.reg32[ECX] = 0;
            cpu.reg32[EDX] = 0;
        }
        0x8000_0002..=0x8000_0004 => {
            const BRAND: &[u8; 48] = b"Halfix Virtual CPU                             \0";
            let offset = ((leaf - 0x8000_0002) << 4) as usize;
            for (n, reg) in [EAX, EBX, ECX, EDX].into_iter().enumerate() {
                let mut v = 0u32;
                for b in 0..4 {
                    v |= (BRAND[offset + n * 4 + b] as u32) << (b * 8);
                }
                cpu.reg32[reg] = v;
            }
        }
        0x8000_0005 => {
            cpu.reg32[EAX] = 0x01FF_01FF;
            cpu.reg32[EBX] = 0x01FF_01FF;
            cpu.reg32[ECX] = 0x4002_0140;
            cpu.reg32[EDX] = 0x4002_0140;
        }
        0x8000_0006 => {
            cpu.reg32[EAX] = 0;
            cpu.reg32[EBX] = 0x4200_4200;
            cpu.reg32[ECX] = 0x0200_8140;
            cpu.reg32[EDX] = 0;
        }
        0x8000_0008 => {
            cpu.reg32[EAX] = 0x2028;
            cpu.reg32[EBX] = 0;
            cpu.reg32[ECX] = 0;
            cpu.reg32[EDX] = 0;
        }
        other => {
            if !(0x8000_0001..=0x8000_0008).contains(&other)
                && !(0x8086_0000..=0x8086_0007).contains(&other)
            {
                log::debug!("unknown CPUID leaf {other:08x}");
            }
            cpu.reg32[EAX] = 0;
            cpu.reg32[EBX] = 0;
            cpu.reg32[ECX] = 0;
            cpu.reg32[EDX] = 0;
        }
    }
    Ok(Next)
}

pub(crate) fn op_rdmsr(cpu: &mut Cpu) -> HandlerResult {
    let index = cpu.reg32[ECX];
    let value: u64 = match index {
        0x10 => cpu.get_cycles().wrapping_sub(cpu.tsc_fudge),
        0x1B => {
            if !cpu.apic_connected() {
                cpu.exception_with_code(Exception::Gp, 0);
                return Err(Abort);
            }
            cpu.apic_base
        }
        0x174 => cpu.sysenter[SYSENTER_CS] as u64,
        0x175 => cpu.sysenter[SYSENTER_ESP] as u64,
        0x176 => cpu.sysenter[SYSENTER_EIP] as u64,
        0x277 => cpu.page_attribute_tables,
        0x2FF => cpu.mtrr_deftype,
        0xFE => 0x508, // MTRRcap: 8 variable ranges, fixed, WC
        0x200..=0x20F => cpu.mtrr_variable[(index - 0x200) as usize],
        0x250 => cpu.mtrr_fixed[0],
        0x258 => cpu.mtrr_fixed[1],
        0x259 => cpu.mtrr_fixed[2],
        0x268..=0x26F => cpu.mtrr_fixed[(index - 0x268 + 3) as usize],
        0xC000_0080 => cpu.ia32_efer,
        0x17 | 0x8B | 0x179 | 0x17A | 0x17B | 0x186 | 0x187 | 0x19A..=0x1A0 | 0x400 => {
            log::debug!("read-as-zero MSR {index:#x}");
            0
        }
        _ => {
            log::error!("unknown MSR read {index:#x}");
            panic!("unknown MSR {index:#x}");
        }
    };
    cpu.reg32[EAX] = value as u32;
    cpu.reg32[EDX] = (value >> 32) as u32;
    Ok(Next)
}

pub(crate) fn op_wrmsr(cpu: &mut Cpu) -> HandlerResult {
    let index = cpu.reg32[ECX];
    let value = (cpu.reg32[EDX] as u64) << 32 | cpu.reg32[EAX] as u64;
    match index {
        0x10 => cpu.tsc_fudge = cpu.get_cycles().wrapping_sub(value),
        0x1B => cpu.apic_base = value,
        0x174 => cpu.sysenter[SYSENTER_CS] = value as u32,
        0x175 => cpu.sysenter[SYSENTER_ESP] = value as u32,
        0x176 => cpu.sysenter[SYSENTER_EIP] = value as u32,
        0x277 => cpu.page_attribute_tables = value,
        0x2FF => cpu.mtrr_deftype = value,
        0x200..=0x20F => cpu.mtrr_variable[(index - 0x200) as usize] = value,
        0x250 => cpu.mtrr_fixed[0] = value,
        0x258 => cpu.mtrr_fixed[1] = value,
        0x259 => cpu.mtrr_fixed[2] = value,
        0x268..=0x26F => cpu.mtrr_fixed[(index - 0x268 + 3) as usize] = value,
        0xC000_0080 => cpu.ia32_efer = value,
        0x17 | 0x8B | 0x179 | 0x17A | 0x17B | 0x186 | 0x187 | 0x19A..=0x1A0 | 0x400 | 0xFE => {
            log::debug!("ignored MSR write {index:#x} = {value:#x}");
        }
        _ => {
            log::error!("unknown MSR write {index:#x}");
            panic!("unknown MSR {index:#x}");
        }
    }
    Ok(Next)
}

pub(crate) fn op_rdtsc(cpu: &mut Cpu) -> HandlerResult {
    if cpu.cr[4] & CR4_TSD != 0 && cpu.cpl != 0 {
        cpu.exception_with_code(Exception::Gp, 0);
        return Err(Abort);
    }
    let tsc = cpu.get_cycles().wrapping_sub(cpu.tsc_fudge);
    cpu.reg32[EAX] = tsc as u32;
    cpu.reg32[EDX] = (tsc >> 32) as u32;
    Ok(Next)
}

// --- flags image --------------------------------------------------------

pub(crate) fn op_pushf(cpu: &mut Cpu, is32: bool) -> HandlerResult {
    if cpu.eflags & EFLAGS_VM != 0 && cpu.iopl() < 3 {
        // VME lets 16-bit pushf through with VIF mapped into IF.
        if !(cpu.cr[4] & CR4_VME != 0 && !is32) {
            cpu.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        let mut image = cpu.get_eflags() & 0xFFFF;
        image &= !(EFLAGS_IF as u32);
        if cpu.eflags & EFLAGS_VIF != 0 {
            image |= EFLAGS_IF;
        }
        image |= EFLAGS_IOPL;
        cpu.push16(image as u16)?;
        return Ok(Next);
    }
    if is32 {
        cpu.push32(cpu.get_eflags() & !(EFLAGS_RF | EFLAGS_VM))?;
    } else {
        cpu.push16(cpu.get_eflags() as u16)?;
    }
    Ok(Next)
}

pub(crate) fn op_popf(cpu: &mut Cpu, is32: bool) -> HandlerResult {
    if cpu.eflags & EFLAGS_VM != 0 && cpu.iopl() < 3 {
        if cpu.cr[4] & CR4_VME != 0 && !is32 {
            let v = cpu.pop16()? as u32;
            if v & EFLAGS_TF != 0 || (cpu.eflags & EFLAGS_VIP != 0 && v & EFLAGS_IF != 0) {
                cpu.exception_with_code(Exception::Gp, 0);
                return Err(Abort);
            }
            let mut eflags = cpu.eflags;
            if v & EFLAGS_IF != 0 {
                eflags |= EFLAGS_VIF;
            } else {
                eflags &= !EFLAGS_VIF;
            }
            let keep = EFLAGS_IOPL | EFLAGS_IF | 0xFFFF_0000;
            cpu.set_eflags((v & 0xFFFF & !keep) | (eflags & keep));
            return Ok(Next);
        }
        cpu.exception_with_code(Exception::Gp, 0);
        return Err(Abort);
    }

    let (v, mask) = if is32 {
        (cpu.pop32()?, !0u32)
    } else {
        (cpu.pop16()? as u32, 0xFFFFu32)
    };
    // IF obeys IOPL; IOPL itself and VIF/VIP only move at CPL 0.
    let mut keep = 0u32;
    if cpu.cr[0] & CR0_PE != 0 {
        if cpu.cpl > cpu.iopl() {
            keep |= EFLAGS_IF;
        }
        if cpu.cpl != 0 {
            keep |= EFLAGS_IOPL;
        }
    }
    keep |= EFLAGS_VM | EFLAGS_RF | EFLAGS_VIF | EFLAGS_VIP;
    cpu.set_eflags((v & mask & !keep) | (cpu.eflags & (keep | !mask)));
    cpu.interrupt_guard();
    Ok(Next)
}

pub(crate) fn op_sahf(cpu: &mut Cpu) -> HandlerResult {
    let ah = cpu.read_reg8(EAX + 4) as u32;
    let e = (cpu.get_eflags() & !0xFF) | (ah & 0xD5) | 2;
    cpu.set_eflags(e);
    Ok(Next)
}

pub(crate) fn op_lahf(cpu: &mut Cpu) -> HandlerResult {
    let v = (cpu.get_eflags() & 0xD5 | 2) as u8;
    cpu.write_reg8(EAX + 4, v);
    Ok(Next)
}

pub(crate) fn op_xlat(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a16 = i.flags & crate::decoder::I_ADDR16 != 0;
    let base = if a16 {
        (cpu.read_reg16(EBX) as u32).wrapping_add(cpu.read_reg8(EAX) as u32) & 0xFFFF
    } else {
        cpu.reg32[EBX].wrapping_add(cpu.read_reg8(EAX) as u32)
    };
    let lin = base.wrapping_add(cpu.seg_base[crate::decoder::i_seg(i.flags)]);
    let v = cpu.read8(lin, cpu.tlb_shift_read)?;
    cpu.write_reg8(EAX, v);
    Ok(Next)
}

pub(crate) fn op_bound(cpu: &mut Cpu, i: &DecodedInsn, is32: bool) -> HandlerResult {
    let a = ea(cpu, i);
    let (lo, hi, idx) = if is32 {
        (
            cpu.read32(a, cpu.tlb_shift_read)? as i32,
            cpu.read32(a.wrapping_add(4), cpu.tlb_shift_read)? as i32,
            cpu.reg32[i_reg(i.flags)] as i32,
        )
    } else {
        (
            cpu.read16(a, cpu.tlb_shift_read)? as i16 as i32,
            cpu.read16(a.wrapping_add(2), cpu.tlb_shift_read)? as i16 as i32,
            cpu.read_reg16(i_reg(i.flags)) as i16 as i32,
        )
    };
    if idx < lo || idx > hi {
        cpu.exception(Exception::Br);
        return Err(Abort);
    }
    Ok(Next)
}

// --- descriptor-table instructions --------------------------------------

pub(crate) fn op_sgdt(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a = ea(cpu, i);
    cpu.write16(a, cpu.seg_limit[SEG_GDTR] as u16, cpu.tlb_shift_write)?;
    cpu.write32(a.wrapping_add(2), cpu.seg_base[SEG_GDTR], cpu.tlb_shift_write)?;
    Ok(Next)
}

pub(crate) fn op_sidt(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a = ea(cpu, i);
    cpu.write16(a, cpu.seg_limit[SEG_IDTR] as u16, cpu.tlb_shift_write)?;
    cpu.write32(a.wrapping_add(2), cpu.seg_base[SEG_IDTR], cpu.tlb_shift_write)?;
    Ok(Next)
}

fn check_ring0(cpu: &mut Cpu) -> OpResult {
    if cpu.cpl != 0 && cpu.cr[0] & CR0_PE != 0 {
        cpu.exception_with_code(Exception::Gp, 0);
        return Err(Abort);
    }
    Ok(())
}

pub(crate) fn op_lgdt(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    check_ring0(cpu)?;
    let a = ea(cpu, i);
    let limit = cpu.read16(a, cpu.tlb_shift_read)?;
    let mut base = cpu.read32(a.wrapping_add(2), cpu.tlb_shift_read)?;
    if i_op(i.flags) == 0 {
        base &= 0x00FF_FFFF; // 16-bit operand form keeps 24 bits of base
    }
    cpu.seg_limit[SEG_GDTR] = limit as u32;
    cpu.seg_base[SEG_GDTR] = base;
    Ok(Next)
}

pub(crate) fn op_lidt(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    check_ring0(cpu)?;
    let a = ea(cpu, i);
    let limit = cpu.read16(a, cpu.tlb_shift_read)?;
    let mut base = cpu.read32(a.wrapping_add(2), cpu.tlb_shift_read)?;
    if i_op(i.flags) == 0 {
        base &= 0x00FF_FFFF;
    }
    cpu.seg_limit[SEG_IDTR] = limit as u32;
    cpu.seg_base[SEG_IDTR] = base;
    Ok(Next)
}

pub(crate) fn lldt(cpu: &mut Cpu, sel: u16) -> HandlerResult {
    if !cpu.in_protected_mode() {
        cpu.exception(Exception::Ud);
        return Err(Abort);
    }
    check_ring0(cpu)?;
    let offset = (sel & 0xFFFC) as u32;
    if offset == 0 {
        cpu.seg[SEG_LDTR] = sel;
        cpu.seg_base[SEG_LDTR] = 0;
        cpu.seg_limit[SEG_LDTR] = 0;
        cpu.seg_access[SEG_LDTR] = 0;
        return Ok(Next);
    }
    if selector_is_ldt(sel as u32) {
        cpu.exception_with_code(Exception::Gp, offset as i32);
        return Err(Abort);
    }
    let desc = cpu.seg_load_descriptor2(SEG_GDTR, sel as u32, Some(Exception::Gp), offset as i32)?;
    let access = desc.access();
    if access_type(access) != DESC_LDT {
        cpu.exception_with_code(Exception::Gp, offset as i32);
        return Err(Abort);
    }
    if access & ACCESS_P == 0 {
        cpu.exception_with_code(Exception::Np, offset as i32);
        return Err(Abort);
    }
    cpu.seg[SEG_LDTR] = sel;
    cpu.seg_base[SEG_LDTR] = desc.base();
    cpu.seg_limit[SEG_LDTR] = desc.limit();
    cpu.seg_access[SEG_LDTR] = access;
    Ok(Next)
}

pub(crate) fn ltr(cpu: &mut Cpu, sel: u16) -> HandlerResult {
    if !cpu.in_protected_mode() {
        cpu.exception(Exception::Ud);
        return Err(Abort);
    }
    check_ring0(cpu)?;
    let offset = (sel & 0xFFFC) as u32;
    if offset == 0 || selector_is_ldt(sel as u32) {
        cpu.exception_with_code(Exception::Gp, offset as i32);
        return Err(Abort);
    }
    let mut desc =
        cpu.seg_load_descriptor2(SEG_GDTR, sel as u32, Some(Exception::Gp), offset as i32)?;
    let access = desc.access();
    let ty = access_type(access);
    if ty != DESC_AVAILABLE_TSS_286 && ty != DESC_AVAILABLE_TSS_386 {
        cpu.exception_with_code(Exception::Gp, offset as i32);
        return Err(Abort);
    }
    if access & ACCESS_P == 0 {
        cpu.exception_with_code(Exception::Np, offset as i32);
        return Err(Abort);
    }
    // Mark busy in the table copy.
    let addr = cpu
        .seg_descriptor_address(sel as u32)
        .expect("limit checked above");
    desc.raw[1] |= 2 << 8;
    cpu.write8(addr.wrapping_add(5), (desc.raw[1] >> 8) as u8, TLB_SYSTEM_WRITE)?;
    cpu.seg[SEG_TR] = sel;
    cpu.seg_base[SEG_TR] = desc.base();
    cpu.seg_limit[SEG_TR] = desc.limit();
    cpu.seg_access[SEG_TR] = desc.access();
    Ok(Next)
}

/// LAR/LSL shared descriptor probe; returns `None` when ZF must clear.
fn probe_descriptor(cpu: &mut Cpu, sel: u32, want_limit: bool) -> OpResult<Option<SegDesc>> {
    if !cpu.in_protected_mode() {
        cpu.exception(Exception::Ud);
        return Err(Abort);
    }
    if sel & 0xFFFC == 0 {
        return Ok(None);
    }
    let desc = match cpu.seg_load_descriptor(sel, None, 0) {
        Ok(d) => d,
        Err(Abort) => return Ok(None),
    };
    let access = desc.access();
    let ty = access_type(access);
    let dpl = access_dpl(access);
    let rpl = selector_rpl(sel);
    let conforming_code = (0x1C..=0x1F).contains(&ty);
    if !conforming_code && (dpl < cpu.cpl || dpl < rpl) {
        return Ok(None);
    }
    if access & ACCESS_S == 0 {
        // System types: only a subset is recognised.
        let ok = if want_limit {
            matches!(ty, 1 | 2 | 3 | 9 | 11)
        } else {
            matches!(ty, 1 | 2 | 3 | 4 | 5 | 9 | 11 | 12)
        };
        if !ok {
            return Ok(None);
        }
    }
    Ok(Some(desc))
}

pub(crate) fn lar(cpu: &mut Cpu, sel: u32) -> OpResult<Option<u32>> {
    match probe_descriptor(cpu, sel, false)? {
        None => {
            cpu.set_zf(false);
            Ok(None)
        }
        Some(d) => {
            cpu.set_zf(true);
            Ok(Some(d.raw[1] & 0x00FF_FF00))
        }
    }
}

pub(crate) fn lsl(cpu: &mut Cpu, sel: u32) -> OpResult<Option<u32>> {
    match probe_descriptor(cpu, sel, true)? {
        None => {
            cpu.set_zf(false);
            Ok(None)
        }
        Some(d) => {
            cpu.set_zf(true);
            Ok(Some(d.limit()))
        }
    }
}

pub(crate) fn verify_segment_access(cpu: &mut Cpu, sel: u32, write: bool) -> OpResult {
    if !cpu.in_protected_mode() {
        cpu.exception(Exception::Ud);
        return Err(Abort);
    }
    let valid = (|| {
        if sel & 0xFFFC == 0 {
            return Ok(false);
        }
        let desc = match cpu.seg_load_descriptor(sel, None, 0) {
            Ok(d) => d,
            Err(Abort) => return Ok(false),
        };
        let access = desc.access();
        let ty = access_type(access);
        if access & ACCESS_S == 0 {
            return Ok(false);
        }
        let conforming_code = (0x1C..=0x1F).contains(&ty);
        if !conforming_code
            && (access_dpl(access) < cpu.cpl || access_dpl(access) < selector_rpl(sel))
        {
            return Ok(false);
        }
        Ok(if write {
            matches!(ty, 0x12 | 0x13 | 0x16 | 0x17)
        } else {
            ty & 0x08 == 0 || ty & 0x02 != 0 // data, or readable code
        })
    })()?;
    cpu.set_zf(valid);
    Ok(())
}

pub(crate) fn arpl(cpu: &mut Cpu, dest: u16, src: u16) -> (u16, bool) {
    if selector_rpl(dest as u32) < selector_rpl(src as u32) {
        ((dest & !3) | (src & 3), true)
    } else {
        (dest, false)
    }
}

// --- CR/DR moves, SMSW/LMSW, INVLPG -------------------------------------

pub(crate) fn op_mov_cr_r(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    check_ring0(cpu)?;
    let cr = i_reg(i.flags);
    let v = cpu.reg32[i_rm(i.flags)];
    match cr {
        0 | 2 | 3 | 4 => cpu.set_cr(cr, v),
        _ => {
            cpu.exception(Exception::Ud);
            return Err(Abort);
        }
    }
    // CR0/CR3/CR4 changes can remap the current code page.
    cpu.reload_cs_base();
    Ok(Next)
}

pub(crate) fn op_mov_r_cr(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    check_ring0(cpu)?;
    let cr = i_reg(i.flags);
    cpu.reg32[i_rm(i.flags)] = cpu.cr[cr & 7];
    Ok(Next)
}

pub(crate) fn op_mov_dr_r(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    check_ring0(cpu)?;
    let dr = i_reg(i.flags);
    let v = cpu.reg32[i_rm(i.flags)];
    cpu.set_dr(dr, v);
    Ok(Next)
}

pub(crate) fn op_mov_r_dr(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    check_ring0(cpu)?;
    cpu.reg32[i_rm(i.flags)] = cpu.dr[i_reg(i.flags)];
    Ok(Next)
}

pub(crate) fn smsw(cpu: &Cpu) -> u32 {
    cpu.cr[0]
}

pub(crate) fn lmsw(cpu: &mut Cpu, v: u16) -> HandlerResult {
    check_ring0(cpu)?;
    // LMSW can set PE but never clear it, and touches only the low 4 bits.
    let pe = cpu.cr[0] & CR0_PE;
    let new = (cpu.cr[0] & !0xE) | (v as u32 & 0xF) | pe;
    cpu.set_cr(0, new);
    Ok(Next)
}

pub(crate) fn op_invlpg(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    check_ring0(cpu)?;
    let lin = ea_virt(cpu, i).wrapping_add(cpu.seg_base[crate::decoder::i_seg(i.flags)]);
    cpu.mmu_tlb_invalidate(lin);
    Ok(Next)
}

pub(crate) fn op_clts(cpu: &mut Cpu) -> HandlerResult {
    check_ring0(cpu)?;
    cpu.cr[0] &= !CR0_TS;
    Ok(Next)
}
