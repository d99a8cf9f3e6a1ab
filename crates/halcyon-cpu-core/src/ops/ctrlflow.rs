//! Control transfers: near and far jumps/calls/returns, interrupt and
//! exception delivery, task switches, IRET in all its modes, and the
//! SYSENTER/SYSEXIT fast paths.

use crate::decoder::{i_length, i_op3, i_rm, DecodedInsn, I_ADDR16};
use crate::ops::{ea, Branch, HandlerResult, Next};
use crate::seg::SegDesc;
use crate::state::*;
use crate::Cpu;

/// Stack pushes/pops against an explicit SS image (ring transitions use a
/// stack other than the architectural one until the switch commits).
struct StackOps {
    esp: u32,
    original_esp: u32,
    base: u32,
    mask: u32,
    shift: u32,
}

impl StackOps {
    fn new(esp: u32, base: u32, mask: u32, shift: u32) -> StackOps {
        StackOps {
            esp: esp & mask,
            original_esp: esp,
            base,
            mask,
            shift,
        }
    }

    fn current(cpu: &Cpu) -> StackOps {
        StackOps::new(
            cpu.reg32[ESP],
            cpu.seg_base[SS],
            cpu.esp_mask,
            cpu.tlb_shift_write,
        )
    }

    fn push32(&mut self, cpu: &mut Cpu, v: u32) -> OpResult {
        self.esp = self.esp.wrapping_sub(4) & self.mask;
        cpu.write32(self.esp.wrapping_add(self.base), v, self.shift)
    }

    fn push16(&mut self, cpu: &mut Cpu, v: u16) -> OpResult {
        self.esp = self.esp.wrapping_sub(2) & self.mask;
        cpu.write16(self.esp.wrapping_add(self.base), v, self.shift)
    }

    fn pop32(&mut self, cpu: &mut Cpu) -> OpResult<u32> {
        let v = cpu.read32(self.esp.wrapping_add(self.base), self.shift)?;
        self.esp = self.esp.wrapping_add(4) & self.mask;
        Ok(v)
    }

    fn pop16(&mut self, cpu: &mut Cpu) -> OpResult<u16> {
        let v = cpu.read16(self.esp.wrapping_add(self.base), self.shift)?;
        self.esp = self.esp.wrapping_add(2) & self.mask;
        Ok(v)
    }

    fn adjust(&mut self, n: u32) {
        self.esp = self.esp.wrapping_add(n) & self.mask;
    }

    fn commit(&self, cpu: &mut Cpu) {
        cpu.reg32[ESP] = (self.esp & self.mask) | (self.original_esp & !self.mask);
    }
}

const fn cpl_to_tlb_write(dpl: u32) -> u32 {
    if dpl == 3 {
        TLB_USER_WRITE
    } else {
        TLB_SYSTEM_WRITE
    }
}

// Task-switch flavours.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TaskKind {
    Jmp,
    Call,
    Int,
    Iret,
}

impl Cpu {
    // --- exception entry ------------------------------------------------

    pub fn exception(&mut self, vec: Exception) {
        self.exception_raw(vec as i32, None);
    }

    pub fn exception_with_code(&mut self, vec: Exception, code: i32) {
        self.exception_raw(vec as i32, Some(code));
    }

    fn exception_raw(&mut self, mut vec: i32, mut code: Option<i32>) {
        loop {
            if self.current_exception >= 0 {
                if self.current_exception == 8 {
                    log::error!("triple fault at eip={:08x}", self.virt_eip());
                    panic!("triple fault");
                }
                self.current_exception = 8;
                vec = 8;
                code = Some(0);
            }
            log::trace!(
                "exception {vec:02x}({code:?}) @ eip={:08x} lin={:08x}",
                self.virt_eip(),
                self.lin_eip()
            );
            self.current_exception = vec;
            let eip = self.virt_eip();
            match self.interrupt(vec as u8, code, IntKind::Exception, eip) {
                Ok(()) => break,
                Err(Abort) => {
                    if self.current_exception == -1 {
                        // A nested path already escalated and delivered
                        // (#DF); don't stack another frame on top of it.
                        return;
                    }
                    // Fault while delivering: escalate around the loop.
                }
            }
        }
        self.current_exception = -1;
    }

    // --- TSS helpers ----------------------------------------------------

    fn tss_is_16(&self) -> bool {
        matches!(
            access_type(self.seg_access[SEG_TR]),
            DESC_AVAILABLE_TSS_286 | DESC_BUSY_TSS_286
        )
    }

    fn get_tss_esp(&mut self, level: u32) -> OpResult<u32> {
        let tr_sel = (self.seg[SEG_TR] & 0xFFFC) as i32;
        if self.tss_is_16() {
            let addr = 2 + level * 4;
            if addr + 2 >= self.seg_limit[SEG_TR] {
                self.exception_with_code(Exception::Ts, tr_sel);
                return Err(Abort);
            }
            Ok(self
                .read16(addr.wrapping_add(self.seg_base[SEG_TR]), TLB_SYSTEM_READ)?
                as u32)
        } else {
            let addr = 4 + level * 8;
            if addr + 4 >= self.seg_limit[SEG_TR] {
                self.exception_with_code(Exception::Ts, tr_sel);
                return Err(Abort);
            }
            self.read32(addr.wrapping_add(self.seg_base[SEG_TR]), TLB_SYSTEM_READ)
        }
    }

    fn get_tss_ss(&mut self, level: u32) -> OpResult<u32> {
        let tr_sel = (self.seg[SEG_TR] & 0xFFFC) as i32;
        if self.tss_is_16() {
            let addr = 2 + level * 4 + 2;
            if addr + 2 >= self.seg_limit[SEG_TR] {
                self.exception_with_code(Exception::Ts, tr_sel);
                return Err(Abort);
            }
            Ok(self
                .read16(addr.wrapping_add(self.seg_base[SEG_TR]), TLB_SYSTEM_READ)?
                as u32)
        } else {
            let addr = 4 + level * 8 + 4;
            if addr + 4 >= self.seg_limit[SEG_TR] {
                self.exception_with_code(Exception::Ts, tr_sel);
                return Err(Abort);
            }
            Ok(self
                .read32(addr.wrapping_add(self.seg_base[SEG_TR]), TLB_SYSTEM_READ)?
                & 0xFFFF)
        }
    }

    /// Resolve the TSS selector held in a task gate.
    fn load_tss_from_task_gate(&mut self, gate: &SegDesc) -> OpResult<(u32, SegDesc)> {
        let sel = gate.gate_selector();
        let offset = (sel & 0xFFFC) as i32;
        if selector_is_ldt(sel) {
            self.exception_with_code(Exception::Ts, offset);
            return Err(Abort);
        }
        let desc = self.seg_load_descriptor2(SEG_GDTR, sel, Some(Exception::Gp), offset)?;
        let access = desc.access();
        let ty = access_type(access);
        if ty != DESC_AVAILABLE_TSS_286 && ty != DESC_AVAILABLE_TSS_386 {
            self.exception_with_code(Exception::Gp, offset);
            return Err(Abort);
        }
        if access & ACCESS_P == 0 {
            self.exception_with_code(Exception::Np, offset);
            return Err(Abort);
        }
        Ok((sel, desc))
    }

    // --- the task switch ------------------------------------------------

    pub(crate) fn do_task_switch(
        &mut self,
        sel: u32,
        desc: &SegDesc,
        kind: TaskKind,
        eip: u32,
    ) -> OpResult {
        const TSS_LIMITS: [u32; 2] = [43, 103];
        let offset = (sel & 0xFFFC) as i32;
        let limit = desc.limit();
        let base = desc.base();
        let access = desc.access();
        let tss_type = access_type(access);
        let is32 = tss_type == DESC_AVAILABLE_TSS_386 || tss_type == DESC_BUSY_TSS_386;

        if selector_is_ldt(sel) {
            self.exception_with_code(Exception::Ts, offset);
            return Err(Abort);
        }
        if limit <= TSS_LIMITS[is32 as usize] {
            self.exception_with_code(Exception::Ts, offset);
            return Err(Abort);
        }

        let old_tr_16 = self.tss_is_16();
        let old_tr_limit = TSS_LIMITS[!old_tr_16 as usize];
        let tr_base = self.seg_base[SEG_TR];
        let mut old_eflags = self.get_eflags();

        // Touch both TSS images up front so the state write-back cannot
        // fault halfway through.
        self.access_verify(tr_base, tr_base.wrapping_add(old_tr_limit), TLB_SYSTEM_READ)?;
        self.access_verify(tr_base, tr_base.wrapping_add(old_tr_limit), TLB_SYSTEM_WRITE)?;
        self.access_verify(base, base.wrapping_add(limit.min(0x67)), TLB_SYSTEM_READ)?;

        // JMP and IRET leave the outgoing task non-busy.
        if kind == TaskKind::Jmp || kind == TaskKind::Iret {
            let old_sel = self.seg[SEG_TR] as u32;
            let tbl = if selector_is_ldt(old_sel) {
                SEG_LDTR
            } else {
                SEG_GDTR
            };
            let addr = self.seg_base[tbl].wrapping_add((old_sel & !7) + 5);
            let b = self.read8(addr, TLB_SYSTEM_READ)?;
            self.write8(addr, b & !2, TLB_SYSTEM_WRITE)?;
            if kind == TaskKind::Iret {
                old_eflags &= !EFLAGS_NT;
            }
        }

        // Write the outgoing register state.
        if old_tr_16 {
            self.write16(tr_base.wrapping_add(0x0E), eip as u16, TLB_SYSTEM_WRITE)?;
            self.write16(tr_base.wrapping_add(0x10), old_eflags as u16, TLB_SYSTEM_WRITE)?;
            for r in 0..8 {
                self.write16(
                    tr_base.wrapping_add(0x12 + r * 2),
                    self.reg32[r as usize] as u16,
                    TLB_SYSTEM_WRITE,
                )?;
            }
            for s in 0..4 {
                self.write16(
                    tr_base.wrapping_add(0x22 + s * 2),
                    self.seg[s as usize],
                    TLB_SYSTEM_WRITE,
                )?;
            }
        } else {
            self.write32(tr_base.wrapping_add(0x20), eip, TLB_SYSTEM_WRITE)?;
            self.write32(tr_base.wrapping_add(0x24), old_eflags, TLB_SYSTEM_WRITE)?;
            for r in 0..8 {
                self.write32(
                    tr_base.wrapping_add(0x28 + r * 4),
                    self.reg32[r as usize],
                    TLB_SYSTEM_WRITE,
                )?;
            }
            for s in 0..6 {
                self.write32(
                    tr_base.wrapping_add(0x48 + s * 4),
                    self.seg[s as usize] as u32,
                    TLB_SYSTEM_WRITE,
                )?;
            }
        }

        // CALL/INT record where we came from.
        if kind == TaskKind::Int || kind == TaskKind::Call {
            self.write16(base, self.seg[SEG_TR], TLB_SYSTEM_WRITE)?;
        }

        // Read the incoming register state.
        let mut cr3 = 0u32;
        let new_eip;
        let eflags;
        let mut regs = [0u32; 8];
        let mut segs = [0u32; 6];
        let ldt;
        if is32 {
            cr3 = self.read32(base.wrapping_add(0x1C), TLB_SYSTEM_READ)?;
            new_eip = self.read32(base.wrapping_add(0x20), TLB_SYSTEM_READ)?;
            eflags = self.read32(base.wrapping_add(0x24), TLB_SYSTEM_READ)?;
            for (r, slot) in regs.iter_mut().enumerate() {
                *slot = self.read32(base.wrapping_add(0x28 + r as u32 * 4), TLB_SYSTEM_READ)?;
            }
            for (s, slot) in segs.iter_mut().enumerate() {
                *slot =
                    self.read16(base.wrapping_add(0x48 + s as u32 * 4), TLB_SYSTEM_READ)? as u32;
            }
            ldt = self.read32(base.wrapping_add(0x60), TLB_SYSTEM_READ)? & 0xFFFF;
        } else {
            new_eip = self.read16(base.wrapping_add(0x0E), TLB_SYSTEM_READ)? as u32;
            eflags = self.read16(base.wrapping_add(0x10), TLB_SYSTEM_READ)? as u32;
            for (r, slot) in regs.iter_mut().enumerate() {
                *slot = self.read16(base.wrapping_add(0x12 + r as u32 * 2), TLB_SYSTEM_READ)?
                    as u32
                    | 0xFFFF_0000;
            }
            for (s, slot) in segs.iter_mut().enumerate().take(4) {
                *slot =
                    self.read16(base.wrapping_add(0x22 + s as u32 * 2), TLB_SYSTEM_READ)? as u32;
            }
            ldt = self.read16(base.wrapping_add(0x2A), TLB_SYSTEM_READ)? as u32;
            segs[FS] = 0;
            segs[GS] = 0;
        }

        // Mark the incoming task busy except on JMP/IRET's inverse.
        if kind != TaskKind::Iret {
            let addr = self.seg_base[SEG_GDTR].wrapping_add((sel & !7) + 5);
            let b = self.read8(addr, TLB_SYSTEM_READ)?;
            self.write8(addr, b | 2, TLB_SYSTEM_WRITE)?;
        }

        self.cr[0] |= CR0_TS;
        self.seg[SEG_TR] = sel as u16;
        self.seg_base[SEG_TR] = base;
        self.seg_limit[SEG_TR] = limit;
        self.seg_access[SEG_TR] = access | 2; // busy form
        self.seg_valid[SEG_TR] = SEG_VALID_READABLE | SEG_VALID_WRITABLE;

        if is32 && cr3 != self.cr[3] {
            self.set_cr(3, cr3);
        }

        self.set_virt_eip(new_eip);
        let eflags_mask: u32 = if is32 { !0 } else { 0xFFFF };
        let mut eflags = eflags;
        if kind == TaskKind::Call || kind == TaskKind::Int {
            // The incoming task is nested.
            eflags |= EFLAGS_NT;
        }
        self.set_eflags((eflags & eflags_mask) | (self.eflags & !eflags_mask));
        self.reg32[..8].copy_from_slice(&regs);

        if eflags & EFLAGS_VM != 0 {
            for s in 0..6 {
                self.seg_load_virtual(s, segs[s] as u16);
            }
            self.cpl = 3;
        } else {
            for s in 0..6 {
                self.seg[s] = segs[s] as u16;
            }
            self.cpl = segs[CS] & 3;
        }
        self.update_cpl_shifts();

        // LDT reload.
        if selector_is_ldt(ldt) {
            self.exception_with_code(Exception::Ts, offset);
            return Err(Abort);
        }
        let ldt_offset = (ldt & 0xFFFC) as i32;
        if ldt_offset != 0 {
            let ldt_desc =
                self.seg_load_descriptor2(SEG_GDTR, ldt, Some(Exception::Ts), ldt_offset)?;
            let ldt_access = ldt_desc.access();
            if access_type(ldt_access) != DESC_LDT || ldt_access & ACCESS_P == 0 {
                self.exception_with_code(Exception::Ts, ldt_offset);
                return Err(Abort);
            }
            self.seg[SEG_LDTR] = ldt as u16;
            self.seg_base[SEG_LDTR] = ldt_desc.base();
            self.seg_limit[SEG_LDTR] = ldt_desc.limit();
            self.seg_access[SEG_LDTR] = ldt_access;
        }

        if self.eflags & EFLAGS_VM != 0 {
            self.reload_cs_base();
            return Ok(());
        }

        // Reload and validate each segment against its TSS rules.
        for s in 0..6usize {
            let sel = segs[s];
            let sel_offs = (sel & 0xFFFC) as i32;
            match s {
                CS | SS => {
                    if sel_offs == 0 {
                        self.exception_with_code(Exception::Ts, 0);
                        return Err(Abort);
                    }
                    let mut desc =
                        self.seg_load_descriptor(sel, Some(Exception::Ts), sel_offs)?;
                    let acc = desc.access();
                    if acc & ACCESS_P == 0 {
                        self.exception_with_code(Exception::Ts, sel_offs);
                        return Err(Abort);
                    }
                    let ok = match access_type(acc) {
                        0x12 | 0x13 | 0x16 | 0x17 => {
                            s == SS
                                && !(self.cpl != selector_rpl(sel)
                                    && self.cpl != access_dpl(acc))
                        }
                        0x18..=0x1B => s == CS && access_dpl(acc) == selector_rpl(sel),
                        0x1C..=0x1F => s == CS && access_dpl(acc) <= selector_rpl(sel),
                        _ => false,
                    };
                    if !ok {
                        self.exception_with_code(Exception::Ts, sel_offs);
                        return Err(Abort);
                    }
                    if s == CS {
                        self.load_csip_protected(sel as u16, &mut desc, new_eip)?;
                    } else {
                        self.seg_load_protected(s, sel as u16, &mut desc)?;
                    }
                }
                _ => {
                    if sel_offs == 0 {
                        self.seg_base[s] = 0;
                        self.seg_limit[s] = 0;
                        self.seg_access[s] = 0;
                        continue;
                    }
                    let mut desc =
                        self.seg_load_descriptor(sel, Some(Exception::Ts), sel_offs)?;
                    let acc = desc.access();
                    if acc & ACCESS_P == 0 {
                        self.exception_with_code(Exception::Ts, sel_offs);
                        return Err(Abort);
                    }
                    match access_type(acc) {
                        0x10..=0x17 | 0x1A | 0x1B => {
                            let dpl = access_dpl(acc);
                            if dpl < selector_rpl(sel) || dpl < self.cpl {
                                self.exception_with_code(Exception::Ts, sel_offs);
                                return Err(Abort);
                            }
                        }
                        0x1E | 0x1F => {}
                        _ => {
                            self.exception_with_code(Exception::Ts, sel_offs);
                            return Err(Abort);
                        }
                    }
                    self.seg_load_protected(s, sel as u16, &mut desc)?;
                }
            }
        }
        Ok(())
    }

    // --- interrupt delivery ---------------------------------------------

    /// Deliver vector `vector`. `code` is pushed for exceptions that carry
    /// one. `return_eip` is the EIP image the handler will IRET to.
    pub fn interrupt(
        &mut self,
        vector: u8,
        code: Option<i32>,
        kind: IntKind,
        return_eip: u32,
    ) -> OpResult {
        if self.cr[0] & CR0_PE == 0 {
            // Real mode: IVT at linear 0.
            let mut stack = StackOps::current(self);
            stack.shift = TLB_SYSTEM_WRITE;
            let flags16 = self.get_eflags() as u16;
            stack.push16(self, flags16)?;
            let sel = self.seg[CS];
            stack.push16(self, sel)?;
            stack.push16(self, return_eip as u16)?;
            stack.commit(self);
            let entry = self.read32((vector as u32) << 2, TLB_SYSTEM_READ)?;
            self.load_csip_real((entry >> 16) as u16, entry & 0xFFFF);
            self.eflags &= !(EFLAGS_IF | EFLAGS_TF | EFLAGS_AC);
            return Ok(());
        }

        if self.eflags & EFLAGS_VM != 0 && kind == IntKind::Software {
            if self.cr[4] & CR4_VME != 0 {
                if self.seg_limit[SEG_TR] < 0x67 {
                    self.exception_with_code(Exception::Gp, 0);
                    return Err(Abort);
                }
                let io_offset =
                    self.read16(self.seg_base[SEG_TR].wrapping_add(0x66), TLB_SYSTEM_READ)?
                        as u32;
                // Redirection bitmap sits immediately below the I/O bitmap.
                let byte_addr = self.seg_base[SEG_TR]
                    .wrapping_add(io_offset)
                    .wrapping_sub(1)
                    .wrapping_sub((!vector as u32 & 0xFF) >> 3);
                let entry = self.read8(byte_addr, TLB_SYSTEM_READ)?;
                if entry & (1 << (vector & 7)) == 0 {
                    // Redirect through the real-mode vector without leaving
                    // V8086.
                    let mut flags_image = self.get_eflags();
                    if self.iopl() < 3 {
                        flags_image &= !EFLAGS_IF;
                        if self.eflags & EFLAGS_VIF != 0 {
                            flags_image |= EFLAGS_IF;
                        }
                        flags_image |= EFLAGS_IOPL;
                    }
                    let entry = self.read32((vector as u32) << 2, TLB_SYSTEM_READ)?;
                    let mut stack = StackOps::current(self);
                    stack.shift = TLB_USER_WRITE;
                    stack.push16(self, flags_image as u16)?;
                    let sel = self.seg[CS];
                    stack.push16(self, sel)?;
                    stack.push16(self, return_eip as u16)?;
                    stack.commit(self);
                    let masked = if self.iopl() == 3 {
                        EFLAGS_IF
                    } else {
                        EFLAGS_VIF
                    };
                    self.eflags &= !(masked | EFLAGS_TF);
                    self.load_csip_virtual((entry >> 16) as u16, entry & 0xFFFF);
                    return Ok(());
                }
                // Not redirected: fall through to the IDT (which requires
                // IOPL 3 for software interrupts from V8086).
            }
            if self.iopl() < 3 {
                self.exception_with_code(Exception::Gp, 0);
                return Err(Abort);
            }
        }

        let offset = (vector as i32) << 3;
        let is_hw = (kind == IntKind::Hardware) as i32;
        let err = |o: i32, ext: i32| o | ext << 1 | is_hw;

        let idt_entry = self.seg_load_descriptor2(
            SEG_IDTR,
            offset as u32,
            Some(Exception::Gp),
            err(offset, 1),
        )?;
        let idt_access = idt_entry.access();
        let idt_type = access_type(idt_access);

        match idt_type {
            DESC_TASK_GATE => {
                if idt_access & ACCESS_P == 0 {
                    self.exception_with_code(Exception::Np, err(offset, 1));
                    return Err(Abort);
                }
                let (tss_sel, tss_desc) = self.load_tss_from_task_gate(&idt_entry)?;
                self.do_task_switch(tss_sel, &tss_desc, TaskKind::Int, return_eip)?;
                if let Some(code) = code {
                    let mut stack = StackOps::current(self);
                    if self.tss_is_16() {
                        stack.push16(self, code as u16)?;
                    } else {
                        stack.push32(self, code as u32)?;
                    }
                    stack.commit(self);
                }
                Ok(())
            }
            DESC_INTERRUPT_GATE_286
            | DESC_INTERRUPT_GATE_386
            | DESC_TRAP_GATE_286
            | DESC_TRAP_GATE_386 => {
                let gate_dpl = access_dpl(idt_access);
                if kind == IntKind::Software && gate_dpl < self.cpl {
                    self.exception_with_code(Exception::Gp, err(offset, 1));
                    return Err(Abort);
                }
                if idt_access & ACCESS_P == 0 {
                    self.exception_with_code(Exception::Np, err(offset, 0));
                    return Err(Abort);
                }

                let cs = idt_entry.gate_selector();
                let cs_offset = (cs & 0xFFFC) as i32;
                let mut eip = idt_entry.gate_offset();
                if cs_offset == 0 {
                    self.exception_with_code(Exception::Gp, err(0, 0));
                    return Err(Abort);
                }
                let mut cs_info =
                    self.seg_load_descriptor(cs, Some(Exception::Gp), err(cs_offset, 0))?;
                let cs_access = cs_info.access();
                let cs_type = access_type(cs_access);
                if !(0x18..=0x1F).contains(&cs_type) {
                    self.exception_with_code(Exception::Gp, err(cs_offset, 0));
                    return Err(Abort);
                }
                let dpl = access_dpl(cs_access);
                if dpl > self.cpl {
                    self.exception_with_code(Exception::Gp, err(cs_offset, 0));
                    return Err(Abort);
                }
                if cs_access & ACCESS_P == 0 {
                    self.exception_with_code(Exception::Np, err(cs_offset, 0));
                    return Err(Abort);
                }
                let is32gate = idt_type & 8 != 0;
                if !is32gate {
                    eip &= 0xFFFF;
                }

                let old_esp = self.reg32[ESP];
                let old_ss = self.seg[SS];
                let old_cs = self.seg[CS];

                let non_conforming = (0x18..=0x1B).contains(&cs_type);
                let to_inner = non_conforming && dpl < self.cpl;

                let (mut stack, ring_change, new_ss, ss_info) = if to_inner {
                    if dpl != 0 && self.eflags & EFLAGS_VM != 0 {
                        self.exception_with_code(Exception::Gp, err(cs_offset, 0));
                        return Err(Abort);
                    }
                    let esp = self.get_tss_esp(dpl)?;
                    let ss = self.get_tss_ss(dpl)?;
                    let ss_offset = (ss & 0xFFFC) as i32;
                    if ss_offset == 0 {
                        self.exception_with_code(Exception::Ts, err(ss_offset, 0));
                        return Err(Abort);
                    }
                    let ss_info =
                        self.seg_load_descriptor(ss, Some(Exception::Ts), err(ss_offset, 0))?;
                    let ss_access = ss_info.access();
                    if selector_rpl(ss) != dpl || access_dpl(ss_access) != dpl {
                        self.exception_with_code(Exception::Ts, err(ss_offset, 0));
                        return Err(Abort);
                    }
                    if !matches!(access_type(ss_access), 0x12 | 0x13 | 0x16 | 0x17) {
                        self.exception_with_code(Exception::Ts, err(ss_offset, 0));
                        return Err(Abort);
                    }
                    if ss_access & ACCESS_P == 0 {
                        self.exception_with_code(Exception::Ss, err(ss_offset, 0));
                        return Err(Abort);
                    }
                    let esp_mask: u32 = if ss_access & ACCESS_B != 0 { !0 } else { 0xFFFF };
                    let ss_base = ss_info.base();
                    // Merge with the old high ESP bits under a 16-bit stack.
                    let esp = (esp & esp_mask) | (self.reg32[ESP] & !esp_mask);
                    (
                        StackOps::new(esp, ss_base, esp_mask, cpl_to_tlb_write(dpl)),
                        true,
                        ss,
                        Some(ss_info),
                    )
                } else {
                    // Same privilege (or conforming): stay on this stack.
                    if self.eflags & EFLAGS_VM != 0 && dpl != self.cpl {
                        self.exception_with_code(Exception::Gp, err(cs_offset, 0));
                        return Err(Abort);
                    }
                    let mut s = StackOps::current(self);
                    s.shift = cpl_to_tlb_write(dpl);
                    (s, false, 0, None)
                };

                if is32gate {
                    if self.eflags & EFLAGS_VM != 0 {
                        let sel = self.seg[GS] as u32;
                        stack.push32(self, sel)?;
                        let sel = self.seg[FS] as u32;
                        stack.push32(self, sel)?;
                        let sel = self.seg[DS] as u32;
                        stack.push32(self, sel)?;
                        let sel = self.seg[ES] as u32;
                        stack.push32(self, sel)?;
                        for s in [GS, FS, DS, ES] {
                            self.seg[s] = 0;
                            self.seg_base[s] = 0;
                            self.seg_limit[s] = 0;
                            self.seg_access[s] = 0;
                        }
                    }
                    if ring_change {
                        stack.push32(self, old_ss as u32)?;
                        stack.push32(self, old_esp)?;
                    }
                    let flags32 = self.get_eflags();
                    stack.push32(self, flags32)?;
                    stack.push32(self, old_cs as u32)?;
                    stack.push32(self, return_eip)?;
                    if let Some(code) = code {
                        stack.push32(self, code as u32)?;
                    }
                } else {
                    if self.eflags & EFLAGS_VM != 0 {
                        let sel = self.seg[GS];
                        stack.push16(self, sel)?;
                        let sel = self.seg[FS];
                        stack.push16(self, sel)?;
                        let sel = self.seg[DS];
                        stack.push16(self, sel)?;
                        let sel = self.seg[ES];
                        stack.push16(self, sel)?;
                        for s in [GS, FS, DS, ES] {
                            self.seg[s] = 0;
                            self.seg_base[s] = 0;
                            self.seg_limit[s] = 0;
                            self.seg_access[s] = 0;
                        }
                    }
                    if ring_change {
                        stack.push16(self, old_ss)?;
                        stack.push16(self, old_esp as u16)?;
                    }
                    let flags16 = self.get_eflags() as u16;
                    stack.push16(self, flags16)?;
                    stack.push16(self, old_cs)?;
                    stack.push16(self, return_eip as u16)?;
                    if let Some(code) = code {
                        stack.push16(self, code as u16)?;
                    }
                }

                if ring_change {
                    let mut ss_info = ss_info.unwrap();
                    // Commit against the NEW stack segment.
                    self.seg_load_protected(SS, ((new_ss & !3) | dpl) as u16, &mut ss_info)?;
                    self.reg32[ESP] =
                        (stack.esp & stack.mask) | (self.reg32[ESP] & !stack.mask);
                    self.load_csip_protected(((cs & !3) | dpl) as u16, &mut cs_info, eip)?;
                } else {
                    stack.commit(self);
                    let cpl = self.cpl;
                    self.load_csip_protected(((cs & !3) | cpl) as u16, &mut cs_info, eip)?;
                }

                self.eflags &= !(EFLAGS_TF | EFLAGS_VM | EFLAGS_RF | EFLAGS_NT);
                self.update_cpl_shifts();
                if idt_type & 1 == 0 {
                    // Interrupt gates (types 6 and 14) clear IF.
                    self.eflags &= !EFLAGS_IF;
                }
                Ok(())
            }
            _ => {
                self.exception_with_code(Exception::Gp, err(offset, 1));
                Err(Abort)
            }
        }
    }

    // --- far jump / call / return / iret --------------------------------

    pub(crate) fn jmpf(&mut self, eip: u32, cs: u32, eip_after: u32) -> OpResult {
        if self.cr[0] & CR0_PE == 0 || self.eflags & EFLAGS_VM != 0 {
            self.load_csip_real(cs as u16, eip);
            return Ok(());
        }
        let offset = (cs & !3) as i32;
        let rpl = selector_rpl(cs);
        if offset == 0 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        let mut info = self.seg_load_descriptor(cs, Some(Exception::Gp), offset)?;
        let access = info.access();
        if access & ACCESS_P == 0 {
            self.exception_with_code(Exception::Np, offset);
            return Err(Abort);
        }
        let dpl = access_dpl(access);
        match access_type(access) {
            0x18..=0x1B => {
                if rpl > self.cpl || dpl != self.cpl {
                    self.exception_with_code(Exception::Gp, offset);
                    return Err(Abort);
                }
                self.load_csip_protected((offset as u32 | self.cpl) as u16, &mut info, eip)
            }
            0x1C..=0x1F => {
                if dpl > self.cpl {
                    self.exception_with_code(Exception::Gp, offset);
                    return Err(Abort);
                }
                self.load_csip_protected((offset as u32 | self.cpl) as u16, &mut info, eip)
            }
            DESC_CALL_GATE_286 | DESC_CALL_GATE_386 => {
                if dpl < self.cpl || dpl < rpl {
                    self.exception_with_code(Exception::Gp, offset);
                    return Err(Abort);
                }
                let gate_cs = info.gate_selector();
                let mut gate_eip = info.gate_offset();
                let gate_cs_offset = (gate_cs & !3) as i32;
                let mut gate_info =
                    self.seg_load_descriptor(gate_cs, Some(Exception::Gp), gate_cs_offset)?;
                let gate_access = gate_info.access();
                let gdpl = access_dpl(gate_access);
                match access_type(gate_access) {
                    0x1C..=0x1F => {
                        if gdpl > self.cpl {
                            self.exception_with_code(Exception::Gp, gate_cs_offset);
                            return Err(Abort);
                        }
                    }
                    0x18..=0x1B => {
                        if gdpl != self.cpl {
                            self.exception_with_code(Exception::Gp, gate_cs_offset);
                            return Err(Abort);
                        }
                    }
                    other => {
                        log::trace!("jump through unsupported gate target type {other:02x}");
                        self.exception_with_code(Exception::Gp, gate_cs_offset);
                        return Err(Abort);
                    }
                }
                if gate_access & ACCESS_P == 0 {
                    self.exception_with_code(Exception::Np, gate_cs_offset);
                    return Err(Abort);
                }
                if access_type(access) == DESC_CALL_GATE_286 {
                    gate_eip &= 0xFFFF;
                }
                self.load_csip_protected(
                    (gate_cs_offset as u32 | self.cpl) as u16,
                    &mut gate_info,
                    gate_eip,
                )
            }
            DESC_AVAILABLE_TSS_286 | DESC_AVAILABLE_TSS_386 => {
                if dpl < self.cpl || dpl < rpl {
                    self.exception_with_code(Exception::Gp, offset);
                    return Err(Abort);
                }
                self.do_task_switch(cs, &info, TaskKind::Jmp, eip_after)
            }
            DESC_TASK_GATE => {
                if dpl < self.cpl || dpl < rpl {
                    self.exception_with_code(Exception::Gp, offset);
                    return Err(Abort);
                }
                let (tss_sel, tss_desc) = self.load_tss_from_task_gate(&info)?;
                self.do_task_switch(tss_sel, &tss_desc, TaskKind::Jmp, eip_after)
            }
            _ => {
                self.exception_with_code(Exception::Gp, offset);
                Err(Abort)
            }
        }
    }

    pub(crate) fn callf(&mut self, eip: u32, cs: u32, oldeip: u32, is32: bool) -> OpResult {
        if self.cr[0] & CR0_PE == 0 || self.eflags & EFLAGS_VM != 0 {
            let mut stack = StackOps::current(self);
            if is32 {
                let sel = self.seg[CS] as u32;
                stack.push32(self, sel)?;
                stack.push32(self, oldeip)?;
            } else {
                let sel = self.seg[CS];
                stack.push16(self, sel)?;
                stack.push16(self, oldeip as u16)?;
            }
            stack.commit(self);
            if self.cr[0] & CR0_PE != 0 {
                self.load_csip_virtual(cs as u16, eip);
            } else {
                self.load_csip_real(cs as u16, eip);
            }
            return Ok(());
        }

        let cs = cs & 0xFFFF;
        let cs_offset = (cs & 0xFFFC) as i32;
        if cs_offset == 0 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        let mut cs_info = self.seg_load_descriptor(cs, Some(Exception::Gp), cs_offset)?;
        let cs_access = cs_info.access();
        if cs_access & ACCESS_P == 0 {
            self.exception_with_code(Exception::Np, cs_offset);
            return Err(Abort);
        }
        let cs_type = access_type(cs_access);
        let cs_dpl = access_dpl(cs_access);
        let cs_rpl = selector_rpl(cs);

        match cs_type {
            0x1C..=0x1F => {
                if cs_dpl > self.cpl {
                    self.exception_with_code(Exception::Gp, cs_offset);
                    return Err(Abort);
                }
            }
            0x18..=0x1B => {
                if cs_rpl > self.cpl || cs_dpl != self.cpl {
                    self.exception_with_code(Exception::Gp, cs_offset);
                    return Err(Abort);
                }
            }
            DESC_CALL_GATE_286 | DESC_CALL_GATE_386 => {
                return self.call_gate(&cs_info, cs_type, cs_dpl, cs_rpl, cs_offset, oldeip)
            }
            DESC_AVAILABLE_TSS_286 | DESC_AVAILABLE_TSS_386 => {
                if cs_dpl < self.cpl || cs_dpl < cs_rpl {
                    self.exception_with_code(Exception::Gp, cs_offset);
                    return Err(Abort);
                }
                return self.do_task_switch(cs, &cs_info, TaskKind::Call, oldeip);
            }
            DESC_TASK_GATE => {
                if cs_dpl < self.cpl || cs_dpl < cs_rpl {
                    self.exception_with_code(Exception::Gp, cs_offset);
                    return Err(Abort);
                }
                let (tss_sel, tss_desc) = self.load_tss_from_task_gate(&cs_info)?;
                return self.do_task_switch(tss_sel, &tss_desc, TaskKind::Call, oldeip);
            }
            _ => {
                self.exception_with_code(Exception::Gp, cs_offset);
                return Err(Abort);
            }
        }

        // Plain code-segment far call.
        let mut stack = StackOps::current(self);
        if is32 {
            let sel = self.seg[CS] as u32;
            stack.push32(self, sel)?;
            stack.push32(self, oldeip)?;
        } else {
            let sel = self.seg[CS];
            stack.push16(self, sel)?;
            stack.push16(self, oldeip as u16)?;
        }
        self.load_csip_protected(((cs & !3) | self.cpl) as u16, &mut cs_info, eip)?;
        stack.commit(self);
        Ok(())
    }

    /// The call-gate leg of `callf`, including the inner-ring parameter
    /// copy from the caller's stack to the target ring's stack.
    fn call_gate(
        &mut self,
        gate: &SegDesc,
        gate_kind: u32,
        gate_dpl: u32,
        gate_rpl: u32,
        gate_sel_offset: i32,
        oldeip: u32,
    ) -> OpResult {
        if gate_dpl < self.cpl || gate_dpl < gate_rpl {
            self.exception_with_code(Exception::Gp, gate_sel_offset);
            return Err(Abort);
        }
        let target_cs = gate.gate_selector();
        let target_cs_offset = (target_cs & 0xFFFC) as i32;
        let mut gate_eip = gate.gate_offset();
        if target_cs_offset == 0 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        let mut target_info =
            self.seg_load_descriptor(target_cs, Some(Exception::Gp), target_cs_offset)?;
        let target_access = target_info.access();
        let target_dpl = access_dpl(target_access);
        let target_type = access_type(target_access);
        let is32gate = gate_kind == DESC_CALL_GATE_386;
        if !is32gate {
            gate_eip &= 0xFFFF;
        }

        match target_type {
            0x18..=0x1B if target_dpl < self.cpl => {
                // More privilege: switch to the target ring's stack.
                let ss = self.get_tss_ss(target_dpl)?;
                let esp = self.get_tss_esp(target_dpl)?;
                let ss_offset = (ss & 0xFFFC) as i32;
                if ss_offset == 0 {
                    self.exception_with_code(Exception::Ts, 0);
                    return Err(Abort);
                }
                let mut ss_info =
                    self.seg_load_descriptor(ss, Some(Exception::Ts), ss_offset)?;
                let ss_access = ss_info.access();
                if access_dpl(ss_access) != target_dpl
                    || !matches!(access_type(ss_access), 0x12 | 0x13 | 0x16 | 0x17)
                {
                    self.exception_with_code(Exception::Ts, ss_offset);
                    return Err(Abort);
                }
                if ss_access & ACCESS_P == 0 {
                    self.exception_with_code(Exception::Ts, ss_offset);
                    return Err(Abort);
                }

                let param_count = gate.gate_param_count() as usize;
                let mut params = [0u32; 32];
                let old_esp = self.reg32[ESP] & self.esp_mask;
                // Read the parameters under the caller's stack segment.
                for n in 0..param_count {
                    let k = param_count - 1 - n;
                    if is32gate {
                        let addr = old_esp.wrapping_add((k as u32) << 2) & self.esp_mask;
                        if addr.wrapping_add(3) > self.seg_limit[SS] {
                            self.exception_with_code(Exception::Ss, 0);
                            return Err(Abort);
                        }
                        params[n] =
                            self.read32(addr.wrapping_add(self.seg_base[SS]), self.tlb_shift_read)?;
                    } else {
                        let addr = old_esp.wrapping_add((k as u32) << 1) & self.esp_mask;
                        if addr.wrapping_add(1) > self.seg_limit[SS] {
                            self.exception_with_code(Exception::Ss, 0);
                            return Err(Abort);
                        }
                        params[n] = self
                            .read16(addr.wrapping_add(self.seg_base[SS]), self.tlb_shift_read)?
                            as u32;
                    }
                }

                let ss_mask: u32 = if ss_access & ACCESS_B != 0 { !0 } else { 0xFFFF };
                let ss_base = ss_info.base();
                let esp = (esp & ss_mask) | (self.reg32[ESP] & !ss_mask);
                let mut stack =
                    StackOps::new(esp, ss_base, ss_mask, cpl_to_tlb_write(target_dpl));
                if is32gate {
                    let sel = self.seg[SS] as u32;
                    stack.push32(self, sel)?;
                    stack.push32(self, old_esp)?;
                    for n in 0..param_count {
                        stack.push32(self, params[n])?;
                    }
                    let sel = self.seg[CS] as u32;
                    stack.push32(self, sel)?;
                    stack.push32(self, oldeip)?;
                } else {
                    let sel = self.seg[SS];
                    stack.push16(self, sel)?;
                    stack.push16(self, old_esp as u16)?;
                    for n in 0..param_count {
                        stack.push16(self, params[n] as u16)?;
                    }
                    let sel = self.seg[CS];
                    stack.push16(self, sel)?;
                    stack.push16(self, oldeip as u16)?;
                }
                self.seg_load_protected(SS, ((ss & !3) | target_dpl) as u16, &mut ss_info)?;
                self.reg32[ESP] = (stack.esp & stack.mask) | (self.reg32[ESP] & !stack.mask);
                self.load_csip_protected(
                    ((target_cs & !3) | target_dpl) as u16,
                    &mut target_info,
                    gate_eip,
                )?;
                Ok(())
            }
            0x18..=0x1B if target_dpl > self.cpl => {
                self.exception_with_code(Exception::Gp, target_cs_offset);
                Err(Abort)
            }
            0x18..=0x1B | 0x1C..=0x1F => {
                // Same privilege: plain transfer through the gate.
                if (0x1C..=0x1F).contains(&target_type) && target_dpl > self.cpl {
                    self.exception_with_code(Exception::Gp, target_cs_offset);
                    return Err(Abort);
                }
                let mut stack = StackOps::current(self);
                if is32gate {
                    let sel = self.seg[CS] as u32;
                    stack.push32(self, sel)?;
                    stack.push32(self, oldeip)?;
                } else {
                    let sel = self.seg[CS];
                    stack.push16(self, sel)?;
                    stack.push16(self, oldeip as u16)?;
                }
                self.load_csip_protected(
                    ((target_cs & !3) | self.cpl) as u16,
                    &mut target_info,
                    gate_eip,
                )?;
                stack.commit(self);
                Ok(())
            }
            _ => {
                self.exception_with_code(Exception::Gp, target_cs_offset);
                Err(Abort)
            }
        }
    }

    /// IRET's outer-ring data-segment rule: segments the returning ring may
    /// no longer touch get cleared.
    fn iret_handle_seg(&mut self, s: usize) {
        let access = self.seg_access[s];
        let invalid = if self.seg[s] & 0xFFFC == 0 {
            true
        } else if self.cpl > access_dpl(access) {
            matches!(access_type(access), 0x10..=0x17 | 0x1C..=0x1F)
        } else {
            false
        };
        if invalid {
            self.seg[s] = 0;
            self.seg_access[s] = 0;
            self.seg_base[s] = 0;
            self.seg_limit[s] = 0;
            self.seg_valid[s] = 0;
        }
    }

    pub fn iret(&mut self, tss_eip: u32, is32: bool) -> OpResult {
        if self.cr[0] & CR0_PE == 0 {
            let mut stack = StackOps::current(self);
            let (eip, cs, eflags) = if is32 {
                let e = stack.pop32(self)?;
                let c = stack.pop32(self)?;
                let f = stack.pop32(self)?;
                (e, c, f)
            } else {
                let e = stack.pop16(self)? as u32;
                let c = stack.pop16(self)? as u32;
                let f = stack.pop16(self)? as u32;
                (e, c, f)
            };
            stack.commit(self);
            self.load_csip_real(cs as u16, eip);
            if is32 {
                self.set_eflags((eflags & 0x25_7FD5) | (self.eflags & 0x1A_0000));
            } else {
                self.set_eflags(eflags | (self.eflags & !0xFFFF));
            }
            return Ok(());
        }

        if self.eflags & EFLAGS_VM != 0 {
            // V8086 iret.
            if self.iopl() == 3 {
                let mut stack = StackOps::current(self);
                let (eip, cs, eflags, mask) = if is32 {
                    let e = stack.pop32(self)?;
                    let c = stack.pop32(self)?;
                    let f = stack.pop32(self)?;
                    (e, c, f, EFLAGS_VM | EFLAGS_IOPL | EFLAGS_VIP | EFLAGS_VIF)
                } else {
                    let e = stack.pop16(self)? as u32;
                    let c = stack.pop16(self)? as u32;
                    let f = stack.pop16(self)? as u32;
                    (e, c, f, EFLAGS_IOPL | 0xFFFF_0000)
                };
                stack.commit(self);
                self.load_csip_virtual(cs as u16, eip);
                self.set_eflags((eflags & !mask) | (self.eflags & mask));
                return Ok(());
            }
            if self.cr[4] & CR4_VME != 0 && !is32 {
                let mut stack = StackOps::current(self);
                let eip = stack.pop16(self)? as u32;
                let cs = stack.pop16(self)? as u32;
                let eflags = stack.pop16(self)? as u32;
                if (self.eflags & EFLAGS_VIP != 0 && eflags & EFLAGS_IF != 0)
                    || eflags & EFLAGS_TF != 0
                {
                    self.exception_with_code(Exception::Gp, 0);
                    return Err(Abort);
                }
                stack.commit(self);
                self.load_csip_virtual(cs as u16, eip);
                if eflags & EFLAGS_IF != 0 {
                    self.eflags |= EFLAGS_VIF;
                } else {
                    self.eflags &= !EFLAGS_VIF;
                }
                let mask = 0xFFFF ^ (EFLAGS_IOPL | EFLAGS_IF);
                self.set_eflags((eflags & mask) | (self.eflags & !mask));
                return Ok(());
            }
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }

        if self.eflags & EFLAGS_NT != 0 {
            // Nested task: follow the back link.
            let back = self.read16(self.seg_base[SEG_TR], TLB_SYSTEM_READ)? as u32;
            let back_offset = (back & 0xFFFC) as i32;
            if selector_is_ldt(back) {
                self.exception_with_code(Exception::Ts, back as i32);
                return Err(Abort);
            }
            let info =
                self.seg_load_descriptor2(SEG_GDTR, back, Some(Exception::Ts), back_offset)?;
            let ty = access_type(info.access());
            if ty == DESC_BUSY_TSS_286 || ty == DESC_BUSY_TSS_386 {
                return self.do_task_switch(back, &info, TaskKind::Iret, tss_eip);
            }
            self.exception_with_code(Exception::Ts, back_offset);
            return Err(Abort);
        }

        let old_cpl = self.cpl;
        let mut stack = StackOps::current(self);
        let (eip, cs, eflags) = if is32 {
            let e = stack.pop32(self)?;
            let c = stack.pop32(self)? & 0xFFFF;
            let f = stack.pop32(self)?;
            (e, c, f)
        } else {
            let e = stack.pop16(self)? as u32;
            let c = stack.pop16(self)? as u32;
            let f = stack.pop16(self)? as u32;
            (e, c, f)
        };

        if is32 && eflags & EFLAGS_VM != 0 && self.cpl == 0 {
            // Protected mode back into V8086.
            let esp = stack.pop32(self)?;
            let ss = stack.pop32(self)?;
            let es = stack.pop32(self)?;
            let ds = stack.pop32(self)?;
            let fs = stack.pop32(self)?;
            let gs = stack.pop32(self)?;
            self.seg_load_virtual(ES, es as u16);
            self.seg_load_virtual(DS, ds as u16);
            self.seg_load_virtual(FS, fs as u16);
            self.seg_load_virtual(GS, gs as u16);
            self.seg_load_virtual(SS, ss as u16);
            self.set_eflags(eflags);
            self.load_csip_virtual(cs as u16, eip & 0xFFFF);
            self.reg32[ESP] = esp;
            self.cpl = 3;
            self.update_cpl_shifts();
            return Ok(());
        }

        let cs_offset = (cs & 0xFFFC) as i32;
        if cs_offset == 0 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        let mut cs_info = self.seg_load_descriptor(cs, Some(Exception::Gp), cs_offset)?;
        let access = cs_info.access();
        let dpl = access_dpl(access);
        let rpl = selector_rpl(cs);
        if rpl < self.cpl {
            self.exception_with_code(Exception::Gp, cs_offset);
            return Err(Abort);
        }
        match access_type(access) {
            0x18..=0x1B => {
                if dpl != rpl {
                    self.exception_with_code(Exception::Gp, cs_offset);
                    return Err(Abort);
                }
            }
            0x1C..=0x1F => {
                if dpl > rpl {
                    self.exception_with_code(Exception::Gp, cs_offset);
                    return Err(Abort);
                }
            }
            _ => {
                self.exception_with_code(Exception::Gp, cs_offset);
                return Err(Abort);
            }
        }
        if access & ACCESS_P == 0 {
            self.exception_with_code(Exception::Np, cs_offset);
            return Err(Abort);
        }

        if rpl != self.cpl {
            // Return to an outer ring: pop its SS:ESP too.
            let (esp, ss) = if is32 {
                let e = stack.pop32(self)?;
                let s = stack.pop32(self)? & 0xFFFF;
                (e, s)
            } else {
                let e = stack.pop16(self)? as u32;
                let s = stack.pop16(self)? as u32;
                (e, s)
            };
            let ss_offset = (ss & 0xFFFC) as i32;
            if ss_offset == 0 {
                self.exception_with_code(Exception::Gp, 0);
                return Err(Abort);
            }
            let mut ss_info = self.seg_load_descriptor(ss, Some(Exception::Gp), ss_offset)?;
            let ss_access = ss_info.access();
            if selector_rpl(ss) != rpl
                || access_dpl(ss_access) != rpl
                || !matches!(access_type(ss_access), 0x12 | 0x13 | 0x16 | 0x17)
            {
                self.exception_with_code(Exception::Gp, ss_offset);
                return Err(Abort);
            }
            if ss_access & ACCESS_P == 0 {
                self.exception_with_code(Exception::Np, cs_offset);
                return Err(Abort);
            }
            let esp_mask: u32 = if ss_access & ACCESS_B != 0 { !0 } else { 0xFFFF };
            self.seg_load_protected(SS, ss as u16, &mut ss_info)?;
            self.load_csip_protected(cs as u16, &mut cs_info, eip)?;
            self.reg32[ESP] = (esp & esp_mask) | (self.reg32[ESP] & !esp_mask);
            self.iret_handle_seg(ES);
            self.iret_handle_seg(FS);
            self.iret_handle_seg(GS);
            self.iret_handle_seg(DS);
        } else {
            self.load_csip_protected(cs as u16, &mut cs_info, eip)?;
            stack.commit(self);
        }

        let mut flag_mask = EFLAGS_CF
            | EFLAGS_PF
            | EFLAGS_AF
            | EFLAGS_ZF
            | EFLAGS_SF
            | EFLAGS_TF
            | EFLAGS_DF
            | EFLAGS_OF
            | EFLAGS_NT
            | EFLAGS_RF
            | EFLAGS_AC
            | EFLAGS_ID;
        if old_cpl <= self.iopl() {
            flag_mask |= EFLAGS_IF;
        }
        if old_cpl == 0 {
            flag_mask |= EFLAGS_IOPL | EFLAGS_VIF | EFLAGS_VIP;
        }
        if !is32 {
            flag_mask &= 0xFFFF;
        }
        self.set_eflags((eflags & flag_mask) | (self.eflags & !flag_mask));
        Ok(())
    }

    pub(crate) fn retf(&mut self, adjust: u32, is32: bool) -> OpResult {
        if self.cr[0] & CR0_PE == 0 || self.eflags & EFLAGS_VM != 0 {
            let mut stack = StackOps::current(self);
            let (eip, cs) = if is32 {
                let e = stack.pop32(self)?;
                let c = stack.pop32(self)?;
                (e, c)
            } else {
                let e = stack.pop16(self)? as u32;
                let c = stack.pop16(self)? as u32;
                (e, c)
            };
            if eip > self.seg_limit[CS] && self.cr[0] & CR0_PE == 0 {
                self.exception_with_code(Exception::Gp, 0);
                return Err(Abort);
            }
            stack.adjust(adjust);
            stack.commit(self);
            if self.cr[0] & CR0_PE != 0 {
                self.load_csip_virtual(cs as u16, eip);
            } else {
                self.load_csip_real(cs as u16, eip);
            }
            return Ok(());
        }

        let mut stack = StackOps::current(self);
        let (eip, cs) = if is32 {
            let e = stack.pop32(self)?;
            let c = stack.pop32(self)? & 0xFFFF;
            (e, c)
        } else {
            let e = stack.pop16(self)? as u32;
            let c = stack.pop16(self)? as u32;
            (e, c)
        };
        let cs_offset = (cs & 0xFFFC) as i32;
        if cs_offset == 0 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        let mut cs_info = self.seg_load_descriptor(cs, Some(Exception::Gp), cs_offset)?;
        let access = cs_info.access();
        let rpl = selector_rpl(cs);
        let dpl = access_dpl(access);
        if rpl < self.cpl {
            self.exception_with_code(Exception::Gp, cs_offset);
            return Err(Abort);
        }
        match access_type(access) {
            0x18..=0x1B => {
                if dpl != rpl {
                    self.exception_with_code(Exception::Gp, cs_offset);
                    return Err(Abort);
                }
            }
            0x1C..=0x1F => {
                if dpl > rpl {
                    self.exception_with_code(Exception::Gp, cs_offset);
                    return Err(Abort);
                }
            }
            _ => {
                self.exception_with_code(Exception::Gp, cs_offset);
                return Err(Abort);
            }
        }
        if access & ACCESS_P == 0 {
            self.exception_with_code(Exception::Np, cs_offset);
            return Err(Abort);
        }

        if rpl > self.cpl {
            // Outer-ring return.
            stack.adjust(adjust);
            let (new_esp, new_ss) = if is32 {
                let e = stack.pop32(self)?;
                let s = stack.pop32(self)? & 0xFFFF;
                (e, s)
            } else {
                let e = stack.pop16(self)? as u32;
                let s = stack.pop16(self)? as u32;
                (e, s)
            };
            let new_ss_offset = (new_ss & 0xFFFC) as i32;
            if new_ss_offset == 0 {
                self.exception_with_code(Exception::Gp, new_ss_offset);
                return Err(Abort);
            }
            let mut ss_info =
                self.seg_load_descriptor(new_ss, Some(Exception::Gp), new_ss_offset)?;
            let ss_access = ss_info.access();
            if !matches!(access_type(ss_access), 0x12 | 0x13 | 0x16 | 0x17)
                || selector_rpl(new_ss) != rpl
                || access_dpl(ss_access) != rpl
            {
                self.exception_with_code(Exception::Gp, new_ss_offset);
                return Err(Abort);
            }
            if ss_access & ACCESS_P == 0 {
                self.exception_with_code(Exception::Np, new_ss_offset);
                return Err(Abort);
            }
            self.seg_load_protected(SS, new_ss as u16, &mut ss_info)?;
            self.load_csip_protected(cs as u16, &mut cs_info, eip)?;
            let esp_mask: u32 = if ss_access & ACCESS_B != 0 { !0 } else { 0xFFFF };
            self.reg32[ESP] =
                (new_esp.wrapping_add(adjust) & esp_mask) | (self.reg32[ESP] & !esp_mask);
        } else {
            self.load_csip_protected(cs as u16, &mut cs_info, eip)?;
            stack.adjust(adjust);
            stack.commit(self);
        }
        Ok(())
    }

    // --- SYSENTER/SYSEXIT -----------------------------------------------

    pub(crate) fn sysenter(&mut self) -> OpResult {
        let cs = self.sysenter[SYSENTER_CS];
        let cs_offset = cs & 0xFFFC;
        if self.cr[0] & CR0_PE == 0 || cs_offset == 0 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        self.eflags &= !(EFLAGS_IF | EFLAGS_VM);
        self.set_virt_eip(self.sysenter[SYSENTER_EIP]);
        self.reg32[ESP] = self.sysenter[SYSENTER_ESP];
        self.seg[CS] = cs_offset as u16;
        self.seg_base[CS] = 0;
        self.seg_limit[CS] = !0;
        self.seg_access[CS] = ACCESS_S | 0x0B | ACCESS_P | ACCESS_G;
        self.cpl = 0;
        self.update_cpl_shifts();
        self.state_hash = 0;

        self.seg[SS] = (cs_offset + 8) as u16 & 0xFFFC;
        self.seg_base[SS] = 0;
        self.seg_limit[SS] = !0;
        self.seg_access[SS] = ACCESS_S | 0x03 | ACCESS_P | ACCESS_G | ACCESS_B;
        self.esp_mask = !0;
        self.reload_cs_base();
        Ok(())
    }

    pub(crate) fn sysexit(&mut self) -> OpResult {
        let cs = self.sysenter[SYSENTER_CS];
        let cs_offset = cs & 0xFFFC;
        if self.cr[0] & CR0_PE == 0 || cs_offset == 0 || self.cpl != 0 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        self.set_virt_eip(self.reg32[EDX]);
        self.reg32[ESP] = self.reg32[ECX];
        self.seg[CS] = ((cs | 3) + 16) as u16;
        self.seg_base[CS] = 0;
        self.seg_limit[CS] = !0;
        self.seg_access[CS] = ACCESS_S | 0x0B | ACCESS_P | ACCESS_G | ACCESS_DPL_MASK;
        self.cpl = 3;
        self.update_cpl_shifts();
        self.state_hash = 0;

        self.seg[SS] = ((cs | 3) + 24) as u16;
        self.seg_base[SS] = 0;
        self.seg_limit[SS] = !0;
        self.seg_access[SS] = ACCESS_S | 0x03 | ACCESS_P | ACCESS_G | ACCESS_B | ACCESS_DPL_MASK;
        self.esp_mask = !0;
        self.reload_cs_base();
        Ok(())
    }
}

// --- near-transfer handlers ---------------------------------------------

/// EIP-limit guard used by near transfers in 16-bit segments.
fn check_eip_limit(cpu: &mut Cpu, eip: u32) -> OpResult {
    if eip >= cpu.seg_limit[CS] {
        cpu.exception_with_code(Exception::Gp, 0);
        return Err(Abort);
    }
    Ok(())
}

pub(crate) fn op_jmp_rel16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let virt = cpu.virt_eip();
    let target = virt
        .wrapping_add(i_length(i.flags))
        .wrapping_add(i.imm)
        & 0xFFFF;
    cpu.phys_eip = cpu.phys_eip.wrapping_add(target.wrapping_sub(virt));
    Ok(Branch)
}

pub(crate) fn op_jmp_rel32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    cpu.phys_eip = cpu
        .phys_eip
        .wrapping_add(i_length(i.flags))
        .wrapping_add(i.imm);
    Ok(Branch)
}

pub(crate) fn op_jmp_r16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dest = cpu.read_reg16(i_rm(i.flags)) as u32;
    check_eip_limit(cpu, dest)?;
    cpu.set_virt_eip(dest);
    Ok(Branch)
}

pub(crate) fn op_jmp_r32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dest = cpu.reg32[i_rm(i.flags)];
    check_eip_limit(cpu, dest)?;
    cpu.set_virt_eip(dest);
    Ok(Branch)
}

pub(crate) fn op_jmp_e16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dest = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)? as u32;
    check_eip_limit(cpu, dest)?;
    cpu.set_virt_eip(dest);
    Ok(Branch)
}

pub(crate) fn op_jmp_e32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dest = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
    check_eip_limit(cpu, dest)?;
    cpu.set_virt_eip(dest);
    Ok(Branch)
}

pub(crate) fn op_call_j16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let next = cpu.virt_eip().wrapping_add(i_length(i.flags));
    cpu.push16(next as u16)?;
    let target = next.wrapping_add(i.imm) & 0xFFFF;
    cpu.set_virt_eip(target);
    Ok(Branch)
}

pub(crate) fn op_call_j32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let next = cpu.virt_eip().wrapping_add(i_length(i.flags));
    cpu.push32(next)?;
    cpu.set_virt_eip(next.wrapping_add(i.imm));
    Ok(Branch)
}

pub(crate) fn op_call_r16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dest = cpu.read_reg16(i_rm(i.flags)) as u32;
    check_eip_limit(cpu, dest)?;
    let next = cpu.virt_eip().wrapping_add(i_length(i.flags));
    cpu.push16(next as u16)?;
    cpu.set_virt_eip(dest);
    Ok(Branch)
}

pub(crate) fn op_call_r32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dest = cpu.reg32[i_rm(i.flags)];
    check_eip_limit(cpu, dest)?;
    let next = cpu.virt_eip().wrapping_add(i_length(i.flags));
    cpu.push32(next)?;
    cpu.set_virt_eip(dest);
    Ok(Branch)
}

pub(crate) fn op_call_e16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dest = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)? as u32;
    check_eip_limit(cpu, dest)?;
    let next = cpu.virt_eip().wrapping_add(i_length(i.flags));
    cpu.push16(next as u16)?;
    cpu.set_virt_eip(dest);
    Ok(Branch)
}

pub(crate) fn op_call_e32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dest = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
    check_eip_limit(cpu, dest)?;
    let next = cpu.virt_eip().wrapping_add(i_length(i.flags));
    cpu.push32(next)?;
    cpu.set_virt_eip(dest);
    Ok(Branch)
}

pub(crate) fn op_ret16(cpu: &mut Cpu, adjust: u32) -> HandlerResult {
    let eip = cpu.pop16()? as u32;
    check_eip_limit(cpu, eip)?;
    if adjust != 0 {
        let esp = cpu.reg32[ESP];
        cpu.reg32[ESP] =
            (esp.wrapping_add(adjust) & cpu.esp_mask) | (esp & !cpu.esp_mask);
    }
    cpu.set_virt_eip(eip);
    Ok(Branch)
}

pub(crate) fn op_ret32(cpu: &mut Cpu, adjust: u32) -> HandlerResult {
    let eip = cpu.pop32()?;
    check_eip_limit(cpu, eip)?;
    if adjust != 0 {
        let esp = cpu.reg32[ESP];
        cpu.reg32[ESP] =
            (esp.wrapping_add(adjust) & cpu.esp_mask) | (esp & !cpu.esp_mask);
    }
    cpu.set_virt_eip(eip);
    Ok(Branch)
}

pub(crate) fn op_jcc16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    if cpu.cond(i_op3(i.flags)) {
        op_jmp_rel16(cpu, i)
    } else {
        Ok(Next)
    }
}

pub(crate) fn op_jcc32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    if cpu.cond(i_op3(i.flags)) {
        op_jmp_rel32(cpu, i)
    } else {
        Ok(Next)
    }
}

/// LOOP/LOOPZ/LOOPNZ and JECXZ share the count-register test.
fn loop_taken(cpu: &mut Cpu, i: &DecodedInsn, kind: u32) -> bool {
    let a16 = i.flags & I_ADDR16 != 0;
    match kind {
        // JECXZ tests without decrementing.
        3 => {
            if a16 {
                cpu.read_reg16(ECX) == 0
            } else {
                cpu.reg32[ECX] == 0
            }
        }
        _ => {
            let count = if a16 {
                let v = cpu.read_reg16(ECX).wrapping_sub(1);
                cpu.write_reg16(ECX, v);
                v as u32
            } else {
                cpu.reg32[ECX] = cpu.reg32[ECX].wrapping_sub(1);
                cpu.reg32[ECX]
            };
            match kind {
                0 => count != 0 && !cpu.get_zf(), // LOOPNZ
                1 => count != 0 && cpu.get_zf(),  // LOOPZ
                _ => count != 0,                  // LOOP
            }
        }
    }
}

pub(crate) fn op_loop16(cpu: &mut Cpu, i: &DecodedInsn, kind: u32) -> HandlerResult {
    if loop_taken(cpu, i, kind) {
        op_jmp_rel16(cpu, i)
    } else {
        Ok(Next)
    }
}

pub(crate) fn op_loop32(cpu: &mut Cpu, i: &DecodedInsn, kind: u32) -> HandlerResult {
    if loop_taken(cpu, i, kind) {
        op_jmp_rel32(cpu, i)
    } else {
        Ok(Next)
    }
}

pub(crate) fn op_int(cpu: &mut Cpu, i: &DecodedInsn, vector: u8) -> HandlerResult {
    let return_eip = cpu.virt_eip().wrapping_add(i_length(i.flags));
    cpu.interrupt(vector, None, IntKind::Software, return_eip)?;
    Ok(Branch)
}

pub(crate) fn op_into(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    if cpu.get_of() {
        let return_eip = cpu.virt_eip().wrapping_add(i_length(i.flags));
        cpu.interrupt(4, None, IntKind::Software, return_eip)?;
        return Ok(Branch);
    }
    Ok(Next)
}

pub(crate) fn op_hlt(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    if cpu.cpl != 0 && cpu.cr[0] & CR0_PE != 0 {
        cpu.exception_with_code(Exception::Gp, 0);
        return Err(Abort);
    }
    // Skip past the HLT so resumption continues after it.
    cpu.phys_eip = cpu.phys_eip.wrapping_add(i_length(i.flags));
    cpu.exit_reason = ExitReason::Hlt;
    cpu.hlt_counter = cpu.cycles_to_run;
    cpu.request_loop_exit();
    Ok(Branch)
}
