//! Segmentation: descriptor fetch/parse and segment-register loads for
//! real mode, virtual-8086 mode, and protected mode.

use crate::state::*;
use crate::Cpu;

/// A raw 8-byte descriptor as read from a descriptor table.
#[derive(Clone, Copy, Default, Debug)]
pub struct SegDesc {
    pub raw: [u32; 2],
}

impl SegDesc {
    /// The access word: bits 8..24 of the high dword (type/DPL/P plus the
    /// G/B/AVL flags at 12..16).
    #[inline]
    pub fn access(&self) -> u32 {
        self.raw[1] >> 8 & 0xFFFF
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access() & ACCESS_P != 0
    }

    pub fn base(&self) -> u32 {
        let mut base = self.raw[0] >> 16;
        base |= (self.raw[1] << 16) & 0xFF0000;
        base |= self.raw[1] & 0xFF00_0000;
        base
    }

    pub fn limit(&self) -> u32 {
        let mut limit = self.raw[0] & 0xFFFF;
        limit |= self.raw[1] & 0xF0000;
        if self.access() & ACCESS_G != 0 {
            limit = (limit << 12) | 0xFFF;
        }
        limit
    }

    /// Gate fields.
    #[inline]
    pub fn gate_selector(&self) -> u32 {
        self.raw[0] >> 16 & 0xFFFF
    }

    pub fn gate_offset(&self) -> u32 {
        let offset = self.raw[0] & 0xFFFF;
        match access_type(self.access()) {
            DESC_CALL_GATE_386 | DESC_INTERRUPT_GATE_386 | DESC_TRAP_GATE_386 => {
                offset | (self.raw[1] & !0xFFFF)
            }
            _ => offset,
        }
    }

    #[inline]
    pub fn gate_param_count(&self) -> u32 {
        self.raw[1] & 0x1F
    }
}

impl Cpu {
    /// Load a descriptor from a specific table register, raising
    /// `exception(code)` when the selector overruns the table limit.
    pub(crate) fn seg_load_descriptor2(
        &mut self,
        table: usize,
        selector: u32,
        exception: Option<Exception>,
        code: i32,
    ) -> OpResult<SegDesc> {
        if (selector | 7) > self.seg_limit[table] {
            match exception {
                // VERR-style probes want a quiet failure.
                None => return Err(Abort),
                Some(e) => {
                    self.exception_with_code(e, code);
                    return Err(Abort);
                }
            }
        }
        let addr = (selector & !7).wrapping_add(self.seg_base[table]);
        let lo = self.read32(addr, TLB_SYSTEM_READ)?;
        let hi = self.read32(addr.wrapping_add(4), TLB_SYSTEM_READ)?;
        Ok(SegDesc { raw: [lo, hi] })
    }

    /// Load a descriptor from the GDT or LDT as the selector's TI bit says.
    pub(crate) fn seg_load_descriptor(
        &mut self,
        selector: u32,
        exception: Option<Exception>,
        code: i32,
    ) -> OpResult<SegDesc> {
        let table = if selector_is_ldt(selector) {
            SEG_LDTR
        } else {
            SEG_GDTR
        };
        self.seg_load_descriptor2(table, selector, exception, code)
    }

    /// Linear address of the descriptor slot for `sel`, or `None` past the
    /// table limit.
    pub(crate) fn seg_descriptor_address(&self, sel: u32) -> Option<u32> {
        let tbl = if selector_is_ldt(sel) {
            SEG_LDTR
        } else {
            SEG_GDTR
        };
        if (sel | 7) > self.seg_limit[tbl] {
            return None;
        }
        Some((sel & !7).wrapping_add(self.seg_base[tbl]))
    }

    #[inline]
    pub fn seg_dpl(&self, seg: usize) -> u32 {
        access_dpl(self.seg_access[seg])
    }

    /// Real-mode segment load: base = sel << 4, 64 KiB limit.
    pub(crate) fn seg_load_real(&mut self, id: usize, sel: u16) {
        self.seg[id] = sel;
        self.seg_base[id] = (sel as u32) << 4;
        self.seg_limit[id] = 0xFFFF;
        self.seg_access[id] &= !(ACCESS_DPL_MASK | ACCESS_B);
        match id {
            CS => self.state_hash = STATE_ADDR16 | STATE_CODE16,
            SS => self.esp_mask = 0xFFFF,
            _ => {}
        }
    }

    /// V8086 loads look identical to real-mode ones.
    pub(crate) fn seg_load_virtual(&mut self, id: usize, sel: u16) {
        self.seg_load_real(id, sel);
    }

    /// Protected-mode segment load from a parsed descriptor. Also writes
    /// the accessed bit back to the table (which itself can fault).
    pub(crate) fn seg_load_protected(
        &mut self,
        id: usize,
        sel: u16,
        desc: &mut SegDesc,
    ) -> OpResult {
        self.seg[id] = sel;
        self.seg_base[id] = desc.base();
        self.seg_limit[id] = desc.limit();
        self.seg_access[id] = desc.access();
        self.seg_valid[id] = SEG_VALID_READABLE | SEG_VALID_WRITABLE;

        let linaddr = self
            .seg_descriptor_address(sel as u32)
            .expect("selector validated before load");
        desc.raw[1] |= 0x100; // accessed
        self.write8(
            linaddr.wrapping_add(5),
            (desc.raw[1] >> 8) as u8,
            TLB_SYSTEM_WRITE,
        )?;

        match id {
            CS => {
                self.state_hash = if self.seg_access[CS] & ACCESS_B != 0 {
                    0
                } else {
                    STATE_ADDR16 | STATE_CODE16
                };
                self.cpl = (sel & 3) as u32;
                self.update_cpl_shifts();
            }
            SS => {
                self.esp_mask = if self.seg_access[SS] & ACCESS_B != 0 {
                    !0
                } else {
                    0xFFFF
                };
            }
            _ => {}
        }
        Ok(())
    }

    // --- CS:EIP loads ---------------------------------------------------

    pub(crate) fn load_csip_real(&mut self, cs: u16, eip: u32) {
        self.set_virt_eip(eip);
        self.seg_load_real(CS, cs);
        self.reload_cs_base();
    }

    pub(crate) fn load_csip_virtual(&mut self, cs: u16, eip: u32) {
        self.set_virt_eip(eip);
        self.seg_load_virtual(CS, cs);
        self.reload_cs_base();
    }

    pub(crate) fn load_csip_protected(
        &mut self,
        cs: u16,
        desc: &mut SegDesc,
        eip: u32,
    ) -> OpResult {
        self.set_virt_eip(eip);
        self.seg_load_protected(CS, cs, desc)?;
        self.reload_cs_base();
        Ok(())
    }

    /// MOV Sreg / POP Sreg / LxS semantics, all modes.
    pub(crate) fn load_seg_value_mov(&mut self, seg: usize, val: u16) -> OpResult {
        if self.cr[0] & CR0_PE == 0 {
            self.seg_load_real(seg, val);
            return Ok(());
        }
        if self.eflags & EFLAGS_VM != 0 {
            self.seg_load_virtual(seg, val);
            return Ok(());
        }

        let val_offset = (val & 0xFFFC) as u32;
        match seg {
            CS => {
                // MOV CS is #UD at decode; far transfers use their own path.
                let mut desc = self.seg_load_descriptor(val as u32, Some(Exception::Gp), val_offset as i32)?;
                self.seg_load_protected(seg, val, &mut desc)
            }
            SS => {
                if val_offset == 0 {
                    self.exception_with_code(Exception::Gp, 0);
                    return Err(Abort);
                }
                let mut desc =
                    self.seg_load_descriptor(val as u32, Some(Exception::Gp), val_offset as i32)?;
                let access = desc.access();
                let rpl = selector_rpl(val as u32);
                let dpl = access_dpl(access);
                if self.cpl != rpl || self.cpl != dpl {
                    self.exception_with_code(Exception::Gp, val_offset as i32);
                    return Err(Abort);
                }
                // Writable data segment only.
                match access_type(access) {
                    0x12 | 0x13 | 0x16 | 0x17 => {}
                    _ => {
                        self.exception_with_code(Exception::Gp, val_offset as i32);
                        return Err(Abort);
                    }
                }
                if access & ACCESS_P == 0 {
                    self.exception_with_code(Exception::Ss, val_offset as i32);
                    return Err(Abort);
                }
                self.seg_load_protected(seg, val, &mut desc)
            }
            _ => {
                if val_offset == 0 {
                    // Null selector: legal, but unusable until reloaded.
                    self.seg[seg] = val;
                    self.seg_base[seg] = 0;
                    self.seg_limit[seg] = 0;
                    self.seg_access[seg] = 0;
                    self.seg_valid[seg] = 0;
                    return Ok(());
                }
                let mut desc =
                    self.seg_load_descriptor(val as u32, Some(Exception::Gp), val_offset as i32)?;
                let access = desc.access();
                match access_type(access) {
                    // Readable non-conforming code.
                    0x1A | 0x1B | 0x1E | 0x1F => {}
                    // Data, or conforming code with the readable bit clear.
                    0x10..=0x19 => {
                        let dpl = access_dpl(access);
                        let rpl = selector_rpl(val as u32);
                        if dpl < self.cpl || dpl < rpl {
                            self.exception_with_code(Exception::Gp, val_offset as i32);
                            return Err(Abort);
                        }
                    }
                    _ => {
                        self.exception_with_code(Exception::Gp, val_offset as i32);
                        return Err(Abort);
                    }
                }
                if access & ACCESS_P == 0 {
                    self.exception_with_code(Exception::Np, val_offset as i32);
                    return Err(Abort);
                }
                self.seg_load_protected(seg, val, &mut desc)
            }
        }
    }
}
